// SPDX-License-Identifier: MIT OR Apache-2.0
//! Primary-tool actions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One of the four primary actions every tool dispatch reduces to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryAction {
    /// Run a tool or directive.
    Execute,
    /// Query the artifact space.
    Search,
    /// Read an artifact.
    Load,
    /// Sign an artifact.
    Sign,
}

impl PrimaryAction {
    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Search => "search",
            Self::Load => "load",
            Self::Sign => "sign",
        }
    }

    /// The API-safe wrapper tool name the model calls (e.g. `spindle_execute`).
    #[must_use]
    pub fn wrapper_name(&self) -> &'static str {
        match self {
            Self::Execute => "spindle_execute",
            Self::Search => "spindle_search",
            Self::Load => "spindle_load",
            Self::Sign => "spindle_sign",
        }
    }

    /// Recover the primary from a wrapper tool name, if it is one.
    #[must_use]
    pub fn from_wrapper_name(name: &str) -> Option<Self> {
        match name {
            "spindle_execute" => Some(Self::Execute),
            "spindle_search" => Some(Self::Search),
            "spindle_load" => Some(Self::Load),
            "spindle_sign" => Some(Self::Sign),
            _ => None,
        }
    }
}

impl fmt::Display for PrimaryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrimaryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execute" => Ok(Self::Execute),
            "search" => Ok(Self::Search),
            "load" => Ok(Self::Load),
            "sign" => Ok(Self::Sign),
            other => Err(format!("unknown primary action: {other}")),
        }
    }
}

/// A concrete action routed through the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolAction {
    /// Which primary tool handles this.
    pub primary: PrimaryAction,
    /// Item type (`tool`, `directive`, `knowledge`, …).
    #[serde(default = "default_item_type")]
    pub item_type: String,
    /// Item id (path-like, `/`-separated). Empty for query-style actions.
    #[serde(default)]
    pub item_id: String,
    /// Free-form parameters forwarded to the tool.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

fn default_item_type() -> String {
    "tool".to_string()
}

impl ToolAction {
    /// Build an `execute` action for a tool id.
    #[must_use]
    pub fn execute_tool(item_id: impl Into<String>) -> Self {
        Self {
            primary: PrimaryAction::Execute,
            item_type: "tool".into(),
            item_id: item_id.into(),
            params: BTreeMap::new(),
        }
    }

    /// Set a parameter, consuming and returning self.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_names_roundtrip() {
        for p in [
            PrimaryAction::Execute,
            PrimaryAction::Search,
            PrimaryAction::Load,
            PrimaryAction::Sign,
        ] {
            assert_eq!(PrimaryAction::from_wrapper_name(p.wrapper_name()), Some(p));
        }
        assert_eq!(PrimaryAction::from_wrapper_name("fs_write"), None);
    }

    #[test]
    fn action_defaults() {
        let action: ToolAction =
            serde_json::from_str(r#"{"primary": "load", "item_id": "notes/readme"}"#).unwrap();
        assert_eq!(action.primary, PrimaryAction::Load);
        assert_eq!(action.item_type, "tool");
        assert!(action.params.is_empty());
    }

    #[test]
    fn primary_from_str() {
        assert_eq!("execute".parse::<PrimaryAction>().unwrap(), PrimaryAction::Execute);
        assert!("destroy".parse::<PrimaryAction>().is_err());
    }
}
