// SPDX-License-Identifier: MIT OR Apache-2.0
//! Generic tool schemas.

use serde::{Deserialize, Serialize};

/// A tool definition in generic form.
///
/// The provider adapter remaps `{name, description, schema}` into each wire
/// format via its `tool_definition` template. `item_id` carries the full
/// artifact id for dispatcher resolution; tool names themselves must be
/// API-safe (alphanumeric, `_`, `-`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// API-safe name the model calls.
    pub name: String,
    /// Human description shown to the model.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool input.
    pub schema: serde_json::Value,
    /// Artifact id the dispatcher resolves this tool to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

impl ToolSchema {
    /// Item id for dispatch, falling back to the API name.
    #[must_use]
    pub fn dispatch_id(&self) -> &str {
        self.item_id.as_deref().unwrap_or(&self.name)
    }
}
