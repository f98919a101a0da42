// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hook definitions.
//!
//! A hook is a `{id, event, layer, position, condition, action}` rule
//! evaluated at named checkpoints in the runner. The condition language is
//! small and declarative: a dotted `path` lookup, a closed set of comparison
//! operators, and `all`/`any`/`not` combinators. Layers 0–2 carry control
//! flow (first non-empty result wins); layer 3 is infra/telemetry (always
//! runs, result ignored).

use crate::action::ToolAction;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a context-producing hook's output lands relative to the prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPosition {
    /// Before the user prompt (default).
    #[default]
    Before,
    /// After the user prompt.
    After,
}

/// Comparison operator usable in hook conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// String or array containment.
    Contains,
    /// Regular-expression match on the string form.
    Regex,
    /// Numeric greater-than.
    Gt,
    /// Numeric less-than.
    Lt,
    /// Numeric greater-or-equal.
    Gte,
    /// Numeric less-or-equal.
    Lte,
}

/// Declarative hook condition.
///
/// Deliberately not an expression language: a minimal evaluator keeps hook
/// tables analyzable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// All sub-conditions must hold.
    All(Vec<Condition>),
    /// At least one sub-condition must hold.
    Any(Vec<Condition>),
    /// The sub-condition must not hold.
    Not(Box<Condition>),
    /// Compare the value at `path` against `value` with `op`.
    #[serde(untagged)]
    Cmp {
        /// Dotted lookup into the ambient context.
        path: String,
        /// Comparison operator.
        op: CmpOp,
        /// Right-hand side.
        value: serde_json::Value,
    },
}

/// The action side of a hook: a primary-tool action whose string parameters
/// may carry `{dotted.path}` placeholders interpolated from the ambient
/// context at fire time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookActionDef {
    /// Primary action (`execute`, `load`, …).
    pub primary: crate::action::PrimaryAction,
    /// Item type of the target.
    #[serde(default = "default_item_type")]
    pub item_type: String,
    /// Item id of the target.
    pub item_id: String,
    /// Parameters, templated before dispatch.
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

fn default_item_type() -> String {
    "tool".to_string()
}

impl HookActionDef {
    /// Convert to a dispatchable [`ToolAction`] (no interpolation).
    #[must_use]
    pub fn to_action(&self) -> ToolAction {
        ToolAction {
            primary: self.primary,
            item_type: self.item_type.clone(),
            item_id: self.item_id.clone(),
            params: self.params.clone(),
        }
    }
}

/// A single hook rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    /// Stable identifier; the suppression list matches on this.
    pub id: String,
    /// Event this hook fires on (`thread_started`, `error`, `limit`, …).
    pub event: String,
    /// Layer 0–2 = control, 3 = infra/telemetry.
    #[serde(default)]
    pub layer: u8,
    /// Placement for context-producing events.
    #[serde(default)]
    pub position: HookPosition,
    /// Optional condition; absent means always fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// What to dispatch when the hook fires.
    pub action: HookActionDef,
}

impl Hook {
    /// Whether this hook sits in a control layer (0–2).
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.layer <= 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hook_yaml_shape() {
        let yaml = r#"
id: ctx_identity
event: thread_started
layer: 2
position: before
condition:
  all:
    - path: directive
      op: ne
      value: ""
action:
  primary: load
  item_type: knowledge
  item_id: spindle/agent/identity
"#;
        let hook: Hook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(hook.id, "ctx_identity");
        assert_eq!(hook.position, HookPosition::Before);
        assert!(hook.is_control());
        match hook.condition.unwrap() {
            Condition::All(subs) => assert_eq!(subs.len(), 1),
            other => panic!("expected all combinator, got {other:?}"),
        }
    }

    #[test]
    fn default_layer_is_control() {
        let hook: Hook = serde_json::from_value(json!({
            "id": "h", "event": "error",
            "action": {"primary": "execute", "item_id": "spindle/agent/hooks/retry"},
        }))
        .unwrap();
        assert_eq!(hook.layer, 0);
        assert!(hook.is_control());
    }

    #[test]
    fn infra_layer_is_not_control() {
        let hook: Hook = serde_json::from_value(json!({
            "id": "telemetry", "event": "after_step", "layer": 3,
            "action": {"primary": "execute", "item_id": "spindle/agent/hooks/metrics"},
        }))
        .unwrap();
        assert!(!hook.is_control());
    }

    #[test]
    fn condition_combinators_roundtrip() {
        let cond = Condition::Any(vec![
            Condition::Not(Box::new(Condition::Cmp {
                path: "cost.turns".into(),
                op: CmpOp::Lt,
                value: json!(5),
            })),
            Condition::Cmp {
                path: "event.code".into(),
                op: CmpOp::Eq,
                value: json!("spend_exceeded"),
            },
        ]);
        let text = serde_json::to_string(&cond).unwrap();
        let back: Condition = serde_json::from_str(&text).unwrap();
        assert_eq!(back, cond);
    }
}
