// SPDX-License-Identifier: MIT OR Apache-2.0
//! The hook engine.
//!
//! Hooks are evaluated at named checkpoints in the runner. For a given
//! event the engine filters to matching, unsuppressed hooks, evaluates
//! their conditions against the ambient context, interpolates `{path}`
//! placeholders into the action, and dispatches it. Control layers (0–2)
//! stop at the first non-empty result; the infra layer (3) always runs
//! with its results ignored. Context events concatenate hook outputs into
//! before/after blocks instead.

use crate::condition::{evaluate_condition, interpolate};
use serde_json::Value;
use spindle_core::{Hook, HookPosition, ToolAction};
use spindle_dispatch::{ThreadContext, ToolDispatcher};
use std::collections::HashSet;

/// Concatenated context produced by content hooks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookContext {
    /// Joined `position: before` content.
    pub before: String,
    /// Joined `position: after` content.
    pub after: String,
    /// Raw `{id, content}` blocks for `before`, in hook order.
    pub before_raw: Vec<Value>,
    /// Raw `{id, content}` blocks for `after`, in hook order.
    pub after_raw: Vec<Value>,
}

impl HookContext {
    /// Whether no hook produced content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

/// Ordered hook table with suppression.
#[derive(Debug, Clone, Default)]
pub struct HookEngine {
    hooks: Vec<Hook>,
    suppress: HashSet<String>,
}

impl HookEngine {
    /// Build an engine from merged hook tables and the directive's
    /// suppression list. Hooks are ordered by layer, stable within a layer.
    #[must_use]
    pub fn new(mut hooks: Vec<Hook>, suppress: Vec<String>) -> Self {
        hooks.sort_by_key(|h| h.layer);
        Self {
            hooks,
            suppress: suppress.into_iter().collect(),
        }
    }

    /// Number of configured hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Suppression matches the hook id or its action item id, exactly.
    /// Basename-only matching is deliberately disabled.
    fn suppressed(&self, hook: &Hook) -> bool {
        self.suppress.contains(&hook.id) || self.suppress.contains(&hook.action.item_id)
    }

    fn matching<'a>(&'a self, event: &'a str, ctx: &'a Value) -> impl Iterator<Item = &'a Hook> {
        self.hooks.iter().filter(move |hook| {
            hook.event == event
                && !self.suppressed(hook)
                && hook
                    .condition
                    .as_ref()
                    .is_none_or(|c| evaluate_condition(c, ctx))
        })
    }

    fn build_action(hook: &Hook, ctx: &Value) -> ToolAction {
        let mut action = hook.action.to_action();
        let params = Value::Object(action.params.clone().into_iter().collect());
        if let Value::Object(interpolated) = interpolate(&params, ctx) {
            action.params = interpolated.into_iter().collect();
        }
        action
    }

    /// Run control + infra hooks for an event.
    ///
    /// Returns the first non-empty control result, or `None` when no
    /// control hook produced one. Infra hooks always run afterwards.
    pub async fn run_hooks(
        &self,
        event: &str,
        ctx: &Value,
        dispatcher: &ToolDispatcher,
        thread_ctx: Option<&ThreadContext>,
    ) -> Option<Value> {
        let mut winner: Option<Value> = None;

        for hook in self.matching(event, ctx) {
            if hook.is_control() {
                if winner.is_some() {
                    continue;
                }
                let action = Self::build_action(hook, ctx);
                let result = dispatcher.dispatch(&action, thread_ctx).await;
                if is_meaningful(&result) {
                    tracing::debug!(
                        target: "spindle.harness",
                        hook = %hook.id,
                        event,
                        "control hook produced a result"
                    );
                    winner = Some(result);
                }
            } else {
                let action = Self::build_action(hook, ctx);
                let _ = dispatcher.dispatch(&action, thread_ctx).await;
            }
        }

        winner
    }

    /// Run content hooks for a context event (`build_system_prompt`,
    /// `thread_started`, `thread_continued`), concatenating each hook's
    /// content by position.
    pub async fn run_context_hooks(
        &self,
        event: &str,
        ctx: &Value,
        dispatcher: &ToolDispatcher,
        thread_ctx: Option<&ThreadContext>,
    ) -> HookContext {
        let mut out = HookContext::default();

        for hook in self.matching(event, ctx) {
            let action = Self::build_action(hook, ctx);
            let result = dispatcher.dispatch(&action, thread_ctx).await;
            let Some(content) = extract_content(&result) else {
                continue;
            };
            if content.trim().is_empty() {
                continue;
            }
            let block = serde_json::json!({
                "id": hook.action.item_id,
                "content": content,
            });
            match hook.position {
                HookPosition::Before => {
                    if !out.before.is_empty() {
                        out.before.push_str("\n\n");
                    }
                    out.before.push_str(content.trim());
                    out.before_raw.push(block);
                }
                HookPosition::After => {
                    if !out.after.is_empty() {
                        out.after.push_str("\n\n");
                    }
                    out.after.push_str(content.trim());
                    out.after_raw.push(block);
                }
            }
        }

        out
    }
}

/// A hook result redirects control only when it carries something: error
/// results and empty shapes don't win.
fn is_meaningful(result: &Value) -> bool {
    match result {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Object(map) => {
            if map.is_empty() {
                return false;
            }
            map.get("status").and_then(|v| v.as_str()) != Some("error")
        }
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

fn extract_content(result: &Value) -> Option<&str> {
    if result.get("status").and_then(|v| v.as_str()) == Some("error") {
        return None;
    }
    result
        .get("content")
        .and_then(|v| v.as_str())
        .or_else(|| result.get("output").and_then(|v| v.as_str()))
        .or_else(|| result.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use spindle_core::{CmpOp, Condition, HookActionDef, PrimaryAction};
    use spindle_dispatch::PrimaryTool;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::Mutex;

    /// Records every dispatched item id; returns canned results per id.
    struct ScriptedTool {
        calls: Arc<Mutex<Vec<String>>>,
        results: std::collections::HashMap<String, Value>,
    }

    #[async_trait]
    impl PrimaryTool for ScriptedTool {
        async fn handle(&self, action: &ToolAction, _: &Path) -> anyhow::Result<Value> {
            self.calls.lock().unwrap().push(action.item_id.clone());
            Ok(self
                .results
                .get(&action.item_id)
                .cloned()
                .unwrap_or(Value::Null))
        }
    }

    fn hook(id: &str, event: &str, layer: u8, item_id: &str) -> Hook {
        Hook {
            id: id.into(),
            event: event.into(),
            layer,
            position: HookPosition::Before,
            condition: None,
            action: HookActionDef {
                primary: PrimaryAction::Execute,
                item_type: "tool".into(),
                item_id: item_id.into(),
                params: Default::default(),
            },
        }
    }

    fn engine_setup(
        hooks: Vec<Hook>,
        suppress: Vec<String>,
        results: Vec<(&str, Value)>,
    ) -> (HookEngine, ToolDispatcher, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let tool = ScriptedTool {
            calls: Arc::clone(&calls),
            results: results
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };
        let mut dispatcher = ToolDispatcher::new("/tmp/p");
        dispatcher.register(PrimaryAction::Execute, Arc::new(tool));
        dispatcher.register(PrimaryAction::Load, Arc::new(ScriptedTool {
            calls: Arc::clone(&calls),
            results: Default::default(),
        }));
        (HookEngine::new(hooks, suppress), dispatcher, calls)
    }

    #[tokio::test]
    async fn first_meaningful_control_result_wins() {
        let (engine, dispatcher, calls) = engine_setup(
            vec![
                hook("empty", "error", 0, "hooks/empty"),
                hook("winner", "error", 1, "hooks/winner"),
                hook("late", "error", 2, "hooks/late"),
            ],
            vec![],
            vec![
                ("hooks/empty", Value::Null),
                ("hooks/winner", json!({"action": "retry"})),
                ("hooks/late", json!({"action": "abort"})),
            ],
        );
        let result = engine
            .run_hooks("error", &json!({}), &dispatcher, None)
            .await
            .unwrap();
        assert_eq!(result["action"], "retry");
        // The later control hook is not dispatched once a winner exists.
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["hooks/empty".to_string(), "hooks/winner".to_string()],
        );
    }

    #[tokio::test]
    async fn infra_hooks_always_run_and_never_win() {
        let (engine, dispatcher, calls) = engine_setup(
            vec![
                hook("telemetry", "after_step", 3, "hooks/telemetry"),
                hook("winner", "after_step", 0, "hooks/winner"),
            ],
            vec![],
            vec![
                ("hooks/telemetry", json!({"recorded": true})),
                ("hooks/winner", json!({"action": "continue"})),
            ],
        );
        let result = engine
            .run_hooks("after_step", &json!({}), &dispatcher, None)
            .await
            .unwrap();
        assert_eq!(result["action"], "continue");
        assert!(calls
            .lock()
            .unwrap()
            .contains(&"hooks/telemetry".to_string()));
    }

    #[tokio::test]
    async fn suppression_matches_id_or_action_item_id_exactly() {
        let (engine, dispatcher, calls) = engine_setup(
            vec![
                hook("by-id", "error", 0, "hooks/a"),
                hook("by-action", "error", 0, "hooks/target"),
                hook("basename-trap", "error", 0, "nested/hooks/a"),
            ],
            vec!["by-id".to_string(), "hooks/target".to_string(), "a".to_string()],
            vec![("nested/hooks/a", json!({"ok": true}))],
        );
        let result = engine
            .run_hooks("error", &json!({}), &dispatcher, None)
            .await;
        // Only the basename-trap hook survives: "a" does not match
        // "nested/hooks/a" because basename matching is disabled.
        assert!(result.is_some());
        assert_eq!(*calls.lock().unwrap(), vec!["nested/hooks/a".to_string()]);
    }

    #[tokio::test]
    async fn conditions_filter_hooks() {
        let mut conditional = hook("cond", "limit", 0, "hooks/limit");
        conditional.condition = Some(Condition::Cmp {
            path: "event.code".into(),
            op: CmpOp::Eq,
            value: json!("spend_exceeded"),
        });
        let (engine, dispatcher, calls) = engine_setup(
            vec![conditional],
            vec![],
            vec![("hooks/limit", json!({"action": "abort"}))],
        );

        let miss = engine
            .run_hooks("limit", &json!({"event": {"code": "turns_exceeded"}}), &dispatcher, None)
            .await;
        assert!(miss.is_none());
        assert!(calls.lock().unwrap().is_empty());

        let hit = engine
            .run_hooks("limit", &json!({"event": {"code": "spend_exceeded"}}), &dispatcher, None)
            .await;
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn context_hooks_concatenate_by_position() {
        let mut before_a = hook("a", "thread_started", 2, "knowledge/identity");
        before_a.position = HookPosition::Before;
        let mut before_b = hook("b", "thread_started", 2, "knowledge/rules");
        before_b.position = HookPosition::Before;
        let mut after_c = hook("c", "thread_started", 2, "knowledge/footer");
        after_c.position = HookPosition::After;

        let (engine, dispatcher, _calls) = engine_setup(
            vec![before_a, before_b, after_c],
            vec![],
            vec![
                ("knowledge/identity", json!({"content": "You are spindle."})),
                ("knowledge/rules", json!({"content": "Follow the rules."})),
                ("knowledge/footer", json!({"output": "Be done."})),
            ],
        );
        let ctx = engine
            .run_context_hooks("thread_started", &json!({}), &dispatcher, None)
            .await;
        assert_eq!(ctx.before, "You are spindle.\n\nFollow the rules.");
        assert_eq!(ctx.after, "Be done.");
        assert_eq!(ctx.before_raw.len(), 2);
        assert_eq!(ctx.after_raw.len(), 1);
    }

    #[tokio::test]
    async fn error_results_do_not_win_or_contribute() {
        let (engine, dispatcher, _calls) = engine_setup(
            vec![hook("err", "error", 0, "hooks/broken")],
            vec![],
            vec![("hooks/broken", json!({"status": "error", "error": "boom"}))],
        );
        assert!(engine
            .run_hooks("error", &json!({}), &dispatcher, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn action_params_are_interpolated() {
        let mut h = hook("interp", "error", 0, "hooks/echo");
        h.action
            .params
            .insert("message".to_string(), json!("failed at turn {cost.turns}"));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::new(Mutex::new(Value::Null));
        struct Capture {
            calls: Arc<Mutex<Vec<String>>>,
            captured: Arc<Mutex<Value>>,
        }
        #[async_trait]
        impl PrimaryTool for Capture {
            async fn handle(&self, action: &ToolAction, _: &Path) -> anyhow::Result<Value> {
                self.calls.lock().unwrap().push(action.item_id.clone());
                *self.captured.lock().unwrap() =
                    Value::Object(action.params.clone().into_iter().collect());
                Ok(json!({"ok": true}))
            }
        }
        let mut dispatcher = ToolDispatcher::new("/tmp/p");
        dispatcher.register(
            PrimaryAction::Execute,
            Arc::new(Capture {
                calls,
                captured: Arc::clone(&captured),
            }),
        );
        let engine = HookEngine::new(vec![h], vec![]);
        engine
            .run_hooks("error", &json!({"cost": {"turns": 3}}), &dispatcher, None)
            .await;
        assert_eq!(captured.lock().unwrap()["message"], "failed at turn 3");
    }
}
