// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool dispatcher for the spindle kernel.
//!
//! Routes `{primary, item_type, item_id, params}` actions to registered
//! [`PrimaryTool`] implementations. The four primary tools themselves are
//! external collaborators — the kernel defines the seam, injects parent
//! context into thread spawns, and unwraps the standard result envelope.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde_json::{Value, json};
use spindle_core::{PrimaryAction, ToolAction};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Item id of the thread-spawn tool; dispatches targeting it receive
/// injected parent context.
pub const THREAD_DIRECTIVE_TOOL: &str = "spindle/agent/threads/thread_directive";

/// Item-id prefix of internal sub-tools that bypass permission checks.
pub const INTERNAL_TOOL_PREFIX: &str = "spindle/agent/threads/internal/";

/// Item id of the completion sentinel the runner intercepts.
pub const DIRECTIVE_RETURN_TOOL: &str = "spindle/agent/threads/directive_return";

/// Ambient context of the dispatching thread, injected into child spawns.
#[derive(Debug, Clone, Default)]
pub struct ThreadContext {
    /// Dispatching thread id.
    pub thread_id: String,
    /// Dispatching thread's depth (0 = root).
    pub depth: u32,
    /// Dispatching thread's resolved limits.
    pub limits: BTreeMap<String, f64>,
    /// Dispatching thread's effective capabilities.
    pub capabilities: Vec<String>,
}

/// A primary tool implementation (execute / search / load / sign).
#[async_trait]
pub trait PrimaryTool: Send + Sync {
    /// Handle an action rooted at the project path.
    ///
    /// # Errors
    ///
    /// Tool failures; the dispatcher folds them into an error-status value.
    async fn handle(&self, action: &ToolAction, project_path: &Path) -> anyhow::Result<Value>;
}

/// Routes primary actions to registered tools.
pub struct ToolDispatcher {
    project_path: PathBuf,
    tools: HashMap<PrimaryAction, Arc<dyn PrimaryTool>>,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("project_path", &self.project_path)
            .field("primaries", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolDispatcher {
    /// Build a dispatcher with no tools registered.
    #[must_use]
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            tools: HashMap::new(),
        }
    }

    /// Register the handler for a primary action, replacing any previous.
    pub fn register(&mut self, primary: PrimaryAction, tool: Arc<dyn PrimaryTool>) {
        self.tools.insert(primary, tool);
    }

    /// Project path dispatches are rooted at.
    #[must_use]
    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Dispatch an action, returning the unwrapped result value.
    ///
    /// Never fails at the call boundary: tool errors, unknown primaries,
    /// and error envelopes all surface as `{"status": "error", "error": …}`
    /// values so the conversation can carry them back to the model.
    pub async fn dispatch(&self, action: &ToolAction, thread_context: Option<&ThreadContext>) -> Value {
        let mut action = action.clone();

        // Models sometimes pass `parameters` as a JSON string instead of an
        // object. Parse so downstream tools receive a dict.
        if let Some(Value::String(raw)) = action.params.get("parameters") {
            if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                action.params.insert("parameters".to_string(), parsed);
            }
        }

        // Child thread spawns inherit parent id, depth, limits, and caps.
        if action.primary == PrimaryAction::Execute
            && action.item_id == THREAD_DIRECTIVE_TOOL
        {
            if let Some(ctx) = thread_context {
                inject_parent_context(&mut action.params, ctx);
            }
        }

        let Some(tool) = self.tools.get(&action.primary) else {
            return json!({
                "status": "error",
                "error": format!("unknown primary action: {}", action.primary),
            });
        };

        match tool.handle(&action, &self.project_path).await {
            Ok(result) => clean_result(result),
            Err(e) => {
                tracing::debug!(
                    target: "spindle.dispatch",
                    primary = %action.primary,
                    item_id = %action.item_id,
                    error = %e,
                    "dispatch failed"
                );
                json!({"status": "error", "error": e.to_string()})
            }
        }
    }

    /// Dispatch multiple actions concurrently, preserving input order.
    pub async fn dispatch_parallel(
        &self,
        actions: &[ToolAction],
        thread_context: Option<&ThreadContext>,
    ) -> Vec<Value> {
        let futures = actions
            .iter()
            .map(|action| self.dispatch(action, thread_context));
        futures::future::join_all(futures).await
    }
}

fn inject_parent_context(params: &mut BTreeMap<String, Value>, ctx: &ThreadContext) {
    params
        .entry("parent_thread_id".to_string())
        .or_insert_with(|| Value::String(ctx.thread_id.clone()));
    params
        .entry("parent_depth".to_string())
        .or_insert_with(|| json!(ctx.depth));
    params
        .entry("parent_limits".to_string())
        .or_insert_with(|| json!(ctx.limits));
    params
        .entry("parent_capabilities".to_string())
        .or_insert_with(|| json!(ctx.capabilities));
}

const DROP_KEYS: &[&str] = &["chain", "metadata", "path", "source", "resolved_env_keys"];

/// Unwrap the standard tool envelope.
///
/// Strips transport bloat, lifts `data.*` out of primary-tool envelopes,
/// removes signature header lines from content fields, and synthesizes an
/// error status when the outer status is error or the inner result reports
/// `success: false` — carrying the most specific message available.
#[must_use]
pub fn clean_result(result: Value) -> Value {
    let Value::Object(map) = result else {
        return result;
    };

    // Primary-tool envelope: lift the inner data object.
    let is_primary_envelope = map
        .get("item_id")
        .and_then(|v| v.as_str())
        .is_some_and(|id| id.starts_with("spindle/primary/"));
    let outer_error = map
        .get("error")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let outer_failed = map.get("status").and_then(|v| v.as_str()) == Some("error");

    let lifted = if is_primary_envelope {
        match map.get("data") {
            Some(Value::Object(inner)) => Some(inner.clone()),
            _ => None,
        }
    } else {
        None
    };
    let mut target = lifted.unwrap_or(map);

    for key in DROP_KEYS {
        target.remove(*key);
    }
    if let Some(Value::String(content)) = target.get("content") {
        let stripped = strip_signature_lines(content);
        target.insert("content".to_string(), Value::String(stripped));
    }

    let inner_failed = target.get("success") == Some(&Value::Bool(false))
        || target.get("status").and_then(|v| v.as_str()) == Some("error");

    if outer_failed || inner_failed {
        let message = target
            .get("error")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .or(outer_error)
            .unwrap_or_else(|| "tool reported failure without a message".to_string());
        target.insert("status".to_string(), Value::String("error".to_string()));
        target.insert("error".to_string(), Value::String(message));
    }

    Value::Object(target)
}

fn strip_signature_lines(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.starts_with("# spindle:signed:") && !trimmed.starts_with("<!-- spindle:signed:")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl PrimaryTool for EchoTool {
        async fn handle(&self, action: &ToolAction, _project_path: &Path) -> anyhow::Result<Value> {
            Ok(json!({
                "status": "success",
                "item_id": action.item_id,
                "params": action.params,
            }))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl PrimaryTool for FailingTool {
        async fn handle(&self, _action: &ToolAction, _project_path: &Path) -> anyhow::Result<Value> {
            anyhow::bail!("backend exploded")
        }
    }

    fn dispatcher_with(tool: Arc<dyn PrimaryTool>) -> ToolDispatcher {
        let mut d = ToolDispatcher::new("/tmp/project");
        d.register(PrimaryAction::Execute, tool);
        d
    }

    #[tokio::test]
    async fn unknown_primary_is_an_error_value() {
        let d = ToolDispatcher::new("/tmp/project");
        let result = d
            .dispatch(&ToolAction::execute_tool("a/b"), None)
            .await;
        assert_eq!(result["status"], "error");
        assert!(result["error"].as_str().unwrap().contains("execute"));
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_value() {
        let d = dispatcher_with(Arc::new(FailingTool));
        let result = d.dispatch(&ToolAction::execute_tool("a/b"), None).await;
        assert_eq!(result["status"], "error");
        assert_eq!(result["error"], "backend exploded");
    }

    #[tokio::test]
    async fn thread_spawns_receive_parent_context() {
        let d = dispatcher_with(Arc::new(EchoTool));
        let ctx = ThreadContext {
            thread_id: "parent-1".into(),
            depth: 2,
            limits: BTreeMap::from([("turns".to_string(), 10.0)]),
            capabilities: vec!["spindle.execute.*".into()],
        };
        let action = ToolAction::execute_tool(THREAD_DIRECTIVE_TOOL)
            .with_param("directive_id", json!("d/x"));
        let result = d.dispatch(&action, Some(&ctx)).await;
        let params = &result["params"];
        assert_eq!(params["parent_thread_id"], "parent-1");
        assert_eq!(params["parent_depth"], 2);
        assert_eq!(params["parent_limits"]["turns"], 10.0);
        assert_eq!(params["parent_capabilities"][0], "spindle.execute.*");
        // Explicit params are not overwritten.
        let explicit = ToolAction::execute_tool(THREAD_DIRECTIVE_TOOL)
            .with_param("parent_thread_id", json!("explicit"));
        let result = d.dispatch(&explicit, Some(&ctx)).await;
        assert_eq!(result["params"]["parent_thread_id"], "explicit");
    }

    #[tokio::test]
    async fn non_spawn_actions_are_untouched() {
        let d = dispatcher_with(Arc::new(EchoTool));
        let ctx = ThreadContext::default();
        let action = ToolAction::execute_tool("spindle/file-system/read");
        let result = d.dispatch(&action, Some(&ctx)).await;
        assert!(result["params"].get("parent_thread_id").is_none());
    }

    #[tokio::test]
    async fn string_parameters_are_parsed() {
        let d = dispatcher_with(Arc::new(EchoTool));
        let action = ToolAction::execute_tool("a/b")
            .with_param("parameters", json!("{\"x\": 1}"));
        let result = d.dispatch(&action, None).await;
        assert_eq!(result["params"]["parameters"]["x"], 1);
    }

    #[test]
    fn clean_result_lifts_primary_envelope() {
        let raw = json!({
            "status": "success",
            "item_id": "spindle/primary/spindle_execute",
            "chain": ["a", "b"],
            "metadata": {"ms": 12},
            "data": {
                "output": "hello",
                "resolved_env_keys": ["KEY"],
                "path": "/tmp/x",
            },
        });
        let cleaned = clean_result(raw);
        assert_eq!(cleaned["output"], "hello");
        assert!(cleaned.get("chain").is_none());
        assert!(cleaned.get("path").is_none());
        assert!(cleaned.get("resolved_env_keys").is_none());
    }

    #[test]
    fn clean_result_synthesizes_error_status() {
        let raw = json!({
            "status": "error",
            "item_id": "spindle/primary/spindle_execute",
            "error": "outer message",
            "data": {"success": false, "error": "inner specific message"},
        });
        let cleaned = clean_result(raw);
        assert_eq!(cleaned["status"], "error");
        assert_eq!(cleaned["error"], "inner specific message");
    }

    #[test]
    fn clean_result_strips_signature_lines_from_content() {
        let raw = json!({
            "content": "# spindle:signed:2026-01-01T00:00:00Z:h:s:f\nreal content",
        });
        let cleaned = clean_result(raw);
        assert_eq!(cleaned["content"], "real content");
    }
}
