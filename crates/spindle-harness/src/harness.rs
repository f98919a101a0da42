// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-thread safety harness.

use crate::cancel::CancellationToken;
use crate::cost::CostTracker;
use crate::hooks::{HookContext, HookEngine};
use serde_json::{Value, json};
use spindle_capability::{check_all_capabilities, expand_capabilities, item_id_to_cap};
use spindle_core::{Cost, Hook, ToolSchema};
use spindle_dispatch::{INTERNAL_TOOL_PREFIX, ThreadContext, ToolDispatcher};
use spindle_error::LimitCode;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// A breached limit, surfaced at a turn boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitEvent {
    /// Which dimension breached.
    pub code: LimitCode,
    /// Accumulated value.
    pub current: f64,
    /// Configured threshold.
    pub max: f64,
}

impl LimitEvent {
    /// Event payload for hooks and transcripts.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        json!({
            "name": "limit",
            "limit_code": format!("{}_exceeded", self.code),
            "current_value": self.current,
            "current_max": self.max,
        })
    }
}

/// A denied permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDenial {
    /// The capability the dispatch required.
    pub required: String,
    /// Required caps with no match in the effective set.
    pub missing: Vec<String>,
    /// The effective (granted) cap set at decision time.
    pub granted: Vec<String>,
    /// Why the check failed, for the tool-role error message.
    pub reason: String,
}

impl std::fmt::Display for PermissionDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "permission denied: missing {:?} (granted: {:?})",
            self.missing, self.granted
        )
    }
}

/// Per-thread safety enforcement: effective capabilities, cost limits,
/// hooks, and cancellation.
pub struct SafetyHarness {
    thread_id: String,
    directive_name: String,
    limits: BTreeMap<String, f64>,
    capabilities: Vec<String>,
    declared: Vec<String>,
    output_fields: Vec<String>,
    available_tools: Vec<ToolSchema>,
    inputs: Value,
    depth: u32,
    engine: HookEngine,
    cost: CostTracker,
    cancel: CancellationToken,
    nudges: AtomicU32,
}

impl std::fmt::Debug for SafetyHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyHarness")
            .field("thread_id", &self.thread_id)
            .field("directive", &self.directive_name)
            .field("capabilities", &self.capabilities)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SafetyHarness {
    /// Build a harness for a thread.
    ///
    /// The effective cap set is `attenuate(parent, declared)`: the subset
    /// of declared capabilities the expanded parent set dominates. A root
    /// thread (no parent capabilities) takes its declarations as-is —
    /// subject to risk classification at spawn.
    #[must_use]
    pub fn new(
        thread_id: impl Into<String>,
        directive_name: impl Into<String>,
        limits: BTreeMap<String, f64>,
        declared_permissions: Vec<String>,
        parent_capabilities: &[String],
    ) -> Self {
        let capabilities = if parent_capabilities.is_empty() {
            declared_permissions.clone()
        } else {
            let expanded = expand_capabilities(parent_capabilities);
            spindle_capability::intersect_capabilities(&expanded, &declared_permissions)
        };

        Self {
            thread_id: thread_id.into(),
            directive_name: directive_name.into(),
            limits,
            capabilities,
            declared: declared_permissions,
            output_fields: Vec::new(),
            available_tools: Vec::new(),
            inputs: Value::Object(Default::default()),
            depth: 0,
            engine: HookEngine::default(),
            cost: CostTracker::new(),
            cancel: CancellationToken::new(),
            nudges: AtomicU32::new(0),
        }
    }

    /// Attach the merged hook table and the directive's suppressions.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Vec<Hook>, suppress: Vec<String>) -> Self {
        self.engine = HookEngine::new(hooks, suppress);
        self
    }

    /// Attach the directive's resolved inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    /// Attach the generic tool schemas available to the model.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.available_tools = tools;
        self
    }

    /// Record the thread's depth (0 = root).
    #[must_use]
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Declare structured output fields. Grants the directive-return
    /// capability so the completion sentinel is always callable.
    #[must_use]
    pub fn with_output_fields(mut self, fields: Vec<String>) -> Self {
        if !fields.is_empty() {
            self.capabilities
                .push("spindle.execute.tool.spindle.agent.threads.directive_return".to_string());
        }
        self.output_fields = fields;
        self
    }

    // -- accessors ------------------------------------------------------

    /// Thread id.
    #[must_use]
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Directive name.
    #[must_use]
    pub fn directive_name(&self) -> &str {
        &self.directive_name
    }

    /// Resolved limits.
    #[must_use]
    pub fn limits(&self) -> &BTreeMap<String, f64> {
        &self.limits
    }

    /// Effective capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Declared (pre-attenuation) permissions.
    #[must_use]
    pub fn declared_permissions(&self) -> &[String] {
        &self.declared
    }

    /// Required output field names, empty when the directive declares none.
    #[must_use]
    pub fn output_fields(&self) -> &[String] {
        &self.output_fields
    }

    /// Tool schemas handed to the provider.
    #[must_use]
    pub fn available_tools(&self) -> &[ToolSchema] {
        &self.available_tools
    }

    /// Thread depth.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The cost tracker.
    #[must_use]
    pub fn cost(&self) -> &CostTracker {
        &self.cost
    }

    /// The cancellation token (cloneable).
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request cooperative cancellation.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Nudges issued so far.
    #[must_use]
    pub fn nudge_count(&self) -> u32 {
        self.nudges.load(Ordering::Relaxed)
    }

    /// Record a nudge; returns the new count.
    pub fn increment_nudges(&self) -> u32 {
        self.nudges.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Dispatch context for child spawns.
    #[must_use]
    pub fn thread_context(&self) -> ThreadContext {
        ThreadContext {
            thread_id: self.thread_id.clone(),
            depth: self.depth,
            limits: self.limits.clone(),
            capabilities: self.capabilities.clone(),
        }
    }

    // -- permission checks ----------------------------------------------

    /// Check a tool dispatch against the effective cap set.
    ///
    /// Called before every dispatch with the *inner* action — the wrapper
    /// tool is not the unit of authorization. Internal sub-tools are always
    /// allowed; an empty cap set denies everything (fail-closed).
    #[must_use]
    pub fn check_permission(
        &self,
        primary: &str,
        item_type: &str,
        item_id: &str,
    ) -> Option<PermissionDenial> {
        if item_id.starts_with(INTERNAL_TOOL_PREFIX) {
            return None;
        }

        let required = item_id_to_cap(primary, item_type, item_id);

        if self.capabilities.is_empty() {
            return Some(PermissionDenial {
                required: required.clone(),
                missing: vec![required],
                granted: Vec::new(),
                reason: "no capabilities granted".to_string(),
            });
        }

        let (ok, missing) = check_all_capabilities(&self.capabilities, &[required.clone()]);
        if ok {
            None
        } else {
            Some(PermissionDenial {
                required,
                missing,
                granted: self.capabilities.clone(),
                reason: "capability not granted".to_string(),
            })
        }
    }

    // -- limit checks ---------------------------------------------------

    /// Compare accumulated cost against thresholds.
    ///
    /// Returns the first breached limit, in a fixed dimension order, or
    /// `None`.
    #[must_use]
    pub fn check_limits(&self) -> Option<LimitEvent> {
        let cost = self.cost.snapshot();
        self.check_limits_against(&cost)
    }

    /// Limit check against an explicit cost snapshot.
    #[must_use]
    pub fn check_limits_against(&self, cost: &Cost) -> Option<LimitEvent> {
        let checks: [(&str, LimitCode, f64); 5] = [
            ("turns", LimitCode::Turns, f64::from(cost.turns)),
            ("tokens", LimitCode::Tokens, cost.total_tokens() as f64),
            ("spawns", LimitCode::Spawns, f64::from(cost.spawns)),
            (
                "duration_seconds",
                LimitCode::DurationSeconds,
                cost.elapsed_seconds,
            ),
            ("spend", LimitCode::Spend, cost.spend),
        ];
        for (key, code, current) in checks {
            if let Some(&max) = self.limits.get(key) {
                if max > 0.0 && current >= max {
                    return Some(LimitEvent { code, current, max });
                }
            }
        }
        None
    }

    // -- hooks ----------------------------------------------------------

    /// Ambient context for hook evaluation.
    #[must_use]
    pub fn build_context(&self, event: Value) -> Value {
        json!({
            "event": event,
            "directive": {
                "name": self.directive_name,
                "inputs": self.inputs,
            },
            "cost": self.cost.snapshot(),
            "limits": self.limits,
            "depth": self.depth,
            "permissions": {
                "granted": self.capabilities,
                "required": self.declared,
            },
        })
    }

    /// Evaluate control/infra hooks for an event. First non-empty control
    /// result wins.
    pub async fn run_hooks(
        &self,
        event: &str,
        event_payload: Value,
        dispatcher: &ToolDispatcher,
    ) -> Option<Value> {
        let ctx = self.build_context(event_payload);
        self.engine
            .run_hooks(event, &ctx, dispatcher, Some(&self.thread_context()))
            .await
    }

    /// Evaluate content hooks for a context event, with extra ambient
    /// fields merged into the evaluation context.
    pub async fn run_context_hooks(
        &self,
        event: &str,
        extra: Value,
        dispatcher: &ToolDispatcher,
    ) -> HookContext {
        let mut ctx = self.build_context(Value::Null);
        if let (Value::Object(base), Value::Object(extra)) = (&mut ctx, extra) {
            for (k, v) in extra {
                base.insert(k, v);
            }
        }
        self.engine
            .run_context_hooks(event, &ctx, dispatcher, Some(&self.thread_context()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(caps: &[&str]) -> Vec<String> {
        caps.iter().map(ToString::to_string).collect()
    }

    fn harness(declared: &[&str], parent: &[&str]) -> SafetyHarness {
        SafetyHarness::new(
            "t-1",
            "spindle/agent/review",
            BTreeMap::from([
                ("turns".to_string(), 5.0),
                ("tokens".to_string(), 1000.0),
                ("spend".to_string(), 0.5),
                ("spawns".to_string(), 2.0),
            ]),
            strings(declared),
            &strings(parent),
        )
    }

    #[test]
    fn root_thread_keeps_declared_caps() {
        let h = harness(&["spindle.execute.tool.fs.*"], &[]);
        assert_eq!(h.capabilities(), strings(&["spindle.execute.tool.fs.*"]));
    }

    #[test]
    fn child_caps_are_attenuated() {
        // Parent holds a narrow fs grant; the child declares broad execute.
        // Effective = intersection by matching: the parent's narrower cap.
        let h = harness(&["spindle.execute.*"], &["spindle.execute.tool.fs.*"]);
        assert_eq!(h.capabilities(), strings(&["spindle.execute.tool.fs.*"]));

        // A tool call outside the intersection is denied.
        let denial = h
            .check_permission("execute", "tool", "net/fetch")
            .unwrap();
        assert_eq!(denial.missing, strings(&["spindle.execute.tool.net.fetch"]));

        // The child declaring within the parent's grant keeps it.
        let h = harness(
            &["spindle.execute.tool.fs.read"],
            &["spindle.execute.tool.fs.*"],
        );
        assert_eq!(
            h.capabilities(),
            strings(&["spindle.execute.tool.fs.read"])
        );

        // Disjoint declarations contribute nothing.
        let h = harness(&["spindle.execute.*"], &["spindle.search.tool.fs.*"]);
        assert!(h.capabilities().is_empty());
    }

    #[test]
    fn permission_check_composes_the_required_cap() {
        let h = harness(&["spindle.execute.tool.spindle.file-system.*"], &[]);
        assert!(h
            .check_permission("execute", "tool", "spindle/file-system/fs_read")
            .is_none());

        let denial = h
            .check_permission("execute", "tool", "spindle/net/fetch")
            .unwrap();
        assert_eq!(denial.missing, strings(&["spindle.execute.tool.spindle.net.fetch"]));
    }

    #[test]
    fn empty_caps_deny_everything() {
        let h = harness(&[], &[]);
        let denial = h.check_permission("load", "knowledge", "readme").unwrap();
        assert_eq!(denial.granted.len(), 0);
    }

    #[test]
    fn internal_tools_bypass_the_check() {
        let h = harness(&[], &[]);
        assert!(h
            .check_permission(
                "execute",
                "tool",
                "spindle/agent/threads/internal/text_tool_parser"
            )
            .is_none());
    }

    #[test]
    fn implied_primaries_pass_the_check() {
        let h = harness(&["spindle.execute.tool.fs.*"], &[]);
        // execute ⇒ search, load
        assert!(h.check_permission("search", "tool", "fs/read").is_none());
        assert!(h.check_permission("load", "tool", "fs/read").is_none());
        assert!(h.check_permission("sign", "tool", "fs/read").is_some());
    }

    #[test]
    fn output_fields_grant_the_return_sentinel() {
        let h = harness(&[], &[]).with_output_fields(vec!["verdict".into()]);
        assert!(h
            .check_permission("execute", "tool", "spindle/agent/threads/directive_return")
            .is_none());
    }

    #[test]
    fn limit_checks_fire_in_dimension_order() {
        let h = harness(&[], &[]);
        for _ in 0..5 {
            h.cost().begin_turn();
        }
        let event = h.check_limits().unwrap();
        assert_eq!(event.code, LimitCode::Turns);
        assert!((event.current - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn token_limit_uses_total_tokens() {
        let h = harness(&[], &[]);
        h.cost().add_usage(800, 250, 0.0);
        let event = h.check_limits().unwrap();
        assert_eq!(event.code, LimitCode::Tokens);
        assert!((event.current - 1050.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_limits_no_event() {
        let h = SafetyHarness::new("t", "d", BTreeMap::new(), vec![], &[]);
        h.cost().begin_turn();
        h.cost().add_usage(1_000_000, 1_000_000, 99.0);
        assert!(h.check_limits().is_none());
    }

    #[test]
    fn limit_payload_shape() {
        let event = LimitEvent {
            code: LimitCode::Spend,
            current: 0.6,
            max: 0.5,
        };
        let payload = event.to_payload();
        assert_eq!(payload["limit_code"], "spend_exceeded");
        assert_eq!(payload["current_value"], 0.6);
    }

    #[test]
    fn cancellation_round_trip() {
        let h = harness(&[], &[]);
        assert!(!h.is_cancelled());
        let token = h.cancel_token();
        token.cancel();
        assert!(h.is_cancelled());
    }

    #[test]
    fn hook_context_carries_permissions_and_cost() {
        let h = harness(&["spindle.execute.tool.fs.*"], &[]);
        let ctx = h.build_context(json!({"name": "error"}));
        assert_eq!(ctx["event"]["name"], "error");
        assert_eq!(ctx["permissions"]["granted"][0], "spindle.execute.tool.fs.*");
        assert_eq!(ctx["directive"]["name"], "spindle/agent/review");
        assert!(ctx["cost"]["turns"].is_number());
    }
}
