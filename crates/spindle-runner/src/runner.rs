// SPDX-License-Identifier: MIT OR Apache-2.0
//! The loop body.

use crate::context::extract_error_context;
use crate::outcome::RunOutcome;
use crate::sink::RawStreamLog;
use async_trait::async_trait;
use serde_json::{Value, json};
use spindle_artifact::ArtifactSigner;
use spindle_config::{CoordinationConfig, RetryPolicy};
use spindle_core::{Message, PrimaryAction, ThreadStatus, ToolAction, ToolCall, event};
use spindle_dispatch::{DIRECTIVE_RETURN_TOOL, ToolDispatcher};
use spindle_harness::{CancellationToken, SafetyHarness};
use spindle_provider::{HttpProvider, StreamSink};
use spindle_registry::ThreadRegistry;
use spindle_transcript::{
    EventEmitter, GuardConfig, ToolResultGuard, Transcript, TranscriptSigner, render_knowledge,
};
use std::sync::Arc;

const MAX_NUDGES: u32 = 3;

/// Cross-thread coordination surface the runner needs: in-process
/// registration for wait/cancel, and the context-exhaustion handoff.
///
/// Implemented by the orchestrator; test doubles implement it directly.
#[async_trait]
pub trait ThreadCoordinator: Send + Sync {
    /// Register a live thread (wait/cancel coordination).
    fn register_thread(&self, thread_id: &str, cancel: CancellationToken, depth: u32);

    /// Signal completion and publish the in-process result.
    fn complete_thread(&self, thread_id: &str, result: Value);

    /// Spawn a continuation thread for a context-exhausted thread.
    /// Returns the new thread id.
    async fn handoff_thread(&self, thread_id: &str) -> anyhow::Result<String>;
}

/// Per-run inputs.
pub struct RunnerOptions {
    /// First user message content (directive prompt).
    pub user_prompt: String,
    /// Caller-provided system prompt (from directive `context.system`).
    pub system_prompt: String,
    /// Directive intent text for hook context (name, description, body).
    pub directive_body: String,
    /// Pre-loaded `context.before` knowledge content.
    pub context_before: String,
    /// Pre-loaded `context.after` knowledge content.
    pub context_after: String,
    /// Reconstructed messages for continuations; skips first-message
    /// construction.
    pub resume_messages: Option<Vec<Message>>,
    /// Predecessor thread for continuations.
    pub previous_thread_id: Option<String>,
    /// Resolved directive inputs.
    pub inputs: Value,
    /// Extra streaming sinks (UI updates, tests).
    pub extra_sinks: Vec<Arc<dyn StreamSink>>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            user_prompt: String::new(),
            system_prompt: String::new(),
            directive_body: String::new(),
            context_before: String::new(),
            context_after: String::new(),
            resume_messages: None,
            previous_thread_id: None,
            inputs: Value::Object(Default::default()),
            extra_sinks: Vec::new(),
        }
    }
}

/// Drives one thread's LLM loop.
pub struct ThreadRunner {
    /// The thread being run.
    pub thread_id: String,
    /// Safety harness for this thread.
    pub harness: Arc<SafetyHarness>,
    /// Resolved provider.
    pub provider: HttpProvider,
    /// Primary-tool dispatcher.
    pub dispatcher: Arc<ToolDispatcher>,
    /// Event emitter with criticality routing.
    pub emitter: EventEmitter,
    /// The thread's transcript.
    pub transcript: Arc<Transcript>,
    /// Durable registry (cost snapshots).
    pub registry: Arc<ThreadRegistry>,
    /// Signing key for checkpoints and knowledge rendering.
    pub signer: Arc<ArtifactSigner>,
    /// Coordination tuning (context threshold).
    pub coordination: CoordinationConfig,
    /// Retry backoff policy for retryable provider failures.
    pub retry_policy: RetryPolicy,
    /// Cross-thread coordination.
    pub coordinator: Arc<dyn ThreadCoordinator>,
}

impl ThreadRunner {
    /// Execute the loop until completion, error, cancellation, limit, or
    /// handoff.
    pub async fn run(&self, opts: RunnerOptions) -> RunOutcome {
        self.coordinator.register_thread(
            &self.thread_id,
            self.harness.cancel_token(),
            self.harness.depth(),
        );

        let outcome = self.run_inner(opts).await;
        self.finalize(outcome).await
    }

    async fn run_inner(&self, opts: RunnerOptions) -> RunOutcome {
        let checkpoint_signer = TranscriptSigner::new(self.transcript.path(), &self.signer);
        let guard = ToolResultGuard::new(self.transcript.dir(), GuardConfig::default());

        // Assemble the system prompt from build_system_prompt hooks plus
        // the caller-provided override.
        let system_ctx = self
            .harness
            .run_context_hooks(
                "build_system_prompt",
                json!({
                    "directive_body": opts.directive_body,
                    "model": self.provider.model(),
                    "inputs": opts.inputs,
                }),
                &self.dispatcher,
            )
            .await;
        let hook_system: String = [system_ctx.before.as_str(), system_ctx.after.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n\n");
        let system_prompt = match (hook_system.is_empty(), opts.system_prompt.is_empty()) {
            (false, false) => format!("{hook_system}\n\n{}", opts.system_prompt),
            (false, true) => hook_system,
            (true, _) => opts.system_prompt.clone(),
        };

        if !system_prompt.is_empty() {
            let layers: Vec<Value> = system_ctx
                .before_raw
                .iter()
                .chain(system_ctx.after_raw.iter())
                .filter_map(|b| b.get("id").cloned())
                .collect();
            self.emitter.emit_droppable(
                &self.transcript,
                event::SYSTEM_PROMPT,
                json!({"text": system_prompt, "layers": layers}),
            );
        }

        // First message (or reconstructed continuation).
        let mut messages: Vec<Message> = match &opts.resume_messages {
            Some(resumed) => {
                let mut messages = resumed.clone();
                let hook_ctx = self
                    .harness
                    .run_context_hooks(
                        "thread_continued",
                        json!({
                            "directive_body": opts.directive_body,
                            "model": self.provider.model(),
                            "previous_thread_id": opts.previous_thread_id,
                            "inputs": opts.inputs,
                        }),
                        &self.dispatcher,
                    )
                    .await;
                let combined: String = [hook_ctx.before.as_str(), hook_ctx.after.as_str()]
                    .iter()
                    .filter(|s| !s.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join("\n\n");
                if !combined.is_empty() && !messages.is_empty() {
                    // Inject near the last user message, not at position 0:
                    // prepending would disrupt the reconstructed chronology
                    // and push context far from the continuation ask.
                    let idx = messages
                        .iter()
                        .rposition(|m| m.role == spindle_core::Role::User)
                        .unwrap_or(messages.len() - 1);
                    let merged = format!("{combined}\n\n{}", messages[idx].content);
                    messages[idx].content = merged;
                }
                self.emit_context_injected(&hook_ctx);
                messages
            }
            None => {
                let caps = self.harness.capabilities();
                let caps_summary = if caps.is_empty() {
                    "unrestricted".to_string()
                } else {
                    caps.join(", ")
                };
                let hook_ctx = self
                    .harness
                    .run_context_hooks(
                        "thread_started",
                        json!({
                            "directive_body": opts.directive_body,
                            "model": self.provider.model(),
                            "inputs": opts.inputs,
                            "parent_thread_id": opts.previous_thread_id.clone().unwrap_or_else(|| "none".into()),
                            "capabilities_summary": caps_summary,
                        }),
                        &self.dispatcher,
                    )
                    .await;

                // Order: hook_before · directive_before · prompt ·
                // directive_after · hook_after.
                let parts: Vec<&str> = [
                    hook_ctx.before.as_str(),
                    opts.context_before.as_str(),
                    opts.user_prompt.as_str(),
                    opts.context_after.as_str(),
                    hook_ctx.after.as_str(),
                ]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect();
                self.emit_context_injected(&hook_ctx);
                vec![Message::user(parts.join("\n\n"))]
            }
        };

        // Sinks: the crash-resilient raw stream log plus caller sinks.
        let stream_log: Arc<dyn StreamSink> =
            Arc::new(RawStreamLog::new(self.transcript.dir()));
        let mut sinks: Vec<Arc<dyn StreamSink>> = vec![stream_log];
        sinks.extend(opts.extra_sinks.iter().cloned());

        loop {
            // Pre-turn limit check.
            if let Some(limit) = self.harness.check_limits() {
                let mut payload = limit.to_payload();
                payload["error_context"] = extract_error_context(&messages);
                let hook_result = self
                    .harness
                    .run_hooks("limit", payload.clone(), &self.dispatcher)
                    .await;
                let cost = self.harness.cost().snapshot();
                if let Some(handled) = hook_result {
                    return self.outcome_from_hook(handled, &payload, cost);
                }
                // Fail-safe: terminate even when no hook handled the limit.
                let mut outcome = RunOutcome::failed(
                    &self.thread_id,
                    cost,
                    format!(
                        "Limit exceeded: {} ({}/{})",
                        limit.code, limit.current, limit.max
                    ),
                );
                outcome.error_context = Some(payload["error_context"].clone());
                return outcome;
            }

            // Cancellation check.
            if self.harness.is_cancelled() {
                let cost = self.harness.cost().snapshot();
                let mut outcome = RunOutcome::failed(&self.thread_id, cost, "cancelled".into());
                outcome.status = ThreadStatus::Cancelled;
                return outcome;
            }

            // Checkpoint: sign the prior turn's region and refresh the
            // knowledge entry.
            let turns_so_far = self.harness.cost().snapshot().turns;
            if turns_so_far > 0 {
                if let Err(e) = checkpoint_signer.checkpoint(turns_so_far) {
                    // A failed checkpoint means the transcript can no longer
                    // be trusted; the thread must stop.
                    return RunOutcome::failed(
                        &self.thread_id,
                        self.harness.cost().snapshot(),
                        format!("checkpoint failed at turn {turns_so_far}: {e}"),
                    );
                }
                let _ = render_knowledge(
                    &self.transcript,
                    self.harness.directive_name(),
                    "running",
                    self.provider.model(),
                    &self.harness.cost().snapshot(),
                    Some(&self.signer),
                );
            }

            // One cognition_in per turn; retries repeat the call, not the
            // event.
            let last = messages.last().expect("conversation is never empty");
            self.emitter.emit_droppable(
                &self.transcript,
                event::COGNITION_IN,
                json!({"text": last.content, "role": last.role.as_str()}),
            );

            // Provider call with per-turn retry attempts. The turn counter
            // increments only on success.
            let response = match self.call_provider_with_retries(&messages, &sinks, &system_prompt).await {
                Ok(response) => response,
                Err(outcome) => return *outcome,
            };
            self.harness.cost().begin_turn();
            self.harness.cost().add_usage(
                response.input_tokens,
                response.output_tokens,
                response.spend,
            );

            self.emitter.emit_droppable(
                &self.transcript,
                event::COGNITION_OUT,
                json!({"text": response.text, "model": self.provider.model()}),
            );
            if let Some(thinking) = &response.thinking {
                let _ = self.emitter.emit_critical(
                    &self.transcript,
                    event::COGNITION_REASONING,
                    json!({"text": thinking}),
                );
            }

            let tool_calls = response.tool_calls.clone();

            if tool_calls.is_empty() {
                if let Some(nudge) = self.maybe_nudge(&response.text) {
                    let mut assistant = Message::assistant(response.text.clone());
                    assistant.thinking = response.thinking.clone();
                    messages.push(assistant);
                    messages.push(Message::user(nudge));
                    continue;
                }
                return RunOutcome::completed(
                    &self.thread_id,
                    self.harness.cost().snapshot(),
                    response.text,
                );
            }

            // Append the assistant message with its tool_use blocks so the
            // provider can reconstruct the conversation next turn.
            let mut assistant = Message::assistant(response.text.clone());
            assistant.thinking = response.thinking.clone();
            assistant.tool_calls = tool_calls.clone();
            messages.push(assistant);

            for call in &tool_calls {
                self.emitter.emit_droppable(
                    &self.transcript,
                    event::TOOL_CALL_START,
                    json!({"tool": call.name, "call_id": call.id, "input": call.input}),
                );

                if let Some(done) = self.handle_tool_call(call, &mut messages, &guard).await {
                    return done;
                }
            }

            // Post-turn hooks and cost snapshot.
            let cost = self.harness.cost().snapshot();
            let _ = self
                .harness
                .run_hooks(
                    "after_step",
                    json!({"cost": cost, "thread_id": self.thread_id}),
                    &self.dispatcher,
                )
                .await;
            if let Err(e) = self.registry.update_cost_snapshot(&self.thread_id, cost.clone()) {
                tracing::debug!(target: "spindle.runner", error = %e, "cost snapshot skipped");
            }

            // Context window check — handoff to a fresh thread.
            if let Some(limit_info) = self.check_context_limit(&messages) {
                let _ = self.emitter.emit_critical(
                    &self.transcript,
                    event::CONTEXT_LIMIT_REACHED,
                    limit_info.clone(),
                );
                // The successor verifies this transcript's signature chain
                // strictly before reconstructing; sign up to here first.
                if let Err(e) = checkpoint_signer.checkpoint(cost.turns) {
                    return RunOutcome::failed(
                        &self.thread_id,
                        self.harness.cost().snapshot(),
                        format!("checkpoint failed before handoff: {e}"),
                    );
                }
                match self.coordinator.handoff_thread(&self.thread_id).await {
                    Ok(new_thread_id) => {
                        let cost = self.harness.cost().snapshot();
                        let mut outcome = RunOutcome::completed(
                            &self.thread_id,
                            cost,
                            String::new(),
                        );
                        outcome.status = ThreadStatus::Continued;
                        outcome.continuation_thread_id = Some(new_thread_id);
                        return outcome;
                    }
                    Err(e) => {
                        tracing::error!(target: "spindle.runner", error = %e, "handoff failed");
                        let hook_result = self
                            .harness
                            .run_hooks("context_limit_reached", limit_info, &self.dispatcher)
                            .await;
                        if let Some(handled) = hook_result {
                            if handled.get("action").and_then(Value::as_str) == Some("continue") {
                                let cost = self.harness.cost().snapshot();
                                let mut outcome =
                                    RunOutcome::completed(&self.thread_id, cost, String::new());
                                outcome.status = ThreadStatus::Continued;
                                outcome.continuation_thread_id = handled
                                    .get("continuation_thread_id")
                                    .and_then(Value::as_str)
                                    .map(ToString::to_string);
                                return outcome;
                            }
                        }
                        // Unhandled: keep looping; the limit checks will
                        // stop the thread if it cannot make progress.
                    }
                }
            }
        }
    }

    /// Call the provider, honoring error-hook retries with computed
    /// backoff. Retries never increment the turn counter.
    async fn call_provider_with_retries(
        &self,
        messages: &[Message],
        sinks: &[Arc<dyn StreamSink>],
        system_prompt: &str,
    ) -> Result<spindle_core::CompletionResponse, Box<RunOutcome>> {
        let mut attempt: u32 = 0;
        loop {
            let result = if self.provider.supports_streaming() {
                self.provider
                    .create_streaming_completion(
                        messages,
                        self.harness.available_tools(),
                        sinks,
                        system_prompt,
                    )
                    .await
            } else {
                self.provider
                    .create_completion(messages, self.harness.available_tools(), system_prompt)
                    .await
            };

            let error = match result {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let original_message = error.to_string();
            let classification = json!({
                "retryable": error.retryable(),
                "http_status": error.http_status(),
                "retry_policy": {
                    "base": self.retry_policy.base,
                    "max_attempts": self.retry_policy.max_attempts,
                    "jitter": self.retry_policy.jitter,
                },
            });
            let hook_result = self
                .harness
                .run_hooks(
                    "error",
                    json!({"error": original_message, "classification": classification}),
                    &self.dispatcher,
                )
                .await;

            if let Some(handled) = hook_result {
                if handled.get("action").and_then(Value::as_str) == Some("retry") {
                    attempt += 1;
                    if error.retryable() && attempt < self.retry_policy.max_attempts {
                        let delay = self.retry_policy.delay_for_attempt(attempt);
                        tracing::info!(
                            target: "spindle.runner",
                            thread_id = %self.thread_id,
                            attempt,
                            delay_s = delay,
                            "retrying provider call"
                        );
                        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                        continue;
                    }
                    // Attempts exhausted (or not retryable): fall through to
                    // failure with the original message preserved.
                } else {
                    // A hook may rewrite the failure but must not blank it.
                    let hook_error = handled
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let message = if hook_error.trim().is_empty() {
                        tracing::warn!(
                            target: "spindle.runner",
                            thread_id = %self.thread_id,
                            "hook attempted empty error override; original preserved"
                        );
                        original_message.clone()
                    } else {
                        hook_error.to_string()
                    };
                    return Err(Box::new(RunOutcome::failed(
                        &self.thread_id,
                        self.harness.cost().snapshot(),
                        message,
                    )));
                }
            }

            return Err(Box::new(RunOutcome::failed(
                &self.thread_id,
                self.harness.cost().snapshot(),
                original_message,
            )));
        }
    }

    /// Handle one tool call. Returns `Some(outcome)` when the call
    /// finalizes the thread (directive_return).
    async fn handle_tool_call(
        &self,
        call: &ToolCall,
        messages: &mut Vec<Message>,
        guard: &ToolResultGuard,
    ) -> Option<RunOutcome> {
        // The wrapper is not the unit of authorization: permission is
        // checked on the inner action.
        let inner_primary = PrimaryAction::from_wrapper_name(&call.name)
            .map_or_else(|| call.name.clone(), |p| p.as_str().to_string());
        let inner_item_type = call
            .input
            .get("item_type")
            .and_then(Value::as_str)
            .unwrap_or("tool")
            .to_string();
        let inner_item_id = call
            .input
            .get("item_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        if let Some(denial) =
            self.harness
                .check_permission(&inner_primary, &inner_item_type, &inner_item_id)
        {
            let text = denial.to_string();
            self.emitter.emit_droppable(
                &self.transcript,
                event::TOOL_CALL_RESULT,
                json!({"call_id": call.id, "output": text, "error": text}),
            );
            let mut msg = Message::tool_result(&call.id, text);
            msg.is_error = true;
            messages.push(msg);
            return None;
        }

        // The completion sentinel: outputs come from the call parameters,
        // not a tool result.
        if inner_item_id == DIRECTIVE_RETURN_TOOL {
            let outputs = call
                .input
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            let missing: Vec<&String> = self
                .harness
                .output_fields()
                .iter()
                .filter(|field| {
                    outputs
                        .get(field.as_str())
                        .is_none_or(|v| v.is_null() || v.as_str().is_some_and(str::is_empty))
                })
                .collect();
            if !missing.is_empty() {
                let error_msg = format!(
                    "Missing required output fields: {}. Call directive_return again with all required fields.",
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                self.emitter.emit_droppable(
                    &self.transcript,
                    event::TOOL_CALL_RESULT,
                    json!({"call_id": call.id, "output": error_msg, "error": error_msg}),
                );
                let mut msg = Message::tool_result(&call.id, error_msg);
                msg.is_error = true;
                messages.push(msg);
                return None;
            }

            self.emitter.emit_droppable(
                &self.transcript,
                event::TOOL_CALL_RESULT,
                json!({"call_id": call.id, "output": outputs.to_string()}),
            );
            let cost = self.harness.cost().snapshot();
            let _ = self
                .harness
                .run_hooks(
                    "directive_return",
                    json!({"outputs": outputs, "cost": cost, "thread_id": self.thread_id}),
                    &self.dispatcher,
                )
                .await;

            let last_text = messages
                .iter()
                .rev()
                .find(|m| m.role == spindle_core::Role::Assistant)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let mut outcome = RunOutcome::completed(&self.thread_id, cost, last_text);
            outcome.outputs = Some(outputs);
            return Some(outcome);
        }

        // Route through the dispatcher (which injects parent context for
        // child spawns).
        let mut action = ToolAction {
            primary: inner_primary.parse().unwrap_or(PrimaryAction::Execute),
            item_type: inner_item_type,
            item_id: inner_item_id.clone(),
            params: Default::default(),
        };
        if let Value::Object(input) = &call.input {
            action.params = input.clone().into_iter().collect();
        }
        if inner_item_id == spindle_dispatch::THREAD_DIRECTIVE_TOOL {
            self.harness.cost().increment_spawns();
        }

        let result = self
            .dispatcher
            .dispatch(&action, Some(&self.harness.thread_context()))
            .await;

        // Guard against context bloat before the result rejoins the
        // conversation.
        let result_text = match &result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let context_ratio = self.context_usage_ratio(messages);
        let guarded = guard.guard(&result_text, &call.name, context_ratio);

        self.emitter.emit_droppable(
            &self.transcript,
            event::TOOL_CALL_RESULT,
            json!({"call_id": call.id, "output": guarded}),
        );
        messages.push(Message::tool_result(&call.id, guarded));
        None
    }

    /// A stalled response (no tool calls and empty text) or an outstanding
    /// directive-return expectation earns a bounded nudge. A text-only
    /// answer with nothing outstanding is a legitimate completion.
    fn maybe_nudge(&self, text: &str) -> Option<String> {
        let empty_response = text.trim().is_empty();
        let expects_return = !self.harness.output_fields().is_empty();

        let should = self.provider.tool_use_mode() == "native"
            && !self.harness.available_tools().is_empty()
            && self.harness.nudge_count() < MAX_NUDGES
            && (empty_response || expects_return);
        if !should {
            return None;
        }
        self.harness.increment_nudges();

        Some(if empty_response {
            "Your response was empty. You MUST continue working on the directive. \
             Use the provided tools to complete all steps. Do not stop until you \
             have written the required files and called directive_return."
                .to_string()
        } else if expects_return {
            "You have not yet called directive_return. The directive requires \
             structured outputs. Continue working: use tools to complete all steps, \
             then call spindle_execute with item_id='spindle/agent/threads/directive_return' \
             to return your results."
                .to_string()
        } else {
            "You did not call any tools. Please use the provided tools to \
             complete the directive steps. Call tools using the tool_use mechanism."
                .to_string()
        })
    }

    fn estimate_message_tokens(messages: &[Message]) -> u64 {
        // ~4 chars per token for English text.
        let chars: usize = messages.iter().map(|m| m.content.len()).sum();
        (chars / 4) as u64
    }

    fn context_usage_ratio(&self, messages: &[Message]) -> f64 {
        let window = self.provider.context_window();
        if window == 0 {
            return 0.0;
        }
        Self::estimate_message_tokens(messages) as f64 / window as f64
    }

    fn check_context_limit(&self, messages: &[Message]) -> Option<Value> {
        let window = self.provider.context_window();
        if window == 0 {
            return None;
        }
        let used = Self::estimate_message_tokens(messages);
        let ratio = used as f64 / window as f64;
        let threshold = self.coordination.continuation.trigger_threshold;
        (ratio >= threshold).then(|| {
            json!({
                "usage_ratio": ratio,
                "tokens_used": used,
                "tokens_limit": window,
            })
        })
    }

    fn outcome_from_hook(&self, handled: Value, payload: &Value, cost: spindle_core::Cost) -> RunOutcome {
        let success = handled
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut outcome = if success {
            RunOutcome::completed(
                &self.thread_id,
                cost,
                handled
                    .get("result")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )
        } else {
            RunOutcome::failed(
                &self.thread_id,
                cost,
                handled
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("limit reached")
                    .to_string(),
            )
        };
        outcome.error_context = payload.get("error_context").cloned();
        outcome
    }

    fn emit_context_injected(&self, hook_ctx: &spindle_harness::HookContext) {
        for (position, blocks) in [("before", &hook_ctx.before_raw), ("after", &hook_ctx.after_raw)]
        {
            if !blocks.is_empty() {
                self.emitter.emit_droppable(
                    &self.transcript,
                    event::CONTEXT_INJECTED,
                    json!({"position": position, "blocks": blocks}),
                );
            }
        }
    }

    /// All exit paths: sign the final region, render the knowledge entry,
    /// emit the terminal event, run `after_complete` hooks (best-effort),
    /// and publish the in-process result.
    async fn finalize(&self, outcome: RunOutcome) -> RunOutcome {
        let cost = outcome.cost.clone();

        let mut payload = json!({"cost": cost});
        if let Some(error) = &outcome.error {
            payload["error"] = json!(error);
        }
        let terminal_event = match outcome.status {
            ThreadStatus::Completed => event::THREAD_COMPLETED,
            ThreadStatus::Cancelled => event::THREAD_CANCELLED,
            ThreadStatus::Continued => event::THREAD_CONTINUED,
            _ => event::THREAD_ERROR,
        };
        let _ = self
            .emitter
            .emit_critical(&self.transcript, terminal_event, payload);

        // The final checkpoint is the transcript's last line, so a finished
        // thread verifies strictly (no unsigned trailing region) and stays
        // resumable.
        if cost.turns > 0 {
            let checkpoint_signer = TranscriptSigner::new(self.transcript.path(), &self.signer);
            if let Err(e) = checkpoint_signer.checkpoint(cost.turns) {
                tracing::error!(target: "spindle.runner", error = %e, "final checkpoint failed");
            }
        }

        let _ = render_knowledge(
            &self.transcript,
            self.harness.directive_name(),
            outcome.status.as_str(),
            self.provider.model(),
            &cost,
            Some(&self.signer),
        );

        // after_complete hooks must not break finalization.
        let _ = self
            .harness
            .run_hooks(
                "after_complete",
                json!({"thread_id": self.thread_id, "cost": cost}),
                &self.dispatcher,
            )
            .await;

        self.coordinator.complete_thread(
            &self.thread_id,
            serde_json::to_value(&outcome).unwrap_or(Value::Null),
        );

        outcome
    }
}
