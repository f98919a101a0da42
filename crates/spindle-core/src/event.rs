// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transcript event-type names.
//!
//! The runner emits these; the transcript persists and renders them. Names
//! are part of the on-disk JSONL contract and must stay stable.

/// Thread lifecycle start.
pub const THREAD_START: &str = "thread_start";
/// Assembled system prompt, with contributing layers.
pub const SYSTEM_PROMPT: &str = "system_prompt";
/// Hook-produced context blocks merged into the conversation.
pub const CONTEXT_INJECTED: &str = "context_injected";
/// A message entering the model.
pub const COGNITION_IN: &str = "cognition_in";
/// Model text output.
pub const COGNITION_OUT: &str = "cognition_out";
/// Model reasoning output, when surfaced.
pub const COGNITION_REASONING: &str = "cognition_reasoning";
/// A tool call leaving the model.
pub const TOOL_CALL_START: &str = "tool_call_start";
/// A tool result rejoining the conversation.
pub const TOOL_CALL_RESULT: &str = "tool_call_result";
/// Graph-walker step entry.
pub const STEP_START: &str = "step_start";
/// Graph-walker step exit.
pub const STEP_FINISH: &str = "step_finish";
/// Context window crossed the continuation threshold.
pub const CONTEXT_LIMIT_REACHED: &str = "context_limit_reached";
/// Old thread handing off to a continuation thread.
pub const THREAD_HANDOFF: &str = "thread_handoff";
/// Terminal thread resumed externally.
pub const THREAD_RESUMED: &str = "thread_resumed";
/// Terminal: success.
pub const THREAD_COMPLETED: &str = "thread_completed";
/// Terminal: failure.
pub const THREAD_ERROR: &str = "thread_error";
/// Terminal: cooperative cancellation.
pub const THREAD_CANCELLED: &str = "thread_cancelled";
/// Terminal: continued into a successor thread.
pub const THREAD_CONTINUED: &str = "thread_continued";
/// Serialized walker state for graph runs.
pub const STATE_SNAPSHOT: &str = "state_snapshot";
