// SPDX-License-Identifier: MIT OR Apache-2.0
//! The runner's result shape.

use serde::{Deserialize, Serialize};
use spindle_core::{Cost, ThreadStatus};

/// Final state of a thread run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Whether the thread reached a successful terminal state
    /// (`completed` or `continued`).
    pub success: bool,
    /// Terminal status.
    pub status: ThreadStatus,
    /// The thread that ran.
    pub thread_id: String,
    /// Final accumulated cost.
    pub cost: Cost,
    /// Last assistant text (the result for completions).
    #[serde(default)]
    pub result_text: String,
    /// Structured outputs from `directive_return`, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    /// Error message for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Successor thread id when the run ended in a handoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_thread_id: Option<String>,
    /// Recent-conversation snippets attached to failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_context: Option<serde_json::Value>,
}

impl RunOutcome {
    /// A successful completion.
    #[must_use]
    pub fn completed(thread_id: impl Into<String>, cost: Cost, result_text: String) -> Self {
        Self {
            success: true,
            status: ThreadStatus::Completed,
            thread_id: thread_id.into(),
            cost,
            result_text,
            outputs: None,
            error: None,
            continuation_thread_id: None,
            error_context: None,
        }
    }

    /// A failed run. An empty message is replaced so failures are never
    /// silent.
    #[must_use]
    pub fn failed(thread_id: impl Into<String>, cost: Cost, error: String) -> Self {
        let error = if error.trim().is_empty() {
            "unknown error (no message provided)".to_string()
        } else {
            error
        };
        Self {
            success: false,
            status: ThreadStatus::Error,
            thread_id: thread_id.into(),
            cost,
            result_text: String::new(),
            outputs: None,
            error: Some(error),
            continuation_thread_id: None,
            error_context: None,
        }
    }
}
