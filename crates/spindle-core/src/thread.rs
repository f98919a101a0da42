// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thread lifecycle status and id generation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a thread.
///
/// Transitions: `created → running → {completed, error, cancelled,
/// continued, killed}`. `continued` is terminal-with-successor; `killed` is
/// terminal-without-successor, set externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// Registered, not yet running.
    Created,
    /// The runner loop is live.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Error,
    /// Cooperatively cancelled.
    Cancelled,
    /// Handed off to a continuation thread.
    Continued,
    /// Killed by PID from outside.
    Killed,
}

impl ThreadStatus {
    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Continued => "continued",
            Self::Killed => "killed",
        }
    }

    /// Whether this status ends the thread's lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }

    /// Whether a thread in this status may be resumed into a successor.
    ///
    /// Killed threads are deliberately unresumable.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.is_terminal() && *self != Self::Killed
    }

    /// Parse the stable name back into a status.
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            "continued" => Some(Self::Continued),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a thread id for a directive: `{directive_id}/{bare}-{epoch_ms}`.
///
/// Thread ids may contain `/` and map to nested directories on disk.
#[must_use]
pub fn generate_thread_id(directive_id: &str) -> String {
    let epoch_ms = chrono::Utc::now().timestamp_millis();
    let bare = directive_id.rsplit('/').next().unwrap_or(directive_id);
    format!("{directive_id}/{bare}-{epoch_ms}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!ThreadStatus::Created.is_terminal());
        assert!(!ThreadStatus::Running.is_terminal());
        for s in [
            ThreadStatus::Completed,
            ThreadStatus::Error,
            ThreadStatus::Cancelled,
            ThreadStatus::Continued,
            ThreadStatus::Killed,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
    }

    #[test]
    fn killed_is_not_resumable() {
        assert!(ThreadStatus::Completed.is_resumable());
        assert!(ThreadStatus::Error.is_resumable());
        assert!(!ThreadStatus::Killed.is_resumable());
        assert!(!ThreadStatus::Running.is_resumable());
    }

    #[test]
    fn status_name_roundtrip() {
        for s in [
            ThreadStatus::Created,
            ThreadStatus::Running,
            ThreadStatus::Completed,
            ThreadStatus::Error,
            ThreadStatus::Cancelled,
            ThreadStatus::Continued,
            ThreadStatus::Killed,
        ] {
            assert_eq!(ThreadStatus::from_str_opt(s.as_str()), Some(s));
        }
        assert_eq!(ThreadStatus::from_str_opt("resumed"), None);
    }

    #[test]
    fn thread_id_shape() {
        let id = generate_thread_id("spindle/agent/review");
        assert!(id.starts_with("spindle/agent/review/review-"));
    }
}
