// SPDX-License-Identifier: MIT OR Apache-2.0
//! The append-only JSONL transcript and message reconstruction.

use serde::{Deserialize, Serialize};
use spindle_core::{Message, Role, ToolCall, event};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One transcript line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    /// Unix timestamp (seconds, fractional).
    pub timestamp: f64,
    /// Owning thread.
    pub thread_id: String,
    /// Event type name (see [`spindle_core::event`]).
    pub event_type: String,
    /// Event payload.
    pub payload: serde_json::Value,
}

/// Transcript failures.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    /// A non-trailing line failed to parse. Resume must abort — partial
    /// reconstruction is not permitted.
    #[error("corrupt transcript at {path}:{line_no}")]
    Corrupt {
        /// Transcript path.
        path: PathBuf,
        /// 1-based offending line number.
        line_no: usize,
    },

    /// Filesystem failure.
    #[error("transcript io failure at {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Detached checkpoint signature lines interleave with events in the same
/// file; they are not events and the reader skips them.
fn is_checkpoint_line(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .map(|v| v.get("checkpoint").is_some())
        .unwrap_or(false)
}

/// Append-only JSONL transcript for a thread.
///
/// Each event is written as a single JSON line and flushed immediately, so
/// partial transcripts survive crashes. Single appender per thread; readers
/// tolerate a partially-written trailing line.
pub struct Transcript {
    thread_id: String,
    project_root: PathBuf,
    dir: PathBuf,
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("thread_id", &self.thread_id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Transcript {
    /// Open (creating the directory) the transcript for a thread under
    /// `<project_root>/.ai/agent/threads/<thread_id>/transcript.jsonl`.
    ///
    /// # Errors
    ///
    /// [`TranscriptError::Io`] when the directory cannot be created.
    pub fn open(thread_id: &str, project_root: &Path) -> Result<Self, TranscriptError> {
        let dir = project_root
            .join(".ai")
            .join("agent")
            .join("threads")
            .join(thread_id);
        std::fs::create_dir_all(&dir).map_err(|source| TranscriptError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join("transcript.jsonl");
        Ok(Self {
            thread_id: thread_id.to_string(),
            project_root: project_root.to_path_buf(),
            dir,
            path,
            append_lock: Mutex::new(()),
        })
    }

    /// Owning thread id.
    #[must_use]
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// The JSONL file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The thread's directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the knowledge markdown mirror:
    /// `<project>/.ai/knowledge/agent/threads/<thread_id>.md`, with the
    /// thread id's path components mapped to nested directories.
    #[must_use]
    pub fn knowledge_path(&self) -> PathBuf {
        let mut dir = self
            .project_root
            .join(".ai")
            .join("knowledge")
            .join("agent")
            .join("threads");
        let thread_path = Path::new(&self.thread_id);
        if let Some(parent) = thread_path.parent() {
            if parent != Path::new("") {
                dir = dir.join(parent);
            }
        }
        let name = thread_path
            .file_name()
            .map_or_else(|| self.thread_id.clone(), |n| n.to_string_lossy().into_owned());
        dir.join(format!("{name}.md"))
    }

    /// Append one event, flushed before return.
    ///
    /// # Errors
    ///
    /// [`TranscriptError::Io`] on write failure.
    pub fn write_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), TranscriptError> {
        let entry = TranscriptEvent {
            timestamp: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            thread_id: self.thread_id.clone(),
            event_type: event_type.to_string(),
            payload,
        };
        let line = serde_json::to_string(&entry).expect("event is always serialisable");

        let _guard = self.append_lock.lock().expect("append lock poisoned");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| TranscriptError::Io {
                path: self.path.clone(),
                source,
            })?;
        writeln!(file, "{line}").map_err(|source| TranscriptError::Io {
            path: self.path.clone(),
            source,
        })?;
        file.flush().map_err(|source| TranscriptError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Read all events.
    ///
    /// Blank lines are skipped. A partially-written trailing line survives
    /// a crash and is tolerated; an unparseable line anywhere else is
    /// [`TranscriptError::Corrupt`].
    ///
    /// # Errors
    ///
    /// [`TranscriptError::Io`] or [`TranscriptError::Corrupt`].
    pub fn read_events(&self) -> Result<Vec<TranscriptEvent>, TranscriptError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path).map_err(|source| TranscriptError::Io {
            path: self.path.clone(),
            source,
        })?;

        let lines: Vec<(usize, &str)> = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty())
            .collect();

        let mut events = Vec::with_capacity(lines.len());
        let last_index = lines.len().saturating_sub(1);
        for (pos, (line_no, line)) in lines.iter().enumerate() {
            match serde_json::from_str::<TranscriptEvent>(line) {
                Ok(event) => events.push(event),
                Err(_) if is_checkpoint_line(line) => continue,
                Err(_) if pos == last_index => break,
                Err(_) => {
                    return Err(TranscriptError::Corrupt {
                        path: self.path.clone(),
                        line_no: *line_no,
                    });
                }
            }
        }
        Ok(events)
    }

    /// Reconstruct the provider-neutral message list from the event stream.
    ///
    /// Three passes: parse all events; group each `tool_call_start` under
    /// the `cognition_out` that issued it (every start between an assistant
    /// turn and the next cognition event belongs to that turn); emit
    /// messages in order. Attaching `tool_calls` to the assistant message
    /// is a hard contract — without them the reconstructed conversation has
    /// orphaned tool results and providers reject it.
    ///
    /// Returns `None` when the transcript is empty or yields no messages.
    ///
    /// # Errors
    ///
    /// [`TranscriptError::Corrupt`] propagates — resume from a corrupt
    /// transcript is not permitted.
    pub fn reconstruct_messages(&self) -> Result<Option<Vec<Message>>, TranscriptError> {
        let events = self.read_events()?;
        if events.is_empty() {
            return Ok(None);
        }

        // Pass 2: group tool_call_starts per cognition_out turn.
        let mut turn_tool_calls: std::collections::HashMap<usize, Vec<ToolCall>> =
            std::collections::HashMap::new();
        let mut current_assistant: Option<usize> = None;
        for (i, event) in events.iter().enumerate() {
            match event.event_type.as_str() {
                event::COGNITION_OUT => current_assistant = Some(i),
                event::COGNITION_IN => current_assistant = None,
                event::TOOL_CALL_START => {
                    if let Some(owner) = current_assistant {
                        let p = &event.payload;
                        turn_tool_calls.entry(owner).or_default().push(ToolCall::new(
                            p.get("call_id").and_then(|v| v.as_str()).unwrap_or(""),
                            p.get("tool").and_then(|v| v.as_str()).unwrap_or(""),
                            p.get("input").cloned().unwrap_or(serde_json::json!({})),
                        ));
                    }
                }
                _ => {}
            }
        }

        // Pass 3: build messages.
        let mut messages = Vec::new();
        for (i, event) in events.iter().enumerate() {
            let p = &event.payload;
            match event.event_type.as_str() {
                event::COGNITION_IN => {
                    // Tool-role inputs are captured by tool_call_result.
                    let role = p.get("role").and_then(|v| v.as_str()).unwrap_or("user");
                    if role == "tool" {
                        continue;
                    }
                    let role = match role {
                        "assistant" => Role::Assistant,
                        "system" => Role::System,
                        _ => Role::User,
                    };
                    let mut msg =
                        Message::user(p.get("text").and_then(|v| v.as_str()).unwrap_or(""));
                    msg.role = role;
                    messages.push(msg);
                }
                event::COGNITION_OUT => {
                    let mut msg =
                        Message::assistant(p.get("text").and_then(|v| v.as_str()).unwrap_or(""));
                    if let Some(calls) = turn_tool_calls.remove(&i) {
                        msg.tool_calls = calls;
                    }
                    messages.push(msg);
                }
                event::TOOL_CALL_RESULT => {
                    let call_id = p.get("call_id").and_then(|v| v.as_str()).unwrap_or("");
                    let output = p.get("output").and_then(|v| v.as_str()).unwrap_or("");
                    let error = p.get("error").and_then(|v| v.as_str());
                    messages.push(Message::tool_result(call_id, error.unwrap_or(output)));
                }
                _ => {}
            }
        }

        Ok(if messages.is_empty() {
            None
        } else {
            Some(messages)
        })
    }
}
