// SPDX-License-Identifier: MIT OR Apache-2.0
//! The runner's transcript-side stream sink.

use spindle_provider::StreamSink;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Appends raw stream event payloads to `<thread_dir>/stream.jsonl` as
/// they arrive, so an in-flight response survives a crash.
///
/// Non-blocking by contract: writes are line-buffered appends and failures
/// are swallowed after a warning — a sink must never back-pressure the
/// HTTP read.
pub struct RawStreamLog {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl std::fmt::Debug for RawStreamLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStreamLog").field("path", &self.path).finish()
    }
}

impl RawStreamLog {
    /// Create a log under the thread directory.
    #[must_use]
    pub fn new(thread_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: thread_dir.into().join("stream.jsonl"),
            file: Mutex::new(None),
        }
    }

    /// The log file path.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl StreamSink for RawStreamLog {
    fn push(&self, chunk: &str) {
        let mut guard = self.file.lock().expect("stream log lock poisoned");
        if guard.is_none() {
            *guard = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .ok();
        }
        if let Some(file) = guard.as_mut() {
            if writeln!(file, "{chunk}").is_err() {
                tracing::warn!(target: "spindle.runner", path = %self.path.display(), "stream log write failed");
                *guard = None;
            }
        }
    }
}
