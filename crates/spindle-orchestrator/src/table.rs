// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process thread tracking.
//!
//! One of the two unavoidable process-wide stores (the other is the
//! parent-id inheritance on detached children). Lifecycle-scoped to the
//! process; cross-process coordination goes through the registry.

use serde_json::Value;
use spindle_harness::CancellationToken;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct TableState {
    cancel_tokens: HashMap<String, CancellationToken>,
    results: HashMap<String, Value>,
    depths: HashMap<String, u32>,
    spawn_counts: HashMap<String, u32>,
}

/// Tracks live threads within this process for wait/cancel coordination.
#[derive(Default)]
pub struct InProcessTable {
    state: Mutex<TableState>,
    notify: Notify,
}

impl std::fmt::Debug for InProcessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("table lock poisoned");
        f.debug_struct("InProcessTable")
            .field("live", &state.cancel_tokens.keys().collect::<Vec<_>>())
            .field("completed", &state.results.len())
            .finish()
    }
}

impl InProcessTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live thread.
    pub fn register(&self, thread_id: &str, cancel: CancellationToken, depth: u32) {
        let mut state = self.state.lock().expect("table lock poisoned");
        state.cancel_tokens.insert(thread_id.to_string(), cancel);
        state.depths.insert(thread_id.to_string(), depth);
    }

    /// Publish a result and wake waiters.
    pub fn complete(&self, thread_id: &str, result: Value) {
        {
            let mut state = self.state.lock().expect("table lock poisoned");
            state.results.insert(thread_id.to_string(), result);
            state.cancel_tokens.remove(thread_id);
            state.spawn_counts.remove(thread_id);
        }
        self.notify.notify_waiters();
    }

    /// In-process result, if the thread finished here.
    #[must_use]
    pub fn result(&self, thread_id: &str) -> Option<Value> {
        let state = self.state.lock().expect("table lock poisoned");
        state.results.get(thread_id).cloned()
    }

    /// Whether the thread is live in this process.
    #[must_use]
    pub fn is_live(&self, thread_id: &str) -> bool {
        let state = self.state.lock().expect("table lock poisoned");
        state.cancel_tokens.contains_key(thread_id)
    }

    /// Live thread ids.
    #[must_use]
    pub fn live_threads(&self) -> Vec<String> {
        let state = self.state.lock().expect("table lock poisoned");
        let mut ids: Vec<String> = state.cancel_tokens.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel token for a live thread.
    #[must_use]
    pub fn cancel_token(&self, thread_id: &str) -> Option<CancellationToken> {
        let state = self.state.lock().expect("table lock poisoned");
        state.cancel_tokens.get(thread_id).cloned()
    }

    /// Depth of a thread (0 when unknown).
    #[must_use]
    pub fn depth(&self, thread_id: &str) -> u32 {
        let state = self.state.lock().expect("table lock poisoned");
        state.depths.get(thread_id).copied().unwrap_or(0)
    }

    /// Current spawn count for a parent.
    #[must_use]
    pub fn spawn_count(&self, parent_id: &str) -> u32 {
        let state = self.state.lock().expect("table lock poisoned");
        state.spawn_counts.get(parent_id).copied().unwrap_or(0)
    }

    /// Increment and return a parent's spawn count.
    pub fn increment_spawn_count(&self, parent_id: &str) -> u32 {
        let mut state = self.state.lock().expect("table lock poisoned");
        let count = state.spawn_counts.entry(parent_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Wait until the thread has an in-process result or the deadline
    /// passes. Returns the result, or `None` on timeout.
    pub async fn wait_for(
        &self,
        thread_id: &str,
        deadline: tokio::time::Instant,
    ) -> Option<Value> {
        loop {
            if let Some(result) = self.result(thread_id) {
                return Some(result);
            }
            let notified = self.notify.notified();
            tokio::select! {
                () = notified => {}
                // Bounded poll so a missed wakeup cannot hang the waiter.
                () = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
                () = tokio::time::sleep_until(deadline) => return self.result(thread_id),
            }
        }
    }

    /// The shared waiter notifier (for tests).
    #[must_use]
    pub fn notifier(&self) -> &Notify {
        &self.notify
    }

    /// Make a table shareable.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}
