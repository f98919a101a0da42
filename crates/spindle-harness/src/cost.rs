// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thread-safe cost accumulation.

use spindle_core::Cost;
use std::sync::Mutex;
use std::time::Instant;

/// Accumulates a thread's cost across turns.
///
/// Wall-clock duration is measured from construction; snapshots carry it in
/// `elapsed_seconds`.
pub struct CostTracker {
    cost: Mutex<Cost>,
    start: Instant,
}

impl std::fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostTracker")
            .field("cost", &self.snapshot())
            .finish()
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostTracker {
    /// Start tracking at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cost: Mutex::new(Cost::default()),
            start: Instant::now(),
        }
    }

    /// Resume tracking from a restored cost snapshot.
    #[must_use]
    pub fn from_snapshot(cost: Cost) -> Self {
        Self {
            cost: Mutex::new(cost),
            start: Instant::now(),
        }
    }

    /// Increment the turn counter. Called once per provider call that
    /// succeeds or is charged; error-hook retries do not pass through here.
    pub fn begin_turn(&self) -> u32 {
        let mut cost = self.cost.lock().expect("cost lock poisoned");
        cost.turns += 1;
        cost.turns
    }

    /// Fold one turn's usage into the totals.
    pub fn add_usage(&self, input_tokens: u64, output_tokens: u64, spend: f64) {
        let mut cost = self.cost.lock().expect("cost lock poisoned");
        cost.add_turn_usage(input_tokens, output_tokens, spend);
    }

    /// Record a child spawn.
    pub fn increment_spawns(&self) -> u32 {
        let mut cost = self.cost.lock().expect("cost lock poisoned");
        cost.spawns += 1;
        cost.spawns
    }

    /// Current cost with up-to-date elapsed seconds.
    #[must_use]
    pub fn snapshot(&self) -> Cost {
        let mut cost = self.cost.lock().expect("cost lock poisoned").clone();
        cost.elapsed_seconds = self.start.elapsed().as_secs_f64();
        cost
    }
}
