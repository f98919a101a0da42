// SPDX-License-Identifier: MIT OR Apache-2.0
//! Serialisable cost accounting shared by the harness, registry, and
//! transcript renderer.

use serde::{Deserialize, Serialize};

/// Accumulated cost of a thread so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    /// Completed provider turns.
    pub turns: u32,
    /// Prompt tokens billed across all turns.
    pub input_tokens: u64,
    /// Completion tokens billed across all turns.
    pub output_tokens: u64,
    /// Child threads spawned.
    pub spawns: u32,
    /// USD spend.
    pub spend: f64,
    /// Wall-clock seconds since the thread started.
    pub elapsed_seconds: f64,
}

impl Cost {
    /// Total tokens (input + output).
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold a single turn's usage into the running totals.
    pub fn add_turn_usage(&mut self, input_tokens: u64, output_tokens: u64, spend: f64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.spend += spend;
    }
}
