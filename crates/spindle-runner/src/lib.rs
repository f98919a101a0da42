// SPDX-License-Identifier: MIT OR Apache-2.0
//! The LLM loop.
//!
//! Drives a thread from first message to finalization: assembles the system
//! prompt and first user message from hooks and directive context, calls
//! the provider (streaming when supported, fanning raw events to sinks),
//! dispatches tool calls through the dispatcher with permission checks on
//! the inner action, honors error-hook retries with computed backoff,
//! detects completion, limits, and context-window exhaustion, and
//! finalizes with signed transcript state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod context;
mod outcome;
mod runner;
mod sink;

pub use context::extract_error_context;
pub use outcome::RunOutcome;
pub use runner::{RunnerOptions, ThreadCoordinator, ThreadRunner};
pub use sink::RawStreamLog;
