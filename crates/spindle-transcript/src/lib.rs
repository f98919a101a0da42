// SPDX-License-Identifier: MIT OR Apache-2.0
//! Crash-resilient transcript persistence for the spindle kernel.
//!
//! Each thread owns a directory containing `transcript.jsonl` (append-only,
//! line-flushed) and a human-readable knowledge markdown re-rendered from
//! the JSONL at checkpoint cadence. Checkpoints are detached signature
//! lines covering the cumulative byte range, enabling verified partial
//! replay. [`Transcript::reconstruct_messages`] folds the event stream back
//! into the provider-neutral message list.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod emitter;
mod guard;
mod knowledge;
mod signer;
mod transcript;

pub use emitter::EventEmitter;
pub use guard::{GuardConfig, ToolResultGuard};
pub use knowledge::render_knowledge;
pub use signer::{CheckpointVerification, TranscriptSigner};
pub use transcript::{Transcript, TranscriptError, TranscriptEvent};
