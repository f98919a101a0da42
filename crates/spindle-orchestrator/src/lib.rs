// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thread orchestration for the spindle kernel.
//!
//! The [`Orchestrator`] is the global coordination surface: it runs the
//! thread-directive entry operation (load → verify → compose → reserve →
//! run or detach), tracks in-process threads for wait/cancel, kills
//! detached threads by PID, and drives the continuation machinery —
//! context-exhaustion handoffs and external resumes — over the durable
//! registry.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entry;
mod meta;
mod orchestrator;
mod spawn;
mod table;
mod tools;

pub use entry::{EntryInput, EntryInternal, EntryResult};
pub use meta::{read_thread_meta, verify_thread_meta, write_thread_meta};
pub use orchestrator::{Orchestrator, OrchestratorConfig, WaitResult};
pub use spawn::{kill_pid, spawn_detached};
pub use table::InProcessTable;
pub use tools::primary_tool_schemas;
