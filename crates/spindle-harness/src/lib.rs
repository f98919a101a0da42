// SPDX-License-Identifier: MIT OR Apache-2.0
//! Safety harness for the spindle kernel.
//!
//! Constructed per thread, the harness derives the thread's effective
//! capability set (attenuating against the parent), classifies capability
//! risk, enforces cost limits at turn boundaries, checks permissions before
//! every tool dispatch, evaluates hooks at named checkpoints, and carries
//! the cooperative cancellation token.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod condition;
mod cost;
mod harness;
mod hooks;
mod risk;

pub use cancel::CancellationToken;
pub use condition::{evaluate_condition, interpolate, lookup_path};
pub use cost::CostTracker;
pub use harness::{LimitEvent, PermissionDenial, SafetyHarness};
pub use hooks::{HookContext, HookEngine};
pub use risk::{RiskViolation, assess_capability_risk};
