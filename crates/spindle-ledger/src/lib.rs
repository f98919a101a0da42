// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable budget ledger for the spindle kernel.
//!
//! Tracks parent/child cost reservations with single-writer discipline:
//! every mutation happens behind the store lock and is persisted with an
//! atomic temp-file rename, so concurrent reserves on the same parent
//! serialise and the first commit wins on insufficient funds.
//!
//! Invariants: `actual ≤ reserved` (clamped on overage); child spend
//! cascades upward by adding to each ancestor's `actual`, each clamped
//! independently. Failures surface as typed errors, never silent
//! overspend.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Ledger entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Reservation is live.
    Active,
    /// Thread finished; remaining reservation is unavailable.
    Released,
}

/// One thread's budget entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Owning thread.
    pub thread_id: String,
    /// Parent thread, when reserved out of a parent's budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<String>,
    /// Amount reserved at registration.
    pub reserved: f64,
    /// Spend reported so far, clamped to `reserved`.
    pub actual: f64,
    /// Hard spend ceiling (equals `reserved` for root entries).
    pub max_spend: f64,
    /// Entry status.
    pub status: EntryStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Remaining budget: `reserved − actual` for active entries, else 0.
    #[must_use]
    pub fn remaining(&self) -> f64 {
        match self.status {
            EntryStatus::Active => (self.reserved - self.actual).max(0.0),
            EntryStatus::Released => 0.0,
        }
    }
}

/// Ledger failures.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Thread has no ledger entry.
    #[error("no budget ledger entry for thread: {thread_id}")]
    NotRegistered {
        /// Thread that was looked up.
        thread_id: String,
    },

    /// Parent cannot afford the requested reservation.
    #[error(
        "insufficient budget: parent={parent_id} remaining={remaining:.6} requested={requested:.6}"
    )]
    Insufficient {
        /// Parent whose budget was consulted.
        parent_id: String,
        /// Parent's remaining budget at decision time.
        remaining: f64,
        /// Amount requested.
        requested: f64,
    },

    /// The ledger file could not be read or written.
    #[error("ledger io failure at {path}: {source}")]
    Io {
        /// Ledger file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The ledger file exists but does not parse.
    #[error("ledger state corrupt at {path}: {reason}")]
    Corrupt {
        /// Ledger file path.
        path: PathBuf,
        /// Parse failure detail.
        reason: String,
    },
}

type LedgerState = BTreeMap<String, LedgerEntry>;

/// File-backed budget ledger with single-writer discipline.
pub struct BudgetLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl BudgetLedger {
    /// Open (or create) the ledger at
    /// `<project_root>/.ai/agent/threads/budget_ledger.json`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if an existing state file cannot be read or
    /// parsed.
    pub fn open(project_root: &Path) -> Result<Self, LedgerError> {
        let path = project_root
            .join(".ai")
            .join("agent")
            .join("threads")
            .join("budget_ledger.json");
        Self::open_at(path)
    }

    /// Open (or create) the ledger at an explicit path.
    ///
    /// # Errors
    ///
    /// See [`BudgetLedger::open`].
    pub fn open_at(path: PathBuf) -> Result<Self, LedgerError> {
        let state = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|e| LedgerError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            LedgerState::new()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &LedgerState) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        let json =
            serde_json::to_string_pretty(state).expect("ledger state is always serialisable");
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| LedgerError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Create an active root entry. Idempotent on same-id retries.
    ///
    /// # Errors
    ///
    /// Persistence failures only.
    pub fn register(&self, thread_id: &str, max_spend: f64) -> Result<(), LedgerError> {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        let now = Utc::now();
        state
            .entry(thread_id.to_string())
            .and_modify(|e| e.updated_at = now)
            .or_insert_with(|| LedgerEntry {
                thread_id: thread_id.to_string(),
                parent_thread_id: None,
                reserved: max_spend,
                actual: 0.0,
                max_spend,
                status: EntryStatus::Active,
                created_at: now,
                updated_at: now,
            });
        self.persist(&state)
    }

    /// Reserve `amount` for a child out of `parent_id`'s budget.
    ///
    /// Serialised behind the store lock: concurrent reserves on the same
    /// parent observe each other and the first commit wins. Retrying the
    /// same `(child_id, amount, parent_id)` is idempotent — no
    /// double-accounting.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Insufficient`] when the parent's remaining budget
    /// cannot cover `amount`.
    pub fn reserve(
        &self,
        child_id: &str,
        amount: f64,
        parent_id: &str,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().expect("ledger lock poisoned");

        // Idempotent retry: the identical reservation already exists.
        if let Some(existing) = state.get(child_id) {
            if existing.parent_thread_id.as_deref() == Some(parent_id)
                && (existing.reserved - amount).abs() < f64::EPSILON
            {
                return Ok(());
            }
        }

        if let Some(parent) = state.get(parent_id) {
            let remaining = parent.remaining();
            if remaining < amount {
                return Err(LedgerError::Insufficient {
                    parent_id: parent_id.to_string(),
                    remaining,
                    requested: amount,
                });
            }
        }

        let now = Utc::now();
        state.insert(
            child_id.to_string(),
            LedgerEntry {
                thread_id: child_id.to_string(),
                parent_thread_id: Some(parent_id.to_string()),
                reserved: amount,
                actual: 0.0,
                max_spend: amount,
                status: EntryStatus::Active,
                created_at: now,
                updated_at: now,
            },
        );
        self.persist(&state)
    }

    /// Add `amount` to a thread's actual spend, clamped to its reservation.
    ///
    /// Returns the overspend excess (≥ 0) that was clamped away.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotRegistered`] when the thread has no entry.
    pub fn report_actual(&self, thread_id: &str, amount: f64) -> Result<f64, LedgerError> {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        let entry = state
            .get_mut(thread_id)
            .ok_or_else(|| LedgerError::NotRegistered {
                thread_id: thread_id.to_string(),
            })?;
        let requested_total = entry.actual + amount;
        let excess = (requested_total - entry.reserved).max(0.0);
        entry.actual = requested_total.min(entry.reserved);
        entry.updated_at = Utc::now();
        self.persist(&state)?;
        Ok(excess)
    }

    /// Cascade a child's spend into the parent's `actual` (clamped).
    ///
    /// Called in finalization after the child reports. A released or
    /// missing parent is a no-op: the spend was already accounted when the
    /// parent finished.
    ///
    /// # Errors
    ///
    /// Persistence failures only.
    pub fn cascade_spend(
        &self,
        _child_id: &str,
        parent_id: &str,
        amount: f64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        if let Some(parent) = state.get_mut(parent_id) {
            if parent.status == EntryStatus::Active {
                parent.actual = (parent.actual + amount).min(parent.reserved);
                parent.updated_at = Utc::now();
            }
        }
        self.persist(&state)
    }

    /// Release a thread's remaining reservation.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotRegistered`] when the thread has no entry.
    pub fn release(&self, thread_id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().expect("ledger lock poisoned");
        let entry = state
            .get_mut(thread_id)
            .ok_or_else(|| LedgerError::NotRegistered {
                thread_id: thread_id.to_string(),
            })?;
        entry.status = EntryStatus::Released;
        entry.updated_at = Utc::now();
        self.persist(&state)
    }

    /// Remaining budget: `reserved − actual` for active entries, else 0.
    /// `None` when the thread has no entry.
    #[must_use]
    pub fn get_remaining(&self, thread_id: &str) -> Option<f64> {
        let state = self.state.lock().expect("ledger lock poisoned");
        state.get(thread_id).map(LedgerEntry::remaining)
    }

    /// Full entry snapshot.
    #[must_use]
    pub fn get_entry(&self, thread_id: &str) -> Option<LedgerEntry> {
        let state = self.state.lock().expect("ledger lock poisoned");
        state.get(thread_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, BudgetLedger) {
        let dir = TempDir::new().unwrap();
        let ledger = BudgetLedger::open(dir.path()).unwrap();
        (dir, ledger)
    }

    #[test]
    fn register_and_remaining() {
        let (_dir, ledger) = ledger();
        ledger.register("root", 1.0).unwrap();
        assert_eq!(ledger.get_remaining("root"), Some(1.0));
        assert_eq!(ledger.get_remaining("ghost"), None);
    }

    #[test]
    fn report_actual_clamps_and_returns_excess() {
        let (_dir, ledger) = ledger();
        ledger.register("t", 0.5).unwrap();
        let excess = ledger.report_actual("t", 0.6).unwrap();
        assert!((excess - 0.1).abs() < 1e-12);
        let entry = ledger.get_entry("t").unwrap();
        assert!((entry.actual - 0.5).abs() < 1e-12);
    }

    #[test]
    fn report_actual_adds_not_overwrites() {
        let (_dir, ledger) = ledger();
        ledger.register("t", 1.0).unwrap();
        ledger.report_actual("t", 0.2).unwrap();
        ledger.report_actual("t", 0.3).unwrap();
        assert!((ledger.get_entry("t").unwrap().actual - 0.5).abs() < 1e-12);
    }

    #[test]
    fn budget_cascade_scenario() {
        // Parent reserved 1.0; C1 reserves 0.4, C2 reserves 0.5. C2 reports
        // 0.6 (clamped to 0.5), cascades 0.5 to the parent. A third spawn
        // asking 0.6 fails.
        let (_dir, ledger) = ledger();
        ledger.register("p", 1.0).unwrap();
        ledger.reserve("c1", 0.4, "p").unwrap();
        ledger.reserve("c2", 0.5, "p").unwrap();

        let excess = ledger.report_actual("c2", 0.6).unwrap();
        assert!((excess - 0.1).abs() < 1e-12);
        let c2_actual = ledger.get_entry("c2").unwrap().actual;
        ledger.cascade_spend("c2", "p", c2_actual).unwrap();
        ledger.release("c2").unwrap();

        assert!((ledger.get_remaining("p").unwrap() - 0.5).abs() < 1e-12);
        let err = ledger.reserve("c3", 0.6, "p").unwrap_err();
        assert!(matches!(err, LedgerError::Insufficient { .. }));
    }

    #[test]
    fn reserve_is_idempotent_on_retry() {
        let (_dir, ledger) = ledger();
        ledger.register("p", 1.0).unwrap();
        ledger.reserve("c", 0.4, "p").unwrap();
        ledger.reserve("c", 0.4, "p").unwrap();
        let entry = ledger.get_entry("c").unwrap();
        assert!((entry.reserved - 0.4).abs() < 1e-12);
        assert!((entry.actual - 0.0).abs() < 1e-12);
    }

    #[test]
    fn released_entry_has_no_remaining() {
        let (_dir, ledger) = ledger();
        ledger.register("t", 1.0).unwrap();
        ledger.release("t").unwrap();
        assert_eq!(ledger.get_remaining("t"), Some(0.0));
    }

    #[test]
    fn cascade_to_released_parent_is_a_noop() {
        let (_dir, ledger) = ledger();
        ledger.register("p", 1.0).unwrap();
        ledger.release("p").unwrap();
        ledger.cascade_spend("c", "p", 0.5).unwrap();
        assert!((ledger.get_entry("p").unwrap().actual - 0.0).abs() < 1e-12);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = BudgetLedger::open(dir.path()).unwrap();
            ledger.register("p", 1.0).unwrap();
            ledger.reserve("c", 0.3, "p").unwrap();
            ledger.report_actual("c", 0.1).unwrap();
        }
        let reopened = BudgetLedger::open(dir.path()).unwrap();
        let entry = reopened.get_entry("c").unwrap();
        assert!((entry.reserved - 0.3).abs() < 1e-12);
        assert!((entry.actual - 0.1).abs() < 1e-12);
        assert_eq!(entry.parent_thread_id.as_deref(), Some("p"));
    }

    #[test]
    fn report_on_unregistered_thread_is_typed() {
        let (_dir, ledger) = ledger();
        assert!(matches!(
            ledger.report_actual("ghost", 0.1),
            Err(LedgerError::NotRegistered { .. })
        ));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        /// `actual ≤ reserved` holds under any sequence of reports.
        #[test]
        fn actual_never_exceeds_reserved(
            reserved in 0.01f64..10.0,
            reports in prop::collection::vec(0.0f64..5.0, 0..10),
        ) {
            let dir = TempDir::new().unwrap();
            let ledger = BudgetLedger::open(dir.path()).unwrap();
            ledger.register("t", reserved).unwrap();
            for amount in reports {
                ledger.report_actual("t", amount).unwrap();
                let entry = ledger.get_entry("t").unwrap();
                prop_assert!(entry.actual <= entry.reserved + 1e-9);
            }
        }

        /// Cascaded child spend never pushes a parent past its reservation.
        #[test]
        fn cascade_respects_parent_clamp(
            child_spends in prop::collection::vec(0.0f64..2.0, 1..8),
        ) {
            let dir = TempDir::new().unwrap();
            let ledger = BudgetLedger::open(dir.path()).unwrap();
            ledger.register("p", 1.0).unwrap();
            for (i, spend) in child_spends.iter().enumerate() {
                let child = format!("c{i}");
                // Children may individually overreport; the parent clamp is
                // independent.
                if ledger.reserve(&child, 0.5, "p").is_ok() {
                    ledger.report_actual(&child, *spend).unwrap();
                    let actual = ledger.get_entry(&child).unwrap().actual;
                    ledger.cascade_spend(&child, "p", actual).unwrap();
                }
            }
            let parent = ledger.get_entry("p").unwrap();
            prop_assert!(parent.actual <= parent.reserved + 1e-9);
        }
    }
}
