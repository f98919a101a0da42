// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable thread registry for the spindle kernel.
//!
//! The registry is the source of truth for completion status across
//! processes. Records carry parent links (for spawn-tree walks) and
//! continuation links (for handoff chains); secondary queries cover
//! `parent_id` and `status`. Writes are linearized per store behind the
//! lock and persisted with atomic temp-file renames.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spindle_core::{Cost, ThreadStatus};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A durable thread record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    /// Thread id (path-like).
    pub thread_id: String,
    /// Directive the thread executes.
    pub directive_id: String,
    /// Spawning parent, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Lifecycle status.
    pub status: ThreadStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Set when the thread reaches a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Serialized result payload (cost, outputs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Detached child's process id, when spawned async.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Effective capability strings at spawn time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_context: Vec<String>,
    /// Latest cost snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
    /// Successor thread after a handoff/resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_thread_id: Option<String>,
    /// Root of the continuation chain this thread belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_root_id: Option<String>,
    /// Predecessor thread in the continuation chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_thread_id: Option<String>,
}

/// Registry failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No record for the thread.
    #[error("thread not found: {thread_id}")]
    NotFound {
        /// Thread that was looked up.
        thread_id: String,
    },

    /// A record with this id already exists.
    #[error("thread already registered: {thread_id}")]
    AlreadyRegistered {
        /// Conflicting id.
        thread_id: String,
    },

    /// Registry file could not be read or written.
    #[error("registry io failure at {path}: {source}")]
    Io {
        /// Registry file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The registry file exists but does not parse.
    #[error("registry state corrupt at {path}: {reason}")]
    Corrupt {
        /// Registry file path.
        path: PathBuf,
        /// Parse failure detail.
        reason: String,
    },
}

type RegistryState = BTreeMap<String, ThreadRecord>;

/// File-backed thread registry.
pub struct ThreadRegistry {
    path: PathBuf,
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ThreadRegistry {
    /// Open (or create) the registry at
    /// `<project_root>/.ai/agent/threads/registry.json`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if an existing state file cannot be read
    /// or parsed.
    pub fn open(project_root: &Path) -> Result<Self, RegistryError> {
        let path = project_root
            .join(".ai")
            .join("agent")
            .join("threads")
            .join("registry.json");
        Self::open_at(path)
    }

    /// Open (or create) the registry at an explicit path.
    ///
    /// # Errors
    ///
    /// See [`ThreadRegistry::open`].
    pub fn open_at(path: PathBuf) -> Result<Self, RegistryError> {
        let state = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|e| RegistryError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            RegistryState::new()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &RegistryState) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        let json =
            serde_json::to_string_pretty(state).expect("registry state is always serialisable");
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| RegistryError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| RegistryError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn mutate<F>(&self, thread_id: &str, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut ThreadRecord),
    {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let record = state
            .get_mut(thread_id)
            .ok_or_else(|| RegistryError::NotFound {
                thread_id: thread_id.to_string(),
            })?;
        f(record);
        record.updated_at = Utc::now();
        self.persist(&state)
    }

    /// Register a new thread in `created` status. Idempotent on retries
    /// with the same id and directive.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyRegistered`] when the id exists for a
    /// different directive.
    pub fn register(
        &self,
        thread_id: &str,
        directive_id: &str,
        parent_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        if let Some(existing) = state.get(thread_id) {
            if existing.directive_id == directive_id {
                return Ok(());
            }
            return Err(RegistryError::AlreadyRegistered {
                thread_id: thread_id.to_string(),
            });
        }
        let now = Utc::now();
        state.insert(
            thread_id.to_string(),
            ThreadRecord {
                thread_id: thread_id.to_string(),
                directive_id: directive_id.to_string(),
                parent_id: parent_id.map(ToString::to_string),
                status: ThreadStatus::Created,
                created_at: now,
                updated_at: now,
                completed_at: None,
                result: None,
                pid: None,
                permission_context: Vec::new(),
                cost: None,
                continuation_thread_id: None,
                chain_root_id: None,
                previous_thread_id: None,
            },
        );
        self.persist(&state)
    }

    /// Transition a thread's status. Terminal statuses set `completed_at`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`].
    pub fn update_status(&self, thread_id: &str, status: ThreadStatus) -> Result<(), RegistryError> {
        self.mutate(thread_id, |record| {
            record.status = status;
            if status.is_terminal() {
                record.completed_at = Some(Utc::now());
            }
        })
    }

    /// Store a thread's result payload.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`].
    pub fn set_result(&self, thread_id: &str, result: serde_json::Value) -> Result<(), RegistryError> {
        self.mutate(thread_id, |record| record.result = Some(result))
    }

    /// Record a detached child's PID.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`].
    pub fn set_pid(&self, thread_id: &str, pid: u32) -> Result<(), RegistryError> {
        self.mutate(thread_id, |record| record.pid = Some(pid))
    }

    /// Record the effective capabilities minted for the thread.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`].
    pub fn set_permission_context(
        &self,
        thread_id: &str,
        caps: Vec<String>,
    ) -> Result<(), RegistryError> {
        self.mutate(thread_id, |record| record.permission_context = caps)
    }

    /// Update the cost snapshot (best-effort, post-turn).
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`].
    pub fn update_cost_snapshot(&self, thread_id: &str, cost: Cost) -> Result<(), RegistryError> {
        self.mutate(thread_id, |record| record.cost = Some(cost))
    }

    /// Link a finished thread to its continuation. Completed records are
    /// immutable except for this link.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`].
    pub fn set_continuation(&self, from: &str, to: &str) -> Result<(), RegistryError> {
        self.mutate(from, |record| {
            record.continuation_thread_id = Some(to.to_string());
        })
    }

    /// Record chain linkage on a continuation thread.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`].
    pub fn set_chain_info(
        &self,
        thread_id: &str,
        chain_root_id: &str,
        previous_thread_id: &str,
    ) -> Result<(), RegistryError> {
        self.mutate(thread_id, |record| {
            record.chain_root_id = Some(chain_root_id.to_string());
            record.previous_thread_id = Some(previous_thread_id.to_string());
        })
    }

    /// Fetch a record.
    #[must_use]
    pub fn get_thread(&self, thread_id: &str) -> Option<ThreadRecord> {
        let state = self.state.lock().expect("registry lock poisoned");
        state.get(thread_id).cloned()
    }

    /// Walk the continuation chain containing `thread_id`, root first.
    ///
    /// Cycles terminate at the first revisited id.
    #[must_use]
    pub fn get_chain(&self, thread_id: &str) -> Vec<ThreadRecord> {
        let state = self.state.lock().expect("registry lock poisoned");

        // Walk back to the root.
        let mut root = thread_id.to_string();
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(record) = state.get(&root) {
            if !visited.insert(root.clone()) {
                break;
            }
            match &record.previous_thread_id {
                Some(prev) if !visited.contains(prev) => root = prev.clone(),
                _ => break,
            }
        }

        // Walk forward collecting records.
        let mut chain = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut current = root;
        while let Some(record) = state.get(&current) {
            if !seen.insert(current.clone()) {
                break;
            }
            chain.push(record.clone());
            match &record.continuation_thread_id {
                Some(next) => current = next.clone(),
                None => break,
            }
        }
        chain
    }

    /// Threads not yet in a terminal status, newest first.
    #[must_use]
    pub fn list_active(&self) -> Vec<ThreadRecord> {
        let state = self.state.lock().expect("registry lock poisoned");
        let mut active: Vec<ThreadRecord> = state
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        active
    }

    /// Children of a thread, oldest first.
    #[must_use]
    pub fn list_children(&self, parent_id: &str) -> Vec<ThreadRecord> {
        let state = self.state.lock().expect("registry lock poisoned");
        let mut children: Vec<ThreadRecord> = state
            .values()
            .filter(|r| r.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, ThreadRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = ThreadRegistry::open(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn register_and_fetch() {
        let (_dir, reg) = registry();
        reg.register("t1", "spindle/agent/review", None).unwrap();
        let record = reg.get_thread("t1").unwrap();
        assert_eq!(record.status, ThreadStatus::Created);
        assert_eq!(record.directive_id, "spindle/agent/review");
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn register_is_idempotent_for_same_directive() {
        let (_dir, reg) = registry();
        reg.register("t1", "d", None).unwrap();
        reg.register("t1", "d", None).unwrap();
        assert!(matches!(
            reg.register("t1", "other", None),
            Err(RegistryError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn terminal_status_sets_completed_at() {
        let (_dir, reg) = registry();
        reg.register("t1", "d", None).unwrap();
        reg.update_status("t1", ThreadStatus::Running).unwrap();
        assert!(reg.get_thread("t1").unwrap().completed_at.is_none());
        reg.update_status("t1", ThreadStatus::Completed).unwrap();
        assert!(reg.get_thread("t1").unwrap().completed_at.is_some());
    }

    #[test]
    fn children_and_active_queries() {
        let (_dir, reg) = registry();
        reg.register("p", "d", None).unwrap();
        reg.register("p/c1", "d", Some("p")).unwrap();
        reg.register("p/c2", "d", Some("p")).unwrap();
        reg.update_status("p/c1", ThreadStatus::Completed).unwrap();

        let children = reg.list_children("p");
        assert_eq!(children.len(), 2);

        let active: Vec<String> = reg.list_active().into_iter().map(|r| r.thread_id).collect();
        assert!(active.contains(&"p".to_string()));
        assert!(active.contains(&"p/c2".to_string()));
        assert!(!active.contains(&"p/c1".to_string()));
    }

    #[test]
    fn continuation_chain_walks_root_first() {
        let (_dir, reg) = registry();
        reg.register("t1", "d", None).unwrap();
        reg.register("t2", "d", None).unwrap();
        reg.register("t3", "d", None).unwrap();

        reg.update_status("t1", ThreadStatus::Continued).unwrap();
        reg.set_continuation("t1", "t2").unwrap();
        reg.set_chain_info("t2", "t1", "t1").unwrap();

        reg.update_status("t2", ThreadStatus::Continued).unwrap();
        reg.set_continuation("t2", "t3").unwrap();
        reg.set_chain_info("t3", "t1", "t2").unwrap();

        // From any member, the chain is identical and root-first.
        for start in ["t1", "t2", "t3"] {
            let ids: Vec<String> = reg.get_chain(start).into_iter().map(|r| r.thread_id).collect();
            assert_eq!(ids, vec!["t1", "t2", "t3"], "start={start}");
        }
        assert_eq!(
            reg.get_thread("t3").unwrap().chain_root_id.as_deref(),
            Some("t1")
        );
    }

    #[test]
    fn chain_cycle_terminates() {
        let (_dir, reg) = registry();
        reg.register("a", "d", None).unwrap();
        reg.register("b", "d", None).unwrap();
        reg.set_continuation("a", "b").unwrap();
        reg.set_continuation("b", "a").unwrap();

        let chain = reg.get_chain("a");
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let reg = ThreadRegistry::open(dir.path()).unwrap();
            reg.register("t", "d", None).unwrap();
            reg.set_pid("t", 4242).unwrap();
            reg.set_result("t", serde_json::json!({"cost": {"turns": 2}}))
                .unwrap();
        }
        let reopened = ThreadRegistry::open(dir.path()).unwrap();
        let record = reopened.get_thread("t").unwrap();
        assert_eq!(record.pid, Some(4242));
        assert!(record.result.is_some());
    }

    #[test]
    fn missing_thread_is_typed() {
        let (_dir, reg) = registry();
        assert!(matches!(
            reg.update_status("ghost", ThreadStatus::Running),
            Err(RegistryError::NotFound { .. })
        ));
    }
}
