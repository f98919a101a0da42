// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tool-result guarding.
//!
//! Before a tool output rejoins the conversation, outputs larger than the
//! byte budget are written to the thread's artifact directory and replaced
//! with a reference string. The budget tightens as the context window
//! fills; duplicate outputs (by content hash) reuse the stored artifact.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Guard tuning.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Byte budget when the context is empty.
    pub base_budget_bytes: usize,
    /// Floor the budget never tightens below, as a fraction of base.
    pub min_budget_fraction: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            base_budget_bytes: 16_384,
            min_budget_fraction: 0.25,
        }
    }
}

/// Per-thread tool-result guard with content-hash deduplication.
pub struct ToolResultGuard {
    artifacts_dir: PathBuf,
    config: GuardConfig,
    seen: Mutex<HashMap<String, PathBuf>>,
}

impl std::fmt::Debug for ToolResultGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolResultGuard")
            .field("artifacts_dir", &self.artifacts_dir)
            .finish_non_exhaustive()
    }
}

impl ToolResultGuard {
    /// Build a guard writing artifacts under `<thread_dir>/artifacts/`.
    #[must_use]
    pub fn new(thread_dir: impl Into<PathBuf>, config: GuardConfig) -> Self {
        Self {
            artifacts_dir: thread_dir.into().join("artifacts"),
            config,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn budget_at(&self, context_usage_ratio: f64) -> usize {
        let scale = (1.0 - context_usage_ratio).clamp(self.config.min_budget_fraction, 1.0);
        (self.config.base_budget_bytes as f64 * scale) as usize
    }

    fn char_floor(text: &str, n: usize) -> usize {
        let mut i = n.min(text.len());
        while i > 0 && !text.is_char_boundary(i) {
            i -= 1;
        }
        i
    }

    /// Guard a tool result against the current context usage.
    ///
    /// Returns the text to append to the conversation: either the original
    /// output or a reference to the stored artifact.
    pub fn guard(
        &self,
        output: &str,
        tool_name: &str,
        context_usage_ratio: f64,
    ) -> String {
        let budget = self.budget_at(context_usage_ratio);
        if output.len() <= budget {
            return output.to_string();
        }

        let mut hasher = Sha256::new();
        hasher.update(output.as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .take(8)
            .map(|b| format!("{b:02x}"))
            .collect();

        let path = {
            let mut seen = self.seen.lock().expect("guard lock poisoned");
            if let Some(existing) = seen.get(&hash) {
                existing.clone()
            } else {
                let path = self.artifacts_dir.join(format!("{hash}.txt"));
                if std::fs::create_dir_all(&self.artifacts_dir).is_ok()
                    && std::fs::write(&path, output).is_ok()
                {
                    seen.insert(hash.clone(), path.clone());
                    path
                } else {
                    // Storage failed: fall back to hard truncation so the
                    // conversation still fits.
                    tracing::warn!(target: "spindle.transcript", %tool_name, "artifact write failed, truncating result");
                    return format!(
                        "{}\n... (truncated, {} bytes total)",
                        &output[..Self::char_floor(output, budget)],
                        output.len()
                    );
                }
            }
        };

        let preview_len = Self::char_floor(output, budget.min(512));
        format!(
            "{}\n... [large {} result stored as artifact: {} ({} bytes); load it if needed]",
            &output[..preview_len],
            tool_name,
            path.display(),
            output.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn guard(base: usize) -> (TempDir, ToolResultGuard) {
        let dir = TempDir::new().unwrap();
        let g = ToolResultGuard::new(
            dir.path(),
            GuardConfig {
                base_budget_bytes: base,
                min_budget_fraction: 0.25,
            },
        );
        (dir, g)
    }

    #[test]
    fn small_results_pass_through() {
        let (_dir, g) = guard(100);
        assert_eq!(g.guard("short", "t", 0.0), "short");
    }

    #[test]
    fn large_results_become_references() {
        let (dir, g) = guard(16);
        let big = "x".repeat(100);
        let guarded = g.guard(&big, "spindle_execute", 0.0);
        assert!(guarded.contains("stored as artifact"));
        assert!(guarded.contains("100 bytes"));
        // The artifact holds the full output.
        let artifacts: Vec<_> = std::fs::read_dir(dir.path().join("artifacts"))
            .unwrap()
            .collect();
        assert_eq!(artifacts.len(), 1);
    }

    #[test]
    fn duplicates_reuse_the_artifact() {
        let (dir, g) = guard(16);
        let big = "y".repeat(100);
        g.guard(&big, "t", 0.0);
        g.guard(&big, "t", 0.0);
        let artifacts: Vec<_> = std::fs::read_dir(dir.path().join("artifacts"))
            .unwrap()
            .collect();
        assert_eq!(artifacts.len(), 1);
    }

    #[test]
    fn budget_tightens_as_context_fills() {
        let (_dir, g) = guard(100);
        let medium = "z".repeat(60);
        // Fits when the window is empty…
        assert_eq!(g.guard(&medium, "t", 0.0), medium);
        // …but not when it is nearly full (budget floors at 25).
        assert!(g.guard(&medium, "t", 0.95).contains("stored as artifact"));
    }
}
