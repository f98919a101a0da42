// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed views over the cascaded configuration files.

use serde::{Deserialize, Serialize};
use spindle_core::Hook;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// resilience.yaml
// ---------------------------------------------------------------------------

/// Retry backoff policy for retryable provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in seconds for the first retry.
    #[serde(default = "default_retry_base")]
    pub base: f64,
    /// Maximum retry attempts per turn.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Jitter fraction applied to the computed delay (0.0–1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Hard cap on a single computed delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
}

fn default_retry_base() -> f64 {
    1.0
}
fn default_max_attempts() -> u32 {
    3
}
fn default_jitter() -> f64 {
    0.1
}
fn default_max_delay() -> f64 {
    30.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: default_retry_base(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay for the given 1-based attempt: `base · 2^(attempt−1)`, capped
    /// at `max_delay`. Jitter (±`jitter` fraction, deterministic from the
    /// attempt number) keeps concurrent retries from stampeding.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> f64 {
        let attempt = attempt.max(1);
        let exp = self.base * 2f64.powi(attempt as i32 - 1);
        let capped = exp.min(self.max_delay);
        // Deterministic jitter in [-jitter, +jitter] derived from the attempt.
        let wobble = ((attempt as f64 * 0.618_033_988_749).fract() * 2.0 - 1.0) * self.jitter;
        (capped * (1.0 + wobble)).max(0.0)
    }
}

/// Limit defaults table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Limit name → default threshold. The set of keys defines the valid
    /// limit vocabulary; unknown keys in directives are rejected.
    #[serde(default = "default_limits")]
    pub defaults: BTreeMap<String, f64>,
}

fn default_limits() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("turns".to_string(), 30.0),
        ("tokens".to_string(), 400_000.0),
        ("spend".to_string(), 1.0),
        ("spawns".to_string(), 10.0),
        ("duration_seconds".to_string(), 1_800.0),
        ("depth".to_string(), 5.0),
    ])
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            defaults: default_limits(),
        }
    }
}

/// `resilience.yaml`: limit defaults + retry policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Limit vocabulary and defaults.
    #[serde(default)]
    pub limits: LimitsSection,
    /// Backoff policy for retryable provider errors.
    #[serde(default)]
    pub retry: RetryPolicy,
}

// ---------------------------------------------------------------------------
// capability_risk.yaml
// ---------------------------------------------------------------------------

/// What happens when a capability lands in a risk level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskPolicy {
    /// Silent.
    #[default]
    Allow,
    /// Logged warning, still runs.
    AcknowledgeRequired,
    /// Fails unless the directive acknowledges the risk by name.
    Block,
}

/// A named risk level and its policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLevel {
    /// Enforcement policy for this level.
    #[serde(default)]
    pub policy: RiskPolicy,
    /// Human description.
    #[serde(default)]
    pub description: String,
}

/// A capability-pattern → risk classification entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskClassification {
    /// Stable id for cascade merging.
    pub id: String,
    /// Risk level name this entry assigns.
    pub risk: String,
    /// Human description surfaced in errors and warnings.
    #[serde(default)]
    pub description: String,
    /// Capability patterns (dotted, `*` wildcards). Most-specific-wins by
    /// dot count across the whole table.
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// `capability_risk.yaml`: risk levels + classifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Risk level name → level definition.
    #[serde(default)]
    pub risk_levels: BTreeMap<String, RiskLevel>,
    /// Pattern table, id-keyed for cascade merging.
    #[serde(default)]
    pub classifications: Vec<RiskClassification>,
}

// ---------------------------------------------------------------------------
// hooks.yaml
// ---------------------------------------------------------------------------

/// `hooks.yaml`: the layered hook table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HooksConfig {
    /// All configured hooks, id-keyed for cascade merging.
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

// ---------------------------------------------------------------------------
// events.yaml
// ---------------------------------------------------------------------------

/// Per-event criticality routing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Event type → criticality (`critical` | `important` | `droppable`).
    #[serde(default)]
    pub events: BTreeMap<String, String>,
}

impl EventsConfig {
    /// Criticality for an event type; `important` when unconfigured.
    #[must_use]
    pub fn criticality(&self, event_type: &str) -> &str {
        self.events
            .get(event_type)
            .map_or("important", String::as_str)
    }
}

// ---------------------------------------------------------------------------
// coordination.yaml
// ---------------------------------------------------------------------------

/// Continuation / handoff tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationConfig {
    /// Context-usage ratio that triggers a handoff.
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: f64,
    /// Token budget for the trailing messages kept on resume.
    #[serde(default = "default_resume_ceiling")]
    pub resume_ceiling_tokens: u64,
    /// `strict` rejects unsigned trailing transcript bytes on resume;
    /// `lenient` tolerates them past the last intact checkpoint.
    #[serde(default = "default_integrity")]
    pub transcript_integrity: String,
}

fn default_trigger_threshold() -> f64 {
    0.9
}
fn default_resume_ceiling() -> u64 {
    16_000
}
fn default_integrity() -> String {
    "strict".to_string()
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            trigger_threshold: default_trigger_threshold(),
            resume_ceiling_tokens: default_resume_ceiling(),
            transcript_integrity: default_integrity(),
        }
    }
}

/// `wait_threads` tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Default wait timeout in seconds.
    #[serde(default = "default_wait_timeout")]
    pub default_timeout: f64,
}

fn default_wait_timeout() -> f64 {
    600.0
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_wait_timeout(),
        }
    }
}

/// `coordination.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Continuation / handoff tuning.
    #[serde(default)]
    pub continuation: ContinuationConfig,
    /// Wait tuning.
    #[serde(default)]
    pub wait_threads: WaitConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            base: 1.0,
            max_attempts: 5,
            jitter: 0.0,
            max_delay: 4.0,
        };
        assert!((policy.delay_for_attempt(1) - 1.0).abs() < 1e-9);
        assert!((policy.delay_for_attempt(2) - 2.0).abs() < 1e-9);
        assert!((policy.delay_for_attempt(3) - 4.0).abs() < 1e-9);
        // Capped from here on.
        assert!((policy.delay_for_attempt(6) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn retry_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for attempt in 1..=5 {
            let d = policy.delay_for_attempt(attempt);
            let nominal = (policy.base * 2f64.powi(attempt as i32 - 1)).min(policy.max_delay);
            assert!(d >= nominal * (1.0 - policy.jitter) - 1e-9);
            assert!(d <= nominal * (1.0 + policy.jitter) + 1e-9);
        }
    }

    #[test]
    fn default_limits_cover_the_vocabulary() {
        let limits = LimitsSection::default();
        for key in ["turns", "tokens", "spend", "spawns", "duration_seconds", "depth"] {
            assert!(limits.defaults.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn events_default_to_important() {
        let mut events = EventsConfig::default();
        assert_eq!(events.criticality("cognition_out"), "important");
        events
            .events
            .insert("thread_error".into(), "critical".into());
        assert_eq!(events.criticality("thread_error"), "critical");
    }

    #[test]
    fn risk_config_yaml_shape() {
        let yaml = r#"
risk_levels:
  dangerous:
    policy: block
    description: Arbitrary code execution
  elevated:
    policy: acknowledge_required
classifications:
  - id: shell
    risk: dangerous
    patterns: ["spindle.execute.tool.spindle.shell.*"]
"#;
        let config: RiskConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.risk_levels.get("dangerous").unwrap().policy,
            RiskPolicy::Block
        );
        assert_eq!(config.classifications.len(), 1);
    }
}
