// SPDX-License-Identifier: MIT OR Apache-2.0
//! Risk classification of granted capabilities.

use spindle_config::{RiskConfig, RiskPolicy};
use std::collections::HashSet;

/// A capability that hit a `block` classification without acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskViolation {
    /// The offending capability.
    pub capability: String,
    /// Risk name that must be acknowledged.
    pub risk: String,
    /// Classification description.
    pub description: String,
}

impl std::fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "capability '{}' classified as '{}' ({}); acknowledge the risk \
             in the directive's permissions to explicitly allow this",
            self.capability, self.risk, self.description
        )
    }
}

/// Check granted capabilities against the risk classification table.
///
/// Most-specific-wins: for each capability, the matching pattern with the
/// highest dot count decides its classification, so broad patterns cannot
/// override narrow ones. `block` classifications fail unless the risk name
/// is acknowledged; `acknowledge_required` logs a warning but runs; `allow`
/// is silent.
///
/// # Errors
///
/// Returns the first [`RiskViolation`].
pub fn assess_capability_risk(
    capabilities: &[String],
    acknowledged: &HashSet<String>,
    config: &RiskConfig,
    thread_id: &str,
) -> Result<(), RiskViolation> {
    for cap in capabilities {
        let mut best: Option<(&spindle_config::RiskClassification, usize)> = None;
        for classification in &config.classifications {
            for pattern in &classification.patterns {
                if spindle_capability::cap_matches(pattern, cap) {
                    let specificity = pattern.matches('.').count();
                    if best.is_none_or(|(_, s)| specificity > s) {
                        best = Some((classification, specificity));
                    }
                }
            }
        }

        let Some((classification, _)) = best else {
            continue;
        };

        let policy = config
            .risk_levels
            .get(&classification.risk)
            .map_or(RiskPolicy::Allow, |level| level.policy);

        match policy {
            RiskPolicy::Allow => {}
            RiskPolicy::AcknowledgeRequired => {
                if !acknowledged.contains(&classification.risk) {
                    tracing::warn!(
                        target: "spindle.harness",
                        thread_id,
                        capability = %cap,
                        risk = %classification.risk,
                        "elevated capability granted without acknowledgment"
                    );
                }
            }
            RiskPolicy::Block => {
                if !acknowledged.contains(&classification.risk) {
                    return Err(RiskViolation {
                        capability: cap.clone(),
                        risk: classification.risk.clone(),
                        description: classification.description.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_config::{RiskClassification, RiskLevel};
    use std::collections::BTreeMap;

    fn config() -> RiskConfig {
        RiskConfig {
            risk_levels: BTreeMap::from([
                (
                    "dangerous".to_string(),
                    RiskLevel {
                        policy: RiskPolicy::Block,
                        description: "arbitrary code".into(),
                    },
                ),
                (
                    "elevated".to_string(),
                    RiskLevel {
                        policy: RiskPolicy::AcknowledgeRequired,
                        description: String::new(),
                    },
                ),
                (
                    "safe".to_string(),
                    RiskLevel {
                        policy: RiskPolicy::Allow,
                        description: String::new(),
                    },
                ),
            ]),
            classifications: vec![
                RiskClassification {
                    id: "broad".into(),
                    risk: "dangerous".into(),
                    description: "everything".into(),
                    patterns: vec!["spindle.*".into()],
                },
                RiskClassification {
                    id: "search-ok".into(),
                    risk: "safe".into(),
                    description: "read only".into(),
                    patterns: vec!["spindle.search.*".into()],
                },
                RiskClassification {
                    id: "spawn".into(),
                    risk: "elevated".into(),
                    description: "child threads".into(),
                    patterns: vec!["spindle.execute.tool.spindle.agent.threads.*".into()],
                },
            ],
        }
    }

    #[test]
    fn blocked_capability_without_ack_fails() {
        let err = assess_capability_risk(
            &["spindle.execute.tool.fs.write".to_string()],
            &HashSet::new(),
            &config(),
            "t",
        )
        .unwrap_err();
        assert_eq!(err.risk, "dangerous");
    }

    #[test]
    fn acknowledged_block_passes() {
        let acked = HashSet::from(["dangerous".to_string()]);
        assess_capability_risk(
            &["spindle.execute.tool.fs.write".to_string()],
            &acked,
            &config(),
            "t",
        )
        .unwrap();
    }

    #[test]
    fn most_specific_pattern_wins() {
        // `spindle.search.*` (safe, 2 dots) beats `spindle.*` (dangerous,
        // 1 dot) for search capabilities.
        assess_capability_risk(
            &["spindle.search.tool.fs.read".to_string()],
            &HashSet::new(),
            &config(),
            "t",
        )
        .unwrap();
    }

    #[test]
    fn acknowledge_required_runs_without_ack() {
        // `spawn` is elevated (5 dots) and beats the broad dangerous
        // pattern; no ack means a warning, not a failure.
        assess_capability_risk(
            &["spindle.execute.tool.spindle.agent.threads.thread_directive".to_string()],
            &HashSet::new(),
            &config(),
            "t",
        )
        .unwrap();
    }

    #[test]
    fn unclassified_capability_is_allowed() {
        assess_capability_risk(
            &["custom.execute.tool.x".to_string()],
            &HashSet::new(),
            &config(),
            "t",
        )
        .unwrap();
    }
}
