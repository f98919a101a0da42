// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Capability calculus for the spindle kernel.
//!
//! A capability is a dotted string of the form
//! `<root>.<primary>.<item_type>.<specifics…>` or any prefix of it, with `*`
//! allowed as a wildcard at any position. This crate provides parsing, the
//! fixed primary-implication lattice (`execute ⇒ {search, load}`,
//! `sign ⇒ {load}`), segment-aware matching, set checking, and token
//! attenuation.
//!
//! Matching is segment-aware by construction — never plain glob — so a
//! `*.*` pattern cannot accidentally dominate unrelated namespaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// The reserved root namespace. Capabilities under this root are system
/// capabilities and cannot be minted by directives without explicit risk
/// acknowledgment.
pub const SYSTEM_ROOT: &str = "spindle";

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// A capability split into its segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCapability {
    /// Root namespace segment (e.g. `spindle`).
    pub root: String,
    /// Primary action segment, `*` when wildcarded or elided.
    pub primary: String,
    /// Item type segment, `*` when wildcarded or elided.
    pub item_type: String,
    /// Remaining dotted specifics, empty when elided.
    pub specifics: String,
    /// Whether any segment is (or is implied to be) a wildcard.
    pub is_wildcard: bool,
}

/// Split a capability string into its canonical parts.
///
/// A prefix form (`spindle.execute`) implies wildcards for the elided
/// segments.
///
/// # Examples
///
/// ```
/// use spindle_capability::parse_capability;
///
/// let p = parse_capability("spindle.execute.tool.spindle.file-system.fs_write");
/// assert_eq!(p.primary, "execute");
/// assert_eq!(p.item_type, "tool");
/// assert_eq!(p.specifics, "spindle.file-system.fs_write");
/// assert!(!p.is_wildcard);
///
/// let p = parse_capability("spindle.execute");
/// assert_eq!(p.item_type, "*");
/// assert!(p.is_wildcard);
/// ```
#[must_use]
pub fn parse_capability(cap: &str) -> ParsedCapability {
    let segments: Vec<&str> = cap.split('.').collect();
    let root = segments.first().copied().unwrap_or("").to_string();
    let primary = segments.get(1).copied().unwrap_or("*").to_string();
    let item_type = segments.get(2).copied().unwrap_or("*").to_string();
    let specifics = if segments.len() > 3 {
        segments[3..].join(".")
    } else {
        String::new()
    };
    let is_wildcard = segments.len() < 4 || segments.iter().any(|s| *s == "*");
    ParsedCapability {
        root,
        primary,
        item_type,
        specifics,
        is_wildcard,
    }
}

/// Compose the canonical capability for a `(primary, item_type, item_id)`
/// tuple. Path separators in the item id become dots.
///
/// ```
/// use spindle_capability::item_id_to_cap;
///
/// assert_eq!(
///     item_id_to_cap("execute", "tool", "spindle/file-system/fs_write"),
///     "spindle.execute.tool.spindle.file-system.fs_write",
/// );
/// ```
#[must_use]
pub fn item_id_to_cap(primary: &str, item_type: &str, item_id: &str) -> String {
    let dotted = item_id.replace('/', ".");
    format!("{SYSTEM_ROOT}.{primary}.{item_type}.{dotted}")
}

/// Whether `cap` falls under the reserved root namespace.
#[must_use]
pub fn is_system_capability(cap: &str) -> bool {
    cap == SYSTEM_ROOT || cap.starts_with(&format!("{SYSTEM_ROOT}."))
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// Primaries implied by a granted primary, per the fixed lattice.
fn implied_primaries(primary: &str) -> &'static [&'static str] {
    match primary {
        "execute" => &["search", "load"],
        "sign" => &["load"],
        _ => &[],
    }
}

/// Apply the primary-implication lattice element-wise.
///
/// Expansion is a closure operation: it only rewrites the primary segment
/// and never widens item types or specifics beyond what the source cap
/// grants.
///
/// ```
/// use spindle_capability::expand_capabilities;
///
/// let expanded = expand_capabilities(&["spindle.execute.tool.*".to_string()]);
/// assert!(expanded.contains("spindle.search.tool.*"));
/// assert!(expanded.contains("spindle.load.tool.*"));
/// assert!(!expanded.contains("spindle.sign.tool.*"));
/// ```
#[must_use]
pub fn expand_capabilities(caps: &[String]) -> BTreeSet<String> {
    let mut expanded: BTreeSet<String> = caps.iter().cloned().collect();
    for cap in caps {
        let segments: Vec<&str> = cap.split('.').collect();
        let Some(primary) = segments.get(1) else {
            continue;
        };
        for implied in implied_primaries(primary) {
            let mut rewritten = segments.clone();
            rewritten[1] = implied;
            expanded.insert(rewritten.join("."));
        }
    }
    expanded
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// True iff `granted` dominates `required`, segment for segment.
///
/// A `*` in the granted cap matches one segment, or — in final position —
/// the entire remaining suffix. A granted cap that is a strict prefix of the
/// required cap also dominates (prefix forms imply trailing wildcards).
///
/// ```
/// use spindle_capability::cap_matches;
///
/// assert!(cap_matches("spindle.execute.tool.*", "spindle.execute.tool.a.b"));
/// assert!(cap_matches("spindle.execute", "spindle.execute.tool.a"));
/// assert!(!cap_matches("spindle.search.*", "spindle.execute.tool.a"));
/// ```
#[must_use]
pub fn cap_matches(granted: &str, required: &str) -> bool {
    let g: Vec<&str> = granted.split('.').collect();
    let r: Vec<&str> = required.split('.').collect();

    for (i, r_seg) in r.iter().enumerate() {
        match g.get(i) {
            // Granted ran out of segments: a prefix grant covers the rest.
            None => return true,
            Some(&"*") if i == g.len() - 1 => return true,
            Some(&"*") => continue,
            Some(g_seg) if g_seg == r_seg => continue,
            Some(_) => return false,
        }
    }

    // Required exhausted; any extra granted segments must all be wildcards.
    g.len() <= r.len() || g[r.len()..].iter().all(|s| *s == "*")
}

/// True iff `required` matches some cap in the expanded granted set.
#[must_use]
pub fn check_capability(granted: &[String], required: &str) -> bool {
    expand_capabilities(granted)
        .iter()
        .any(|g| cap_matches(g, required))
}

/// Check every required cap against the expanded granted set.
///
/// Returns `(all_satisfied, missing)` where `missing` lists the required
/// caps with no match, in input order.
#[must_use]
pub fn check_all_capabilities(granted: &[String], required: &[String]) -> (bool, Vec<String>) {
    let expanded = expand_capabilities(granted);
    let missing: Vec<String> = required
        .iter()
        .filter(|req| !expanded.iter().any(|g| cap_matches(g, req)))
        .cloned()
        .collect();
    (missing.is_empty(), missing)
}

/// Primary actions reachable from a cap set after expansion.
#[must_use]
pub fn primaries_for_caps(caps: &[String]) -> BTreeSet<String> {
    expand_capabilities(caps)
        .iter()
        .filter_map(|cap| cap.split('.').nth(1))
        .filter(|p| *p != "*")
        .map(ToString::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// An immutable bundle of capabilities with audience, expiry, and an
/// attenuation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityToken {
    /// Granted capability strings.
    pub caps: Vec<String>,
    /// Audience (project identifier).
    pub aud: String,
    /// Expiry timestamp.
    pub exp: DateTime<Utc>,
    /// Directive this token was minted for.
    pub directive_id: String,
    /// Thread this token was minted for.
    pub thread_id: String,
    /// Unique token id.
    pub token_id: Uuid,
    /// Source token id when this token was produced by attenuation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
}

impl CapabilityToken {
    /// Mint a fresh root token.
    #[must_use]
    pub fn new(
        caps: Vec<String>,
        aud: impl Into<String>,
        exp: DateTime<Utc>,
        directive_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            caps,
            aud: aud.into(),
            exp,
            directive_id: directive_id.into(),
            thread_id: thread_id.into(),
            token_id: Uuid::new_v4(),
            parent_id: None,
        }
    }

    /// Whether the token's expiry has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.exp
    }

    /// Hierarchy-aware single-capability check.
    #[must_use]
    pub fn has_capability(&self, required: &str) -> bool {
        check_capability(&self.caps, required)
    }
}

/// Intersect declared child caps with an expanded parent set, keeping the
/// narrower side of every overlapping pair.
///
/// A child cap the parent dominates is kept as-is; a child cap that
/// dominates a parent cap (the child asked for more) collapses to the
/// parent's narrower grant. Disjoint declarations contribute nothing, so
/// the result is never a superset of the parent in effect.
#[must_use]
pub fn intersect_capabilities(
    parent_expanded: &BTreeSet<String>,
    child_caps: &[String],
) -> Vec<String> {
    let mut effective: Vec<String> = Vec::new();
    let mut push_unique = |cap: &str| {
        if !effective.iter().any(|existing| existing == cap) {
            effective.push(cap.to_string());
        }
    };
    for child in child_caps {
        for granted in parent_expanded {
            if cap_matches(granted, child) {
                push_unique(child);
            } else if cap_matches(child, granted) {
                push_unique(granted);
            }
        }
    }
    effective
}

/// Attenuate a parent token for a child.
///
/// The child's caps are the matching intersection of its declarations with
/// the expanded parent set (see [`intersect_capabilities`]) — never a
/// superset of the parent in effect. `parent_id` records the source token.
#[must_use]
pub fn attenuate_token(parent: &CapabilityToken, child_caps: &[String]) -> CapabilityToken {
    let expanded = expand_capabilities(&parent.caps);
    let caps = intersect_capabilities(&expanded, child_caps);

    CapabilityToken {
        caps,
        aud: parent.aud.clone(),
        exp: parent.exp,
        directive_id: parent.directive_id.clone(),
        thread_id: parent.thread_id.clone(),
        token_id: Uuid::new_v4(),
        parent_id: Some(parent.token_id),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(caps: &[&str]) -> CapabilityToken {
        CapabilityToken::new(
            caps.iter().map(ToString::to_string).collect(),
            "test-project",
            Utc::now() + Duration::hours(24),
            "parent",
            "parent-thread",
        )
    }

    fn strings(caps: &[&str]) -> Vec<String> {
        caps.iter().map(ToString::to_string).collect()
    }

    // -- hierarchy expansion --------------------------------------------

    #[test]
    fn execute_implies_search_and_load() {
        let expanded = expand_capabilities(&strings(&["spindle.execute.*"]));
        assert!(expanded.contains("spindle.search.*"));
        assert!(expanded.contains("spindle.load.*"));
    }

    #[test]
    fn search_does_not_imply_execute() {
        let expanded = expand_capabilities(&strings(&["spindle.search.*"]));
        assert!(!expanded.contains("spindle.execute.*"));
    }

    #[test]
    fn execute_tool_implies_search_tool() {
        let expanded = expand_capabilities(&strings(&["spindle.execute.tool.*"]));
        assert!(expanded.contains("spindle.search.tool.*"));
        assert!(expanded.contains("spindle.load.tool.*"));
    }

    #[test]
    fn sign_implies_load_only() {
        let expanded = expand_capabilities(&strings(&["spindle.sign.*"]));
        assert!(expanded.contains("spindle.load.*"));
        assert!(!expanded.contains("spindle.execute.*"));
    }

    #[test]
    fn expansion_preserves_specifics() {
        let expanded = expand_capabilities(&strings(&["spindle.execute.tool.fs.read"]));
        assert!(expanded.contains("spindle.search.tool.fs.read"));
        assert!(!expanded.contains("spindle.search.tool.fs.write"));
    }

    // -- parsing --------------------------------------------------------

    #[test]
    fn parse_full_cap() {
        let p = parse_capability("spindle.execute.tool.spindle.file-system.fs_write");
        assert_eq!(p.primary, "execute");
        assert_eq!(p.item_type, "tool");
        assert_eq!(p.specifics, "spindle.file-system.fs_write");
        assert!(!p.is_wildcard);
    }

    #[test]
    fn parse_wildcard() {
        let p = parse_capability("spindle.execute.tool.*");
        assert_eq!(p.primary, "execute");
        assert_eq!(p.item_type, "tool");
        assert!(p.is_wildcard);
    }

    #[test]
    fn parse_god_mode() {
        let p = parse_capability("spindle.*");
        assert_eq!(p.primary, "*");
        assert!(p.is_wildcard);
    }

    #[test]
    fn parse_primary_only() {
        let p = parse_capability("spindle.execute");
        assert_eq!(p.primary, "execute");
        assert_eq!(p.item_type, "*");
        assert!(p.is_wildcard);
    }

    // -- matching -------------------------------------------------------

    #[test]
    fn match_exact() {
        assert!(cap_matches(
            "spindle.execute.tool.spindle.file-system.fs_write",
            "spindle.execute.tool.spindle.file-system.fs_write",
        ));
    }

    #[test]
    fn match_trailing_wildcard() {
        assert!(cap_matches(
            "spindle.execute.tool.*",
            "spindle.execute.tool.spindle.file-system.fs_write",
        ));
    }

    #[test]
    fn match_primary_wildcard() {
        assert!(cap_matches(
            "spindle.execute.*",
            "spindle.execute.tool.spindle.file-system.fs_write",
        ));
    }

    #[test]
    fn no_match_wrong_primary() {
        assert!(!cap_matches(
            "spindle.search.*",
            "spindle.execute.tool.spindle.file-system.fs_write",
        ));
    }

    #[test]
    fn mid_position_wildcard_matches_one_segment() {
        assert!(cap_matches(
            "spindle.execute.*.spindle.fs.read",
            "spindle.execute.tool.spindle.fs.read",
        ));
        assert!(!cap_matches(
            "spindle.execute.*.spindle.fs.read",
            "spindle.execute.tool.spindle.fs.write",
        ));
    }

    #[test]
    fn granted_narrower_than_required_does_not_match() {
        assert!(!cap_matches(
            "spindle.execute.tool.fs.read",
            "spindle.execute.tool",
        ));
    }

    #[test]
    fn item_id_to_cap_dots_path() {
        assert_eq!(
            item_id_to_cap("execute", "tool", "spindle/file-system/fs_write"),
            "spindle.execute.tool.spindle.file-system.fs_write",
        );
    }

    // -- checking -------------------------------------------------------

    #[test]
    fn direct_match() {
        let granted = strings(&[
            "spindle.execute.tool.spindle.file-system.fs_read",
            "spindle.execute.tool.spindle.file-system.fs_write",
        ]);
        assert!(check_capability(
            &granted,
            "spindle.execute.tool.spindle.file-system.fs_read"
        ));
    }

    #[test]
    fn implied_match() {
        let granted = strings(&["spindle.execute.*"]);
        assert!(check_capability(
            &granted,
            "spindle.search.tool.spindle.file-system.fs_read"
        ));
    }

    #[test]
    fn missing_capability() {
        let granted = strings(&["spindle.search.*"]);
        assert!(!check_capability(
            &granted,
            "spindle.execute.tool.spindle.file-system.fs_write"
        ));
    }

    #[test]
    fn check_all_satisfied() {
        let granted = strings(&["spindle.execute.*"]);
        let (ok, missing) = check_all_capabilities(
            &granted,
            &strings(&[
                "spindle.search.tool.spindle.file-system.fs_read",
                "spindle.load.directive.test",
            ]),
        );
        assert!(ok);
        assert!(missing.is_empty());
    }

    #[test]
    fn check_all_reports_missing() {
        let granted = strings(&["spindle.search.*"]);
        let (ok, missing) = check_all_capabilities(
            &granted,
            &strings(&[
                "spindle.search.tool.spindle.file-system.fs_read",
                "spindle.execute.tool.spindle.file-system.fs_write",
            ]),
        );
        assert!(!ok);
        assert_eq!(
            missing,
            strings(&["spindle.execute.tool.spindle.file-system.fs_write"])
        );
    }

    #[test]
    fn empty_granted_denies_everything() {
        let (ok, missing) =
            check_all_capabilities(&[], &strings(&["spindle.load.knowledge.readme"]));
        assert!(!ok);
        assert_eq!(missing.len(), 1);
    }

    #[test]
    fn primaries_for_execute_cap() {
        let primaries = primaries_for_caps(&strings(&["spindle.execute.tool.fs.*"]));
        assert!(primaries.contains("execute"));
        assert!(primaries.contains("search"));
        assert!(primaries.contains("load"));
        assert!(!primaries.contains("sign"));
    }

    // -- tokens ---------------------------------------------------------

    #[test]
    fn token_expiry() {
        let mut t = token(&["spindle.execute.tool.fs.read"]);
        assert!(!t.is_expired());
        t.exp = Utc::now() - Duration::hours(1);
        assert!(t.is_expired());
    }

    #[test]
    fn token_has_capability_with_hierarchy() {
        let t = token(&["spindle.execute.*"]);
        assert!(t.has_capability("spindle.search.tool.spindle.file-system.fs_read"));
    }

    #[test]
    fn token_serde_roundtrip() {
        let t = token(&["spindle.execute.tool.fs.read", "spindle.execute.*"]);
        let json = serde_json::to_string(&t).unwrap();
        let back: CapabilityToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    // -- attenuation ----------------------------------------------------

    #[test]
    fn attenuation_intersection() {
        let parent = token(&[
            "spindle.execute.tool.spindle.file-system.*",
            "spindle.execute.*",
        ]);
        let attenuated =
            attenuate_token(&parent, &strings(&["spindle.execute.tool.spindle.file-system.*"]));
        assert!(attenuated
            .caps
            .contains(&"spindle.execute.tool.spindle.file-system.*".to_string()));
        assert!(!attenuated.caps.contains(&"spindle.execute.*".to_string()));
    }

    #[test]
    fn broad_child_declaration_collapses_to_parent_grant() {
        // Parent holds a narrow fs grant; the child declares broad execute.
        // The effective set is the parent's narrower cap, never the broad
        // declaration.
        let parent = token(&["spindle.execute.tool.fs.*"]);
        let attenuated = attenuate_token(&parent, &strings(&["spindle.execute.*"]));
        assert_eq!(attenuated.caps, strings(&["spindle.execute.tool.fs.*"]));
    }

    #[test]
    fn attenuation_no_escalation() {
        let parent = token(&["spindle.search.*"]);
        let attenuated = attenuate_token(
            &parent,
            &strings(&["spindle.execute.*", "spindle.execute.tool.spindle.db.write"]),
        );
        assert!(attenuated.caps.is_empty());
    }

    #[test]
    fn attenuation_sets_parent_id() {
        let parent = token(&["spindle.execute.tool.spindle.file-system.*"]);
        let attenuated =
            attenuate_token(&parent, &strings(&["spindle.execute.tool.spindle.file-system.*"]));
        assert_eq!(attenuated.parent_id, Some(parent.token_id));
    }

    #[test]
    fn attenuation_empty_child_caps() {
        let parent = token(&["spindle.execute.*"]);
        let attenuated = attenuate_token(&parent, &[]);
        assert!(attenuated.caps.is_empty());
    }

    // -- system namespace -----------------------------------------------

    #[test]
    fn system_namespace_detection() {
        assert!(is_system_capability("spindle.execute"));
        assert!(is_system_capability(
            "spindle.execute.tool.spindle.file-system.fs_write"
        ));
        assert!(is_system_capability("spindle.*"));
        assert!(!is_system_capability("custom.my_cap"));
        assert!(!is_system_capability("spindlex.execute"));
    }
}
