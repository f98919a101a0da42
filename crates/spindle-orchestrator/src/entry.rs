// SPDX-License-Identifier: MIT OR Apache-2.0
//! Entry operation types and the pure pieces of the entry flow:
//! limit resolution and extends-chain composition.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use spindle_artifact::{ArtifactStore, ItemType, Tier};
use spindle_core::{Cost, Directive, DirectiveParser, ThreadStatus};
use std::collections::BTreeMap;

/// Input schema of the thread-directive entry operation. Unknown keys are
/// rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryInput {
    /// Directive item id to execute.
    pub directive_id: String,
    /// Return immediately with the thread id, running detached.
    #[serde(default, rename = "async")]
    pub r#async: bool,
    /// Input parameters for the directive.
    #[serde(default)]
    pub inputs: Value,
    /// Override the LLM model (tier or explicit id).
    #[serde(default)]
    pub model: Option<String>,
    /// Override default limits.
    #[serde(default)]
    pub limit_overrides: BTreeMap<String, f64>,
    /// Parent thread for hierarchy tracking.
    #[serde(default)]
    pub parent_thread_id: Option<String>,
    /// Previous thread for resume/continuation.
    #[serde(default)]
    pub previous_thread_id: Option<String>,
}

impl EntryInput {
    /// A minimal input for a directive id.
    #[must_use]
    pub fn new(directive_id: impl Into<String>) -> Self {
        Self {
            directive_id: directive_id.into(),
            r#async: false,
            inputs: Value::Object(Default::default()),
            model: None,
            limit_overrides: BTreeMap::new(),
            parent_thread_id: None,
            previous_thread_id: None,
        }
    }
}

/// Internal-only entry parameters, set by the detached-spawn path — never
/// part of the public input schema.
#[derive(Debug, Clone, Default)]
pub struct EntryInternal {
    /// Pre-generated thread id (detached children re-enter with theirs).
    pub thread_id_override: Option<String>,
    /// The parent process already registered the thread.
    pub pre_registered: bool,
    /// Explicit continuation message for resumes.
    pub continuation_message: Option<String>,
}

/// Result of the entry operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryResult {
    /// Whether the thread completed (or detached) successfully.
    pub success: bool,
    /// The thread id.
    pub thread_id: String,
    /// Final (or current, for async) status.
    pub status: ThreadStatus,
    /// Directive that ran.
    pub directive: String,
    /// Detached child's PID, for async spawns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Final cost, for sync runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
    /// Result text, for completions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    /// Structured outputs from directive_return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    /// Error message for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Successor thread when the run ended in a handoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_thread_id: Option<String>,
}

impl EntryResult {
    /// An error result for a thread that never ran.
    #[must_use]
    pub fn failure(thread_id: &str, directive: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            thread_id: thread_id.to_string(),
            status: ThreadStatus::Error,
            directive: directive.to_string(),
            pid: None,
            cost: None,
            result_text: None,
            outputs: None,
            error: Some(error.into()),
            continuation_thread_id: None,
        }
    }
}

/// The composed result of walking a directive's extends chain.
#[derive(Debug, Clone, Default)]
pub struct ChainResolution {
    /// Chain ids, root first.
    pub chain: Vec<String>,
    /// Knowledge ids for the system prompt, root-first, deduplicated.
    pub system: Vec<String>,
    /// Knowledge ids before the prompt.
    pub before: Vec<String>,
    /// Knowledge ids after the prompt.
    pub after: Vec<String>,
    /// Suppressed hook ids.
    pub suppress: Vec<String>,
    /// Permissions inherited from the nearest ancestor when the leaf
    /// declares none.
    pub inherited_permissions: Option<Vec<String>>,
}

/// Walk the `extends` chain and compose context and capabilities.
///
/// Resolution is leaf → parent → … → root; context is composed root-first
/// (base layers, then overlays) with duplicates dropped. When the leaf has
/// no permissions, the nearest ancestor's are inherited.
///
/// # Errors
///
/// A message on a missing parent or a circular chain.
pub fn resolve_directive_chain(
    directive: &Directive,
    store: &ArtifactStore,
    parser: &dyn DirectiveParser,
) -> Result<ChainResolution, String> {
    let mut chain: Vec<Directive> = vec![directive.clone()];
    let mut seen: std::collections::HashSet<String> =
        std::collections::HashSet::from([directive.id.clone()]);

    let mut current_extends = directive.extends.clone();
    let mut current_tier = store
        .resolve(ItemType::Directive, &directive.id)
        .map_or(Tier::Project, |(_, tier)| tier);

    while let Some(parent_id) = current_extends {
        if seen.contains(&parent_id) {
            let names: Vec<&str> = chain.iter().map(|d| d.id.as_str()).collect();
            return Err(format!(
                "circular extends chain: {parent_id} (chain: {})",
                names.join(" → ")
            ));
        }
        seen.insert(parent_id.clone());

        // Dependency pulls are scoped by the child's tier; the parent is
        // read from the scoped path so a higher-tier shadow cannot hijack
        // a lower-tier chain.
        let (parent_path, parent_tier) = store
            .resolve_scoped(ItemType::Directive, &parent_id, current_tier.allowed_sources())
            .ok_or_else(|| format!("parent directive not found: {parent_id}"))?;
        let text = std::fs::read_to_string(&parent_path)
            .map_err(|e| format!("failed to load parent directive '{parent_id}': {e}"))?;
        store
            .trust()
            .verify_document(&text)
            .map_err(|e| format!("parent directive '{parent_id}' failed verification: {e}"))?;
        let (_, body) = spindle_artifact::split_document(&text);
        let parent = parser
            .parse(&parent_id, body)
            .map_err(|e| format!("failed to parse parent directive '{parent_id}': {e}"))?;

        current_extends = parent.extends.clone();
        current_tier = parent_tier;
        chain.push(parent);
    }

    // Root first for context composition.
    chain.reverse();

    let mut resolution = ChainResolution {
        chain: chain.iter().map(|d| d.id.clone()).collect(),
        ..ChainResolution::default()
    };

    let push_unique = |list: &mut Vec<String>, item: &str| {
        if !list.iter().any(|existing| existing == item) {
            list.push(item.to_string());
        }
    };
    for d in &chain {
        for id in &d.context.system {
            push_unique(&mut resolution.system, id);
        }
        for id in &d.context.before {
            push_unique(&mut resolution.before, id);
        }
        for id in &d.context.after {
            push_unique(&mut resolution.after, id);
        }
        for id in &d.context.suppress {
            push_unique(&mut resolution.suppress, id);
        }
    }

    // Leaf permissions win; otherwise inherit from the nearest ancestor
    // that declares any.
    let leaf = chain.last().expect("chain contains at least the leaf");
    if leaf.permissions.is_empty() && chain.len() > 1 {
        for ancestor in chain[..chain.len() - 1].iter().rev() {
            if !ancestor.permissions.is_empty() {
                resolution.inherited_permissions = Some(ancestor.permissions.clone());
                break;
            }
        }
    }

    Ok(resolution)
}

/// Resolve limits: defaults → directive → overrides, then clamp by the
/// parent's limits. Depth decrements by one per level — it represents
/// remaining spawnable depth, not a fixed maximum.
///
/// # Errors
///
/// A message naming any limit key outside the configured vocabulary.
pub fn resolve_limits(
    defaults: &BTreeMap<String, f64>,
    directive_limits: &BTreeMap<String, f64>,
    overrides: &BTreeMap<String, f64>,
    parent_limits: Option<&BTreeMap<String, f64>>,
) -> Result<BTreeMap<String, f64>, String> {
    for (source, table) in [
        ("directive limits", directive_limits),
        ("limit overrides", overrides),
    ] {
        for key in table.keys() {
            if !defaults.contains_key(key) {
                let valid: Vec<&str> = defaults.keys().map(String::as_str).collect();
                return Err(format!(
                    "unknown limit '{key}' in {source}; valid limits: {}",
                    valid.join(", ")
                ));
            }
        }
    }

    let mut resolved = defaults.clone();
    for (k, v) in directive_limits {
        resolved.insert(k.clone(), *v);
    }
    for (k, v) in overrides {
        resolved.insert(k.clone(), *v);
    }

    if let Some(parent) = parent_limits {
        for key in ["turns", "tokens", "spend", "spawns", "duration_seconds"] {
            if let (Some(&parent_value), Some(own)) = (parent.get(key), resolved.get_mut(key)) {
                *own = own.min(parent_value);
            }
        }
        if let Some(&parent_depth) = parent.get("depth") {
            let own = resolved.entry("depth".to_string()).or_insert(10.0);
            *own = own.min(parent_depth - 1.0);
        }
    }

    Ok(resolved)
}
