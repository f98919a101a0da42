// SPDX-License-Identifier: MIT OR Apache-2.0
//! Three-tier id → path resolution with verification on load.
//!
//! Resolution order is strict: `project/.ai/<type_dir>/<id>.<ext>`, then
//! `user/.ai/<type_dir>/<id>.<ext>`, then each system bundle's
//! `.ai/<type_dir>/<id>.<ext>`. Shadowing is explicit — a higher-priority
//! file wins without warning. Dependency pulls are tier-scoped: a tool
//! resolved from `system` may only pull from `system`, `user` from
//! `user|system`, `project` from any tier.

use crate::signature::{IntegrityError, TrustStore};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The directory every tier nests its artifacts under.
const AI_DIR: &str = ".ai";

/// Which tier an artifact resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// The project's own `.ai` directory (highest priority).
    Project,
    /// The user's home `.ai` directory.
    User,
    /// A system bundle.
    System,
}

impl Tier {
    /// Tiers this tier's artifacts may pull dependencies from.
    #[must_use]
    pub fn allowed_sources(&self) -> &'static [Tier] {
        match self {
            Self::Project => &[Tier::Project, Tier::User, Tier::System],
            Self::User => &[Tier::User, Tier::System],
            Self::System => &[Tier::System],
        }
    }
}

/// Item types the store resolves, with their directory and extension list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    /// Signed directive markdown.
    Directive,
    /// Signed tool source or schema.
    Tool,
    /// Signed knowledge markdown.
    Knowledge,
    /// Cascaded configuration.
    Config,
}

impl ItemType {
    /// Directory under `.ai/` for this item type.
    #[must_use]
    pub fn type_dir(&self) -> &'static str {
        match self {
            Self::Directive => "directives",
            Self::Tool => "tools",
            Self::Knowledge => "knowledge",
            Self::Config => "config",
        }
    }

    /// Candidate extensions, in priority order. Data-driven per item type.
    #[must_use]
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Directive => &["md"],
            Self::Tool => &["yaml", "py", "md"],
            Self::Knowledge => &["md"],
            Self::Config => &["yaml"],
        }
    }

    /// Parse the wire name (`directive`, `tool`, …).
    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "directive" => Some(Self::Directive),
            "tool" => Some(Self::Tool),
            "knowledge" => Some(Self::Knowledge),
            "config" => Some(Self::Config),
            _ => None,
        }
    }
}

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No tier carries the id.
    #[error("{item_type:?} not found: {id}")]
    NotFound {
        /// Item type searched.
        item_type: ItemType,
        /// Item id searched.
        id: String,
    },

    /// The artifact failed signature verification.
    #[error("integrity failure for {path}: {source}")]
    Integrity {
        /// Offending file.
        path: PathBuf,
        /// Underlying integrity error.
        #[source]
        source: IntegrityError,
    },

    /// Filesystem failure.
    #[error("io error for {path}: {source}")]
    Io {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// An artifact that passed signature verification.
#[derive(Debug, Clone)]
pub struct VerifiedArtifact {
    /// Resolved path.
    pub path: PathBuf,
    /// Tier it resolved from.
    pub tier: Tier,
    /// Hex SHA-256 of the body.
    pub hash: String,
    /// Body text (signature header stripped).
    pub body: String,
}

/// The layered artifact store.
///
/// Copy-on-read: loaded artifacts are never mutated in memory. Verification
/// results are cached by content hash; re-reading the file invalidates
/// naturally because a changed file hashes differently.
pub struct ArtifactStore {
    project_root: PathBuf,
    user_root: Option<PathBuf>,
    system_roots: Vec<PathBuf>,
    trust: TrustStore,
    verified_hashes: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("project_root", &self.project_root)
            .field("user_root", &self.user_root)
            .field("system_roots", &self.system_roots)
            .finish_non_exhaustive()
    }
}

impl ArtifactStore {
    /// Build a store with explicit tier roots and a trust store.
    #[must_use]
    pub fn new(
        project_root: impl Into<PathBuf>,
        user_root: Option<PathBuf>,
        system_roots: Vec<PathBuf>,
        trust: TrustStore,
    ) -> Self {
        Self {
            project_root: project_root.into(),
            user_root,
            system_roots,
            trust,
            verified_hashes: Mutex::new(HashSet::new()),
        }
    }

    /// Standard store for a project: home-dir user tier, no system bundles.
    #[must_use]
    pub fn for_project(project_root: impl Into<PathBuf>, trust: TrustStore) -> Self {
        Self::new(project_root, dirs::home_dir(), Vec::new(), trust)
    }

    /// The project root.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// The trust store backing verification.
    #[must_use]
    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    fn tier_roots(&self) -> Vec<(Tier, &Path)> {
        let mut roots: Vec<(Tier, &Path)> = vec![(Tier::Project, self.project_root.as_path())];
        if let Some(user) = &self.user_root {
            roots.push((Tier::User, user.as_path()));
        }
        for sys in &self.system_roots {
            roots.push((Tier::System, sys.as_path()));
        }
        roots
    }

    /// Resolve an id to a path, searching all tiers in strict order.
    #[must_use]
    pub fn resolve(&self, item_type: ItemType, id: &str) -> Option<(PathBuf, Tier)> {
        self.resolve_scoped(item_type, id, &[Tier::Project, Tier::User, Tier::System])
    }

    /// Resolve with the tier scope of a dependent artifact: only tiers in
    /// `allowed` are searched (see [`Tier::allowed_sources`]).
    #[must_use]
    pub fn resolve_scoped(
        &self,
        item_type: ItemType,
        id: &str,
        allowed: &[Tier],
    ) -> Option<(PathBuf, Tier)> {
        for (tier, root) in self.tier_roots() {
            if !allowed.contains(&tier) {
                continue;
            }
            let base = root.join(AI_DIR).join(item_type.type_dir());
            for ext in item_type.extensions() {
                let candidate = base.join(format!("{id}.{ext}"));
                if candidate.is_file() {
                    return Some((candidate, tier));
                }
            }
        }
        None
    }

    /// Load an artifact without verification (raw text, header included).
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] or [`StoreError::Io`].
    pub fn load_raw(&self, item_type: ItemType, id: &str) -> Result<(String, PathBuf, Tier), StoreError> {
        let (path, tier) = self
            .resolve(item_type, id)
            .ok_or_else(|| StoreError::NotFound {
                item_type,
                id: id.to_string(),
            })?;
        let text = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        Ok((text, path, tier))
    }

    /// Load an artifact for execution: resolve, verify the signature
    /// header, and return the verified body.
    ///
    /// Verification is cached by content hash, so repeated loads of an
    /// unchanged file skip the signature check.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`], [`StoreError::Io`], or
    /// [`StoreError::Integrity`].
    pub fn load_verified(
        &self,
        item_type: ItemType,
        id: &str,
    ) -> Result<VerifiedArtifact, StoreError> {
        let (text, path, tier) = self.load_raw(item_type, id)?;

        let (_, body) = crate::signature::split_document(&text);
        let hash = crate::signature::body_hash(body);

        let already_verified = self
            .verified_hashes
            .lock()
            .expect("verify cache poisoned")
            .contains(&hash);

        if !already_verified {
            self.trust
                .verify_document(&text)
                .map_err(|source| StoreError::Integrity {
                    path: path.clone(),
                    source,
                })?;
            self.verified_hashes
                .lock()
                .expect("verify cache poisoned")
                .insert(hash.clone());
        }

        Ok(VerifiedArtifact {
            path,
            tier,
            hash,
            body: body.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::ArtifactSigner;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        project: TempDir,
        user: TempDir,
        system: TempDir,
        signer: ArtifactSigner,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                project: TempDir::new().unwrap(),
                user: TempDir::new().unwrap(),
                system: TempDir::new().unwrap(),
                signer: ArtifactSigner::generate(),
            }
        }

        fn write(&self, root: &TempDir, item_type: ItemType, id: &str, ext: &str, body: &str) {
            let dir = root.path().join(AI_DIR).join(item_type.type_dir());
            let path = dir.join(format!("{id}.{ext}"));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, self.signer.sign_document(body, ext)).unwrap();
        }

        fn store(&self) -> ArtifactStore {
            let mut trust = TrustStore::new();
            trust.insert(self.signer.verifying_key());
            ArtifactStore::new(
                self.project.path(),
                Some(self.user.path().to_path_buf()),
                vec![self.system.path().to_path_buf()],
                trust,
            )
        }
    }

    #[test]
    fn project_shadows_user_shadows_system() {
        let fx = Fixture::new();
        fx.write(&fx.system, ItemType::Knowledge, "notes/a", "md", "system\n");
        fx.write(&fx.user, ItemType::Knowledge, "notes/a", "md", "user\n");
        fx.write(&fx.project, ItemType::Knowledge, "notes/a", "md", "project\n");

        let store = fx.store();
        let artifact = store.load_verified(ItemType::Knowledge, "notes/a").unwrap();
        assert_eq!(artifact.tier, Tier::Project);
        assert_eq!(artifact.body, "project\n");
    }

    #[test]
    fn tier_scoping_restricts_dependency_pulls() {
        let fx = Fixture::new();
        fx.write(&fx.project, ItemType::Tool, "dep", "yaml", "project-dep\n");
        fx.write(&fx.system, ItemType::Tool, "dep", "yaml", "system-dep\n");

        let store = fx.store();
        // A system-tier artifact may only pull from system.
        let (path, tier) = store
            .resolve_scoped(ItemType::Tool, "dep", Tier::System.allowed_sources())
            .unwrap();
        assert_eq!(tier, Tier::System);
        assert!(path.starts_with(fx.system.path()));

        // A project-tier artifact sees the shadowing project copy.
        let (_, tier) = store
            .resolve_scoped(ItemType::Tool, "dep", Tier::Project.allowed_sources())
            .unwrap();
        assert_eq!(tier, Tier::Project);
    }

    #[test]
    fn nested_ids_map_to_nested_directories() {
        let fx = Fixture::new();
        fx.write(
            &fx.project,
            ItemType::Directive,
            "spindle/agent/review",
            "md",
            "---\ndescription: r\n---\nbody\n",
        );
        let store = fx.store();
        let artifact = store
            .load_verified(ItemType::Directive, "spindle/agent/review")
            .unwrap();
        assert!(artifact.path.ends_with(".ai/directives/spindle/agent/review.md"));
    }

    #[test]
    fn unsigned_artifact_fails_verification() {
        let fx = Fixture::new();
        let dir = fx.project.path().join(AI_DIR).join("knowledge");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("plain.md"), "no header\n").unwrap();

        let store = fx.store();
        assert!(matches!(
            store.load_verified(ItemType::Knowledge, "plain"),
            Err(StoreError::Integrity { .. })
        ));
    }

    #[test]
    fn tampered_artifact_fails_after_cache_warmup() {
        let fx = Fixture::new();
        fx.write(&fx.project, ItemType::Knowledge, "a", "md", "v1\n");
        let store = fx.store();
        store.load_verified(ItemType::Knowledge, "a").unwrap();

        // Tamper with the body; the changed hash misses the cache and fails.
        let path = fx
            .project
            .path()
            .join(AI_DIR)
            .join("knowledge")
            .join("a.md");
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replace("v1", "v2")).unwrap();
        assert!(matches!(
            store.load_verified(ItemType::Knowledge, "a"),
            Err(StoreError::Integrity { .. })
        ));
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let fx = Fixture::new();
        let store = fx.store();
        assert!(matches!(
            store.load_verified(ItemType::Directive, "missing/d"),
            Err(StoreError::NotFound { .. })
        ));
    }
}
