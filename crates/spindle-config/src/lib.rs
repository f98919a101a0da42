// SPDX-License-Identifier: MIT OR Apache-2.0
//! Three-tier YAML configuration cascade for the spindle kernel.
//!
//! For each configuration file name, three YAML sources are loaded and
//! deep-merged in order: system default → user override → project override.
//! Merge semantics: maps merge per key with the later layer winning;
//! lists of objects carrying an `id` field are merged by id (same-id entries
//! *replaced* by the later layer, new ids appended); lists without `id` are
//! replaced wholesale. This makes hook tables extensible by id and keeps the
//! result deterministic.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod merge;
mod types;

pub use merge::deep_merge;
pub use types::{
    ContinuationConfig, CoordinationConfig, EventsConfig, HooksConfig, LimitsSection,
    ResilienceConfig, RetryPolicy, RiskClassification, RiskConfig, RiskLevel, RiskPolicy,
    WaitConfig,
};

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// The directory every tier nests its artifacts under.
pub const AI_DIR: &str = ".ai";

/// Errors that can occur during configuration loading or merging.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be parsed as valid YAML.
    #[error("failed to parse config {path}: {reason}")]
    ParseError {
        /// Path that failed.
        path: PathBuf,
        /// Human-readable parse error detail.
        reason: String,
    },

    /// The merged document does not deserialize into the requested type.
    #[error("config '{name}' is invalid: {reason}")]
    InvalidShape {
        /// Config file name.
        name: String,
        /// Deserialization failure detail.
        reason: String,
    },
}

/// A three-tier configuration cascade rooted at concrete directories.
///
/// Lookups read `<root>/.ai/config/<name>.yaml` from each tier. Missing
/// files are skipped; present files must parse.
#[derive(Debug, Clone)]
pub struct ConfigCascade {
    system_roots: Vec<PathBuf>,
    user_root: Option<PathBuf>,
    project_root: PathBuf,
}

impl ConfigCascade {
    /// Build a cascade with explicit tier roots. System bundle roots merge
    /// first (in the given order), then the user root, then the project.
    #[must_use]
    pub fn new(
        system_roots: Vec<PathBuf>,
        user_root: Option<PathBuf>,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            system_roots,
            user_root,
            project_root: project_root.into(),
        }
    }

    /// Standard cascade for a project: no system bundles, the user's home
    /// `.ai` tier, and the project root.
    #[must_use]
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        Self::new(Vec::new(), dirs::home_dir(), project_root)
    }

    /// Project root this cascade serves.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    fn config_path(root: &Path, name: &str) -> PathBuf {
        root.join(AI_DIR).join("config").join(format!("{name}.yaml"))
    }

    /// Load and deep-merge `<name>.yaml` across all tiers into a raw value.
    ///
    /// Returns `Value::Null` when no tier carries the file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a present file cannot be read or parsed.
    pub fn load_value(&self, name: &str) -> Result<serde_yaml::Value, ConfigError> {
        let mut merged = serde_yaml::Value::Null;

        let mut roots: Vec<&Path> = self.system_roots.iter().map(PathBuf::as_path).collect();
        if let Some(user) = &self.user_root {
            roots.push(user.as_path());
        }
        roots.push(self.project_root.as_path());

        for root in roots {
            let path = Self::config_path(root, name);
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let layer: serde_yaml::Value =
                serde_yaml::from_str(&text).map_err(|e| ConfigError::ParseError {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            merged = deep_merge(merged, layer);
        }

        Ok(merged)
    }

    /// Load, merge, and deserialize `<name>.yaml` into `T`.
    ///
    /// Falls back to `T::default()` when no tier carries the file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read/parse failures or when the merged
    /// document does not fit `T`.
    pub fn load<T>(&self, name: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Default,
    {
        let value = self.load_value(name)?;
        if value.is_null() {
            return Ok(T::default());
        }
        serde_yaml::from_value(value).map_err(|e| ConfigError::InvalidShape {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Resilience limits and retry policy (`resilience.yaml`).
    ///
    /// # Errors
    ///
    /// See [`ConfigCascade::load`].
    pub fn resilience(&self) -> Result<ResilienceConfig, ConfigError> {
        self.load("resilience")
    }

    /// Capability risk table (`capability_risk.yaml`).
    ///
    /// # Errors
    ///
    /// See [`ConfigCascade::load`].
    pub fn capability_risk(&self) -> Result<RiskConfig, ConfigError> {
        self.load("capability_risk")
    }

    /// Hook tables (`hooks.yaml`).
    ///
    /// # Errors
    ///
    /// See [`ConfigCascade::load`].
    pub fn hooks(&self) -> Result<HooksConfig, ConfigError> {
        self.load("hooks")
    }

    /// Event criticality routing (`events.yaml`).
    ///
    /// # Errors
    ///
    /// See [`ConfigCascade::load`].
    pub fn events(&self) -> Result<EventsConfig, ConfigError> {
        self.load("events")
    }

    /// Continuation / wait coordination (`coordination.yaml`).
    ///
    /// # Errors
    ///
    /// See [`ConfigCascade::load`].
    pub fn coordination(&self) -> Result<CoordinationConfig, ConfigError> {
        self.load("coordination")
    }
}
