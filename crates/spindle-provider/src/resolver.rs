// SPDX-License-Identifier: MIT OR Apache-2.0
//! Model → provider → endpoint resolution, and the credential cascade.
//!
//! `config/models.yaml` maps tier aliases and explicit model ids to
//! provider artifact ids; provider configurations are signed YAML tool
//! artifacts resolved through the store.

use crate::error::ProviderError;
use crate::schema::ProviderConfig;
use serde::{Deserialize, Serialize};
use spindle_artifact::{ArtifactStore, ItemType};
use std::collections::BTreeMap;
use std::path::Path;

/// One model-table entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Resolved model id (tier entries only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider artifact id.
    pub provider: String,
}

/// The `config/models.yaml` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTable {
    /// Tier alias → entry (`general`, `fast`, …).
    #[serde(default)]
    pub tiers: BTreeMap<String, ModelEntry>,
    /// Explicit model id → entry.
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
}

/// A fully resolved provider binding.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    /// Resolved model id.
    pub model: String,
    /// Provider artifact id.
    pub provider_item_id: String,
    /// Parsed provider configuration.
    pub config: ProviderConfig,
}

/// Resolve a model tier or id to a provider configuration.
///
/// Resolution: tier alias → its model and provider; explicit model id →
/// its provider; an unknown id with a provider hint passes through. The
/// provider config is loaded as a verified tool artifact.
///
/// # Errors
///
/// [`ProviderError::Resolution`] when no provider can be determined, the
/// artifact fails to load/verify, or the config is not an `http` provider.
pub fn resolve_provider(
    model_or_tier: &str,
    provider_hint: Option<&str>,
    store: &ArtifactStore,
) -> Result<ResolvedProvider, ProviderError> {
    let table: ModelTable = match store.load_verified(ItemType::Config, "models") {
        Ok(artifact) => {
            serde_yaml::from_str(&artifact.body).map_err(|e| ProviderError::Resolution {
                model: model_or_tier.to_string(),
                reason: format!("models table invalid: {e}"),
            })?
        }
        Err(_) => ModelTable::default(),
    };

    let (model, provider_item_id) = if let Some(entry) = table.tiers.get(model_or_tier) {
        let model = entry.model.clone().unwrap_or_else(|| model_or_tier.to_string());
        (model, entry.provider.clone())
    } else if let Some(entry) = table.models.get(model_or_tier) {
        (model_or_tier.to_string(), entry.provider.clone())
    } else if let Some(hint) = provider_hint {
        (model_or_tier.to_string(), hint.to_string())
    } else {
        return Err(ProviderError::Resolution {
            model: model_or_tier.to_string(),
            reason: "not in the model table and no provider hint given".to_string(),
        });
    };

    // A hint always wins over the table's provider.
    let provider_item_id = provider_hint
        .map_or(provider_item_id, ToString::to_string);

    let artifact = store
        .load_verified(ItemType::Tool, &provider_item_id)
        .map_err(|e| ProviderError::Resolution {
            model: model_or_tier.to_string(),
            reason: format!("provider artifact '{provider_item_id}': {e}"),
        })?;

    let config: ProviderConfig =
        serde_yaml::from_str(&artifact.body).map_err(|e| ProviderError::Resolution {
            model: model_or_tier.to_string(),
            reason: format!("provider config '{provider_item_id}' invalid: {e}"),
        })?;

    if config.tool_type != "http" {
        return Err(ProviderError::Resolution {
            model: model_or_tier.to_string(),
            reason: format!(
                "unsupported provider type '{}' for '{provider_item_id}'; only 'http' providers are supported",
                config.tool_type
            ),
        });
    }

    Ok(ResolvedProvider {
        model,
        provider_item_id,
        config,
    })
}

/// Load the layered `.env` cascade: user tier first, then project (project
/// wins per key). Process environment variables are consulted last, at
/// placeholder-resolution time.
#[must_use]
pub fn load_env_cascade(user_root: Option<&Path>, project_root: &Path) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(user) = user_root {
        merge_env_file(&mut env, &user.join(".env"));
    }
    merge_env_file(&mut env, &project_root.join(".env"));
    env
}

fn merge_env_file(env: &mut BTreeMap<String, String>, path: &Path) {
    let Ok(text) = std::fs::read_to_string(path) else {
        return;
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        env.insert(key.trim().to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_artifact::{ArtifactSigner, TrustStore};
    use std::fs;
    use tempfile::TempDir;

    fn store_with(signer: &ArtifactSigner, project: &TempDir) -> ArtifactStore {
        let mut trust = TrustStore::new();
        trust.insert(signer.verifying_key());
        ArtifactStore::new(project.path(), None, Vec::new(), trust)
    }

    fn write_signed(signer: &ArtifactSigner, project: &TempDir, rel: &str, ext: &str, body: &str) {
        let path = project.path().join(".ai").join(format!("{rel}.{ext}"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, signer.sign_document(body, ext)).unwrap();
    }

    const MODELS_YAML: &str = "\
tiers:
  general:
    model: claude-test
    provider: spindle/agent/providers/anthropic
models:
  claude-test:
    provider: spindle/agent/providers/anthropic
";

    const PROVIDER_YAML: &str = "\
id: spindle/agent/providers/anthropic
tool_type: http
context_window: 200000
config:
  url: https://example.invalid/v1/messages
";

    #[test]
    fn tier_resolves_to_model_and_provider() {
        let signer = ArtifactSigner::generate();
        let project = TempDir::new().unwrap();
        write_signed(&signer, &project, "config/models", "yaml", MODELS_YAML);
        write_signed(
            &signer,
            &project,
            "tools/spindle/agent/providers/anthropic",
            "yaml",
            PROVIDER_YAML,
        );
        let store = store_with(&signer, &project);

        let resolved = resolve_provider("general", None, &store).unwrap();
        assert_eq!(resolved.model, "claude-test");
        assert_eq!(resolved.provider_item_id, "spindle/agent/providers/anthropic");
        assert_eq!(resolved.config.context_window, 200_000);
    }

    #[test]
    fn explicit_model_resolves_through_the_table() {
        let signer = ArtifactSigner::generate();
        let project = TempDir::new().unwrap();
        write_signed(&signer, &project, "config/models", "yaml", MODELS_YAML);
        write_signed(
            &signer,
            &project,
            "tools/spindle/agent/providers/anthropic",
            "yaml",
            PROVIDER_YAML,
        );
        let store = store_with(&signer, &project);

        let resolved = resolve_provider("claude-test", None, &store).unwrap();
        assert_eq!(resolved.model, "claude-test");
    }

    #[test]
    fn unknown_model_without_hint_fails() {
        let signer = ArtifactSigner::generate();
        let project = TempDir::new().unwrap();
        let store = store_with(&signer, &project);
        assert!(matches!(
            resolve_provider("mystery", None, &store),
            Err(ProviderError::Resolution { .. })
        ));
    }

    #[test]
    fn provider_hint_wins() {
        let signer = ArtifactSigner::generate();
        let project = TempDir::new().unwrap();
        write_signed(&signer, &project, "config/models", "yaml", MODELS_YAML);
        write_signed(
            &signer,
            &project,
            "tools/custom/provider",
            "yaml",
            "tool_type: http\nconfig:\n  url: https://example.invalid\n",
        );
        let store = store_with(&signer, &project);

        let resolved = resolve_provider("claude-test", Some("custom/provider"), &store).unwrap();
        assert_eq!(resolved.provider_item_id, "custom/provider");
    }

    #[test]
    fn non_http_provider_is_rejected() {
        let signer = ArtifactSigner::generate();
        let project = TempDir::new().unwrap();
        write_signed(
            &signer,
            &project,
            "tools/odd/provider",
            "yaml",
            "tool_type: grpc\n",
        );
        let store = store_with(&signer, &project);
        let err = resolve_provider("m", Some("odd/provider"), &store).unwrap_err();
        assert!(err.to_string().contains("only 'http'"));
    }

    #[test]
    fn env_cascade_project_wins() {
        let user = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        fs::write(
            user.path().join(".env"),
            "SHARED=user\nUSER_ONLY=u\n# comment\n",
        )
        .unwrap();
        fs::write(
            project.path().join(".env"),
            "SHARED=\"project\"\nPROJECT_ONLY=p\n",
        )
        .unwrap();

        let env = load_env_cascade(Some(user.path()), project.path());
        assert_eq!(env.get("SHARED").map(String::as_str), Some("project"));
        assert_eq!(env.get("USER_ONLY").map(String::as_str), Some("u"));
        assert_eq!(env.get("PROJECT_ONLY").map(String::as_str), Some("p"));
    }
}
