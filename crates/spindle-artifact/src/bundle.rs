// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bundle manifests: a signed `manifest.yaml` listing every covered file's
//! SHA-256.

use crate::signature::{IntegrityError, TrustStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// Parsed bundle manifest body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Bundle id.
    #[serde(default)]
    pub id: String,
    /// Bundle version.
    #[serde(default)]
    pub version: String,
    /// Relative path → hex SHA-256 of the full file bytes.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// Verify a bundle directory against its signed `manifest.yaml`.
///
/// The manifest's own signature is checked first, then every listed file's
/// SHA-256. Returns the parsed manifest on success.
///
/// # Errors
///
/// Returns [`IntegrityError`] on a bad manifest signature, a missing
/// covered file, or a file hash mismatch.
pub fn verify_bundle(bundle_dir: &Path, trust: &TrustStore) -> Result<BundleManifest, IntegrityError> {
    let manifest_path = bundle_dir.join("manifest.yaml");
    let text = std::fs::read_to_string(&manifest_path).map_err(|e| {
        IntegrityError::MalformedHeader {
            reason: format!("cannot read {}: {e}", manifest_path.display()),
        }
    })?;

    trust.verify_document(&text)?;

    let (_, body) = crate::signature::split_document(&text);
    let manifest: BundleManifest =
        serde_yaml::from_str(body).map_err(|e| IntegrityError::MalformedHeader {
            reason: format!("manifest body: {e}"),
        })?;

    for (rel_path, declared) in &manifest.files {
        let file_path = bundle_dir.join(rel_path);
        let bytes = std::fs::read(&file_path).map_err(|e| IntegrityError::MalformedHeader {
            reason: format!("covered file {} unreadable: {e}", file_path.display()),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let computed = format!("{:x}", hasher.finalize());
        if &computed != declared {
            return Err(IntegrityError::HashMismatch {
                declared: declared.clone(),
                computed,
            });
        }
    }

    Ok(manifest)
}
