// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed `thread.json` metadata snapshots.
//!
//! The snapshot carries resolved limits (including depth) and effective
//! capabilities so child threads can look up parent context from the
//! filesystem. The signature protects those fields: it is embedded as a
//! `_signature` field computed over the canonical JSON without it.

use serde_json::{Map, Value};
use spindle_artifact::ArtifactSigner;
use std::path::{Path, PathBuf};

fn meta_path(project_root: &Path, thread_id: &str) -> PathBuf {
    project_root
        .join(".ai")
        .join("agent")
        .join("threads")
        .join(thread_id)
        .join("thread.json")
}

fn canonical_without_signature(meta: &Map<String, Value>) -> String {
    let mut clean = meta.clone();
    clean.remove("_signature");
    // BTreeMap keys give a deterministic canonical form.
    let ordered: std::collections::BTreeMap<&String, &Value> = clean.iter().collect();
    serde_json::to_string(&ordered).expect("meta is always serialisable")
}

/// Write a thread's metadata snapshot atomically, signed.
///
/// # Errors
///
/// I/O failures.
pub fn write_thread_meta(
    project_root: &Path,
    thread_id: &str,
    mut meta: Map<String, Value>,
    signer: &ArtifactSigner,
) -> std::io::Result<PathBuf> {
    let path = meta_path(project_root, thread_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let canonical = canonical_without_signature(&meta);
    let header = signer.sign_body(&canonical);
    meta.insert("_signature".to_string(), Value::String(header.render()));

    let json = serde_json::to_string_pretty(&Value::Object(meta))
        .expect("meta is always serialisable");
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Read a thread's metadata snapshot. Returns `None` when absent or
/// unparseable.
#[must_use]
pub fn read_thread_meta(project_root: &Path, thread_id: &str) -> Option<Map<String, Value>> {
    let path = meta_path(project_root, thread_id);
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Value>(&text).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Verify a snapshot's embedded signature against a trust store.
///
/// # Errors
///
/// [`spindle_artifact::IntegrityError`] when the signature is missing,
/// malformed, or does not verify.
pub fn verify_thread_meta(
    meta: &Map<String, Value>,
    trust: &spindle_artifact::TrustStore,
) -> Result<(), spindle_artifact::IntegrityError> {
    let header_line = meta
        .get("_signature")
        .and_then(Value::as_str)
        .ok_or(spindle_artifact::IntegrityError::MissingHeader)?;
    let header = spindle_artifact::SignatureHeader::parse(header_line)?;
    let canonical = canonical_without_signature(meta);
    trust.verify(&header, &canonical).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spindle_artifact::TrustStore;
    use tempfile::TempDir;

    fn meta_fixture() -> Map<String, Value> {
        let Value::Object(map) = json!({
            "thread_id": "d/d-1",
            "directive": "d",
            "status": "running",
            "limits": {"turns": 10.0, "depth": 4.0},
            "capabilities": ["spindle.execute.tool.fs.*"],
        }) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn write_read_verify_roundtrip() {
        let dir = TempDir::new().unwrap();
        let signer = ArtifactSigner::generate();
        let mut trust = TrustStore::new();
        trust.insert(signer.verifying_key());

        write_thread_meta(dir.path(), "d/d-1", meta_fixture(), &signer).unwrap();
        let read = read_thread_meta(dir.path(), "d/d-1").unwrap();
        assert_eq!(read["directive"], "d");
        verify_thread_meta(&read, &trust).unwrap();
    }

    #[test]
    fn tampered_meta_fails_verification() {
        let dir = TempDir::new().unwrap();
        let signer = ArtifactSigner::generate();
        let mut trust = TrustStore::new();
        trust.insert(signer.verifying_key());

        write_thread_meta(dir.path(), "d/d-2", meta_fixture(), &signer).unwrap();
        let mut read = read_thread_meta(dir.path(), "d/d-2").unwrap();
        read.insert(
            "capabilities".to_string(),
            json!(["spindle.*"]),
        );
        assert!(verify_thread_meta(&read, &trust).is_err());
    }

    #[test]
    fn missing_meta_reads_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_thread_meta(dir.path(), "nope").is_none());
    }
}
