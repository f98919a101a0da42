// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed checkpoints over the transcript's cumulative byte range.
//!
//! A checkpoint is a detached signature line appended to the JSONL at turn
//! boundaries: it records the number of bytes it covers (everything before
//! the checkpoint line, previous checkpoints included), their SHA-256, and
//! an Ed25519 signature. Verification walks checkpoints in order; the
//! configurable lenient mode tolerates an unsigned trailing region when the
//! last checkpoint is intact.

use serde::{Deserialize, Serialize};
use spindle_artifact::{ArtifactSigner, IntegrityError, TrustStore};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Checkpoint line payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointLine {
    checkpoint: CheckpointBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointBody {
    step: u32,
    covered_bytes: u64,
    hash: String,
    signature: String,
    fingerprint: String,
}

/// Result of verifying a transcript's checkpoint chain.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointVerification {
    /// Whether the transcript passed under the requested strictness.
    pub valid: bool,
    /// Step of the last intact checkpoint, if any.
    pub last_checkpoint_step: Option<u32>,
    /// Bytes after the last checkpoint not covered by any signature.
    pub trailing_unsigned_bytes: u64,
    /// Failure description when invalid.
    pub error: Option<String>,
}

/// Signs and verifies transcript checkpoints.
pub struct TranscriptSigner<'a> {
    path: PathBuf,
    signer: &'a ArtifactSigner,
}

impl std::fmt::Debug for TranscriptSigner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptSigner")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl<'a> TranscriptSigner<'a> {
    /// Bind a signer to a transcript file.
    #[must_use]
    pub fn new(transcript_path: impl Into<PathBuf>, signer: &'a ArtifactSigner) -> Self {
        Self {
            path: transcript_path.into(),
            signer,
        }
    }

    /// Sign the cumulative byte range and append the checkpoint line.
    ///
    /// Serialized with writes by the caller (the thread's single appender):
    /// no event may be appended between the byte-range hash and the
    /// signature line.
    ///
    /// # Errors
    ///
    /// I/O failures; the runner maps these to `CheckpointFailed` and stops
    /// the thread.
    pub fn checkpoint(&self, step: u32) -> std::io::Result<()> {
        let bytes = std::fs::read(&self.path)?;
        let (hash, signature) = self.signer.sign_bytes(&bytes);
        let line = CheckpointLine {
            checkpoint: CheckpointBody {
                step,
                covered_bytes: bytes.len() as u64,
                hash,
                signature,
                fingerprint: self.signer.fingerprint(),
            },
        };
        let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        writeln!(
            file,
            "{}",
            serde_json::to_string(&line).expect("checkpoint is always serialisable")
        )?;
        file.flush()
    }

    /// Checkpoint with a serialized walker state: appends a
    /// `state_snapshot` event first, then signs the cumulative range
    /// including it.
    ///
    /// # Errors
    ///
    /// Transcript write or checkpoint I/O failures.
    pub fn checkpoint_with_snapshot(
        &self,
        transcript: &crate::transcript::Transcript,
        step: u32,
        state: serde_json::Value,
        current_node: Option<&str>,
    ) -> std::io::Result<()> {
        let mut payload = serde_json::json!({"step": step, "state": state});
        if let Some(node) = current_node {
            payload["current_node"] = serde_json::Value::String(node.to_string());
        }
        transcript
            .write_event(spindle_core::event::STATE_SNAPSHOT, payload)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        self.checkpoint(step)
    }

    /// Verify a transcript's checkpoint chain.
    ///
    /// Every checkpoint's byte range must hash and verify. With
    /// `allow_unsigned_trailing`, bytes after the last checkpoint are
    /// tolerated; without it any unsigned trailing region invalidates the
    /// transcript. A transcript with no checkpoints is valid only in
    /// lenient mode (the whole file is trailing).
    #[must_use]
    pub fn verify(
        path: &Path,
        trust: &TrustStore,
        allow_unsigned_trailing: bool,
    ) -> CheckpointVerification {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                return CheckpointVerification {
                    valid: false,
                    last_checkpoint_step: None,
                    trailing_unsigned_bytes: 0,
                    error: Some(format!("cannot read transcript: {e}")),
                };
            }
        };

        let mut last_step = None;
        let mut covered_end: u64 = 0;
        let mut offset: u64 = 0;

        for line in bytes.split_inclusive(|b| *b == b'\n') {
            let line_start = offset;
            offset += line.len() as u64;

            let text = String::from_utf8_lossy(line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<CheckpointLine>(trimmed) else {
                continue;
            };
            let cp = parsed.checkpoint;

            // The checkpoint must cover exactly the bytes before its line.
            if cp.covered_bytes != line_start {
                return CheckpointVerification {
                    valid: false,
                    last_checkpoint_step: last_step,
                    trailing_unsigned_bytes: 0,
                    error: Some(format!(
                        "checkpoint {} covers {} bytes but sits at offset {}",
                        cp.step, cp.covered_bytes, line_start
                    )),
                };
            }

            let covered = &bytes[..cp.covered_bytes as usize];
            if let Err(e) = verify_range(trust, covered, &cp) {
                return CheckpointVerification {
                    valid: false,
                    last_checkpoint_step: last_step,
                    trailing_unsigned_bytes: 0,
                    error: Some(format!("checkpoint {} invalid: {e}", cp.step)),
                };
            }

            last_step = Some(cp.step);
            covered_end = offset;
        }

        let trailing = bytes.len() as u64 - covered_end;
        let valid = trailing == 0 || (allow_unsigned_trailing && last_step.is_some());
        CheckpointVerification {
            valid,
            last_checkpoint_step: last_step,
            trailing_unsigned_bytes: trailing,
            error: if valid {
                None
            } else if last_step.is_none() {
                Some("transcript has no checkpoints".to_string())
            } else {
                Some(format!("{trailing} unsigned trailing bytes"))
            },
        }
    }
}

fn verify_range(
    trust: &TrustStore,
    covered: &[u8],
    cp: &CheckpointBody,
) -> Result<(), IntegrityError> {
    trust.verify_bytes(covered, &cp.hash, &cp.signature, &cp.fingerprint)
}
