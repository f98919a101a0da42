// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signature headers: `<prefix> spindle:signed:<ts>:<sha256>:<sig>:<fp>`.
//!
//! Line 1 of any signed file. Verification recomputes the SHA-256 over
//! everything after the header line and confirms the Ed25519 signature with
//! a fingerprint present in the trust store.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// The marker every signature header carries.
pub const SIGNATURE_TAG: &str = "spindle:signed";

/// Integrity failures. Never retryable.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    /// The document has no signature header line.
    #[error("missing signature header")]
    MissingHeader,

    /// The header line does not match the grammar.
    #[error("malformed signature header: {reason}")]
    MalformedHeader {
        /// What failed to parse.
        reason: String,
    },

    /// The recomputed body hash differs from the declared one.
    #[error("content hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch {
        /// Hash declared in the header.
        declared: String,
        /// Hash recomputed over the body.
        computed: String,
    },

    /// The signing key's fingerprint is not in the trust store.
    #[error("unknown key fingerprint: {fingerprint}")]
    UnknownFingerprint {
        /// Fingerprint from the header.
        fingerprint: String,
    },

    /// The Ed25519 signature does not verify.
    #[error("signature verification failed for fingerprint {fingerprint}")]
    BadSignature {
        /// Fingerprint whose key rejected the signature.
        fingerprint: String,
    },
}

/// Parsed signature header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Signing timestamp.
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 of the body (everything after the header line).
    pub content_hash: String,
    /// Base64url (unpadded) Ed25519 signature over the body hash bytes.
    pub signature: String,
    /// Hex fingerprint of the signing key.
    pub fingerprint: String,
}

impl SignatureHeader {
    /// Parse a header from its first line, tolerating any comment prefix.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::MalformedHeader`] when the tagged section
    /// does not split into the four expected fields, and
    /// [`IntegrityError::MissingHeader`] when the tag is absent.
    pub fn parse(line: &str) -> Result<Self, IntegrityError> {
        let start = line
            .find(SIGNATURE_TAG)
            .ok_or(IntegrityError::MissingHeader)?;
        let tagged = &line[start + SIGNATURE_TAG.len()..];
        let tagged = tagged.strip_prefix(':').ok_or_else(|| {
            IntegrityError::MalformedHeader {
                reason: "no fields after tag".to_string(),
            }
        })?;
        // Trailing comment closers (e.g. `-->`) are not part of the fields.
        let tagged = tagged.trim_end().trim_end_matches("-->").trim_end();

        // Timestamps contain ':' — split the three trailing fields off the
        // right instead.
        let mut parts = tagged.rsplitn(4, ':');
        let fingerprint = parts.next().unwrap_or_default().to_string();
        let signature = parts.next().unwrap_or_default().to_string();
        let content_hash = parts.next().unwrap_or_default().to_string();
        let ts_str = parts.next().unwrap_or_default();

        if fingerprint.is_empty() || signature.is_empty() || content_hash.is_empty() {
            return Err(IntegrityError::MalformedHeader {
                reason: "expected <ts>:<hash>:<sig>:<fingerprint>".to_string(),
            });
        }

        let timestamp = DateTime::parse_from_rfc3339(ts_str)
            .map_err(|e| IntegrityError::MalformedHeader {
                reason: format!("bad timestamp '{ts_str}': {e}"),
            })?
            .with_timezone(&Utc);

        Ok(Self {
            timestamp,
            content_hash,
            signature,
            fingerprint,
        })
    }

    /// Render the tagged section (no comment prefix).
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "{SIGNATURE_TAG}:{}:{}:{}:{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.content_hash,
            self.signature,
            self.fingerprint,
        )
    }
}

/// Hex SHA-256 over the body text.
#[must_use]
pub fn body_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Comment prefix for a file extension's signature line.
///
/// Markdown closes the comment; everything else is line-prefixed.
#[must_use]
pub fn comment_prefix_for_ext(ext: &str) -> (&'static str, &'static str) {
    match ext {
        "md" | "html" => ("<!-- ", " -->"),
        "rs" | "js" | "ts" => ("// ", ""),
        _ => ("# ", ""),
    }
}

/// Split a document into its optional header line and body.
///
/// The body is everything after the first line when that line carries the
/// signature tag; otherwise the whole document.
#[must_use]
pub fn split_document(text: &str) -> (Option<&str>, &str) {
    let first_line_end = text.find('\n');
    let first_line = match first_line_end {
        Some(end) => &text[..end],
        None => text,
    };
    if first_line.contains(SIGNATURE_TAG) {
        let body = first_line_end.map_or("", |end| &text[end + 1..]);
        (Some(first_line), body)
    } else {
        (None, text)
    }
}

fn fingerprint_of(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes[..n].iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Signer
// ---------------------------------------------------------------------------

/// Holds a signing key and produces signature headers.
pub struct ArtifactSigner {
    key: SigningKey,
}

impl std::fmt::Debug for ArtifactSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactSigner")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl ArtifactSigner {
    /// Generate a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    /// Build a signer from raw secret key bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    /// Raw secret key bytes (for key persistence).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// The public verifying key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Hex fingerprint of the verifying key.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.key.verifying_key())
    }

    /// Sign a body, producing the header fields.
    #[must_use]
    pub fn sign_body(&self, body: &str) -> SignatureHeader {
        let hash = body_hash(body);
        let sig: Signature = self.key.sign(hash.as_bytes());
        // Seconds precision: the rendered header must parse back identically.
        let now = Utc::now();
        SignatureHeader {
            timestamp: now.with_nanosecond(0).unwrap_or(now),
            content_hash: hash,
            signature: URL_SAFE_NO_PAD.encode(sig.to_bytes()),
            fingerprint: self.fingerprint(),
        }
    }

    /// Sign a whole document for a file extension, replacing any existing
    /// header line. Signing twice replaces the signature; the body hash is
    /// unchanged.
    #[must_use]
    pub fn sign_document(&self, text: &str, ext: &str) -> String {
        let (_, body) = split_document(text);
        let header = self.sign_body(body);
        let (open, close) = comment_prefix_for_ext(ext);
        format!("{open}{}{close}\n{body}", header.render())
    }

    /// Sign raw bytes (for detached transcript checkpoints).
    #[must_use]
    pub fn sign_bytes(&self, bytes: &[u8]) -> (String, String) {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = format!("{:x}", hasher.finalize());
        let sig: Signature = self.key.sign(hash.as_bytes());
        (hash, URL_SAFE_NO_PAD.encode(sig.to_bytes()))
    }
}

// ---------------------------------------------------------------------------
// Trust store
// ---------------------------------------------------------------------------

/// Fingerprint → verifying-key table.
///
/// Copy-on-read from disk; no mutation of loaded keys in memory.
#[derive(Debug, Default, Clone)]
pub struct TrustStore {
    keys: BTreeMap<String, VerifyingKey>,
}

impl TrustStore {
    /// An empty trust store (verifies nothing).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust a verifying key; returns its fingerprint.
    pub fn insert(&mut self, key: VerifyingKey) -> String {
        let fp = fingerprint_of(&key);
        self.keys.insert(fp.clone(), key);
        fp
    }

    /// Whether a fingerprint is trusted.
    #[must_use]
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.keys.contains_key(fingerprint)
    }

    /// Number of trusted keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load a trust store from a YAML file mapping fingerprint →
    /// base64url-encoded public key.
    ///
    /// # Errors
    ///
    /// Returns an error string when the file cannot be read or a key does
    /// not decode.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text =
            std::fs::read_to_string(path).map_err(|e| format!("read {}: {e}", path.display()))?;
        let raw: BTreeMap<String, String> =
            serde_yaml::from_str(&text).map_err(|e| format!("parse {}: {e}", path.display()))?;
        let mut store = Self::new();
        for (fp, encoded) in raw {
            let bytes = URL_SAFE_NO_PAD
                .decode(&encoded)
                .map_err(|e| format!("key {fp}: {e}"))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| format!("key {fp}: wrong length"))?;
            let key =
                VerifyingKey::from_bytes(&arr).map_err(|e| format!("key {fp}: {e}"))?;
            store.keys.insert(fp, key);
        }
        Ok(store)
    }

    /// Verify a signed document. Returns the body hash on success.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError`] on a missing/malformed header, hash
    /// mismatch, untrusted fingerprint, or bad signature.
    pub fn verify_document(&self, text: &str) -> Result<String, IntegrityError> {
        let (header_line, body) = split_document(text);
        let header_line = header_line.ok_or(IntegrityError::MissingHeader)?;
        let header = SignatureHeader::parse(header_line)?;
        self.verify(&header, body)
    }

    /// Verify parsed header fields against a body. Returns the hash.
    ///
    /// # Errors
    ///
    /// See [`TrustStore::verify_document`].
    pub fn verify(&self, header: &SignatureHeader, body: &str) -> Result<String, IntegrityError> {
        let computed = body_hash(body);
        if computed != header.content_hash {
            return Err(IntegrityError::HashMismatch {
                declared: header.content_hash.clone(),
                computed,
            });
        }

        let key = self
            .keys
            .get(&header.fingerprint)
            .ok_or_else(|| IntegrityError::UnknownFingerprint {
                fingerprint: header.fingerprint.clone(),
            })?;

        let sig_bytes =
            URL_SAFE_NO_PAD
                .decode(&header.signature)
                .map_err(|_| IntegrityError::MalformedHeader {
                    reason: "signature is not base64url".to_string(),
                })?;
        let sig_arr: [u8; 64] =
            sig_bytes
                .try_into()
                .map_err(|_| IntegrityError::MalformedHeader {
                    reason: "signature has wrong length".to_string(),
                })?;
        let signature = Signature::from_bytes(&sig_arr);

        key.verify(computed.as_bytes(), &signature)
            .map_err(|_| IntegrityError::BadSignature {
                fingerprint: header.fingerprint.clone(),
            })?;

        Ok(computed)
    }

    /// Verify a detached byte-range signature (transcript checkpoints).
    ///
    /// # Errors
    ///
    /// See [`TrustStore::verify_document`].
    pub fn verify_bytes(
        &self,
        bytes: &[u8],
        declared_hash: &str,
        signature_b64: &str,
        fingerprint: &str,
    ) -> Result<(), IntegrityError> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let computed = format!("{:x}", hasher.finalize());
        if computed != declared_hash {
            return Err(IntegrityError::HashMismatch {
                declared: declared_hash.to_string(),
                computed,
            });
        }
        let key = self
            .keys
            .get(fingerprint)
            .ok_or_else(|| IntegrityError::UnknownFingerprint {
                fingerprint: fingerprint.to_string(),
            })?;
        let sig_bytes =
            URL_SAFE_NO_PAD
                .decode(signature_b64)
                .map_err(|_| IntegrityError::MalformedHeader {
                    reason: "signature is not base64url".to_string(),
                })?;
        let sig_arr: [u8; 64] =
            sig_bytes
                .try_into()
                .map_err(|_| IntegrityError::MalformedHeader {
                    reason: "signature has wrong length".to_string(),
                })?;
        key.verify(computed.as_bytes(), &Signature::from_bytes(&sig_arr))
            .map_err(|_| IntegrityError::BadSignature {
                fingerprint: fingerprint.to_string(),
            })
    }
}
