// SPDX-License-Identifier: MIT OR Apache-2.0
//! Signed artifact store for the spindle kernel.
//!
//! Artifacts (directives, tools, knowledge, configs, bundle manifests) are
//! independent signed files on a layered filesystem. This crate provides
//! the signature header scheme (Ed25519 over a SHA-256 body hash, with a
//! trust store of key fingerprints), the three-tier id → path resolution
//! (project → user → system), hash-keyed verification caching, and bundle
//! manifest verification.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bundle;
mod signature;
mod store;

pub use bundle::{BundleManifest, verify_bundle};
pub use signature::{
    ArtifactSigner, IntegrityError, SIGNATURE_TAG, SignatureHeader, TrustStore, body_hash,
    comment_prefix_for_ext, split_document,
};
pub use store::{ArtifactStore, ItemType, StoreError, Tier, VerifiedArtifact};
