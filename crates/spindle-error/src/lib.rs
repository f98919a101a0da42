// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the spindle kernel.
//!
//! Every kernel error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context. Use the builder returned by
//! [`KernelError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Directive loading / validation errors.
    Directive,
    /// Artifact signature / hash integrity errors.
    Integrity,
    /// Capability and risk-policy errors.
    Permission,
    /// Limit and budget errors.
    Budget,
    /// LLM provider HTTP / streaming errors.
    Provider,
    /// Tool dispatch errors.
    Dispatch,
    /// Transcript, resume, and continuation-chain errors.
    Transcript,
    /// Hook evaluation errors.
    Hook,
    /// Configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Directive => "directive",
            Self::Integrity => "integrity",
            Self::Permission => "permission",
            Self::Budget => "budget",
            Self::Provider => "provider",
            Self::Dispatch => "dispatch",
            Self::Transcript => "transcript",
            Self::Hook => "hook",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Directive --
    /// The requested directive id resolved to no artifact in any tier.
    DirectiveNotFound,
    /// The directive parsed but failed semantic validation.
    DirectiveValidationError,

    // -- Integrity --
    /// Signature or content hash mismatch on a signed artifact.
    IntegrityError,

    // -- Permission --
    /// A required capability is not granted by the effective token.
    PermissionDenied,
    /// A capability is risk-classified as blocked and not acknowledged.
    RiskBlocked,

    // -- Budget --
    /// An accumulated cost dimension crossed its configured threshold.
    LimitExceeded,
    /// The parent thread cannot afford the requested reservation.
    BudgetInsufficient,
    /// Actual spend exceeded the reserved amount.
    BudgetOverspend,

    // -- Provider --
    /// HTTP/API failure from an LLM provider.
    ProviderCallError,
    /// The provider stream ended abnormally or produced unreadable chunks.
    ProviderStreamError,

    // -- Dispatch --
    /// A primary-tool dispatch failed.
    ToolDispatchError,
    /// Streaming tool input JSON could not be parsed.
    ToolInputParseError,

    // -- Transcript --
    /// Transcript JSONL has unparseable lines.
    TranscriptCorrupt,
    /// A thread cannot be resumed — insufficient or untrusted recovery data.
    ResumeImpossible,
    /// Cycle or break in a continuation chain.
    ChainResolutionError,
    /// Transcript checkpoint signing failed; the thread must stop.
    CheckpointFailed,

    // -- Hook --
    /// A hook attempted to blank a non-empty error.
    HookOverrideError,

    // -- Config --
    /// Configuration file or value is invalid.
    ConfigInvalid,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DirectiveNotFound | Self::DirectiveValidationError => ErrorCategory::Directive,

            Self::IntegrityError => ErrorCategory::Integrity,

            Self::PermissionDenied | Self::RiskBlocked => ErrorCategory::Permission,

            Self::LimitExceeded | Self::BudgetInsufficient | Self::BudgetOverspend => {
                ErrorCategory::Budget
            }

            Self::ProviderCallError | Self::ProviderStreamError => ErrorCategory::Provider,

            Self::ToolDispatchError | Self::ToolInputParseError => ErrorCategory::Dispatch,

            Self::TranscriptCorrupt
            | Self::ResumeImpossible
            | Self::ChainResolutionError
            | Self::CheckpointFailed => ErrorCategory::Transcript,

            Self::HookOverrideError => ErrorCategory::Hook,

            Self::ConfigInvalid => ErrorCategory::Config,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"PERMISSION_DENIED"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectiveNotFound => "DIRECTIVE_NOT_FOUND",
            Self::DirectiveValidationError => "DIRECTIVE_VALIDATION_ERROR",
            Self::IntegrityError => "INTEGRITY_ERROR",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::RiskBlocked => "RISK_BLOCKED",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::BudgetInsufficient => "BUDGET_INSUFFICIENT",
            Self::BudgetOverspend => "BUDGET_OVERSPEND",
            Self::ProviderCallError => "PROVIDER_CALL_ERROR",
            Self::ProviderStreamError => "PROVIDER_STREAM_ERROR",
            Self::ToolDispatchError => "TOOL_DISPATCH_ERROR",
            Self::ToolInputParseError => "TOOL_INPUT_PARSE_ERROR",
            Self::TranscriptCorrupt => "TRANSCRIPT_CORRUPT",
            Self::ResumeImpossible => "RESUME_IMPOSSIBLE",
            Self::ChainResolutionError => "CHAIN_RESOLUTION_ERROR",
            Self::CheckpointFailed => "CHECKPOINT_FAILED",
            Self::HookOverrideError => "HOOK_OVERRIDE_ERROR",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// KernelError
// ---------------------------------------------------------------------------

/// Unified kernel error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use spindle_error::{ErrorCode, KernelError};
///
/// let err = KernelError::new(ErrorCode::BudgetInsufficient, "parent cannot afford child")
///     .with_context("parent_id", "root-1")
///     .with_context("requested", 0.6);
/// ```
pub struct KernelError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl KernelError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Whether this error may be retried per the taxonomy.
    ///
    /// Integrity and permission failures are never retryable; provider call
    /// errors consult their recorded `retryable` context flag.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self.code {
            ErrorCode::ProviderCallError | ErrorCode::ProviderStreamError => self
                .context
                .get("retryable")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl fmt::Debug for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("KernelError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for KernelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`KernelError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&KernelError> for KernelErrorDto {
    fn from(err: &KernelError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<KernelErrorDto> for KernelError {
    fn from(dto: KernelErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Limit codes
// ---------------------------------------------------------------------------

/// The cost dimension that breached its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitCode {
    /// Turn counter reached the configured ceiling.
    Turns,
    /// Total token count reached the configured ceiling.
    Tokens,
    /// Accumulated spend reached the configured ceiling.
    Spend,
    /// Child-spawn counter reached the configured ceiling.
    Spawns,
    /// Wall-clock duration reached the configured ceiling.
    DurationSeconds,
    /// Remaining spawnable depth is exhausted.
    Depth,
}

impl LimitCode {
    /// Stable snake_case representation (e.g. `"duration_seconds"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Turns => "turns",
            Self::Tokens => "tokens",
            Self::Spend => "spend",
            Self::Spawns => "spawns",
            Self::DurationSeconds => "duration_seconds",
            Self::Depth => "depth",
        }
    }
}

impl fmt::Display for LimitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
