// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provider error classification.

/// Provider failures.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// A nonzero HTTP status with a structured (or opaque) error body, or a
    /// transport failure (`http_status == 0`).
    #[error("provider '{provider_id}' failed (HTTP {http_status}): {message}")]
    Call {
        /// Provider artifact id.
        provider_id: String,
        /// Most specific error message available.
        message: String,
        /// HTTP status; 0 for transport failures.
        http_status: u16,
        /// Provider request id, when the response carried one.
        request_id: String,
        /// Provider error type tag, when the body carried one.
        error_type: String,
        /// Whether the call may be retried.
        retryable: bool,
    },

    /// The stream ended abnormally.
    #[error("provider '{provider_id}' stream failed: {message}")]
    Stream {
        /// Provider artifact id.
        provider_id: String,
        /// Failure description.
        message: String,
    },

    /// The provider configuration could not be resolved or parsed.
    #[error("provider resolution failed for '{model}': {reason}")]
    Resolution {
        /// Model or tier that was requested.
        model: String,
        /// Failure description.
        reason: String,
    },
}

impl ProviderError {
    /// HTTP statuses the kernel treats as retryable: transport failures,
    /// rate limits, and the transient 5xx subset.
    #[must_use]
    pub fn status_is_retryable(status: u16) -> bool {
        matches!(status, 0 | 429 | 500 | 502 | 503 | 529)
    }

    /// Whether this error may be retried.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Call { retryable, .. } => *retryable,
            Self::Stream { .. } => true,
            Self::Resolution { .. } => false,
        }
    }

    /// HTTP status, when the error carries one.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Call { http_status, .. } => Some(*http_status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_set() {
        for status in [0u16, 429, 500, 502, 503, 529] {
            assert!(ProviderError::status_is_retryable(status), "{status}");
        }
        for status in [400u16, 401, 403, 404, 422, 501] {
            assert!(!ProviderError::status_is_retryable(status), "{status}");
        }
    }

    #[test]
    fn resolution_errors_never_retry() {
        let err = ProviderError::Resolution {
            model: "general".into(),
            reason: "no provider".into(),
        };
        assert!(!err.retryable());
        assert!(err.http_status().is_none());
    }
}
