//! Structured error taxonomy for SCM and ingestion operations.
//!
//! Two channels exist and must stay separate:
//! - [`ScmError`] variants propagate to the caller (configuration, auth,
//!   not-found, rate-limit, hard API failures).
//! - Per-file ingestion outcomes are never errors; they are collected into
//!   [`crate::models::IngestionError`] records inside the sync result.

use thiserror::Error;

/// Errors raised by the SCM provider layer and the retry client.
#[derive(Debug, Error)]
pub enum ScmError {
    /// Missing or invalid local configuration. Raised before any network call.
    #[error("configuration error: {0}")]
    Config(String),

    /// No usable credentials for the SCM API.
    #[error(
        "no valid authentication configured; provide scm.auth_token or both \
         scm.auth_username and scm.auth_password"
    )]
    Auth,

    /// Repository, organization, or file does not exist. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 429 after the retry budget was exhausted. Carries the parsed
    /// `Retry-After` value so callers can reschedule.
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    /// The API answered with a structured error body (`errors` field or a
    /// provider-specific `message`).
    #[error("SCM API error: {0}")]
    Api(String),

    /// Persistent non-success status with no usable body.
    #[error("failed to fetch from API (status {status})")]
    Fetch { status: u16 },

    /// Transport-level failure (connect, reset, timeout) after all attempts.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ScmError {
    /// True for conditions a caller may resolve by waiting and resubmitting.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ScmError::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_carries_hint() {
        let err = ScmError::RateLimited { retry_after: 60 };
        assert!(err.is_rate_limit());
        assert!(err.to_string().contains("60"));
    }

    #[test]
    fn not_found_is_not_rate_limit() {
        assert!(!ScmError::NotFound("repo x".into()).is_rate_limit());
    }
}
