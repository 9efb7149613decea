use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{crypto::CryptoError, retry::RetryExhausted};

/// Broad error category used for logging and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by homeserver.
    RateLimited,
    /// Cryptographic/encryption failure.
    Crypto,
    /// Room state cache or other local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal backend bug or invariant break.
    Internal,
    /// Every attempt allowed by the retry policy failed.
    RetryExhausted,
}

/// Stable error payload passed between the store, the delivery pipeline and
/// the protocol adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    /// High-level error category.
    pub category: BackendErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
    /// Underlying failure, kept for diagnostics on terminal errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[source]
    pub cause: Option<Box<BackendError>>,
}

impl BackendError {
    /// Construct a new backend error.
    pub fn new(
        category: BackendErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
            cause: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Attach the error that caused this one.
    pub fn with_cause(mut self, cause: BackendError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Build a serialization error for content that could not be encoded.
    pub fn serialization(message: impl Display) -> Self {
        Self::new(
            BackendErrorCategory::Serialization,
            "serialization_failed",
            message.to_string(),
        )
    }

    /// Build the terminal error returned once the retry budget is spent.
    ///
    /// The last underlying failure is kept as `cause`.
    pub fn retry_exhausted(exhausted: RetryExhausted<BackendError>) -> Self {
        let message = exhausted.to_string();
        Self::new(BackendErrorCategory::RetryExhausted, "retry_exhausted", message)
            .with_cause(exhausted.last_error)
    }

    /// Build the error returned when distributing a group session fails.
    pub fn group_session_share(err: CryptoError) -> Self {
        Self::new(
            BackendErrorCategory::Crypto,
            "group_session_share_failed",
            err.to_string(),
        )
    }

    /// Walk the `cause` chain down to the innermost error.
    pub fn root_cause(&self) -> &BackendError {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }
}

impl From<CryptoError> for BackendError {
    fn from(err: CryptoError) -> Self {
        Self::new(BackendErrorCategory::Crypto, err.code(), err.to_string())
    }
}

/// Map HTTP status codes to backend error categories.
pub fn classify_http_status(status: u16) -> BackendErrorCategory {
    match status {
        401 | 403 => BackendErrorCategory::Auth,
        408 | 429 => BackendErrorCategory::RateLimited,
        400..=499 => BackendErrorCategory::Config,
        500..=599 => BackendErrorCategory::Network,
        _ => BackendErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), BackendErrorCategory::Auth);
        assert_eq!(classify_http_status(429), BackendErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), BackendErrorCategory::Config);
        assert_eq!(classify_http_status(503), BackendErrorCategory::Network);
        assert_eq!(classify_http_status(700), BackendErrorCategory::Internal);
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = BackendError::new(BackendErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn retry_exhausted_keeps_last_failure_as_cause() {
        let last = BackendError::new(BackendErrorCategory::Network, "send_failed", "timeout");
        let err = BackendError::retry_exhausted(RetryExhausted {
            description: "send m.room.message to !a:example.org".to_owned(),
            attempts: 6,
            last_error: last.clone(),
        });

        assert_eq!(err.category, BackendErrorCategory::RetryExhausted);
        assert_eq!(err.code, "retry_exhausted");
        assert_eq!(err.cause.as_deref(), Some(&last));
        assert_eq!(err.root_cause(), &last);
        assert!(err.message.contains("after 6 attempts"));
    }

    #[test]
    fn crypto_errors_keep_stable_codes() {
        let err = BackendError::from(CryptoError::NoGroupSession);
        assert_eq!(err.category, BackendErrorCategory::Crypto);
        assert_eq!(err.code, "no_group_session");

        let err = BackendError::group_session_share(CryptoError::Other("offline".to_owned()));
        assert_eq!(err.code, "group_session_share_failed");
        assert!(err.message.contains("offline"));
    }

    #[test]
    fn cause_is_omitted_from_serialized_form_when_absent() {
        let err = BackendError::new(BackendErrorCategory::Storage, "storage_error", "disk");
        let json = serde_json::to_value(&err).expect("serialize");
        assert!(json.get("cause").is_none());
    }
}
