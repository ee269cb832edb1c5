use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SyncStatus;

/// Broad error category used for retry decisions and user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Invalid input, missing identity, or other configuration issue.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by homeserver.
    RateLimited,
    /// Local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload carried across the worker boundary.
///
/// This is the `error` field of a response and the payload of `SyncFailed`
/// events, so it must stay plain data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new sync error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-status-transition error.
    pub fn invalid_transition(current: SyncStatus, next: SyncStatus) -> Self {
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_status_transition",
            format!("cannot move sync status from {current} to {next}"),
        )
    }

    /// Whether a sync loop may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::Network | SyncErrorCategory::RateLimited
        )
    }
}

/// Failures of the worker transport itself, as opposed to errors the worker
/// reports inside a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The worker terminated, or the channel was closed, before a response.
    #[error("sync worker is disconnected")]
    Disconnected,
    /// A response did not fit the request it claimed to answer.
    #[error("sync worker protocol error: {0}")]
    Protocol(String),
    /// The worker inbox is full; fire-and-forget delivery was refused.
    #[error("sync worker inbox is full")]
    Busy,
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        let code = match err {
            TransportError::Disconnected => "worker_disconnected",
            TransportError::Protocol(_) => "worker_protocol_error",
            TransportError::Busy => "worker_busy",
        };
        Self::new(SyncErrorCategory::Internal, code, err.to_string())
    }
}

/// Map HTTP status codes to sync error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        408 | 429 => SyncErrorCategory::RateLimited,
        400..=499 => SyncErrorCategory::Config,
        500..=599 => SyncErrorCategory::Network,
        _ => SyncErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), SyncErrorCategory::Auth);
        assert_eq!(classify_http_status(429), SyncErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), SyncErrorCategory::Config);
        assert_eq!(classify_http_status(503), SyncErrorCategory::Network);
        assert_eq!(classify_http_status(700), SyncErrorCategory::Internal);
    }

    #[test]
    fn invalid_transition_code_is_stable() {
        let err = SyncError::invalid_transition(SyncStatus::Stopped, SyncStatus::Syncing);
        assert_eq!(err.code, "invalid_status_transition");
        assert_eq!(err.category, SyncErrorCategory::Internal);
        assert!(err.message.contains("Stopped"));
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = SyncError::new(SyncErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn only_network_and_rate_limit_errors_are_recoverable() {
        let network = SyncError::new(SyncErrorCategory::Network, "n", "network");
        let rate = SyncError::new(SyncErrorCategory::RateLimited, "r", "rate");
        let auth = SyncError::new(SyncErrorCategory::Auth, "a", "auth");

        assert!(network.is_recoverable());
        assert!(rate.is_recoverable());
        assert!(!auth.is_recoverable());
    }

    #[test]
    fn transport_errors_map_to_stable_codes() {
        let err = SyncError::from(TransportError::Disconnected);
        assert_eq!(err.code, "worker_disconnected");
        assert_eq!(err.category, SyncErrorCategory::Internal);
    }
}
