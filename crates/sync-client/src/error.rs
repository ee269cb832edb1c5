use sync_core::{SyncError, SyncErrorCategory, TransportError};
use thiserror::Error;

/// Failures surfaced by the orchestrator and session factory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Missing or invalid session identity, raised before any worker exists.
    #[error("sync setup failed: {0}")]
    Setup(SyncError),
    #[error("sync worker unreachable: {0}")]
    Transport(#[from] TransportError),
    /// Error reported by the worker in its response.
    #[error("sync worker rejected request: {0}")]
    Remote(SyncError),
    #[error("session store failed: {0}")]
    Store(SyncError),
}

impl ClientError {
    pub fn missing_session_id() -> Self {
        Self::Setup(SyncError::new(
            SyncErrorCategory::Config,
            "missing_session_id",
            "session has no id; cannot start sync",
        ))
    }

    pub fn to_sync_error(&self) -> SyncError {
        match self {
            Self::Setup(err) | Self::Remote(err) | Self::Store(err) => err.clone(),
            Self::Transport(err) => SyncError::from(err.clone()),
        }
    }
}
