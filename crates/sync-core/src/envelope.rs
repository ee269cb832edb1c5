//! Message shapes exchanged with the sync worker.
//!
//! Requests and responses are correlated by [`RequestId`]; events are
//! unsolicited and carry no id. Every request kind has exactly one response
//! kind, which lets the transport reject responses that answer the wrong
//! question.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::SyncError,
    types::{PendingEventData, SessionChanges, StartSyncParams, SyncStatus},
};

/// Correlation token linking a request to its single response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Monotonic id source; one per transport channel.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl RequestIdGenerator {
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Discriminator of request (and response) kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SyncRequestType {
    StartSync,
    AddPendingEvent,
}

/// Request payloads accepted by the sync worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum SyncRequest {
    /// Start (or attach to) the sync loop for a session.
    StartSync(StartSyncParams),
    /// Hand a locally queued outgoing event to the worker.
    AddPendingEvent { pending_event: PendingEventData },
}

impl SyncRequest {
    pub fn kind(&self) -> SyncRequestType {
        match self {
            Self::StartSync(_) => SyncRequestType::StartSync,
            Self::AddPendingEvent { .. } => SyncRequestType::AddPendingEvent,
        }
    }
}

/// Response payloads, one variant per request kind.
///
/// `Err` is the remote-reported `error` field of the response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum SyncResponse {
    StartSync(Result<(), SyncError>),
    AddPendingEvent(Result<(), SyncError>),
}

impl SyncResponse {
    pub fn kind(&self) -> SyncRequestType {
        match self {
            Self::StartSync(_) => SyncRequestType::StartSync,
            Self::AddPendingEvent(_) => SyncRequestType::AddPendingEvent,
        }
    }

    /// Remote-reported error, if the worker rejected the request.
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            Self::StartSync(result) | Self::AddPendingEvent(result) => result.as_ref().err(),
        }
    }

    pub fn into_result(self) -> Result<(), SyncError> {
        match self {
            Self::StartSync(result) | Self::AddPendingEvent(result) => result,
        }
    }

    /// Build the response of the given kind.
    pub fn for_kind(kind: SyncRequestType, result: Result<(), SyncError>) -> Self {
        match kind {
            SyncRequestType::StartSync => Self::StartSync(result),
            SyncRequestType::AddPendingEvent => Self::AddPendingEvent(result),
        }
    }
}

/// A request with its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub body: SyncRequest,
}

/// A response carrying the id of the request it answers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub id: RequestId,
    pub body: SyncResponse,
}

impl Response {
    /// Answer `request` with `result`, keeping id and kind aligned.
    pub fn answering(request: &Request, result: Result<(), SyncError>) -> Self {
        Self {
            id: request.id,
            body: SyncResponse::for_kind(request.body.kind(), result),
        }
    }
}

/// Discriminator of event kinds, used as the event bus listener key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SyncEventType {
    StatusChanged,
    SyncChanges,
    SyncFailed,
}

/// Unsolicited worker events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    /// Sync loop status transition.
    StatusChanged { new_value: SyncStatus },
    /// One sync delta to apply to the session.
    SyncChanges { session: SessionChanges },
    /// Loop-level failure; `recoverable == false` means the loop halted.
    SyncFailed { error: SyncError, recoverable: bool },
}

impl SyncEvent {
    pub fn kind(&self) -> SyncEventType {
        match self {
            Self::StatusChanged { .. } => SyncEventType::StatusChanged,
            Self::SyncChanges { .. } => SyncEventType::SyncChanges,
            Self::SyncFailed { .. } => SyncEventType::SyncFailed,
        }
    }
}

/// Fire-and-forget messages from the controlling side to the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerNotice {
    /// Halt the sync loop and release its resources.
    StopSync,
}
