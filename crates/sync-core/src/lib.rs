//! Core contract of the sync worker boundary.
//!
//! This crate defines the request/response/event protocol spoken with the
//! isolated sync worker, the transport port and event bus built on tokio
//! channels, the sync status model, and shared error and retry types.

/// Request/response port onto a worker inbox.
pub mod channel;
/// Request, response and event envelopes.
pub mod envelope;
/// Stable error payloads and HTTP classification helpers.
pub mod error;
/// Lossless event fan-out and listener dispatch.
pub mod event_bus;
/// Single-writer observable cell.
pub mod observable;
/// Backoff policy used by retry loops.
pub mod retry;
/// Sync status transition guard.
pub mod state_machine;
/// Session-facing payload types (status, deltas, pending events).
pub mod types;

pub use channel::{
    Responder, TransportChannel, WorkerInbound, WorkerInbox, WorkerSender, worker_inbox,
};
pub use envelope::{
    Request, RequestId, Response, SyncEvent, SyncEventType, SyncRequest, SyncRequestType,
    SyncResponse, WorkerNotice,
};
pub use error::{SyncError, SyncErrorCategory, TransportError, classify_http_status};
pub use event_bus::{EventBus, EventDelivery, EventHub, EventStream, ListenerFuture};
pub use observable::{Observable, ObservableValue};
pub use retry::RetryPolicy;
pub use state_machine::SyncStatusMachine;
pub use types::{
    DecryptionResult, PendingEventData, SessionChanges, StartSyncParams, SyncInfo, SyncStatus,
};
