//! Session-side half of the PikaChat sync layer.
//!
//! A [`SessionFactory`] turns a login into a [`Session`] with its own request
//! scheduler, media helper and send queue. A [`SyncOrchestrator`] attaches the
//! session to its shared sync worker, mirrors the worker's status and applies
//! every sync delta to the session in order.

pub mod config;
pub mod error;
pub mod factory;
pub mod media;
pub mod orchestrator;
pub mod session;

pub use config::{ConfigError, SyncClientConfig};
pub use error::ClientError;
pub use factory::{SessionFactory, SessionParts};
pub use media::{MediaRepository, MxcUri, ThumbnailMethod};
pub use orchestrator::SyncOrchestrator;
pub use session::{
    AfterSyncError, AfterSyncStep, E2eeApplier, InMemorySessionStore, NoE2ee, PendingEventNotice,
    QueuedEvent, SendQueuePool, Session, SessionInfo, SessionStore,
};
