//! Isolated sync worker for PikaChat sessions.
//!
//! A worker is a tokio task reachable only through a [`sync_core`] transport
//! channel and event stream. It long-polls the homeserver through a
//! [`RequestScheduler`], whose [`Reconnector`] paces retries after network
//! failures, and delivers accepted pending events in order.

pub mod api;
#[cfg(feature = "http")]
pub mod http;
pub mod reconnector;
pub mod registry;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

pub use api::{
    ApiRequest, CallKind, HomeserverApi, HomeserverTransport, HttpFailure, Method,
    default_sync_filter, parse_homeserver_url,
};
#[cfg(feature = "http")]
pub use http::ReqwestTransport;
pub use reconnector::{BackoffState, ConnectionStatus, Reconnector};
pub use registry::{WorkerConnection, WorkerRegistry};
pub use scheduler::{RequestScheduler, SchedulerConfig, SchedulerError};
pub use worker::{PlaintextToDevice, ToDeviceDecryptor, WorkerConfig, WorkerEnvironment};
