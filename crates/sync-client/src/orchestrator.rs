use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sync_core::{
    EventBus, Observable, ObservableValue, SessionChanges, SyncError, SyncEvent, SyncEventType,
    SyncRequest, SyncStatus, TransportChannel, WorkerNotice,
};
use sync_worker::{WorkerConnection, WorkerRegistry};
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    error::ClientError,
    session::{SendQueuePool, Session},
};

/// Last failure, and whether the worker recovering from it clears it.
#[derive(Debug, Clone)]
struct RecordedError {
    error: SyncError,
    transient: bool,
}

type ErrorCell = Arc<Mutex<Option<RecordedError>>>;

struct Forwarder {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct Connection {
    channel: TransportChannel,
    bus: EventBus,
    forwarder: Option<Forwarder>,
}

impl Connection {
    async fn shutdown(self) {
        self.channel.close();
        self.bus.close();
        if let Some(forwarder) = self.forwarder {
            forwarder.stop.cancel();
            if let Err(err) = forwarder.task.await {
                warn!(error = %err, "pending event forwarder ended abnormally");
            }
        }
    }
}

/// Drives one session's sync worker.
///
/// Status mirrors the worker's `StatusChanged` events; deltas are applied to
/// the session one at a time; queued outgoing events are forwarded once sync
/// has started.
pub struct SyncOrchestrator {
    session: Arc<Session>,
    registry: WorkerRegistry,
    status: Arc<ObservableValue<SyncStatus>>,
    error: ErrorCell,
    connection: AsyncMutex<Option<Connection>>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("session_id", &self.session.session_id())
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    pub fn new(session: Arc<Session>, registry: WorkerRegistry) -> Self {
        Self {
            session,
            registry,
            status: Arc::new(ObservableValue::new(SyncStatus::Stopped)),
            error: ErrorCell::default(),
            connection: AsyncMutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn status(&self) -> Observable<SyncStatus> {
        self.status.reader()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.status.get()
    }

    /// Last sync failure that still applies.
    ///
    /// A failed cycle the worker retries is cleared once it reports `Syncing`
    /// again. A halted loop or a delta that could not be applied stays until
    /// the next [`Self::start`].
    pub fn error(&self) -> Option<SyncError> {
        lock(&self.error).as_ref().map(|recorded| recorded.error.clone())
    }

    /// Start (or re-attach to) the session's sync worker.
    ///
    /// Resolves once the worker accepted `StartSync`; the status follows the
    /// worker's own reports.
    pub async fn start(&self) -> Result<(), ClientError> {
        if self.session.session_id().trim().is_empty() {
            return Err(ClientError::missing_session_id());
        }
        let params = self.session.start_params();
        params.validate().map_err(ClientError::Setup)?;

        let channel = self.connect().await?;
        let response = channel
            .send_and_wait_for_response(SyncRequest::StartSync(params))
            .await?;
        if let Err(err) = response.into_result() {
            warn!(session_id = %self.session.session_id(), error = %err, "worker refused to start sync");
            return Err(ClientError::Remote(err));
        }

        *lock(&self.error) = None;
        self.spawn_forwarder(&channel).await;
        info!(session_id = %self.session.session_id(), "sync started");
        Ok(())
    }

    /// Halt the worker's sync loop and detach from it.
    ///
    /// Calls still waiting on the worker resolve with `Disconnected`.
    pub async fn stop(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            debug!(session_id = %self.session.session_id(), "stop requested while not started");
            return;
        };

        if let Err(err) = connection.channel.send(WorkerNotice::StopSync) {
            debug!(error = %err, "stop notice not delivered");
        }
        connection.shutdown().await;
        self.status.set(SyncStatus::Stopped);
        info!(session_id = %self.session.session_id(), "sync stopped");
    }

    async fn connect(&self) -> Result<TransportChannel, ClientError> {
        let mut connection = self.connection.lock().await;
        if let Some(existing) = connection.as_ref()
            && !existing.channel.is_closed()
        {
            return Ok(existing.channel.clone());
        }
        if let Some(stale) = connection.take() {
            debug!("replacing closed worker connection");
            stale.shutdown().await;
        }

        let WorkerConnection {
            worker_id,
            channel,
            events,
        } = self
            .registry
            .connect(self.session.session_id())
            .map_err(ClientError::Setup)?;
        let bus = EventBus::attach(events);
        self.register_listeners(&bus);
        debug!(%worker_id, "connected to sync worker");

        *connection = Some(Connection {
            channel: channel.clone(),
            bus,
            forwarder: None,
        });
        Ok(channel)
    }

    async fn spawn_forwarder(&self, channel: &TransportChannel) {
        let mut connection = self.connection.lock().await;
        let Some(connection) = connection.as_mut() else {
            return;
        };
        if connection.forwarder.is_some() || channel.is_closed() {
            return;
        }

        let stop = CancellationToken::new();
        let task = tokio::spawn(
            forward_pending_events(
                connection.channel.clone(),
                self.session.send_queue().clone(),
                stop.clone(),
            )
            .instrument(info_span!(
                "pending_forwarder",
                session_id = %self.session.session_id()
            )),
        );
        connection.forwarder = Some(Forwarder { stop, task });
    }

    fn register_listeners(&self, bus: &EventBus) {
        let status = Arc::clone(&self.status);
        let error = Arc::clone(&self.error);
        bus.set_listener(SyncEventType::StatusChanged, move |event| {
            let status = Arc::clone(&status);
            let error = Arc::clone(&error);
            async move {
                let SyncEvent::StatusChanged { new_value } = event else {
                    return;
                };
                if new_value == SyncStatus::Syncing {
                    let mut error = lock(&error);
                    if error.as_ref().is_some_and(|recorded| recorded.transient) {
                        debug!("sync recovered; clearing transient failure");
                        *error = None;
                    }
                }
                if status.set(new_value) {
                    debug!(status = %new_value, "sync status changed");
                }
            }
        });

        let session = Arc::clone(&self.session);
        let error = Arc::clone(&self.error);
        bus.set_listener(SyncEventType::SyncChanges, move |event| {
            let session = Arc::clone(&session);
            let error = Arc::clone(&error);
            async move {
                if let SyncEvent::SyncChanges { session: changes } = event {
                    apply_sync_changes(&session, &error, changes).await;
                }
            }
        });

        let error = Arc::clone(&self.error);
        bus.set_listener(SyncEventType::SyncFailed, move |event| {
            let error = Arc::clone(&error);
            async move {
                if let SyncEvent::SyncFailed {
                    error: failure,
                    recoverable,
                } = event
                {
                    if recoverable {
                        warn!(error = %failure, "sync cycle failed; worker is retrying");
                    } else {
                        error!(error = %failure, "sync halted");
                    }
                    *lock(&error) = Some(RecordedError {
                        error: failure,
                        transient: recoverable,
                    });
                }
            }
        });
    }
}

async fn apply_sync_changes(session: &Session, error: &ErrorCell, changes: SessionChanges) {
    let span = info_span!(
        "sync_changes",
        session_id = %session.session_id(),
        token = %changes.sync_info.token,
    );

    if let Err(err) = session.after_sync(&changes, &span).await {
        span.in_scope(|| {
            error!(
                token = %err.token,
                step = %err.step,
                error = %err.source,
                "failed to apply sync changes"
            );
        });
        *lock(error) = Some(RecordedError {
            error: SyncError::new(err.source.category, err.source.code.clone(), err.to_string()),
            transient: false,
        });
    }
}

/// Hands queued events to the worker one at a time and reports each outcome
/// back to the send queue.
async fn forward_pending_events(
    channel: TransportChannel,
    send_queue: SendQueuePool,
    stop: CancellationToken,
) {
    let mut notifications = send_queue.notifications().lock().await;

    loop {
        let notice = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            notice = notifications.recv() => match notice {
                Some(notice) => notice,
                None => break,
            },
        };

        let txn_id = notice.event.txn_id.clone();
        let request = SyncRequest::AddPendingEvent {
            pending_event: notice.event.clone(),
        };
        let outcome = match channel.send_and_wait_for_response(request).await {
            Ok(response) => response.into_result(),
            Err(err) => Err(SyncError::from(err)),
        };

        match &outcome {
            Ok(()) => debug!(%txn_id, "pending event accepted"),
            Err(err) => warn!(%txn_id, error = %err, "pending event not delivered"),
        }
        send_queue.resolve(notice, outcome);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
