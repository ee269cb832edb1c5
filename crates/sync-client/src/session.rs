use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sync_core::{
    DecryptionResult, PendingEventData, SessionChanges, StartSyncParams, SyncError,
    SyncErrorCategory, SyncInfo,
};
use sync_worker::RequestScheduler;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tracing::{Instrument, Span, debug, trace};
use uuid::Uuid;

use crate::media::MediaRepository;

/// Identity of a logged-in session. Carries no secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub device_id: String,
    pub user_id: String,
    pub homeserver: String,
}

/// Persistence of per-session sync state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_sync_info(&self, session_id: &str, info: &SyncInfo) -> Result<(), SyncError>;
    async fn load_sync_info(&self, session_id: &str) -> Result<Option<SyncInfo>, SyncError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemorySessionStore {
    data: Arc<RwLock<HashMap<String, SyncInfo>>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save_sync_info(&self, session_id: &str, info: &SyncInfo) -> Result<(), SyncError> {
        let mut data = self.data.write().map_err(|_| poisoned())?;
        data.insert(session_id.to_owned(), info.clone());
        Ok(())
    }

    async fn load_sync_info(&self, session_id: &str) -> Result<Option<SyncInfo>, SyncError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(data.get(session_id).cloned())
    }
}

fn poisoned() -> SyncError {
    SyncError::new(SyncErrorCategory::Storage, "store_poisoned", "poisoned lock")
}

/// Applies end-to-end encryption results produced by the sync worker.
#[async_trait]
pub trait E2eeApplier: Send + Sync {
    async fn apply_room_keys(&self, results: &[DecryptionResult]) -> Result<(), SyncError>;
    async fn apply_account_changes(&self, changes: u64) -> Result<(), SyncError>;
    async fn apply_decryption_result(&self, result: &DecryptionResult) -> Result<(), SyncError>;
}

/// Used when the session has no encryption support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoE2ee;

#[async_trait]
impl E2eeApplier for NoE2ee {
    async fn apply_room_keys(&self, results: &[DecryptionResult]) -> Result<(), SyncError> {
        trace!(count = results.len(), "ignoring room keys");
        Ok(())
    }

    async fn apply_account_changes(&self, _changes: u64) -> Result<(), SyncError> {
        Ok(())
    }

    async fn apply_decryption_result(&self, result: &DecryptionResult) -> Result<(), SyncError> {
        trace!(event_type = result.event_type(), "ignoring to-device event");
        Ok(())
    }
}

/// Notification that an outgoing event is waiting to be handed to the worker.
#[derive(Debug)]
pub struct PendingEventNotice {
    pub event: PendingEventData,
    reply: oneshot::Sender<Result<(), SyncError>>,
}

/// Caller-side handle onto a queued event.
#[derive(Debug)]
pub struct QueuedEvent {
    pub txn_id: String,
    outcome: oneshot::Receiver<Result<(), SyncError>>,
}

impl QueuedEvent {
    /// Wait for the worker's verdict on this event.
    pub async fn outcome(self) -> Result<(), SyncError> {
        self.outcome.await.unwrap_or_else(|_| {
            Err(SyncError::new(
                SyncErrorCategory::Internal,
                "send_queue_closed",
                "pending event notice was dropped before delivery",
            ))
        })
    }
}

struct SendQueueInner {
    notify_tx: mpsc::UnboundedSender<PendingEventNotice>,
    notifications: AsyncMutex<mpsc::UnboundedReceiver<PendingEventNotice>>,
    unacknowledged: Mutex<Vec<PendingEventData>>,
}

/// The session's outgoing event queue.
///
/// Events stay listed until the worker acknowledges them. Notifications are
/// buffered until a consumer (the sync orchestrator) takes them.
#[derive(Clone)]
pub struct SendQueuePool {
    inner: Arc<SendQueueInner>,
}

impl fmt::Debug for SendQueuePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendQueuePool")
            .field("unacknowledged", &self.unacknowledged().len())
            .finish_non_exhaustive()
    }
}

impl Default for SendQueuePool {
    fn default() -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SendQueueInner {
                notify_tx,
                notifications: AsyncMutex::new(notify_rx),
                unacknowledged: Mutex::default(),
            }),
        }
    }
}

impl SendQueuePool {
    /// Queue a new outgoing event with a fresh transaction id.
    pub fn enqueue(
        &self,
        room_id: impl Into<String>,
        event_type: impl Into<String>,
        content: Value,
    ) -> QueuedEvent {
        let event = PendingEventData {
            room_id: room_id.into(),
            txn_id: format!("pika{}", Uuid::new_v4().simple()),
            event_type: event_type.into(),
            content,
        };
        self.lock().push(event.clone());
        self.notify(event)
    }

    /// Re-send an event that is still unacknowledged.
    pub fn retry(&self, txn_id: &str) -> Option<QueuedEvent> {
        let event = self
            .lock()
            .iter()
            .find(|event| event.txn_id == txn_id)
            .cloned()?;
        Some(self.notify(event))
    }

    /// Events not yet acknowledged, in queue order.
    pub fn unacknowledged(&self) -> Vec<PendingEventData> {
        self.lock().clone()
    }

    pub(crate) fn notifications(
        &self,
    ) -> &AsyncMutex<mpsc::UnboundedReceiver<PendingEventNotice>> {
        &self.inner.notifications
    }

    /// Report the worker's verdict; acknowledged events leave the queue.
    pub(crate) fn resolve(&self, notice: PendingEventNotice, outcome: Result<(), SyncError>) {
        if outcome.is_ok() {
            self.lock().retain(|event| event.txn_id != notice.event.txn_id);
        }
        let _ = notice.reply.send(outcome);
    }

    fn notify(&self, event: PendingEventData) -> QueuedEvent {
        let (reply, outcome) = oneshot::channel();
        let txn_id = event.txn_id.clone();
        debug!(room_id = %event.room_id, %txn_id, "pending event queued");
        // The receiver lives in `inner`, so the send cannot fail.
        let _ = self.inner.notify_tx.send(PendingEventNotice { event, reply });
        QueuedEvent { txn_id, outcome }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PendingEventData>> {
        self.inner
            .unacknowledged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Step of delta application that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSyncStep {
    PersistSyncInfo,
    ApplyRoomKeys,
    ApplyAccountChanges,
    ApplyDecryptionResult { index: usize },
}

impl fmt::Display for AfterSyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PersistSyncInfo => f.write_str("persist_sync_info"),
            Self::ApplyRoomKeys => f.write_str("apply_room_keys"),
            Self::ApplyAccountChanges => f.write_str("apply_account_changes"),
            Self::ApplyDecryptionResult { index } => {
                write!(f, "apply_decryption_result[{index}]")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("applying sync changes for token {token} failed at {step}: {source}")]
pub struct AfterSyncError {
    pub token: String,
    pub step: AfterSyncStep,
    #[source]
    pub source: SyncError,
}

fn failed_at(token: &str, step: AfterSyncStep) -> impl FnOnce(SyncError) -> AfterSyncError + '_ {
    move |source| AfterSyncError {
        token: token.to_owned(),
        step,
        source,
    }
}

/// Local state of one login, and the sole writer of it.
pub struct Session {
    info: SessionInfo,
    access_token: String,
    scheduler: RequestScheduler,
    media: MediaRepository,
    store: Arc<dyn SessionStore>,
    e2ee: Arc<dyn E2eeApplier>,
    send_queue: SendQueuePool,
    sync_info: Mutex<Option<SyncInfo>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("sync_info", &self.sync_info())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        info: SessionInfo,
        access_token: String,
        scheduler: RequestScheduler,
        media: MediaRepository,
        store: Arc<dyn SessionStore>,
        e2ee: Arc<dyn E2eeApplier>,
    ) -> Self {
        Self {
            info,
            access_token,
            scheduler,
            media,
            store,
            e2ee,
            send_queue: SendQueuePool::default(),
            sync_info: Mutex::new(None),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn media(&self) -> &MediaRepository {
        &self.media
    }

    pub fn send_queue(&self) -> &SendQueuePool {
        &self.send_queue
    }

    /// Last persisted sync cursor.
    pub fn sync_info(&self) -> Option<SyncInfo> {
        self.lock_sync_info().clone()
    }

    /// Restore the stored sync cursor.
    pub(crate) async fn load(&self) -> Result<(), SyncError> {
        let stored = self.store.load_sync_info(self.session_id()).await?;
        if let Some(info) = &stored {
            debug!(token = %info.token, "restored sync cursor");
        }
        *self.lock_sync_info() = stored;
        Ok(())
    }

    /// Snapshot of what a worker needs to sync this session.
    pub fn start_params(&self) -> StartSyncParams {
        StartSyncParams {
            session_id: self.info.session_id.clone(),
            device_id: self.info.device_id.clone(),
            user_id: self.info.user_id.clone(),
            homeserver: self.info.homeserver.clone(),
            access_token: self.access_token.clone(),
            resume: self.sync_info(),
        }
    }

    /// Apply one sync delta, logging under `log`.
    ///
    /// The cursor is persisted first, then room keys, the account change
    /// count and each decryption result in order. Stops at the first failure.
    pub async fn after_sync(
        &self,
        changes: &SessionChanges,
        log: &Span,
    ) -> Result<(), AfterSyncError> {
        self.apply_changes(changes).instrument(log.clone()).await
    }

    async fn apply_changes(&self, changes: &SessionChanges) -> Result<(), AfterSyncError> {
        let token = changes.sync_info.token.as_str();

        self.store
            .save_sync_info(self.session_id(), &changes.sync_info)
            .await
            .map_err(failed_at(token, AfterSyncStep::PersistSyncInfo))?;
        *self.lock_sync_info() = Some(changes.sync_info.clone());
        debug!(%token, "sync cursor persisted");

        let results = changes
            .device_message_decryption_results
            .as_deref()
            .unwrap_or_default();
        if changes.has_new_room_keys {
            self.e2ee
                .apply_room_keys(results)
                .await
                .map_err(failed_at(token, AfterSyncStep::ApplyRoomKeys))?;
        }
        if let Some(count) = changes.e2ee_account_changes {
            self.e2ee
                .apply_account_changes(count)
                .await
                .map_err(failed_at(token, AfterSyncStep::ApplyAccountChanges))?;
        }
        for (index, result) in results.iter().enumerate() {
            self.e2ee
                .apply_decryption_result(result)
                .await
                .map_err(failed_at(
                    token,
                    AfterSyncStep::ApplyDecryptionResult { index },
                ))?;
        }
        Ok(())
    }

    fn lock_sync_info(&self) -> MutexGuard<'_, Option<SyncInfo>> {
        self.sync_info.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
