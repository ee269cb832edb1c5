use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sync_core::{
    DecryptionResult, EventHub, PendingEventData, Request, Responder, RetryPolicy,
    SessionChanges, StartSyncParams, SyncError, SyncErrorCategory, SyncEvent, SyncInfo,
    SyncRequest, SyncStatus, SyncStatusMachine, TransportError, WorkerInbound, WorkerInbox,
    WorkerNotice, WorkerSender, worker_inbox,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    api::{HomeserverApi, HomeserverTransport, default_sync_filter},
    reconnector::Reconnector,
    scheduler::{RequestScheduler, SchedulerConfig},
};

const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_INBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Server-side long-poll timeout of each `/sync` call.
    pub sync_timeout_ms: u64,
    /// Backoff between failed sync cycles.
    pub retry: RetryPolicy,
    pub scheduler: SchedulerConfig,
    pub inbox_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

/// Turns raw to-device events into decryption results.
#[async_trait]
pub trait ToDeviceDecryptor: Send + Sync {
    async fn decrypt(&self, events: Vec<Value>) -> Vec<DecryptionResult>;
}

/// Decryptor used without end-to-end encryption: plaintext to-device events
/// pass through, encrypted ones are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextToDevice;

#[async_trait]
impl ToDeviceDecryptor for PlaintextToDevice {
    async fn decrypt(&self, events: Vec<Value>) -> Vec<DecryptionResult> {
        events
            .into_iter()
            .filter_map(|event| {
                if event.get("type").and_then(Value::as_str) == Some("m.room.encrypted") {
                    let sender = event.get("sender").and_then(Value::as_str).unwrap_or_default();
                    debug!(%sender, "dropping encrypted to-device event");
                    return None;
                }
                Some(DecryptionResult {
                    event,
                    sender_curve25519_key: None,
                    claimed_ed25519_key: None,
                })
            })
            .collect()
    }
}

/// Collaborators shared by every worker a registry spawns.
#[derive(Clone)]
pub struct WorkerEnvironment {
    pub transport: Arc<dyn HomeserverTransport>,
    pub decryptor: Arc<dyn ToDeviceDecryptor>,
    pub config: WorkerConfig,
}

impl std::fmt::Debug for WorkerEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerEnvironment")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WorkerEnvironment {
    pub fn new(transport: Arc<dyn HomeserverTransport>) -> Self {
        Self {
            transport,
            decryptor: Arc::new(PlaintextToDevice),
            config: WorkerConfig::default(),
        }
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn ToDeviceDecryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }
}

/// Registry-side handle onto a spawned worker task.
pub(crate) struct WorkerHandle {
    pub(crate) worker_tx: WorkerSender,
    pub(crate) events: EventHub,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.worker_tx.is_closed()
    }

    pub(crate) fn terminate(&self) {
        self.shutdown.cancel();
    }

    pub(crate) async fn join(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "sync worker task ended abnormally");
        }
    }
}

/// Spawn an isolated worker task. It is reachable only through the returned
/// inbox sender and its event hub.
pub(crate) fn spawn_worker(worker_id: &str, env: WorkerEnvironment) -> WorkerHandle {
    let (worker_tx, inbox) = worker_inbox(env.config.inbox_capacity);
    let events = EventHub::new();
    let shutdown = CancellationToken::new();

    let worker = SyncWorker {
        env,
        inbox,
        reporter: StatusReporter::new(events.clone()),
        running: None,
    };
    let task = tokio::spawn(
        worker
            .run(shutdown.clone())
            .instrument(info_span!("sync_worker", worker_id = %worker_id)),
    );

    WorkerHandle {
        worker_tx,
        events,
        shutdown,
        task,
    }
}

/// Serializes status reports through the transition guard.
#[derive(Clone)]
struct StatusReporter {
    machine: Arc<Mutex<SyncStatusMachine>>,
    events: EventHub,
}

impl StatusReporter {
    fn new(events: EventHub) -> Self {
        Self {
            machine: Arc::default(),
            events,
        }
    }

    fn report(&self, next: SyncStatus) {
        let mut machine = self.lock();
        match machine.transition(next) {
            Ok(Some(event)) => {
                debug!(status = %next, "sync status changed");
                self.emit(event);
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "ignoring sync status transition"),
        }
    }

    fn fail(&self) {
        if let Some(event) = self.lock().on_error() {
            self.emit(event);
        }
    }

    fn emit(&self, event: SyncEvent) {
        self.events.emit(event);
    }

    fn lock(&self) -> MutexGuard<'_, SyncStatusMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PendingDelivery {
    event: PendingEventData,
    responder: Responder,
}

struct RunningSync {
    session_id: String,
    stop: CancellationToken,
    scheduler: RequestScheduler,
    pending_tx: mpsc::UnboundedSender<PendingDelivery>,
    loop_task: JoinHandle<()>,
    sender_task: JoinHandle<()>,
}

struct SyncWorker {
    env: WorkerEnvironment,
    inbox: WorkerInbox,
    reporter: StatusReporter,
    running: Option<RunningSync>,
}

impl SyncWorker {
    async fn run(mut self, shutdown: CancellationToken) {
        info!("sync worker started");

        loop {
            let inbound = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                inbound = self.inbox.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => {
                        debug!("every port onto the worker is gone");
                        break;
                    }
                },
            };

            match inbound {
                WorkerInbound::Request { request, responder } => {
                    self.handle_request(request, responder).await;
                }
                WorkerInbound::Notice(WorkerNotice::StopSync) => self.stop_sync().await,
            }
        }

        self.stop_sync().await;
        info!("sync worker exited");
    }

    async fn handle_request(&mut self, request: Request, responder: Responder) {
        let request_id = request.id;
        match request.body {
            SyncRequest::StartSync(params) => {
                let result = self.start_sync(params).await;
                if let Err(err) = &result {
                    warn!(%request_id, error = %err, "start sync rejected");
                }
                responder.respond(result);
            }
            SyncRequest::AddPendingEvent { pending_event } => {
                // Answered by the delivery task once the homeserver has replied.
                if let Err((err, responder)) = self.queue_pending(pending_event, responder) {
                    warn!(%request_id, error = %err, "pending event rejected");
                    responder.respond(Err(err));
                }
            }
        }
    }

    async fn start_sync(&mut self, params: StartSyncParams) -> Result<(), SyncError> {
        params.validate()?;

        if let Some(running) = &self.running {
            if running.session_id != params.session_id {
                return Err(SyncError::new(
                    SyncErrorCategory::Config,
                    "session_mismatch",
                    format!(
                        "worker runs session '{}', not '{}'",
                        running.session_id, params.session_id
                    ),
                ));
            }
            if !running.stop.is_cancelled() {
                debug!(session_id = %params.session_id, "sync already running");
                return Ok(());
            }
            info!(session_id = %params.session_id, "restarting halted sync loop");
            self.stop_sync().await;
        }

        let config = &self.env.config;
        let api = HomeserverApi::new(
            &params.homeserver,
            params.access_token.as_str(),
            Arc::clone(&self.env.transport),
        )?;
        let scheduler = RequestScheduler::new(
            api,
            Arc::new(Reconnector::new(config.retry)),
            config.scheduler,
        );
        let stop = CancellationToken::new();
        let span = info_span!(
            "sync_session",
            session_id = %params.session_id,
            user_id = %params.user_id,
            device_id = %params.device_id,
        );

        let sync_loop = SyncLoop {
            scheduler: scheduler.clone(),
            decryptor: Arc::clone(&self.env.decryptor),
            reporter: self.reporter.clone(),
            user_id: params.user_id.clone(),
            timeout_ms: config.sync_timeout_ms,
            retry: config.retry,
            stop: stop.clone(),
        };
        let loop_task = tokio::spawn(sync_loop.run(params.resume.clone()).instrument(span.clone()));

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let sender_task = tokio::spawn(
            deliver_pending(scheduler.clone(), pending_rx, stop.clone()).instrument(span),
        );

        info!(
            session_id = %params.session_id,
            homeserver = %scheduler.api().homeserver(),
            resumed = params.resume.is_some(),
            "sync started"
        );
        self.running = Some(RunningSync {
            session_id: params.session_id,
            stop,
            scheduler,
            pending_tx,
            loop_task,
            sender_task,
        });
        Ok(())
    }

    fn queue_pending(
        &self,
        event: PendingEventData,
        responder: Responder,
    ) -> Result<(), (SyncError, Responder)> {
        if let Err(err) = event.validate() {
            return Err((err, responder));
        }
        let Some(running) = &self.running else {
            return Err((
                SyncError::new(
                    SyncErrorCategory::Config,
                    "sync_not_running",
                    "sync has not been started on this worker",
                ),
                responder,
            ));
        };
        if running.stop.is_cancelled() {
            return Err((
                SyncError::new(
                    SyncErrorCategory::Config,
                    "sync_halted",
                    "sync loop halted; start it again before sending",
                ),
                responder,
            ));
        }

        debug!(room_id = %event.room_id, txn_id = %event.txn_id, "pending event queued");
        running
            .pending_tx
            .send(PendingDelivery { event, responder })
            .map_err(|mpsc::error::SendError(delivery)| {
                (
                    SyncError::new(
                        SyncErrorCategory::Internal,
                        "sync_stopping",
                        "pending event delivery is shutting down",
                    ),
                    delivery.responder,
                )
            })
    }

    async fn stop_sync(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        info!(session_id = %running.session_id, "stopping sync");
        running.stop.cancel();
        running.scheduler.shutdown();
        for task in [running.loop_task, running.sender_task] {
            if let Err(err) = task.await {
                warn!(error = %err, "sync task ended abnormally");
            }
        }
        self.reporter.report(SyncStatus::Stopped);
    }
}

#[derive(Debug, Deserialize)]
struct SyncResponseBody {
    next_batch: String,
    #[serde(default)]
    to_device: ToDeviceEvents,
    #[serde(default)]
    device_one_time_keys_count: HashMap<String, u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ToDeviceEvents {
    #[serde(default)]
    events: Vec<Value>,
}

/// Poll, receive, emit, repeat.
struct SyncLoop {
    scheduler: RequestScheduler,
    decryptor: Arc<dyn ToDeviceDecryptor>,
    reporter: StatusReporter,
    user_id: String,
    timeout_ms: u64,
    retry: RetryPolicy,
    stop: CancellationToken,
}

impl SyncLoop {
    async fn run(self, resume: Option<SyncInfo>) {
        let (mut since, mut filter_id) = match resume {
            Some(info) => (Some(info.token), Some(info.filter_id)),
            None => (None, None),
        };
        let mut attempt = 0_u32;
        self.report_catching_up(since.is_some());

        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                outcome = self.cycle(since.as_deref(), &mut filter_id) => outcome,
            };

            match outcome {
                Ok(changes) => {
                    attempt = 0;
                    debug!(
                        token = %changes.sync_info.token,
                        has_new_room_keys = changes.has_new_room_keys,
                        "sync response received"
                    );
                    since = Some(changes.sync_info.token.clone());
                    // The next poll waits until every port has applied the delta.
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => break,
                        _ = self
                            .reporter
                            .events
                            .emit_and_wait(SyncEvent::SyncChanges { session: changes }) => {}
                    }
                    self.reporter.report(SyncStatus::Syncing);
                }
                Err(err) => {
                    let recoverable = err.is_recoverable();
                    if !recoverable {
                        // Marked halted before the failure is observable, so a
                        // StartSync sent in reaction restarts the loop.
                        self.stop.cancel();
                    }
                    self.reporter.emit(SyncEvent::SyncFailed {
                        error: err.clone(),
                        recoverable,
                    });
                    self.reporter.fail();

                    if !recoverable {
                        error!(error = %err, "sync loop halted");
                        break;
                    }

                    let delay = self.retry.delay_for_attempt(attempt, err.retry_after_ms);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "sync cycle failed; retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.report_catching_up(since.is_some());
                }
            }
        }

        debug!("sync loop finished");
    }

    fn report_catching_up(&self, has_token: bool) {
        self.reporter.report(if has_token {
            SyncStatus::CatchupSync
        } else {
            SyncStatus::InitialSync
        });
    }

    async fn cycle(
        &self,
        since: Option<&str>,
        filter_id: &mut Option<String>,
    ) -> Result<SessionChanges, SyncError> {
        let filter = match filter_id {
            Some(id) => id.clone(),
            None => {
                let id = self.create_filter().await?;
                *filter_id = Some(id.clone());
                id
            }
        };

        let request = self
            .scheduler
            .api()
            .sync(since, Some(&filter), self.timeout_ms)?;
        let body = self
            .scheduler
            .request(request)
            .await
            .map_err(|err| err.to_sync_error())?;
        let body: SyncResponseBody = serde_json::from_value(body).map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Serialization,
                "invalid_sync_response",
                err.to_string(),
            )
        })?;

        Ok(self.session_changes(body, filter).await)
    }

    async fn create_filter(&self) -> Result<String, SyncError> {
        let request = self
            .scheduler
            .api()
            .create_filter(&self.user_id, default_sync_filter())?;
        let body = self
            .scheduler
            .request(request)
            .await
            .map_err(|err| err.to_sync_error())?;
        let filter_id = body
            .get("filter_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                SyncError::new(
                    SyncErrorCategory::Serialization,
                    "invalid_filter_response",
                    "filter upload response has no filter_id",
                )
            })?;

        info!(%filter_id, "uploaded sync filter");
        Ok(filter_id)
    }

    async fn session_changes(&self, body: SyncResponseBody, filter_id: String) -> SessionChanges {
        let results = if body.to_device.events.is_empty() {
            None
        } else {
            Some(self.decryptor.decrypt(body.to_device.events).await)
        };
        let has_new_room_keys = results
            .as_deref()
            .is_some_and(|results| results.iter().any(DecryptionResult::is_room_key));

        SessionChanges {
            sync_info: SyncInfo {
                token: body.next_batch,
                filter_id,
            },
            has_new_room_keys,
            e2ee_account_changes: body
                .device_one_time_keys_count
                .get("signed_curve25519")
                .copied(),
            device_message_decryption_results: results,
        }
    }
}

/// Sends accepted pending events to the homeserver one at a time, in the
/// order they were accepted, and answers each request with the outcome.
///
/// Once sync stops, the event in flight and everything still queued is
/// answered with `worker_disconnected`.
async fn deliver_pending(
    scheduler: RequestScheduler,
    mut queue: mpsc::UnboundedReceiver<PendingDelivery>,
    stop: CancellationToken,
) {
    loop {
        let PendingDelivery { event, responder } = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            delivery = queue.recv() => match delivery {
                Some(delivery) => delivery,
                None => return,
            },
        };

        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                responder.respond(Err(TransportError::Disconnected.into()));
                break;
            }
            result = send_pending(&scheduler, &event) => result,
        };
        responder.respond(result);
    }

    queue.close();
    let mut abandoned = 0_usize;
    while let Ok(PendingDelivery { responder, .. }) = queue.try_recv() {
        responder.respond(Err(TransportError::Disconnected.into()));
        abandoned += 1;
    }
    if abandoned > 0 {
        debug!(abandoned, "answered queued pending events after stop");
    }
}

async fn send_pending(scheduler: &RequestScheduler, event: &PendingEventData) -> Result<(), SyncError> {
    let request = scheduler.api().send_event(
        &event.room_id,
        &event.event_type,
        &event.txn_id,
        event.content.clone(),
    )?;

    match scheduler.request(request).await {
        Ok(body) => {
            let event_id = body.get("event_id").and_then(Value::as_str).unwrap_or_default();
            debug!(
                room_id = %event.room_id,
                txn_id = %event.txn_id,
                %event_id,
                "pending event delivered"
            );
            Ok(())
        }
        Err(err) => {
            warn!(
                room_id = %event.room_id,
                txn_id = %event.txn_id,
                error = %err,
                "pending event delivery failed"
            );
            Err(err.to_sync_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use sync_core::{EventStream, TransportChannel};
    use tokio::time::timeout;

    use super::*;
    use crate::{
        api::HttpFailure,
        testing::{ScriptedHomeserver, sync_body},
    };

    struct Harness {
        homeserver: Arc<ScriptedHomeserver>,
        channel: TransportChannel,
        events: EventStream,
        worker: WorkerHandle,
    }

    fn harness() -> Harness {
        let homeserver = Arc::new(ScriptedHomeserver::default());
        let env = WorkerEnvironment::new(homeserver.clone()).with_config(WorkerConfig {
            retry: RetryPolicy::new(5, 20),
            scheduler: SchedulerConfig {
                max_attempts: 1,
                max_concurrent_requests: 4,
            },
            ..WorkerConfig::default()
        });
        let worker = spawn_worker("sync-s1", env);

        Harness {
            homeserver,
            channel: TransportChannel::connect(worker.worker_tx.clone()),
            events: worker.events.subscribe(),
            worker,
        }
    }

    fn start_params(resume: Option<SyncInfo>) -> StartSyncParams {
        StartSyncParams {
            session_id: "s1".into(),
            device_id: "d1".into(),
            user_id: "@a:x".into(),
            homeserver: "https://x".into(),
            access_token: "tok".into(),
            resume,
        }
    }

    fn pending(txn_id: &str) -> PendingEventData {
        PendingEventData {
            room_id: "!r:x".into(),
            txn_id: txn_id.into(),
            event_type: "m.room.message".into(),
            content: json!({"msgtype": "m.text", "body": txn_id}),
        }
    }

    async fn call(channel: &TransportChannel, request: SyncRequest) -> Result<(), SyncError> {
        timeout(Duration::from_secs(2), channel.send_and_wait_for_response(request))
            .await
            .expect("response timeout")
            .expect("transport ok")
            .into_result()
    }

    async fn next_event(events: &mut EventStream) -> SyncEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timeout")
            .expect("event stream open")
            .into_event()
    }

    fn status(new_value: SyncStatus) -> SyncEvent {
        SyncEvent::StatusChanged { new_value }
    }

    #[tokio::test]
    async fn initial_sync_uploads_filter_and_emits_changes() {
        let mut h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");
        h.homeserver.push_sync(sync_body("t1", vec![]));

        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::InitialSync));
        match next_event(&mut h.events).await {
            SyncEvent::SyncChanges { session } => {
                assert_eq!(session.sync_info.token, "t1");
                assert_eq!(session.sync_info.filter_id, "f1");
                assert!(!session.has_new_room_keys);
                assert_eq!(session.device_message_decryption_results, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::Syncing));

        let requests = h.homeserver.requests();
        assert!(requests[0].url.path().ends_with("/user/@a:x/filter"));
        assert!(requests.iter().all(|request| request.access_token == "tok"));
    }

    #[tokio::test]
    async fn resumed_sync_catches_up_from_stored_token() {
        let mut h = harness();
        let resume = SyncInfo {
            token: "t2".into(),
            filter_id: "f9".into(),
        };
        call(&h.channel, SyncRequest::StartSync(start_params(Some(resume))))
            .await
            .expect("start accepted");
        h.homeserver.push_sync(sync_body("t3", vec![]));

        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::CatchupSync));
        assert!(matches!(
            next_event(&mut h.events).await,
            SyncEvent::SyncChanges { .. }
        ));

        let sync = &h.homeserver.requests()[0];
        assert!(sync.url.path().ends_with("/sync"));
        assert_eq!(sync.url.query(), Some("timeout=30000&since=t2&filter=f9"));
    }

    #[tokio::test]
    async fn start_twice_attaches_to_running_loop() {
        let mut h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("first start");
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("second start");

        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::InitialSync));
        h.homeserver.push_sync(sync_body("t1", vec![]));
        assert!(matches!(
            next_event(&mut h.events).await,
            SyncEvent::SyncChanges { .. }
        ));
        let filter_uploads = h
            .homeserver
            .requests()
            .iter()
            .filter(|request| request.url.path().ends_with("/filter"))
            .count();
        assert_eq!(filter_uploads, 1);
    }

    #[tokio::test]
    async fn rejects_invalid_start_params() {
        let h = harness();
        let mut params = start_params(None);
        params.access_token.clear();

        let err = call(&h.channel, SyncRequest::StartSync(params))
            .await
            .expect_err("rejected");
        assert_eq!(err.code, "invalid_start_params");
    }

    #[tokio::test]
    async fn pending_event_requires_running_sync() {
        let h = harness();
        let err = call(
            &h.channel,
            SyncRequest::AddPendingEvent {
                pending_event: pending("t1"),
            },
        )
        .await
        .expect_err("not running");
        assert_eq!(err.code, "sync_not_running");
    }

    #[tokio::test]
    async fn pending_events_are_delivered_in_order() {
        let h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");

        let calls = ["e1", "e2", "e3"].map(|txn| {
            let channel = h.channel.clone();
            async move {
                call(
                    &channel,
                    SyncRequest::AddPendingEvent {
                        pending_event: pending(txn),
                    },
                )
                .await
            }
        });
        // join! polls in order, so the requests enter the inbox as e1, e2, e3.
        let [a, b, c] = calls;
        let (a, b, c) = tokio::join!(a, b, c);
        a.expect("e1 delivered");
        b.expect("e2 delivered");
        c.expect("e3 delivered");

        let sent: Vec<_> = h
            .homeserver
            .sent_events()
            .into_iter()
            .map(|(_, txn)| txn)
            .collect();
        assert_eq!(sent, vec!["e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn remote_rejection_reaches_the_caller() {
        let h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");
        h.homeserver.fail_next_send(HttpFailure::Status {
            status: 400,
            errcode: Some("M_BAD_JSON".into()),
            message: "bad content".into(),
            retry_after_ms: None,
        });

        let err = call(
            &h.channel,
            SyncRequest::AddPendingEvent {
                pending_event: pending("t1"),
            },
        )
        .await
        .expect_err("rejected by homeserver");
        assert_eq!(err.code, "M_BAD_JSON");
        assert_eq!(err.category, SyncErrorCategory::Config);
    }

    #[tokio::test]
    async fn unauthorized_sync_halts_loop_and_can_restart() {
        let mut h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::InitialSync));

        h.homeserver.push_sync_failure(HttpFailure::Status {
            status: 401,
            errcode: Some("M_UNKNOWN_TOKEN".into()),
            message: "token expired".into(),
            retry_after_ms: None,
        });
        match next_event(&mut h.events).await {
            SyncEvent::SyncFailed { error, recoverable } => {
                assert_eq!(error.code, "M_UNKNOWN_TOKEN");
                assert!(!recoverable);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::Error));

        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("restart accepted");
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::Stopped));
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::InitialSync));
    }

    #[tokio::test]
    async fn recoverable_failure_retries_sync() {
        let mut h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::InitialSync));

        h.homeserver.push_sync_failure(HttpFailure::Status {
            status: 502,
            errcode: None,
            message: "bad gateway".into(),
            retry_after_ms: None,
        });
        h.homeserver.push_sync(sync_body("t1", vec![]));

        assert!(matches!(
            next_event(&mut h.events).await,
            SyncEvent::SyncFailed {
                recoverable: true,
                ..
            }
        ));
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::Error));
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::InitialSync));
        assert!(matches!(
            next_event(&mut h.events).await,
            SyncEvent::SyncChanges { .. }
        ));
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::Syncing));
    }

    #[tokio::test]
    async fn room_keys_in_to_device_messages_are_flagged() {
        let mut h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");
        h.homeserver.push_sync(sync_body(
            "t1",
            vec![
                json!({"type": "m.room_key", "sender": "@b:x", "content": {}}),
                json!({"type": "m.room.encrypted", "sender": "@b:x", "content": {}}),
            ],
        ));

        let _initial = next_event(&mut h.events).await;
        match next_event(&mut h.events).await {
            SyncEvent::SyncChanges { session } => {
                assert!(session.has_new_room_keys);
                let results = session
                    .device_message_decryption_results
                    .expect("decryption results");
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].event_type(), Some("m.room_key"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_notice_halts_loop_and_reports_stopped() {
        let mut h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::InitialSync));

        h.channel.send(WorkerNotice::StopSync).expect("notice sent");
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::Stopped));

        let err = call(
            &h.channel,
            SyncRequest::AddPendingEvent {
                pending_event: pending("late"),
            },
        )
        .await
        .expect_err("stopped");
        assert_eq!(err.code, "sync_not_running");
    }

    #[tokio::test]
    async fn stop_answers_in_flight_and_queued_events_as_disconnected() {
        let mut h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::InitialSync));
        h.homeserver.hold_sends();

        let add = |txn: &str| SyncRequest::AddPendingEvent {
            pending_event: pending(txn),
        };
        // Polled after the three sends entered the inbox, so StopSync is
        // taken only once e2 and e3 are queued behind the held e1.
        let stopper = async {
            timeout(Duration::from_secs(2), async {
                while h.homeserver.sent_events().is_empty() {
                    tokio::task::yield_now().await;
                }
            })
            .await
            .expect("first send in flight");
            h.channel.send(WorkerNotice::StopSync).expect("notice sent");
        };
        let (a, b, c, ()) = tokio::join!(
            call(&h.channel, add("e1")),
            call(&h.channel, add("e2")),
            call(&h.channel, add("e3")),
            stopper
        );

        for result in [a, b, c] {
            let err = result.expect_err("never delivered");
            assert_eq!(err.code, "worker_disconnected");
        }
        assert_eq!(h.homeserver.sent_events().len(), 1);
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::Stopped));
        h.homeserver.release_sends();
    }

    #[tokio::test]
    async fn next_poll_waits_until_changes_are_handled() {
        let mut h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");
        h.homeserver.push_sync(sync_body("t1", vec![]));
        h.homeserver.push_sync(sync_body("t2", vec![]));
        let sync_polls = |homeserver: &ScriptedHomeserver| {
            homeserver
                .requests()
                .iter()
                .filter(|request| request.url.path().ends_with("/sync"))
                .count()
        };

        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::InitialSync));
        let held = timeout(Duration::from_secs(2), h.events.recv())
            .await
            .expect("event timeout")
            .expect("event stream open");
        assert!(matches!(held.event, SyncEvent::SyncChanges { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sync_polls(&h.homeserver), 1);

        drop(held);
        assert_eq!(next_event(&mut h.events).await, status(SyncStatus::Syncing));
        match next_event(&mut h.events).await {
            SyncEvent::SyncChanges { session } => assert_eq!(session.sync_info.token, "t2"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(sync_polls(&h.homeserver) >= 2);
    }

    #[tokio::test]
    async fn slow_consumer_sees_every_delta() {
        let mut h = harness();
        call(&h.channel, SyncRequest::StartSync(start_params(None)))
            .await
            .expect("start accepted");
        let tokens: Vec<String> = (1..=40).map(|n| format!("t{n}")).collect();
        for token in &tokens {
            h.homeserver.push_sync(sync_body(token, vec![]));
        }

        let mut seen = Vec::new();
        while seen.len() < tokens.len() {
            if let SyncEvent::SyncChanges { session } = next_event(&mut h.events).await {
                seen.push(session.sync_info.token);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        assert_eq!(seen, tokens);
    }

    #[tokio::test]
    async fn terminated_worker_disconnects_ports() {
        let h = harness();
        h.worker.terminate();
        timeout(Duration::from_secs(2), async {
            while h.worker.is_alive() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker exits");

        let result = timeout(
            Duration::from_secs(2),
            h.channel.send_and_wait_for_response(SyncRequest::StartSync(start_params(None))),
        )
        .await
        .expect("resolves");
        assert_eq!(result.expect_err("disconnected"), TransportError::Disconnected);
    }
}
