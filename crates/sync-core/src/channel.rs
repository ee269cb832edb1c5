//! Request/response port onto an isolated sync worker.
//!
//! The worker owns the receiving end of an `mpsc` inbox. Each
//! [`TransportChannel`] is one port onto that inbox with its own reply queue,
//! so responses only ever reach the port that issued the request.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    envelope::{
        Request, RequestId, RequestIdGenerator, Response, SyncRequest, SyncRequestType,
        SyncResponse, WorkerNotice,
    },
    error::{SyncError, SyncErrorCategory, TransportError},
};

/// Sender half of a worker inbox.
pub type WorkerSender = mpsc::Sender<WorkerInbound>;
/// Receiver half of a worker inbox, owned by the worker task.
pub type WorkerInbox = mpsc::Receiver<WorkerInbound>;

/// Messages delivered into a worker inbox.
#[derive(Debug)]
pub enum WorkerInbound {
    /// A request the worker must answer through `responder`.
    Request {
        request: Request,
        responder: Responder,
    },
    /// Fire-and-forget notice.
    Notice(WorkerNotice),
}

/// Create a worker inbox with the given capacity.
pub fn worker_inbox(capacity: usize) -> (WorkerSender, WorkerInbox) {
    mpsc::channel(capacity.max(1))
}

/// One-shot answer handle for a single request.
///
/// Dropping it without answering sends a `response_dropped` error, so a caller
/// never waits on a request the worker forgot about.
#[derive(Debug)]
pub struct Responder {
    id: RequestId,
    kind: SyncRequestType,
    reply_tx: Option<mpsc::UnboundedSender<Response>>,
}

impl Responder {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Send the response; returns `false` when the issuing port is gone.
    pub fn respond(mut self, result: Result<(), SyncError>) -> bool {
        self.send(result)
    }

    fn send(&mut self, result: Result<(), SyncError>) -> bool {
        let Some(reply_tx) = self.reply_tx.take() else {
            return false;
        };
        reply_tx
            .send(Response {
                id: self.id,
                body: SyncResponse::for_kind(self.kind, result),
            })
            .is_ok()
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.reply_tx.is_some() {
            warn!(request_id = %self.id, "sync worker dropped a request without responding");
            self.send(Err(SyncError::new(
                SyncErrorCategory::Internal,
                "response_dropped",
                format!("worker dropped request {} without a response", self.id),
            )));
        }
    }
}

struct PendingCall {
    kind: SyncRequestType,
    tx: oneshot::Sender<Result<SyncResponse, TransportError>>,
}

struct Shared {
    ids: RequestIdGenerator,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    closed: CancellationToken,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, response: Response) {
        let Some(call) = self.pending().remove(&response.id) else {
            warn!(
                request_id = %response.id,
                kind = ?response.body.kind(),
                "dropping response with no pending call"
            );
            return;
        };

        let outcome = if call.kind == response.body.kind() {
            Ok(response.body)
        } else {
            warn!(
                request_id = %response.id,
                expected = ?call.kind,
                got = ?response.body.kind(),
                "response kind does not match request"
            );
            Err(TransportError::Protocol(format!(
                "request {} expected a {:?} response, got {:?}",
                response.id,
                call.kind,
                response.body.kind()
            )))
        };

        if call.tx.send(outcome).is_err() {
            trace!(request_id = %response.id, "caller stopped waiting for response");
        }
    }

    fn fail_all(&self) {
        let drained: Vec<_> = self.pending().drain().collect();
        for (id, call) in drained {
            debug!(request_id = %id, "failing pending call: worker disconnected");
            let _ = call.tx.send(Err(TransportError::Disconnected));
        }
    }
}

/// Removes a pending entry when its caller stops waiting.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

/// Port onto one sync worker.
///
/// Cloning shares the port: clones see the same pending calls and the same
/// closed state.
#[derive(Clone)]
pub struct TransportChannel {
    worker_tx: WorkerSender,
    reply_tx: mpsc::UnboundedSender<Response>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("closed", &self.is_closed())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl TransportChannel {
    /// Open a new port onto the worker behind `worker_tx`.
    ///
    /// Must be called inside a tokio runtime; a dispatcher task routes
    /// responses to their callers.
    pub fn connect(worker_tx: WorkerSender) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            ids: RequestIdGenerator::default(),
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });

        tokio::spawn(dispatch(reply_rx, worker_tx.clone(), Arc::clone(&shared)));

        Self {
            worker_tx,
            reply_tx,
            shared,
        }
    }

    /// Send a request and wait for its correlated response.
    ///
    /// Unrelated calls proceed independently; each is keyed by its own id.
    pub async fn send_and_wait_for_response(
        &self,
        body: SyncRequest,
    ) -> Result<SyncResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }

        let id = self.shared.ids.next_id();
        let kind = body.kind();
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, PendingCall { kind, tx });
        let _guard = PendingGuard {
            shared: self.shared.as_ref(),
            id,
        };

        // `close()` cancels before draining, so a call registered after the
        // drain observes the cancellation here.
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Disconnected);
        }

        let inbound = WorkerInbound::Request {
            request: Request { id, body },
            responder: Responder {
                id,
                kind,
                reply_tx: Some(self.reply_tx.clone()),
            },
        };
        if self.worker_tx.send(inbound).await.is_err() {
            return Err(TransportError::Disconnected);
        }
        trace!(request_id = %id, kind = ?kind, "request sent to sync worker");

        rx.await.unwrap_or(Err(TransportError::Disconnected))
    }

    /// Fire-and-forget delivery of a notice.
    pub fn send(&self, notice: WorkerNotice) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        self.worker_tx
            .try_send(WorkerInbound::Notice(notice))
            .map_err(|err| match err {
                TrySendError::Full(_) => TransportError::Busy,
                TrySendError::Closed(_) => TransportError::Disconnected,
            })
    }

    /// Close this port. Pending calls resolve with `Disconnected` right away
    /// and later calls fail fast. The worker itself keeps running.
    pub fn close(&self) {
        self.shared.closed.cancel();
        self.shared.fail_all();
    }

    /// Whether this port is closed or the worker has terminated.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled() || self.worker_tx.is_closed()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending().len()
    }
}

async fn dispatch(
    mut replies: mpsc::UnboundedReceiver<Response>,
    worker_tx: WorkerSender,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            _ = worker_tx.closed() => {
                debug!("sync worker inbox closed");
                break;
            }
            reply = replies.recv() => match reply {
                Some(response) => shared.complete(response),
                None => break,
            },
        }
    }
    shared.fail_all();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::types::{PendingEventData, StartSyncParams};

    fn start_request() -> SyncRequest {
        SyncRequest::StartSync(StartSyncParams {
            session_id: "s1".into(),
            device_id: "d1".into(),
            user_id: "@a:x".into(),
            homeserver: "https://x".into(),
            access_token: "tok".into(),
            resume: None,
        })
    }

    fn pending_request(txn_id: &str) -> SyncRequest {
        SyncRequest::AddPendingEvent {
            pending_event: PendingEventData {
                room_id: "!room:x".into(),
                txn_id: txn_id.into(),
                event_type: "m.room.message".into(),
                content: json!({"body": txn_id}),
            },
        }
    }

    async fn next_request(inbox: &mut WorkerInbox) -> (Request, Responder) {
        let inbound = timeout(Duration::from_secs(2), inbox.recv())
            .await
            .expect("inbox timeout")
            .expect("inbox open");
        match inbound {
            WorkerInbound::Request { request, responder } => (request, responder),
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_calls_get_their_own_responses_out_of_order() {
        let (worker_tx, mut inbox) = worker_inbox(8);
        let channel = TransportChannel::connect(worker_tx);

        let first = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_and_wait_for_response(pending_request("a")).await }
        });
        let (req_a, resp_a) = next_request(&mut inbox).await;

        let second = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_and_wait_for_response(start_request()).await }
        });
        let (req_b, resp_b) = next_request(&mut inbox).await;
        assert_ne!(req_a.id, req_b.id);

        let rejected = SyncError::new(SyncErrorCategory::Config, "rejected", "no");
        assert!(resp_b.respond(Ok(())));
        assert!(resp_a.respond(Err(rejected.clone())));

        let b = second.await.expect("join b").expect("b response");
        let a = first.await.expect("join a").expect("a response");
        assert_eq!(b, SyncResponse::StartSync(Ok(())));
        assert_eq!(a, SyncResponse::AddPendingEvent(Err(rejected)));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped_without_disturbing_pending_calls() {
        let (worker_tx, mut inbox) = worker_inbox(8);
        let channel = TransportChannel::connect(worker_tx);

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_and_wait_for_response(start_request()).await }
        });
        let (_request, responder) = next_request(&mut inbox).await;

        let reply_tx = responder.reply_tx.clone().expect("reply port");
        reply_tx
            .send(Response {
                id: RequestId(9_999),
                body: SyncResponse::StartSync(Ok(())),
            })
            .expect("stray response sent");
        tokio::task::yield_now().await;
        assert_eq!(channel.pending_calls(), 1);

        responder.respond(Ok(()));
        let response = call.await.expect("join").expect("response");
        assert_eq!(response, SyncResponse::StartSync(Ok(())));
    }

    #[tokio::test]
    async fn duplicate_response_is_delivered_once() {
        let (worker_tx, mut inbox) = worker_inbox(8);
        let channel = TransportChannel::connect(worker_tx);

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_and_wait_for_response(start_request()).await }
        });
        let (request, responder) = next_request(&mut inbox).await;
        let reply_tx = responder.reply_tx.clone().expect("reply port");

        responder.respond(Ok(()));
        call.await.expect("join").expect("response");

        reply_tx
            .send(Response::answering(&request, Ok(())))
            .expect("duplicate sent");
        tokio::task::yield_now().await;
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn mismatched_response_kind_is_a_protocol_error() {
        let (worker_tx, mut inbox) = worker_inbox(8);
        let channel = TransportChannel::connect(worker_tx);

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_and_wait_for_response(start_request()).await }
        });
        let (request, mut responder) = next_request(&mut inbox).await;

        let reply_tx = responder.reply_tx.take().expect("reply port");
        reply_tx
            .send(Response {
                id: request.id,
                body: SyncResponse::AddPendingEvent(Ok(())),
            })
            .expect("send");

        let err = call.await.expect("join").expect_err("kind mismatch");
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn close_resolves_pending_calls_with_disconnected() {
        let (worker_tx, mut inbox) = worker_inbox(8);
        let channel = TransportChannel::connect(worker_tx);

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_and_wait_for_response(start_request()).await }
        });
        let (_request, _responder) = next_request(&mut inbox).await;

        channel.close();

        let err = timeout(Duration::from_millis(100), call)
            .await
            .expect("close must resolve the call promptly")
            .expect("join")
            .expect_err("closed channel");
        assert_eq!(err, TransportError::Disconnected);

        let err = channel
            .send_and_wait_for_response(start_request())
            .await
            .expect_err("closed channel rejects new calls");
        assert_eq!(err, TransportError::Disconnected);
    }

    #[tokio::test]
    async fn worker_termination_disconnects_callers() {
        let (worker_tx, mut inbox) = worker_inbox(8);
        let channel = TransportChannel::connect(worker_tx);

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_and_wait_for_response(start_request()).await }
        });
        let (_request, responder) = next_request(&mut inbox).await;
        std::mem::forget(responder);
        drop(inbox);

        let err = timeout(Duration::from_secs(1), call)
            .await
            .expect("termination timeout")
            .expect("join")
            .expect_err("worker is gone");
        assert_eq!(err, TransportError::Disconnected);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn dropped_responder_reports_response_dropped() {
        let (worker_tx, mut inbox) = worker_inbox(8);
        let channel = TransportChannel::connect(worker_tx);

        let call = tokio::spawn({
            let channel = channel.clone();
            async move { channel.send_and_wait_for_response(start_request()).await }
        });
        let (_request, responder) = next_request(&mut inbox).await;
        drop(responder);

        let response = call.await.expect("join").expect("response");
        let err = response.error().expect("remote error");
        assert_eq!(err.code, "response_dropped");
    }

    #[tokio::test]
    async fn notices_are_delivered_without_acknowledgement() {
        let (worker_tx, mut inbox) = worker_inbox(1);
        let channel = TransportChannel::connect(worker_tx);

        channel.send(WorkerNotice::StopSync).expect("notice");
        assert_eq!(
            channel.send(WorkerNotice::StopSync),
            Err(TransportError::Busy)
        );

        match inbox.recv().await.expect("inbound") {
            WorkerInbound::Notice(WorkerNotice::StopSync) => {}
            other => panic!("unexpected inbound: {other:?}"),
        }
    }
}
