//! In-memory homeserver for tests.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use crate::api::{ApiRequest, HomeserverTransport, HttpFailure, Method};

/// Homeserver fake that answers filter uploads and event sends directly and
/// serves `/sync` polls from a script fed by the test.
///
/// A poll with nothing scripted blocks, like an idle long-poll.
pub struct ScriptedHomeserver {
    filter_id: String,
    sync_tx: mpsc::UnboundedSender<Result<Value, HttpFailure>>,
    sync_rx: AsyncMutex<mpsc::UnboundedReceiver<Result<Value, HttpFailure>>>,
    send_failures: Mutex<Vec<HttpFailure>>,
    send_gate: watch::Sender<bool>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl Default for ScriptedHomeserver {
    fn default() -> Self {
        Self::with_filter_id("f1")
    }
}

impl ScriptedHomeserver {
    pub fn with_filter_id(filter_id: impl Into<String>) -> Self {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        Self {
            filter_id: filter_id.into(),
            sync_tx,
            sync_rx: AsyncMutex::new(sync_rx),
            send_failures: Mutex::default(),
            send_gate: watch::Sender::new(true),
            requests: Mutex::default(),
        }
    }

    /// Queue the body of the next `/sync` response.
    pub fn push_sync(&self, body: Value) {
        let _ = self.sync_tx.send(Ok(body));
    }

    pub fn push_sync_failure(&self, failure: HttpFailure) {
        let _ = self.sync_tx.send(Err(failure));
    }

    /// Fail the next event send with `failure`.
    pub fn fail_next_send(&self, failure: HttpFailure) {
        lock(&self.send_failures).push(failure);
    }

    /// Park event sends until [`Self::release_sends`].
    pub fn hold_sends(&self) {
        self.send_gate.send_replace(false);
    }

    pub fn release_sends(&self) {
        self.send_gate.send_replace(true);
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.requests).clone()
    }

    /// `(room_id, txn_id)` of every event send, in arrival order.
    pub fn sent_events(&self) -> Vec<(String, String)> {
        lock(&self.requests)
            .iter()
            .filter(|request| request.method == Method::Put)
            .filter_map(|request| {
                let segments: Vec<_> = request.url.path_segments()?.collect();
                match segments.as_slice() {
                    [.., "rooms", room, "send", _, txn] => {
                        Some((decode(room), decode(txn)))
                    }
                    _ => None,
                }
            })
            .collect()
    }
}

/// Minimal `/sync` body with the given `next_batch` and to-device events.
pub fn sync_body(next_batch: &str, to_device: Vec<Value>) -> Value {
    json!({
        "next_batch": next_batch,
        "to_device": { "events": to_device },
    })
}

fn decode(segment: &str) -> String {
    url::form_urlencoded::parse(format!("v={segment}").as_bytes())
        .map(|(_, value)| value.into_owned())
        .next()
        .unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl HomeserverTransport for ScriptedHomeserver {
    async fn execute(&self, request: ApiRequest) -> Result<Value, HttpFailure> {
        lock(&self.requests).push(request.clone());
        let path = request.url.path();

        if path.ends_with("/sync") {
            let mut script = self.sync_rx.lock().await;
            return match script.recv().await {
                Some(reply) => reply,
                None => Err(HttpFailure::ConnectionLost("script closed".into())),
            };
        }
        if path.ends_with("/filter") {
            return Ok(json!({ "filter_id": self.filter_id }));
        }
        if request.method == Method::Put {
            let mut gate = self.send_gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
            let failure = {
                let mut failures = lock(&self.send_failures);
                (!failures.is_empty()).then(|| failures.remove(0))
            };
            if let Some(failure) = failure {
                return Err(failure);
            }
            let txn = request
                .url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default()
                .to_owned();
            return Ok(json!({ "event_id": format!("${txn}") }));
        }

        Err(HttpFailure::Status {
            status: 404,
            errcode: Some("M_UNRECOGNIZED".into()),
            message: format!("unscripted path {path}"),
            retry_after_ms: None,
        })
    }
}
