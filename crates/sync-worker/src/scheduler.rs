use std::sync::Arc;

use serde_json::Value;
use sync_core::{SyncError, SyncErrorCategory};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{
    api::{ApiRequest, CallKind, HomeserverApi, HttpFailure},
    reconnector::Reconnector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Attempts per call, including the first one.
    pub max_attempts: u32,
    pub max_concurrent_requests: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_concurrent_requests: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// 401/403: credentials are no longer valid.
    #[error("homeserver rejected credentials: {0}")]
    Unauthorized(SyncError),
    #[error("homeserver error: {0}")]
    Homeserver(SyncError),
    /// A side-effecting call may or may not have been applied.
    #[error("outcome of side-effecting request unknown: {0}")]
    UnknownOutcome(String),
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("request scheduler is shut down")]
    Stopped,
}

impl SchedulerError {
    pub fn to_sync_error(&self) -> SyncError {
        match self {
            Self::Unauthorized(err) | Self::Homeserver(err) => err.clone(),
            Self::UnknownOutcome(message) => {
                SyncError::new(SyncErrorCategory::Network, "unknown_outcome", message.clone())
            }
            Self::RetriesExhausted { .. } => {
                SyncError::new(SyncErrorCategory::Network, "retries_exhausted", self.to_string())
            }
            Self::Stopped => {
                SyncError::new(SyncErrorCategory::Internal, "scheduler_stopped", self.to_string())
            }
        }
    }
}

enum FailureAction {
    Terminal,
    Surface,
    Unknown,
    RetryNetwork,
    RetryRateLimited(Option<u64>),
}

fn classify(kind: CallKind, failure: &HttpFailure) -> FailureAction {
    if failure.is_network() {
        return if kind == CallKind::Idempotent || failure.definitely_not_applied() {
            FailureAction::RetryNetwork
        } else {
            FailureAction::Unknown
        };
    }
    match failure {
        HttpFailure::Status {
            status: 401 | 403, ..
        } => FailureAction::Terminal,
        HttpFailure::Status {
            status: 429,
            retry_after_ms,
            ..
        } => FailureAction::RetryRateLimited(*retry_after_ms),
        _ => FailureAction::Surface,
    }
}

/// Runs authenticated homeserver calls with bounded concurrency and
/// reconnect-aware retry.
#[derive(Debug, Clone)]
pub struct RequestScheduler {
    api: HomeserverApi,
    reconnector: Arc<Reconnector>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
}

impl RequestScheduler {
    pub fn new(api: HomeserverApi, reconnector: Arc<Reconnector>, config: SchedulerConfig) -> Self {
        Self {
            api,
            reconnector,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            config,
        }
    }

    /// Request builder with this scheduler's credentials.
    pub fn api(&self) -> &HomeserverApi {
        &self.api
    }

    pub fn reconnector(&self) -> &Arc<Reconnector> {
        &self.reconnector
    }

    /// Fail queued and future calls with [`SchedulerError::Stopped`].
    pub fn shutdown(&self) {
        self.permits.close();
    }

    pub async fn request(&self, request: ApiRequest) -> Result<Value, SchedulerError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            self.wait_for_retry_window().await;
            if self.permits.is_closed() {
                return Err(SchedulerError::Stopped);
            }
            attempt += 1;

            let failure = match self.api.transport().execute(request.clone()).await {
                Ok(body) => {
                    self.reconnector.on_success();
                    return Ok(body);
                }
                Err(failure) => failure,
            };

            match classify(request.kind, &failure) {
                FailureAction::Terminal => {
                    warn!(
                        path = request.url.path(),
                        error = %failure,
                        "homeserver rejected credentials"
                    );
                    return Err(SchedulerError::Unauthorized(failure.to_sync_error()));
                }
                FailureAction::Surface => {
                    return Err(SchedulerError::Homeserver(failure.to_sync_error()));
                }
                FailureAction::Unknown => {
                    self.reconnector.on_network_failure();
                    warn!(
                        path = request.url.path(),
                        error = %failure,
                        "side-effecting request outcome unknown"
                    );
                    return Err(SchedulerError::UnknownOutcome(failure.to_string()));
                }
                FailureAction::RetryNetwork => {
                    let delay = self.reconnector.on_network_failure();
                    if attempt >= max_attempts {
                        self.reconnector.mark_offline();
                        return Err(SchedulerError::RetriesExhausted {
                            attempts: attempt,
                            last: failure.to_string(),
                        });
                    }
                    debug!(
                        path = request.url.path(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "retrying homeserver request"
                    );
                }
                FailureAction::RetryRateLimited(hint) => {
                    if attempt >= max_attempts {
                        return Err(SchedulerError::Homeserver(failure.to_sync_error()));
                    }
                    let delay = self
                        .reconnector
                        .policy()
                        .delay_for_attempt(attempt - 1, hint);
                    debug!(
                        path = request.url.path(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn wait_for_retry_window(&self) {
        if let Some(retry_at) = self.reconnector.retry_at()
            && retry_at > tokio::time::Instant::now()
        {
            tokio::time::sleep_until(retry_at).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;
    use sync_core::RetryPolicy;

    use super::*;
    use crate::{api::HomeserverTransport, reconnector::ConnectionStatus};

    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<Value, HttpFailure>>>,
        seen: Mutex<Vec<ApiRequest>>,
    }

    impl Scripted {
        fn with(replies: Vec<Result<Value, HttpFailure>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::default(),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().expect("seen lock").len()
        }
    }

    #[async_trait]
    impl HomeserverTransport for Scripted {
        async fn execute(&self, request: ApiRequest) -> Result<Value, HttpFailure> {
            self.seen.lock().expect("seen lock").push(request);
            self.replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or_else(|| Ok(json!({})))
        }
    }

    fn scheduler(transport: Arc<Scripted>, max_attempts: u32) -> RequestScheduler {
        let api = HomeserverApi::new("https://hs.example.org", "tok", transport)
            .expect("homeserver api");
        RequestScheduler::new(
            api,
            Arc::new(Reconnector::new(RetryPolicy::new(100, 1_000))),
            SchedulerConfig {
                max_attempts,
                max_concurrent_requests: 2,
            },
        )
    }

    fn refused() -> Result<Value, HttpFailure> {
        Err(HttpFailure::ConnectFailed("connection refused".into()))
    }

    fn status(code: u16) -> Result<Value, HttpFailure> {
        Err(HttpFailure::Status {
            status: code,
            errcode: None,
            message: format!("status {code}"),
            retry_after_ms: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_call_retries_through_network_failures() {
        let transport = Scripted::with(vec![refused(), refused(), refused(), Ok(json!({"ok": 1}))]);
        let scheduler = scheduler(Arc::clone(&transport), 5);
        let request = scheduler.api().sync(None, None, 0).expect("sync request");

        let started = tokio::time::Instant::now();
        let body = scheduler.request(request).await.expect("eventually succeeds");

        assert_eq!(body, json!({"ok": 1}));
        assert_eq!(transport.calls(), 4);
        assert!(started.elapsed() >= Duration::from_millis(100 + 200 + 400));
        let backoff = scheduler.reconnector().backoff();
        assert_eq!(backoff.current_delay, Duration::from_millis(100));
        assert_eq!(backoff.attempts, 0);
        assert_eq!(scheduler.reconnector().status(), ConnectionStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn side_effect_after_lost_connection_is_unknown_outcome() {
        let transport = Scripted::with(vec![Err(HttpFailure::ConnectionLost("reset".into()))]);
        let scheduler = scheduler(Arc::clone(&transport), 5);
        let request = scheduler
            .api()
            .send_event("!r:x", "m.room.message", "t1", json!({}))
            .expect("send request");

        let err = scheduler.request(request).await.expect_err("ambiguous failure");

        assert!(matches!(err, SchedulerError::UnknownOutcome(_)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn side_effect_retries_when_request_never_left() {
        let transport = Scripted::with(vec![refused(), Ok(json!({"event_id": "$e"}))]);
        let scheduler = scheduler(Arc::clone(&transport), 5);
        let request = scheduler
            .api()
            .send_event("!r:x", "m.room.message", "t1", json!({}))
            .expect("send request");

        let body = scheduler.request(request).await.expect("retried");
        assert_eq!(body["event_id"], "$e");
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_retried_for_side_effects() {
        let transport = Scripted::with(vec![
            Err(HttpFailure::Status {
                status: 429,
                errcode: Some("M_LIMIT_EXCEEDED".into()),
                message: "slow down".into(),
                retry_after_ms: Some(750),
            }),
            Ok(json!({})),
        ]);
        let scheduler = scheduler(Arc::clone(&transport), 5);
        let request = scheduler
            .api()
            .send_event("!r:x", "m.room.message", "t1", json!({}))
            .expect("send request");

        let started = tokio::time::Instant::now();
        scheduler.request(request).await.expect("retried after hint");
        assert!(started.elapsed() >= Duration::from_millis(750));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_is_terminal_and_leaves_reconnector_alone() {
        let transport = Scripted::with(vec![status(401)]);
        let scheduler = scheduler(Arc::clone(&transport), 5);
        let request = scheduler.api().sync(None, None, 0).expect("sync request");

        let err = scheduler.request(request).await.expect_err("terminal");

        assert!(matches!(err, SchedulerError::Unauthorized(_)));
        assert_eq!(err.to_sync_error().category, SyncErrorCategory::Auth);
        assert_eq!(transport.calls(), 1);
        assert_eq!(scheduler.reconnector().backoff().attempts, 0);
        assert_eq!(scheduler.reconnector().status(), ConnectionStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_surface_without_retry() {
        let transport = Scripted::with(vec![status(500)]);
        let scheduler = scheduler(Arc::clone(&transport), 5);
        let request = scheduler.api().sync(None, None, 0).expect("sync request");

        let err = scheduler.request(request).await.expect_err("surfaced");
        assert!(matches!(err, SchedulerError::Homeserver(_)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_success_body_is_not_treated_as_delivered() {
        let transport = Scripted::with(vec![Err(HttpFailure::InvalidResponse {
            status: 200,
            reason: "expected value at line 1 column 1".into(),
        })]);
        let scheduler = scheduler(Arc::clone(&transport), 5);
        let request = scheduler
            .api()
            .send_event("!r:x", "m.room.message", "t1", json!({}))
            .expect("send request");

        let err = scheduler.request(request).await.expect_err("surfaced");

        assert!(matches!(err, SchedulerError::Homeserver(_)));
        assert_eq!(err.to_sync_error().code, "invalid_response");
        assert_eq!(err.to_sync_error().category, SyncErrorCategory::Serialization);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_offline() {
        let transport = Scripted::with(vec![refused(), refused(), refused()]);
        let scheduler = scheduler(Arc::clone(&transport), 3);
        let request = scheduler.api().sync(None, None, 0).expect("sync request");

        let err = scheduler.request(request).await.expect_err("exhausted");

        assert!(matches!(err, SchedulerError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(scheduler.reconnector().status(), ConnectionStatus::Offline);
        assert!(err.to_sync_error().is_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_are_bound_at_construction() {
        let transport = Scripted::with(vec![]);
        let scheduler = scheduler(Arc::clone(&transport), 1);
        let request = scheduler.api().sync(None, None, 0).expect("sync request");
        scheduler.request(request).await.expect("ok");

        let seen = transport.seen.lock().expect("seen lock");
        assert_eq!(seen[0].access_token, "tok");
    }

    #[tokio::test]
    async fn shutdown_rejects_new_calls() {
        let scheduler = scheduler(Scripted::with(vec![]), 1);
        scheduler.shutdown();
        let request = scheduler.api().sync(None, None, 0).expect("sync request");
        assert_eq!(
            scheduler.request(request).await.expect_err("stopped"),
            SchedulerError::Stopped
        );
    }
}
