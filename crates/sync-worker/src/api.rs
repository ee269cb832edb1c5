use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{Value, json};
use sync_core::{SyncError, SyncErrorCategory, classify_http_status};
use thiserror::Error;
use url::Url;

/// Extra time allowed on top of the server-side long-poll timeout.
const SYNC_TIMEOUT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

/// Whether a call may be repeated without changing its effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Reads and polls; safe to retry after any network failure.
    Idempotent,
    /// Writes; only retried when the request provably never applied.
    SideEffect,
}

/// One authenticated homeserver call, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub access_token: String,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
    pub kind: CallKind,
}

/// Failure reported by a [`HomeserverTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpFailure {
    /// No connection was established; the request never left the client.
    #[error("could not connect to homeserver: {0}")]
    ConnectFailed(String),
    /// Connection dropped after the request may have been sent.
    #[error("connection to homeserver lost: {0}")]
    ConnectionLost(String),
    #[error("homeserver request timed out")]
    TimedOut,
    /// The homeserver answered with a non-success status.
    #[error("homeserver responded {status}: {message}")]
    Status {
        status: u16,
        errcode: Option<String>,
        message: String,
        retry_after_ms: Option<u64>,
    },
    /// The homeserver answered but the body could not be read as JSON.
    #[error("unreadable homeserver response ({status}): {reason}")]
    InvalidResponse { status: u16, reason: String },
}

impl HttpFailure {
    /// Connectivity problem rather than an answer from the homeserver.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::ConnectionLost(_) | Self::TimedOut
        )
    }

    /// The homeserver provably did not process the request.
    pub fn definitely_not_applied(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::Status { status: 429, .. }
        )
    }

    pub fn to_sync_error(&self) -> SyncError {
        match self {
            Self::Status {
                status,
                errcode,
                message,
                retry_after_ms,
            } => {
                let mut err = SyncError::new(
                    classify_http_status(*status),
                    errcode.clone().unwrap_or_else(|| "http_error".to_owned()),
                    message.clone(),
                );
                err.retry_after_ms = *retry_after_ms;
                err
            }
            Self::InvalidResponse { .. } => SyncError::new(
                SyncErrorCategory::Serialization,
                "invalid_response",
                self.to_string(),
            ),
            other => SyncError::new(
                SyncErrorCategory::Network,
                "network_error",
                other.to_string(),
            ),
        }
    }
}

/// Executes homeserver calls. The HTTP stack lives behind this seam.
#[async_trait]
pub trait HomeserverTransport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<Value, HttpFailure>;
}

/// Builds authenticated client-server API requests for one login.
///
/// The access token is bound here once; callers never pass credentials.
#[derive(Clone)]
pub struct HomeserverApi {
    base: Url,
    access_token: Arc<str>,
    transport: Arc<dyn HomeserverTransport>,
}

impl std::fmt::Debug for HomeserverApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomeserverApi")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl HomeserverApi {
    pub fn new(
        homeserver: &str,
        access_token: impl Into<String>,
        transport: Arc<dyn HomeserverTransport>,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            base: parse_homeserver_url(homeserver)?,
            access_token: Arc::from(access_token.into()),
            transport,
        })
    }

    pub fn homeserver(&self) -> &Url {
        &self.base
    }

    pub(crate) fn transport(&self) -> &Arc<dyn HomeserverTransport> {
        &self.transport
    }

    /// `GET /sync` long-poll.
    pub fn sync(
        &self,
        since: Option<&str>,
        filter_id: Option<&str>,
        timeout_ms: u64,
    ) -> Result<ApiRequest, SyncError> {
        let mut url = self.endpoint(&["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &timeout_ms.to_string());
            if let Some(since) = since {
                query.append_pair("since", since);
            }
            if let Some(filter_id) = filter_id {
                query.append_pair("filter", filter_id);
            }
        }

        Ok(self.request(
            Method::Get,
            url,
            None,
            Some(Duration::from_millis(timeout_ms) + SYNC_TIMEOUT_GRACE),
            CallKind::Idempotent,
        ))
    }

    /// `POST /user/{userId}/filter`. Uploading the same filter twice only
    /// yields a second id, so it is treated as idempotent.
    pub fn create_filter(&self, user_id: &str, filter: Value) -> Result<ApiRequest, SyncError> {
        let url = self.endpoint(&["user", user_id, "filter"])?;
        Ok(self.request(Method::Post, url, Some(filter), None, CallKind::Idempotent))
    }

    /// `PUT /rooms/{roomId}/send/{eventType}/{txnId}`.
    pub fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        txn_id: &str,
        content: Value,
    ) -> Result<ApiRequest, SyncError> {
        let url = self.endpoint(&["rooms", room_id, "send", event_type, txn_id])?;
        Ok(self.request(Method::Put, url, Some(content), None, CallKind::SideEffect))
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        timeout: Option<Duration>,
        kind: CallKind,
    ) -> ApiRequest {
        ApiRequest {
            method,
            url,
            access_token: self.access_token.to_string(),
            body,
            timeout,
            kind,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| invalid_homeserver(self.base.as_str(), "url cannot be a base"))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }
}

/// Default filter uploaded before the first sync of a session.
pub fn default_sync_filter() -> Value {
    json!({
        "room": {
            "state": { "lazy_load_members": true },
            "timeline": { "limit": 20 }
        }
    })
}

/// Parse and check a homeserver base URL.
pub fn parse_homeserver_url(homeserver: &str) -> Result<Url, SyncError> {
    let url = Url::parse(homeserver.trim())
        .map_err(|err| invalid_homeserver(homeserver, &err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(invalid_homeserver(homeserver, "expected an http(s) base url"));
    }
    Ok(url)
}

fn invalid_homeserver(homeserver: &str, reason: &str) -> SyncError {
    SyncError::new(
        SyncErrorCategory::Config,
        "invalid_homeserver_url",
        format!("invalid homeserver url '{homeserver}': {reason}"),
    )
}
