use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use crate::api::{ApiRequest, HomeserverTransport, HttpFailure, Method};

/// [`HomeserverTransport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HomeserverTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<Value, HttpFailure> {
        let mut builder = match request.method {
            Method::Get => self.client.get(request.url),
            Method::Post => self.client.post(request.url),
            Method::Put => self.client.put(request.url),
        }
        .bearer_auth(&request.access_token);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_send_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(map_body_error)?;
        read_response(status, &bytes)
    }
}

/// Decode a homeserver reply. Error bodies that are not JSON still yield a
/// status failure; a success body must be JSON.
fn read_response(status: StatusCode, bytes: &[u8]) -> Result<Value, HttpFailure> {
    let parsed = serde_json::from_slice::<Value>(bytes);

    if status.is_success() {
        return parsed.map_err(|err| HttpFailure::InvalidResponse {
            status: status.as_u16(),
            reason: err.to_string(),
        });
    }

    let body = parsed.unwrap_or(Value::Null);
    Err(HttpFailure::Status {
        status: status.as_u16(),
        errcode: body
            .get("errcode")
            .and_then(Value::as_str)
            .map(str::to_owned),
        message: body
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| status.to_string()),
        retry_after_ms: body.get("retry_after_ms").and_then(Value::as_u64),
    })
}

fn map_send_error(err: reqwest::Error) -> HttpFailure {
    if err.is_connect() || err.is_builder() {
        HttpFailure::ConnectFailed(err.to_string())
    } else if err.is_timeout() {
        HttpFailure::TimedOut
    } else {
        HttpFailure::ConnectionLost(err.to_string())
    }
}

fn map_body_error(err: reqwest::Error) -> HttpFailure {
    if err.is_timeout() {
        HttpFailure::TimedOut
    } else {
        HttpFailure::ConnectionLost(err.to_string())
    }
}
