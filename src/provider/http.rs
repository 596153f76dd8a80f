//! HTTP transport, shared client, and auth header helpers.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use tracing::debug;

use super::{ByteStream, WireRequest};
use crate::error::{KestrelError, Result};

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
///
/// No overall request timeout: streams legitimately run for minutes and idle
/// detection belongs to the run loop.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

/// Build default headers for a Bearer-token API. Keyless local servers get no
/// authorization header.
pub fn bearer_headers(api_key: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(api_key) = api_key {
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
            headers.insert(AUTHORIZATION, val);
        }
    }
    headers
}

/// Build Anthropic-style headers (x-api-key).
pub fn anthropic_headers(api_key: Option<&str>, version: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(api_key) = api_key {
        if let Ok(val) = HeaderValue::from_str(api_key) {
            headers.insert("x-api-key", val);
        }
    }
    if let Ok(val) = HeaderValue::from_str(version) {
        headers.insert("anthropic-version", val);
    }
    headers
}

/// Map a non-2xx response to a provider error, preferring the API's own message.
pub fn status_to_error(status: u16, body: &str) -> KestrelError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let error = v.get("error")?;
            error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                body.to_string()
            }
        });
    KestrelError::provider(status, message)
}

/// Collaborator used by provider adapters to reach model APIs.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Single-response mode: POST and return the parsed JSON body.
    async fn send(&self, request: WireRequest) -> Result<Value>;

    /// Streaming mode: POST and hand back raw body chunks as they arrive.
    /// `stream_id` is the caller's routing key for the chunks.
    async fn stream(&self, stream_id: &str, request: WireRequest) -> Result<ByteStream>;
}

/// [`HttpTransport`] backed by the shared reqwest client.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestTransport;

impl ReqwestTransport {
    pub fn new() -> Self {
        Self
    }

    async fn post(&self, request: WireRequest) -> Result<reqwest::Response> {
        let response = shared_client()
            .post(&request.url)
            .headers(request.headers)
            .json(&request.body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_to_error(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: WireRequest) -> Result<Value> {
        let response = self.post(request).await?;
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| KestrelError::malformed(format!("response body is not JSON: {e}")))
    }

    async fn stream(&self, stream_id: &str, request: WireRequest) -> Result<ByteStream> {
        debug!(stream_id, url = %request.url, "opening provider stream");
        let response = self.post(request).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(KestrelError::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_prefers_api_message() {
        let err = status_to_error(401, r#"{"error":{"message":"invalid api key","type":"auth"}}"#);
        match err {
            KestrelError::Provider {
                status_code,
                message,
            } => {
                assert_eq!(status_code, Some(401));
                assert_eq!(message, "invalid api key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn status_error_falls_back_to_body() {
        let err = status_to_error(502, "bad gateway");
        assert_eq!(err.to_string(), "Provider error (status 502): bad gateway");
        let err = status_to_error(500, "");
        assert_eq!(err.to_string(), "Provider error (status 500): HTTP 500");
    }

    #[test]
    fn bearer_headers_skip_missing_key() {
        assert!(bearer_headers(None).get(AUTHORIZATION).is_none());
        assert_eq!(
            bearer_headers(Some("sk-1")).get(AUTHORIZATION).unwrap(),
            "Bearer sk-1"
        );
    }
}
