//! Transport adapter: the only component that touches HTTP.
//!
//! The rest of the client sees a single capability, [`Transport::send`],
//! which yields either the raw status and body or a [`TransportError`].
//! Timeout and retry policy belong here and are configured through
//! [`TransportConfig`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use thiserror::Error;
use tracing::{debug, warn};

use m4e_shared::constants::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS};

/// Delay before the first retry; doubled for every further attempt.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Timeout and retry policy of the HTTP adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Raw result of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures below the HTTP status level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::Timeout)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// Capability that sends a request and eventually yields a response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<RawResponse, TransportError>;
}

/// reqwest based adapter.
pub struct HttpTransport {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| TransportError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }

    async fn send_once(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<RawResponse, TransportError> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(RawResponse { status, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<String>,
    ) -> Result<RawResponse, TransportError> {
        let mut attempt = 0;
        loop {
            match self.send_once(method.clone(), url.clone(), body.clone()).await {
                Ok(response) => {
                    debug!(%method, url = %url, status = response.status, "HTTP exchange completed");
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = RETRY_BACKOFF * 2u32.pow(attempt - 1);
                    warn!(%method, url = %url, error = %e, attempt, "Retrying request");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Scriptable in-memory transport.
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use reqwest::{Method, Url};
    use serde_json::{json, Value};
    use tokio::sync::oneshot;

    use super::{RawResponse, Transport, TransportError};

    /// Scripted reply for one request.
    pub enum MockReply {
        Response(RawResponse),
        Failure(TransportError),
        /// Resolved by the test through the paired sender.
        Deferred(oneshot::Receiver<RawResponse>),
    }

    /// A request the mock received.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MockCall {
        pub method: Method,
        pub path: String,
        pub body: Option<String>,
    }

    /// Replies are queued per `(method, path)`; an unscripted request
    /// yields a 404 with an empty body.
    #[derive(Default)]
    pub struct MockTransport {
        routes: Mutex<HashMap<(Method, String), VecDeque<MockReply>>>,
        calls: Mutex<Vec<MockCall>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, method: Method, path: &str, reply: MockReply) {
            let mut routes = self.routes.lock().unwrap();
            routes
                .entry((method, path.to_string()))
                .or_default()
                .push_back(reply);
        }

        /// Queue a successful envelope carrying `data`.
        pub fn ok(&self, method: Method, path: &str, data: Value) {
            self.on(method, path, MockReply::Response(ok_envelope(data)));
        }

        /// Queue a `nok` envelope.
        pub fn nok(&self, method: Method, path: &str, code: u16, description: &str) {
            self.on(method, path, MockReply::Response(nok_envelope(code, description)));
        }

        pub fn fail(&self, method: Method, path: &str, error: TransportError) {
            self.on(method, path, MockReply::Failure(error));
        }

        /// Queue a reply released later through the returned sender.
        pub fn defer(&self, method: Method, path: &str) -> oneshot::Sender<RawResponse> {
            let (tx, rx) = oneshot::channel();
            self.on(method, path, MockReply::Deferred(rx));
            tx
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(
            &self,
            method: Method,
            url: Url,
            body: Option<String>,
        ) -> Result<RawResponse, TransportError> {
            let path = url.path().to_string();
            self.calls.lock().unwrap().push(MockCall {
                method: method.clone(),
                path: path.clone(),
                body,
            });

            let reply = self
                .routes
                .lock()
                .unwrap()
                .get_mut(&(method, path))
                .and_then(|queue| queue.pop_front());

            match reply {
                Some(MockReply::Response(response)) => Ok(response),
                Some(MockReply::Failure(error)) => Err(error),
                Some(MockReply::Deferred(rx)) => rx
                    .await
                    .map_err(|_| TransportError::Connect("deferred reply dropped".into())),
                None => Ok(RawResponse {
                    status: 404,
                    body: String::new(),
                }),
            }
        }
    }

    pub fn ok_envelope(data: Value) -> RawResponse {
        RawResponse {
            status: 200,
            body: json!({"status": "ok", "code": 200, "description": "", "data": data}).to_string(),
        }
    }

    pub fn nok_envelope(code: u16, description: &str) -> RawResponse {
        RawResponse {
            status: 200,
            body: json!({"status": "nok", "code": code, "description": description, "data": {}})
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Connect("refused".into()).is_retryable());
        assert!(!TransportError::Request("bad".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_http_transport_returns_status_and_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/events")
            .with_status(200)
            .with_body(r#"{"status":"ok","code":200,"description":"","data":[]}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(&TransportConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/rest/events", server.url())).unwrap();
        let response = transport.send(Method::GET, url, None).await.unwrap();

        assert_eq!(response.status, 200);
        assert!(response.body.contains("\"ok\""));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_transport_sends_json_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/rest/events/putlocation/E1")
            .match_header("content-type", "application/json")
            .match_body(r#"{"name":"Pizza"}"#)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let transport = HttpTransport::new(&TransportConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/rest/events/putlocation/E1", server.url())).unwrap();
        let response = transport
            .send(Method::PUT, url, Some(r#"{"name":"Pizza"}"#.to_string()))
            .await
            .unwrap();

        assert_eq!(response.status, 500);
        assert!(!response.is_success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_mock_transport_defaults_to_404() {
        let transport = mock::MockTransport::new();
        let url = Url::parse("http://mock.local/rest/events").unwrap();
        let response = transport.send(Method::GET, url, None).await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(transport.call_count(), 1);
    }
}
