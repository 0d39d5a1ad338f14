//! Request dispatcher.
//!
//! Each dispatched request gets a unique id and a pending record holding
//! its operation, target and decoder. The exchange runs on its own task;
//! its outcome is delivered through a oneshot channel, so every request
//! completes exactly once, with either a typed response or one error.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use reqwest::Url;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use m4e_shared::constants::REST_ROOT;
use m4e_shared::ClientError;

use crate::decode::{decode_response, ApiResponse, Decoder};
use crate::rest::{Operation, Request, Target};
use crate::transport::Transport;

/// Correlation id of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

impl RequestId {
    fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one request.
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: RequestId,
    pub operation: Operation,
    pub target: Target,
    pub outcome: Result<ApiResponse, ClientError>,
}

struct PendingRequest {
    id: RequestId,
    operation: Operation,
    target: Target,
    decoder: Decoder,
}

impl PendingRequest {
    fn complete(self, outcome: Result<ApiResponse, ClientError>) -> Completion {
        Completion {
            id: self.id,
            operation: self.operation,
            target: self.target,
            outcome,
        }
    }
}

/// Future of a dispatched request.
///
/// Dropping it discards the result once it arrives.
pub struct PendingCall {
    id: RequestId,
    operation: Operation,
    target: Target,
    rx: oneshot::Receiver<Completion>,
}

impl PendingCall {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl Future for PendingCall {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completion> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(completion)) => Poll::Ready(completion),
            Poll::Ready(Err(_)) => Poll::Ready(Completion {
                id: self.id,
                operation: self.operation,
                target: self.target.clone(),
                outcome: Err(ClientError::Transport("request task aborted".into())),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sends requests through a [`Transport`] and routes the results back.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    base_url: Url,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, base_url: Url) -> Self {
        Self {
            transport,
            base_url,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of requests whose exchange has not finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn url_for(&self, request: &Request) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ClientError::InvalidRequest(format!("base URL {} cannot carry a path", self.base_url))
            })?;
            segments.pop_if_empty().push(REST_ROOT);
            for segment in request.path_segments() {
                segments.push(&segment);
            }
        }
        Ok(url)
    }

    /// Start a request. Must be called within a tokio runtime.
    pub fn dispatch(&self, request: Request) -> PendingCall {
        let operation = request.operation();
        let pending = PendingRequest {
            id: RequestId::new(),
            operation,
            target: request.target(),
            decoder: operation.decoder(),
        };
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            id: pending.id,
            operation,
            target: pending.target.clone(),
            rx,
        };

        let prepared = request
            .validate()
            .and_then(|_| self.url_for(&request))
            .map(|url| (request.method(), url, request.body()));

        let (method, url, body) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(id = %pending.id, %operation, error = %e, "Request rejected before sending");
                let _ = tx.send(pending.complete(Err(e)));
                return call;
            }
        };

        debug!(id = %pending.id, %operation, %method, url = %url, "Dispatching request");
        let transport = self.transport.clone();
        let in_flight = self.in_flight.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let outcome = match transport.send(method, url, body).await {
                Ok(raw) => decode_response(pending.operation, &pending.target, pending.decoder, raw),
                Err(e) => Err(ClientError::Transport(e.to_string())),
            };
            in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Err(e) = &outcome {
                debug!(id = %pending.id, operation = %pending.operation, error = %e, "Request failed");
            }
            let id = pending.id;
            if tx.send(pending.complete(outcome)).is_err() {
                debug!(%id, "Result discarded, caller went away");
            }
        });

        call
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::transport::{RawResponse, TransportError};
    use m4e_shared::types::{EventId, UserId};
    use reqwest::Method;
    use serde_json::json;

    fn dispatcher(mock: Arc<MockTransport>) -> Dispatcher {
        Dispatcher::new(mock, Url::parse("http://mock.local/m4e").unwrap())
    }

    fn add_member() -> Request {
        Request::AddMember {
            event_id: EventId::new("E1"),
            member_id: UserId::new("U2"),
        }
    }

    #[test]
    fn test_url_building_escapes_segments() {
        let d = dispatcher(Arc::new(MockTransport::new()));
        let url = d
            .url_for(&Request::SearchUsers {
                keyword: "a b/c".into(),
            })
            .unwrap();
        assert_eq!(url.path(), "/m4e/rest/users/search/a%20b%2Fc");
    }

    #[tokio::test]
    async fn test_success_completes_with_typed_response() {
        let mock = Arc::new(MockTransport::new());
        mock.ok(
            Method::PUT,
            "/m4e/rest/events/addmember/E1/U2",
            json!({"eventId": "E1", "memberId": "U2"}),
        );
        let d = dispatcher(mock.clone());

        let completion = d.dispatch(add_member()).await;
        assert_eq!(completion.operation, Operation::AddMember);
        assert!(matches!(
            completion.outcome,
            Ok(ApiResponse::MemberAdded { .. })
        ));
        assert_eq!(d.in_flight(), 0);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_every_failure_completes_once_with_one_error() {
        let path = "/m4e/rest/events/addmember/E1/U2";
        let mock = Arc::new(MockTransport::new());
        mock.fail(Method::PUT, path, TransportError::Timeout);
        mock.on(
            Method::PUT,
            path,
            crate::transport::mock::MockReply::Response(RawResponse {
                status: 200,
                body: "{not json".into(),
            }),
        );
        mock.nok(Method::PUT, path, 403, "not the owner");
        let d = dispatcher(mock.clone());

        let codes: Vec<String> = futures::future::join_all(
            (0..3).map(|_| d.dispatch(add_member())),
        )
        .await
        .into_iter()
        .map(|c| c.outcome.unwrap_err().error_code().to_string())
        .collect();

        let mut sorted = codes.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["403", "protocol", "transport"]);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_transport() {
        let mock = Arc::new(MockTransport::new());
        let d = dispatcher(mock.clone());
        let completion = d
            .dispatch(Request::SearchUsers {
                keyword: String::new(),
            })
            .await;
        assert!(matches!(
            completion.outcome,
            Err(ClientError::InvalidRequest(_))
        ));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_call_discards_result() {
        let mock = Arc::new(MockTransport::new());
        let release = mock.defer(Method::GET, "/m4e/rest/events");
        let d = dispatcher(mock.clone());

        let call = d.dispatch(Request::GetEvents);
        tokio::task::yield_now().await;
        assert_eq!(d.in_flight(), 1);
        drop(call);

        let _ = release.send(RawResponse {
            status: 200,
            body: json!({"status":"ok","code":200,"description":"","data":[]}).to_string(),
        });
        for _ in 0..10 {
            if d.in_flight() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(d.in_flight(), 0);
    }
}
