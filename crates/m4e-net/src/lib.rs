//! Networking layer of the events client: the HTTP transport, the REST
//! request catalogue with its decoders, the request dispatcher and the
//! server notification channel.

pub mod decode;
pub mod dispatcher;
pub mod notify;
pub mod rest;
pub mod transport;

pub use decode::ApiResponse;
pub use dispatcher::{Completion, Dispatcher, PendingCall, RequestId};
pub use notify::{ChannelNotificationSource, NotificationSource, WsNotificationChannel};
pub use rest::{Operation, Request, Target};
pub use transport::{HttpTransport, RawResponse, Transport, TransportConfig, TransportError};

pub use reqwest::{Method, Url};
