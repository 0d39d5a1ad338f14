//! Server notification channel.
//!
//! Notifications arrive as JSON text frames on a websocket. The channel
//! reconnects with exponential backoff until it is closed; frames that do
//! not decode are logged and skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use m4e_shared::constants::{CHANNEL_CAPACITY, DEFAULT_NOTIFY_PATH};
use m4e_shared::protocol::Notification;
use m4e_shared::ClientError;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A stream of server notifications.
#[async_trait]
pub trait NotificationSource: Send {
    /// Start delivering notifications. Reopening replaces the previous stream.
    async fn open(&mut self) -> Result<mpsc::Receiver<Notification>, ClientError>;

    /// Stop delivering. Idempotent.
    async fn close(&mut self);
}

/// Websocket URL next to the REST root: `http://host/app` becomes
/// `ws://host/app/ws`.
pub fn derive_notify_url(server_url: &Url) -> Result<Url, ClientError> {
    let scheme = match server_url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    let base = server_url.as_str().trim_end_matches('/');
    let rest = base
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(base);
    Url::parse(&format!("{scheme}://{rest}{DEFAULT_NOTIFY_PATH}"))
        .map_err(|e| ClientError::InvalidRequest(format!("invalid notification URL: {e}")))
}

struct Inner {
    url: Url,
    shutdown: Notify,
    shutdown_requested: AtomicBool,
}

/// Websocket notification channel with automatic reconnection.
pub struct WsNotificationChannel {
    url: Url,
    inner: Option<Arc<Inner>>,
    task: Option<JoinHandle<()>>,
}

impl WsNotificationChannel {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            inner: None,
            task: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn run_connection_loop(inner: Arc<Inner>, tx: mpsc::Sender<Notification>) {
        let mut backoff = INITIAL_BACKOFF;
        info!("Starting notification channel to {}", inner.url);

        while !inner.shutdown_requested.load(Ordering::Acquire) {
            tokio::select! {
                _ = inner.shutdown.notified() => break,
                result = Self::connect_once(&inner, &tx) => {
                    if inner.shutdown_requested.load(Ordering::Acquire) || tx.is_closed() {
                        break;
                    }
                    match result {
                        Ok(()) => {
                            info!("Notification channel to {} closed, reconnecting", inner.url);
                            backoff = INITIAL_BACKOFF;
                        }
                        Err(e) => {
                            error!("Notification channel to {} failed: {}", inner.url, e);
                            info!("Retrying notification channel in {:?}", backoff);
                            tokio::select! {
                                _ = inner.shutdown.notified() => break,
                                _ = sleep(backoff) => {}
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
            }
        }
        debug!("Notification channel to {} stopped", inner.url);
    }

    async fn connect_once(
        inner: &Arc<Inner>,
        tx: &mpsc::Sender<Notification>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let (ws_stream, _) = connect_async(inner.url.as_str()).await?;
        info!("Notification channel connected to {}", inner.url);
        let (mut sink, mut stream) = ws_stream.split();

        loop {
            tokio::select! {
                _ = inner.shutdown.notified() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match Notification::from_json(&text) {
                        Ok(notification) => {
                            debug!(kind = notification.kind(), "Notification received");
                            if tx.send(notification).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => warn!("Skipping undecodable notification: {}", e),
                    },
                    Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => debug!("Ignoring non-text frame"),
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }

    fn stop(&mut self) -> Option<JoinHandle<()>> {
        if let Some(inner) = self.inner.take() {
            inner.shutdown_requested.store(true, Ordering::Release);
            inner.shutdown.notify_waiters();
        }
        self.task.take()
    }
}

#[async_trait]
impl NotificationSource for WsNotificationChannel {
    async fn open(&mut self) -> Result<mpsc::Receiver<Notification>, ClientError> {
        self.close().await;

        let inner = Arc::new(Inner {
            url: self.url.clone(),
            shutdown: Notify::new(),
            shutdown_requested: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.task = Some(tokio::spawn(Self::run_connection_loop(inner.clone(), tx)));
        self.inner = Some(inner);
        Ok(rx)
    }

    async fn close(&mut self) {
        if let Some(task) = self.stop() {
            if let Err(e) = task.await {
                warn!("Notification task join error during close: {}", e);
            }
        }
    }
}

impl Drop for WsNotificationChannel {
    fn drop(&mut self) {
        if let Some(task) = self.stop() {
            task.abort();
        }
    }
}

/// In-process notification source fed through a sender.
///
/// Used by embedders that relay notifications from elsewhere and by tests.
pub struct ChannelNotificationSource {
    rx: Option<mpsc::Receiver<Notification>>,
    closed: bool,
}

impl ChannelNotificationSource {
    /// A source and the sender that feeds it.
    pub fn pair() -> (mpsc::Sender<Notification>, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            tx,
            Self {
                rx: Some(rx),
                closed: false,
            },
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl NotificationSource for ChannelNotificationSource {
    async fn open(&mut self) -> Result<mpsc::Receiver<Notification>, ClientError> {
        self.closed = false;
        self.rx
            .take()
            .ok_or_else(|| ClientError::InvalidRequest("notification source already opened".into()))
    }

    async fn close(&mut self) {
        self.rx = None;
        self.closed = true;
    }
}
