//! Management WebSocket
//!
//! One long-lived connection to the server. Frames read from it land in an
//! inbound channel; writes go through a mutex since the sink is not shared
//! safely. The connection counts as up only after the capability report
//! has been sent, and [`DeviceConnection::ensure_ready`] waits for that.

pub mod backoff;
pub mod dispatch;
pub mod fs;
pub mod messages;
pub mod shell;

use std::future::Future;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

pub use backoff::Backoff;
pub use dispatch::Dispatcher;
pub use messages::{DeviceMessage, ExecStatus};

use crate::{Error, Result};

/// Inbound frames buffered before the reader waits
pub const INBOUND_BUFFER: usize = 1024;

/// A connection that stayed up this long resets the reconnect backoff
pub const BACKOFF_RESET_THRESHOLD: Duration = Duration::from_secs(10);

/// Underlying WebSocket stream
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable connection
    Disconnected,
    /// Connected and greeted
    Connected,
}

/// Open a WebSocket at `url` with a bearer token
///
/// # Errors
///
/// Returns `Connection` for a bad token or TLS setup, `WebSocket` if the
/// handshake fails
pub async fn connect(url: &Url, token: &str, certificate: Option<&[u8]>) -> Result<WsStream> {
    let mut request = url.as_str().into_client_request()?;
    let auth = HeaderValue::from_str(token).map_err(|e| Error::Connection(format!("invalid token header: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, auth);

    let connector = match certificate {
        Some(pem) if url.scheme() == "wss" => {
            let cert = native_tls::Certificate::from_pem(pem)
                .map_err(|e| Error::Config(format!("invalid server certificate: {e}")))?;
            let tls = native_tls::TlsConnector::builder()
                .add_root_certificate(cert)
                .build()
                .map_err(|e| Error::Connection(format!("TLS setup failed: {e}")))?;
            Some(Connector::NativeTls(tls))
        }
        _ => None,
    };

    tracing::info!(url = %url, "connecting");
    let (stream, _) = tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector).await?;
    Ok(stream)
}

/// The device management connection
pub struct DeviceConnection {
    url: Url,
    certificate: Option<Vec<u8>>,
    greeting: DeviceMessage,
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    state: watch::Sender<ConnectionState>,
    inbound: mpsc::Sender<String>,
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DeviceConnection {
    /// Connection to `url` that greets with `greeting`, plus the receiver of
    /// inbound text frames
    #[must_use]
    pub fn new(url: Url, certificate: Option<Vec<u8>>, greeting: DeviceMessage) -> (Self, mpsc::Receiver<String>) {
        let (inbound, rx) = mpsc::channel(INBOUND_BUFFER);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let connection = Self {
            url,
            certificate,
            greeting,
            writer: Mutex::new(None),
            state,
            inbound,
        };
        (connection, rx)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection is up and greeted
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires first
    pub async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.subscribe();
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            changed = state.wait_for(|s| *s == ConnectionState::Connected) => {
                changed.map(drop).map_err(|_| Error::Connection("connection dropped".to_string()))
            }
        }
    }

    async fn write(&self, message: &DeviceMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Send once on a ready connection
    ///
    /// # Errors
    ///
    /// Returns `Connection` when disconnected, or the write error
    pub async fn send(&self, message: &DeviceMessage) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(Error::Connection("not connected".to_string()));
        }
        self.write(message).await
    }

    /// Send, waiting for the connection and retrying with backoff
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires before the message went out
    pub async fn send_retry(&self, message: &DeviceMessage, cancel: &CancellationToken) -> Result<()> {
        let mut backoff = Backoff::send();
        loop {
            self.ensure_ready(cancel).await?;
            match self.send(message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(method = message.method(), error = %e, ?delay, "send failed, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect, greet, and pump frames until the connection ends
    ///
    /// # Errors
    ///
    /// Returns the connect, greet or read error that ended the session
    pub async fn run_session(&self, token: &str, cancel: &CancellationToken) -> Result<()> {
        let stream = connect(&self.url, token, self.certificate.as_deref()).await?;
        let (sink, mut stream) = stream.split();
        *self.writer.lock().await = Some(sink);

        let result = async {
            self.write(&self.greeting).await?;
            self.state.send_replace(ConnectionState::Connected);
            tracing::info!("management connection established");

            loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    frame = stream.next() => frame,
                };
                match frame {
                    None => return Err(Error::Connection("server closed the connection".to_string())),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(text))) => {
                        if self.inbound.send(text).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "server closed the connection");
                        return Ok(());
                    }
                    Some(Ok(Message::Binary(_))) => tracing::debug!("ignoring binary frame"),
                    Some(Ok(_)) => {}
                }
            }
        }
        .await;

        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        result
    }

    /// Keep a session running until cancelled, reconnecting with backoff
    ///
    /// `token` is asked for a fresh `Authorization` value before every
    /// connect.
    pub async fn maintain<F, Fut>(&self, token: F, cancel: &CancellationToken)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let mut backoff = Backoff::reconnect();
        while !cancel.is_cancelled() {
            match token().await {
                Ok(token) => {
                    let started = tokio::time::Instant::now();
                    if let Err(e) = self.run_session(&token, cancel).await {
                        tracing::warn!(error = %e, "restarting device connection");
                    }
                    if started.elapsed() > BACKOFF_RESET_THRESHOLD {
                        backoff.reset();
                    }
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) => tracing::warn!(error = %e, "restarting device connection, no device token"),
            }

            let delay = backoff.next_delay();
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
