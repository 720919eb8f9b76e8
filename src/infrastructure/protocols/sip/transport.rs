//! SIP over WebSocket transport (RFC 7118)
//!
//! One connection at a time. Every event is tagged with the generation of
//! the connection that produced it so the engine can ignore stragglers from
//! a socket it already replaced.

use super::message::SipError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// SIP WebSocket subprotocol name
pub const SIP_WS_SUBPROTOCOL: &str = "sip";

/// Event raised by a connection
pub enum TransportEvent {
    Opened {
        generation: u64,
        connection: Arc<dyn SipConnection>,
    },
    Message {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

impl TransportEvent {
    pub fn generation(&self) -> u64 {
        match self {
            TransportEvent::Opened { generation, .. }
            | TransportEvent::Message { generation, .. }
            | TransportEvent::Closed { generation, .. } => *generation,
        }
    }
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Opened { generation, .. } => {
                f.debug_struct("Opened").field("generation", generation).finish()
            }
            TransportEvent::Message { generation, text } => f
                .debug_struct("Message")
                .field("generation", generation)
                .field("len", &text.len())
                .finish(),
            TransportEvent::Closed { generation, reason } => f
                .debug_struct("Closed")
                .field("generation", generation)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Where a connection reports what happens to it
#[derive(Debug, Clone)]
pub struct TransportSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self, connection: Arc<dyn SipConnection>) {
        let _ = self.tx.send(TransportEvent::Opened {
            generation: self.generation,
            connection,
        });
    }

    pub fn message(&self, text: String) {
        let _ = self.tx.send(TransportEvent::Message {
            generation: self.generation,
            text,
        });
    }

    pub fn closed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(TransportEvent::Closed {
            generation: self.generation,
            reason: reason.into(),
        });
    }
}

/// An open signaling connection
pub trait SipConnection: Send + Sync {
    /// Queue one whole SIP message as a text frame
    fn send(&self, text: String) -> Result<(), SipError>;

    /// Close with normal closure; no `Closed` event is guaranteed afterwards
    fn close(&self);
}

/// Opens signaling connections
#[async_trait]
pub trait SipConnector: Send + Sync {
    /// Connect to `url`. On success the connector must call
    /// [`TransportSink::opened`] before delivering any message.
    async fn connect(&self, url: &str, sink: TransportSink) -> Result<(), SipError>;
}

/// Exponential reconnect backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before 1-based `attempt`, `None` once attempts are exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.cap))
    }
}

enum Outgoing {
    Text(String),
    Close,
}

struct WsConnection {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl SipConnection for WsConnection {
    fn send(&self, text: String) -> Result<(), SipError> {
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_| SipError::TransportError("WebSocket is closed".to_string()))
    }

    fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// `tokio-tungstenite` client connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    ping_interval: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(30))
    }
}

impl WsConnector {
    pub fn new(connect_timeout: Duration, ping_interval: Duration) -> Self {
        Self {
            connect_timeout,
            ping_interval,
        }
    }
}

#[async_trait]
impl SipConnector for WsConnector {
    async fn connect(&self, url: &str, sink: TransportSink) -> Result<(), SipError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SipError::TransportError(format!("Invalid WebSocket URL {}: {}", url, e)))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SIP_WS_SUBPROTOCOL),
        );

        debug!("Connecting to {}", url);
        let (stream, response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| SipError::TransportError(format!("Connect to {} timed out", url)))?
                .map_err(|e| SipError::TransportError(format!("Connect to {} failed: {}", url, e)))?;

        let protocol = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        info!("WebSocket connected to {} (subprotocol: {})", url, protocol);

        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.opened(Arc::new(WsConnection { tx }));

        let (mut write, mut read) = stream.split();
        let ping_interval = self.ping_interval;

        tokio::spawn(async move {
            let mut ping = tokio::time::interval_at(
                tokio::time::Instant::now() + ping_interval,
                ping_interval,
            );

            loop {
                tokio::select! {
                    outgoing = rx.recv() => match outgoing {
                        Some(Outgoing::Text(text)) => {
                            if let Err(e) = write.send(WsMessage::Text(text)).await {
                                warn!("WebSocket send failed: {}", e);
                                sink.closed(format!("send failed: {}", e));
                                break;
                            }
                        }
                        Some(Outgoing::Close) | None => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "".into(),
                            };
                            if let Err(e) = write.send(WsMessage::Close(Some(frame))).await {
                                debug!("Failed to send close frame: {}", e);
                            }
                            let _ = write.close().await;
                            sink.closed("closed by client");
                            break;
                        }
                    },
                    incoming = read.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => sink.message(text),
                        Some(Ok(WsMessage::Binary(data))) => {
                            sink.message(String::from_utf8_lossy(&data).into_owned())
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by server ({}): {}", u16::from(f.code), f.reason))
                                .unwrap_or_else(|| "closed by server".to_string());
                            info!("WebSocket {}", reason);
                            sink.closed(reason);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            sink.closed(e.to_string());
                            break;
                        }
                        None => {
                            sink.closed("stream ended");
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        if let Err(e) = write.send(WsMessage::Ping(Vec::new())).await {
                            warn!("WebSocket ping failed: {}", e);
                            sink.closed(format!("ping failed: {}", e));
                            break;
                        }
                    }
                }
            }
            debug!("WebSocket task for generation {} finished", sink.generation());
        });

        Ok(())
    }
}
