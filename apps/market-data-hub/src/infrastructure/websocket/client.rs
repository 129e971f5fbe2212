//! Tungstenite WebSocket Transport
//!
//! Opens one TLS WebSocket per session. While a session is read, the
//! transport answers server pings, sends its own pings on an interval, and
//! fails the session when nothing arrives within the idle timeout.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{StreamSession, StreamTransport};
use crate::error::MarketDataError;

/// Connection and keepalive timing.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Maximum time for the TCP, TLS and upgrade handshake.
    pub connect_timeout: Duration,
    /// Interval between client pings.
    pub ping_interval: Duration,
    /// A session with no inbound frame for this long is considered dead.
    pub idle_timeout: Duration,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// [`StreamTransport`] over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    config: WsTransportConfig,
}

impl WsTransport {
    /// Create a transport with the given timing.
    #[must_use]
    pub const fn new(config: WsTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamSession>, MarketDataError> {
        let connect = tokio_tungstenite::connect_async(url);
        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| MarketDataError::transport(url, "connect timed out"))?
            .map_err(|e| MarketDataError::transport(url, e.to_string()))?;

        tracing::debug!(url, "WebSocket connected");

        let mut ping = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Box::new(WsSession {
            url: url.to_string(),
            stream,
            ping,
            idle_timeout: self.config.idle_timeout,
            last_inbound: Instant::now(),
        }))
    }
}

struct WsSession {
    url: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ping: Interval,
    idle_timeout: Duration,
    last_inbound: Instant,
}

enum Wake {
    Ping,
    Idle,
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

impl WsSession {
    fn transport_error(&self, message: impl Into<String>) -> MarketDataError {
        MarketDataError::transport(self.url.clone(), message)
    }

    async fn send(&mut self, message: Message) -> Result<(), MarketDataError> {
        self.stream
            .send(message)
            .await
            .map_err(|e| self.transport_error(e.to_string()))
    }
}

#[async_trait]
impl StreamSession for WsSession {
    async fn send_text(&mut self, text: String) -> Result<(), MarketDataError> {
        self.send(Message::Text(text.into())).await
    }

    async fn next_text(&mut self) -> Result<Option<String>, MarketDataError> {
        loop {
            let deadline = self.last_inbound + self.idle_timeout;
            let wake = tokio::select! {
                _ = self.ping.tick() => Wake::Ping,
                () = tokio::time::sleep_until(deadline) => Wake::Idle,
                frame = self.stream.next() => Wake::Frame(frame),
            };

            let frame = match wake {
                Wake::Ping => {
                    self.send(Message::Ping(Vec::new().into())).await?;
                    continue;
                }
                Wake::Idle => {
                    return Err(self.transport_error(format!(
                        "no frames for {}s",
                        self.idle_timeout.as_secs()
                    )));
                }
                Wake::Frame(None) => return Ok(None),
                Wake::Frame(Some(Err(e))) => return Err(self.transport_error(e.to_string())),
                Wake::Frame(Some(Ok(frame))) => frame,
            };

            self.last_inbound = Instant::now();
            match frame {
                Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => tracing::trace!(url = %self.url, "Ignoring non-UTF-8 binary frame"),
                },
                Message::Ping(data) => self.send(Message::Pong(data)).await?,
                Message::Close(frame) => {
                    tracing::info!(url = %self.url, frame = ?frame, "Server sent close frame");
                    return Ok(None);
                }
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::trace!(url = %self.url, error = %e, "Close handshake failed");
        }
    }
}
