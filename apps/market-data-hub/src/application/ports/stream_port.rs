//! Stream Ports (Driven Ports)
//!
//! The multiplexer depends on exactly three things from an exchange stream:
//! an endpoint per channel key, a parser that returns normalized events, and
//! close/error signaling from the transport.

use async_trait::async_trait;

use crate::domain::channel::ChannelKey;
use crate::domain::market::MarketEvent;
use crate::domain::symbol::Provider;
use crate::error::MarketDataError;

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A normalized market event.
    Event(MarketEvent),
    /// Control traffic (subscription acks, keepalives) with no payload.
    Control,
    /// The upstream explicitly refused the subscription.
    Rejected(String),
}

/// Protocol adapter for one exchange's streaming API.
pub trait StreamProvider: Send + Sync {
    /// Provider this adapter speaks for.
    fn provider(&self) -> Provider;

    /// WebSocket URL for a channel.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` if the channel's symbol has no native form.
    fn endpoint(&self, key: &ChannelKey) -> Result<String, MarketDataError>;

    /// Message to send right after connecting, if the protocol needs one.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` if the channel's symbol has no native form.
    fn subscribe_message(&self, key: &ChannelKey) -> Result<Option<String>, MarketDataError>;

    /// Decode one text frame received on `key`'s connection.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for malformed or unexpected payloads.
    fn decode(&self, key: &ChannelKey, text: &str) -> Result<Decoded, MarketDataError>;
}

/// Opens physical stream connections.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the connection cannot be established.
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamSession>, MarketDataError>;
}

/// One open physical connection.
#[async_trait]
pub trait StreamSession: Send {
    /// Send a text frame.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the frame cannot be written.
    async fn send_text(&mut self, text: String) -> Result<(), MarketDataError>;

    /// Wait for the next text frame. `Ok(None)` means the peer closed.
    ///
    /// # Errors
    ///
    /// Returns `Transport` on read failures or heartbeat timeouts.
    async fn next_text(&mut self) -> Result<Option<String>, MarketDataError>;

    /// Close the connection. Errors are ignored.
    async fn close(&mut self);
}
