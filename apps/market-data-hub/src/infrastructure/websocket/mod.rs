//! WebSocket Transports
//!
//! Implementations of [`StreamTransport`](crate::application::ports::StreamTransport):
//!
//! - [`WsTransport`]: real connections over `tokio-tungstenite` with
//!   keepalive pings and an idle timeout
//! - [`MemoryTransport`]: scripted in-process sessions for tests and local
//!   development

mod client;
mod memory;

pub use client::{WsTransport, WsTransportConfig};
pub use memory::MemoryTransport;
