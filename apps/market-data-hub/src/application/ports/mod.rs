//! Application Ports (Driven)
//!
//! Interfaces the hub uses to reach the outside world:
//! - Stream providers and transports (exchange WebSockets)
//! - REST data providers
//! - Durable storage for quota counters
//! - Wall-clock time

mod clock_port;
mod ledger_store_port;
mod rest_provider_port;
mod stream_port;

pub use clock_port::{Clock, ManualClock, SystemClock};
pub use ledger_store_port::{InMemoryLedgerStore, LedgerSnapshot, LedgerStore, LedgerStoreError};
pub use rest_provider_port::RestProvider;
pub use stream_port::{Decoded, StreamProvider, StreamSession, StreamTransport};
