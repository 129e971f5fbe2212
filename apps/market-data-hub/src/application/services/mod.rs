//! Application Services
//!
//! - [`multiplexer`]: one upstream connection per channel, fanned out to
//!   subscribers
//! - [`ledger`]: per-provider quota accounting
//! - [`cache`]: coalescing TTL cache for REST responses
//! - [`tracker`]: large-trade aggregation over trade channels
//! - [`price_book`]: latest ticker snapshot per symbol
//! - [`facade`]: the consumer entry point
//! - [`hub`]: registry with explicit init and shutdown

pub mod cache;
pub mod facade;
pub mod hub;
pub mod ledger;
pub mod multiplexer;
pub mod price_book;
pub mod reconnect;
pub mod tracker;

pub use cache::{CacheLookup, ResponseCache};
pub use facade::{DataFacade, FacadeConfig, RealtimeQuote};
pub use hub::{HubDependencies, HubSettings, MarketDataHub};
pub use ledger::{ProviderUsage, RateLimitLedger, RequestUsage, UsageReport, WindowUsage};
pub use multiplexer::{
    ChannelMessage, ChannelStatus, MessageCallback, MultiplexerConfig, StreamMultiplexer,
    SubscriptionHandle, async_callback, callback,
};
pub use price_book::PriceBook;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use tracker::{LargeTradeTracker, TrackerConfig};
