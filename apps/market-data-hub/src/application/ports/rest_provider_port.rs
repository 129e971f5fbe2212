//! REST Provider Port (Driven Port)
//!
//! Uniform contract for plain HTTP/JSON market data providers. Adapters own
//! symbol translation and response normalization; callers only ever pass
//! canonical symbols.

use async_trait::async_trait;

use crate::domain::market::{HistoricalSeries, HistoryRange, SpotPrice};
use crate::domain::symbol::{Provider, Symbol};
use crate::error::MarketDataError;

/// REST market data provider.
#[async_trait]
pub trait RestProvider: Send + Sync {
    /// Provider identity, used for quota accounting.
    fn provider(&self) -> Provider;

    /// Check that the symbol maps to this provider's native form.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` if no exact mapping exists.
    fn check_symbol(&self, symbol: &Symbol) -> Result<(), MarketDataError>;

    /// Fetch a historical price series.
    ///
    /// # Errors
    ///
    /// Returns `QuotaExceeded` on HTTP 429, `Transport` on network or 5xx
    /// failures, `UpstreamRejected` on other 4xx, `Protocol` on unexpected
    /// response shapes and `UnsupportedSymbol` if the symbol has no mapping.
    async fn fetch_history(
        &self,
        symbol: &Symbol,
        range: HistoryRange,
    ) -> Result<HistoricalSeries, MarketDataError>;

    /// Fetch the current spot price.
    ///
    /// # Errors
    ///
    /// Same classification as [`RestProvider::fetch_history`].
    async fn fetch_spot(&self, symbol: &Symbol) -> Result<SpotPrice, MarketDataError>;
}
