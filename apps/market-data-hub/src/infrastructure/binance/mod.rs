//! Binance Stream Adapter
//!
//! Implements [`StreamProvider`] for Binance spot market streams.
//!
//! # Symbol Translation
//!
//! Canonical `BASE-QUOTE` maps to Binance's concatenated form (`BTCUSDT`)
//! only for the quote assets Binance actually lists against. Anything else
//! is `UnsupportedSymbol`; nothing is guessed.
//!
//! # Streams
//!
//! | Kind | Stream name |
//! |---|---|
//! | Trade | `btcusdt@trade` |
//! | Ticker | `btcusdt@ticker` |
//! | Order book | `btcusdt@depth@100ms` |
//! | Kline | `btcusdt@kline_1m` |

pub mod messages;

use serde_json::Value;

use self::messages::{BinanceEvent, ErrorFrame, SubscribeRequest};
use crate::application::ports::{Decoded, StreamProvider};
use crate::domain::channel::{ChannelKey, StreamKind};
use crate::domain::market::MarketEvent;
use crate::domain::symbol::{Provider, Symbol};
use crate::error::MarketDataError;

/// Default Binance spot stream endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://stream.binance.com:9443/ws";

/// Quote assets with Binance spot markets.
const QUOTE_ASSETS: [&str; 9] = ["USDT", "USDC", "FDUSD", "BTC", "ETH", "BNB", "EUR", "TRY", "BRL"];

/// Binance spot stream adapter.
#[derive(Debug, Clone)]
pub struct BinanceStreamProvider {
    base_url: String,
}

impl Default for BinanceStreamProvider {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_URL)
    }
}

impl BinanceStreamProvider {
    /// Create an adapter for the given stream endpoint.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Native symbol (`BTCUSDT`) for a canonical symbol.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` if the quote asset is not listed.
    pub fn native_symbol(symbol: &Symbol) -> Result<String, MarketDataError> {
        if QUOTE_ASSETS.contains(&symbol.quote()) {
            Ok(format!("{}{}", symbol.base(), symbol.quote()))
        } else {
            Err(MarketDataError::UnsupportedSymbol {
                provider: Provider::Binance,
                symbol: symbol.to_string(),
            })
        }
    }

    /// Stream name for a channel (`btcusdt@trade`).
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedSymbol` if the symbol has no native form.
    pub fn stream_name(key: &ChannelKey) -> Result<String, MarketDataError> {
        let native = Self::native_symbol(&key.symbol)?.to_lowercase();
        Ok(match key.kind {
            StreamKind::Trade => format!("{native}@trade"),
            StreamKind::Ticker => format!("{native}@ticker"),
            StreamKind::OrderBook => format!("{native}@depth@100ms"),
            StreamKind::Kline(interval) => format!("{native}@kline_{}", interval.as_str()),
        })
    }

    fn check_provider(key: &ChannelKey) -> Result<(), MarketDataError> {
        if key.provider == Provider::Binance {
            Ok(())
        } else {
            Err(MarketDataError::UnsupportedSymbol {
                provider: key.provider,
                symbol: key.symbol.to_string(),
            })
        }
    }
}

impl StreamProvider for BinanceStreamProvider {
    fn provider(&self) -> Provider {
        Provider::Binance
    }

    fn endpoint(&self, key: &ChannelKey) -> Result<String, MarketDataError> {
        Self::check_provider(key)?;
        Self::native_symbol(&key.symbol)?;
        Ok(self.base_url.clone())
    }

    fn subscribe_message(&self, key: &ChannelKey) -> Result<Option<String>, MarketDataError> {
        Self::check_provider(key)?;
        let request = SubscribeRequest::new(vec![Self::stream_name(key)?], 1);
        serde_json::to_string(&request)
            .map(Some)
            .map_err(|e| MarketDataError::Internal(format!("failed to encode subscribe request: {e}")))
    }

    fn decode(&self, key: &ChannelKey, text: &str) -> Result<Decoded, MarketDataError> {
        let protocol = |message: String| MarketDataError::protocol(Provider::Binance.as_str(), message);

        let mut value: Value =
            serde_json::from_str(text).map_err(|e| protocol(format!("invalid JSON: {e}")))?;

        // Combined-stream envelope: {"stream": "...", "data": {...}}
        if value.get("stream").is_some()
            && let Some(data) = value.get_mut("data")
        {
            value = data.take();
        }

        if value.get("e").is_some() {
            let event: BinanceEvent = serde_json::from_value(value)
                .map_err(|e| protocol(format!("malformed event: {e}")))?;

            let expected = Self::native_symbol(&key.symbol)?;
            if event.native_symbol() != expected {
                return Err(protocol(format!(
                    "event for {} on {expected} channel",
                    event.native_symbol()
                )));
            }

            let event = event.into_market_event(&key.symbol).map_err(protocol)?;
            if !matches_kind(&event, key.kind) {
                return Err(protocol(format!("unexpected event on {} channel", key.kind)));
            }
            return Ok(Decoded::Event(event));
        }

        if let Some(error) = value.get("error") {
            let error: ErrorFrame = serde_json::from_value(error.clone())
                .map_err(|e| protocol(format!("malformed error frame: {e}")))?;
            return Ok(Decoded::Rejected(format!("{}: {}", error.code, error.msg)));
        }

        if value.get("result").is_some() || value.get("id").is_some() {
            return Ok(Decoded::Control);
        }

        Err(protocol("unrecognized frame".to_string()))
    }
}

fn matches_kind(event: &MarketEvent, kind: StreamKind) -> bool {
    match (event, kind) {
        (MarketEvent::Trade(_), StreamKind::Trade)
        | (MarketEvent::Ticker(_), StreamKind::Ticker)
        | (MarketEvent::OrderBook(_), StreamKind::OrderBook) => true,
        (MarketEvent::Kline(k), StreamKind::Kline(interval)) => k.interval == interval,
        _ => false,
    }
}
