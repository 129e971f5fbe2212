//! Normalized Market Data
//!
//! Provider adapters decode their wire formats into these types. Nothing
//! downstream of an adapter sees provider-specific field names.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::channel::KlineInterval;
use super::symbol::{Provider, Symbol};

// =============================================================================
// Stream Events
// =============================================================================

/// Side of the aggressor (taker) in a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakerSide {
    /// Taker bought (lifted the ask).
    Buy,
    /// Taker sold (hit the bid).
    Sell,
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Exchange trade id.
    pub trade_id: u64,
    /// Execution price.
    pub price: Decimal,
    /// Executed base quantity.
    pub quantity: Decimal,
    /// Aggressor side.
    pub taker_side: TakerSide,
    /// Exchange trade time.
    pub trade_time: DateTime<Utc>,
}

impl TradeEvent {
    /// Quote-currency value of the trade (`price * quantity`).
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// Rolling 24h ticker update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerEvent {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Last traded price.
    pub last_price: Decimal,
    /// 24h price change in percent.
    pub change_percent_24h: Decimal,
    /// 24h high.
    pub high_24h: Decimal,
    /// 24h low.
    pub low_24h: Decimal,
    /// 24h base volume.
    pub volume_24h: Decimal,
    /// Best bid, if reported.
    pub best_bid: Option<Decimal>,
    /// Best ask, if reported.
    pub best_ask: Option<Decimal>,
    /// Exchange event time.
    pub event_time: DateTime<Utc>,
}

/// One price level in an order book delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// New quantity at this level (zero removes the level).
    pub quantity: Decimal,
}

/// Incremental order book update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookDelta {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// First update id covered by this delta.
    pub first_update_id: u64,
    /// Last update id covered by this delta.
    pub final_update_id: u64,
    /// Changed bid levels.
    pub bids: Vec<BookLevel>,
    /// Changed ask levels.
    pub asks: Vec<BookLevel>,
    /// Exchange event time.
    pub event_time: DateTime<Utc>,
}

/// Candlestick update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineEvent {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Candle interval.
    pub interval: KlineInterval,
    /// Candle open time.
    pub open_time: DateTime<Utc>,
    /// Candle close time.
    pub close_time: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close (latest) price.
    pub close: Decimal,
    /// Base volume.
    pub volume: Decimal,
    /// Whether the candle is final.
    pub closed: bool,
}

/// Normalized stream event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    /// Ticker update.
    Ticker(TickerEvent),
    /// Trade.
    Trade(TradeEvent),
    /// Order book delta.
    OrderBook(OrderBookDelta),
    /// Candlestick update.
    Kline(KlineEvent),
}

impl MarketEvent {
    /// Symbol the event belongs to.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        match self {
            Self::Ticker(e) => &e.symbol,
            Self::Trade(e) => &e.symbol,
            Self::OrderBook(e) => &e.symbol,
            Self::Kline(e) => &e.symbol,
        }
    }
}

// =============================================================================
// Snapshots and REST Results
// =============================================================================

/// Latest known price for a symbol, folded from ticker events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceSnapshot {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Last traded price.
    pub last_price: Decimal,
    /// 24h change in percent.
    pub change_percent_24h: Decimal,
    /// Best bid, if known.
    pub best_bid: Option<Decimal>,
    /// Best ask, if known.
    pub best_ask: Option<Decimal>,
    /// Exchange event time of the last update.
    pub event_time: DateTime<Utc>,
    /// Local time the last update was applied.
    pub received_at: DateTime<Utc>,
    /// Older than the configured freshness bound at read time.
    pub stale: bool,
}

/// Lookback range for historical queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HistoryRange {
    /// Last 24 hours.
    #[serde(rename = "1d")]
    Day,
    /// Last 7 days.
    #[serde(rename = "7d")]
    Week,
    /// Last 30 days.
    #[serde(rename = "30d")]
    Month,
    /// Last 90 days.
    #[serde(rename = "90d")]
    Quarter,
    /// Last 365 days.
    #[serde(rename = "1y")]
    Year,
}

impl HistoryRange {
    /// Number of days covered.
    #[must_use]
    pub const fn days(self) -> u32 {
        match self {
            Self::Day => 1,
            Self::Week => 7,
            Self::Month => 30,
            Self::Quarter => 90,
            Self::Year => 365,
        }
    }

    /// Range code (`1d`, `7d`, `30d`, `90d`, `1y`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "1d",
            Self::Week => "7d",
            Self::Month => "30d",
            Self::Quarter => "90d",
            Self::Year => "1y",
        }
    }

    /// Parse a range code.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "1d" => Some(Self::Day),
            "7d" => Some(Self::Week),
            "30d" => Some(Self::Month),
            "90d" => Some(Self::Quarter),
            "1y" | "365d" => Some(Self::Year),
            _ => None,
        }
    }
}

/// One point of a historical price series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Sample time.
    pub time: DateTime<Utc>,
    /// Price in the quote currency.
    pub price: Decimal,
}

/// Historical price series from a REST provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalSeries {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Requested range.
    pub range: HistoryRange,
    /// Provider that served the data.
    pub provider: Provider,
    /// Samples in ascending time order.
    pub points: Vec<PricePoint>,
}

/// Spot price from a REST provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotPrice {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Provider that served the data.
    pub provider: Provider,
    /// Price in the quote currency.
    pub price: Decimal,
    /// Time the provider response was received.
    pub as_of: DateTime<Utc>,
}
