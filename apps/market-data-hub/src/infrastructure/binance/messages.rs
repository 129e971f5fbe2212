//! Binance WebSocket Message Types
//!
//! Wire format types for Binance spot market streams. Field names follow
//! Binance's single-letter keys; decimals arrive as strings and times as
//! epoch milliseconds.
//!
//! # Message Types
//!
//! ## Control Messages
//! - `SubscribeRequest`: `{"method":"SUBSCRIBE","params":[..],"id":1}`
//! - Ack: `{"result":null,"id":1}`
//! - `ErrorFrame`: `{"error":{"code":2,"msg":".."},"id":1}`
//!
//! ## Market Events (tagged by `e`)
//! - `trade`: Individual trades
//! - `24hrTicker`: Rolling 24h statistics
//! - `depthUpdate`: Order book deltas
//! - `kline`: Candlesticks
//!
//! # References
//!
//! - [Spot WebSocket Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::channel::KlineInterval;
use crate::domain::market::{
    BookLevel, KlineEvent, MarketEvent, OrderBookDelta, TakerSide, TickerEvent, TradeEvent,
};
use crate::domain::symbol::Symbol;

// =============================================================================
// Control Messages
// =============================================================================

/// Subscribe request sent after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscribeRequest {
    /// Always `SUBSCRIBE`.
    pub method: &'static str,
    /// Stream names (`btcusdt@trade`).
    pub params: Vec<String>,
    /// Request id echoed in the ack.
    pub id: u64,
}

impl SubscribeRequest {
    /// Subscribe request for the given streams.
    #[must_use]
    pub const fn new(params: Vec<String>, id: u64) -> Self {
        Self {
            method: "SUBSCRIBE",
            params,
            id,
        }
    }
}

/// Error body of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorFrame {
    /// Binance error code.
    pub code: i64,
    /// Error message.
    pub msg: String,
}

// =============================================================================
// Market Events
// =============================================================================

/// Market event payload, discriminated by the `e` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "e")]
pub enum BinanceEvent {
    /// Individual trade.
    #[serde(rename = "trade")]
    Trade(TradePayload),
    /// Rolling 24h ticker.
    #[serde(rename = "24hrTicker")]
    Ticker(TickerPayload),
    /// Order book delta.
    #[serde(rename = "depthUpdate")]
    Depth(DepthPayload),
    /// Candlestick.
    #[serde(rename = "kline")]
    Kline(KlinePayload),
}

impl BinanceEvent {
    /// Native symbol the event refers to (`BTCUSDT`).
    #[must_use]
    pub fn native_symbol(&self) -> &str {
        match self {
            Self::Trade(p) => &p.symbol,
            Self::Ticker(p) => &p.symbol,
            Self::Depth(p) => &p.symbol,
            Self::Kline(p) => &p.symbol,
        }
    }

    /// Normalize into a market event for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn into_market_event(self, symbol: &Symbol) -> Result<MarketEvent, String> {
        match self {
            Self::Trade(p) => Ok(MarketEvent::Trade(TradeEvent {
                symbol: symbol.clone(),
                trade_id: p.trade_id,
                price: p.price,
                quantity: p.quantity,
                // Buyer is maker, so the taker sold.
                taker_side: if p.buyer_is_maker {
                    TakerSide::Sell
                } else {
                    TakerSide::Buy
                },
                trade_time: millis(p.trade_time, "T")?,
            })),
            Self::Ticker(p) => Ok(MarketEvent::Ticker(TickerEvent {
                symbol: symbol.clone(),
                last_price: p.last_price,
                change_percent_24h: p.change_percent,
                high_24h: p.high,
                low_24h: p.low,
                volume_24h: p.volume,
                best_bid: p.best_bid,
                best_ask: p.best_ask,
                event_time: millis(p.event_time, "E")?,
            })),
            Self::Depth(p) => Ok(MarketEvent::OrderBook(OrderBookDelta {
                symbol: symbol.clone(),
                first_update_id: p.first_update_id,
                final_update_id: p.final_update_id,
                bids: levels(p.bids),
                asks: levels(p.asks),
                event_time: millis(p.event_time, "E")?,
            })),
            Self::Kline(p) => {
                let k = p.kline;
                let interval = KlineInterval::parse(&k.interval)
                    .ok_or_else(|| format!("unknown kline interval {}", k.interval))?;
                Ok(MarketEvent::Kline(KlineEvent {
                    symbol: symbol.clone(),
                    interval,
                    open_time: millis(k.open_time, "k.t")?,
                    close_time: millis(k.close_time, "k.T")?,
                    open: k.open,
                    high: k.high,
                    low: k.low,
                    close: k.close,
                    volume: k.volume,
                    closed: k.closed,
                }))
            }
        }
    }
}

/// Trade stream payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TradePayload {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Native symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Trade id.
    #[serde(rename = "t")]
    pub trade_id: u64,
    /// Price.
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Quantity.
    #[serde(rename = "q")]
    pub quantity: Decimal,
    /// Trade time (ms).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Whether the buyer was the maker.
    #[serde(rename = "m")]
    pub buyer_is_maker: bool,
}

/// 24h ticker payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickerPayload {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Native symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// 24h price change percent.
    #[serde(rename = "P")]
    pub change_percent: Decimal,
    /// Last price.
    #[serde(rename = "c")]
    pub last_price: Decimal,
    /// Best bid price.
    #[serde(rename = "b", default)]
    pub best_bid: Option<Decimal>,
    /// Best ask price.
    #[serde(rename = "a", default)]
    pub best_ask: Option<Decimal>,
    /// 24h high.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// 24h low.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// 24h base volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
}

/// Order book delta payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DepthPayload {
    /// Event time (ms).
    #[serde(rename = "E")]
    pub event_time: i64,
    /// Native symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// First update id in the event.
    #[serde(rename = "U")]
    pub first_update_id: u64,
    /// Final update id in the event.
    #[serde(rename = "u")]
    pub final_update_id: u64,
    /// Bid levels as `[price, quantity]`.
    #[serde(rename = "b")]
    pub bids: Vec<(Decimal, Decimal)>,
    /// Ask levels as `[price, quantity]`.
    #[serde(rename = "a")]
    pub asks: Vec<(Decimal, Decimal)>,
}

/// Kline stream payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KlinePayload {
    /// Native symbol.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Candle body.
    #[serde(rename = "k")]
    pub kline: KlineBody,
}

/// Candle body inside a kline payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KlineBody {
    /// Open time (ms).
    #[serde(rename = "t")]
    pub open_time: i64,
    /// Close time (ms).
    #[serde(rename = "T")]
    pub close_time: i64,
    /// Interval (`1m`).
    #[serde(rename = "i")]
    pub interval: String,
    /// Open price.
    #[serde(rename = "o")]
    pub open: Decimal,
    /// Close price.
    #[serde(rename = "c")]
    pub close: Decimal,
    /// High price.
    #[serde(rename = "h")]
    pub high: Decimal,
    /// Low price.
    #[serde(rename = "l")]
    pub low: Decimal,
    /// Base volume.
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Whether the candle is closed.
    #[serde(rename = "x")]
    pub closed: bool,
}

fn millis(ms: i64, field: &str) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| format!("{field} is out of range: {ms}"))
}

fn levels(raw: Vec<(Decimal, Decimal)>) -> Vec<BookLevel> {
    raw.into_iter()
        .map(|(price, quantity)| BookLevel { price, quantity })
        .collect()
}
