//! Canonical Symbols and Providers
//!
//! Every public entry point of the hub speaks one symbol form, `BASE-QUOTE`
//! in upper case (`BTC-USDT`, `ETH-USD`). Provider adapters translate this
//! into their native spelling and fail with an unsupported-symbol error when
//! no exact mapping exists.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length of a single asset code.
const MAX_ASSET_LEN: usize = 12;

// =============================================================================
// Provider
// =============================================================================

/// Upstream market data provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Binance spot exchange (WebSocket streams).
    Binance,
    /// `CoinGecko` aggregated REST API.
    CoinGecko,
    /// `CryptoCompare` aggregated REST API.
    CryptoCompare,
}

impl Provider {
    /// All known providers.
    pub const ALL: [Self; 3] = [Self::Binance, Self::CoinGecko, Self::CryptoCompare];

    /// Stable lowercase identifier, used in ledger keys and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::CoinGecko => "coingecko",
            Self::CryptoCompare => "cryptocompare",
        }
    }

    /// Parse a provider identifier, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Some(Self::Binance),
            "coingecko" => Some(Self::CoinGecko),
            "cryptocompare" => Some(Self::CryptoCompare),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Symbol
// =============================================================================

/// Error produced when a string is not a valid canonical symbol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// The input has no `BASE-QUOTE` separator.
    #[error("invalid symbol '{0}': expected BASE-QUOTE, e.g. BTC-USDT")]
    MissingSeparator(String),

    /// One side of the pair is empty, too long, or not alphanumeric.
    #[error("invalid symbol '{0}': asset codes must be 1-12 alphanumeric characters")]
    InvalidAsset(String),
}

/// Canonical trading pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Create a symbol from its two asset codes.
    ///
    /// # Errors
    ///
    /// Returns `SymbolError::InvalidAsset` if either code is empty, longer
    /// than twelve characters, or contains non-alphanumeric characters.
    pub fn new(base: &str, quote: &str) -> Result<Self, SymbolError> {
        let base = base.trim().to_uppercase();
        let quote = quote.trim().to_uppercase();
        if !is_valid_asset(&base) || !is_valid_asset(&quote) {
            return Err(SymbolError::InvalidAsset(format!("{base}-{quote}")));
        }
        Ok(Self { base, quote })
    }

    /// Parse `BASE-QUOTE` (a `/` separator is also accepted).
    ///
    /// # Errors
    ///
    /// Returns `SymbolError` if the input is not a well-formed pair.
    pub fn parse(s: &str) -> Result<Self, SymbolError> {
        let (base, quote) = s
            .split_once('-')
            .or_else(|| s.split_once('/'))
            .ok_or_else(|| SymbolError::MissingSeparator(s.to_string()))?;
        Self::new(base, quote)
    }

    /// Base asset code (`BTC` in `BTC-USDT`).
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Quote asset code (`USDT` in `BTC-USDT`).
    #[must_use]
    pub fn quote(&self) -> &str {
        &self.quote
    }
}

fn is_valid_asset(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= MAX_ASSET_LEN
        && code.chars().all(|c| c.is_ascii_alphanumeric())
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

impl FromStr for Symbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = SymbolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.to_string()
    }
}
