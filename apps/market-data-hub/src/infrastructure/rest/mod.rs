//! REST Data Providers
//!
//! Historical and spot price adapters implementing
//! [`RestProvider`](crate::application::ports::RestProvider). Each call is
//! one HTTP request; quota accounting and fallback live in the facade.
//!
//! # Error Mapping
//!
//! | Upstream | Error |
//! |---|---|
//! | HTTP 429, in-band rate limit | `QuotaExceeded` |
//! | Network, 408, 5xx | `Transport` |
//! | Other 4xx, in-band error | `UpstreamRejected` |
//! | Unexpected body | `Protocol` |

pub mod coingecko;
pub mod cryptocompare;
mod http;

pub use coingecko::{CoinGeckoConfig, CoinGeckoProvider};
pub use cryptocompare::{CryptoCompareConfig, CryptoCompareProvider};
