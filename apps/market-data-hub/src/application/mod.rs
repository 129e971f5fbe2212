//! Application Layer
//!
//! Port definitions and the services that orchestrate streaming, caching,
//! quota accounting and aggregation.

/// Interfaces to providers, transports, storage and time.
pub mod ports;

/// Multiplexer, ledger, cache, trackers, facade and registry.
pub mod services;
