//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Binance stream protocol adapter.
pub mod binance;

/// Configuration and dependency injection.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Durable rate-limit ledger storage.
pub mod persistence;

/// REST price providers (CoinGecko, CryptoCompare).
pub mod rest;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// WebSocket transports (tungstenite and in-memory).
pub mod websocket;
