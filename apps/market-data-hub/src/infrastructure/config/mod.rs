//! Configuration Module
//!
//! Configuration loading and dependency injection for the hub.

mod settings;
mod wiring;

pub use settings::{
    ApiKey, CacheSettings, ConfigError, HubConfig, LedgerSettings, ProviderSettings,
    ServerSettings, StreamSettings, TrackerSettings, default_quotas,
};
pub use wiring::build_dependencies;
