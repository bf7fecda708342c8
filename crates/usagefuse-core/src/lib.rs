//! # usagefuse-core
//!
//! Usage snapshot fusion for metered AI services.
//!
//! This crate provides:
//! - The metric and snapshot model (`models` module)
//! - The fusion engine, resilience cache and status classifier (`services` module)
//! - Time-window aggregation of raw usage events (`services::windows`)
//! - SQLite persistence for the resilience cache (`db` module)
//! - Unified error handling (`error` module)

pub mod db;
pub mod error;
pub mod models;
pub mod services;

// Re-exports for convenience
pub use db::Database;
pub use error::{Error, Result};

pub use models::{
    Contribution, FetchStatus, Metric, MetricGroup, MetricInput, ModelUsageRecord, Snapshot,
    TimePoint,
};

pub use services::{
    AccountConfig, BlockWindow, CachedGroup, CancelHandle, FetchContext, FetchRequest,
    FusionEngine, JsonlLogSource, MemoryCache, OAuthUsageSource, ProviderProfile,
    ResilienceCache, Source, SourceError, SqliteCache, UsageEvent, WindowAggregator,
    WindowSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}
