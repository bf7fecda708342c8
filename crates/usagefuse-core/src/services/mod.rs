//! Services - fusion engine, resilience cache, window aggregation and the
//! reference sources

pub mod cache;
pub mod fusion;
pub mod sources;
pub mod windows;

pub use cache::{CachedGroup, MemoryCache, ResilienceCache, SqliteCache};
pub use fusion::{
    AccountConfig, CancelHandle, FetchContext, FetchRequest, FusionEngine, ProviderProfile,
    Source, SourceError,
};
pub use sources::{JsonlLogSource, OAuthUsageSource};
pub use windows::{BlockWindow, Measure, UsageEvent, Window, WindowAggregator, WindowSummary};
