//! Source fusion
//!
//! Turns an ordered list of independent, unreliable sources into one
//! classified snapshot per account.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ FusionEngine::fetch(profile, account, ctx)              │
//! │   for each source, in declared order:                   │
//! │     fetch() ──► Contribution (staged)                   │
//! │       ok   ──► cache.put(populated groups), merge       │
//! │       err  ──► diagnostics[source], auth/limit signals  │
//! │     declared groups not populated ──► cache.get/restore │
//! └─────────────────────────────────────────────────────────┘
//!          │
//!          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │ Snapshot::finalize                                      │
//! │   - close daily series (sort, last write wins)          │
//! │   - classify() ──► status + message, set once           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::time::Duration;
//! use usagefuse_core::services::fusion::{AccountConfig, FetchContext, FusionEngine, ProviderProfile};
//! use usagefuse_core::services::sources::{JsonlLogSource, OAuthUsageSource};
//!
//! let profile = ProviderProfile::builder("claude")
//!     .source(JsonlLogSource::new(logs_dir))
//!     .source(OAuthUsageSource::new())
//!     .summary_keys(["five_hour_quota", "seven_day_quota", "plan_spend"])
//!     .source_timeout(Duration::from_secs(10))
//!     .build()?;
//!
//! let engine = FusionEngine::in_memory();
//! let snapshot = engine
//!     .fetch(&profile, &AccountConfig::new("default"), &FetchContext::new())
//!     .await?;
//! ```

pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod source;

pub use classifier::{classify, Classification, FusionSignals};
pub use config::{
    AccountConfig, CancelHandle, FetchContext, ProfileOptions, ProviderProfile,
    ProviderProfileBuilder, SourceSlot, StatusThresholds, LIMITED_REMAINING_PERCENT,
    MAX_SUMMARY_METRICS, NEAR_LIMIT_REMAINING_PERCENT, QUOTA_SUFFIX,
};
pub use coordinator::{cache_scope, FetchRequest, FusionEngine, CACHE_DIAGNOSTIC_KEY};
pub use source::{Source, SourceError};
