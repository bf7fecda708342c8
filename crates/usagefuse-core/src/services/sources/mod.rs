//! Reference sources
//!
//! Concrete [`Source`](crate::services::fusion::Source) implementations:
//!
//! - [`JsonlLogSource`]: local JSONL session logs, windowed through the
//!   aggregator
//! - [`OAuthUsageSource`]: remote OAuth usage API, cached as one `billing`
//!   group
//!
//! # Adding a New Source
//!
//! 1. Create a new module (e.g., `local_service.rs`)
//! 2. Implement the `Source` trait, writing only into the `Contribution`
//! 3. Declare the cache groups it owns in `cache_groups()`

pub mod jsonl_log;
pub mod oauth_usage;

pub use jsonl_log::JsonlLogSource;
pub use oauth_usage::{OAuthUsageSource, BILLING_GROUP};
