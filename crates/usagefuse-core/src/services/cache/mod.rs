//! Resilience cache
//!
//! Last-known-good metric groups per `(account_id, group_key)`. The fusion
//! engine writes a group after a source populates it and reads it back only
//! when the source fails or comes back empty.
//!
//! ```text
//!   source ok ──► put(account, group, metrics, observed_at)
//!
//!   source failed ──► get(account, group) ──► Snapshot::restore_group
//!                          │
//!                          └─ miss ──► nothing restored (not an error)
//! ```
//!
//! The cache never expires entries. Callers judge staleness from
//! `observed_at` (surfaced as `Snapshot::restored`).

mod sqlite;

pub use sqlite::SqliteCache;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::models::MetricGroup;

// ============================================================================
// Types
// ============================================================================

/// A cached metric group and when it was observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedGroup {
    pub group: MetricGroup,
    pub observed_at: DateTime<Utc>,
}

/// Store of last-known-good metric groups
///
/// Implementations must serialize `get`/`put` on the same
/// `(account_id, group_key)` while letting unrelated keys proceed.
#[async_trait]
pub trait ResilienceCache: Send + Sync {
    /// Remember `group` as the latest good value for `(account_id, group_key)`
    async fn put(
        &self,
        account_id: &str,
        group_key: &str,
        group: MetricGroup,
        observed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Latest good value for `(account_id, group_key)`, if any
    async fn get(&self, account_id: &str, group_key: &str) -> Result<Option<CachedGroup>>;
}

/// Reject blank cache keys before anything is written
pub(crate) fn check_key(account_id: &str, group_key: &str) -> Result<()> {
    if account_id.trim().is_empty() {
        return Err(Error::validation("Cache account id is empty"));
    }
    if group_key.trim().is_empty() {
        return Err(Error::validation(format!(
            "Cache group key is empty for {}",
            account_id
        )));
    }
    Ok(())
}

// ============================================================================
// MemoryCache
// ============================================================================

type Slot = Arc<Mutex<Option<CachedGroup>>>;

/// In-process cache, the default for a [`FusionEngine`](crate::services::fusion::FusionEngine)
///
/// The outer map lock is held only long enough to find or create a slot;
/// each slot has its own lock.
#[derive(Default)]
pub struct MemoryCache {
    slots: RwLock<HashMap<(String, String), Slot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of populated entries
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slot(&self, account_id: &str, group_key: &str) -> Slot {
        let key = (account_id.to_string(), group_key.to_string());
        if let Some(slot) = self.slots.read().await.get(&key) {
            return slot.clone();
        }
        self.slots.write().await.entry(key).or_default().clone()
    }
}

#[async_trait]
impl ResilienceCache for MemoryCache {
    async fn put(
        &self,
        account_id: &str,
        group_key: &str,
        group: MetricGroup,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        check_key(account_id, group_key)?;
        let slot = self.slot(account_id, group_key).await;
        let mut entry = slot.lock().await;
        log::debug!(
            "[fusion:cache] put {}/{} ({} metrics)",
            account_id,
            group_key,
            group.metrics.len()
        );
        *entry = Some(CachedGroup { group, observed_at });
        Ok(())
    }

    async fn get(&self, account_id: &str, group_key: &str) -> Result<Option<CachedGroup>> {
        let slot = {
            let slots = self.slots.read().await;
            slots
                .get(&(account_id.to_string(), group_key.to_string()))
                .cloned()
        };
        match slot {
            Some(slot) => Ok(slot.lock().await.clone()),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
