//! SQLite-backed resilience cache
//!
//! One row per `(account_id, group_key)`; the metric group is stored as JSON
//! and `observed_at` as RFC3339.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Mutex;

use super::{check_key, CachedGroup, ResilienceCache};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::MetricGroup;

/// Database row for one cached group
#[derive(Debug, Clone, FromRow)]
struct StoredGroup {
    payload: String,
    observed_at: String,
}

impl StoredGroup {
    fn into_cached(self) -> Result<CachedGroup> {
        let group: MetricGroup = serde_json::from_str(&self.payload)?;
        let observed_at = DateTime::parse_from_rfc3339(&self.observed_at)
            .map_err(|e| {
                Error::internal(format!(
                    "Invalid observed_at '{}' in resilience cache: {}",
                    self.observed_at, e
                ))
            })?
            .with_timezone(&Utc);
        Ok(CachedGroup { group, observed_at })
    }
}

/// Persistent [`ResilienceCache`]
pub struct SqliteCache {
    pool: SqlitePool,
    /// Per-key locks so a read never interleaves with a write to the same row
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl SqliteCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Cache on an already-migrated [`Database`]
    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool.clone())
    }

    /// Remove every cached group for `account_id`
    pub async fn clear_account(&self, account_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM resilience_cache WHERE account_id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        log::info!(
            "[fusion:cache] Cleared {} cached groups for {}",
            result.rows_affected(),
            account_id
        );
        Ok(result.rows_affected())
    }

    async fn key_lock(&self, account_id: &str, group_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry((account_id.to_string(), group_key.to_string()))
            .or_default()
            .clone()
    }
}

#[async_trait]
impl ResilienceCache for SqliteCache {
    async fn put(
        &self,
        account_id: &str,
        group_key: &str,
        group: MetricGroup,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        check_key(account_id, group_key)?;
        let payload = serde_json::to_string(&group)?;
        let lock = self.key_lock(account_id, group_key).await;
        let _guard = lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO resilience_cache (account_id, group_key, payload, observed_at, updated_at)
            VALUES (?, ?, ?, ?, datetime('now'))
            ON CONFLICT(account_id, group_key) DO UPDATE SET
                payload = excluded.payload,
                observed_at = excluded.observed_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(account_id)
        .bind(group_key)
        .bind(&payload)
        .bind(observed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        log::debug!("[fusion:cache] Stored {}/{} in sqlite", account_id, group_key);
        Ok(())
    }

    async fn get(&self, account_id: &str, group_key: &str) -> Result<Option<CachedGroup>> {
        let lock = self.key_lock(account_id, group_key).await;
        let _guard = lock.lock().await;

        let row = sqlx::query_as::<_, StoredGroup>(
            "SELECT payload, observed_at FROM resilience_cache WHERE account_id = ? AND group_key = ?",
        )
        .bind(account_id)
        .bind(group_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredGroup::into_cached).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metric;

    #[test]
    fn test_stored_group_parse() {
        let stored = StoredGroup {
            payload: r#"{"metrics":{"plan_spend":{"limit":20.0,"remaining":16.0,"used":4.0,"unit":"USD","window":"current"}},"resets":{}}"#.to_string(),
            observed_at: "2026-03-01T10:00:00Z".to_string(),
        };
        let cached = stored.into_cached().unwrap();
        assert_eq!(
            cached.group.metrics["plan_spend"],
            Metric::with_limit(4.0, 20.0, "USD", "current")
        );
        assert_eq!(cached.observed_at.to_rfc3339(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_stored_group_bad_timestamp() {
        let stored = StoredGroup {
            payload: r#"{"metrics":{}}"#.to_string(),
            observed_at: "yesterday".to_string(),
        };
        assert!(matches!(stored.into_cached(), Err(Error::Internal(_))));
    }
}
