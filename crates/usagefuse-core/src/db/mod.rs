//! Database module - SQLx with SQLite
//!
//! Backs the persistent resilience cache so last-known-good metric groups
//! survive a process restart.

use crate::error::{Error, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::PathBuf;

/// Environment variable overriding the default database location
pub const DB_PATH_ENV: &str = "USAGEFUSE_DB_PATH";

/// Database state
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Open the database at the default path
    pub async fn new() -> Result<Self> {
        let db_path = get_db_path()?;
        Self::open(db_path).await
    }

    /// Open (creating if needed) the database at `db_path`
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        log::info!("[db] Connecting to database: {}", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        log::debug!("[db] Running database migrations...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resilience_cache (
                account_id TEXT NOT NULL,
                group_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (account_id, group_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_resilience_cache_account ON resilience_cache(account_id)",
        )
        .execute(&self.pool)
        .await?;

        log::debug!("[db] Migrations complete");
        Ok(())
    }
}

/// Default database path (`$USAGEFUSE_DB_PATH`, else the user data directory)
pub fn get_db_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }

    let data_dir = dirs::data_dir()
        .ok_or_else(|| Error::config("Could not determine user data directory"))?;

    Ok(data_dir.join("usagefuse").join("cache.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // env var tests must not run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_get_db_path_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let test_path = "/tmp/test_usagefuse.db";
        std::env::set_var(DB_PATH_ENV, test_path);
        let path = get_db_path().unwrap();
        assert_eq!(path.to_string_lossy(), test_path);
        std::env::remove_var(DB_PATH_ENV);
    }

    #[tokio::test]
    async fn test_open_creates_parent_and_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");

        let db = Database::open(path.clone()).await.unwrap();
        assert!(path.exists());

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM resilience_cache")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        Database::open(path.clone()).await.unwrap();
        Database::open(path).await.unwrap();
    }
}
