//! Integration tests for multi-source fusion, cache restore and status priority

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use usagefuse_core::db::Database;
use usagefuse_core::models::{Contribution, FetchStatus, Metric, Snapshot};
use usagefuse_core::services::cache::{MemoryCache, ResilienceCache, SqliteCache};
use usagefuse_core::services::fusion::{
    AccountConfig, FetchContext, FetchRequest, FusionEngine, ProviderProfile, Source, SourceError,
};

// ============================================================================
// Test Sources
// ============================================================================

/// Local source that always reports 12 messages today
struct LocalMessages;

#[async_trait]
impl Source for LocalMessages {
    fn name(&self) -> &str {
        "A"
    }

    async fn fetch(
        &self,
        _ctx: &FetchContext,
        _account: &AccountConfig,
        _current: &Snapshot,
        out: &mut Contribution,
    ) -> Result<bool, SourceError> {
        out.set_metric("messages_today", Metric::count(12.0, "messages", "today"));
        out.append_daily_point(
            "messages",
            chrono::NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            12.0,
        );
        Ok(true)
    }
}

/// Remote billing source that fails on even-numbered calls
struct FlakyBilling {
    calls: Arc<AtomicUsize>,
    error: SourceError,
}

impl FlakyBilling {
    fn new(error: SourceError) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
                error,
            },
            calls,
        )
    }
}

#[async_trait]
impl Source for FlakyBilling {
    fn name(&self) -> &str {
        "B"
    }

    fn cache_groups(&self) -> Vec<String> {
        vec!["billing".to_string()]
    }

    async fn fetch(
        &self,
        _ctx: &FetchContext,
        _account: &AccountConfig,
        _current: &Snapshot,
        out: &mut Contribution,
    ) -> Result<bool, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % 2 == 0 {
            return Err(self.error.clone());
        }
        out.set_grouped_metric(
            "billing",
            "plan_spend",
            Metric::with_limit(4.0, 20.0, "USD", "current"),
        );
        Ok(true)
    }
}

/// Source that always fails with the given error
struct Failing {
    name: &'static str,
    error: SourceError,
}

#[async_trait]
impl Source for Failing {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch(
        &self,
        _ctx: &FetchContext,
        _account: &AccountConfig,
        _current: &Snapshot,
        out: &mut Contribution,
    ) -> Result<bool, SourceError> {
        // staged writes of a failed source must never surface
        out.set_metric("messages_today", Metric::count(999.0, "messages", "today"));
        Err(self.error.clone())
    }
}

/// Source that records how many fetches overlap
struct Tracking {
    in_flight: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
}

#[async_trait]
impl Source for Tracking {
    fn name(&self) -> &str {
        "tracking"
    }

    async fn fetch(
        &self,
        _ctx: &FetchContext,
        _account: &AccountConfig,
        _current: &Snapshot,
        out: &mut Contribution,
    ) -> Result<bool, SourceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out.set_metric("calls", Metric::count(1.0, "calls", "current"));
        Ok(true)
    }
}

fn two_source_profile(error: SourceError) -> (ProviderProfile, Arc<AtomicUsize>) {
    let (billing, calls) = FlakyBilling::new(error);
    let profile = ProviderProfile::builder("claude")
        .source(LocalMessages)
        .source(billing)
        .summary_keys(["plan_spend", "messages_today"])
        .build()
        .unwrap();
    (profile, calls)
}

// ============================================================================
// Scenario
// ============================================================================

#[tokio::test]
async fn test_remote_failure_is_masked_by_cache() {
    let (profile, calls) =
        two_source_profile(SourceError::NetworkError("connection reset".to_string()));
    let engine = FusionEngine::in_memory();
    let account = AccountConfig::new("default");
    let ctx = FetchContext::new();

    // cycle 1: both sources succeed
    let first = engine.fetch(&profile, &account, &ctx).await.unwrap();
    assert_eq!(first.status(), Some(FetchStatus::Ok));
    assert_eq!(first.metric("messages_today").unwrap().used, Some(12.0));
    assert_eq!(
        first.metric("plan_spend"),
        Some(&Metric::with_limit(4.0, 20.0, "USD", "current"))
    );
    assert!(first.diagnostics.is_empty());
    assert!(first.restored.is_empty());

    // cycle 2: B fails, plan_spend comes back from the cache
    let second = engine.fetch(&profile, &account, &ctx).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(second.status(), Some(FetchStatus::Ok));
    assert_eq!(second.metric("messages_today").unwrap().used, Some(12.0));

    let spend = second.metric("plan_spend").unwrap();
    assert_eq!(spend.used, Some(4.0));
    assert_eq!(spend.limit, Some(20.0));
    assert_eq!(spend, first.metric("plan_spend").unwrap());

    assert!(!second.diagnostics["B"].is_empty());
    assert!(second.diagnostics["B"].contains("connection reset"));
    assert_eq!(second.restored.get("billing"), Some(&first.timestamp));
}

#[tokio::test]
async fn test_cache_miss_is_silent() {
    // B fails on its very first call by consuming call 1 beforehand
    let (profile, calls) = two_source_profile(SourceError::Timeout("slow".to_string()));
    calls.store(1, Ordering::SeqCst);

    let snap = FusionEngine::in_memory()
        .fetch(&profile, &AccountConfig::new("default"), &FetchContext::new())
        .await
        .unwrap();

    assert!(snap.metric("plan_spend").is_none());
    assert!(snap.restored.is_empty());
    assert_eq!(snap.status(), Some(FetchStatus::Ok));
    assert!(snap.diagnostics["B"].contains("slow"));
}

// ============================================================================
// Fusion Properties
// ============================================================================

#[tokio::test]
async fn test_merge_order_determinism() {
    let run = || async {
        let (profile, _) = two_source_profile(SourceError::Other("x".to_string()));
        let snap = FusionEngine::in_memory()
            .fetch(&profile, &AccountConfig::new("default"), &FetchContext::new())
            .await
            .unwrap();
        let mut value = serde_json::to_value(&snap).unwrap();
        value.as_object_mut().unwrap().remove("timestamp");
        serde_json::to_string(&value).unwrap()
    };

    let first = run().await;
    for _ in 0..5 {
        assert_eq!(run().await, first);
    }
}

#[tokio::test]
async fn test_failed_source_does_not_touch_other_metrics() {
    let profile = ProviderProfile::builder("claude")
        .source(LocalMessages)
        .source(Failing {
            name: "remote",
            error: SourceError::ParseError("unexpected EOF".to_string()),
        })
        .build()
        .unwrap();

    let snap = FusionEngine::in_memory()
        .fetch(&profile, &AccountConfig::new("default"), &FetchContext::new())
        .await
        .unwrap();

    assert_eq!(snap.metric("messages_today").unwrap().used, Some(12.0));
    assert_eq!(snap.daily_series["messages"].len(), 1);
    assert!(snap.diagnostics.contains_key("remote"));
    assert_eq!(snap.status(), Some(FetchStatus::Ok));
}

#[tokio::test]
async fn test_rate_limit_without_data_is_limited() {
    let profile = ProviderProfile::builder("claude")
        .source(Failing {
            name: "local",
            error: SourceError::NotInstalled("no logs".to_string()),
        })
        .source(Failing {
            name: "remote",
            error: SourceError::RateLimited("HTTP 429".to_string()),
        })
        .build()
        .unwrap();

    let snap = FusionEngine::in_memory()
        .fetch(&profile, &AccountConfig::new("default"), &FetchContext::new())
        .await
        .unwrap();

    assert_eq!(snap.status(), Some(FetchStatus::Limited));
    assert!(!snap.has_metrics());
}

#[tokio::test]
async fn test_auth_failure_next_to_data_is_only_a_diagnostic() {
    let profile = ProviderProfile::builder("claude")
        .source(LocalMessages)
        .source(Failing {
            name: "remote",
            error: SourceError::Unauthorized("HTTP 401".to_string()),
        })
        .build()
        .unwrap();

    let snap = FusionEngine::in_memory()
        .fetch(&profile, &AccountConfig::new("default"), &FetchContext::new())
        .await
        .unwrap();

    assert_eq!(snap.status(), Some(FetchStatus::Ok));
    assert!(snap.diagnostics["remote"].contains("401"));
}

#[tokio::test]
async fn test_auth_failure_alone_requires_auth() {
    let profile = ProviderProfile::builder("claude")
        .source(Failing {
            name: "remote",
            error: SourceError::TokenExpired,
        })
        .build()
        .unwrap();

    let snap = FusionEngine::in_memory()
        .fetch(&profile, &AccountConfig::new("default"), &FetchContext::new())
        .await
        .unwrap();

    assert_eq!(snap.status(), Some(FetchStatus::AuthRequired));
}

#[tokio::test]
async fn test_nothing_configured_is_unknown() {
    let profile = ProviderProfile::builder("claude")
        .source(Failing {
            name: "local",
            error: SourceError::NotInstalled("no logs".to_string()),
        })
        .build()
        .unwrap();

    let snap = FusionEngine::in_memory()
        .fetch(&profile, &AccountConfig::new("default"), &FetchContext::new())
        .await
        .unwrap();

    assert_eq!(snap.status(), Some(FetchStatus::Unknown));
}

// ============================================================================
// Concurrency
// ============================================================================

async fn max_overlap(accounts: &[&str]) -> usize {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let profile = Arc::new(
        ProviderProfile::builder("claude")
            .source(Tracking {
                in_flight: in_flight.clone(),
                max_seen: max_seen.clone(),
            })
            .build()
            .unwrap(),
    );
    let requests: Vec<FetchRequest> = accounts
        .iter()
        .map(|id| FetchRequest::new(profile.clone(), AccountConfig::new(*id)))
        .collect();

    let results = FusionEngine::in_memory()
        .fetch_all(&requests, &FetchContext::new())
        .await;
    assert!(results.iter().all(|r| r.is_ok()));

    max_seen.load(Ordering::SeqCst)
}

#[tokio::test]
async fn test_same_account_fetches_serialize() {
    assert_eq!(max_overlap(&["default", "default", "default"]).await, 1);
}

#[tokio::test]
async fn test_different_accounts_run_concurrently() {
    assert!(max_overlap(&["a", "b", "c"]).await > 1);
}

// ============================================================================
// Persistent Cache
// ============================================================================

async fn sqlite_engine(dir: &TempDir) -> FusionEngine {
    let db = Database::open(dir.path().join("cache.db"))
        .await
        .expect("Failed to open cache database");
    FusionEngine::new(Arc::new(SqliteCache::from_database(&db)))
}

#[tokio::test]
async fn test_sqlite_cache_survives_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (profile, calls) = two_source_profile(SourceError::NetworkError("offline".to_string()));
    let account = AccountConfig::new("default");

    let first = sqlite_engine(&dir)
        .await
        .fetch(&profile, &account, &FetchContext::new())
        .await
        .unwrap();
    assert!(first.metric("plan_spend").is_some());

    // new engine and pool on the same file: B fails, value comes from disk
    let second = sqlite_engine(&dir)
        .await
        .fetch(&profile, &account, &FetchContext::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(second.metric("plan_spend"), first.metric("plan_spend"));
    assert!(second.restored.contains_key("billing"));
}

#[tokio::test]
async fn test_sqlite_cache_put_get_and_clear() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(dir.path().join("cache.db")).await.unwrap();
    let cache = SqliteCache::from_database(&db);

    let mut group = usagefuse_core::models::MetricGroup::default();
    group
        .metrics
        .insert("plan_spend".to_string(), Metric::with_limit(4.0, 20.0, "USD", "current"));
    let observed = chrono::DateTime::parse_from_rfc3339("2026-03-10T09:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);

    assert!(cache.get("claude:a", "billing").await.unwrap().is_none());
    cache.put("claude:a", "billing", group.clone(), observed).await.unwrap();
    cache.put("claude:a", "billing", group.clone(), observed).await.unwrap();

    let hit = cache.get("claude:a", "billing").await.unwrap().unwrap();
    assert_eq!(hit.group, group);
    assert_eq!(hit.observed_at, observed);

    assert_eq!(cache.clear_account("claude:a").await.unwrap(), 1);
    assert!(cache.get("claude:a", "billing").await.unwrap().is_none());

    let err = cache.put("claude:a", "", group, observed).await.unwrap_err();
    assert!(matches!(err, usagefuse_core::Error::Validation(_)));
}

#[tokio::test]
async fn test_memory_cache_is_shared_across_cycles() {
    let cache = Arc::new(MemoryCache::new());
    let engine = FusionEngine::new(cache.clone());
    let (profile, _) = two_source_profile(SourceError::Other("down".to_string()));

    engine
        .fetch(&profile, &AccountConfig::new("default"), &FetchContext::new())
        .await
        .unwrap();

    let hit = cache.get("claude:default", "billing").await.unwrap();
    assert!(hit.is_some());
}
