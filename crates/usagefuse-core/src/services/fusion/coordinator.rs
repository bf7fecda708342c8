//! Fusion engine
//!
//! Runs a profile's sources in order for one account, merges their staged
//! contributions, fills gaps from the resilience cache and classifies the
//! result.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::classifier::{classify, FusionSignals};
use super::config::{AccountConfig, FetchContext, ProviderProfile, SourceSlot};
use super::source::SourceError;
use crate::error::{Error, Result};
use crate::models::{Contribution, Snapshot};
use crate::services::cache::{MemoryCache, ResilienceCache};

/// Diagnostics key for cache write failures
pub const CACHE_DIAGNOSTIC_KEY: &str = "resilience_cache";

/// Cache/lock scope for one account of one provider
pub fn cache_scope(provider_id: &str, account_id: &str) -> String {
    format!("{}:{}", provider_id, account_id)
}

/// One account to fetch in [`FusionEngine::fetch_all`]
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub profile: Arc<ProviderProfile>,
    pub account: AccountConfig,
}

impl FetchRequest {
    pub fn new(profile: Arc<ProviderProfile>, account: AccountConfig) -> Self {
        Self { profile, account }
    }
}

/// Result of running one source
struct SourceRun {
    outcome: std::result::Result<bool, SourceError>,
    staged: Contribution,
}

/// Fuses sources into snapshots
///
/// One engine (and its cache) is meant to live for the whole process.
/// Fetches for different accounts run independently; fetches for the same
/// account wait for each other.
pub struct FusionEngine {
    cache: Arc<dyn ResilienceCache>,
    account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FusionEngine {
    pub fn new(cache: Arc<dyn ResilienceCache>) -> Self {
        Self {
            cache,
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Engine backed by a fresh [`MemoryCache`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    pub fn cache(&self) -> &Arc<dyn ResilienceCache> {
        &self.cache
    }

    /// Run one fetch cycle for `account`
    ///
    /// # Errors
    ///
    /// - `Error::Config` if the account configuration is invalid
    /// - `Error::RequiredSource` if a required source failed with no cached
    ///   fallback and no other source produced data
    ///
    /// Every other failure is reported inside the returned snapshot.
    pub async fn fetch(
        &self,
        profile: &ProviderProfile,
        account: &AccountConfig,
        ctx: &FetchContext,
    ) -> Result<Snapshot> {
        account.validate()?;

        let scope = cache_scope(profile.provider_id(), &account.account_id);
        let lock = self.account_lock(&scope).await;
        let _guard = lock.lock().await;

        log::info!(
            "[fusion] Fetching {} ({} sources)",
            scope,
            profile.sources().len()
        );

        let options = profile.options();
        let mut snapshot = Snapshot::new(profile.provider_id(), &account.account_id);
        let mut signals = FusionSignals {
            credential_missing: options.requires_credential && account.credential().is_none(),
            ..Default::default()
        };
        let mut required_failure: Option<(String, SourceError)> = None;

        for slot in profile.sources() {
            let name = slot.name().to_string();

            let run = if ctx.is_cancelled() {
                SourceRun {
                    outcome: Err(SourceError::Cancelled),
                    staged: Contribution::new(),
                }
            } else {
                run_source(slot, profile, ctx, account, &snapshot).await
            };

            let (populated, failure) = match run.outcome {
                Ok(contributed) => {
                    log::debug!(
                        "[fusion] {} -> {} (contributed: {})",
                        name,
                        scope,
                        contributed
                    );
                    signals.has_live_data |= contributed;
                    let populated = run.staged.populated_groups();
                    self.store_groups(&scope, &run.staged, &populated, snapshot.timestamp, &mut snapshot)
                        .await;
                    snapshot.merge(run.staged);
                    (populated, None)
                }
                Err(err) => {
                    log::warn!("[fusion] Source {} failed for {}: {}", name, scope, err);
                    snapshot.add_diagnostic(&name, err.to_string());
                    if err.is_auth_failure() {
                        signals.auth_failures.insert(name.clone());
                    }
                    if err.is_rate_limited() {
                        signals.rate_limited.insert(name.clone());
                    }
                    (BTreeSet::new(), Some(err))
                }
            };

            let restored = self
                .restore_groups(&scope, slot, &populated, failure.is_some(), &mut snapshot)
                .await;
            signals.has_restored_data |= restored;

            if let Some(err) = failure {
                if slot.required && !restored {
                    if err.is_missing_tooling() {
                        signals.missing_required.insert(name);
                    } else if !err.is_signal() && required_failure.is_none() {
                        required_failure = Some((name, err));
                    }
                }
            }
        }

        if let Some((name, err)) = required_failure {
            if !signals.has_data() {
                log::error!(
                    "[fusion] Required source {} failed for {} with no fallback: {}",
                    name,
                    scope,
                    err
                );
                return Err(Error::required_source(name, err.to_string()));
            }
        }

        let classification = classify(&snapshot, &signals, options);
        log::info!(
            "[fusion] {} -> {} ({})",
            scope,
            classification.status,
            classification.message
        );
        snapshot.finalize(classification.status, classification.message);

        Ok(snapshot)
    }

    /// Fetch several accounts concurrently
    ///
    /// Results come back in request order.
    pub async fn fetch_all(&self, requests: &[FetchRequest], ctx: &FetchContext) -> Vec<Result<Snapshot>> {
        let fetches = requests
            .iter()
            .map(|request| self.fetch(&request.profile, &request.account, ctx));
        futures::future::join_all(fetches).await
    }

    async fn account_lock(&self, scope: &str) -> Arc<Mutex<()>> {
        self.account_locks
            .lock()
            .await
            .entry(scope.to_string())
            .or_default()
            .clone()
    }

    async fn store_groups(
        &self,
        scope: &str,
        staged: &Contribution,
        populated: &BTreeSet<String>,
        observed_at: DateTime<Utc>,
        snapshot: &mut Snapshot,
    ) {
        for group_key in populated {
            let group = staged.group(group_key);
            if let Err(e) = self.cache.put(scope, group_key, group, observed_at).await {
                log::warn!(
                    "[fusion:cache] Failed to store {}/{}: {}",
                    scope,
                    group_key,
                    e
                );
                snapshot.add_diagnostic(
                    CACHE_DIAGNOSTIC_KEY,
                    format!("failed to store {}: {}", group_key, e),
                );
            }
        }
    }

    /// Restore declared groups the source did not populate; returns whether
    /// anything was restored
    async fn restore_groups(
        &self,
        scope: &str,
        slot: &SourceSlot,
        populated: &BTreeSet<String>,
        failed: bool,
        snapshot: &mut Snapshot,
    ) -> bool {
        let mut restored = false;

        for group_key in slot.source.cache_groups() {
            if populated.contains(&group_key) {
                continue;
            }
            match self.cache.get(scope, &group_key).await {
                Ok(Some(hit)) => {
                    log::debug!(
                        "[fusion:cache] Restored {}/{} observed at {}",
                        scope,
                        group_key,
                        hit.observed_at
                    );
                    snapshot.restore_group(&group_key, &hit.group, hit.observed_at);
                    if failed {
                        snapshot.add_diagnostic(
                            slot.name(),
                            format!(
                                "restored {} from cache (observed {})",
                                group_key,
                                hit.observed_at.to_rfc3339()
                            ),
                        );
                    }
                    restored = true;
                }
                Ok(None) => {
                    log::debug!("[fusion:cache] No cached {}/{}", scope, group_key);
                }
                Err(e) => {
                    log::warn!(
                        "[fusion:cache] Failed to read {}/{}: {}",
                        scope,
                        group_key,
                        e
                    );
                }
            }
        }

        restored
    }
}

async fn run_source(
    slot: &SourceSlot,
    profile: &ProviderProfile,
    ctx: &FetchContext,
    account: &AccountConfig,
    current: &Snapshot,
) -> SourceRun {
    let mut staged = Contribution::new();
    let deadline = ctx.source_deadline(profile.timeout_for(slot));

    // sources see their own deadline so blocking work can poll it
    let source_ctx = match deadline {
        Some(at) => ctx.clone().with_deadline(at),
        None => ctx.clone(),
    };

    let outcome = {
        let call = slot.source.fetch(&source_ctx, account, current, &mut staged);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(SourceError::Cancelled),
            res = bounded(deadline, call) => res,
        }
    };

    SourceRun { outcome, staged }
}

async fn bounded<F>(deadline: Option<Instant>, fut: F) -> std::result::Result<bool, SourceError>
where
    F: Future<Output = std::result::Result<bool, SourceError>>,
{
    match deadline {
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(res) => res,
            Err(_) => Err(SourceError::Timeout("deadline exceeded".to_string())),
        },
        None => fut.await,
    }
}

// ============================================================================
// Tests
// ============================================================================
