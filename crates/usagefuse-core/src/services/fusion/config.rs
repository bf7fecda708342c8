//! Fusion configuration
//!
//! - [`ProviderProfile`]: ordered sources plus the options that differ between
//!   providers, built once through [`ProviderProfile::builder`]
//! - [`AccountConfig`]: one monitored account
//! - [`FetchContext`]: deadline and cancellation for one fetch cycle

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use super::source::{Source, SourceError};
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// A quota metric with less headroom than this (in percent) is LIMITED
pub const LIMITED_REMAINING_PERCENT: f64 = 5.0;

/// A quota metric with less headroom than this (in percent) is near its limit
pub const NEAR_LIMIT_REMAINING_PERCENT: f64 = 20.0;

/// Upper bound on metrics named in a status message
pub const MAX_SUMMARY_METRICS: usize = 4;

/// Suffix marking a metric as a hard quota
pub const QUOTA_SUFFIX: &str = "_quota";

// ============================================================================
// Profile Options
// ============================================================================

/// Headroom thresholds used by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusThresholds {
    pub limited_remaining_percent: f64,
    pub near_limit_remaining_percent: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            limited_remaining_percent: LIMITED_REMAINING_PERCENT,
            near_limit_remaining_percent: NEAR_LIMIT_REMAINING_PERCENT,
        }
    }
}

impl StatusThresholds {
    fn validate(&self) -> Result<()> {
        let limited = self.limited_remaining_percent;
        let near = self.near_limit_remaining_percent;
        if !limited.is_finite() || !near.is_finite() {
            return Err(Error::config("Status thresholds must be finite"));
        }
        if !(0.0..=100.0).contains(&limited) || !(0.0..=100.0).contains(&near) {
            return Err(Error::config("Status thresholds must be within 0..=100"));
        }
        if limited > near {
            return Err(Error::config(format!(
                "Limited threshold ({}) exceeds near-limit threshold ({})",
                limited, near
            )));
        }
        Ok(())
    }
}

/// Plain-data provider options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileOptions {
    /// Metric keys to mention in status messages, most salient first
    #[serde(default)]
    pub summary_keys: Vec<String>,
    /// Keys treated as hard quotas in addition to `*_quota`
    #[serde(default)]
    pub extra_quota_keys: BTreeSet<String>,
    /// Account must carry a credential for the provider to be usable
    #[serde(default)]
    pub requires_credential: bool,
    /// Default per-source timeout
    #[serde(default)]
    pub source_timeout: Option<Duration>,
    #[serde(default)]
    pub thresholds: StatusThresholds,
    #[serde(default = "default_max_summary_metrics")]
    pub max_summary_metrics: usize,
}

fn default_max_summary_metrics() -> usize {
    MAX_SUMMARY_METRICS
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            summary_keys: Vec::new(),
            extra_quota_keys: BTreeSet::new(),
            requires_credential: false,
            source_timeout: None,
            thresholds: StatusThresholds::default(),
            max_summary_metrics: MAX_SUMMARY_METRICS,
        }
    }
}

impl ProfileOptions {
    /// Whether `key` names a hard quota metric
    pub fn is_quota_key(&self, key: &str) -> bool {
        key.ends_with(QUOTA_SUFFIX) || self.extra_quota_keys.contains(key)
    }
}

// ============================================================================
// Provider Profile
// ============================================================================

/// One configured source within a profile
#[derive(Clone)]
pub struct SourceSlot {
    pub source: Arc<dyn Source>,
    /// A required source that fails with nothing to fall back on fails the fetch
    pub required: bool,
    pub timeout: Option<Duration>,
}

impl SourceSlot {
    pub fn name(&self) -> &str {
        self.source.name()
    }
}

impl fmt::Debug for SourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSlot")
            .field("source", &self.source.name())
            .field("required", &self.required)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Everything the engine needs to know about one provider
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    provider_id: String,
    sources: Vec<SourceSlot>,
    options: ProfileOptions,
}

impl ProviderProfile {
    pub fn builder(provider_id: impl Into<String>) -> ProviderProfileBuilder {
        ProviderProfileBuilder {
            provider_id: provider_id.into(),
            sources: Vec::new(),
            options: ProfileOptions::default(),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Sources in execution (and merge) order
    pub fn sources(&self) -> &[SourceSlot] {
        &self.sources
    }

    pub fn options(&self) -> &ProfileOptions {
        &self.options
    }

    /// Effective timeout for `slot`
    pub fn timeout_for(&self, slot: &SourceSlot) -> Option<Duration> {
        slot.timeout.or(self.options.source_timeout)
    }
}

/// Builder for [`ProviderProfile`]
pub struct ProviderProfileBuilder {
    provider_id: String,
    sources: Vec<SourceSlot>,
    options: ProfileOptions,
}

impl ProviderProfileBuilder {
    /// Append an optional source; later sources override earlier ones
    pub fn source(self, source: impl Source + 'static) -> Self {
        self.push(Arc::new(source), false, None)
    }

    /// Append a source whose failure may fail the whole fetch
    pub fn required_source(self, source: impl Source + 'static) -> Self {
        self.push(Arc::new(source), true, None)
    }

    /// Append an optional source with its own timeout
    pub fn source_with_timeout(self, source: impl Source + 'static, timeout: Duration) -> Self {
        self.push(Arc::new(source), false, Some(timeout))
    }

    /// Append an already shared source
    pub fn shared_source(self, source: Arc<dyn Source>, required: bool) -> Self {
        self.push(source, required, None)
    }

    fn push(mut self, source: Arc<dyn Source>, required: bool, timeout: Option<Duration>) -> Self {
        self.sources.push(SourceSlot {
            source,
            required,
            timeout,
        });
        self
    }

    pub fn summary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.summary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn extra_quota_key(mut self, key: impl Into<String>) -> Self {
        self.options.extra_quota_keys.insert(key.into());
        self
    }

    pub fn requires_credential(mut self, required: bool) -> Self {
        self.options.requires_credential = required;
        self
    }

    /// Default timeout for sources without their own
    pub fn source_timeout(mut self, timeout: Duration) -> Self {
        self.options.source_timeout = Some(timeout);
        self
    }

    pub fn thresholds(mut self, limited_remaining: f64, near_limit_remaining: f64) -> Self {
        self.options.thresholds = StatusThresholds {
            limited_remaining_percent: limited_remaining,
            near_limit_remaining_percent: near_limit_remaining,
        };
        self
    }

    pub fn max_summary_metrics(mut self, max: usize) -> Self {
        self.options.max_summary_metrics = max;
        self
    }

    /// Replace all options at once (e.g. deserialized from a config file)
    pub fn options(mut self, options: ProfileOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty provider id, no sources, empty or
    /// duplicate source names, a zero timeout, inconsistent thresholds or a
    /// zero summary size.
    pub fn build(self) -> Result<ProviderProfile> {
        if self.provider_id.trim().is_empty() {
            return Err(Error::config("Provider id is empty"));
        }
        if self.sources.is_empty() {
            return Err(Error::config(format!(
                "Provider '{}' has no sources",
                self.provider_id
            )));
        }

        let mut seen = BTreeSet::new();
        for slot in &self.sources {
            let name = slot.name();
            if name.trim().is_empty() {
                return Err(Error::config(format!(
                    "Provider '{}' has a source with an empty name",
                    self.provider_id
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(Error::config(format!(
                    "Provider '{}' lists source '{}' twice",
                    self.provider_id, name
                )));
            }
            if slot.timeout.is_some_and(|t| t.is_zero()) {
                return Err(Error::config(format!("Source '{}' has a zero timeout", name)));
            }
        }

        if self.options.source_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("Default source timeout is zero"));
        }
        if self.options.max_summary_metrics == 0 {
            return Err(Error::config("max_summary_metrics must be at least 1"));
        }
        self.options.thresholds.validate()?;

        Ok(ProviderProfile {
            provider_id: self.provider_id,
            sources: self.sources,
            options: self.options,
        })
    }
}

// ============================================================================
// Account Config
// ============================================================================

/// One monitored account
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    /// API key or OAuth token; never serialized back out
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
    /// Endpoint override for remote sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Free-form per-account settings read by individual sources
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl AccountConfig {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            ..Default::default()
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Non-blank credential, if any
    pub fn credential(&self) -> Option<&str> {
        self.credential
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Reject configurations no fetch could succeed with
    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(Error::config("Account id is empty"));
        }
        if let Some(url) = &self.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::config(format!(
                    "Account '{}' has an invalid base URL: {}",
                    self.account_id, url
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("account_id", &self.account_id)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// Fetch Context
// ============================================================================

/// Cancels every [`FetchContext`] created alongside it
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Deadline and cancellation for one fetch cycle
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl FetchContext {
    /// No deadline, never cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// A context plus the handle that cancels it
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancel: Some(rx),
            },
            CancelHandle { tx: Arc::new(tx) },
        )
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline (zero once passed)
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Stop signal for long synchronous work that cannot be raced
    pub fn check(&self) -> std::result::Result<(), SourceError> {
        if self.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        if self.is_expired() {
            return Err(SourceError::Timeout("deadline exceeded".to_string()));
        }
        Ok(())
    }

    /// Resolves once the context is cancelled; never resolves otherwise
    pub async fn cancelled(&self) {
        let Some(rx) = &self.cancel else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // handle dropped without cancelling
                return std::future::pending().await;
            }
        }
    }

    /// Earliest of the cycle deadline and `now + per_source`
    pub fn source_deadline(&self, per_source: Option<Duration>) -> Option<Instant> {
        let local = per_source.map(|t| Instant::now() + t);
        match (self.deadline, local) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
