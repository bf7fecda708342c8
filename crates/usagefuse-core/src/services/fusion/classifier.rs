//! Status classification
//!
//! Maps a completed snapshot plus the signals collected during fusion to one
//! [`FetchStatus`] and message. Rules are evaluated in priority order, first
//! match wins:
//!
//! 1. `AuthRequired`: no live data and an auth failure, or no credential when
//!    the profile requires one
//! 2. `Limited`: no live data and a rate-limit signal, or a quota metric
//!    below the limited headroom threshold (including quotas already overrun)
//! 3. `Error`: a required source is not installed and had no cached fallback
//! 4. `Ok` with a "Near limit" message: a quota metric below the near-limit
//!    headroom threshold
//! 5. `Ok`: any data (live or restored from cache)
//! 6. `Unknown`: nothing at all

use std::collections::BTreeSet;

use super::config::ProfileOptions;
use crate::models::{format_quantity, FetchStatus, Snapshot};

/// What happened while sources ran
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionSignals {
    /// Some source contributed live data this cycle
    pub has_live_data: bool,
    /// Some cache group was restored
    pub has_restored_data: bool,
    /// Sources that reported an auth failure
    pub auth_failures: BTreeSet<String>,
    /// Sources that reported a rate limit
    pub rate_limited: BTreeSet<String>,
    /// Required sources that are not installed and had no cached fallback
    pub missing_required: BTreeSet<String>,
    /// Profile requires a credential and the account has none
    pub credential_missing: bool,
}

impl FusionSignals {
    pub fn has_data(&self) -> bool {
        self.has_live_data || self.has_restored_data
    }
}

/// Outcome of [`classify`]
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub status: FetchStatus,
    pub message: String,
}

impl Classification {
    fn new(status: FetchStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Classify a completed snapshot
pub fn classify(snapshot: &Snapshot, signals: &FusionSignals, options: &ProfileOptions) -> Classification {
    let thresholds = options.thresholds;

    // 1. auth
    if signals.credential_missing {
        return Classification::new(
            FetchStatus::AuthRequired,
            format!("No credential configured for {}", snapshot.account_id),
        );
    }
    if !signals.has_live_data && !signals.auth_failures.is_empty() {
        return Classification::new(
            FetchStatus::AuthRequired,
            format!("Authentication required ({})", join(&signals.auth_failures)),
        );
    }

    // 2. limits
    if !signals.has_live_data && !signals.rate_limited.is_empty() {
        return Classification::new(
            FetchStatus::Limited,
            format!("Rate limited ({})", join(&signals.rate_limited)),
        );
    }
    let tight = quota_headroom(snapshot, options);
    let exhausted: Vec<&(String, f64)> = tight
        .iter()
        .filter(|(_, remaining)| *remaining < thresholds.limited_remaining_percent)
        .collect();
    if !exhausted.is_empty() {
        let keys: Vec<String> = exhausted.iter().map(|(k, _)| k.clone()).collect();
        return Classification::new(
            FetchStatus::Limited,
            format!("Limited: {}", summarize(snapshot, &keys, options.max_summary_metrics)),
        );
    }

    // 3. missing required tooling
    if !signals.missing_required.is_empty() {
        return Classification::new(
            FetchStatus::Error,
            format!("Required source unavailable ({})", join(&signals.missing_required)),
        );
    }

    // 4. near limit
    let near: Vec<String> = tight
        .iter()
        .filter(|(_, remaining)| *remaining < thresholds.near_limit_remaining_percent)
        .map(|(k, _)| k.clone())
        .collect();
    if !near.is_empty() && signals.has_data() {
        return Classification::new(
            FetchStatus::Ok,
            format!("Near limit: {}", summarize(snapshot, &near, options.max_summary_metrics)),
        );
    }

    // 5. data
    if signals.has_data() && snapshot.has_metrics() {
        let keys = salient_keys(snapshot, options);
        return Classification::new(
            FetchStatus::Ok,
            summarize(snapshot, &keys, options.max_summary_metrics),
        );
    }
    if signals.has_data() {
        return Classification::new(FetchStatus::Ok, "Usage data available");
    }

    // 6. nothing
    let failed = snapshot.diagnostics.len();
    let message = if failed == 0 {
        "No usage data available".to_string()
    } else {
        format!("No usage data available ({} sources reported errors)", failed)
    };
    Classification::new(FetchStatus::Unknown, message)
}

/// `(key, remaining %)` for every quota metric with a derivable percentage,
/// tightest first
fn quota_headroom(snapshot: &Snapshot, options: &ProfileOptions) -> Vec<(String, f64)> {
    let mut out: Vec<(String, f64)> = snapshot
        .metrics
        .iter()
        .filter(|(key, _)| options.is_quota_key(key))
        .filter_map(|(key, metric)| metric.remaining_percent().map(|r| (key.clone(), r)))
        .collect();
    out.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    out
}

/// Profile priority keys present in the snapshot, else every key in order
fn salient_keys(snapshot: &Snapshot, options: &ProfileOptions) -> Vec<String> {
    let preferred: Vec<String> = options
        .summary_keys
        .iter()
        .filter(|k| snapshot.metrics.contains_key(k.as_str()))
        .cloned()
        .collect();
    if preferred.is_empty() {
        snapshot.metrics.keys().cloned().collect()
    } else {
        preferred
    }
}

fn summarize(snapshot: &Snapshot, keys: &[String], max: usize) -> String {
    let parts: Vec<String> = keys
        .iter()
        .filter_map(|key| snapshot.metric(key).map(|m| (key, m)))
        .take(max)
        .map(|(key, metric)| match metric.percent() {
            Some(p) if metric.is_percent_unit() && metric.limit.is_none() => {
                format!("{} {}% used", key, format_quantity(p.round()))
            }
            _ => format!("{} {}", key, metric.describe()),
        })
        .collect();
    parts.join(", ")
}

fn join(names: &BTreeSet<String>) -> String {
    names.iter().cloned().collect::<Vec<_>>().join(", ")
}

// ============================================================================
// Tests
// ============================================================================
