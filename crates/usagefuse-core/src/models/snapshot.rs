//! Snapshot types
//!
//! The [`Snapshot`] is the unit of output: one fused, time-stamped usage record
//! for a `(provider_id, account_id)` pair. It is created empty at the start of
//! a fetch cycle, filled source by source, finalized once and then handed out.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::contribution::Contribution;
use super::metric::Metric;

// ============================================================================
// Attribute Keys
// ============================================================================

/// Raw keys that are also parsed into [`Attributes`]
pub mod attr {
    pub const BLOCK_START: &str = "block_start";
    pub const BLOCK_END: &str = "block_end";
    pub const CLOUD_DISABLED: &str = "cloud_disabled";
    pub const PLAN: &str = "plan";
    pub const EMAIL: &str = "email";
}

// ============================================================================
// Status
// ============================================================================

/// Coarse health state of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    AuthRequired,
    Limited,
    Error,
    Unknown,
}

impl std::fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStatus::Ok => write!(f, "ok"),
            FetchStatus::AuthRequired => write!(f, "auth_required"),
            FetchStatus::Limited => write!(f, "limited"),
            FetchStatus::Error => write!(f, "error"),
            FetchStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for FetchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ok" => Ok(FetchStatus::Ok),
            "auth_required" | "auth" => Ok(FetchStatus::AuthRequired),
            "limited" | "rate_limited" => Ok(FetchStatus::Limited),
            "error" => Ok(FetchStatus::Error),
            "unknown" => Ok(FetchStatus::Unknown),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

// ============================================================================
// Series & Model Usage
// ============================================================================

/// One point of a per-day series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub date: NaiveDate,
    pub value: f64,
}

impl TimePoint {
    pub fn new(date: NaiveDate, value: f64) -> Self {
        Self { date, value }
    }
}

/// Per-(model, source, window) usage breakdown
///
/// Records are never deduplicated: the same model and window reported by two
/// sources are two records with different provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUsageRecord {
    pub raw_model_id: String,
    pub raw_source: String,
    pub window: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<f64>,
    /// Provenance tags such as `provider` or `estimation`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
}

impl ModelUsageRecord {
    pub fn new(
        raw_model_id: impl Into<String>,
        raw_source: impl Into<String>,
        window: impl Into<String>,
    ) -> Self {
        Self {
            raw_model_id: raw_model_id.into(),
            raw_source: raw_source.into(),
            window: window.into(),
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
            requests: None,
            dimensions: BTreeMap::new(),
        }
    }

    pub fn with_tokens(mut self, input: f64, output: f64) -> Self {
        self.input_tokens = Some(input);
        self.output_tokens = Some(output);
        self.total_tokens = Some(input + output);
        self
    }

    pub fn with_total_tokens(mut self, total: f64) -> Self {
        self.total_tokens = Some(total);
        self
    }

    pub fn with_requests(mut self, requests: f64) -> Self {
        self.requests = Some(requests);
        self
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Metric Groups
// ============================================================================

/// An independently cacheable cluster of metrics and their resets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricGroup {
    pub metrics: BTreeMap<String, Metric>,
    #[serde(default)]
    pub resets: BTreeMap<String, DateTime<Utc>>,
}

impl MetricGroup {
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.resets.is_empty()
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// Typed view of the raw keys the classifier relies on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub block_start: Option<DateTime<Utc>>,
    pub block_end: Option<DateTime<Utc>>,
    pub cloud_disabled: bool,
    pub plan: Option<String>,
    pub email: Option<String>,
}

impl Attributes {
    /// Parse a raw attribute into its typed slot
    ///
    /// Returns `false` for keys that have no typed counterpart or values that
    /// do not parse; the raw entry is kept either way.
    pub fn absorb(&mut self, key: &str, value: &str) -> bool {
        match key {
            attr::BLOCK_START => {
                self.block_start = parse_timestamp(value);
                self.block_start.is_some()
            }
            attr::BLOCK_END => {
                self.block_end = parse_timestamp(value);
                self.block_end.is_some()
            }
            attr::CLOUD_DISABLED => {
                self.cloud_disabled = matches!(
                    value.trim().to_lowercase().as_str(),
                    "true" | "1" | "yes"
                );
                true
            }
            attr::PLAN => {
                self.plan = Some(value.to_string());
                true
            }
            attr::EMAIL => {
                self.email = Some(value.to_string());
                true
            }
            _ => false,
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

// ============================================================================
// Snapshot
// ============================================================================

/// Fused usage record for one account at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub provider_id: String,
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, Metric>,
    pub resets: BTreeMap<String, DateTime<Utc>>,
    pub raw: BTreeMap<String, String>,
    pub attributes: Attributes,
    /// Non-fatal per-source error text, keyed by source name
    pub diagnostics: BTreeMap<String, String>,
    pub daily_series: BTreeMap<String, Vec<TimePoint>>,
    pub model_usage: Vec<ModelUsageRecord>,
    /// Cache groups restored this cycle, with their `observed_at`
    pub restored: BTreeMap<String, DateTime<Utc>>,
    status: Option<FetchStatus>,
    message: String,
}

impl Snapshot {
    /// Create an empty snapshot stamped with the current time
    pub fn new(provider_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self::at(provider_id, account_id, Utc::now())
    }

    /// Create an empty snapshot stamped with `timestamp`
    pub fn at(
        provider_id: impl Into<String>,
        account_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            account_id: account_id.into(),
            timestamp,
            metrics: BTreeMap::new(),
            resets: BTreeMap::new(),
            raw: BTreeMap::new(),
            attributes: Attributes::default(),
            diagnostics: BTreeMap::new(),
            daily_series: BTreeMap::new(),
            model_usage: Vec::new(),
            restored: BTreeMap::new(),
            status: None,
            message: String::new(),
        }
    }

    /// Final status; `None` until the snapshot is classified
    pub fn status(&self) -> Option<FetchStatus> {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    pub fn has_metrics(&self) -> bool {
        !self.metrics.is_empty()
    }

    /// Merge a source's staged writes (last writer wins per key)
    pub fn merge(&mut self, contribution: Contribution) {
        let parts = contribution.into_parts();

        self.metrics.extend(parts.metrics);
        self.resets.extend(parts.resets);
        for (key, value) in parts.attributes {
            self.attributes.absorb(&key, &value);
            self.raw.insert(key, value);
        }
        self.raw.extend(parts.raw);
        self.diagnostics.extend(parts.diagnostics);
        self.model_usage.extend(parts.model_usage);
        for (series, point) in parts.daily_points {
            self.daily_series.entry(series).or_default().push(point);
        }
    }

    /// Merge a cached group exactly as if its source had just produced it
    pub fn restore_group(&mut self, group_key: &str, group: &MetricGroup, observed_at: DateTime<Utc>) {
        for (key, metric) in &group.metrics {
            self.metrics.insert(key.clone(), metric.clone());
        }
        for (key, at) in &group.resets {
            self.resets.insert(key.clone(), *at);
        }
        self.restored.insert(group_key.to_string(), observed_at);
    }

    /// Record a non-fatal diagnostic for `source_name`
    ///
    /// A second diagnostic for the same source is appended, not overwritten.
    pub fn add_diagnostic(&mut self, source_name: &str, text: impl Into<String>) {
        let text = text.into();
        self.diagnostics
            .entry(source_name.to_string())
            .and_modify(|existing| {
                existing.push_str("; ");
                existing.push_str(&text);
            })
            .or_insert(text);
    }

    /// Sort each series chronologically and collapse duplicate dates
    ///
    /// For duplicate dates the point written last wins.
    pub fn close_series(&mut self) {
        for points in self.daily_series.values_mut() {
            points.sort_by_key(|p| p.date);
            let mut closed: Vec<TimePoint> = Vec::with_capacity(points.len());
            for point in points.drain(..) {
                match closed.last_mut() {
                    Some(last) if last.date == point.date => *last = point,
                    _ => closed.push(point),
                }
            }
            *points = closed;
        }
        self.daily_series.retain(|_, points| !points.is_empty());
    }

    /// Close the series and set the final status
    pub(crate) fn finalize(&mut self, status: FetchStatus, message: impl Into<String>) {
        self.close_series();
        self.set_status(status, message);
    }

    /// Set the final status; only the first call has an effect
    pub(crate) fn set_status(&mut self, status: FetchStatus, message: impl Into<String>) {
        if let Some(existing) = self.status {
            log::warn!(
                "[snapshot] Status already set to {} for {}/{}, ignoring {}",
                existing,
                self.provider_id,
                self.account_id,
                status
            );
            return;
        }
        self.status = Some(status);
        self.message = message.into();
    }
}

// ============================================================================
// Tests
// ============================================================================
