//! Staged source writes
//!
//! A [`Contribution`] collects everything one source writes during a cycle.
//! The coordinator merges it into the snapshot only once the source has
//! returned, so a cancelled or timed-out source never leaves half its data in
//! the snapshot.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};

use super::metric::Metric;
use super::snapshot::{MetricGroup, ModelUsageRecord, TimePoint};

/// Writes staged by one source
#[derive(Debug, Clone, Default)]
pub struct Contribution {
    metrics: BTreeMap<String, Metric>,
    resets: BTreeMap<String, DateTime<Utc>>,
    /// metric key -> cache group
    metric_groups: BTreeMap<String, String>,
    /// reset key -> cache group
    reset_groups: BTreeMap<String, String>,
    attributes: BTreeMap<String, String>,
    raw: BTreeMap<String, String>,
    diagnostics: BTreeMap<String, String>,
    model_usage: Vec<ModelUsageRecord>,
    daily_points: Vec<(String, TimePoint)>,
}

/// Owned contents of a [`Contribution`]
#[derive(Debug, Default)]
pub(crate) struct ContributionParts {
    pub metrics: BTreeMap<String, Metric>,
    pub resets: BTreeMap<String, DateTime<Utc>>,
    pub attributes: BTreeMap<String, String>,
    pub raw: BTreeMap<String, String>,
    pub diagnostics: BTreeMap<String, String>,
    pub model_usage: Vec<ModelUsageRecord>,
    pub daily_points: Vec<(String, TimePoint)>,
}

impl Contribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (replace) a metric
    ///
    /// Metrics without any value are dropped.
    pub fn set_metric(&mut self, key: impl Into<String>, metric: Metric) {
        let key = key.into();
        if !metric.has_value() {
            log::debug!("[contribution] Dropping empty metric '{}'", key);
            return;
        }
        self.metric_groups.remove(&key);
        self.metrics.insert(key, metric);
    }

    /// Set a metric that belongs to cache group `group`
    pub fn set_grouped_metric(
        &mut self,
        group: impl Into<String>,
        key: impl Into<String>,
        metric: Metric,
    ) {
        let key = key.into();
        if !metric.has_value() {
            log::debug!("[contribution] Dropping empty metric '{}'", key);
            return;
        }
        self.metric_groups.insert(key.clone(), group.into());
        self.metrics.insert(key, metric);
    }

    /// Record when metric `key`'s window rolls over
    pub fn set_reset(&mut self, key: impl Into<String>, at: DateTime<Utc>) {
        let key = key.into();
        self.reset_groups.remove(&key);
        self.resets.insert(key, at);
    }

    /// Record a reset that belongs to cache group `group`
    pub fn set_grouped_reset(
        &mut self,
        group: impl Into<String>,
        key: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        let key = key.into();
        self.reset_groups.insert(key.clone(), group.into());
        self.resets.insert(key, at);
    }

    /// Set a descriptive attribute (lands in `Snapshot::raw`)
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Set a free-text descriptive field that is never parsed
    pub fn set_raw(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.raw.insert(key.into(), value.into());
    }

    pub fn set_diagnostic(&mut self, source_name: impl Into<String>, text: impl Into<String>) {
        self.diagnostics.insert(source_name.into(), text.into());
    }

    pub fn append_model_usage(&mut self, record: ModelUsageRecord) {
        self.model_usage.push(record);
    }

    /// Append one point to `series_key`; duplicates are resolved at finalize
    pub fn append_daily_point(&mut self, series_key: impl Into<String>, date: NaiveDate, value: f64) {
        self.daily_points
            .push((series_key.into(), TimePoint::new(date, value)));
    }

    pub fn metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    pub fn metric_keys(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    /// Whether nothing at all was staged
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
            && self.resets.is_empty()
            && self.attributes.is_empty()
            && self.raw.is_empty()
            && self.diagnostics.is_empty()
            && self.model_usage.is_empty()
            && self.daily_points.is_empty()
    }

    /// Whether usage data (not just descriptive attributes) was staged
    pub fn has_usage_data(&self) -> bool {
        !self.metrics.is_empty() || !self.model_usage.is_empty() || !self.daily_points.is_empty()
    }

    /// Cache groups that received at least one write
    pub fn populated_groups(&self) -> BTreeSet<String> {
        self.metric_groups
            .values()
            .chain(self.reset_groups.values())
            .cloned()
            .collect()
    }

    /// Extract the metrics and resets tagged with `group`
    pub fn group(&self, group: &str) -> MetricGroup {
        let mut out = MetricGroup::default();
        for (key, _) in self.metric_groups.iter().filter(|(_, g)| *g == group) {
            if let Some(metric) = self.metrics.get(key) {
                out.metrics.insert(key.clone(), metric.clone());
            }
        }
        for (key, _) in self.reset_groups.iter().filter(|(_, g)| *g == group) {
            if let Some(at) = self.resets.get(key) {
                out.resets.insert(key.clone(), *at);
            }
        }
        out
    }

    pub(crate) fn into_parts(self) -> ContributionParts {
        ContributionParts {
            metrics: self.metrics,
            resets: self.resets,
            attributes: self.attributes,
            raw: self.raw,
            diagnostics: self.diagnostics,
            model_usage: self.model_usage,
            daily_points: self.daily_points,
        }
    }
}
