//! Data models for usage snapshots

pub mod contribution;
pub mod metric;
pub mod snapshot;

pub use contribution::Contribution;
pub use metric::{format_quantity, window, Metric, MetricInput, PERCENT_UNIT};
pub use snapshot::{
    attr, Attributes, FetchStatus, MetricGroup, ModelUsageRecord, Snapshot, TimePoint,
};
