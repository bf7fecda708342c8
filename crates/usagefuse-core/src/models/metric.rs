//! Metric model
//!
//! A [`Metric`] is one measured quantity in canonical shape. Sources hand
//! whatever subset of {limit, remaining, used, percent} they have to
//! [`Metric::normalize`]; absent fields stay absent (never zero).

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Unit marking a metric whose `used` value is itself a percentage
pub const PERCENT_UNIT: &str = "%";

/// Common window labels
pub mod window {
    pub const FIVE_HOUR: &str = "5h";
    pub const ONE_DAY: &str = "1d";
    pub const ONE_WEEK: &str = "1w";
    pub const SEVEN_DAY: &str = "7d";
    pub const TODAY: &str = "today";
    pub const ALL_TIME: &str = "all-time";
    pub const CURRENT: &str = "current";
    pub const PER_REQUEST: &str = "per-request";
}

// ============================================================================
// Metric Input
// ============================================================================

/// Raw inputs a source has for one quantity
///
/// Every field is optional; non-finite values are treated as absent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricInput {
    pub limit: Option<f64>,
    pub remaining: Option<f64>,
    pub used: Option<f64>,
    pub percent: Option<f64>,
}

impl MetricInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: f64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn remaining(mut self, remaining: f64) -> Self {
        self.remaining = Some(remaining);
        self
    }

    pub fn used(mut self, used: f64) -> Self {
        self.used = Some(used);
        self
    }

    pub fn percent(mut self, percent: f64) -> Self {
        self.percent = Some(percent);
        self
    }
}

// ============================================================================
// Metric
// ============================================================================

/// One normalized measurement
///
/// At least one of `limit`, `remaining`, `used` is present on every metric
/// produced through the constructors below. Metrics are values: a source
/// replaces a metric wholesale, it never patches one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<f64>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub window: String,
}

impl Metric {
    /// Normalize heterogeneous inputs into a metric
    ///
    /// The missing members of {limit, remaining, used} are derived only when
    /// the inputs determine them exactly. Percent-only input is stored as
    /// `used = percent` with unit `%` and no limit. Returns `None` when the
    /// input carries no usable value at all.
    pub fn normalize(
        input: MetricInput,
        unit: impl Into<String>,
        window: impl Into<String>,
    ) -> Option<Self> {
        let mut limit = input.limit.filter(|v| v.is_finite());
        let mut remaining = input.remaining.filter(|v| v.is_finite());
        let mut used = input.used.filter(|v| v.is_finite());
        let percent = input.percent.filter(|v| v.is_finite());

        match (limit, remaining, used) {
            (Some(l), None, None) => {
                if let Some(p) = percent {
                    let u = l * p / 100.0;
                    used = Some(u);
                    remaining = Some(l - u);
                }
            }
            (Some(l), Some(r), None) => used = Some(l - r),
            (Some(l), None, Some(u)) => remaining = Some(l - u),
            (None, Some(r), Some(u)) => limit = Some(r + u),
            (None, None, None) => {
                return percent.map(|p| Self::percent_only(p, window));
            }
            _ => {}
        }

        Some(Self {
            limit,
            remaining,
            used,
            unit: unit.into(),
            window: window.into(),
        })
    }

    /// A plain count with no known limit
    pub fn count(used: f64, unit: impl Into<String>, window: impl Into<String>) -> Self {
        Self {
            limit: None,
            remaining: None,
            used: Some(used),
            unit: unit.into(),
            window: window.into(),
        }
    }

    /// A used/limit pair; `remaining` is derived
    pub fn with_limit(
        used: f64,
        limit: f64,
        unit: impl Into<String>,
        window: impl Into<String>,
    ) -> Self {
        Self {
            limit: Some(limit),
            remaining: Some(limit - used),
            used: Some(used),
            unit: unit.into(),
            window: window.into(),
        }
    }

    /// A bare percentage (no limit is synthesized)
    pub fn percent_only(percent: f64, window: impl Into<String>) -> Self {
        Self {
            limit: None,
            remaining: None,
            used: Some(percent),
            unit: PERCENT_UNIT.to_string(),
            window: window.into(),
        }
    }

    /// Whether the metric carries any value
    pub fn has_value(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some() || self.used.is_some()
    }

    /// Whether `used` is already a percentage
    pub fn is_percent_unit(&self) -> bool {
        self.unit == PERCENT_UNIT
    }

    /// Percentage of the limit consumed
    ///
    /// `None` when it cannot be derived (no limit, zero limit, or no
    /// used/remaining). Callers must not substitute a number for `None`.
    pub fn percent(&self) -> Option<f64> {
        let positive_limit = self.limit.filter(|l| *l > 0.0);

        if let (Some(used), Some(limit)) = (self.used, positive_limit) {
            return Some(used / limit * 100.0);
        }
        if let (Some(remaining), Some(limit)) = (self.remaining, positive_limit) {
            return Some((limit - remaining) / limit * 100.0);
        }
        if self.is_percent_unit() {
            return self.used;
        }
        None
    }

    /// Percentage of the limit still available
    pub fn remaining_percent(&self) -> Option<f64> {
        self.percent().map(|p| 100.0 - p)
    }

    /// Short human-readable rendering, e.g. `4/20 USD (20%)` or `12 messages`
    pub fn describe(&self) -> String {
        let unit = if self.unit.is_empty() || self.is_percent_unit() {
            String::new()
        } else {
            format!(" {}", self.unit)
        };

        match (self.used, self.limit, self.remaining) {
            (_, _, _) if self.is_percent_unit() && self.limit.is_none() => {
                format!("{}%", format_quantity(self.used.unwrap_or_default()))
            }
            (Some(used), Some(limit), _) => match self.percent() {
                Some(p) => format!(
                    "{}/{}{} ({}%)",
                    format_quantity(used),
                    format_quantity(limit),
                    unit,
                    format_quantity(p.round())
                ),
                None => format!("{}/{}{}", format_quantity(used), format_quantity(limit), unit),
            },
            (Some(used), None, _) => format!("{}{}", format_quantity(used), unit),
            (None, _, Some(remaining)) => format!("{}{} left", format_quantity(remaining), unit),
            (None, Some(limit), None) => format!("limit {}{}", format_quantity(limit), unit),
            (None, None, None) => "n/a".to_string(),
        }
    }
}

/// Render a quantity without trailing zeros (`12`, `4.5`, `0.25`)
pub fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let s = format!("{:.2}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_from_used_and_limit() {
        let m = Metric::with_limit(25.0, 100.0, "requests", window::ONE_DAY);
        assert_eq!(m.percent(), Some(25.0));
    }

    #[test]
    fn test_percent_from_remaining_and_limit() {
        let m = Metric {
            limit: Some(100.0),
            remaining: Some(75.0),
            used: None,
            unit: "requests".to_string(),
            window: window::ONE_DAY.to_string(),
        };
        assert_eq!(m.percent(), Some(25.0));
    }

    #[test]
    fn test_percent_unit() {
        let m = Metric::percent_only(5.0, window::FIVE_HOUR);
        assert_eq!(m.percent(), Some(5.0));
        assert!(m.limit.is_none());
    }

    #[test]
    fn test_percent_undefined() {
        assert_eq!(Metric::count(12.0, "messages", window::TODAY).percent(), None);

        let zero_limit = Metric::with_limit(3.0, 0.0, "USD", window::CURRENT);
        assert_eq!(zero_limit.percent(), None);
    }

    #[test]
    fn test_normalize_derives_used() {
        let m = Metric::normalize(MetricInput::new().limit(20.0).remaining(16.0), "USD", "current")
            .unwrap();
        assert_eq!(m.used, Some(4.0));
        assert_eq!(m.percent(), Some(20.0));
    }

    #[test]
    fn test_normalize_derives_remaining_and_limit() {
        let m = Metric::normalize(MetricInput::new().limit(20.0).used(5.0), "USD", "current")
            .unwrap();
        assert_eq!(m.remaining, Some(15.0));

        let m = Metric::normalize(MetricInput::new().remaining(6.0).used(4.0), "req", "1d")
            .unwrap();
        assert_eq!(m.limit, Some(10.0));
    }

    #[test]
    fn test_normalize_percent_only_keeps_limit_absent() {
        let m = Metric::normalize(MetricInput::new().percent(42.0), "requests", "5h").unwrap();
        assert_eq!(m.unit, PERCENT_UNIT);
        assert_eq!(m.used, Some(42.0));
        assert!(m.limit.is_none());
        assert!(m.remaining.is_none());
    }

    #[test]
    fn test_normalize_limit_and_percent() {
        let m = Metric::normalize(MetricInput::new().limit(200.0).percent(10.0), "req", "1d")
            .unwrap();
        assert_eq!(m.used, Some(20.0));
        assert_eq!(m.remaining, Some(180.0));
    }

    #[test]
    fn test_normalize_does_not_guess() {
        // used alone: nothing else is derivable
        let m = Metric::normalize(MetricInput::new().used(7.0), "req", "1d").unwrap();
        assert!(m.limit.is_none());
        assert!(m.remaining.is_none());

        assert!(Metric::normalize(MetricInput::new(), "req", "1d").is_none());
        assert!(Metric::normalize(MetricInput::new().used(f64::NAN), "req", "1d").is_none());
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            Metric::with_limit(4.0, 20.0, "USD", "current").describe(),
            "4/20 USD (20%)"
        );
        assert_eq!(Metric::count(12.0, "messages", "today").describe(), "12 messages");
        assert_eq!(Metric::percent_only(37.5, "5h").describe(), "37.5%");
    }

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(12.0), "12");
        assert_eq!(format_quantity(4.5), "4.5");
        assert_eq!(format_quantity(0.126), "0.13");
    }

    #[test]
    fn test_serde_skips_absent_fields() {
        let json = serde_json::to_string(&Metric::count(3.0, "req", "1d")).unwrap();
        assert!(!json.contains("limit"));
        let back: Metric = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Metric::count(3.0, "req", "1d"));
    }
}
