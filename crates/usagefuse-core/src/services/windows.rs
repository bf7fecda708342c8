//! Time-window aggregation
//!
//! Buckets timestamped usage events into named windows measured backward from
//! "now", the current 5-hour quota block, and per-day series.
//!
//! # Windows
//!
//! | Window     | Membership                                              |
//! |------------|---------------------------------------------------------|
//! | `5h`       | `now - 5h < ts <= now`                                  |
//! | `1d`       | `now - 24h < ts <= now` (rolling, not calendar-aligned) |
//! | `7d`       | `now - 7d < ts <= now`                                  |
//! | `today`    | same local calendar day as `now`, `ts <= now`           |
//! | `all-time` | every timestamped event (optionally untimestamped too)  |
//!
//! The block window is a different thing from the rolling `5h` window: blocks
//! start at local hours 0, 5, 10, 15 and 20 and answer "when does the next
//! quota reset land", not "how much happened in the last five hours".

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc};

use crate::models::{attr, window, Contribution, Metric, ModelUsageRecord};

/// Length of a quota block in hours
pub const BLOCK_HOURS: u32 = 5;

// ============================================================================
// Events
// ============================================================================

/// One observed unit of activity (a request, a message, a tool call, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    pub timestamp: Option<DateTime<Utc>>,
    /// Amount this event counts for (usually 1)
    pub quantity: f64,
    pub model: Option<String>,
    pub input_tokens: f64,
    pub output_tokens: f64,
}

impl UsageEvent {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            quantity: 1.0,
            model: None,
            input_tokens: 0.0,
            output_tokens: 0.0,
        }
    }

    /// An event whose timestamp could not be determined
    pub fn untimestamped() -> Self {
        Self {
            timestamp: None,
            quantity: 1.0,
            model: None,
            input_tokens: 0.0,
            output_tokens: 0.0,
        }
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tokens(mut self, input: f64, output: f64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    /// Timestamp if present and not the zero/epoch placeholder
    fn valid_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.filter(|ts| ts.timestamp() > 0)
    }
}

// ============================================================================
// Windows
// ============================================================================

/// Fixed aggregation windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Window {
    FiveHour,
    OneDay,
    SevenDay,
    Today,
    AllTime,
}

impl Window {
    pub const ALL: [Window; 5] = [
        Window::FiveHour,
        Window::OneDay,
        Window::SevenDay,
        Window::Today,
        Window::AllTime,
    ];

    /// Window label stored on metrics
    pub fn label(&self) -> &'static str {
        match self {
            Window::FiveHour => window::FIVE_HOUR,
            Window::OneDay => window::ONE_DAY,
            Window::SevenDay => window::SEVEN_DAY,
            Window::Today => window::TODAY,
            Window::AllTime => window::ALL_TIME,
        }
    }

    /// Suffix used in metric keys (`requests_5h`, `requests_all_time`)
    pub fn key_suffix(&self) -> &'static str {
        match self {
            Window::FiveHour => "5h",
            Window::OneDay => "1d",
            Window::SevenDay => "7d",
            Window::Today => "today",
            Window::AllTime => "all_time",
        }
    }

    /// Rolling length, for the duration-based windows
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Window::FiveHour => Some(Duration::hours(5)),
            Window::OneDay => Some(Duration::hours(24)),
            Window::SevenDay => Some(Duration::days(7)),
            Window::Today | Window::AllTime => None,
        }
    }

    fn contains<Tz: TimeZone>(&self, ts: &DateTime<Utc>, now: &DateTime<Tz>) -> bool {
        let now_utc = now.with_timezone(&Utc);
        match self {
            Window::AllTime => true,
            Window::Today => {
                *ts <= now_utc
                    && ts.with_timezone(&now.timezone()).date_naive() == now.date_naive()
            }
            _ => match self.duration() {
                Some(d) => *ts > now_utc - d && *ts <= now_utc,
                None => false,
            },
        }
    }
}

// ============================================================================
// Block Window
// ============================================================================

/// The fixed-schedule 5-hour quota block containing a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BlockWindow {
    /// Block containing `now`, aligned to `floor(hour / 5) * 5` on `now`'s
    /// wall clock
    ///
    /// Both edges are local wall-clock times, so a block that spans a DST
    /// change is one hour shorter or longer than five hours.
    pub fn containing<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        let tz = now.timezone();
        let block_start = now
            .date_naive()
            .and_hms_opt(now.hour() / BLOCK_HOURS * BLOCK_HOURS, 0, 0)
            .and_then(|naive| resolve_local(&tz, naive).map(|at| (naive, at)));

        let Some((naive, start)) = block_start else {
            return Self::elapsed(now);
        };
        let end = resolve_local(&tz, naive + Duration::hours(i64::from(BLOCK_HOURS)))
            .filter(|end| *end > start)
            .unwrap_or_else(|| start + Duration::hours(i64::from(BLOCK_HOURS)));

        Self { start, end }
    }

    /// Block computed on elapsed time, used when the wall clock cannot be
    /// resolved
    fn elapsed<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        let into_block = Duration::hours(i64::from(now.hour() % BLOCK_HOURS))
            + Duration::minutes(i64::from(now.minute()))
            + Duration::seconds(i64::from(now.second()))
            + Duration::nanoseconds(i64::from(now.nanosecond()));
        let start = now.with_timezone(&Utc) - into_block;
        Self {
            start,
            end: start + Duration::hours(i64::from(BLOCK_HOURS)),
        }
    }

    /// `start <= ts < end`
    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts < self.end
    }
}

/// Instant of a local wall-clock time
///
/// Ambiguous times take the earlier instant. A time inside a DST gap maps
/// through the offset in force just before the gap, i.e. to the transition.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    if let Some(at) = tz.from_local_datetime(&naive).earliest() {
        return Some(at.with_timezone(&Utc));
    }
    let before = tz
        .offset_from_local_datetime(&(naive - Duration::hours(1)))
        .earliest()?;
    let utc = naive - Duration::seconds(i64::from(before.fix().local_minus_utc()));
    Some(Utc.from_utc_datetime(&utc))
}

// ============================================================================
// Summary
// ============================================================================

/// Accumulated totals for a set of events
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tally {
    pub events: usize,
    pub quantity: f64,
    pub input_tokens: f64,
    pub output_tokens: f64,
}

impl Tally {
    fn add(&mut self, event: &UsageEvent) {
        self.events += 1;
        self.quantity += event.quantity;
        self.input_tokens += event.input_tokens;
        self.output_tokens += event.output_tokens;
    }

    pub fn tokens(&self) -> f64 {
        self.input_tokens + self.output_tokens
    }

    fn measure(&self, measure: Measure) -> f64 {
        match measure {
            Measure::Quantity => self.quantity,
            Measure::Tokens => self.tokens(),
        }
    }
}

/// Which value of a [`Tally`] to publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    Quantity,
    Tokens,
}

/// Windowed view over one event stream
#[derive(Debug, Clone)]
pub struct WindowSummary {
    pub totals: BTreeMap<Window, Tally>,
    pub block: BlockWindow,
    pub block_tally: Tally,
    pub daily: BTreeMap<NaiveDate, Tally>,
    pub models: BTreeMap<(String, Window), Tally>,
    /// Events that fell out of every window for lack of a usable timestamp
    pub skipped: usize,
    source_name: String,
    event_count: usize,
}

impl WindowSummary {
    /// Whether the summary was built from an empty stream
    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    pub fn total(&self, window: Window) -> Tally {
        self.totals.get(&window).copied().unwrap_or_default()
    }

    /// Publish window metrics, block attributes and the per-day series
    ///
    /// Writes `{prefix}_{5h,1d,7d,today,all_time,block}`, a `{prefix}_block`
    /// reset, `block_start`/`block_end` attributes and the `{prefix}` daily
    /// series. Writes nothing for an empty stream and returns `false`.
    pub fn apply(&self, prefix: &str, unit: &str, measure: Measure, out: &mut Contribution) -> bool {
        if self.is_empty() {
            return false;
        }

        for window in Window::ALL {
            let value = self.total(window).measure(measure);
            out.set_metric(
                format!("{}_{}", prefix, window.key_suffix()),
                Metric::count(value, unit, window.label()),
            );
        }

        let block_key = format!("{}_block", prefix);
        out.set_metric(
            block_key.clone(),
            Metric::count(self.block_tally.measure(measure), unit, window::FIVE_HOUR),
        );
        out.set_reset(block_key, self.block.end);
        out.set_attribute(attr::BLOCK_START, self.block.start.to_rfc3339());
        out.set_attribute(attr::BLOCK_END, self.block.end.to_rfc3339());

        for (date, tally) in &self.daily {
            out.append_daily_point(prefix, *date, tally.measure(measure));
        }

        true
    }

    /// Append one [`ModelUsageRecord`] per (model, window)
    pub fn apply_models(&self, out: &mut Contribution) {
        for ((model, window), tally) in &self.models {
            out.append_model_usage(
                ModelUsageRecord::new(model.clone(), self.source_name.clone(), window.label())
                    .with_tokens(tally.input_tokens, tally.output_tokens)
                    .with_requests(tally.events as f64),
            );
        }
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Builds [`WindowSummary`] values from raw events
#[derive(Debug, Clone)]
pub struct WindowAggregator {
    source_name: String,
    count_untimestamped_in_all_time: bool,
    model_windows: Vec<Window>,
}

impl WindowAggregator {
    /// Create an aggregator tagging model records with `source_name`
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            count_untimestamped_in_all_time: false,
            model_windows: vec![Window::Today, Window::SevenDay, Window::AllTime],
        }
    }

    /// Count events without a usable timestamp toward `all-time`
    pub fn count_untimestamped_in_all_time(mut self, enabled: bool) -> Self {
        self.count_untimestamped_in_all_time = enabled;
        self
    }

    /// Windows for which per-model records are produced
    pub fn model_windows(mut self, windows: impl IntoIterator<Item = Window>) -> Self {
        self.model_windows = windows.into_iter().collect();
        self
    }

    /// Bucket `events` relative to `now`
    ///
    /// Calendar-aligned buckets (`today`, the per-day series, the block) use
    /// `now`'s time zone.
    pub fn summarize<Tz: TimeZone>(&self, events: &[UsageEvent], now: &DateTime<Tz>) -> WindowSummary {
        let block = BlockWindow::containing(now);
        let mut summary = WindowSummary {
            totals: Window::ALL.iter().map(|w| (*w, Tally::default())).collect(),
            block,
            block_tally: Tally::default(),
            daily: BTreeMap::new(),
            models: BTreeMap::new(),
            skipped: 0,
            source_name: self.source_name.clone(),
            event_count: events.len(),
        };

        for event in events {
            let Some(ts) = event.valid_timestamp() else {
                summary.skipped += 1;
                if self.count_untimestamped_in_all_time {
                    if let Some(tally) = summary.totals.get_mut(&Window::AllTime) {
                        tally.add(event);
                    }
                }
                continue;
            };

            for window in Window::ALL {
                if window.contains(&ts, now) {
                    if let Some(tally) = summary.totals.get_mut(&window) {
                        tally.add(event);
                    }
                    if let Some(model) = &event.model {
                        if self.model_windows.contains(&window) {
                            summary
                                .models
                                .entry((model.clone(), window))
                                .or_default()
                                .add(event);
                        }
                    }
                }
            }

            if block.contains(&ts) {
                summary.block_tally.add(event);
            }

            let day = ts.with_timezone(&now.timezone()).date_naive();
            summary.daily.entry(day).or_default().add(event);
        }

        log::debug!(
            "[windows] {} events summarized for {} ({} without timestamp)",
            events.len(),
            self.source_name,
            summary.skipped
        );

        summary
    }
}

// ============================================================================
// Tests
// ============================================================================
