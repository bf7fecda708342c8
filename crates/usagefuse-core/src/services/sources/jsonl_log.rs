//! JSONL session-log source
//!
//! Reads rotating JSONL session logs laid out as `<root>/<project>/*.jsonl`
//! (files directly under `<root>` are read too) and turns every line that
//! carries token usage into a [`UsageEvent`].
//!
//! Lines look like:
//!
//! ```text
//! {"timestamp":"2026-03-10T09:15:02.123Z","requestId":"req_1",
//!  "message":{"id":"msg_1","model":"claude-sonnet-4-20250514",
//!             "usage":{"input_tokens":12,"output_tokens":340,
//!                      "cache_creation_input_tokens":0,"cache_read_input_tokens":2048}}}
//! ```
//!
//! Streaming writes the same response several times; lines sharing a
//! `message.id:requestId` pair count once.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Deserialize;

use crate::models::{Contribution, Snapshot};
use crate::services::fusion::{AccountConfig, FetchContext, Source, SourceError};
use crate::services::windows::{Measure, UsageEvent, WindowAggregator};

/// Default source name
pub const SOURCE_NAME: &str = "jsonl_logs";

/// Account option overriding the log root
pub const LOG_DIR_OPTION: &str = "log_dir";

/// Model id written for locally synthesized messages
const SYNTHETIC_MODEL: &str = "<synthetic>";

// ============================================================================
// Log Line Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct LogLine {
    timestamp: Option<String>,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    message: Option<LogMessage>,
}

#[derive(Debug, Deserialize)]
struct LogMessage {
    id: Option<String>,
    model: Option<String>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct TokenUsage {
    input_tokens: Option<f64>,
    output_tokens: Option<f64>,
    cache_creation_input_tokens: Option<f64>,
    cache_read_input_tokens: Option<f64>,
}

impl TokenUsage {
    /// Prompt-side tokens, cache writes and reads included
    fn input(&self) -> f64 {
        self.input_tokens.unwrap_or(0.0)
            + self.cache_creation_input_tokens.unwrap_or(0.0)
            + self.cache_read_input_tokens.unwrap_or(0.0)
    }
}

/// Events read from one log tree
#[derive(Debug, Default)]
struct ScanResult {
    events: Vec<UsageEvent>,
    files: usize,
    malformed: usize,
    duplicates: usize,
}

// ============================================================================
// Source
// ============================================================================

/// Usage derived from local JSONL session logs
#[derive(Debug, Clone)]
pub struct JsonlLogSource {
    name: String,
    root: PathBuf,
    now: Option<DateTime<Local>>,
}

impl JsonlLogSource {
    /// Source reading logs under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            name: SOURCE_NAME.to_string(),
            root: root.into(),
            now: None,
        }
    }

    /// Source reading `~/.claude/projects`
    pub fn default_location() -> Self {
        Self::new(Self::default_root())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Evaluate windows at a fixed instant instead of the wall clock
    pub fn at(mut self, now: DateTime<Local>) -> Self {
        self.now = Some(now);
        self
    }

    fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join("projects")
    }

    fn root_for(&self, account: &AccountConfig) -> PathBuf {
        account
            .option(LOG_DIR_OPTION)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.root.clone())
    }
}

#[async_trait]
impl Source for JsonlLogSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        account: &AccountConfig,
        _current: &Snapshot,
        out: &mut Contribution,
    ) -> Result<bool, SourceError> {
        let root = self.root_for(account);
        log::debug!("[source:jsonl] Scanning {}", root.display());

        let stop = ctx.clone();
        let scan = tokio::task::spawn_blocking(move || scan_tree(&root, || stop.check()))
            .await
            .map_err(|e| SourceError::Other(format!("Log scan task failed: {}", e)))??;

        log::debug!(
            "[source:jsonl] {} events from {} files ({} malformed, {} duplicate lines)",
            scan.events.len(),
            scan.files,
            scan.malformed,
            scan.duplicates
        );

        if scan.malformed > 0 {
            out.set_diagnostic(
                self.name.clone(),
                format!("skipped {} malformed lines", scan.malformed),
            );
        }
        out.set_raw("log_files", scan.files.to_string());

        let now = self.now.unwrap_or_else(Local::now);
        let summary = WindowAggregator::new(self.name.clone()).summarize(&scan.events, &now);

        let contributed = summary.apply("requests", "requests", Measure::Quantity, out);
        summary.apply("tokens", "tokens", Measure::Tokens, out);
        summary.apply_models(out);

        Ok(contributed)
    }
}

// ============================================================================
// Scanning
// ============================================================================

/// Read every log file under `root`
///
/// `check` runs before each file; the scan stops with its error so an
/// abandoned fetch does not keep the blocking thread busy.
fn scan_tree(
    root: &Path,
    check: impl Fn() -> Result<(), SourceError>,
) -> Result<ScanResult, SourceError> {
    if !root.is_dir() {
        return Err(SourceError::NotInstalled(format!(
            "Log directory not found: {}",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(root)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            match fs::read_dir(&path) {
                Ok(inner) => files.extend(inner.flatten().map(|e| e.path()).filter(|p| is_jsonl(p))),
                Err(e) => log::warn!("[source:jsonl] Cannot read {}: {}", path.display(), e),
            }
        } else if is_jsonl(&path) {
            files.push(path);
        }
    }
    // stable order so duplicate resolution never depends on directory iteration
    files.sort();

    let mut scan = ScanResult::default();
    let mut seen = HashSet::new();
    for path in &files {
        check()?;
        match fs::File::open(path) {
            Ok(file) => {
                scan.files += 1;
                read_lines(BufReader::new(file), &mut seen, &mut scan);
            }
            Err(e) => log::warn!("[source:jsonl] Cannot open {}: {}", path.display(), e),
        }
    }

    Ok(scan)
}

fn is_jsonl(path: &Path) -> bool {
    path.is_file() && path.extension().map(|e| e == "jsonl").unwrap_or(false)
}

fn read_lines(reader: impl BufRead, seen: &mut HashSet<String>, scan: &mut ScanResult) {
    for line in reader.lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: LogLine = match serde_json::from_str(&line) {
            Ok(parsed) => parsed,
            Err(_) => {
                scan.malformed += 1;
                continue;
            }
        };

        let Some(message) = parsed.message else {
            continue;
        };
        let Some(usage) = &message.usage else {
            continue;
        };

        if let (Some(id), Some(request)) = (&message.id, &parsed.request_id) {
            if !seen.insert(format!("{}:{}", id, request)) {
                scan.duplicates += 1;
                continue;
            }
        }

        let mut event = match parsed.timestamp.as_deref().and_then(parse_timestamp) {
            Some(ts) => UsageEvent::at(ts),
            None => UsageEvent::untimestamped(),
        };
        event = event.with_tokens(usage.input(), usage.output_tokens.unwrap_or(0.0));
        if let Some(model) = message.model.filter(|m| !m.is_empty() && m != SYNTHETIC_MODEL) {
            event = event.with_model(model);
        }
        scan.events.push(event);
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn line(ts: &str, msg: &str, req: &str, model: &str, input: u32, output: u32) -> String {
        format!(
            r#"{{"timestamp":"{}","requestId":"{}","message":{{"id":"{}","model":"{}","usage":{{"input_tokens":{},"output_tokens":{},"cache_creation_input_tokens":0,"cache_read_input_tokens":5}}}}}}"#,
            ts, req, msg, model, input, output
        )
    }

    #[test]
    fn test_read_lines_dedupes_and_counts_malformed() {
        let content = [
            line("2026-03-10T09:00:00Z", "m1", "r1", "claude-sonnet-4", 10, 20),
            line("2026-03-10T09:00:00Z", "m1", "r1", "claude-sonnet-4", 10, 20),
            "not json".to_string(),
            r#"{"timestamp":"2026-03-10T09:01:00Z","type":"user","message":{"role":"user","content":"hi"}}"#.to_string(),
            line("garbage", "m2", "r2", "<synthetic>", 1, 1),
        ]
        .join("\n");

        let mut scan = ScanResult::default();
        read_lines(content.as_bytes(), &mut HashSet::new(), &mut scan);

        assert_eq!(scan.events.len(), 2);
        assert_eq!(scan.duplicates, 1);
        assert_eq!(scan.malformed, 1);
        assert_eq!(scan.events[0].input_tokens, 15.0);
        assert_eq!(scan.events[0].model.as_deref(), Some("claude-sonnet-4"));
        assert!(scan.events[1].timestamp.is_none());
        assert!(scan.events[1].model.is_none());
    }

    #[test]
    fn test_missing_root_is_not_installed() {
        let err = scan_tree(Path::new("/nonexistent/usagefuse/logs"), || Ok(())).unwrap_err();
        assert!(err.is_missing_tooling());
    }

    #[tokio::test]
    async fn test_fetch_from_project_tree() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("-home-dev-app");
        fs::create_dir_all(&project).unwrap();

        let now = Local.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let recent = (now - chrono::Duration::minutes(30)).with_timezone(&Utc).to_rfc3339();
        let old = (now - chrono::Duration::days(3)).with_timezone(&Utc).to_rfc3339();

        let mut file = fs::File::create(project.join("session-a.jsonl")).unwrap();
        writeln!(file, "{}", line(&recent, "m1", "r1", "claude-opus-4", 100, 50)).unwrap();
        writeln!(file, "{}", line(&old, "m2", "r2", "claude-opus-4", 10, 5)).unwrap();
        fs::write(project.join("notes.txt"), "ignored").unwrap();

        let source = JsonlLogSource::new(dir.path()).at(now);
        let mut out = Contribution::new();
        let contributed = source
            .fetch(
                &FetchContext::new(),
                &AccountConfig::new("default"),
                &Snapshot::new("claude", "default"),
                &mut out,
            )
            .await
            .unwrap();

        assert!(contributed);
        assert_eq!(out.metric("requests_5h").unwrap().used, Some(1.0));
        assert_eq!(out.metric("requests_7d").unwrap().used, Some(2.0));
        assert_eq!(out.metric("tokens_5h").unwrap().used, Some(155.0));

        let mut snap = Snapshot::new("claude", "default");
        snap.merge(out);
        snap.close_series();
        assert_eq!(snap.daily_series["requests"].len(), 2);
        assert_eq!(snap.raw["log_files"], "1");
    }

    #[tokio::test]
    async fn test_account_option_overrides_root() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonlLogSource::new("/nonexistent/usagefuse/logs");
        let account = AccountConfig::new("default")
            .with_option(LOG_DIR_OPTION, dir.path().to_string_lossy().to_string());

        let mut out = Contribution::new();
        let contributed = source
            .fetch(
                &FetchContext::new(),
                &account,
                &Snapshot::new("claude", "default"),
                &mut out,
            )
            .await
            .unwrap();

        // empty tree: no data, no series, not an error
        assert!(!contributed);
        assert!(!out.has_usage_data());
    }

    #[tokio::test]
    async fn test_cancelled_scan_stops_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let recent = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        fs::write(
            dir.path().join("session.jsonl"),
            line(&recent, "m1", "r1", "claude-opus-4", 1, 1),
        )
        .unwrap();

        let (ctx, handle) = FetchContext::cancellable();
        handle.cancel();

        let mut out = Contribution::new();
        let err = JsonlLogSource::new(dir.path())
            .fetch(&ctx, &AccountConfig::new("default"), &Snapshot::new("claude", "default"), &mut out)
            .await
            .unwrap_err();

        assert_eq!(err, SourceError::Cancelled);
        assert!(out.is_empty());
    }
}
