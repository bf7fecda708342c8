//! OAuth usage API source
//!
//! Calls `GET {base_url}/api/oauth/usage` with an OAuth bearer token and maps
//! the returned utilization windows to `%` quota metrics.
//!
//! # Token Resolution
//!
//! 1. `AccountConfig::credential`
//! 2. Credentials file (`~/.claude/.credentials.json` by default), key
//!    `claudeAiOauth.accessToken`
//!
//! # Metrics
//!
//! All metrics land in the `billing` cache group, so a failed call restores
//! the last good set as a whole.
//!
//! | Response field     | Metric                   | Window    |
//! |--------------------|--------------------------|-----------|
//! | `five_hour`        | `five_hour_quota`        | `5h`      |
//! | `seven_day`        | `seven_day_quota`        | `7d`      |
//! | `seven_day_opus`   | `seven_day_opus_quota`   | `7d`      |
//! | `seven_day_sonnet` | `seven_day_sonnet_quota` | `7d`      |
//! | `extra_usage`      | `plan_spend`             | `current` |

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::models::{attr, window, Contribution, Metric, MetricInput, Snapshot};
use crate::services::fusion::{AccountConfig, FetchContext, Source, SourceError};

// ============================================================================
// Constants
// ============================================================================

/// Default source name
pub const SOURCE_NAME: &str = "oauth_usage";

/// Cache group holding every metric of this source
pub const BILLING_GROUP: &str = "billing";

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Usage endpoint path
const USAGE_PATH: &str = "/api/oauth/usage";

/// OAuth beta header value
const OAUTH_BETA_HEADER: &str = "oauth-2025-04-20";

const REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_CURRENCY: &str = "USD";

// ============================================================================
// Credentials Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "claudeAiOauth")]
    claude_ai_oauth: Option<OAuthCredentials>,
}

#[derive(Debug, Deserialize)]
struct OAuthCredentials {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    /// Milliseconds since epoch
    #[serde(rename = "expiresAt")]
    expires_at: Option<i64>,
    #[serde(rename = "subscriptionType")]
    subscription_type: Option<String>,
}

/// Token plus what the credentials file says about the plan
#[derive(Debug, Clone, PartialEq)]
struct ResolvedToken {
    token: String,
    plan: Option<String>,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct UsageResponse {
    five_hour: Option<UsageWindow>,
    seven_day: Option<UsageWindow>,
    seven_day_opus: Option<UsageWindow>,
    seven_day_sonnet: Option<UsageWindow>,
    extra_usage: Option<ExtraUsage>,
}

#[derive(Debug, Deserialize)]
struct UsageWindow {
    /// Already a percentage (28.0 means 28%)
    utilization: Option<f64>,
    resets_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtraUsage {
    is_enabled: Option<bool>,
    used_credits: Option<f64>,
    monthly_limit: Option<f64>,
    currency: Option<String>,
}

// ============================================================================
// Source
// ============================================================================

/// Quota windows and plan spend from the OAuth usage API
#[derive(Debug, Clone)]
pub struct OAuthUsageSource {
    name: String,
    base_url: String,
    credentials_path: PathBuf,
    client: Client,
}

impl OAuthUsageSource {
    /// Source against [`DEFAULT_BASE_URL`] with the default credentials file
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            name: SOURCE_NAME.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            credentials_path: Self::default_credentials_path(),
            client,
        }
    }

    /// Override the API base URL (an account's `base_url` still wins)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = path.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn default_credentials_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join(".credentials.json")
    }

    fn usage_url(&self, account: &AccountConfig) -> String {
        let base = account.base_url.as_deref().unwrap_or(&self.base_url);
        format!("{}{}", base.trim_end_matches('/'), USAGE_PATH)
    }

    fn resolve_token(&self, account: &AccountConfig) -> Result<ResolvedToken, SourceError> {
        if let Some(token) = account.credential() {
            log::debug!("[source:oauth] Using account credential for {}", account.account_id);
            return Ok(ResolvedToken {
                token: token.to_string(),
                plan: None,
            });
        }

        if !self.credentials_path.exists() {
            return Err(SourceError::NotInstalled(format!(
                "Credentials file not found: {}",
                self.credentials_path.display()
            )));
        }
        let content = std::fs::read_to_string(&self.credentials_path)?;
        parse_credentials(&content, Utc::now())
    }

    async fn call_usage_api(&self, url: &str, token: &str) -> Result<UsageResponse, SourceError> {
        log::debug!("[source:oauth] GET {}", url);

        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/json")
            .header("anthropic-beta", OAUTH_BETA_HEADER)
            .header("User-Agent", "usagefuse")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("[source:oauth] HTTP {} from usage API", status);
            return Err(SourceError::from_status(status.as_u16(), body.trim()));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            log::warn!("[source:oauth] Failed to parse usage response: {}", e);
            SourceError::ParseError(format!("Invalid usage response: {}", e))
        })
    }
}

impl Default for OAuthUsageSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for OAuthUsageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn cache_groups(&self) -> Vec<String> {
        vec![BILLING_GROUP.to_string()]
    }

    async fn fetch(
        &self,
        _ctx: &FetchContext,
        account: &AccountConfig,
        _current: &Snapshot,
        out: &mut Contribution,
    ) -> Result<bool, SourceError> {
        let resolved = self.resolve_token(account)?;
        let url = self.usage_url(account);
        let response = self.call_usage_api(&url, &resolved.token).await?;

        if let Some(plan) = resolved.plan {
            out.set_attribute(attr::PLAN, plan);
        }
        let written = apply_response(response, out);
        log::debug!(
            "[source:oauth] {} metrics for {}",
            written,
            account.account_id
        );
        Ok(written > 0)
    }
}

// ============================================================================
// Mapping
// ============================================================================

fn parse_credentials(content: &str, now: DateTime<Utc>) -> Result<ResolvedToken, SourceError> {
    let file: CredentialsFile = serde_json::from_str(content)
        .map_err(|e| SourceError::ParseError(format!("Invalid credentials file format: {}", e)))?;

    let oauth = file
        .claude_ai_oauth
        .ok_or_else(|| SourceError::Unauthorized("No OAuth credentials found".to_string()))?;

    let token = oauth
        .access_token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| SourceError::Unauthorized("No access token found".to_string()))?;

    if let Some(expires_ms) = oauth.expires_at {
        if expires_ms <= now.timestamp_millis() {
            return Err(SourceError::TokenExpired);
        }
    }

    Ok(ResolvedToken {
        token,
        plan: oauth.subscription_type,
    })
}

/// Write every usable window; returns how many metrics were written
fn apply_response(response: UsageResponse, out: &mut Contribution) -> usize {
    let windows = [
        ("five_hour_quota", window::FIVE_HOUR, response.five_hour),
        ("seven_day_quota", window::SEVEN_DAY, response.seven_day),
        ("seven_day_opus_quota", window::SEVEN_DAY, response.seven_day_opus),
        ("seven_day_sonnet_quota", window::SEVEN_DAY, response.seven_day_sonnet),
    ];

    let mut written = 0;
    for (key, label, usage) in windows {
        let Some(usage) = usage else { continue };
        let Some(metric) = usage
            .utilization
            .and_then(|u| Metric::normalize(MetricInput::new().percent(u), "%", label))
        else {
            continue;
        };

        out.set_grouped_metric(BILLING_GROUP, key, metric);
        written += 1;

        if let Some(raw) = usage.resets_at {
            match DateTime::parse_from_rfc3339(&raw) {
                Ok(at) => out.set_grouped_reset(BILLING_GROUP, key, at.with_timezone(&Utc)),
                Err(_) => log::warn!("[source:oauth] Failed to parse resets_at: {}", raw),
            }
        }
    }

    if let Some(extra) = response.extra_usage {
        if extra.is_enabled == Some(true) {
            let input = MetricInput {
                limit: extra.monthly_limit,
                used: extra.used_credits,
                ..Default::default()
            };
            let currency = extra.currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
            if let Some(metric) = Metric::normalize(input, currency, window::CURRENT) {
                out.set_grouped_metric(BILLING_GROUP, "plan_spend", metric);
                written += 1;
            }
        }
    }

    written
}

// ============================================================================
// Tests
// ============================================================================
