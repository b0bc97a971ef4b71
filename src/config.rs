use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{TrackerConfig, TrackerType};
use crate::{API_BASE, RULES_URL, STREAM_WS_URL};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Environment variable that overrides `api.bearer_token`.
pub const BEARER_TOKEN_ENV: &str = "FEEDWATCH_BEARER_TOKEN";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub pacer: PacerConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub bus: BusConfig,
    /// Trackers created on startup.
    #[serde(default)]
    pub trackers: Vec<TrackerSeed>,
}

/// Upstream REST API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base")]
    pub base_url: String,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Attempts per request for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Ids per batched lookup.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Real-time feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_rules_url")]
    pub rules_url: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Longest rule expression the feed accepts.
    #[serde(default = "default_max_rule_length")]
    pub max_rule_length: usize,
}

/// Pacing and backoff for repeated upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Items processed before any delay is added.
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u64,
    #[serde(default = "default_short_delay")]
    pub short_delay_ms: [u64; 2],
    #[serde(default = "default_rest_delay")]
    pub rest_delay_ms: [u64; 2],
    /// Range for the number of items between long rests.
    #[serde(default = "default_rest_every")]
    pub rest_every: [u32; 2],
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

/// Poll intervals per strategy, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_profile_interval")]
    pub profile_secs: u64,
    #[serde(default = "default_follower_interval")]
    pub follower_secs: u64,
    #[serde(default = "default_trend_interval")]
    pub trend_secs: u64,
    #[serde(default = "default_engagement_interval")]
    pub engagement_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

/// A tracker declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSeed {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub tracker_type: TrackerType,
    #[serde(default = "empty_table")]
    pub parameters: toml::Table,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_api_base() -> String {
    API_BASE.to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_batch_size() -> usize {
    100
}
fn default_rules_url() -> String {
    RULES_URL.to_string()
}
fn default_stream_url() -> String {
    STREAM_WS_URL.to_string()
}
fn default_max_reconnect() -> u32 {
    5
}
fn default_reconnect_base() -> u64 {
    1_000
}
fn default_reconnect_max() -> u64 {
    30_000
}
fn default_keepalive() -> u64 {
    20
}
fn default_max_rule_length() -> usize {
    512
}
fn default_burst_threshold() -> u64 {
    50
}
fn default_short_delay() -> [u64; 2] {
    [200, 800]
}
fn default_rest_delay() -> [u64; 2] {
    [5_000, 15_000]
}
fn default_rest_every() -> [u32; 2] {
    [20, 40]
}
fn default_backoff_base() -> u64 {
    1_000
}
fn default_backoff_max() -> u64 {
    60_000
}
fn default_profile_interval() -> u64 {
    300
}
fn default_follower_interval() -> u64 {
    600
}
fn default_trend_interval() -> u64 {
    300
}
fn default_engagement_interval() -> u64 {
    60
}
fn default_bus_capacity() -> usize {
    1024
}
fn empty_table() -> toml::Table {
    toml::Table::new()
}
fn default_true() -> bool {
    true
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base(),
            bearer_token: String::new(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            rules_url: default_rules_url(),
            stream_url: default_stream_url(),
            max_reconnect_attempts: default_max_reconnect(),
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_ms: default_reconnect_max(),
            keepalive_secs: default_keepalive(),
            max_rule_length: default_max_rule_length(),
        }
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            burst_threshold: default_burst_threshold(),
            short_delay_ms: default_short_delay(),
            rest_delay_ms: default_rest_delay(),
            rest_every: default_rest_every(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            profile_secs: default_profile_interval(),
            follower_secs: default_follower_interval(),
            trend_secs: default_trend_interval(),
            engagement_secs: default_engagement_interval(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

impl StreamConfig {
    /// Pacer settings used for reconnect backoff.
    pub fn reconnect_pacer(&self) -> PacerConfig {
        PacerConfig {
            backoff_base_ms: self.reconnect_base_ms,
            backoff_max_ms: self.reconnect_max_ms,
            ..PacerConfig::default()
        }
    }
}

impl IntervalConfig {
    /// Poll interval for a poll-based strategy; `None` for stream strategies.
    pub fn for_type(&self, tracker_type: TrackerType) -> Option<Duration> {
        let secs = match tracker_type {
            TrackerType::Profile => self.profile_secs,
            TrackerType::Follower => self.follower_secs,
            TrackerType::Trend => self.trend_secs,
            TrackerType::Engagement => self.engagement_secs,
            _ => return None,
        };
        Some(Duration::from_secs(secs.max(1)))
    }
}

impl TrackerSeed {
    pub fn to_tracker(&self) -> Result<TrackerConfig> {
        let parameters = serde_json::to_value(&self.parameters)
            .with_context(|| format!("invalid parameters for tracker {}", self.name))?;
        Ok(match &self.id {
            Some(id) => TrackerConfig::with_id(id, &self.name, self.tracker_type, parameters),
            None => TrackerConfig::new(&self.name, self.tracker_type, parameters),
        })
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    ///
    /// `.env` is read first so the bearer token can stay out of the file.
    pub fn load(path: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        if let Ok(token) = std::env::var(BEARER_TOKEN_ENV) {
            config.api.bearer_token = token;
        }
        Ok(config)
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
