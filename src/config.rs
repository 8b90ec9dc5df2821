// src/config.rs
//! Pipeline configuration.
//!
//! Resolution order:
//! 1) $PIPELINE_CONFIG_PATH (must exist when set)
//! 2) config/pipeline.toml
//! 3) built-in defaults
//!
//! Then `FILTER1_THRESHOLD` / `MAX_SIGNALS_PER_DAY` override the file.
//! Deployment settings and secrets live in [`Deployment`] and come from env only.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";
pub const ENV_CONFIG_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const ENV_FILTER1_THRESHOLD: &str = "FILTER1_THRESHOLD";
pub const ENV_MAX_SIGNALS_PER_DAY: &str = "MAX_SIGNALS_PER_DAY";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub thresholds: Thresholds,
    pub limits: Limits,
    pub dedup: DedupConfig,
    pub classifier: ClassifierConfig,
    pub breaker: BreakerConfig,
    pub broadcast: BroadcastConfig,
    pub lock: LockConfig,
    pub schedule: ScheduleConfig,
    pub timezone: TimezoneConfig,
    pub keywords: KeywordsConfig,
    pub guards: GuardsConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Minimum Stage 1 score (inclusive).
    pub filter1: i32,
    /// Minimum classifier relevance (inclusive).
    pub relevance: f32,
    /// Minimum classifier urgency (inclusive).
    pub urgency: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            filter1: 4,
            relevance: 0.6,
            urgency: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_signals_per_day: u32,
    /// Records beyond this count in one run are dropped (next run re-fetches).
    pub max_batch: usize,
    pub workers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_signals_per_day: 5,
            max_batch: 200,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Max Hamming distance at which two fingerprints are the same event.
    pub hamming_threshold: u32,
    /// Dedup entries older than this are purged; a later copy alerts again.
    pub retention_hours: i64,
    pub tracking_params: Vec<String>,
    pub dedup_body_chars: usize,
    pub shingle_width: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        let tracking_params = [
            "utm_source",
            "utm_medium",
            "utm_campaign",
            "utm_term",
            "utm_content",
            "yclid",
            "gclid",
            "fbclid",
            "ref",
            "from",
            "source",
            "rss",
            "tg",
            "share",
            "partner",
            "erid",
            "ysclid",
            "rs",
            "_openstat",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self {
            hamming_threshold: 3,
            retention_hours: 72,
            tracking_params,
            dedup_body_chars: 400,
            shingle_width: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub timeout_secs: u64,
    /// Extra attempts after an invalid response.
    pub retries: u32,
    /// Base delay; doubles per retry.
    pub backoff_ms: u64,
    pub categories: Vec<String>,
    /// Text sent to the service is capped at this many chars.
    pub max_input_chars: usize,
    /// Models tried in order when the primary model fails.
    pub fallback_models: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 45,
            retries: 2,
            backoff_ms: 500,
            categories: ["accident", "outage", "repair", "other"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_input_chars: 1500,
            fallback_models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub per_destination_per_second: u32,
    /// Platform-wide cap across all destinations.
    pub global_per_second: u32,
    /// Consecutive failures at which a subscriber is deactivated.
    pub failure_threshold: u32,
    /// Upper bound on a platform-requested retry delay.
    pub max_retry_after_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            per_destination_per_second: 1,
            global_per_second: 15,
            failure_threshold: 3,
            max_retry_after_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub lease_secs: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { lease_secs: 600 }
    }
}

/// Archive retention for the decision audit and the signal log. 0 keeps rows forever.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub decisions_days: i64,
    pub signals_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            decisions_days: 30,
            signals_days: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_minutes: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimezoneConfig {
    /// Offset of the quota calendar from UTC (300 = UTC+5).
    pub utc_offset_minutes: i32,
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 300,
        }
    }
}

/// One keyword category for Stage 1.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KeywordCategory {
    pub name: String,
    pub weight: i32,
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

impl KeywordCategory {
    pub fn new(name: &str, weight: i32, positive: &[&str], negative: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            weight,
            positive: positive.iter().map(|s| s.to_string()).collect(),
            negative: negative.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeywordsConfig {
    pub categories: Vec<KeywordCategory>,
}

impl Default for KeywordsConfig {
    fn default() -> Self {
        Self {
            categories: vec![
                KeywordCategory::new(
                    "accident",
                    3,
                    &[
                        "accident",
                        "burst",
                        "leak",
                        "rupture",
                        "breakdown",
                        "shutdown",
                        "out of order",
                        "emergency",
                    ],
                    &["traffic accident", "car crash", "emergency drill"],
                ),
                KeywordCategory::new(
                    "repair",
                    2,
                    &[
                        "repair",
                        "urgent repair",
                        "overhaul",
                        "replacement",
                        "reconstruction",
                        "restoration",
                    ],
                    &["road repair", "bridge repair", "roadworks"],
                ),
                KeywordCategory::new(
                    "infrastructure",
                    4,
                    &[
                        "water utility",
                        "pumping station",
                        "boiler house",
                        "heating network",
                        "treatment plant",
                        "water main",
                        "sewer",
                        "heating main",
                    ],
                    &["apartment", "stairwell"],
                ),
                KeywordCategory::new(
                    "industrial",
                    2,
                    &[
                        "workshop",
                        "production line",
                        "plant",
                        "downtime",
                        "process failure",
                        "production halt",
                    ],
                    &["planned exercise", "training"],
                ),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardsConfig {
    /// Older items are rejected as STALE_NEWS. 0 disables the check.
    pub max_age_days: i64,
    pub resolved_phrases: Vec<String>,
    /// Any of these keeps a "resolved" item alive (event still ongoing).
    pub ongoing_phrases: Vec<String>,
    pub noise_terms: Vec<String>,
    /// Any of these keeps a noisy item alive (real infrastructure event).
    pub noise_exceptions: Vec<String>,
    pub combo: ComboConfig,
}

fn strings(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

impl Default for GuardsConfig {
    fn default() -> Self {
        Self {
            max_age_days: 21,
            resolved_phrases: strings(&[
                "has been restored",
                "was restored",
                "supply restored",
                "repairs completed",
                "has been fixed",
                "back to normal",
            ]),
            ongoing_phrases: strings(&[
                "still without",
                "remain without",
                "crews are working",
                "ongoing",
            ]),
            noise_terms: strings(&[
                "murder",
                "homicide",
                "robbery",
                "funeral",
                "neighbor dispute",
            ]),
            noise_exceptions: strings(&[
                "boiler house",
                "pumping station",
                "water main",
                "treatment plant",
            ]),
            combo: ComboConfig::default(),
        }
    }
}

/// Require one "event" and one "object" category to match before Stage 2.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComboConfig {
    pub enabled: bool,
    pub event_categories: Vec<String>,
    pub object_categories: Vec<String>,
    /// Any of these bypasses the combo requirement.
    pub strong_override_phrases: Vec<String>,
}

impl Default for ComboConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            event_categories: strings(&["accident", "repair"]),
            object_categories: strings(&["infrastructure", "industrial"]),
            strong_override_phrases: strings(&[
                "explosion",
                "major accident",
                "state of emergency",
            ]),
        }
    }
}

impl PipelineConfig {
    /// Resolve and load the config file (see module docs), then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => {
                let pb = PathBuf::from(p);
                if !pb.exists() {
                    return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
                }
                Self::from_path(&pb)?
            }
            Err(_) => {
                let pb = PathBuf::from(DEFAULT_CONFIG_PATH);
                if pb.exists() {
                    Self::from_path(&pb)?
                } else {
                    tracing::info!(target: "config", "no config file found, using defaults");
                    Self::default()
                }
            }
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing pipeline config {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(t) = parse_env_num::<i32>(std::env::var(ENV_FILTER1_THRESHOLD).ok()) {
            self.thresholds.filter1 = t;
        }
        if let Some(m) = parse_env_num::<u32>(std::env::var(ENV_MAX_SIGNALS_PER_DAY).ok()) {
            self.limits.max_signals_per_day = m;
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.thresholds.relevance) {
            return Err(PipelineError::Config(format!(
                "thresholds.relevance must be within 0..=1, got {}",
                self.thresholds.relevance
            )));
        }
        if !(1..=5).contains(&self.thresholds.urgency) {
            return Err(PipelineError::Config(format!(
                "thresholds.urgency must be within 1..=5, got {}",
                self.thresholds.urgency
            )));
        }
        if self.limits.workers == 0 {
            return Err(PipelineError::Config("limits.workers must be > 0".into()));
        }
        if self.broadcast.per_destination_per_second == 0 || self.broadcast.global_per_second == 0
        {
            return Err(PipelineError::Config(
                "broadcast rates must be > 0 per second".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(PipelineError::Config(
                "breaker.failure_threshold must be > 0".into(),
            ));
        }
        check_range("dedup.retention_hours", self.dedup.retention_hours, 0, MAX_RETENTION_HOURS)?;
        check_range("guards.max_age_days", self.guards.max_age_days, 0, MAX_DAYS)?;
        check_range("retention.decisions_days", self.retention.decisions_days, 0, MAX_DAYS)?;
        check_range("retention.signals_days", self.retention.signals_days, 0, MAX_DAYS)?;
        check_range("breaker.cooldown_secs", self.breaker.cooldown_secs, 0, MAX_SECS)?;
        check_range("lock.lease_secs", self.lock.lease_secs, 1, MAX_SECS)?;
        check_range(
            "classifier.timeout_secs",
            i64::try_from(self.classifier.timeout_secs).unwrap_or(i64::MAX),
            1,
            MAX_SECS,
        )?;
        check_range(
            "classifier.backoff_ms",
            i64::try_from(self.classifier.backoff_ms).unwrap_or(i64::MAX),
            0,
            MAX_SECS * 1000,
        )?;
        if self.timezone.offset().is_none() {
            return Err(PipelineError::Config(format!(
                "timezone.utc_offset_minutes out of range: {}",
                self.timezone.utc_offset_minutes
            )));
        }
        Ok(())
    }
}

impl TimezoneConfig {
    pub fn offset(&self) -> Option<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
    }

    /// Calendar day of `now` in the configured timezone (quota key).
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        match self.offset() {
            Some(tz) => now.with_timezone(&tz).date_naive(),
            None => now.date_naive(),
        }
    }
}

/// Upper bounds that keep every derived `chrono::Duration` and timestamp in range.
const MAX_RETENTION_HOURS: i64 = 24 * 3650;
const MAX_DAYS: i64 = 3650;
const MAX_SECS: i64 = 86_400;

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<(), PipelineError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(PipelineError::Config(format!(
            "{name} must be within {min}..={max}, got {value}"
        )))
    }
}

fn parse_env_num<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| s.trim().parse::<T>().ok())
}

/// Deployment settings and secrets (env / `.env`).
#[derive(Debug, Clone)]
pub struct Deployment {
    pub classifier_api_key: Option<String>,
    pub classifier_base_url: String,
    pub classifier_model: String,
    pub telegram_bot_token: Option<String>,
    pub database_path: String,
    pub ops_addr: String,
    pub spool_path: String,
}

impl Deployment {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        Self {
            classifier_api_key: var("CLASSIFIER_API_KEY"),
            classifier_base_url: var("CLASSIFIER_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            classifier_model: var("CLASSIFIER_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            telegram_bot_token: var("TELEGRAM_BOT_TOKEN"),
            database_path: var("DATABASE_PATH").unwrap_or_else(|| "data/signals.db".to_string()),
            ops_addr: var("OPS_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            spool_path: var("SPOOL_PATH").unwrap_or_else(|| "data/spool".to_string()),
        }
    }
}
