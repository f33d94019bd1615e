//! Orchestrator configuration.
//!
//! One struct carries every tunable: stage defaults, backoff, budget
//! thresholds, buffer stock levels, cache TTLs, probe timeouts. `Default`
//! holds the canonical production constants; [`OrchestratorConfig::from_env`]
//! layers `NEXUS_*` environment overrides (a `.env` file is honored) on
//! top for deployment-specific tuning.

use std::time::Duration;

use crate::buffer::BufferConfig;
use crate::cost::{BudgetThresholds, Usd};
use crate::health::DEFAULT_PROBE_TIMEOUT;
use crate::retry::RetryPolicy;
use crate::stage::StageConfig;

/// Everything the runner and its subsystems read.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Defaults applied to stages that don't override their config.
    pub stage_defaults: StageConfig,
    /// Default retry/backoff policy stage bodies start from.
    pub retry: RetryPolicy,
    /// Per-probe preflight timeout.
    pub probe_timeout: Duration,
    /// Wall-clock ceiling for a whole run; stage timeouts nest under it.
    pub pipeline_timeout: Duration,
    pub buffer: BufferConfig,
    pub budget_thresholds: BudgetThresholds,
    /// Credit pool the budget document starts from.
    pub initial_credit: Usd,
    /// Daily YouTube API unit cap.
    pub youtube_daily_quota: u64,
    pub incident_cache_ttl: chrono::Duration,
    pub alert_channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stage_defaults: StageConfig::default(),
            retry: RetryPolicy::default(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            pipeline_timeout: Duration::from_secs(45 * 60),
            buffer: BufferConfig::default(),
            budget_thresholds: BudgetThresholds::default(),
            initial_credit: Usd::from_dollars(300.0),
            youtube_daily_quota: 10_000,
            incident_cache_ttl: chrono::Duration::minutes(5),
            alert_channel_capacity: 128,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults with `NEXUS_*` environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Some(secs) = env_u64("NEXUS_STAGE_TIMEOUT_SECS") {
            config.stage_defaults.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_u64("NEXUS_STAGE_RETRIES") {
            config.stage_defaults.retries = retries as u32;
            config.retry.max_retries = retries as u32;
        }
        if let Some(secs) = env_u64("NEXUS_PIPELINE_TIMEOUT_SECS") {
            config.pipeline_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("NEXUS_PROBE_TIMEOUT_SECS") {
            config.probe_timeout = Duration::from_secs(secs);
        }
        if let Some(minimum) = env_u64("NEXUS_BUFFER_MINIMUM") {
            config.buffer.minimum = minimum as u32;
        }
        if let Some(warning) = env_u64("NEXUS_BUFFER_WARNING") {
            config.buffer.warning = warning as u32;
        }
        if let Some(days) = env_u64("NEXUS_BUFFER_RETENTION_DAYS") {
            config.buffer.retention = chrono::Duration::days(days as i64);
        }
        if let Some(dollars) = env_f64("NEXUS_BUDGET_WARNING_USD") {
            config.budget_thresholds.per_video_warning = Usd::from_dollars(dollars);
        }
        if let Some(dollars) = env_f64("NEXUS_BUDGET_CRITICAL_USD") {
            config.budget_thresholds.per_video_critical = Usd::from_dollars(dollars);
        }
        if let Some(dollars) = env_f64("NEXUS_INITIAL_CREDIT_USD") {
            config.initial_credit = Usd::from_dollars(dollars);
        }
        if let Some(units) = env_u64("NEXUS_YOUTUBE_DAILY_QUOTA") {
            config.youtube_daily_quota = units;
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok()?.trim().parse().ok()
}
