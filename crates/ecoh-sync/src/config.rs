use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use ecoh_adapters::EndpointRegistry;
use ecoh_storage::{HttpClientConfig, DEFAULT_USER_AGENT};

pub const DEFAULT_BASE_URL: &str = "https://orsha-ecokarta.gov.by/api";
pub const DEFAULT_SCHEDULE_INTERVAL: Duration = Duration::from_secs(3600);

/// When incremental cycles fire after the initial one. The default is a fixed
/// interval counted from scheduler start; a cron expression pins ticks to
/// wall-clock times instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestSchedule {
    Interval(Duration),
    Cron(String),
}

impl Default for HarvestSchedule {
    fn default() -> Self {
        HarvestSchedule::Interval(DEFAULT_SCHEDULE_INTERVAL)
    }
}

impl HarvestSchedule {
    /// A cron expression wins over an interval; a zero or unparsable interval
    /// falls back to the default.
    pub fn from_settings(cron: Option<String>, interval_secs: Option<&str>) -> Self {
        if let Some(cron) = cron.filter(|c| !c.trim().is_empty()) {
            return HarvestSchedule::Cron(cron);
        }
        interval_secs
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(|secs| HarvestSchedule::Interval(Duration::from_secs(secs)))
            .unwrap_or_default()
    }
}

impl fmt::Display for HarvestSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarvestSchedule::Interval(every) => write!(f, "every {}s", every.as_secs()),
            HarvestSchedule::Cron(expr) => write!(f, "cron {expr}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub base_url: String,
    pub schedule: HarvestSchedule,
    pub endpoints_file: Option<PathBuf>,
    pub http: HttpClientConfig,
}

impl HarvestConfig {
    pub fn new(data_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            log_dir: PathBuf::from("logs"),
            base_url: base_url.into(),
            schedule: HarvestSchedule::default(),
            endpoints_file: None,
            http: HttpClientConfig::default(),
        }
    }

    pub fn from_env() -> Self {
        let defaults = HttpClientConfig::default();
        Self {
            data_dir: std::env::var("ECOH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            log_dir: std::env::var("ECOH_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("logs")),
            base_url: std::env::var("ECOH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            schedule: HarvestSchedule::from_settings(
                std::env::var("ECOH_SCHEDULE_CRON").ok(),
                std::env::var("ECOH_SCHEDULE_INTERVAL_SECS").ok().as_deref(),
            ),
            endpoints_file: std::env::var("ECOH_ENDPOINTS_FILE").ok().map(PathBuf::from),
            http: HttpClientConfig {
                timeout: std::env::var("ECOH_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.timeout),
                user_agent: std::env::var("ECOH_USER_AGENT")
                    .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
                max_attempts: std::env::var("ECOH_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(defaults.max_attempts),
                ..defaults
            },
        }
    }

    /// Operator-supplied registry if configured, otherwise the built-in one.
    pub fn load_registry(&self) -> Result<EndpointRegistry> {
        match &self.endpoints_file {
            Some(path) => EndpointRegistry::from_path(path),
            None => EndpointRegistry::builtin(),
        }
    }
}
