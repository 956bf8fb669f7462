use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::session::SessionTimings;
use crate::stats::{DEFAULT_SERIES_WINDOW, MIN_SERIES_POINTS};

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RECORD_LIMIT: u32 = 100;
const DEFAULT_REFRESH_SECS: u64 = 5;
const DEFAULT_STATUS_POLL_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    backend_url: Option<String>,
    request_timeout_ms: Option<u64>,
    record_limit: Option<u32>,
    refresh_secs: Option<u64>,
    status_poll_secs: Option<u64>,
    series_window: Option<usize>,
    session: Option<SessionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionConfigFile {
    starting_ms: Option<u64>,
    connecting_ms: Option<u64>,
    connected_ms: Option<u64>,
    dismiss_after_start_ms: Option<u64>,
    dismiss_after_stop_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub backend_url: String,
    pub request_timeout: Duration,
    pub record_limit: u32,
    pub refresh_interval: Duration,
    pub status_poll_interval: Duration,
    pub series_window: usize,
    pub session: SessionTimings,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_file(MonitorConfigFile::default())
    }
}

impl MonitorConfig {
    /// Reads `EPP_MONITOR_CONFIG` (JSON, or TOML by extension), applies
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EPP_MONITOR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Self {
        let defaults = SessionTimings::default();
        let session = file.session.unwrap_or_default();
        let ms_or = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        Self {
            backend_url: file
                .backend_url
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            request_timeout: Duration::from_millis(
                file.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            record_limit: file.record_limit.unwrap_or(DEFAULT_RECORD_LIMIT),
            refresh_interval: Duration::from_secs(
                file.refresh_secs.unwrap_or(DEFAULT_REFRESH_SECS),
            ),
            status_poll_interval: Duration::from_secs(
                file.status_poll_secs.unwrap_or(DEFAULT_STATUS_POLL_SECS),
            ),
            series_window: file.series_window.unwrap_or(DEFAULT_SERIES_WINDOW),
            session: SessionTimings {
                starting: ms_or(session.starting_ms, defaults.starting),
                connecting: ms_or(session.connecting_ms, defaults.connecting),
                connected: ms_or(session.connected_ms, defaults.connected),
                dismiss_after_start: ms_or(
                    session.dismiss_after_start_ms,
                    defaults.dismiss_after_start,
                ),
                dismiss_after_stop: ms_or(
                    session.dismiss_after_stop_ms,
                    defaults.dismiss_after_stop,
                ),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("EPP_BACKEND_URL") {
            if !url.trim().is_empty() {
                self.backend_url = url.trim().to_string();
            }
        }
        if let Ok(raw) = std::env::var("EPP_REQUEST_TIMEOUT_MS") {
            let ms: u64 = raw
                .parse()
                .map_err(|_| anyhow!("EPP_REQUEST_TIMEOUT_MS must be an integer number of milliseconds"))?;
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("EPP_RECORD_LIMIT") {
            self.record_limit = raw
                .parse()
                .map_err(|_| anyhow!("EPP_RECORD_LIMIT must be a positive integer"))?;
        }
        if let Ok(raw) = std::env::var("EPP_REFRESH_SECS") {
            let secs: u64 = raw
                .parse()
                .map_err(|_| anyhow!("EPP_REFRESH_SECS must be an integer number of seconds"))?;
            self.refresh_interval = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("EPP_STATUS_POLL_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                anyhow!("EPP_STATUS_POLL_SECS must be an integer number of seconds")
            })?;
            self.status_poll_interval = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.backend_url)
            .map_err(|e| anyhow!("invalid backend url '{}': {}", self.backend_url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("backend url must use http or https"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request timeout must be greater than zero"));
        }
        if self.record_limit == 0 {
            return Err(anyhow!("record limit must be greater than zero"));
        }
        if self.refresh_interval.is_zero() || self.status_poll_interval.is_zero() {
            return Err(anyhow!("polling intervals must be greater than zero"));
        }
        if self.series_window < MIN_SERIES_POINTS {
            return Err(anyhow!(
                "series window must hold at least {} points",
                MIN_SERIES_POINTS
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
