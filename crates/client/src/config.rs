//! Client configuration loaded from `TILLSYNC_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tillsync_observability::LogFormat;

use crate::connectivity::ConnectivityConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("could not resolve a data directory; set TILLSYNC_DATA_DIR")]
    NoDataDir,
}

/// Everything the headless client needs to run.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub auth_token: Option<String>,
    pub data_dir: PathBuf,
    pub connectivity: ConnectivityConfig,
    pub drain_interval: Duration,
    pub remote_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_pending: Option<usize>,
    pub retention: chrono::Duration,
    pub cache_generation: String,
    pub shell_urls: Vec<String>,
    pub log_format: LogFormat,
}

impl ClientConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_url: "http://localhost:8080".to_string(),
            auth_token: None,
            data_dir: data_dir.into(),
            connectivity: ConnectivityConfig::default(),
            drain_interval: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(8),
            retry: RetryPolicy::default(),
            max_pending: None,
            retention: chrono::Duration::days(7),
            cache_generation: concat!("tillsync-", env!("CARGO_PKG_VERSION")).to_string(),
            shell_urls: Vec::new(),
            log_format: LogFormat::Json,
        }
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup("TILLSYNC_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let mut config = Self::with_data_dir(data_dir);

        if let Some(url) = lookup("TILLSYNC_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        config.auth_token = lookup("TILLSYNC_AUTH_TOKEN").filter(|t| !t.is_empty());

        if let Some(secs) = parse_var::<u64, _>(&lookup, "TILLSYNC_PROBE_INTERVAL_SECS")? {
            config.connectivity.probe_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "TILLSYNC_DEBOUNCE_MS")? {
            config.connectivity.debounce = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "TILLSYNC_RECOVERY_PROBES")? {
            if n == 0 {
                return Err(invalid("TILLSYNC_RECOVERY_PROBES", "0", "must be at least 1"));
            }
            config.connectivity.recovery_probes = n;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "TILLSYNC_DRAIN_INTERVAL_SECS")? {
            config.drain_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "TILLSYNC_REMOTE_TIMEOUT_SECS")? {
            config.remote_timeout = Duration::from_secs(secs.max(1));
            config.connectivity.probe_timeout = config.remote_timeout;
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "TILLSYNC_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        config.max_pending = parse_var::<usize, _>(&lookup, "TILLSYNC_MAX_PENDING")?;
        if let Some(days) = parse_var::<i64, _>(&lookup, "TILLSYNC_RETENTION_DAYS")? {
            config.retention = chrono::Duration::days(days);
        }
        if let Some(generation) = lookup("TILLSYNC_CACHE_GENERATION").filter(|g| !g.is_empty()) {
            config.cache_generation = generation;
        }
        if let Some(urls) = lookup("TILLSYNC_SHELL_URLS") {
            config.shell_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(format) = lookup("TILLSYNC_LOG_FORMAT") {
            config.log_format = format
                .parse()
                .map_err(|reason| invalid("TILLSYNC_LOG_FORMAT", &format, reason))?;
        }

        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.db")
    }

    pub fn asset_cache_path(&self) -> PathBuf {
        self.data_dir.join("assets.db")
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.api_url)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// `{os data dir}/tillsync`, falling back to `~/.local/share/tillsync`.
fn default_data_dir() -> Result<PathBuf, ConfigError> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .ok_or(ConfigError::NoDataDir)?;
    Ok(base.join("tillsync"))
}
