use anyhow::Context;
use ops_tracker::TrackerConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub(crate) const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7655";
pub(crate) const API_TOKEN_ENV: &str = "PULSE_OPS_API_TOKEN";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct OpsConfig {
    pub(crate) server: ServerConfig,
    pub(crate) tracker: TrackerSection,
    pub(crate) http: HttpSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub(crate) struct ServerConfig {
    pub(crate) base_url: String,
    pub(crate) ws_url: Option<String>,
    pub(crate) api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub(crate) struct TrackerSection {
    pub(crate) reconcile_delay_ms: u64,
    pub(crate) timeout_threshold_secs: u64,
    pub(crate) tick_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub(crate) struct HttpSection {
    pub(crate) connect_timeout_ms: u64,
    pub(crate) io_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: None,
            api_token: None,
        }
    }
}

impl Default for TrackerSection {
    fn default() -> Self {
        let defaults = TrackerConfig::default();
        Self {
            reconcile_delay_ms: defaults.reconcile_delay.as_millis() as u64,
            timeout_threshold_secs: defaults.timeout_threshold.as_secs(),
            tick_interval_ms: defaults.tick_interval.as_millis() as u64,
        }
    }
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            io_timeout_ms: 30_000,
        }
    }
}

impl ServerConfig {
    /// Push endpoint, derived from the base url unless configured.
    pub(crate) fn ws_url(&self) -> anyhow::Result<String> {
        if let Some(url) = self.ws_url.as_ref().filter(|url| !url.trim().is_empty()) {
            return Ok(url.clone());
        }
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            anyhow::bail!("base_url must start with http:// or https://: {base}");
        };
        Ok(format!("{ws_base}/ws"))
    }
}

impl OpsConfig {
    pub(crate) fn tracker_config(&self) -> anyhow::Result<TrackerConfig> {
        if self.tracker.tick_interval_ms == 0 {
            anyhow::bail!("tracker.tick_interval_ms must be greater than zero");
        }
        Ok(TrackerConfig {
            reconcile_delay: Duration::from_millis(self.tracker.reconcile_delay_ms),
            timeout_threshold: Duration::from_secs(self.tracker.timeout_threshold_secs),
            tick_interval: Duration::from_millis(self.tracker.tick_interval_ms),
        })
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.http.connect_timeout_ms)
    }

    pub(crate) fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.http.io_timeout_ms)
    }

    fn apply_token_override(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|token| !token.trim().is_empty()) {
            self.server.api_token = Some(token);
        }
    }
}

pub(crate) fn parse_ops_config(raw: &str) -> anyhow::Result<OpsConfig> {
    let config: OpsConfig = toml::from_str(raw)?;
    if config.server.base_url.trim().is_empty() {
        anyhow::bail!("server.base_url is empty");
    }
    Ok(config)
}

/// Missing file means defaults; an unreadable or invalid file is an error.
pub(crate) fn load_ops_config(path: &Path) -> anyhow::Result<OpsConfig> {
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        parse_ops_config(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        tracing::debug!(config = %path.display(), "config file not found, using defaults");
        OpsConfig::default()
    };
    config.apply_token_override(std::env::var(API_TOKEN_ENV).ok());
    Ok(config)
}
