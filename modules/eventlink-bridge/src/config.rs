use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STREAM_BUFFER_WARN: usize = 1024;

/// Bridge tuning. Loaded from environment variables, or from the `[bridge]`
/// table of a TOML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Default deadline for requests. `None` waits until an event, a
    /// disconnect, or cancellation.
    pub request_timeout: Option<Duration>,

    /// Warn once a stream has this many values buffered and unconsumed.
    pub stream_buffer_warn: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            stream_buffer_warn: DEFAULT_STREAM_BUFFER_WARN,
        }
    }
}

impl BridgeConfig {
    /// Env vars:
    /// - `EVENTLINK_REQUEST_TIMEOUT_MS`: default request deadline; `0` disables it
    /// - `EVENTLINK_STREAM_BUFFER_WARN`: buffered-value warning threshold
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("EVENTLINK_REQUEST_TIMEOUT_MS") {
            let ms = parse_env::<u64>("EVENTLINK_REQUEST_TIMEOUT_MS", &raw)?;
            config.request_timeout = timeout_from_ms(ms);
        }
        if let Some(raw) = lookup("EVENTLINK_STREAM_BUFFER_WARN") {
            config.stream_buffer_warn = parse_env("EVENTLINK_STREAM_BUFFER_WARN", &raw)?;
        }

        Ok(config)
    }

    pub fn log_summary(&self) {
        match self.request_timeout {
            Some(timeout) => tracing::info!("  request_timeout: {}ms", timeout.as_millis()),
            None => tracing::info!("  request_timeout: <none>"),
        }
        tracing::info!("  stream_buffer_warn: {}", self.stream_buffer_warn);
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn timeout_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

// ---------------------------------------------------------------------------
// TOML
// ---------------------------------------------------------------------------

/// The `[bridge]` table. Missing keys fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeFileConfig {
    pub request_timeout_ms: Option<u64>,
    pub stream_buffer_warn: Option<usize>,
}

impl BridgeFileConfig {
    pub fn into_config(self) -> BridgeConfig {
        let defaults = BridgeConfig::default();
        BridgeConfig {
            request_timeout: match self.request_timeout_ms {
                Some(ms) => timeout_from_ms(ms),
                None => defaults.request_timeout,
            },
            stream_buffer_warn: self.stream_buffer_warn.unwrap_or(defaults.stream_buffer_warn),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BridgeFile {
    #[serde(default)]
    bridge: BridgeFileConfig,
}

/// Parse the `[bridge]` table out of a TOML document. Other tables are ignored.
pub fn parse_config(content: &str) -> Result<BridgeConfig> {
    let file: BridgeFile = toml::from_str(content).context("Failed to parse [bridge] config")?;
    Ok(file.bridge.into_config())
}

/// Load and parse the `[bridge]` table of a TOML config file.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}
