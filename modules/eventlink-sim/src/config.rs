use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use eventlink_bridge::BridgeConfig;
use serde::Deserialize;

/// The `[sim]` table: what the fake transport looks like.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimConfig {
    /// Device ids to attach.
    pub devices: Vec<String>,
    /// Devices that reject every write.
    pub read_only: Vec<String>,
    /// Interval between readings for devices with notifications on.
    pub tick_ms: u64,
    /// How many readings to stream from the first device.
    pub readings: usize,
    /// Delay before a write completion is reported.
    pub write_latency_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            devices: vec!["thermo-1".to_string(), "thermo-2".to_string()],
            read_only: vec!["thermo-2".to_string()],
            tick_ms: 200,
            readings: 5,
            write_latency_ms: 50,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SimFile {
    #[serde(default)]
    sim: SimConfig,
}

fn parse_sim(content: &str) -> Result<SimConfig> {
    let file: SimFile = toml::from_str(content).context("Failed to parse [sim] config")?;
    Ok(file.sim)
}

fn load_file(path: &Path) -> Result<(BridgeConfig, SimConfig)> {
    let bridge = eventlink_bridge::config::load_config(path)?;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let sim = parse_sim(&content).with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok((bridge, sim))
}

/// Bridge settings come from the environment unless `EVENTLINK_CONFIG`
/// points at a TOML file, in which case its `[bridge]` and `[sim]` tables are
/// used and the bridge env vars are not read at all.
pub fn load() -> Result<(BridgeConfig, SimConfig)> {
    dotenvy::dotenv().ok();
    let path = std::env::var("EVENTLINK_CONFIG").ok().map(PathBuf::from);
    resolve(path, |key| std::env::var(key).ok())
}

fn resolve(
    path: Option<PathBuf>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(BridgeConfig, SimConfig)> {
    match path {
        Some(path) => load_file(&path),
        None => Ok((BridgeConfig::from_lookup(lookup)?, SimConfig::default())),
    }
}
