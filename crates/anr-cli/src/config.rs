//! TOML config files.

use anr_monitor::DetectorConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Reads and validates a detector config file.
///
/// Fields the file leaves out keep their defaults.
pub fn load(path: &Path) -> Result<DetectorConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: DetectorConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Loads `path` if given, otherwise the defaults, then applies flag
/// overrides.
pub fn resolve(path: Option<&Path>, threshold_ms: Option<u64>) -> Result<DetectorConfig> {
    let mut config = match path {
        Some(path) => load(path)?,
        None => DetectorConfig::default(),
    };
    if let Some(threshold_ms) = threshold_ms {
        config = config.with_threshold_ms(threshold_ms);
        config.validate().context("invalid --threshold")?;
    }
    Ok(config)
}

/// The default config rendered as TOML.
pub fn defaults_toml() -> Result<String> {
    toml::to_string_pretty(&DetectorConfig::default()).context("failed to render defaults")
}
