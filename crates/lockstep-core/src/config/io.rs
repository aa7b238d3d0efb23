//! YAML configuration I/O
//!
//! Works with any serde type: the engine's [`super::SyncConfig`] and the
//! simulator's scenario files both go through here.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Load configuration from a YAML file, falling back to defaults
///
/// A missing file is normal on first start. An unreadable or invalid file is
/// logged and replaced by `T::default()` so the engine always starts.
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    log::info!("load_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_config: Config file doesn't exist, using defaults");
        return T::default();
    }

    match read_config(path) {
        Ok(config) => {
            log::info!("load_config: Successfully loaded config from {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("load_config: {:#}, using defaults", e);
            T::default()
        }
    }
}

/// Read and parse a YAML file, reporting any failure
///
/// Use this when the file was named explicitly and silently falling back
/// would hide a mistake.
pub fn read_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse config: {:?}", path))
}

/// Save configuration to a YAML file
///
/// Creates parent directories if they don't exist.
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    log::info!("save_config: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("save_config: Config saved successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RampingMode, SyncConfig};

    #[test]
    fn test_load_nonexistent_returns_default() {
        let config: SyncConfig = load_config(Path::new("/nonexistent/path/sync.yaml"));
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.yaml");

        let config = SyncConfig {
            ramping: RampingMode::Stepping,
            internal_clock_bpm: 174.0,
            ..Default::default()
        };

        save_config(&config, &path).unwrap();
        let loaded: SyncConfig = load_config(&path);

        assert_eq!(loaded.ramping, RampingMode::Stepping);
        assert_eq!(loaded.internal_clock_bpm, 174.0);
    }

    #[test]
    fn test_invalid_file_falls_back_but_read_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "rate_range: [not, a, number]").unwrap();

        let config: SyncConfig = load_config(&path);
        assert_eq!(config, SyncConfig::default());

        let err = read_config::<SyncConfig>(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config"));
    }
}
