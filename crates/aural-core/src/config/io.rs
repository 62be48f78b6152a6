//! Generic configuration I/O utilities
//!
//! YAML loading and saving for any serializable configuration type.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Load configuration from a YAML file
///
/// A missing file yields the default config. An unreadable or invalid file
/// logs a warning and also yields the default.
///
/// ```ignore
/// let config: EngineConfig = load_config(Path::new("engine.yaml"));
/// ```
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    log::info!("load_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_config: Config file doesn't exist, using defaults");
        return T::default();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            log::warn!("load_config: Failed to read config file: {}, using defaults", e);
            return T::default();
        }
    };
    match serde_yaml::from_str::<T>(&contents) {
        Ok(config) => {
            log::info!("load_config: Loaded config from {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("load_config: Failed to parse config: {}, using defaults", e);
            T::default()
        }
    }
}

/// Save configuration to a YAML file, creating parent directories
///
/// ```ignore
/// save_config(&config, Path::new("engine.yaml"))?;
/// ```
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
    std::fs::write(path, yaml).with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("save_config: Config saved");
    Ok(())
}
