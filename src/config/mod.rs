// Configuration module for sensor-ingest
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use types::*;
pub use loader::{is_plain_identifier, ConfigLoader};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<IngestConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<IngestConfig> {
    let config = read_config_with_env(path)?;
    ConfigLoader::validate(&config)?;
    Ok(config)
}

/// Same as `load_config_with_env` but leaves validation to the caller,
/// which may still layer command-line overrides on top
pub fn read_config_with_env<P: AsRef<Path>>(path: P) -> Result<IngestConfig> {
    let mut config = ConfigLoader::load_unvalidated(path).context("Failed to load configuration")?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Allow environment variables to override config values
pub fn apply_env_overrides(config: &mut IngestConfig) {
    if let Ok(endpoint) = std::env::var("MQTT_ENDPOINT") {
        config.mqtt.endpoint = endpoint;
    }

    if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
        config.mqtt.client_id = client_id;
    }

    if let Ok(db_path) = std::env::var("SENSOR_DB_PATH") {
        if let Some(sqlite) = config.storage.sqlite.as_mut() {
            sqlite.path = PathBuf::from(db_path);
        }
    }
}
