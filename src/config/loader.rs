// Configuration loader with environment variable substitution

use super::types::*;
use crate::session::topic;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<IngestConfig> {
        let config = Self::load_unvalidated(path)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Load without validation, for callers that layer overrides on top
    pub fn load_unvalidated<P: AsRef<Path>>(path: P) -> Result<IngestConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        Self::parse_unvalidated(&content)
    }

    /// Parse configuration text with environment variable substitution
    pub fn parse(content: &str) -> Result<IngestConfig> {
        let config = Self::parse_unvalidated(content)?;
        Self::validate(&config)?;
        Ok(config)
    }

    pub fn parse_unvalidated(content: &str) -> Result<IngestConfig> {
        let content = Self::substitute_env_vars(content)?;

        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${CLIENT_ID:-test-sensor} -> test-sensor (if CLIENT_ID not set)
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}")
            .context("Invalid substitution pattern")?;

        let substituted = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    // Keep original if no default and var not found
                    None => format!("${{{}}}", var_name),
                },
            }
        });

        Ok(substituted.into_owned())
    }

    /// Validate the whole configuration, as needed for an ingest run
    pub fn validate(config: &IngestConfig) -> Result<()> {
        Self::validate_mqtt(config)?;
        Self::validate_pipeline(config)?;
        Self::validate_storage(config)
    }

    /// Session settings and broker credentials
    pub fn validate_mqtt(config: &IngestConfig) -> Result<()> {
        let mqtt = &config.mqtt;

        if mqtt.client_id.is_empty() {
            bail!("mqtt.client_id cannot be empty");
        }

        if mqtt.keep_alive_seconds < 5 {
            bail!("mqtt.keep_alive_seconds must be >= 5");
        }

        if mqtt.request_capacity == 0 {
            bail!("mqtt.request_capacity must be > 0");
        }

        if mqtt.transport == TransportKind::Mqtt {
            if mqtt.endpoint.is_empty() {
                bail!("mqtt.endpoint is required for the mqtt transport");
            }
            for (name, path) in [("cert", &mqtt.cert), ("key", &mqtt.key), ("ca", &mqtt.ca)] {
                if path.is_none() {
                    bail!("mqtt.{} is required for the mqtt transport", name);
                }
            }
        }

        Ok(())
    }

    pub fn validate_pipeline(config: &IngestConfig) -> Result<()> {
        if !topic::is_valid_topic_name(&config.pipeline.topic) {
            bail!(
                "pipeline.topic '{}' must be a non-empty topic without wildcards",
                config.pipeline.topic
            );
        }

        if config.pipeline.publish_interval_ms == 0 {
            bail!("pipeline.publish_interval_ms must be > 0");
        }

        Ok(())
    }

    /// Storage and query sections; all the read-only commands need
    pub fn validate_storage(config: &IngestConfig) -> Result<()> {
        match config.storage.backend.as_str() {
            "sqlite" => {
                let sqlite = config.storage.sqlite.as_ref().with_context(|| {
                    "sqlite backend selected but sqlite config missing".to_string()
                })?;
                Self::validate_table(&sqlite.table)?;
            }
            "filesystem" => {
                let filesystem = config.storage.filesystem.as_ref().with_context(|| {
                    "filesystem backend selected but filesystem config missing".to_string()
                })?;
                Self::validate_table(&filesystem.table)?;
            }
            "memory" => {}
            unknown => bail!(
                "Unknown backend: '{}'. Supported: sqlite, filesystem, memory",
                unknown
            ),
        }

        if config.query.page_size == 0 {
            bail!("query.page_size must be > 0");
        }

        Ok(())
    }

    fn validate_table(table: &str) -> Result<()> {
        if !is_plain_identifier(table) {
            bail!("storage table '{}' must be a plain identifier", table);
        }
        Ok(())
    }
}

/// Letters, digits and underscores, not starting with a digit
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
