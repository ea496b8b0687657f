// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Configuration types for sensor-ingest

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which transport carries the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Mqtt,
    /// In-process broker, for offline runs
    Loopback,
}

/// MQTT session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub transport: TransportKind,

    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Client certificate (PEM)
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[serde(default)]
    pub key: Option<PathBuf>,

    /// CA bundle (PEM)
    #[serde(default)]
    pub ca: Option<PathBuf>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,

    /// false asks the broker to keep subscriptions across reconnects
    #[serde(default)]
    pub clean_session: bool,

    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    /// Capacity of the outgoing request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_seconds: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            endpoint: String::new(),
            port: default_port(),
            client_id: default_client_id(),
            cert: None,
            key: None,
            ca: None,
            keep_alive_seconds: default_keep_alive(),
            clean_session: false,
            proxy: None,
            request_capacity: default_request_capacity(),
            reconnect: ReconnectPolicy::default(),
            disconnect_timeout_seconds: default_disconnect_timeout(),
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_seconds)
    }
}

/// HTTP CONNECT proxy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// Backoff between reconnect attempts after an interruption
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_reconnect_initial")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub max_delay_seconds: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial(),
            max_delay_seconds: default_reconnect_max(),
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_seconds)
    }
}

/// Publish/receive pipeline settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineSettings {
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Messages to publish and wait for; 0 runs until interrupted
    #[serde(default = "default_count")]
    pub count: u64,

    #[serde(default = "default_publish_interval")]
    pub publish_interval_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            count: default_count(),
            publish_interval_ms: default_publish_interval(),
        }
    }
}

impl PipelineSettings {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}

/// Storage configuration with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend type: "sqlite", "filesystem", "memory"
    pub backend: String,

    #[serde(default)]
    pub sqlite: Option<SqliteConfig>,

    #[serde(default)]
    pub filesystem: Option<FilesystemConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            sqlite: Some(SqliteConfig::default()),
            filesystem: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SqliteConfig {
    pub path: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/sensor_data.db"),
            table: default_table(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesystemConfig {
    pub base_path: PathBuf,
    #[serde(default = "default_table")]
    pub table: String,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data/records"),
            table: default_table(),
        }
    }
}

/// Query surface settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Records fetched per scan page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Window used by `window` when no duration is given
    #[serde(default = "default_window")]
    pub default_window_seconds: u64,

    #[serde(default)]
    pub interface: Option<QueryInterfaceConfig>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            default_window_seconds: default_window(),
            interface: None,
        }
    }
}

/// Network query interface served over Zenoh
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryInterfaceConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub zenoh: ZenohConfig,
}

/// Zenoh configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZenohConfig {
    #[serde(default = "default_mode")]
    pub mode: String, // "peer", "client", or "router"

    #[serde(default)]
    pub connect: Vec<String>,

    #[serde(default)]
    pub listen: Vec<String>,
}

impl Default for ZenohConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            connect: Vec::new(),
            listen: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_port() -> u16 { 8883 }
fn default_client_id() -> String { "test-sensor".to_string() }
fn default_keep_alive() -> u64 { 120 }
fn default_request_capacity() -> usize { 100 }
fn default_disconnect_timeout() -> u64 { 10 }
fn default_reconnect_initial() -> u64 { 100 }
fn default_reconnect_max() -> u64 { 30 }
fn default_topic() -> String { "sensors/env".to_string() }
fn default_count() -> u64 { 10 }
fn default_publish_interval() -> u64 { 1000 }
fn default_table() -> String { "SensorData".to_string() }
fn default_page_size() -> usize { 100 }
fn default_window() -> u64 { 5 * 60 * 60 }
fn default_key_prefix() -> String { "telemetry/query".to_string() }
fn default_mode() -> String { "peer".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
