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

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sensor_ingest::config::{
    read_config_with_env, ConfigLoader, IngestConfig, LoggingConfig, ProxyConfig,
};
use sensor_ingest::protocol::QueryResponse;
use sensor_ingest::{pipeline, BackendFactory, QueryService};

/// Sensor Ingest - Publish environmental readings over MQTT and persist them
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish readings and store everything received (default)
    Run(RunArgs),
    /// Print the most recently received record
    Latest,
    /// Print records received within a trailing window
    Window {
        /// Window length in seconds (defaults to query.default_window_seconds)
        #[arg(short, long)]
        seconds: Option<u64>,
    },
}

/// Overrides for the config file
#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Broker endpoint
    #[arg(long)]
    endpoint: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// MQTT client id
    #[arg(long)]
    client_id: Option<String>,

    /// Client certificate (PEM)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA bundle (PEM)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Topic to publish and subscribe on
    #[arg(long)]
    topic: Option<String>,

    /// Number of messages to send and wait for (0 = until Ctrl+C)
    #[arg(long)]
    count: Option<u64>,

    /// HTTP proxy host
    #[arg(long, requires = "proxy_port")]
    proxy_host: Option<String>,

    /// HTTP proxy port
    #[arg(long, requires = "proxy_host")]
    proxy_port: Option<u16>,
}

impl RunArgs {
    fn apply(self, config: &mut IngestConfig) {
        let mqtt = &mut config.mqtt;
        if let Some(endpoint) = self.endpoint {
            mqtt.endpoint = endpoint;
        }
        if let Some(port) = self.port {
            mqtt.port = port;
        }
        if let Some(client_id) = self.client_id {
            mqtt.client_id = client_id;
        }
        if let Some(cert) = self.cert {
            mqtt.cert = Some(cert);
        }
        if let Some(key) = self.key {
            mqtt.key = Some(key);
        }
        if let Some(ca) = self.ca {
            mqtt.ca = Some(ca);
        }
        if let (Some(host), Some(port)) = (self.proxy_host, self.proxy_port) {
            mqtt.proxy = Some(ProxyConfig { host, port });
        }
        if let Some(topic) = self.topic {
            config.pipeline.topic = topic;
        }
        if let Some(count) = self.count {
            config.pipeline.count = count;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("Invalid log level '{}'", logging.level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    }
    .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file; each command validates what it uses
    let mut config = read_config_with_env(&args.config)?;

    match args.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(overrides) => {
            // Apply CLI overrides
            overrides.apply(&mut config);
            ConfigLoader::validate(&config)?;

            init_tracing(&config.logging)?;
            info!("Starting Sensor Ingest");
            info!("Loaded configuration from: {:?}", args.config);
            info!("Storage backend: {}", config.storage.backend);

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
                info!("Received Ctrl+C, shutting down");
            };

            pipeline::run(&config, shutdown).await?;
            info!("Sensor Ingest shut down successfully");
        }
        Command::Latest => {
            ConfigLoader::validate_storage(&config)?;
            init_tracing(&config.logging)?;
            let service = query_service(&config).await?;
            let latest = service.get_latest().await?;
            print_response(&QueryResponse::success(latest.into_iter().collect()))?;
        }
        Command::Window { seconds } => {
            ConfigLoader::validate_storage(&config)?;
            init_tracing(&config.logging)?;
            let service = query_service(&config).await?;
            let seconds = seconds.unwrap_or(config.query.default_window_seconds);
            let records = service.get_last_n_seconds(seconds).await?;
            print_response(&QueryResponse::success(records))?;
        }
    }

    Ok(())
}

async fn query_service(config: &IngestConfig) -> Result<QueryService> {
    let store = BackendFactory::create(&config.storage)?;
    store
        .initialize()
        .await
        .context("Failed to initialize storage backend")?;
    Ok(QueryService::new(store, config.query.page_size))
}

fn print_response(response: &QueryResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
