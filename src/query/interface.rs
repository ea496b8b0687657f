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

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use zenoh::query::Query;
use zenoh::Session;

use super::service::QueryService;
use crate::config::QueryInterfaceConfig;
use crate::protocol::QueryResponse;

/// A request addressed to the query interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRequest {
    Latest,
    /// Trailing window in seconds
    Window(u64),
}

/// Parse `{prefix}/latest`, `{prefix}/window` or `{prefix}/window/{seconds}`
pub fn parse_request(key: &str, prefix: &str, default_window: u64) -> Result<QueryRequest, String> {
    let path = key
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| format!("Key '{}' is outside '{}'", key, prefix))?;

    match path.split('/').collect::<Vec<_>>().as_slice() {
        ["latest"] => Ok(QueryRequest::Latest),
        ["window"] => Ok(QueryRequest::Window(default_window)),
        ["window", seconds] => seconds
            .parse()
            .map(QueryRequest::Window)
            .map_err(|_| format!("Invalid window '{}': expected seconds", seconds)),
        _ => Err(format!("Unknown query '{}'", path)),
    }
}

/// Query interface serving the query service over Zenoh queryables
pub struct QueryInterface {
    session: Session,
    service: Arc<QueryService>,
    key_prefix: String,
    default_window: u64,
}

impl QueryInterface {
    /// Open a Zenoh session for the interface
    pub async fn open(
        config: &QueryInterfaceConfig,
        service: Arc<QueryService>,
        default_window: u64,
    ) -> Result<Self> {
        let mut zenoh_config = zenoh::Config::default();
        zenoh_config
            .insert_json5("mode", &format!("\"{}\"", config.zenoh.mode))
            .map_err(|e| anyhow::anyhow!("Invalid zenoh mode: {}", e))?;

        if !config.zenoh.connect.is_empty() {
            let endpoints = serde_json::to_string(&config.zenoh.connect)
                .context("Failed to encode connect endpoints")?;
            zenoh_config
                .insert_json5("connect/endpoints", &endpoints)
                .map_err(|e| anyhow::anyhow!("Invalid connect endpoints: {}", e))?;
        }

        if !config.zenoh.listen.is_empty() {
            let endpoints = serde_json::to_string(&config.zenoh.listen)
                .context("Failed to encode listen endpoints")?;
            zenoh_config
                .insert_json5("listen/endpoints", &endpoints)
                .map_err(|e| anyhow::anyhow!("Invalid listen endpoints: {}", e))?;
        }

        let session = zenoh::open(zenoh_config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open Zenoh session: {}", e))?;

        Ok(Self {
            session,
            service,
            key_prefix: config.key_prefix.trim_end_matches('/').to_string(),
            default_window,
        })
    }

    /// Run the query interface (blocks until the task is dropped)
    pub async fn run(&self) -> Result<()> {
        let key = format!("{}/**", self.key_prefix);
        let queryable = self
            .session
            .declare_queryable(&key)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        info!("Query interface listening on '{}'", key);

        // Handle queries in parallel
        loop {
            match queryable.recv_async().await {
                Ok(query) => {
                    let service = self.service.clone();
                    let prefix = self.key_prefix.clone();
                    let default_window = self.default_window;
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_query(query, service, &prefix, default_window).await
                        {
                            error!("Error handling query: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Query receive error: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_query(
        query: Query,
        service: Arc<QueryService>,
        prefix: &str,
        default_window: u64,
    ) -> Result<()> {
        info!("Received query on '{}'", query.key_expr());

        let response = match parse_request(query.key_expr().as_str(), prefix, default_window) {
            Ok(QueryRequest::Latest) => match service.get_latest().await {
                Ok(record) => QueryResponse::success(record.into_iter().collect()),
                Err(e) => QueryResponse::error(e.to_string()),
            },
            Ok(QueryRequest::Window(seconds)) => match service.get_last_n_seconds(seconds).await {
                Ok(records) => QueryResponse::success(records),
                Err(e) => QueryResponse::error(e.to_string()),
            },
            Err(message) => QueryResponse::error(message),
        };

        // Send response
        let response_bytes = serde_json::to_vec(&response)?;
        query
            .reply(query.key_expr(), response_bytes)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "telemetry/query";

    #[test]
    fn test_parse_latest() {
        assert_eq!(
            parse_request("telemetry/query/latest", PREFIX, 60),
            Ok(QueryRequest::Latest)
        );
    }

    #[test]
    fn test_parse_window() {
        assert_eq!(
            parse_request("telemetry/query/window/300", PREFIX, 60),
            Ok(QueryRequest::Window(300))
        );
        assert_eq!(
            parse_request("telemetry/query/window", PREFIX, 60),
            Ok(QueryRequest::Window(60))
        );
    }

    #[test]
    fn test_parse_rejects_bad_requests() {
        assert!(parse_request("telemetry/query/window/abc", PREFIX, 60).is_err());
        assert!(parse_request("telemetry/query/oldest", PREFIX, 60).is_err());
        assert!(parse_request("other/latest", PREFIX, 60).is_err());
        assert!(parse_request("telemetry/querylatest", PREFIX, 60).is_err());
    }
}
