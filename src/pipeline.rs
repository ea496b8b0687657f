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

//! End-to-end run: connect, subscribe, publish, wait for every message to
//! be stored, disconnect.
//!
//! A fatal session notification at any point aborts the run with an error.
//! The shutdown future (Ctrl+C in the binary) ends the run early with a
//! clean disconnect.

use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{IngestConfig, TransportKind};
use crate::generator::RandomReadingSource;
use crate::publisher::PublishLoop;
use crate::query::{QueryInterface, QueryService};
use crate::receiver::{ReceiveHandler, ReceiveStats};
use crate::session::{
    LoopbackOptions, LoopbackTransport, MqttTransport, QoS, Session, SessionHandle,
    SessionOptions, Transport,
};
use crate::storage::{BackendFactory, RecordStore};

/// Run the pipeline with the transport and storage named in `config`
pub async fn run<F>(config: &IngestConfig, shutdown: F) -> Result<ReceiveStats>
where
    F: Future<Output = ()>,
{
    let store = BackendFactory::create(&config.storage)?;
    store
        .initialize()
        .await
        .context("Failed to initialize storage backend")?;
    info!("Storage backend initialized: {}", store.backend_type());

    let query_task = spawn_query_interface(config, store.clone()).await?;

    let result = match config.mqtt.transport {
        TransportKind::Mqtt => {
            let transport = MqttTransport::new(&config.mqtt)?;
            run_with_transport(config, transport, store, shutdown).await
        }
        TransportKind::Loopback => {
            info!("Using in-process loopback broker");
            let (transport, _control) = LoopbackTransport::new(LoopbackOptions {
                persist_session: !config.mqtt.clean_session,
                ..Default::default()
            });
            run_with_transport(config, transport, store, shutdown).await
        }
    };

    if let Some(task) = query_task {
        task.abort();
    }
    result
}

/// Run the pipeline over an already built transport
pub async fn run_with_transport<T, F>(
    config: &IngestConfig,
    transport: T,
    store: Arc<dyn RecordStore>,
    shutdown: F,
) -> Result<ReceiveStats>
where
    T: Transport + 'static,
    F: Future<Output = ()>,
{
    let settings = &config.pipeline;
    let (session, mut events) = Session::start(transport, SessionOptions::from(&config.mqtt));
    tokio::pin!(shutdown);

    info!("Connecting as '{}'", config.mqtt.client_id);
    let connected = tokio::select! {
        result = session.connect() => Some(result),
        _ = &mut shutdown => None,
    };
    let Some(connected) = connected else {
        info!("Shutdown requested before connecting");
        return Ok(ReceiveStats::default());
    };
    let session_present = connected.context("Failed to connect to broker")?;
    info!(session_present, "Connected");

    let handler = Arc::new(ReceiveHandler::new(store, settings.count));
    let subscribed = tokio::select! {
        result = session.subscribe(&settings.topic, QoS::AtLeastOnce, handler.clone()) => Some(result),
        _ = &mut shutdown => None,
    };
    let Some(subscribed) = subscribed else {
        info!("Shutdown requested before subscribing");
        disconnect(&session).await;
        return Ok(handler.stats());
    };
    let granted = subscribed.with_context(|| format!("Failed to subscribe to '{}'", settings.topic))?;
    info!(topic = %settings.topic, ?granted, "Subscribed");

    let publisher = PublishLoop::new(session.clone(), RandomReadingSource::from_entropy(), settings);
    let work = async {
        let sent = publisher.run().await?;
        info!(sent, target = handler.target(), "Waiting for all messages to be received");
        handler.wait_complete().await;
        Ok::<_, anyhow::Error>(())
    };

    // Fatal first: once the driver stops, the publisher fails too
    let outcome = tokio::select! {
        biased;
        fatal = events.fatal() => Err(match fatal {
            Some(e) => anyhow::Error::new(e).context("Fatal session error"),
            None => anyhow!("Session ended unexpectedly"),
        }),
        _ = &mut shutdown => {
            info!("Shutdown requested");
            Ok(())
        }
        result = work => result,
    };

    if let Err(e) = outcome {
        error!("{:#}", e);
        return Err(e);
    }

    disconnect(&session).await;

    let stats = handler.stats();
    info!(
        received = stats.received,
        stored = stats.stored,
        storage_failures = stats.storage_failures,
        decode_failures = stats.decode_failures,
        "Run finished"
    );
    Ok(stats)
}

async fn disconnect(session: &SessionHandle) {
    info!("Disconnecting");
    if let Err(e) = session.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
}

async fn spawn_query_interface(
    config: &IngestConfig,
    store: Arc<dyn RecordStore>,
) -> Result<Option<JoinHandle<()>>> {
    let Some(interface_config) = config.query.interface.as_ref().filter(|c| c.enabled) else {
        return Ok(None);
    };

    let service = Arc::new(QueryService::new(store, config.query.page_size));
    let interface = QueryInterface::open(
        interface_config,
        service,
        config.query.default_window_seconds,
    )
    .await?;

    Ok(Some(tokio::spawn(async move {
        if let Err(e) = interface.run().await {
            error!("Query interface error: {}", e);
        }
    })))
}
