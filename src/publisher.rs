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

// Publish loop: one reading per interval at QoS 1

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::PipelineSettings;
use crate::generator::ReadingSource;
use crate::session::{QoS, SessionHandle};

pub struct PublishLoop<S> {
    session: SessionHandle,
    source: S,
    topic: String,
    /// 0 publishes until the task is dropped
    count: u64,
    interval: Duration,
}

impl<S: ReadingSource> PublishLoop<S> {
    pub fn new(session: SessionHandle, source: S, settings: &PipelineSettings) -> Self {
        Self {
            session,
            source,
            topic: settings.topic.clone(),
            count: settings.count,
            interval: settings.publish_interval(),
        }
    }

    /// Publish until `count` messages are out; returns the number sent
    ///
    /// Acknowledgments are tracked on their own tasks and only logged, so a
    /// slow broker never delays the cadence.
    pub async fn run(mut self) -> Result<u64> {
        let mut sent = 0u64;

        while self.count == 0 || sent < self.count {
            let reading = self.source.next_reading();
            let payload = codec::encode_reading(&reading).context("Failed to encode reading")?;

            let seq = sent + 1;
            info!(topic = %self.topic, seq, "Publishing message");
            let ack = self
                .session
                .publish(&self.topic, QoS::AtLeastOnce, payload)
                .await
                .context("Session closed while publishing")?;
            sent = seq;

            tokio::spawn(async move {
                match ack.await {
                    Ok(()) => debug!(seq, "Publish acknowledged"),
                    Err(e) => warn!(seq, "Publish not acknowledged: {}", e),
                }
            });

            tokio::time::sleep(self.interval).await;
        }

        info!(sent, "Publish loop finished");
        Ok(sent)
    }
}
