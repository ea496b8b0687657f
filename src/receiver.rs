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

//! Receive handler
//!
//! Decodes each inbound message, persists it and advances the completion
//! counter. Malformed payloads are dropped without counting. A failed write
//! is logged and still counts, so the run completes even when storage is
//! flaky. There is no retry queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::session::{InboundMessage, MessageHandler};
use crate::storage::RecordStore;

/// Counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiveStats {
    /// Messages that decoded and advanced the completion counter
    pub received: u64,
    pub stored: u64,
    pub storage_failures: u64,
    pub decode_failures: u64,
}

pub struct ReceiveHandler {
    store: Arc<dyn RecordStore>,
    target: u64,
    received: AtomicU64,
    stored: AtomicU64,
    storage_failures: AtomicU64,
    decode_failures: AtomicU64,
    complete: watch::Sender<bool>,
}

impl ReceiveHandler {
    /// `target` of 0 never completes
    pub fn new(store: Arc<dyn RecordStore>, target: u64) -> Self {
        let (complete, _) = watch::channel(false);
        Self {
            store,
            target,
            received: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            storage_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            complete,
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    /// Resolve once the target count has been reached
    pub async fn wait_complete(&self) {
        let mut rx = self.complete.subscribe();
        // The sender lives in self, so this only ends on completion
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn stats(&self) -> ReceiveStats {
        ReceiveStats {
            received: self.received.load(Ordering::Acquire),
            stored: self.stored.load(Ordering::Acquire),
            storage_failures: self.storage_failures.load(Ordering::Acquire),
            decode_failures: self.decode_failures.load(Ordering::Acquire),
        }
    }

    /// Decode, persist and count one payload
    pub async fn handle(&self, topic: &str, payload: &[u8]) {
        let reading = match codec::decode_reading(payload) {
            Ok(reading) => reading,
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::AcqRel);
                warn!(topic, "Dropping undecodable message: {}", e);
                return;
            }
        };

        match self.store.write(&reading).await {
            Ok(record) => {
                self.stored.fetch_add(1, Ordering::AcqRel);
                debug!(topic, id = %record.id, "Reading stored");
            }
            Err(e) => {
                self.storage_failures.fetch_add(1, Ordering::AcqRel);
                error!(topic, "Failed to store reading: {}", e);
            }
        }

        // Increment and compare in one step; exactly one caller sees the target
        let count = self.received.fetch_add(1, Ordering::AcqRel) + 1;
        info!(topic, count, "Received message");
        if self.target > 0 && count == self.target {
            info!(count, "All expected messages received");
            self.complete.send_replace(true);
        }
    }
}

#[async_trait]
impl MessageHandler for ReceiveHandler {
    async fn on_message(&self, message: InboundMessage) {
        if message.dup {
            debug!(topic = %message.topic, "Redelivered message");
        }
        self.handle(&message.topic, &message.payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_reading;
    use crate::generator::{RandomReadingSource, ReadingSource};
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn payload() -> Vec<u8> {
        let reading = RandomReadingSource::with_seed(7).next_reading();
        encode_reading(&reading).unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_completes_exactly_at_target() {
        let store = Arc::new(MemoryStore::new());
        let handler = ReceiveHandler::new(store.clone(), 2);

        handler.handle("sensors/env", &payload()).await;
        assert!(!handler.is_complete());
        handler.handle("sensors/env", &payload()).await;
        assert!(handler.is_complete());

        tokio::time::timeout(Duration::from_secs(1), handler.wait_complete())
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_decode_failure_is_not_counted() {
        let store = Arc::new(MemoryStore::new());
        let handler = ReceiveHandler::new(store.clone(), 1);

        handler.handle("sensors/env", b"not json").await;
        handler
            .handle(
                "sensors/env",
                br#"{"temperature":99.0,"humidity":50.0,"co2":400.0,"timestamp":"2024-01-01T00:00:00"}"#,
            )
            .await;

        let stats = handler.stats();
        assert_eq!(stats.decode_failures, 2);
        assert_eq!(stats.received, 0);
        assert!(!handler.is_complete());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_delivery_counts_every_message() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(ReceiveHandler::new(store.clone(), 50));
        let bytes = payload();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let handler = handler.clone();
                let bytes = bytes.clone();
                tokio::spawn(async move { handler.handle("sensors/env", &bytes).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(handler.is_complete());
        assert_eq!(handler.stats().received, 50);
        assert_eq!(store.len(), 50);
    }

    #[tokio::test]
    async fn test_zero_target_never_completes() {
        let store = Arc::new(MemoryStore::new());
        let handler = ReceiveHandler::new(store, 0);
        for _ in 0..3 {
            handler.handle("sensors/env", &payload()).await;
        }
        assert!(!handler.is_complete());
        assert!(tokio::time::timeout(Duration::from_millis(50), handler.wait_complete())
            .await
            .is_err());
    }
}
