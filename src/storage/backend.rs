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

// Record store trait: the storage gateway

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::codec;
use crate::error::StorageError;
use crate::protocol::{unix_now, SensorReading, StoredRecord};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Server-side filter applied while scanning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Keep records with `received_at` strictly greater than this
    pub received_after: Option<i64>,
}

impl ScanFilter {
    pub fn received_after(since: i64) -> Self {
        Self {
            received_after: Some(since),
        }
    }

    pub fn accepts(&self, record: &StoredRecord) -> bool {
        self.received_after
            .map_or(true, |since| record.received_at > since)
    }
}

/// One page of a keyset scan
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub records: Vec<StoredRecord>,
    /// Resume point for the next page; `None` once the scan is exhausted
    pub next: Option<Uuid>,
}

impl ScanPage {
    /// Build a page from records sorted by id, fetched with `limit`
    pub fn from_sorted(records: Vec<StoredRecord>, limit: usize) -> Self {
        let next = if records.len() >= limit {
            records.last().map(|record| record.id)
        } else {
            None
        };
        Self { records, next }
    }
}

/// Durable table of [`StoredRecord`]s keyed by id
///
/// Backends implement the primitive insert and paged scan; `write`,
/// `scan_latest` and `scan_window` are built on top of them. Scans walk the
/// table in id order, so "latest" is computed client-side over every page.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Prepare the table (create if absent)
    async fn initialize(&self) -> StorageResult<()>;

    /// Insert one record; an existing id is an error
    async fn insert(&self, record: &StoredRecord) -> StorageResult<()>;

    /// Up to `limit` records with id greater than `after`, in id order
    async fn scan_page(
        &self,
        filter: ScanFilter,
        after: Option<Uuid>,
        limit: usize,
    ) -> StorageResult<ScanPage>;

    /// Health check
    async fn health_check(&self) -> StorageResult<bool>;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;

    /// Persist a reading under a fresh id, stamped with the current time
    async fn write(&self, reading: &SensorReading) -> StorageResult<StoredRecord> {
        let record = StoredRecord {
            id: Uuid::new_v4(),
            received_at: unix_now(),
            payload: codec::to_storage(reading)?,
        };
        self.insert(&record).await?;
        debug!(id = %record.id, received_at = record.received_at, "record stored");
        Ok(record)
    }

    /// Record with the greatest `received_at`, or `None` on an empty table
    async fn scan_latest(&self, page_size: usize) -> StorageResult<Option<StoredRecord>> {
        let page_size = page_size.max(1);
        let mut latest: Option<StoredRecord> = None;
        let mut after = None;

        loop {
            let page = self
                .scan_page(ScanFilter::default(), after, page_size)
                .await?;
            for record in page.records {
                let newer = latest
                    .as_ref()
                    .map_or(true, |current| record.received_at > current.received_at);
                if newer {
                    latest = Some(record);
                }
            }
            match page.next {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        Ok(latest)
    }

    /// All records with `received_at > since`, unordered
    async fn scan_window(&self, since: i64, page_size: usize) -> StorageResult<Vec<StoredRecord>> {
        let page_size = page_size.max(1);
        let filter = ScanFilter::received_after(since);
        let mut records = Vec::new();
        let mut after = None;

        loop {
            let page = self.scan_page(filter, after, page_size).await?;
            records.extend(page.records);
            match page.next {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        Ok(records)
    }
}
