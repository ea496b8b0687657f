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

// In-memory backend, for loopback runs and tests

use super::backend::{RecordStore, ScanFilter, ScanPage, StorageResult};
use crate::error::StorageError;
use crate::protocol::StoredRecord;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<Uuid, StoredRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn initialize(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn insert(&self, record: &StoredRecord) -> StorageResult<()> {
        match self.records.entry(record.id) {
            Entry::Occupied(_) => Err(StorageError::DuplicateId(record.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn scan_page(
        &self,
        filter: ScanFilter,
        after: Option<Uuid>,
        limit: usize,
    ) -> StorageResult<ScanPage> {
        let limit = limit.max(1);
        let mut records: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|entry| after.map_or(true, |after| *entry.key() > after))
            .filter(|entry| filter.accepts(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_unstable_by_key(|record| record.id);
        records.truncate(limit);
        Ok(ScanPage::from_sorted(records, limit))
    }

    async fn health_check(&self) -> StorageResult<bool> {
        Ok(true)
    }

    fn backend_type(&self) -> &str {
        "memory"
    }
}
