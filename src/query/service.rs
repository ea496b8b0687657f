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

// Read-only query facade over the record store

use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec;
use crate::error::QueryError;
use crate::protocol::{unix_now, DecodedRecord};
use crate::storage::{RecordStore, ScanFilter};

pub struct QueryService {
    store: Arc<dyn RecordStore>,
    page_size: usize,
}

impl QueryService {
    pub fn new(store: Arc<dyn RecordStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Most recently received record that decodes, `None` when there is none
    ///
    /// Undecodable payloads are logged and skipped, so one corrupt row
    /// cannot hide older readings.
    pub async fn get_latest(&self) -> Result<Option<DecodedRecord>, QueryError> {
        let Some(record) = self.store.scan_latest(self.page_size).await? else {
            debug!("No records found");
            return Ok(None);
        };

        let id = record.id;
        match codec::decode_record(record) {
            Ok(decoded) => return Ok(Some(decoded)),
            Err(e) => warn!(%id, "Skipping record with undecodable payload: {}", e),
        }

        self.latest_decodable().await
    }

    /// Full keyset scan keeping the newest record whose payload decodes
    async fn latest_decodable(&self) -> Result<Option<DecodedRecord>, QueryError> {
        let mut latest: Option<DecodedRecord> = None;
        let mut after = None;

        loop {
            let page = self
                .store
                .scan_page(ScanFilter::default(), after, self.page_size)
                .await?;
            for record in page.records {
                if latest
                    .as_ref()
                    .is_some_and(|current| record.received_at <= current.received_at)
                {
                    continue;
                }
                let id = record.id;
                match codec::decode_record(record) {
                    Ok(decoded) => latest = Some(decoded),
                    Err(e) => debug!(%id, "Skipping undecodable record: {}", e),
                }
            }
            match page.next {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        if latest.is_none() {
            debug!("No decodable records found");
        }
        Ok(latest)
    }

    /// Records received within the last `seconds`, oldest first
    pub async fn get_last_n_seconds(&self, seconds: u64) -> Result<Vec<DecodedRecord>, QueryError> {
        let span = i64::try_from(seconds).unwrap_or(i64::MAX);
        self.get_since(unix_now().saturating_sub(span)).await
    }

    /// Records with `received_at > since`; undecodable payloads are skipped
    pub async fn get_since(&self, since: i64) -> Result<Vec<DecodedRecord>, QueryError> {
        let records = self.store.scan_window(since, self.page_size).await?;

        let mut decoded: Vec<DecodedRecord> = records
            .into_iter()
            .filter_map(|record| {
                let id = record.id;
                match codec::decode_record(record) {
                    Ok(decoded) => Some(decoded),
                    Err(e) => {
                        warn!(%id, "Skipping record with undecodable payload: {}", e);
                        None
                    }
                }
            })
            .collect();

        decoded.sort_by_key(|record| (record.received_at, record.id));
        debug!(since, count = decoded.len(), "Window query");
        Ok(decoded)
    }
}
