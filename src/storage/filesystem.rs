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

// Filesystem backend implementation

use super::backend::{RecordStore, ScanFilter, ScanPage, StorageResult};
use crate::config::{is_plain_identifier, FilesystemConfig};
use crate::error::StorageError;
use crate::protocol::StoredRecord;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Filesystem backend storing one JSON document per record
///
/// Layout: `{base_path}/{table}/{id}.json`
pub struct FilesystemStore {
    table_dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(config: FilesystemConfig) -> StorageResult<Self> {
        if !is_plain_identifier(&config.table) {
            return Err(StorageError::InvalidTable(config.table));
        }

        let table_dir = config.base_path.join(&config.table);

        info!(
            "Initializing filesystem backend at: {}",
            table_dir.display()
        );

        Ok(Self { table_dir })
    }

    /// Get the file path for a given record id
    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.table_dir.join(format!("{}.json", id))
    }

    /// Record ids present on disk, sorted
    async fn list_ids(&self) -> StorageResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.table_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match Uuid::parse_str(stem) {
                Ok(id) => ids.push(id),
                Err(_) => debug!("Ignoring stray file {:?}", name),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn read_record(&self, id: &Uuid) -> StorageResult<Option<StoredRecord>> {
        let path = self.record_path(id);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            // Removed between listing and reading
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Skipping unreadable record {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl RecordStore for FilesystemStore {
    async fn initialize(&self) -> StorageResult<()> {
        if !fs::try_exists(&self.table_dir).await? {
            info!("Creating table directory: {}", self.table_dir.display());
            fs::create_dir_all(&self.table_dir).await?;
        }
        Ok(())
    }

    async fn insert(&self, record: &StoredRecord) -> StorageResult<()> {
        let file_path = self.record_path(&record.id);
        if fs::try_exists(&file_path).await? {
            return Err(StorageError::DuplicateId(record.id.to_string()));
        }

        let content = serde_json::to_vec(record).map_err(|e| StorageError::Corrupt {
            key: record.id.to_string(),
            reason: e.to_string(),
        })?;

        // Write then rename so scans never see a partial file
        let tmp_path = self.table_dir.join(format!("{}.json.tmp", record.id));
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&content).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &file_path).await?;

        debug!(
            "Wrote {} bytes to {}",
            content.len(),
            file_path.display()
        );

        Ok(())
    }

    async fn scan_page(
        &self,
        filter: ScanFilter,
        after: Option<Uuid>,
        limit: usize,
    ) -> StorageResult<ScanPage> {
        let limit = limit.max(1);
        let ids = self.list_ids().await?;
        let start = match after {
            Some(after) => ids.partition_point(|id| *id <= after),
            None => 0,
        };

        let mut records = Vec::with_capacity(limit);
        for id in &ids[start..] {
            if let Some(record) = self.read_record(id).await? {
                if filter.accepts(&record) {
                    records.push(record);
                    if records.len() == limit {
                        break;
                    }
                }
            }
        }

        Ok(ScanPage::from_sorted(records, limit))
    }

    async fn health_check(&self) -> StorageResult<bool> {
        // Check if table directory is accessible and writable
        match fs::metadata(&self.table_dir).await {
            Ok(metadata) if metadata.is_dir() => {
                let test_file = self.table_dir.join(".health_check_test");
                match fs::File::create(&test_file).await {
                    Ok(mut f) => {
                        if let Err(e) = f.write_all(b"test").await {
                            warn!("Health check failed - cannot write: {}", e);
                            return Ok(false);
                        }
                        let _ = fs::remove_file(&test_file).await;
                        Ok(true)
                    }
                    Err(e) => {
                        warn!("Health check failed - cannot create file: {}", e);
                        Ok(false)
                    }
                }
            }
            Ok(_) => {
                warn!(
                    "Health check failed - table path is not a directory: {}",
                    self.table_dir.display()
                );
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "Health check failed - cannot access table path {}: {}",
                    self.table_dir.display(),
                    e
                );
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (FilesystemStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = FilesystemConfig {
            base_path: temp_dir.path().to_path_buf(),
            table: "SensorData".to_string(),
        };
        let store = FilesystemStore::new(config).unwrap();
        (store, temp_dir)
    }

    fn record(received_at: i64) -> StoredRecord {
        StoredRecord {
            id: Uuid::new_v4(),
            received_at,
            payload: r#"{"temperature":1.0}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_initialize() {
        let (store, _temp_dir) = create_test_store();
        store.initialize().await.unwrap();
        assert!(store.table_dir.exists());
        assert!(store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_writes_json_document() {
        let (store, _temp_dir) = create_test_store();
        store.initialize().await.unwrap();

        let rec = record(1_700_000_000);
        store.insert(&rec).await.unwrap();

        let content = std::fs::read_to_string(store.record_path(&rec.id)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["id"], rec.id.to_string());
        assert_eq!(parsed["timestamp"], 1_700_000_000);
        assert_eq!(parsed["data"], rec.payload);

        assert!(matches!(
            store.insert(&rec).await,
            Err(StorageError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_skips_stray_and_corrupt_files() {
        let (store, _temp_dir) = create_test_store();
        store.initialize().await.unwrap();
        store.insert(&record(10)).await.unwrap();

        std::fs::write(store.table_dir.join("notes.txt"), "hello").unwrap();
        std::fs::write(
            store.table_dir.join(format!("{}.json", Uuid::new_v4())),
            "not json",
        )
        .unwrap();

        let page = store.scan_page(ScanFilter::default(), None, 10).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_scan_filter_and_cursor() {
        let (store, _temp_dir) = create_test_store();
        store.initialize().await.unwrap();
        for ts in 0..6 {
            store.insert(&record(ts)).await.unwrap();
        }

        let filter = ScanFilter::received_after(2);
        let first = store.scan_page(filter, None, 2).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let second = store.scan_page(filter, first.next, 2).await.unwrap();

        let mut seen: Vec<i64> = first
            .records
            .iter()
            .chain(second.records.iter())
            .map(|r| r.received_at)
            .collect();
        if let Some(next) = second.next {
            let third = store.scan_page(filter, Some(next), 2).await.unwrap();
            seen.extend(third.records.iter().map(|r| r.received_at));
        }
        seen.sort();
        assert_eq!(seen, vec![3, 4, 5]);
    }

    #[test]
    fn test_invalid_table_name() {
        let config = FilesystemConfig {
            base_path: PathBuf::from("/tmp"),
            table: "../escape".to_string(),
        };
        assert!(matches!(
            FilesystemStore::new(config),
            Err(StorageError::InvalidTable(_))
        ));
    }
}
