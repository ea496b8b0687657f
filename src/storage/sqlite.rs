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

// SQLite backend implementation

use super::backend::{RecordStore, ScanFilter, ScanPage, StorageResult};
use crate::config::{is_plain_identifier, SqliteConfig};
use crate::error::StorageError;
use crate::protocol::StoredRecord;
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// Table of records in a local SQLite database
///
/// Columns mirror the record attributes: `id` (text primary key),
/// `timestamp` (integer unix seconds) and `data` (JSON payload).
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteStore {
    /// Open (or create) the database file
    pub fn open(config: &SqliteConfig) -> StorageResult<Self> {
        let table = checked_table(&config.table)?;

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(
            "Opening SQLite store at {} (table '{}')",
            config.path.display(),
            table
        );

        let conn = Connection::open(&config.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
        })
    }

    /// Private in-memory database, gone when the store is dropped
    pub fn in_memory(table: &str) -> StorageResult<Self> {
        let table = checked_table(table)?;
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
        })
    }

    /// Run blocking database work off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection, &str) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StorageError::Worker("connection lock poisoned".to_string()))?;
            f(&conn, &table)
        })
        .await
        .map_err(|e| StorageError::Worker(e.to_string()))?
    }
}

fn checked_table(table: &str) -> StorageResult<String> {
    if is_plain_identifier(table) {
        Ok(table.to_string())
    } else {
        Err(StorageError::InvalidTable(table.to_string()))
    }
}

fn row_to_record(id: String, received_at: i64, payload: String) -> StorageResult<StoredRecord> {
    let id = Uuid::parse_str(&id).map_err(|e| StorageError::Corrupt {
        key: id.clone(),
        reason: e.to_string(),
    })?;
    Ok(StoredRecord {
        id,
        received_at,
        payload,
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn initialize(&self) -> StorageResult<()> {
        self.with_conn(|conn, table| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id          TEXT PRIMARY KEY,
                    timestamp   INTEGER NOT NULL,
                    data        TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_ts ON {table}(timestamp);"
            ))?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, record: &StoredRecord) -> StorageResult<()> {
        let record = record.clone();
        self.with_conn(move |conn, table| {
            let result = conn.execute(
                &format!("INSERT INTO {table} (id, timestamp, data) VALUES (?1, ?2, ?3)"),
                params![record.id.to_string(), record.received_at, record.payload],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StorageError::DuplicateId(record.id.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn scan_page(
        &self,
        filter: ScanFilter,
        after: Option<Uuid>,
        limit: usize,
    ) -> StorageResult<ScanPage> {
        // Hyphenated lowercase ids sort the same as their bytes
        let after = after.map(|id| id.to_string()).unwrap_or_default();
        let since = filter.received_after.unwrap_or(i64::MIN);
        let limit = limit.max(1);

        let rows = self
            .with_conn(move |conn, table| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, timestamp, data FROM {table} \
                     WHERE id > ?1 AND timestamp > ?2 \
                     ORDER BY id LIMIT ?3"
                ))?;
                let rows = stmt
                    .query_map(params![after, since, limit as i64], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let records = rows
            .into_iter()
            .map(|(id, received_at, payload)| row_to_record(id, received_at, payload))
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(ScanPage::from_sorted(records, limit))
    }

    async fn health_check(&self) -> StorageResult<bool> {
        let result = self
            .with_conn(|conn, _| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Health check failed: {}", e);
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "sqlite"
    }
}
