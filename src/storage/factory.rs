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

// Backend factory for creating record stores from configuration

use super::backend::RecordStore;
use super::filesystem::FilesystemStore;
use super::memory::MemoryStore;
use super::sqlite::SqliteStore;
use crate::config::StorageConfig;
use anyhow::{bail, Result};
use std::sync::Arc;

pub struct BackendFactory;

impl BackendFactory {
    /// Create record store from configuration
    pub fn create(config: &StorageConfig) -> Result<Arc<dyn RecordStore>> {
        match config.backend.as_str() {
            "sqlite" => {
                let backend_config = config
                    .sqlite
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("SQLite config missing"))?;

                let backend = SqliteStore::open(backend_config)?;
                Ok(Arc::new(backend))
            }

            "filesystem" => {
                let backend_config = config
                    .filesystem
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("Filesystem config missing"))?;

                let backend = FilesystemStore::new(backend_config.clone())?;
                Ok(Arc::new(backend))
            }

            "memory" => Ok(Arc::new(MemoryStore::new())),

            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: sqlite, filesystem, memory",
                unknown
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilesystemConfig, SqliteConfig};
    use tempfile::TempDir;

    #[test]
    fn test_create_sqlite_backend() {
        let temp_dir = TempDir::new().unwrap();
        let storage_config = StorageConfig {
            backend: "sqlite".to_string(),
            sqlite: Some(SqliteConfig {
                path: temp_dir.path().join("sensor.db"),
                table: "SensorData".to_string(),
            }),
            filesystem: None,
        };

        let backend = BackendFactory::create(&storage_config).unwrap();
        assert_eq!(backend.backend_type(), "sqlite");
    }

    #[test]
    fn test_create_filesystem_backend() {
        let temp_dir = TempDir::new().unwrap();
        let storage_config = StorageConfig {
            backend: "filesystem".to_string(),
            sqlite: None,
            filesystem: Some(FilesystemConfig {
                base_path: temp_dir.path().to_path_buf(),
                table: "SensorData".to_string(),
            }),
        };

        let backend = BackendFactory::create(&storage_config).unwrap();
        assert_eq!(backend.backend_type(), "filesystem");
    }

    #[test]
    fn test_create_memory_backend() {
        let storage_config = StorageConfig {
            backend: "memory".to_string(),
            sqlite: None,
            filesystem: None,
        };

        let backend = BackendFactory::create(&storage_config).unwrap();
        assert_eq!(backend.backend_type(), "memory");
    }

    #[test]
    fn test_missing_section() {
        let storage_config = StorageConfig {
            backend: "filesystem".to_string(),
            sqlite: None,
            filesystem: None,
        };

        let result = BackendFactory::create(&storage_config);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_unknown_backend() {
        let storage_config = StorageConfig {
            backend: "dynamodb".to_string(),
            sqlite: None,
            filesystem: None,
        };

        let backend = BackendFactory::create(&storage_config);
        assert!(backend.is_err());
        if let Err(e) = backend {
            assert!(e.to_string().contains("Unknown storage backend"));
        }
    }
}
