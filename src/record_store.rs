//! Record store: logical file names to storage locations.

use crate::config::CatalogConfig;
use crate::storage_types::{FileRecord, StorageConfig};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::info;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn lookup_file_by_name(&self, name: &str) -> Result<Option<FileRecord>>;

    async fn lookup_storage_config_by_id(&self, id: &str) -> Result<Option<StorageConfig>>;
}

/// In-memory store loaded from the `catalog` configuration section.
#[derive(Debug, Default)]
pub struct CatalogRecordStore {
    files: HashMap<String, FileRecord>,
    storages: HashMap<String, StorageConfig>,
}

impl CatalogRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(catalog: &CatalogConfig) -> Self {
        let mut store = Self::new();
        for storage in &catalog.storages {
            store.insert_storage(&storage.id, storage.config.clone());
        }
        for file in &catalog.files {
            store.insert_file(
                &file.name,
                FileRecord {
                    storage_location_id: file.storage_location_id.clone(),
                    file_path: file.file_path.clone(),
                },
            );
        }
        info!(
            "Catalog record store loaded: {} storages, {} files",
            store.storages.len(),
            store.files.len()
        );
        store
    }

    pub fn insert_storage(&mut self, id: &str, config: StorageConfig) {
        self.storages.insert(id.to_string(), config);
    }

    pub fn insert_file(&mut self, name: &str, record: FileRecord) {
        self.files.insert(name.to_string(), record);
    }
}

#[async_trait]
impl RecordStore for CatalogRecordStore {
    async fn lookup_file_by_name(&self, name: &str) -> Result<Option<FileRecord>> {
        Ok(self.files.get(name).cloned())
    }

    async fn lookup_storage_config_by_id(&self, id: &str) -> Result<Option<StorageConfig>> {
        Ok(self.storages.get(id).cloned())
    }
}
