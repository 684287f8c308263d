//! Storage Types Module
//!
//! Provides the basic data structures shared by the record store, the
//! storage client cache, the metadata resolver and the HTTP layer.

use serde::{Deserialize, Serialize};
use std::fmt;

fn default_region() -> String {
    "auto".to_string()
}

/// Connection settings for one tenant's S3-compatible storage account.
///
/// Immutable once constructed. `Debug` never prints the secret key.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    pub endpoint_url: String,
    pub bucket_name: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl StorageConfig {
    /// Cache key identifying the backend client for this account.
    pub fn client_key(&self) -> StorageClientKey {
        StorageClientKey {
            endpoint_url: self.endpoint_url.clone(),
            region: self.region.clone(),
            access_key: self.access_key.clone(),
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Structural key for the storage client cache: endpoint, region and access
/// key id. Holds no secret material, so it is safe to log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageClientKey {
    pub endpoint_url: String,
    pub region: String,
    pub access_key: String,
}

impl fmt::Display for StorageClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.endpoint_url, self.region, self.access_key)
    }
}

/// Object metadata as reported by the backend's HEAD call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMetadata {
    pub size_bytes: u64,
    pub content_type: Option<String>,
    /// HTTP-date formatted last modification time
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// Record store entry mapping a logical file name to its storage location
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileRecord {
    pub storage_location_id: String,
    pub file_path: String,
}
