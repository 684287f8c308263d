//! Storage client cache.
//!
//! Keeps one backend handle per storage account, keyed by endpoint, region
//! and access key id. Construction is single-flight: concurrent first requests
//! for the same account share one handle instead of racing to build several.

use crate::s3_client::{BackendConnector, ObjectStorageBackend};
use crate::single_flight::LockManager;
use crate::storage_types::{StorageClientKey, StorageConfig};
use crate::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ClientCacheMetrics {
    constructions: AtomicU64,
    reuses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientCacheMetricsSnapshot {
    pub constructions: u64,
    pub reuses: u64,
    pub evictions: u64,
}

pub struct StorageClientCache {
    clients: DashMap<StorageClientKey, Arc<dyn ObjectStorageBackend>>,
    connector: Arc<dyn BackendConnector>,
    construction: LockManager<Arc<dyn ObjectStorageBackend>>,
    metrics: ClientCacheMetrics,
}

impl StorageClientCache {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            clients: DashMap::new(),
            connector,
            // The map itself is the long-lived cache; flights need no grace.
            construction: LockManager::new(Duration::ZERO),
            metrics: ClientCacheMetrics::default(),
        }
    }

    /// Cached handle for `config`'s account, constructing it on first use.
    pub async fn get_client(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectStorageBackend>> {
        let key = config.client_key();
        if let Some(client) = self.cached(&key) {
            self.metrics.reuses.fetch_add(1, Ordering::Relaxed);
            return Ok(client);
        }

        self.construction
            .run(&key.to_string(), || async {
                if let Some(client) = self.cached(&key) {
                    return Ok(client);
                }
                let client = self.connector.connect(config).await?;
                self.clients.insert(key.clone(), Arc::clone(&client));
                self.metrics.constructions.fetch_add(1, Ordering::Relaxed);
                info!(client = %key, "Storage client constructed");
                Ok(client)
            })
            .await
    }

    fn cached(&self, key: &StorageClientKey) -> Option<Arc<dyn ObjectStorageBackend>> {
        self.clients.get(key).map(|c| Arc::clone(c.value()))
    }

    /// Close and remove the handle for `config`, or every handle when `None`.
    /// Returns how many handles were evicted.
    pub async fn evict(&self, config: Option<&StorageConfig>) -> usize {
        let evicted: Vec<(StorageClientKey, Arc<dyn ObjectStorageBackend>)> = match config {
            Some(config) => self.clients.remove(&config.client_key()).into_iter().collect(),
            None => {
                let keys: Vec<StorageClientKey> =
                    self.clients.iter().map(|e| e.key().clone()).collect();
                keys.into_iter()
                    .filter_map(|k| self.clients.remove(&k))
                    .collect()
            }
        };

        for (key, client) in &evicted {
            client.close().await;
            debug!(client = %key, "Storage client evicted");
        }
        self.metrics
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn metrics(&self) -> ClientCacheMetricsSnapshot {
        ClientCacheMetricsSnapshot {
            constructions: self.metrics.constructions.load(Ordering::Relaxed),
            reuses: self.metrics.reuses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3_client::ByteStream;
    use crate::storage_types::FileMetadata;
    use crate::GatewayError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct NullBackend {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ObjectStorageBackend for NullBackend {
        async fn head_object(&self, _bucket: &str, _key: &str) -> Result<FileMetadata> {
            Err(GatewayError::NotFound("null".into()))
        }
        async fn get_object(&self, _bucket: &str, _key: &str) -> Result<ByteStream> {
            Err(GatewayError::NotFound("null".into()))
        }
        async fn get_object_range(
            &self,
            _bucket: &str,
            _key: &str,
            _start: u64,
            _end: u64,
        ) -> Result<ByteStream> {
            Err(GatewayError::NotFound("null".into()))
        }
        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SlowConnector {
        connects: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendConnector for SlowConnector {
        async fn connect(&self, _config: &StorageConfig) -> Result<Arc<dyn ObjectStorageBackend>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Arc::new(NullBackend {
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn account(access_key: &str) -> StorageConfig {
        StorageConfig {
            endpoint_url: "http://storage.local".to_string(),
            bucket_name: "bucket".to_string(),
            region: "auto".to_string(),
            access_key: access_key.to_string(),
            secret_key: "secret".to_string(),
        }
    }

    fn cache() -> (Arc<StorageClientCache>, Arc<SlowConnector>) {
        let connector = Arc::new(SlowConnector {
            connects: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        });
        (
            Arc::new(StorageClientCache::new(connector.clone())),
            connector,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_access_constructs_once() {
        let (cache, connector) = cache();
        let mut handles = Vec::new();
        for _ in 0..6 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_client(&account("tenant-a")).await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);

        cache.get_client(&account("tenant-a")).await.unwrap();
        assert!(cache.metrics().reuses >= 1);
        assert_eq!(cache.metrics().constructions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_accounts_get_distinct_clients() {
        let (cache, connector) = cache();
        cache.get_client(&account("a")).await.unwrap();
        cache.get_client(&account("b")).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_one_and_all_close_handles() {
        let (cache, connector) = cache();
        cache.get_client(&account("a")).await.unwrap();
        cache.get_client(&account("b")).await.unwrap();
        cache.get_client(&account("c")).await.unwrap();

        assert_eq!(cache.evict(Some(&account("a"))).await, 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evict(None).await, 2);
        assert!(cache.is_empty());
        assert_eq!(connector.closed.load(Ordering::SeqCst), 3);

        // a rotated credential rebuilds on next use
        cache.get_client(&account("a")).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
    }
}
