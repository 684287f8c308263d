//! Metadata Cache Module
//!
//! Resolves object metadata (size, content type, last-modified, etag) for a
//! logical file name. A TTL cache answers repeat lookups; misses are coalesced
//! through the single-flight [`LockManager`] so a burst of requests for the
//! same file costs exactly one backend HEAD.
//!
//! `NotFound` is never cached: object existence can change between calls.

use crate::s3_client::ObjectStorageBackend;
use crate::single_flight::LockManager;
use crate::storage_types::FileMetadata;
use crate::{GatewayError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

/// Configuration for the MetadataResolver
#[derive(Debug, Clone)]
pub struct MetadataResolverConfig {
    /// Entries older than this are refetched
    pub ttl: Duration,
    /// Maximum number of entries in the cache
    pub max_entries: usize,
    /// How long a finished fetch is shared with trailing callers
    pub lock_grace: Duration,
}

impl Default for MetadataResolverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_entries: 10_000,
            lock_grace: Duration::from_secs(5),
        }
    }
}

impl From<&crate::config::MetadataConfig> for MetadataResolverConfig {
    fn from(config: &crate::config::MetadataConfig) -> Self {
        Self {
            ttl: config.ttl,
            max_entries: config.max_entries,
            lock_grace: config.lock_grace,
        }
    }
}

/// A single entry in the metadata cache
#[derive(Debug)]
pub struct MetadataCacheEntry {
    pub metadata: FileMetadata,
    pub loaded_at: Instant,
    /// Microseconds since the resolver's epoch; updated under the read lock.
    last_accessed: AtomicU64,
}

impl MetadataCacheEntry {
    fn new(metadata: FileMetadata, stamp: u64) -> Self {
        Self {
            metadata,
            loaded_at: Instant::now(),
            last_accessed: AtomicU64::new(stamp),
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() >= ttl
    }

    fn touch(&self, stamp: u64) {
        self.last_accessed.fetch_max(stamp, Ordering::Relaxed);
    }

    fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }
}

/// Metrics for the metadata resolver
#[derive(Debug, Default)]
pub struct MetadataMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub backend_fetches: AtomicU64,
    pub not_found: AtomicU64,
    pub evictions: AtomicU64,
}

impl MetadataMetrics {
    pub fn snapshot(&self) -> MetadataMetricsSnapshot {
        MetadataMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            backend_fetches: self.backend_fetches.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics for reporting
#[derive(Debug, Clone, Serialize)]
pub struct MetadataMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub backend_fetches: u64,
    pub not_found: u64,
    pub evictions: u64,
}

impl MetadataMetricsSnapshot {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// TTL metadata cache with single-flight backend fetches
pub struct MetadataResolver {
    entries: RwLock<HashMap<String, MetadataCacheEntry>>,
    locks: LockManager<FileMetadata>,
    config: MetadataResolverConfig,
    metrics: MetadataMetrics,
    epoch: Instant,
}

impl MetadataResolver {
    pub fn new(config: MetadataResolverConfig) -> Self {
        info!(
            "Creating MetadataResolver: ttl={:?}, max_entries={}, lock_grace={:?}",
            config.ttl, config.max_entries, config.lock_grace
        );
        // A shared result must never outlive the cache entry it mirrors.
        let grace = config.lock_grace.min(config.ttl);
        Self {
            entries: RwLock::new(HashMap::new()),
            locks: LockManager::new(grace),
            config,
            metrics: MetadataMetrics::default(),
            epoch: Instant::now(),
        }
    }

    fn access_stamp(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    pub fn metrics(&self) -> MetadataMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Resolve metadata for `file_key`, stored at `bucket`/`object_key` on `backend`.
    pub async fn resolve(
        &self,
        file_key: &str,
        backend: &dyn ObjectStorageBackend,
        bucket: &str,
        object_key: &str,
    ) -> Result<FileMetadata> {
        if let Some(metadata) = self.get(file_key).await {
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(metadata);
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);

        let lock_key = format!("metadata:{}", file_key);
        self.locks
            .run(&lock_key, || async {
                // Another caller may have populated the cache while we queued.
                if let Some(metadata) = self.get(file_key).await {
                    return Ok(metadata);
                }

                self.metrics.backend_fetches.fetch_add(1, Ordering::Relaxed);
                match backend.head_object(bucket, object_key).await {
                    Ok(metadata) => {
                        debug!(
                            file_key = %file_key,
                            size_bytes = metadata.size_bytes,
                            "Fetched object metadata"
                        );
                        self.put(file_key, metadata.clone()).await;
                        Ok(metadata)
                    }
                    Err(GatewayError::NotFound(msg)) => {
                        self.metrics.not_found.fetch_add(1, Ordering::Relaxed);
                        Err(GatewayError::NotFound(msg))
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }

    /// Fresh cached metadata, if any. Hits only take the read lock.
    pub async fn get(&self, file_key: &str) -> Option<FileMetadata> {
        let entries = self.entries.read().await;
        let entry = entries.get(file_key)?;
        if entry.is_stale(self.config.ttl) {
            debug!(
                file_key = %file_key,
                age_ms = entry.loaded_at.elapsed().as_millis() as u64,
                "Metadata entry is stale"
            );
            return None;
        }
        entry.touch(self.access_stamp());
        Some(entry.metadata.clone())
    }

    /// Store metadata, evicting the least recently used entry when full.
    pub async fn put(&self, file_key: &str, metadata: FileMetadata) {
        let mut entries = self.entries.write().await;

        while entries.len() >= self.config.max_entries && !entries.contains_key(file_key) {
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed())
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    entries.remove(&key);
                    self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(evicted_key = %key, "Metadata entry evicted (LRU)");
                }
                None => break,
            }
        }

        entries.insert(
            file_key.to_string(),
            MetadataCacheEntry::new(metadata, self.access_stamp()),
        );
    }

    /// Force the next resolve to hit the backend.
    pub async fn invalidate(&self, file_key: &str) {
        if self.entries.write().await.remove(file_key).is_some() {
            debug!(file_key = %file_key, "Metadata entry invalidated");
        }
        self.locks.forget(&format!("metadata:{}", file_key));
    }

    /// Drop stale entries and expired lock results. Returns entries removed.
    pub async fn purge_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_stale(ttl));
        let removed = before - entries.len();
        drop(entries);

        self.locks.purge_expired();
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Keys currently tracked by the underlying lock manager
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}
