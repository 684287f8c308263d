//! Shared fixtures for integration tests: an in-memory object backend that
//! counts HEAD calls and open body streams, and a catalog wired to it.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use s3_stream_gateway::config::Config;
use s3_stream_gateway::http_gateway::GatewayState;
use s3_stream_gateway::record_store::CatalogRecordStore;
use s3_stream_gateway::s3_client::{BackendConnector, ByteStream, ObjectStorageBackend};
use s3_stream_gateway::storage_types::{FileMetadata, FileRecord, StorageConfig};
use s3_stream_gateway::{GatewayError, Result};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const STORAGE_ID: &str = "storage-1";
pub const BUCKET: &str = "media";
pub const LAST_MODIFIED: &str = "Wed, 21 Oct 2026 07:28:00 GMT";

#[derive(Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
    /// Body stops producing after this many chunks without ending
    pub stall_after: Option<usize>,
}

/// Object store held in memory. Bodies are served in `chunk_size` pieces.
pub struct MemoryBackend {
    objects: Mutex<HashMap<String, StoredObject>>,
    chunk_size: usize,
    head_delay: Duration,
    pub head_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub open_streams: Arc<AtomicUsize>,
    pub ranges: Mutex<Vec<(u64, u64)>>,
}

impl MemoryBackend {
    pub fn new(chunk_size: usize) -> Self {
        Self::with_head_delay(chunk_size, Duration::ZERO)
    }

    pub fn with_head_delay(chunk_size: usize, head_delay: Duration) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            chunk_size,
            head_delay,
            head_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
            ranges: Mutex::new(Vec::new()),
        }
    }

    pub fn put(&self, key: &str, data: impl Into<Bytes>, content_type: Option<&str>) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: content_type.map(str::to_string),
                stall_after: None,
            },
        );
    }

    pub fn put_stalling(&self, key: &str, data: impl Into<Bytes>, stall_after: usize) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                content_type: None,
                stall_after: Some(stall_after),
            },
        );
    }

    pub fn open_stream_count(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn object(&self, bucket: &str, key: &str) -> Result<StoredObject> {
        if bucket != BUCKET {
            return Err(GatewayError::NotFound(format!("bucket {}", bucket)));
        }
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(key.to_string()))
    }

    fn body(&self, object: &StoredObject, start: usize, end_exclusive: usize) -> ByteStream {
        let slice = object.data.slice(start..end_exclusive);
        let mut chunks: Vec<Result<Bytes>> = slice
            .chunks(self.chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let stalls = match object.stall_after {
            Some(n) => {
                chunks.truncate(n);
                true
            }
            None => false,
        };
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Box::pin(TrackedBody {
            chunks: chunks.into_iter(),
            stalls,
            open: Arc::clone(&self.open_streams),
        })
    }
}

#[async_trait]
impl ObjectStorageBackend for MemoryBackend {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<FileMetadata> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        if !self.head_delay.is_zero() {
            tokio::time::sleep(self.head_delay).await;
        }
        let object = self.object(bucket, key)?;
        Ok(FileMetadata {
            size_bytes: object.data.len() as u64,
            content_type: object.content_type.clone(),
            last_modified: Some(LAST_MODIFIED.to_string()),
            etag: Some("\"backend-etag\"".to_string()),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let object = self.object(bucket, key)?;
        let len = object.data.len();
        Ok(self.body(&object, 0, len))
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        end: u64,
    ) -> Result<ByteStream> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().unwrap().push((start, end));
        let object = self.object(bucket, key)?;
        let len = object.data.len();
        let end = (end as usize + 1).min(len);
        Ok(self.body(&object, (start as usize).min(end), end))
    }
}

/// Body stream that decrements the backend's open stream count when dropped
struct TrackedBody {
    chunks: std::vec::IntoIter<Result<Bytes>>,
    stalls: bool,
    open: Arc<AtomicUsize>,
}

impl Stream for TrackedBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.chunks.next() {
            Some(chunk) => Poll::Ready(Some(chunk)),
            None if self.stalls => Poll::Pending,
            None => Poll::Ready(None),
        }
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector that hands out one shared [`MemoryBackend`] and counts connects
pub struct MemoryConnector {
    pub backend: Arc<MemoryBackend>,
    pub connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            connects: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self, _config: &StorageConfig) -> Result<Arc<dyn ObjectStorageBackend>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let backend: Arc<dyn ObjectStorageBackend> = self.backend.clone();
        Ok(backend)
    }
}

pub fn storage_config() -> StorageConfig {
    StorageConfig {
        endpoint_url: "http://storage.test".to_string(),
        bucket_name: BUCKET.to_string(),
        region: "auto".to_string(),
        access_key: "test-access".to_string(),
        secret_key: "test-secret".to_string(),
    }
}

/// Catalog mapping each `(file name, object key)` pair onto the test storage
pub fn catalog(files: &[(&str, &str)]) -> CatalogRecordStore {
    let mut store = CatalogRecordStore::new();
    store.insert_storage(STORAGE_ID, storage_config());
    for (name, key) in files {
        store.insert_file(
            name,
            FileRecord {
                storage_location_id: STORAGE_ID.to_string(),
                file_path: key.to_string(),
            },
        );
    }
    store
}

pub struct Harness {
    pub state: Arc<GatewayState>,
    pub backend: Arc<MemoryBackend>,
    pub connector: Arc<MemoryConnector>,
    pub shutdown: CancellationToken,
}

/// Gateway state over a memory backend, without access logging
pub fn harness(config: &Config, backend: MemoryBackend, files: &[(&str, &str)]) -> Harness {
    let backend = Arc::new(backend);
    let connector = Arc::new(MemoryConnector::new(Arc::clone(&backend)));
    let shutdown = CancellationToken::new();
    let state = Arc::new(GatewayState::from_config(
        config,
        Arc::new(catalog(files)),
        connector.clone(),
        shutdown.clone(),
        None,
    ));
    Harness {
        state,
        backend,
        connector,
        shutdown,
    }
}

/// Bytes `0..len` as a repeating alphabet, so slices are easy to check
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

/// Defaults with burst throttling out of the way
pub fn quiet_config() -> Config {
    let mut config = Config::default();
    config.admission.burst_threshold = 10_000;
    config.admission.max_jitter = Duration::ZERO;
    config
}

/// Poll `cond` for up to a second
pub async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
