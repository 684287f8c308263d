//! Stream Registry Module
//!
//! Tracks every active stream session. A session is present exactly while its
//! [`StreamRegistration`] guard is alive. Each entry carries the session's
//! cancellation token so the janitor and shutdown can stop streams they do
//! not own.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct StreamEntry {
    file_key: String,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Point-in-time view of one stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub id: Uuid,
    pub file_key: String,
    pub started_at: String,
    pub duration_ms: u64,
}

/// Point-in-time view of the registry, as served on `/streams`
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub count: usize,
    pub streams: Vec<StreamInfo>,
}

#[derive(Default)]
pub struct StreamRegistry {
    streams: DashMap<Uuid, StreamEntry>,
}

/// Keeps a session registered; deregisters on drop.
pub struct StreamRegistration {
    id: Uuid,
    registry: Arc<StreamRegistry>,
}

impl StreamRegistration {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `file_key`. `cancel` is cancelled by
    /// [`StreamRegistry::sweep_stale`] and [`StreamRegistry::cancel_all`].
    pub fn register(self: &Arc<Self>, file_key: &str, cancel: CancellationToken) -> StreamRegistration {
        let id = Uuid::new_v4();
        self.streams.insert(
            id,
            StreamEntry {
                file_key: file_key.to_string(),
                started_at: Instant::now(),
                started_wall: Utc::now(),
                cancel,
            },
        );
        debug!(stream_id = %id, file_key = %file_key, active = self.streams.len(), "Stream registered");
        StreamRegistration {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Returns false when the id was not registered.
    pub fn deregister(&self, id: Uuid) -> bool {
        match self.streams.remove(&id) {
            Some((_, entry)) => {
                debug!(
                    stream_id = %id,
                    file_key = %entry.file_key,
                    duration_ms = entry.started_at.elapsed().as_millis() as u64,
                    "Stream deregistered"
                );
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut streams: Vec<StreamInfo> = self
            .streams
            .iter()
            .map(|entry| StreamInfo {
                id: *entry.key(),
                file_key: entry.file_key.clone(),
                started_at: entry.started_wall.to_rfc3339(),
                duration_ms: entry.started_at.elapsed().as_millis() as u64,
            })
            .collect();
        streams.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        RegistrySnapshot {
            count: streams.len(),
            streams,
        }
    }

    /// Cancel and drop every session older than `max_age`. Returns how many.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let stale: Vec<Uuid> = self
            .streams
            .iter()
            .filter(|entry| entry.started_at.elapsed() >= max_age)
            .map(|entry| *entry.key())
            .collect();

        let mut swept = 0;
        for id in stale {
            if let Some((_, entry)) = self.streams.remove(&id) {
                entry.cancel.cancel();
                warn!(
                    stream_id = %id,
                    file_key = %entry.file_key,
                    age_secs = entry.started_at.elapsed().as_secs(),
                    "Cancelled stream exceeding maximum age"
                );
                swept += 1;
            }
        }
        swept
    }

    /// Cancel every active session. Entries leave the registry as their
    /// sessions finish cleaning up.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.streams.iter() {
            entry.cancel.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            info!("Cancelled {} active streams", cancelled);
        }
        cancelled
    }
}
