//! Single-flight lock manager.
//!
//! Coalesces concurrent executions of the same keyed async producer:
//!
//! 1. The first caller for a key becomes the "Leader" and runs the producer
//! 2. Callers arriving while the leader runs become "Waiters" and subscribe to a broadcast channel
//! 3. The leader's outcome is broadcast to all waiters in the same critical section that flips
//!    the entry out of its pending state
//! 4. A successful value is retained for a short grace period so trailing callers reuse it;
//!    a failure removes the entry at once so the next caller retries
//!
//! If a leader is cancelled (its future dropped) the entry is removed, waiters observe the
//! closed channel and race to become the next leader.

use crate::{GatewayError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// Only one message ever travels through a flight channel.
const BROADCAST_CHANNEL_CAPACITY: usize = 1;

enum LockEntry<T> {
    Pending {
        flight_id: u64,
        sender: broadcast::Sender<Result<T>>,
    },
    Completed {
        value: T,
        completed_at: Instant,
    },
}

/// Keyed single-flight executor with a short-lived result cache.
pub struct LockManager<T> {
    entries: Arc<DashMap<String, LockEntry<T>>>,
    grace: Duration,
    next_flight_id: AtomicU64,
}

/// Role assigned to a caller after registration.
pub enum FlightRole<T: Clone + Send + Sync + 'static> {
    /// Run the producer and report through the guard.
    Leader(LeaderGuard<T>),
    /// Another caller is producing; wait for its broadcast.
    Waiter(broadcast::Receiver<Result<T>>),
    /// A completed result within the grace period.
    Ready(T),
}

/// RAII guard held by the leader. Dropping it without completing removes the
/// pending entry, which closes the channel for every waiter.
pub struct LeaderGuard<T: Clone + Send + Sync + 'static> {
    key: String,
    flight_id: u64,
    grace: Duration,
    entries: Arc<DashMap<String, LockEntry<T>>>,
    completed: bool,
}

impl<T: Clone + Send + Sync + 'static> LockManager<T> {
    /// `grace` is how long a successful result stays reusable.
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            grace,
            next_flight_id: AtomicU64::new(0),
        }
    }

    /// Register interest in `key` and learn what this caller must do.
    pub fn try_register(&self, key: &str) -> FlightRole<T> {
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let (guard, entry) = self.new_flight(key);
                vacant.insert(entry);
                FlightRole::Leader(guard)
            }
            Entry::Occupied(mut occupied) => {
                let role = match occupied.get() {
                    LockEntry::Pending { sender, .. } => Some(FlightRole::Waiter(sender.subscribe())),
                    LockEntry::Completed {
                        value,
                        completed_at,
                    } if completed_at.elapsed() < self.grace => Some(FlightRole::Ready(value.clone())),
                    LockEntry::Completed { .. } => None,
                };
                match role {
                    Some(role) => role,
                    None => {
                        let (guard, entry) = self.new_flight(key);
                        occupied.insert(entry);
                        FlightRole::Leader(guard)
                    }
                }
            }
        }
    }

    fn new_flight(&self, key: &str) -> (LeaderGuard<T>, LockEntry<T>) {
        let flight_id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
        let (sender, _rx) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        let guard = LeaderGuard {
            key: key.to_string(),
            flight_id,
            grace: self.grace,
            entries: Arc::clone(&self.entries),
            completed: false,
        };
        (guard, LockEntry::Pending { flight_id, sender })
    }

    /// Run `producer` at most once per concurrent window for `key`.
    ///
    /// Concurrent callers receive the leader's value or a clone of its error.
    pub async fn run<F, Fut>(&self, key: &str, producer: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut producer = Some(producer);
        loop {
            match self.try_register(key) {
                FlightRole::Ready(value) => return Ok(value),
                FlightRole::Leader(guard) => {
                    let producer = producer.take().ok_or_else(|| {
                        GatewayError::InternalError(format!("producer for {} already consumed", key))
                    })?;
                    let result = producer().await;
                    return guard.complete(result);
                }
                FlightRole::Waiter(mut rx) => match rx.recv().await {
                    Ok(result) => return result,
                    Err(_) => {
                        debug!(key = %key, "Single-flight leader went away, retrying");
                        continue;
                    }
                },
            }
        }
    }

    /// Drop completed entries older than the grace period. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let grace = self.grace;
        self.entries.retain(|_, entry| match entry {
            LockEntry::Pending { .. } => true,
            LockEntry::Completed { completed_at, .. } => completed_at.elapsed() < grace,
        });
        before.saturating_sub(self.entries.len())
    }

    /// Discard a completed result so the next caller runs the producer again.
    /// A pending flight is left alone.
    pub fn forget(&self, key: &str) {
        self.entries
            .remove_if(key, |_, entry| matches!(entry, LockEntry::Completed { .. }));
    }

    /// Number of tracked keys (pending or completed).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys with a producer currently running.
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), LockEntry::Pending { .. }))
            .count()
    }
}

impl<T: Clone + Send + Sync + 'static> LeaderGuard<T> {
    /// Publish the producer's outcome to every waiter and hand it back to the leader.
    pub fn complete(mut self, result: Result<T>) -> Result<T> {
        self.completed = true;
        match &result {
            Ok(value) => {
                let completed_at = Instant::now();
                if self.grace.is_zero() {
                    if let Some((_, LockEntry::Pending { sender, .. })) = self.remove_own_pending() {
                        let _ = sender.send(Ok(value.clone()));
                    }
                    return result;
                }

                if let Some(mut entry) = self.entries.get_mut(&self.key) {
                    let owned = matches!(
                        &*entry,
                        LockEntry::Pending { flight_id, .. } if *flight_id == self.flight_id
                    );
                    if owned {
                        let previous = std::mem::replace(
                            &mut *entry,
                            LockEntry::Completed {
                                value: value.clone(),
                                completed_at,
                            },
                        );
                        // Send while the shard lock is held so no caller can
                        // observe Completed before waiters are released.
                        if let LockEntry::Pending { sender, .. } = previous {
                            let _ = sender.send(Ok(value.clone()));
                        }
                    }
                }
                self.schedule_expiry(completed_at);
            }
            Err(err) => {
                if let Some((_, LockEntry::Pending { sender, .. })) = self.remove_own_pending() {
                    let _ = sender.send(Err(err.clone()));
                }
            }
        }
        result
    }

    fn remove_own_pending(&self) -> Option<(String, LockEntry<T>)> {
        let flight_id = self.flight_id;
        self.entries.remove_if(&self.key, |_, entry| {
            matches!(entry, LockEntry::Pending { flight_id: id, .. } if *id == flight_id)
        })
    }

    fn schedule_expiry(&self, completed_at: Instant) {
        let entries = Arc::clone(&self.entries);
        let key = self.key.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            entries.remove_if(&key, |_, entry| {
                matches!(entry, LockEntry::Completed { completed_at: at, .. } if *at == completed_at)
            });
        });
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for LeaderGuard<T> {
    fn drop(&mut self) {
        if !self.completed {
            // Leader cancelled: closing the channel lets a waiter take over.
            self.remove_own_pending();
        }
    }
}
