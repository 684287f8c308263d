//! Per-file admission control.
//!
//! Bounds concurrent backend downloads per file key. Requests beyond the
//! limit wait in a FIFO queue and are promoted one at a time as permits are
//! released. Rapid repeat requests for the same key (typical of a player
//! seeking) are detected as bursts and delayed before they compete for a slot.
//!
//! A grant is represented by an [`AdmissionPermit`]; dropping it releases the
//! slot. Per-key state outlives its permits so burst memory survives between
//! requests; the janitor removes it after a long idle period.

use crate::config::AdmissionConfig;
use crate::{GatewayError, Result};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Waiter {
    ticket: u64,
    sender: oneshot::Sender<AdmissionPermit>,
}

struct AdmissionState {
    active: usize,
    waiting: VecDeque<Waiter>,
    last_request: Option<Instant>,
    burst_counter: u32,
    last_activity: Instant,
}

impl AdmissionState {
    fn new(now: Instant) -> Self {
        Self {
            active: 0,
            waiting: VecDeque::new(),
            last_request: None,
            burst_counter: 0,
            last_activity: now,
        }
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.waiting.is_empty()
    }
}

/// Admission counters
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    pub granted_immediately: AtomicU64,
    pub queued: AtomicU64,
    pub promoted: AtomicU64,
    pub burst_throttled: AtomicU64,
    pub queue_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionMetricsSnapshot {
    pub granted_immediately: u64,
    pub queued: u64,
    pub promoted: u64,
    pub burst_throttled: u64,
    pub queue_timeouts: u64,
}

impl AdmissionMetrics {
    pub fn snapshot(&self) -> AdmissionMetricsSnapshot {
        AdmissionMetricsSnapshot {
            granted_immediately: self.granted_immediately.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            burst_throttled: self.burst_throttled.load(Ordering::Relaxed),
            queue_timeouts: self.queue_timeouts.load(Ordering::Relaxed),
        }
    }
}

struct AdmissionInner {
    states: DashMap<String, AdmissionState>,
    config: AdmissionConfig,
    metrics: AdmissionMetrics,
    next_ticket: AtomicU64,
}

/// Counted semaphore with a FIFO queue per file key, plus burst throttling.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<AdmissionInner>,
}

/// A granted download slot for one file key. Released on drop.
pub struct AdmissionPermit {
    file_key: String,
    inner: Arc<AdmissionInner>,
    armed: bool,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("file_key", &self.file_key)
            .field("armed", &self.armed)
            .finish()
    }
}

impl AdmissionPermit {
    fn new(file_key: &str, inner: &Arc<AdmissionInner>) -> Self {
        Self {
            file_key: file_key.to_string(),
            inner: Arc::clone(inner),
            armed: true,
        }
    }

    pub fn file_key(&self) -> &str {
        &self.file_key
    }

    /// Release the slot now instead of at drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if std::mem::take(&mut self.armed) {
            self.inner.release(&self.file_key);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// Withdraws a queued ticket if the waiting caller goes away.
struct QueuedTicket<'a> {
    inner: &'a AdmissionInner,
    file_key: &'a str,
    ticket: u64,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        self.inner.withdraw(self.file_key, self.ticket);
    }
}

impl AdmissionInner {
    /// Delay owed by a request whose burst counter is `counter`, if any.
    fn burst_delay(&self, counter: u32) -> Option<Duration> {
        let cfg = &self.config;
        if counter <= cfg.burst_threshold {
            return None;
        }
        let base = cfg.burst_window.min(cfg.burst_base_delay_cap);
        let penalty = cfg
            .per_excess_penalty
            .saturating_mul(counter - cfg.burst_threshold)
            .min(cfg.excess_penalty_cap);
        let max_jitter_ms = cfg.max_jitter.as_millis() as u64;
        let jitter = if max_jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
        };
        Some(base + penalty + jitter)
    }

    fn release(self: &Arc<Self>, file_key: &str) {
        let Some(mut state) = self.states.get_mut(file_key) else {
            warn!(file_key = %file_key, "Release for untracked admission key");
            return;
        };
        state.active = state.active.saturating_sub(1);
        state.last_activity = Instant::now();

        while state.active < self.config.max_concurrent {
            let Some(waiter) = state.waiting.pop_front() else {
                break;
            };
            state.active += 1;
            match waiter.sender.send(AdmissionPermit::new(file_key, self)) {
                Ok(()) => {
                    self.metrics.promoted.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        file_key = %file_key,
                        ticket = waiter.ticket,
                        active = state.active,
                        queued = state.waiting.len(),
                        "Promoted queued request"
                    );
                    break;
                }
                Err(mut unclaimed) => {
                    // Receiver is gone. Disarm so the drop does not re-enter
                    // release while this shard is locked.
                    unclaimed.armed = false;
                    state.active -= 1;
                }
            }
        }
    }

    fn withdraw(&self, file_key: &str, ticket: u64) {
        if let Some(mut state) = self.states.get_mut(file_key) {
            state.waiting.retain(|w| w.ticket != ticket);
        }
    }
}

enum Admission {
    Granted(AdmissionPermit),
    Queued(u64, oneshot::Receiver<AdmissionPermit>),
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        info!(
            "Creating AdmissionController: max_concurrent={}, burst_window={:?}, burst_threshold={}, queue_timeout={:?}",
            config.max_concurrent, config.burst_window, config.burst_threshold, config.queue_timeout
        );
        Self {
            inner: Arc::new(AdmissionInner {
                states: DashMap::new(),
                config,
                metrics: AdmissionMetrics::default(),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a download slot for `file_key`.
    ///
    /// `range` is the raw Range header, used for logging only.
    pub async fn acquire(&self, file_key: &str, range: Option<&str>) -> Result<AdmissionPermit> {
        if let Some(delay) = self.register_arrival(file_key) {
            self.inner
                .metrics
                .burst_throttled
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                file_key = %file_key,
                range = ?range,
                delay_ms = delay.as_millis() as u64,
                "Burst detected, delaying request"
            );
            tokio::time::sleep(delay).await;
        }

        let (ticket, mut receiver) = match self.grant_or_enqueue(file_key) {
            Admission::Granted(permit) => return Ok(permit),
            Admission::Queued(ticket, receiver) => (ticket, receiver),
        };
        debug!(file_key = %file_key, ticket, range = ?range, "Request queued for admission");

        let queued = QueuedTicket {
            inner: &self.inner,
            file_key,
            ticket,
        };

        let outcome = match self.inner.config.queue_timeout {
            None => (&mut receiver).await.ok(),
            Some(limit) => match tokio::time::timeout(limit, &mut receiver).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    // Withdraw first; a permit sent before that is still ours.
                    drop(queued);
                    if let Ok(permit) = receiver.try_recv() {
                        return Ok(permit);
                    }
                    self.inner
                        .metrics
                        .queue_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        file_key = %file_key,
                        timeout_ms = limit.as_millis() as u64,
                        "Admission queue wait timed out"
                    );
                    return Err(GatewayError::AdmissionTimeout(format!(
                        "no download slot for {} within {:?}",
                        file_key, limit
                    )));
                }
            },
        };

        outcome.ok_or_else(|| {
            GatewayError::InternalError(format!("admission queue for {} was dropped", file_key))
        })
    }

    /// Burst bookkeeping at arrival. Returns the delay to impose, if any.
    fn register_arrival(&self, file_key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self
            .inner
            .states
            .entry(file_key.to_string())
            .or_insert_with(|| AdmissionState::new(now));
        state.last_activity = now;

        state.burst_counter = match state.last_request {
            Some(last) if now.duration_since(last) < self.inner.config.burst_window => {
                state.burst_counter.saturating_add(1)
            }
            _ => 1,
        };
        self.inner.burst_delay(state.burst_counter)
    }

    fn grant_or_enqueue(&self, file_key: &str) -> Admission {
        let now = Instant::now();
        let mut state = self
            .inner
            .states
            .entry(file_key.to_string())
            .or_insert_with(|| AdmissionState::new(now));
        state.last_request = Some(now);
        state.last_activity = now;

        if state.active < self.inner.config.max_concurrent {
            state.active += 1;
            self.inner
                .metrics
                .granted_immediately
                .fetch_add(1, Ordering::Relaxed);
            return Admission::Granted(AdmissionPermit::new(file_key, &self.inner));
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        state.waiting.push_back(Waiter { ticket, sender });
        self.inner.metrics.queued.fetch_add(1, Ordering::Relaxed);
        Admission::Queued(ticket, receiver)
    }

    /// Forget idle keys whose last activity is older than `idle_ttl`.
    /// Returns how many were removed.
    pub fn purge_idle(&self, idle_ttl: Duration) -> usize {
        let before = self.inner.states.len();
        self.inner
            .states
            .retain(|_, state| !state.is_idle() || state.last_activity.elapsed() < idle_ttl);
        before.saturating_sub(self.inner.states.len())
    }

    /// Forget idle keys using the configured idle TTL.
    pub fn purge_expired(&self) -> usize {
        self.purge_idle(self.inner.config.state_idle_ttl)
    }

    pub fn active_count(&self, file_key: &str) -> usize {
        self.inner
            .states
            .get(file_key)
            .map(|s| s.active)
            .unwrap_or(0)
    }

    pub fn queue_len(&self, file_key: &str) -> usize {
        self.inner
            .states
            .get(file_key)
            .map(|s| s.waiting.len())
            .unwrap_or(0)
    }

    pub fn burst_counter(&self, file_key: &str) -> u32 {
        self.inner
            .states
            .get(file_key)
            .map(|s| s.burst_counter)
            .unwrap_or(0)
    }

    /// Number of file keys with admission state
    pub fn tracked_keys(&self) -> usize {
        self.inner.states.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.config.max_concurrent
    }

    pub fn metrics(&self) -> AdmissionMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;
    use std::sync::atomic::AtomicUsize;

    /// For any limit and any number of concurrent requests for one key, the
    /// number of simultaneously held permits never exceeds the limit and every
    /// request is eventually served.
    #[quickcheck]
    fn prop_active_never_exceeds_limit(max_concurrent: u8, requests: u8) -> TestResult {
        let max_concurrent = (max_concurrent % 5) as usize + 1;
        let requests = (requests % 24) as usize + 1;

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
        {
            Ok(rt) => rt,
            Err(_) => return TestResult::error("runtime"),
        };

        runtime.block_on(async move {
            let controller = AdmissionController::new(AdmissionConfig {
                max_concurrent,
                max_jitter: Duration::ZERO,
                ..AdmissionConfig::default()
            });
            let in_flight = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for i in 0..requests {
                let controller = controller.clone();
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                handles.push(tokio::spawn(async move {
                    let permit = controller.acquire("prop", None).await?;
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    if controller.active_count("prop") > controller.max_concurrent() {
                        return Err(GatewayError::InternalError("over limit".into()));
                    }
                    tokio::time::sleep(Duration::from_millis(10 + (i as u64 % 7))).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                    Ok::<(), GatewayError>(())
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(Ok(())) => {}
                    _ => return TestResult::failed(),
                }
            }
            TestResult::from_bool(
                peak.load(Ordering::SeqCst) <= max_concurrent
                    && controller.active_count("prop") == 0,
            )
        })
    }
}
