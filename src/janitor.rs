//! Periodic sweeper for stale gateway state.
//!
//! Each cycle cancels streams older than the maximum stream age, drops
//! expired metadata (and its finished single-flight entries), and forgets
//! idle admission state.

use crate::admission::AdmissionController;
use crate::metadata_cache::MetadataResolver;
use crate::shutdown::ShutdownSignal;
use crate::stream_registry::StreamRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub streams_cancelled: usize,
    pub metadata_purged: usize,
    pub admission_states_purged: usize,
}

impl JanitorReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Janitor {
    registry: Arc<StreamRegistry>,
    metadata: Arc<MetadataResolver>,
    admission: AdmissionController,
    interval: Duration,
    max_stream_age: Duration,
}

impl Janitor {
    pub fn new(
        registry: Arc<StreamRegistry>,
        metadata: Arc<MetadataResolver>,
        admission: AdmissionController,
        interval: Duration,
        max_stream_age: Duration,
    ) -> Self {
        Self {
            registry,
            metadata,
            admission,
            interval,
            max_stream_age,
        }
    }

    pub async fn run_once(&self) -> JanitorReport {
        JanitorReport {
            streams_cancelled: self.registry.sweep_stale(self.max_stream_age),
            metadata_purged: self.metadata.purge_expired().await,
            admission_states_purged: self.admission.purge_expired(),
        }
    }

    /// Run sweeps every `interval` until shutdown.
    pub fn spawn(self, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting janitor (interval: {:?}, max stream age: {:?})",
                self.interval, self.max_stream_age
            );
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = self.run_once().await;
                        if report.is_empty() {
                            debug!("Janitor sweep found nothing to clean");
                        } else {
                            info!(
                                "Janitor sweep: streams_cancelled={}, metadata_purged={}, admission_states_purged={}",
                                report.streams_cancelled,
                                report.metadata_purged,
                                report.admission_states_purged
                            );
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        info!("Janitor received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}
