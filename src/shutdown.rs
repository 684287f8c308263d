//! Graceful Shutdown Module
//!
//! Signal handling and the shutdown sequence: stop accepting, let active
//! streams drain, cancel whatever is left, then close cached storage clients.

use crate::client_cache::StorageClientCache;
use crate::stream_registry::StreamRegistry;
use crate::{GatewayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the drain step re-checks the registry
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time cancelled streams get to deregister
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Shutdown coordinator for graceful gateway shutdown
pub struct ShutdownCoordinator {
    registry: Option<Arc<StreamRegistry>>,
    clients: Option<Arc<StorageClientCache>>,
    shutdown_sender: broadcast::Sender<()>,
    requested: CancellationToken,
    shutdown_timeout: Duration,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration, drain_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            registry: None,
            clients: None,
            shutdown_sender,
            requested: CancellationToken::new(),
            shutdown_timeout,
            drain_timeout,
        }
    }

    pub fn set_stream_registry(&mut self, registry: Arc<StreamRegistry>) {
        self.registry = Some(registry);
    }

    pub fn set_client_cache(&mut self, clients: Arc<StorageClientCache>) {
        self.clients = Some(clients);
    }

    /// Shutdown receiver for components that must stop on shutdown
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.shutdown_sender.subscribe())
    }

    /// Cancelled once shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.requested.clone()
    }

    /// Wait for SIGINT or SIGTERM, then run the shutdown sequence.
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                GatewayError::InternalError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                GatewayError::InternalError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");
        self.requested.cancel();

        if let Err(e) = self.shutdown_sender.send(()) {
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(()) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}, forcing shutdown",
                    self.shutdown_timeout
                );
                Err(GatewayError::StreamTimeout(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }

    async fn perform_shutdown(&self) {
        if let Some(registry) = &self.registry {
            let active = registry.len();
            if active > 0 {
                info!("Waiting up to {:?} for {} streams to finish", self.drain_timeout, active);
                if timeout(self.drain_timeout, wait_for_drain(registry)).await.is_err() {
                    let cancelled = registry.cancel_all();
                    warn!("Drain timeout reached, cancelled {} streams", cancelled);
                    if timeout(CANCEL_GRACE, wait_for_drain(registry)).await.is_err() {
                        warn!(
                            "{} streams still registered after cancellation",
                            registry.len()
                        );
                    }
                } else {
                    info!("All streams drained");
                }
            }
        }

        if let Some(clients) = &self.clients {
            let evicted = clients.evict(None).await;
            info!("Closed {} storage clients", evicted);
        }

        info!("Shutdown operations completed");
    }
}

async fn wait_for_drain(registry: &StreamRegistry) {
    while !registry.is_empty() {
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Resolves on the shutdown broadcast, or when the coordinator is gone.
    pub async fn wait_for_shutdown(&mut self) {
        if self.shutdown_requested {
            return;
        }
        // Every outcome (signal, closed, lagged) means shutdown
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }
}
