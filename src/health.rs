//! Health Check Module
//!
//! Reports gateway status and per-component counters on `/health`.

use crate::admission::{AdmissionController, AdmissionMetricsSnapshot};
use crate::client_cache::{ClientCacheMetricsSnapshot, StorageClientCache};
use crate::metadata_cache::{MetadataMetricsSnapshot, MetadataResolver};
use crate::streaming::{StreamingMetricsSnapshot, StreamingPipeline};
use crate::{GatewayError, Result};
use chrono::Utc;
use hyper::{header, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Component health information
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayCounters {
    pub streaming: StreamingMetricsSnapshot,
    pub admission: AdmissionMetricsSnapshot,
    pub metadata: MetadataMetricsSnapshot,
    pub storage_clients: ClientCacheMetricsSnapshot,
}

/// Overall gateway health
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub timestamp: String,
    pub uptime_seconds: u64,
    pub version: &'static str,
    pub build_timestamp: &'static str,
    pub components: Vec<ComponentHealth>,
    pub counters: GatewayCounters,
}

/// Health check manager
pub struct HealthManager {
    start_time: Instant,
    pipeline: StreamingPipeline,
    admission: AdmissionController,
    metadata: Arc<MetadataResolver>,
    clients: Arc<StorageClientCache>,
    shutdown: CancellationToken,
    last_health_check: RwLock<Option<SystemHealth>>,
}

impl HealthManager {
    pub fn new(
        pipeline: StreamingPipeline,
        admission: AdmissionController,
        metadata: Arc<MetadataResolver>,
        clients: Arc<StorageClientCache>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            pipeline,
            admission,
            metadata,
            clients,
            shutdown,
            last_health_check: RwLock::new(None),
        }
    }

    pub async fn check_health(&self) -> SystemHealth {
        let registry = self.pipeline.registry();
        let mut components = vec![
            ComponentHealth {
                name: "streams".to_string(),
                status: HealthStatus::Healthy,
                message: Some(format!("{} active", registry.len())),
            },
            ComponentHealth {
                name: "admission".to_string(),
                status: HealthStatus::Healthy,
                message: Some(format!(
                    "{} tracked files, limit {} per file",
                    self.admission.tracked_keys(),
                    self.admission.max_concurrent()
                )),
            },
            ComponentHealth {
                name: "metadata".to_string(),
                status: HealthStatus::Healthy,
                message: Some(format!(
                    "{} cached, {} in flight",
                    self.metadata.len().await,
                    self.metadata.lock_count()
                )),
            },
            ComponentHealth {
                name: "storage_clients".to_string(),
                status: HealthStatus::Healthy,
                message: Some(format!("{} cached", self.clients.len())),
            },
        ];

        if self.shutdown.is_cancelled() {
            components.push(ComponentHealth {
                name: "server".to_string(),
                status: HealthStatus::Unhealthy,
                message: Some("shutting down".to_string()),
            });
        }

        let health = SystemHealth {
            status: determine_overall_status(&components),
            timestamp: Utc::now().to_rfc3339(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
            build_timestamp: env!("BUILD_TIMESTAMP"),
            components,
            counters: GatewayCounters {
                streaming: self.pipeline.metrics(),
                admission: self.admission.metrics(),
                metadata: self.metadata.metrics(),
                storage_clients: self.clients.metrics(),
            },
        };

        *self.last_health_check.write().await = Some(health.clone());
        health
    }

    /// Handle health check HTTP request
    pub async fn handle_health_request(&self) -> Result<Response<String>> {
        let health = self.check_health().await;

        let status_code = match health.status {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };

        let body = serde_json::to_string_pretty(&health).map_err(|e| {
            GatewayError::SerializationError(format!("Failed to serialize health status: {}", e))
        })?;

        Response::builder()
            .status(status_code)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CACHE_CONTROL, "no-store")
            .body(body)
            .map_err(|e| GatewayError::HttpError(format!("Failed to build health response: {}", e)))
    }

    /// Most recent health result, without recomputing
    pub async fn get_cached_health(&self) -> Option<SystemHealth> {
        self.last_health_check.read().await.clone()
    }
}

fn determine_overall_status(components: &[ComponentHealth]) -> HealthStatus {
    if components
        .iter()
        .any(|c| c.status == HealthStatus::Unhealthy)
    {
        HealthStatus::Unhealthy
    } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
