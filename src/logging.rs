//! Logging Module
//!
//! Application logging through `tracing` (console plus an optional daily
//! rolling file per host) and a one-line access log for every request,
//! emitted on the `access` target.

use crate::config::LoggingConfig;
use crate::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing target used for access log lines
pub const ACCESS_LOG_TARGET: &str = "access";

/// One served request
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub time: DateTime<Utc>,
    pub request_id: String,
    pub remote_ip: String,
    pub method: String,
    pub request_uri: String,
    pub http_status: u16,
    pub bytes_sent: u64,
    pub object_size: Option<u64>,
    pub range: Option<String>,
    pub total_time_ms: u64,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub error_code: Option<String>,
    pub host_id: String,
}

impl AccessLogEntry {
    /// Space-separated line in the style of S3 server access logs; absent
    /// fields are written as `-`.
    pub fn format(&self) -> String {
        fn field(value: &Option<String>) -> &str {
            value.as_deref().filter(|v| !v.is_empty()).unwrap_or("-")
        }

        format!(
            "[{}] {} {} {} \"{}\" {} {} {} {} {} \"{}\" \"{}\" {} {}",
            self.time.format("%d/%b/%Y:%H:%M:%S %z"),
            self.remote_ip,
            self.request_id,
            self.method,
            self.request_uri,
            self.http_status,
            field(&self.error_code),
            self.bytes_sent,
            self.object_size
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.total_time_ms,
            field(&self.referer),
            field(&self.user_agent),
            field(&self.range),
            self.host_id,
        )
    }
}

/// Sets up the global subscriber and writes access log lines.
pub struct LoggerManager {
    config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn access_log_enabled(&self) -> bool {
        self.config.access_log_enabled
    }

    /// Install the global tracing subscriber. Safe to call more than once;
    /// later calls are no-ops.
    pub fn initialize(&self) -> Result<()> {
        let host_log_dir = host_log_dir(&self.config, &self.hostname);
        if let Some(dir) = &host_log_dir {
            std::fs::create_dir_all(dir).map_err(|e| {
                GatewayError::IoError(format!("Failed to create app log directory: {}", e))
            })?;
        }

        let file_layer = host_log_dir.as_ref().map(|dir| {
            let file_appender =
                RollingFileAppender::new(Rotation::DAILY, dir.clone(), "s3-stream-gateway.log");
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .compact()
        });

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG overrides the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.filter_directive()));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = &host_log_dir {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                debug!("Tracing subscriber already initialized, skipping");
            }
        }
        Ok(())
    }

    /// Filter directive for the configured level. The access target stays
    /// at info unless access logging is disabled.
    fn filter_directive(&self) -> String {
        let access_level = if self.config.access_log_enabled {
            "info"
        } else {
            "off"
        };
        format!(
            "{},{}={}",
            self.config.log_level, ACCESS_LOG_TARGET, access_level
        )
    }

    pub fn log_access(&self, entry: &AccessLogEntry) {
        if self.config.access_log_enabled {
            info!(target: ACCESS_LOG_TARGET, "{}", entry.format());
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_access_log_entry(
        &self,
        method: &str,
        remote_ip: String,
        request_uri: String,
        http_status: u16,
        bytes_sent: u64,
        object_size: Option<u64>,
        range: Option<String>,
        total_time_ms: u64,
        user_agent: Option<String>,
        referer: Option<String>,
        error_code: Option<String>,
    ) -> AccessLogEntry {
        AccessLogEntry {
            time: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            remote_ip,
            method: method.to_string(),
            request_uri,
            http_status,
            bytes_sent,
            object_size,
            range,
            total_time_ms,
            user_agent,
            referer,
            error_code,
            host_id: self.hostname.clone(),
        }
    }
}

/// Host name used to partition log directories
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Resolved application log directory for a host, if file logging is on
pub fn host_log_dir(config: &LoggingConfig, hostname: &str) -> Option<PathBuf> {
    config.app_log_dir.as_ref().map(|dir| dir.join(hostname))
}
