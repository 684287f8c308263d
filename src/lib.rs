//! S3 Stream Gateway - range-aware HTTP file streaming over S3-compatible storage
//!
//! Serves large objects to HTTP clients with single-flight metadata lookups,
//! per-file admission control with burst throttling, and streaming sessions
//! that release every resource exactly once when they end.

pub mod admission;
pub mod client_cache;
pub mod config;
pub mod error;
pub mod health;
pub mod http_gateway;
pub mod janitor;
pub mod logging;
pub mod metadata_cache;
pub mod range_handler;
pub mod record_store;
pub mod response_headers;
pub mod s3_client;
pub mod shutdown;
pub mod single_flight;
pub mod storage_types;
pub mod stream_registry;
pub mod streaming;

pub use error::{GatewayError, Result};
