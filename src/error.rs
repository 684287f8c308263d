//! Error Module
//!
//! Defines error types and result types used throughout the streaming gateway.

use hyper::StatusCode;
use std::io::ErrorKind;
use thiserror::Error;

/// Main error type for the gateway
///
/// The type is `Clone` so a single-flight producer's error can be handed to
/// every caller that was waiting on the same key.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Client disconnected: {0}")]
    ClientDisconnected(String),

    #[error("Stream timeout: {0}")]
    StreamTimeout(String),

    #[error("Admission timeout: {0}")]
    AdmissionTimeout(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl GatewayError {
    /// HTTP status the gateway answers with when this error happens before
    /// response headers have been sent.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::StreamTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            GatewayError::AdmissionTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            // Nobody is left to read a response, but keep the mapping total.
            GatewayError::ClientDisconnected(_) => StatusCode::BAD_REQUEST,
            GatewayError::BackendUnavailable(_)
            | GatewayError::IoError(_)
            | GatewayError::HttpError(_)
            | GatewayError::ConfigError(_)
            | GatewayError::SerializationError(_)
            | GatewayError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error was caused by the client going away (reset, broken
    /// pipe, premature close, abort). Such errors are logged at reduced
    /// severity and never turned into a user-facing failure.
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            GatewayError::ClientDisconnected(_) => true,
            GatewayError::IoError(msg) | GatewayError::HttpError(msg) => {
                is_disconnect_message(msg)
            }
            _ => false,
        }
    }
}

/// Matches the wording hyper and the OS use for peer-initiated disconnects.
pub(crate) fn is_disconnect_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("connection reset")
        || msg.contains("reset by peer")
        || msg.contains("broken pipe")
        || msg.contains("connection closed")
        || msg.contains("connection aborted")
        || msg.contains("premature close")
        || msg.contains("canceled")
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => GatewayError::ClientDisconnected(err.to_string()),
            _ => GatewayError::IoError(err.to_string()),
        }
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        if err.is_canceled() || err.is_incomplete_message() {
            GatewayError::ClientDisconnected(err.to_string())
        } else {
            GatewayError::HttpError(err.to_string())
        }
    }
}

impl From<hyper::http::Error> for GatewayError {
    fn from(err: hyper::http::Error) -> Self {
        GatewayError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::SerializationError(err.to_string())
    }
}

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
