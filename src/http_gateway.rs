//! HTTP Gateway Module
//!
//! Accept loop, per-connection service and request routing.
//!
//! Routes:
//! - `GET|HEAD|OPTIONS /files/{fileName}`: file delivery
//! - `GET /health`: JSON health report
//! - `GET /streams`: JSON snapshot of active streams

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::client_cache::StorageClientCache;
use crate::config::Config;
use crate::health::HealthManager;
use crate::logging::{AccessLogEntry, LoggerManager};
use crate::metadata_cache::MetadataResolver;
use crate::range_handler::{content_range_header, parse_range, unsatisfied_range_header, RangeSpec};
use crate::record_store::RecordStore;
use crate::response_headers::{etag_matches, with_cors, FileHeaders};
use crate::s3_client::{BackendConnector, ByteStream, ObjectStorageBackend};
use crate::storage_types::{FileMetadata, FileRecord, StorageConfig};
use crate::stream_registry::StreamRegistry;
use crate::streaming::{GatewayBody, StreamRequest, StreamTermination, StreamingPipeline};
use crate::{GatewayError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{self, HeaderMap};
use hyper::http::response::Builder;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FILES_PREFIX: &str = "/files/";

/// Seconds a client is told to wait after an admission timeout
const ADMISSION_RETRY_AFTER: &str = "5";

/// Resolves to how a streamed response body ended
type StreamCompletion = JoinHandle<StreamTermination>;

/// Every component a request handler touches
pub struct GatewayState {
    pub records: Arc<dyn RecordStore>,
    pub clients: Arc<StorageClientCache>,
    pub metadata: Arc<MetadataResolver>,
    pub admission: AdmissionController,
    pub pipeline: StreamingPipeline,
    pub health: Arc<HealthManager>,
    pub logger: Option<Arc<LoggerManager>>,
}

impl GatewayState {
    /// Build every component from `config`. `shutdown` is reported by the
    /// health endpoint once cancelled.
    pub fn from_config(
        config: &Config,
        records: Arc<dyn RecordStore>,
        connector: Arc<dyn BackendConnector>,
        shutdown: CancellationToken,
        logger: Option<Arc<LoggerManager>>,
    ) -> Self {
        let clients = Arc::new(StorageClientCache::new(connector));
        let metadata = Arc::new(MetadataResolver::new((&config.metadata).into()));
        let admission = AdmissionController::new(config.admission.clone());
        let pipeline = StreamingPipeline::new(
            Arc::new(StreamRegistry::new()),
            config.streaming.idle_timeout,
            config.streaming.channel_capacity,
            config.logging.debug_streaming,
        );
        let health = Arc::new(HealthManager::new(
            pipeline.clone(),
            admission.clone(),
            Arc::clone(&metadata),
            Arc::clone(&clients),
            shutdown,
        ));

        Self {
            records,
            clients,
            metadata,
            admission,
            pipeline,
            health,
            logger,
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        self.pipeline.registry()
    }
}

/// Everything needed to answer for one file, resolved before any body is sent
struct ResolvedFile {
    record: FileRecord,
    storage: StorageConfig,
    backend: Arc<dyn ObjectStorageBackend>,
    metadata: FileMetadata,
    headers: FileHeaders,
}

/// HTTP gateway server
pub struct HttpGateway {
    listen_addr: SocketAddr,
    state: Arc<GatewayState>,
    active_connections: Arc<AtomicUsize>,
    drain_timeout: Duration,
}

impl HttpGateway {
    pub fn new(listen_addr: SocketAddr, state: Arc<GatewayState>, drain_timeout: Duration) -> Self {
        Self {
            listen_addr,
            state,
            active_connections: Arc::new(AtomicUsize::new(0)),
            drain_timeout,
        }
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(&self, shutdown_signal: crate::shutdown::ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener, shutdown_signal).await
    }

    /// Serve connections from `listener` until shutdown, then drain
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_signal: crate::shutdown::ShutdownSignal,
    ) -> Result<()> {
        info!("HTTP gateway listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);

                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                            }

                            let state = Arc::clone(&self.state);
                            let active_connections = Arc::clone(&self.active_connections);
                            tokio::spawn(async move {
                                Self::serve_connection(stream, addr, state, active_connections).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP gateway received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        let drain_start = Instant::now();
        let active = self.active_connections();
        if active > 0 {
            info!(
                "HTTP gateway draining {} active connections (timeout: {:?})",
                active, self.drain_timeout
            );
            while self.active_connections() > 0 && drain_start.elapsed() < self.drain_timeout {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let remaining = self.active_connections();
            if remaining > 0 {
                warn!("HTTP gateway shutdown with {} connections still active", remaining);
            } else {
                info!("HTTP gateway all connections drained");
            }
        }

        info!("HTTP gateway stopped");
        Ok(())
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<GatewayState>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let io = TokioIo::new(stream);
        active_connections.fetch_add(1, Ordering::Relaxed);

        // Cancelled when this connection ends, for whatever reason
        let connection = CancellationToken::new();
        let _closed = connection.clone().drop_guard();

        let service = service_fn(move |req| {
            let state = Arc::clone(&state);
            let connection = connection.child_token();
            async move { Self::handle_request(req, addr, state, connection).await }
        });

        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            let gateway_err = GatewayError::from(err);
            if gateway_err.is_client_disconnect() {
                debug!("Client disconnected from {}: {}", addr, gateway_err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, gateway_err);
            }
        }

        active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Handle a single HTTP request. Request bodies are never read.
    pub async fn handle_request<B>(
        req: Request<B>,
        client_addr: SocketAddr,
        state: Arc<GatewayState>,
        connection: CancellationToken,
    ) -> std::result::Result<Response<GatewayBody>, Infallible> {
        let start_time = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();
        let headers = req.headers().clone();

        debug!("Processing {} {} from {}", method, uri, client_addr);

        let (response, completion) =
            Self::route(&method, uri.path(), &headers, &state, connection).await;

        if let Some(logger) = state.logger.clone() {
            let status = response.status();
            let object_size = response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let access = AccessContext {
                method: method.to_string(),
                remote_ip: client_addr.ip().to_string(),
                request_uri: uri.to_string(),
                range: header_string(&headers, header::RANGE),
                user_agent: header_string(&headers, header::USER_AGENT),
                referer: header_string(&headers, header::REFERER),
                start_time,
            };

            match completion {
                // Streamed bodies are logged once the stream has ended
                Some(completion) => {
                    tokio::spawn(async move {
                        let termination = completion.await.unwrap_or_else(|e| {
                            warn!("Stream task failed: {}", e);
                            StreamTermination::Aborted { bytes: 0 }
                        });
                        let entry = access.streamed_entry(&logger, status, object_size, &termination);
                        logger.log_access(&entry);
                    });
                }
                None => {
                    let bytes_sent = if method == Method::HEAD {
                        0
                    } else {
                        object_size.unwrap_or(0)
                    };
                    let entry = access.entry(
                        &logger,
                        status,
                        bytes_sent,
                        object_size,
                        status_error_code(status),
                    );
                    logger.log_access(&entry);
                }
            }
        }

        Ok(response)
    }

    async fn route(
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        state: &Arc<GatewayState>,
        connection: CancellationToken,
    ) -> (Response<GatewayBody>, Option<StreamCompletion>) {
        if let Some(raw_name) = path.strip_prefix(FILES_PREFIX) {
            let file_name = match percent_decode_str(raw_name).decode_utf8() {
                Ok(name) if !name.is_empty() => name.into_owned(),
                Ok(_) => {
                    return (json_error(StatusCode::BAD_REQUEST, "fileName is required"), None)
                }
                Err(_) => return (json_error(StatusCode::BAD_REQUEST, "Invalid file name"), None),
            };

            return match *method {
                Method::GET => {
                    match Self::handle_file_get(&file_name, headers, state, connection).await {
                        Ok((response, completion)) => (response, Some(completion)),
                        Err(response) => (response, None),
                    }
                }
                Method::HEAD => (Self::handle_file_head(&file_name, headers, state).await, None),
                Method::OPTIONS => (preflight_response(), None),
                _ => (method_not_allowed("GET, HEAD, OPTIONS"), None),
            };
        }

        (Self::route_service(method, path, state).await, None)
    }

    async fn route_service(
        method: &Method,
        path: &str,
        state: &Arc<GatewayState>,
    ) -> Response<GatewayBody> {
        match (method, path) {
            (&Method::GET, "/health") | (&Method::HEAD, "/health") => {
                match state.health.handle_health_request().await {
                    Ok(response) => response.map(full),
                    Err(e) => {
                        error!("Health check failed: {}", e);
                        json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                    }
                }
            }
            (&Method::GET, "/streams") => {
                match serde_json::to_string(&state.registry().snapshot()) {
                    Ok(body) => finish(
                        Response::builder()
                            .status(StatusCode::OK)
                            .header(header::CONTENT_TYPE, "application/json")
                            .header(header::CACHE_CONTROL, "no-store"),
                        full(body),
                    ),
                    Err(e) => {
                        error!("Failed to serialize stream snapshot: {}", e);
                        json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                    }
                }
            }
            (_, "/health") | (_, "/streams") => method_not_allowed("GET"),
            _ => json_error(StatusCode::NOT_FOUND, "Not found"),
        }
    }

    /// GET of a file. `Err` carries a finished response with no stream
    /// behind it (errors, 304, 416).
    async fn handle_file_get(
        file_name: &str,
        headers: &HeaderMap,
        state: &Arc<GatewayState>,
        connection: CancellationToken,
    ) -> std::result::Result<(Response<GatewayBody>, StreamCompletion), Response<GatewayBody>> {
        let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

        let permit = match state.admission.acquire(file_name, range_header).await {
            Ok(permit) => permit,
            Err(e) => return Err(error_response(&e)),
        };

        let resolved = Self::resolve_file(file_name, state).await?;

        if let Some(response) = not_modified(headers, &resolved.headers) {
            return Err(response);
        }

        let size = resolved.metadata.size_bytes;
        let range = parse_range(range_header, size);
        if !range.valid {
            warn!(
                file_key = %file_name,
                range = ?range_header,
                size,
                "Invalid range request"
            );
            return Err(range_not_satisfiable(size));
        }
        if range.is_partial() {
            log_streaming(
                state,
                file_name,
                &format!("Range validated: bytes {}-{}/{}", range.start, range.end, size),
            );
        }

        let backend_stream = match Self::open_stream(&resolved, &range).await {
            Ok(stream) => stream,
            Err(GatewayError::NotFound(_)) => {
                return Err(json_error(StatusCode::NOT_FOUND, "File not found"))
            }
            Err(e) => {
                error!(file_key = %file_name, error = %e, "Failed to open backend stream");
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to download file from storage",
                ));
            }
        };

        Self::stream_response(file_name, resolved, range, backend_stream, permit, state, connection)
            .await
    }

    async fn stream_response(
        file_name: &str,
        resolved: ResolvedFile,
        range: RangeSpec,
        backend: ByteStream,
        permit: AdmissionPermit,
        state: &Arc<GatewayState>,
        connection: CancellationToken,
    ) -> std::result::Result<(Response<GatewayBody>, StreamCompletion), Response<GatewayBody>> {
        let size = resolved.metadata.size_bytes;
        let handle = match state
            .pipeline
            .start(StreamRequest {
                file_key: file_name.to_string(),
                backend,
                permit: Some(permit),
                connection,
            })
            .await
        {
            Ok(handle) => handle,
            Err(e @ GatewayError::StreamTimeout(_)) => {
                warn!(file_key = %file_name, error = %e, "No data from backend before idle timeout");
                return Err(json_error(
                    StatusCode::REQUEST_TIMEOUT,
                    "Request timeout - no activity",
                ));
            }
            Err(e) if e.is_client_disconnect() => {
                debug!(file_key = %file_name, "Client left before streaming began");
                return Err(finish(Response::builder().status(e.status_code()), empty()));
            }
            Err(e) => {
                error!(file_key = %file_name, error = %e, "File stream error");
                return Err(json_error(StatusCode::INTERNAL_SERVER_ERROR, "Stream error"));
            }
        };

        let mut builder = resolved
            .headers
            .apply(Response::builder())
            .header(header::CONTENT_LENGTH, range.content_length(size));
        builder = if range.is_partial() {
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, content_range_header(&range, size))
        } else {
            builder.status(StatusCode::OK)
        };

        log_streaming(
            state,
            file_name,
            &format!(
                "Streaming {} ({}) as stream {}",
                file_name,
                if range.is_partial() {
                    format!("{}-{}", range.start, range.end)
                } else {
                    "full".to_string()
                },
                handle.id
            ),
        );
        Ok((finish(builder, handle.body), handle.completion))
    }

    /// Same headers as GET without admission, backend stream, or body
    async fn handle_file_head(
        file_name: &str,
        headers: &HeaderMap,
        state: &Arc<GatewayState>,
    ) -> Response<GatewayBody> {
        let resolved = match Self::resolve_file(file_name, state).await {
            Ok(resolved) => resolved,
            Err(response) => return response,
        };

        if let Some(response) = not_modified(headers, &resolved.headers) {
            return response;
        }

        let size = resolved.metadata.size_bytes;
        let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
        let range = parse_range(range_header, size);
        if !range.valid {
            return range_not_satisfiable(size);
        }

        let builder = resolved
            .headers
            .apply(Response::builder())
            .header(header::CONTENT_LENGTH, range.content_length(size));
        let builder = if range.is_partial() {
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, content_range_header(&range, size))
        } else {
            builder.status(StatusCode::OK)
        };
        finish(builder, empty())
    }

    /// Record, storage account, client and metadata for `file_name`, or the
    /// error response to send instead.
    async fn resolve_file(
        file_name: &str,
        state: &GatewayState,
    ) -> std::result::Result<ResolvedFile, Response<GatewayBody>> {
        let record = match state.records.lookup_file_by_name(file_name).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(file_key = %file_name, "No file record");
                return Err(json_error(StatusCode::NOT_FOUND, "File not found in database"));
            }
            Err(e) => {
                error!(file_key = %file_name, error = %e, "File record lookup failed");
                return Err(error_response(&e));
            }
        };

        let storage = match state
            .records
            .lookup_storage_config_by_id(&record.storage_location_id)
            .await
        {
            Ok(Some(storage)) => storage,
            Ok(None) => {
                error!(
                    file_key = %file_name,
                    storage_location_id = %record.storage_location_id,
                    "File record references unknown storage"
                );
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Storage configuration not found",
                ));
            }
            Err(e) => {
                error!(file_key = %file_name, error = %e, "Storage lookup failed");
                return Err(error_response(&e));
            }
        };

        let backend = state.clients.get_client(&storage).await.map_err(|e| {
            error!(client = %storage.client_key(), error = %e, "Storage client unavailable");
            error_response(&e)
        })?;

        let metadata = match state
            .metadata
            .resolve(file_name, backend.as_ref(), &storage.bucket_name, &record.file_path)
            .await
        {
            Ok(metadata) => metadata,
            Err(GatewayError::NotFound(_)) => {
                return Err(json_error(StatusCode::NOT_FOUND, "File not found"))
            }
            Err(e) => {
                error!(file_key = %file_name, error = %e, "Metadata lookup failed");
                return Err(error_response(&e));
            }
        };

        let headers = FileHeaders::new(
            file_name,
            metadata.content_type.as_deref(),
            metadata.last_modified.as_deref(),
            metadata.size_bytes,
        );

        Ok(ResolvedFile {
            record,
            storage,
            backend,
            metadata,
            headers,
        })
    }

    async fn open_stream(resolved: &ResolvedFile, range: &RangeSpec) -> Result<ByteStream> {
        let bucket = &resolved.storage.bucket_name;
        let key = &resolved.record.file_path;
        if range.is_partial() {
            resolved
                .backend
                .get_object_range(bucket, key, range.start, range.end)
                .await
        } else {
            resolved.backend.get_object(bucket, key).await
        }
    }
}

/// Request fields captured for the access log line
struct AccessContext {
    method: String,
    remote_ip: String,
    request_uri: String,
    range: Option<String>,
    user_agent: Option<String>,
    referer: Option<String>,
    start_time: Instant,
}

impl AccessContext {
    fn entry(
        self,
        logger: &LoggerManager,
        status: StatusCode,
        bytes_sent: u64,
        object_size: Option<u64>,
        error_code: Option<String>,
    ) -> AccessLogEntry {
        logger.create_access_log_entry(
            &self.method,
            self.remote_ip,
            self.request_uri,
            status.as_u16(),
            bytes_sent,
            object_size,
            self.range,
            self.start_time.elapsed().as_millis() as u64,
            self.user_agent,
            self.referer,
            error_code,
        )
    }

    /// Entry for a streamed body: bytes actually delivered, and the way the
    /// stream ended when it did not complete.
    fn streamed_entry(
        self,
        logger: &LoggerManager,
        status: StatusCode,
        object_size: Option<u64>,
        termination: &StreamTermination,
    ) -> AccessLogEntry {
        let error_code = match termination {
            StreamTermination::Completed { .. } => status_error_code(status),
            other => Some(other.label().to_string()),
        };
        self.entry(logger, status, termination.bytes(), object_size, error_code)
    }
}

fn status_error_code(status: StatusCode) -> Option<String> {
    if status.is_client_error() || status.is_server_error() {
        Some(status.as_u16().to_string())
    } else {
        None
    }
}

fn log_streaming(state: &GatewayState, file_name: &str, message: &str) {
    if state.pipeline.is_verbose() {
        info!(file_key = %file_name, "{}", message);
    } else {
        debug!(file_key = %file_name, "{}", message);
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn full<T: Into<Bytes>>(chunk: T) -> GatewayBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

fn empty() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Build the response, falling back to a bare 500 if a header value was invalid
fn finish(builder: Builder, body: GatewayBody) -> Response<GatewayBody> {
    builder.body(body).unwrap_or_else(|e| {
        error!("Failed to build response: {}", e);
        let mut response = Response::new(empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

/// JSON error body: `{"success": false, "message": …}`
pub fn json_error(status: StatusCode, message: &str) -> Response<GatewayBody> {
    let body = serde_json::json!({
        "success": false,
        "message": message,
    })
    .to_string();
    finish(
        with_cors(Response::builder())
            .status(status)
            .header(header::CONTENT_TYPE, "application/json"),
        full(body),
    )
}

/// Error response for failures that have no more specific message
fn error_response(err: &GatewayError) -> Response<GatewayBody> {
    match err {
        GatewayError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "File not found"),
        GatewayError::AdmissionTimeout(_) => {
            let mut response =
                json_error(StatusCode::SERVICE_UNAVAILABLE, "Too many concurrent downloads");
            response.headers_mut().insert(
                header::RETRY_AFTER,
                header::HeaderValue::from_static(ADMISSION_RETRY_AFTER),
            );
            response
        }
        other => json_error(other.status_code(), "Internal server error"),
    }
}

fn not_modified(headers: &HeaderMap, file_headers: &FileHeaders) -> Option<Response<GatewayBody>> {
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())?;
    if !etag_matches(if_none_match, &file_headers.etag) {
        return None;
    }
    Some(finish(
        with_cors(Response::builder())
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, &file_headers.etag)
            .header(header::CACHE_CONTROL, file_headers.cache_control),
        empty(),
    ))
}

fn range_not_satisfiable(size: u64) -> Response<GatewayBody> {
    finish(
        with_cors(Response::builder())
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, unsatisfied_range_header(size))
            .header(header::CONTENT_TYPE, "text/plain"),
        empty(),
    )
}

fn preflight_response() -> Response<GatewayBody> {
    finish(
        with_cors(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .header(header::ACCESS_CONTROL_MAX_AGE, "86400"),
        empty(),
    )
}

fn method_not_allowed(allow: &'static str) -> Response<GatewayBody> {
    let mut response = json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    response
        .headers_mut()
        .insert(header::ALLOW, header::HeaderValue::from_static(allow));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response<GatewayBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_json_error_shape() {
        let response = json_error(StatusCode::NOT_FOUND, "File not found in database");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "File not found in database");
    }

    #[tokio::test]
    async fn test_admission_timeout_sets_retry_after() {
        let response = error_response(&GatewayError::AdmissionTimeout("busy".into()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], ADMISSION_RETRY_AFTER);
    }

    #[test]
    fn test_not_modified_requires_matching_etag() {
        let file_headers = FileHeaders::new("a.mp4", None, None, 10);
        let mut headers = HeaderMap::new();
        assert!(not_modified(&headers, &file_headers).is_none());

        headers.insert(header::IF_NONE_MATCH, "\"stale\"".parse().unwrap());
        assert!(not_modified(&headers, &file_headers).is_none());

        headers.insert(header::IF_NONE_MATCH, file_headers.etag.parse().unwrap());
        let response = not_modified(&headers, &file_headers).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(!response.headers().contains_key(header::CONTENT_LENGTH));
    }

    #[test]
    fn test_unsatisfiable_range_response() {
        let response = range_not_satisfiable(1000);
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");
    }

    fn access_context() -> AccessContext {
        AccessContext {
            method: "GET".to_string(),
            remote_ip: "10.0.0.1".to_string(),
            request_uri: "/files/clip.mp4".to_string(),
            range: None,
            user_agent: None,
            referer: None,
            start_time: Instant::now(),
        }
    }

    #[test]
    fn test_streamed_access_entry_reports_delivered_bytes() {
        let logger = LoggerManager::new(Default::default(), "host-a".to_string());

        let entry = access_context().streamed_entry(
            &logger,
            StatusCode::OK,
            Some(256),
            &StreamTermination::Aborted { bytes: 24 },
        );
        assert_eq!(entry.bytes_sent, 24);
        assert_eq!(entry.object_size, Some(256));
        assert_eq!(entry.error_code.as_deref(), Some("aborted"));

        let entry = access_context().streamed_entry(
            &logger,
            StatusCode::PARTIAL_CONTENT,
            Some(10),
            &StreamTermination::Completed { bytes: 10 },
        );
        assert_eq!(entry.bytes_sent, 10);
        assert_eq!(entry.http_status, 206);
        assert!(entry.error_code.is_none());

        let entry = access_context().streamed_entry(
            &logger,
            StatusCode::OK,
            Some(256),
            &StreamTermination::TimedOut { bytes: 0 },
        );
        assert_eq!(entry.error_code.as_deref(), Some("timed_out"));
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let response = method_not_allowed("GET, HEAD, OPTIONS");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, HEAD, OPTIONS");
    }
}
