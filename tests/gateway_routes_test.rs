//! Request handling tests for the gateway routes, driven through
//! `HttpGateway::handle_request` against an in-memory backend.

mod common;

use common::{harness, quiet_config, sample_bytes, wait_until, Harness, MemoryBackend, LAST_MODIFIED};
use http_body_util::BodyExt;
use hyper::{header, Method, Request, Response, StatusCode};
use s3_stream_gateway::http_gateway::{GatewayState, HttpGateway};
use s3_stream_gateway::record_store::CatalogRecordStore;
use s3_stream_gateway::storage_types::FileRecord;
use s3_stream_gateway::streaming::GatewayBody;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MOVIE: &str = "movie.mp4";

fn movie_harness(len: usize) -> Harness {
    let backend = MemoryBackend::new(16);
    backend.put("videos/movie.mp4", sample_bytes(len), Some("video/mp4"));
    harness(&quiet_config(), backend, &[(MOVIE, "videos/movie.mp4")])
}

fn request(method: Method, uri: &str) -> Request<()> {
    Request::builder().method(method).uri(uri).body(()).unwrap()
}

fn get_with(uri: &str, name: header::HeaderName, value: &str) -> Request<()> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(name, value)
        .body(())
        .unwrap()
}

async fn send(state: &Arc<GatewayState>, req: Request<()>) -> Response<GatewayBody> {
    HttpGateway::handle_request(
        req,
        "127.0.0.1:40000".parse().unwrap(),
        Arc::clone(state),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

async fn body_bytes(response: Response<GatewayBody>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

async fn body_json(response: Response<GatewayBody>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn header_str<'a>(response: &'a Response<GatewayBody>, name: header::HeaderName) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

#[tokio::test]
async fn test_full_get_streams_whole_object() {
    let h = movie_harness(100);

    let response = send(&h.state, request(Method::GET, "/files/movie.mp4")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "100");
    assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/mp4");
    assert_eq!(header_str(&response, header::ACCEPT_RANGES), "bytes");
    assert_eq!(header_str(&response, header::LAST_MODIFIED), LAST_MODIFIED);
    assert_eq!(header_str(&response, header::ACCESS_CONTROL_ALLOW_ORIGIN), "*");
    assert!(header_str(&response, header::CONTENT_DISPOSITION).starts_with("inline"));
    let etag = header_str(&response, header::ETAG).to_string();
    assert!(etag.starts_with('"') && etag.ends_with('"'));

    assert_eq!(body_bytes(response).await, sample_bytes(100));

    let registry = Arc::clone(h.state.registry());
    assert!(wait_until(|| registry.is_empty()).await);
    assert!(wait_until(|| h.backend.open_stream_count() == 0).await);
    assert_eq!(h.state.admission.active_count(MOVIE), 0);
}

#[tokio::test]
async fn test_range_get_returns_partial_content() {
    let h = movie_harness(100);

    let response = send(&h.state, get_with("/files/movie.mp4", header::RANGE, "bytes=10-19")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 10-19/100");
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "10");
    assert_eq!(body_bytes(response).await, sample_bytes(100)[10..20].to_vec());
    assert_eq!(*h.backend.ranges.lock().unwrap(), vec![(10, 19)]);
}

#[tokio::test]
async fn test_open_ended_and_overlong_ranges_are_clamped() {
    let h = movie_harness(100);

    let response = send(&h.state, get_with("/files/movie.mp4", header::RANGE, "bytes=95-")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 95-99/100");
    assert_eq!(body_bytes(response).await.len(), 5);

    let response = send(&h.state, get_with("/files/movie.mp4", header::RANGE, "bytes=90-5000")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 90-99/100");
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "10");
}

#[tokio::test]
async fn test_missing_start_reads_from_zero() {
    let h = movie_harness(100);

    let response = send(&h.state, get_with("/files/movie.mp4", header::RANGE, "bytes=-10")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 0-10/100");
    assert_eq!(body_bytes(response).await.len(), 11);
}

#[tokio::test]
async fn test_malformed_range_serves_full_object() {
    let h = movie_harness(100);

    let response = send(&h.state, get_with("/files/movie.mp4", header::RANGE, "items=0-10")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "100");
    assert!(response.headers().get(header::CONTENT_RANGE).is_none());
}

#[tokio::test]
async fn test_unsatisfiable_range_is_416_without_backend_read() {
    let h = movie_harness(100);

    let response = send(&h.state, get_with("/files/movie.mp4", header::RANGE, "bytes=200-300")).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes */100");
    assert_eq!(h.backend.get_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.state.admission.active_count(MOVIE), 0);
    assert!(h.state.registry().is_empty());

    let response = send(&h.state, get_with("/files/movie.mp4", header::RANGE, "bytes=50-10")).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn test_empty_object_ignores_range() {
    let backend = MemoryBackend::new(16);
    backend.put("empty.txt", Vec::<u8>::new(), None);
    let h = harness(&quiet_config(), backend, &[("empty.txt", "empty.txt")]);

    let response = send(&h.state, get_with("/files/empty.txt", header::RANGE, "bytes=0-10")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "0");
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_matching_etag_yields_304() {
    let h = movie_harness(100);

    let head = send(&h.state, request(Method::HEAD, "/files/movie.mp4")).await;
    let etag = header_str(&head, header::ETAG).to_string();

    let response = send(&h.state, get_with("/files/movie.mp4", header::IF_NONE_MATCH, &etag)).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header_str(&response, header::ETAG), etag);
    assert!(body_bytes(response).await.is_empty());
    assert_eq!(h.backend.get_calls.load(Ordering::SeqCst), 0);

    let response = send(
        &h.state,
        get_with("/files/movie.mp4", header::IF_NONE_MATCH, "\"something-else\""),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_head_reports_headers_without_streaming() {
    let h = movie_harness(100);

    let response = send(&h.state, request(Method::HEAD, "/files/movie.mp4")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_LENGTH), "100");
    assert_eq!(header_str(&response, header::CONTENT_TYPE), "video/mp4");
    assert!(body_bytes(response).await.is_empty());

    let mut ranged = request(Method::HEAD, "/files/movie.mp4");
    ranged
        .headers_mut()
        .insert(header::RANGE, "bytes=0-9".parse().unwrap());
    let response = send(&h.state, ranged).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, header::CONTENT_RANGE), "bytes 0-9/100");

    assert_eq!(h.backend.get_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.state.admission.tracked_keys(), 0);
    assert_eq!(h.state.pipeline.metrics().started, 0);
}

#[tokio::test]
async fn test_options_preflight() {
    let h = movie_harness(10);

    let response = send(&h.state, request(Method::OPTIONS, "/files/movie.mp4")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, header::ACCESS_CONTROL_ALLOW_ORIGIN), "*");
    assert!(header_str(&response, header::ACCESS_CONTROL_ALLOW_METHODS).contains("GET"));
    assert!(header_str(&response, header::ACCESS_CONTROL_ALLOW_HEADERS).contains("Range"));
    assert_eq!(header_str(&response, header::ACCESS_CONTROL_MAX_AGE), "86400");
}

#[tokio::test]
async fn test_unknown_file_name_is_404_json() {
    let h = movie_harness(10);

    let response = send(&h.state, request(Method::GET, "/files/nope.mp4")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(header_str(&response, header::CONTENT_TYPE), "application/json");
    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["message"], "File not found in database");
}

#[tokio::test]
async fn test_missing_object_is_404() {
    let backend = MemoryBackend::new(16);
    let h = harness(&quiet_config(), backend, &[("ghost.mp4", "videos/ghost.mp4")]);

    let response = send(&h.state, request(Method::GET, "/files/ghost.mp4")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["message"], "File not found");
    assert_eq!(h.state.admission.active_count("ghost.mp4"), 0);
}

#[tokio::test]
async fn test_record_without_storage_is_500() {
    let backend = Arc::new(MemoryBackend::new(16));
    let mut records = CatalogRecordStore::new();
    records.insert_file(
        "orphan.mp4",
        FileRecord {
            storage_location_id: "missing".to_string(),
            file_path: "orphan.mp4".to_string(),
        },
    );
    let state = Arc::new(GatewayState::from_config(
        &quiet_config(),
        Arc::new(records),
        Arc::new(common::MemoryConnector::new(backend)),
        CancellationToken::new(),
        None,
    ));

    let response = send(&state, request(Method::GET, "/files/orphan.mp4")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["message"], "Storage configuration not found");
}

#[tokio::test]
async fn test_percent_encoded_file_name() {
    let backend = MemoryBackend::new(16);
    backend.put("docs/annual report.pdf", sample_bytes(30), None);
    let h = harness(&quiet_config(), backend, &[("annual report.pdf", "docs/annual report.pdf")]);

    let response = send(&h.state, request(Method::GET, "/files/annual%20report.pdf")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_TYPE), "application/pdf");
    assert_eq!(body_bytes(response).await.len(), 30);
}

#[tokio::test]
async fn test_empty_file_name_is_400() {
    let h = movie_harness(10);

    let response = send(&h.state, request(Method::GET, "/files/")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["message"], "fileName is required");
}

#[tokio::test]
async fn test_unsupported_method_and_path() {
    let h = movie_harness(10);

    let response = send(&h.state, request(Method::POST, "/files/movie.mp4")).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(header_str(&response, header::ALLOW), "GET, HEAD, OPTIONS");

    let response = send(&h.state, request(Method::GET, "/elsewhere")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["success"], false);
}

#[tokio::test]
async fn test_clients_and_metadata_are_reused() {
    let h = movie_harness(50);

    for _ in 0..3 {
        let response = send(&h.state, request(Method::GET, "/files/movie.mp4")).await;
        assert_eq!(response.status(), StatusCode::OK);
        body_bytes(response).await;
    }

    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.head_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.backend.get_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.state.metadata.metrics().hits, 2);
}

#[tokio::test]
async fn test_health_and_streams_endpoints() {
    let backend = MemoryBackend::new(16);
    backend.put_stalling("videos/movie.mp4", sample_bytes(64), 1);
    let h = harness(&quiet_config(), backend, &[(MOVIE, "videos/movie.mp4")]);

    let response = send(&h.state, request(Method::GET, "/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");

    // The backend stalls after one chunk, so this stream stays open
    let streaming = send(&h.state, request(Method::GET, "/files/movie.mp4")).await;
    assert_eq!(streaming.status(), StatusCode::OK);

    let response = send(&h.state, request(Method::GET, "/streams")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["streams"][0]["file_key"], MOVIE);

    drop(streaming);
    let registry = Arc::clone(h.state.registry());
    assert!(wait_until(|| registry.is_empty()).await);
    assert!(wait_until(|| h.backend.open_stream_count() == 0).await);
    assert!(wait_until(|| h.state.pipeline.metrics().aborted == 1).await);

    h.shutdown.cancel();
    let response = send(&h.state, request(Method::GET, "/health")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "unhealthy");
}
