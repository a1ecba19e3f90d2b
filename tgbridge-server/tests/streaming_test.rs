//! End-to-end tests for the streaming surface against an in-memory
//! platform serving deterministic bytes `B[i] = i % 256`.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tgbridge_core::errors::{BridgeError, Result};
use tgbridge_core::models::{BotProfile, FileLocator};
use tgbridge_core::transport::{MediaTransport, TransportConnector};
use tgbridge_core::{bandwidth, reference, Config, StreamingService};
use tgbridge_server::web;
use tower::ServiceExt;

const FILE_SIZE: u64 = 1_048_576;
const KNOWN_MESSAGE: i64 = 424_242;
const CHUNK_SIZE: u64 = 65_536;

struct FakePlatform {
    size: u64,
    /// Message date reported for the file; old dates trip the expiry gate.
    message_age_seconds: i64,
    /// Artificial latency per chunk, to hold streams open in tests.
    chunk_delay: Duration,
}

struct FakeTransport {
    size: u64,
    message_age_seconds: i64,
    chunk_delay: Duration,
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn fetch_chunk(&self, _: &FileLocator, offset: u64, limit: u32) -> Result<Bytes> {
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        let len = (self.size.saturating_sub(offset)).min(limit as u64) as usize;
        Ok((0..len)
            .map(|i| ((offset + i as u64) % 256) as u8)
            .collect::<Vec<u8>>()
            .into())
    }

    async fn fetch_metadata(&self, message_id: i64) -> Result<FileLocator> {
        if message_id != KNOWN_MESSAGE {
            return Err(BridgeError::ReferenceNotFound);
        }
        Ok(FileLocator {
            message_id,
            dc_id: 1,
            volume_id: 555,
            local_id: 3,
            access_hash: 987_654,
            size: self.size,
            mime_type: Some("video/mp4".to_string()),
            file_name: Some("sintel trailer.mp4".to_string()),
            message_date: Utc::now() - ChronoDuration::seconds(self.message_age_seconds),
        })
    }
}

#[async_trait]
impl TransportConnector for FakePlatform {
    async fn connect(&self, _: &str, _: i32) -> Result<Arc<dyn MediaTransport>> {
        Ok(Arc::new(FakeTransport {
            size: self.size,
            message_age_seconds: self.message_age_seconds,
            chunk_delay: self.chunk_delay,
        }))
    }

    async fn fetch_self(&self, _: &str) -> Result<BotProfile> {
        Ok(BotProfile {
            id: 99,
            username: "bridge_test_bot".to_string(),
            first_name: "Bridge".to_string(),
        })
    }

    fn home_dc_id(&self) -> i32 {
        1
    }
}

fn base_config() -> Config {
    Config {
        base_url: "https://dl.example.com".to_string(),
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        api_base: "http://localhost:8081".to_string(),
        primary_token: "primary-token".to_string(),
        additional_client_identities: vec![],
        database_url: None,
        database_name: "tgbridge".to_string(),
        link_expiry_seconds: 86_400,
        monthly_bandwidth_ceiling_bytes: 0,
        max_concurrent_streams_per_identity: 8,
        chunk_size: CHUNK_SIZE,
        stale_stream_max_age_seconds: 3600,
        stream_cleanup_interval_seconds: 600,
        locator_cache_max_entries: 100,
        shorten_threshold_bytes: 0,
        video_frontend_url: None,
        cors_allowed_origins: vec!["https://player.example.com".to_string()],
        rate_limit_max_requests: 1000,
        rate_limit_window_seconds: 600,
        ledger_flush_interval_seconds: 3600,
    }
}

async fn setup(config: Config, platform: FakePlatform) -> (Router, Arc<StreamingService>) {
    let service = StreamingService::new(config, Arc::new(platform), None)
        .await
        .expect("service init");
    (web::router(service.clone()), service)
}

async fn setup_default() -> (Router, Arc<StreamingService>) {
    setup(
        base_config(),
        FakePlatform {
            size: FILE_SIZE,
            message_age_seconds: 60,
            chunk_delay: Duration::ZERO,
        },
    )
    .await
}

fn known_ref() -> String {
    reference::encode(KNOWN_MESSAGE)
}

async fn get(app: &Router, uri: &str, extra: &[(&str, &str)]) -> axum::response::Response {
    let mut builder = Request::builder().method("GET").uri(uri);
    for (name, value) in extra {
        builder = builder.header(*name, *value);
    }
    app.clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

fn assert_pattern(body: &[u8], file_offset: u64) {
    for (i, byte) in body.iter().enumerate() {
        assert_eq!(
            *byte,
            ((file_offset + i as u64) % 256) as u8,
            "byte {} (file offset {})",
            i,
            file_offset + i as u64
        );
    }
}

#[tokio::test]
async fn full_download_returns_the_whole_file() {
    let (app, service) = setup_default().await;
    let response = get(&app, &format!("/dl/{}", known_ref()), &[]).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        FILE_SIZE.to_string().as_str()
    );
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"sintel trailer.mp4\""
    );

    let body = body_bytes(response).await;
    assert_eq!(body.len(), FILE_SIZE as usize);
    assert_pattern(&body, 0);

    assert_eq!(service.active_streams(), 0);
    assert_eq!(service.bandwidth_usage().bytes_used, FILE_SIZE);
}

#[tokio::test]
async fn stream_route_omits_content_disposition() {
    let (app, _service) = setup_default().await;
    let response = get(&app, &format!("/stream/{}", known_ref()), &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(header::CONTENT_DISPOSITION));
}

#[tokio::test]
async fn leading_range_is_sliced_exactly() {
    let (app, _service) = setup_default().await;
    let response = get(
        &app,
        &format!("/dl/{}", known_ref()),
        &[("range", "bytes=0-1023")],
    )
    .await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes 0-1023/{}", FILE_SIZE).as_str()
    );
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1024");

    let body = body_bytes(response).await;
    assert_eq!(body.len(), 1024);
    assert_pattern(&body, 0);
}

#[tokio::test]
async fn open_ended_range_runs_to_the_last_byte() {
    let (app, _service) = setup_default().await;
    let response = get(
        &app,
        &format!("/dl/{}", known_ref()),
        &[("range", "bytes=1000000-")],
    )
    .await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes 1000000-{}/{}", FILE_SIZE - 1, FILE_SIZE).as_str()
    );

    let body = body_bytes(response).await;
    assert_eq!(body.len(), 48_576);
    assert_pattern(&body, 1_000_000);
}

#[tokio::test]
async fn suffix_range_serves_the_tail() {
    let (app, _service) = setup_default().await;
    let response = get(
        &app,
        &format!("/dl/{}", known_ref()),
        &[("range", "bytes=-100")],
    )
    .await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes {}-{}/{}", FILE_SIZE - 100, FILE_SIZE - 1, FILE_SIZE).as_str()
    );

    let body = body_bytes(response).await;
    assert_eq!(body.len(), 100);
    assert_pattern(&body, FILE_SIZE - 100);
}

#[tokio::test]
async fn single_byte_range() {
    let (app, _service) = setup_default().await;
    let response = get(
        &app,
        &format!("/dl/{}", known_ref()),
        &[("range", "bytes=0-0")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let body = body_bytes(response).await;
    assert_eq!(body, vec![0u8]);
}

#[tokio::test]
async fn out_of_bounds_range_is_unsatisfiable() {
    let (app, _service) = setup_default().await;
    let past_the_end = format!("bytes={}-{}", FILE_SIZE, FILE_SIZE + 24);
    let response = get(
        &app,
        &format!("/dl/{}", known_ref()),
        &[("range", past_the_end.as_str())],
    )
    .await;

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes */{}", FILE_SIZE).as_str()
    );
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "no-store"
    );
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn empty_file_serves_content_length_zero() {
    let (app, _service) = setup(
        base_config(),
        FakePlatform {
            size: 0,
            message_age_seconds: 60,
            chunk_delay: Duration::ZERO,
        },
    )
    .await;

    let response = get(&app, &format!("/dl/{}", known_ref()), &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "0");
    assert!(body_bytes(response).await.is_empty());

    // Any range at all against an empty file is unsatisfiable.
    let response = get(
        &app,
        &format!("/dl/{}", known_ref()),
        &[("range", "bytes=0-0")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn garbage_reference_is_not_found() {
    let (app, _service) = setup_default().await;
    for bad in ["not-a-ref", "AAAAAAAAAAAAAAAAAAAAAAAAAAAA", "%2e%2e"] {
        let response = get(&app, &format!("/dl/{}", bad), &[]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "ref {}", bad);
    }
}

#[tokio::test]
async fn unknown_message_is_not_found() {
    let (app, _service) = setup_default().await;
    let response = get(&app, &format!("/dl/{}", reference::encode(1)), &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expired_link_is_gone() {
    let mut config = base_config();
    config.link_expiry_seconds = 100;
    let (app, _service) = setup(
        config,
        FakePlatform {
            size: FILE_SIZE,
            message_age_seconds: 1000,
            chunk_delay: Duration::ZERO,
        },
    )
    .await;

    let response = get(&app, &format!("/dl/{}", known_ref()), &[]).await;
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn three_concurrent_streams_spread_over_three_identities() {
    let mut config = base_config();
    config.additional_client_identities = vec!["wt-0".to_string(), "wt-1".to_string()];
    config.max_concurrent_streams_per_identity = 1;
    let (app, service) = setup(
        config,
        FakePlatform {
            size: FILE_SIZE,
            message_age_seconds: 60,
            chunk_delay: Duration::from_millis(20),
        },
    )
    .await;

    let uri = format!("/dl/{}", known_ref());
    let (a, b, c) = tokio::join!(
        get(&app, &uri, &[("x-forwarded-for", "10.0.0.1")]),
        get(&app, &uri, &[("x-forwarded-for", "10.0.0.2")]),
        get(&app, &uri, &[("x-forwarded-for", "10.0.0.3")]),
    );

    for response in [a, b, c] {
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        assert_eq!(body.len(), FILE_SIZE as usize);
    }

    assert_eq!(service.active_streams(), 0);
    for identity in service.identity_statuses().await {
        assert_eq!(identity.active_streams, 0, "identity {}", identity.id);
    }
}

#[tokio::test]
async fn dropping_the_response_tears_the_stream_down() {
    let (app, service) = setup(
        base_config(),
        FakePlatform {
            size: FILE_SIZE,
            message_age_seconds: 60,
            chunk_delay: Duration::from_millis(50),
        },
    )
    .await;

    let response = get(&app, &format!("/dl/{}", known_ref()), &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(service.active_streams(), 1);

    // Client disconnect: the body is dropped without being read.
    drop(response);

    assert_eq!(service.active_streams(), 0);
    for identity in service.identity_statuses().await {
        assert_eq!(identity.active_streams, 0);
    }
}

#[tokio::test]
async fn bandwidth_ceiling_rejects_before_the_first_byte() {
    let mut config = base_config();
    config.monthly_bandwidth_ceiling_bytes = FILE_SIZE + 100;
    let (app, service) = setup(
        config,
        FakePlatform {
            size: FILE_SIZE,
            message_age_seconds: 60,
            chunk_delay: Duration::ZERO,
        },
    )
    .await;

    // One byte short of the ceiling: a tiny request still succeeds...
    service
        .bandwidth_ledger()
        .seed(&bandwidth::month_key(Utc::now()), FILE_SIZE + 99);
    let response = get(
        &app,
        &format!("/dl/{}", known_ref()),
        &[("range", "bytes=0-0")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_bytes(response).await.len(), 1);

    // ...which pushes usage to the ceiling, so the next request is refused
    // before any body byte.
    let response = get(&app, &format!("/dl/{}", known_ref()), &[]).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_bytes(response).await;
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "Service temporarily unavailable due to bandwidth limits."
    );
}

#[tokio::test]
async fn rate_limit_answers_429_with_retry_after() {
    let mut config = base_config();
    config.rate_limit_max_requests = 2;
    let (app, _service) = setup(
        config,
        FakePlatform {
            size: FILE_SIZE,
            message_age_seconds: 60,
            chunk_delay: Duration::ZERO,
        },
    )
    .await;

    let headers = [("x-forwarded-for", "203.0.113.5")];
    let uri = format!("/dl/{}", known_ref());
    assert_eq!(get(&app, &uri, &headers).await.status(), StatusCode::OK);
    assert_eq!(get(&app, &uri, &headers).await.status(), StatusCode::OK);

    let limited = get(&app, &uri, &headers).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(limited.headers().contains_key(header::RETRY_AFTER));

    // Another address is unaffected.
    let other = get(&app, &uri, &[("x-forwarded-for", "203.0.113.6")]).await;
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn cors_headers_echo_allowed_origins_only() {
    let (app, _service) = setup_default().await;
    let uri = format!("/stream/{}", known_ref());

    let allowed = get(&app, &uri, &[("origin", "https://player.example.com")]).await;
    assert_eq!(
        allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://player.example.com"
    );
    let exposed = allowed.headers()[header::ACCESS_CONTROL_EXPOSE_HEADERS]
        .to_str()
        .unwrap();
    assert!(exposed.contains("Content-Range"));
    assert!(exposed.contains("Accept-Ranges"));

    let denied = get(&app, &uri, &[("origin", "https://evil.example")]).await;
    assert_eq!(denied.status(), StatusCode::OK);
    assert!(!denied
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn preflight_is_204_for_allowed_origin_403_otherwise() {
    let (app, _service) = setup_default().await;
    let uri = format!("/stream/{}", known_ref());

    let allowed = app
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri(&uri)
                .header("origin", "https://player.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://player.example.com"
    );

    let denied = app
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri(&uri)
                .header("origin", "https://evil.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn api_info_reports_the_service_shape() {
    let mut config = base_config();
    config.monthly_bandwidth_ceiling_bytes = 5000;
    config.video_frontend_url = Some("https://player.example.com".to_string());
    let (app, _service) = setup(
        config,
        FakePlatform {
            size: FILE_SIZE,
            message_age_seconds: 60,
            chunk_delay: Duration::ZERO,
        },
    )
    .await;

    let response = get(&app, "/api/info", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();

    assert_eq!(json["status"], "ok");
    assert_eq!(json["bot_info"]["username"], "bridge_test_bot");
    assert_eq!(json["bot_info"]["mention"], "@bridge_test_bot");
    assert_eq!(json["features"]["link_expiry_enabled"], true);
    assert_eq!(json["features"]["link_expiry_duration_seconds"], 86_400);
    assert_eq!(
        json["features"]["video_frontend_url"],
        "https://player.example.com"
    );
    assert_eq!(json["bandwidth"]["limit_bytes"], 5000);
    assert_eq!(json["bandwidth"]["enabled"], true);
    assert_eq!(json["streaming"]["range_requests_supported"], true);
    assert_eq!(json["streaming"]["seeking_supported"], true);
    assert_eq!(json["streaming"]["active_streams"], 0);
    assert_eq!(json["total_users"], 0);
    assert!(json["uptime_seconds"].as_i64().unwrap() >= 0);
}

#[tokio::test]
async fn health_and_ping_respond() {
    let (app, _service) = setup_default().await;

    let health = get(&app, "/health", &[]).await;
    assert_eq!(health.status(), StatusCode::OK);
    let json: Value = serde_json::from_slice(&body_bytes(health).await).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["ready_identities"], 1);

    let ping = get(&app, "/ping", &[]).await;
    assert_eq!(ping.status(), StatusCode::OK);
    let json: Value = serde_json::from_slice(&body_bytes(ping).await).unwrap();
    assert_eq!(json["message"], "pong");
}
