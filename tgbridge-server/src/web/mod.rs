pub mod error;
pub mod info;
pub mod range;
pub mod stream;

use axum::http::HeaderMap;
use axum::{routing::get, Router};
use std::sync::Arc;
use tgbridge_core::StreamingService;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StreamingService>,
}

pub fn router(service: Arc<StreamingService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/dl/:reference", get(stream::download_handler))
        .route(
            "/stream/:reference",
            get(stream::stream_handler).options(stream::preflight_handler),
        )
        .route("/api/info", get(info::api_info_handler))
        .route("/health", get(info::health_handler))
        .route("/ping", get(info::ping_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Client address as seen through the reverse proxy, falling back to
/// loopback for direct connections.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Echo the request origin when it is in the configured allow-list.
/// A configured "*" allows every origin.
pub fn allowed_origin(
    allowed: &[String],
    headers: &HeaderMap,
) -> Option<String> {
    let origin = headers.get("origin")?.to_str().ok()?;
    if allowed.iter().any(|a| a == "*" || a == origin) {
        Some(origin.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers), "203.0.113.9");
        assert_eq!(client_ip(&HeaderMap::new()), "127.0.0.1");
    }

    #[test]
    fn origin_allow_list() {
        let allowed = vec!["https://player.example.com".to_string()];
        let mut headers = HeaderMap::new();
        headers.insert(
            "origin",
            HeaderValue::from_static("https://player.example.com"),
        );
        assert_eq!(
            allowed_origin(&allowed, &headers).as_deref(),
            Some("https://player.example.com")
        );

        headers.insert("origin", HeaderValue::from_static("https://evil.example"));
        assert!(allowed_origin(&allowed, &headers).is_none());
        assert!(allowed_origin(&["*".to_string()], &headers).is_some());
        assert!(allowed_origin(&allowed, &HeaderMap::new()).is_none());
    }
}
