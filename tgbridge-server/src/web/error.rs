use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tgbridge_core::BridgeError;

/// The one place core errors become HTTP. Pre-body failures get a short
/// plain-text body and no stack detail; mid-body failures never reach this
/// type (the connection just closes).
pub struct WebError(pub BridgeError);

impl From<BridgeError> for WebError {
    fn from(err: BridgeError) -> Self {
        WebError(err)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            BridgeError::InvalidReference => {
                (StatusCode::NOT_FOUND, "Invalid or malformed link.")
            }
            BridgeError::ReferenceNotFound => (
                StatusCode::NOT_FOUND,
                "File not found or has been deleted.",
            ),
            BridgeError::ReferenceExpired => (StatusCode::GONE, "Download link has expired."),
            BridgeError::RangeNotSatisfiable { .. } => {
                (StatusCode::RANGE_NOT_SATISFIABLE, "")
            }
            BridgeError::BandwidthCeilingReached => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable due to bandwidth limits.",
            ),
            BridgeError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests. Try again later.",
            ),
            BridgeError::NoClientAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily overloaded. Please try again shortly.",
            ),
            BridgeError::UpstreamTransient(_)
            | BridgeError::UpstreamUnavailable(_)
            | BridgeError::UpstreamAuthMigration { .. }
            | BridgeError::RetryExhausted { .. }
            | BridgeError::ShortChunk { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable. Please try again later.",
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error occurred.",
            ),
        };

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self.0, "request failed");
        }

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

        match &self.0 {
            BridgeError::RangeNotSatisfiable { size } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
            }
            BridgeError::RateLimited {
                retry_after_seconds,
            } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                    headers.insert(header::RETRY_AFTER, value);
                }
            }
            _ => {}
        }
        response
    }
}
