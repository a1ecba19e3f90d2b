use super::error::WebError;
use super::range::parse_range_header;
use super::{allowed_origin, client_ip, AppState};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tgbridge_core::{humanbytes, sanitize_filename};

/// `GET /dl/{reference}` — byte-identical to the stream route except for
/// the attachment disposition.
pub async fn download_handler(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve(state, reference, headers, true).await
}

/// `GET /stream/{reference}` — inline playback for video front-ends.
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(reference): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve(state, reference, headers, false).await
}

/// CORS preflight for the stream route: 204 for allowed origins, 403
/// otherwise. Requests without an Origin header are not CORS and pass.
pub async fn preflight_handler(
    State(state): State<AppState>,
    Path(_reference): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !headers.contains_key("origin") {
        return StatusCode::NO_CONTENT.into_response();
    }
    match allowed_origin(&state.service.config().cors_allowed_origins, &headers) {
        Some(origin) => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            apply_cors(response.headers_mut(), &origin);
            response
                .headers_mut()
                .insert(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static("GET, OPTIONS"),
                );
            response.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("Range, Content-Type"),
            );
            response
        }
        None => StatusCode::FORBIDDEN.into_response(),
    }
}

async fn serve(state: AppState, reference: String, headers: HeaderMap, attachment: bool) -> Response {
    let service = &state.service;
    let ip = client_ip(&headers);

    if let Err(e) = service.admit(&ip) {
        return WebError(e).into_response();
    }

    if reference.is_empty() || reference.len() > 100 {
        service.record_invalid_request(&ip);
        return WebError(tgbridge_core::BridgeError::InvalidReference).into_response();
    }
    let message_id = match service.decode_reference(&reference) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(ip = %ip, reference = %reference, "undecodable reference");
            service.record_invalid_request(&ip);
            return WebError(e).into_response();
        }
    };

    let resolved = match service.resolve(message_id).await {
        Ok(resolved) => resolved,
        Err(e) => return WebError(e).into_response(),
    };
    let locator = resolved.locator.clone();
    let size = locator.size;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (status, from, until) = match range_header.as_deref() {
        None => (StatusCode::OK, 0, size.saturating_sub(1)),
        Some(value) => match parse_range_header(value, size) {
            Ok((from, until)) => (StatusCode::PARTIAL_CONTENT, from, until),
            Err(e) => {
                tracing::debug!(message_id, range = value, size, "unsatisfiable range");
                return WebError(e).into_response();
            }
        },
    };

    let content_length = if size == 0 { 0 } else { until - from + 1 };
    tracing::info!(
        message_id,
        ip = %ip,
        identity = resolved.identity.id(),
        status = status.as_u16(),
        length = %humanbytes(content_length),
        "serving {} request",
        if attachment { "download" } else { "stream" }
    );

    let body = if size == 0 {
        Body::empty()
    } else {
        let opened = service.open_stream(resolved, from, until);
        Body::from_stream(opened.stream)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(locator.content_type())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&content_length.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    if status == StatusCode::PARTIAL_CONTENT {
        if let Ok(value) =
            HeaderValue::from_str(&format!("bytes {}-{}/{}", from, until, size))
        {
            response_headers.insert(header::CONTENT_RANGE, value);
        }
    }
    if attachment {
        let filename = sanitize_filename(locator.file_name.as_deref().unwrap_or("download"));
        if let Ok(value) =
            HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        {
            response_headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    if let Some(origin) = allowed_origin(&service.config().cors_allowed_origins, &headers) {
        apply_cors(response_headers, &origin);
    }
    response
}

fn apply_cors(headers: &mut HeaderMap, origin: &str) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Range, Accept-Ranges"),
    );
}
