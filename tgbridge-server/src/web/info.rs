use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde_json::json;
use tgbridge_core::VIDEO_MIME_TYPES;

/// `GET /api/info` — machine-readable service description.
pub async fn api_info_handler(State(state): State<AppState>) -> Response {
    let service = &state.service;
    let config = service.config();
    let bandwidth = service.bandwidth_usage();

    let bot_info = service.bot_profile().map(|profile| {
        json!({
            "id": profile.id,
            "username": profile.username,
            "first_name": profile.first_name,
            "mention": profile.mention(),
        })
    });

    let mut features = json!({
        "link_expiry_enabled": config.link_expiry_seconds > 0,
        "link_expiry_duration_seconds": config.link_expiry_seconds,
    });
    if let Some(frontend) = &config.video_frontend_url {
        features["video_frontend_url"] = json!(frontend);
    }

    Json(json!({
        "status": "ok",
        "bot_info": bot_info,
        "features": features,
        "bandwidth": {
            "limit_bytes": config.monthly_bandwidth_ceiling_bytes,
            "used_bytes": bandwidth.bytes_used,
            "month": bandwidth.month,
            "enabled": config.monthly_bandwidth_ceiling_bytes > 0,
        },
        "streaming": {
            "active_streams": service.active_streams(),
            "supported_formats": VIDEO_MIME_TYPES,
            "range_requests_supported": true,
            "seeking_supported": true,
        },
        "uptime_seconds": service.uptime_seconds(),
        "server_time_utc": Utc::now().to_rfc3339(),
        "total_users": service.total_users().await,
    }))
    .into_response()
}

/// `GET /health` — monitoring endpoint. 200 while at least one identity can
/// stream, 503 otherwise.
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let service = &state.service;
    let identities = service.identity_statuses().await;
    let ready = identities.iter().filter(|i| i.ready).count();
    let bandwidth = service.bandwidth_usage();
    let ceiling = service.config().monthly_bandwidth_ceiling_bytes;

    let status = if ready == 0 {
        "unhealthy"
    } else if ceiling > 0 && bandwidth.bytes_used >= ceiling {
        "degraded"
    } else {
        "healthy"
    };

    let body = json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
        "service": "tgbridge",
        "total_identities": identities.len(),
        "ready_identities": ready,
        "identities": identities,
        "active_streams": service.active_streams(),
        "bandwidth_used_bytes": bandwidth.bytes_used,
        "bandwidth_month": bandwidth.month,
        "uptime_seconds": service.uptime_seconds(),
    });

    let code = if ready == 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body)).into_response()
}

/// `GET /ping` — ultra-light liveness probe.
pub async fn ping_handler() -> Response {
    Json(json!({
        "status": "ok",
        "message": "pong",
        "timestamp": Utc::now().to_rfc3339(),
    }))
    .into_response()
}
