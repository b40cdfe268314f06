use super::ApiError;
use crate::camera::decode_remote_frame;
use crate::state::AnprState;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use common::plates::{CameraSpec, CameraStatus, RemoteFrame};
use serde_json::json;
use tracing::{debug, info};

/// Health check endpoint
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "anpr-service",
            "version": common::VERSION
        })),
    )
}

/// Readiness check endpoint.
///
/// Not ready while any registered camera has lost its frame loop.
pub async fn readyz(State(state): State<AnprState>) -> impl IntoResponse {
    let cameras = state.cameras().list().await;
    let stalled: Vec<&str> = cameras
        .iter()
        .filter(|c| !c.running)
        .map(|c| c.spec.id.as_str())
        .collect();

    let status = if stalled.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if stalled.is_empty() { "ready" } else { "not ready" },
            "node_id": state.node_id(),
            "cameras": cameras.len(),
            "stalled": stalled,
        })),
    )
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics() -> impl IntoResponse {
    match telemetry::metrics::encode_metrics() {
        Ok(body) => body.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

/// List all cameras
pub async fn list_cameras(State(state): State<AnprState>) -> impl IntoResponse {
    let cameras = state.cameras().list().await;
    (StatusCode::OK, Json(json!({ "cameras": cameras })))
}

/// Start processing a new camera
pub async fn start_camera(
    State(state): State<AnprState>,
    Json(spec): Json<CameraSpec>,
) -> Result<(StatusCode, Json<CameraStatus>), ApiError> {
    let status = state.cameras().start(spec).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

pub async fn get_camera(
    State(state): State<AnprState>,
    Path(camera_id): Path<String>,
) -> Result<Json<CameraStatus>, ApiError> {
    Ok(Json(state.cameras().status(&camera_id).await?))
}

/// Stop a camera after its pending saves complete
pub async fn stop_camera(
    State(state): State<AnprState>,
    Path(camera_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.cameras().stop(&camera_id).await?;
    info!(camera_id = %camera_id, "camera stopped via api");
    Ok(Json(json!({
        "success": true,
        "camera_id": camera_id,
    })))
}

/// Live plate candidates of a camera
pub async fn list_candidates(
    State(state): State<AnprState>,
    Path(camera_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let candidates = state.cameras().candidates(&camera_id).await?;
    Ok(Json(json!({
        "camera_id": camera_id,
        "candidates": candidates,
    })))
}

/// Latest annotated frame of a camera as JPEG
pub async fn latest_frame(
    State(state): State<AnprState>,
    Path(camera_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let jpeg = state
        .cameras()
        .latest_frame(&camera_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("camera '{}' has not processed a frame yet", camera_id))
        })?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg.as_ref().clone()))
}

/// Submit a frame to a remote camera
pub async fn push_frame(
    State(state): State<AnprState>,
    Path(camera_id): Path<String>,
    Json(frame): Json<RemoteFrame>,
) -> Result<impl IntoResponse, ApiError> {
    let decoded = tokio::task::spawn_blocking(move || decode_remote_frame(&frame.data))
        .await
        .map_err(|e| ApiError::internal(format!("frame decoding task failed: {}", e)))??;

    let outcome = state.cameras().push_frame(&camera_id, decoded).await?;
    debug!(camera_id = %camera_id, ?outcome, "remote frame received");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "camera_id": camera_id,
            "outcome": outcome,
        })),
    ))
}
