pub mod error;
pub mod events;
pub mod routes;

pub use error::ApiError;

use crate::state::AnprState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn router(state: AnprState) -> Router {
    Router::new()
        // Health and metrics endpoints
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/metrics", get(routes::metrics))
        // Camera endpoints
        .route("/v1/cameras", get(routes::list_cameras).post(routes::start_camera))
        .route(
            "/v1/cameras/:id",
            get(routes::get_camera).delete(routes::stop_camera),
        )
        .route("/v1/cameras/:id/candidates", get(routes::list_candidates))
        .route("/v1/cameras/:id/frame", get(routes::latest_frame))
        .route("/v1/cameras/:id/frames", post(routes::push_frame))
        // Saved plate feed
        .route("/v1/events/ws", get(events::events_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
