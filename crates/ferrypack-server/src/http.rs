//! HTTP surface of the dev server.
//!
//! `GET /<filename>` and `GET /<filename>.map` serve the last good bundle
//! from memory, `GET /__ferrypack/status` reports the build state, and
//! everything else is a static file under the content base. Any origin may
//! fetch these, so a page served elsewhere can load the dev bundle.

use crate::ServerState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

/// Path of the status endpoint.
pub const STATUS_PATH: &str = "/__ferrypack/status";

/// Build the router for `state`.
pub fn router(state: Arc<ServerState>) -> Router {
    let bundle_path = format!("/{}", state.filename());
    let map_path = format!("/{}", state.map_filename());
    let static_files = ServeDir::new(state.content_base());

    Router::new()
        .route(&bundle_path, get(serve_bundle))
        .route(&map_path, get(serve_map))
        .route(STATUS_PATH, get(serve_status))
        .fallback_service(static_files)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn serve_bundle(State(state): State<Arc<ServerState>>) -> Response {
    match state.bundle() {
        Some(bundle) => (
            [
                (header::CONTENT_TYPE, "application/javascript; charset=utf-8"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            bundle.content.clone(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "bundle not built yet\n").into_response(),
    }
}

async fn serve_map(State(state): State<Arc<ServerState>>) -> Response {
    match state.bundle().and_then(|b| b.source_map.clone()) {
        Some(map) => (
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            map,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.status())
}
