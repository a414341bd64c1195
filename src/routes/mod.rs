//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router: the websocket endpoint carries all collaboration
//! traffic, and a small read-only HTTP surface exposes health and live
//! session stats.

pub mod stats;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/stats", get(stats::general))
        .route("/api/boards/{id}/stats", get(stats::board))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
