//! Stats endpoints — read-only HTTP views over live session state.

use axum::Json;
use axum::extract::{Path, State};

use crate::services::stats::{BoardStats, GeneralStats, board_stats, general_stats};
use crate::state::AppState;

/// GET /api/stats — process-wide connection and room counts.
pub async fn general(State(state): State<AppState>) -> Json<GeneralStats> {
    let sessions = state.sessions.read().await;
    Json(general_stats(&sessions))
}

/// GET /api/boards/{id}/stats — who is on a board and who is editing.
pub async fn board(State(state): State<AppState>, Path(board_id): Path<String>) -> Json<BoardStats> {
    let sessions = state.sessions.read().await;
    Json(board_stats(&sessions, &board_id))
}
