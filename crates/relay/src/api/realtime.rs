use axum::{
    extract::{Json, State},
    routing::get,
    Router,
};
use voyage_common::types::RealtimeStats;

use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/realtime/stats", get(stats))
}

async fn stats(State(state): State<AppState>) -> Json<RealtimeStats> {
    Json(state.presence.stats().await)
}
