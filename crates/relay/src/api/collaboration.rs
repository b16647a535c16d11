// Itinerary sync endpoints.
//
// Routes:
//   POST   /api/collaboration/sync                                   apply a change set
//   GET    /api/collaboration/state/{doc_id}                         current snapshot
//   GET    /api/collaboration/history/{doc_id}?limit=                newest first
//   GET    /api/collaboration/{doc_id}/collaborators                 list
//   POST   /api/collaboration/{doc_id}/collaborators                 add
//   DELETE /api/collaboration/{doc_id}/collaborators/{participant}   remove

use axum::{
    extract::{Extension, Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use voyage_common::types::{Change, HistoryRecord};

use super::{require_non_empty, ApiError, AppState};
use crate::{auth::middleware::AuthenticatedParticipant, error::ErrorCode};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Deserialize)]
struct SyncRequest {
    doc_id: String,
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct AddCollaboratorRequest {
    participant: String,
}

#[derive(Serialize)]
struct StateEnvelope {
    state: Option<Value>,
}

#[derive(Serialize)]
struct HistoryEnvelope {
    history: Vec<HistoryRecord>,
}

#[derive(Serialize)]
struct CollaboratorsEnvelope {
    collaborators: Vec<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/collaboration/sync", post(sync_change_set))
        .route("/api/collaboration/state/{doc_id}", get(get_state))
        .route("/api/collaboration/history/{doc_id}", get(get_history))
        .route(
            "/api/collaboration/{doc_id}/collaborators",
            get(list_collaborators).post(add_collaborator),
        )
        .route("/api/collaboration/{doc_id}/collaborators/{participant}", delete(remove_collaborator))
}

/// The body is always the structured sync result; the status mirrors its outcome.
async fn sync_change_set(
    State(state): State<AppState>,
    Extension(participant): Extension<AuthenticatedParticipant>,
    Json(payload): Json<SyncRequest>,
) -> Result<Response, ApiError> {
    require_non_empty("doc_id", &payload.doc_id)?;

    let result =
        state.sync_and_broadcast(&payload.doc_id, payload.changes, &participant.participant_id).await;
    let status = match result.reason {
        None => StatusCode::OK,
        Some(reason) => ErrorCode::for_sync_failure(reason).status(),
    };

    Ok((status, Json(result)).into_response())
}

async fn get_state(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<StateEnvelope>, ApiError> {
    let snapshot = state.engine.state(&doc_id).await?;
    Ok(Json(StateEnvelope { state: snapshot }))
}

async fn get_history(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryEnvelope>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    let history = state.engine.history(&doc_id, limit).await?;
    Ok(Json(HistoryEnvelope { history }))
}

async fn list_collaborators(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<CollaboratorsEnvelope>, ApiError> {
    let collaborators = state.engine.store().collaborators(&doc_id).await?;
    Ok(Json(CollaboratorsEnvelope { collaborators }))
}

async fn add_collaborator(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedParticipant>,
    Path(doc_id): Path<String>,
    Json(payload): Json<AddCollaboratorRequest>,
) -> Result<StatusCode, ApiError> {
    require_non_empty("participant", &payload.participant)?;

    if state.engine.store().add_collaborator(&doc_id, payload.participant.trim()).await? {
        info!(
            doc_id = %doc_id,
            participant = %payload.participant.trim(),
            added_by = %caller.participant_id,
            "collaborator added"
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_collaborator(
    State(state): State<AppState>,
    Path((doc_id, participant)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if !state.engine.store().remove_collaborator(&doc_id, &participant).await? {
        return Err(ApiError::NotFound(format!("{participant} is not a collaborator on {doc_id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}
