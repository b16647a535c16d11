// Context record endpoints.
//
// Routes:
//   POST   /api/context                              create
//   GET    /api/context/{id}                         read (null when absent or expired)
//   PUT    /api/context/{id}                         shallow-merge data
//   DELETE /api/context/{id}                         delete
//   GET    /api/context/user/{user_id}?type=         a user's records, newest first
//   GET    /api/context/itinerary/{itinerary_id}     an itinerary's records, newest first
//   PUT    /api/context/preferences                  upsert the caller's preferences

use axum::{
    extract::{Extension, Json, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ApiError, AppState};
use crate::{
    auth::middleware::AuthenticatedParticipant,
    context::{ContextKind, ContextRecord, NewContext},
};

#[derive(Deserialize)]
struct UpdateContextRequest {
    data: Value,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct UserContextQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Serialize)]
struct ContextEnvelope {
    context: Option<ContextRecord>,
}

#[derive(Serialize)]
struct ContextsEnvelope {
    contexts: Vec<ContextRecord>,
}

#[derive(Serialize)]
struct DeletedEnvelope {
    deleted: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/context", post(create_context))
        .route("/api/context/preferences", put(update_preferences))
        .route("/api/context/user/{user_id}", get(user_contexts))
        .route("/api/context/itinerary/{itinerary_id}", get(itinerary_contexts))
        .route("/api/context/{id}", get(get_context).put(update_context).delete(delete_context))
}

async fn create_context(
    State(state): State<AppState>,
    Json(payload): Json<NewContext>,
) -> Result<(StatusCode, Json<ContextEnvelope>), ApiError> {
    let context = state.contexts.create(payload).await?;
    Ok((StatusCode::CREATED, Json(ContextEnvelope { context: Some(context) })))
}

async fn get_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContextEnvelope>, ApiError> {
    Ok(Json(ContextEnvelope { context: state.contexts.get(&id).await? }))
}

async fn update_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateContextRequest>,
) -> Result<Json<ContextEnvelope>, ApiError> {
    let context = state.contexts.update(&id, &payload.data, payload.expires_at).await?;
    Ok(Json(ContextEnvelope { context: Some(context) }))
}

async fn delete_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedEnvelope>, ApiError> {
    Ok(Json(DeletedEnvelope { deleted: state.contexts.delete(&id).await? }))
}

async fn user_contexts(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<UserContextQuery>,
) -> Result<Json<ContextsEnvelope>, ApiError> {
    let kind = query.kind.as_deref().map(str::parse::<ContextKind>).transpose()?;
    Ok(Json(ContextsEnvelope { contexts: state.contexts.user_contexts(&user_id, kind).await? }))
}

async fn itinerary_contexts(
    State(state): State<AppState>,
    Path(itinerary_id): Path<String>,
) -> Result<Json<ContextsEnvelope>, ApiError> {
    Ok(Json(ContextsEnvelope { contexts: state.contexts.itinerary_contexts(&itinerary_id).await? }))
}

async fn update_preferences(
    State(state): State<AppState>,
    Extension(participant): Extension<AuthenticatedParticipant>,
    Json(preferences): Json<Value>,
) -> Result<Json<ContextEnvelope>, ApiError> {
    if !preferences.is_object() {
        return Err(ApiError::BadRequest("preferences must be a JSON object".to_string()));
    }

    let context =
        state.contexts.update_user_preferences(&participant.participant_id, &preferences).await?;
    Ok(Json(ContextEnvelope { context: Some(context) }))
}
