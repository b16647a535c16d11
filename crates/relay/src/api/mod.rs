// Request-style surface of the relay. Every route here sits behind bearer
// authentication; /health and /metrics are mounted separately in main.rs.

pub mod collaboration;
pub mod context;
pub mod realtime;

use std::sync::Arc;

use axum::{
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use chrono::Utc;
use tracing::error;
use voyage_common::{
    protocol::ws::ServerEvent,
    types::{Change, SyncResult},
};

use crate::{
    auth::{jwt::JwtAccessTokenService, middleware::require_bearer_auth},
    context::{ContextError, ContextManager},
    error::{ErrorCode, RelayError},
    presence::PresenceRegistry,
    sync::{store::StoreError, SyncEngine},
};

/// Long-lived services shared by every HTTP handler and WebSocket session.
#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
    pub contexts: ContextManager,
    pub presence: PresenceRegistry,
}

impl AppState {
    pub fn new(engine: SyncEngine, contexts: ContextManager, presence: PresenceRegistry) -> Self {
        Self { engine, contexts, presence }
    }

    /// Run one change set and, when it was applied, tell the rest of the room.
    /// The submitter learns the outcome from the returned result only.
    pub async fn sync_and_broadcast(
        &self,
        doc_id: &str,
        changes: Vec<Change>,
        participant_id: &str,
    ) -> SyncResult {
        let mut broadcast_changes = changes.clone();
        for change in &mut broadcast_changes {
            change.submitter = Some(participant_id.to_string());
        }

        let result = self.engine.sync_change_set(doc_id, changes, participant_id).await;
        if result.success {
            self.presence
                .broadcast(
                    doc_id,
                    ServerEvent::ItineraryUpdated {
                        doc_id: doc_id.to_string(),
                        changes: broadcast_changes,
                        resolved_data: result.resolved_data.clone(),
                        participant: participant_id.to_string(),
                        conflicts: result.conflicts.clone(),
                        timestamp: Utc::now(),
                    },
                    Some(participant_id),
                )
                .await;
        }
        result
    }
}

pub fn build_router(state: AppState, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    Router::new()
        .merge(collaboration::router())
        .merge(context::router())
        .merge(realtime::router())
        .with_state(state)
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl From<ContextError> for ApiError {
    fn from(error: ContextError) -> Self {
        match error {
            ContextError::Validation(message) => Self::BadRequest(message),
            ContextError::NotFound(id) => Self::NotFound(format!("context `{id}` not found")),
            ContextError::Store(error) => Self::Store(error),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => RelayError::new(ErrorCode::ValidationFailed, message).into_response(),
            Self::NotFound(message) => RelayError::new(ErrorCode::NotFound, message).into_response(),
            Self::Store(error) => {
                error!(error = %error, "relay api store failure");
                RelayError::from_code(ErrorCode::StoreUnavailable).into_response()
            }
        }
    }
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}
