// Routing of decoded client operations to the presence registry, the sync
// engine and the context store.

use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures_util::FutureExt;
use tracing::{debug, error, warn};
use voyage_common::protocol::ws::{decode_client_op, ClientOp, OpDecodeError, ServerEvent};

use crate::{api::AppState, context::ContextError, error::ErrorCode, presence::ConnectionId};

const MAX_CHAT_MESSAGE_CHARS: usize = 4_000;
const MALFORMED_KIND: &str = "malformed";

/// The connection an operation arrived on.
#[derive(Debug, Clone)]
pub(super) struct Session {
    pub connection_id: ConnectionId,
    pub participant_id: String,
}

/// Events for the submitting connection only; room fanout happens during dispatch.
#[derive(Debug, Default)]
pub(super) struct OpOutcome {
    pub replies: Vec<ServerEvent>,
    pub is_error: bool,
}

impl OpOutcome {
    fn reply(event: ServerEvent) -> Self {
        Self { replies: vec![event], is_error: false }
    }

    fn error(code: ErrorCode, message: impl Into<String>, doc_id: Option<&str>) -> Self {
        Self { replies: vec![code.event(message, doc_id)], is_error: true }
    }
}

/// Decode and run one text frame. Returns the operation kind for metrics.
/// A panic inside the operation becomes an `INTERNAL_ERROR` reply; the
/// connection stays usable.
pub(super) async fn handle_text_frame(state: &AppState, session: &Session, raw: &str) -> (String, OpOutcome) {
    let op = match decode_client_op(raw) {
        Ok(op) => op,
        Err(error) => {
            let kind = match &error {
                OpDecodeError::Malformed => MALFORMED_KIND.to_string(),
                OpDecodeError::InvalidPayload { kind, .. } => kind.clone(),
            };
            return (kind, OpOutcome::error(ErrorCode::ValidationFailed, error.to_string(), None));
        }
    };

    let kind = op.kind().to_string();
    let doc_id = op.doc_id().map(ToOwned::to_owned);
    let outcome = match AssertUnwindSafe(dispatch(state, session, op)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(
                participant = %session.participant_id,
                connection_id = %session.connection_id,
                op = %kind,
                "websocket operation panicked"
            );
            OpOutcome::error(
                ErrorCode::InternalError,
                ErrorCode::InternalError.default_message(),
                doc_id.as_deref(),
            )
        }
    };
    (kind, outcome)
}

async fn dispatch(state: &AppState, session: &Session, op: ClientOp) -> OpOutcome {
    if let Some(doc_id) = op.doc_id() {
        if doc_id.trim().is_empty() {
            return OpOutcome::error(ErrorCode::ValidationFailed, "doc_id must not be empty", None);
        }
    }

    if op.requires_membership() {
        if let Some(doc_id) = op.doc_id() {
            if !state.presence.is_member(session.connection_id, doc_id).await {
                debug!(doc_id, participant = %session.participant_id, op = op.kind(), "room event from non-member");
                return OpOutcome::error(
                    ErrorCode::ValidationFailed,
                    format!("join room `{doc_id}` before sending {}", op.kind()),
                    Some(doc_id),
                );
            }
        }
    }

    let participant = session.participant_id.as_str();
    match op {
        ClientOp::JoinRoom { doc_id } => {
            match state.presence.join_room(session.connection_id, &doc_id).await {
                Some(joined) => {
                    debug!(doc_id = %doc_id, participant, "joined room");
                    OpOutcome::reply(ServerEvent::JoinedRoom { doc_id, participants: joined.participants })
                }
                None => {
                    warn!(connection_id = %session.connection_id, "join from unregistered connection");
                    OpOutcome::error(
                        ErrorCode::InternalError,
                        ErrorCode::InternalError.default_message(),
                        Some(&doc_id),
                    )
                }
            }
        }
        ClientOp::LeaveRoom { doc_id } => {
            state.presence.leave_room(session.connection_id, &doc_id).await;
            OpOutcome::reply(ServerEvent::LeftRoom { doc_id })
        }
        ClientOp::SyncChangeSet { doc_id, changes } => {
            let result = state.sync_and_broadcast(&doc_id, changes, participant).await;
            if result.success {
                OpOutcome::reply(ServerEvent::UpdateConfirmed { doc_id, result })
            } else {
                OpOutcome { replies: vec![ServerEvent::UpdateFailed { doc_id, result }], is_error: true }
            }
        }
        ClientOp::Typing { doc_id, is_typing } => {
            state.presence.typing(&doc_id, participant, is_typing).await;
            OpOutcome::default()
        }
        ClientOp::PresenceUpdate { doc_id, status } => {
            state.presence.presence_update(&doc_id, participant, status).await;
            OpOutcome::default()
        }
        ClientOp::ActivityUpdate { doc_id, activity_id, changes } => {
            state
                .presence
                .broadcast(
                    &doc_id,
                    ServerEvent::ActivityUpdated {
                        doc_id: doc_id.clone(),
                        activity_id: activity_id.clone(),
                        changes,
                        participant: participant.to_string(),
                        timestamp: Utc::now(),
                    },
                    Some(participant),
                )
                .await;
            OpOutcome::reply(ServerEvent::ActivityUpdateConfirmed { doc_id, activity_id })
        }
        ClientOp::ChatMessage { doc_id, message } => chat_message(state, participant, doc_id, message).await,
        ClientOp::CursorUpdate { doc_id, position, selection } => {
            state
                .presence
                .broadcast(
                    &doc_id,
                    ServerEvent::CursorMoved {
                        doc_id: doc_id.clone(),
                        participant: participant.to_string(),
                        position,
                        selection,
                    },
                    Some(participant),
                )
                .await;
            OpOutcome::default()
        }
        ClientOp::Unsupported { kind } => OpOutcome::error(
            ErrorCode::UnsupportedOperation,
            format!("operation `{kind}` is not supported"),
            None,
        ),
    }
}

/// Persist first; the room only hears about messages that were stored.
async fn chat_message(state: &AppState, participant: &str, doc_id: String, message: String) -> OpOutcome {
    if message.trim().is_empty() {
        return OpOutcome::error(ErrorCode::ValidationFailed, "message must not be empty", Some(&doc_id));
    }
    if message.chars().count() > MAX_CHAT_MESSAGE_CHARS {
        return OpOutcome::error(
            ErrorCode::ValidationFailed,
            format!("message must be at most {MAX_CHAT_MESSAGE_CHARS} characters"),
            Some(&doc_id),
        );
    }

    let record = match state.contexts.create_chat_context(participant, &doc_id, &message).await {
        Ok(record) => record,
        Err(error) => {
            error!(doc_id = %doc_id, participant, error = %error, "failed to store chat message");
            let code = match error {
                ContextError::Store(_) => ErrorCode::StoreUnavailable,
                ContextError::Validation(_) | ContextError::NotFound(_) => ErrorCode::InternalError,
            };
            return OpOutcome::error(code, "Failed to send chat message", Some(&doc_id));
        }
    };

    state
        .presence
        .broadcast(
            &doc_id,
            ServerEvent::NewChatMessage {
                doc_id: doc_id.clone(),
                message_id: record.id,
                participant: participant.to_string(),
                message,
                timestamp: record.created_at,
            },
            None,
        )
        .await;
    OpOutcome::default()
}
