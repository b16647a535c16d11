// WebSocket frame types for the itinerary collaboration channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{Change, Conflict, PresenceStatus, SyncResult};

/// Every `type` tag a client may send. Anything else decodes to
/// [`ClientOp::Unsupported`].
pub const CLIENT_OP_KINDS: &[&str] = &[
    "join_room",
    "leave_room",
    "sync_change_set",
    "typing",
    "presence_update",
    "activity_update",
    "chat_message",
    "cursor_update",
];

/// Client -> Server operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientOp {
    JoinRoom {
        doc_id: String,
    },
    LeaveRoom {
        doc_id: String,
    },
    SyncChangeSet {
        doc_id: String,
        changes: Vec<Change>,
    },
    Typing {
        doc_id: String,
        is_typing: bool,
    },
    PresenceUpdate {
        doc_id: String,
        status: PresenceStatus,
    },
    ActivityUpdate {
        doc_id: String,
        activity_id: String,
        changes: Value,
    },
    ChatMessage {
        doc_id: String,
        message: String,
    },
    CursorUpdate {
        doc_id: String,
        position: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Value>,
    },
    /// A well-formed frame whose `type` is not in [`CLIENT_OP_KINDS`].
    #[serde(skip)]
    Unsupported {
        kind: String,
    },
}

impl ClientOp {
    pub fn kind(&self) -> &str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::SyncChangeSet { .. } => "sync_change_set",
            Self::Typing { .. } => "typing",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::ActivityUpdate { .. } => "activity_update",
            Self::ChatMessage { .. } => "chat_message",
            Self::CursorUpdate { .. } => "cursor_update",
            Self::Unsupported { kind } => kind,
        }
    }

    pub fn doc_id(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { doc_id }
            | Self::LeaveRoom { doc_id }
            | Self::SyncChangeSet { doc_id, .. }
            | Self::Typing { doc_id, .. }
            | Self::PresenceUpdate { doc_id, .. }
            | Self::ActivityUpdate { doc_id, .. }
            | Self::ChatMessage { doc_id, .. }
            | Self::CursorUpdate { doc_id, .. } => Some(doc_id),
            Self::Unsupported { .. } => None,
        }
    }

    /// Room events that fan out to other members; the sender must have joined.
    pub fn requires_membership(&self) -> bool {
        matches!(
            self,
            Self::Typing { .. }
                | Self::PresenceUpdate { .. }
                | Self::ActivityUpdate { .. }
                | Self::ChatMessage { .. }
                | Self::CursorUpdate { .. }
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpDecodeError {
    #[error("frame is not a JSON object with a string `type` field")]
    Malformed,

    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// Decode one text frame. Unknown kinds are not an error here: they become
/// [`ClientOp::Unsupported`] so the gateway can reject them explicitly.
pub fn decode_client_op(raw: &str) -> Result<ClientOp, OpDecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| OpDecodeError::Malformed)?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(OpDecodeError::Malformed);
    };

    if !CLIENT_OP_KINDS.contains(&kind) {
        return Ok(ClientOp::Unsupported { kind: kind.to_string() });
    }

    let kind = kind.to_string();
    serde_json::from_value(value)
        .map_err(|error| OpDecodeError::InvalidPayload { kind, reason: error.to_string() })
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    JoinedRoom {
        doc_id: String,
        participants: Vec<String>,
    },
    LeftRoom {
        doc_id: String,
    },
    UserJoined {
        participant: String,
        doc_id: String,
        timestamp: DateTime<Utc>,
    },
    UserLeft {
        participant: String,
        doc_id: String,
        timestamp: DateTime<Utc>,
    },
    ItineraryUpdated {
        doc_id: String,
        changes: Vec<Change>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolved_data: Option<Value>,
        participant: String,
        conflicts: Vec<Conflict>,
        timestamp: DateTime<Utc>,
    },
    UpdateConfirmed {
        doc_id: String,
        #[serde(flatten)]
        result: SyncResult,
    },
    UpdateFailed {
        doc_id: String,
        #[serde(flatten)]
        result: SyncResult,
    },
    ActivityUpdated {
        doc_id: String,
        activity_id: String,
        changes: Value,
        participant: String,
        timestamp: DateTime<Utc>,
    },
    ActivityUpdateConfirmed {
        doc_id: String,
        activity_id: String,
    },
    NewChatMessage {
        doc_id: String,
        message_id: String,
        participant: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    CursorMoved {
        doc_id: String,
        participant: String,
        position: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Value>,
    },
    TypingIndicator {
        doc_id: String,
        participant: String,
        is_typing: bool,
        timestamp: DateTime<Utc>,
    },
    PresenceUpdate {
        doc_id: String,
        participant: String,
        status: PresenceStatus,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        doc_id: Option<String>,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinedRoom { .. } => "joined_room",
            Self::LeftRoom { .. } => "left_room",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::ItineraryUpdated { .. } => "itinerary_updated",
            Self::UpdateConfirmed { .. } => "update_confirmed",
            Self::UpdateFailed { .. } => "update_failed",
            Self::ActivityUpdated { .. } => "activity_updated",
            Self::ActivityUpdateConfirmed { .. } => "activity_update_confirmed",
            Self::NewChatMessage { .. } => "new_chat_message",
            Self::CursorMoved { .. } => "cursor_moved",
            Self::TypingIndicator { .. } => "typing_indicator",
            Self::PresenceUpdate { .. } => "presence_update",
            Self::Error { .. } => "error",
        }
    }
}
