pub mod store;

use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::sync::store::StoreError;
use store::ContextStore;

pub const CHAT_CONTEXT_TTL_HOURS: i64 = 24;
const MAX_CONTEXT_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    UserPreferences,
    ItineraryContext,
    ChatContext,
    CollaborationState,
}

impl ContextKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserPreferences => "user_preferences",
            Self::ItineraryContext => "itinerary_context",
            Self::ChatContext => "chat_context",
            Self::CollaborationState => "collaboration_state",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextKind {
    type Err = ContextError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "user_preferences" => Ok(Self::UserPreferences),
            "itinerary_context" => Ok(Self::ItineraryContext),
            "chat_context" => Ok(Self::ChatContext),
            "collaboration_state" => Ok(Self::CollaborationState),
            other => Err(ContextError::Validation(format!("unknown context type `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ContextKind,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub itinerary_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ContextRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Client-supplied part of a record; timestamps are always stamped server-side.
#[derive(Debug, Clone, Deserialize)]
pub struct NewContext {
    pub id: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: ContextKind,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub itinerary_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_kind() -> ContextKind {
    ContextKind::UserPreferences
}

fn empty_object() -> Value {
    json!({})
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("{0}")]
    Validation(String),

    #[error("context `{0}` not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Unique per call; two messages in the same millisecond still get distinct ids.
pub fn chat_context_id(user_id: &str, at: DateTime<Utc>) -> String {
    format!("chat_{user_id}_{}_{}", at.timestamp_millis(), Uuid::new_v4().simple())
}

pub fn preferences_context_id(user_id: &str) -> String {
    format!("user_prefs_{user_id}")
}

fn validate_id(id: &str) -> Result<(), ContextError> {
    if id.trim().is_empty() {
        return Err(ContextError::Validation("context id must not be empty".to_string()));
    }
    if id.len() > MAX_CONTEXT_ID_LEN {
        return Err(ContextError::Validation(format!(
            "context id must be at most {MAX_CONTEXT_ID_LEN} bytes"
        )));
    }
    Ok(())
}

/// Arbitrary keyed JSON context (preferences, chat history) over a pluggable store.
#[derive(Clone)]
pub struct ContextManager {
    store: Arc<dyn ContextStore>,
}

impl ContextManager {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: &str) -> Result<Option<ContextRecord>, ContextError> {
        Ok(self.store.get(id, Utc::now()).await?)
    }

    pub async fn create(&self, new: NewContext) -> Result<ContextRecord, ContextError> {
        self.create_at(new, Utc::now()).await
    }

    async fn create_at(&self, new: NewContext, now: DateTime<Utc>) -> Result<ContextRecord, ContextError> {
        validate_id(&new.id)?;
        if new.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(ContextError::Validation("expires_at must be in the future".to_string()));
        }

        let record = ContextRecord {
            id: new.id,
            kind: new.kind,
            data: new.data,
            user_id: new.user_id,
            itinerary_id: new.itinerary_id,
            created_at: now,
            updated_at: now,
            expires_at: new.expires_at,
        };
        if !self.store.insert(&record).await? {
            return Err(ContextError::Validation(format!("context `{}` already exists", record.id)));
        }

        debug!(context_id = %record.id, kind = %record.kind, "context created");
        Ok(record)
    }

    pub async fn update(
        &self,
        id: &str,
        data: &Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ContextRecord, ContextError> {
        self.store
            .merge(id, data, expires_at, Utc::now())
            .await?
            .ok_or_else(|| ContextError::NotFound(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> Result<bool, ContextError> {
        Ok(self.store.delete(id).await?)
    }

    pub async fn user_contexts(
        &self,
        user_id: &str,
        kind: Option<ContextKind>,
    ) -> Result<Vec<ContextRecord>, ContextError> {
        Ok(self.store.by_user(user_id, kind, Utc::now()).await?)
    }

    pub async fn itinerary_contexts(&self, itinerary_id: &str) -> Result<Vec<ContextRecord>, ContextError> {
        Ok(self.store.by_itinerary(itinerary_id, Utc::now()).await?)
    }

    /// Persist one chat message as a short-lived context record.
    pub async fn create_chat_context(
        &self,
        user_id: &str,
        itinerary_id: &str,
        message: &str,
    ) -> Result<ContextRecord, ContextError> {
        let now = Utc::now();
        self.create_at(
            NewContext {
                id: chat_context_id(user_id, now),
                kind: ContextKind::ChatContext,
                data: json!({
                    "itinerary_id": itinerary_id,
                    "message": message,
                    "user_id": user_id,
                    "timestamp": now,
                }),
                user_id: Some(user_id.to_string()),
                itinerary_id: Some(itinerary_id.to_string()),
                expires_at: Some(now + Duration::hours(CHAT_CONTEXT_TTL_HOURS)),
            },
            now,
        )
        .await
    }

    /// Merge into the user's preferences record, creating it on first write.
    pub async fn update_user_preferences(
        &self,
        user_id: &str,
        preferences: &Value,
    ) -> Result<ContextRecord, ContextError> {
        let id = preferences_context_id(user_id);
        match self.update(&id, preferences, None).await {
            Ok(record) => return Ok(record),
            Err(ContextError::NotFound(_)) => {}
            Err(error) => return Err(error),
        }

        let created = self
            .create(NewContext {
                id: id.clone(),
                kind: ContextKind::UserPreferences,
                data: preferences.clone(),
                user_id: Some(user_id.to_string()),
                itinerary_id: None,
                expires_at: None,
            })
            .await;
        match created {
            // Lost a create race with another writer; merge into theirs.
            Err(ContextError::Validation(_)) => self.update(&id, preferences, None).await,
            other => other,
        }
    }

    pub async fn cleanup_expired(&self) -> Result<u64, ContextError> {
        let removed = self.store.delete_expired(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "expired context records removed");
        }
        Ok(removed)
    }
}
