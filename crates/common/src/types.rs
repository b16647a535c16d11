// Core domain types shared between the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Snapshot key stamped with the time of the last accepted change set.
pub const LAST_MODIFIED_KEY: &str = "lastModified";
/// Snapshot key stamped with the participant that submitted the last change set.
pub const LAST_MODIFIED_BY_KEY: &str = "lastModifiedBy";

/// A single field-level mutation proposed against an itinerary snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    /// Dot-separated path into the snapshot, e.g. `days.0.title`.
    pub field: String,
    /// Value the submitter believes is currently stored at `field`.
    /// A missing field compares equal to `null`.
    #[serde(default)]
    pub old_value: Value,
    #[serde(default)]
    pub new_value: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Stamped by the relay from the authenticated participant; client values are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
}

/// A change rejected because its expected prior value did not match the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    pub field: String,
    pub expected: Value,
    /// Value found at `field` when the change set was applied.
    pub actual: Value,
    pub attempted: Value,
}

impl Conflict {
    pub fn from_change(change: &Change, actual: Value) -> Self {
        Self {
            field: change.field.clone(),
            expected: change.old_value.clone(),
            actual,
            attempted: change.new_value.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncFailureReason {
    /// Another mutation holds the document lock. Retryable by the caller.
    LockContention,
    /// The lock or snapshot store could not be reached.
    StoreUnavailable,
    /// At least one change carried a field path that cannot address a snapshot value.
    InvalidChangeSet,
}

impl SyncFailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LockContention => "lock_contention",
            Self::StoreUnavailable => "store_unavailable",
            Self::InvalidChangeSet => "invalid_change_set",
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::LockContention => "Itinerary is currently being modified by another user",
            Self::StoreUnavailable => "Failed to synchronize itinerary",
            Self::InvalidChangeSet => "Change set contains an invalid field path",
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::LockContention | Self::StoreUnavailable)
    }
}

/// Outcome of a single `sync_change_set` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SyncFailureReason>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Value>,
    pub message: String,
}

impl SyncResult {
    pub fn applied(conflicts: Vec<Conflict>, resolved_data: Value) -> Self {
        let message = if conflicts.is_empty() {
            "Successfully synchronized".to_string()
        } else {
            format!("Synchronized with {} conflicts", conflicts.len())
        };

        Self { success: true, reason: None, conflicts, resolved_data: Some(resolved_data), message }
    }

    pub fn failed(reason: SyncFailureReason) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            conflicts: Vec::new(),
            resolved_data: None,
            message: reason.message().to_string(),
        }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Append-only audit entry written for every applied change set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub changes: Vec<Change>,
    pub submitter: String,
    pub timestamp: DateTime<Utc>,
    pub had_conflicts: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
}

/// Process-local connection counters reported by `GET /api/realtime/stats`.
/// Field names go over the wire as-is (snake_case), like every other shape here.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealtimeStats {
    pub connected_participants: usize,
    pub active_rooms: usize,
    pub total_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::{Change, Conflict, RealtimeStats, SyncFailureReason, SyncResult};
    use serde_json::json;

    #[test]
    fn change_defaults_missing_old_value_to_null() {
        let change: Change = serde_json::from_value(json!({ "field": "title", "new_value": "Lisbon" }))
            .expect("change should decode");

        assert!(change.old_value.is_null());
        assert_eq!(change.new_value, json!("Lisbon"));
        assert!(change.submitter.is_none());
    }

    #[test]
    fn applied_result_message_counts_conflicts() {
        let change: Change =
            serde_json::from_value(json!({ "field": "a", "old_value": 99, "new_value": 2 }))
                .expect("change should decode");
        let result = SyncResult::applied(vec![Conflict::from_change(&change, json!(1))], json!({}));

        assert!(result.success);
        assert!(result.has_conflicts());
        assert_eq!(result.message, "Synchronized with 1 conflicts");
    }

    #[test]
    fn failed_result_serializes_snake_case_reason() {
        let encoded = serde_json::to_value(SyncResult::failed(SyncFailureReason::LockContention))
            .expect("result should encode");

        assert_eq!(encoded["success"], false);
        assert_eq!(encoded["reason"], "lock_contention");
        assert!(encoded.get("resolved_data").is_none());
        assert_eq!(encoded["message"], "Itinerary is currently being modified by another user");
    }

    #[test]
    fn wire_names_are_snake_case() {
        let stats = serde_json::to_value(RealtimeStats {
            connected_participants: 3,
            active_rooms: 2,
            total_connections: 4,
        })
        .expect("stats should encode");
        assert_eq!(stats, json!({ "connected_participants": 3, "active_rooms": 2, "total_connections": 4 }));

        let applied = serde_json::to_value(SyncResult::applied(Vec::new(), json!({ "lastModifiedBy": "a" })))
            .expect("result should encode");
        assert_eq!(applied["resolved_data"]["lastModifiedBy"], "a");
        assert!(applied.get("resolvedData").is_none());
    }
}
