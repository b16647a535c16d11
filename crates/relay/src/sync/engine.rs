// Lock-guarded, conflict-reporting mutation of itinerary snapshots.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};
use uuid::Uuid;
use voyage_common::{
    path::FieldPath,
    types::{
        Change, Conflict, HistoryRecord, SyncFailureReason, SyncResult, LAST_MODIFIED_BY_KEY,
        LAST_MODIFIED_KEY,
    },
};

use super::store::{DocumentStore, LockClaim, StoreError};
use crate::metrics;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum ApplyError {
    Store(StoreError),
    /// The snapshot moved under us, which only happens once our lock expired.
    VersionMoved,
}

impl From<StoreError> for ApplyError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

/// Releases the document lock on drop unless [`LockGuard::release`] ran,
/// covering cancelled and panicking sync futures.
struct LockGuard {
    store: Arc<dyn DocumentStore>,
    doc_id: String,
    token: Uuid,
    released: bool,
}

impl LockGuard {
    fn new(store: Arc<dyn DocumentStore>, doc_id: &str, token: Uuid) -> Self {
        Self { store, doc_id: doc_id.to_string(), token, released: false }
    }

    async fn release(mut self) {
        self.released = true;
        release_lock(self.store.as_ref(), &self.doc_id, self.token).await;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let doc_id = std::mem::take(&mut self.doc_id);
        let token = self.token;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release_lock(store.as_ref(), &doc_id, token).await });
            }
            Err(_) => warn!(doc_id = %doc_id, "lock dropped outside runtime; left to expire"),
        }
    }
}

async fn release_lock(store: &dyn DocumentStore, doc_id: &str, token: Uuid) {
    match store.release_lock(doc_id, token).await {
        Ok(true) => {}
        Ok(false) => warn!(doc_id, "lock expired before release"),
        Err(error) => error!(doc_id, error = %error, "failed to release document lock; left to expire"),
    }
}

/// Serializes mutations per document through the store's TTL lock. Calls for
/// different documents never wait on each other.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn DocumentStore>,
    lock_ttl: Duration,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_lock_ttl(store, DEFAULT_LOCK_TTL)
    }

    pub fn with_lock_ttl(store: Arc<dyn DocumentStore>, lock_ttl: Duration) -> Self {
        Self { store, lock_ttl }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Apply `changes` to the document's snapshot. Contention fails fast and
    /// store faults become `store_unavailable`; nothing here returns an error.
    pub async fn sync_change_set(
        &self,
        doc_id: &str,
        changes: Vec<Change>,
        participant_id: &str,
    ) -> SyncResult {
        let result = self.sync_change_set_inner(doc_id, changes, participant_id).await;
        metrics::record_sync_outcome(&result);
        result
    }

    async fn sync_change_set_inner(
        &self,
        doc_id: &str,
        mut changes: Vec<Change>,
        participant_id: &str,
    ) -> SyncResult {
        let mut paths = Vec::with_capacity(changes.len());
        for change in &changes {
            match FieldPath::parse(&change.field) {
                Ok(path) => paths.push(path),
                Err(error) => {
                    debug!(doc_id, field = %change.field, error = %error, "rejected change set");
                    return SyncResult::failed(SyncFailureReason::InvalidChangeSet);
                }
            }
        }
        for change in &mut changes {
            change.submitter = Some(participant_id.to_string());
        }

        let claim = LockClaim::new(participant_id, self.lock_ttl);
        match self.store.try_acquire_lock(doc_id, &claim).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(doc_id, participant = participant_id, "document lock is held");
                return SyncResult::failed(SyncFailureReason::LockContention);
            }
            Err(error) => {
                error!(doc_id, error = %error, "failed to acquire document lock");
                return SyncResult::failed(SyncFailureReason::StoreUnavailable);
            }
        }

        let guard = LockGuard::new(Arc::clone(&self.store), doc_id, claim.token);
        let outcome = self.apply_locked(doc_id, changes, &paths, participant_id).await;
        guard.release().await;

        match outcome {
            Ok(result) => result,
            Err(ApplyError::VersionMoved) => {
                warn!(doc_id, "snapshot changed while lock was held; lock likely expired");
                SyncResult::failed(SyncFailureReason::LockContention)
            }
            Err(ApplyError::Store(error)) => {
                error!(doc_id, error = %error, "document store failed during sync");
                SyncResult::failed(SyncFailureReason::StoreUnavailable)
            }
        }
    }

    async fn apply_locked(
        &self,
        doc_id: &str,
        changes: Vec<Change>,
        paths: &[FieldPath],
        participant_id: &str,
    ) -> Result<SyncResult, ApplyError> {
        let stored = self.store.load_snapshot(doc_id).await?;
        let expected_version = stored.as_ref().map(|snapshot| snapshot.version);
        let mut snapshot = match stored.map(|snapshot| snapshot.data) {
            Some(Value::Object(map)) => Value::Object(map),
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(_) => return Err(StoreError::Corrupt(format!("snapshot for {doc_id} is not an object")).into()),
        };

        let conflicts = apply_changes(&mut snapshot, &changes, paths);

        let now = Utc::now();
        if let Value::Object(map) = &mut snapshot {
            map.insert(LAST_MODIFIED_KEY.to_string(), Value::String(now.to_rfc3339()));
            map.insert(LAST_MODIFIED_BY_KEY.to_string(), Value::String(participant_id.to_string()));
        }

        let record = HistoryRecord {
            changes,
            submitter: participant_id.to_string(),
            timestamp: now,
            had_conflicts: !conflicts.is_empty(),
        };
        if !self.store.commit(doc_id, &snapshot, expected_version, &record).await? {
            return Err(ApplyError::VersionMoved);
        }

        debug!(
            doc_id,
            participant = participant_id,
            changes = record.changes.len(),
            conflicts = conflicts.len(),
            "change set applied"
        );
        Ok(SyncResult::applied(conflicts, snapshot))
    }

    /// Current snapshot, or `None` when the document was never written.
    pub async fn state(&self, doc_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.store.load_snapshot(doc_id).await?.map(|snapshot| snapshot.data))
    }

    pub async fn history(&self, doc_id: &str, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        self.store.history(doc_id, limit).await
    }
}

/// Apply each change whose expected value matches the snapshot, in order.
/// Mismatches, and paths that cannot be written, are returned as conflicts.
fn apply_changes(snapshot: &mut Value, changes: &[Change], paths: &[FieldPath]) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for (change, path) in changes.iter().zip(paths) {
        let current = path.get(snapshot).cloned().unwrap_or(Value::Null);
        if !json_eq(&current, &change.old_value) {
            conflicts.push(Conflict::from_change(change, current));
            continue;
        }

        if let Err(error) = path.set(snapshot, change.new_value.clone()) {
            debug!(field = %change.field, error = %error, "change could not be written");
            conflicts.push(Conflict::from_change(change, current));
        }
    }
    conflicts
}

/// Structural equality where `1` and `1.0` are the same number.
fn json_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len() && a.iter().all(|(key, a)| b.get(key).is_some_and(|b| json_eq(a, b)))
        }
        _ => left == right,
    }
}
