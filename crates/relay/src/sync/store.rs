// Lock, snapshot and history storage contract for the sync engine.

use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use serde_json::Value;
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;
use voyage_common::types::HistoryRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store query failed: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("stored document is unreadable: {0}")]
    Corrupt(String),

    #[error("document store is unavailable: {0}")]
    Unavailable(String),
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// One attempt to take a document's mutation lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockClaim {
    /// Unique per attempt, so a holder can never release a lock it lost to expiry.
    pub token: Uuid,
    pub participant_id: String,
    pub ttl: Duration,
}

impl LockClaim {
    pub fn new(participant_id: &str, ttl: Duration) -> Self {
        Self { token: Uuid::new_v4(), participant_id: participant_id.to_string(), ttl }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub data: Value,
    /// Incremented on every commit; used as the compare-and-swap guard.
    pub version: i64,
}

pub trait DocumentStore: Send + Sync {
    /// Atomic set-if-absent. An expired lock counts as absent.
    fn try_acquire_lock<'a>(&'a self, doc_id: &'a str, claim: &'a LockClaim) -> StoreFuture<'a, bool>;

    /// Remove the lock only if it is still held under `token`.
    fn release_lock<'a>(&'a self, doc_id: &'a str, token: Uuid) -> StoreFuture<'a, bool>;

    /// Participant currently holding an unexpired lock.
    fn lock_holder<'a>(&'a self, doc_id: &'a str) -> StoreFuture<'a, Option<String>>;

    fn load_snapshot<'a>(&'a self, doc_id: &'a str) -> StoreFuture<'a, Option<StoredSnapshot>>;

    /// Overwrite the snapshot and append `record` in one step. Returns false
    /// without writing when the stored version is no longer `expected_version`
    /// (`None` meaning the document must not exist yet).
    fn commit<'a>(
        &'a self,
        doc_id: &'a str,
        data: &'a Value,
        expected_version: Option<i64>,
        record: &'a HistoryRecord,
    ) -> StoreFuture<'a, bool>;

    /// Most recent history records first.
    fn history<'a>(&'a self, doc_id: &'a str, limit: usize) -> StoreFuture<'a, Vec<HistoryRecord>>;

    fn add_collaborator<'a>(&'a self, doc_id: &'a str, participant_id: &'a str) -> StoreFuture<'a, bool>;

    fn remove_collaborator<'a>(
        &'a self,
        doc_id: &'a str,
        participant_id: &'a str,
    ) -> StoreFuture<'a, bool>;

    fn collaborators<'a>(&'a self, doc_id: &'a str) -> StoreFuture<'a, Vec<String>>;
}

#[derive(Debug, Clone)]
struct MemoryLock {
    token: Uuid,
    participant_id: String,
    expires_at: Instant,
}

impl MemoryLock {
    fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    locks: HashMap<String, MemoryLock>,
    snapshots: HashMap<String, StoredSnapshot>,
    history: HashMap<String, Vec<HistoryRecord>>,
    collaborators: HashMap<String, BTreeSet<String>>,
}

/// Single-process store used when no database is configured, and in tests.
/// Lock expiry follows `tokio::time`, so paused-clock tests can advance it.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
}

impl DocumentStore for MemoryDocumentStore {
    fn try_acquire_lock<'a>(&'a self, doc_id: &'a str, claim: &'a LockClaim) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = Instant::now();
            let mut guard = self.state.lock().await;
            if guard.locks.get(doc_id).is_some_and(|lock| !lock.is_expired_at(now)) {
                return Ok(false);
            }

            guard.locks.insert(
                doc_id.to_string(),
                MemoryLock {
                    token: claim.token,
                    participant_id: claim.participant_id.clone(),
                    expires_at: now + claim.ttl,
                },
            );
            Ok(true)
        })
    }

    fn release_lock<'a>(&'a self, doc_id: &'a str, token: Uuid) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut guard = self.state.lock().await;
            if guard.locks.get(doc_id).is_some_and(|lock| lock.token == token) {
                guard.locks.remove(doc_id);
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn lock_holder<'a>(&'a self, doc_id: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let now = Instant::now();
            let guard = self.state.lock().await;
            Ok(guard
                .locks
                .get(doc_id)
                .filter(|lock| !lock.is_expired_at(now))
                .map(|lock| lock.participant_id.clone()))
        })
    }

    fn load_snapshot<'a>(&'a self, doc_id: &'a str) -> StoreFuture<'a, Option<StoredSnapshot>> {
        Box::pin(async move { Ok(self.state.lock().await.snapshots.get(doc_id).cloned()) })
    }

    fn commit<'a>(
        &'a self,
        doc_id: &'a str,
        data: &'a Value,
        expected_version: Option<i64>,
        record: &'a HistoryRecord,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut guard = self.state.lock().await;
            let current_version = guard.snapshots.get(doc_id).map(|snapshot| snapshot.version);
            if current_version != expected_version {
                return Ok(false);
            }

            guard.snapshots.insert(
                doc_id.to_string(),
                StoredSnapshot { data: data.clone(), version: expected_version.unwrap_or(0) + 1 },
            );
            guard.history.entry(doc_id.to_string()).or_default().push(record.clone());
            Ok(true)
        })
    }

    fn history<'a>(&'a self, doc_id: &'a str, limit: usize) -> StoreFuture<'a, Vec<HistoryRecord>> {
        Box::pin(async move {
            let guard = self.state.lock().await;
            Ok(guard
                .history
                .get(doc_id)
                .map(|records| records.iter().rev().take(limit).cloned().collect())
                .unwrap_or_default())
        })
    }

    fn add_collaborator<'a>(&'a self, doc_id: &'a str, participant_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut guard = self.state.lock().await;
            Ok(guard
                .collaborators
                .entry(doc_id.to_string())
                .or_default()
                .insert(participant_id.to_string()))
        })
    }

    fn remove_collaborator<'a>(
        &'a self,
        doc_id: &'a str,
        participant_id: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut guard = self.state.lock().await;
            let Some(members) = guard.collaborators.get_mut(doc_id) else {
                return Ok(false);
            };
            let removed = members.remove(participant_id);
            if members.is_empty() {
                guard.collaborators.remove(doc_id);
            }
            Ok(removed)
        })
    }

    fn collaborators<'a>(&'a self, doc_id: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let guard = self.state.lock().await;
            Ok(guard
                .collaborators
                .get(doc_id)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default())
        })
    }
}
