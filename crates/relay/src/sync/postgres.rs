// Postgres-backed document store.
//
// Lock rows use the same atomic upsert shape as a lease table: an insert
// that only overwrites an existing row once it has expired. Snapshot and
// history writes share one transaction guarded by the snapshot version.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{types::Json, PgPool};
use uuid::Uuid;
use voyage_common::types::{Change, HistoryRecord};

use super::store::{DocumentStore, LockClaim, StoreError, StoreFuture, StoredSnapshot};

#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete lock rows whose TTL has elapsed. Returns the number removed.
    pub async fn evict_expired_locks(&self) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM itinerary_locks WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted)
    }
}

fn expires_at_with_ttl(now: DateTime<Utc>, claim: &LockClaim) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(claim.ttl)
        .map(|ttl| now + ttl)
        .map_err(|_| StoreError::Unavailable("lock ttl does not fit a timestamp".to_string()))
}

impl DocumentStore for PostgresDocumentStore {
    fn try_acquire_lock<'a>(&'a self, doc_id: &'a str, claim: &'a LockClaim) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let now = Utc::now();
            let expires_at = expires_at_with_ttl(now, claim)?;

            let granted = sqlx::query_scalar::<_, Uuid>(
                r#"
INSERT INTO itinerary_locks (doc_id, lock_token, holder_id, acquired_at, expires_at)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (doc_id) DO UPDATE
SET lock_token = EXCLUDED.lock_token,
    holder_id = EXCLUDED.holder_id,
    acquired_at = EXCLUDED.acquired_at,
    expires_at = EXCLUDED.expires_at
WHERE itinerary_locks.expires_at <= $4
RETURNING lock_token
                "#,
            )
            .bind(doc_id)
            .bind(claim.token)
            .bind(&claim.participant_id)
            .bind(now)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await?;

            Ok(granted == Some(claim.token))
        })
    }

    fn release_lock<'a>(&'a self, doc_id: &'a str, token: Uuid) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let deleted =
                sqlx::query("DELETE FROM itinerary_locks WHERE doc_id = $1 AND lock_token = $2")
                    .bind(doc_id)
                    .bind(token)
                    .execute(&self.pool)
                    .await?
                    .rows_affected();

            Ok(deleted == 1)
        })
    }

    fn lock_holder<'a>(&'a self, doc_id: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let holder = sqlx::query_scalar::<_, String>(
                "SELECT holder_id FROM itinerary_locks WHERE doc_id = $1 AND expires_at > $2",
            )
            .bind(doc_id)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;

            Ok(holder)
        })
    }

    fn load_snapshot<'a>(&'a self, doc_id: &'a str) -> StoreFuture<'a, Option<StoredSnapshot>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, (Json<Value>, i64)>(
                "SELECT data, version FROM itinerary_snapshots WHERE doc_id = $1",
            )
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(|(Json(data), version)| StoredSnapshot { data, version }))
        })
    }

    fn commit<'a>(
        &'a self,
        doc_id: &'a str,
        data: &'a Value,
        expected_version: Option<i64>,
        record: &'a HistoryRecord,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut transaction = self.pool.begin().await?;

            let written = match expected_version {
                None => sqlx::query(
                    r#"
INSERT INTO itinerary_snapshots (doc_id, data, version, updated_at)
VALUES ($1, $2, 1, $3)
ON CONFLICT (doc_id) DO NOTHING
                    "#,
                )
                .bind(doc_id)
                .bind(Json(data))
                .bind(record.timestamp)
                .execute(&mut *transaction)
                .await?
                .rows_affected(),
                Some(version) => sqlx::query(
                    r#"
UPDATE itinerary_snapshots
SET data = $2, version = version + 1, updated_at = $3
WHERE doc_id = $1
  AND version = $4
                    "#,
                )
                .bind(doc_id)
                .bind(Json(data))
                .bind(record.timestamp)
                .bind(version)
                .execute(&mut *transaction)
                .await?
                .rows_affected(),
            };

            if written != 1 {
                transaction.rollback().await?;
                return Ok(false);
            }

            sqlx::query(
                r#"
INSERT INTO itinerary_history (doc_id, submitter, changes, had_conflicts, recorded_at)
VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(doc_id)
            .bind(&record.submitter)
            .bind(Json(&record.changes))
            .bind(record.had_conflicts)
            .bind(record.timestamp)
            .execute(&mut *transaction)
            .await?;

            transaction.commit().await?;
            Ok(true)
        })
    }

    fn history<'a>(&'a self, doc_id: &'a str, limit: usize) -> StoreFuture<'a, Vec<HistoryRecord>> {
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = sqlx::query_as::<_, (String, Json<Vec<Change>>, bool, DateTime<Utc>)>(
                r#"
SELECT submitter, changes, had_conflicts, recorded_at
FROM itinerary_history
WHERE doc_id = $1
ORDER BY id DESC
LIMIT $2
                "#,
            )
            .bind(doc_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|(submitter, Json(changes), had_conflicts, timestamp)| HistoryRecord {
                    changes,
                    submitter,
                    timestamp,
                    had_conflicts,
                })
                .collect())
        })
    }

    fn add_collaborator<'a>(&'a self, doc_id: &'a str, participant_id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let inserted = sqlx::query(
                r#"
INSERT INTO itinerary_collaborators (doc_id, participant_id)
VALUES ($1, $2)
ON CONFLICT (doc_id, participant_id) DO NOTHING
                "#,
            )
            .bind(doc_id)
            .bind(participant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

            Ok(inserted == 1)
        })
    }

    fn remove_collaborator<'a>(
        &'a self,
        doc_id: &'a str,
        participant_id: &'a str,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let deleted = sqlx::query(
                "DELETE FROM itinerary_collaborators WHERE doc_id = $1 AND participant_id = $2",
            )
            .bind(doc_id)
            .bind(participant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

            Ok(deleted == 1)
        })
    }

    fn collaborators<'a>(&'a self, doc_id: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let members = sqlx::query_scalar::<_, String>(
                "SELECT participant_id FROM itinerary_collaborators WHERE doc_id = $1 ORDER BY participant_id",
            )
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await?;

            Ok(members)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::PostgresDocumentStore;
    use crate::db::{
        migrations::run_migrations,
        pool::{create_pg_pool, PoolConfig},
    };
    use crate::sync::store::{DocumentStore, LockClaim};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;
    use voyage_common::types::HistoryRecord;

    async fn test_store() -> Option<PostgresDocumentStore> {
        let Some(database_url) = std::env::var("VOYAGE_RELAY_TEST_DATABASE_URL").ok() else {
            eprintln!("skipping document store postgres test: set VOYAGE_RELAY_TEST_DATABASE_URL");
            return None;
        };

        let pool = create_pg_pool(&database_url, PoolConfig::from_env())
            .await
            .expect("test postgres pool should connect");
        run_migrations(&pool).await.expect("relay migrations should apply");

        Some(PostgresDocumentStore::new(pool))
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let Some(store) = test_store().await else {
            return;
        };
        let doc_id = format!("trip-{}", Uuid::new_v4());
        let first = LockClaim::new("alice", Duration::from_secs(30));
        let second = LockClaim::new("bob", Duration::from_secs(30));

        assert!(store.try_acquire_lock(&doc_id, &first).await.expect("acquire"));
        assert!(!store.try_acquire_lock(&doc_id, &second).await.expect("contended"));
        assert!(!store.release_lock(&doc_id, second.token).await.expect("wrong token"));
        assert!(store.release_lock(&doc_id, first.token).await.expect("release"));
        assert!(store.try_acquire_lock(&doc_id, &second).await.expect("reacquire"));
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let Some(store) = test_store().await else {
            return;
        };
        let doc_id = format!("trip-{}", Uuid::new_v4());

        assert!(store
            .try_acquire_lock(&doc_id, &LockClaim::new("alice", Duration::from_millis(50)))
            .await
            .expect("acquire"));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(store
            .try_acquire_lock(&doc_id, &LockClaim::new("bob", Duration::from_secs(30)))
            .await
            .expect("takeover"));
        assert_eq!(store.lock_holder(&doc_id).await.expect("holder"), Some("bob".to_string()));
    }

    #[tokio::test]
    async fn commit_rejects_stale_versions() {
        let Some(store) = test_store().await else {
            return;
        };
        let doc_id = format!("trip-{}", Uuid::new_v4());
        let record = HistoryRecord {
            changes: Vec::new(),
            submitter: "alice".to_string(),
            timestamp: Utc::now(),
            had_conflicts: false,
        };

        assert!(store.commit(&doc_id, &json!({ "a": 1 }), None, &record).await.expect("create"));
        assert!(!store.commit(&doc_id, &json!({ "a": 3 }), None, &record).await.expect("stale"));
        assert!(store.commit(&doc_id, &json!({ "a": 2 }), Some(1), &record).await.expect("update"));

        let snapshot = store.load_snapshot(&doc_id).await.expect("load").expect("exists");
        assert_eq!(snapshot.data, json!({ "a": 2 }));
        assert_eq!(store.history(&doc_id, 10).await.expect("history").len(), 2);
    }
}
