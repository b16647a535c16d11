// Keyed JSON context records with optional expiry.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{types::Json, PgPool};
use tokio::sync::RwLock;

use super::{ContextKind, ContextRecord};
use crate::sync::store::{StoreError, StoreFuture};

/// Every read takes `now` so that expired records read as absent on both
/// backends, whether or not the sweeper has removed them yet.
pub trait ContextStore: Send + Sync {
    fn get<'a>(&'a self, id: &'a str, now: DateTime<Utc>) -> StoreFuture<'a, Option<ContextRecord>>;

    /// Insert unless a live record already uses the id. An expired record is overwritten.
    fn insert<'a>(&'a self, record: &'a ContextRecord) -> StoreFuture<'a, bool>;

    /// Shallow-merge `patch` into a live record's data. `expires_at` replaces the
    /// record's expiry only when given.
    fn merge<'a>(
        &'a self,
        id: &'a str,
        patch: &'a Value,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<ContextRecord>>;

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool>;

    /// Newest `updated_at` first.
    fn by_user<'a>(
        &'a self,
        user_id: &'a str,
        kind: Option<ContextKind>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Vec<ContextRecord>>;

    /// Newest `updated_at` first.
    fn by_itinerary<'a>(
        &'a self,
        itinerary_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Vec<ContextRecord>>;

    fn delete_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, u64>;
}

pub(crate) fn merge_data(existing: &mut Value, patch: &Value) {
    match (existing, patch) {
        (Value::Object(current), Value::Object(incoming)) => {
            for (key, value) in incoming {
                current.insert(key.clone(), value.clone());
            }
        }
        (existing, patch) => *existing = patch.clone(),
    }
}

fn newest_first(mut records: Vec<ContextRecord>) -> Vec<ContextRecord> {
    records.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
    records
}

#[derive(Debug, Clone, Default)]
pub struct MemoryContextStore {
    records: Arc<RwLock<HashMap<String, ContextRecord>>>,
}

impl ContextStore for MemoryContextStore {
    fn get<'a>(&'a self, id: &'a str, now: DateTime<Utc>) -> StoreFuture<'a, Option<ContextRecord>> {
        Box::pin(async move {
            Ok(self.records.read().await.get(id).filter(|record| !record.is_expired_at(now)).cloned())
        })
    }

    fn insert<'a>(&'a self, record: &'a ContextRecord) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            if records.get(&record.id).is_some_and(|existing| !existing.is_expired_at(record.created_at)) {
                return Ok(false);
            }
            records.insert(record.id.clone(), record.clone());
            Ok(true)
        })
    }

    fn merge<'a>(
        &'a self,
        id: &'a str,
        patch: &'a Value,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<ContextRecord>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(id).filter(|record| !record.is_expired_at(now)) else {
                return Ok(None);
            };

            merge_data(&mut record.data, patch);
            record.updated_at = now;
            if expires_at.is_some() {
                record.expires_at = expires_at;
            }
            Ok(Some(record.clone()))
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.records.write().await.remove(id).is_some()) })
    }

    fn by_user<'a>(
        &'a self,
        user_id: &'a str,
        kind: Option<ContextKind>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Vec<ContextRecord>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(newest_first(
                records
                    .values()
                    .filter(|record| record.user_id.as_deref() == Some(user_id))
                    .filter(|record| kind.map_or(true, |kind| record.kind == kind))
                    .filter(|record| !record.is_expired_at(now))
                    .cloned()
                    .collect(),
            ))
        })
    }

    fn by_itinerary<'a>(
        &'a self,
        itinerary_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Vec<ContextRecord>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(newest_first(
                records
                    .values()
                    .filter(|record| record.itinerary_id.as_deref() == Some(itinerary_id))
                    .filter(|record| !record.is_expired_at(now))
                    .cloned()
                    .collect(),
            ))
        })
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, record| !record.is_expired_at(now));
            Ok((before - records.len()) as u64)
        })
    }
}

type ContextRow = (
    String,
    String,
    Json<Value>,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

const CONTEXT_COLUMNS: &str =
    "id, kind, data, user_id, itinerary_id, created_at, updated_at, expires_at";

fn record_from_row(row: ContextRow) -> Result<ContextRecord, StoreError> {
    let (id, kind, Json(data), user_id, itinerary_id, created_at, updated_at, expires_at) = row;
    let kind = kind
        .parse::<ContextKind>()
        .map_err(|_| StoreError::Corrupt(format!("context {id} has unknown kind `{kind}`")))?;
    Ok(ContextRecord { id, kind, data, user_id, itinerary_id, created_at, updated_at, expires_at })
}

#[derive(Debug, Clone)]
pub struct PostgresContextStore {
    pool: PgPool,
}

impl PostgresContextStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ContextStore for PostgresContextStore {
    fn get<'a>(&'a self, id: &'a str, now: DateTime<Utc>) -> StoreFuture<'a, Option<ContextRecord>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ContextRow>(&format!(
                "SELECT {CONTEXT_COLUMNS} FROM context_records \
                 WHERE id = $1 AND (expires_at IS NULL OR expires_at > $2)"
            ))
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            row.map(record_from_row).transpose()
        })
    }

    fn insert<'a>(&'a self, record: &'a ContextRecord) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let inserted = sqlx::query_scalar::<_, String>(
                r#"
INSERT INTO context_records
    (id, kind, data, user_id, itinerary_id, created_at, updated_at, expires_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (id) DO UPDATE
SET kind = EXCLUDED.kind,
    data = EXCLUDED.data,
    user_id = EXCLUDED.user_id,
    itinerary_id = EXCLUDED.itinerary_id,
    created_at = EXCLUDED.created_at,
    updated_at = EXCLUDED.updated_at,
    expires_at = EXCLUDED.expires_at
WHERE context_records.expires_at IS NOT NULL
  AND context_records.expires_at <= EXCLUDED.created_at
RETURNING id
                "#,
            )
            .bind(&record.id)
            .bind(record.kind.as_str())
            .bind(Json(&record.data))
            .bind(record.user_id.as_deref())
            .bind(record.itinerary_id.as_deref())
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.expires_at)
            .fetch_optional(&self.pool)
            .await?;

            Ok(inserted.is_some())
        })
    }

    fn merge<'a>(
        &'a self,
        id: &'a str,
        patch: &'a Value,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Option<ContextRecord>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, ContextRow>(&format!(
                r#"
UPDATE context_records
SET data = CASE
        WHEN jsonb_typeof(data) = 'object' AND jsonb_typeof($2) = 'object' THEN data || $2
        ELSE $2
    END,
    updated_at = $3,
    expires_at = COALESCE($4, expires_at)
WHERE id = $1
  AND (expires_at IS NULL OR expires_at > $3)
RETURNING {CONTEXT_COLUMNS}
                "#
            ))
            .bind(id)
            .bind(Json(patch))
            .bind(now)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await?;

            row.map(record_from_row).transpose()
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let deleted = sqlx::query("DELETE FROM context_records WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok(deleted > 0)
        })
    }

    fn by_user<'a>(
        &'a self,
        user_id: &'a str,
        kind: Option<ContextKind>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Vec<ContextRecord>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ContextRow>(&format!(
                "SELECT {CONTEXT_COLUMNS} FROM context_records \
                 WHERE user_id = $1 \
                   AND ($2::TEXT IS NULL OR kind = $2) \
                   AND (expires_at IS NULL OR expires_at > $3) \
                 ORDER BY updated_at DESC"
            ))
            .bind(user_id)
            .bind(kind.map(ContextKind::as_str))
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter().map(record_from_row).collect()
        })
    }

    fn by_itinerary<'a>(
        &'a self,
        itinerary_id: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Vec<ContextRecord>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ContextRow>(&format!(
                "SELECT {CONTEXT_COLUMNS} FROM context_records \
                 WHERE itinerary_id = $1 \
                   AND (expires_at IS NULL OR expires_at > $2) \
                 ORDER BY updated_at DESC"
            ))
            .bind(itinerary_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter().map(record_from_row).collect()
        })
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            Ok(sqlx::query("DELETE FROM context_records WHERE expires_at IS NOT NULL AND expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected())
        })
    }
}
