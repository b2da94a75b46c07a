//! PostgreSQL key store.
//!
//! # Conditional Writes
//!
//! Debits use a version-guarded UPDATE:
//!
//! ```sql
//! UPDATE keys SET ..., version = version + 1 WHERE id = $1 AND version = $2
//! ```
//!
//! PostgreSQL evaluates the WHERE clause against the latest committed row
//! after acquiring its row lock, so two debits computed from the same
//! version can never both report one affected row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{KeyStore, WriteOutcome};
use crate::db::DbPool;
use crate::error::StoreError;
use crate::models::key::{KeyDebit, KeyRecord, RateLimitPolicy, WindowState};

const KEY_COLUMNS: &str = "id, hash, start, owner_id, meta, created_at, expires, \
     ratelimit_type, ratelimit_limit, ratelimit_refill_rate, ratelimit_refill_interval, \
     ratelimit_tokens, ratelimit_previous, ratelimit_updated_at, \
     name, remaining_requests, version";

/// Raw `keys` row, before the policy and window columns are validated.
#[derive(Debug, sqlx::FromRow)]
struct KeyRow {
    id: String,
    hash: String,
    start: String,
    owner_id: Option<String>,
    meta: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
    ratelimit_type: Option<String>,
    ratelimit_limit: Option<i64>,
    ratelimit_refill_rate: Option<i64>,
    ratelimit_refill_interval: Option<i64>,
    ratelimit_tokens: Option<i64>,
    ratelimit_previous: Option<i64>,
    ratelimit_updated_at: Option<DateTime<Utc>>,
    name: Option<String>,
    remaining_requests: Option<i64>,
    version: i64,
}

impl TryFrom<KeyRow> for KeyRecord {
    type Error = StoreError;

    fn try_from(row: KeyRow) -> Result<Self, Self::Error> {
        let invalid = |reason: String| StoreError::InvalidRecord {
            id: row.id.clone(),
            reason,
        };

        let ratelimit = RateLimitPolicy::from_columns(
            row.ratelimit_type.as_deref(),
            row.ratelimit_limit,
            row.ratelimit_refill_rate,
            row.ratelimit_refill_interval,
        )
        .map_err(|e| invalid(e.to_string()))?;
        let window = WindowState::from_columns(
            row.ratelimit_tokens,
            row.ratelimit_previous,
            row.ratelimit_updated_at,
        )
        .map_err(|e| invalid(e.to_string()))?;

        Ok(KeyRecord {
            id: row.id,
            hash: row.hash,
            start: row.start,
            owner_id: row.owner_id,
            meta: row.meta,
            created_at: row.created_at,
            expires_at: row.expires,
            ratelimit,
            window,
            name: row.name,
            remaining_requests: row.remaining_requests,
            version: row.version,
        })
    }
}

pub struct PgKeyStore {
    pool: DbPool,
}

impl PgKeyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(
        &self,
        column: &'static str,
        value: &str,
    ) -> Result<Option<KeyRecord>, StoreError> {
        let query = format!("SELECT {KEY_COLUMNS} FROM keys WHERE {column} = $1");
        sqlx::query_as::<_, KeyRow>(&query)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .map(KeyRecord::try_from)
            .transpose()
    }

    async fn exists(&self, key_id: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM keys WHERE id = $1)")
            .bind(key_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }
}

fn window_columns(
    window: Option<&WindowState>,
) -> (Option<i64>, Option<i64>, Option<DateTime<Utc>>) {
    match window {
        Some(w) => (Some(w.tokens), Some(w.previous), Some(w.updated_at)),
        None => (None, None, None),
    }
}

fn policy_columns(
    policy: Option<&RateLimitPolicy>,
) -> (Option<&'static str>, Option<i64>, Option<i64>, Option<i64>) {
    match policy {
        Some(p) => (
            Some(p.kind().as_str()),
            Some(p.limit()),
            Some(p.refill_rate()),
            Some(p.refill_interval_ms()),
        ),
        None => (None, None, None, None),
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn get(&self, key_id: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.fetch_where("id", key_id).await
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<KeyRecord>, StoreError> {
        self.fetch_where("hash", hash).await
    }

    async fn insert(&self, record: &KeyRecord) -> Result<(), StoreError> {
        let (kind, limit, rate, interval) = policy_columns(record.ratelimit.as_ref());
        let (tokens, previous, updated_at) = window_columns(record.window.as_ref());

        let result = sqlx::query(
            r#"
            INSERT INTO keys (
                id, hash, start, owner_id, meta, created_at, expires,
                ratelimit_type, ratelimit_limit, ratelimit_refill_rate, ratelimit_refill_interval,
                ratelimit_tokens, ratelimit_previous, ratelimit_updated_at,
                name, remaining_requests, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&record.id)
        .bind(&record.hash)
        .bind(&record.start)
        .bind(&record.owner_id)
        .bind(&record.meta)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(kind)
        .bind(limit)
        .bind(rate)
        .bind(interval)
        .bind(tokens)
        .bind(previous)
        .bind(updated_at)
        .bind(&record.name)
        .bind(record.remaining_requests)
        .bind(record.version)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateKey(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, record: &KeyRecord) -> Result<WriteOutcome, StoreError> {
        let (kind, limit, rate, interval) = policy_columns(record.ratelimit.as_ref());
        let (tokens, previous, updated_at) = window_columns(record.window.as_ref());

        let updated = sqlx::query(
            r#"
            UPDATE keys
            SET hash = $1,
                start = $2,
                owner_id = $3,
                meta = $4,
                created_at = $5,
                expires = $6,
                ratelimit_type = $7,
                ratelimit_limit = $8,
                ratelimit_refill_rate = $9,
                ratelimit_refill_interval = $10,
                ratelimit_tokens = $11,
                ratelimit_previous = $12,
                ratelimit_updated_at = $13,
                name = $14,
                remaining_requests = $15,
                version = version + 1
            WHERE id = $16
            "#,
        )
        .bind(&record.hash)
        .bind(&record.start)
        .bind(&record.owner_id)
        .bind(&record.meta)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(kind)
        .bind(limit)
        .bind(rate)
        .bind(interval)
        .bind(tokens)
        .bind(previous)
        .bind(updated_at)
        .bind(&record.name)
        .bind(record.remaining_requests)
        .bind(&record.id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(if updated == 0 {
            WriteOutcome::NotFound
        } else {
            WriteOutcome::Applied
        })
    }

    async fn conditional_update(
        &self,
        key_id: &str,
        expected_version: i64,
        debit: &KeyDebit,
    ) -> Result<WriteOutcome, StoreError> {
        let (tokens, previous, updated_at) = window_columns(debit.window.as_ref());

        let updated = sqlx::query(
            r#"
            UPDATE keys
            SET remaining_requests = $1,
                ratelimit_tokens = $2,
                ratelimit_previous = $3,
                ratelimit_updated_at = $4,
                version = version + 1
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(debit.remaining_requests)
        .bind(tokens)
        .bind(previous)
        .bind(updated_at)
        .bind(key_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(WriteOutcome::Applied);
        }

        // Zero rows: either someone bumped the version or the key is gone
        if self.exists(key_id).await? {
            Ok(WriteOutcome::VersionConflict)
        } else {
            Ok(WriteOutcome::NotFound)
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
