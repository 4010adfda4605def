//! Postgres-backed result cache (`result_cache` table).

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use bulklabel_core::{Fingerprint, ResultRef};

use super::{CacheConfig, CacheEntry, CacheError, CacheStats, EvictionReport, PutOutcome, ResultCache};
use crate::db::describe_sqlx_error;

#[derive(Debug, Clone)]
pub struct PostgresResultCache {
    pool: Arc<PgPool>,
    runtime: Handle,
    config: CacheConfig,
}

impl PostgresResultCache {
    pub fn new(pool: PgPool, runtime: Handle, config: CacheConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
            config,
        }
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    pub async fn get_async(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query(
            r#"
            SELECT result_ref, created_at, expires_at, size_estimate
            FROM result_cache
            WHERE fingerprint = $1 AND expires_at > $2
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage("cache_get", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let entry = (|| -> Result<CacheEntry, sqlx::Error> {
            let result_ref: Uuid = row.try_get("result_ref")?;
            let size: i64 = row.try_get("size_estimate")?;
            Ok(CacheEntry {
                fingerprint: fingerprint.clone(),
                result_ref: ResultRef::from_uuid(result_ref),
                created_at: row.try_get("created_at")?,
                expires_at: row.try_get("expires_at")?,
                size_estimate: size.max(0) as u64,
            })
        })()
        .map_err(|e| storage("cache_get", e))?;
        Ok(Some(entry))
    }

    /// An expired row is overwritten; a live row only gets its expiry extended.
    #[instrument(skip_all, fields(fingerprint = %fingerprint.short()), err)]
    pub async fn put_async(
        &self,
        fingerprint: &Fingerprint,
        result_ref: ResultRef,
        size_estimate: u64,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome, CacheError> {
        let entry = CacheEntry::new(
            fingerprint.clone(),
            result_ref,
            size_estimate,
            self.config.ttl,
            now,
        );
        // `replaced` is true for a fresh insert or an overwrite of an expired row.
        let replaced: bool = sqlx::query_scalar(
            r#"
            INSERT INTO result_cache AS c (fingerprint, result_ref, created_at, expires_at, size_estimate)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (fingerprint) DO UPDATE SET
                result_ref = CASE WHEN c.expires_at <= $3 THEN EXCLUDED.result_ref ELSE c.result_ref END,
                created_at = CASE WHEN c.expires_at <= $3 THEN EXCLUDED.created_at ELSE c.created_at END,
                size_estimate = CASE WHEN c.expires_at <= $3 THEN EXCLUDED.size_estimate ELSE c.size_estimate END,
                expires_at = EXCLUDED.expires_at
            RETURNING (xmax = 0 OR created_at = $3) AS replaced
            "#,
        )
        .bind(entry.fingerprint.as_str())
        .bind(*entry.result_ref.as_uuid())
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .bind(i64::try_from(entry.size_estimate).unwrap_or(i64::MAX))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| storage("cache_put", e))?;

        Ok(if replaced {
            PutOutcome::Inserted
        } else {
            PutOutcome::Refreshed
        })
    }

    #[instrument(skip(self), err)]
    pub async fn evict_async(&self, now: DateTime<Utc>) -> Result<EvictionReport, CacheError> {
        let mut tx = self.pool.begin().await.map_err(|e| storage("cache_evict", e))?;

        let expired = sqlx::query("DELETE FROM result_cache WHERE expires_at <= $1")
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("cache_evict", e))?
            .rows_affected();

        // Keep the newest entries whose running size fits; drop the rest.
        let over_capacity = sqlx::query(
            r#"
            DELETE FROM result_cache
            WHERE fingerprint IN (
                SELECT fingerprint FROM (
                    SELECT fingerprint,
                           SUM(size_estimate) OVER (
                               ORDER BY created_at DESC, fingerprint DESC
                           ) AS running
                    FROM result_cache
                ) ranked
                WHERE running > $1
            )
            "#,
        )
        .bind(i64::try_from(self.config.capacity_bytes).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await
        .map_err(|e| storage("cache_evict", e))?
        .rows_affected();

        let (entries, bytes) = occupancy(&mut *tx).await?;
        tx.commit().await.map_err(|e| storage("cache_evict", e))?;

        debug!(expired, over_capacity, entries, "cache eviction pass");
        Ok(EvictionReport {
            expired,
            over_capacity,
            remaining_entries: entries,
            remaining_bytes: bytes,
        })
    }

    pub async fn stats_async(&self) -> Result<CacheStats, CacheError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| storage("cache_stats", e))?;
        let (entries, total_bytes) = occupancy(&mut *conn).await?;
        Ok(CacheStats {
            entries,
            total_bytes,
            capacity_bytes: self.config.capacity_bytes,
        })
    }
}

async fn occupancy(conn: &mut sqlx::PgConnection) -> Result<(u64, u64), CacheError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS entries, COALESCE(SUM(size_estimate), 0)::BIGINT AS bytes FROM result_cache",
    )
    .fetch_one(conn)
    .await
    .map_err(|e| storage("cache_occupancy", e))?;
    let entries: i64 = row.try_get("entries").map_err(|e| storage("cache_occupancy", e))?;
    let bytes: i64 = row.try_get("bytes").map_err(|e| storage("cache_occupancy", e))?;
    Ok((entries.max(0) as u64, bytes.max(0) as u64))
}

impl ResultCache for PostgresResultCache {
    fn get(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        self.block_on(self.get_async(fingerprint, now))
    }

    fn put(
        &self,
        fingerprint: &Fingerprint,
        result_ref: ResultRef,
        size_estimate: u64,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome, CacheError> {
        self.block_on(self.put_async(fingerprint, result_ref, size_estimate, now))
    }

    fn evict(&self, now: DateTime<Utc>) -> Result<EvictionReport, CacheError> {
        self.block_on(self.evict_async(now))
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        self.block_on(self.stats_async())
    }
}

fn storage(operation: &str, err: sqlx::Error) -> CacheError {
    CacheError::Storage(describe_sqlx_error(operation, &err))
}
