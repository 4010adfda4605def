//! Postgres-backed job ledger.
//!
//! ## Atomicity
//!
//! | operation | mechanism |
//! |-----------|-----------|
//! | `enqueue_unique` | `INSERT ... ON CONFLICT DO NOTHING` against the partial unique index on in-flight fingerprints |
//! | `claim_next` | `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)` |
//! | worker writes | `UPDATE ... WHERE status = 'processing' AND claimed_by = $worker` (zero rows ⇒ lease lost) |
//! | `record_batch` / `complete` | one transaction: conditional update + item/result insert |
//! | `cancel` | `UPDATE ... WHERE status IN ('queued', 'processing')` |
//!
//! ## Thread Safety
//!
//! The ledger trait is synchronous; calls are driven on the tokio runtime
//! handle captured at construction, so worker threads outside the runtime can
//! use it. Do not call it from inside an async task (use `spawn_blocking`).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use bulklabel_core::{
    ClassificationParams, Fingerprint, JobId, OwnerRef, ResultRef, SourceRef, WorkerId,
};

use super::analysis::{AnalysisResult, ItemLabel};
use super::store::{BatchRecord, EnqueueOutcome, JobLedger, JobStats, LedgerError};
use super::types::{Checkpoint, Job, JobError, JobStatus};
use crate::db::{describe_sqlx_error, is_unique_violation};

const JOB_COLUMNS: &str = "id, owner_ref, source_ref, requested_count, params, fingerprint, status, \
     progress, processed_count, total_count, claimed_by, claimed_at, checkpoint, result_ref, error, \
     created_at, started_at, completed_at, updated_at";

/// Postgres-backed job ledger.
#[derive(Debug, Clone)]
pub struct PostgresJobLedger {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobLedger {
    /// `runtime` drives the async queries behind the synchronous trait.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(skip_all, fields(job_id = %job.id, fingerprint = %job.fingerprint.short()), err)]
    pub async fn enqueue_unique_async(&self, job: Job) -> Result<EnqueueOutcome, LedgerError> {
        // A twin may finish between the failed insert and the lookup; retry a few times.
        for _ in 0..3 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, owner_ref, source_ref, requested_count, params, fingerprint, status,
                    progress, processed_count, total_count, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'queued', 0, 0, 0, $7, $7)
                ON CONFLICT (fingerprint) WHERE status IN ('queued', 'processing') DO NOTHING
                RETURNING id
                "#,
            )
            .bind(*job.id.as_uuid())
            .bind(job.owner_ref.as_str())
            .bind(job.source_ref.as_str())
            .bind(to_i64(job.requested_count))
            .bind(Json(&job.params))
            .bind(job.fingerprint.as_str())
            .bind(job.created_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LedgerError::AlreadyExists(job.id)
                } else {
                    storage("enqueue_unique", e)
                }
            })?;

            if inserted.is_some() {
                return Ok(EnqueueOutcome::Created(job.id));
            }
            if let Some(existing) = self.find_in_flight_async(&job.fingerprint).await? {
                return Ok(EnqueueOutcome::Existing(existing.id));
            }
        }
        Err(LedgerError::Storage(
            "enqueue_unique: fingerprint kept changing state".to_string(),
        ))
    }

    pub async fn get_async(&self, job_id: JobId) -> Result<Option<Job>, LedgerError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("get", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn find_in_flight_async(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Job>, LedgerError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE fingerprint = $1 AND status IN ('queued', 'processing')"
        );
        let row = sqlx::query(&sql)
            .bind(fingerprint.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("find_in_flight", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn count_active_for_owner_async(&self, owner: &OwnerRef) -> Result<u64, LedgerError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE owner_ref = $1 AND status IN ('queued', 'processing')",
        )
        .bind(owner.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| storage("count_active_for_owner", e))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip_all, fields(worker = %worker), err)]
    pub async fn claim_next_async(&self, worker: &WorkerId) -> Result<Option<Job>, LedgerError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                claimed_by = $1,
                claimed_at = $2,
                started_at = COALESCE(started_at, $2),
                updated_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued'
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(worker.as_str())
            .bind(Utc::now())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("claim_next", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn update_total_async(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        total_count: u64,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET total_count = GREATEST($3, processed_count),
                progress = GREATEST(progress, (processed_count * 100 / GREATEST($3, processed_count, 1))::SMALLINT),
                claimed_at = $4,
                updated_at = $4
            WHERE id = $1 AND status = 'processing' AND claimed_by = $2
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(worker.as_str())
        .bind(to_i64(total_count))
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("update_total", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(job_id).await);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker = %worker, items = batch.items.len()), err)]
    pub async fn record_batch_async(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        batch: BatchRecord,
    ) -> Result<(), LedgerError> {
        let n = batch.items.len() as i64;
        let mut tx = self.pool.begin().await.map_err(|e| storage("record_batch", e))?;

        // SET expressions see the pre-update row, RETURNING sees the new one.
        let base: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET processed_count = processed_count + $3,
                total_count = GREATEST($4, processed_count + $3),
                progress = GREATEST(
                    progress,
                    ((processed_count + $3) * 100 / GREATEST($4, processed_count + $3, 1))::SMALLINT
                ),
                checkpoint = $5,
                claimed_at = $6,
                updated_at = $6
            WHERE id = $1 AND status = 'processing' AND claimed_by = $2
            RETURNING processed_count - $3
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(worker.as_str())
        .bind(n)
        .bind(to_i64(batch.total_count))
        .bind(Json(&batch.checkpoint))
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage("record_batch", e))?;

        let Some(base) = base else {
            drop(tx);
            return Err(self.rejection(job_id).await);
        };

        if n > 0 {
            let (ids, labels, confidences) = columns(&batch.items);
            sqlx::query(
                r#"
                INSERT INTO job_items (job_id, seq, item_id, label, confidence)
                SELECT $1, $2 + t.ord - 1, t.item_id, t.label, t.confidence
                FROM UNNEST($3::TEXT[], $4::TEXT[], $5::FLOAT8[])
                    WITH ORDINALITY AS t(item_id, label, confidence, ord)
                "#,
            )
            .bind(*job_id.as_uuid())
            .bind(base)
            .bind(ids)
            .bind(labels)
            .bind(confidences)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("record_batch", e))?;
        }

        tx.commit().await.map_err(|e| storage("record_batch", e))?;
        Ok(())
    }

    pub async fn load_items_async(&self, job_id: JobId) -> Result<Vec<ItemLabel>, LedgerError> {
        let rows = sqlx::query(
            "SELECT item_id, label, confidence FROM job_items WHERE job_id = $1 ORDER BY seq",
        )
        .bind(*job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage("load_items", e))?;

        rows.iter()
            .map(|row| {
                Ok(ItemLabel {
                    item_id: row.try_get("item_id")?,
                    label: row.try_get("label")?,
                    confidence: row.try_get("confidence")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| storage("load_items", e))
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker = %worker), err)]
    pub async fn complete_async(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        result: &AnalysisResult,
    ) -> Result<ResultRef, LedgerError> {
        let result_ref = ResultRef::new();
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| storage("complete", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                progress = 100,
                total_count = processed_count,
                result_ref = $3,
                checkpoint = NULL,
                claimed_by = NULL,
                claimed_at = NULL,
                completed_at = $4,
                updated_at = $4
            WHERE id = $1 AND status = 'processing' AND claimed_by = $2
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(worker.as_str())
        .bind(*result_ref.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage("complete", e))?;

        if updated.rows_affected() == 0 {
            drop(tx);
            return Err(self.rejection(job_id).await);
        }

        sqlx::query(
            "INSERT INTO job_results (result_ref, job_id, payload, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(*result_ref.as_uuid())
        .bind(*job_id.as_uuid())
        .bind(Json(result))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage("complete", e))?;

        // The result payload now holds every item label.
        sqlx::query("DELETE FROM job_items WHERE job_id = $1")
            .bind(*job_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("complete", e))?;

        tx.commit().await.map_err(|e| storage("complete", e))?;
        Ok(result_ref)
    }

    #[instrument(skip_all, fields(job_id = %job_id, worker = %worker), err)]
    pub async fn fail_async(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        error: JobError,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error = $3,
                claimed_by = NULL,
                claimed_at = NULL,
                completed_at = $4,
                updated_at = $4
            WHERE id = $1 AND status = 'processing' AND claimed_by = $2
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(worker.as_str())
        .bind(Json(&error))
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("fail", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(job_id).await);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    pub async fn cancel_async(&self, job_id: JobId) -> Result<Job, LedgerError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                claimed_by = NULL,
                claimed_at = NULL,
                completed_at = $2,
                updated_at = $2
            WHERE id = $1 AND status IN ('queued', 'processing')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(*job_id.as_uuid())
            .bind(Utc::now())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("cancel", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.get_async(job_id).await? {
                Some(job) => Err(LedgerError::AlreadyTerminal {
                    job_id,
                    status: job.status,
                }),
                None => Err(LedgerError::NotFound(job_id)),
            },
        }
    }

    #[instrument(skip(self), err)]
    pub async fn requeue_stale_async(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, LedgerError> {
        let cutoff = now - chrono::Duration::from_std(lease_timeout).unwrap_or(chrono::Duration::zero());
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'queued',
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $2
            WHERE status = 'processing' AND claimed_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage("requeue_stale", e))?;

        let mut ids: Vec<JobId> = ids.into_iter().map(JobId::from_uuid).collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn load_result_async(
        &self,
        result_ref: ResultRef,
    ) -> Result<Option<AnalysisResult>, LedgerError> {
        let payload: Option<Json<AnalysisResult>> =
            sqlx::query_scalar("SELECT payload FROM job_results WHERE result_ref = $1")
                .bind(*result_ref.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| storage("load_result", e))?;
        Ok(payload.map(|Json(result)| result))
    }

    pub async fn stats_async(&self) -> Result<JobStats, LedgerError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| storage("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| storage("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| storage("stats", e))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e: bulklabel_core::DomainError| LedgerError::Storage(e.to_string()))?;
            stats.count(status, n.max(0) as u64);
        }
        Ok(stats)
    }

    /// Why a conditional write matched zero rows.
    async fn rejection(&self, job_id: JobId) -> LedgerError {
        match self.get_async(job_id).await {
            Ok(Some(job)) => {
                debug!(job_id = %job_id, status = %job.status, "conditional write rejected");
                LedgerError::LeaseLost(job_id)
            }
            Ok(None) => LedgerError::NotFound(job_id),
            Err(e) => e,
        }
    }
}

impl JobLedger for PostgresJobLedger {
    fn enqueue_unique(&self, job: Job) -> Result<EnqueueOutcome, LedgerError> {
        self.block_on(self.enqueue_unique_async(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, LedgerError> {
        self.block_on(self.get_async(job_id))
    }

    fn find_in_flight(&self, fingerprint: &Fingerprint) -> Result<Option<Job>, LedgerError> {
        self.block_on(self.find_in_flight_async(fingerprint))
    }

    fn count_active_for_owner(&self, owner: &OwnerRef) -> Result<u64, LedgerError> {
        self.block_on(self.count_active_for_owner_async(owner))
    }

    fn claim_next(&self, worker: &WorkerId) -> Result<Option<Job>, LedgerError> {
        self.block_on(self.claim_next_async(worker))
    }

    fn update_total(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        total_count: u64,
    ) -> Result<(), LedgerError> {
        self.block_on(self.update_total_async(job_id, worker, total_count))
    }

    fn record_batch(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        batch: BatchRecord,
    ) -> Result<(), LedgerError> {
        self.block_on(self.record_batch_async(job_id, worker, batch))
    }

    fn load_items(&self, job_id: JobId) -> Result<Vec<ItemLabel>, LedgerError> {
        self.block_on(self.load_items_async(job_id))
    }

    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        result: &AnalysisResult,
    ) -> Result<ResultRef, LedgerError> {
        self.block_on(self.complete_async(job_id, worker, result))
    }

    fn fail(&self, job_id: JobId, worker: &WorkerId, error: JobError) -> Result<(), LedgerError> {
        self.block_on(self.fail_async(job_id, worker, error))
    }

    fn cancel(&self, job_id: JobId) -> Result<Job, LedgerError> {
        self.block_on(self.cancel_async(job_id))
    }

    fn requeue_stale(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, LedgerError> {
        self.block_on(self.requeue_stale_async(lease_timeout, now))
    }

    fn load_result(&self, result_ref: ResultRef) -> Result<Option<AnalysisResult>, LedgerError> {
        self.block_on(self.load_result_async(result_ref))
    }

    fn stats(&self) -> Result<JobStats, LedgerError> {
        self.block_on(self.stats_async())
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    owner_ref: String,
    source_ref: String,
    requested_count: i64,
    params: Json<ClassificationParams>,
    fingerprint: String,
    status: String,
    progress: i16,
    processed_count: i64,
    total_count: i64,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    checkpoint: Option<Json<Checkpoint>>,
    result_ref: Option<Uuid>,
    error: Option<Json<JobError>>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            owner_ref: row.try_get("owner_ref")?,
            source_ref: row.try_get("source_ref")?,
            requested_count: row.try_get("requested_count")?,
            params: row.try_get("params")?,
            fingerprint: row.try_get("fingerprint")?,
            status: row.try_get("status")?,
            progress: row.try_get("progress")?,
            processed_count: row.try_get("processed_count")?,
            total_count: row.try_get("total_count")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
            checkpoint: row.try_get("checkpoint")?,
            result_ref: row.try_get("result_ref")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = LedgerError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e: bulklabel_core::DomainError| LedgerError::Storage(e.to_string()))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            owner_ref: OwnerRef::new(row.owner_ref),
            source_ref: SourceRef::new(row.source_ref),
            requested_count: row.requested_count.max(0) as u64,
            params: row.params.0,
            fingerprint: Fingerprint::from_hex(row.fingerprint),
            status,
            progress: row.progress.clamp(0, 100) as u8,
            processed_count: row.processed_count.max(0) as u64,
            total_count: row.total_count.max(0) as u64,
            claimed_by: row.claimed_by.map(WorkerId::new),
            claimed_at: row.claimed_at,
            checkpoint: row.checkpoint.map(|Json(c)| c),
            result_ref: row.result_ref.map(ResultRef::from_uuid),
            error: row.error.map(|Json(e)| e),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, LedgerError> {
    let row = JobRow::from_row(row)
        .map_err(|e| LedgerError::Storage(format!("failed to decode job row: {e}")))?;
    Job::try_from(row)
}

fn columns(items: &[ItemLabel]) -> (Vec<String>, Vec<String>, Vec<f64>) {
    let mut ids = Vec::with_capacity(items.len());
    let mut labels = Vec::with_capacity(items.len());
    let mut confidences = Vec::with_capacity(items.len());
    for item in items {
        ids.push(item.item_id.clone());
        labels.push(item.label.clone());
        confidences.push(item.confidence);
    }
    (ids, labels, confidences)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn storage(operation: &str, err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(describe_sqlx_error(operation, &err))
}
