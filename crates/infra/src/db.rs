//! Database adapters: connection pool and schema setup.
//!
//! ## Schema
//!
//! | table | purpose |
//! |-------|---------|
//! | `jobs` | one row per job; status, progress, lease and checkpoint |
//! | `job_items` | per-item labels appended by each batch write, ordered by `seq` |
//! | `job_results` | completed result payloads addressed by `result_ref` |
//! | `result_cache` | fingerprint -> result_ref with TTL and size |
//!
//! `jobs_inflight_fingerprint` is a partial unique index over queued/processing
//! jobs: it is what makes concurrent duplicate submissions collapse into one job.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        owner_ref TEXT NOT NULL,
        source_ref TEXT NOT NULL,
        requested_count BIGINT NOT NULL CHECK (requested_count > 0),
        params JSONB NOT NULL,
        fingerprint TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('queued', 'processing', 'completed', 'failed', 'cancelled')),
        progress SMALLINT NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
        processed_count BIGINT NOT NULL DEFAULT 0,
        total_count BIGINT NOT NULL DEFAULT 0,
        claimed_by TEXT NULL,
        claimed_at TIMESTAMPTZ NULL,
        checkpoint JSONB NULL,
        result_ref UUID NULL,
        error JSONB NULL,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ NULL,
        completed_at TIMESTAMPTZ NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS jobs_inflight_fingerprint
        ON jobs (fingerprint) WHERE status IN ('queued', 'processing')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_queue_order
        ON jobs (created_at, id) WHERE status = 'queued'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_leases
        ON jobs (claimed_at) WHERE status = 'processing'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_owner_active
        ON jobs (owner_ref) WHERE status IN ('queued', 'processing')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_items (
        job_id UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        seq BIGINT NOT NULL,
        item_id TEXT NOT NULL,
        label TEXT NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (job_id, seq)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_results (
        result_ref UUID PRIMARY KEY,
        job_id UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS result_cache (
        fingerprint TEXT PRIMARY KEY,
        result_ref UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        size_estimate BIGINT NOT NULL CHECK (size_estimate >= 0)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS result_cache_expiry ON result_cache (expires_at)
    "#,
];

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Create tables and indexes if they do not exist. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "database schema ready");
    Ok(())
}

/// Render an sqlx error for a storage error message, with the failing operation.
pub(crate) fn describe_sqlx_error(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => format!("database error in {operation} ({code}): {}", db_err.message()),
            None => format!("database error in {operation}: {}", db_err.message()),
        },
        sqlx::Error::PoolTimedOut => format!("connection pool timed out in {operation}"),
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        other => format!("{operation} failed: {other}"),
    }
}

/// Whether `err` is a unique-constraint violation (`23505`).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}
