//! Core job types, the status state machine and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bulklabel_ai::Cursor;
use bulklabel_core::{
    ClassificationParams, DomainError, DomainResult, Fingerprint, JobId, OwnerRef, ResultRef,
    SourceRef, WorkerId,
};

/// Job lifecycle status.
///
/// ```text
/// queued ──claim──> processing ──> completed | failed
///   │                   │
///   └──cancel──> cancelled <──cancel
/// ```
///
/// `processing -> queued` exists only as the reaper's lease recovery and is
/// not a legal `transition_to` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Queued,
    /// A worker holds the lease.
    Processing,
    Completed,
    Failed,
    /// Cancelled by user action.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Category of a recorded job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    Source,
    Classification,
    Internal,
}

/// Structured failure reason stored on a `failed` job. Human-readable, no internals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for JobError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Resume point persisted with every batch write.
///
/// `cursor` is the cursor the current page was fetched with (`None` for the
/// first page); `page_offset` counts items of that page already classified.
/// `exhausted` marks that the source has no further items for this job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub cursor: Option<Cursor>,
    pub page_offset: u64,
    #[serde(default)]
    pub exhausted: bool,
}

impl Checkpoint {
    pub fn page_start(cursor: Option<Cursor>) -> Self {
        Self {
            cursor,
            page_offset: 0,
            exhausted: false,
        }
    }

    pub fn within_page(cursor: Option<Cursor>, page_offset: u64) -> Self {
        Self {
            cursor,
            page_offset,
            exhausted: false,
        }
    }

    pub fn exhausted() -> Self {
        Self {
            exhausted: true,
            ..Self::default()
        }
    }
}

/// One analysis request and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_ref: OwnerRef,
    pub source_ref: SourceRef,
    pub requested_count: u64,
    pub params: ClassificationParams,
    pub fingerprint: Fingerprint,
    pub status: JobStatus,
    /// 0..=100, floor of `processed_count / total_count`.
    pub progress: u8,
    pub processed_count: u64,
    pub total_count: u64,
    pub claimed_by: Option<WorkerId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub checkpoint: Option<Checkpoint>,
    pub result_ref: Option<ResultRef>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new queued job. The fingerprint is derived from the inputs.
    ///
    /// The job keeps the normalised params and trimmed source ref, so what the
    /// workers send downstream is exactly what the fingerprint covers.
    pub fn new(
        owner_ref: OwnerRef,
        source_ref: SourceRef,
        requested_count: u64,
        params: ClassificationParams,
    ) -> Self {
        let now = Utc::now();
        let source_ref = SourceRef::new(source_ref.as_str().trim());
        let params = params.normalized();
        let fingerprint = Fingerprint::compute(&source_ref, requested_count, &params);
        Self {
            id: JobId::new(),
            owner_ref,
            source_ref,
            requested_count,
            params,
            fingerprint,
            status: JobStatus::Queued,
            progress: 0,
            processed_count: 0,
            total_count: 0,
            claimed_by: None,
            claimed_at: None,
            checkpoint: None,
            result_ref: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "illegal job transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Take the lease.
    pub fn mark_processing(&mut self, worker: WorkerId, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Processing)?;
        self.claimed_by = Some(worker);
        self.claimed_at = Some(now);
        self.started_at.get_or_insert(now);
        self.updated_at = now;
        Ok(())
    }

    /// Whether `worker` currently holds the lease.
    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.status == JobStatus::Processing && self.claimed_by.as_ref() == Some(worker)
    }

    /// Apply one classified batch: bump counters, refresh the lease, move the checkpoint.
    ///
    /// `progress` never decreases and `total_count` never drops below `processed_count`.
    pub fn record_batch(
        &mut self,
        classified: u64,
        total_count: u64,
        checkpoint: Checkpoint,
        now: DateTime<Utc>,
    ) {
        self.processed_count += classified;
        self.set_total(total_count);
        self.checkpoint = Some(checkpoint);
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    /// Refine `total_count` and recompute progress (monotonic).
    pub fn set_total(&mut self, total_count: u64) {
        self.total_count = total_count.max(self.processed_count);
        self.progress = self
            .progress
            .max(compute_progress(self.processed_count, self.total_count));
    }

    pub fn mark_completed(&mut self, result_ref: ResultRef, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100;
        self.total_count = self.processed_count;
        self.result_ref = Some(result_ref);
        self.release(now);
        self.checkpoint = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// `processed_count` is preserved for diagnostics.
    pub fn mark_failed(&mut self, error: JobError, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error);
        self.release(now);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Cancelled)?;
        self.release(now);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Lease recovery: back to `queued` without touching progress or checkpoint.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::invariant(format!(
                "only processing jobs can be requeued (status {})",
                self.status
            )));
        }
        self.status = JobStatus::Queued;
        self.release(now);
        Ok(())
    }

    /// Whether the lease has not been renewed since `cutoff`.
    pub fn lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.claimed_at.is_some_and(|at| at < cutoff)
    }

    fn release(&mut self, now: DateTime<Utc>) {
        self.claimed_by = None;
        self.claimed_at = None;
        self.updated_at = now;
    }
}

/// `floor(100 * processed / total)`, clamped to 0..=100. Zero total means no progress yet.
pub fn compute_progress(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (processed.min(total) as u128 * 100) / total as u128;
    pct as u8
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Bounded retry policy for a single page fetch or classification batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = no retries)
    pub max_retries: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((retry - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * retry as f64).min(max_ms),
        };

        // Deterministic jitter derived from the retry number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((retry as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// `retries_so_far` failed attempts beyond the first have already been retried.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}
