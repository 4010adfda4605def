//! Job ledger: durable record of every job, its status and progress.
//!
//! Every mutation after enqueue is a conditional write. Writes issued on
//! behalf of a worker only apply while that worker still holds the lease
//! (`status = processing AND claimed_by = worker`); otherwise they are
//! rejected with [`LedgerError::LeaseLost`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use bulklabel_core::{Fingerprint, JobId, OwnerRef, ResultRef, WorkerId};

use super::analysis::{AnalysisResult, ItemLabel};
use super::types::{Checkpoint, Job, JobError, JobStatus};

/// Outcome of [`JobLedger::enqueue_unique`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job row was written.
    Created(JobId),
    /// A non-terminal job with the same fingerprint already existed.
    Existing(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Existing(id) => *id,
        }
    }
}

/// One classified batch, written atomically together with the lease renewal.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub items: Vec<ItemLabel>,
    pub checkpoint: Checkpoint,
    /// Current best total; the ledger never lets it drop below `processed_count`.
    pub total_count: u64,
}

/// Job ledger abstraction.
pub trait JobLedger: Send + Sync {
    /// Insert `job` unless a queued/processing job with the same fingerprint exists.
    /// Atomic with respect to concurrent callers.
    fn enqueue_unique(&self, job: Job) -> Result<EnqueueOutcome, LedgerError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, LedgerError>;

    /// The non-terminal job for `fingerprint`, if any.
    fn find_in_flight(&self, fingerprint: &Fingerprint) -> Result<Option<Job>, LedgerError>;

    /// Number of queued/processing jobs owned by `owner`.
    fn count_active_for_owner(&self, owner: &OwnerRef) -> Result<u64, LedgerError>;

    /// Atomically move the oldest queued job to processing for `worker`.
    /// No two workers ever receive the same job.
    fn claim_next(&self, worker: &WorkerId) -> Result<Option<Job>, LedgerError>;

    /// Refine `total_count`; also renews the lease.
    fn update_total(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        total_count: u64,
    ) -> Result<(), LedgerError>;

    /// Append item labels, bump progress, move the checkpoint and renew the lease.
    fn record_batch(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        batch: BatchRecord,
    ) -> Result<(), LedgerError>;

    /// All item labels recorded for `job_id`, in classification order.
    fn load_items(&self, job_id: JobId) -> Result<Vec<ItemLabel>, LedgerError>;

    /// Store the result payload and mark the job completed, atomically.
    /// The job's recorded item labels are dropped in the same write.
    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        result: &AnalysisResult,
    ) -> Result<ResultRef, LedgerError>;

    /// Mark the job failed with `error`.
    fn fail(&self, job_id: JobId, worker: &WorkerId, error: JobError) -> Result<(), LedgerError>;

    /// Cancel a queued or processing job. Returns the cancelled job.
    fn cancel(&self, job_id: JobId) -> Result<Job, LedgerError>;

    /// Requeue processing jobs whose lease was last renewed before `now - lease_timeout`.
    fn requeue_stale(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, LedgerError>;

    fn load_result(&self, result_ref: ResultRef) -> Result<Option<AnalysisResult>, LedgerError>;

    fn stats(&self) -> Result<JobStats, LedgerError>;
}

/// Job ledger error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The conditional write found the job no longer leased to this worker.
    #[error("lease lost on job {0}")]
    LeaseLost(JobId),
    #[error("job {job_id} is already {status}")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T> From<PoisonError<T>> for LedgerError {
    fn from(_: PoisonError<T>) -> Self {
        LedgerError::Storage("ledger lock poisoned".to_string())
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn count(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn active(&self) -> u64 {
        self.queued + self.processing
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    jobs: HashMap<JobId, Job>,
    items: HashMap<JobId, Vec<ItemLabel>>,
    results: HashMap<ResultRef, AnalysisResult>,
}

impl LedgerState {
    fn leased_mut(&mut self, job_id: JobId, worker: &WorkerId) -> Result<&mut Job, LedgerError> {
        match self.jobs.get_mut(&job_id) {
            Some(job) if job.is_held_by(worker) => Ok(job),
            Some(_) => Err(LedgerError::LeaseLost(job_id)),
            None => Err(LedgerError::NotFound(job_id)),
        }
    }
}

/// In-memory job ledger for tests/dev. One lock guards jobs, items and
/// results so each operation is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobLedger for InMemoryJobLedger {
    fn enqueue_unique(&self, job: Job) -> Result<EnqueueOutcome, LedgerError> {
        let mut state = self.state.write()?;
        if state.jobs.contains_key(&job.id) {
            return Err(LedgerError::AlreadyExists(job.id));
        }
        if let Some(existing) = state
            .jobs
            .values()
            .find(|j| !j.status.is_terminal() && j.fingerprint == job.fingerprint)
        {
            return Ok(EnqueueOutcome::Existing(existing.id));
        }
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(EnqueueOutcome::Created(id))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, LedgerError> {
        Ok(self.state.read()?.jobs.get(&job_id).cloned())
    }

    fn find_in_flight(&self, fingerprint: &Fingerprint) -> Result<Option<Job>, LedgerError> {
        let state = self.state.read()?;
        Ok(state
            .jobs
            .values()
            .find(|j| !j.status.is_terminal() && &j.fingerprint == fingerprint)
            .cloned())
    }

    fn count_active_for_owner(&self, owner: &OwnerRef) -> Result<u64, LedgerError> {
        let state = self.state.read()?;
        Ok(state
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal() && &j.owner_ref == owner)
            .count() as u64)
    }

    fn claim_next(&self, worker: &WorkerId) -> Result<Option<Job>, LedgerError> {
        let mut state = self.state.write()?;
        let now = Utc::now();

        // Oldest queued job first (FIFO); id breaks created_at ties.
        let next = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.mark_processing(worker.clone(), now)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(Some(job.clone()))
    }

    fn update_total(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        total_count: u64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.write()?;
        let job = state.leased_mut(job_id, worker)?;
        let now = Utc::now();
        job.set_total(total_count);
        job.claimed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    fn record_batch(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        batch: BatchRecord,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.write()?;
        let job = state.leased_mut(job_id, worker)?;
        job.record_batch(
            batch.items.len() as u64,
            batch.total_count,
            batch.checkpoint,
            Utc::now(),
        );
        state.items.entry(job_id).or_default().extend(batch.items);
        Ok(())
    }

    fn load_items(&self, job_id: JobId) -> Result<Vec<ItemLabel>, LedgerError> {
        let state = self.state.read()?;
        Ok(state.items.get(&job_id).cloned().unwrap_or_default())
    }

    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        result: &AnalysisResult,
    ) -> Result<ResultRef, LedgerError> {
        let mut state = self.state.write()?;
        let result_ref = ResultRef::new();
        let job = state.leased_mut(job_id, worker)?;
        job.mark_completed(result_ref, Utc::now())
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        state.results.insert(result_ref, result.clone());
        state.items.remove(&job_id);
        Ok(result_ref)
    }

    fn fail(&self, job_id: JobId, worker: &WorkerId, error: JobError) -> Result<(), LedgerError> {
        let mut state = self.state.write()?;
        let job = state.leased_mut(job_id, worker)?;
        job.mark_failed(error, Utc::now())
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    fn cancel(&self, job_id: JobId) -> Result<Job, LedgerError> {
        let mut state = self.state.write()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(LedgerError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                job_id,
                status: job.status,
            });
        }
        job.mark_cancelled(Utc::now())
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(job.clone())
    }

    fn requeue_stale(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, LedgerError> {
        let cutoff = now - chrono::Duration::from_std(lease_timeout).unwrap_or_default();
        let mut state = self.state.write()?;
        let mut requeued = Vec::new();
        for job in state.jobs.values_mut() {
            if job.lease_expired(cutoff) {
                job.requeue(now)
                    .map_err(|e| LedgerError::Storage(e.to_string()))?;
                requeued.push(job.id);
            }
        }
        requeued.sort();
        Ok(requeued)
    }

    fn load_result(&self, result_ref: ResultRef) -> Result<Option<AnalysisResult>, LedgerError> {
        Ok(self.state.read()?.results.get(&result_ref).cloned())
    }

    fn stats(&self) -> Result<JobStats, LedgerError> {
        let state = self.state.read()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.count(job.status, 1);
        }
        Ok(stats)
    }
}

impl<T: JobLedger + ?Sized> JobLedger for Arc<T> {
    fn enqueue_unique(&self, job: Job) -> Result<EnqueueOutcome, LedgerError> {
        (**self).enqueue_unique(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, LedgerError> {
        (**self).get(job_id)
    }

    fn find_in_flight(&self, fingerprint: &Fingerprint) -> Result<Option<Job>, LedgerError> {
        (**self).find_in_flight(fingerprint)
    }

    fn count_active_for_owner(&self, owner: &OwnerRef) -> Result<u64, LedgerError> {
        (**self).count_active_for_owner(owner)
    }

    fn claim_next(&self, worker: &WorkerId) -> Result<Option<Job>, LedgerError> {
        (**self).claim_next(worker)
    }

    fn update_total(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        total_count: u64,
    ) -> Result<(), LedgerError> {
        (**self).update_total(job_id, worker, total_count)
    }

    fn record_batch(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        batch: BatchRecord,
    ) -> Result<(), LedgerError> {
        (**self).record_batch(job_id, worker, batch)
    }

    fn load_items(&self, job_id: JobId) -> Result<Vec<ItemLabel>, LedgerError> {
        (**self).load_items(job_id)
    }

    fn complete(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        result: &AnalysisResult,
    ) -> Result<ResultRef, LedgerError> {
        (**self).complete(job_id, worker, result)
    }

    fn fail(&self, job_id: JobId, worker: &WorkerId, error: JobError) -> Result<(), LedgerError> {
        (**self).fail(job_id, worker, error)
    }

    fn cancel(&self, job_id: JobId) -> Result<Job, LedgerError> {
        (**self).cancel(job_id)
    }

    fn requeue_stale(
        &self,
        lease_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, LedgerError> {
        (**self).requeue_stale(lease_timeout, now)
    }

    fn load_result(&self, result_ref: ResultRef) -> Result<Option<AnalysisResult>, LedgerError> {
        (**self).load_result(result_ref)
    }

    fn stats(&self) -> Result<JobStats, LedgerError> {
        (**self).stats()
    }
}
