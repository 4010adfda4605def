//! Read side: job status and result retrieval. Never mutates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use bulklabel_core::{JobId, ResultRef};

use crate::jobs::{AnalysisResult, Job, JobError, JobLedger, JobStatus, LedgerError};

/// Snapshot of a job's progress as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub processed_count: u64,
    pub total_count: u64,
    pub requested_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            processed_count: job.processed_count,
            total_count: job.total_count,
            requested_count: job.requested_count,
            error: job.error.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Outcome of a result lookup for an existing, non-failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
    Ready {
        job_id: JobId,
        result_ref: ResultRef,
        result: AnalysisResult,
    },
    /// Still queued or processing.
    NotReady(JobStatusView),
}

#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} failed: {error}")]
    Failed { job_id: JobId, error: JobError },
    #[error("job {0} was cancelled")]
    Cancelled(JobId),
    /// Completed job whose result payload is gone.
    #[error("result for job {0} is missing")]
    ResultMissing(JobId),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

pub struct StatusService {
    ledger: Arc<dyn JobLedger>,
}

impl StatusService {
    pub fn new(ledger: Arc<dyn JobLedger>) -> Self {
        Self { ledger }
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobStatusView, ResultError> {
        self.ledger
            .get(job_id)?
            .map(|job| JobStatusView::from(&job))
            .ok_or(ResultError::NotFound(job_id))
    }

    pub fn get_result(&self, job_id: JobId) -> Result<ResultLookup, ResultError> {
        let job = self
            .ledger
            .get(job_id)?
            .ok_or(ResultError::NotFound(job_id))?;

        match job.status {
            JobStatus::Completed => {
                let result_ref = job.result_ref.ok_or(ResultError::ResultMissing(job_id))?;
                let result = self
                    .ledger
                    .load_result(result_ref)?
                    .ok_or(ResultError::ResultMissing(job_id))?;
                Ok(ResultLookup::Ready {
                    job_id,
                    result_ref,
                    result,
                })
            }
            JobStatus::Failed => Err(ResultError::Failed {
                job_id,
                error: job.error.unwrap_or_else(|| {
                    JobError::new(crate::jobs::JobErrorKind::Internal, "job failed")
                }),
            }),
            JobStatus::Cancelled => Err(ResultError::Cancelled(job_id)),
            JobStatus::Queued | JobStatus::Processing => {
                Ok(ResultLookup::NotReady(JobStatusView::from(&job)))
            }
        }
    }
}
