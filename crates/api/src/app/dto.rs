//! Request/response bodies.

use serde::{Deserialize, Serialize};

use bulklabel_core::{ClassificationParams, Fingerprint, JobId, OwnerRef, ResultRef, SourceRef};
use bulklabel_infra::cache::CacheStats;
use bulklabel_infra::dispatcher::{SubmitRequest, Submission};
use bulklabel_infra::jobs::{AnalysisResult, JobStats, JobStatus};
use bulklabel_infra::status::JobStatusView;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub owner_ref: String,
    pub source_ref: String,
    pub requested_count: u64,
    pub params: ClassificationParams,
}

impl From<SubmitJobRequest> for SubmitRequest {
    fn from(body: SubmitJobRequest) -> Self {
        SubmitRequest {
            owner_ref: OwnerRef::new(body.owner_ref),
            source_ref: SourceRef::new(body.source_ref),
            requested_count: body.requested_count,
            params: body.params,
        }
    }
}

/// `cached: true` carries the result; `cached: false` carries the job to poll.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SubmitJobResponse {
    Cached {
        cached: bool,
        fingerprint: Fingerprint,
        result_ref: ResultRef,
        result: AnalysisResult,
    },
    Accepted {
        cached: bool,
        job_id: JobId,
        fingerprint: Fingerprint,
        deduplicated: bool,
    },
}

impl From<Submission> for SubmitJobResponse {
    fn from(submission: Submission) -> Self {
        match submission {
            Submission::Cached {
                fingerprint,
                result_ref,
                result,
            } => SubmitJobResponse::Cached {
                cached: true,
                fingerprint,
                result_ref,
                result,
            },
            Submission::Queued { job_id, fingerprint } => SubmitJobResponse::Accepted {
                cached: false,
                job_id,
                fingerprint,
                deduplicated: false,
            },
            Submission::InFlight { job_id, fingerprint } => SubmitJobResponse::Accepted {
                cached: false,
                job_id,
                fingerprint,
                deduplicated: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobResultResponse {
    pub job_id: JobId,
    pub result_ref: ResultRef,
    pub result: AnalysisResult,
}

#[derive(Debug, Serialize)]
pub struct NotReadyResponse {
    /// Always `"not_ready"`.
    pub status: &'static str,
    pub job_status: JobStatus,
    pub progress: u8,
    pub processed_count: u64,
    pub total_count: u64,
}

impl From<JobStatusView> for NotReadyResponse {
    fn from(view: JobStatusView) -> Self {
        Self {
            status: "not_ready",
            job_status: view.status,
            progress: view.progress,
            processed_count: view.processed_count,
            total_count: view.total_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub jobs: JobStats,
    pub cache: CacheStats,
}
