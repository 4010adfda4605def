//! Submission pipeline: validate, consult the cache, dedupe, enqueue.
//!
//! ## Submit Flow
//!
//! ```text
//! SubmitRequest
//!   ↓
//! 1. Validate inputs and per-request quota
//!   ↓
//! 2. Fingerprint (source_ref, requested_count, normalized params)
//!   ↓
//! 3. Live cache entry?  → return the stored result, no job created
//!   ↓
//! 4. Queued/processing job with this fingerprint?  → return its job id
//!   ↓
//! 5. Owner under the active-job quota?  → otherwise QuotaExceeded
//!   ↓
//! 6. enqueue_unique (atomic; a concurrent twin yields the existing id)
//! ```
//!
//! The dispatcher never performs classification; it only writes to the ledger.
//! Joining an in-flight job does not count against the owner's active-job quota.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use bulklabel_core::{
    ClassificationParams, DomainError, Fingerprint, JobId, OwnerRef, ResultRef, SourceRef,
};

use crate::cache::{CacheError, ResultCache};
use crate::jobs::{AnalysisResult, EnqueueOutcome, Job, JobLedger, JobStatus, LedgerError};

const MAX_SOURCE_REF_LEN: usize = 512;
const MAX_OWNER_REF_LEN: usize = 256;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on `requested_count` for a single submission.
    pub max_requested_count: u64,
    /// Upper bound on queued + processing jobs per owner.
    pub max_active_jobs_per_owner: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_requested_count: 50_000,
            max_active_jobs_per_owner: 5,
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_requested_count(mut self, max: u64) -> Self {
        self.max_requested_count = max;
        self
    }

    pub fn with_max_active_jobs_per_owner(mut self, max: u64) -> Self {
        self.max_active_jobs_per_owner = max;
        self
    }
}

/// One analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub owner_ref: OwnerRef,
    pub source_ref: SourceRef,
    pub requested_count: u64,
    pub params: ClassificationParams,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// A live cached result exists; no job was created.
    Cached {
        fingerprint: Fingerprint,
        result_ref: ResultRef,
        result: AnalysisResult,
    },
    /// A new job was queued.
    Queued { job_id: JobId, fingerprint: Fingerprint },
    /// An equivalent job is already queued or processing.
    InFlight { job_id: JobId, fingerprint: Fingerprint },
}

impl Submission {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Submission::Cached { .. } => None,
            Submission::Queued { job_id, .. } | Submission::InFlight { job_id, .. } => Some(*job_id),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        match self {
            Submission::Cached { fingerprint, .. }
            | Submission::Queued { fingerprint, .. }
            | Submission::InFlight { fingerprint, .. } => fingerprint,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Malformed request; nothing was written.
    #[error("validation error: {0}")]
    Validation(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Caller does not own the job.
    #[error("job {0} belongs to another owner")]
    Forbidden(JobId),
    #[error("job {job_id} is already {status}")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },
    #[error("ledger error: {0}")]
    Ledger(LedgerError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::QuotaExceeded(msg) => DispatchError::QuotaExceeded(msg),
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::InvariantViolation(msg) => DispatchError::Validation(msg),
        }
    }
}

impl From<LedgerError> for DispatchError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::NotFound(id) => DispatchError::NotFound(id),
            LedgerError::AlreadyTerminal { job_id, status } => {
                DispatchError::AlreadyTerminal { job_id, status }
            }
            other => DispatchError::Ledger(other),
        }
    }
}

/// Accepts submissions and cancellations.
pub struct Dispatcher {
    ledger: Arc<dyn JobLedger>,
    cache: Arc<dyn ResultCache>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        cache: Arc<dyn ResultCache>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            ledger,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    #[instrument(
        skip(self, request),
        fields(owner = %request.owner_ref, source = %request.source_ref, requested = request.requested_count),
        err(Display)
    )]
    pub fn submit(&self, request: SubmitRequest) -> Result<Submission, DispatchError> {
        self.validate(&request)?;

        // The job carries the normalised inputs; its fingerprint is the request identity.
        let job = Job::new(
            request.owner_ref,
            request.source_ref,
            request.requested_count,
            request.params,
        );
        let fingerprint = job.fingerprint.clone();

        if let Some((result_ref, result)) = self.cached_result(&fingerprint) {
            info!(fingerprint = %fingerprint.short(), "cache hit");
            return Ok(Submission::Cached {
                fingerprint,
                result_ref,
                result,
            });
        }

        if let Some(job) = self.ledger.find_in_flight(&fingerprint)? {
            info!(job_id = %job.id, fingerprint = %fingerprint.short(), "joined in-flight job");
            return Ok(Submission::InFlight {
                job_id: job.id,
                fingerprint,
            });
        }

        let active = self.ledger.count_active_for_owner(&job.owner_ref)?;
        if active >= self.config.max_active_jobs_per_owner {
            return Err(DispatchError::QuotaExceeded(format!(
                "owner already has {active} active jobs (limit {})",
                self.config.max_active_jobs_per_owner
            )));
        }

        match self.ledger.enqueue_unique(job)? {
            EnqueueOutcome::Created(job_id) => {
                info!(job_id = %job_id, fingerprint = %fingerprint.short(), "job queued");
                Ok(Submission::Queued {
                    job_id,
                    fingerprint,
                })
            }
            EnqueueOutcome::Existing(job_id) => {
                debug!(job_id = %job_id, "lost enqueue race; joined existing job");
                Ok(Submission::InFlight {
                    job_id,
                    fingerprint,
                })
            }
        }
    }

    /// Cancel a queued or processing job owned by `owner`.
    #[instrument(skip(self), err(Display))]
    pub fn cancel(&self, job_id: JobId, owner: &OwnerRef) -> Result<Job, DispatchError> {
        let job = self
            .ledger
            .get(job_id)?
            .ok_or(DispatchError::NotFound(job_id))?;
        if &job.owner_ref != owner {
            return Err(DispatchError::Forbidden(job_id));
        }
        let cancelled = self.ledger.cancel(job_id)?;
        info!(job_id = %job_id, "job cancelled");
        Ok(cancelled)
    }

    fn validate(&self, request: &SubmitRequest) -> Result<(), DispatchError> {
        let source = request.source_ref.as_str();
        if source.trim().is_empty() {
            return Err(DomainError::validation("source_ref must not be empty").into());
        }
        if source.len() > MAX_SOURCE_REF_LEN {
            return Err(DomainError::validation(format!(
                "source_ref longer than {MAX_SOURCE_REF_LEN} bytes"
            ))
            .into());
        }
        let owner = request.owner_ref.as_str();
        if owner.trim().is_empty() || owner.len() > MAX_OWNER_REF_LEN {
            return Err(DomainError::validation("owner_ref must be 1..=256 bytes").into());
        }
        if request.requested_count == 0 {
            return Err(DomainError::validation("requested_count must be at least 1").into());
        }
        if request.requested_count > self.config.max_requested_count {
            return Err(DomainError::quota(format!(
                "requested_count {} exceeds the limit of {}",
                request.requested_count, self.config.max_requested_count
            ))
            .into());
        }
        request.params.validate()?;
        Ok(())
    }

    /// A usable cached result. Cache and ledger read failures degrade to a miss.
    fn cached_result(&self, fingerprint: &Fingerprint) -> Option<(ResultRef, AnalysisResult)> {
        let entry = match self.cache.get(fingerprint, Utc::now()) {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(error = %e, "cache lookup failed; treating as miss");
                return None;
            }
        };
        match self.ledger.load_result(entry.result_ref) {
            Ok(Some(result)) => Some((entry.result_ref, result)),
            Ok(None) => {
                warn!(result_ref = %entry.result_ref, "cache entry points at a missing result");
                None
            }
            Err(e) => {
                warn!(error = %e, "result load failed; treating as miss");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bulklabel_core::WorkerId;

    use crate::cache::{CacheConfig, InMemoryResultCache};
    use crate::jobs::InMemoryJobLedger;

    struct Fixture {
        ledger: Arc<InMemoryJobLedger>,
        cache: Arc<InMemoryResultCache>,
        dispatcher: Dispatcher,
    }

    fn fixture(config: DispatcherConfig) -> Fixture {
        let ledger = InMemoryJobLedger::arc();
        let cache = InMemoryResultCache::arc(CacheConfig::default());
        let dispatcher = Dispatcher::new(ledger.clone(), cache.clone(), config);
        Fixture {
            ledger,
            cache,
            dispatcher,
        }
    }

    fn request(owner: &str, source: &str, count: u64) -> SubmitRequest {
        SubmitRequest {
            owner_ref: OwnerRef::new(owner),
            source_ref: SourceRef::new(source),
            requested_count: count,
            params: ClassificationParams::new("sentiment-v2").with_labels(["positive", "negative"]),
        }
    }

    #[test]
    fn first_submission_queues_a_job() {
        let f = fixture(DispatcherConfig::default());
        let out = f.dispatcher.submit(request("alice", "video-1", 250)).unwrap();

        let Submission::Queued { job_id, .. } = out else {
            panic!("expected queued, got {out:?}");
        };
        let job = f.ledger.get(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.requested_count, 250);
    }

    #[test]
    fn duplicate_submission_returns_same_job() {
        let f = fixture(DispatcherConfig::default());
        let first = f.dispatcher.submit(request("alice", "video-1", 250)).unwrap();
        let second = f.dispatcher.submit(request("bob", "video-1", 250)).unwrap();

        assert!(matches!(second, Submission::InFlight { .. }));
        assert_eq!(first.job_id(), second.job_id());
        assert_eq!(f.ledger.stats().unwrap().queued, 1);
    }

    #[test]
    fn label_order_does_not_change_identity() {
        let f = fixture(DispatcherConfig::default());
        let first = f.dispatcher.submit(request("alice", "video-1", 10)).unwrap();
        let mut reordered = request("alice", "video-1", 10);
        reordered.params = ClassificationParams::new("sentiment-v2").with_labels(["negative", "positive"]);
        let second = f.dispatcher.submit(reordered).unwrap();
        assert_eq!(first.job_id(), second.job_id());
    }

    #[test]
    fn stored_job_carries_normalised_inputs() {
        let f = fixture(DispatcherConfig::default());
        let mut req = request("alice", "  video-1 ", 10);
        req.params = ClassificationParams::new(" sentiment-v2 ")
            .with_labels(["Positive", " Negative"])
            .with_language("EN");
        let job_id = f.dispatcher.submit(req).unwrap().job_id().unwrap();

        let job = f.ledger.get(job_id).unwrap().unwrap();
        assert_eq!(job.source_ref.as_str(), "video-1");
        assert_eq!(job.params.model, "sentiment-v2");
        assert_eq!(job.params.labels, vec!["negative".to_string(), "positive".to_string()]);
        assert_eq!(job.params.language.as_deref(), Some("en"));
        assert_eq!(
            job.fingerprint,
            Fingerprint::compute(&job.source_ref, job.requested_count, &job.params)
        );
    }

    #[test]
    fn cache_hit_returns_result_without_creating_a_job() {
        let f = fixture(DispatcherConfig::default());
        let req = request("alice", "video-1", 250);

        // Produce a completed result through the ledger the way a worker would.
        let Submission::Queued { job_id, fingerprint } = f.dispatcher.submit(req.clone()).unwrap() else {
            panic!("expected queued");
        };
        let w = WorkerId::new("w1");
        f.ledger.claim_next(&w).unwrap();
        let result = AnalysisResult::default();
        let result_ref = f.ledger.complete(job_id, &w, &result).unwrap();
        f.cache.put(&fingerprint, result_ref, 10, Utc::now()).unwrap();

        let before = f.ledger.stats().unwrap();
        let out = f.dispatcher.submit(req).unwrap();
        assert!(matches!(out, Submission::Cached { result_ref: r, .. } if r == result_ref));
        assert_eq!(f.ledger.stats().unwrap(), before);
    }

    #[test]
    fn dangling_cache_entry_is_a_miss() {
        let f = fixture(DispatcherConfig::default());
        let req = request("alice", "video-1", 5);
        let fp = Fingerprint::compute(&req.source_ref, req.requested_count, &req.params);
        f.cache.put(&fp, ResultRef::new(), 10, Utc::now()).unwrap();

        assert!(matches!(f.dispatcher.submit(req).unwrap(), Submission::Queued { .. }));
    }

    #[test]
    fn validation_rejects_bad_input_without_writing() {
        let f = fixture(DispatcherConfig::default());

        let err = f.dispatcher.submit(request("alice", "  ", 10)).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        let err = f.dispatcher.submit(request("alice", "video-1", 0)).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        let mut bad_params = request("alice", "video-1", 10);
        bad_params.params = ClassificationParams::new("");
        let err = f.dispatcher.submit(bad_params).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        assert_eq!(f.ledger.stats().unwrap().active(), 0);
    }

    #[test]
    fn requested_count_over_limit_is_quota_exceeded() {
        let f = fixture(DispatcherConfig::default().with_max_requested_count(100));
        let err = f.dispatcher.submit(request("alice", "video-1", 101)).unwrap_err();
        assert!(matches!(err, DispatchError::QuotaExceeded(_)));
    }

    #[test]
    fn owner_active_job_limit_is_enforced() {
        let f = fixture(DispatcherConfig::default().with_max_active_jobs_per_owner(2));
        f.dispatcher.submit(request("alice", "a", 10)).unwrap();
        f.dispatcher.submit(request("alice", "b", 10)).unwrap();

        let err = f.dispatcher.submit(request("alice", "c", 10)).unwrap_err();
        assert!(matches!(err, DispatchError::QuotaExceeded(_)));

        // Joining an existing job is still allowed, and other owners are unaffected.
        assert!(f.dispatcher.submit(request("alice", "a", 10)).is_ok());
        assert!(f.dispatcher.submit(request("bob", "c", 10)).is_ok());
    }

    #[test]
    fn cancel_checks_ownership_and_state() {
        let f = fixture(DispatcherConfig::default());
        let job_id = f
            .dispatcher
            .submit(request("alice", "video-1", 10))
            .unwrap()
            .job_id()
            .unwrap();

        let err = f.dispatcher.cancel(job_id, &OwnerRef::new("mallory")).unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        let job = f.dispatcher.cancel(job_id, &OwnerRef::new("alice")).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let err = f.dispatcher.cancel(job_id, &OwnerRef::new("alice")).unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyTerminal { .. }));

        let err = f.dispatcher.cancel(JobId::new(), &OwnerRef::new("alice")).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[test]
    fn concurrent_duplicate_submissions_create_one_job() {
        let f = fixture(DispatcherConfig::default().with_max_active_jobs_per_owner(100));
        let dispatcher = Arc::new(f.dispatcher);

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let d = dispatcher.clone();
                std::thread::spawn(move || {
                    d.submit(request(&format!("owner-{n}"), "video-1", 250))
                        .unwrap()
                        .job_id()
                        .unwrap()
                })
            })
            .collect();

        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(f.ledger.stats().unwrap().queued, 1);
    }
}
