//! Worker loop: claim the oldest queued job, process it, repeat.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use bulklabel_core::{JobId, WorkerId};

use super::processor::{BatchProcessor, ProcessError, Processed};
use super::store::{JobLedger, LedgerError};
use super::types::{Job, JobError, JobErrorKind};
use crate::workers::periodic::{sleep_or_shutdown, spawn_named};
use crate::workers::WorkerHandle;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Thread name, also used in logs.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            name: "bulklabel-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub leases_lost: u64,
    pub current_job: Option<JobId>,
    pub uptime_secs: u64,
}

/// What happened to one claimed job.
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(Processed),
    Failed { job_id: JobId, error: JobError },
    Cancelled(JobId),
    /// The job was reaped and belongs to someone else now.
    Abandoned(JobId),
}

/// Handle to a running worker thread.
#[derive(Debug)]
pub struct JobWorkerHandle {
    inner: WorkerHandle,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorkerHandle {
    /// Request graceful shutdown. The current batch finishes first.
    pub fn shutdown(self) {
        self.inner.shutdown();
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// A single worker: one claimed job at a time.
pub struct JobWorker {
    id: WorkerId,
    ledger: Arc<dyn JobLedger>,
    processor: Arc<BatchProcessor>,
}

impl JobWorker {
    pub fn new(id: WorkerId, ledger: Arc<dyn JobLedger>, processor: Arc<BatchProcessor>) -> Self {
        Self {
            id,
            ledger,
            processor,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Claim and process at most one job. `Ok(None)` means the queue was empty.
    ///
    /// Processing failures never escape: they are recorded on the job.
    pub fn run_once(&self) -> Result<Option<CycleOutcome>, LedgerError> {
        self.run_once_observed(|_| {})
    }

    /// `run_once`, calling `on_claim` between the claim and processing.
    fn run_once_observed(
        &self,
        on_claim: impl FnOnce(&Job),
    ) -> Result<Option<CycleOutcome>, LedgerError> {
        let Some(job) = self.ledger.claim_next(&self.id)? else {
            return Ok(None);
        };
        info!(worker = %self.id, job_id = %job.id, requested = job.requested_count, "claimed job");
        on_claim(&job);
        Ok(Some(self.execute(&job)))
    }

    fn execute(&self, job: &Job) -> CycleOutcome {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.processor.process(job, &self.id)))
            .unwrap_or_else(|payload| Err(ProcessError::Internal(panic_message(&*payload))));

        match outcome {
            Ok(done) => CycleOutcome::Completed(done),
            Err(ProcessError::Cancelled(job_id)) => {
                info!(worker = %self.id, job_id = %job_id, "job cancelled; stopped processing");
                CycleOutcome::Cancelled(job_id)
            }
            Err(ProcessError::LeaseLost(job_id)) => {
                warn!(worker = %self.id, job_id = %job_id, "lease lost; abandoning job");
                CycleOutcome::Abandoned(job_id)
            }
            Err(e) => {
                let job_error = e.to_job_error().unwrap_or_else(|| {
                    JobError::new(JobErrorKind::Internal, "internal error while processing job")
                });
                error!(worker = %self.id, job_id = %job.id, error = %e, "job failed");
                match self.ledger.fail(job.id, &self.id, job_error.clone()) {
                    Ok(()) => CycleOutcome::Failed {
                        job_id: job.id,
                        error: job_error,
                    },
                    Err(LedgerError::LeaseLost(_)) => {
                        warn!(worker = %self.id, job_id = %job.id, "could not record failure: lease lost");
                        CycleOutcome::Abandoned(job.id)
                    }
                    Err(ledger_err) => {
                        // Lease will expire and the reaper requeues the job.
                        error!(worker = %self.id, job_id = %job.id, error = %ledger_err, "could not record failure");
                        CycleOutcome::Abandoned(job.id)
                    }
                }
            }
        }
    }

    /// Spawn the worker loop in a background thread.
    pub fn spawn(self, config: WorkerConfig) -> std::io::Result<JobWorkerHandle> {
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();
        let name = config.name.clone();
        let inner = spawn_named(&name, move |shutdown_rx| {
            worker_loop(self, config, shutdown_rx, stats_clone)
        })?;
        Ok(JobWorkerHandle { inner, stats })
    }
}

fn worker_loop(
    worker: JobWorker,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %worker.id, name = %config.name, "job worker started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            info!(worker = %worker.id, "job worker shutting down");
            break;
        }

        let claimed = worker.run_once_observed(|job| {
            update_stats(&stats, start_time, |s| {
                s.jobs_claimed += 1;
                s.current_job = Some(job.id);
            });
        });
        let idle = match claimed {
            Ok(Some(outcome)) => {
                update_stats(&stats, start_time, |s| {
                    s.current_job = None;
                    match outcome {
                        CycleOutcome::Completed(_) => s.jobs_completed += 1,
                        CycleOutcome::Failed { .. } => s.jobs_failed += 1,
                        CycleOutcome::Cancelled(_) => s.jobs_cancelled += 1,
                        CycleOutcome::Abandoned(_) => s.leases_lost += 1,
                    }
                });
                false
            }
            Ok(None) => {
                debug!(worker = %worker.id, "queue empty");
                true
            }
            Err(e) => {
                error!(worker = %worker.id, error = %e, "failed to claim job");
                true
            }
        };

        if idle && sleep_or_shutdown(&shutdown_rx, config.poll_interval) {
            info!(worker = %worker.id, "job worker shutting down");
            break;
        }
    }

    info!(worker = %worker.id, "job worker stopped");
}

fn update_stats(
    stats: &Mutex<WorkerStats>,
    start_time: Instant,
    f: impl FnOnce(&mut WorkerStats),
) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
        s.uptime_secs = start_time.elapsed().as_secs();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use bulklabel_ai::{Classification, ClassificationError, ClassificationService};
    use bulklabel_core::{ClassificationParams, OwnerRef, SourceRef};

    use chrono::Utc;

    use crate::cache::{InMemoryResultCache, ResultCache};
    use crate::jobs::batching::FixedMemoryProbe;
    use crate::jobs::processor::ProcessorConfig;
    use crate::jobs::store::InMemoryJobLedger;
    use crate::jobs::types::{JobStatus, RetryPolicy};
    use crate::test_support::{FlakySource, ScriptedClassifier};

    struct PanickingClassifier;

    impl ClassificationService for PanickingClassifier {
        fn classify(
            &self,
            _params: &ClassificationParams,
            _batch: &[String],
        ) -> Result<Vec<Classification>, ClassificationError> {
            panic!("classifier exploded")
        }
    }

    fn config() -> ProcessorConfig {
        ProcessorConfig::default()
            .with_classify_retry(RetryPolicy::fixed(1, Duration::from_millis(1)))
            .with_source_retry(RetryPolicy::fixed(1, Duration::from_millis(1)))
    }

    fn worker_with(
        ledger: Arc<InMemoryJobLedger>,
        classifier: Arc<dyn ClassificationService>,
        name: &str,
    ) -> JobWorker {
        let processor = BatchProcessor::new(
            ledger.clone(),
            Arc::new(InMemoryResultCache::default()),
            FlakySource::generated("video-1", 50),
            classifier,
            config(),
        )
        .with_memory_probe(Arc::new(FixedMemoryProbe::new(1.0)));
        JobWorker::new(WorkerId::new(name), ledger, Arc::new(processor))
    }

    fn enqueue(ledger: &InMemoryJobLedger, source: &str) -> JobId {
        ledger
            .enqueue_unique(Job::new(
                OwnerRef::new("o"),
                SourceRef::new(source),
                50,
                ClassificationParams::new("m"),
            ))
            .unwrap()
            .job_id()
    }

    #[test]
    fn run_once_on_empty_queue_is_none() {
        let ledger = InMemoryJobLedger::arc();
        let worker = worker_with(ledger, ScriptedClassifier::arc(), "w1");
        assert!(worker.run_once().unwrap().is_none());
    }

    #[test]
    fn run_once_completes_job() {
        let ledger = InMemoryJobLedger::arc();
        let id = enqueue(&ledger, "video-1");
        let worker = worker_with(ledger.clone(), ScriptedClassifier::arc(), "w1");

        let outcome = worker.run_once().unwrap().unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(ref p) if p.job_id == id));
        assert_eq!(ledger.get(id).unwrap().unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn failure_is_recorded_and_worker_survives() {
        let ledger = InMemoryJobLedger::arc();
        let bad = enqueue(&ledger, "missing-source");
        let worker = worker_with(ledger.clone(), ScriptedClassifier::arc(), "w1");

        let outcome = worker.run_once().unwrap().unwrap();
        assert!(matches!(outcome, CycleOutcome::Failed { job_id, .. } if job_id == bad));
        let job = ledger.get(bad).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::Source);

        let good = enqueue(&ledger, "video-1");
        assert!(matches!(
            worker.run_once().unwrap().unwrap(),
            CycleOutcome::Completed(ref p) if p.job_id == good
        ));
    }

    #[test]
    fn later_batch_failure_keeps_earlier_progress() {
        let ledger = InMemoryJobLedger::arc();
        let cache = Arc::new(InMemoryResultCache::default());
        let classifier = ScriptedClassifier::arc();
        let id = ledger
            .enqueue_unique(Job::new(
                OwnerRef::new("o"),
                SourceRef::new("video-1"),
                100,
                ClassificationParams::new("m"),
            ))
            .unwrap()
            .job_id();

        // Two full batches of 32 succeed, then the classifier goes away for good.
        let switch = classifier.clone();
        classifier.on_call(move |call| {
            if call == 3 {
                switch.fail_always(ClassificationError::Timeout);
            }
        });
        let processor = BatchProcessor::new(
            ledger.clone(),
            cache.clone(),
            FlakySource::generated("video-1", 100),
            classifier.clone(),
            config(),
        )
        .with_memory_probe(Arc::new(FixedMemoryProbe::new(1.0)));
        let worker = JobWorker::new(WorkerId::new("w1"), ledger.clone(), Arc::new(processor));

        let outcome = worker.run_once().unwrap().unwrap();
        assert!(matches!(outcome, CycleOutcome::Failed { job_id, .. } if job_id == id));

        let job = ledger.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed_count, 64);
        assert_eq!(job.error.unwrap().kind, JobErrorKind::Classification);
        assert!(job.result_ref.is_none());
        assert!(cache.get(&job.fingerprint, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn panic_is_contained_as_internal_failure() {
        let ledger = InMemoryJobLedger::arc();
        let id = enqueue(&ledger, "video-1");
        let worker = worker_with(ledger.clone(), Arc::new(PanickingClassifier), "w1");

        let outcome = worker.run_once().unwrap().unwrap();
        assert!(matches!(outcome, CycleOutcome::Failed { .. }));
        let job = ledger.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.kind, JobErrorKind::Internal);
        assert!(!error.message.contains("exploded"));
    }

    #[test]
    fn spawned_workers_drain_the_queue_without_overlap() {
        let ledger = InMemoryJobLedger::arc();
        let classifier = ScriptedClassifier::arc();
        let ids: Vec<_> = (0..6)
            .map(|n| enqueue_with_count(&ledger, &format!("video-1-{n}")))
            .collect();

        let source = Arc::new(FlakySource::new(
            (0..6).fold(bulklabel_ai::InMemoryContentSource::new(), |s, n| {
                s.with_generated(&format!("video-1-{n}"), 20)
            }),
        ));

        let handles: Vec<_> = (0..3)
            .map(|n| {
                let processor = BatchProcessor::new(
                    ledger.clone(),
                    Arc::new(InMemoryResultCache::default()),
                    source.clone(),
                    classifier.clone(),
                    config(),
                )
                .with_memory_probe(Arc::new(FixedMemoryProbe::new(1.0)));
                JobWorker::new(WorkerId::new(format!("w{n}")), ledger.clone(), Arc::new(processor))
                    .spawn(
                        WorkerConfig::default()
                            .with_name(format!("test-worker-{n}"))
                            .with_poll_interval(Duration::from_millis(5)),
                    )
                    .unwrap()
            })
            .collect();

        let completed = || -> u64 { handles.iter().map(|h| h.stats().jobs_completed).sum() };
        let deadline = Instant::now() + Duration::from_secs(5);
        while completed() < 6 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let completed = completed();
        for h in handles {
            h.shutdown();
        }

        assert_eq!(completed, 6);
        for id in ids {
            assert_eq!(ledger.get(id).unwrap().unwrap().status, JobStatus::Completed);
        }
        // Every item classified exactly once across all workers.
        assert_eq!(classifier.items_classified(), 6 * 20);
    }

    fn enqueue_with_count(ledger: &InMemoryJobLedger, source: &str) -> JobId {
        ledger
            .enqueue_unique(Job::new(
                OwnerRef::new("o"),
                SourceRef::new(source),
                20,
                ClassificationParams::new("m"),
            ))
            .unwrap()
            .job_id()
    }
}
