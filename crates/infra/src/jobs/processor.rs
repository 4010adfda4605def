//! Batch processor: drives one claimed job from its checkpoint to a stored result.
//!
//! ## Flow
//!
//! 1. Fetch a page from the content source at the checkpoint cursor
//! 2. Refine `total_count` from the page's estimate
//! 3. Classify the page in batches sized by the batch-size strategy,
//!    checking for cancellation before each batch
//! 4. After each batch, record labels + checkpoint + lease renewal in one write
//! 5. When the source is exhausted or `requested_count` is reached, store the
//!    result, complete the job and write the cache entry
//!
//! Transient source/classifier errors are retried with bounded backoff.
//! Anything else fails the job.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use bulklabel_ai::classifier::check_batch_shape;
use bulklabel_ai::{
    ClassificationError, ClassificationService, ContentSource, Cursor, Page, SourceError,
    SourceItem,
};
use bulklabel_core::{JobId, ResultRef, WorkerId};

use super::analysis::{AnalysisResult, ItemLabel};
use super::batching::{
    BatchSizeFactory, BatchSizeStrategy, BatchSizing, MemoryProbe, SystemMemoryProbe,
};
use super::store::{BatchRecord, JobLedger, LedgerError};
use super::types::{Checkpoint, Job, JobError, JobErrorKind, JobStatus, RetryPolicy};
use crate::cache::{PutOutcome, ResultCache};

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Items requested per content source page.
    pub page_size: usize,
    pub batch_sizing: BatchSizing,
    /// Retries for one classification batch.
    pub classify_retry: RetryPolicy,
    /// Retries for one page fetch.
    pub source_retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            batch_sizing: BatchSizing::default(),
            classify_retry: RetryPolicy::default(),
            source_retry: RetryPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_batch_sizing(mut self, batch_sizing: BatchSizing) -> Self {
        self.batch_sizing = batch_sizing;
        self
    }

    pub fn with_classify_retry(mut self, policy: RetryPolicy) -> Self {
        self.classify_retry = policy;
        self
    }

    pub fn with_source_retry(mut self, policy: RetryPolicy) -> Self {
        self.source_retry = policy;
        self
    }
}

/// Why processing stopped without completing the job.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("content source error: {0}")]
    Source(#[from] SourceError),
    #[error("classification error: {0}")]
    Classification(#[from] ClassificationError),
    /// Another holder owns the job now (reaped and re-claimed).
    #[error("lease lost on job {0}")]
    LeaseLost(JobId),
    #[error("job {0} was cancelled")]
    Cancelled(JobId),
    #[error("ledger error: {0}")]
    Ledger(LedgerError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProcessError {
    /// The failure to record on the job, or `None` when the job must be left alone.
    pub fn to_job_error(&self) -> Option<JobError> {
        match self {
            ProcessError::Source(e) => Some(JobError::new(JobErrorKind::Source, e.to_string())),
            ProcessError::Classification(e) => Some(JobError::new(
                JobErrorKind::Classification,
                e.to_string(),
            )),
            ProcessError::Ledger(_) | ProcessError::Internal(_) => Some(JobError::new(
                JobErrorKind::Internal,
                "internal error while processing job",
            )),
            ProcessError::LeaseLost(_) | ProcessError::Cancelled(_) => None,
        }
    }
}

/// Successful completion of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub job_id: JobId,
    pub result_ref: ResultRef,
    pub processed_count: u64,
    /// `None` when the cache write failed (the job is still completed).
    pub cache: Option<PutOutcome>,
}

/// Runs a claimed job to completion.
pub struct BatchProcessor {
    ledger: Arc<dyn JobLedger>,
    cache: Arc<dyn ResultCache>,
    source: Arc<dyn ContentSource>,
    classifier: Arc<dyn ClassificationService>,
    memory: Arc<dyn MemoryProbe>,
    batch_sizes: BatchSizeFactory,
    config: ProcessorConfig,
}

impl BatchProcessor {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        cache: Arc<dyn ResultCache>,
        source: Arc<dyn ContentSource>,
        classifier: Arc<dyn ClassificationService>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            ledger,
            cache,
            source,
            classifier,
            memory: Arc::new(SystemMemoryProbe::new()),
            batch_sizes: config.batch_sizing.factory(),
            config,
        }
    }

    pub fn with_memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    /// Replace the default adaptive strategy.
    pub fn with_batch_size_strategy(mut self, factory: BatchSizeFactory) -> Self {
        self.batch_sizes = factory;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process `job`, which `worker` has just claimed. Resumes from the job's checkpoint.
    #[instrument(
        skip(self, job, worker),
        fields(job_id = %job.id, fingerprint = %job.fingerprint.short(), worker = %worker),
        err(Display)
    )]
    pub fn process(&self, job: &Job, worker: &WorkerId) -> Result<Processed, ProcessError> {
        let job_id = job.id;
        let requested = job.requested_count;
        let mut processed = job.processed_count;
        let mut total = job.total_count;
        let mut checkpoint = job.checkpoint.clone().unwrap_or_default();
        let mut sizer = (self.batch_sizes)();

        if processed > 0 || checkpoint != Checkpoint::default() {
            info!(processed, page_offset = checkpoint.page_offset, "resuming job from checkpoint");
        }

        while processed < requested && !checkpoint.exhausted {
            self.ensure_active(job_id, worker)?;

            let Page {
                items,
                next_cursor,
                total_estimate,
            } = self.fetch_page(job, checkpoint.cursor.as_ref())?;

            let skip = usize::try_from(checkpoint.page_offset).unwrap_or(usize::MAX);
            let quota = usize::try_from(requested - processed).unwrap_or(usize::MAX);
            let items: Vec<SourceItem> = items.into_iter().skip(skip).take(quota).collect();
            let has_more = next_cursor.is_some() && processed + (items.len() as u64) < requested;

            let refined = refine_total(requested, total_estimate, processed, items.len() as u64, has_more);
            if refined != total {
                self.ledger
                    .update_total(job_id, worker, refined)
                    .map_err(|e| self.rejected(job_id, e))?;
                total = refined;
            }
            debug!(page_items = items.len(), total, has_more, "fetched page");

            let mut page_offset = checkpoint.page_offset;
            let mut start = 0;
            while start < items.len() {
                self.ensure_active(job_id, worker)?;

                let size = sizer.next_batch_size(self.memory.available_ratio()).max(1);
                let end = (start + size).min(items.len());
                let batch = &items[start..end];
                let labels = self.classify(job, batch)?;

                processed += batch.len() as u64;
                page_offset += batch.len() as u64;
                let next = if end < items.len() {
                    Checkpoint::within_page(checkpoint.cursor.clone(), page_offset)
                } else if has_more {
                    Checkpoint::page_start(next_cursor.clone())
                } else {
                    Checkpoint::exhausted()
                };

                self.ledger
                    .record_batch(
                        job_id,
                        worker,
                        BatchRecord {
                            items: labels,
                            checkpoint: next,
                            total_count: total,
                        },
                    )
                    .map_err(|e| self.rejected(job_id, e))?;
                debug!(batch_size = batch.len(), processed, total, "batch recorded");
                start = end;
            }

            if !has_more {
                break;
            }
            if next_cursor == checkpoint.cursor {
                return Err(SourceError::Malformed("cursor did not advance".to_string()).into());
            }
            checkpoint = Checkpoint::page_start(next_cursor);
        }

        self.finish(job, worker)
    }

    fn finish(&self, job: &Job, worker: &WorkerId) -> Result<Processed, ProcessError> {
        self.ensure_active(job.id, worker)?;

        let items = self.ledger.load_items(job.id).map_err(ProcessError::Ledger)?;
        let result = AnalysisResult::from_items(items);
        let size = result.size_estimate();
        let result_ref = self
            .ledger
            .complete(job.id, worker, &result)
            .map_err(|e| self.rejected(job.id, e))?;

        let cache = match self.cache.put(&job.fingerprint, result_ref, size, Utc::now()) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "failed to write cache entry; job stays completed");
                None
            }
        };

        info!(
            processed = result.summary.total_items,
            result_ref = %result_ref,
            size_estimate = size,
            "job completed"
        );
        Ok(Processed {
            job_id: job.id,
            result_ref,
            processed_count: result.summary.total_items,
            cache,
        })
    }

    /// Cancellation / lease check performed before every page and batch.
    fn ensure_active(&self, job_id: JobId, worker: &WorkerId) -> Result<(), ProcessError> {
        match self.ledger.get(job_id).map_err(ProcessError::Ledger)? {
            Some(job) if job.is_held_by(worker) => Ok(()),
            Some(job) if job.status == JobStatus::Cancelled => Err(ProcessError::Cancelled(job_id)),
            Some(_) => Err(ProcessError::LeaseLost(job_id)),
            None => Err(ProcessError::Ledger(LedgerError::NotFound(job_id))),
        }
    }

    /// Turn a rejected conditional write into `Cancelled` or `LeaseLost`.
    fn rejected(&self, job_id: JobId, err: LedgerError) -> ProcessError {
        match err {
            LedgerError::LeaseLost(_) => match self.ledger.get(job_id) {
                Ok(Some(job)) if job.status == JobStatus::Cancelled => ProcessError::Cancelled(job_id),
                _ => ProcessError::LeaseLost(job_id),
            },
            other => ProcessError::Ledger(other),
        }
    }

    fn fetch_page(&self, job: &Job, cursor: Option<&Cursor>) -> Result<Page, ProcessError> {
        let policy = &self.config.source_retry;
        let mut retries = 0;
        loop {
            match self
                .source
                .fetch_page(&job.source_ref, cursor, self.config.page_size)
            {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && policy.should_retry(retries) => {
                    retries += 1;
                    let delay = policy.delay_for_retry(retries);
                    warn!(error = %e, retry = retries, delay_ms = delay.as_millis() as u64, "page fetch failed; retrying");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn classify(&self, job: &Job, batch: &[SourceItem]) -> Result<Vec<ItemLabel>, ProcessError> {
        let texts: Vec<String> = batch.iter().map(|item| item.text.clone()).collect();
        let policy = &self.config.classify_retry;
        let mut retries = 0;
        loop {
            let attempt = self
                .classifier
                .classify(&job.params, &texts)
                .and_then(|out| check_batch_shape(texts.len(), &out).map(|()| out));

            match attempt {
                Ok(out) => {
                    return Ok(batch
                        .iter()
                        .zip(out)
                        .map(|(item, c)| ItemLabel::new(item.id.clone(), c.label, clamp_confidence(c.confidence)))
                        .collect());
                }
                Err(e) if e.is_transient() && policy.should_retry(retries) => {
                    retries += 1;
                    let delay = policy
                        .delay_for_retry(retries)
                        .max(e.retry_after().unwrap_or_default());
                    warn!(error = %e, retry = retries, delay_ms = delay.as_millis() as u64, "classification failed; retrying");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Best current total.
///
/// With more pages pending the total stays strictly above what is known to be
/// processable so far, so progress cannot reach 100 before the last batch.
fn refine_total(
    requested: u64,
    estimate: Option<u64>,
    processed: u64,
    page_items: u64,
    has_more: bool,
) -> u64 {
    let known = processed + page_items;
    if !has_more {
        return known;
    }
    estimate.unwrap_or(0).max(known + 1).min(requested)
}

fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bulklabel_ai::InMemoryContentSource;
    use bulklabel_core::{ClassificationParams, OwnerRef, SourceRef};

    use crate::cache::{InMemoryResultCache, ResultCache};
    use crate::jobs::batching::FixedMemoryProbe;
    use crate::jobs::store::InMemoryJobLedger;
    use crate::test_support::{FlakySource, ScriptedClassifier};

    struct Harness {
        ledger: Arc<InMemoryJobLedger>,
        cache: Arc<InMemoryResultCache>,
        source: Arc<FlakySource>,
        classifier: Arc<ScriptedClassifier>,
        memory: Arc<FixedMemoryProbe>,
    }

    impl Harness {
        fn new(source_items: usize) -> Self {
            Self {
                ledger: InMemoryJobLedger::arc(),
                cache: Arc::new(InMemoryResultCache::default()),
                source: FlakySource::generated("video-1", source_items),
                classifier: ScriptedClassifier::arc(),
                memory: Arc::new(FixedMemoryProbe::new(0.9)),
            }
        }

        fn processor(&self, config: ProcessorConfig) -> BatchProcessor {
            BatchProcessor::new(
                self.ledger.clone(),
                self.cache.clone(),
                self.source.clone(),
                self.classifier.clone(),
                config,
            )
            .with_memory_probe(self.memory.clone())
        }

        fn claim(&self, requested: u64, worker: &WorkerId) -> Job {
            let job = Job::new(
                OwnerRef::new("owner-1"),
                SourceRef::new("video-1"),
                requested,
                ClassificationParams::new("sentiment-v2"),
            );
            self.ledger.enqueue_unique(job).unwrap();
            self.ledger.claim_next(worker).unwrap().unwrap()
        }
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig::default()
            .with_page_size(100)
            .with_batch_sizing(BatchSizing {
                default_size: 32,
                min_size: 4,
                memory_threshold: 0.2,
                shrink_factor: 0.5,
            })
            .with_classify_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
            .with_source_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
    }

    #[test]
    fn processes_three_pages_to_completion() {
        let h = Harness::new(250);
        let w = WorkerId::new("w1");
        let job = h.claim(250, &w);

        let done = h.processor(fast_config()).process(&job, &w).unwrap();
        assert_eq!(done.processed_count, 250);
        assert_eq!(done.cache, Some(PutOutcome::Inserted));
        assert_eq!(h.source.fetches(), 3);
        assert_eq!(h.classifier.items_classified(), 250);

        let stored = h.ledger.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.processed_count, 250);
        assert_eq!(stored.total_count, 250);

        let result = h.ledger.load_result(done.result_ref).unwrap().unwrap();
        assert_eq!(result.items.len(), 250);
        assert_eq!(result.items[0].item_id, "video-1-0");
        assert_eq!(result.items[249].item_id, "video-1-249");
        assert_eq!(result.summary.total_items, 250);

        let entry = h.cache.get(&job.fingerprint, Utc::now()).unwrap().unwrap();
        assert_eq!(entry.result_ref, done.result_ref);
    }

    #[test]
    fn stops_at_requested_count() {
        let h = Harness::new(250);
        let w = WorkerId::new("w1");
        let job = h.claim(120, &w);

        let done = h.processor(fast_config()).process(&job, &w).unwrap();
        assert_eq!(done.processed_count, 120);
        assert_eq!(h.source.fetches(), 2);
    }

    #[test]
    fn short_source_completes_with_what_exists() {
        let h = Harness::new(30);
        let w = WorkerId::new("w1");
        let job = h.claim(500, &w);

        let done = h.processor(fast_config()).process(&job, &w).unwrap();
        assert_eq!(done.processed_count, 30);
        assert_eq!(h.ledger.get(job.id).unwrap().unwrap().total_count, 30);
    }

    #[test]
    fn empty_source_completes_with_empty_result() {
        let h = Harness::new(0);
        let w = WorkerId::new("w1");
        let job = h.claim(10, &w);

        let done = h.processor(fast_config()).process(&job, &w).unwrap();
        assert_eq!(done.processed_count, 0);
        assert_eq!(h.classifier.calls(), 0);
        let stored = h.ledger.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress, 100);
    }

    #[test]
    fn progress_is_monotonic_and_reaches_100_only_at_the_end() {
        let h = Harness::new(250);
        let w = WorkerId::new("w1");
        let job = h.claim(250, &w);

        let ledger = h.ledger.clone();
        let job_id = job.id;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.classifier.on_call(move |_| {
            let j = ledger.get(job_id).unwrap().unwrap();
            sink.lock().unwrap().push(j.progress);
        });

        h.processor(fast_config()).process(&job, &w).unwrap();

        let seen = seen.lock().unwrap().clone();
        assert!(seen.windows(2).all(|p| p[0] <= p[1]), "{seen:?}");
        assert!(seen.iter().all(|p| *p < 100));
    }

    #[test]
    fn batch_size_shrinks_under_memory_pressure() {
        let h = Harness::new(40);
        let w = WorkerId::new("w1");
        let job = h.claim(40, &w);
        h.memory.set(0.05);

        h.processor(fast_config()).process(&job, &w).unwrap();
        assert_eq!(h.classifier.batch_sizes(), vec![16, 8, 4, 4, 4, 4]);
    }

    #[test]
    fn custom_strategy_is_used() {
        let h = Harness::new(10);
        let w = WorkerId::new("w1");
        let job = h.claim(10, &w);

        let factory: BatchSizeFactory =
            Arc::new(|| Box::new(|_ratio: f64| 3usize) as Box<dyn BatchSizeStrategy>);
        h.processor(fast_config())
            .with_batch_size_strategy(factory)
            .process(&job, &w)
            .unwrap();
        assert_eq!(h.classifier.batch_sizes(), vec![3, 3, 3, 1]);
    }

    #[test]
    fn transient_classifier_errors_are_retried() {
        let h = Harness::new(10);
        let w = WorkerId::new("w1");
        let job = h.claim(10, &w);
        h.classifier.fail_next(2, ClassificationError::Timeout);

        let done = h.processor(fast_config()).process(&job, &w).unwrap();
        assert_eq!(done.processed_count, 10);
        assert_eq!(h.classifier.calls(), 3);
    }

    #[test]
    fn exhausted_retries_fail_without_cache_entry() {
        let h = Harness::new(50);
        let w = WorkerId::new("w1");
        let job = h.claim(50, &w);
        h.classifier
            .fail_always(ClassificationError::Unavailable("503".to_string()));

        let err = h.processor(fast_config()).process(&job, &w).unwrap_err();
        assert!(matches!(err, ProcessError::Classification(_)));
        assert_eq!(h.classifier.calls(), 4);
        assert_eq!(
            err.to_job_error().unwrap().kind,
            JobErrorKind::Classification
        );
        assert!(h.cache.get(&job.fingerprint, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let h = Harness::new(50);
        let w = WorkerId::new("w1");
        let job = h.claim(50, &w);
        h.classifier
            .fail_always(ClassificationError::Rejected("unknown model".to_string()));

        let err = h.processor(fast_config()).process(&job, &w).unwrap_err();
        assert!(matches!(err, ProcessError::Classification(_)));
        assert_eq!(h.classifier.calls(), 1);
    }

    #[test]
    fn transient_source_errors_are_retried() {
        let h = Harness::new(150);
        let w = WorkerId::new("w1");
        let job = h.claim(150, &w);
        h.source.fail_next(2, SourceError::Timeout);

        let done = h.processor(fast_config()).process(&job, &w).unwrap();
        assert_eq!(done.processed_count, 150);
        assert_eq!(h.source.fetches(), 4);
    }

    #[test]
    fn missing_source_fails_immediately() {
        let h = Harness::new(10);
        let w = WorkerId::new("w1");
        let job = Job::new(
            OwnerRef::new("o"),
            SourceRef::new("no-such-source"),
            10,
            ClassificationParams::new("m"),
        );
        h.ledger.enqueue_unique(job).unwrap();
        let job = h.ledger.claim_next(&w).unwrap().unwrap();

        let err = h.processor(fast_config()).process(&job, &w).unwrap_err();
        assert!(matches!(err, ProcessError::Source(SourceError::NotFound(_))));
        assert_eq!(h.source.fetches(), 1);
    }

    #[test]
    fn cancellation_stops_before_next_batch() {
        let h = Harness::new(250);
        let w = WorkerId::new("w1");
        let job = h.claim(250, &w);

        let ledger = h.ledger.clone();
        let job_id = job.id;
        h.classifier.on_call(move |call| {
            if call == 2 {
                ledger.cancel(job_id).unwrap();
            }
        });

        let err = h.processor(fast_config()).process(&job, &w).unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled(id) if id == job_id));
        assert!(err.to_job_error().is_none());
        // The in-flight batch finished, nothing after it started.
        assert_eq!(h.classifier.calls(), 2);

        let stored = h.ledger.get(job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(h.cache.get(&job.fingerprint, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn reaped_job_resumes_from_checkpoint_on_another_worker() {
        let h = Harness::new(250);
        let first = WorkerId::new("w1");
        let job = h.claim(250, &first);

        // First worker dies after its third batch.
        let ledger = h.ledger.clone();
        h.classifier.on_call(move |call| {
            if call == 4 {
                ledger
                    .requeue_stale(Duration::ZERO, Utc::now() + chrono::Duration::seconds(1))
                    .unwrap();
            }
        });
        let err = h.processor(fast_config()).process(&job, &first).unwrap_err();
        assert!(matches!(err, ProcessError::LeaseLost(_)));

        let partial = h.ledger.get(job.id).unwrap().unwrap();
        assert_eq!(partial.status, JobStatus::Queued);
        assert_eq!(partial.processed_count, 96);

        h.classifier.on_call(|_| {});
        let second = WorkerId::new("w2");
        let resumed = h.ledger.claim_next(&second).unwrap().unwrap();
        let done = h.processor(fast_config()).process(&resumed, &second).unwrap();
        assert_eq!(done.processed_count, 250);

        let result = h.ledger.load_result(done.result_ref).unwrap().unwrap();
        let ids: Vec<_> = result.items.iter().map(|i| i.item_id.clone()).collect();
        let expected: Vec<_> = (0..250).map(|n| format!("video-1-{n}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn lease_lost_to_another_worker_is_not_cancelled() {
        let h = Harness::new(20);
        let w = WorkerId::new("w1");
        let job = h.claim(20, &w);
        h.ledger
            .requeue_stale(Duration::ZERO, Utc::now() + chrono::Duration::seconds(1))
            .unwrap();

        let err = h.processor(fast_config()).process(&job, &w).unwrap_err();
        assert!(matches!(err, ProcessError::LeaseLost(_)));
        assert!(err.to_job_error().is_none());
    }

    #[test]
    fn refine_total_keeps_headroom_while_pages_remain() {
        assert_eq!(refine_total(250, Some(250), 0, 100, true), 250);
        assert_eq!(refine_total(250, Some(90), 0, 100, true), 101);
        assert_eq!(refine_total(250, None, 100, 100, true), 201);
        assert_eq!(refine_total(250, Some(1_000), 0, 100, true), 250);
        assert_eq!(refine_total(250, Some(1_000), 200, 30, false), 230);
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(clamp_confidence(1.5), 1.0);
        assert_eq!(clamp_confidence(-0.1), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
    }

    #[test]
    fn in_memory_source_without_flakiness_works_directly() {
        let ledger = InMemoryJobLedger::arc();
        let source = Arc::new(InMemoryContentSource::new().with_generated("video-1", 5));
        let processor = BatchProcessor::new(
            ledger.clone(),
            Arc::new(InMemoryResultCache::default()),
            source,
            ScriptedClassifier::arc(),
            fast_config(),
        )
        .with_memory_probe(Arc::new(FixedMemoryProbe::new(1.0)));

        let w = WorkerId::new("w1");
        ledger
            .enqueue_unique(Job::new(
                OwnerRef::new("o"),
                SourceRef::new("video-1"),
                5,
                ClassificationParams::new("m"),
            ))
            .unwrap();
        let job = ledger.claim_next(&w).unwrap().unwrap();
        assert_eq!(processor.process(&job, &w).unwrap().processed_count, 5);
    }
}
