//! Stale-job reaper: returns jobs with an expired lease to the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use bulklabel_core::JobId;

use super::store::{JobLedger, LedgerError};
use crate::workers::{PeriodicRunner, WorkerHandle};

/// Reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to scan.
    pub interval: Duration,
    /// A processing job whose lease was not renewed for this long is stale.
    pub lease_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(300),
        }
    }
}

impl ReaperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }
}

/// Requeues processing jobs whose worker stopped renewing its lease.
///
/// Progress and checkpoint are kept, so the next claimer resumes from the
/// last recorded batch.
pub struct StaleJobReaper {
    ledger: Arc<dyn JobLedger>,
    config: ReaperConfig,
}

impl StaleJobReaper {
    pub fn new(ledger: Arc<dyn JobLedger>, config: ReaperConfig) -> Self {
        Self { ledger, config }
    }

    /// One scan. Returns the requeued job ids.
    pub fn run_once(&self) -> Result<Vec<JobId>, LedgerError> {
        let requeued = self
            .ledger
            .requeue_stale(self.config.lease_timeout, Utc::now())?;
        for job_id in &requeued {
            warn!(job_id = %job_id, lease_timeout_secs = self.config.lease_timeout.as_secs(), "requeued stale job");
        }
        if !requeued.is_empty() {
            info!(count = requeued.len(), "reaper pass complete");
        }
        Ok(requeued)
    }

    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let runner = PeriodicRunner::every(self.config.interval);
        runner.spawn("stale-job-reaper", move || self.run_once().map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use bulklabel_core::{ClassificationParams, OwnerRef, SourceRef, WorkerId};

    use crate::jobs::store::InMemoryJobLedger;
    use crate::jobs::types::{Job, JobStatus};

    #[test]
    fn requeues_job_whose_worker_died() {
        let ledger = InMemoryJobLedger::arc();
        let job = Job::new(
            OwnerRef::new("o"),
            SourceRef::new("s"),
            10,
            ClassificationParams::new("m"),
        );
        let id = ledger.enqueue_unique(job).unwrap().job_id();
        ledger.claim_next(&WorkerId::new("dead-worker")).unwrap();

        let reaper = StaleJobReaper::new(
            ledger.clone(),
            ReaperConfig::default().with_lease_timeout(Duration::from_millis(20)),
        );
        assert!(reaper.run_once().unwrap().is_empty());

        thread::sleep(Duration::from_millis(40));
        assert_eq!(reaper.run_once().unwrap(), vec![id]);
        assert_eq!(ledger.get(id).unwrap().unwrap().status, JobStatus::Queued);

        let reclaimed = ledger.claim_next(&WorkerId::new("w2")).unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
    }
}
