//! Bulk classification jobs: ledger, batch processor, worker loop and reaper.
//!
//! ## Components
//!
//! - `Job` / `JobStatus`: lifecycle state machine
//! - `JobLedger`: durable job records with atomic claim and conditional writes
//! - `BatchProcessor`: pages through the source, classifies in batches, records progress
//! - `JobWorker`: claims the oldest queued job and runs the processor
//! - `StaleJobReaper`: requeues jobs whose lease was not renewed in time

pub mod analysis;
pub mod batching;
pub mod executor;
pub mod postgres;
pub mod processor;
pub mod reaper;
pub mod store;
pub mod types;

pub use analysis::{AnalysisResult, AnalysisSummary, ItemLabel};
pub use batching::{
    AdaptiveBatchSize, BatchSizeFactory, BatchSizeStrategy, BatchSizing, FixedMemoryProbe,
    MemoryProbe, SystemMemoryProbe,
};
pub use executor::{CycleOutcome, JobWorker, JobWorkerHandle, WorkerConfig, WorkerStats};
pub use postgres::PostgresJobLedger;
pub use processor::{BatchProcessor, ProcessError, Processed, ProcessorConfig};
pub use reaper::{ReaperConfig, StaleJobReaper};
pub use store::{BatchRecord, EnqueueOutcome, InMemoryJobLedger, JobLedger, JobStats, LedgerError};
pub use types::{
    BackoffStrategy, Checkpoint, Job, JobError, JobErrorKind, JobStatus, RetryPolicy,
    compute_progress,
};
