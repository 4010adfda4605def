//! Infrastructure layer: job ledger, result cache, dispatcher, workers,
//! database wiring, configuration and external service adapters.

pub mod cache;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod external;
pub mod jobs;
pub mod status;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use cache::{CacheConfig, InMemoryResultCache, PostgresResultCache, ResultCache};
pub use config::{ConfigError, Settings};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig, SubmitRequest, Submission};
pub use jobs::{BatchProcessor, InMemoryJobLedger, JobLedger, JobWorker, PostgresJobLedger};
pub use status::{JobStatusView, ResultError, ResultLookup, StatusService};
