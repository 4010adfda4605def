//! Service wiring: storage backends, collaborators and background threads.
//!
//! - `Backends`: ledger + cache, in-memory or Postgres depending on `DATABASE_URL`
//! - `Collaborators`: content source + classifier over HTTP
//! - `Background`: worker threads, stale-job reaper and cache janitor
//! - `AppServices`: what the HTTP handlers need (dispatcher + status reads)
//!
//! Ledger and cache calls are synchronous. In Postgres mode they drive queries
//! on the runtime handle captured in `Backends::connect`, so they must run on
//! worker threads or inside `spawn_blocking`, never directly in a handler.

use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::info;

use bulklabel_ai::{ClassificationService, ContentSource};
use bulklabel_core::WorkerId;
use bulklabel_infra::cache::{CacheConfig, CacheJanitor, InMemoryResultCache, PostgresResultCache, ResultCache};
use bulklabel_infra::config::Settings;
use bulklabel_infra::db;
use bulklabel_infra::dispatcher::{Dispatcher, DispatcherConfig};
use bulklabel_infra::external::{HttpClassificationService, HttpContentSource};
use bulklabel_infra::jobs::{
    BatchProcessor, InMemoryJobLedger, JobLedger, JobWorker, JobWorkerHandle, PostgresJobLedger,
    StaleJobReaper,
};
use bulklabel_infra::status::StatusService;
use bulklabel_infra::workers::WorkerHandle;

/// Ledger and cache shared by every component of the process.
#[derive(Clone)]
pub struct Backends {
    pub ledger: Arc<dyn JobLedger>,
    pub cache: Arc<dyn ResultCache>,
}

impl Backends {
    pub fn in_memory(cache: CacheConfig) -> Self {
        Self {
            ledger: InMemoryJobLedger::arc(),
            cache: InMemoryResultCache::arc(cache),
        }
    }

    /// Postgres when `DATABASE_URL` is set (schema is created if missing),
    /// in-memory otherwise.
    pub async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        let Some(url) = settings.database_url.as_deref() else {
            info!("DATABASE_URL not set; using in-memory ledger and cache");
            return Ok(Self::in_memory(settings.cache.clone()));
        };

        let max_connections = (settings.workers as u32).saturating_mul(2).max(5);
        let pool = db::connect(url, max_connections)
            .await
            .context("failed to connect to Postgres")?;
        db::migrate(&pool).await.context("failed to create schema")?;
        info!(max_connections, "using Postgres ledger and cache");

        let handle = Handle::current();
        Ok(Self {
            ledger: Arc::new(PostgresJobLedger::new(pool.clone(), handle.clone())),
            cache: Arc::new(PostgresResultCache::new(pool, handle, settings.cache.clone())),
        })
    }
}

/// External collaborators used by the batch processor.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ContentSource>,
    pub classifier: Arc<dyn ClassificationService>,
}

impl Collaborators {
    /// HTTP adapters from `BULKLABEL_SOURCE_URL` / `BULKLABEL_CLASSIFIER_URL`.
    ///
    /// Builds blocking HTTP clients; call from a blocking context.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let source_url = settings
            .source_url
            .as_deref()
            .context("BULKLABEL_SOURCE_URL must be set to run workers")?;
        let classifier_url = settings
            .classifier_url
            .as_deref()
            .context("BULKLABEL_CLASSIFIER_URL must be set to run workers")?;

        Ok(Self {
            source: Arc::new(
                HttpContentSource::new(source_url, settings.http_timeout)
                    .context("failed to build content source client")?,
            ),
            classifier: Arc::new(
                HttpClassificationService::new(classifier_url, settings.http_timeout)
                    .context("failed to build classifier client")?,
            ),
        })
    }
}

/// Which background threads to start.
#[derive(Debug, Clone, Copy)]
pub struct BackgroundOptions {
    pub workers: usize,
    pub reaper: bool,
    pub janitor: bool,
}

/// Running background threads.
pub struct Background {
    workers: Vec<JobWorkerHandle>,
    periodic: Vec<WorkerHandle>,
}

impl Background {
    pub fn start(
        settings: &Settings,
        backends: &Backends,
        collaborators: Option<&Collaborators>,
        options: BackgroundOptions,
    ) -> anyhow::Result<Self> {
        let mut background = Self {
            workers: Vec::new(),
            periodic: Vec::new(),
        };

        if options.workers > 0 {
            let collaborators = collaborators.context("workers need a content source and classifier")?;
            let processor = Arc::new(BatchProcessor::new(
                backends.ledger.clone(),
                backends.cache.clone(),
                collaborators.source.clone(),
                collaborators.classifier.clone(),
                settings.processor.clone(),
            ));
            for i in 0..options.workers {
                let name = format!("job-worker-{i}");
                let worker = JobWorker::new(
                    WorkerId::generate(&name),
                    backends.ledger.clone(),
                    processor.clone(),
                );
                let handle = worker
                    .spawn(settings.worker.clone().with_name(name))
                    .context("failed to spawn job worker")?;
                background.workers.push(handle);
            }
        }

        if options.reaper {
            let reaper = StaleJobReaper::new(backends.ledger.clone(), settings.reaper.clone());
            background
                .periodic
                .push(reaper.spawn().context("failed to spawn reaper")?);
        }

        if options.janitor {
            let janitor = CacheJanitor::new(backends.cache.clone(), settings.janitor.clone());
            background
                .periodic
                .push(janitor.spawn().context("failed to spawn cache janitor")?);
        }

        info!(
            workers = background.workers.len(),
            periodic = background.periodic.len(),
            "background threads started"
        );
        Ok(background)
    }

    /// Signal every thread and wait for it to exit. Blocks.
    pub fn shutdown(self) {
        for handle in self.workers {
            handle.shutdown();
        }
        for handle in self.periodic {
            handle.shutdown();
        }
        info!("background threads stopped");
    }
}

/// State shared by the HTTP handlers.
pub struct AppServices {
    pub dispatcher: Dispatcher,
    pub status: StatusService,
    pub ledger: Arc<dyn JobLedger>,
    pub cache: Arc<dyn ResultCache>,
}

impl AppServices {
    pub fn new(backends: &Backends, config: DispatcherConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(backends.ledger.clone(), backends.cache.clone(), config),
            status: StatusService::new(backends.ledger.clone()),
            ledger: backends.ledger.clone(),
            cache: backends.cache.clone(),
        }
    }
}
