//! Periodic cache eviction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use super::{CacheError, EvictionReport, ResultCache};
use crate::workers::{PeriodicRunner, WorkerHandle};

#[derive(Debug, Clone)]
pub struct CacheJanitorConfig {
    pub interval: Duration,
}

impl Default for CacheJanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

/// Runs [`ResultCache::evict`] on a schedule.
pub struct CacheJanitor {
    cache: Arc<dyn ResultCache>,
    config: CacheJanitorConfig,
}

impl CacheJanitor {
    pub fn new(cache: Arc<dyn ResultCache>, config: CacheJanitorConfig) -> Self {
        Self { cache, config }
    }

    pub fn run_once(&self) -> Result<EvictionReport, CacheError> {
        let report = self.cache.evict(Utc::now())?;
        if report.removed() > 0 {
            info!(
                expired = report.expired,
                over_capacity = report.over_capacity,
                remaining_entries = report.remaining_entries,
                remaining_bytes = report.remaining_bytes,
                "cache eviction pass"
            );
        } else {
            debug!(remaining_entries = report.remaining_entries, "cache eviction pass: nothing to do");
        }
        Ok(report)
    }

    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let runner = PeriodicRunner::every(self.config.interval);
        runner.spawn("cache-janitor", move || self.run_once().map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulklabel_core::{Fingerprint, ResultRef};

    use crate::cache::{CacheConfig, InMemoryResultCache};

    #[test]
    fn run_once_evicts_expired_entries() {
        let cache = InMemoryResultCache::arc(CacheConfig::default().with_ttl(Duration::from_secs(1)));
        let past = Utc::now() - chrono::Duration::seconds(10);
        cache
            .put(&Fingerprint::from_hex("ab".repeat(32)), ResultRef::new(), 5, past)
            .unwrap();

        let janitor = CacheJanitor::new(cache.clone(), CacheJanitorConfig::default());
        let report = janitor.run_once().unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(cache.stats().unwrap().entries, 0);
    }
}
