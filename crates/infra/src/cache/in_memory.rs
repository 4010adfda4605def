use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use bulklabel_core::{Fingerprint, ResultRef};

use super::{
    CacheConfig, CacheEntry, CacheError, CacheStats, EvictionReport, PutOutcome, ResultCache,
};

/// In-memory result cache for tests/dev.
#[derive(Debug)]
pub struct InMemoryResultCache {
    config: CacheConfig,
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

impl InMemoryResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl Default for InMemoryResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

fn poisoned<T>(_: T) -> CacheError {
    CacheError::Storage("cache lock poisoned".to_string())
}

impl ResultCache for InMemoryResultCache {
    fn get(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .get(fingerprint)
            .filter(|e| e.is_live(now))
            .cloned())
    }

    fn put(
        &self,
        fingerprint: &Fingerprint,
        result_ref: ResultRef,
        size_estimate: u64,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome, CacheError> {
        let fresh = CacheEntry::new(
            fingerprint.clone(),
            result_ref,
            size_estimate,
            self.config.ttl,
            now,
        );
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entries.get_mut(fingerprint) {
            Some(existing) if existing.is_live(now) => {
                existing.expires_at = existing.expires_at.max(fresh.expires_at);
                Ok(PutOutcome::Refreshed)
            }
            _ => {
                entries.insert(fingerprint.clone(), fresh);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    fn evict(&self, now: DateTime<Utc>) -> Result<EvictionReport, CacheError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let mut report = EvictionReport::default();

        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        report.expired = (before - entries.len()) as u64;

        let mut total: u64 = entries.values().map(|e| e.size_estimate).sum();
        if total > self.config.capacity_bytes {
            let mut by_age: Vec<(DateTime<Utc>, Fingerprint, u64)> = entries
                .values()
                .map(|e| (e.created_at, e.fingerprint.clone(), e.size_estimate))
                .collect();
            by_age.sort();

            for (_, fingerprint, size) in by_age {
                if total <= self.config.capacity_bytes {
                    break;
                }
                entries.remove(&fingerprint);
                total -= size;
                report.over_capacity += 1;
            }
        }

        report.remaining_entries = entries.len() as u64;
        report.remaining_bytes = total;
        Ok(report)
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(CacheStats {
            entries: entries.len() as u64,
            total_bytes: entries.values().map(|e| e.size_estimate).sum(),
            capacity_bytes: self.config.capacity_bytes,
        })
    }
}
