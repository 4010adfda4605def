//! Result cache: fingerprint -> completed result, with TTL and a size cap.
//!
//! Entries are write-once per fingerprint while live: a second `put` for a
//! live entry only refreshes `expires_at`. Eviction drops expired entries
//! first, then the oldest entries until the total size fits the capacity.

mod in_memory;
pub mod janitor;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use bulklabel_core::{Fingerprint, ResultRef};

pub use in_memory::InMemoryResultCache;
pub use janitor::{CacheJanitor, CacheJanitorConfig};
pub use postgres::PostgresResultCache;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live applied on `put`.
    pub ttl: Duration,
    /// Upper bound on the sum of `size_estimate` across entries.
    pub capacity_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            capacity_bytes: 256 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_capacity_bytes(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }
}

/// One cached result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result_ref: ResultRef,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size_estimate: u64,
}

impl CacheEntry {
    pub fn new(
        fingerprint: Fingerprint,
        result_ref: ResultRef,
        size_estimate: u64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint,
            result_ref,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(36_500)),
            size_estimate,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Outcome of [`ResultCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No live entry existed; the new entry was stored.
    Inserted,
    /// A live entry existed; only its expiry was extended.
    Refreshed,
}

/// What one eviction pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub expired: u64,
    pub over_capacity: u64,
    pub remaining_entries: u64,
    pub remaining_bytes: u64,
}

impl EvictionReport {
    pub fn removed(&self) -> u64 {
        self.expired + self.over_capacity
    }
}

/// Cache occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
}

/// Cache error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result cache abstraction.
pub trait ResultCache: Send + Sync {
    /// Live entry for `fingerprint` at `now`; expired entries are a miss.
    fn get(&self, fingerprint: &Fingerprint, now: DateTime<Utc>)
    -> Result<Option<CacheEntry>, CacheError>;

    /// Store `result_ref` under `fingerprint` for the configured TTL.
    fn put(
        &self,
        fingerprint: &Fingerprint,
        result_ref: ResultRef,
        size_estimate: u64,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome, CacheError>;

    /// Expired entries first, then oldest-first until under capacity.
    fn evict(&self, now: DateTime<Utc>) -> Result<EvictionReport, CacheError>;

    fn stats(&self) -> Result<CacheStats, CacheError>;
}

impl<T: ResultCache + ?Sized> ResultCache for Arc<T> {
    fn get(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        (**self).get(fingerprint, now)
    }

    fn put(
        &self,
        fingerprint: &Fingerprint,
        result_ref: ResultRef,
        size_estimate: u64,
        now: DateTime<Utc>,
    ) -> Result<PutOutcome, CacheError> {
        (**self).put(fingerprint, result_ref, size_estimate, now)
    }

    fn evict(&self, now: DateTime<Utc>) -> Result<EvictionReport, CacheError> {
        (**self).evict(now)
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        (**self).stats()
    }
}
