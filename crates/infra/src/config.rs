//! Configuration loading and representation.
//!
//! Everything comes from `BULKLABEL_*` environment variables (plus
//! `DATABASE_URL`), each with a default. Unparsable values are errors, not
//! silently defaulted.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::{CacheConfig, CacheJanitorConfig};
use crate::dispatcher::DispatcherConfig;
use crate::jobs::{BatchSizing, ProcessorConfig, ReaperConfig, RetryPolicy, WorkerConfig};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

/// Fully resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    /// `None` runs with in-memory ledger and cache.
    pub database_url: Option<String>,
    pub dispatcher: DispatcherConfig,
    pub processor: ProcessorConfig,
    pub worker: WorkerConfig,
    /// Worker threads per process.
    pub workers: usize,
    pub reaper: ReaperConfig,
    pub cache: CacheConfig,
    pub janitor: CacheJanitorConfig,
    pub classifier_url: Option<String>,
    pub source_url: Option<String>,
    /// Request timeout for the HTTP collaborator adapters.
    pub http_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            dispatcher: DispatcherConfig::default(),
            processor: ProcessorConfig::default(),
            worker: WorkerConfig::default(),
            workers: 1,
            reaper: ReaperConfig::default(),
            cache: CacheConfig::default(),
            janitor: CacheJanitorConfig::default(),
            classifier_url: None,
            source_url: None,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup` (tests pass a map instead of touching the environment).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let defaults = Settings::default();

        let retry_base = Duration::from_millis(env.parse("BULKLABEL_RETRY_BASE_MS", 200u64)?);
        let retry = |max_retries| RetryPolicy::exponential(max_retries, retry_base, Duration::from_secs(5));

        let sizing = BatchSizing {
            default_size: env.parse("BULKLABEL_BATCH_SIZE", 32usize)?,
            min_size: env.parse("BULKLABEL_MIN_BATCH_SIZE", 4usize)?,
            memory_threshold: env.parse("BULKLABEL_MEMORY_THRESHOLD", 0.15f64)?,
            shrink_factor: env.parse("BULKLABEL_BATCH_SHRINK_FACTOR", 0.5f64)?,
        };
        check(sizing.default_size >= 1, "BULKLABEL_BATCH_SIZE", "must be at least 1")?;
        check(
            sizing.min_size >= 1 && sizing.min_size <= sizing.default_size,
            "BULKLABEL_MIN_BATCH_SIZE",
            "must be between 1 and BULKLABEL_BATCH_SIZE",
        )?;
        check(
            (0.0..=1.0).contains(&sizing.memory_threshold),
            "BULKLABEL_MEMORY_THRESHOLD",
            "must be within 0.0..=1.0",
        )?;
        check(
            sizing.shrink_factor > 0.0 && sizing.shrink_factor < 1.0,
            "BULKLABEL_BATCH_SHRINK_FACTOR",
            "must be within 0.0..1.0 (exclusive)",
        )?;

        let page_size = env.parse("BULKLABEL_PAGE_SIZE", 100usize)?;
        check(page_size >= 1, "BULKLABEL_PAGE_SIZE", "must be at least 1")?;

        let processor = ProcessorConfig::default()
            .with_page_size(page_size)
            .with_batch_sizing(sizing)
            .with_classify_retry(retry(env.parse("BULKLABEL_CLASSIFY_RETRIES", 3u32)?))
            .with_source_retry(retry(env.parse("BULKLABEL_SOURCE_RETRIES", 3u32)?));

        let workers = env.parse("BULKLABEL_WORKERS", 1usize)?;

        Ok(Self {
            bind_addr: env.parse("BULKLABEL_BIND_ADDR", defaults.bind_addr)?,
            database_url: env.string("DATABASE_URL"),
            dispatcher: DispatcherConfig::default()
                .with_max_requested_count(env.parse("BULKLABEL_MAX_REQUESTED_COUNT", 50_000u64)?)
                .with_max_active_jobs_per_owner(env.parse("BULKLABEL_MAX_ACTIVE_JOBS_PER_OWNER", 5u64)?),
            processor,
            worker: WorkerConfig::default()
                .with_poll_interval(Duration::from_millis(env.parse("BULKLABEL_POLL_INTERVAL_MS", 1_000u64)?)),
            workers,
            reaper: ReaperConfig::default()
                .with_interval(env.secs("BULKLABEL_REAPER_INTERVAL_SECS", 30)?)
                .with_lease_timeout(env.secs("BULKLABEL_LEASE_TIMEOUT_SECS", 300)?),
            cache: CacheConfig::default()
                .with_ttl(env.secs("BULKLABEL_CACHE_TTL_SECS", 86_400)?)
                .with_capacity_bytes(env.parse("BULKLABEL_CACHE_CAPACITY_BYTES", 268_435_456u64)?),
            janitor: CacheJanitorConfig {
                interval: env.secs("BULKLABEL_CACHE_EVICTION_INTERVAL_SECS", 300)?,
            },
            classifier_url: env.string("BULKLABEL_CLASSIFIER_URL"),
            source_url: env.string("BULKLABEL_SOURCE_URL"),
            http_timeout: env.secs("BULKLABEL_HTTP_TIMEOUT_SECS", 30)?,
        })
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let secs = self.parse(key, default)?;
        check(secs > 0, key, "must be greater than zero")?;
        Ok(Duration::from_secs(secs))
    }
}

fn check(ok: bool, key: &'static str, reason: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key,
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert!(s.database_url.is_none());
        assert_eq!(s.dispatcher.max_requested_count, 50_000);
        assert_eq!(s.dispatcher.max_active_jobs_per_owner, 5);
        assert_eq!(s.processor.page_size, 100);
        assert_eq!(s.processor.batch_sizing.default_size, 32);
        assert_eq!(s.processor.classify_retry.max_retries, 3);
        assert_eq!(s.processor.classify_retry.max_delay, Duration::from_secs(5));
        assert_eq!(s.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(s.reaper.lease_timeout, Duration::from_secs(300));
        assert_eq!(s.cache.ttl, Duration::from_secs(86_400));
        assert_eq!(s.cache.capacity_bytes, 268_435_456);
        assert_eq!(s.workers, 1);
    }

    #[test]
    fn overrides_are_read() {
        let s = settings(&[
            ("DATABASE_URL", "postgres://localhost/bulklabel"),
            ("BULKLABEL_BIND_ADDR", "127.0.0.1:9000"),
            ("BULKLABEL_PAGE_SIZE", "25"),
            ("BULKLABEL_LEASE_TIMEOUT_SECS", "60"),
            ("BULKLABEL_WORKERS", "4"),
            ("BULKLABEL_CLASSIFIER_URL", " http://classifier:9000 "),
        ])
        .unwrap();
        assert_eq!(s.database_url.as_deref(), Some("postgres://localhost/bulklabel"));
        assert_eq!(s.bind_addr.port(), 9000);
        assert_eq!(s.processor.page_size, 25);
        assert_eq!(s.reaper.lease_timeout, Duration::from_secs(60));
        assert_eq!(s.workers, 4);
        assert_eq!(s.classifier_url.as_deref(), Some("http://classifier:9000"));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let s = settings(&[("DATABASE_URL", "  "), ("BULKLABEL_PAGE_SIZE", "")]).unwrap();
        assert!(s.database_url.is_none());
        assert_eq!(s.processor.page_size, 100);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = settings(&[("BULKLABEL_PAGE_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "BULKLABEL_PAGE_SIZE", .. }));

        let err = settings(&[("BULKLABEL_BIND_ADDR", "nowhere")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(matches!(
            settings(&[("BULKLABEL_MIN_BATCH_SIZE", "64")]),
            Err(ConfigError::OutOfRange { key: "BULKLABEL_MIN_BATCH_SIZE", .. })
        ));
        assert!(matches!(
            settings(&[("BULKLABEL_BATCH_SHRINK_FACTOR", "1.5")]),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            settings(&[("BULKLABEL_LEASE_TIMEOUT_SECS", "0")]),
            Err(ConfigError::OutOfRange { .. })
        ));
    }
}
