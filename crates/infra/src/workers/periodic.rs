use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Handle to control and join a background thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: String, shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the thread to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Spawn a named thread running `body(shutdown_rx)`.
pub(crate) fn spawn_named<F>(name: &str, body: F) -> std::io::Result<WorkerHandle>
where
    F: FnOnce(mpsc::Receiver<()>) + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(shutdown_rx))?;
    Ok(WorkerHandle::new(name.to_string(), shutdown_tx, join))
}

/// Sleep for `dur` unless shutdown is requested first. Returns `true` on shutdown.
pub(crate) fn sleep_or_shutdown(shutdown_rx: &mpsc::Receiver<()>, dur: Duration) -> bool {
    match shutdown_rx.recv_timeout(dur) {
        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
        Err(mpsc::RecvTimeoutError::Timeout) => false,
    }
}

/// Runs a task on a fixed cadence.
///
/// - Schedule: first run immediately, then every `interval`
/// - Failures: logged and retried with bounded exponential backoff; never propagate
#[derive(Debug, Clone)]
pub struct PeriodicRunner {
    pub interval: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for PeriodicRunner {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
        }
    }
}

impl PeriodicRunner {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn spawn<T, E>(&self, name: &str, mut task: T) -> std::io::Result<WorkerHandle>
    where
        T: FnMut() -> Result<(), E> + Send + 'static,
        E: core::fmt::Display,
    {
        let cfg = self.clone();
        let runner = name.to_string();
        spawn_named(name, move |shutdown_rx| {
            info!(runner = %runner, interval_ms = cfg.interval.as_millis() as u64, "periodic runner started");

            let mut next_tick = Instant::now();
            let mut failures: u32 = 0;

            loop {
                let wait = next_tick.saturating_duration_since(Instant::now());
                if sleep_or_shutdown(&shutdown_rx, wait) {
                    break;
                }

                match task() {
                    Ok(()) => {
                        failures = 0;
                        next_tick = advance(next_tick, cfg.interval);
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(runner = %runner, error = %e, failures, "periodic task failed");
                        if failures <= cfg.max_retries {
                            next_tick = Instant::now() + backoff(cfg.base_backoff, failures);
                        } else {
                            debug!(runner = %runner, "retry budget exhausted; waiting for next tick");
                            failures = 0;
                            next_tick = advance(next_tick, cfg.interval);
                        }
                    }
                }
            }

            info!(runner = %runner, "periodic runner stopped");
        })
    }
}

/// Keep a stable cadence even if we were delayed.
fn advance(mut next_tick: Instant, interval: Duration) -> Instant {
    let now = Instant::now();
    let interval = interval.max(Duration::from_millis(1));
    while next_tick <= now {
        next_tick += interval;
    }
    next_tick
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    // Exponential backoff: base * 2^(attempt-1), capped.
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(pow as u128);
    Duration::from_millis(ms.min(10_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_is_bounded() {
        let base = Duration::from_millis(250);
        assert_eq!(backoff(base, 1), Duration::from_millis(250));
        assert_eq!(backoff(base, 3), Duration::from_millis(1000));
        assert_eq!(backoff(base, 30), Duration::from_millis(10_000));
    }

    #[test]
    fn runs_repeatedly_until_shutdown() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let handle = PeriodicRunner::every(Duration::from_millis(10))
            .spawn("test-periodic", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        handle.shutdown();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn failing_task_keeps_running() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let runner = PeriodicRunner {
            interval: Duration::from_millis(10),
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
        };
        let handle = runner
            .spawn("test-failing", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom")
            })
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());
        handle.shutdown();
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }
}
