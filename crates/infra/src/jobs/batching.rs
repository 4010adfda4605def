//! Batch sizing driven by available memory.
//!
//! The processor asks a [`BatchSizeStrategy`] for the next batch size before
//! every classification call, passing the current available-memory ratio
//! (`available / total`, in `0.0..=1.0`) read from a [`MemoryProbe`].

use std::sync::{Arc, Mutex};

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// `(available_ratio) -> batch_size`. Must return at least 1.
pub trait BatchSizeStrategy: Send {
    fn next_batch_size(&mut self, available_ratio: f64) -> usize;
}

impl<F> BatchSizeStrategy for F
where
    F: FnMut(f64) -> usize + Send,
{
    fn next_batch_size(&mut self, available_ratio: f64) -> usize {
        self(available_ratio)
    }
}

/// Builds a fresh strategy per job, so per-job state never leaks between jobs.
pub type BatchSizeFactory = Arc<dyn Fn() -> Box<dyn BatchSizeStrategy> + Send + Sync>;

/// Tunables for [`AdaptiveBatchSize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSizing {
    /// Batch size under normal conditions.
    pub default_size: usize,
    /// Floor when shrinking.
    pub min_size: usize,
    /// Shrink when the available-memory ratio drops below this.
    pub memory_threshold: f64,
    /// Multiplier applied on each shrink (0.0..1.0).
    pub shrink_factor: f64,
}

impl Default for BatchSizing {
    fn default() -> Self {
        Self {
            default_size: 32,
            min_size: 4,
            memory_threshold: 0.15,
            shrink_factor: 0.5,
        }
    }
}

impl BatchSizing {
    pub fn factory(self) -> BatchSizeFactory {
        Arc::new(move || Box::new(AdaptiveBatchSize::new(self)) as Box<dyn BatchSizeStrategy>)
    }
}

/// Shrinks geometrically while memory is scarce, grows back (doubling) up to
/// the default once pressure clears.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchSize {
    sizing: BatchSizing,
    current: usize,
}

impl AdaptiveBatchSize {
    pub fn new(sizing: BatchSizing) -> Self {
        let default_size = sizing.default_size.max(1);
        let min_size = sizing.min_size.clamp(1, default_size);
        Self {
            sizing: BatchSizing {
                default_size,
                min_size,
                ..sizing
            },
            current: default_size,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }
}

impl BatchSizeStrategy for AdaptiveBatchSize {
    fn next_batch_size(&mut self, available_ratio: f64) -> usize {
        let BatchSizing {
            default_size,
            min_size,
            memory_threshold,
            shrink_factor,
        } = self.sizing;

        self.current = if available_ratio < memory_threshold {
            ((self.current as f64 * shrink_factor).floor() as usize).max(min_size)
        } else {
            self.current.saturating_mul(2).min(default_size)
        };
        self.current
    }
}

/// Source of the available-memory ratio.
pub trait MemoryProbe: Send + Sync {
    /// `available / total`, in `0.0..=1.0`.
    fn available_ratio(&self) -> f64;
}

/// Reads host memory through `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn available_ratio(&self) -> f64 {
        let Ok(mut system) = self.system.lock() else {
            return 1.0;
        };
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            // Unknown host (some containers report nothing): assume no pressure.
            return 1.0;
        }
        (system.available_memory() as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Fixed ratio, adjustable at runtime. Used in tests and when probing is disabled.
#[derive(Debug)]
pub struct FixedMemoryProbe {
    ratio: Mutex<f64>,
}

impl FixedMemoryProbe {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: Mutex::new(ratio),
        }
    }

    pub fn set(&self, ratio: f64) {
        if let Ok(mut r) = self.ratio.lock() {
            *r = ratio;
        }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn available_ratio(&self) -> f64 {
        self.ratio.lock().map(|r| *r).unwrap_or(1.0)
    }
}
