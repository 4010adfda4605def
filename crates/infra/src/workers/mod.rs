//! Background thread plumbing shared by the worker loop, reaper and cache janitor.

pub mod periodic;

pub use periodic::{PeriodicRunner, WorkerHandle};
