//! Adapters for the external collaborators over HTTP.
//!
//! Both adapters are blocking: they run on worker threads, never inside the
//! async runtime.

mod http;

pub use http::{HttpClassificationService, HttpContentSource};
