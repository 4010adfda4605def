//! `bulklabel-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, classification parameters and the
//! request fingerprint used for cache keying and duplicate suppression.

pub mod error;
pub mod fingerprint;
pub mod id;
pub mod params;

pub use error::{DomainError, DomainResult};
pub use fingerprint::Fingerprint;
pub use id::{JobId, OwnerRef, ResultRef, SourceRef, WorkerId};
pub use params::ClassificationParams;
