//! `bulklabel-ai`
//!
//! **Responsibility:** boundary to the two external collaborators.
//!
//! - `ContentSource`: paginated, ordered text items for a source identifier.
//! - `ClassificationService`: labels a batch of strings.
//!
//! Both are black boxes with a request/response contract. This crate holds no
//! job state and performs no persistence.

pub mod classifier;
pub mod result;
pub mod source;

pub use classifier::ClassificationService;
pub use result::{Classification, ClassificationError, SourceError};
pub use source::{ContentSource, Cursor, InMemoryContentSource, Page, SourceItem};
