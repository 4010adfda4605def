use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label assigned to a single text item.
///
/// Returned by a `ClassificationService` in the same order as its input batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,

    /// Confidence in \[0, 1\] (recommended convention; clamped by consumers).
    pub confidence: f64,
}

impl Classification {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Failure of a content source page fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("content source unavailable: {0}")]
    Unavailable(String),

    #[error("content source timed out")]
    Timeout,

    #[error("content source rate limited")]
    RateLimited,

    #[error("content source returned malformed data: {0}")]
    Malformed(String),

    #[error("source not found: {0}")]
    NotFound(String),
}

impl SourceError {
    /// Whether another attempt at the same page may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::NotFound(_))
    }
}

/// Failure of a classification call. Always covers the whole batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("classification timed out")]
    Timeout,

    #[error("classification rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("classification service unavailable: {0}")]
    Unavailable(String),

    #[error("classification returned malformed output: {0}")]
    Malformed(String),

    #[error("classification rejected the batch: {0}")]
    Rejected(String),
}

impl ClassificationError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ClassificationError::Rejected(_))
    }

    /// Server-requested delay before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClassificationError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_not_found_is_permanent_for_sources() {
        assert!(SourceError::Timeout.is_transient());
        assert!(SourceError::Malformed("x".into()).is_transient());
        assert!(!SourceError::NotFound("vid".into()).is_transient());
    }

    #[test]
    fn rejected_batches_are_not_retried() {
        assert!(ClassificationError::Timeout.is_transient());
        assert!(!ClassificationError::Rejected("too long".into()).is_transient());
        let rl = ClassificationError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(rl.retry_after(), Some(Duration::from_secs(2)));
    }
}
