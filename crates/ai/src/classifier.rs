use std::sync::Arc;

use bulklabel_core::ClassificationParams;

use crate::result::{Classification, ClassificationError};

/// External text classification service.
///
/// Contract: returns exactly one `Classification` per input string, in input
/// order, or fails the whole batch. Partial-batch failure is not modelled.
pub trait ClassificationService: Send + Sync + 'static {
    fn classify(
        &self,
        params: &ClassificationParams,
        batch: &[String],
    ) -> Result<Vec<Classification>, ClassificationError>;
}

impl<T: ClassificationService + ?Sized> ClassificationService for Arc<T> {
    fn classify(
        &self,
        params: &ClassificationParams,
        batch: &[String],
    ) -> Result<Vec<Classification>, ClassificationError> {
        (**self).classify(params, batch)
    }
}

/// Check the length half of the contract; callers treat a mismatch as malformed output.
pub fn check_batch_shape(
    batch_len: usize,
    output: &[Classification],
) -> Result<(), ClassificationError> {
    if output.len() != batch_len {
        return Err(ClassificationError::Malformed(format!(
            "expected {batch_len} classifications, got {}",
            output.len()
        )));
    }
    Ok(())
}
