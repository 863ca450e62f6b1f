//! Loss function(s)

use crate::values::{Value, ValueError};

/// Cross entropy between unnormalized class scores and integer class labels,
/// averaged over the batch
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn call(logits: &Value, labels: &[usize]) -> Result<Value, ValueError> {
        logits.cross_entropy(labels)
    }
}
