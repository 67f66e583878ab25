//! Attaches reference-policy log-probabilities to each batch.

use crate::batch::Batch;
use crate::collate::Collator;
use crate::error::TrainingResult;
use crate::model::PolicyModel;
use crate::sampler::ExampleBatches;

/// Pull-based wrapper over an example-batch iterator.
///
/// Each call collates one upstream batch and runs the reference forward pass
/// synchronously before handing the batch out. Nothing is prefetched, and the
/// wrapper is exhausted exactly when upstream is.
pub struct RefPolicyAugmenter {
    upstream: ExampleBatches,
    collator: Collator,
    exhausted: bool,
}

impl RefPolicyAugmenter {
    pub fn new(upstream: ExampleBatches, collator: Collator) -> Self {
        Self { upstream, collator, exhausted: false }
    }

    pub fn next_batch<M: PolicyModel + ?Sized>(
        &mut self,
        model: &mut M,
    ) -> Option<TrainingResult<Batch>> {
        if self.exhausted {
            return None;
        }
        let Some(examples) = self.upstream.next() else {
            self.exhausted = true;
            return None;
        };
        Some(examples.and_then(|examples| {
            let mut batch = self.collator.collate(&examples)?;
            let log_probs = model.get_ref_policy_logprobs(&batch)?;
            batch.attach_ref_log_probs(log_probs)?;
            Ok(batch)
        }))
    }
}
