//! Contracts the orchestrator drives. Implementations live with the model code.

use crate::batch::Batch;
use crate::error::TrainingResult;
use crate::logger::Metrics;
use ndarray::Array2;

/// Trainable policy with a frozen reference copy.
pub trait PolicyModel {
    fn prepare_for_training_step(&mut self) -> TrainingResult<()>;

    /// Mean loss and named metrics. With `forward_only == false` the backward
    /// pass has run by the time this returns.
    fn get_loss_and_metrics(
        &mut self,
        batch: &Batch,
        forward_only: bool,
    ) -> TrainingResult<(f64, Metrics)>;

    fn finish_training_step(&mut self) -> TrainingResult<()>;

    fn prepare_for_validation_step(&mut self) -> TrainingResult<()>;

    fn finish_validation_step(&mut self) -> TrainingResult<()>;

    /// Per-token log-probabilities of the frozen reference, one row per
    /// [`Batch::model_rows`] entry. Runs in inference mode.
    fn get_ref_policy_logprobs(&mut self, batch: &Batch) -> TrainingResult<Array2<f32>>;

    /// Clip accumulated gradients and return the pre-clip norm if one was computed.
    fn clip_gradients(&mut self, max_norm: Option<f64>) -> TrainingResult<Option<f64>>;
}

pub trait Optimizer {
    fn zero_grad(&mut self);
    fn step(&mut self) -> TrainingResult<()>;
    /// Learning rate of the first parameter group.
    fn learning_rate(&self) -> f64;
}

pub trait LrScheduler {
    fn step(&mut self);
}
