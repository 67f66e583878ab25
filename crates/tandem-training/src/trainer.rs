//! Preference-optimization training loop.
//!
//! [`DpoTrainer`] drives one worker of a data-parallel fleet. Every worker runs
//! the same loop in lockstep: the only cross-worker traffic is the collator's
//! length agreement, the barrier before a save and the broadcast on resume.

use crate::augment::RefPolicyAugmenter;
use crate::batch::{Batch, masked_mean};
use crate::checkpoint::{CheckpointSink, SaveCandidates, TrainerState, TrainerStateSnapshot};
use crate::collate::Collator;
use crate::config::TrainerConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::RunId;
use crate::logger::{Metrics, MetricsLogger, prefixed};
use crate::model::{LrScheduler, Optimizer, PolicyModel};
use crate::progress::{ProgressPlan, ensure_epochs_supported};
use crate::sampler::BatchSource;
use crate::timer::{RunTimer, StepTimer, WallClockTimer};
use ndarray::Array1;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Idle,
    Running,
    Validating,
    Saving,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxSteps,
    EpochsExhausted,
    TimeLimit,
    /// The loaded state was already at or past the step budget.
    AlreadyComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitSummary {
    pub state: TrainerState,
    pub stop_reason: StopReason,
}

/// Collaborators handed to [`DpoTrainer::new`].
pub struct TrainerComponents<M> {
    pub model: M,
    pub optimizer: Box<dyn Optimizer>,
    pub scheduler: Box<dyn LrScheduler>,
    pub train_loader: Box<dyn BatchSource>,
    pub val_loader: Box<dyn BatchSource>,
    pub collator: Collator,
    pub logger: Box<dyn MetricsLogger>,
    pub checkpoint: Box<dyn CheckpointSink>,
    /// `None` builds a wall-clock timer from `max_time_per_run`.
    pub run_timer: Option<Box<dyn RunTimer>>,
}

pub struct DpoTrainer<M: PolicyModel> {
    config: TrainerConfig,
    model: M,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn LrScheduler>,
    train_loader: Box<dyn BatchSource>,
    val_loader: Box<dyn BatchSource>,
    collator: Collator,
    logger: Box<dyn MetricsLogger>,
    checkpoint: Box<dyn CheckpointSink>,
    run_timer: Box<dyn RunTimer>,
    state: TrainerState,
    plan: ProgressPlan,
    phase: TrainerPhase,
    step_timer: StepTimer,
    run_id: RunId,
    extra_hyperparams: serde_json::Map<String, serde_json::Value>,
}

impl<M: PolicyModel> std::fmt::Debug for DpoTrainer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpoTrainer")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("plan", &self.plan)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl<M: PolicyModel> DpoTrainer<M> {
    pub fn new(config: TrainerConfig, components: TrainerComponents<M>) -> TrainingResult<Self> {
        config.validate()?;
        let loaders = [("train", &components.train_loader), ("val", &components.val_loader)];
        for (name, loader) in loaders {
            if loader.global_batch_size() != config.global_batch_size {
                return Err(TrainingError::Configuration(format!(
                    "{name} loader draws global batches of {} but global_batch_size is {}",
                    loader.global_batch_size(),
                    config.global_batch_size
                )));
            }
        }
        let train_loader = components.train_loader;
        let val_loader = components.val_loader;
        ensure_epochs_supported(train_loader.reshuffles_each_epoch(), config.max_epochs)?;
        let plan = Self::resolve_plan(&config, train_loader.as_ref(), val_loader.as_ref())?;
        info!(
            steps_per_epoch = plan.steps_per_epoch,
            max_steps = plan.max_steps,
            val_check_interval = plan.val_check_interval,
            limit_val_batches = plan.limit_val_batches,
            "resolved training plan"
        );
        let run_timer: Box<dyn RunTimer> = match components.run_timer {
            Some(timer) => timer,
            None => Box::new(WallClockTimer::from_config(config.max_time_per_run.as_deref())?),
        };

        Ok(Self {
            config,
            model: components.model,
            optimizer: components.optimizer,
            scheduler: components.scheduler,
            train_loader,
            val_loader,
            collator: components.collator,
            logger: components.logger,
            checkpoint: components.checkpoint,
            run_timer,
            state: TrainerState::default(),
            plan,
            phase: TrainerPhase::Idle,
            step_timer: StepTimer::default(),
            run_id: RunId::generate(),
            extra_hyperparams: serde_json::Map::new(),
        })
    }

    fn resolve_plan(
        config: &TrainerConfig,
        train_loader: &dyn BatchSource,
        val_loader: &dyn BatchSource,
    ) -> TrainingResult<ProgressPlan> {
        let train_batches = train_loader.global_batches_per_epoch()?;
        ProgressPlan::resolve(config, train_batches, val_loader.num_batches())
    }

    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    /// Extra value logged with the hyperparameters at the start of `fit`.
    pub fn add_hyperparam(
        &mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> TrainingResult<()> {
        self.extra_hyperparams.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn plan(&self) -> &ProgressPlan {
        &self.plan
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch(self.plan.steps_per_epoch)
    }

    pub fn state_snapshot(&self) -> TrainerStateSnapshot {
        self.state.snapshot(self.plan.steps_per_epoch)
    }

    /// Restore progress from a checkpoint. Every worker must call this with
    /// the state it loaded; any disagreement with rank 0 is fatal.
    pub fn load_state(&mut self, snapshot: TrainerStateSnapshot) -> TrainingResult<()> {
        let loaded = TrainerState::from(snapshot);
        let comm = self.collator.communicator();
        let local = loaded.as_words().to_vec();
        let reference = comm.broadcast(&local, 0)?;
        if reference != local {
            let rank = comm.rank();
            return Err(TrainingError::DistributedStateMismatch { rank, local, reference });
        }

        self.state = loaded;
        self.plan =
            Self::resolve_plan(&self.config, self.train_loader.as_ref(), self.val_loader.as_ref())?;
        info!(
            step = self.state.step,
            consumed_samples = self.state.consumed_samples,
            max_steps = self.plan.max_steps,
            "restored trainer state, verified across {} workers",
            comm.world_size()
        );
        Ok(())
    }

    /// Run until the step budget, the epochs or the time limit runs out.
    /// The logger is finalized on every exit, including errors.
    pub fn fit(&mut self) -> TrainingResult<FitSummary> {
        let span = info_span!("dpo_fit", run_id = %self.run_id);
        let _guard = span.enter();

        let result = self.run_epochs();
        self.phase = TrainerPhase::Stopped;
        let finalized = self.logger.finalize();
        let summary = result?;
        finalized?;
        info!(step = summary.state.step, reason = ?summary.stop_reason, "training stopped");
        Ok(summary)
    }

    fn summary(&self, stop_reason: StopReason) -> FitSummary {
        FitSummary { state: self.state, stop_reason }
    }

    fn hyperparams(&self) -> serde_json::Value {
        let mut params = serde_json::json!({
            "run_id": self.run_id,
            "global_batch_size": self.config.global_batch_size,
            "max_epochs": self.config.max_epochs,
            "max_steps": self.plan.max_steps,
            "steps_per_epoch": self.plan.steps_per_epoch,
            "val_check_interval": self.plan.val_check_interval,
            "limit_val_batches": self.plan.limit_val_batches,
            "save_interval": self.plan.save_interval,
            "gradient_clip_val": self.config.gradient_clip_val,
            "data_parallel_size": self.collator.communicator().world_size(),
        });
        if let Some(map) = params.as_object_mut() {
            map.extend(self.extra_hyperparams.clone());
        }
        params
    }

    fn run_epochs(&mut self) -> TrainingResult<FitSummary> {
        self.logger.log_hyperparams(&self.hyperparams())?;

        let start_epoch = self.epoch();
        if start_epoch >= self.config.max_epochs || self.state.step >= self.plan.max_steps {
            info!(step = self.state.step, max_steps = self.plan.max_steps, "nothing left to train");
            return Ok(self.summary(StopReason::AlreadyComplete));
        }

        self.run_timer.start_time();
        self.phase = TrainerPhase::Running;

        for epoch in start_epoch..self.config.max_epochs {
            let steps = self.plan.num_steps_in_epoch(self.state.step);
            if steps == 0 {
                return Ok(self.summary(StopReason::MaxSteps));
            }
            debug!(epoch, steps, consumed_samples = self.state.consumed_samples, "starting epoch");

            let upstream = self.train_loader.iter_from(self.state.consumed_samples);
            let mut batches = RefPolicyAugmenter::new(upstream, self.collator.clone());
            for _ in 0..steps {
                let Some(batch) = batches.next_batch(&mut self.model) else {
                    debug!(epoch, step = self.state.step, "training data exhausted for this epoch");
                    break;
                };
                let batch = batch?;

                self.step_timer.start("train_step_time");
                let mut metrics = self.train_single_step(&batch)?;
                self.step_timer.stop("train_step_time");
                drop(batch);

                self.state.consumed_samples += self.config.global_batch_size;
                metrics.insert("consumed_samples".to_string(), self.state.consumed_samples as f64);
                metrics.insert("step_time".to_string(), self.step_timer.get("train_step_time"));
                metrics.insert("epoch".to_string(), (self.epoch() + 1) as f64);
                self.logger.log_metrics(&metrics, self.state.step, "train/")?;
                let mut save_metrics = prefixed(&metrics, "train_");

                self.state.step += 1;

                let time_limit_exceeded = self.run_timer.is_finished();
                let check = self.plan.check(self.state.step, time_limit_exceeded);

                if check.run_val {
                    // validation sees the updated weights, so it is logged at the new step
                    self.phase = TrainerPhase::Validating;
                    let val_metrics = self.run_validation()?;
                    self.logger.log_metrics(&val_metrics, self.state.step, "val/")?;
                    save_metrics.extend(prefixed(&val_metrics, "val_"));
                    self.phase = TrainerPhase::Running;
                }

                if check.save_model {
                    self.phase = TrainerPhase::Saving;
                    self.save(save_metrics, check.is_train_end)?;
                    self.phase = TrainerPhase::Running;
                }

                if time_limit_exceeded {
                    info!(step = self.state.step, "run time limit reached, stopping");
                    return Ok(self.summary(StopReason::TimeLimit));
                }
            }
        }

        let reason = if self.state.step >= self.plan.max_steps {
            StopReason::MaxSteps
        } else {
            StopReason::EpochsExhausted
        };
        Ok(self.summary(reason))
    }

    fn train_single_step(&mut self, batch: &Batch) -> TrainingResult<Metrics> {
        self.optimizer.zero_grad();
        self.model.prepare_for_training_step()?;
        let (loss, mut metrics) = self.model.get_loss_and_metrics(batch, false)?;
        self.model.finish_training_step()?;

        let grad_norm = self.model.clip_gradients(self.config.clip_threshold())?;
        let lr = self.optimizer.learning_rate();
        self.optimizer.step()?;
        self.scheduler.step();

        if let Some(norm) = grad_norm {
            metrics.insert("grad_norm".to_string(), norm);
        }
        metrics.insert("lr".to_string(), lr);
        metrics.insert("loss".to_string(), loss);
        Ok(metrics)
    }

    /// Mean of every metric over at most `limit_val_batches` batches. A batch
    /// whose examples are all masked does not count towards the loss.
    fn run_validation(&mut self) -> TrainingResult<Metrics> {
        let upstream = self.val_loader.iter_from(0);
        let mut batches = RefPolicyAugmenter::new(upstream, self.collator.clone());
        let mut losses = Vec::new();
        let mut loss_weights = Vec::new();
        let mut collected: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for _ in 0..self.plan.limit_val_batches {
            let Some(batch) = batches.next_batch(&mut self.model) else {
                break;
            };
            let batch = batch?;

            self.step_timer.start("validation_step_time");
            self.model.prepare_for_validation_step()?;
            let (loss, mut metrics) = self.model.get_loss_and_metrics(&batch, true)?;
            self.model.finish_validation_step()?;
            self.step_timer.stop("validation_step_time");
            let step_time = self.step_timer.get("validation_step_time");
            metrics.insert("validation_step_time".to_string(), step_time);

            losses.push(loss);
            let all_masked = batch.example_weights().iter().all(|&w| w <= 0.0);
            loss_weights.push(if all_masked { 0.0 } else { 1.0 });
            for (key, value) in metrics {
                collected.entry(key).or_default().push(value);
            }
        }

        if losses.is_empty() {
            return Err(TrainingError::Dataset("validation produced no batches".to_string()));
        }
        let batches = losses.len();
        let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
        let mut out: Metrics = collected.iter().map(|(k, v)| (k.clone(), mean(v))).collect();
        let loss = masked_mean(Array1::from(losses).view(), Array1::from(loss_weights).view());
        out.insert("loss".to_string(), loss);
        info!(step = self.state.step, batches, loss, "validation finished");
        Ok(out)
    }

    fn save(&mut self, metrics: Metrics, is_train_end: bool) -> TrainingResult<()> {
        self.collator.communicator().barrier()?;
        let candidates = SaveCandidates { state: self.state_snapshot(), metrics };
        self.checkpoint.custom_save(&candidates, is_train_end)?;
        info!(step = self.state.step, is_train_end, "checkpoint saved");
        Ok(())
    }
}
