//! Shared collaborators for Tandem Training integration tests.
//!
//! Every mock records what the trainer did to it behind an `Arc<Mutex<_>>` so
//! tests can inspect the log after `fit` has consumed the boxed trait objects.

#![allow(dead_code)]

use ndarray::{Array1, Array2};
use std::sync::{Arc, Mutex};
use tandem_training::{
    Batch, CheckpointSink, Collator, Communicator, DataConfig, DataLoader, DatasetRecords,
    DpoTrainer, LrScheduler, Metrics, MetricsLogger, Optimizer, PolicyModel, PreferenceDataset,
    PreferenceRecord, RunTimer, SamplerConfig, SamplerKind, SaveCandidates, SingleProcess,
    TrainerComponents, TrainerConfig, TrainingError, TrainingResult, masked_mean,
};

#[derive(Debug, Default)]
pub struct ModelLog {
    pub train_steps: usize,
    pub validation_steps: usize,
    pub ref_passes: usize,
    pub batch_rows: Vec<usize>,
    pub batch_widths: Vec<usize>,
    pub batches_missing_ref: usize,
}

/// Policy whose training loss at step `n` (1-based) is `1 / n`. Validation
/// loses 0.5 per example, reduced over the unmasked ones.
pub struct ScriptedModel {
    pub log: Arc<Mutex<ModelLog>>,
    pub fail_on_step: Option<usize>,
}

impl ScriptedModel {
    pub fn new() -> (Self, Arc<Mutex<ModelLog>>) {
        let log = Arc::new(Mutex::new(ModelLog::default()));
        (Self { log: Arc::clone(&log), fail_on_step: None }, log)
    }
}

impl PolicyModel for ScriptedModel {
    fn prepare_for_training_step(&mut self) -> TrainingResult<()> {
        Ok(())
    }

    fn get_loss_and_metrics(
        &mut self,
        batch: &Batch,
        forward_only: bool,
    ) -> TrainingResult<(f64, Metrics)> {
        let mut log = self.log.lock().unwrap();
        if !batch.has_ref_log_probs() {
            log.batches_missing_ref += 1;
        }
        log.batch_rows.push(batch.model_rows());
        log.batch_widths.push(batch.seq_len());
        let loss = if forward_only {
            log.validation_steps += 1;
            let weights = batch.example_weights();
            masked_mean(Array1::from_elem(weights.len(), 0.5).view(), weights.view())
        } else {
            log.train_steps += 1;
            if self.fail_on_step == Some(log.train_steps) {
                return Err(TrainingError::Model("loss diverged".to_string()));
            }
            1.0 / log.train_steps as f64
        };
        let metrics = Metrics::from([("acc".to_string(), if forward_only { 0.75 } else { 0.5 })]);
        Ok((loss, metrics))
    }

    fn finish_training_step(&mut self) -> TrainingResult<()> {
        Ok(())
    }

    fn prepare_for_validation_step(&mut self) -> TrainingResult<()> {
        Ok(())
    }

    fn finish_validation_step(&mut self) -> TrainingResult<()> {
        Ok(())
    }

    fn get_ref_policy_logprobs(&mut self, batch: &Batch) -> TrainingResult<Array2<f32>> {
        self.log.lock().unwrap().ref_passes += 1;
        Ok(Array2::from_elem((batch.model_rows(), batch.seq_len()), -1.0))
    }

    fn clip_gradients(&mut self, max_norm: Option<f64>) -> TrainingResult<Option<f64>> {
        Ok(max_norm.map(|_| 2.5))
    }
}

#[derive(Debug, Default)]
pub struct OptimizerLog {
    pub zero_grads: usize,
    pub steps: usize,
    pub scheduler_steps: usize,
}

pub struct CountingOptimizer {
    pub log: Arc<Mutex<OptimizerLog>>,
    pub lr: f64,
}

impl Optimizer for CountingOptimizer {
    fn zero_grad(&mut self) {
        self.log.lock().unwrap().zero_grads += 1;
    }

    fn step(&mut self) -> TrainingResult<()> {
        self.log.lock().unwrap().steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }
}

pub struct CountingScheduler {
    pub log: Arc<Mutex<OptimizerLog>>,
}

impl LrScheduler for CountingScheduler {
    fn step(&mut self) {
        self.log.lock().unwrap().scheduler_steps += 1;
    }
}

#[derive(Debug, Default)]
pub struct LoggerLog {
    pub metrics: Vec<(String, u64, Metrics)>,
    pub hyperparams: Vec<serde_json::Value>,
    pub finalized: usize,
}

impl LoggerLog {
    pub fn with_prefix(&self, prefix: &str) -> Vec<(u64, Metrics)> {
        self.metrics
            .iter()
            .filter(|(p, _, _)| p == prefix)
            .map(|(_, s, m)| (*s, m.clone()))
            .collect()
    }
}

pub struct RecordingLogger {
    pub log: Arc<Mutex<LoggerLog>>,
}

impl MetricsLogger for RecordingLogger {
    fn log_metrics(&mut self, metrics: &Metrics, step: u64, prefix: &str) -> TrainingResult<()> {
        self.log.lock().unwrap().metrics.push((prefix.to_string(), step, metrics.clone()));
        Ok(())
    }

    fn log_hyperparams(&mut self, params: &serde_json::Value) -> TrainingResult<()> {
        self.log.lock().unwrap().hyperparams.push(params.clone());
        Ok(())
    }

    fn finalize(&mut self) -> TrainingResult<()> {
        self.log.lock().unwrap().finalized += 1;
        Ok(())
    }
}

pub struct RecordingSink {
    pub saves: Arc<Mutex<Vec<(SaveCandidates, bool)>>>,
}

impl CheckpointSink for RecordingSink {
    fn custom_save(
        &mut self,
        candidates: &SaveCandidates,
        is_train_end: bool,
    ) -> TrainingResult<()> {
        self.saves.lock().unwrap().push((candidates.clone(), is_train_end));
        Ok(())
    }
}

/// Reports the budget as spent on the `after`-th `is_finished` check.
/// The trainer checks once per optimizer step.
pub struct CountingTimer {
    after: usize,
    checks: Mutex<usize>,
    started: bool,
}

impl CountingTimer {
    pub fn finishing_after(after: usize) -> Self {
        Self { after, checks: Mutex::new(0), started: false }
    }
}

impl RunTimer for CountingTimer {
    fn start_time(&mut self) {
        self.started = true;
    }

    fn is_finished(&self) -> bool {
        let mut checks = self.checks.lock().unwrap();
        *checks += 1;
        self.started && *checks >= self.after
    }
}

/// `n` tokenized preference records whose lengths vary with the index.
pub fn preference_records(n: usize) -> Vec<PreferenceRecord> {
    (0..n)
        .map(|i| {
            let prompt: Vec<i64> = vec![10, 11, 12];
            let mut chosen = prompt.clone();
            chosen.extend((0..=(i % 5) as i64).map(|t| 100 + t));
            let mut rejected = prompt.clone();
            rejected.extend((0..=(i % 3) as i64).map(|t| 200 + t));
            PreferenceRecord::Tokenized {
                prompt_ids: prompt,
                chosen_ids: chosen,
                rejected_ids: rejected,
                chosen_reward: None,
                rejected_reward: None,
            }
        })
        .collect()
}

pub fn preference_store(name: &str, n: usize, data: &DataConfig) -> Arc<PreferenceDataset> {
    let records = DatasetRecords::Unpacked(preference_records(n));
    Arc::new(PreferenceDataset::new(name, records, data.clone(), None).unwrap())
}

#[derive(Debug)]
pub struct Harness {
    pub model: Arc<Mutex<ModelLog>>,
    pub optimizer: Arc<Mutex<OptimizerLog>>,
    pub logger: Arc<Mutex<LoggerLog>>,
    pub saves: Arc<Mutex<Vec<(SaveCandidates, bool)>>>,
}

pub struct HarnessOptions {
    pub train_examples: usize,
    pub val_examples: usize,
    pub sampler: SamplerConfig,
    pub data: DataConfig,
    /// `None` lets the trainer build its timer from `max_time_per_run`.
    pub timer: Option<Box<dyn RunTimer>>,
    pub comm: Arc<dyn Communicator>,
    pub fail_on_step: Option<usize>,
    /// Replaces the recording sink when set.
    pub checkpoint: Option<Box<dyn CheckpointSink>>,
    /// Replaces the recording logger when set.
    pub logger: Option<Box<dyn MetricsLogger>>,
    /// Global batch size for both loaders, `config.global_batch_size` when unset.
    pub loader_batch_size: Option<u64>,
    /// Replaces the generated validation records when set.
    pub val_records: Option<Vec<PreferenceRecord>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            train_examples: 16,
            val_examples: 8,
            sampler: SamplerConfig { kind: SamplerKind::Random, seed: 3, ..Default::default() },
            data: DataConfig::new(2, 64),
            timer: None,
            comm: Arc::new(SingleProcess),
            fail_on_step: None,
            checkpoint: None,
            logger: None,
            loader_batch_size: None,
            val_records: None,
        }
    }
}

pub fn build_trainer(
    config: TrainerConfig,
    options: HarnessOptions,
) -> TrainingResult<(DpoTrainer<ScriptedModel>, Harness)> {
    let (mut model, model_log) = ScriptedModel::new();
    model.fail_on_step = options.fail_on_step;
    let optimizer_log = Arc::new(Mutex::new(OptimizerLog::default()));
    let logger_log = Arc::new(Mutex::new(LoggerLog::default()));
    let saves = Arc::new(Mutex::new(Vec::new()));

    let train = preference_store("train", options.train_examples, &options.data);
    let val = match options.val_records {
        Some(records) => Arc::new(PreferenceDataset::new(
            "val",
            DatasetRecords::Unpacked(records),
            options.data.clone(),
            None,
        )?),
        None => preference_store("val", options.val_examples, &options.data),
    };
    let loader_batch_size = options.loader_batch_size.unwrap_or(config.global_batch_size);
    let val_sampler = SamplerConfig { kind: SamplerKind::Sequential, ..options.sampler.clone() };

    let components = TrainerComponents {
        model,
        optimizer: Box::new(CountingOptimizer { log: Arc::clone(&optimizer_log), lr: 1e-6 }),
        scheduler: Box::new(CountingScheduler { log: Arc::clone(&optimizer_log) }),
        train_loader: Box::new(DataLoader::new(train, loader_batch_size, options.sampler)?),
        val_loader: Box::new(DataLoader::new(val, loader_batch_size, val_sampler)?),
        collator: Collator::new(options.data, options.comm)?,
        logger: options
            .logger
            .unwrap_or_else(|| Box::new(RecordingLogger { log: Arc::clone(&logger_log) })),
        checkpoint: options
            .checkpoint
            .unwrap_or_else(|| Box::new(RecordingSink { saves: Arc::clone(&saves) })),
        run_timer: options.timer,
    };
    let trainer = DpoTrainer::new(config, components)?;
    Ok((trainer, Harness { model: model_log, optimizer: optimizer_log, logger: logger_log, saves }))
}
