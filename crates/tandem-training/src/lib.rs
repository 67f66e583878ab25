//! Tandem Training
//!
//! Preference-pair training orchestration for data-parallel workers:
//! - Turning preference records into labeled examples (`PreferenceDataset`)
//! - Sampling and collating them into padded or packed batches (`DataLoader`, `Collator`)
//! - Attaching reference-policy log-probabilities (`RefPolicyAugmenter`)
//! - Driving the step / validate / save loop (`DpoTrainer`)

pub mod augment;
pub mod batch;
pub mod checkpoint;
pub mod collate;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod layout;
pub mod logger;
pub mod masks;
pub mod model;
pub mod progress;
pub mod sampler;
pub mod timer;
pub mod trainer;

pub use augment::RefPolicyAugmenter;
pub use batch::{Batch, KtoBatch, PackedBatch, PairBatch, RegressionBatch, masked_mean};
pub use checkpoint::{
    CheckpointSink, JsonStateSink, SaveCandidates, TrainerState, TrainerStateSnapshot,
    load_latest_state,
};
pub use collate::Collator;
pub use config::{
    BatchLimit, DataConfig, DatasetKind, OnPaddingIndex, RunConfig, SamplerConfig, SamplerKind,
    TrainerConfig, ValCheckInterval,
};
pub use dataset::{
    DatasetId, DatasetRecords, Example, ExampleStore, IGNORE_INDEX, PreferenceDataset,
    PreferenceExample, PreferenceRecord, SampleIndex, TokenId, Tokenizer, normalize_text,
};
pub use distributed::{Communicator, LocalGroup, SingleProcess};
pub use error::{TrainingError, TrainingResult};
pub use layout::{RunId, RunLayout};
pub use logger::{FanoutLogger, JsonlMetricsLogger, Metrics, MetricsLogger, TracingMetricsLogger};
pub use masks::{LtorMasks, MaskOptions, ltor_masks_and_position_ids};
pub use model::{LrScheduler, Optimizer, PolicyModel};
pub use progress::{
    ProgressCheck, ProgressPlan, check_progress, compute_limit_batches, max_steps, steps_per_epoch,
};
pub use sampler::{BatchSource, DataLoader, ExampleBatches, GlobalBatchSampler};
pub use timer::{RunTimer, StepTimer, WallClockTimer, parse_time_limit};
pub use trainer::{DpoTrainer, FitSummary, StopReason, TrainerComponents, TrainerPhase};
