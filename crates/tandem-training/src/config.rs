//! Run configuration.
//!
//! Every knob the pipeline reads is enumerated here once and validated when the
//! configuration is built. Nothing downstream looks up optional keys ad hoc.

use crate::dataset::TokenId;
use crate::error::{TrainingError, TrainingResult};
use crate::timer::parse_time_limit;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Cap on the number of batches taken from a dataloader per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchLimit {
    /// Absolute number of batches.
    Count(u64),
    /// Fraction of the available batches, in `[0, 1]`.
    Fraction(f64),
}

impl BatchLimit {
    pub const fn full() -> Self {
        Self::Fraction(1.0)
    }

    fn validate(&self, field: &str) -> TrainingResult<()> {
        if let Self::Fraction(f) = self {
            if !f.is_finite() || !(0.0..=1.0).contains(f) {
                return Err(TrainingError::Configuration(format!(
                    "{field} fraction must be within [0, 1], got {f}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for BatchLimit {
    fn default() -> Self {
        Self::full()
    }
}

/// How often validation runs, in optimizer steps or as a fraction of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValCheckInterval {
    Steps(u64),
    Fraction(f64),
}

impl Default for ValCheckInterval {
    fn default() -> Self {
        Self::Fraction(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: u64,
    /// Negative means "derive from epochs only".
    #[serde(default = "default_max_steps")]
    pub max_steps: i64,
    #[serde(default)]
    pub val_check_interval: ValCheckInterval,
    /// Zero disables periodic saving.
    #[serde(default)]
    pub save_interval: u64,
    #[serde(default)]
    pub limit_train_batches: BatchLimit,
    #[serde(default)]
    pub limit_val_batches: BatchLimit,
    /// Zero disables clipping.
    #[serde(default)]
    pub gradient_clip_val: f64,
    /// Examples consumed fleet-wide per optimizer step.
    pub global_batch_size: u64,
    /// Wall-clock budget formatted as `DD:HH:MM:SS`.
    #[serde(default)]
    pub max_time_per_run: Option<String>,
}

fn default_max_epochs() -> u64 {
    1
}

fn default_max_steps() -> i64 {
    -1
}

impl TrainerConfig {
    #[must_use]
    pub fn new(global_batch_size: u64) -> Self {
        Self {
            max_epochs: default_max_epochs(),
            max_steps: default_max_steps(),
            val_check_interval: ValCheckInterval::default(),
            save_interval: 0,
            limit_train_batches: BatchLimit::full(),
            limit_val_batches: BatchLimit::full(),
            gradient_clip_val: 0.0,
            global_batch_size,
            max_time_per_run: None,
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.global_batch_size == 0 {
            return Err(TrainingError::Configuration("global_batch_size must be >= 1".to_string()));
        }
        if self.max_epochs == 0 {
            return Err(TrainingError::Configuration("max_epochs must be >= 1".to_string()));
        }
        self.limit_train_batches.validate("limit_train_batches")?;
        self.limit_val_batches.validate("limit_val_batches")?;
        if let ValCheckInterval::Fraction(f) = self.val_check_interval {
            if !f.is_finite() || !(0.0..=1.0).contains(&f) {
                return Err(TrainingError::Configuration(format!(
                    "val_check_interval fraction must be within [0, 1], got {f}"
                )));
            }
        }
        if !self.gradient_clip_val.is_finite() || self.gradient_clip_val < 0.0 {
            return Err(TrainingError::Configuration(format!(
                "gradient_clip_val must be >= 0, got {}",
                self.gradient_clip_val
            )));
        }
        if let Some(limit) = &self.max_time_per_run {
            parse_time_limit(limit)?;
        }
        Ok(())
    }

    /// Clip threshold handed to the model, `None` when clipping is disabled.
    pub fn clip_threshold(&self) -> Option<f64> {
        (self.gradient_clip_val > 0.0).then_some(self.gradient_clip_val)
    }
}

/// The closed set of dataset shapes the store can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    #[default]
    Unpacked,
    Packed,
    RewardPair,
    Regression,
    Kto,
}

/// What a dataset does when the sampler hands it a padding index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnPaddingIndex {
    Reject,
    MaskLoss,
}

impl DatasetKind {
    /// Padding-index behaviour each variant had before the policy was configurable.
    pub fn default_padding_policy(self) -> OnPaddingIndex {
        match self {
            Self::RewardPair | Self::Regression => OnPaddingIndex::MaskLoss,
            Self::Unpacked | Self::Packed | Self::Kto => OnPaddingIndex::Reject,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub variant: DatasetKind,
    pub eos_id: TokenId,
    /// Model maximum sequence length.
    pub seq_length: usize,
    #[serde(default)]
    pub apply_text_normalization: bool,
    #[serde(default)]
    pub append_eos: bool,
    /// Pad batch length to a multiple agreed across data-parallel workers. `0` disables.
    #[serde(default)]
    pub pad_multiple: Option<i64>,
    #[serde(default = "default_chosen_reward")]
    pub default_chosen_reward: f64,
    #[serde(default)]
    pub default_rejected_reward: f64,
    #[serde(default)]
    pub reset_position_ids: bool,
    #[serde(default)]
    pub reset_attention_mask: bool,
    #[serde(default)]
    pub mask_eos_loss: bool,
    #[serde(default)]
    pub on_padding_index: Option<OnPaddingIndex>,
    /// Length of the stand-in sequence used for overlength examples.
    #[serde(default = "default_nograd_length")]
    pub nograd_length: usize,
}

fn default_chosen_reward() -> f64 {
    1.0
}

fn default_nograd_length() -> usize {
    32
}

impl DataConfig {
    #[must_use]
    pub fn new(eos_id: TokenId, seq_length: usize) -> Self {
        Self {
            variant: DatasetKind::default(),
            eos_id,
            seq_length,
            apply_text_normalization: false,
            append_eos: false,
            pad_multiple: None,
            default_chosen_reward: default_chosen_reward(),
            default_rejected_reward: 0.0,
            reset_position_ids: false,
            reset_attention_mask: false,
            mask_eos_loss: false,
            on_padding_index: None,
            nograd_length: default_nograd_length(),
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if let Some(m) = self.pad_multiple {
            if m < 0 {
                return Err(TrainingError::Configuration(format!("pad_multiple={m} must be >= 0")));
            }
        }
        if self.seq_length == 0 {
            return Err(TrainingError::Configuration("seq_length must be >= 1".to_string()));
        }
        if self.nograd_length == 0 {
            return Err(TrainingError::Configuration("nograd_length must be >= 1".to_string()));
        }
        if !self.default_chosen_reward.is_finite() || !self.default_rejected_reward.is_finite() {
            return Err(TrainingError::Configuration("default rewards must be finite".to_string()));
        }
        Ok(())
    }

    pub fn pad_multiple(&self) -> Option<usize> {
        match self.pad_multiple {
            Some(m) if m > 0 => usize::try_from(m).ok(),
            _ => None,
        }
    }

    pub fn padding_policy(&self) -> OnPaddingIndex {
        self.on_padding_index.unwrap_or_else(|| self.variant.default_padding_policy())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    /// Same order every epoch.
    Sequential,
    /// Reshuffled every epoch from `seed + epoch`.
    #[default]
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default)]
    pub kind: SamplerKind,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub drop_last: bool,
    #[serde(default)]
    pub pad_samples_to_global_batch_size: bool,
    #[serde(default = "default_data_parallel_size")]
    pub data_parallel_size: usize,
    #[serde(default)]
    pub data_parallel_rank: usize,
}

fn default_true() -> bool {
    true
}

fn default_data_parallel_size() -> usize {
    1
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kind: SamplerKind::default(),
            seed: 0,
            drop_last: true,
            pad_samples_to_global_batch_size: false,
            data_parallel_size: default_data_parallel_size(),
            data_parallel_rank: 0,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self, global_batch_size: u64) -> TrainingResult<()> {
        if self.data_parallel_size == 0 {
            return Err(TrainingError::Configuration("data_parallel_size must be >= 1".to_string()));
        }
        if self.data_parallel_rank >= self.data_parallel_size {
            return Err(TrainingError::Configuration(format!(
                "data_parallel_rank {} out of range for data_parallel_size {}",
                self.data_parallel_rank, self.data_parallel_size
            )));
        }
        if global_batch_size % self.data_parallel_size as u64 != 0 {
            return Err(TrainingError::Configuration(format!(
                "global_batch_size {global_batch_size} is not divisible by data_parallel_size {}",
                self.data_parallel_size
            )));
        }
        let pads_partial_batch = self.drop_last || self.pad_samples_to_global_batch_size;
        if !pads_partial_batch && self.data_parallel_size > 1 {
            return Err(TrainingError::Configuration(
                "a partial final batch cannot be split across data-parallel ranks; \
                 set drop_last or pad_samples_to_global_batch_size"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Root configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub trainer: TrainerConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
}

impl RunConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> TrainingResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        if !path.exists() {
            return Err(TrainingError::Configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        self.trainer.validate()?;
        self.data.validate()?;
        self.sampler.validate(self.trainer.global_batch_size)?;
        Ok(())
    }
}
