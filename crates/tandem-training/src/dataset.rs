//! Preference example store.
//!
//! Raw JSONL records are turned into model-ready examples one index at a time.
//! The set of dataset shapes is closed ([`DatasetKind`]); each shape keeps its
//! own record type and shares [`ExampleStore::produce_example`].

use crate::config::{DataConfig, DatasetKind, OnPaddingIndex};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub type TokenId = i64;

/// Label value excluded from every loss.
pub const IGNORE_INDEX: TokenId = -100;

/// Text-to-id encoder supplied by the model side.
pub trait Tokenizer: Send + Sync {
    fn text_to_ids(&self, text: &str) -> Vec<TokenId>;
}

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Position handed out by a batch sampler. `Padding` fills out a short final batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleIndex {
    Item(usize),
    Padding,
}

/// Prompt plus two full continuations. Both continuations start with the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceExample {
    pub prompt_ids: Vec<TokenId>,
    pub chosen_ids: Vec<TokenId>,
    pub rejected_ids: Vec<TokenId>,
    pub chosen_reward: Option<f64>,
    pub rejected_reward: Option<f64>,
}

impl PreferenceExample {
    /// Reject examples whose tokenizer merged tokens across the prompt/response boundary.
    pub fn validate_prefix(&self) -> TrainingResult<()> {
        let p = self.prompt_ids.len();
        for (name, ids) in [("chosen", &self.chosen_ids), ("rejected", &self.rejected_ids)] {
            if ids.len() < p || ids[..p] != self.prompt_ids[..] {
                return Err(TrainingError::DataIntegrity(format!(
                    "{name} sequence does not start with the prompt tokens (prompt length {p}); \
                     the tokenizer merged tokens between prompt and response"
                )));
            }
        }
        Ok(())
    }
}

/// Token ids with same-length labels. Prompt positions carry [`IGNORE_INDEX`].
///
/// Labels are aligned with `tokens`; the next-token shift is applied by the
/// consumer (the model for unpacked batches, the collator for packed rows).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledSequence {
    pub tokens: Vec<TokenId>,
    pub labels: Vec<TokenId>,
}

impl LabeledSequence {
    pub fn from_prompt_split(ids: &[TokenId], prompt_len: usize) -> Self {
        let prompt_len = prompt_len.min(ids.len());
        let mut labels = vec![IGNORE_INDEX; prompt_len];
        labels.extend_from_slice(&ids[prompt_len..]);
        Self { tokens: ids.to_vec(), labels }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn pad_to(&mut self, len: usize, pad_id: TokenId) {
        if self.tokens.len() < len {
            self.tokens.resize(len, pad_id);
            self.labels.resize(len, IGNORE_INDEX);
        }
    }

    fn truncate_masked(&mut self, len: usize) {
        self.tokens.truncate(len);
        self.labels = vec![IGNORE_INDEX; self.tokens.len()];
    }

    fn mask_all(&mut self) {
        self.labels.iter_mut().for_each(|l| *l = IGNORE_INDEX);
    }
}

/// One preference example ready for the unpacked collator.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledPair {
    pub chosen: LabeledSequence,
    pub rejected: LabeledSequence,
    pub chosen_length: usize,
    pub rejected_length: usize,
    pub chosen_reward: f64,
    pub rejected_reward: f64,
    /// Stand-in for an example that must not contribute to the loss.
    pub ignore_example: bool,
}

/// Several examples pre-packed into one row with segment boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedRecord {
    pub input_ids: Vec<TokenId>,
    pub labels: Vec<TokenId>,
    pub seq_boundaries: Vec<usize>,
    pub lengths: Vec<i64>,
    pub reward: Vec<f64>,
}

impl PackedRecord {
    pub fn num_segments(&self) -> usize {
        self.seq_boundaries.len().saturating_sub(1)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.labels.len() != self.input_ids.len() {
            return Err(TrainingError::DataIntegrity(format!(
                "packed record has {} labels for {} input ids",
                self.labels.len(),
                self.input_ids.len()
            )));
        }
        match (self.seq_boundaries.first(), self.seq_boundaries.last()) {
            (Some(0), Some(&last))
                if self.seq_boundaries.len() >= 2 && last == self.input_ids.len() => {}
            _ => {
                return Err(TrainingError::DataIntegrity(format!(
                    "packed record boundaries {:?} must start at 0 and end at {}",
                    self.seq_boundaries,
                    self.input_ids.len()
                )));
            }
        }
        // each segment needs at least one input and one label position
        if self.seq_boundaries.windows(2).any(|w| w[1] < w[0] + 2) {
            return Err(TrainingError::DataIntegrity(format!(
                "packed record boundaries {:?} must increase with segments of length >= 2",
                self.seq_boundaries
            )));
        }
        let segments = self.num_segments();
        if self.lengths.len() != segments || self.reward.len() != segments {
            return Err(TrainingError::DataIntegrity(format!(
                "packed record has {segments} segments but {} lengths and {} rewards",
                self.lengths.len(),
                self.reward.len()
            )));
        }
        Ok(())
    }
}

/// Single sequence with a vector of regression targets.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionSample {
    /// Padded to the model sequence length with EOS.
    pub tokens: Vec<TokenId>,
    pub length: usize,
    pub label: Vec<f64>,
    pub loss_masked: bool,
}

/// Single prompt/response with a binary desirability signal.
#[derive(Debug, Clone, PartialEq)]
pub struct KtoSample {
    pub prompt_ids: Vec<TokenId>,
    pub response_ids: Vec<TokenId>,
    pub labels: Vec<TokenId>,
    pub sample_length: usize,
    pub preference: KtoPreference,
    pub ignore_example: bool,
}

/// What a store hands back for one index.
#[derive(Debug, Clone, PartialEq)]
pub enum Example {
    Pair(LabeledPair),
    Packed(PackedRecord),
    Regression(RegressionSample),
    Kto(KtoSample),
}

/// Indexed source of examples.
pub trait ExampleStore: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn produce_example(&self, index: SampleIndex) -> TrainingResult<Example>;
}

/// Either raw text or already-tokenized ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceField {
    Ids(Vec<TokenId>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceRecord {
    /// Full sequences; chosen and rejected include the prompt.
    Tokenized {
        prompt_ids: Vec<TokenId>,
        chosen_ids: Vec<TokenId>,
        rejected_ids: Vec<TokenId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chosen_reward: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejected_reward: Option<f64>,
    },
    /// Responses exclude the prompt; they are joined before tokenization.
    Text {
        prompt: String,
        chosen_response: String,
        rejected_response: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chosen_reward: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejected_reward: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub text: SequenceField,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionRecord {
    pub text: SequenceField,
    pub label: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KtoPreference {
    Chosen,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KtoRecord {
    pub prompt: String,
    pub response: String,
    pub preference: KtoPreference,
}

/// Records of one dataset shape.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetRecords {
    Unpacked(Vec<PreferenceRecord>),
    Packed(Vec<PackedRecord>),
    /// Consecutive records form a pair: even index chosen, odd index rejected.
    RewardPair(Vec<SequenceRecord>),
    Regression(Vec<RegressionRecord>),
    Kto(Vec<KtoRecord>),
}

impl DatasetRecords {
    pub fn kind(&self) -> DatasetKind {
        match self {
            Self::Unpacked(_) => DatasetKind::Unpacked,
            Self::Packed(_) => DatasetKind::Packed,
            Self::RewardPair(_) => DatasetKind::RewardPair,
            Self::Regression(_) => DatasetKind::Regression,
            Self::Kto(_) => DatasetKind::Kto,
        }
    }

    fn raw_len(&self) -> usize {
        match self {
            Self::Unpacked(r) => r.len(),
            Self::Packed(r) => r.len(),
            Self::RewardPair(r) => r.len(),
            Self::Regression(r) => r.len(),
            Self::Kto(r) => r.len(),
        }
    }

    /// Parse JSONL content, one record of `kind` per non-empty line.
    pub fn parse_jsonl(content: &str, kind: DatasetKind) -> TrainingResult<Self> {
        fn parse_lines<T: serde::de::DeserializeOwned>(content: &str) -> TrainingResult<Vec<T>> {
            let mut out = Vec::new();
            for (idx, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let record = serde_json::from_str(line).map_err(|e| {
                    TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
                })?;
                out.push(record);
            }
            Ok(out)
        }

        Ok(match kind {
            DatasetKind::Unpacked => Self::Unpacked(parse_lines(content)?),
            DatasetKind::Packed => Self::Packed(parse_lines(content)?),
            DatasetKind::RewardPair => Self::RewardPair(parse_lines(content)?),
            DatasetKind::Regression => Self::Regression(parse_lines(content)?),
            DatasetKind::Kto => Self::Kto(parse_lines(content)?),
        })
    }

    /// SHA-256 over the canonical JSON of every record.
    pub fn fingerprint(&self) -> TrainingResult<DatasetId> {
        fn hash_all<T: Serialize>(hasher: &mut Sha256, records: &[T]) -> TrainingResult<()> {
            for record in records {
                hasher.update(serde_json::to_vec(record)?);
                hasher.update(b"\n");
            }
            Ok(())
        }

        let mut hasher = Sha256::new();
        match self {
            Self::Unpacked(r) => hash_all(&mut hasher, r)?,
            Self::Packed(r) => hash_all(&mut hasher, r)?,
            Self::RewardPair(r) => hash_all(&mut hasher, r)?,
            Self::Regression(r) => hash_all(&mut hasher, r)?,
            Self::Kto(r) => hash_all(&mut hasher, r)?,
        }
        Ok(DatasetId(hex::encode(hasher.finalize())))
    }
}

/// Clean up text before tokenization.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{feff}', "")
        .replace('\u{a0}', " ")
}

/// Dataset backed by in-memory records of one [`DatasetKind`].
pub struct PreferenceDataset {
    name: String,
    records: DatasetRecords,
    config: DataConfig,
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl std::fmt::Debug for PreferenceDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceDataset")
            .field("name", &self.name)
            .field("kind", &self.records.kind())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl PreferenceDataset {
    pub fn new(
        name: impl Into<String>,
        records: DatasetRecords,
        config: DataConfig,
        tokenizer: Option<Arc<dyn Tokenizer>>,
    ) -> TrainingResult<Self> {
        config.validate()?;
        if records.kind() != config.variant {
            return Err(TrainingError::Configuration(format!(
                "dataset records are {:?} but data.variant is {:?}",
                records.kind(),
                config.variant
            )));
        }
        Ok(Self { name: name.into(), records, config, tokenizer })
    }

    pub fn from_jsonl(
        name: impl Into<String>,
        path: &Path,
        config: DataConfig,
        tokenizer: Option<Arc<dyn Tokenizer>>,
    ) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let records = DatasetRecords::parse_jsonl(&content, config.variant)?;
        Self::new(name, records, config, tokenizer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DatasetKind {
        self.records.kind()
    }

    pub fn records(&self) -> &DatasetRecords {
        &self.records
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    fn encode_text(&self, text: &str, append_eos: bool) -> TrainingResult<Vec<TokenId>> {
        let tokenizer = self.tokenizer.as_ref().ok_or_else(|| {
            TrainingError::Dataset(format!(
                "dataset '{}' holds text records but has no tokenizer",
                self.name
            ))
        })?;
        let mut ids = if self.config.apply_text_normalization {
            tokenizer.text_to_ids(&normalize_text(text))
        } else {
            tokenizer.text_to_ids(text)
        };
        if append_eos && !ids.is_empty() {
            ids.push(self.config.eos_id);
        }
        Ok(ids)
    }

    fn encode_field(&self, field: &SequenceField) -> TrainingResult<Vec<TokenId>> {
        match field {
            SequenceField::Ids(ids) => Ok(ids.clone()),
            SequenceField::Text(text) => self.encode_text(text, self.config.append_eos),
        }
    }

    /// Length a stand-in sequence is cut to; never longer than the model accepts.
    fn nograd_length(&self) -> usize {
        self.config.nograd_length.min(self.config.seq_length)
    }

    fn resolve_index(&self, index: SampleIndex) -> TrainingResult<(usize, bool)> {
        if self.is_empty() {
            return Err(TrainingError::Dataset(format!("dataset '{}' is empty", self.name)));
        }
        match index {
            SampleIndex::Item(i) if i < self.len() => Ok((i, false)),
            SampleIndex::Item(i) => Err(TrainingError::Dataset(format!(
                "index {i} out of range for dataset '{}' of length {}",
                self.name,
                self.len()
            ))),
            SampleIndex::Padding => match self.config.padding_policy() {
                OnPaddingIndex::Reject => {
                    Err(TrainingError::PaddingIndexRejected { dataset: self.name.clone() })
                }
                OnPaddingIndex::MaskLoss => {
                    warn!(dataset = %self.name, "padding sample index, masking its loss");
                    Ok((0, true))
                }
            },
        }
    }

    fn produce_pair(
        &self,
        records: &[PreferenceRecord],
        idx: usize,
    ) -> TrainingResult<LabeledPair> {
        let append_eos = self.config.append_eos;
        let example = match &records[idx] {
            PreferenceRecord::Tokenized {
                prompt_ids,
                chosen_ids,
                rejected_ids,
                chosen_reward,
                rejected_reward,
            } => PreferenceExample {
                prompt_ids: prompt_ids.clone(),
                chosen_ids: chosen_ids.clone(),
                rejected_ids: rejected_ids.clone(),
                chosen_reward: *chosen_reward,
                rejected_reward: *rejected_reward,
            },
            PreferenceRecord::Text {
                prompt,
                chosen_response,
                rejected_response,
                chosen_reward,
                rejected_reward,
            } => PreferenceExample {
                prompt_ids: self.encode_text(prompt, false)?,
                chosen_ids: self.encode_text(&format!("{prompt}{chosen_response}"), append_eos)?,
                rejected_ids: self
                    .encode_text(&format!("{prompt}{rejected_response}"), append_eos)?,
                chosen_reward: *chosen_reward,
                rejected_reward: *rejected_reward,
            },
        };
        example.validate_prefix().map_err(|e| match e {
            TrainingError::DataIntegrity(msg) => TrainingError::DataIntegrity(format!(
                "dataset '{}' example {idx}: {msg}",
                self.name
            )),
            other => other,
        })?;

        let prompt_len = example.prompt_ids.len();
        let mut chosen = LabeledSequence::from_prompt_split(&example.chosen_ids, prompt_len);
        let mut rejected = LabeledSequence::from_prompt_split(&example.rejected_ids, prompt_len);
        let mut chosen_length = chosen.len();
        let mut rejected_length = rejected.len();

        let max_len = chosen_length.max(rejected_length);
        chosen.pad_to(max_len, self.config.eos_id);
        rejected.pad_to(max_len, self.config.eos_id);

        let mut ignore_example = false;
        if max_len > self.config.seq_length {
            warn!(
                dataset = %self.name,
                index = idx,
                length = max_len,
                max = self.config.seq_length,
                "tokenized example exceeds max sequence length, it will be ignored"
            );
            let nograd = self.nograd_length();
            chosen.truncate_masked(nograd);
            rejected.truncate_masked(nograd);
            chosen_length = chosen.len();
            rejected_length = rejected.len();
            ignore_example = true;
        }

        Ok(LabeledPair {
            chosen,
            rejected,
            chosen_length,
            rejected_length,
            chosen_reward: example.chosen_reward.unwrap_or(self.config.default_chosen_reward),
            rejected_reward: example.rejected_reward.unwrap_or(self.config.default_rejected_reward),
            ignore_example,
        })
    }

    fn produce_reward_pair(
        &self,
        records: &[SequenceRecord],
        idx: usize,
    ) -> TrainingResult<LabeledPair> {
        let pairs = records.len() / 2;
        let mut current = idx;
        let (chosen, rejected) = loop {
            let chosen = self.encode_field(&records[2 * current].text)?;
            let rejected = self.encode_field(&records[2 * current + 1].text)?;
            if chosen.len() <= self.config.seq_length && rejected.len() <= self.config.seq_length {
                break (chosen, rejected);
            }
            current = (current + 1) % pairs;
            if current == idx {
                return Err(TrainingError::Dataset(format!(
                    "every pair in dataset '{}' exceeds {} tokens",
                    self.name, self.config.seq_length
                )));
            }
        };
        if current != idx {
            warn!(
                dataset = %self.name,
                index = idx,
                replacement = current,
                "overlength pair skipped"
            );
        }

        let mut chosen_seq = LabeledSequence::from_prompt_split(&chosen, 0);
        let mut rejected_seq = LabeledSequence::from_prompt_split(&rejected, 0);
        chosen_seq.pad_to(self.config.seq_length, self.config.eos_id);
        rejected_seq.pad_to(self.config.seq_length, self.config.eos_id);

        Ok(LabeledPair {
            chosen: chosen_seq,
            rejected: rejected_seq,
            chosen_length: chosen.len(),
            rejected_length: rejected.len(),
            chosen_reward: self.config.default_chosen_reward,
            rejected_reward: self.config.default_rejected_reward,
            ignore_example: false,
        })
    }

    fn produce_regression(
        &self,
        records: &[RegressionRecord],
        idx: usize,
    ) -> TrainingResult<RegressionSample> {
        let mut current = idx;
        let (tokens, label) = loop {
            let record = &records[current];
            let tokens = self.encode_field(&record.text)?;
            if tokens.len() <= self.config.seq_length {
                break (tokens, record.label.clone());
            }
            current = (current + 1) % records.len();
            if current == idx {
                return Err(TrainingError::Dataset(format!(
                    "all samples in dataset '{}' have length > {}",
                    self.name, self.config.seq_length
                )));
            }
        };
        if label.is_empty() {
            return Err(TrainingError::Dataset(format!(
                "regression sample {current} in dataset '{}' has no label values",
                self.name
            )));
        }
        let loss_masked = current != idx;
        if loss_masked {
            warn!(
                dataset = %self.name,
                index = idx,
                replacement = current,
                "sample exceeds max sequence length, replacing it and masking its loss"
            );
        }

        let length = tokens.len();
        let mut padded = tokens;
        padded.resize(self.config.seq_length, self.config.eos_id);
        Ok(RegressionSample { tokens: padded, length, label, loss_masked })
    }

    fn produce_kto(&self, records: &[KtoRecord], idx: usize) -> TrainingResult<KtoSample> {
        let record = &records[idx];
        let mut prompt = self.encode_text(&record.prompt, false)?;
        let full_text = format!("{}{}", record.prompt, record.response);
        let mut sample = self.encode_text(&full_text, self.config.append_eos)?;
        if sample.len() < prompt.len() || sample[..prompt.len()] != prompt[..] {
            return Err(TrainingError::DataIntegrity(format!(
                "dataset '{}' example {idx}: tokenizer merged prompt and response tokens",
                self.name
            )));
        }

        let mut prompt_len = prompt.len();
        let mut labels = LabeledSequence::from_prompt_split(&sample, prompt_len).labels;
        let mut ignore_example = false;
        if sample.len() > self.config.seq_length {
            warn!(
                dataset = %self.name,
                index = idx,
                length = sample.len(),
                max = self.config.seq_length,
                "tokenized example exceeds max sequence length, it will be ignored"
            );
            let nograd = self.nograd_length();
            sample.truncate(nograd);
            prompt_len = (nograd / 2).min(sample.len());
            prompt = sample[..prompt_len].to_vec();
            labels = vec![IGNORE_INDEX; sample.len()];
            ignore_example = true;
        }

        Ok(KtoSample {
            response_ids: sample[prompt_len..].to_vec(),
            prompt_ids: prompt,
            labels,
            sample_length: sample.len(),
            preference: record.preference,
            ignore_example,
        })
    }
}

impl ExampleStore for PreferenceDataset {
    fn len(&self) -> usize {
        match &self.records {
            DatasetRecords::RewardPair(r) => r.len() / 2,
            other => other.raw_len(),
        }
    }

    fn produce_example(&self, index: SampleIndex) -> TrainingResult<Example> {
        let (idx, masked) = self.resolve_index(index)?;
        let mut example = match &self.records {
            DatasetRecords::Unpacked(records) => Example::Pair(self.produce_pair(records, idx)?),
            DatasetRecords::Packed(records) => {
                let record = records[idx].clone();
                record.validate()?;
                Example::Packed(record)
            }
            DatasetRecords::RewardPair(records) => {
                Example::Pair(self.produce_reward_pair(records, idx)?)
            }
            DatasetRecords::Regression(records) => {
                Example::Regression(self.produce_regression(records, idx)?)
            }
            DatasetRecords::Kto(records) => Example::Kto(self.produce_kto(records, idx)?),
        };
        if masked {
            mask_example(&mut example);
        }
        Ok(example)
    }
}

fn mask_example(example: &mut Example) {
    match example {
        Example::Pair(pair) => {
            pair.chosen.mask_all();
            pair.rejected.mask_all();
            pair.ignore_example = true;
        }
        Example::Packed(record) => record.labels.iter_mut().for_each(|l| *l = IGNORE_INDEX),
        Example::Regression(sample) => sample.loss_masked = true,
        Example::Kto(sample) => {
            sample.labels.iter_mut().for_each(|l| *l = IGNORE_INDEX);
            sample.ignore_example = true;
        }
    }
}
