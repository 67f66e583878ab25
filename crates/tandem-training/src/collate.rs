//! Turns produced examples into padded batches.
//!
//! Pad-to-multiple agrees on the batch length with every data-parallel worker,
//! so `collate` is a collective call when a multiple is configured: every rank
//! must collate the same number of batches in the same order.

use crate::batch::{Batch, KtoBatch, PackedBatch, PairBatch, RegressionBatch};
use crate::config::DataConfig;
use crate::dataset::{
    Example, IGNORE_INDEX, KtoPreference, KtoSample, LabeledPair, PackedRecord, RegressionSample,
    TokenId,
};
use crate::distributed::Communicator;
use crate::error::{TrainingError, TrainingResult};
use crate::masks::{LtorMasks, MaskOptions, ltor_masks_and_position_ids};
use ndarray::{Array1, Array2, Array4};
use std::sync::Arc;
use tracing::trace;

/// Packed rows without a configured multiple are rounded up to this.
const PACKED_LENGTH_GRANULARITY: usize = 16;

#[derive(Clone)]
pub struct Collator {
    config: DataConfig,
    comm: Arc<dyn Communicator>,
}

impl std::fmt::Debug for Collator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collator")
            .field("config", &self.config)
            .field("rank", &self.comm.rank())
            .finish()
    }
}

fn ceil_to(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

fn pad_rows<T: Copy>(rows: &[&[T]], width: usize, pad: T) -> Array2<T> {
    Array2::from_shape_fn((rows.len(), width), |(r, c)| rows[r].get(c).copied().unwrap_or(pad))
}

fn as_rows<T>(rows: &[Vec<T>]) -> Vec<&[T]> {
    rows.iter().map(Vec::as_slice).collect()
}

fn to_i32(value: usize, what: &str) -> TrainingResult<i32> {
    i32::try_from(value)
        .map_err(|_| TrainingError::DataIntegrity(format!("{what} {value} does not fit in i32")))
}

fn loss_weight(masked: bool) -> f64 {
    if masked { 0.0 } else { 1.0 }
}

impl Collator {
    pub fn new(config: DataConfig, comm: Arc<dyn Communicator>) -> TrainingResult<Self> {
        config.validate()?;
        Ok(Self { config, comm })
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    fn mask_options(&self) -> MaskOptions {
        MaskOptions {
            reset_position_ids: self.config.reset_position_ids,
            reset_attention_mask: self.config.reset_attention_mask,
            mask_eos_loss: self.config.mask_eos_loss,
        }
    }

    /// Round `width` up to the configured multiple of the fleet-wide maximum.
    fn agree_on_width(&self, width: usize) -> TrainingResult<Option<usize>> {
        let Some(multiple) = self.config.pad_multiple() else {
            return Ok(None);
        };
        let fleet_max = self.comm.all_reduce_max(width as u64)?;
        let fleet_max = usize::try_from(fleet_max).map_err(|_| {
            TrainingError::Collective(format!("reduced length {fleet_max} overflows usize"))
        })?;
        Ok(Some(ceil_to(fleet_max, multiple)))
    }

    /// Causal masks with the attention mask repeated to one entry per row.
    fn row_masks(&self, tokens: &Array2<TokenId>) -> LtorMasks {
        let rows = tokens.nrows();
        let mut masks =
            ltor_masks_and_position_ids(tokens, self.config.eos_id, self.mask_options());
        let (mask_rows, _, q, k) = masks.attention_mask.dim();
        if mask_rows == 1 && rows != 1 {
            let shared = &masks.attention_mask;
            masks.attention_mask =
                Array4::from_shape_fn((rows, 1, q, k), |(_, h, i, j)| shared[[0, h, i, j]]);
        }
        masks
    }

    pub fn collate(&self, examples: &[Example]) -> TrainingResult<Batch> {
        let first = examples
            .first()
            .ok_or_else(|| TrainingError::Dataset("cannot collate an empty batch".to_string()))?;
        let mixed = || {
            TrainingError::DataIntegrity("batch mixes examples of different variants".to_string())
        };
        match first {
            Example::Pair(_) => {
                let pairs = examples
                    .iter()
                    .map(|e| if let Example::Pair(p) = e { Ok(p) } else { Err(mixed()) })
                    .collect::<TrainingResult<Vec<_>>>()?;
                self.collate_pairs(&pairs).map(Batch::Pairs)
            }
            Example::Packed(_) => {
                let records = examples
                    .iter()
                    .map(|e| if let Example::Packed(p) = e { Ok(p) } else { Err(mixed()) })
                    .collect::<TrainingResult<Vec<_>>>()?;
                self.collate_packed(&records).map(Batch::Packed)
            }
            Example::Regression(_) => {
                let samples = examples
                    .iter()
                    .map(|e| if let Example::Regression(s) = e { Ok(s) } else { Err(mixed()) })
                    .collect::<TrainingResult<Vec<_>>>()?;
                self.collate_regression(&samples).map(Batch::Regression)
            }
            Example::Kto(_) => {
                let samples = examples
                    .iter()
                    .map(|e| if let Example::Kto(s) = e { Ok(s) } else { Err(mixed()) })
                    .collect::<TrainingResult<Vec<_>>>()?;
                self.collate_kto(&samples).map(Batch::Kto)
            }
        }
    }

    fn collate_pairs(&self, pairs: &[&LabeledPair]) -> TrainingResult<PairBatch> {
        let eos = self.config.eos_id;
        let chosen_width = pairs.iter().map(|p| p.chosen.len()).max().unwrap_or(0);
        let rejected_width = pairs.iter().map(|p| p.rejected.len()).max().unwrap_or(0);
        if chosen_width != rejected_width {
            return Err(TrainingError::DataIntegrity(format!(
                "chosen width {chosen_width} differs from rejected width {rejected_width}"
            )));
        }
        let width = self.agree_on_width(chosen_width)?.unwrap_or(chosen_width);

        let chosen_rows: Vec<&[TokenId]> =
            pairs.iter().map(|p| p.chosen.tokens.as_slice()).collect();
        let rejected_rows: Vec<&[TokenId]> =
            pairs.iter().map(|p| p.rejected.tokens.as_slice()).collect();
        let chosen_label_rows: Vec<&[TokenId]> =
            pairs.iter().map(|p| p.chosen.labels.as_slice()).collect();
        let rejected_label_rows: Vec<&[TokenId]> =
            pairs.iter().map(|p| p.rejected.labels.as_slice()).collect();
        let chosen = pad_rows(&chosen_rows, width, eos);
        let rejected = pad_rows(&rejected_rows, width, eos);
        let chosen_labels = pad_rows(&chosen_label_rows, width, IGNORE_INDEX);
        let rejected_labels = pad_rows(&rejected_label_rows, width, IGNORE_INDEX);
        let masks = self.row_masks(&chosen);

        Ok(PairBatch {
            chosen,
            rejected,
            chosen_labels,
            rejected_labels,
            chosen_length: pairs.iter().map(|p| p.chosen_length as i64).collect(),
            rejected_length: pairs.iter().map(|p| p.rejected_length as i64).collect(),
            chosen_rewards: pairs.iter().map(|p| p.chosen_reward).collect(),
            rejected_rewards: pairs.iter().map(|p| p.rejected_reward).collect(),
            attention_mask: masks.attention_mask,
            loss_mask: masks.loss_mask,
            position_ids: masks.position_ids,
            example_weights: pairs.iter().map(|p| loss_weight(p.ignore_example)).collect(),
            ref_policy_log_probs_chosen: None,
            ref_policy_log_probs_rejected: None,
        })
    }

    fn collate_packed(&self, records: &[&PackedRecord]) -> TrainingResult<PackedBatch> {
        let mut inputs: Vec<Vec<TokenId>> = Vec::with_capacity(records.len());
        let mut labels: Vec<Vec<TokenId>> = Vec::with_capacity(records.len());
        let mut positions: Vec<Vec<i64>> = Vec::with_capacity(records.len());
        let mut boundaries: Vec<Vec<usize>> = Vec::with_capacity(records.len());

        for record in records {
            record.validate()?;
            let mut row_inputs = Vec::with_capacity(record.input_ids.len());
            let mut row_labels = Vec::with_capacity(record.input_ids.len());
            let mut row_positions = Vec::with_capacity(record.input_ids.len());
            let mut cu = vec![0usize];
            for w in record.seq_boundaries.windows(2) {
                let (start, end) = (w[0], w[1]);
                // inputs drop the segment's last token, labels drop its first
                row_inputs.extend_from_slice(&record.input_ids[start..end - 1]);
                row_labels.extend_from_slice(&record.labels[start + 1..end]);
                row_positions.extend(0..(end - start - 1) as i64);
                cu.push(cu[cu.len() - 1] + end - start - 1);
            }
            inputs.push(row_inputs);
            labels.push(row_labels);
            positions.push(row_positions);
            boundaries.push(cu);
        }

        let local_max = inputs.iter().map(Vec::len).max().unwrap_or(0);
        let max_length = match self.agree_on_width(local_max)? {
            Some(width) => width,
            None => self.config.seq_length.min(ceil_to(local_max, PACKED_LENGTH_GRANULARITY)),
        };
        if let Some(row) = inputs.iter().position(|r| r.len() > max_length) {
            return Err(TrainingError::DataIntegrity(format!(
                "packed row {row} holds {} tokens, more than the padded length {max_length}",
                inputs[row].len()
            )));
        }
        trace!(rows = records.len(), local_max, max_length, "collating packed rows");

        let padded_end = to_i32(max_length, "packed length")?;
        let max_boundaries = boundaries.iter().map(Vec::len).max().unwrap_or(0);
        let cu_width = max_boundaries + 1;
        let mut cu_seqlens = Array2::from_elem((records.len(), cu_width), -1i32);
        for (r, cu) in boundaries.iter().enumerate() {
            for (c, &b) in cu.iter().enumerate() {
                cu_seqlens[[r, c]] = to_i32(b, "segment boundary")?;
            }
            // attention kernels expect the last segment to run to the padded end
            cu_seqlens[[r, cu.len() - 1]] = padded_end;
        }

        let cu_seqlens_argmin: Array1<i64> = cu_seqlens
            .rows()
            .into_iter()
            .map(|row| {
                let min = row.iter().copied().min().unwrap_or(0);
                row.iter().position(|&v| v == min).unwrap_or(0) as i64
            })
            .collect();
        let max_seqlen: Array1<i32> = cu_seqlens
            .rows()
            .into_iter()
            .map(|row| row.windows(2).into_iter().map(|w| w[1] - w[0]).max().unwrap_or(0))
            .collect();

        let max_segments = records.iter().map(|r| r.lengths.len()).max().unwrap_or(0);
        let lengths: Vec<&[i64]> = records.iter().map(|r| r.lengths.as_slice()).collect();
        let rewards: Vec<&[f64]> = records.iter().map(|r| r.reward.as_slice()).collect();

        Ok(PackedBatch {
            input_ids: pad_rows(&as_rows(&inputs), max_length, self.config.eos_id),
            labels: pad_rows(&as_rows(&labels), max_length, IGNORE_INDEX),
            position_ids: pad_rows(&as_rows(&positions), max_length, 0),
            lengths: pad_rows(&lengths, max_segments, 0),
            rewards: pad_rows(&rewards, max_segments, PackedBatch::REWARD_PAD),
            cu_seqlens,
            cu_seqlens_argmin,
            max_seqlen,
            ref_policy_log_probs: None,
        })
    }

    fn collate_regression(
        &self,
        samples: &[&RegressionSample],
    ) -> TrainingResult<RegressionBatch> {
        let label_dim = samples[0].label.len();
        if samples.iter().any(|s| s.label.len() != label_dim) {
            return Err(TrainingError::DataIntegrity(
                "regression labels in one batch have different dimensions".to_string(),
            ));
        }
        let local = samples.iter().map(|s| s.tokens.len()).max().unwrap_or(0);
        let width = self.agree_on_width(local)?.unwrap_or(local);
        let token_rows: Vec<&[TokenId]> = samples.iter().map(|s| s.tokens.as_slice()).collect();
        let tokens = pad_rows(&token_rows, width, self.config.eos_id);
        let masks = self.row_masks(&tokens);

        Ok(RegressionBatch {
            tokens,
            lengths: samples.iter().map(|s| s.length as i64).collect(),
            labels: Array2::from_shape_fn((samples.len(), label_dim), |(r, c)| samples[r].label[c]),
            attention_mask: masks.attention_mask,
            loss_mask: masks.loss_mask,
            position_ids: masks.position_ids,
            example_weights: samples.iter().map(|s| loss_weight(s.loss_masked)).collect(),
            ref_policy_log_probs: None,
        })
    }

    fn collate_kto(&self, samples: &[&KtoSample]) -> TrainingResult<KtoBatch> {
        let full: Vec<Vec<TokenId>> = samples
            .iter()
            .map(|s| s.prompt_ids.iter().chain(&s.response_ids).copied().collect())
            .collect();
        let local = full.iter().map(Vec::len).max().unwrap_or(0);
        let width = self.agree_on_width(local)?.unwrap_or(local);
        let label_rows: Vec<&[TokenId]> = samples.iter().map(|s| s.labels.as_slice()).collect();
        let tokens = pad_rows(&as_rows(&full), width, self.config.eos_id);
        let masks = self.row_masks(&tokens);

        Ok(KtoBatch {
            samples: tokens,
            labels: pad_rows(&label_rows, width, IGNORE_INDEX),
            sample_length: samples.iter().map(|s| s.sample_length as i64).collect(),
            preference: samples.iter().map(|s| s.preference == KtoPreference::Chosen).collect(),
            attention_mask: masks.attention_mask,
            loss_mask: masks.loss_mask,
            position_ids: masks.position_ids,
            example_weights: samples.iter().map(|s| loss_weight(s.ignore_example)).collect(),
            ref_policy_log_probs: None,
        })
    }
}
