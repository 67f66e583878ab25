//! Collated batches handed to the model.

use crate::dataset::TokenId;
use crate::error::{TrainingError, TrainingResult};
use ndarray::{Array1, Array2, Array4, ArrayView1, s};

/// Unpacked preference batch: row `i` of `chosen` and `rejected` come from the same example.
#[derive(Debug, Clone, PartialEq)]
pub struct PairBatch {
    pub chosen: Array2<TokenId>,
    pub rejected: Array2<TokenId>,
    pub chosen_labels: Array2<TokenId>,
    pub rejected_labels: Array2<TokenId>,
    pub chosen_length: Array1<i64>,
    pub rejected_length: Array1<i64>,
    pub chosen_rewards: Array1<f64>,
    pub rejected_rewards: Array1<f64>,
    /// `[B, 1, S, S]`, `true` where attention is blocked.
    pub attention_mask: Array4<bool>,
    pub loss_mask: Array2<f32>,
    pub position_ids: Array2<i64>,
    /// 0 for stand-in examples, 1 otherwise.
    pub example_weights: Array1<f64>,
    pub ref_policy_log_probs_chosen: Option<Array2<f32>>,
    pub ref_policy_log_probs_rejected: Option<Array2<f32>>,
}

/// Rows of several packed segments. Attention follows `cu_seqlens`; there is no dense mask.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedBatch {
    pub input_ids: Array2<TokenId>,
    pub labels: Array2<TokenId>,
    pub position_ids: Array2<i64>,
    /// `[B, max_segments]`, padded with 0.
    pub lengths: Array2<i64>,
    /// `[B, max_segments]`, padded with [`PackedBatch::REWARD_PAD`].
    pub rewards: Array2<f64>,
    /// `[B, max_boundaries + 1]`, padded with -1.
    pub cu_seqlens: Array2<i32>,
    /// Index of the first padding entry in each `cu_seqlens` row.
    pub cu_seqlens_argmin: Array1<i64>,
    pub max_seqlen: Array1<i32>,
    pub ref_policy_log_probs: Option<Array2<f32>>,
}

impl PackedBatch {
    pub const REWARD_PAD: f64 = -1000.0;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionBatch {
    pub tokens: Array2<TokenId>,
    pub lengths: Array1<i64>,
    /// `[B, label_dim]`.
    pub labels: Array2<f64>,
    pub attention_mask: Array4<bool>,
    pub loss_mask: Array2<f32>,
    pub position_ids: Array2<i64>,
    pub example_weights: Array1<f64>,
    pub ref_policy_log_probs: Option<Array2<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KtoBatch {
    pub samples: Array2<TokenId>,
    pub labels: Array2<TokenId>,
    pub sample_length: Array1<i64>,
    /// `true` for desirable responses.
    pub preference: Array1<bool>,
    pub attention_mask: Array4<bool>,
    pub loss_mask: Array2<f32>,
    pub position_ids: Array2<i64>,
    pub example_weights: Array1<f64>,
    pub ref_policy_log_probs: Option<Array2<f32>>,
}

/// Unit consumed by one optimizer micro-step. Built per step and dropped after it.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    Pairs(PairBatch),
    Packed(PackedBatch),
    Regression(RegressionBatch),
    Kto(KtoBatch),
}

impl Batch {
    /// Rows the model evaluates: chosen and rejected count separately for pairs.
    pub fn model_rows(&self) -> usize {
        match self {
            Self::Pairs(b) => b.chosen.nrows() * 2,
            Self::Packed(b) => b.input_ids.nrows(),
            Self::Regression(b) => b.tokens.nrows(),
            Self::Kto(b) => b.samples.nrows(),
        }
    }

    pub fn seq_len(&self) -> usize {
        match self {
            Self::Pairs(b) => b.chosen.ncols(),
            Self::Packed(b) => b.input_ids.ncols(),
            Self::Regression(b) => b.tokens.ncols(),
            Self::Kto(b) => b.samples.ncols(),
        }
    }

    /// Per-example loss weights. Packed rows weigh each real segment 1.
    pub fn example_weights(&self) -> Array1<f64> {
        match self {
            Self::Pairs(b) => b.example_weights.clone(),
            Self::Packed(b) => b.lengths.iter().filter(|&&l| l > 0).map(|_| 1.0).collect(),
            Self::Regression(b) => b.example_weights.clone(),
            Self::Kto(b) => b.example_weights.clone(),
        }
    }

    pub fn has_ref_log_probs(&self) -> bool {
        match self {
            Self::Pairs(b) => {
                b.ref_policy_log_probs_chosen.is_some() && b.ref_policy_log_probs_rejected.is_some()
            }
            Self::Packed(b) => b.ref_policy_log_probs.is_some(),
            Self::Regression(b) => b.ref_policy_log_probs.is_some(),
            Self::Kto(b) => b.ref_policy_log_probs.is_some(),
        }
    }

    /// Attach reference log-probabilities computed over [`Batch::model_rows`] rows.
    ///
    /// Pair batches are evaluated chosen-first, so the first half of the rows
    /// belongs to chosen and the second half to rejected.
    pub fn attach_ref_log_probs(&mut self, log_probs: Array2<f32>) -> TrainingResult<()> {
        let expected = self.model_rows();
        if log_probs.nrows() != expected {
            return Err(TrainingError::Model(format!(
                "reference policy returned {} rows for a batch of {expected}",
                log_probs.nrows()
            )));
        }
        match self {
            Self::Pairs(b) => {
                let half = expected / 2;
                b.ref_policy_log_probs_chosen = Some(log_probs.slice(s![..half, ..]).to_owned());
                b.ref_policy_log_probs_rejected = Some(log_probs.slice(s![half.., ..]).to_owned());
            }
            Self::Packed(b) => b.ref_policy_log_probs = Some(log_probs),
            Self::Regression(b) => b.ref_policy_log_probs = Some(log_probs),
            Self::Kto(b) => b.ref_policy_log_probs = Some(log_probs),
        }
        Ok(())
    }
}

/// Weighted mean that drops zero-weight entries. All-masked input reduces to 0.
pub fn masked_mean(values: ArrayView1<'_, f64>, weights: ArrayView1<'_, f64>) -> f64 {
    let total: f64 = weights.sum();
    if total <= 0.0 {
        return 0.0;
    }
    values
        .iter()
        .zip(weights.iter())
        .filter(|&(_, &w)| w > 0.0)
        .map(|(v, w)| v * w)
        .sum::<f64>()
        / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_masked_example_contributes_zero() {
        let losses = array![0.0, 2.0];
        let weights = array![0.0, 1.0];
        assert!((masked_mean(losses.view(), weights.view()) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_all_masked_reduces_to_zero() {
        let losses = array![f64::NAN, 5.0];
        let weights = array![0.0, 0.0];
        assert!(masked_mean(losses.view(), weights.view()).abs() < f64::EPSILON);
    }

    #[test]
    fn test_masked_nan_does_not_poison_mean() {
        let losses = array![f64::NAN, 3.0, 1.0];
        let weights = array![0.0, 1.0, 1.0];
        assert!((masked_mean(losses.view(), weights.view()) - 2.0).abs() < f64::EPSILON);
    }

    fn packed(rows: usize, seq: usize) -> Batch {
        Batch::Packed(PackedBatch {
            input_ids: Array2::zeros((rows, seq)),
            labels: Array2::zeros((rows, seq)),
            position_ids: Array2::zeros((rows, seq)),
            lengths: array![[3, 2, 0]],
            rewards: array![[1.0, 0.0, PackedBatch::REWARD_PAD]],
            cu_seqlens: array![[0, 2, 16, -1]],
            cu_seqlens_argmin: array![3],
            max_seqlen: array![14],
            ref_policy_log_probs: None,
        })
    }

    #[test]
    fn test_packed_ref_log_probs_kept_whole() {
        let mut batch = packed(1, 16);
        assert!(!batch.has_ref_log_probs());
        batch.attach_ref_log_probs(Array2::zeros((1, 16))).unwrap();
        assert!(batch.has_ref_log_probs());
        assert_eq!(batch.example_weights(), array![1.0, 1.0]);
    }

    #[test]
    fn test_pair_ref_log_probs_split_in_half() {
        let mut batch = Batch::Pairs(PairBatch {
            chosen: array![[1, 2], [3, 4]],
            rejected: array![[1, 5], [3, 6]],
            chosen_labels: array![[-100, 2], [-100, 4]],
            rejected_labels: array![[-100, 5], [-100, 6]],
            chosen_length: array![2, 2],
            rejected_length: array![2, 2],
            chosen_rewards: array![1.0, 1.0],
            rejected_rewards: array![0.0, 0.0],
            attention_mask: Array4::from_elem((2, 1, 2, 2), false),
            loss_mask: Array2::ones((2, 2)),
            position_ids: array![[0, 1], [0, 1]],
            example_weights: array![1.0, 1.0],
            ref_policy_log_probs_chosen: None,
            ref_policy_log_probs_rejected: None,
        });
        let log_probs = array![[0.1, 0.2], [0.3, 0.4], [0.5, 0.6], [0.7, 0.8]];
        batch.attach_ref_log_probs(log_probs).unwrap();

        let Batch::Pairs(pairs) = batch else { unreachable!() };
        assert_eq!(pairs.ref_policy_log_probs_chosen, Some(array![[0.1, 0.2], [0.3, 0.4]]));
        assert_eq!(pairs.ref_policy_log_probs_rejected, Some(array![[0.5, 0.6], [0.7, 0.8]]));
    }

    #[test]
    fn test_ref_log_probs_row_mismatch() {
        let mut batch = packed(1, 16);
        assert!(matches!(
            batch.attach_ref_log_probs(Array2::zeros((2, 16))),
            Err(TrainingError::Model(_))
        ));
    }
}
