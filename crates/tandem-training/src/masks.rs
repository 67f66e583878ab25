//! Left-to-right attention masks, loss masks and position ids.

use crate::dataset::TokenId;
use ndarray::{Array2, Array4, s};

/// Masks derived from a `[batch, seq]` token matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct LtorMasks {
    /// `[b, 1, seq, seq]`, `true` where attention is blocked. `b` is 1 unless
    /// attention is reset at EOS, in which case it is the batch size.
    pub attention_mask: Array4<bool>,
    pub loss_mask: Array2<f32>,
    pub position_ids: Array2<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaskOptions {
    pub reset_position_ids: bool,
    pub reset_attention_mask: bool,
    pub mask_eos_loss: bool,
}

pub fn ltor_masks_and_position_ids(
    tokens: &Array2<TokenId>,
    eos_id: TokenId,
    options: MaskOptions,
) -> LtorMasks {
    let (batch, seq) = tokens.dim();
    let mask_batch = if options.reset_attention_mask { batch } else { 1 };

    let mut attention_mask = Array4::from_shape_fn((mask_batch, 1, seq, seq), |(_, _, q, k)| k > q);

    let loss_mask = tokens.mapv(|t| if options.mask_eos_loss && t == eos_id { 0.0 } else { 1.0 });

    let mut position_ids = Array2::from_shape_fn((batch, seq), |(_, j)| j as i64);

    if options.reset_position_ids || options.reset_attention_mask {
        for b in 0..batch {
            let mut prev = 0usize;
            for (i, _) in tokens.row(b).iter().enumerate().filter(|&(_, &t)| t == eos_id) {
                if options.reset_attention_mask {
                    attention_mask.slice_mut(s![b, 0, (i + 1).., ..=i]).fill(true);
                }
                if options.reset_position_ids {
                    let shift = (i + 1 - prev) as i64;
                    position_ids.slice_mut(s![b, (i + 1)..]).mapv_inplace(|p| p - shift);
                    prev = i + 1;
                }
            }
        }
    }

    LtorMasks { attention_mask, loss_mask, position_ids }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_plain_causal_mask() {
        let tokens = array![[5, 6, 7], [8, 9, 2]];
        let masks = ltor_masks_and_position_ids(&tokens, 2, MaskOptions::default());

        assert_eq!(masks.attention_mask.dim(), (1, 1, 3, 3));
        assert!(!masks.attention_mask[[0, 0, 2, 0]]);
        assert!(masks.attention_mask[[0, 0, 0, 1]]);
        assert_eq!(masks.position_ids, array![[0, 1, 2], [0, 1, 2]]);
        assert_eq!(masks.loss_mask, Array2::<f32>::ones((2, 3)));
    }

    #[test]
    fn test_reset_at_eos() {
        let tokens = array![[5, 2, 7, 8]];
        let options = MaskOptions {
            reset_position_ids: true,
            reset_attention_mask: true,
            mask_eos_loss: true,
        };
        let masks = ltor_masks_and_position_ids(&tokens, 2, options);

        assert_eq!(masks.position_ids, array![[0, 1, 0, 1]]);
        assert_eq!(masks.loss_mask, array![[1.0, 0.0, 1.0, 1.0]]);
        // tokens after the EOS cannot see the first document
        assert!(masks.attention_mask[[0, 0, 2, 0]]);
        assert!(masks.attention_mask[[0, 0, 3, 1]]);
        assert!(!masks.attention_mask[[0, 0, 3, 2]]);
        assert!(!masks.attention_mask[[0, 0, 1, 0]]);
    }
}
