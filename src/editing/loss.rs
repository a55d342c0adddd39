//! Masked next-token loss over the target span

use tch::{Kind, Reduction, Tensor};

use super::batching::EditBatch;
use crate::error::{EditError, Result};

/// Mean over the batch of each row's mean cross-entropy on its target tokens
///
/// Logits at position `t` predict the token at `t + 1`, so the label mask is
/// shifted by one. A row whose shifted mask selects nothing is an
/// [`EditError::EmptyTarget`].
pub fn masked_lm_loss(logits: &Tensor, batch: &EditBatch) -> Result<Tensor> {
    let (bs, seq_len, vocab_size) = logits.size3()?;
    if seq_len < 2 {
        return Err(empty_target(batch, 0));
    }

    let shift_logits = logits.narrow(1, 0, seq_len - 1).reshape([-1, vocab_size]);
    let shift_labels = batch.input_ids.narrow(1, 1, seq_len - 1).reshape([-1]);

    let per_token = shift_logits
        .cross_entropy_loss::<Tensor>(&shift_labels, None, Reduction::None, -100, 0.0)
        .view([bs, seq_len - 1]);

    let mask = batch.label_mask.narrow(1, 1, seq_len - 1).to_kind(Kind::Float);
    let counts = mask.sum_dim_intlist(&[1i64][..], false, Kind::Float);
    for row in 0..bs {
        if counts.double_value(&[row]) == 0.0 {
            return Err(empty_target(batch, row as usize));
        }
    }

    let per_example = (per_token * &mask).sum_dim_intlist(&[1i64][..], false, Kind::Float) / counts;
    Ok(per_example.mean(Kind::Float))
}

fn empty_target(batch: &EditBatch, row: usize) -> EditError {
    EditError::EmptyTarget {
        index: batch.indices.get(row).copied().unwrap_or(row),
        prompt: batch.prompts.get(row).cloned().unwrap_or_default(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tch::Device;

    fn batch(ids: &[i64], mask: &[bool], rows: i64) -> EditBatch {
        let cols = ids.len() as i64 / rows;
        EditBatch {
            input_ids: Tensor::from_slice(ids).view([rows, cols]),
            attention_mask: Tensor::ones([rows, cols], (Kind::Int64, Device::Cpu)),
            label_mask: Tensor::from_slice(mask).view([rows, cols]),
            indices: (0..rows as usize).collect(),
            prompts: (0..rows).map(|i| format!("prompt {}", i)).collect(),
        }
    }

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let b = batch(&[1, 2, 3, 1, 2, 3], &[false, true, true, false, false, true], 2);
        let logits = Tensor::zeros([2, 3, 5], (Kind::Float, Device::Cpu));
        let loss = masked_lm_loss(&logits, &b).unwrap().double_value(&[]);
        assert!((loss - 5f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_prompt_positions_do_not_contribute() {
        let b = batch(&[1, 2, 3], &[false, false, true], 1);
        let logits = Tensor::zeros([1, 3, 5], (Kind::Float, Device::Cpu));
        let base = masked_lm_loss(&logits, &b).unwrap().double_value(&[]);

        // Position 0 predicts id 2, inside the prompt span
        let _ = logits.get(0).get(0).get(2).fill_(10.0);
        let changed = masked_lm_loss(&logits, &b).unwrap().double_value(&[]);
        assert!((base - changed).abs() < 1e-6);

        // Position 1 predicts id 3, the target
        let _ = logits.get(0).get(1).get(3).fill_(10.0);
        let improved = masked_lm_loss(&logits, &b).unwrap().double_value(&[]);
        assert!(improved < base);
    }

    #[test]
    fn test_empty_target_is_reported() {
        let b = batch(&[1, 2, 3, 1, 2, 3], &[false, false, true, true, false, false], 2);
        let logits = Tensor::zeros([2, 3, 5], (Kind::Float, Device::Cpu));
        match masked_lm_loss(&logits, &b) {
            Err(EditError::EmptyTarget { index, prompt }) => {
                assert_eq!(index, 1);
                assert_eq!(prompt, "prompt 1");
            }
            other => panic!("expected EmptyTarget, got {:?}", other.map(|t| t.size())),
        }
    }
}
