//! Micro-batch construction
//!
//! A batch is tokenized twice: prompts alone, to count prompt tokens, and
//! prompt+target concatenations, which are the actual model input. The label
//! mask selects the target span of each concatenated row.

use tch::{Device, Tensor};

use super::request::EditRequest;
use crate::error::{EditError, Result};
use crate::tokenizer::{BatchTokenizer, PaddedBatch};

/// Split `items` into order-preserving chunks of at most `n` elements
///
/// The last chunk may be shorter; no chunk is empty.
pub fn chunks<T: Clone>(items: &[T], n: usize) -> Vec<Vec<T>> {
    items.chunks(n.max(1)).map(<[T]>::to_vec).collect()
}

/// Per-row start of the target span in the concatenated batch
///
/// Leading pad tokens of the concatenated row plus the non-pad tokens of the
/// prompt-only row.
pub fn prompt_lengths(prompts: &PaddedBatch, full: &PaddedBatch, pad_id: i64) -> Vec<usize> {
    prompts
        .ids
        .iter()
        .zip(&full.ids)
        .map(|(prompt_row, full_row)| {
            let num_prompt = prompt_row.iter().filter(|&&id| id != pad_id).count();
            let num_pad = full_row.iter().take_while(|&&id| id == pad_id).count();
            num_pad + num_prompt
        })
        .collect()
}

/// True at attended positions at or after each row's prompt length
pub fn label_mask(full: &PaddedBatch, prompt_lens: &[usize]) -> Vec<Vec<bool>> {
    full.attention_mask
        .iter()
        .zip(prompt_lens)
        .map(|(attended, &start)| {
            attended
                .iter()
                .enumerate()
                .map(|(pos, &m)| pos >= start && m != 0)
                .collect()
        })
        .collect()
}

/// First row whose label mask selects no predicted token
///
/// Position 0 is never a prediction target, so it does not count.
pub fn first_empty_row(mask: &[Vec<bool>]) -> Option<usize> {
    mask.iter()
        .position(|row| !row.iter().skip(1).any(|&selected| selected))
}

/// Tensors for one training micro-batch
#[derive(Debug)]
pub struct EditBatch {
    /// `[batch, seq]` prompt+target ids
    pub input_ids: Tensor,
    /// `[batch, seq]` 1 for content, 0 for padding
    pub attention_mask: Tensor,
    /// `[batch, seq]` bool, true on target tokens
    pub label_mask: Tensor,
    /// Position of each row in the full request list
    pub indices: Vec<usize>,
    pub prompts: Vec<String>,
}

impl EditBatch {
    /// Tokenize `requests` (which start at `offset` in the full list)
    ///
    /// Fails with [`EditError::EmptyTarget`] when a request's target adds no
    /// tokens after its prompt.
    pub fn build<T: BatchTokenizer + ?Sized>(
        tokenizer: &T,
        requests: &[EditRequest],
        offset: usize,
        device: Device,
    ) -> Result<Self> {
        let prompts: Vec<String> = requests.iter().map(|r| r.prompt.clone()).collect();
        let full_texts: Vec<String> = requests.iter().map(EditRequest::full_text).collect();

        let prompt_batch = tokenizer.encode_padded(&prompts)?;
        let full_batch = tokenizer.encode_padded(&full_texts)?;

        let lens = prompt_lengths(&prompt_batch, &full_batch, tokenizer.pad_token_id());
        let mask = label_mask(&full_batch, &lens);
        if let Some(row) = first_empty_row(&mask) {
            return Err(EditError::EmptyTarget {
                index: offset + row,
                prompt: prompts[row].clone(),
            });
        }
        let flat: Vec<bool> = mask.iter().flatten().copied().collect();
        let label_mask = Tensor::from_slice(&flat)
            .view([full_batch.batch_size() as i64, full_batch.seq_len() as i64])
            .to_device(device);

        Ok(Self {
            input_ids: full_batch.ids_tensor(device),
            attention_mask: full_batch.mask_tensor(device),
            label_mask,
            indices: (offset..offset + requests.len()).collect(),
            prompts,
        })
    }

    pub fn size(&self) -> usize {
        self.indices.len()
    }

    pub fn seq_len(&self) -> i64 {
        self.input_ids.size().last().copied().unwrap_or(0)
    }
}
