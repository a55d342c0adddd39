//! Batched, padded tokenization
//!
//! The edit trainer only needs two things from a tokenizer: a rectangular
//! batch of ids with an attention mask, and the id used for padding. Both are
//! captured by [`BatchTokenizer`]; [`HfTokenizer`] provides them on top of a
//! HuggingFace `tokenizer.json`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tch::{Device, Kind, Tensor};
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer};

use crate::error::{EditError, Result};

/// Side on which shorter sequences are padded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    #[default]
    Left,
    Right,
}

impl From<PaddingSide> for PaddingDirection {
    fn from(side: PaddingSide) -> Self {
        match side {
            PaddingSide::Left => PaddingDirection::Left,
            PaddingSide::Right => PaddingDirection::Right,
        }
    }
}

/// A rectangular batch of token ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    /// `[batch][seq]` token ids
    pub ids: Vec<Vec<i64>>,
    /// `[batch][seq]` 1 for content, 0 for padding
    pub attention_mask: Vec<Vec<i64>>,
}

impl PaddedBatch {
    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }

    pub fn seq_len(&self) -> usize {
        self.ids.first().map_or(0, Vec::len)
    }

    /// Pack ids into a `[batch, seq]` int64 tensor on `device`
    pub fn ids_tensor(&self, device: Device) -> Tensor {
        to_tensor(&self.ids, self.seq_len(), device)
    }

    /// Pack the attention mask into a `[batch, seq]` int64 tensor on `device`
    pub fn mask_tensor(&self, device: Device) -> Tensor {
        to_tensor(&self.attention_mask, self.seq_len(), device)
    }
}

fn to_tensor(rows: &[Vec<i64>], seq_len: usize, device: Device) -> Tensor {
    let flat: Vec<i64> = rows.iter().flatten().copied().collect();
    Tensor::from_slice(&flat)
        .to_kind(Kind::Int64)
        .view([rows.len() as i64, seq_len as i64])
        .to_device(device)
}

/// Tokenizer capability required by the edit trainer
pub trait BatchTokenizer {
    /// Encode `texts` into one padded batch
    fn encode_padded(&self, texts: &[String]) -> Result<PaddedBatch>;

    /// Id of the padding token
    fn pad_token_id(&self) -> i64;
}

/// `BatchTokenizer` backed by a HuggingFace tokenizer
pub struct HfTokenizer {
    inner: Tokenizer,
    pad_id: u32,
    add_special_tokens: bool,
}

impl HfTokenizer {
    /// Wrap a tokenizer, padding with `pad_token` on `side`
    pub fn new(
        mut inner: Tokenizer,
        pad_token: &str,
        side: PaddingSide,
        add_special_tokens: bool,
    ) -> Result<Self> {
        let pad_id = inner.token_to_id(pad_token).ok_or_else(|| {
            EditError::tokenizer(format!("Pad token '{}' is not in the vocabulary", pad_token))
        })?;

        inner.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: side.into(),
            pad_id,
            pad_token: pad_token.to_owned(),
            ..Default::default()
        }));

        Ok(Self {
            inner,
            pad_id,
            add_special_tokens,
        })
    }

    /// Load `tokenizer.json` from disk
    pub fn from_file(
        path: &Path,
        pad_token: &str,
        side: PaddingSide,
        add_special_tokens: bool,
    ) -> Result<Self> {
        let inner = Tokenizer::from_file(path).map_err(|e| {
            EditError::tokenizer(format!("Failed to load {}: {}", path.display(), e))
        })?;
        Self::new(inner, pad_token, side, add_special_tokens)
    }

    /// Build from an in-memory `tokenizer.json` definition
    pub fn from_json(
        json: &str,
        pad_token: &str,
        side: PaddingSide,
        add_special_tokens: bool,
    ) -> Result<Self> {
        let inner = Tokenizer::from_str(json)
            .map_err(|e| EditError::tokenizer(format!("Invalid tokenizer definition: {}", e)))?;
        Self::new(inner, pad_token, side, add_special_tokens)
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }
}

impl BatchTokenizer for HfTokenizer {
    fn encode_padded(&self, texts: &[String]) -> Result<PaddedBatch> {
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .inner
            .encode_batch(inputs, self.add_special_tokens)
            .map_err(|e| EditError::tokenizer(format!("Batch encoding failed: {}", e)))?;

        let ids = encodings
            .iter()
            .map(|enc| enc.get_ids().iter().map(|&id| id as i64).collect())
            .collect();
        let attention_mask = encodings
            .iter()
            .map(|enc| enc.get_attention_mask().iter().map(|&m| m as i64).collect())
            .collect();

        Ok(PaddedBatch { ids, attention_mask })
    }

    fn pad_token_id(&self) -> i64 {
        self.pad_id as i64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[PAD]": 0, "[UNK]": 1, "the": 2, "sky": 3, "is": 4, "blue": 5},
            "unk_token": "[UNK]"
        }
    }"#;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_left_padding() {
        let tok = HfTokenizer::from_json(WORD_LEVEL, "[PAD]", PaddingSide::Left, false).unwrap();
        let batch = tok.encode_padded(&texts(&["the sky is blue", "blue"])).unwrap();

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.seq_len(), 4);
        assert_eq!(batch.ids[0], vec![2, 3, 4, 5]);
        assert_eq!(batch.ids[1], vec![0, 0, 0, 5]);
        assert_eq!(batch.attention_mask[1], vec![0, 0, 0, 1]);
        assert_eq!(tok.pad_token_id(), 0);
    }

    #[test]
    fn test_right_padding() {
        let tok = HfTokenizer::from_json(WORD_LEVEL, "[PAD]", PaddingSide::Right, false).unwrap();
        let batch = tok.encode_padded(&texts(&["sky", "the sky"])).unwrap();

        assert_eq!(batch.ids[0], vec![3, 0]);
        assert_eq!(batch.attention_mask[0], vec![1, 0]);
    }

    #[test]
    fn test_unknown_pad_token() {
        let result = HfTokenizer::from_json(WORD_LEVEL, "<pad>", PaddingSide::Left, false);
        assert!(matches!(result, Err(EditError::Tokenizer(_))));
    }

    #[test]
    fn test_batch_tensors() {
        let batch = PaddedBatch {
            ids: vec![vec![0, 7], vec![3, 4]],
            attention_mask: vec![vec![0, 1], vec![1, 1]],
        };
        let ids = batch.ids_tensor(Device::Cpu);
        assert_eq!(ids.size(), vec![2, 2]);
        assert_eq!(ids.int64_value(&[1, 0]), 3);
        assert_eq!(batch.mask_tensor(Device::Cpu).int64_value(&[0, 0]), 0);
    }
}
