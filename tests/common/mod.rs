//! Shared fixtures for integration tests

#![allow(dead_code)]

use sparsedit_core::config::EditConfig;
use sparsedit_core::model::{SmallTransformer, TransformerConfig};
use sparsedit_core::tokenizer::{HfTokenizer, PaddingSide};
use sparsedit_core::EditRequest;
use tch::Device;

/// Whitespace word-level tokenizer covering the test sentences
pub const TOKENIZER_JSON: &str = r#"{
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
        "vocab": {
            "[PAD]": 0, "[UNK]": 1, "The": 2, "capital": 3, "of": 4, "France": 5,
            "is": 6, "Paris": 7, "Rome": 8, "Italy": 9, "sky": 10, "blue": 11,
            "green": 12, "the": 13
        },
        "unk_token": "[UNK]"
    }
}"#;

pub fn tokenizer() -> HfTokenizer {
    HfTokenizer::from_json(TOKENIZER_JSON, "[PAD]", PaddingSide::Left, false)
        .expect("test tokenizer definition is valid")
}

pub fn model(seed: i64) -> SmallTransformer {
    tch::manual_seed(seed);
    SmallTransformer::new(TransformerConfig::default(), Device::Cpu)
        .expect("default transformer config is valid")
}

/// Quiet configuration with a small adapter on every layer
pub fn config(num_steps: usize, lr: f64) -> EditConfig {
    let mut config = EditConfig::default();
    config.hparams.rank = 4;
    config.hparams.lora_alpha = 8.0;
    config.hparams.num_steps = num_steps;
    config.hparams.lr = lr;
    config.logging.progress = false;
    config
}

pub fn paris() -> Vec<EditRequest> {
    vec![EditRequest::new("The capital of France is", " Paris")]
}
