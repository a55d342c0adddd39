pub mod cli;
pub mod config;
pub mod constants;
pub mod editing;
pub mod error;
pub mod lora;
pub mod model;
pub mod tokenizer;

// Re-export commonly used types
pub use config::{EditConfig, HyperParams, LoraType};
pub use editing::{apply_edits, EditFailure, EditOutcome, EditReport, EditRequest, EditTrainer};
pub use error::{EditError, Result};
pub use lora::{EditTarget, LoraAdapter, LoraConfig, PeftModel};
pub use model::{CausalLm, SmallTransformer, WeightSnapshot};
pub use tokenizer::{BatchTokenizer, HfTokenizer};
