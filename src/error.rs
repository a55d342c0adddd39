//! Error types for knowledge editing

use thiserror::Error;

/// Unified error type for all editing operations
#[derive(Error, Debug)]
pub enum EditError {
    /// Requested feature exists in the configuration surface but is not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// An example whose target span selects zero tokens after masking
    #[error("Request {index} has an empty target span after tokenization (prompt: {prompt:?})")]
    EmptyTarget { index: usize, prompt: String },

    #[error("Non-finite loss {loss} at iteration {iteration}")]
    NonFiniteLoss { iteration: usize, loss: f64 },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Module not found: {0}")]
    UnknownModule(String),

    #[error("Safetensors error: {0}")]
    Safetensors(String),

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] tch::TchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),
}

impl EditError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        EditError::Config(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer<S: Into<String>>(msg: S) -> Self {
        EditError::Tokenizer(msg.into())
    }
}

/// Result type alias for editing operations
pub type Result<T> = std::result::Result<T, EditError>;
