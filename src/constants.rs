//! Shared constants for sparsedit
//!
//! Centralizes the run-level constants of the sparsification schedule and
//! the pruning step so defaults, config and tests agree on one value.

/// Sparsity schedule defaults (iteration-indexed, 0-based)
pub mod schedule {
    /// Iterations trained fully dense before annealing starts
    pub const FULL_ITER: usize = 3;

    /// Iteration at which annealing ends and the sparsity floor applies
    pub const BURNIN_ITER: usize = 20;

    /// Floor density: fraction of adapter entries kept after burn-in
    pub const SPARSITY: f64 = 0.05;

    /// Average loss below which training halts once past burn-in
    pub const EARLY_STOP_LOSS: f64 = 0.1;
}

/// Importance tracking and pruning
pub mod pruning {
    /// Exponential decay applied to the previous importance estimate
    pub const IMPORTANCE_DECAY: f64 = 0.8;

    /// Absolute bound applied to adapter values after every pruning step
    pub const VALUE_CLAMP: f64 = 3e-3;
}

/// Environment and file names
pub mod env {
    /// Prefix for configuration environment variables (`SPARSEDIT_HPARAMS__LR`)
    pub const CONFIG_PREFIX: &str = "SPARSEDIT";

    /// Nested key separator for environment variables
    pub const CONFIG_SEPARATOR: &str = "__";

    /// Model architecture file inside a model directory
    pub const MODEL_CONFIG_FILE: &str = "config.json";

    /// Model weights file inside a model directory
    pub const MODEL_WEIGHTS_FILE: &str = "model.safetensors";

    /// Tokenizer definition inside a model directory
    pub const TOKENIZER_FILE: &str = "tokenizer.json";
}
