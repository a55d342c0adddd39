//! Configuration management for sparsedit.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file (TOML, YAML or JSON by extension)
//! 3. Environment variables (prefixed with `SPARSEDIT_`, nested keys joined by `__`)
//! 4. Command-line overrides
//!
//! # Environment Variables
//!
//! - `SPARSEDIT_HPARAMS__LR` - Adam learning rate
//! - `SPARSEDIT_HPARAMS__NUM_STEPS` - Number of outer iterations
//! - `SPARSEDIT_MODEL__PATH` - Model directory
//! - `SPARSEDIT_LOGGING__LEVEL` - Log level

pub mod hparams;

pub use hparams::{HyperParams, LoraType};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants;
use crate::error::{EditError, Result};
use crate::tokenizer::PaddingSide;

/// Root configuration for an edit run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditConfig {
    /// Training hyperparameters
    #[serde(default)]
    pub hparams: HyperParams,

    /// Sparsity schedule constants
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Model and tokenizer location
    #[serde(default)]
    pub model: ModelConfig,

    /// Logging and progress display
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Run-level constants of the three-phase sparsity schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Dense iterations before annealing
    #[serde(default = "default_full_iter")]
    pub full_iter: usize,

    /// Iteration at which the sparsity floor is reached
    #[serde(default = "default_burnin_iter")]
    pub burnin_iter: usize,

    /// Floor density kept after burn-in
    #[serde(default = "default_sparsity")]
    pub sparsity: f64,

    /// Average loss under which training stops after burn-in
    #[serde(default = "default_early_stop_loss")]
    pub early_stop_loss: f64,
}

fn default_full_iter() -> usize {
    constants::schedule::FULL_ITER
}
fn default_burnin_iter() -> usize {
    constants::schedule::BURNIN_ITER
}
fn default_sparsity() -> f64 {
    constants::schedule::SPARSITY
}
fn default_early_stop_loss() -> f64 {
    constants::schedule::EARLY_STOP_LOSS
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            full_iter: default_full_iter(),
            burnin_iter: default_burnin_iter(),
            sparsity: default_sparsity(),
            early_stop_loss: default_early_stop_loss(),
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.full_iter > self.burnin_iter {
            return Err(EditError::config(format!(
                "schedule.full_iter ({}) must not exceed schedule.burnin_iter ({})",
                self.full_iter, self.burnin_iter
            )));
        }
        if !(self.sparsity > 0.0 && self.sparsity <= 1.0) {
            return Err(EditError::config(format!(
                "schedule.sparsity must be in (0, 1], got {}",
                self.sparsity
            )));
        }
        Ok(())
    }
}

/// Model directory layout and tokenizer behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory holding config.json, model.safetensors and tokenizer.json
    #[serde(default = "default_model_path")]
    pub path: PathBuf,

    /// Side on which batches are padded
    #[serde(default)]
    pub padding_side: PaddingSide,

    /// Token used for padding
    #[serde(default = "default_pad_token")]
    pub pad_token: String,

    /// Whether the tokenizer adds its special tokens (BOS etc.)
    #[serde(default = "default_add_special_tokens")]
    pub add_special_tokens: bool,
}

fn default_model_path() -> PathBuf {
    PathBuf::from(".")
}
fn default_pad_token() -> String {
    "[PAD]".to_owned()
}
fn default_add_special_tokens() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            padding_side: PaddingSide::default(),
            pad_token: default_pad_token(),
            add_special_tokens: default_add_special_tokens(),
        }
    }
}

impl ModelConfig {
    pub fn config_file(&self) -> PathBuf {
        self.path.join(constants::env::MODEL_CONFIG_FILE)
    }

    pub fn weights_file(&self) -> PathBuf {
        self.path.join(constants::env::MODEL_WEIGHTS_FILE)
    }

    pub fn tokenizer_file(&self) -> PathBuf {
        self.path.join(constants::env::TOKENIZER_FILE)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional `EnvFilter` directives
    #[serde(default)]
    pub filter: Option<String>,

    /// Show the training progress bar
    #[serde(default = "default_progress")]
    pub progress: bool,
}

fn default_log_level() -> String {
    "info".to_owned()
}
fn default_progress() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
            progress: default_progress(),
        }
    }
}

/// Explicit overrides applied after every other source
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model_path: Option<PathBuf>,
    pub num_steps: Option<usize>,
    pub lr: Option<f64>,
    pub device: Option<usize>,
    pub progress: Option<bool>,
}

impl EditConfig {
    /// Load configuration from all sources
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut builder = Config::builder().add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(constants::env::CONFIG_PREFIX)
                .prefix_separator("_")
                .separator(constants::env::CONFIG_SEPARATOR)
                .try_parsing(true),
        );

        let mut config: EditConfig = builder.build()?.try_deserialize()?;
        config.apply_overrides(overrides);
        config.validate()?;

        tracing::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(path) = &overrides.model_path {
            self.model.path = path.clone();
        }
        if let Some(steps) = overrides.num_steps {
            self.hparams.num_steps = steps;
        }
        if let Some(lr) = overrides.lr {
            self.hparams.lr = lr;
        }
        if let Some(device) = overrides.device {
            self.hparams.device = device;
        }
        if let Some(progress) = overrides.progress {
            self.logging.progress = progress;
        }
    }

    /// Validate numeric ranges; `lora_type` is checked at run time
    pub fn validate(&self) -> Result<()> {
        self.hparams.validate()?;
        self.schedule.validate()
    }
}
