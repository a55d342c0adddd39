//! Edit hyperparameters
//!
//! One `HyperParams` value drives one edit run and is never mutated during it.

use serde::{Deserialize, Serialize};
use tch::{Cuda, Device};

use crate::error::{EditError, Result};
use crate::lora::{LoraConfig, TaskType};

/// Adapter family requested by the hyperparameters
///
/// Only [`LoraType::Lora`] can be trained. Any other value is kept verbatim so
/// the run can fail with a NotImplemented error naming what was asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LoraType {
    Lora,
    Other(String),
}

impl From<String> for LoraType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "lora" => LoraType::Lora,
            _ => LoraType::Other(value),
        }
    }
}

impl From<LoraType> for String {
    fn from(value: LoraType) -> Self {
        match value {
            LoraType::Lora => "lora".to_owned(),
            LoraType::Other(other) => other,
        }
    }
}

/// Hyperparameters for one sparsified LoRA edit run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperParams {
    /// Adapter family ("lora")
    #[serde(default = "default_lora_type")]
    pub lora_type: LoraType,

    /// Low-rank dimension
    #[serde(default = "default_rank")]
    pub rank: usize,

    /// Scaling numerator; effective scale is `lora_alpha / rank`
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f64,

    /// Dropout applied to adapter inputs during training
    #[serde(default)]
    pub lora_dropout: f64,

    /// Layer indices to adapt (empty = all layers)
    #[serde(default)]
    pub layers: Vec<usize>,

    /// Linear sublayer names to adapt
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Number of outer training iterations
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,

    /// Requests per micro-batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Adam learning rate
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// Adam L2 weight decay
    #[serde(default)]
    pub weight_decay: f64,

    /// Accelerator index
    #[serde(default)]
    pub device: usize,
}

fn default_lora_type() -> LoraType {
    LoraType::Lora
}
fn default_rank() -> usize {
    8
}
fn default_lora_alpha() -> f64 {
    32.0
}
fn default_target_modules() -> Vec<String> {
    vec!["q_proj".to_owned(), "v_proj".to_owned()]
}
fn default_num_steps() -> usize {
    70
}
fn default_batch_size() -> usize {
    1
}
fn default_lr() -> f64 {
    5e-3
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            lora_type: default_lora_type(),
            rank: default_rank(),
            lora_alpha: default_lora_alpha(),
            lora_dropout: 0.0,
            layers: Vec::new(),
            target_modules: default_target_modules(),
            num_steps: default_num_steps(),
            batch_size: default_batch_size(),
            lr: default_lr(),
            weight_decay: 0.0,
            device: 0,
        }
    }
}

impl HyperParams {
    /// Fail fast on adapter families other than plain LoRA
    pub fn ensure_supported(&self) -> Result<()> {
        match &self.lora_type {
            LoraType::Lora => Ok(()),
            LoraType::Other(kind) => Err(EditError::NotImplemented(format!(
                "lora_type '{}' (only 'lora' is supported)",
                kind
            ))),
        }
    }

    /// Check numeric ranges
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(EditError::config("rank must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(EditError::config("batch_size must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(EditError::config(format!(
                "lora_dropout must be in [0, 1), got {}",
                self.lora_dropout
            )));
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            return Err(EditError::config(format!("lr must be positive, got {}", self.lr)));
        }
        if self.weight_decay < 0.0 {
            return Err(EditError::config("weight_decay must not be negative"));
        }
        if self.target_modules.is_empty() {
            return Err(EditError::config("target_modules must name at least one module"));
        }
        Ok(())
    }

    /// Adapter configuration for a fresh causal-LM adapter
    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig {
            task_type: TaskType::CausalLm,
            inference_mode: false,
            rank: self.rank,
            alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            layers_to_transform: if self.layers.is_empty() {
                None
            } else {
                Some(self.layers.clone())
            },
            target_modules: self.target_modules.clone(),
        }
    }

    /// Map the device index to a tch device, falling back to CPU
    pub fn torch_device(&self) -> Device {
        if Cuda::is_available() && self.device < Cuda::device_count() as usize {
            Device::Cuda(self.device)
        } else {
            tracing::warn!(
                "CUDA device {} not available, training on CPU",
                self.device
            );
            Device::Cpu
        }
    }
}
