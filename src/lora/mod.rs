//! Low-rank adapters for knowledge editing
//!
//! This module provides the adapter side of an edit run:
//! - `adapter`: VarStore-owned A/B matrices per (layer, module) with role-tagged enumeration
//! - `peft_model`: a base model wrapped with an adapter, and the Fresh/Continuing edit target

pub mod adapter;
pub mod peft_model;

pub use adapter::LoraAdapter;
pub use peft_model::{EditTarget, PeftModel};

use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::error::{EditError, Result};
use crate::model::ModelDims;

/// Task the adapter is trained for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    /// Next-token prediction on a decoder-only model
    CausalLm,
}

/// Adapter configuration - single source of truth for wrapping a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    pub task_type: TaskType,
    /// Dropout and gradients active when false
    pub inference_mode: bool,
    /// Low-rank dimension (r in the paper)
    pub rank: usize,
    /// Scaling numerator (alpha in the paper)
    pub alpha: f64,
    /// Dropout probability applied to adapter inputs
    pub dropout: f64,
    /// Layer indices to adapt; `None` adapts every layer
    pub layers_to_transform: Option<Vec<usize>>,
    /// Linear sublayer names to adapt (e.g., ["q_proj", "v_proj"])
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            task_type: TaskType::CausalLm,
            inference_mode: false,
            rank: 8,
            alpha: 16.0,
            dropout: 0.0,
            layers_to_transform: None,
            target_modules: vec!["q_proj".to_owned(), "v_proj".to_owned()],
        }
    }
}

impl LoraConfig {
    /// Effective scale applied to the low-rank product
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    /// Check that every selected layer and target module exists in `dims`
    pub fn validate_for(&self, dims: &ModelDims) -> Result<()> {
        if self.rank == 0 {
            return Err(EditError::config("LoRA rank must be at least 1"));
        }
        if let Some(layers) = &self.layers_to_transform {
            if let Some(bad) = layers.iter().find(|&&idx| idx >= dims.num_layers) {
                return Err(EditError::config(format!(
                    "Layer {} out of range: model has {} layers",
                    bad, dims.num_layers
                )));
            }
        }
        if let Some(missing) = self
            .target_modules
            .iter()
            .find(|name| !dims.modules.contains_key(name.as_str()))
        {
            return Err(EditError::UnknownModule(missing.clone()));
        }
        Ok(())
    }

    /// Whether `layer_idx` receives adapters
    pub fn transforms_layer(&self, layer_idx: usize) -> bool {
        match &self.layers_to_transform {
            Some(layers) => layers.contains(&layer_idx),
            None => true,
        }
    }
}

/// Which low-rank factor a parameter is
///
/// A is `[rank, in_features]`, B is `[out_features, rank]`; pruning
/// thresholds run along the feature axis of each (dim 1 for A, dim 0 for B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterRole {
    A,
    B,
}

impl AdapterRole {
    /// Derive the role from a parameter name (`...lora_A...` / `...lora_B...`)
    pub fn from_name(name: &str) -> Option<Self> {
        name.split('.').find_map(|part| match part {
            "lora_A" | "lora_a" => Some(AdapterRole::A),
            "lora_B" | "lora_b" => Some(AdapterRole::B),
            _ => None,
        })
    }

    /// Dimension along which importance thresholds are taken
    pub fn prune_dim(self) -> i64 {
        match self {
            AdapterRole::A => 1,
            AdapterRole::B => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdapterRole::A => "lora_A",
            AdapterRole::B => "lora_B",
        }
    }
}

/// A named trainable adapter tensor
///
/// The tensor is a shallow handle onto storage owned by the adapter's
/// VarStore: writes through it mutate the adapter in place.
pub struct AdapterParameter {
    pub name: String,
    pub role: AdapterRole,
    pub tensor: Tensor,
}

impl std::fmt::Debug for AdapterParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterParameter")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("shape", &self.tensor.size())
            .finish()
    }
}

/// Injection point a model calls from inside each adapted linear sublayer
pub trait LoraHook {
    /// Low-rank correction for `module` at `layer_idx`, or `None` when that
    /// sublayer is not adapted. `x` is `[..., in_features]`.
    fn delta(&self, x: &Tensor, module: &str, layer_idx: usize, train: bool)
        -> Result<Option<Tensor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_name() {
        assert_eq!(AdapterRole::from_name("layers.0.q_proj.lora_A"), Some(AdapterRole::A));
        assert_eq!(AdapterRole::from_name("layers.3.v_proj.lora_B"), Some(AdapterRole::B));
        assert_eq!(
            AdapterRole::from_name("base_model.model.layers.1.self_attn.q_proj.lora_b.weight"),
            Some(AdapterRole::B)
        );
        assert_eq!(AdapterRole::from_name("layers.0.q_proj.weight"), None);
    }

    #[test]
    fn test_prune_dims() {
        assert_eq!(AdapterRole::A.prune_dim(), 1);
        assert_eq!(AdapterRole::B.prune_dim(), 0);
    }

    #[test]
    fn test_layer_selection() {
        let config = LoraConfig::default();
        assert!(config.transforms_layer(0));
        assert!(config.transforms_layer(31));

        let config = LoraConfig {
            layers_to_transform: Some(vec![2, 5]),
            ..Default::default()
        };
        assert!(config.transforms_layer(5));
        assert!(!config.transforms_layer(0));
        assert!((config.scaling() - 2.0).abs() < 1e-12);
    }
}
