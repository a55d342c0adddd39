//! Causal language model interface
//!
//! The edit trainer drives any model that implements [`CausalLm`]: a forward
//! pass that calls back into an optional [`LoraHook`] from its adapted linear
//! sublayers, plus the parameter enumeration and training toggles the setup
//! step needs.

pub mod transformer;

pub use transformer::{SmallTransformer, TransformerConfig};

use std::collections::{BTreeMap, HashMap};
use tch::{Device, Tensor};

use crate::error::Result;
use crate::lora::LoraHook;

/// Shape information adapters are built against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDims {
    pub num_layers: usize,
    /// module name -> (in_features, out_features)
    pub modules: BTreeMap<String, (usize, usize)>,
}

/// Training-time switches set before an edit run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingFlags {
    pub use_cache: bool,
    pub gradient_checkpointing: bool,
    pub input_require_grads: bool,
}

impl Default for TrainingFlags {
    fn default() -> Self {
        Self {
            use_cache: true,
            gradient_checkpointing: false,
            input_require_grads: false,
        }
    }
}

/// Decoder-only language model that can host low-rank adapters
pub trait CausalLm {
    /// Logits `[batch, seq, vocab]` for `input_ids` `[batch, seq]`
    ///
    /// `attention_mask` is `[batch, seq]` with 1 for content and 0 for padding.
    fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        hook: Option<&dyn LoraHook>,
        train: bool,
    ) -> Result<Tensor>;

    fn dims(&self) -> &ModelDims;

    fn device(&self) -> Device;

    /// Every base parameter by name (shallow handles)
    fn named_parameters(&self) -> Vec<(String, Tensor)>;

    /// Stop gradient tracking on every base parameter
    fn freeze(&mut self);

    fn flags(&self) -> TrainingFlags;

    fn set_use_cache(&mut self, enabled: bool);

    fn gradient_checkpointing_enable(&mut self);

    /// Make activations entering the first block require gradients so a
    /// frozen embedding does not cut the graph in front of the adapters
    fn enable_input_require_grads(&mut self);

    /// Deep copy of every base parameter
    fn snapshot(&self) -> WeightSnapshot {
        let _guard = tch::no_grad_guard();
        WeightSnapshot {
            tensors: self
                .named_parameters()
                .into_iter()
                .map(|(name, tensor)| (name, tensor.copy()))
                .collect(),
        }
    }
}

/// Deep copy of model weights taken before an edit
///
/// The caller owns the copy; dropping it releases the tensors.
#[derive(Debug, Default)]
pub struct WeightSnapshot {
    pub tensors: HashMap<String, Tensor>,
}

impl WeightSnapshot {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }
}
