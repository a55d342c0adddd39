//! A base model wrapped with a trainable adapter

use tch::Tensor;

use super::{AdapterParameter, LoraAdapter, LoraConfig};
use crate::error::Result;
use crate::model::{CausalLm, WeightSnapshot};

/// Base model plus the adapter whose deltas it receives
///
/// Wrapping freezes the base parameters: after [`PeftModel::wrap`] the only
/// tensors that track gradients are the adapter's A and B matrices.
pub struct PeftModel<M: CausalLm> {
    base: M,
    adapter: LoraAdapter,
    /// Capability flag: the model may be split across devices
    pub is_parallelizable: bool,
    /// Capability flag: the model is currently treated as split across devices
    pub model_parallel: bool,
}

impl<M: CausalLm> PeftModel<M> {
    /// Attach a fresh adapter built from `config` to `base`
    ///
    /// The adapter is validated against the base dimensions before the base
    /// is frozen.
    pub fn wrap(base: M, config: LoraConfig) -> Result<Self> {
        let adapter = LoraAdapter::new(config, base.dims(), base.device())?;
        Ok(Self::with_adapter(base, adapter))
    }

    /// Attach an already built adapter to `base`, freezing the base
    pub fn with_adapter(mut base: M, adapter: LoraAdapter) -> Self {
        base.freeze();
        Self {
            base,
            adapter,
            is_parallelizable: false,
            model_parallel: false,
        }
    }

    /// Logits with the adapter deltas applied
    pub fn forward_t(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        self.base
            .forward_t(input_ids, attention_mask, Some(&self.adapter), train)
    }

    pub fn base(&self) -> &M {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut M {
        &mut self.base
    }

    pub fn adapter(&self) -> &LoraAdapter {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut LoraAdapter {
        &mut self.adapter
    }

    /// Role-tagged trainable parameters
    pub fn named_parameters(&self) -> Vec<AdapterParameter> {
        self.adapter.named_parameters()
    }

    /// Drop the adapter and return the base model
    pub fn into_base(self) -> M {
        self.base
    }

    /// Deep copy of the base weights and the current adapter values
    pub fn snapshot(&self) -> WeightSnapshot {
        let mut snapshot = self.base.snapshot();
        let _guard = tch::no_grad_guard();
        for param in self.adapter.named_parameters() {
            snapshot.tensors.insert(param.name, param.tensor.copy());
        }
        snapshot
    }
}

/// Model handed to an edit run
pub enum EditTarget<M: CausalLm> {
    /// Unwrapped base model; a new adapter is attached
    Fresh(M),
    /// Model carrying an adapter from an earlier edit
    Continuing(PeftModel<M>),
}

impl<M: CausalLm> EditTarget<M> {
    pub fn is_wrapped(&self) -> bool {
        matches!(self, EditTarget::Continuing(_))
    }

    pub fn base(&self) -> &M {
        match self {
            EditTarget::Fresh(model) => model,
            EditTarget::Continuing(peft) => peft.base(),
        }
    }

    /// The base model, dropping any adapter
    pub fn into_base(self) -> M {
        match self {
            EditTarget::Fresh(model) => model,
            EditTarget::Continuing(peft) => peft.into_base(),
        }
    }

    /// Deep copy of everything the edit may change
    pub fn snapshot(&self) -> WeightSnapshot {
        match self {
            EditTarget::Fresh(model) => model.snapshot(),
            EditTarget::Continuing(peft) => peft.snapshot(),
        }
    }
}
