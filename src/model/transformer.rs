//! Compact decoder-only transformer with adapter hooks
//!
//! Pre-norm blocks of causal multi-head attention (`q_proj`, `k_proj`,
//! `v_proj`, `o_proj`) and a GELU MLP (`up_proj`, `down_proj`). Every one of
//! those linear sublayers consults the [`LoraHook`] passed to the forward pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tch::nn::{self, Module, VarStore};
use tch::{Device, Kind, Tensor};

use super::{CausalLm, ModelDims, TrainingFlags};
use crate::constants;
use crate::error::{EditError, Result};
use crate::lora::LoraHook;

/// Additive attention bias for masked positions
const MASK_VALUE: f64 = -10000.0;

/// Architecture hyperparameters (`config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32,
            hidden_size: 32,
            num_layers: 2,
            num_heads: 4,
            intermediate_size: 64,
            max_position_embeddings: 64,
        }
    }
}

impl TransformerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(EditError::config(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.num_layers == 0 || self.vocab_size == 0 {
            return Err(EditError::config("num_layers and vocab_size must be positive"));
        }
        Ok(())
    }

    fn dims(&self) -> ModelDims {
        let h = self.hidden_size;
        let i = self.intermediate_size;
        let modules = [
            ("q_proj", (h, h)),
            ("k_proj", (h, h)),
            ("v_proj", (h, h)),
            ("o_proj", (h, h)),
            ("up_proj", (h, i)),
            ("down_proj", (i, h)),
        ]
        .into_iter()
        .map(|(name, shape)| (name.to_owned(), shape))
        .collect::<BTreeMap<_, _>>();

        ModelDims {
            num_layers: self.num_layers,
            modules,
        }
    }
}

struct Block {
    layer_idx: usize,
    num_heads: i64,
    head_dim: i64,
    attn_norm: nn::LayerNorm,
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    o_proj: nn::Linear,
    mlp_norm: nn::LayerNorm,
    up_proj: nn::Linear,
    down_proj: nn::Linear,
}

impl Block {
    fn new(path: nn::Path<'_>, layer_idx: usize, config: &TransformerConfig) -> Self {
        let h = config.hidden_size as i64;
        let i = config.intermediate_size as i64;
        let no_bias = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };

        Self {
            layer_idx,
            num_heads: config.num_heads as i64,
            head_dim: h / config.num_heads as i64,
            attn_norm: nn::layer_norm(&path / "attn_norm", vec![h], Default::default()),
            q_proj: nn::linear(&path / "q_proj", h, h, no_bias),
            k_proj: nn::linear(&path / "k_proj", h, h, no_bias),
            v_proj: nn::linear(&path / "v_proj", h, h, no_bias),
            o_proj: nn::linear(&path / "o_proj", h, h, no_bias),
            mlp_norm: nn::layer_norm(&path / "mlp_norm", vec![h], Default::default()),
            up_proj: nn::linear(&path / "up_proj", h, i, no_bias),
            down_proj: nn::linear(&path / "down_proj", i, h, no_bias),
        }
    }

    /// Base projection plus the adapter correction, if any
    fn project(
        &self,
        x: &Tensor,
        linear: &nn::Linear,
        module: &str,
        hook: Option<&dyn LoraHook>,
        train: bool,
    ) -> Result<Tensor> {
        let base = linear.forward(x);
        match hook {
            Some(hook) => match hook.delta(x, module, self.layer_idx, train)? {
                Some(delta) => Ok(base + delta),
                None => Ok(base),
            },
            None => Ok(base),
        }
    }

    fn attention(
        &self,
        x: &Tensor,
        mask: &Tensor,
        hook: Option<&dyn LoraHook>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq, hidden) = x.size3()?;
        let split = |t: Tensor| t.view([batch, seq, self.num_heads, self.head_dim]).transpose(1, 2);

        let q = split(self.project(x, &self.q_proj, "q_proj", hook, train)?);
        let k = split(self.project(x, &self.k_proj, "k_proj", hook, train)?);
        let v = split(self.project(x, &self.v_proj, "v_proj", hook, train)?);

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.transpose(-2, -1)) * scale;

        // Causal lower triangle, intersected with the key padding mask
        let causal = Tensor::ones([seq, seq], (Kind::Float, x.device())).tril(0);
        let allowed = causal.view([1, 1, seq, seq]) * mask.view([batch, 1, 1, seq]);
        let scores = scores.masked_fill(&allowed.eq(0.0), MASK_VALUE);

        let context = scores
            .softmax(-1, Kind::Float)
            .matmul(&v)
            .transpose(1, 2)
            .contiguous()
            .view([batch, seq, hidden]);

        self.project(&context, &self.o_proj, "o_proj", hook, train)
    }

    fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        hook: Option<&dyn LoraHook>,
        train: bool,
    ) -> Result<Tensor> {
        let attn = self.attention(&x.apply(&self.attn_norm), mask, hook, train)?;
        let x = x + attn;

        let h = x.apply(&self.mlp_norm);
        let up = self.project(&h, &self.up_proj, "up_proj", hook, train)?.gelu("none");
        let down = self.project(&up, &self.down_proj, "down_proj", hook, train)?;
        Ok(x + down)
    }
}

/// Small causal LM used as the reference edit target
pub struct SmallTransformer {
    vs: VarStore,
    config: TransformerConfig,
    dims: ModelDims,
    embed_tokens: nn::Embedding,
    embed_positions: nn::Embedding,
    blocks: Vec<Block>,
    norm: nn::LayerNorm,
    lm_head: nn::Linear,
    flags: TrainingFlags,
}

impl SmallTransformer {
    /// Randomly initialised model on `device`
    pub fn new(config: TransformerConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let vs = VarStore::new(device);
        let root = vs.root();
        let h = config.hidden_size as i64;

        let embed_tokens = nn::embedding(
            &root / "embed_tokens",
            config.vocab_size as i64,
            h,
            Default::default(),
        );
        let embed_positions = nn::embedding(
            &root / "embed_positions",
            config.max_position_embeddings as i64,
            h,
            Default::default(),
        );
        let layers = &root / "layers";
        let blocks = (0..config.num_layers)
            .map(|idx| Block::new(&layers / idx, idx, &config))
            .collect();
        let norm = nn::layer_norm(&root / "norm", vec![h], Default::default());
        let lm_head = nn::linear(
            &root / "lm_head",
            h,
            config.vocab_size as i64,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        );

        let dims = config.dims();
        Ok(Self {
            vs,
            config,
            dims,
            embed_tokens,
            embed_positions,
            blocks,
            norm,
            lm_head,
            flags: TrainingFlags::default(),
        })
    }

    /// Load `config.json` and `model.safetensors` from a model directory
    pub fn load(dir: &Path, device: Device) -> Result<Self> {
        let config_path = dir.join(constants::env::MODEL_CONFIG_FILE);
        let config: TransformerConfig =
            serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        let mut model = Self::new(config, device)?;

        let weights = dir.join(constants::env::MODEL_WEIGHTS_FILE);
        model.vs.load(&weights)?;
        tracing::info!(
            "Loaded model from {} ({} layers, hidden {})",
            dir.display(),
            model.config.num_layers,
            model.config.hidden_size
        );
        Ok(model)
    }

    /// Write `config.json` and `model.safetensors` into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(constants::env::MODEL_CONFIG_FILE),
            serde_json::to_string_pretty(&self.config)?,
        )?;
        self.vs.save(dir.join(constants::env::MODEL_WEIGHTS_FILE))?;
        Ok(())
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }
}

impl CausalLm for SmallTransformer {
    fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        hook: Option<&dyn LoraHook>,
        train: bool,
    ) -> Result<Tensor> {
        let seq = input_ids.size().last().copied().unwrap_or(0);
        if seq as usize > self.config.max_position_embeddings {
            return Err(EditError::config(format!(
                "Sequence length {} exceeds max_position_embeddings {}",
                seq, self.config.max_position_embeddings
            )));
        }

        // Positions count content tokens only, so left padding does not shift them
        let position_ids = (attention_mask.cumsum(-1, Kind::Int64) - 1).clamp_min(0);
        let mut hidden =
            input_ids.apply(&self.embed_tokens) + position_ids.apply(&self.embed_positions);
        if train && self.flags.input_require_grads && !hidden.requires_grad() {
            hidden = hidden.set_requires_grad(true);
        }

        let mask = attention_mask.to_kind(Kind::Float);
        for block in &self.blocks {
            hidden = block.forward(&hidden, &mask, hook, train)?;
        }

        Ok(hidden.apply(&self.norm).apply(&self.lm_head))
    }

    fn dims(&self) -> &ModelDims {
        &self.dims
    }

    fn device(&self) -> Device {
        self.vs.device()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut vars: Vec<(String, Tensor)> = self.vs.variables().into_iter().collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    fn freeze(&mut self) {
        self.vs.freeze();
    }

    fn flags(&self) -> TrainingFlags {
        self.flags
    }

    fn set_use_cache(&mut self, enabled: bool) {
        self.flags.use_cache = enabled;
    }

    fn gradient_checkpointing_enable(&mut self) {
        self.flags.gradient_checkpointing = true;
    }

    fn enable_input_require_grads(&mut self) {
        self.flags.input_require_grads = true;
    }
}
