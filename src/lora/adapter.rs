//! VarStore-backed LoRA adapter with role-tagged parameters
//!
//! Each adapted (layer, module) pair owns an A matrix `[rank, in_features]`
//! (Kaiming uniform) and a B matrix `[out_features, rank]` (zeros), so a
//! fresh adapter starts as an exact no-op on the base model.

use safetensors::tensor::{SafeTensors, TensorView};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tch::nn::VarStore;
use tch::{Device, Kind, Tensor};

use super::{AdapterParameter, AdapterRole, LoraConfig, LoraHook};
use crate::error::{EditError, Result};
use crate::model::ModelDims;

/// Low-rank adapter over a set of linear sublayers
pub struct LoraAdapter {
    /// LoRA A matrices: "layer_idx.module_name" -> [rank, in_features]
    lora_a: BTreeMap<String, Tensor>,
    /// LoRA B matrices: "layer_idx.module_name" -> [out_features, rank]
    lora_b: BTreeMap<String, Tensor>,
    /// VarStore owning all trainable parameters
    vs: VarStore,
    config: LoraConfig,
    scaling: f64,
    device: Device,
}

impl LoraAdapter {
    /// Create adapters for every target module on every selected layer
    pub fn new(config: LoraConfig, dims: &ModelDims, device: Device) -> Result<Self> {
        config.validate_for(dims)?;

        let vs = VarStore::new(device);
        let root = vs.root();
        let mut lora_a = BTreeMap::new();
        let mut lora_b = BTreeMap::new();
        let rank = config.rank as i64;

        for layer_idx in (0..dims.num_layers).filter(|&idx| config.transforms_layer(idx)) {
            for module_name in &config.target_modules {
                let (in_features, out_features) = dims
                    .modules
                    .get(module_name)
                    .ok_or_else(|| EditError::UnknownModule(module_name.clone()))?;

                // '.' is VarStore's path separator
                let path = root.sub("layers").sub(layer_idx).sub(module_name);
                let a = path.kaiming_uniform(AdapterRole::A.as_str(), &[rank, *in_features as i64]);
                let b = path.zeros(AdapterRole::B.as_str(), &[*out_features as i64, rank]);

                let key = format!("{}.{}", layer_idx, module_name);
                lora_a.insert(key.clone(), a);
                lora_b.insert(key, b);
            }
        }

        let scaling = config.scaling();
        let adapter = Self {
            lora_a,
            lora_b,
            vs,
            config,
            scaling,
            device,
        };

        tracing::info!(
            "Created LoRA adapter: {} sublayers, rank {}, {} trainable parameters",
            adapter.lora_a.len(),
            adapter.config.rank,
            adapter.num_parameters()
        );

        Ok(adapter)
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// VarStore holding every trainable adapter tensor (optimizer target)
    pub fn var_store(&self) -> &VarStore {
        &self.vs
    }

    /// Check if this adapter covers a module at the given layer
    pub fn has_module(&self, module_name: &str, layer_idx: usize) -> bool {
        self.lora_a.contains_key(&format!("{}.{}", layer_idx, module_name))
    }

    /// All trainable parameters tagged with their role, sorted by name
    pub fn named_parameters(&self) -> Vec<AdapterParameter> {
        let mut vars: Vec<(String, Tensor)> = self.vs.variables().into_iter().collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars.into_iter()
            .filter_map(|(name, tensor)| {
                AdapterRole::from_name(&name).map(|role| AdapterParameter { name, role, tensor })
            })
            .collect()
    }

    pub fn num_parameters(&self) -> i64 {
        self.lora_a
            .values()
            .chain(self.lora_b.values())
            .map(|t| t.size().iter().product::<i64>())
            .sum()
    }

    /// Compute the correction for one sublayer: scaling * (dropout(x) @ A^T) @ B^T
    pub fn forward(&self, x: &Tensor, module_name: &str, layer_idx: usize, train: bool) -> Result<Tensor> {
        let key = format!("{}.{}", layer_idx, module_name);
        let a = self
            .lora_a
            .get(&key)
            .ok_or_else(|| EditError::UnknownModule(key.clone()))?;
        let b = self
            .lora_b
            .get(&key)
            .ok_or_else(|| EditError::UnknownModule(key.clone()))?;

        let train = train && !self.config.inference_mode;
        let x = x.to_kind(a.kind());
        let x = if train && self.config.dropout > 0.0 {
            x.dropout(self.config.dropout, true)
        } else {
            x
        };

        let intermediate = x.f_matmul(&a.tr())?;
        let output = intermediate.f_matmul(&b.tr())?;
        Ok(output * self.scaling)
    }

    /// Extract state dict (A and B tensors) as deep copies
    ///
    /// Keys use the format `"layer_idx.module_name.lora_A"` / `"layer_idx.module_name.lora_B"`.
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        let _guard = tch::no_grad_guard();
        let mut state = HashMap::new();
        for (key, a) in &self.lora_a {
            state.insert(format!("{}.{}", key, AdapterRole::A.as_str()), a.copy());
        }
        for (key, b) in &self.lora_b {
            state.insert(format!("{}.{}", key, AdapterRole::B.as_str()), b.copy());
        }
        state
    }

    /// Restore A and B tensors from a state dict, in place
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let _guard = tch::no_grad_guard();

        for (key, a_dst) in self.lora_a.iter_mut() {
            if let Some(src) = state.get(&format!("{}.{}", key, AdapterRole::A.as_str())) {
                a_dst.f_copy_(src)?;
            }
        }
        for (key, b_dst) in self.lora_b.iter_mut() {
            if let Some(src) = state.get(&format!("{}.{}", key, AdapterRole::B.as_str())) {
                b_dst.f_copy_(src)?;
            }
        }
        Ok(())
    }

    /// Write the adapter to a safetensors file
    ///
    /// Uses standard HuggingFace PEFT naming:
    /// `base_model.model.layers.{N}.{self_attn|mlp}.{module}.lora_{A|B}.weight`
    pub fn save_safetensors(&self, path: &Path) -> Result<()> {
        let _guard = tch::no_grad_guard();
        let mut pairs = Vec::new();

        for (role, matrices) in [(AdapterRole::A, &self.lora_a), (AdapterRole::B, &self.lora_b)] {
            for (key, tensor) in matrices {
                let (layer_idx, module) = split_key(key)?;
                let peft_key = format!(
                    "base_model.model.layers.{}.{}.{}.{}.weight",
                    layer_idx,
                    module_to_peft_subpath(module),
                    module,
                    role.as_str()
                );
                pairs.push((peft_key, tensor_to_safetensors_data(tensor)?));
            }
        }

        let views = pairs
            .iter()
            .map(|(key, (dtype, shape, bytes))| {
                TensorView::new(*dtype, shape.clone(), bytes)
                    .map(|view| (key.as_str(), view))
                    .map_err(|e| EditError::Safetensors(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let bytes = safetensors::tensor::serialize(views, &None)
            .map_err(|e| EditError::Safetensors(e.to_string()))?;
        std::fs::write(path, bytes)?;

        tracing::info!("Saved LoRA adapter ({} tensors) to {}", pairs.len(), path.display());
        Ok(())
    }

    /// Load A/B values from a PEFT-named safetensors file into this adapter
    ///
    /// Returns the number of tensors restored; tensors for sublayers this
    /// adapter does not cover are skipped.
    pub fn load_safetensors(&mut self, path: &Path) -> Result<usize> {
        let data = std::fs::read(path)?;
        let tensors =
            SafeTensors::deserialize(&data).map_err(|e| EditError::Safetensors(e.to_string()))?;
        let _guard = tch::no_grad_guard();
        let mut loaded = 0;

        for (name, view) in tensors.tensors() {
            let Some((layer_idx, module, role)) = parse_peft_name(&name) else {
                continue;
            };
            let key = format!("{}.{}", layer_idx, module);
            let target = match role {
                AdapterRole::A => self.lora_a.get_mut(&key),
                AdapterRole::B => self.lora_b.get_mut(&key),
            };
            let Some(dst) = target else {
                tracing::debug!("Skipping adapter tensor '{}': sublayer not adapted", name);
                continue;
            };

            let src = safetensors_view_to_tensor(&view, self.device)?;
            if src.size() != dst.size() {
                return Err(EditError::config(format!(
                    "Shape mismatch for '{}': file {:?} vs adapter {:?}",
                    name,
                    src.size(),
                    dst.size()
                )));
            }
            dst.f_copy_(&src)?;
            loaded += 1;
        }

        tracing::info!("Loaded {} adapter tensors from {}", loaded, path.display());
        Ok(loaded)
    }
}

impl LoraHook for LoraAdapter {
    fn delta(&self, x: &Tensor, module: &str, layer_idx: usize, train: bool) -> Result<Option<Tensor>> {
        if !self.has_module(module, layer_idx) {
            return Ok(None);
        }
        self.forward(x, module, layer_idx, train).map(Some)
    }
}

fn split_key(key: &str) -> Result<(usize, &str)> {
    key.split_once('.')
        .and_then(|(layer, module)| layer.parse().ok().map(|idx| (idx, module)))
        .ok_or_else(|| EditError::UnknownModule(key.to_owned()))
}

/// Map module name to PEFT subpath
fn module_to_peft_subpath(module: &str) -> &str {
    match module {
        "gate_proj" | "up_proj" | "down_proj" => "mlp",
        _ => "self_attn",
    }
}

/// "base_model.model.layers.5.self_attn.q_proj.lora_A.weight" -> (5, "q_proj", A)
fn parse_peft_name(name: &str) -> Option<(usize, String, AdapterRole)> {
    let parts: Vec<&str> = name.split('.').collect();
    let role_idx = parts
        .iter()
        .position(|part| AdapterRole::from_name(part).is_some())?;
    if role_idx == 0 {
        return None;
    }
    let role = AdapterRole::from_name(parts[role_idx])?;
    let module = parts[role_idx - 1].to_owned();
    let layer_idx = parts
        .windows(2)
        .find_map(|w| if w[0] == "layers" { w[1].parse().ok() } else { None })?;
    Some((layer_idx, module, role))
}

/// Extract dtype, shape and raw little-endian bytes from a tensor
fn tensor_to_safetensors_data(tensor: &Tensor) -> Result<(safetensors::Dtype, Vec<usize>, Vec<u8>)> {
    let cpu_tensor = tensor.to_device(Device::Cpu).contiguous();
    let kind = cpu_tensor.kind();
    let dtype = match kind {
        Kind::Float => safetensors::Dtype::F32,
        Kind::Half => safetensors::Dtype::F16,
        Kind::BFloat16 => safetensors::Dtype::BF16,
        Kind::Double => safetensors::Dtype::F64,
        other => {
            return Err(EditError::Safetensors(format!(
                "Unsupported adapter tensor kind: {:?}",
                other
            )))
        }
    };
    let shape: Vec<usize> = cpu_tensor.size().iter().map(|&d| d as usize).collect();
    let numel = cpu_tensor.numel();
    let mut bytes = vec![0u8; numel * kind.elt_size_in_bytes()];
    cpu_tensor.copy_data_u8(&mut bytes, numel);
    Ok((dtype, shape, bytes))
}

/// Convert a safetensors view to a tch tensor on `device`
fn safetensors_view_to_tensor(view: &TensorView<'_>, device: Device) -> Result<Tensor> {
    let kind = match view.dtype() {
        safetensors::Dtype::F32 => Kind::Float,
        safetensors::Dtype::F16 => Kind::Half,
        safetensors::Dtype::BF16 => Kind::BFloat16,
        safetensors::Dtype::F64 => Kind::Double,
        other => {
            return Err(EditError::Safetensors(format!(
                "Unsupported safetensors dtype: {:?}",
                other
            )))
        }
    };
    let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
    Ok(Tensor::from_data_size(view.data(), &shape, kind).to_device(device))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn test_dims() -> ModelDims {
        let mut modules = BTreeMap::new();
        modules.insert("q_proj".to_owned(), (16, 16));
        modules.insert("v_proj".to_owned(), (16, 8));
        ModelDims {
            num_layers: 3,
            modules,
        }
    }

    fn test_config() -> LoraConfig {
        LoraConfig {
            rank: 4,
            alpha: 8.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_adapter_creation() {
        let adapter = LoraAdapter::new(test_config(), &test_dims(), Device::Cpu).unwrap();

        // 3 layers * 2 modules
        assert_eq!(adapter.lora_a.len(), 6);
        assert!(adapter.has_module("v_proj", 2));
        assert!((adapter.scaling() - 2.0).abs() < 1e-12);
        // A: 4*16, B(q): 16*4, B(v): 8*4 per layer
        assert_eq!(adapter.num_parameters(), 3 * (64 + 64 + 64 + 32));
    }

    #[test]
    fn test_named_parameters_roles_and_shapes() {
        let adapter = LoraAdapter::new(test_config(), &test_dims(), Device::Cpu).unwrap();
        let params = adapter.named_parameters();

        assert_eq!(params.len(), 12);
        let a = params.iter().find(|p| p.name == "layers.1.v_proj.lora_A").unwrap();
        assert_eq!(a.role, AdapterRole::A);
        assert_eq!(a.tensor.size(), vec![4, 16]);

        let b = params.iter().find(|p| p.name == "layers.1.v_proj.lora_B").unwrap();
        assert_eq!(b.role, AdapterRole::B);
        assert_eq!(b.tensor.size(), vec![8, 4]);
        assert_eq!(b.tensor.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn test_layer_subset_and_validation() {
        let config = LoraConfig {
            layers_to_transform: Some(vec![1]),
            ..test_config()
        };
        let adapter = LoraAdapter::new(config, &test_dims(), Device::Cpu).unwrap();
        assert!(adapter.has_module("q_proj", 1));
        assert!(!adapter.has_module("q_proj", 0));

        let config = LoraConfig {
            layers_to_transform: Some(vec![7]),
            ..test_config()
        };
        assert!(matches!(
            LoraAdapter::new(config, &test_dims(), Device::Cpu),
            Err(EditError::Config(_))
        ));

        let config = LoraConfig {
            target_modules: vec!["gate_proj".to_owned()],
            ..test_config()
        };
        assert!(matches!(
            LoraAdapter::new(config, &test_dims(), Device::Cpu),
            Err(EditError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_fresh_adapter_is_noop_and_gradients_flow() {
        let adapter = LoraAdapter::new(test_config(), &test_dims(), Device::Cpu).unwrap();
        let x = Tensor::randn([2, 5, 16], (Kind::Float, Device::Cpu));

        let out = adapter.forward(&x, "v_proj", 0, true).unwrap();
        assert_eq!(out.size(), vec![2, 5, 8]);
        assert_eq!(out.abs().sum(Kind::Float).double_value(&[]), 0.0);

        out.sum(Kind::Float).backward();
        let b = adapter
            .named_parameters()
            .into_iter()
            .find(|p| p.name == "layers.0.v_proj.lora_B")
            .unwrap();
        assert!(b.tensor.grad().norm().double_value(&[]) > 0.0);

        assert!(adapter.delta(&x, "k_proj", 0, false).unwrap().is_none());
    }

    #[test]
    fn test_safetensors_roundtrip() {
        let adapter = LoraAdapter::new(test_config(), &test_dims(), Device::Cpu).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.safetensors");
        adapter.save_safetensors(&path).unwrap();

        let mut restored = LoraAdapter::new(test_config(), &test_dims(), Device::Cpu).unwrap();
        let loaded = restored.load_safetensors(&path).unwrap();
        assert_eq!(loaded, 12);

        let diff = (&adapter.lora_a["2.q_proj"] - &restored.lora_a["2.q_proj"])
            .abs()
            .sum(Kind::Float)
            .double_value(&[]);
        assert!(diff < 1e-7);
    }

    #[test]
    fn test_state_dict_restore() {
        let mut adapter = LoraAdapter::new(test_config(), &test_dims(), Device::Cpu).unwrap();
        let state = adapter.state_dict();
        {
            let _guard = tch::no_grad_guard();
            let _ = adapter.lora_b.get_mut("0.q_proj").unwrap().fill_(1.0);
        }
        adapter.load_state_dict(&state).unwrap();
        assert_eq!(adapter.lora_b["0.q_proj"].abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn test_parse_peft_name() {
        assert_eq!(
            parse_peft_name("base_model.model.layers.5.self_attn.q_proj.lora_A.weight"),
            Some((5, "q_proj".to_owned(), AdapterRole::A))
        );
        assert_eq!(parse_peft_name("model.embed_tokens.weight"), None);
    }
}
