//! Importance tracking and importance-guided pruning
//!
//! Each adapter tensor carries an elementwise importance estimate
//! `|grad * value|`, smoothed across micro-batches with an exponential moving
//! average. Pruning zeroes entries whose importance falls below the k-th
//! smallest value along the tensor's feature axis and bounds what remains.

use std::collections::HashMap;
use tch::Tensor;

use crate::constants::pruning;
use crate::error::{EditError, Result};
use crate::lora::AdapterParameter;

/// Run-scoped importance estimates keyed by parameter name
pub struct ImportanceScores {
    scores: HashMap<String, Tensor>,
    decay: f64,
}

impl Default for ImportanceScores {
    fn default() -> Self {
        Self::new(pruning::IMPORTANCE_DECAY)
    }
}

impl ImportanceScores {
    pub fn new(decay: f64) -> Self {
        Self {
            scores: HashMap::new(),
            decay,
        }
    }

    /// Fold the current gradients into the estimates
    ///
    /// Call after `backward` and before the optimizer step. A parameter seen
    /// for the first time takes its raw score; a missing gradient scores zero.
    pub fn observe(&mut self, params: &[AdapterParameter]) {
        let _guard = tch::no_grad_guard();
        for param in params {
            let grad = param.tensor.grad();
            let score = if grad.defined() {
                (grad * &param.tensor).abs()
            } else {
                param.tensor.zeros_like()
            };

            match self.scores.get_mut(&param.name) {
                Some(prev) => {
                    let updated = &*prev * self.decay + score * (1.0 - self.decay);
                    *prev = updated;
                }
                None => {
                    self.scores.insert(param.name.clone(), score);
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.scores.get(name)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Prune every parameter to keep roughly `rate` of its entries
    ///
    /// Returns how many parameters were modified.
    pub fn prune(&self, params: &[AdapterParameter], rate: f64) -> Result<usize> {
        let mut pruned = 0;
        for param in params {
            let importance = self.scores.get(&param.name).ok_or_else(|| {
                EditError::UnknownModule(format!("no importance recorded for {}", param.name))
            })?;
            if prune_parameter(
                &param.tensor,
                importance,
                param.role.prune_dim(),
                rate,
                pruning::VALUE_CLAMP,
            )? {
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

/// Zero entries of `param` whose importance is strictly below the k-th
/// smallest along `dim`, then clamp the tensor to `[-clamp, clamp]`
///
/// `k = floor(size(dim) * (1 - rate))`. Nothing is touched when `k == 0`.
pub fn prune_parameter(
    param: &Tensor,
    importance: &Tensor,
    dim: i64,
    rate: f64,
    clamp: f64,
) -> Result<bool> {
    let size = importance
        .size()
        .get(dim as usize)
        .copied()
        .ok_or_else(|| EditError::config(format!("cannot prune along dim {}", dim)))?;
    let k = (size as f64 * (1.0 - rate)) as i64;
    if k <= 0 {
        return Ok(false);
    }

    let _guard = tch::no_grad_guard();
    let (threshold, _) = importance.f_kthvalue(k, dim, true)?;
    let below = importance.lt_tensor(&threshold);

    let mut target = param.shallow_clone();
    let _ = target.f_masked_fill_(&below, 0.0)?;
    let _ = target.f_clamp_(-clamp, clamp)?;
    Ok(true)
}

/// Fraction of non-zero entries across `params`
pub fn density(params: &[AdapterParameter]) -> f64 {
    let (nonzero, total) = params.iter().fold((0i64, 0i64), |(nz, tot), p| {
        (
            nz + p.tensor.count_nonzero(None).int64_value(&[]),
            tot + p.tensor.numel() as i64,
        )
    });
    if total == 0 {
        1.0
    } else {
        nonzero as f64 / total as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::lora::AdapterRole;
    use tch::{Device, Kind};

    fn param(name: &str, role: AdapterRole, values: &[f32], shape: [i64; 2]) -> AdapterParameter {
        AdapterParameter {
            name: name.to_owned(),
            role,
            tensor: Tensor::from_slice(values).view(shape).set_requires_grad(true),
        }
    }

    #[test]
    fn test_first_observation_then_ema() {
        let mut p = param("layers.0.q_proj.lora_B", AdapterRole::B, &[1.0, -2.0, 3.0, 4.0], [2, 2]);
        let mut scores = ImportanceScores::default();

        (&p.tensor * 2.0).sum(Kind::Float).backward();
        scores.observe(std::slice::from_ref(&p));
        // |2 * v|
        let first = scores.get(&p.name).unwrap();
        assert!((first.double_value(&[0, 1]) - 4.0).abs() < 1e-6);

        p.tensor.zero_grad();
        (&p.tensor * 1.0).sum(Kind::Float).backward();
        scores.observe(std::slice::from_ref(&p));
        // 0.8 * 4 + 0.2 * 2
        let second = scores.get(&p.name).unwrap();
        assert!((second.double_value(&[0, 1]) - 3.6).abs() < 1e-6);
        assert!(!second.requires_grad());
    }

    #[test]
    fn test_missing_gradient_scores_zero() {
        let p = param("layers.0.v_proj.lora_A", AdapterRole::A, &[1.0, 2.0], [1, 2]);
        let mut scores = ImportanceScores::default();
        scores.observe(std::slice::from_ref(&p));
        let score = scores.get(&p.name).unwrap();
        assert_eq!(score.abs().sum(Kind::Float).double_value(&[]), 0.0);
        assert_eq!(scores.len(), 1);
    }

    #[test]
    fn test_prune_b_along_rows() {
        let values = Tensor::full([4, 2], 0.5, (Kind::Float, Device::Cpu));
        let importance = Tensor::from_slice(&[4.0f32, 1.0, 3.0, 2.0, 1.0, 3.0, 2.0, 4.0]).view([4, 2]);

        // k = floor(4 * 0.5) = 2: threshold is the 2nd smallest per column
        let changed = prune_parameter(&values, &importance, 0, 0.5, 3e-3).unwrap();
        assert!(changed);

        let zeros_per_col = values.eq(0.0).to_kind(Kind::Int64).sum_dim_intlist(&[0i64][..], false, Kind::Int64);
        assert_eq!(zeros_per_col.int64_value(&[0]), 1);
        assert_eq!(zeros_per_col.int64_value(&[1]), 1);
        assert_eq!(values.double_value(&[2, 0]), 0.0);
        assert_eq!(values.double_value(&[0, 1]), 0.0);
        assert!(values.abs().max().double_value(&[]) <= 3e-3 + 1e-9);
    }

    #[test]
    fn test_prune_a_along_columns() {
        let values = Tensor::full([2, 4], -1.0, (Kind::Float, Device::Cpu));
        let importance = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 4.0, 3.0, 2.0, 1.0]).view([2, 4]);

        // k = floor(4 * 0.25) = 3
        prune_parameter(&values, &importance, 1, 0.25, 3e-3).unwrap();
        let zeros_per_row = values.eq(0.0).to_kind(Kind::Int64).sum_dim_intlist(&[1i64][..], false, Kind::Int64);
        assert_eq!(zeros_per_row.int64_value(&[0]), 2);
        assert_eq!(zeros_per_row.int64_value(&[1]), 2);
        assert!((values.double_value(&[0, 3]) + 3e-3).abs() < 1e-9);
    }

    #[test]
    fn test_k_zero_is_skipped() {
        let values = Tensor::full([2, 2], 1.0, (Kind::Float, Device::Cpu));
        let importance = Tensor::ones([2, 2], (Kind::Float, Device::Cpu));
        // floor(2 * 0.4) = 0
        let changed = prune_parameter(&values, &importance, 0, 0.6, 3e-3).unwrap();
        assert!(!changed);
        assert_eq!(values.double_value(&[0, 0]), 1.0);
    }

    #[test]
    fn test_prune_requires_observation() {
        let p = param("layers.0.q_proj.lora_A", AdapterRole::A, &[1.0, 2.0], [1, 2]);
        let scores = ImportanceScores::default();
        assert!(scores.prune(std::slice::from_ref(&p), 0.5).is_err());
    }

    #[test]
    fn test_density() {
        let p = param("a.lora_A", AdapterRole::A, &[0.0, 1.0, 0.0, 2.0], [2, 2]);
        assert!((density(std::slice::from_ref(&p)) - 0.5).abs() < 1e-12);
        assert_eq!(density(&[]), 1.0);
    }
}
