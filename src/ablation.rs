// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resampling ablation of upstream feature magnitudes.
//!
//! A [`ResampleAblator`] takes a set of circuit variants and produces
//! stochastic samples of upstream feature magnitudes in which only the nodes
//! of each variant keep their true values; every other feature is drawn
//! from a background distribution.
//!
//! [`PoolAblator`] draws from a fixed pool of background magnitudes
//! (typically collected over a dataset), optionally restricted to the
//! `k` pool entries nearest to the true magnitudes at the target token.

use std::sync::Mutex;

use candle_core::{D, DType, IndexOp, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::circuit::Circuit;
use crate::error::{CircuitError, Result};

// ---------------------------------------------------------------------------
// ResampleAblator trait
// ---------------------------------------------------------------------------

/// Produces resampled upstream feature magnitudes for circuit variants.
pub trait ResampleAblator: Send + Sync {
    /// Maximum number of distinct background samples available, or `None`
    /// when unbounded. Used to cap oversampling requests.
    fn k_nearest(&self) -> Option<usize>;

    /// Draw `num_samples` patched magnitude tensors per circuit variant.
    ///
    /// # Shapes
    /// - `upstream_magnitudes`: `[seq, n_features]` -- true magnitudes at `layer_idx`
    /// - returns: one `[num_samples, seq, n_features]` tensor per variant,
    ///   in the order of `circuit_variants`
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Ablation`] if the variants cannot be sampled
    /// for this layer, or [`CircuitError::Model`] on tensor failures.
    fn sample(
        &self,
        layer_idx: usize,
        target_token_idx: usize,
        circuit_variants: &[Circuit],
        upstream_magnitudes: &Tensor,
        num_samples: usize,
    ) -> Result<Vec<Tensor>>;
}

/// Sample patched upstream magnitudes for every variant and check the
/// ablator honoured the request.
///
/// # Shapes
/// - `upstream_magnitudes`: `[seq, n_features]`
/// - returns: one `[num_samples, seq, n_features]` tensor per variant
///
/// # Errors
///
/// Propagates ablator errors unmodified; returns [`CircuitError::Ablation`]
/// if the ablator returns the wrong number of tensors or wrong shapes.
pub fn patch_feature_magnitudes(
    ablator: &dyn ResampleAblator,
    layer_idx: usize,
    target_token_idx: usize,
    circuit_variants: &[Circuit],
    upstream_magnitudes: &Tensor,
    num_samples: usize,
) -> Result<Vec<Tensor>> {
    let (seq_len, n_features) = upstream_magnitudes.dims2()?;
    let patched = ablator.sample(
        layer_idx,
        target_token_idx,
        circuit_variants,
        upstream_magnitudes,
        num_samples,
    )?;
    if patched.len() != circuit_variants.len() {
        return Err(CircuitError::Ablation(format!(
            "ablator returned {} sample sets for {} variants",
            patched.len(),
            circuit_variants.len()
        )));
    }
    for samples in &patched {
        if samples.dims() != [num_samples, seq_len, n_features] {
            return Err(CircuitError::Ablation(format!(
                "expected samples of shape [{num_samples}, {seq_len}, {n_features}], got {:?}",
                samples.dims()
            )));
        }
    }
    Ok(patched)
}

// ---------------------------------------------------------------------------
// PoolAblator
// ---------------------------------------------------------------------------

/// Resampling ablator backed by pools of background feature magnitudes.
///
/// For each layer the pool has shape `[pool_size, pool_seq, n_features]`;
/// `pool_seq` must be at least the sequence length being ablated. Each
/// sample copies one pool entry (chosen uniformly among the `k_nearest`
/// entries closest to the true magnitudes at the target token, or among all
/// entries) and then restores the true values of the variant's nodes.
///
/// Draws come from a seeded [`StdRng`], so a fresh ablator with the same
/// seed reproduces the same samples.
#[derive(Debug)]
pub struct PoolAblator {
    /// Background magnitudes per layer, each `[pool_size, pool_seq, n_features]`.
    pools: Vec<Tensor>,
    /// Number of nearest pool entries to sample from (`None` = whole pool).
    k_nearest: Option<usize>,
    /// Sampling RNG.
    rng: Mutex<StdRng>,
}

impl PoolAblator {
    /// Create an ablator from per-layer pools.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Ablation`] if a pool is not 3D or empty, or
    /// if `k_nearest` is `Some(0)`.
    pub fn new(pools: Vec<Tensor>, k_nearest: Option<usize>, seed: u64) -> Result<Self> {
        for (layer, pool) in pools.iter().enumerate() {
            let (pool_size, _, _) = pool.dims3().map_err(|_| {
                CircuitError::Ablation(format!(
                    "layer {layer} pool must be [pool_size, seq, n_features], got {:?}",
                    pool.dims()
                ))
            })?;
            if pool_size == 0 {
                return Err(CircuitError::Ablation(format!("layer {layer} pool is empty")));
            }
        }
        if k_nearest == Some(0) {
            return Err(CircuitError::Ablation("k_nearest must be at least 1".into()));
        }
        Ok(Self {
            pools,
            k_nearest,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Number of pool entries at a layer.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Ablation`] if the layer has no pool.
    pub fn pool_size(&self, layer_idx: usize) -> Result<usize> {
        Ok(self.pool(layer_idx)?.dim(0)?)
    }

    /// Pool for a layer.
    fn pool(&self, layer_idx: usize) -> Result<&Tensor> {
        self.pools
            .get(layer_idx)
            .ok_or_else(|| CircuitError::Ablation(format!("no background pool for layer {layer_idx}")))
    }

    /// Pool indices eligible for sampling, nearest first.
    ///
    /// # Shapes
    /// - `pool`: `[pool_size, seq, n_features]`
    /// - `upstream_magnitudes`: `[seq, n_features]`
    fn candidate_indices(
        &self,
        pool: &Tensor,
        upstream_magnitudes: &Tensor,
        target_token_idx: usize,
    ) -> Result<Vec<u32>> {
        let pool_size = pool.dim(0)?;
        let all = (0..pool_size)
            .map(|i| u32::try_from(i).map_err(|_| CircuitError::Ablation("pool too large".into())))
            .collect::<Result<Vec<u32>>>()?;
        let k = match self.k_nearest {
            Some(k) if k < pool_size => k,
            _ => return Ok(all),
        };

        // PROMOTE: distances in f32 regardless of storage dtype
        let pool_rows = pool.i((.., target_token_idx, ..))?.to_dtype(DType::F32)?;
        let target_row = upstream_magnitudes
            .i(target_token_idx)?
            .to_dtype(DType::F32)?;
        let distances: Vec<f32> = pool_rows
            .broadcast_sub(&target_row)?
            .sqr()?
            .sum(D::Minus1)?
            .to_vec1()?;

        let mut ranked: Vec<(u32, f32)> = all.into_iter().zip(distances).collect();
        ranked.sort_by(|(_, a), (_, b)| a.total_cmp(b));
        Ok(ranked.into_iter().take(k).map(|(idx, _)| idx).collect())
    }
}

/// Build a `[seq, n_features]` mask with `1.0` at every kept node.
fn keep_mask(
    variant: &Circuit,
    layer_idx: usize,
    seq_len: usize,
    n_features: usize,
) -> Result<Vec<f32>> {
    let mut mask = vec![0.0_f32; seq_len * n_features];
    for node in variant.nodes() {
        if node.layer_idx != layer_idx {
            return Err(CircuitError::Ablation(format!(
                "variant node {node} is not on layer {layer_idx}"
            )));
        }
        if node.token_idx >= seq_len || node.feature_idx >= n_features {
            return Err(CircuitError::Ablation(format!(
                "variant node {node} out of range for [{seq_len}, {n_features}] magnitudes"
            )));
        }
        if let Some(slot) = mask.get_mut(node.token_idx * n_features + node.feature_idx) {
            *slot = 1.0;
        }
    }
    Ok(mask)
}

impl ResampleAblator for PoolAblator {
    fn k_nearest(&self) -> Option<usize> {
        self.k_nearest
    }

    fn sample(
        &self,
        layer_idx: usize,
        target_token_idx: usize,
        circuit_variants: &[Circuit],
        upstream_magnitudes: &Tensor,
        num_samples: usize,
    ) -> Result<Vec<Tensor>> {
        let (seq_len, n_features) = upstream_magnitudes.dims2()?;
        let pool = self.pool(layer_idx)?;
        let (_, pool_seq, pool_features) = pool.dims3()?;
        if pool_features != n_features || pool_seq < seq_len {
            return Err(CircuitError::Ablation(format!(
                "layer {layer_idx} pool [_, {pool_seq}, {pool_features}] cannot cover \
                 magnitudes [{seq_len}, {n_features}]"
            )));
        }
        if target_token_idx >= seq_len {
            return Err(CircuitError::Ablation(format!(
                "target token {target_token_idx} out of range (seq_len={seq_len})"
            )));
        }

        let device = upstream_magnitudes.device();
        let dtype = upstream_magnitudes.dtype();
        let pool = pool
            .narrow(1, 0, seq_len)?
            .contiguous()?
            .to_dtype(dtype)?
            .to_device(device)?;
        let candidates = self.candidate_indices(&pool, upstream_magnitudes, target_token_idx)?;

        let mut rng = self
            .rng
            .lock()
            .map_err(|_| CircuitError::Ablation("sampling rng lock poisoned".into()))?;

        let mut patched = Vec::with_capacity(circuit_variants.len());
        for variant in circuit_variants {
            let mask = keep_mask(variant, layer_idx, seq_len, n_features)?;
            let mask = Tensor::from_vec(mask, (seq_len, n_features), device)?.to_dtype(dtype)?;
            let inverse = mask.affine(-1.0, 1.0)?;
            let kept = (upstream_magnitudes * &mask)?;

            let drawn = (0..num_samples)
                .map(|_| {
                    candidates
                        .choose(&mut *rng)
                        .copied()
                        .ok_or_else(|| CircuitError::Ablation("no pool entries to sample".into()))
                })
                .collect::<Result<Vec<u32>>>()?;
            let drawn = Tensor::from_vec(drawn, num_samples, device)?;

            // [num_samples, seq, n_features]
            let background = pool.index_select(&drawn, 0)?;
            patched.push(background.broadcast_mul(&inverse)?.broadcast_add(&kept)?);
        }
        Ok(patched)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
