// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mean-squared-error estimation and importance normalization.
//!
//! For a downstream node with sampled magnitudes `x_s` and reference mean
//! `m`, the normalized error is
//!
//! ```text
//! mse = mean_s( (coeff * (x_s - m))^2 ),   coeff = 1 / profile.max
//! ```
//!
//! Importance scores are MSE increases over baseline, clamped at zero and
//! divided by the largest increase among their siblings (floored at a small
//! epsilon).

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{DType, Tensor};

use super::edges::EdgeSearch;
use super::sampling::sample_downstream_feature_magnitudes;
use crate::circuit::{Edge, Node};
use crate::error::{CircuitError, Result};

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

impl EdgeSearch<'_> {
    /// Estimate the normalized MSE of each downstream node under a retained
    /// edge set, measured against `downstream_means`.
    ///
    /// Each node's scale coefficient comes from its own feature index in the
    /// downstream layer's profile.
    ///
    /// # Shapes
    /// - `upstream_magnitudes`: `[seq, n_features(upstream)]`
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] if a node has no reference mean,
    /// [`CircuitError::Profile`] if its profile entry is missing or
    /// degenerate, and propagates sampling errors.
    pub fn estimate_downstream_node_mses(
        &self,
        downstream_nodes: &BTreeSet<Node>,
        edges: &BTreeSet<Edge>,
        upstream_magnitudes: &Tensor,
        downstream_means: &BTreeMap<Node, f32>,
        target_token_idx: usize,
    ) -> Result<BTreeMap<Node, f32>> {
        let sampled = sample_downstream_feature_magnitudes(
            self.model,
            self.ablator,
            downstream_nodes,
            edges,
            upstream_magnitudes,
            target_token_idx,
            self.config.num_samples,
        )?;

        let mut mses = BTreeMap::new();
        for (node, magnitudes) in &sampled {
            let reference = downstream_means.get(node).copied().ok_or_else(|| {
                CircuitError::Search(format!("no reference mean for downstream node {node}"))
            })?;
            let coeff = self
                .profile
                .layer(node.layer_idx)?
                .feature(node.feature_idx)?
                .norm_coefficient()?;
            mses.insert(*node, normalized_mse(magnitudes, reference, coeff)?);
        }
        Ok(mses)
    }

    /// Estimate the mean sampled magnitude of each downstream node under a
    /// retained edge set.
    ///
    /// Uses [`mean_num_samples`](Self::mean_num_samples) draws, more than the
    /// main search, since these means are the reference for every later
    /// comparison.
    ///
    /// # Errors
    ///
    /// Propagates sampling errors.
    pub fn estimate_downstream_node_means(
        &self,
        downstream_nodes: &BTreeSet<Node>,
        edges: &BTreeSet<Edge>,
        upstream_magnitudes: &Tensor,
        target_token_idx: usize,
    ) -> Result<BTreeMap<Node, f32>> {
        let sampled = sample_downstream_feature_magnitudes(
            self.model,
            self.ablator,
            downstream_nodes,
            edges,
            upstream_magnitudes,
            target_token_idx,
            self.mean_num_samples(),
        )?;

        sampled
            .iter()
            .map(|(node, magnitudes)| Ok((*node, sample_mean(magnitudes)?)))
            .collect()
    }
}

/// Normalized mean-squared error of samples around a reference value.
///
/// # Shapes
/// - `samples`: any shape; reduced over every element
///
/// # Errors
///
/// Returns [`CircuitError::Model`] on tensor operation failures.
pub fn normalized_mse(samples: &Tensor, reference: f32, coeff: f32) -> Result<f32> {
    // PROMOTE: reductions in f32 regardless of storage dtype
    let samples = samples.to_dtype(DType::F32)?;
    let scaled = ((samples - f64::from(reference))? * f64::from(coeff))?;
    Ok(scaled.sqr()?.mean_all()?.to_scalar::<f32>()?)
}

/// Mean of all sampled values.
///
/// # Errors
///
/// Returns [`CircuitError::Model`] on tensor operation failures.
pub fn sample_mean(samples: &Tensor) -> Result<f32> {
    Ok(samples
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?)
}

/// Arithmetic mean of a slice, `None` when empty.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub(crate) fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Minimum and maximum raw MSE increase within one sibling group.
///
/// Both are `0.0` for a group without candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IncreaseStats {
    /// Smallest raw increase (may be negative).
    pub min: f32,
    /// Largest raw increase (may be negative).
    pub max: f32,
}

impl IncreaseStats {
    /// Stats over a slice of increases (zeros when empty).
    #[must_use]
    pub fn from_increases(increases: &[f32]) -> Self {
        if increases.is_empty() {
            return Self::default();
        }
        let min = increases.iter().copied().fold(f32::INFINITY, f32::min);
        let max = increases.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        Self { min, max }
    }
}

/// Normalize raw MSE increases within sibling groups.
///
/// `importance = max(increase, 0) / max(group_max, floor)`, where a key's
/// group is `sibling_of(key)`. Every group listed in `groups` gets a stats
/// entry, including groups without candidates.
///
/// ```
/// use std::collections::BTreeMap;
/// use candle_circuits::search::normalize_increases;
///
/// let increases: BTreeMap<(u8, u8), f32> =
///     [((0, 0), 0.5), ((0, 1), 0.25), ((1, 0), -0.1)].into_iter().collect();
/// let (importance, stats) =
///     normalize_increases(&increases, |k| k.0, [0, 1, 2], 1e-6);
/// assert_eq!(importance[&(0, 0)], 1.0);
/// assert_eq!(importance[&(0, 1)], 0.5);
/// assert_eq!(importance[&(1, 0)], 0.0);
/// assert_eq!(stats[&2].max, 0.0);
/// ```
pub fn normalize_increases<K, G>(
    increases: &BTreeMap<K, f32>,
    sibling_of: impl Fn(&K) -> G,
    groups: impl IntoIterator<Item = G>,
    floor: f32,
) -> (BTreeMap<K, f32>, BTreeMap<G, IncreaseStats>)
where
    K: Ord + Clone,
    G: Ord + Clone,
{
    let mut per_group: BTreeMap<G, Vec<f32>> =
        groups.into_iter().map(|g| (g, Vec::new())).collect();
    for (key, increase) in increases {
        per_group.entry(sibling_of(key)).or_default().push(*increase);
    }
    let stats: BTreeMap<G, IncreaseStats> = per_group
        .into_iter()
        .map(|(group, values)| (group, IncreaseStats::from_increases(&values)))
        .collect();

    let importance = increases
        .iter()
        .map(|(key, increase)| {
            let group_max = stats
                .get(&sibling_of(key))
                .map_or(0.0, |s| s.max)
                .max(floor);
            (key.clone(), increase.max(0.0) / group_max)
        })
        .collect();
    (importance, stats)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
