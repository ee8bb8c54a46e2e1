// SPDX-License-Identifier: MIT OR Apache-2.0

//! Edge and token importance search between two adjacent feature layers.
//!
//! ## Algorithm
//!
//! 1. Run the model once to get upstream feature magnitudes.
//! 2. Enumerate every causal edge in `upstream_nodes x downstream_nodes`.
//! 3. Estimate reference means per downstream node with all edges intact
//!    (oversampled).
//! 4. Estimate baseline MSEs with all edges intact: pure sampling noise.
//! 5. Ablate each edge in turn; score the MSE increase of its downstream node.
//! 6. Ablate all edges leaving each upstream token; score the MSE increase
//!    averaged per downstream token.
//!
//! Increases are clamped at zero and normalized within their sibling group
//! (edges into the same downstream node, or upstream tokens feeding the same
//! downstream token).

use std::collections::{BTreeMap, BTreeSet};

use candle_core::Tensor;
use tracing::info;

use super::mse::{mean, normalize_increases};
use crate::ablation::ResampleAblator;
use crate::backend::SparsifiedModel;
use crate::circuit::{Circuit, Edge, EdgeGroup, Node};
use crate::config::EdgeSearchConfig;
use crate::error::{CircuitError, Result};
use crate::profile::ModelProfile;

// ---------------------------------------------------------------------------
// EdgeSearchResult
// ---------------------------------------------------------------------------

/// Importance scores produced by one search.
///
/// Every value lies in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeSearchResult {
    /// Normalized MSE increase caused by ablating each edge.
    pub edge_importance: BTreeMap<Edge, f32>,
    /// Normalized MSE increase caused by ablating each upstream token,
    /// per downstream token.
    pub token_importance: BTreeMap<EdgeGroup, f32>,
}

impl EdgeSearchResult {
    /// Number of scored edges.
    #[must_use]
    pub fn num_edges(&self) -> usize {
        self.edge_importance.len()
    }

    /// Edges into a downstream node with their importance.
    pub fn edges_into<'a>(&'a self, downstream: &'a Node) -> impl Iterator<Item = (&'a Edge, f32)> {
        self.edge_importance
            .iter()
            .filter(move |(edge, _)| edge.downstream == *downstream)
            .map(|(edge, importance)| (edge, *importance))
    }

    /// The `n` most important edges, highest first (ties in edge order).
    #[must_use]
    pub fn top_edges(&self, n: usize) -> Vec<(Edge, f32)> {
        let mut ranked: Vec<(Edge, f32)> = self
            .edge_importance
            .iter()
            .map(|(edge, importance)| (*edge, *importance))
            .collect();
        ranked.sort_by(|(ea, a), (eb, b)| b.total_cmp(a).then_with(|| ea.cmp(eb)));
        ranked.truncate(n);
        ranked
    }

    /// Edges whose importance is at least `threshold`.
    #[must_use]
    pub fn edges_above(&self, threshold: f32) -> BTreeSet<Edge> {
        self.edge_importance
            .iter()
            .filter(|(_, importance)| **importance >= threshold)
            .map(|(edge, _)| *edge)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// Every causally valid edge between the two node sets.
#[must_use]
pub fn enumerate_edges(
    upstream_nodes: &BTreeSet<Node>,
    downstream_nodes: &BTreeSet<Node>,
) -> BTreeSet<Edge> {
    upstream_nodes
        .iter()
        .flat_map(|upstream| {
            downstream_nodes
                .iter()
                .filter_map(move |downstream| Edge::causal(*upstream, *downstream))
        })
        .collect()
}

/// Every causally valid edge group between the two node sets.
///
/// A group exists for each upstream (layer, token) block and each downstream
/// token at or after it.
#[must_use]
pub fn enumerate_edge_groups(
    upstream_nodes: &BTreeSet<Node>,
    downstream_nodes: &BTreeSet<Node>,
) -> BTreeSet<EdgeGroup> {
    let upstream_blocks: BTreeSet<(usize, usize)> = upstream_nodes
        .iter()
        .map(|node| (node.layer_idx, node.token_idx))
        .collect();
    let downstream_tokens: BTreeSet<usize> =
        downstream_nodes.iter().map(|node| node.token_idx).collect();

    upstream_blocks
        .iter()
        .flat_map(|&(layer_idx, token_idx)| {
            downstream_tokens
                .range(token_idx..)
                .map(move |&downstream_token| EdgeGroup::new(layer_idx, token_idx, downstream_token))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// EdgeSearch
// ---------------------------------------------------------------------------

/// Ablation-based importance search over edges between two adjacent layers.
///
/// Borrows the model, its feature profile, and the upstream ablator for the
/// lifetime of the search; all search state is created per call.
pub struct EdgeSearch<'a> {
    /// Sparsified model (forward pass and downstream recomputation).
    pub(super) model: &'a SparsifiedModel,
    /// Per-feature normalization statistics.
    pub(super) profile: &'a ModelProfile,
    /// Ablator for upstream feature magnitudes.
    // TRAIT_OBJECT: ablation strategies are chosen at runtime
    pub(super) ablator: &'a dyn ResampleAblator,
    /// Sampling and normalization parameters.
    pub(super) config: EdgeSearchConfig,
}

impl<'a> EdgeSearch<'a> {
    /// Create a search.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Config`] if `config` is invalid.
    pub fn new(
        model: &'a SparsifiedModel,
        profile: &'a ModelProfile,
        ablator: &'a dyn ResampleAblator,
        config: EdgeSearchConfig,
    ) -> Result<Self> {
        config.validate()?;
        info!(%config, "edge search configured");
        Ok(Self {
            model,
            profile,
            ablator,
            config,
        })
    }

    /// Samples drawn per circuit variant.
    #[must_use]
    pub const fn num_samples(&self) -> usize {
        self.config.num_samples
    }

    /// Samples drawn when estimating reference means.
    #[must_use]
    pub fn mean_num_samples(&self) -> usize {
        self.config.mean_num_samples(self.ablator.k_nearest())
    }

    /// The search configuration.
    #[must_use]
    pub const fn config(&self) -> &EdgeSearchConfig {
        &self.config
    }

    /// Score every edge and edge group between two adjacent layers.
    ///
    /// `upstream_nodes` must all sit on layer `L` and `downstream_nodes` on
    /// layer `L + 1`. `target_token_idx` is the position whose downstream
    /// behaviour the ablator optimizes sampling for.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] if the downstream set is empty or
    /// mixed-layer, if an upstream node is not on the preceding layer, or if
    /// a token/feature index is out of range. Model, ablator, and profile
    /// errors propagate unmodified; no partial result is returned.
    pub fn search(
        &self,
        tokens: &[u32],
        upstream_nodes: &BTreeSet<Node>,
        downstream_nodes: &BTreeSet<Node>,
        target_token_idx: usize,
    ) -> Result<EdgeSearchResult> {
        let downstream_layer_idx = validate_layers(upstream_nodes, downstream_nodes)?;
        let upstream_layer_idx = downstream_layer_idx - 1;
        info!(
            upstream_layer = upstream_layer_idx,
            downstream_layer = downstream_layer_idx,
            "analyzing edge importance"
        );

        let output = self.model.forward_tokens(tokens)?;
        // [seq, n_features(upstream)]
        let upstream_magnitudes = output.require_layer(upstream_layer_idx)?;
        let (seq_len, n_upstream_features) = upstream_magnitudes.dims2()?;
        if target_token_idx >= seq_len {
            return Err(CircuitError::Search(format!(
                "target token {target_token_idx} out of range (seq_len={seq_len})"
            )));
        }
        validate_ranges(upstream_nodes, seq_len, n_upstream_features, "upstream")?;
        validate_ranges(
            downstream_nodes,
            seq_len,
            self.model.num_features(downstream_layer_idx),
            "downstream",
        )?;

        let all_edges = enumerate_edges(upstream_nodes, downstream_nodes);
        info!(
            edges = all_edges.len(),
            num_samples = self.num_samples(),
            mean_num_samples = self.mean_num_samples(),
            "enumerated candidate edges"
        );

        // Averaged samples make a better reference than the model's own
        // downstream magnitudes.
        let downstream_means = self.estimate_downstream_node_means(
            downstream_nodes,
            &all_edges,
            upstream_magnitudes,
            target_token_idx,
        )?;
        let baseline_mses = self.estimate_downstream_node_mses(
            downstream_nodes,
            &all_edges,
            upstream_magnitudes,
            &downstream_means,
            target_token_idx,
        )?;

        let edge_importance = self.compute_edge_importance(
            &all_edges,
            downstream_nodes,
            &baseline_mses,
            upstream_magnitudes,
            &downstream_means,
            target_token_idx,
        )?;
        let token_importance = self.compute_token_importance(
            &all_edges,
            downstream_nodes,
            &baseline_mses,
            upstream_magnitudes,
            &downstream_means,
            target_token_idx,
        )?;

        Ok(EdgeSearchResult {
            edge_importance,
            token_importance,
        })
    }

    /// Placeholder result that needs no model computation.
    ///
    /// Every causal edge maps to `1.0` and every causal edge group to `0.0`,
    /// using the same enumeration as [`search`](Self::search).
    #[must_use]
    pub fn get_placeholders(
        upstream_nodes: &BTreeSet<Node>,
        downstream_nodes: &BTreeSet<Node>,
    ) -> EdgeSearchResult {
        EdgeSearchResult {
            edge_importance: enumerate_edges(upstream_nodes, downstream_nodes)
                .into_iter()
                .map(|edge| (edge, 1.0))
                .collect(),
            token_importance: enumerate_edge_groups(upstream_nodes, downstream_nodes)
                .into_iter()
                .map(|group| (group, 0.0))
                .collect(),
        }
    }

    /// Normalized MSE increase of each edge's downstream node when that edge
    /// alone is ablated.
    ///
    /// # Errors
    ///
    /// Propagates estimation errors; returns [`CircuitError::Search`] if a
    /// downstream node has no baseline.
    pub fn compute_edge_importance(
        &self,
        all_edges: &BTreeSet<Edge>,
        downstream_nodes: &BTreeSet<Node>,
        baseline_mses: &BTreeMap<Node, f32>,
        upstream_magnitudes: &Tensor,
        downstream_means: &BTreeMap<Node, f32>,
        target_token_idx: usize,
    ) -> Result<BTreeMap<Edge, f32>> {
        let ablation_mses = self.estimate_edge_ablation_effects(
            downstream_nodes,
            all_edges,
            upstream_magnitudes,
            downstream_means,
            target_token_idx,
        )?;

        let mut increases = BTreeMap::new();
        for (edge, mse) in &ablation_mses {
            let baseline = baseline_of(baseline_mses, &edge.downstream)?;
            increases.insert(*edge, mse - baseline);
        }

        let (importance, stats) = normalize_increases(
            &increases,
            |edge| edge.downstream,
            downstream_nodes.iter().copied(),
            self.config.min_max_increase,
        );
        for (node, s) in &stats {
            info!(
                downstream = %node,
                baseline = baseline_mses.get(node).copied().unwrap_or_default(),
                min_increase = s.min,
                max_increase = s.max,
                "edge MSE increase"
            );
        }
        Ok(importance)
    }

    /// Normalized MSE increase per downstream token when every edge leaving
    /// an upstream token is ablated.
    ///
    /// # Errors
    ///
    /// Propagates estimation errors; returns [`CircuitError::Search`] if a
    /// downstream token has no baseline.
    pub fn compute_token_importance(
        &self,
        all_edges: &BTreeSet<Edge>,
        downstream_nodes: &BTreeSet<Node>,
        baseline_mses: &BTreeMap<Node, f32>,
        upstream_magnitudes: &Tensor,
        downstream_means: &BTreeMap<Node, f32>,
        target_token_idx: usize,
    ) -> Result<BTreeMap<EdgeGroup, f32>> {
        let downstream_layer_idx = validate_downstream(downstream_nodes)?;
        let upstream_layer_idx = downstream_layer_idx - 1;
        let downstream_token_idxs: BTreeSet<usize> =
            downstream_nodes.iter().map(|node| node.token_idx).collect();

        let token_baseline_mses = token_baseline_mses(baseline_mses, &downstream_token_idxs)?;
        let token_ablation_mses = self.estimate_token_ablation_effects(
            downstream_nodes,
            all_edges,
            upstream_magnitudes,
            downstream_means,
            target_token_idx,
        )?;

        let mut increases = BTreeMap::new();
        for (downstream_token_idx, upstream_token_mses) in &token_ablation_mses {
            let baseline = token_baseline_mses
                .get(downstream_token_idx)
                .copied()
                .ok_or_else(|| {
                    CircuitError::Search(format!(
                        "no baseline for downstream token {downstream_token_idx}"
                    ))
                })?;
            for (upstream_token_idx, mse) in upstream_token_mses {
                let group =
                    EdgeGroup::new(upstream_layer_idx, *upstream_token_idx, *downstream_token_idx);
                increases.insert(group, mse - baseline);
            }
        }

        let (importance, stats) = normalize_increases(
            &increases,
            |group| group.downstream_token_idx,
            downstream_token_idxs.iter().copied(),
            self.config.min_max_increase,
        );
        for (token, s) in &stats {
            info!(
                downstream_token = *token,
                baseline = token_baseline_mses.get(token).copied().unwrap_or_default(),
                min_increase = s.min,
                max_increase = s.max,
                "token MSE increase"
            );
        }
        Ok(importance)
    }

    /// Downstream MSE when each edge is ablated, keyed by edge.
    ///
    /// Each variant is the full edge set minus one edge; only the ablated
    /// edge's downstream node is measured, since it is the only node whose
    /// dependency set changes.
    ///
    /// # Errors
    ///
    /// Propagates estimation errors.
    pub fn estimate_edge_ablation_effects(
        &self,
        downstream_nodes: &BTreeSet<Node>,
        edges: &BTreeSet<Edge>,
        upstream_magnitudes: &Tensor,
        downstream_means: &BTreeMap<Node, f32>,
        target_token_idx: usize,
    ) -> Result<BTreeMap<Edge, f32>> {
        let mut incoming: BTreeMap<Node, BTreeSet<Edge>> = BTreeMap::new();
        for edge in edges {
            if downstream_nodes.contains(&edge.downstream) {
                incoming.entry(edge.downstream).or_default().insert(*edge);
            }
        }

        let mut edge_to_mse = BTreeMap::new();
        for (downstream, node_edges) in &incoming {
            // BORROW: explicit .clone(), each variant owns its edge set
            let full = Circuit::new(BTreeSet::from([*downstream]), node_edges.clone());
            for edge in node_edges {
                let variant = full.without_edges(|e| e == edge);
                let mses = self.estimate_downstream_node_mses(
                    variant.nodes(),
                    variant.edges(),
                    upstream_magnitudes,
                    downstream_means,
                    target_token_idx,
                )?;
                let mse = mses.get(downstream).copied().ok_or_else(|| {
                    CircuitError::Search(format!("no MSE estimated for {downstream}"))
                })?;
                edge_to_mse.insert(*edge, mse);
            }
        }
        Ok(edge_to_mse)
    }

    /// Downstream MSE when each upstream token is ablated, averaged per
    /// downstream token: `downstream_token -> upstream_token -> mse`.
    ///
    /// # Errors
    ///
    /// Propagates estimation errors.
    pub fn estimate_token_ablation_effects(
        &self,
        downstream_nodes: &BTreeSet<Node>,
        all_edges: &BTreeSet<Edge>,
        upstream_magnitudes: &Tensor,
        downstream_means: &BTreeMap<Node, f32>,
        target_token_idx: usize,
    ) -> Result<BTreeMap<usize, BTreeMap<usize, f32>>> {
        let upstream_token_idxs: BTreeSet<usize> =
            all_edges.iter().map(|edge| edge.upstream.token_idx).collect();

        let mut token_mses: BTreeMap<usize, BTreeMap<usize, Vec<f32>>> = BTreeMap::new();
        for token_idx in upstream_token_idxs {
            let patched_edges: BTreeSet<Edge> = all_edges
                .iter()
                .filter(|edge| edge.upstream.token_idx != token_idx)
                .copied()
                .collect();
            let affected: BTreeSet<Node> = all_edges
                .iter()
                .filter(|edge| edge.upstream.token_idx == token_idx)
                .map(|edge| edge.downstream)
                .filter(|node| downstream_nodes.contains(node))
                .collect();

            let estimated = self.estimate_downstream_node_mses(
                &affected,
                &patched_edges,
                upstream_magnitudes,
                downstream_means,
                target_token_idx,
            )?;
            for (node, mse) in estimated {
                token_mses
                    .entry(node.token_idx)
                    .or_default()
                    .entry(token_idx)
                    .or_default()
                    .push(mse);
            }
        }

        Ok(token_mses
            .into_iter()
            .map(|(downstream_token_idx, upstream_mses)| {
                let averaged = upstream_mses
                    .into_iter()
                    .filter_map(|(upstream_token_idx, mses)| {
                        mean(&mses).map(|m| (upstream_token_idx, m))
                    })
                    .collect();
                (downstream_token_idx, averaged)
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Check the downstream set is non-empty, single-layer, and above layer 0.
///
/// Returns the downstream layer index.
fn validate_downstream(downstream_nodes: &BTreeSet<Node>) -> Result<usize> {
    let first = downstream_nodes
        .first()
        .ok_or_else(|| CircuitError::Search("downstream node set is empty".into()))?;
    let layer_idx = first.layer_idx;
    if let Some(node) = downstream_nodes.iter().find(|n| n.layer_idx != layer_idx) {
        return Err(CircuitError::Search(format!(
            "downstream nodes span multiple layers ({layer_idx} and {})",
            node.layer_idx
        )));
    }
    if layer_idx == 0 {
        return Err(CircuitError::Search(
            "downstream nodes on layer 0 have no upstream layer".into(),
        ));
    }
    Ok(layer_idx)
}

/// Check both node sets against the adjacent-layer rule.
///
/// Returns the downstream layer index.
fn validate_layers(
    upstream_nodes: &BTreeSet<Node>,
    downstream_nodes: &BTreeSet<Node>,
) -> Result<usize> {
    let downstream_layer_idx = validate_downstream(downstream_nodes)?;
    let upstream_layer_idx = downstream_layer_idx - 1;
    if let Some(node) = upstream_nodes
        .iter()
        .find(|n| n.layer_idx != upstream_layer_idx)
    {
        return Err(CircuitError::Search(format!(
            "upstream node {node} is not on layer {upstream_layer_idx}"
        )));
    }
    Ok(downstream_layer_idx)
}

/// Check token and feature indices against the forward-pass shapes.
fn validate_ranges(
    nodes: &BTreeSet<Node>,
    seq_len: usize,
    n_features: usize,
    role: &str,
) -> Result<()> {
    if let Some(node) = nodes
        .iter()
        .find(|n| n.token_idx >= seq_len || n.feature_idx >= n_features)
    {
        return Err(CircuitError::Search(format!(
            "{role} node {node} out of range (seq_len={seq_len}, n_features={n_features})"
        )));
    }
    Ok(())
}

/// Baseline MSE of a downstream node.
fn baseline_of(baseline_mses: &BTreeMap<Node, f32>, node: &Node) -> Result<f32> {
    baseline_mses
        .get(node)
        .copied()
        .ok_or_else(|| CircuitError::Search(format!("no baseline MSE for downstream node {node}")))
}

/// Baseline MSE averaged over the downstream nodes at each token.
fn token_baseline_mses(
    baseline_mses: &BTreeMap<Node, f32>,
    downstream_token_idxs: &BTreeSet<usize>,
) -> Result<BTreeMap<usize, f32>> {
    downstream_token_idxs
        .iter()
        .map(|&token_idx| {
            let node_mses: Vec<f32> = baseline_mses
                .iter()
                .filter(|(node, _)| node.token_idx == token_idx)
                .map(|(_, mse)| *mse)
                .collect();
            let averaged = mean(&node_mses).ok_or_else(|| {
                CircuitError::Search(format!("no baseline MSE for downstream token {token_idx}"))
            })?;
            Ok((token_idx, averaged))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
