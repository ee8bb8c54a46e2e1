// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: run full edge searches on CPU against a small causal
//! toy model and check the properties every search result must satisfy.
//!
//! Run:
//!   `cargo test --test edge_search`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use candle_circuits::{
    Circuit, CircuitError, Edge, EdgeGroup, EdgeSearch, EdgeSearchConfig, FeatureMagnitudeCache,
    ModelProfile, Node, PoolAblator, ResampleAblator, SparsifiedBackend, SparsifiedModel,
};
use candle_circuits::search::{
    enumerate_edges, group_by_dependencies, sample_downstream_feature_magnitudes,
};
use candle_core::{Device, Module, Tensor};
use candle_nn::Linear;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ---------------------------------------------------------------------------
// Toy sparsified model
// ---------------------------------------------------------------------------

const VOCAB: usize = 16;
const N_FEATURES: [usize; 3] = [4, 3, 3];
const POOL_SEQ: usize = 8;
const FEATURE_MAX: f32 = 5.0;

/// Causal toy model: each layer averages magnitudes over positions `<= t`,
/// applies a positive linear map, then `ReLU`.
struct ToyBackend {
    /// Layer-0 magnitudes per token: `[VOCAB, N_FEATURES[0]]`.
    embedding: Tensor,
    /// Transform from feature layer `l` to `l + 1`.
    layers: Vec<Linear>,
}

impl ToyBackend {
    fn new(device: &Device) -> Self {
        let f0 = N_FEATURES[0];
        let emb: Vec<f32> = (0..VOCAB * f0)
            .map(|i| {
                let (v, f) = (i / f0, i % f0);
                1.0 + ((v * 5 + f * 3) % 7) as f32 * 0.25
            })
            .collect();
        let embedding = Tensor::from_vec(emb, (VOCAB, f0), device).unwrap();

        let layers = N_FEATURES
            .windows(2)
            .map(|pair| {
                let (n_in, n_out) = (pair[0], pair[1]);
                let w: Vec<f32> = (0..n_out * n_in)
                    .map(|i| {
                        let (o, f) = (i / n_in, i % n_in);
                        0.5 + 0.1 * ((o * 7 + f * 3) % 5) as f32
                    })
                    .collect();
                Linear::new(Tensor::from_vec(w, (n_out, n_in), device).unwrap(), None)
            })
            .collect();
        Self { embedding, layers }
    }
}

/// `[seq, seq]` matrix averaging over positions `<= t` in row `t`.
fn causal_average(seq: usize, device: &Device) -> candle_core::Result<Tensor> {
    let data: Vec<f32> = (0..seq * seq)
        .map(|i| {
            let (t, s) = (i / seq, i % seq);
            if s <= t { 1.0 / (t + 1) as f32 } else { 0.0 }
        })
        .collect();
    Tensor::from_vec(data, (seq, seq), device)
}

impl SparsifiedBackend for ToyBackend {
    fn num_layers(&self) -> usize {
        N_FEATURES.len()
    }

    fn num_features(&self, layer_idx: usize) -> usize {
        N_FEATURES.get(layer_idx).copied().unwrap_or(0)
    }

    fn forward(&self, input_ids: &Tensor) -> candle_circuits::Result<FeatureMagnitudeCache> {
        let ids = input_ids.squeeze(0)?;
        let mut cache = FeatureMagnitudeCache::with_capacity(self.num_layers());
        let mut current = self.embedding.index_select(&ids, 0)?;
        for layer_idx in 0..self.layers.len() {
            let next = self
                .compute_downstream_magnitudes(layer_idx, &current.unsqueeze(0)?)?
                .squeeze(0)?;
            cache.push(current);
            current = next;
        }
        cache.push(current);
        Ok(cache)
    }

    fn compute_downstream_magnitudes(
        &self,
        upstream_layer_idx: usize,
        upstream_magnitudes: &Tensor,
    ) -> candle_circuits::Result<Tensor> {
        let (batch, seq, _) = upstream_magnitudes.dims3()?;
        let mixed = causal_average(seq, upstream_magnitudes.device())?
            .broadcast_left(batch)?
            .contiguous()?
            .matmul(&upstream_magnitudes.contiguous()?)?;
        Ok(self.layers[upstream_layer_idx].forward(&mixed)?.relu()?)
    }
}

fn toy_model() -> SparsifiedModel {
    let device = Device::Cpu;
    SparsifiedModel::new(Box::new(ToyBackend::new(&device)), device)
}

fn toy_profile() -> ModelProfile {
    let maxes: Vec<Vec<f32>> = N_FEATURES.iter().map(|&n| vec![FEATURE_MAX; n]).collect();
    ModelProfile::from_maxes(&maxes)
}

/// Background pools with values in `[0, 1)`, below every true layer-0 magnitude.
fn background_pools(pool_size: usize, seed: u64) -> Vec<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    N_FEATURES
        .iter()
        .map(|&n| {
            let data: Vec<f32> = (0..pool_size * POOL_SEQ * n)
                .map(|_| rng.gen_range(0.0_f32..1.0))
                .collect();
            Tensor::from_vec(data, (pool_size, POOL_SEQ, n), &Device::Cpu).unwrap()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Test ablators
// ---------------------------------------------------------------------------

/// Deterministic ablator: sample `s` uses pool entry `s % pool_size`.
///
/// With `num_samples` a multiple of the pool size, every call sees the same
/// multiset of background values, so estimates are exactly reproducible.
struct CyclingAblator {
    pools: Vec<Tensor>,
}

impl ResampleAblator for CyclingAblator {
    fn k_nearest(&self) -> Option<usize> {
        Some(self.pools[0].dim(0).unwrap())
    }

    fn sample(
        &self,
        layer_idx: usize,
        _target_token_idx: usize,
        circuit_variants: &[Circuit],
        upstream_magnitudes: &Tensor,
        num_samples: usize,
    ) -> candle_circuits::Result<Vec<Tensor>> {
        let pool = &self.pools[layer_idx];
        let (seq, n_features) = upstream_magnitudes.dims2()?;
        let pool_size = pool.dim(0)?;
        let device = upstream_magnitudes.device();

        let idx: Vec<u32> = (0..num_samples).map(|s| (s % pool_size) as u32).collect();
        let idx = Tensor::from_vec(idx, num_samples, device)?;
        let background = pool.narrow(1, 0, seq)?.contiguous()?.index_select(&idx, 0)?;

        circuit_variants
            .iter()
            .map(|variant| {
                let mut mask = vec![0.0_f32; seq * n_features];
                for node in variant.nodes() {
                    mask[node.token_idx * n_features + node.feature_idx] = 1.0;
                }
                let mask = Tensor::from_vec(mask, (seq, n_features), device)?;
                let keep = upstream_magnitudes.mul(&mask)?;
                let inverse = mask.affine(-1.0, 1.0)?;
                Ok(background.broadcast_mul(&inverse)?.broadcast_add(&keep)?)
            })
            .collect()
    }
}

/// Records how many circuit variants each sampling call receives.
struct CountingAblator {
    inner: CyclingAblator,
    variants_per_call: Mutex<Vec<usize>>,
}

impl ResampleAblator for CountingAblator {
    fn k_nearest(&self) -> Option<usize> {
        self.inner.k_nearest()
    }

    fn sample(
        &self,
        layer_idx: usize,
        target_token_idx: usize,
        circuit_variants: &[Circuit],
        upstream_magnitudes: &Tensor,
        num_samples: usize,
    ) -> candle_circuits::Result<Vec<Tensor>> {
        self.variants_per_call
            .lock()
            .unwrap()
            .push(circuit_variants.len());
        self.inner.sample(
            layer_idx,
            target_token_idx,
            circuit_variants,
            upstream_magnitudes,
            num_samples,
        )
    }
}

/// Ablator that always fails.
struct FailingAblator;

impl ResampleAblator for FailingAblator {
    fn k_nearest(&self) -> Option<usize> {
        None
    }

    fn sample(
        &self,
        _: usize,
        _: usize,
        _: &[Circuit],
        _: &Tensor,
        _: usize,
    ) -> candle_circuits::Result<Vec<Tensor>> {
        Err(CircuitError::Ablation("background dataset unavailable".into()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn nodes(layer: usize, tokens: &[usize], features: &[usize]) -> BTreeSet<Node> {
    tokens
        .iter()
        .flat_map(|&t| features.iter().map(move |&f| Node::new(layer, t, f)))
        .collect()
}

fn assert_causal(edges: impl IntoIterator<Item = Edge>) {
    for edge in edges {
        assert!(
            edge.upstream.token_idx <= edge.downstream.token_idx,
            "non-causal edge {edge}"
        );
        assert_eq!(edge.downstream.layer_idx, edge.upstream.layer_idx + 1);
    }
}

fn rel_close(a: f32, b: f32) -> bool {
    (a - b).abs() <= 1e-4 * a.abs().max(b.abs()).max(1e-6)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn three_by_two_scenario() {
    let model = toy_model();
    let profile = toy_profile();
    let ablator = PoolAblator::new(background_pools(32, 1), None, 11).unwrap();
    let search = EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(8)).unwrap();

    let upstream = nodes(0, &[0, 1, 2], &[0]);
    let downstream = nodes(1, &[1, 2], &[0]);
    let result = search.search(&[3, 7, 9], &upstream, &downstream, 2).unwrap();

    let expected: BTreeSet<Edge> = [
        (0, 1),
        (0, 2),
        (1, 1),
        (1, 2),
        (2, 2),
    ]
    .into_iter()
    .map(|(u, d)| Edge::new(Node::new(0, u, 0), Node::new(1, d, 0)))
    .collect();
    let keys: BTreeSet<Edge> = result.edge_importance.keys().copied().collect();
    assert_eq!(keys, expected);
    assert!(result.edge_importance.values().all(|v| (0.0..=1.0).contains(v)));

    let placeholders = EdgeSearch::get_placeholders(&upstream, &downstream);
    let placeholder_keys: BTreeSet<Edge> = placeholders.edge_importance.keys().copied().collect();
    assert_eq!(placeholder_keys, expected);
    assert!(placeholders.edge_importance.values().all(|v| *v == 1.0));
}

#[test]
fn scores_are_in_range_and_causal() {
    let model = toy_model();
    let profile = toy_profile();
    let ablator = PoolAblator::new(background_pools(64, 2), Some(24), 5).unwrap();
    let search = EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(8)).unwrap();

    let upstream = nodes(0, &[0, 1, 2, 3], &[0, 2]);
    let downstream = nodes(1, &[0, 2, 3], &[0, 1, 2]);
    let result = search.search(&[1, 4, 9, 15], &upstream, &downstream, 3).unwrap();

    assert!(!result.edge_importance.is_empty());
    for (edge, importance) in &result.edge_importance {
        assert!((0.0..=1.0).contains(importance), "{edge}: {importance}");
    }
    for (group, importance) in &result.token_importance {
        assert!((0.0..=1.0).contains(importance), "{group}: {importance}");
        assert!(group.upstream_token_idx <= group.downstream_token_idx);
        assert_eq!(group.upstream_layer_idx, 0);
    }
    assert_causal(result.edge_importance.keys().copied());

    // Token importance keys match the placeholder enumeration.
    let placeholders = EdgeSearch::get_placeholders(&upstream, &downstream);
    let groups: BTreeSet<EdgeGroup> = result.token_importance.keys().copied().collect();
    let expected: BTreeSet<EdgeGroup> = placeholders.token_importance.keys().copied().collect();
    assert_eq!(groups, expected);
}

#[test]
fn most_important_incident_edge_scores_one() {
    // Every upstream feature is a node, so the intact circuit is noiseless
    // and ablating any single edge strictly increases the error.
    let model = toy_model();
    let profile = toy_profile();
    let ablator = PoolAblator::new(background_pools(32, 3), None, 17).unwrap();
    let search = EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(8)).unwrap();

    let upstream = nodes(0, &[0, 1, 2, 3], &[0, 1, 2, 3]);
    let downstream = nodes(1, &[1, 2, 3], &[0, 1, 2]);
    let result = search.search(&[2, 5, 8, 13], &upstream, &downstream, 3).unwrap();

    for node in &downstream {
        let incident: Vec<f32> = result.edges_into(node).map(|(_, v)| v).collect();
        assert_eq!(incident.len(), 4 * (node.token_idx + 1));
        let max = incident.iter().copied().fold(0.0_f32, f32::max);
        assert_eq!(max, 1.0, "no maximal edge into {node}");
    }

    let tokens: BTreeSet<usize> = downstream.iter().map(|n| n.token_idx).collect();
    for token in tokens {
        let max = result
            .token_importance
            .iter()
            .filter(|(g, _)| g.downstream_token_idx == token)
            .map(|(_, v)| *v)
            .fold(0.0_f32, f32::max);
        assert_eq!(max, 1.0, "no maximal upstream token for token {token}");
    }
}

#[test]
fn unablated_circuit_reproduces_baseline() {
    const POOL: usize = 16;
    let model = toy_model();
    let profile = toy_profile();
    let ablator = CyclingAblator {
        pools: background_pools(POOL, 4),
    };
    let search = EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(POOL)).unwrap();
    assert_eq!(search.mean_num_samples(), POOL);

    let tokens = [6, 2, 11];
    let upstream = nodes(0, &[0, 1, 2], &[1]);
    let downstream = nodes(1, &[0, 1, 2], &[0, 2]);
    let all_edges = enumerate_edges(&upstream, &downstream);

    let output = model.forward_tokens(&tokens).unwrap();
    let upstream_magnitudes = output.require_layer(0).unwrap();

    let means = search
        .estimate_downstream_node_means(&downstream, &all_edges, upstream_magnitudes, 2)
        .unwrap();
    let baseline = search
        .estimate_downstream_node_mses(&downstream, &all_edges, upstream_magnitudes, &means, 2)
        .unwrap();
    let again = search
        .estimate_downstream_node_mses(&downstream, &all_edges, upstream_magnitudes, &means, 2)
        .unwrap();

    assert_eq!(baseline.len(), downstream.len());
    for node in &downstream {
        let (b, a) = (baseline[node], again[node]);
        assert!(b > 0.0, "resampled features should add noise at {node}");
        assert!(rel_close(a, b), "{node}: {a} vs baseline {b}");
    }
}

#[test]
fn token_importance_aggregates_node_increases() {
    const POOL: usize = 8;
    let model = toy_model();
    let profile = toy_profile();
    let ablator = CyclingAblator {
        pools: background_pools(POOL, 6),
    };
    let search = EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(POOL)).unwrap();

    let tokens = [4, 4, 10, 1];
    let target = 3;
    let upstream = nodes(0, &[0, 1, 3], &[0, 3]);
    let downstream = nodes(1, &[1, 3], &[0, 1, 2]);
    let result = search.search(&tokens, &upstream, &downstream, target).unwrap();

    // Recompute the expected token scores from per-node estimates.
    let all_edges = enumerate_edges(&upstream, &downstream);
    let output = model.forward_tokens(&tokens).unwrap();
    let mags = output.require_layer(0).unwrap();
    let means = search
        .estimate_downstream_node_means(&downstream, &all_edges, mags, target)
        .unwrap();
    let baseline = search
        .estimate_downstream_node_mses(&downstream, &all_edges, mags, &means, target)
        .unwrap();

    let avg = |values: &[f32]| values.iter().sum::<f32>() / values.len() as f32;
    let mut increases: BTreeMap<(usize, usize), f32> = BTreeMap::new();
    for upstream_token in [0, 1, 3] {
        let patched: BTreeSet<Edge> = all_edges
            .iter()
            .filter(|e| e.upstream.token_idx != upstream_token)
            .copied()
            .collect();
        let affected: BTreeSet<Node> = all_edges
            .iter()
            .filter(|e| e.upstream.token_idx == upstream_token)
            .map(|e| e.downstream)
            .collect();
        let mses = search
            .estimate_downstream_node_mses(&affected, &patched, mags, &means, target)
            .unwrap();
        for downstream_token in [1, 3] {
            let node_mses: Vec<f32> = mses
                .iter()
                .filter(|(n, _)| n.token_idx == downstream_token)
                .map(|(_, m)| *m)
                .collect();
            if node_mses.is_empty() {
                continue;
            }
            let node_baselines: Vec<f32> = baseline
                .iter()
                .filter(|(n, _)| n.token_idx == downstream_token)
                .map(|(_, m)| *m)
                .collect();
            increases.insert(
                (upstream_token, downstream_token),
                avg(&node_mses) - avg(&node_baselines),
            );
        }
    }

    assert_eq!(increases.len(), result.token_importance.len());
    for ((upstream_token, downstream_token), increase) in &increases {
        let group_max = increases
            .iter()
            .filter(|((_, d), _)| d == downstream_token)
            .map(|(_, v)| *v)
            .fold(f32::NEG_INFINITY, f32::max)
            .max(1e-6);
        let expected = increase.max(0.0) / group_max;
        let actual = result.token_importance[&EdgeGroup::new(0, *upstream_token, *downstream_token)];
        assert!(
            (actual - expected).abs() <= 1e-4 * expected.max(1.0),
            "({upstream_token} -> {downstream_token}): {actual} vs {expected}"
        );
    }
}

#[test]
fn same_seed_gives_same_result() {
    let model = toy_model();
    let profile = toy_profile();
    let upstream = nodes(0, &[0, 1], &[0, 1]);
    let downstream = nodes(1, &[1], &[0, 1]);

    let run = || {
        let ablator = PoolAblator::new(background_pools(16, 7), None, 99).unwrap();
        let search =
            EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(4)).unwrap();
        search.search(&[0, 1], &upstream, &downstream, 1).unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn invalid_inputs_fail_fast() {
    let model = toy_model();
    let profile = toy_profile();
    let ablator = PoolAblator::new(background_pools(8, 8), None, 0).unwrap();
    let search = EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(2)).unwrap();
    let upstream = nodes(0, &[0], &[0]);

    // Empty downstream set.
    let err = search.search(&[1, 2], &upstream, &BTreeSet::new(), 0).unwrap_err();
    assert!(matches!(err, CircuitError::Search(_)));

    // Mixed-layer downstream set.
    let mut mixed = nodes(1, &[0], &[0]);
    mixed.insert(Node::new(2, 0, 0));
    let err = search.search(&[1, 2], &upstream, &mixed, 0).unwrap_err();
    assert!(matches!(err, CircuitError::Search(_)));

    // Feature index beyond the downstream layer.
    let err = search
        .search(&[1, 2], &upstream, &nodes(1, &[1], &[N_FEATURES[1]]), 1)
        .unwrap_err();
    assert!(matches!(err, CircuitError::Search(_)));

    // Target token beyond the sequence.
    let err = search
        .search(&[1, 2], &upstream, &nodes(1, &[1], &[0]), 2)
        .unwrap_err();
    assert!(matches!(err, CircuitError::Search(_)));

    // Invalid configuration.
    assert!(matches!(
        EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(0)),
        Err(CircuitError::Config(_))
    ));
}

#[test]
fn ablator_errors_propagate() {
    let model = toy_model();
    let profile = toy_profile();
    let search =
        EdgeSearch::new(&model, &profile, &FailingAblator, EdgeSearchConfig::new(4)).unwrap();
    let err = search
        .search(&[1, 2], &nodes(0, &[0, 1], &[0]), &nodes(1, &[1], &[0]), 1)
        .unwrap_err();
    assert!(matches!(err, CircuitError::Ablation(msg) if msg.contains("unavailable")));
}

#[test]
fn missing_profile_entries_propagate() {
    let model = toy_model();
    let profile = ModelProfile::from_maxes(&[vec![FEATURE_MAX; 4]]);
    let ablator = PoolAblator::new(background_pools(8, 9), None, 0).unwrap();
    let search = EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(2)).unwrap();
    let err = search
        .search(&[1, 2], &nodes(0, &[0], &[0]), &nodes(1, &[1], &[0]), 1)
        .unwrap_err();
    assert!(matches!(err, CircuitError::Profile(_)));
}

#[test]
fn empty_upstream_yields_empty_scores() {
    let model = toy_model();
    let profile = toy_profile();
    let ablator = PoolAblator::new(background_pools(8, 10), None, 0).unwrap();
    let search = EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(2)).unwrap();
    let result = search
        .search(&[1, 2], &BTreeSet::new(), &nodes(1, &[0, 1], &[0]), 1)
        .unwrap();
    assert!(result.edge_importance.is_empty());
    assert!(result.token_importance.is_empty());
}

#[test]
fn layer_two_search_uses_layer_one_magnitudes() {
    let model = toy_model();
    let profile = toy_profile();
    let ablator = PoolAblator::new(background_pools(16, 12), None, 3).unwrap();
    let search = EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(4)).unwrap();

    let upstream = nodes(1, &[0, 2], &[0, 1, 2]);
    let downstream = nodes(2, &[2], &[1]);
    let result = search.search(&[5, 3, 8], &upstream, &downstream, 2).unwrap();
    assert_eq!(result.num_edges(), 6);
    assert_causal(result.edge_importance.keys().copied());
    assert!(result.token_importance.keys().all(|g| g.upstream_layer_idx == 1));
}

#[test]
fn unablated_circuit_adds_no_error_on_average() {
    let model = toy_model();
    let profile = toy_profile();
    let ablator = PoolAblator::new(background_pools(64, 15), None, 21).unwrap();
    let search =
        EdgeSearch::new(&model, &profile, &ablator, EdgeSearchConfig::new(2048)).unwrap();

    let tokens = [6, 2, 11];
    let upstream = nodes(0, &[0, 1, 2], &[1]);
    let downstream = nodes(1, &[0, 1, 2], &[0, 2]);
    let all_edges = enumerate_edges(&upstream, &downstream);
    let output = model.forward_tokens(&tokens).unwrap();
    let mags = output.require_layer(0).unwrap();

    let means = search
        .estimate_downstream_node_means(&downstream, &all_edges, mags, 2)
        .unwrap();
    let baseline = search
        .estimate_downstream_node_mses(&downstream, &all_edges, mags, &means, 2)
        .unwrap();
    let again = search
        .estimate_downstream_node_mses(&downstream, &all_edges, mags, &means, 2)
        .unwrap();

    // Independent draws: equal only up to sampling noise.
    for node in &downstream {
        let (b, a) = (baseline[node], again[node]);
        assert!(b > 0.0);
        assert!((a - b).abs() <= 0.25 * b, "{node}: {a} vs baseline {b}");
    }
    let total_baseline: f32 = baseline.values().sum();
    let total_increase: f32 = downstream.iter().map(|n| again[n] - baseline[n]).sum();
    assert!(
        total_increase.abs() <= 0.15 * total_baseline,
        "mean increase {total_increase} vs baseline {total_baseline}"
    );
}

#[test]
fn normalization_uses_each_nodes_own_feature_max() {
    const POOL: usize = 8;
    let model = toy_model();
    let ablator = CyclingAblator {
        pools: background_pools(POOL, 14),
    };
    let base_profile = toy_profile();
    let mut maxes: Vec<Vec<f32>> = N_FEATURES.iter().map(|&n| vec![FEATURE_MAX; n]).collect();
    maxes[1][2] = 2.0 * FEATURE_MAX;
    let scaled_profile = ModelProfile::from_maxes(&maxes);

    let config = EdgeSearchConfig::new(POOL);
    let base = EdgeSearch::new(&model, &base_profile, &ablator, config.clone()).unwrap();
    let scaled = EdgeSearch::new(&model, &scaled_profile, &ablator, config).unwrap();

    let upstream = nodes(0, &[0, 1, 2], &[0, 2]);
    let downstream = nodes(1, &[0, 1, 2], &[0, 1, 2]);
    let all_edges = enumerate_edges(&upstream, &downstream);
    let output = model.forward_tokens(&[7, 1, 12]).unwrap();
    let mags = output.require_layer(0).unwrap();

    let means = base
        .estimate_downstream_node_means(&downstream, &all_edges, mags, 2)
        .unwrap();
    let before = base
        .estimate_downstream_node_mses(&downstream, &all_edges, mags, &means, 2)
        .unwrap();
    let after = scaled
        .estimate_downstream_node_mses(&downstream, &all_edges, mags, &means, 2)
        .unwrap();

    // Doubling a feature's max halves its coefficient and quarters its MSE.
    for node in &downstream {
        assert!(before[node] > 0.0);
        let expected = if node.feature_idx == 2 {
            before[node] / 4.0
        } else {
            before[node]
        };
        assert!(
            rel_close(after[node], expected),
            "{node}: {} vs expected {expected}",
            after[node]
        );
    }
}

#[test]
fn ablator_sees_one_variant_per_dependency_set() {
    let model = toy_model();
    let ablator = CountingAblator {
        inner: CyclingAblator {
            pools: background_pools(4, 13),
        },
        variants_per_call: Mutex::new(Vec::new()),
    };

    // Six downstream nodes; those at token 0 depend on {T0}, those at
    // token 1 on {T0, T1}.
    let upstream = nodes(0, &[0, 1], &[0]);
    let downstream = nodes(1, &[0, 1], &[0, 1, 2]);
    let edges = enumerate_edges(&upstream, &downstream);
    assert_eq!(group_by_dependencies(&downstream, &edges).len(), 2);

    let output = model.forward_tokens(&[3, 9]).unwrap();
    let sampled = sample_downstream_feature_magnitudes(
        &model,
        &ablator,
        &downstream,
        &edges,
        output.require_layer(0).unwrap(),
        1,
        4,
    )
    .unwrap();

    assert_eq!(sampled.len(), downstream.len());
    assert!(sampled.values().all(|s| s.dims() == [4]));
    assert_eq!(*ablator.variants_per_call.lock().unwrap(), vec![2]);
}
