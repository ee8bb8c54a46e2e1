// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dependency-grouped sampling of downstream feature magnitudes.
//!
//! A downstream node's sampled magnitudes depend only on which upstream
//! nodes keep their true values, i.e. on the set of upstream nodes connected
//! to it by retained edges. Downstream nodes with identical dependency sets
//! share one circuit variant, so the ablator and the downstream
//! recomputation run once per distinct dependency set rather than once per
//! downstream node.

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{IndexOp, Tensor};
use tracing::debug;

use crate::ablation::{ResampleAblator, patch_feature_magnitudes};
use crate::backend::SparsifiedModel;
use crate::circuit::{Circuit, Edge, Node};
use crate::error::{CircuitError, Result};

// ---------------------------------------------------------------------------
// Dependency keys
// ---------------------------------------------------------------------------

/// Canonical, order-independent key for a set of upstream dependencies.
///
/// Stored as a sorted, deduplicated node sequence so that equal sets always
/// produce equal keys regardless of discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencyKey(Vec<Node>);

impl DependencyKey {
    /// Canonicalize a collection of upstream nodes.
    #[must_use]
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut nodes: Vec<Node> = nodes.into_iter().collect();
        nodes.sort_unstable();
        nodes.dedup();
        Self(nodes)
    }

    /// The upstream nodes, sorted.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.0
    }

    /// Number of upstream dependencies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the dependency set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Node-only circuit variant that keeps exactly these dependencies.
    #[must_use]
    pub fn to_circuit(&self) -> Circuit {
        Circuit::from_nodes(self.0.iter().copied())
    }
}

/// Downstream nodes sharing one dependency set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGroup {
    /// The shared upstream dependencies.
    pub key: DependencyKey,
    /// Downstream nodes whose dependencies equal `key`.
    pub downstream_nodes: BTreeSet<Node>,
}

/// Group downstream nodes by the upstream nodes connected to them in `edges`.
///
/// Every downstream node appears in exactly one group; a node with no
/// incoming edge lands in the group with an empty key. Groups are returned
/// in key order.
///
/// ```
/// use std::collections::BTreeSet;
/// use candle_circuits::{Edge, Node};
/// use candle_circuits::search::group_by_dependencies;
///
/// let up = Node::new(0, 0, 0);
/// let (a, b) = (Node::new(1, 0, 0), Node::new(1, 0, 1));
/// let downstream: BTreeSet<Node> = [a, b].into_iter().collect();
/// let edges: BTreeSet<Edge> = [Edge::new(up, a), Edge::new(up, b)].into_iter().collect();
///
/// let groups = group_by_dependencies(&downstream, &edges);
/// assert_eq!(groups.len(), 1);
/// assert_eq!(groups[0].downstream_nodes.len(), 2);
/// ```
#[must_use]
pub fn group_by_dependencies(
    downstream_nodes: &BTreeSet<Node>,
    edges: &BTreeSet<Edge>,
) -> Vec<DependencyGroup> {
    let mut dependencies: BTreeMap<Node, Vec<Node>> = downstream_nodes
        .iter()
        .map(|node| (*node, Vec::new()))
        .collect();
    for edge in edges {
        if let Some(deps) = dependencies.get_mut(&edge.downstream) {
            deps.push(edge.upstream);
        }
    }

    let mut groups: BTreeMap<DependencyKey, BTreeSet<Node>> = BTreeMap::new();
    for (node, deps) in dependencies {
        groups
            .entry(DependencyKey::new(deps))
            .or_default()
            .insert(node);
    }

    groups
        .into_iter()
        .map(|(key, downstream_nodes)| DependencyGroup {
            key,
            downstream_nodes,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Sample downstream magnitudes for each downstream node under a retained edge set.
///
/// # Shapes
/// - `upstream_magnitudes`: `[seq, n_features(upstream)]`
/// - returns: one `[num_samples]` tensor per downstream node
///
/// # Errors
///
/// Returns [`CircuitError::Search`] if the downstream nodes sit on layer 0,
/// and propagates ablator and recomputation errors unmodified.
pub fn sample_downstream_feature_magnitudes(
    model: &SparsifiedModel,
    ablator: &dyn ResampleAblator,
    downstream_nodes: &BTreeSet<Node>,
    edges: &BTreeSet<Edge>,
    upstream_magnitudes: &Tensor,
    target_token_idx: usize,
    num_samples: usize,
) -> Result<BTreeMap<Node, Tensor>> {
    let Some(first) = downstream_nodes.first() else {
        return Ok(BTreeMap::new());
    };
    let upstream_layer_idx = first.layer_idx.checked_sub(1).ok_or_else(|| {
        CircuitError::Search("downstream nodes on layer 0 have no upstream layer".into())
    })?;

    let groups = group_by_dependencies(downstream_nodes, edges);
    debug!(
        downstream_nodes = downstream_nodes.len(),
        dependency_groups = groups.len(),
        num_samples,
        "sampling downstream magnitudes"
    );

    let variants: Vec<Circuit> = groups.iter().map(|g| g.key.to_circuit()).collect();
    let patched = patch_feature_magnitudes(
        ablator,
        upstream_layer_idx,
        target_token_idx,
        &variants,
        upstream_magnitudes,
        num_samples,
    )?;

    let mut sampled = BTreeMap::new();
    for (group, patched_magnitudes) in groups.iter().zip(patched) {
        // [num_samples, seq, n_features(downstream)]
        let downstream =
            model.compute_downstream_magnitudes(upstream_layer_idx, &patched_magnitudes)?;
        for node in &group.downstream_nodes {
            sampled.insert(*node, downstream.i((.., node.token_idx, node.feature_idx))?);
        }
    }
    Ok(sampled)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
