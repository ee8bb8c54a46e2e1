// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit value types: nodes, edges, edge groups, and circuit variants.
//!
//! All types here are immutable records with structural equality, ordering,
//! and hashing, so they can be used as map keys and set members. Ordering
//! is by field tuple, which gives a deterministic enumeration and printing
//! order.
//!
//! ```text
//! Node      = (layer_idx, token_idx, feature_idx)
//! Edge      = (upstream: Node @ layer L, downstream: Node @ layer L+1)
//! EdgeGroup = (upstream_layer_idx, upstream_token_idx, downstream_token_idx)
//! ```

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One feature activation at one (layer, token position, feature index) triple.
///
/// # Example
///
/// ```
/// use candle_circuits::Node;
///
/// let node = Node::new(1, 3, 42);
/// assert_eq!(node.to_string(), "L1:T3:F42");
/// assert!(Node::new(1, 2, 99) < node);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Layer index of the sparse feature encoder.
    pub layer_idx: usize,
    /// Token position in the input sequence.
    pub token_idx: usize,
    /// Feature index within the layer.
    pub feature_idx: usize,
}

impl Node {
    /// Create a new node.
    #[must_use]
    pub const fn new(layer_idx: usize, token_idx: usize, feature_idx: usize) -> Self {
        Self {
            layer_idx,
            token_idx,
            feature_idx,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L{}:T{}:F{}",
            self.layer_idx, self.token_idx, self.feature_idx
        )
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// A directed connection from an upstream node to a downstream node.
///
/// An edge is causally valid only when the downstream node sits on the next
/// layer and at the same or a later token position. Use [`Edge::causal`] to
/// construct edges with that rule enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source node (layer `L`).
    pub upstream: Node,
    /// Destination node (layer `L + 1`).
    pub downstream: Node,
}

impl Edge {
    /// Create an edge without validity checks.
    #[must_use]
    pub const fn new(upstream: Node, downstream: Node) -> Self {
        Self {
            upstream,
            downstream,
        }
    }

    /// Create an edge only if it is causally valid.
    ///
    /// ```
    /// use candle_circuits::{Edge, Node};
    ///
    /// assert!(Edge::causal(Node::new(0, 1, 0), Node::new(1, 2, 5)).is_some());
    /// // Later token cannot influence an earlier one.
    /// assert!(Edge::causal(Node::new(0, 2, 0), Node::new(1, 1, 5)).is_none());
    /// // Layers must be adjacent.
    /// assert!(Edge::causal(Node::new(0, 0, 0), Node::new(2, 0, 5)).is_none());
    /// ```
    #[must_use]
    pub const fn causal(upstream: Node, downstream: Node) -> Option<Self> {
        if Self::is_causal(&upstream, &downstream) {
            Some(Self::new(upstream, downstream))
        } else {
            None
        }
    }

    /// Whether information can flow from `upstream` to `downstream`.
    #[must_use]
    pub const fn is_causal(upstream: &Node, downstream: &Node) -> bool {
        upstream.token_idx <= downstream.token_idx
            && downstream.layer_idx == upstream.layer_idx + 1
    }

    /// Whether this edge satisfies the causality rule.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        Self::is_causal(&self.upstream, &self.downstream)
    }

    /// The token-level group this edge belongs to.
    #[must_use]
    pub const fn group(&self) -> EdgeGroup {
        EdgeGroup::new(
            self.upstream.layer_idx,
            self.upstream.token_idx,
            self.downstream.token_idx,
        )
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.upstream, self.downstream)
    }
}

// ---------------------------------------------------------------------------
// EdgeGroup
// ---------------------------------------------------------------------------

/// All edges from any feature at one upstream token to any feature at one
/// downstream token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeGroup {
    /// Layer index of the upstream side.
    pub upstream_layer_idx: usize,
    /// Token position of the upstream side.
    pub upstream_token_idx: usize,
    /// Token position of the downstream side.
    pub downstream_token_idx: usize,
}

impl EdgeGroup {
    /// Create a new edge group.
    #[must_use]
    pub const fn new(
        upstream_layer_idx: usize,
        upstream_token_idx: usize,
        downstream_token_idx: usize,
    ) -> Self {
        Self {
            upstream_layer_idx,
            upstream_token_idx,
            downstream_token_idx,
        }
    }

    /// Layer index of the downstream side.
    #[must_use]
    pub const fn downstream_layer_idx(&self) -> usize {
        self.upstream_layer_idx + 1
    }
}

impl fmt::Display for EdgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L{}:T{} -> L{}:T{}",
            self.upstream_layer_idx,
            self.upstream_token_idx,
            self.downstream_layer_idx(),
            self.downstream_token_idx
        )
    }
}

// ---------------------------------------------------------------------------
// Circuit
// ---------------------------------------------------------------------------

/// A subgraph used as the unit of ablation.
///
/// "Keep these nodes' true values, resample everything else." Two circuits
/// are equal iff their node sets and edge sets are equal; this equality is
/// what dependency-set memoization keys on. Both sets are ordered, so the
/// derived [`Hash`] is order-independent with respect to insertion.
///
/// # Example
///
/// ```
/// use std::collections::BTreeSet;
/// use candle_circuits::{Circuit, Node};
///
/// let a = Circuit::from_nodes([Node::new(0, 1, 2), Node::new(0, 0, 3)]);
/// let b = Circuit::from_nodes([Node::new(0, 0, 3), Node::new(0, 1, 2)]);
/// assert_eq!(a, b);
/// assert_eq!(a.num_nodes(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Circuit {
    /// Nodes that keep their true values.
    nodes: BTreeSet<Node>,
    /// Retained edges (empty when the variant is node-only).
    edges: BTreeSet<Edge>,
}

impl Circuit {
    /// Create a circuit from a node set and an edge set.
    #[must_use]
    pub const fn new(nodes: BTreeSet<Node>, edges: BTreeSet<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Create a node-only circuit.
    #[must_use]
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            edges: BTreeSet::new(),
        }
    }

    /// Nodes that keep their true values.
    #[must_use]
    pub const fn nodes(&self) -> &BTreeSet<Node> {
        &self.nodes
    }

    /// Retained edges.
    #[must_use]
    pub const fn edges(&self) -> &BTreeSet<Edge> {
        &self.edges
    }

    /// Number of nodes.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the circuit keeps the given node.
    #[must_use]
    pub fn contains_node(&self, node: &Node) -> bool {
        self.nodes.contains(node)
    }

    /// Whether the circuit has no nodes and no edges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// A copy of this circuit with the edges matching `predicate` removed.
    #[must_use]
    pub fn without_edges(&self, predicate: impl Fn(&Edge) -> bool) -> Self {
        Self {
            // BORROW: explicit .clone(), node set is shared by every variant
            nodes: self.nodes.clone(),
            edges: self.edges.iter().filter(|e| !predicate(e)).copied().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
