// SPDX-License-Identifier: MIT OR Apache-2.0

//! Edge importance search between adjacent sparse-feature layers.
//!
//! - [`edges`]: [`EdgeSearch`] orchestration, causal enumeration, edge and
//!   token importance.
//! - [`sampling`]: Dependency-set grouping and memoized sampling of
//!   downstream magnitudes.
//! - [`mse`]: Normalized MSE estimation and sibling-group normalization.

pub mod edges;
pub mod mse;
pub mod sampling;

pub use edges::{EdgeSearch, EdgeSearchResult, enumerate_edge_groups, enumerate_edges};
pub use mse::{IncreaseStats, normalize_increases, normalized_mse, sample_mean};
pub use sampling::{
    DependencyGroup, DependencyKey, group_by_dependencies, sample_downstream_feature_magnitudes,
};
