// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-circuits
//!
//! Circuit discovery over sparse-feature models in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! Given one input sequence and two adjacent sparse-feature layers,
//! [`EdgeSearch`] estimates how much removing each upstream
//! feature-at-token perturbs each downstream feature-at-token. Upstream
//! magnitudes are resampled by a [`ResampleAblator`], replayed through the
//! layer transform by a [`SparsifiedBackend`], and compared against a
//! sampling-noise baseline. Results are per-edge and per-token-pair
//! importance scores in `[0, 1]`.
//!
//! ## Quick start
//!
//! ```no_run
//! # fn run(model: &candle_circuits::SparsifiedModel,
//! #        profile: &candle_circuits::ModelProfile,
//! #        ablator: &candle_circuits::PoolAblator) -> candle_circuits::Result<()> {
//! use std::collections::BTreeSet;
//! use candle_circuits::{EdgeSearch, EdgeSearchConfig, Node};
//!
//! let search = EdgeSearch::new(model, profile, ablator, EdgeSearchConfig::new(32))?;
//! let upstream: BTreeSet<Node> = [Node::new(0, 0, 3), Node::new(0, 1, 7)].into_iter().collect();
//! let downstream: BTreeSet<Node> = [Node::new(1, 1, 2)].into_iter().collect();
//! let result = search.search(&[10, 42], &upstream, &downstream, 1)?;
//! for (edge, importance) in result.top_edges(5) {
//!     println!("{edge}: {importance:.3}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod ablation;
pub mod backend;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod error;
pub mod profile;
pub mod search;

pub use ablation::{PoolAblator, ResampleAblator, patch_feature_magnitudes};
pub use backend::{SparsifiedBackend, SparsifiedModel};
pub use cache::FeatureMagnitudeCache;
pub use circuit::{Circuit, Edge, EdgeGroup, Node};
pub use config::EdgeSearchConfig;
pub use error::{CircuitError, Result};
pub use profile::{FeatureProfile, LayerProfile, ModelProfile};
pub use search::{EdgeSearch, EdgeSearchResult};
