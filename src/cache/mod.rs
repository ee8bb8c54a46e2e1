// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feature-magnitude caching for a single forward pass.
//!
//! - [`FeatureMagnitudeCache`]: per-layer `[seq_len, n_features]` sparse
//!   feature magnitudes.

mod magnitudes;

pub use magnitudes::FeatureMagnitudeCache;
