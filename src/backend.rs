// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sparsified model backend trait and model wrapper.
//!
//! [`SparsifiedBackend`] is the trait that every sparsified model implements:
//! a forward pass producing per-layer sparse feature magnitudes, and a
//! replay of a single adjacent-layer transform used to turn patched upstream
//! magnitudes into downstream magnitudes.
//! [`SparsifiedModel`] wraps a backend with device metadata.

use candle_core::{Device, Tensor};

use crate::cache::FeatureMagnitudeCache;
use crate::error::{CircuitError, Result};

// ---------------------------------------------------------------------------
// SparsifiedBackend trait
// ---------------------------------------------------------------------------

/// Interface to a sequence model whose layers are encoded into sparse features.
///
/// Layer indices refer to sparse encoders, not transformer blocks: encoder
/// `0` sits on the embedding output and encoder `i + 1` on the output of
/// block `i`, so a model with `n` blocks has `n + 1` feature layers.
///
/// Both methods must be deterministic for given inputs and weights.
pub trait SparsifiedBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of sparse feature layers.
    fn num_layers(&self) -> usize;

    /// Number of features at a feature layer.
    fn num_features(&self, layer_idx: usize) -> usize;

    // --- Core computation ------------------------------------------------

    /// Run the model and return feature magnitudes for every layer.
    ///
    /// # Shapes
    /// - `input_ids`: `[1, seq]` -- token IDs
    /// - returns: [`FeatureMagnitudeCache`] with one `[seq, n_features]`
    ///   tensor per feature layer
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Model`] on tensor operation failures.
    fn forward(&self, input_ids: &Tensor) -> Result<FeatureMagnitudeCache>;

    /// Replay the transform between feature layer `upstream_layer_idx` and
    /// the next one: decode upstream magnitudes, run the block, and encode
    /// the result.
    ///
    /// # Shapes
    /// - `upstream_magnitudes`: `[batch, seq, n_features(upstream_layer_idx)]`
    /// - returns: `[batch, seq, n_features(upstream_layer_idx + 1)]`
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Model`] on tensor operation failures.
    fn compute_downstream_magnitudes(
        &self,
        upstream_layer_idx: usize,
        upstream_magnitudes: &Tensor,
    ) -> Result<Tensor>;
}

// ---------------------------------------------------------------------------
// SparsifiedModel
// ---------------------------------------------------------------------------

/// High-level model wrapper combining a backend with device metadata.
pub struct SparsifiedModel {
    /// The underlying backend.
    // TRAIT_OBJECT: heterogeneous sparsified models require dynamic dispatch
    backend: Box<dyn SparsifiedBackend>,
    /// The device this model lives on.
    device: Device,
}

impl SparsifiedModel {
    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous sparsified models require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn SparsifiedBackend>, device: Device) -> Self {
        Self { backend, device }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Number of sparse feature layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Number of features at a feature layer.
    #[must_use]
    pub fn num_features(&self, layer_idx: usize) -> usize {
        self.backend.num_features(layer_idx)
    }

    /// Run a forward pass on a `[1, seq]` token tensor.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward(&self, input_ids: &Tensor) -> Result<FeatureMagnitudeCache> {
        self.backend.forward(input_ids)
    }

    /// Run a forward pass on a token sequence.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] for an empty sequence, otherwise
    /// propagates errors from the underlying backend.
    pub fn forward_tokens(&self, tokens: &[u32]) -> Result<FeatureMagnitudeCache> {
        if tokens.is_empty() {
            return Err(CircuitError::Search("token sequence is empty".into()));
        }
        let input_ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        self.backend.forward(&input_ids)
    }

    /// Recompute downstream magnitudes from patched upstream magnitudes.
    ///
    /// # Shapes
    /// - `upstream_magnitudes`: `[batch, seq, n_features(upstream_layer_idx)]`
    /// - returns: `[batch, seq, n_features(upstream_layer_idx + 1)]`
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] if `upstream_layer_idx` has no next
    /// layer, otherwise propagates errors from the underlying backend.
    pub fn compute_downstream_magnitudes(
        &self,
        upstream_layer_idx: usize,
        upstream_magnitudes: &Tensor,
    ) -> Result<Tensor> {
        if upstream_layer_idx + 1 >= self.num_layers() {
            return Err(CircuitError::Search(format!(
                "layer {upstream_layer_idx} has no downstream layer ({} layers)",
                self.num_layers()
            )));
        }
        self.backend
            .compute_downstream_magnitudes(upstream_layer_idx, upstream_magnitudes)
    }

    /// Access the underlying backend.
    // TRAIT_OBJECT: caller needs dynamic dispatch for backend-specific methods
    #[must_use]
    pub fn backend(&self) -> &dyn SparsifiedBackend {
        &*self.backend
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
