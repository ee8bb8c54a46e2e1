// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feature-magnitude cache produced by a sparsified forward pass.

use candle_core::{DType, Tensor};

use crate::error::{CircuitError, Result};

/// Stores all-position sparse feature magnitudes from a forward pass.
///
/// Layer `0` is the first sparse encoder (typically on the embedding
/// output); layer `i` holds the feature magnitudes of encoder `i`. Each
/// tensor has shape `[seq_len, n_features]`, with the batch dimension
/// already removed.
///
/// # Example
///
/// ```
/// use candle_circuits::FeatureMagnitudeCache;
/// use candle_core::{Device, Tensor};
///
/// let mut cache = FeatureMagnitudeCache::with_capacity(2);
/// // shape [seq_len=6, n_features=512]
/// cache.push(Tensor::zeros((6, 512), candle_core::DType::F32, &Device::Cpu).unwrap());
///
/// let feats = cache.get_position(0, 5).unwrap(); // shape [n_features]
/// assert_eq!(feats.dims(), &[512]);
/// ```
#[derive(Debug, Clone)]
pub struct FeatureMagnitudeCache {
    /// Feature magnitudes per layer, each shape `[seq_len, n_features]`.
    layers: Vec<Tensor>,
}

impl FeatureMagnitudeCache {
    /// Create a cache from collected per-layer magnitudes.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] if a tensor is not 2D or if the
    /// layers disagree on sequence length.
    pub fn new(layers: Vec<Tensor>) -> Result<Self> {
        let mut seq_len = None;
        for (layer, tensor) in layers.iter().enumerate() {
            let (seq, _) = tensor.dims2().map_err(|_| {
                CircuitError::Search(format!(
                    "layer {layer} magnitudes must be [seq_len, n_features], got {:?}",
                    tensor.dims()
                ))
            })?;
            match seq_len {
                Some(expected) if expected != seq => {
                    return Err(CircuitError::Search(format!(
                        "layer {layer} has seq_len {seq}, expected {expected}"
                    )));
                }
                _ => seq_len = Some(seq),
            }
        }
        Ok(Self { layers })
    }

    /// Create an empty cache with capacity for `n_layers` layers.
    #[must_use]
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            layers: Vec::with_capacity(n_layers),
        }
    }

    /// Add the next layer's magnitudes.
    ///
    /// The tensor should have shape `[seq_len, n_features]`.
    pub fn push(&mut self, tensor: Tensor) {
        self.layers.push(tensor);
    }

    /// Get the magnitude tensor for a layer, shape `[seq_len, n_features]`.
    #[must_use]
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.layers.get(layer)
    }

    /// Get the magnitude tensor for a layer, returning an error if absent.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] if the layer is not in the cache.
    pub fn require_layer(&self, layer: usize) -> Result<&Tensor> {
        self.layers.get(layer).ok_or_else(|| {
            CircuitError::Search(format!(
                "layer {layer} not in cache ({} layers)",
                self.layers.len()
            ))
        })
    }

    /// Get the magnitudes at a specific layer and token position.
    ///
    /// Returns shape `[n_features]`.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] if the layer is not in the cache or
    /// the position is out of range.
    pub fn get_position(&self, layer: usize, position: usize) -> Result<Tensor> {
        let layer_tensor = self.require_layer(layer)?;
        let seq_len = layer_tensor.dim(0)?;
        if position >= seq_len {
            return Err(CircuitError::Search(format!(
                "position {position} out of range (seq_len={seq_len})"
            )));
        }
        Ok(layer_tensor.narrow(0, position, 1)?.squeeze(0)?)
    }

    /// Read a single feature magnitude as `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] on out-of-range indices and
    /// [`CircuitError::Model`] if dtype conversion fails.
    pub fn magnitude(&self, layer: usize, position: usize, feature: usize) -> Result<f32> {
        let row = self.get_position(layer, position)?;
        let n_features = row.dim(0)?;
        if feature >= n_features {
            return Err(CircuitError::Search(format!(
                "feature {feature} out of range (n_features={n_features})"
            )));
        }
        Ok(row
            .narrow(0, feature, 1)?
            .to_dtype(DType::F32)?
            .squeeze(0)?
            .to_scalar::<f32>()?)
    }

    /// Number of cached layers.
    #[must_use]
    pub const fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Sequence length (from the first layer's tensor).
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] if the cache is empty.
    pub fn seq_len(&self) -> Result<usize> {
        let first = self
            .layers
            .first()
            .ok_or_else(|| CircuitError::Search("feature magnitude cache is empty".into()))?;
        Ok(first.dim(0)?)
    }

    /// Number of features at a layer.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Search`] if the layer is not in the cache.
    pub fn n_features(&self, layer: usize) -> Result<usize> {
        Ok(self.require_layer(layer)?.dim(1)?)
    }

    /// Whether the cache is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
