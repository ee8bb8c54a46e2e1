// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-feature normalization statistics.
//!
//! Sparse features have very different natural scales, so reconstruction
//! errors are rescaled by `1 / max` before they are compared. A
//! [`ModelProfile`] is usually computed once over a dataset and stored as
//! JSON:
//!
//! ```json
//! {"layers": [{"features": [{"max": 3.2}, {"max": 0.7, "mean": 0.1}]}]}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CircuitError, Result};

/// Statistics for a single feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureProfile {
    /// Largest magnitude observed for this feature.
    pub max: f32,
    /// Mean magnitude, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f32>,
    /// Standard deviation of the magnitude, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std: Option<f32>,
}

impl FeatureProfile {
    /// Profile with only the `max` statistic.
    #[must_use]
    pub const fn with_max(max: f32) -> Self {
        Self {
            max,
            mean: None,
            std: None,
        }
    }

    /// Coefficient that scales this feature's magnitudes into `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Profile`] if `max` is not a positive finite number.
    pub fn norm_coefficient(&self) -> Result<f32> {
        if self.max.is_finite() && self.max > 0.0 {
            Ok(1.0 / self.max)
        } else {
            Err(CircuitError::Profile(format!(
                "feature max must be positive and finite, got {}",
                self.max
            )))
        }
    }
}

/// Statistics for every feature of one layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerProfile {
    /// Feature profiles indexed by feature index.
    pub features: Vec<FeatureProfile>,
}

impl LayerProfile {
    /// Look up a feature's profile.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Profile`] if the feature index is out of range.
    pub fn feature(&self, feature_idx: usize) -> Result<&FeatureProfile> {
        self.features.get(feature_idx).ok_or_else(|| {
            CircuitError::Profile(format!(
                "feature {feature_idx} not in profile ({} features)",
                self.features.len()
            ))
        })
    }

    /// Number of profiled features.
    #[must_use]
    pub fn num_features(&self) -> usize {
        self.features.len()
    }
}

/// Statistics for every layer of a sparsified model.
///
/// # Example
///
/// ```
/// use candle_circuits::ModelProfile;
///
/// let json = r#"{"layers": [{"features": [{"max": 2.0}, {"max": 4.0}]}]}"#;
/// let profile = ModelProfile::from_json_str(json).unwrap();
/// let coeff = profile.layer(0).unwrap().feature(1).unwrap().norm_coefficient().unwrap();
/// assert!((coeff - 0.25).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Layer profiles indexed by layer index.
    pub layers: Vec<LayerProfile>,
}

impl ModelProfile {
    /// Build a profile from per-layer `max` statistics.
    #[must_use]
    pub fn from_maxes(maxes: &[Vec<f32>]) -> Self {
        Self {
            layers: maxes
                .iter()
                .map(|layer| LayerProfile {
                    features: layer.iter().copied().map(FeatureProfile::with_max).collect(),
                })
                .collect(),
        }
    }

    /// Parse a profile from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Json`] if the string is not a valid profile.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a profile from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Io`] if the file cannot be read and
    /// [`CircuitError::Json`] if its contents are not a valid profile.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Look up a layer's profile.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Profile`] if the layer index is out of range.
    pub fn layer(&self, layer_idx: usize) -> Result<&LayerProfile> {
        self.layers.get(layer_idx).ok_or_else(|| {
            CircuitError::Profile(format!(
                "layer {layer_idx} not in profile ({} layers)",
                self.layers.len()
            ))
        })
    }

    /// Number of profiled layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
