// SPDX-License-Identifier: MIT OR Apache-2.0

//! Edge search configuration and JSON parsing.
//!
//! # Usage
//!
//! ```
//! use candle_circuits::EdgeSearchConfig;
//!
//! let json: serde_json::Value = serde_json::from_str(r#"{"num_samples": 64}"#).unwrap();
//! let config = EdgeSearchConfig::from_json(&json).unwrap();
//! assert_eq!(config.num_samples, 64);
//! assert_eq!(config.mean_sample_multiplier, 4);
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{CircuitError, Result};

/// Default oversampling factor for the reference-mean estimate.
pub const DEFAULT_MEAN_SAMPLE_MULTIPLIER: usize = 4;

/// Default floor for the per-sibling-group normalization divisor.
pub const DEFAULT_MIN_MAX_INCREASE: f32 = 1e-6;

// ---------------------------------------------------------------------------
// EdgeSearchConfig
// ---------------------------------------------------------------------------

/// Parameters for [`EdgeSearch`](crate::EdgeSearch).
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSearchConfig {
    /// Samples drawn per circuit variant in the main search.
    pub num_samples: usize,
    /// Multiplier applied to `num_samples` when estimating reference means.
    pub mean_sample_multiplier: usize,
    /// Floor for the maximum increase used as normalization divisor.
    pub min_max_increase: f32,
}

impl EdgeSearchConfig {
    /// Configuration with the given sample count and default settings.
    #[must_use]
    pub const fn new(num_samples: usize) -> Self {
        Self {
            num_samples,
            mean_sample_multiplier: DEFAULT_MEAN_SAMPLE_MULTIPLIER,
            min_max_increase: DEFAULT_MIN_MAX_INCREASE,
        }
    }

    /// Override the reference-mean oversampling factor.
    #[must_use]
    pub const fn with_mean_sample_multiplier(mut self, multiplier: usize) -> Self {
        self.mean_sample_multiplier = multiplier;
        self
    }

    /// Parse a configuration from JSON.
    ///
    /// `num_samples` is required; the other keys fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Config`] if `num_samples` is missing, if a
    /// present key has the wrong type, or if any value fails
    /// [`validate`](Self::validate).
    pub fn from_json(config: &Value) -> Result<Self> {
        let parsed = Self {
            num_samples: get_usize(config, "num_samples")?,
            mean_sample_multiplier: get_usize_or(
                config,
                "mean_sample_multiplier",
                DEFAULT_MEAN_SAMPLE_MULTIPLIER,
            )?,
            min_max_increase: get_f32_or(config, "min_max_increase", DEFAULT_MIN_MAX_INCREASE)?,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check that every parameter is usable.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitError::Config`] on a zero sample count, a zero
    /// multiplier, or a non-positive normalization floor.
    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 {
            return Err(CircuitError::Config("num_samples must be at least 1".into()));
        }
        if self.mean_sample_multiplier == 0 {
            return Err(CircuitError::Config(
                "mean_sample_multiplier must be at least 1".into(),
            ));
        }
        if !(self.min_max_increase.is_finite() && self.min_max_increase > 0.0) {
            return Err(CircuitError::Config(format!(
                "min_max_increase must be positive and finite, got {}",
                self.min_max_increase
            )));
        }
        Ok(())
    }

    /// Sample count for reference-mean estimation.
    ///
    /// `num_samples * mean_sample_multiplier`, capped at `k_nearest` when the
    /// ablator has a finite pool of distinct samples.
    #[must_use]
    pub fn mean_num_samples(&self, k_nearest: Option<usize>) -> usize {
        let requested = self.num_samples.saturating_mul(self.mean_sample_multiplier);
        k_nearest.map_or(requested, |k| requested.min(k)).max(1)
    }
}

impl fmt::Display for EdgeSearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "num_samples={}, mean x{}, floor={:e}",
            self.num_samples, self.mean_sample_multiplier, self.min_max_increase
        )
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let value = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| CircuitError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(value).map_err(|_| CircuitError::Config(format!("{key} overflows usize")))
}

/// Extract a `usize` field, returning a default if absent or `null`.
///
/// A present value that is not a non-negative integer is an error.
fn get_usize_or(config: &Value, key: &str, default: usize) -> Result<usize> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| {
                CircuitError::Config(format!(
                    "field '{key}' must be a non-negative integer, got {value}"
                ))
            }),
    }
}

/// Extract an `f32` field, returning a default if absent or `null`.
///
/// A present value that is not a number is an error.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn get_f32_or(config: &Value, key: &str, default: f32) -> Result<f32> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value.as_f64().map(|v| v as f32).ok_or_else(|| {
            CircuitError::Config(format!("field '{key}' must be a number, got {value}"))
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
