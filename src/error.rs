// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-circuits.

/// Errors that can occur during circuit search.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    /// Forward pass, recomputation, or tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Invalid search inputs (empty or mixed-layer node sets, out-of-range indices).
    #[error("search error: {0}")]
    Search(String),

    /// Resampling ablator failure.
    #[error("ablation error: {0}")]
    Ablation(String),

    /// Missing or degenerate feature normalization statistics.
    #[error("profile error: {0}")]
    Profile(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-circuits operations.
pub type Result<T> = std::result::Result<T, CircuitError>;
