//! Error types for edge pruning.
//!
//! Shape mismatches between cached activations and sampled gates are fatal:
//! they indicate a structural misconfiguration rather than transient
//! numerical instability, so they are never retried.

use thiserror::Error;

/// Error types for the edge pruner.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration is invalid or internally inconsistent
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// Model weights are missing or incompatible with the model config
    #[error("Bad weights: {0}")]
    BadWeights(String),

    /// Input batch is malformed
    #[error("Bad input: {0}")]
    BadInput(String),

    /// Cached activations and mask tensors disagree on shape
    #[error("Shape mismatch at {site}: {shapes}: {source}")]
    ShapeMismatch {
        /// Patch site that failed (e.g. `attn_in[2].q`)
        site: String,
        /// Rendering of every operand shape involved
        shapes: String,
        /// Underlying backend error
        #[source]
        source: candle_core::Error,
    },

    /// No mask has been sampled (or set) before a patched forward pass
    #[error("No sampled mask available: {0}")]
    MissingMask(&'static str),

    /// Checkpoint contents are incomplete or inconsistent
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor backend errors
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for edge pruning operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error indicates a configuration bug (requires a fix, not a retry)
    #[inline]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::BadConfig(_) | Error::BadWeights(_) | Error::ShapeMismatch { .. }
        )
    }

    /// Check if a fresh start is an acceptable fallback for this error
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Checkpoint(_) | Error::Io(_))
    }
}
