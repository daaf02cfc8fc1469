//! Error types for esparso
//!
//! Every fallible operation in the crate returns [`Result`], the crate-wide
//! alias over [`EsparsoError`]. All errors are contract violations detected
//! before any numerical work starts; there is no retry or partial-failure
//! mode anywhere in the crate.

use thiserror::Error;

/// esparso result type
pub type Result<T> = std::result::Result<T, EsparsoError>;

/// Errors produced by tensor construction, configuration validation, and
/// the attention operations
#[derive(Debug, Error)]
pub enum EsparsoError {
    /// A tensor or argument shape is invalid for the requested operation
    #[error("invalid shape: {reason}")]
    InvalidShape {
        /// Description of the violated constraint
        reason: String,
    },

    /// Data length does not match the product of the shape dimensions
    #[error("data size {data_size} doesn't match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual element count
        data_size: usize,
        /// Requested shape
        shape: Vec<usize>,
        /// Element count implied by the shape
        expected: usize,
    },

    /// The head dimension is outside the supported set
    #[error("unsupported head_dim {head_dim}: must be one of 16, 32, 64, 128")]
    UnsupportedHeadDim {
        /// The rejected head dimension
        head_dim: usize,
    },

    /// A configuration field failed validation
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// Description of the violated constraint
        reason: String,
    },

    /// A selection row holds more blocks than the requested index-list width
    #[error("selection row holds {selected} blocks but index list width is {width}")]
    IndexListOverflow {
        /// Blocks selected in the offending row
        selected: usize,
        /// Caller-provided row width
        width: usize,
    },
}
