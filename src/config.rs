//! Sparse attention configuration
//!
//! [`SparseAttentionConfig`] collects the block-selection and kernel
//! parameters shared by the selector, the kernel, and the orchestrator.
//! Fields are public plain data; `with_*` builders exist for call-site
//! ergonomics and [`SparseAttentionConfig::validate`] enforces the contract
//! before any computation starts.

use serde::{Deserialize, Serialize};

use crate::error::{EsparsoError, Result};

/// Parameters for block-sparse attention
///
/// # Examples
///
/// ```
/// use esparso::SparseAttentionConfig;
///
/// let config = SparseAttentionConfig::default()
///     .with_top_k(4)
///     .with_block_size(64)
///     .with_prob_threshold(0.7);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseAttentionConfig {
    /// Hard floor on the number of key blocks selected per query-block row,
    /// regardless of probability mass
    pub top_k: usize,
    /// Query-side block size (positions per query block)
    pub block_size_m: usize,
    /// Key/value-side block size (positions per key block)
    pub block_size_n: usize,
    /// Number of text blocks at the end of the key axis; text blocks are
    /// always selected by every query-block row
    pub text_blocks: usize,
    /// Additive logit bias applied to text-block tiles inside the kernel.
    /// The bias lives in the kernel's base-2 logit domain, so it acts as a
    /// `2^text_amp` odds multiplier on text-block attention weights.
    pub text_amp: f32,
    /// Probability-mass threshold in `(0, 1]` driving the adaptive block
    /// count: blocks are taken in descending probability order until the
    /// cumulative mass exceeds this value
    pub prob_threshold: f32,
}

impl Default for SparseAttentionConfig {
    fn default() -> Self {
        Self {
            top_k: 1,
            block_size_m: 128,
            block_size_n: 128,
            text_blocks: 2,
            text_amp: 1.0,
            prob_threshold: 0.5,
        }
    }
}

impl SparseAttentionConfig {
    /// Set the minimum selected block count
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set both block sizes to the same value
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size_m = block_size;
        self.block_size_n = block_size;
        self
    }

    /// Set query-side and key-side block sizes independently
    #[must_use]
    pub fn with_block_sizes(mut self, block_size_m: usize, block_size_n: usize) -> Self {
        self.block_size_m = block_size_m;
        self.block_size_n = block_size_n;
        self
    }

    /// Set the number of text blocks
    #[must_use]
    pub fn with_text_blocks(mut self, text_blocks: usize) -> Self {
        self.text_blocks = text_blocks;
        self
    }

    /// Set the text-block logit bias
    #[must_use]
    pub fn with_text_amp(mut self, text_amp: f32) -> Self {
        self.text_amp = text_amp;
        self
    }

    /// Set the probability-mass threshold
    #[must_use]
    pub fn with_prob_threshold(mut self, prob_threshold: f32) -> Self {
        self.prob_threshold = prob_threshold;
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if:
    /// - `top_k` is zero
    /// - either block size is zero
    /// - `prob_threshold` is outside `(0, 1]` or not finite
    /// - `text_amp` is not finite
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(EsparsoError::InvalidConfig {
                reason: "top_k must be >= 1".to_string(),
            });
        }
        if self.block_size_m == 0 || self.block_size_n == 0 {
            return Err(EsparsoError::InvalidConfig {
                reason: "block sizes must be > 0".to_string(),
            });
        }
        if !self.prob_threshold.is_finite()
            || self.prob_threshold <= 0.0
            || self.prob_threshold > 1.0
        {
            return Err(EsparsoError::InvalidConfig {
                reason: format!(
                    "prob_threshold must be in (0, 1], got {}",
                    self.prob_threshold
                ),
            });
        }
        if !self.text_amp.is_finite() {
            return Err(EsparsoError::InvalidConfig {
                reason: "text_amp must be finite".to_string(),
            });
        }
        Ok(())
    }
}
