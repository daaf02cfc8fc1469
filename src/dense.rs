//! Dense scaled-dot-product attention
//!
//! The non-sparse reference primitive: full scores, numerically stable row
//! softmax, weighted value sum. The orchestrator uses it for text-region
//! queries, which always see every key; the test suites use it as the
//! oracle the sparse kernel is checked against.

use rayon::prelude::*;

use crate::error::{EsparsoError, Result};
use crate::simd;
use crate::tensor::Tensor;

/// Batched dense attention with an explicit softmax scale and causal flag
///
/// Computes `softmax(Q @ K^T * scale) @ V` per (batch, head) pair over
/// `[batch, head, position, channel]` tensors.
///
/// # References
///
/// "Attention is All You Need" - Vaswani et al., 2017
#[derive(Debug, Clone)]
pub struct DenseAttention {
    head_dim: usize,
}

impl DenseAttention {
    /// Create a dense attention primitive for the given head dimension
    ///
    /// # Errors
    ///
    /// Returns error if `head_dim` is zero
    pub fn new(head_dim: usize) -> Result<Self> {
        if head_dim == 0 {
            return Err(EsparsoError::InvalidShape {
                reason: "head_dim must be > 0".to_string(),
            });
        }
        Ok(Self { head_dim })
    }

    /// Compute dense attention
    ///
    /// # Arguments
    ///
    /// * `query` - `[batch, head, q_positions, head_dim]`
    /// * `key` / `value` - `[batch, head, kv_positions, head_dim]`
    /// * `causal` - When true, query row `i` attends only to key columns
    ///   `j <= i`
    /// * `softmax_scale` - Logit scale, conventionally `head_dim^-0.5`
    ///
    /// # Returns
    ///
    /// Output tensor shaped like `query`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if ranks or dimensions disagree.
    pub fn forward(
        &self,
        query: &Tensor<f32>,
        key: &Tensor<f32>,
        value: &Tensor<f32>,
        causal: bool,
        softmax_scale: f32,
    ) -> Result<Tensor<f32>> {
        let q_shape = query.shape();
        let k_shape = key.shape();
        let v_shape = value.shape();
        if q_shape.len() != 4 || k_shape.len() != 4 || v_shape.len() != 4 {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "expected 4D Q/K/V, got {q_shape:?}, {k_shape:?}, {v_shape:?}"
                ),
            });
        }
        if q_shape[3] != self.head_dim || k_shape[3] != self.head_dim || v_shape[3] != self.head_dim
        {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "expected head_dim={}, got Q={}, K={}, V={}",
                    self.head_dim, q_shape[3], k_shape[3], v_shape[3]
                ),
            });
        }
        if q_shape[0] != k_shape[0]
            || k_shape[0] != v_shape[0]
            || q_shape[1] != k_shape[1]
            || k_shape[1] != v_shape[1]
        {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "Q/K/V batch and head dims must match: {q_shape:?}, {k_shape:?}, {v_shape:?}"
                ),
            });
        }
        if k_shape[2] != v_shape[2] {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "key positions {} != value positions {}",
                    k_shape[2], v_shape[2]
                ),
            });
        }

        let (batch, heads, q_ctx, d) = (q_shape[0], q_shape[1], q_shape[2], q_shape[3]);
        let kv_ctx = k_shape[2];
        let q_data = query.data();
        let k_data = key.data();
        let v_data = value.data();

        // Each query row is an independent unit of work
        let output: Vec<f32> = (0..batch * heads * q_ctx)
            .into_par_iter()
            .flat_map(|row_idx| {
                let i = row_idx % q_ctx;
                let bh = row_idx / q_ctx;
                let plane = bh * kv_ctx * d;
                let q_off = bh * q_ctx * d + i * d;
                let q_row = &q_data[q_off..q_off + d];

                let visible = if causal { (i + 1).min(kv_ctx) } else { kv_ctx };
                let mut scores = Vec::with_capacity(visible);
                for j in 0..visible {
                    let k_off = plane + j * d;
                    scores.push(simd::dot(q_row, &k_data[k_off..k_off + d]) * softmax_scale);
                }

                let max_score = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum_exp = 0.0f32;
                for s in &mut scores {
                    *s = (*s - max_score).exp();
                    sum_exp += *s;
                }
                let inv_sum = 1.0 / sum_exp;

                let mut row_out = vec![0.0f32; d];
                for (j, &w) in scores.iter().enumerate() {
                    let weight = w * inv_sum;
                    let v_off = plane + j * d;
                    let v_row = &v_data[v_off..v_off + d];
                    for (o, &vv) in row_out.iter_mut().zip(v_row) {
                        *o += weight * vv;
                    }
                }

                debug_assert!(
                    row_out.iter().all(|x| x.is_finite()),
                    "dense attention produced non-finite output - check input scaling"
                );
                row_out
            })
            .collect();

        Tensor::from_vec(vec![batch, heads, q_ctx, d], output)
    }
}
