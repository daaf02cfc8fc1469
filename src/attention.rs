//! Combined block-sparse attention
//!
//! The orchestrator behind the crate's public entry point. It splits the
//! padded context into a normal prefix and a text suffix, runs the
//! importance selector and the sparse kernel over the prefix against the
//! full key/value, runs the dense primitive for text-region queries (which
//! always see every key), and concatenates the two outputs along the
//! position axis.

use crate::config::SparseAttentionConfig;
use crate::dense::DenseAttention;
use crate::error::{EsparsoError, Result};
use crate::kernel::BlockSparseKernel;
use crate::mask::{NeighborRelation, SelectionView};
use crate::pad::pad_position_axis;
use crate::select::BlockImportanceSelector;
use crate::tensor::Tensor;

/// Block-sparse attention over a normal region plus text blocks
///
/// Queries, keys, and values arrive in caller layout
/// `[batch, position, head, channel]`; the output is
/// `[batch, position, head * channel]`, or `[batch, head, position, channel]`
/// when `keep_4d` is requested.
///
/// # Examples
///
/// ```
/// use esparso::{BlockSparseAttention, SparseAttentionConfig, Tensor};
///
/// let config = SparseAttentionConfig::default()
///     .with_block_size(4)
///     .with_text_blocks(1)
///     .with_top_k(1);
/// let attn = BlockSparseAttention::new(config).unwrap();
///
/// let q = Tensor::from_vec(vec![1, 8, 1, 16], vec![0.1; 128]).unwrap();
/// let out = attn.forward(&q, &q.clone(), &q.clone(), None, false).unwrap();
/// assert_eq!(out.shape(), &[1, 8, 16]);
/// ```
#[derive(Debug, Clone)]
pub struct BlockSparseAttention {
    config: SparseAttentionConfig,
    neighbor: Option<NeighborRelation>,
}

impl BlockSparseAttention {
    /// Create the attention layer from a configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration fails
    /// [`SparseAttentionConfig::validate`].
    pub fn new(config: SparseAttentionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            neighbor: None,
        })
    }

    /// Attach a static physical-neighbor relation; it is OR-ed into every
    /// selection the layer computes
    #[must_use]
    pub fn with_neighbor_relation(mut self, neighbor: NeighborRelation) -> Self {
        self.neighbor = Some(neighbor);
        self
    }

    /// The layer's configuration
    #[must_use]
    pub fn config(&self) -> &SparseAttentionConfig {
        &self.config
    }

    /// Compute block-sparse attention
    ///
    /// # Arguments
    ///
    /// * `query` / `key` / `value` - `[batch, position, head, channel]`,
    ///   identical shapes
    /// * `seqlens` - Optional valid token count per batch entry; defaults to
    ///   the full context length. Sparse-path rows and columns beyond a
    ///   batch entry's length never contribute.
    /// * `keep_4d` - Return `[batch, head, position, channel]` instead of
    ///   flattening heads into channels
    ///
    /// # Errors
    ///
    /// Returns an error on shape disagreements, unsupported head dimensions,
    /// sequence lengths beyond the padded context, or when `text_blocks`
    /// exceeds the total block count for this context.
    pub fn forward(
        &self,
        query: &Tensor<f32>,
        key: &Tensor<f32>,
        value: &Tensor<f32>,
        seqlens: Option<&[usize]>,
        keep_4d: bool,
    ) -> Result<Tensor<f32>> {
        let shape = query.shape();
        if shape.len() != 4 {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "expected 4D [batch, position, head, channel], got {shape:?}"
                ),
            });
        }
        if key.shape() != shape || value.shape() != shape {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "query {shape:?}, key {:?}, value {:?} must have identical shapes",
                    key.shape(),
                    value.shape()
                ),
            });
        }
        let (batch, ctx, heads, head_dim) = (shape[0], shape[1], shape[2], shape[3]);

        // Rejects unsupported head dimensions up front, for both paths
        let kernel = BlockSparseKernel::new(
            head_dim,
            self.config.block_size_m,
            self.config.block_size_n,
        )?;

        let scale = 1.0 / (head_dim as f32).sqrt();
        let q_heads = transpose_to_heads(query)?;
        let k_heads = transpose_to_heads(key)?;
        let v_heads = transpose_to_heads(value)?;

        let q_pad = pad_position_axis(&q_heads, self.config.block_size_m)?;
        let padded_ctx = q_pad.shape()[2];
        if !padded_ctx.is_multiple_of(self.config.block_size_n) {
            return Err(EsparsoError::InvalidConfig {
                reason: format!(
                    "padded context {padded_ctx} is not a multiple of block_size_n {}",
                    self.config.block_size_n
                ),
            });
        }
        let num_blocks = padded_ctx / self.config.block_size_m;
        if self.config.text_blocks > num_blocks {
            return Err(EsparsoError::InvalidConfig {
                reason: format!(
                    "text_blocks {} exceeds total block count {num_blocks}",
                    self.config.text_blocks
                ),
            });
        }
        let normal_blocks = num_blocks - self.config.text_blocks;
        let normal_tokens = normal_blocks * self.config.block_size_m;

        let seqlens_vec: Vec<usize> = match seqlens {
            Some(lens) => {
                if lens.len() != batch {
                    return Err(EsparsoError::InvalidShape {
                        reason: format!(
                            "seqlens has {} entries for batch size {batch}",
                            lens.len()
                        ),
                    });
                }
                if let Some(&bad) = lens.iter().find(|&&s| s > padded_ctx) {
                    return Err(EsparsoError::InvalidShape {
                        reason: format!("seqlen {bad} exceeds padded context {padded_ctx}"),
                    });
                }
                lens.to_vec()
            }
            None => vec![ctx; batch],
        };

        // Sparse path over the normal prefix, against the full key/value
        let out_normal = if normal_blocks > 0 {
            let k_pad = pad_position_axis(&k_heads, self.config.block_size_m)?;
            let v_pad = pad_position_axis(&v_heads, self.config.block_size_m)?;
            let q_normal = slice_positions(&q_pad, 0, normal_tokens)?;
            let selector = BlockImportanceSelector::new(&self.config)?;
            let mask = selector.select(
                &q_normal,
                &k_pad,
                normal_blocks,
                num_blocks,
                self.neighbor.as_ref(),
            )?;
            Some(kernel.forward(
                &q_normal,
                &k_pad,
                &v_pad,
                &seqlens_vec,
                SelectionView::OneHot(&mask),
                scale,
                self.config.text_amp,
                normal_blocks,
            )?)
        } else {
            None
        };

        // Dense path for text-region queries, which see every key
        let normal_cut = if out_normal.is_some() {
            normal_tokens.min(ctx)
        } else {
            0
        };
        let out_text = if self.config.text_blocks > 0 && normal_cut < ctx {
            let q_text = slice_positions(&q_heads, normal_cut, ctx)?;
            let dense = DenseAttention::new(head_dim)?;
            Some(dense.forward(&q_text, &k_heads, &v_heads, false, scale)?)
        } else {
            None
        };

        // Concatenate the two regions along the position axis
        let d = head_dim;
        let mut out = vec![0.0f32; batch * heads * ctx * d];
        for b in 0..batch {
            for h in 0..heads {
                let dst = (b * heads + h) * ctx * d;
                if let Some(normal) = &out_normal {
                    let src = normal.plane_offset(b, h);
                    out[dst..dst + normal_cut * d]
                        .copy_from_slice(&normal.data()[src..src + normal_cut * d]);
                }
                if let Some(text) = &out_text {
                    let text_rows = ctx - normal_cut;
                    let src = text.plane_offset(b, h);
                    out[dst + normal_cut * d..dst + ctx * d]
                        .copy_from_slice(&text.data()[src..src + text_rows * d]);
                }
            }
        }

        let out_heads = Tensor::from_vec(vec![batch, heads, ctx, d], out)?;
        if keep_4d {
            Ok(out_heads)
        } else {
            merge_heads(&out_heads)
        }
    }
}

/// `[batch, position, head, channel]` → `[batch, head, position, channel]`
fn transpose_to_heads(x: &Tensor<f32>) -> Result<Tensor<f32>> {
    let shape = x.shape();
    let (batch, positions, heads, channels) = (shape[0], shape[1], shape[2], shape[3]);
    let data = x.data();
    let mut out = vec![0.0f32; data.len()];
    for b in 0..batch {
        for pos in 0..positions {
            for h in 0..heads {
                let src = ((b * positions + pos) * heads + h) * channels;
                let dst = ((b * heads + h) * positions + pos) * channels;
                out[dst..dst + channels].copy_from_slice(&data[src..src + channels]);
            }
        }
    }
    Tensor::from_vec(vec![batch, heads, positions, channels], out)
}

/// Copy positions `[start, end)` of a `[batch, head, position, channel]`
/// tensor
fn slice_positions(x: &Tensor<f32>, start: usize, end: usize) -> Result<Tensor<f32>> {
    let shape = x.shape();
    let (batch, heads, positions, channels) = (shape[0], shape[1], shape[2], shape[3]);
    debug_assert!(start < end && end <= positions);
    let rows = end - start;
    let data = x.data();
    let mut out = vec![0.0f32; batch * heads * rows * channels];
    for b in 0..batch {
        for h in 0..heads {
            let src = x.plane_offset(b, h) + start * channels;
            let dst = (b * heads + h) * rows * channels;
            out[dst..dst + rows * channels].copy_from_slice(&data[src..src + rows * channels]);
        }
    }
    Tensor::from_vec(vec![batch, heads, rows, channels], out)
}

/// `[batch, head, position, channel]` → `[batch, position, head * channel]`
fn merge_heads(x: &Tensor<f32>) -> Result<Tensor<f32>> {
    let shape = x.shape();
    let (batch, heads, positions, channels) = (shape[0], shape[1], shape[2], shape[3]);
    let data = x.data();
    let mut out = vec![0.0f32; data.len()];
    for b in 0..batch {
        for h in 0..heads {
            for pos in 0..positions {
                let src = ((b * heads + h) * positions + pos) * channels;
                let dst = ((b * positions + pos) * heads + h) * channels;
                out[dst..dst + channels].copy_from_slice(&data[src..src + channels]);
            }
        }
    }
    Tensor::from_vec(vec![batch, positions, heads * channels], out)
}
