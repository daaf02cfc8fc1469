//! Block-sparse attention kernel
//!
//! Streaming-softmax attention restricted to the key blocks named by a
//! [`SelectionView`]. Each (batch, head, query-block) triple is an
//! independent work unit; units run in parallel and write disjoint output
//! rows, so the kernel is lock-free by construction. Within a unit the
//! key-block loop is strictly sequential: the running maximum, running sum,
//! and weighted accumulator carry state across iterations. That is the
//! single sequential dependency in the whole computation.
//!
//! Queries are pre-scaled once by `softmax_scale * log2(e)` and the inner
//! loop uses `exp2` instead of `exp`, so all logits (including the
//! text-block bias) live in the base-2 domain. The online recurrence
//! reproduces the full-row softmax exactly: the running maximum always
//! reflects the true maximum seen so far, so no exponent overflows.

use rayon::prelude::*;

use crate::error::{EsparsoError, Result};
use crate::mask::SelectionView;
use crate::simd;
use crate::tensor::Tensor;

const SUPPORTED_HEAD_DIMS: [usize; 4] = [16, 32, 64, 128];

/// Tiled block-sparse attention kernel
///
/// # Examples
///
/// ```
/// use esparso::kernel::BlockSparseKernel;
///
/// let kernel = BlockSparseKernel::new(64, 128, 128).unwrap();
/// assert!(BlockSparseKernel::new(48, 128, 128).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct BlockSparseKernel {
    head_dim: usize,
    block_size_m: usize,
    block_size_n: usize,
}

impl BlockSparseKernel {
    /// Create a kernel for the given head dimension and block sizes
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedHeadDim` unless `head_dim` is one of
    /// 16, 32, 64, 128, and `InvalidShape` if either block size is zero.
    pub fn new(head_dim: usize, block_size_m: usize, block_size_n: usize) -> Result<Self> {
        if !SUPPORTED_HEAD_DIMS.contains(&head_dim) {
            return Err(EsparsoError::UnsupportedHeadDim { head_dim });
        }
        if block_size_m == 0 || block_size_n == 0 {
            return Err(EsparsoError::InvalidShape {
                reason: "block sizes must be > 0".to_string(),
            });
        }
        Ok(Self {
            head_dim,
            block_size_m,
            block_size_n,
        })
    }

    /// Compute sparse attention output over the selected key blocks
    ///
    /// # Arguments
    ///
    /// * `query` - `[batch, head, q_positions, head_dim]`
    /// * `key` / `value` - `[batch, head, kv_positions, head_dim]`
    /// * `seqlens` - Valid (unpadded) token count per batch entry; query
    ///   rows and key columns at or beyond it never contribute
    /// * `selection` - Which key blocks each query block visits
    /// * `softmax_scale` - Logit scale, conventionally `head_dim^-0.5`
    /// * `text_amp` - Additive base-2 logit bias for key blocks at or after
    ///   `text_start_block`
    /// * `text_start_block` - First text key-block index
    ///
    /// # Returns
    ///
    /// Output tensor shaped like `query`. Rows beyond the batch entry's
    /// sequence length are zero.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on any rank, dimension, sequence-length, or
    /// selection mismatch. All violations are detected before computation
    /// starts; the kernel itself has no failure mode.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        query: &Tensor<f32>,
        key: &Tensor<f32>,
        value: &Tensor<f32>,
        seqlens: &[usize],
        selection: SelectionView<'_>,
        softmax_scale: f32,
        text_amp: f32,
        text_start_block: usize,
    ) -> Result<Tensor<f32>> {
        self.validate(query, key, value, seqlens, selection)?;

        let q_shape = query.shape();
        let (batch, heads, q_ctx, d) = (q_shape[0], q_shape[1], q_shape[2], q_shape[3]);
        let kv_ctx = key.shape()[2];
        let num_query_blocks = q_ctx.div_ceil(self.block_size_m);
        let num_key_blocks = kv_ctx.div_ceil(self.block_size_n);

        let q_data = query.data();
        let k_data = key.data();
        let v_data = value.data();
        let qk_scale = softmax_scale * std::f32::consts::LOG2_E;

        let units = batch * heads * num_query_blocks;
        let output: Vec<f32> = (0..units)
            .into_par_iter()
            .flat_map(|unit| {
                let qb = unit % num_query_blocks;
                let bh = unit / num_query_blocks;
                let h = bh % heads;
                let b = bh / heads;

                self.compute_unit(UnitArgs {
                    q_data,
                    k_data,
                    v_data,
                    b,
                    h,
                    qb,
                    heads,
                    q_ctx,
                    kv_ctx,
                    d,
                    seqlen: seqlens[b],
                    selection,
                    num_key_blocks,
                    qk_scale,
                    text_amp,
                    text_start_block,
                })
            })
            .collect();

        Tensor::from_vec(vec![batch, heads, q_ctx, d], output)
    }

    fn validate(
        &self,
        query: &Tensor<f32>,
        key: &Tensor<f32>,
        value: &Tensor<f32>,
        seqlens: &[usize],
        selection: SelectionView<'_>,
    ) -> Result<()> {
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
        if q_shape[3] != k_shape[3] || k_shape[3] != v_shape[3] {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "Q/K/V channel dims must match exactly: {}, {}, {}",
                    q_shape[3], k_shape[3], v_shape[3]
                ),
            });
        }
        if q_shape[3] != self.head_dim {
            return Err(EsparsoError::UnsupportedHeadDim {
                head_dim: q_shape[3],
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
        if seqlens.len() != q_shape[0] {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "seqlens has {} entries for batch size {}",
                    seqlens.len(),
                    q_shape[0]
                ),
            });
        }
        let kv_ctx = k_shape[2];
        if let Some(&bad) = seqlens.iter().find(|&&s| s > kv_ctx) {
            return Err(EsparsoError::InvalidShape {
                reason: format!("seqlen {bad} exceeds padded context {kv_ctx}"),
            });
        }

        let num_query_blocks = q_shape[2].div_ceil(self.block_size_m);
        let num_key_blocks = kv_ctx.div_ceil(self.block_size_n);
        if selection.batch() != q_shape[0]
            || selection.heads() != q_shape[1]
            || selection.query_blocks() != num_query_blocks
        {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "selection dims [{}, {}, {}] don't match batch {} heads {} query blocks {}",
                    selection.batch(),
                    selection.heads(),
                    selection.query_blocks(),
                    q_shape[0],
                    q_shape[1],
                    num_query_blocks
                ),
            });
        }
        match selection {
            SelectionView::OneHot(mask) => {
                if mask.key_blocks() != num_key_blocks {
                    return Err(EsparsoError::InvalidShape {
                        reason: format!(
                            "selection covers {} key blocks, kernel sees {num_key_blocks}",
                            mask.key_blocks()
                        ),
                    });
                }
            }
            SelectionView::IndexList(index) => {
                if let Some(&bad) = index.data().iter().find(|&&i| i >= num_key_blocks as i32) {
                    return Err(EsparsoError::InvalidShape {
                        reason: format!(
                            "index list names block {bad} but only {num_key_blocks} key blocks exist"
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// One (batch, head, query-block) work unit; returns its output rows.
    fn compute_unit(&self, args: UnitArgs<'_>) -> Vec<f32> {
        let UnitArgs {
            q_data,
            k_data,
            v_data,
            b,
            h,
            qb,
            heads,
            q_ctx,
            kv_ctx,
            d,
            seqlen,
            selection,
            num_key_blocks,
            qk_scale,
            text_amp,
            text_start_block,
        } = args;

        let m_start = qb * self.block_size_m;
        let rows = self.block_size_m.min(q_ctx - m_start);
        let mut out = vec![0.0f32; rows * d];

        // The whole query block lies beyond this batch entry's valid tokens
        if m_start >= seqlen {
            return out;
        }
        let valid_rows = rows.min(seqlen - m_start);

        let q_plane = (b * heads + h) * q_ctx * d;
        let kv_plane = (b * heads + h) * kv_ctx * d;

        // Query tile, pre-scaled into the base-2 logit domain; it stays
        // resident for the whole key-block loop.
        let mut q_tile = vec![0.0f32; valid_rows * d];
        for i in 0..valid_rows {
            let src = q_plane + (m_start + i) * d;
            for c in 0..d {
                q_tile[i * d + c] = q_data[src + c] * qk_scale;
            }
        }

        let candidates: Vec<usize> = match selection {
            SelectionView::OneHot(mask) => (0..num_key_blocks)
                .filter(|&kb| mask.is_selected(b, h, qb, kb))
                .collect(),
            SelectionView::IndexList(index) => index
                .row(b, h, qb)
                .iter()
                .take_while(|&&raw| raw >= 0)
                .map(|&raw| raw as usize)
                .collect(),
        };

        let mut m_i = vec![f32::NEG_INFINITY; valid_rows];
        let mut l_i = vec![0.0f32; valid_rows];
        let mut acc = vec![0.0f32; valid_rows * d];
        let mut scores = vec![0.0f32; self.block_size_n];

        for kb in candidates {
            let n_start = kb * self.block_size_n;
            let cols = self.block_size_n.min(kv_ctx - n_start);
            let bias = if kb >= text_start_block { text_amp } else { 0.0 };

            for i in 0..valid_rows {
                let q_row = &q_tile[i * d..(i + 1) * d];

                let mut row_max = f32::NEG_INFINITY;
                for (jj, score) in scores.iter_mut().enumerate().take(cols) {
                    let col = n_start + jj;
                    // Out-of-range key columns never contribute
                    *score = if col < seqlen {
                        let k_off = kv_plane + col * d;
                        simd::dot(q_row, &k_data[k_off..k_off + d]) + bias
                    } else {
                        f32::NEG_INFINITY
                    };
                    row_max = row_max.max(*score);
                }
                if row_max == f32::NEG_INFINITY {
                    // Tile contributed nothing finite; statistics unchanged
                    continue;
                }

                let m_new = m_i[i].max(row_max);
                let alpha = (m_i[i] - m_new).exp2();

                let row_acc = &mut acc[i * d..(i + 1) * d];
                for a in row_acc.iter_mut() {
                    *a *= alpha;
                }

                let mut p_sum = 0.0f32;
                for (jj, &score) in scores.iter().enumerate().take(cols) {
                    let p = (score - m_new).exp2();
                    if p > 0.0 {
                        p_sum += p;
                        let v_off = kv_plane + (n_start + jj) * d;
                        let v_row = &v_data[v_off..v_off + d];
                        for (a, &vv) in row_acc.iter_mut().zip(v_row) {
                            *a += p * vv;
                        }
                    }
                }

                l_i[i] = l_i[i] * alpha + p_sum;
                m_i[i] = m_new;
            }
        }

        // Final normalization. A row whose selection admitted no in-range
        // columns divides zero by zero and surfaces as NaN; that is a
        // configuration error, not something the kernel repairs.
        for i in 0..valid_rows {
            let inv = 1.0 / l_i[i];
            for c in 0..d {
                out[i * d + c] = acc[i * d + c] * inv;
            }
        }
        debug_assert!(
            out.iter().all(|x| x.is_finite()),
            "sparse attention produced non-finite output - a query row selected no reachable key blocks"
        );

        out
    }
}

/// Borrowed per-unit inputs for [`BlockSparseKernel::compute_unit`]
struct UnitArgs<'a> {
    q_data: &'a [f32],
    k_data: &'a [f32],
    v_data: &'a [f32],
    b: usize,
    h: usize,
    qb: usize,
    heads: usize,
    q_ctx: usize,
    kv_ctx: usize,
    d: usize,
    seqlen: usize,
    selection: SelectionView<'a>,
    num_key_blocks: usize,
    qk_scale: f32,
    text_amp: f32,
    text_start_block: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::BlockSelectionMask;

    fn filled(shape: Vec<usize>, f: impl Fn(usize) -> f32) -> Tensor<f32> {
        let size = shape.iter().product();
        let data = (0..size).map(f).collect();
        Tensor::from_vec(shape, data).unwrap()
    }

    fn all_selected(batch: usize, heads: usize, qb: usize, kb: usize) -> BlockSelectionMask {
        let mut mask = BlockSelectionMask::new(batch, heads, qb, kb);
        for b in 0..batch {
            for h in 0..heads {
                for q in 0..qb {
                    for k in 0..kb {
                        mask.set(b, h, q, k, true);
                    }
                }
            }
        }
        mask
    }

    #[test]
    fn test_rejects_unsupported_head_dim() {
        assert!(matches!(
            BlockSparseKernel::new(48, 128, 128).unwrap_err(),
            EsparsoError::UnsupportedHeadDim { head_dim: 48 }
        ));
        for d in [16, 32, 64, 128] {
            assert!(BlockSparseKernel::new(d, 128, 128).is_ok());
        }
    }

    #[test]
    fn test_rejects_channel_mismatch() {
        let kernel = BlockSparseKernel::new(16, 4, 4).unwrap();
        let q = filled(vec![1, 1, 4, 16], |i| i as f32 * 0.01);
        let k = filled(vec![1, 1, 4, 16], |i| i as f32 * 0.01);
        let v = filled(vec![1, 1, 4, 32], |i| i as f32 * 0.01);
        let mask = all_selected(1, 1, 1, 1);
        let result = kernel.forward(
            &q,
            &k,
            &v,
            &[4],
            SelectionView::OneHot(&mask),
            0.25,
            0.0,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_seqlen_beyond_context() {
        let kernel = BlockSparseKernel::new(16, 4, 4).unwrap();
        let q = filled(vec![1, 1, 4, 16], |i| i as f32 * 0.01);
        let mask = all_selected(1, 1, 1, 1);
        let result = kernel.forward(
            &q,
            &q,
            &q,
            &[5],
            SelectionView::OneHot(&mask),
            0.25,
            0.0,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_index_out_of_range() {
        let kernel = BlockSparseKernel::new(16, 4, 4).unwrap();
        let q = filled(vec![1, 1, 4, 16], |i| i as f32 * 0.01);
        let mut mask = BlockSelectionMask::new(1, 1, 1, 2);
        mask.set(0, 0, 0, 1, true);
        let index = mask.to_index_list(2).unwrap();
        // Index built against 2 key blocks, tensors only hold 1
        let result = kernel.forward(
            &q,
            &q,
            &q,
            &[4],
            SelectionView::IndexList(&index),
            0.25,
            0.0,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_rows_beyond_seqlen() {
        let kernel = BlockSparseKernel::new(16, 2, 2).unwrap();
        let q = filled(vec![1, 1, 4, 16], |i| (i as f32 * 0.1).sin());
        let mask = all_selected(1, 1, 2, 2);
        let out = kernel
            .forward(&q, &q, &q, &[2], SelectionView::OneHot(&mask), 0.25, 0.0, 2)
            .unwrap();
        let data = out.data();
        // Rows 2..4 are beyond seqlen and stay zero
        assert!(data[2 * 16..].iter().all(|&x| x == 0.0));
        // Valid rows are finite and non-trivial
        assert!(data[..2 * 16].iter().all(|x| x.is_finite()));
        assert!(data[..2 * 16].iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_single_block_matches_plain_softmax() {
        // One query row, one key block of two columns: the online update
        // reduces to an ordinary softmax-weighted average.
        let d = 16;
        let kernel = BlockSparseKernel::new(d, 1, 2).unwrap();
        let q = filled(vec![1, 1, 1, d], |i| if i == 0 { 1.0 } else { 0.0 });
        let mut k_data = vec![0.0f32; 2 * d];
        k_data[0] = 2.0; // column 0 scores 2.0 on channel 0
        k_data[d] = -1.0; // column 1 scores -1.0
        let k = Tensor::from_vec(vec![1, 1, 2, d], k_data).unwrap();
        let mut v_data = vec![0.0f32; 2 * d];
        v_data[1] = 10.0; // column 0 value
        v_data[d + 1] = 20.0; // column 1 value
        let v = Tensor::from_vec(vec![1, 1, 2, d], v_data).unwrap();

        let mask = all_selected(1, 1, 1, 1);
        let out = kernel
            .forward(&q, &k, &v, &[2], SelectionView::OneHot(&mask), 1.0, 0.0, 1)
            .unwrap();

        let w0 = (2.0f32).exp() / ((2.0f32).exp() + (-1.0f32).exp());
        let expected = w0 * 10.0 + (1.0 - w0) * 20.0;
        assert!((out.data()[1] - expected).abs() < 1e-4);
        assert!(out.data()[0].abs() < 1e-6);
    }

    #[test]
    fn test_text_amp_shifts_weight_toward_text_block() {
        let d = 16;
        let kernel = BlockSparseKernel::new(d, 2, 1).unwrap();
        let q = filled(vec![1, 1, 2, d], |i| if i % d == 0 { 1.0 } else { 0.0 });
        let k = filled(vec![1, 1, 2, d], |i| if i % d == 0 { 1.0 } else { 0.0 });
        let mut v_data = vec![0.0f32; 2 * d];
        v_data[0] = 1.0; // block 0 value
        v_data[d] = 3.0; // block 1 (text) value
        let v = Tensor::from_vec(vec![1, 1, 2, d], v_data).unwrap();
        let mask = all_selected(1, 1, 1, 2);

        let no_amp = kernel
            .forward(&q, &k, &v, &[2], SelectionView::OneHot(&mask), 0.25, 0.0, 1)
            .unwrap();
        let amped = kernel
            .forward(&q, &k, &v, &[2], SelectionView::OneHot(&mask), 0.25, 2.0, 1)
            .unwrap();

        // Symmetric keys split weight evenly without amp
        assert!((no_amp.data()[0] - 2.0).abs() < 1e-4);
        // The base-2 bias multiplies the text block's odds by 2^2
        let w_text = 4.0 / 5.0;
        let expected = (1.0 - w_text) * 1.0 + w_text * 3.0;
        assert!((amped.data()[0] - expected).abs() < 1e-4);
    }

    #[test]
    fn test_unselected_blocks_do_not_contribute() {
        let d = 16;
        let kernel = BlockSparseKernel::new(d, 2, 2).unwrap();
        let q = filled(vec![1, 1, 2, d], |i| ((i % d) as f32 * 0.3).cos());
        let k = filled(vec![1, 1, 4, d], |i| ((i % d) as f32 * 0.7).sin());
        let v = filled(vec![1, 1, 4, d], |i| i as f32 * 0.01);

        // Only block 0 selected: block 1's K/V values must be invisible
        let mut mask = BlockSelectionMask::new(1, 1, 1, 2);
        mask.set(0, 0, 0, 0, true);
        let sparse = kernel
            .forward(&q, &k, &v, &[4], SelectionView::OneHot(&mask), 0.25, 0.0, 2)
            .unwrap();

        // Same selection against K/V with block 1 replaced by garbage
        let mut k_garbage = k.clone();
        let mut v_garbage = v.clone();
        for x in &mut k_garbage.data_mut()[2 * d..] {
            *x = 1e9;
        }
        for x in &mut v_garbage.data_mut()[2 * d..] {
            *x = -1e9;
        }
        let sparse_garbage = kernel
            .forward(
                &q,
                &k_garbage,
                &v_garbage,
                &[4],
                SelectionView::OneHot(&mask),
                0.25,
                0.0,
                2,
            )
            .unwrap();

        for (a, b) in sparse.data().iter().zip(sparse_garbage.data()) {
            assert_eq!(a, b);
        }
    }
}
