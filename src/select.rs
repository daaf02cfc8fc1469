//! Block importance selection
//!
//! Decides, per (batch, head, query-block) row, which key blocks the sparse
//! kernel should visit. Queries and keys are mean-pooled to one vector per
//! block, block-pair importance is a scaled dot product between the pooled
//! vectors, and the per-row probability distribution over non-text key
//! blocks drives an adaptive count: blocks are taken in descending
//! probability order until the cumulative mass crosses the configured
//! threshold, with `top_k` as a hard floor. Physical neighbors and text
//! blocks are then OR-ed in unconditionally.
//!
//! Every row's selection is independent of every other row; rows run in
//! parallel.

use rayon::prelude::*;

use crate::config::SparseAttentionConfig;
use crate::error::{EsparsoError, Result};
use crate::mask::{BlockSelectionMask, NeighborRelation};
use crate::simd;
use crate::tensor::Tensor;

/// Mean-pool the position axis of a `[batch, head, position, channel]`
/// tensor into fixed-size blocks
///
/// Output shape is `[batch, head, position / block_size, channel]`.
///
/// # Errors
///
/// Returns `InvalidShape` if the input is not 4-D or the position axis is
/// not a multiple of `block_size`.
pub fn pool_blocks(x: &Tensor<f32>, block_size: usize) -> Result<Tensor<f32>> {
    let shape = x.shape();
    if shape.len() != 4 {
        return Err(EsparsoError::InvalidShape {
            reason: format!("expected 4D [batch, head, position, channel], got {shape:?}"),
        });
    }
    if block_size == 0 {
        return Err(EsparsoError::InvalidShape {
            reason: "block_size must be > 0".to_string(),
        });
    }
    let (batch, heads, positions, channels) = (shape[0], shape[1], shape[2], shape[3]);
    if !positions.is_multiple_of(block_size) {
        return Err(EsparsoError::InvalidShape {
            reason: format!("position axis {positions} is not a multiple of block size {block_size}"),
        });
    }

    let blocks = positions / block_size;
    let data = x.data();
    let inv = 1.0 / block_size as f32;
    let mut pooled = vec![0.0f32; batch * heads * blocks * channels];

    for b in 0..batch {
        for h in 0..heads {
            let plane = x.plane_offset(b, h);
            for blk in 0..blocks {
                let out_offset = ((b * heads + h) * blocks + blk) * channels;
                for pos in 0..block_size {
                    let in_offset = plane + (blk * block_size + pos) * channels;
                    for c in 0..channels {
                        pooled[out_offset + c] += data[in_offset + c];
                    }
                }
                for c in 0..channels {
                    pooled[out_offset + c] *= inv;
                }
            }
        }
    }

    Tensor::from_vec(vec![batch, heads, blocks, channels], pooled)
}

/// Importance-based block selector
///
/// Built from a validated [`SparseAttentionConfig`]; see the module docs for
/// the selection algorithm.
#[derive(Debug, Clone)]
pub struct BlockImportanceSelector {
    top_k: usize,
    block_size_m: usize,
    block_size_n: usize,
    prob_threshold: f32,
    text_blocks: usize,
}

impl BlockImportanceSelector {
    /// Create a selector from a configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration fails
    /// [`SparseAttentionConfig::validate`].
    pub fn new(config: &SparseAttentionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            top_k: config.top_k,
            block_size_m: config.block_size_m,
            block_size_n: config.block_size_n,
            prob_threshold: config.prob_threshold,
            text_blocks: config.text_blocks,
        })
    }

    /// Compute the per-row block selection
    ///
    /// # Arguments
    ///
    /// * `query` - Normal-region queries `[batch, head, positions, channel]`;
    ///   the position axis must be a multiple of `block_size_m`
    /// * `key` - Full keys `[batch, head, positions, channel]`; the position
    ///   axis must equal `num_blocks * block_size_n`
    /// * `text_start_block` - First text key-block index; key blocks before
    ///   it form the non-text region scored by importance
    /// * `num_blocks` - Total key-block count (non-text plus text)
    /// * `neighbor` - Optional static adjacency OR-ed into the non-text
    ///   region
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if tensor ranks, batch/head/channel dimensions,
    /// or block alignment don't match the arguments.
    pub fn select(
        &self,
        query: &Tensor<f32>,
        key: &Tensor<f32>,
        text_start_block: usize,
        num_blocks: usize,
        neighbor: Option<&NeighborRelation>,
    ) -> Result<BlockSelectionMask> {
        let q_shape = query.shape();
        let k_shape = key.shape();
        if q_shape.len() != 4 || k_shape.len() != 4 {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "expected 4D query and key, got {q_shape:?} and {k_shape:?}"
                ),
            });
        }
        if q_shape[0] != k_shape[0] || q_shape[1] != k_shape[1] || q_shape[3] != k_shape[3] {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "query {q_shape:?} and key {k_shape:?} disagree on batch, head, or channel"
                ),
            });
        }
        if text_start_block > num_blocks {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "text_start_block {text_start_block} exceeds num_blocks {num_blocks}"
                ),
            });
        }
        if k_shape[2] != num_blocks * self.block_size_n {
            return Err(EsparsoError::InvalidShape {
                reason: format!(
                    "key position axis {} != num_blocks {num_blocks} * block_size_n {}",
                    k_shape[2], self.block_size_n
                ),
            });
        }

        let (batch, heads, head_dim) = (q_shape[0], q_shape[1], q_shape[3]);
        let query_pool = pool_blocks(query, self.block_size_m)?;
        let key_pool = pool_blocks(key, self.block_size_n)?;
        let num_query_blocks = query_pool.shape()[2];

        let scale = 1.0 / (head_dim as f32).sqrt();
        let q_data = query_pool.data();
        let k_data = key_pool.data();
        let top_k = self.top_k;
        let prob_threshold = self.prob_threshold;
        let text_end = (text_start_block + self.text_blocks).min(num_blocks);

        let rows = batch * heads * num_query_blocks;
        let data: Vec<bool> = (0..rows)
            .into_par_iter()
            .flat_map(|row_idx| {
                let qb = row_idx % num_query_blocks;
                let h = (row_idx / num_query_blocks) % heads;
                let b = row_idx / (num_query_blocks * heads);

                let mut row = vec![false; num_blocks];
                let width = text_start_block;

                if width > 0 {
                    let q_off = ((b * heads + h) * num_query_blocks + qb) * head_dim;
                    let q_vec = &q_data[q_off..q_off + head_dim];
                    let k_plane = (b * heads + h) * num_blocks * head_dim;

                    // Importance scores over the non-text columns
                    let mut probs: Vec<f32> = (0..width)
                        .map(|kb| {
                            let k_off = k_plane + kb * head_dim;
                            simd::dot(q_vec, &k_data[k_off..k_off + head_dim]) * scale
                        })
                        .collect();

                    // Row softmax, numerically stable
                    let max_score = probs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let mut sum_exp = 0.0f32;
                    for p in &mut probs {
                        *p = (*p - max_score).exp();
                        sum_exp += *p;
                    }
                    let inv_sum = 1.0 / sum_exp;
                    for p in &mut probs {
                        *p *= inv_sum;
                    }

                    // Descending probability; ties resolve to the lower
                    // original index
                    let mut order: Vec<usize> = (0..width).collect();
                    order.sort_unstable_by(|&a, &b| {
                        probs[b]
                            .partial_cmp(&probs[a])
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.cmp(&b))
                    });

                    // One block past the threshold crossing, so the selected
                    // mass meets or exceeds the threshold
                    let mut cumulative = 0.0f32;
                    let mut below = 0;
                    for &idx in &order {
                        cumulative += probs[idx];
                        if cumulative <= prob_threshold {
                            below += 1;
                        } else {
                            break;
                        }
                    }
                    let needed = (below + 1).max(top_k).min(width);
                    for &idx in &order[..needed] {
                        row[idx] = true;
                    }
                }

                // Physical neighbors join the selection (union only)
                if let Some(relation) = neighbor {
                    if qb < relation.query_blocks() {
                        let limit = width.min(relation.key_blocks());
                        for (kb, slot) in row.iter_mut().enumerate().take(limit) {
                            *slot |= relation.is_neighbor(qb, kb);
                        }
                    }
                }

                // Text blocks are visible to every row unconditionally
                for slot in &mut row[text_start_block..text_end] {
                    *slot = true;
                }

                row
            })
            .collect();

        Ok(BlockSelectionMask::from_raw(
            batch,
            heads,
            num_query_blocks,
            num_blocks,
            data,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor_4d(batch: usize, heads: usize, n: usize, d: usize, f: impl Fn(usize, usize) -> f32) -> Tensor<f32> {
        let mut data = vec![0.0f32; batch * heads * n * d];
        for pos in 0..n {
            for c in 0..d {
                let v = f(pos, c);
                for b in 0..batch {
                    for h in 0..heads {
                        data[((b * heads + h) * n + pos) * d + c] = v;
                    }
                }
            }
        }
        Tensor::from_vec(vec![batch, heads, n, d], data).unwrap()
    }

    #[test]
    fn test_pool_blocks_means() {
        // Positions 0..4 carry values 0,1,2,3 in every channel; block size 2
        // pools to 0.5 and 2.5.
        let x = tensor_4d(1, 1, 4, 2, |pos, _| pos as f32);
        let pooled = pool_blocks(&x, 2).unwrap();
        assert_eq!(pooled.shape(), &[1, 1, 2, 2]);
        assert_eq!(pooled.data(), &[0.5, 0.5, 2.5, 2.5]);
    }

    #[test]
    fn test_pool_blocks_rejects_misaligned() {
        let x = tensor_4d(1, 1, 5, 2, |pos, _| pos as f32);
        assert!(pool_blocks(&x, 2).is_err());
    }

    fn selector(top_k: usize, threshold: f32, block: usize, text_blocks: usize) -> BlockImportanceSelector {
        let config = SparseAttentionConfig::default()
            .with_top_k(top_k)
            .with_block_size(block)
            .with_text_blocks(text_blocks)
            .with_prob_threshold(threshold);
        BlockImportanceSelector::new(&config).unwrap()
    }

    /// Query aligned with key block 2 out of 3 non-text blocks; one text
    /// block trails.
    fn skewed_inputs(block: usize, d: usize) -> (Tensor<f32>, Tensor<f32>) {
        let query = tensor_4d(1, 1, 3 * block, d, |_, c| if c == 0 { 1.0 } else { 0.0 });
        // Key block 2 points along channel 0, others are orthogonal
        let key = tensor_4d(1, 1, 4 * block, d, |pos, c| {
            let kb = pos / block;
            match (kb, c) {
                (2, 0) => 4.0,
                (0, 1) | (1, 1) | (3, 1) => 1.0,
                _ => 0.0,
            }
        });
        (query, key)
    }

    #[test]
    fn test_select_prefers_high_importance_block() {
        let (query, key) = skewed_inputs(4, 16);
        let mask = selector(1, 0.5, 4, 1).select(&query, &key, 3, 4, None).unwrap();
        for qb in 0..3 {
            assert!(mask.is_selected(0, 0, qb, 2), "block 2 dominates row {qb}");
            assert!(mask.is_selected(0, 0, qb, 3), "text block always selected");
        }
    }

    #[test]
    fn test_select_top_k_floor() {
        let (query, key) = skewed_inputs(4, 16);
        let mask = selector(3, 0.5, 4, 1).select(&query, &key, 3, 4, None).unwrap();
        for qb in 0..3 {
            assert_eq!(mask.selected_in_row(0, 0, qb, 0, 3), 3);
        }
    }

    #[test]
    fn test_select_threshold_one_selects_everything() {
        let (query, key) = skewed_inputs(4, 16);
        let mask = selector(1, 1.0, 4, 1).select(&query, &key, 3, 4, None).unwrap();
        for qb in 0..3 {
            assert_eq!(mask.selected_in_row(0, 0, qb, 0, 4), 4);
        }
    }

    #[test]
    fn test_select_tie_break_prefers_lower_index() {
        // All key blocks identical: probabilities tie, threshold 0.5 over 4
        // uniform blocks needs ceil beyond 2 -> blocks 0..3 by index order.
        let query = tensor_4d(1, 1, 4, 16, |_, c| if c == 0 { 1.0 } else { 0.0 });
        let key = tensor_4d(1, 1, 16, 16, |_, c| if c == 0 { 1.0 } else { 0.0 });
        let mask = selector(1, 0.5, 4, 0).select(&query, &key, 4, 4, None).unwrap();
        // cumsum: 0.25, 0.50 both <= 0.5, so needed = 3
        assert_eq!(mask.row(0, 0, 0), &[true, true, true, false]);
    }

    #[test]
    fn test_select_neighbor_union() {
        let (query, key) = skewed_inputs(4, 16);
        let relation = NeighborRelation::banded(3, 4, 0);
        let mask = selector(1, 0.5, 4, 1)
            .select(&query, &key, 3, 4, Some(&relation))
            .unwrap();
        for qb in 0..3 {
            assert!(mask.is_selected(0, 0, qb, qb), "diagonal neighbor kept");
            assert!(mask.is_selected(0, 0, qb, 2), "importance pick kept");
        }
    }

    #[test]
    fn test_select_empty_normal_region() {
        // text_start_block = 0: nothing to score, only text columns set.
        let query = tensor_4d(1, 1, 8, 16, |_, _| 0.5);
        let key = tensor_4d(1, 1, 8, 16, |_, _| 0.5);
        let mask = selector(1, 0.5, 4, 2).select(&query, &key, 0, 2, None).unwrap();
        for qb in 0..2 {
            assert_eq!(mask.row(0, 0, qb), &[true, true]);
        }
    }

    #[test]
    fn test_select_rejects_misaligned_key() {
        let query = tensor_4d(1, 1, 4, 16, |_, _| 0.5);
        let key = tensor_4d(1, 1, 10, 16, |_, _| 0.5);
        assert!(selector(1, 0.5, 4, 1).select(&query, &key, 1, 2, None).is_err());
    }
}
