//! Block selection representations
//!
//! The selector emits a [`BlockSelectionMask`]: one boolean per
//! (batch, head, query-block, key-block) saying whether that query block
//! attends to that key block. The kernel consumes either the mask directly
//! or its dense index-list form ([`SelectionIndex`], right-padded with the
//! [`NO_BLOCK`] sentinel), wrapped in a [`SelectionView`]. Both views of the
//! same logical selection produce identical kernel output.

use crate::error::{EsparsoError, Result};

/// Sentinel marking an unused slot in a [`SelectionIndex`] row
pub const NO_BLOCK: i32 = -1;

/// Per-row boolean selection over key blocks
///
/// Shape `[batch, head, query_blocks, key_blocks]`, row-major, with each
/// (batch, head, query-block) row stored contiguously. Created fresh per
/// forward call and never mutated after the selector returns it.
#[derive(Debug, Clone)]
pub struct BlockSelectionMask {
    batch: usize,
    heads: usize,
    query_blocks: usize,
    key_blocks: usize,
    data: Vec<bool>,
}

impl BlockSelectionMask {
    /// Create an all-false mask
    #[must_use]
    pub fn new(batch: usize, heads: usize, query_blocks: usize, key_blocks: usize) -> Self {
        Self {
            batch,
            heads,
            query_blocks,
            key_blocks,
            data: vec![false; batch * heads * query_blocks * key_blocks],
        }
    }

    /// Build a mask from a pre-computed row-major boolean vector
    pub(crate) fn from_raw(
        batch: usize,
        heads: usize,
        query_blocks: usize,
        key_blocks: usize,
        data: Vec<bool>,
    ) -> Self {
        debug_assert_eq!(data.len(), batch * heads * query_blocks * key_blocks);
        Self {
            batch,
            heads,
            query_blocks,
            key_blocks,
            data,
        }
    }

    #[inline]
    fn row_offset(&self, b: usize, h: usize, q: usize) -> usize {
        ((b * self.heads + h) * self.query_blocks + q) * self.key_blocks
    }

    /// Mark or unmark a single (query-block, key-block) pair
    pub fn set(&mut self, b: usize, h: usize, q: usize, k: usize, selected: bool) {
        let offset = self.row_offset(b, h, q);
        self.data[offset + k] = selected;
    }

    /// Whether the given query block attends to the given key block
    #[must_use]
    pub fn is_selected(&self, b: usize, h: usize, q: usize, k: usize) -> bool {
        self.data[self.row_offset(b, h, q) + k]
    }

    /// The selection row for one (batch, head, query-block) triple
    #[must_use]
    pub fn row(&self, b: usize, h: usize, q: usize) -> &[bool] {
        let offset = self.row_offset(b, h, q);
        &self.data[offset..offset + self.key_blocks]
    }

    /// Number of selected key blocks in a row, restricted to `[start, end)`
    #[must_use]
    pub fn selected_in_row(&self, b: usize, h: usize, q: usize, start: usize, end: usize) -> usize {
        self.row(b, h, q)[start..end].iter().filter(|&&s| s).count()
    }

    /// Batch dimension
    #[must_use]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Head dimension
    #[must_use]
    pub fn heads(&self) -> usize {
        self.heads
    }

    /// Query-block dimension
    #[must_use]
    pub fn query_blocks(&self) -> usize {
        self.query_blocks
    }

    /// Key-block dimension
    #[must_use]
    pub fn key_blocks(&self) -> usize {
        self.key_blocks
    }

    /// Materialize the dense index-list form of this mask
    ///
    /// Each row lists its selected key-block indices in ascending order and
    /// is right-padded with [`NO_BLOCK`] up to `max_blocks_per_row`.
    ///
    /// # Errors
    ///
    /// Returns `IndexListOverflow` if any row selects more than
    /// `max_blocks_per_row` blocks; overflow is an error, never silent
    /// truncation.
    pub fn to_index_list(&self, max_blocks_per_row: usize) -> Result<SelectionIndex> {
        let rows = self.batch * self.heads * self.query_blocks;
        let mut data = Vec::with_capacity(rows * max_blocks_per_row);

        for row_idx in 0..rows {
            let offset = row_idx * self.key_blocks;
            let row = &self.data[offset..offset + self.key_blocks];
            let selected = row.iter().filter(|&&s| s).count();
            if selected > max_blocks_per_row {
                return Err(EsparsoError::IndexListOverflow {
                    selected,
                    width: max_blocks_per_row,
                });
            }
            for (k, &s) in row.iter().enumerate() {
                if s {
                    data.push(k as i32);
                }
            }
            data.resize(data.len() + (max_blocks_per_row - selected), NO_BLOCK);
        }

        Ok(SelectionIndex {
            batch: self.batch,
            heads: self.heads,
            query_blocks: self.query_blocks,
            max_blocks_per_row,
            data,
        })
    }
}

/// Dense per-row key-block index list with sentinel termination
///
/// Shape `[batch, head, query_blocks, max_blocks_per_row]`; unused trailing
/// slots in each row hold [`NO_BLOCK`]. Consumers stop at the first sentinel.
#[derive(Debug, Clone)]
pub struct SelectionIndex {
    batch: usize,
    heads: usize,
    query_blocks: usize,
    max_blocks_per_row: usize,
    data: Vec<i32>,
}

impl SelectionIndex {
    /// The index row for one (batch, head, query-block) triple
    #[must_use]
    pub fn row(&self, b: usize, h: usize, q: usize) -> &[i32] {
        let offset =
            ((b * self.heads + h) * self.query_blocks + q) * self.max_blocks_per_row;
        &self.data[offset..offset + self.max_blocks_per_row]
    }

    /// Batch dimension
    #[must_use]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Head dimension
    #[must_use]
    pub fn heads(&self) -> usize {
        self.heads
    }

    /// Query-block dimension
    #[must_use]
    pub fn query_blocks(&self) -> usize {
        self.query_blocks
    }

    /// Row width (maximum blocks per row)
    #[must_use]
    pub fn max_blocks_per_row(&self) -> usize {
        self.max_blocks_per_row
    }

    /// All row data, flattened
    #[must_use]
    pub fn data(&self) -> &[i32] {
        &self.data
    }
}

/// The two selection representations accepted by the kernel
///
/// Both views of the same logical selection yield numerically identical
/// attention output.
#[derive(Debug, Clone, Copy)]
pub enum SelectionView<'a> {
    /// Boolean mask consulted per key block
    OneHot(&'a BlockSelectionMask),
    /// Sentinel-terminated dense index list walked per row
    IndexList(&'a SelectionIndex),
}

impl SelectionView<'_> {
    /// Batch dimension of the underlying selection
    #[must_use]
    pub fn batch(&self) -> usize {
        match self {
            Self::OneHot(mask) => mask.batch(),
            Self::IndexList(index) => index.batch(),
        }
    }

    /// Head dimension of the underlying selection
    #[must_use]
    pub fn heads(&self) -> usize {
        match self {
            Self::OneHot(mask) => mask.heads(),
            Self::IndexList(index) => index.heads(),
        }
    }

    /// Query-block dimension of the underlying selection
    #[must_use]
    pub fn query_blocks(&self) -> usize {
        match self {
            Self::OneHot(mask) => mask.query_blocks(),
            Self::IndexList(index) => index.query_blocks(),
        }
    }
}

/// Static physical-neighbor adjacency between query blocks and key blocks
///
/// When supplied to the selector it is OR-ed into the non-text region of the
/// selection, guaranteeing local-window coverage regardless of importance
/// scores. The union never removes importance-selected blocks.
#[derive(Debug, Clone)]
pub struct NeighborRelation {
    query_blocks: usize,
    key_blocks: usize,
    data: Vec<bool>,
}

impl NeighborRelation {
    /// Create an empty (no-neighbor) relation
    #[must_use]
    pub fn new(query_blocks: usize, key_blocks: usize) -> Self {
        Self {
            query_blocks,
            key_blocks,
            data: vec![false; query_blocks * key_blocks],
        }
    }

    /// Banded relation: key block `k` neighbors query block `q` when
    /// `|q - k| <= radius`
    #[must_use]
    pub fn banded(query_blocks: usize, key_blocks: usize, radius: usize) -> Self {
        let mut relation = Self::new(query_blocks, key_blocks);
        for q in 0..query_blocks {
            let lo = q.saturating_sub(radius);
            let hi = (q + radius + 1).min(key_blocks);
            for k in lo..hi {
                relation.set(q, k, true);
            }
        }
        relation
    }

    /// Mark or unmark a (query-block, key-block) pair
    pub fn set(&mut self, q: usize, k: usize, neighbor: bool) {
        self.data[q * self.key_blocks + k] = neighbor;
    }

    /// Whether the pair is marked as physical neighbors
    #[must_use]
    pub fn is_neighbor(&self, q: usize, k: usize) -> bool {
        self.data[q * self.key_blocks + k]
    }

    /// Query-block dimension
    #[must_use]
    pub fn query_blocks(&self) -> usize {
        self.query_blocks
    }

    /// Key-block dimension
    #[must_use]
    pub fn key_blocks(&self) -> usize {
        self.key_blocks
    }
}
