//! # esparso
//!
//! Block-sparse attention with importance-based block selection for
//! long-context sequence models, in pure Rust.
//!
//! esparso (Spanish: "sparse") splits the token sequence into fixed-size
//! blocks and restricts each query block's attention to a dynamically
//! selected subset of key/value blocks, plus a small set of dedicated
//! "text" blocks that always receive full attention and are visible to
//! every other block. The selection is driven by pooled block importance
//! scores and a probability-mass threshold; the kernel consumes it with a
//! single-pass streaming softmax that never materializes the full
//! attention matrix.
//!
//! ## Example
//!
//! ```
//! use esparso::{BlockSparseAttention, SparseAttentionConfig, Tensor};
//!
//! let config = SparseAttentionConfig::default()
//!     .with_block_size(4)
//!     .with_text_blocks(1)
//!     .with_top_k(1);
//! let attn = BlockSparseAttention::new(config).unwrap();
//!
//! // [batch, position, head, channel]
//! let q = Tensor::from_vec(vec![1, 8, 1, 16], vec![0.1; 128]).unwrap();
//! let k = q.clone();
//! let v = q.clone();
//!
//! let out = attn.forward(&q, &k, &v, None, false).unwrap();
//! assert_eq!(out.shape(), &[1, 8, 16]);
//! ```
//!
//! ## Architecture
//!
//! - [`select`]: pooled-block importance scoring and adaptive selection
//! - [`kernel`]: streaming-softmax sparse attention over selected blocks
//! - [`attention`]: the orchestrator splitting normal and text regions
//! - [`dense`]: the dense reference primitive used for text-region queries
//!
//! Every (batch, head, query-block) triple is an independent unit of work;
//! the crate parallelizes over them with rayon and uses AVX2 dot products
//! where the target enables them.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 for scales and means
#![allow(clippy::cast_possible_truncation)] // block indices fit in i32
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::many_single_char_names)] // b/h/q/k/d are the domain's names
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // exact comparisons are intentional in tests
#![allow(clippy::doc_markdown)]

pub mod attention;
pub mod config;
pub mod dense;
pub mod error;
pub mod kernel;
pub mod mask;
pub mod pad;
pub mod select;
pub mod simd;
pub mod tensor;

// Re-exports for convenience
pub use attention::BlockSparseAttention;
pub use config::SparseAttentionConfig;
pub use error::{EsparsoError, Result};
pub use tensor::Tensor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
