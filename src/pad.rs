//! Position-axis padding
//!
//! The sparse kernel walks whole blocks, so the orchestrator zero-pads the
//! position axis up to a block multiple before splitting the context.
//! Padded rows and columns are excluded from attention by the per-batch
//! sequence lengths, never by the padding values themselves.

use crate::error::{EsparsoError, Result};
use crate::tensor::Tensor;

/// Zero-pad the position axis of a `[batch, head, position, channel]` tensor
/// to the next multiple of `block_size`
///
/// Returns a clone of the input when the axis is already aligned.
///
/// # Errors
///
/// Returns `InvalidShape` if the input is not 4-D or `block_size` is zero.
///
/// # Examples
///
/// ```
/// use esparso::pad::pad_position_axis;
/// use esparso::Tensor;
///
/// let x = Tensor::from_vec(vec![1, 1, 3, 2], vec![1.0; 6]).unwrap();
/// let padded = pad_position_axis(&x, 4).unwrap();
/// assert_eq!(padded.shape(), &[1, 1, 4, 2]);
/// assert_eq!(&padded.data()[6..], &[0.0, 0.0]);
/// ```
pub fn pad_position_axis(x: &Tensor<f32>, block_size: usize) -> Result<Tensor<f32>> {
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
    let padded = positions.div_ceil(block_size) * block_size;
    if padded == positions {
        return Ok(x.clone());
    }

    let data = x.data();
    let mut out = vec![0.0f32; batch * heads * padded * channels];
    for b in 0..batch {
        for h in 0..heads {
            let src = x.plane_offset(b, h);
            let dst = (b * heads + h) * padded * channels;
            out[dst..dst + positions * channels]
                .copy_from_slice(&data[src..src + positions * channels]);
        }
    }

    Tensor::from_vec(vec![batch, heads, padded, channels], out)
}
