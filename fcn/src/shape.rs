//! Strict shape agreement checks for `[batch, channel, height, width]` tensors.

use crate::error::{FcnError, FcnResult};

/// Axis names of a channel-first 4-D tensor.
pub const AXES: [&str; 4] = ["batch", "channel", "height", "width"];

/// Axes compared when only batch and spatial extent must agree.
pub const SPATIAL_AXES: [usize; 3] = [0, 2, 3];

/// Fail unless `left` and `right` agree in every dimension.
pub fn ensure_same_dims(
    left: &str,
    left_dims: [usize; 4],
    right: &str,
    right_dims: [usize; 4],
) -> FcnResult<()> {
    ensure_matching_axes(left, left_dims, right, right_dims, &[0, 1, 2, 3])
}

/// Fail unless `left` and `right` agree in each of `axes`.
///
/// The error names both tensors and the first axis that differs.
pub fn ensure_matching_axes(
    left: &str,
    left_dims: [usize; 4],
    right: &str,
    right_dims: [usize; 4],
    axes: &[usize],
) -> FcnResult<()> {
    match axes
        .iter()
        .copied()
        .find(|&axis| left_dims[axis] != right_dims[axis])
    {
        None => Ok(()),
        Some(dim) => Err(FcnError::ShapeMismatch {
            left: left.to_string(),
            right: right.to_string(),
            dim,
            axis: AXES[dim],
            left_shape: left_dims.to_vec(),
            right_shape: right_dims.to_vec(),
        }),
    }
}
