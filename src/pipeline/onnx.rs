//! Helpers for moving tensors out of ONNX Runtime outputs.

use ndarray::{Array, ArrayD, Dimension, IxDyn};
use ort::value::ValueRef;

use crate::error::{Error, Result};

/// Error for a session that produced no outputs.
pub(crate) fn missing_output(what: &str) -> Error {
    Error::ShapeMismatch {
        expected: format!("{what} output"),
        actual: "no output".to_string(),
    }
}

/// Extract an f32 array of dimensionality `D` from an ONNX value.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub(crate) fn extract_array<D: Dimension>(value: &ValueRef<'_>) -> Result<Array<f32, D>> {
    let (shape_info, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|source| Error::Inference { source })?;

    // Safe: tensor dimensions are always non-negative and within bounds
    let dims: Vec<usize> = shape_info.iter().map(|&x| x as usize).collect();

    let array = ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec()).map_err(|_| {
        Error::ShapeMismatch {
            expected: format!("{dims:?}"),
            actual: "reshape failed".to_string(),
        }
    })?;

    array
        .into_dimensionality::<D>()
        .map_err(|_| Error::ShapeMismatch {
            expected: D::NDIM.map_or_else(|| "any rank".to_string(), |n| format!("{n}D tensor")),
            actual: format!("{}D tensor", dims.len()),
        })
}
