//! Symmetric INT8 quantization
//!
//! Implements the per-tensor scheme used around every projection of the fused
//! INT8 transformer:
//!
//! ```text
//! in_scale  = 1 / max|x|
//! out_scale = max|x| / (127 * 127)
//! q         = round(127 * in_scale * x)          (fake quant, no clipping)
//! y         = (q · W) * out_scale                (dequantize)
//! ```
//!
//! Weights are integer valued in `[-64, 64)` so `out_scale` folds the weight
//! scale of `127` into the activation scale.
//!
//! ## Two representations
//!
//! - [`fake_quant`] keeps the rounded values in `f64`, the numeric type of the
//!   reference path. The caller guarantees `scale = 1 / max|x|`, so no clipping
//!   is needed.
//! - [`quantize_i8`] stores the same rounded values as `i8` (saturating), the
//!   representation consumed by [`Int8Weight::matvec`].

use serde::{Deserialize, Serialize};

use crate::error::{ComprobarError, Result};
use crate::tensor::Tensor;

/// Largest representable quantized magnitude
pub const QUANT_MAX_BOUND: f32 = 127.0;

/// Calibrated scales of one projection stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalePair {
    /// Multiplier applied before rounding (`1 / max|x|`)
    pub in_scale: f32,
    /// Multiplier applied to integer accumulators (`max|x| / 127²`)
    pub out_scale: f32,
}

impl ScalePair {
    /// Derive scales from the maximum absolute activation value
    ///
    /// An all-zero activation has no meaningful scale; `in_scale` falls back
    /// to `1.0` so quantization yields zeros instead of NaN.
    #[must_use]
    pub fn from_max_abs(max_v: f32) -> Self {
        if max_v > 0.0 {
            Self {
                in_scale: 1.0 / max_v,
                out_scale: max_v / (QUANT_MAX_BOUND * QUANT_MAX_BOUND),
            }
        } else {
            Self {
                in_scale: 1.0,
                out_scale: 0.0,
            }
        }
    }

    /// Derive scales from live activations
    #[must_use]
    pub fn from_activations(x: &[f32]) -> Self {
        let max_v = x.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        Self::from_max_abs(max_v)
    }
}

/// Fake-quantize: `round(127 * scale * x)` in the reference numeric type
///
/// Rounds half away from zero. Deterministic: identical inputs always give
/// identical outputs.
///
/// # Examples
///
/// ```
/// use comprobar::quantize::fake_quant;
///
/// let q = fake_quant(&[0.5, -1.0, 0.25], 1.0);
/// assert_eq!(q, vec![64.0, -127.0, 32.0]);
/// ```
#[must_use]
pub fn fake_quant(x: &[f32], scale: f32) -> Vec<f64> {
    x.iter()
        .map(|&v| f64::from((QUANT_MAX_BOUND * scale * v).round()))
        .collect()
}

/// Fake-quantize a tensor, keeping its shape
///
/// # Errors
///
/// Never fails for a valid input tensor; the `Result` carries shape errors
/// from tensor construction.
pub fn fake_quant_tensor(x: &Tensor<f32>, scale: f32) -> Result<Tensor<f64>> {
    Tensor::from_vec(x.shape().to_vec(), fake_quant(x.data(), scale))
}

/// Quantize to `i8` with the same rounding as [`fake_quant`]
///
/// Values saturate to `[-127, 127]`.
#[must_use]
pub fn quantize_i8(x: &[f32], scale: f32) -> Vec<i8> {
    x.iter()
        .map(|&v| {
            let q = (QUANT_MAX_BOUND * scale * v)
                .round()
                .clamp(-QUANT_MAX_BOUND, QUANT_MAX_BOUND);
            #[allow(clippy::cast_possible_truncation)]
            let q = q as i8;
            q
        })
        .collect()
}

/// Dequantize an integer accumulator
#[inline]
#[must_use]
pub fn dequantize(acc: f32, out_scale: f32) -> f32 {
    acc * out_scale
}

/// Reference integer projection: `x · W` with `W` stored `[in_dim, out_dim]`
///
/// `x` holds `rows` fake-quantized rows of length `in_dim`. The integer-valued
/// weights are widened to `f64` and accumulated in `f64`, which is exact for
/// operands of this size.
///
/// # Errors
///
/// Returns an error if `weight` is not 2-D or `x` does not hold `rows` rows
/// of `in_dim` values.
pub fn reference_int_linear(x: &[f64], rows: usize, weight: &Tensor<f32>) -> Result<Vec<f64>> {
    let [in_dim, out_dim] = match weight.shape() {
        &[i, o] => [i, o],
        other => {
            return Err(ComprobarError::invalid_shape(format!(
                "linear weight must be 2-D, got {other:?}"
            )))
        },
    };
    if x.len() != rows * in_dim {
        return Err(ComprobarError::ShapeMismatch {
            op: "linear",
            left: vec![rows, x.len() / rows.max(1)],
            right: weight.shape().to_vec(),
        });
    }

    let w = weight.data();
    let mut out = vec![0.0f64; rows * out_dim];
    for r in 0..rows {
        let row = &x[r * in_dim..(r + 1) * in_dim];
        let acc = &mut out[r * out_dim..(r + 1) * out_dim];
        for (i, &xv) in row.iter().enumerate() {
            if xv == 0.0 {
                continue;
            }
            let w_row = &w[i * out_dim..(i + 1) * out_dim];
            for (a, &wv) in acc.iter_mut().zip(w_row) {
                *a += xv * f64::from(wv);
            }
        }
    }
    Ok(out)
}

/// INT8 weight matrix stored row-major `[out_dim, in_dim]`
///
/// The layout a fused kernel consumes after `trans_qkvw`: each output
/// feature owns a contiguous row, so a projection is one dot product per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Int8Weight {
    /// Quantized values, `out_dim` rows of `in_dim`
    pub data: Vec<i8>,
    /// Input dimension (row length)
    pub in_dim: usize,
    /// Output dimension (number of rows)
    pub out_dim: usize,
}

impl Int8Weight {
    /// Create a weight from raw `i8` rows
    ///
    /// # Errors
    ///
    /// Returns error if dimensions don't match the data size
    pub fn new(data: Vec<i8>, in_dim: usize, out_dim: usize) -> Result<Self> {
        if data.len() != in_dim * out_dim {
            return Err(ComprobarError::invalid_shape(format!(
                "Int8Weight data size {} doesn't match {}x{} matrix",
                data.len(),
                out_dim,
                in_dim
            )));
        }
        Ok(Self {
            data,
            in_dim,
            out_dim,
        })
    }

    /// Cast an integer-valued float matrix stored `[in_dim, out_dim]` to `i8`,
    /// transposing to `[out_dim, in_dim]`
    ///
    /// # Errors
    ///
    /// Returns error if the tensor is not 2-D or holds a value that is not an
    /// integer in `i8` range.
    pub fn from_reference(weight: &Tensor<f32>) -> Result<Self> {
        let transposed = weight.transpose(&[1, 0])?;
        let (out_dim, in_dim) = (transposed.shape()[0], transposed.shape()[1]);
        let data = transposed
            .data()
            .iter()
            .map(|&v| {
                if v.fract() != 0.0 || v < f32::from(i8::MIN) || v > f32::from(i8::MAX) {
                    return Err(ComprobarError::UnsupportedOperation {
                        operation: "cast int8".to_string(),
                        reason: format!("{v} is not an int8 value"),
                    });
                }
                #[allow(clippy::cast_possible_truncation)]
                Ok(v as i8)
            })
            .collect::<Result<Vec<i8>>>()?;
        Self::new(data, in_dim, out_dim)
    }

    /// Row `o` of the matrix
    #[must_use]
    pub fn row(&self, o: usize) -> &[i8] {
        &self.data[o * self.in_dim..(o + 1) * self.in_dim]
    }

    /// Integer matrix-vector product with `i32` accumulation
    ///
    /// # Errors
    ///
    /// Returns error if input dimension doesn't match
    pub fn matvec(&self, input: &[i8]) -> Result<Vec<i32>> {
        if input.len() != self.in_dim {
            return Err(ComprobarError::invalid_shape(format!(
                "Input length {} doesn't match weight in_dim {}",
                input.len(),
                self.in_dim
            )));
        }
        Ok((0..self.out_dim)
            .map(|o| {
                self.row(o)
                    .iter()
                    .zip(input)
                    .map(|(&w, &x)| i32::from(w) * i32::from(x))
                    .sum()
            })
            .collect())
    }
}
