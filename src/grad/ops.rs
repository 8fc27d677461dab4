//! Primitive operations the composite rules are built from
//!
//! Each primitive is a plain forward op on `Tensor<f32>`; a composite
//! gradient is nothing more than a fixed chain of these calls.

use crate::error::{ComprobarError, Result};
use crate::tensor::{broadcast_shape, Tensor};

/// `x + y` with broadcasting
///
/// # Errors
///
/// Returns an error if the shapes cannot be broadcast.
pub fn add(x: &Tensor<f32>, y: &Tensor<f32>) -> Result<Tensor<f32>> {
    x.zip_with(y, |a, b| a + b)
}

/// `x - y` with broadcasting
///
/// # Errors
///
/// Returns an error if the shapes cannot be broadcast.
pub fn subtract(x: &Tensor<f32>, y: &Tensor<f32>) -> Result<Tensor<f32>> {
    x.zip_with(y, |a, b| a - b)
}

/// `x * y` with broadcasting
///
/// # Errors
///
/// Returns an error if the shapes cannot be broadcast.
pub fn multiply(x: &Tensor<f32>, y: &Tensor<f32>) -> Result<Tensor<f32>> {
    x.zip_with(y, |a, b| a * b)
}

/// `x / y` with broadcasting
///
/// # Errors
///
/// Returns an error if the shapes cannot be broadcast.
pub fn divide(x: &Tensor<f32>, y: &Tensor<f32>) -> Result<Tensor<f32>> {
    x.zip_with(y, |a, b| a / b)
}

/// `scale * x + bias` (bias after scale) or `scale * (x + bias)`
#[must_use]
pub fn scale(x: &Tensor<f32>, scale: f32, bias: f32, bias_after_scale: bool) -> Tensor<f32> {
    if bias_after_scale {
        x.map(|&v| scale * v + bias)
    } else {
        x.map(|&v| scale * (v + bias))
    }
}

/// Element-wise power
#[must_use]
pub fn pow(x: &Tensor<f32>, exponent: f32) -> Tensor<f32> {
    x.map(|&v| v.powf(exponent))
}

/// Element-wise tanh
#[must_use]
pub fn tanh(x: &Tensor<f32>) -> Tensor<f32> {
    x.map(|&v| v.tanh())
}

/// Element-wise square root
#[must_use]
pub fn sqrt(x: &Tensor<f32>) -> Tensor<f32> {
    x.map(|&v| v.sqrt())
}

/// Sum over `axes`; an empty list reduces every axis
///
/// # Errors
///
/// Returns an error if an axis is out of range.
pub fn sum(x: &Tensor<f32>, axes: &[usize], keepdim: bool) -> Result<Tensor<f32>> {
    if axes.is_empty() {
        let all: Vec<usize> = (0..x.ndim()).collect();
        return x.sum_axes(&all, keepdim);
    }
    x.sum_axes(axes, keepdim)
}

/// Reshape to `dims`
///
/// # Errors
///
/// Returns an error if the element count changes.
pub fn reshape(x: &Tensor<f32>, dims: &[usize]) -> Result<Tensor<f32>> {
    x.reshape(dims)
}

/// Broadcast to `dims`
///
/// # Errors
///
/// Returns an error if `x` cannot be broadcast to `dims`.
pub fn expand(x: &Tensor<f32>, dims: &[usize]) -> Result<Tensor<f32>> {
    x.broadcast_to(dims)
}

/// Tensor of `dims` filled with `value`
///
/// # Errors
///
/// Returns an error if `dims` is empty or contains zero.
pub fn full(dims: &[usize], value: f32) -> Result<Tensor<f32>> {
    Tensor::full(dims.to_vec(), value)
}

/// Insert size-1 dimensions at each of `axes` (positions in the output)
///
/// # Errors
///
/// Returns an error if an axis exceeds the growing rank.
pub fn unsqueeze(x: &Tensor<f32>, axes: &[usize]) -> Result<Tensor<f32>> {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    let mut dims = x.shape().to_vec();
    for &a in &sorted {
        if a > dims.len() {
            return Err(ComprobarError::invalid_shape(format!(
                "unsqueeze axis {a} out of range for shape {dims:?}"
            )));
        }
        dims.insert(a, 1);
    }
    x.reshape(&dims)
}

/// Pass a tensor through unchanged
#[must_use]
pub fn by_pass(x: &Tensor<f32>) -> Tensor<f32> {
    x.clone()
}

/// Axes of `out_dims` that must be summed to recover `in_dims`
///
/// `in_dims` is right-aligned against `out_dims`; leading axes and axes where
/// `in_dims` is 1 but `out_dims` is not are reduced.
///
/// # Errors
///
/// Returns an error if `in_dims` does not broadcast to `out_dims`.
pub fn get_reduce_dims(out_dims: &[usize], in_dims: &[usize]) -> Result<Vec<usize>> {
    if broadcast_shape(out_dims, in_dims)? != out_dims {
        return Err(ComprobarError::ShapeMismatch {
            op: "get_reduce_dims",
            left: out_dims.to_vec(),
            right: in_dims.to_vec(),
        });
    }
    let lead = out_dims.len() - in_dims.len();
    let mut dims: Vec<usize> = (0..lead).collect();
    dims.extend(
        in_dims
            .iter()
            .enumerate()
            .filter(|&(i, &d)| d == 1 && out_dims[i + lead] != 1)
            .map(|(i, _)| i + lead),
    );
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_reduce_dims() {
        assert_eq!(get_reduce_dims(&[2, 3, 3, 4], &[3, 1, 4]).unwrap(), vec![0, 2]);
        assert_eq!(get_reduce_dims(&[2, 3, 3, 4], &[2, 3, 1, 1]).unwrap(), vec![2, 3]);
        assert!(get_reduce_dims(&[2, 3, 4], &[2, 3, 4]).unwrap().is_empty());
        assert!(get_reduce_dims(&[3, 4], &[2, 4]).is_err());
        assert!(get_reduce_dims(&[4], &[1, 4, 1]).is_err());
    }

    #[test]
    fn test_unsqueeze() {
        let x = full(&[3, 4], 1.0).unwrap();
        assert_eq!(unsqueeze(&x, &[0, 2]).unwrap().shape(), &[1, 3, 1, 4]);
        assert_eq!(unsqueeze(&x, &[2]).unwrap().shape(), &[3, 4, 1]);
        assert!(unsqueeze(&x, &[5]).is_err());
    }

    #[test]
    fn test_scale_modes() {
        let x = full(&[1], 2.0).unwrap();
        assert_eq!(scale(&x, -1.0, 1.0, true).data(), &[-1.0]);
        assert_eq!(scale(&x, 2.0, 1.0, false).data(), &[6.0]);
    }

    #[test]
    fn test_sum_empty_axes_reduces_all() {
        let x = full(&[2, 3], 1.5).unwrap();
        let s = sum(&x, &[], false).unwrap();
        assert_eq!(s.shape(), &[1]);
        assert_eq!(s.data(), &[9.0]);
    }

    #[test]
    fn test_binary_broadcast() {
        let x = full(&[2, 3], 6.0).unwrap();
        let y = full(&[3], 2.0).unwrap();
        assert_eq!(divide(&x, &y).unwrap().data(), &[3.0; 6]);
        assert_eq!(subtract(&x, &y).unwrap().data(), &[4.0; 6]);
        assert_eq!(multiply(&x, &y).unwrap().shape(), &[2, 3]);
    }
}
