//! Composite gradient rules
//!
//! Each rule chains primitives from [`super::ops`]. Broadcast operands are
//! reduced by summing `out_grad` over [`get_reduce_dims`] and reshaping back
//! to the operand shape; this happens whenever the operand shape differs from
//! the broadcast output shape.

use super::ops::{
    by_pass, divide, expand, full, get_reduce_dims, multiply, pow, reshape, scale, sum, unsqueeze,
};
use super::BinaryGrads;
use crate::error::Result;
use crate::tensor::Tensor;

fn reduce_to(grad: &Tensor<f32>, dims: &[usize]) -> Result<Tensor<f32>> {
    if grad.shape() == dims {
        return Ok(by_pass(grad));
    }
    let axes = get_reduce_dims(grad.shape(), dims)?;
    let reduced = sum(grad, &axes, false)?;
    reshape(&reduced, dims)
}

/// `d(x + y)`: `dx = reduce(dout)`, `dy = reduce(dout)`
///
/// # Errors
///
/// Returns an error if an operand does not broadcast to `out_grad`.
pub fn add_grad(x: &Tensor<f32>, y: &Tensor<f32>, out_grad: &Tensor<f32>) -> Result<BinaryGrads> {
    Ok(BinaryGrads {
        dx: reduce_to(out_grad, x.shape())?,
        dy: reduce_to(out_grad, y.shape())?,
    })
}

/// `d(x - y)`: `dx = reduce(dout)`, `dy = reduce(-dout)`
///
/// # Errors
///
/// Returns an error if an operand does not broadcast to `out_grad`.
pub fn subtract_grad(
    x: &Tensor<f32>,
    y: &Tensor<f32>,
    out_grad: &Tensor<f32>,
) -> Result<BinaryGrads> {
    let neg = scale(out_grad, -1.0, 0.0, true);
    Ok(BinaryGrads {
        dx: reduce_to(out_grad, x.shape())?,
        dy: reduce_to(&neg, y.shape())?,
    })
}

/// `d(x / y)`: `dx = reduce(dout / y)`, `dy = reduce(-(x / y²) * dout)`
///
/// # Errors
///
/// Returns an error if an operand does not broadcast to `out_grad`.
pub fn divide_grad(
    x: &Tensor<f32>,
    y: &Tensor<f32>,
    out_grad: &Tensor<f32>,
) -> Result<BinaryGrads> {
    let y_sq = pow(y, 2.0);
    let x_over = divide(x, &y_sq)?;
    let dy = multiply(&scale(&x_over, -1.0, 0.0, true), out_grad)?;

    let one = full(y.shape(), 1.0)?;
    let dx = multiply(&divide(&one, y)?, out_grad)?;

    Ok(BinaryGrads {
        dx: reduce_to(&dx, x.shape())?,
        dy: reduce_to(&dy, y.shape())?,
    })
}

/// `d tanh(x) = dout * (1 - out²)`
///
/// # Errors
///
/// Returns an error if `out` and `out_grad` do not broadcast.
pub fn tanh_grad(out: &Tensor<f32>, out_grad: &Tensor<f32>) -> Result<Tensor<f32>> {
    let one_minus = scale(&pow(out, 2.0), -1.0, 1.0, true);
    multiply(out_grad, &one_minus)
}

/// `d sqrt(x) = dout * 0.5 / out`
///
/// # Errors
///
/// Returns an error if `out` and `out_grad` do not broadcast.
pub fn sqrt_grad(out: &Tensor<f32>, out_grad: &Tensor<f32>) -> Result<Tensor<f32>> {
    let half = full(out.shape(), 0.5)?;
    multiply(out_grad, &divide(&half, out)?)
}

/// `d sum(x, axes)`: expand `out_grad` back to the shape of `x`
///
/// Without `keepdim`, the reduced axes are first restored with `unsqueeze`;
/// reducing every axis (empty `axes` or all of them) restores axes `1..rank`
/// of the `[1]`-shaped gradient.
///
/// # Errors
///
/// Returns an error if `out_grad` does not match the reduction.
pub fn sum_grad(
    x: &Tensor<f32>,
    out_grad: &Tensor<f32>,
    axes: &[usize],
    keepdim: bool,
) -> Result<Tensor<f32>> {
    let rank = x.ndim();
    let reduce_all = axes.is_empty() || axes.len() == rank;
    if keepdim {
        return expand(out_grad, x.shape());
    }
    let restore: Vec<usize> = if reduce_all {
        (1..rank).collect()
    } else {
        axes.to_vec()
    };
    expand(&unsqueeze(out_grad, &restore)?, x.shape())
}
