//! Dedicated gradient kernels
//!
//! Each kernel walks the broadcast output once and accumulates straight into
//! the operand gradients, without materializing intermediate tensors.

use super::BinaryGrads;
use crate::error::{ComprobarError, Result};
use crate::tensor::{broadcast_offsets, broadcast_shape, Tensor};

fn check_broadcast(op: &'static str, operand: &[usize], out: &[usize]) -> Result<()> {
    if operand.len() > out.len() || broadcast_shape(operand, out)? != out {
        return Err(ComprobarError::ShapeMismatch {
            op,
            left: operand.to_vec(),
            right: out.to_vec(),
        });
    }
    Ok(())
}

/// Binary gradient kernel: `f(dout, x, y) -> (dx, dy)` per output element
fn binary_kernel<F>(
    op: &'static str,
    x: &Tensor<f32>,
    y: &Tensor<f32>,
    out_grad: &Tensor<f32>,
    f: F,
) -> Result<BinaryGrads>
where
    F: Fn(f32, f32, f32) -> (f32, f32),
{
    let out_shape = out_grad.shape();
    check_broadcast(op, x.shape(), out_shape)?;
    check_broadcast(op, y.shape(), out_shape)?;

    let x_off = broadcast_offsets(x.shape(), out_shape);
    let y_off = broadcast_offsets(y.shape(), out_shape);
    let mut dx = vec![0.0f32; x.size()];
    let mut dy = vec![0.0f32; y.size()];
    for ((&dout, &xi), &yi) in out_grad.data().iter().zip(&x_off).zip(&y_off) {
        let (gx, gy) = f(dout, x.data()[xi], y.data()[yi]);
        dx[xi] += gx;
        dy[yi] += gy;
    }
    Ok(BinaryGrads {
        dx: Tensor::from_vec(x.shape().to_vec(), dx)?,
        dy: Tensor::from_vec(y.shape().to_vec(), dy)?,
    })
}

pub fn add_grad(x: &Tensor<f32>, y: &Tensor<f32>, out_grad: &Tensor<f32>) -> Result<BinaryGrads> {
    binary_kernel("add_grad", x, y, out_grad, |d, _, _| (d, d))
}

pub fn subtract_grad(
    x: &Tensor<f32>,
    y: &Tensor<f32>,
    out_grad: &Tensor<f32>,
) -> Result<BinaryGrads> {
    binary_kernel("subtract_grad", x, y, out_grad, |d, _, _| (d, -d))
}

pub fn divide_grad(
    x: &Tensor<f32>,
    y: &Tensor<f32>,
    out_grad: &Tensor<f32>,
) -> Result<BinaryGrads> {
    binary_kernel("divide_grad", x, y, out_grad, |d, a, b| {
        (d / b, -d * a / (b * b))
    })
}

pub fn tanh_grad(out: &Tensor<f32>, out_grad: &Tensor<f32>) -> Result<Tensor<f32>> {
    out_grad.zip_with(out, |d, o| d * (1.0 - o * o))
}

pub fn sqrt_grad(out: &Tensor<f32>, out_grad: &Tensor<f32>) -> Result<Tensor<f32>> {
    out_grad.zip_with(out, |d, o| d * 0.5 / o)
}

/// Copy each `out_grad` element to every input position it summed over
pub fn sum_grad(
    x: &Tensor<f32>,
    out_grad: &Tensor<f32>,
    axes: &[usize],
    keepdim: bool,
) -> Result<Tensor<f32>> {
    let rank = x.ndim();
    if let Some(&bad) = axes.iter().find(|&&a| a >= rank) {
        return Err(ComprobarError::invalid_shape(format!(
            "sum_grad axis {bad} out of range for shape {:?}",
            x.shape()
        )));
    }
    let reduce_all = axes.is_empty();
    let kept: Vec<usize> = x
        .shape()
        .iter()
        .enumerate()
        .map(|(d, &n)| if reduce_all || axes.contains(&d) { 1 } else { n })
        .collect();
    let expected: usize = kept.iter().product();
    if out_grad.size() != expected {
        return Err(ComprobarError::ShapeMismatch {
            op: "sum_grad",
            left: out_grad.shape().to_vec(),
            right: if keepdim { kept } else { x.shape().to_vec() },
        });
    }
    let data = broadcast_offsets(&kept, x.shape())
        .into_iter()
        .map(|o| out_grad.data()[o])
        .collect();
    Tensor::from_vec(x.shape().to_vec(), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_grad_accumulates_broadcast() {
        let x = Tensor::ones(vec![2, 3, 1, 1]).unwrap();
        let y = Tensor::ones(vec![2, 3, 3, 4]).unwrap();
        let dout = Tensor::full(vec![2, 3, 3, 4], 0.5).unwrap();
        let g = add_grad(&x, &y, &dout).unwrap();
        assert!(g.dx.data().iter().all(|&v| v == 6.0));
        assert!(g.dy.data().iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_rejects_operand_larger_than_output() {
        let x = Tensor::ones(vec![2, 3, 4]).unwrap();
        let dout = Tensor::ones(vec![3, 4]).unwrap();
        assert!(add_grad(&x, &dout, &dout).is_err());
    }

    #[test]
    fn test_sum_grad_reduce_all() {
        let x = Tensor::ones(vec![2, 3]).unwrap();
        let g = sum_grad(&x, &Tensor::full(vec![1], 2.0).unwrap(), &[], false).unwrap();
        assert_eq!(g.data(), &[2.0; 6]);
    }

    #[test]
    fn test_sum_grad_axis() {
        let x = Tensor::ones(vec![2, 3]).unwrap();
        let dout = Tensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap();
        let g = sum_grad(&x, &dout, &[1], false).unwrap();
        assert_eq!(g.data(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert!(sum_grad(&x, &dout, &[0], false).is_err());
    }
}
