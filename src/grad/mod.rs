//! Gradient rules in two forms
//!
//! Every backward rule exists twice:
//!
//! - [`GradPath::Composite`]: a chain of primitive ops from [`ops`]
//!   (`sum`, `reshape`, `scale`, `pow`, `divide`, ...)
//! - [`GradPath::Direct`]: a dedicated kernel that accumulates gradients in a
//!   single pass
//!
//! The two must agree to `rtol = 1e-6` on every supported broadcast pattern.
//!
//! ## Example
//!
//! ```
//! use comprobar::grad::{add_with_grads, GradPath};
//! use comprobar::Tensor;
//!
//! let x = Tensor::ones(vec![2, 3, 4]).unwrap();
//! let y = Tensor::ones(vec![3, 1, 4]).unwrap();
//! let (out, grads) = add_with_grads(&x, &y, GradPath::Composite).unwrap();
//! assert_eq!(out.data()[0], 2.0);
//! assert_eq!(grads.dy.shape(), &[3, 1, 4]);
//! ```

mod composite;
mod direct;
pub mod ops;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ComprobarError, Result};
use crate::tensor::Tensor;

/// Which implementation computes a gradient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradPath {
    /// Built from primitive ops
    Composite,
    /// Dedicated kernel
    Direct,
}

impl GradPath {
    /// Both paths, composite first
    pub const ALL: [Self; 2] = [Self::Composite, Self::Direct];
}

impl fmt::Display for GradPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Composite => "composite",
            Self::Direct => "direct",
        })
    }
}

impl FromStr for GradPath {
    type Err = ComprobarError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "composite" | "prim" => Ok(Self::Composite),
            "direct" => Ok(Self::Direct),
            other => Err(ComprobarError::invalid_config(format!(
                "unknown gradient path '{other}'"
            ))),
        }
    }
}

/// Gradients of a binary op with respect to both operands
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryGrads {
    /// Gradient of the first operand, shaped like it
    pub dx: Tensor<f32>,
    /// Gradient of the second operand, shaped like it
    pub dy: Tensor<f32>,
}

/// Gradients of `x + y`
///
/// # Errors
///
/// Returns an error if an operand does not broadcast to `out_grad`.
pub fn add_grad(
    x: &Tensor<f32>,
    y: &Tensor<f32>,
    out_grad: &Tensor<f32>,
    path: GradPath,
) -> Result<BinaryGrads> {
    match path {
        GradPath::Composite => composite::add_grad(x, y, out_grad),
        GradPath::Direct => direct::add_grad(x, y, out_grad),
    }
}

/// Gradients of `x - y`
///
/// # Errors
///
/// Returns an error if an operand does not broadcast to `out_grad`.
pub fn subtract_grad(
    x: &Tensor<f32>,
    y: &Tensor<f32>,
    out_grad: &Tensor<f32>,
    path: GradPath,
) -> Result<BinaryGrads> {
    match path {
        GradPath::Composite => composite::subtract_grad(x, y, out_grad),
        GradPath::Direct => direct::subtract_grad(x, y, out_grad),
    }
}

/// Gradients of `x / y`
///
/// # Errors
///
/// Returns an error if an operand does not broadcast to `out_grad`.
pub fn divide_grad(
    x: &Tensor<f32>,
    y: &Tensor<f32>,
    out_grad: &Tensor<f32>,
    path: GradPath,
) -> Result<BinaryGrads> {
    match path {
        GradPath::Composite => composite::divide_grad(x, y, out_grad),
        GradPath::Direct => direct::divide_grad(x, y, out_grad),
    }
}

/// Gradient of `tanh`, given its forward output
///
/// # Errors
///
/// Returns an error if the shapes do not broadcast.
pub fn tanh_grad(out: &Tensor<f32>, out_grad: &Tensor<f32>, path: GradPath) -> Result<Tensor<f32>> {
    match path {
        GradPath::Composite => composite::tanh_grad(out, out_grad),
        GradPath::Direct => direct::tanh_grad(out, out_grad),
    }
}

/// Gradient of `sqrt`, given its forward output
///
/// # Errors
///
/// Returns an error if the shapes do not broadcast.
pub fn sqrt_grad(out: &Tensor<f32>, out_grad: &Tensor<f32>, path: GradPath) -> Result<Tensor<f32>> {
    match path {
        GradPath::Composite => composite::sqrt_grad(out, out_grad),
        GradPath::Direct => direct::sqrt_grad(out, out_grad),
    }
}

/// Gradient of `sum(x, axes, keepdim)`; empty `axes` means every axis
///
/// # Errors
///
/// Returns an error if `out_grad` does not match the reduction.
pub fn sum_grad(
    x: &Tensor<f32>,
    out_grad: &Tensor<f32>,
    axes: &[usize],
    keepdim: bool,
    path: GradPath,
) -> Result<Tensor<f32>> {
    match path {
        GradPath::Composite => composite::sum_grad(x, out_grad, axes, keepdim),
        GradPath::Direct => direct::sum_grad(x, out_grad, axes, keepdim),
    }
}

/// Forward `x + y` and its gradients for an all-ones upstream gradient
///
/// # Errors
///
/// Returns an error if the shapes cannot be broadcast.
pub fn add_with_grads(
    x: &Tensor<f32>,
    y: &Tensor<f32>,
    path: GradPath,
) -> Result<(Tensor<f32>, BinaryGrads)> {
    let out = ops::add(x, y)?;
    let out_grad = ops::full(out.shape(), 1.0)?;
    let grads = add_grad(x, y, &out_grad, path)?;
    Ok((out, grads))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{compare_slices, Tolerance};

    type BinaryRule =
        fn(&Tensor<f32>, &Tensor<f32>, &Tensor<f32>, GradPath) -> Result<BinaryGrads>;

    fn ramp(shape: &[usize], step: f32) -> Tensor<f32> {
        let n: usize = shape.iter().product();
        Tensor::from_vec(shape.to_vec(), (0..n).map(|i| 0.5 + i as f32 * step).collect()).unwrap()
    }

    fn agree(label: &str, a: &Tensor<f32>, b: &Tensor<f32>) {
        assert_eq!(a.shape(), b.shape(), "{label}");
        if let Err(e) = compare_slices(label, a.shape(), a.data(), b.data(), Tolerance::GRADIENT) {
            panic!("{e}");
        }
    }

    #[test]
    fn test_paths_agree_on_binary_rules() {
        let shapes: [(&[usize], &[usize]); 4] = [
            (&[2, 3, 4], &[2, 3, 4]),
            (&[2, 3, 3, 4], &[3, 1, 4]),
            (&[2, 3, 3, 4], &[2, 3, 1, 4]),
            (&[2, 3, 3, 4], &[2, 3, 1, 1]),
        ];
        for (xs, ys) in shapes {
            let x = ramp(xs, 0.01);
            let y = ramp(ys, 0.03);
            let dout = ramp(&broadcast(xs, ys), 0.002);
            let rules: [(&str, BinaryRule); 3] = [
                ("add", add_grad),
                ("subtract", subtract_grad),
                ("divide", divide_grad),
            ];
            for (name, f) in rules {
                let c = f(&x, &y, &dout, GradPath::Composite).unwrap();
                let d = f(&x, &y, &dout, GradPath::Direct).unwrap();
                agree(&format!("{name} dx {xs:?}"), &c.dx, &d.dx);
                agree(&format!("{name} dy {ys:?}"), &c.dy, &d.dy);
            }
        }
    }

    fn broadcast(a: &[usize], b: &[usize]) -> Vec<usize> {
        crate::tensor::broadcast_shape(a, b).unwrap()
    }

    #[test]
    fn test_paths_agree_on_unary_rules() {
        let x = ramp(&[3, 4], 0.05);
        let dout = ramp(&[3, 4], 0.1);
        let t = ops::tanh(&x);
        let s = ops::sqrt(&x);
        agree(
            "tanh",
            &tanh_grad(&t, &dout, GradPath::Composite).unwrap(),
            &tanh_grad(&t, &dout, GradPath::Direct).unwrap(),
        );
        agree(
            "sqrt",
            &sqrt_grad(&s, &dout, GradPath::Composite).unwrap(),
            &sqrt_grad(&s, &dout, GradPath::Direct).unwrap(),
        );
    }

    #[test]
    fn test_paths_agree_on_sum_grad() {
        let x = ramp(&[2, 3, 4], 0.1);
        let cases: [(&[usize], bool, Vec<usize>); 4] = [
            (&[1], false, vec![2, 4]),
            (&[0, 2], true, vec![1, 3, 1]),
            (&[], false, vec![1]),
            (&[0, 1, 2], false, vec![1]),
        ];
        for (axes, keepdim, g_shape) in cases {
            let dout = ramp(&g_shape, 1.0);
            let c = sum_grad(&x, &dout, axes, keepdim, GradPath::Composite).unwrap();
            let d = sum_grad(&x, &dout, axes, keepdim, GradPath::Direct).unwrap();
            agree(&format!("sum {axes:?} keepdim={keepdim}"), &c, &d);
        }
    }

    #[test]
    fn test_add_with_grads_broadcast_counts() {
        let x = ramp(&[2, 3, 3, 4], 0.1);
        let y = ramp(&[3, 1, 4], 0.1);
        for path in GradPath::ALL {
            let (out, g) = add_with_grads(&x, &y, path).unwrap();
            assert_eq!(out.shape(), &[2, 3, 3, 4]);
            assert!(g.dx.data().iter().all(|&v| v == 1.0), "{path}");
            assert!(g.dy.data().iter().all(|&v| v == 6.0), "{path}");
        }
    }

    #[test]
    fn test_grad_path_parse() {
        assert_eq!("prim".parse::<GradPath>().unwrap(), GradPath::Composite);
        assert_eq!("direct".parse::<GradPath>().unwrap(), GradPath::Direct);
        assert!("eager".parse::<GradPath>().is_err());
        assert_eq!(serde_json::to_string(&GradPath::Direct).unwrap(), "\"direct\"");
    }
}
