//! Element-wise tolerance comparison
//!
//! [`assert_allclose`] checks
//!
//! ```text
//! |actual - desired| <= atol + rtol * |desired|
//! ```
//!
//! for every element and, on failure, returns a [`MismatchReport`] inside
//! [`ComprobarError::Mismatch`]. NaN compares equal to NaN and infinities must
//! match exactly.
//!
//! [`DifferentialCheck`] runs a reference producer and a candidate producer
//! over the same inputs and compares their named outputs pairwise.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ComprobarError, Result};
use crate::tensor::{strides_of, Tensor};

/// Mismatched elements listed in a report
pub const MAX_REPORTED_MISMATCHES: usize = 8;

/// Relative and absolute tolerance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    /// Relative tolerance
    pub rtol: f64,
    /// Absolute tolerance
    pub atol: f64,
}

impl Tolerance {
    /// Fused transformer, fp32
    pub const FUSED_FP32: Self = Self::new(1e-5, 1e-2);
    /// Fused transformer, fp32 on V100-class devices
    pub const FUSED_V100: Self = Self::new(1e-5, 1e-4);
    /// Fused transformer, fp16
    pub const FUSED_FP16: Self = Self::new(1e-5, 1e-1);
    /// Composite vs direct gradients
    pub const GRADIENT: Self = Self::new(1e-6, 0.0);

    /// Create a tolerance
    #[must_use]
    pub const fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    /// Whether `actual` is close enough to `desired`
    #[must_use]
    pub fn allows(&self, actual: f64, desired: f64) -> bool {
        if actual.is_nan() || desired.is_nan() {
            return actual.is_nan() && desired.is_nan();
        }
        if actual.is_infinite() || desired.is_infinite() {
            return actual == desired;
        }
        (actual - desired).abs() <= self.atol + self.rtol * desired.abs()
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtol={:e}, atol={:e}", self.rtol, self.atol)
    }
}

/// One mismatched element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MismatchedElement {
    /// Multi-dimensional index
    pub index: Vec<usize>,
    /// Candidate value
    pub actual: f64,
    /// Reference value
    pub desired: f64,
}

/// Summary of a failed comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MismatchReport {
    /// What was compared
    pub label: String,
    /// Shape of both operands
    pub shape: Vec<usize>,
    /// Tolerance applied
    pub tolerance: Tolerance,
    /// Number of compared elements
    pub total: usize,
    /// Number of elements outside tolerance
    pub mismatched: usize,
    /// Largest `|actual - desired|`
    pub max_abs_diff: f64,
    /// Largest `|actual - desired| / |desired|` over non-zero `desired`
    pub max_rel_diff: f64,
    /// First mismatched elements, in row-major order
    pub first: Vec<MismatchedElement>,
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[allow(clippy::cast_precision_loss)]
        let pct = 100.0 * self.mismatched as f64 / self.total.max(1) as f64;
        writeln!(
            f,
            "{}: not equal to tolerance {} (shape {:?})",
            self.label, self.tolerance, self.shape
        )?;
        writeln!(
            f,
            "Mismatched elements: {} / {} ({pct:.3}%)",
            self.mismatched, self.total
        )?;
        writeln!(f, "Max absolute difference: {:e}", self.max_abs_diff)?;
        write!(f, "Max relative difference: {:e}", self.max_rel_diff)?;
        for m in &self.first {
            write!(
                f,
                "\n  at {:?}: actual {} vs desired {}",
                m.index, m.actual, m.desired
            )?;
        }
        Ok(())
    }
}

fn unravel(mut flat: usize, strides: &[usize]) -> Vec<usize> {
    strides
        .iter()
        .map(|&s| {
            let i = flat / s;
            flat %= s;
            i
        })
        .collect()
}

/// Compare two flat buffers that share `shape`
///
/// # Errors
///
/// Returns [`ComprobarError::ShapeMismatch`] if the lengths differ and
/// [`ComprobarError::Mismatch`] if any element is out of tolerance.
pub fn compare_slices<A, D>(
    label: &str,
    shape: &[usize],
    actual: &[A],
    desired: &[D],
    tolerance: Tolerance,
) -> Result<()>
where
    A: Copy + Into<f64>,
    D: Copy + Into<f64>,
{
    if actual.len() != desired.len() {
        return Err(ComprobarError::ShapeMismatch {
            op: "allclose",
            left: vec![actual.len()],
            right: vec![desired.len()],
        });
    }

    let strides = strides_of(shape);
    let mut mismatched = 0;
    let mut max_abs_diff = 0.0f64;
    let mut max_rel_diff = 0.0f64;
    let mut first = Vec::new();

    for (i, (&a, &d)) in actual.iter().zip(desired).enumerate() {
        let (a, d): (f64, f64) = (a.into(), d.into());
        let diff = (a - d).abs();
        if diff.is_finite() {
            max_abs_diff = max_abs_diff.max(diff);
            if d != 0.0 {
                max_rel_diff = max_rel_diff.max(diff / d.abs());
            }
        }
        if !tolerance.allows(a, d) {
            mismatched += 1;
            if first.len() < MAX_REPORTED_MISMATCHES {
                first.push(MismatchedElement {
                    index: unravel(i, &strides),
                    actual: a,
                    desired: d,
                });
            }
        }
    }

    debug!(
        label,
        total = actual.len(),
        mismatched,
        max_abs_diff,
        max_rel_diff,
        "allclose"
    );

    if mismatched == 0 {
        return Ok(());
    }
    Err(ComprobarError::Mismatch(Box::new(MismatchReport {
        label: label.to_string(),
        shape: shape.to_vec(),
        tolerance,
        total: actual.len(),
        mismatched,
        max_abs_diff,
        max_rel_diff,
        first,
    })))
}

/// Assert that two tensors agree element-wise
///
/// # Errors
///
/// Returns [`ComprobarError::ShapeMismatch`] if the shapes differ and
/// [`ComprobarError::Mismatch`] if any element is out of tolerance.
///
/// # Examples
///
/// ```
/// use comprobar::compare::{assert_allclose, Tolerance};
/// use comprobar::Tensor;
///
/// let a = Tensor::from_vec(vec![2], vec![1.0f32, 2.0]).unwrap();
/// let b = Tensor::from_vec(vec![2], vec![1.0f32, 2.0005]).unwrap();
/// assert!(assert_allclose("out", &a, &b, Tolerance::new(0.0, 1e-3)).is_ok());
/// assert!(assert_allclose("out", &a, &b, Tolerance::new(0.0, 1e-4)).is_err());
/// ```
pub fn assert_allclose(
    label: &str,
    actual: &Tensor<f32>,
    desired: &Tensor<f32>,
    tolerance: Tolerance,
) -> Result<()> {
    if actual.shape() != desired.shape() {
        return Err(ComprobarError::ShapeMismatch {
            op: "allclose",
            left: actual.shape().to_vec(),
            right: desired.shape().to_vec(),
        });
    }
    compare_slices(label, actual.shape(), actual.data(), desired.data(), tolerance)
}

/// Named output tensors of one producer
pub type Outputs = Vec<(String, Tensor<f32>)>;

/// Two-producer comparison
///
/// The reference producer runs first; its outputs are matched by name against
/// the candidate's. Every shared name is compared; the first failure is
/// returned.
#[derive(Debug, Clone)]
pub struct DifferentialCheck {
    label: String,
    tolerance: Tolerance,
}

impl DifferentialCheck {
    /// Create a check
    #[must_use]
    pub fn new(label: impl Into<String>, tolerance: Tolerance) -> Self {
        Self {
            label: label.into(),
            tolerance,
        }
    }

    /// Tolerance in use
    #[must_use]
    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }

    /// Run both producers and compare
    ///
    /// Returns the number of compared outputs.
    ///
    /// # Errors
    ///
    /// Propagates producer errors, returns [`ComprobarError::InvalidConfig`]
    /// if the candidate lacks a reference output, and
    /// [`ComprobarError::Mismatch`] on the first failed comparison.
    pub fn run<R, C>(&self, reference: R, candidate: C) -> Result<usize>
    where
        R: FnOnce() -> Result<Outputs>,
        C: FnOnce() -> Result<Outputs>,
    {
        let expected = reference()?;
        let actual = candidate()?;

        for (name, desired) in &expected {
            let (_, got) = actual.iter().find(|(n, _)| n == name).ok_or_else(|| {
                ComprobarError::invalid_config(format!(
                    "{}: candidate produced no '{name}' output",
                    self.label
                ))
            })?;
            assert_allclose(
                &format!("{}/{name}", self.label),
                got,
                desired,
                self.tolerance,
            )?;
        }
        Ok(expected.len())
    }
}
