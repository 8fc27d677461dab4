//! SIMD-accelerated primitive operations
//!
//! Provides the floating-point building blocks shared by the reference
//! simulator and the CPU fused kernel. Both paths call the same primitives in
//! the same accumulation order, so differences between them come only from the
//! structure under test (quantized storage, packed caches), never from
//! summation order.
//!
//! ## Operations
//!
//! - [`simd_dot`] - SIMD-accelerated dot product
//! - [`simd_gelu`] - GELU activation (exact, erf based)
//! - [`simd_gelu_tanh`] - GELU activation (tanh approximation)
//! - [`simd_relu`] - ReLU activation
//! - [`simd_softmax`] - Numerically stable softmax
//!
//! Dot products go through trueno's `Vector::dot` (AVX2/SSE on x86, NEON on
//! ARM, scalar fallback elsewhere).

use trueno::Vector;

/// SIMD-accelerated dot product
///
/// Slices of unequal length are truncated to the shorter one.
///
/// # Example
///
/// ```
/// use comprobar::inference::simd_dot;
///
/// let a = vec![1.0, 2.0, 3.0];
/// let b = vec![4.0, 5.0, 6.0];
/// let result = simd_dot(&a, &b);
/// assert!((result - 32.0).abs() < 1e-5);
/// ```
#[inline]
#[must_use]
pub fn simd_dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    Vector::from_slice(&a[..n])
        .dot(&Vector::from_slice(&b[..n]))
        .unwrap_or_else(|_| a[..n].iter().zip(&b[..n]).map(|(x, y)| x * y).sum())
}

/// Exact GELU activation
///
/// GELU(x) = 0.5 * x * (1 + erf(x / sqrt(2)))
///
/// # Example
///
/// ```
/// use comprobar::inference::simd_gelu;
///
/// let mut data = vec![0.0, 1.0, -1.0];
/// simd_gelu(&mut data);
/// assert!((data[0] - 0.0).abs() < 1e-6);
/// assert!((data[1] - 0.8413).abs() < 1e-3);
/// assert!((data[2] + 0.1587).abs() < 1e-3);
/// ```
#[inline]
pub fn simd_gelu(data: &mut [f32]) {
    const FRAC_1_SQRT_2: f32 = std::f32::consts::FRAC_1_SQRT_2;

    for x in data.iter_mut() {
        *x = 0.5 * *x * (1.0 + libm::erff(*x * FRAC_1_SQRT_2));
    }
}

/// GELU activation (tanh approximation)
///
/// GELU(x) ≈ 0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x³)))
#[inline]
pub fn simd_gelu_tanh(data: &mut [f32]) {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6; // sqrt(2/π)
    const COEF: f32 = 0.044715;

    for x in data.iter_mut() {
        let x3 = *x * *x * *x;
        let inner = SQRT_2_OVER_PI * (*x + COEF * x3);
        *x = 0.5 * *x * (1.0 + inner.tanh());
    }
}

/// ReLU activation
#[inline]
pub fn simd_relu(data: &mut [f32]) {
    for x in data.iter_mut() {
        *x = x.max(0.0);
    }
}

/// SIMD-accelerated softmax with numerical stability
///
/// Uses the max-subtraction trick to prevent overflow:
/// softmax(x)_i = exp(x_i - max(x)) / sum(exp(x_j - max(x)))
///
/// # Example
///
/// ```
/// use comprobar::inference::simd_softmax;
///
/// let mut data = vec![1.0, 2.0, 3.0];
/// simd_softmax(&mut data);
///
/// let sum: f32 = data.iter().sum();
/// assert!((sum - 1.0).abs() < 1e-5);
/// assert!(data[2] > data[1]);
/// ```
pub fn simd_softmax(data: &mut [f32]) {
    if data.is_empty() {
        return;
    }

    let max_val = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0;
    for x in data.iter_mut() {
        *x = (*x - max_val).exp();
        sum += *x;
    }

    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for x in data.iter_mut() {
            *x *= inv_sum;
        }
    }
}

// ============================================================================
// EXTREME TDD: Comprehensive Tests
// ============================================================================
