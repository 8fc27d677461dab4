//! Layer normalization
//!
//! - [`simd_layer_norm`] - Layer normalization of one feature vector
//! - [`layer_norm_rows`] - Row-wise layer normalization of a flattened batch

/// SIMD-accelerated layer normalization
///
/// LayerNorm(x) = (x - mean) / sqrt(var + eps) * weight + bias
///
/// # Arguments
///
/// * `input` - Input vector to normalize
/// * `weight` - Optional scale parameters (gamma); `None` means all ones
/// * `bias` - Optional shift parameters (beta); `None` means all zeros
/// * `eps` - Small constant for numerical stability (typically 1e-5)
///
/// # Example
///
/// ```
/// use comprobar::inference::simd_layer_norm;
///
/// let input = vec![1.0, 2.0, 3.0, 4.0];
/// let output = simd_layer_norm(&input, None, None, 1e-5);
///
/// // Output should have mean ≈ 0 and std ≈ 1
/// let mean: f32 = output.iter().sum::<f32>() / output.len() as f32;
/// assert!(mean.abs() < 1e-5);
/// ```
#[must_use]
pub fn simd_layer_norm(
    input: &[f32],
    weight: Option<&[f32]>,
    bias: Option<&[f32]>,
    eps: f32,
) -> Vec<f32> {
    let n = input.len();
    if n == 0 {
        return Vec::new();
    }

    let mean: f32 = input.iter().sum::<f32>() / n as f32;
    let var: f32 = input.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n as f32;

    let inv_std = 1.0 / (var + eps).sqrt();
    let mut output: Vec<f32> = input.iter().map(|x| (x - mean) * inv_std).collect();

    if let Some(w) = weight {
        for (out, g) in output.iter_mut().zip(w) {
            *out *= g;
        }
    }
    if let Some(b) = bias {
        for (out, beta) in output.iter_mut().zip(b) {
            *out += beta;
        }
    }

    output
}

/// Normalize each row of a flattened `[rows, width]` buffer
///
/// A trailing partial row is ignored.
#[must_use]
pub fn layer_norm_rows(
    data: &[f32],
    width: usize,
    weight: Option<&[f32]>,
    bias: Option<&[f32]>,
    eps: f32,
) -> Vec<f32> {
    if width == 0 {
        return Vec::new();
    }
    data.chunks_exact(width)
        .flat_map(|row| simd_layer_norm(row, weight, bias, eps))
        .collect()
}

// ============================================================================
// EXTREME TDD: Comprehensive Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_norm_basic() {
        let input = vec![1.0, 2.0, 3.0, 4.0];
        let output = simd_layer_norm(&input, None, None, 1e-5);

        let mean: f32 = output.iter().sum::<f32>() / output.len() as f32;
        assert!(mean.abs() < 1e-5, "Mean should be ~0, got {}", mean);

        let var: f32 = output.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / output.len() as f32;
        assert!((var.sqrt() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_layer_norm_unit_affine_matches_none() {
        let input = vec![0.3, -1.2, 4.0, 2.2];
        let ones = vec![1.0; 4];
        let zeros = vec![0.0; 4];
        let plain = simd_layer_norm(&input, None, None, 1e-5);
        let affine = simd_layer_norm(&input, Some(&ones), Some(&zeros), 1e-5);
        assert_eq!(plain, affine);
    }

    #[test]
    fn test_layer_norm_with_scale_and_bias() {
        let input = vec![1.0, 3.0];
        let output = simd_layer_norm(&input, Some(&[2.0, 2.0]), Some(&[1.0, 1.0]), 0.0);
        assert!((output[0] - (-1.0)).abs() < 1e-5);
        assert!((output[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_layer_norm_constant_input() {
        let output = simd_layer_norm(&[2.0, 2.0, 2.0], None, None, 1e-5);
        for &val in &output {
            assert!(val.abs() < 1e-2);
        }
    }

    #[test]
    fn test_layer_norm_empty() {
        assert!(simd_layer_norm(&[], None, None, 1e-5).is_empty());
    }

    #[test]
    fn test_layer_norm_rows() {
        let data = vec![1.0, 3.0, 2.0, 4.0];
        let out = layer_norm_rows(&data, 2, None, None, 1e-5);
        assert_eq!(out.len(), 4);
        assert!((out[0] + out[1]).abs() < 1e-5);
        assert!((out[2] + out[3]).abs() < 1e-5);
        assert_eq!(&out[..2], &simd_layer_norm(&data[..2], None, None, 1e-5)[..]);
    }
}
