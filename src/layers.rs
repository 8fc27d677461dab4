//! Neural network layers used by the transformer paths
//!
//! - [`LayerNorm`] - layer normalization with gamma and beta
//! - [`Dropout`] - seeded dropout in `upscale_in_train` mode
//! - [`Activation`] - the FFN activation (`gelu`, `gelu_tanh`, `relu`)
//!
//! ## Example
//!
//! ```
//! use comprobar::layers::LayerNorm;
//! use comprobar::Tensor;
//!
//! let layer_norm = LayerNorm::new(4, 1e-5).unwrap();
//! let input = Tensor::from_vec(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
//! let normalized = layer_norm.forward(&input).unwrap();
//! assert_eq!(normalized.shape(), &[1, 4]);
//! ```

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ComprobarError, Result};
use crate::inference::{layer_norm_rows, simd_gelu, simd_gelu_tanh, simd_relu};
use crate::tensor::Tensor;

/// Layer normalization
///
/// Normalizes activations across the feature dimension using:
/// ```text
/// y = (x - mean(x)) / sqrt(variance(x) + eps) * gamma + beta
/// ```
///
/// # References
///
/// Layer Normalization: <https://arxiv.org/abs/1607.06450>
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Normalized shape (feature dimension)
    normalized_shape: usize,
    /// Epsilon for numerical stability
    eps: f32,
    /// Scale parameter (gamma)
    weight: Vec<f32>,
    /// Shift parameter (beta)
    bias: Vec<f32>,
}

impl LayerNorm {
    /// Create a layer normalization with gamma = 1 and beta = 0
    ///
    /// # Arguments
    ///
    /// * `normalized_shape` - Size of the feature dimension to normalize
    /// * `eps` - Small constant for numerical stability (default: `1e-5`)
    ///
    /// # Errors
    ///
    /// Returns error if `normalized_shape` is zero
    pub fn new(normalized_shape: usize, eps: f32) -> Result<Self> {
        Self::with_params(vec![1.0; normalized_shape], vec![0.0; normalized_shape], eps)
    }

    /// Create a layer normalization from explicit gamma and beta
    ///
    /// # Errors
    ///
    /// Returns error if the parameters are empty or of different lengths
    pub fn with_params(weight: Vec<f32>, bias: Vec<f32>, eps: f32) -> Result<Self> {
        if weight.is_empty() {
            return Err(ComprobarError::invalid_shape("normalized_shape must be > 0"));
        }
        if weight.len() != bias.len() {
            return Err(ComprobarError::ShapeMismatch {
                op: "layer_norm params",
                left: vec![weight.len()],
                right: vec![bias.len()],
            });
        }
        Ok(Self {
            normalized_shape: weight.len(),
            eps,
            weight,
            bias,
        })
    }

    /// Forward pass through layer normalization
    ///
    /// # Arguments
    ///
    /// * `input` - Input tensor with shape `[..., normalized_shape]`
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    ///
    /// # Errors
    ///
    /// Returns error if the last dimension doesn't match `normalized_shape`
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let shape = input.shape();
        let last_dim = shape[shape.len() - 1];
        if last_dim != self.normalized_shape {
            return Err(ComprobarError::invalid_shape(format!(
                "Last dimension {} doesn't match normalized_shape {}",
                last_dim, self.normalized_shape
            )));
        }

        let output = self.forward_rows(input.data());
        Tensor::from_vec(shape.to_vec(), output)
    }

    /// Normalize a flattened buffer of `normalized_shape`-wide rows
    #[must_use]
    pub fn forward_rows(&self, data: &[f32]) -> Vec<f32> {
        layer_norm_rows(
            data,
            self.normalized_shape,
            Some(self.weight.as_slice()),
            Some(self.bias.as_slice()),
            self.eps,
        )
    }

    /// Get the normalized shape
    #[must_use]
    pub fn normalized_shape(&self) -> usize {
        self.normalized_shape
    }

    /// Get epsilon value
    #[must_use]
    pub fn eps(&self) -> f32 {
        self.eps
    }
}

/// Seeded dropout
///
/// Training zeroes each element with probability `p` and scales the kept
/// ones by `1 / (1 - p)`; inference is the identity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    /// Dropout with probability `p`
    ///
    /// # Errors
    ///
    /// Returns error if `p` is outside `[0, 1]`
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(ComprobarError::invalid_config(format!(
                "dropout probability must be in [0, 1], got {p}"
            )));
        }
        Ok(Self { p })
    }

    /// Drop probability
    #[must_use]
    pub fn p(&self) -> f32 {
        self.p
    }

    /// Apply in place
    ///
    /// With `p == 0` or outside training this is the identity and the
    /// generator is not advanced.
    pub fn apply(&self, data: &mut [f32], training: bool, rng: &mut StdRng) {
        if self.p == 0.0 || !training {
            return;
        }
        if self.p >= 1.0 {
            data.iter_mut().for_each(|x| *x = 0.0);
            return;
        }

        let scale = 1.0 / (1.0 - self.p);
        for x in data.iter_mut() {
            if rng.gen::<f32>() < self.p {
                *x = 0.0;
            } else {
                *x *= scale;
            }
        }
    }
}

/// FFN activation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Exact GELU
    #[default]
    Gelu,
    /// Tanh-approximated GELU
    GeluTanh,
    /// ReLU
    Relu,
}

impl Activation {
    /// Apply in place
    pub fn apply(self, data: &mut [f32]) {
        match self {
            Self::Gelu => simd_gelu(data),
            Self::GeluTanh => simd_gelu_tanh(data),
            Self::Relu => simd_relu(data),
        }
    }

    /// Name as accepted by [`FromStr`]
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Gelu => "gelu",
            Self::GeluTanh => "gelu_tanh",
            Self::Relu => "relu",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = ComprobarError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gelu" => Ok(Self::Gelu),
            "gelu_tanh" => Ok(Self::GeluTanh),
            "relu" => Ok(Self::Relu),
            other => Err(ComprobarError::invalid_config(format!(
                "unknown activation '{other}', expected gelu, gelu_tanh or relu"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_layer_norm_new() {
        let layer_norm = LayerNorm::new(512, 1e-5).unwrap();
        assert_eq!(layer_norm.normalized_shape(), 512);
        assert!((layer_norm.eps() - 1e-5).abs() < 1e-10);
        assert!(LayerNorm::new(0, 1e-5).is_err());
    }

    #[test]
    fn test_layer_norm_forward_mean_zero() {
        let layer_norm = LayerNorm::new(4, 1e-5).unwrap();
        let input = Tensor::from_vec(vec![2, 4], vec![1.0, 2.0, 3.0, 4.0, -1.0, 0.0, 5.0, 8.0])
            .unwrap();
        let output = layer_norm.forward(&input).unwrap();
        for row in output.data().chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
        }
    }

    #[test]
    fn test_layer_norm_applies_gamma_and_beta() {
        let x = Tensor::from_vec(vec![1, 3], vec![0.2, -4.0, 1.5]).unwrap();
        let unit = LayerNorm::new(3, 1e-5).unwrap().forward(&x).unwrap();
        let affine = LayerNorm::with_params(vec![2.0; 3], vec![1.0; 3], 1e-5)
            .unwrap()
            .forward(&x)
            .unwrap();
        for (u, a) in unit.data().iter().zip(affine.data()) {
            assert!((a - (2.0 * u + 1.0)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_layer_norm_shape_mismatch() {
        let layer_norm = LayerNorm::new(3, 1e-5).unwrap();
        let input = Tensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap();
        assert!(layer_norm.forward(&input).is_err());
        assert!(LayerNorm::with_params(vec![1.0; 3], vec![0.0; 2], 1e-5).is_err());
    }

    #[test]
    fn test_dropout_zero_is_identity() {
        let d = Dropout::new(0.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut data = vec![1.0, 2.0, 3.0];
        d.apply(&mut data, true, &mut rng);
        assert_eq!(data, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_dropout_upscale_in_train() {
        let d = Dropout::new(0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut data = vec![1.0f32; 1000];
        d.apply(&mut data, true, &mut rng);
        assert!(data.iter().all(|&x| x == 0.0 || x == 2.0));
        let kept = data.iter().filter(|&&x| x > 0.0).count();
        assert!((400..600).contains(&kept), "kept {kept}");

        // eval mode is the identity
        let mut eval = vec![1.0f32; 8];
        d.apply(&mut eval, false, &mut rng);
        assert_eq!(eval, vec![1.0; 8]);
    }

    #[test]
    fn test_dropout_is_seeded() {
        let d = Dropout::new(0.3).unwrap();
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut data = vec![1.0f32; 64];
            d.apply(&mut data, true, &mut rng);
            data
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn test_dropout_rejects_bad_probability() {
        assert!(Dropout::new(-0.1).is_err());
        assert!(Dropout::new(1.5).is_err());
    }

    #[test]
    fn test_activation_parse_and_apply() {
        assert_eq!("gelu".parse::<Activation>().unwrap(), Activation::Gelu);
        assert_eq!("relu".parse::<Activation>().unwrap(), Activation::Relu);
        assert!("swish".parse::<Activation>().is_err());

        let mut data = vec![-1.0, 2.0];
        Activation::Relu.apply(&mut data);
        assert_eq!(data, vec![0.0, 2.0]);
        assert_eq!(Activation::GeluTanh.to_string(), "gelu_tanh");
    }
}
