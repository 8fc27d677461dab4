//! Transformer configuration, parameters and seeded inputs
//!
//! A [`TransformerConfig`] fully determines the inputs of a parity run: with
//! the same config and seed, [`TransformerInputs::generate`] produces the same
//! query, weights, cache and mask on every call.
//!
//! Weights are integer valued in `[-64, 64)` and stored `[in_dim, out_dim]`;
//! biases and activations are drawn uniformly from `[0, 1)` and rounded to the
//! activation precision. Every layer shares one parameter set.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::dtype::{DType, Precision};
use crate::error::{ComprobarError, Result};
use crate::inference::{max_seq_len_for, CacheMode};
use crate::layers::Activation;
use crate::mask::AttentionMask;
use crate::quantize::ScalePair;
use crate::tensor::Tensor;

/// Lower bound (inclusive) of generated integer weights
pub const WEIGHT_LOW: i32 = -64;
/// Upper bound (exclusive) of generated integer weights
pub const WEIGHT_HIGH: i32 = 64;

/// Shape and behavior of a transformer stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    /// Batch size
    pub batch_size: usize,
    /// Tokens processed per call
    pub query_length: usize,
    /// Cached positions (decode) or positions to record (generation)
    pub cache_length: usize,
    /// Attention heads
    pub num_heads: usize,
    /// Per-head dimension
    pub head_dim: usize,
    /// Number of stacked layers
    pub layers: usize,
    /// Normalize before (true) or after (false) each residual block
    pub pre_layer_norm: bool,
    /// Layer norm epsilon
    pub epsilon: f32,
    /// Dropout probability
    pub dropout_prob: f32,
    /// Training mode (enables dropout)
    pub training: bool,
    /// FFN activation
    pub act_method: Activation,
    /// Activation storage precision
    pub precision: Precision,
    /// Cache stage
    pub cache_mode: CacheMode,
    /// Whether an attention mask is supplied
    pub has_attn_mask: bool,
    /// Storage dtype of the attention mask
    pub attn_mask_type: DType,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            query_length: 1,
            cache_length: 1,
            num_heads: 16,
            head_dim: 64,
            layers: 3,
            pre_layer_norm: true,
            epsilon: 1e-5,
            dropout_prob: 0.0,
            training: false,
            act_method: Activation::Gelu,
            precision: Precision::Fp32,
            cache_mode: CacheMode::None,
            has_attn_mask: true,
            attn_mask_type: DType::F64,
        }
    }
}

impl TransformerConfig {
    /// Embedding width: `num_heads * head_dim`
    #[must_use]
    pub fn embed_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// FFN hidden width: `4 * embed_dim`
    #[must_use]
    pub fn dim_ffn(&self) -> usize {
        4 * self.embed_dim()
    }

    /// Positions attended to by each query
    #[must_use]
    pub fn key_length(&self) -> usize {
        match self.cache_mode {
            CacheMode::Decode => self.cache_length + self.query_length,
            CacheMode::None | CacheMode::Generate => self.query_length,
        }
    }

    /// Reject inconsistent configurations
    ///
    /// # Errors
    ///
    /// Returns [`ComprobarError::InvalidConfig`] when a dimension is zero, the
    /// dropout probability is out of range, a generation stage does not encode
    /// exactly `cache_length` tokens, a decode stage does not fit in the
    /// allocated cache slots, or `head_dim` does not fit the packed cache
    /// layout.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.query_length == 0 {
            return Err(ComprobarError::invalid_config(
                "batch_size and query_length must be > 0",
            ));
        }
        if self.num_heads == 0 || self.head_dim == 0 {
            return Err(ComprobarError::invalid_config(
                "num_heads and head_dim must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.dropout_prob) {
            return Err(ComprobarError::invalid_config(format!(
                "dropout_prob must be in [0, 1], got {}",
                self.dropout_prob
            )));
        }
        match self.cache_mode {
            CacheMode::Generate if self.query_length != self.cache_length => {
                return Err(ComprobarError::invalid_config(format!(
                    "generation stage encodes cache_length tokens: query_length {} != cache_length {}",
                    self.query_length, self.cache_length
                )));
            },
            CacheMode::Decode if self.cache_length == 0 => {
                return Err(ComprobarError::invalid_config(
                    "decode stage needs cache_length > 0",
                ));
            },
            CacheMode::Decode
                if self.cache_length + self.query_length > max_seq_len_for(self.cache_length) =>
            {
                return Err(ComprobarError::invalid_config(format!(
                    "decode stage overflows the cache: {} cached + {} new > {} slots",
                    self.cache_length,
                    self.query_length,
                    max_seq_len_for(self.cache_length)
                )));
            },
            _ => {},
        }
        let elems = self.precision.cache_pack_elems();
        if self.cache_mode.uses_cache() && self.head_dim % elems != 0 {
            return Err(ComprobarError::invalid_config(format!(
                "head_dim {} must be a multiple of {elems} for a {} cache",
                self.head_dim, self.precision
            )));
        }
        Ok(())
    }
}

/// Parameters of one transformer layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerParams {
    /// Attention layer norm gamma
    pub ln_scale: Vec<f32>,
    /// Attention layer norm beta
    pub ln_bias: Vec<f32>,
    /// Query projection `[embed, embed]`
    pub q_weight: Tensor<f32>,
    /// Key projection `[embed, embed]`
    pub k_weight: Tensor<f32>,
    /// Value projection `[embed, embed]`
    pub v_weight: Tensor<f32>,
    /// Query bias
    pub q_bias: Vec<f32>,
    /// Key bias
    pub k_bias: Vec<f32>,
    /// Value bias
    pub v_bias: Vec<f32>,
    /// Attention output projection `[embed, embed]`
    pub out_linear_weight: Tensor<f32>,
    /// Attention output bias
    pub out_linear_bias: Vec<f32>,
    /// FFN layer norm gamma
    pub ffn_ln_scale: Vec<f32>,
    /// FFN layer norm beta
    pub ffn_ln_bias: Vec<f32>,
    /// First FFN projection `[embed, dim_ffn]`
    pub ffn1_weight: Tensor<f32>,
    /// First FFN bias
    pub ffn1_bias: Vec<f32>,
    /// Second FFN projection `[dim_ffn, embed]`
    pub ffn2_weight: Tensor<f32>,
    /// Second FFN bias
    pub ffn2_bias: Vec<f32>,
}

fn int_weight(rng: &mut StdRng, in_dim: usize, out_dim: usize) -> Result<Tensor<f32>> {
    #[allow(clippy::cast_precision_loss)]
    let data = (0..in_dim * out_dim)
        .map(|_| rng.gen_range(WEIGHT_LOW..WEIGHT_HIGH) as f32)
        .collect();
    Tensor::from_vec(vec![in_dim, out_dim], data)
}

fn uniform(rng: &mut StdRng, n: usize, precision: Precision) -> Vec<f32> {
    (0..n).map(|_| precision.round(rng.gen::<f32>())).collect()
}

impl LayerParams {
    /// Draw a parameter set
    ///
    /// Weights are drawn first (q, k, v, out, ffn1, ffn2), then biases in the
    /// same order. Layer norms start at gamma = 1, beta = 0.
    ///
    /// # Errors
    ///
    /// Returns an error if a dimension of `config` is zero.
    pub fn random(config: &TransformerConfig, rng: &mut StdRng) -> Result<Self> {
        let (e, f, p) = (config.embed_dim(), config.dim_ffn(), config.precision);

        let q_weight = int_weight(rng, e, e)?;
        let k_weight = int_weight(rng, e, e)?;
        let v_weight = int_weight(rng, e, e)?;
        let out_linear_weight = int_weight(rng, e, e)?;
        let ffn1_weight = int_weight(rng, e, f)?;
        let ffn2_weight = int_weight(rng, f, e)?;

        Ok(Self {
            ln_scale: vec![1.0; e],
            ln_bias: vec![0.0; e],
            q_weight,
            k_weight,
            v_weight,
            q_bias: uniform(rng, e, p),
            k_bias: uniform(rng, e, p),
            v_bias: uniform(rng, e, p),
            out_linear_weight,
            out_linear_bias: uniform(rng, e, p),
            ffn_ln_scale: vec![1.0; e],
            ffn_ln_bias: vec![0.0; e],
            ffn1_weight,
            ffn1_bias: uniform(rng, f, p),
            ffn2_weight,
            ffn2_bias: uniform(rng, e, p),
        })
    }

    /// All weights and biases zero, layer norms at identity
    ///
    /// # Errors
    ///
    /// Returns an error if a dimension of `config` is zero.
    pub fn zeros(config: &TransformerConfig) -> Result<Self> {
        let (e, f) = (config.embed_dim(), config.dim_ffn());
        Ok(Self {
            ln_scale: vec![1.0; e],
            ln_bias: vec![0.0; e],
            q_weight: Tensor::zeros(vec![e, e])?,
            k_weight: Tensor::zeros(vec![e, e])?,
            v_weight: Tensor::zeros(vec![e, e])?,
            q_bias: vec![0.0; e],
            k_bias: vec![0.0; e],
            v_bias: vec![0.0; e],
            out_linear_weight: Tensor::zeros(vec![e, e])?,
            out_linear_bias: vec![0.0; e],
            ffn_ln_scale: vec![1.0; e],
            ffn_ln_bias: vec![0.0; e],
            ffn1_weight: Tensor::zeros(vec![e, f])?,
            ffn1_bias: vec![0.0; f],
            ffn2_weight: Tensor::zeros(vec![f, e])?,
            ffn2_bias: vec![0.0; e],
        })
    }
}

/// Parameters of the whole stack
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerWeights {
    /// One entry per layer
    pub layers: Vec<Arc<LayerParams>>,
}

impl TransformerWeights {
    /// Share one parameter set across `layers` layers
    #[must_use]
    pub fn replicated(params: LayerParams, layers: usize) -> Self {
        let shared = Arc::new(params);
        Self {
            layers: (0..layers).map(|_| Arc::clone(&shared)).collect(),
        }
    }
}

/// Quantization scales calibrated for one layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerScales {
    /// QKV projection
    pub qkv: ScalePair,
    /// Attention output projection
    pub out_linear: ScalePair,
    /// First FFN projection
    pub ffn1: ScalePair,
    /// Second FFN projection
    pub ffn2: ScalePair,
}

/// Everything a forward pass consumes
#[derive(Debug, Clone)]
pub struct TransformerInputs {
    /// Activations `[batch, query_length, embed]`
    pub query: Tensor<f32>,
    /// Stack parameters
    pub weights: TransformerWeights,
    /// Dense cache `[2, batch, heads, cache_length, head_dim]` for cache
    /// stages; zeros for generation
    pub cache_kv: Option<Tensor<f32>>,
    /// Attention mask, when the config asks for one
    pub attn_mask: Option<AttentionMask>,
}

impl TransformerInputs {
    /// Draw all inputs from a generator seeded with `seed`
    ///
    /// Order: query, layer parameters, cache, mask.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the mask dtype is
    /// unsupported.
    pub fn generate(config: &TransformerConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let p = config.precision;

        let query = Tensor::from_vec(
            vec![config.batch_size, config.query_length, config.embed_dim()],
            uniform(
                &mut rng,
                config.batch_size * config.query_length * config.embed_dim(),
                p,
            ),
        )?;
        let weights =
            TransformerWeights::replicated(LayerParams::random(config, &mut rng)?, config.layers);

        let cache_shape = vec![
            2,
            config.batch_size,
            config.num_heads,
            config.cache_length,
            config.head_dim,
        ];
        let cache_kv = match config.cache_mode {
            CacheMode::None => None,
            CacheMode::Generate => Some(Tensor::zeros(cache_shape)?),
            CacheMode::Decode => {
                let n = cache_shape.iter().product();
                Some(Tensor::from_vec(cache_shape, uniform(&mut rng, n, p))?)
            },
        };

        let attn_mask = if config.has_attn_mask {
            Some(AttentionMask::build(
                config.attn_mask_type,
                config.batch_size,
                config.query_length,
                config.key_length(),
                config.cache_mode,
            )?)
        } else {
            None
        };

        Ok(Self {
            query,
            weights,
            cache_kv,
            attn_mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> TransformerConfig {
        TransformerConfig {
            num_heads: 2,
            head_dim: 8,
            layers: 2,
            ..TransformerConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let c = TransformerConfig::default();
        assert_eq!(c.embed_dim(), 1024);
        assert_eq!(c.dim_ffn(), 4096);
        assert_eq!(c.layers, 3);
        assert!(c.pre_layer_norm);
        assert_eq!(c.attn_mask_type, DType::F64);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_key_length_by_stage() {
        let mut c = small();
        c.cache_length = 5;
        assert_eq!(c.key_length(), 1);
        c.cache_mode = CacheMode::Decode;
        assert_eq!(c.key_length(), 6);
    }

    #[test]
    fn test_generation_requires_matching_lengths() {
        let c = TransformerConfig {
            cache_mode: CacheMode::Generate,
            query_length: 2,
            cache_length: 3,
            ..small()
        };
        assert!(matches!(
            c.validate().unwrap_err(),
            ComprobarError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn test_decode_must_fit_cache_slots() {
        let overflow = TransformerConfig {
            cache_mode: CacheMode::Decode,
            query_length: 2,
            cache_length: 127,
            ..small()
        };
        assert!(matches!(
            overflow.validate().unwrap_err(),
            ComprobarError::InvalidConfig { .. }
        ));

        let last_slot = TransformerConfig {
            query_length: 1,
            ..overflow
        };
        assert!(last_slot.validate().is_ok());
    }

    #[test]
    fn test_fp16_cache_needs_head_dim_multiple_of_eight() {
        let c = TransformerConfig {
            cache_mode: CacheMode::Decode,
            precision: Precision::Fp16,
            head_dim: 12,
            ..small()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_generate_is_deterministic() {
        let c = small();
        let a = TransformerInputs::generate(&c, 11).unwrap();
        let b = TransformerInputs::generate(&c, 11).unwrap();
        assert_eq!(a.query, b.query);
        assert_eq!(a.weights, b.weights);
        let other = TransformerInputs::generate(&c, 12).unwrap();
        assert_ne!(a.query, other.query);
    }

    #[test]
    fn test_generated_ranges() {
        let c = small();
        let inputs = TransformerInputs::generate(&c, 1).unwrap();
        assert_eq!(inputs.query.shape(), &[1, 1, 16]);
        assert!(inputs.query.data().iter().all(|&x| (0.0..1.0).contains(&x)));

        let layer = &inputs.weights.layers[0];
        assert_eq!(layer.ffn1_weight.shape(), &[16, 64]);
        assert!(layer
            .q_weight
            .data()
            .iter()
            .all(|&w| w.fract() == 0.0 && (-64.0..64.0).contains(&w)));
        assert!(inputs.cache_kv.is_none());
        assert_eq!(inputs.attn_mask.unwrap().shape(), &[1, 1, 1, 1]);
        assert!(Arc::ptr_eq(&inputs.weights.layers[0], &inputs.weights.layers[1]));
    }

    #[test]
    fn test_generation_cache_is_zeroed() {
        let c = TransformerConfig {
            cache_mode: CacheMode::Generate,
            query_length: 2,
            cache_length: 2,
            ..small()
        };
        let inputs = TransformerInputs::generate(&c, 5).unwrap();
        let cache = inputs.cache_kv.unwrap();
        assert_eq!(cache.shape(), &[2, 1, 2, 2, 8]);
        assert!(cache.data().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_unsupported_mask_dtype_surfaces() {
        let c = TransformerConfig {
            attn_mask_type: DType::F32,
            ..small()
        };
        assert!(matches!(
            TransformerInputs::generate(&c, 0).unwrap_err(),
            ComprobarError::UnsupportedMaskDtype(DType::F32)
        ));
    }

    #[test]
    fn test_config_json_defaults() {
        let c: TransformerConfig =
            serde_json::from_str(r#"{"precision": "fp16", "cache_mode": "decode"}"#).unwrap();
        assert_eq!(c.precision, Precision::Fp16);
        assert_eq!(c.cache_mode, CacheMode::Decode);
        assert_eq!(c.num_heads, 16);
    }
}
