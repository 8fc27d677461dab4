//! Reference simulator of the INT8 fused transformer
//!
//! Recomputes the stack from unfused tensor operations: layer norm, fake
//! quantization into `f64`, integer-valued linear projections, dequantization,
//! head split via reshape/transpose, attention with optional cache
//! concatenation, and the residual FFN. Scales are calibrated from live
//! activations (`1 / max|x|`) and returned so the fused kernel can be fed the
//! same values.
//!
//! Every tensor op rounds its result to the activation precision, the way a
//! framework storing `x_type` tensors would.

use rand::rngs::StdRng;
use tracing::debug;

use crate::dtype::Precision;
use crate::error::{ComprobarError, Result};
use crate::inference::{scaled_dot_product_attention, AttentionDropout, CacheMode};
use crate::layers::{Dropout, LayerNorm};
use crate::quantize::{fake_quant_tensor, reference_int_linear, ScalePair};
use crate::tensor::Tensor;
use crate::transformer::{LayerScales, TransformerConfig, TransformerInputs};

/// Result of a reference forward pass
#[derive(Debug, Clone)]
pub struct ReferenceOutput {
    /// Final activations `[batch, query_length, embed]`
    pub output: Tensor<f32>,
    /// Generation stage only: per-layer `[2, batch, heads, query_length,
    /// head_dim]` keys and values
    pub cache_kvs: Vec<Tensor<f32>>,
    /// Per-layer calibrated scales
    pub scales: Vec<LayerScales>,
}

/// Unfused reference transformer
#[derive(Debug, Clone)]
pub struct ReferenceTransformer {
    config: TransformerConfig,
    dropout: Dropout,
}

fn round(mut t: Tensor<f32>, precision: Precision) -> Tensor<f32> {
    precision.round_slice(t.data_mut());
    t
}

fn add(a: &Tensor<f32>, b: &Tensor<f32>, precision: Precision) -> Result<Tensor<f32>> {
    a.zip_with(b, |x, y| precision.round(x + y))
}

/// `dequant(fake_quant(x) · W) + bias`
///
/// The integer accumulator is cast to `f32`, scaled by `out_scale`, rounded,
/// then biased and rounded again.
fn quant_linear(
    x: &Tensor<f32>,
    scales: ScalePair,
    weight: &Tensor<f32>,
    bias: &[f32],
    precision: Precision,
) -> Result<Tensor<f32>> {
    let in_dim = x.shape()[x.ndim() - 1];
    let out_dim = weight.shape()[weight.ndim() - 1];
    if bias.len() != out_dim {
        return Err(ComprobarError::ShapeMismatch {
            op: "quant_linear bias",
            left: vec![out_dim],
            right: vec![bias.len()],
        });
    }
    let rows = x.size() / in_dim;
    let xq = fake_quant_tensor(x, scales.in_scale)?;
    let acc = reference_int_linear(xq.data(), rows, weight)?;

    #[allow(clippy::cast_possible_truncation)]
    let data = acc
        .iter()
        .enumerate()
        .map(|(i, &a)| {
            let y = precision.round((a as f32) * scales.out_scale);
            precision.round(y + bias[i % out_dim])
        })
        .collect();

    let mut shape = x.shape().to_vec();
    let last = shape.len() - 1;
    shape[last] = out_dim;
    Tensor::from_vec(shape, data)
}

impl ReferenceTransformer {
    /// Create a simulator for `config`
    ///
    /// # Errors
    ///
    /// Returns [`ComprobarError::InvalidConfig`] for an inconsistent config.
    pub fn new(config: &TransformerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            dropout: Dropout::new(config.dropout_prob)?,
        })
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    fn dropout(&self, mut t: Tensor<f32>, rng: &mut StdRng) -> Tensor<f32> {
        self.dropout
            .apply(t.data_mut(), self.config.training, rng);
        round(t, self.config.precision)
    }

    /// Run the stack
    ///
    /// `rng` drives dropout only; with `dropout_prob == 0` or outside training
    /// it is never advanced.
    ///
    /// # Errors
    ///
    /// Returns a shape error if the inputs disagree with the config, or
    /// [`ComprobarError::InvalidConfig`] if a cache stage has no cache.
    #[allow(clippy::too_many_lines)]
    pub fn forward(&self, inputs: &TransformerInputs, rng: &mut StdRng) -> Result<ReferenceOutput> {
        let cfg = &self.config;
        let p = cfg.precision;
        let (heads, head_dim, embed) = (cfg.num_heads, cfg.head_dim, cfg.embed_dim());

        let expected = [cfg.batch_size, cfg.query_length, embed];
        if inputs.query.shape() != expected {
            return Err(ComprobarError::ShapeMismatch {
                op: "transformer input",
                left: expected.to_vec(),
                right: inputs.query.shape().to_vec(),
            });
        }

        let mask = inputs.attn_mask.as_ref().map(|m| m.to_additive(p));
        let initial_cache = match cfg.cache_mode {
            CacheMode::Decode => {
                let cache = inputs.cache_kv.as_ref().ok_or_else(|| {
                    ComprobarError::invalid_config("decode stage requires cache_kv")
                })?;
                let parts = cache.split(2, 0)?;
                Some((parts[0].squeeze(0)?, parts[1].squeeze(0)?))
            },
            CacheMode::None | CacheMode::Generate => None,
        };

        let mut x = inputs.query.clone();
        let mut cache_kvs = Vec::new();
        let mut scales = Vec::with_capacity(inputs.weights.layers.len());

        for (i, layer) in inputs.weights.layers.iter().enumerate() {
            let norm = LayerNorm::with_params(layer.ln_scale.clone(), layer.ln_bias.clone(), cfg.epsilon)?;
            let ffn_norm = LayerNorm::with_params(
                layer.ffn_ln_scale.clone(),
                layer.ffn_ln_bias.clone(),
                cfg.epsilon,
            )?;

            // attention block
            let residual = x.clone();
            let ln_out = if cfg.pre_layer_norm {
                round(norm.forward(&x)?, p)
            } else {
                x.clone()
            };

            let qkv = ScalePair::from_activations(ln_out.data());
            let q = quant_linear(&ln_out, qkv, &layer.q_weight, &layer.q_bias, p)?;
            let k = quant_linear(&ln_out, qkv, &layer.k_weight, &layer.k_bias, p)?;
            let v = quant_linear(&ln_out, qkv, &layer.v_weight, &layer.v_bias, p)?;

            let split_heads = |t: Tensor<f32>| -> Result<Tensor<f32>> {
                t.reshape(&[0, 0, heads, head_dim])?.transpose(&[0, 2, 1, 3])
            };
            let q = split_heads(q)?;
            let mut k = split_heads(k)?;
            let mut v = split_heads(v)?;

            match (&cfg.cache_mode, &initial_cache) {
                (CacheMode::Generate, _) => {
                    let shape = [1, cfg.batch_size, heads, cfg.query_length, head_dim];
                    cache_kvs.push(Tensor::concat(&[&k.reshape(&shape)?, &v.reshape(&shape)?], 0)?);
                },
                (CacheMode::Decode, Some((cache_k, cache_v))) => {
                    k = Tensor::concat(&[cache_k, &k], 2)?;
                    v = Tensor::concat(&[cache_v, &v], 2)?;
                },
                _ => {},
            }

            let attn_dropout = if cfg.dropout_prob > 0.0 {
                Some(AttentionDropout {
                    dropout: &self.dropout,
                    training: cfg.training,
                    rng: &mut *rng,
                })
            } else {
                None
            };
            let context = scaled_dot_product_attention(&q, &k, &v, mask.as_ref(), p, attn_dropout)?;
            let fmha_out = context.transpose(&[0, 2, 1, 3])?.reshape(&[0, 0, embed])?;

            let out_linear = ScalePair::from_activations(fmha_out.data());
            let out = quant_linear(
                &fmha_out,
                out_linear,
                &layer.out_linear_weight,
                &layer.out_linear_bias,
                p,
            )?;
            let residual_out = add(&residual, &self.dropout(out, rng), p)?;
            let attn_out = if cfg.pre_layer_norm {
                residual_out
            } else {
                round(norm.forward(&residual_out)?, p)
            };

            // feed-forward block
            let ffn_ln_out = if cfg.pre_layer_norm {
                round(ffn_norm.forward(&attn_out)?, p)
            } else {
                attn_out.clone()
            };

            let ffn1 = ScalePair::from_activations(ffn_ln_out.data());
            let mut ffn1_out = quant_linear(&ffn_ln_out, ffn1, &layer.ffn1_weight, &layer.ffn1_bias, p)?;
            cfg.act_method.apply(ffn1_out.data_mut());
            let ffn1_out = self.dropout(round(ffn1_out, p), rng);

            let ffn2 = ScalePair::from_activations(ffn1_out.data());
            let ffn2_out = quant_linear(&ffn1_out, ffn2, &layer.ffn2_weight, &layer.ffn2_bias, p)?;
            let residual_out = add(&attn_out, &self.dropout(ffn2_out, rng), p)?;

            x = if cfg.pre_layer_norm {
                residual_out
            } else {
                round(ffn_norm.forward(&residual_out)?, p)
            };

            debug!(
                layer = i,
                qkv_in_scale = qkv.in_scale,
                out_linear_in_scale = out_linear.in_scale,
                ffn1_in_scale = ffn1.in_scale,
                ffn2_in_scale = ffn2.in_scale,
                "reference layer done"
            );
            scales.push(LayerScales {
                qkv,
                out_linear,
                ffn1,
                ffn2,
            });
        }

        Ok(ReferenceOutput {
            output: x,
            cache_kvs,
            scales,
        })
    }
}
