//! Fused INT8 transformer kernel interface and CPU backend
//!
//! A fused kernel consumes the whole stack in one call: packed `i8` weights,
//! frozen per-channel scales, layer-norm parameters, the optional per-layer
//! caches and a time step. [`FusedTransformerKernel`] is the seam to an
//! external implementation; [`CpuFusedInt8`] is the in-tree backend.
//!
//! ## Layouts
//!
//! | Tensor | Layout |
//! |--------|--------|
//! | qkv weight | `[3, heads, head_dim, embed]` as `i8` rows |
//! | qkv bias | `[3, heads, head_dim]` |
//! | out / ffn weights | `[out, in]` as `i8` rows |
//! | cache | [`KvCache`], K packed |
//!
//! The CPU backend streams one token row at a time: quantize to `i8`,
//! accumulate in `i32`, dequantize with the per-channel out scale.

use rand::rngs::StdRng;
use tracing::debug;

use crate::dtype::Precision;
use crate::error::{ComprobarError, Result};
use crate::inference::{
    attention_scale, attention_weights, max_seq_len_for, simd_layer_norm, weighted_values,
    CacheMode, KvCache,
};
use crate::layers::{Activation, Dropout};
use crate::quantize::{quantize_i8, Int8Weight};
use crate::target::KernelRequirements;
use crate::tensor::Tensor;
use crate::transformer::{LayerParams, LayerScales, TransformerConfig, TransformerInputs};

/// Control flags of a fused call
#[derive(Debug, Clone, PartialEq)]
pub struct FusedAttrs {
    /// Attention heads
    pub num_heads: usize,
    /// Per-head dimension
    pub head_dim: usize,
    /// FFN hidden width
    pub dim_ffn: usize,
    /// Pre- (true) or post- (false) layer norm
    pub pre_layer_norm: bool,
    /// Layer norm epsilon
    pub epsilon: f32,
    /// Dropout probability
    pub dropout_rate: f32,
    /// Training mode
    pub training: bool,
    /// FFN activation
    pub activation: Activation,
    /// Activation storage precision
    pub precision: Precision,
}

impl From<&TransformerConfig> for FusedAttrs {
    fn from(config: &TransformerConfig) -> Self {
        Self {
            num_heads: config.num_heads,
            head_dim: config.head_dim,
            dim_ffn: config.dim_ffn(),
            pre_layer_norm: config.pre_layer_norm,
            epsilon: config.epsilon,
            dropout_rate: config.dropout_prob,
            training: config.training,
            activation: config.act_method,
            precision: config.precision,
        }
    }
}

impl FusedAttrs {
    /// Embedding width
    #[must_use]
    pub fn embed_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }
}

/// Packed parameters of one layer
#[derive(Debug, Clone, PartialEq)]
pub struct FusedLayerWeights {
    /// Attention layer norm gamma
    pub ln_scale: Vec<f32>,
    /// Attention layer norm beta
    pub ln_bias: Vec<f32>,
    /// `[3 * embed, embed]`, rows ordered `(which, head, dim)`
    pub qkv_weight: Int8Weight,
    /// `[3, heads, head_dim]` flattened
    pub qkv_bias: Vec<f32>,
    /// `[embed, embed]`
    pub out_linear_weight: Int8Weight,
    /// Output projection bias
    pub out_linear_bias: Vec<f32>,
    /// FFN layer norm gamma
    pub ffn_ln_scale: Vec<f32>,
    /// FFN layer norm beta
    pub ffn_ln_bias: Vec<f32>,
    /// `[dim_ffn, embed]`
    pub ffn1_weight: Int8Weight,
    /// First FFN bias
    pub ffn1_bias: Vec<f32>,
    /// `[embed, dim_ffn]`
    pub ffn2_weight: Int8Weight,
    /// Second FFN bias
    pub ffn2_bias: Vec<f32>,
}

impl FusedLayerWeights {
    /// Pack reference parameters
    ///
    /// q, k and v weights are concatenated along the output axis and
    /// transposed, which yields rows in `(which, head, dim)` order.
    ///
    /// # Errors
    ///
    /// Returns an error if a weight is not integer valued in `i8` range or
    /// the shapes disagree.
    pub fn pack(params: &LayerParams) -> Result<Self> {
        let qkv = Tensor::concat(
            &[&params.q_weight, &params.k_weight, &params.v_weight],
            1,
        )?;
        let mut qkv_bias = Vec::with_capacity(params.q_bias.len() * 3);
        qkv_bias.extend_from_slice(&params.q_bias);
        qkv_bias.extend_from_slice(&params.k_bias);
        qkv_bias.extend_from_slice(&params.v_bias);

        Ok(Self {
            ln_scale: params.ln_scale.clone(),
            ln_bias: params.ln_bias.clone(),
            qkv_weight: Int8Weight::from_reference(&qkv)?,
            qkv_bias,
            out_linear_weight: Int8Weight::from_reference(&params.out_linear_weight)?,
            out_linear_bias: params.out_linear_bias.clone(),
            ffn_ln_scale: params.ffn_ln_scale.clone(),
            ffn_ln_bias: params.ffn_ln_bias.clone(),
            ffn1_weight: Int8Weight::from_reference(&params.ffn1_weight)?,
            ffn1_bias: params.ffn1_bias.clone(),
            ffn2_weight: Int8Weight::from_reference(&params.ffn2_weight)?,
            ffn2_bias: params.ffn2_bias.clone(),
        })
    }
}

/// Frozen scales of one layer, out scales broadcast per output channel
#[derive(Debug, Clone, PartialEq)]
pub struct FusedScales {
    /// QKV input scale
    pub qkv_in_scale: f32,
    /// QKV out scales, `3 * embed`
    pub qkv_out_scales: Vec<f32>,
    /// Output projection input scale
    pub out_linear_in_scale: f32,
    /// Output projection out scales, `embed`
    pub out_linear_out_scales: Vec<f32>,
    /// FFN1 input scale
    pub ffn1_in_scale: f32,
    /// FFN1 out scales, `dim_ffn`
    pub ffn1_out_scales: Vec<f32>,
    /// FFN2 input scale
    pub ffn2_in_scale: f32,
    /// FFN2 out scales, `embed`
    pub ffn2_out_scales: Vec<f32>,
}

impl FusedScales {
    /// Broadcast calibrated per-tensor scales to per-channel vectors
    #[must_use]
    pub fn broadcast(scales: &LayerScales, embed: usize, dim_ffn: usize) -> Self {
        Self {
            qkv_in_scale: scales.qkv.in_scale,
            qkv_out_scales: vec![scales.qkv.out_scale; 3 * embed],
            out_linear_in_scale: scales.out_linear.in_scale,
            out_linear_out_scales: vec![scales.out_linear.out_scale; embed],
            ffn1_in_scale: scales.ffn1.in_scale,
            ffn1_out_scales: vec![scales.ffn1.out_scale; dim_ffn],
            ffn2_in_scale: scales.ffn2.in_scale,
            ffn2_out_scales: vec![scales.ffn2.out_scale; embed],
        }
    }
}

/// Arguments of one fused call
#[derive(Debug)]
pub struct FusedRequest<'a> {
    /// Activations `[batch, seq, embed]`
    pub x: &'a Tensor<f32>,
    /// Per-layer packed parameters
    pub layers: &'a [FusedLayerWeights],
    /// Per-layer frozen scales
    pub scales: &'a [FusedScales],
    /// Additive mask `[batch, 1, seq, key_len]`
    pub attn_mask: Option<&'a Tensor<f32>>,
    /// One cache per layer, or empty
    pub caches: Vec<KvCache>,
    /// Decode position; `None` with caches means generation
    pub time_step: Option<usize>,
}

impl FusedRequest<'_> {
    /// Cache stage implied by the request
    #[must_use]
    pub fn cache_mode(&self) -> CacheMode {
        match (self.caches.is_empty(), self.time_step) {
            (true, _) => CacheMode::None,
            (false, None) => CacheMode::Generate,
            (false, Some(_)) => CacheMode::Decode,
        }
    }
}

/// Result of a fused call
#[derive(Debug, Clone)]
pub struct FusedOutput {
    /// Final activations `[batch, seq, embed]`
    pub output: Tensor<f32>,
    /// Updated caches, one per layer (empty without caches)
    pub caches: Vec<KvCache>,
}

/// A fused multi-layer INT8 transformer implementation
pub trait FusedTransformerKernel {
    /// Backend name
    fn name(&self) -> &'static str;

    /// Hardware requirements on accelerator targets
    fn requirements(&self) -> KernelRequirements;

    /// Run the stack
    ///
    /// # Errors
    ///
    /// Returns a shape error if the request is inconsistent with `attrs`.
    fn forward(
        &self,
        attrs: &FusedAttrs,
        request: FusedRequest<'_>,
        rng: &mut StdRng,
    ) -> Result<FusedOutput>;
}

/// Everything needed to call a fused kernel for one scenario
#[derive(Debug, Clone)]
pub struct FusedPlan {
    /// Control flags
    pub attrs: FusedAttrs,
    /// Packed parameters
    pub layers: Vec<FusedLayerWeights>,
    /// Frozen scales
    pub scales: Vec<FusedScales>,
    /// Caches in the packed layout
    pub caches: Vec<KvCache>,
    /// Decode position
    pub time_step: Option<usize>,
    /// Additive mask
    pub attn_mask: Option<Tensor<f32>>,
}

impl FusedPlan {
    /// Pack inputs and scales for a fused call
    ///
    /// Every layer gets its own copy of the initial cache, allocated with
    /// capacity [`max_seq_len_for`]`(cache_length)`. Decode starts writing at
    /// `time_step = cache_length`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scales do not cover every layer or packing
    /// fails.
    pub fn build(
        config: &TransformerConfig,
        inputs: &TransformerInputs,
        scales: &[LayerScales],
    ) -> Result<Self> {
        let n_layers = inputs.weights.layers.len();
        if scales.len() != n_layers {
            return Err(ComprobarError::invalid_config(format!(
                "{} scale sets for {n_layers} layers",
                scales.len()
            )));
        }

        let mut layers: Vec<FusedLayerWeights> = Vec::with_capacity(n_layers);
        for (i, params) in inputs.weights.layers.iter().enumerate() {
            // layers sharing one parameter set share one packing
            let shared = i > 0 && std::sync::Arc::ptr_eq(params, &inputs.weights.layers[i - 1]);
            let packed = match (shared, layers.last()) {
                (true, Some(prev)) => prev.clone(),
                _ => FusedLayerWeights::pack(params)?,
            };
            layers.push(packed);
        }

        let (embed, dim_ffn) = (config.embed_dim(), config.dim_ffn());
        let scales = scales
            .iter()
            .map(|s| FusedScales::broadcast(s, embed, dim_ffn))
            .collect();

        let caches = match (&config.cache_mode, &inputs.cache_kv) {
            (CacheMode::None, _) => Vec::new(),
            (_, Some(dense)) => {
                let initial = KvCache::from_dense(
                    dense,
                    max_seq_len_for(config.cache_length),
                    config.precision,
                )?;
                vec![initial; n_layers]
            },
            (_, None) => {
                return Err(ComprobarError::invalid_config(
                    "cache stage requires cache_kv",
                ))
            },
        };
        let time_step = (config.cache_mode == CacheMode::Decode).then_some(config.cache_length);

        Ok(Self {
            attrs: FusedAttrs::from(config),
            layers,
            scales,
            caches,
            time_step,
            attn_mask: inputs
                .attn_mask
                .as_ref()
                .map(|m| m.to_additive(config.precision)),
        })
    }

    /// Invoke `kernel` on `x`
    ///
    /// # Errors
    ///
    /// Propagates kernel errors.
    pub fn run(
        self,
        kernel: &dyn FusedTransformerKernel,
        x: &Tensor<f32>,
        rng: &mut StdRng,
    ) -> Result<FusedOutput> {
        let request = FusedRequest {
            x,
            layers: &self.layers,
            scales: &self.scales,
            attn_mask: self.attn_mask.as_ref(),
            caches: self.caches,
            time_step: self.time_step,
        };
        kernel.forward(&self.attrs, request, rng)
    }
}

/// CPU implementation of the fused INT8 transformer
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuFusedInt8;

impl CpuFusedInt8 {
    /// Create the backend
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// `dequant(quant(x) · W) + bias` over each row of `input`
fn int8_linear(
    input: &[f32],
    weight: &Int8Weight,
    in_scale: f32,
    out_scales: &[f32],
    bias: &[f32],
    precision: Precision,
) -> Result<Vec<f32>> {
    if bias.len() != weight.out_dim || out_scales.len() != weight.out_dim {
        return Err(ComprobarError::ShapeMismatch {
            op: "int8_linear bias/scales",
            left: vec![weight.out_dim],
            right: vec![bias.len(), out_scales.len()],
        });
    }
    let mut out = Vec::with_capacity(input.len() / weight.in_dim * weight.out_dim);
    for row in input.chunks_exact(weight.in_dim) {
        let acc = weight.matvec(&quantize_i8(row, in_scale))?;
        #[allow(clippy::cast_precision_loss)]
        out.extend(acc.iter().zip(out_scales).zip(bias).map(|((&a, &s), &b)| {
            let y = precision.round(a as f32 * s);
            precision.round(y + b)
        }));
    }
    Ok(out)
}

fn norm_rows(
    data: &[f32],
    width: usize,
    scale: &[f32],
    bias: &[f32],
    eps: f32,
    p: Precision,
) -> Vec<f32> {
    let mut out: Vec<f32> = data
        .chunks_exact(width)
        .flat_map(|row| simd_layer_norm(row, Some(scale), Some(bias), eps))
        .collect();
    p.round_slice(&mut out);
    out
}

fn residual_add(a: &[f32], b: &[f32], p: Precision) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| p.round(x + y)).collect()
}

impl FusedTransformerKernel for CpuFusedInt8 {
    fn name(&self) -> &'static str {
        "cpu-int8"
    }

    fn requirements(&self) -> KernelRequirements {
        KernelRequirements::NONE
    }

    #[allow(clippy::too_many_lines)]
    fn forward(
        &self,
        attrs: &FusedAttrs,
        request: FusedRequest<'_>,
        rng: &mut StdRng,
    ) -> Result<FusedOutput> {
        let p = attrs.precision;
        let (heads, head_dim, embed) = (attrs.num_heads, attrs.head_dim, attrs.embed_dim());
        let (batch, seq) = match request.x.shape() {
            &[b, s, e] if e == embed => (b, s),
            other => {
                return Err(ComprobarError::ShapeMismatch {
                    op: "fused input",
                    left: vec![0, 0, embed],
                    right: other.to_vec(),
                })
            },
        };
        if request.scales.len() != request.layers.len() {
            return Err(ComprobarError::invalid_config(format!(
                "{} scale sets for {} layers",
                request.scales.len(),
                request.layers.len()
            )));
        }

        let mode = request.cache_mode();
        if mode.uses_cache() && request.caches.len() != request.layers.len() {
            return Err(ComprobarError::invalid_config(format!(
                "{} caches for {} layers",
                request.caches.len(),
                request.layers.len()
            )));
        }
        let start = request.time_step.unwrap_or(0);
        let key_len = start + seq;
        if let Some(m) = request.attn_mask {
            if m.shape() != [batch, 1, seq, key_len] {
                return Err(ComprobarError::ShapeMismatch {
                    op: "attention mask",
                    left: vec![batch, 1, seq, key_len],
                    right: m.shape().to_vec(),
                });
            }
        }

        let dropout = Dropout::new(attrs.dropout_rate)?;
        let scale = attention_scale(head_dim);
        let mut caches = request.caches;
        let mut x = request.x.data().to_vec();
        let rows = batch * seq;

        for (l, (w, sc)) in request.layers.iter().zip(request.scales).enumerate() {
            let eps = attrs.epsilon;

            // attention block
            let ln_out = if attrs.pre_layer_norm {
                norm_rows(&x, embed, &w.ln_scale, &w.ln_bias, eps, p)
            } else {
                x.clone()
            };
            let qkv = int8_linear(
                &ln_out,
                &w.qkv_weight,
                sc.qkv_in_scale,
                &sc.qkv_out_scales,
                &w.qkv_bias,
                p,
            )?;
            let head_row = |r: usize, which: usize, h: usize| {
                let s = r * 3 * embed + which * embed + h * head_dim;
                &qkv[s..s + head_dim]
            };

            if let Some(cache) = caches.get_mut(l) {
                for b in 0..batch {
                    for h in 0..heads {
                        for s in 0..seq {
                            let r = b * seq + s;
                            cache.write(b, h, start + s, head_row(r, 1, h), head_row(r, 2, h))?;
                        }
                    }
                }
            }

            let mut fmha = vec![0.0f32; rows * embed];
            for b in 0..batch {
                for h in 0..heads {
                    for i in 0..seq {
                        let r = b * seq + i;
                        let mask_row = request.attn_mask.map(|m| {
                            let s = r * key_len;
                            &m.data()[s..s + key_len]
                        });

                        let context = match caches.get(l) {
                            Some(cache) => {
                                let keys: Vec<Vec<f32>> =
                                    (0..key_len).map(|j| cache.key(b, h, j)).collect();
                                let mut weights = attention_weights(
                                    head_row(r, 0, h),
                                    keys.iter().map(Vec::as_slice),
                                    mask_row,
                                    scale,
                                    p,
                                );
                                if attrs.dropout_rate > 0.0 {
                                    dropout.apply(&mut weights, attrs.training, rng);
                                    p.round_slice(&mut weights);
                                }
                                weighted_values(
                                    &weights,
                                    (0..key_len).map(|j| cache.value(b, h, j)),
                                    head_dim,
                                    p,
                                )
                            },
                            None => {
                                let mut weights = attention_weights(
                                    head_row(r, 0, h),
                                    (0..key_len).map(|j| head_row(b * seq + j, 1, h)),
                                    mask_row,
                                    scale,
                                    p,
                                );
                                if attrs.dropout_rate > 0.0 {
                                    dropout.apply(&mut weights, attrs.training, rng);
                                    p.round_slice(&mut weights);
                                }
                                weighted_values(
                                    &weights,
                                    (0..key_len).map(|j| head_row(b * seq + j, 2, h)),
                                    head_dim,
                                    p,
                                )
                            },
                        };
                        let s = r * embed + h * head_dim;
                        fmha[s..s + head_dim].copy_from_slice(&context);
                    }
                }
            }

            let mut out = int8_linear(
                &fmha,
                &w.out_linear_weight,
                sc.out_linear_in_scale,
                &sc.out_linear_out_scales,
                &w.out_linear_bias,
                p,
            )?;
            dropout.apply(&mut out, attrs.training, rng);
            p.round_slice(&mut out);
            let residual_out = residual_add(&x, &out, p);
            let attn_out = if attrs.pre_layer_norm {
                residual_out
            } else {
                norm_rows(&residual_out, embed, &w.ln_scale, &w.ln_bias, eps, p)
            };

            // feed-forward block
            let ffn_ln_out = if attrs.pre_layer_norm {
                norm_rows(&attn_out, embed, &w.ffn_ln_scale, &w.ffn_ln_bias, eps, p)
            } else {
                attn_out.clone()
            };
            let mut ffn1 = int8_linear(
                &ffn_ln_out,
                &w.ffn1_weight,
                sc.ffn1_in_scale,
                &sc.ffn1_out_scales,
                &w.ffn1_bias,
                p,
            )?;
            attrs.activation.apply(&mut ffn1);
            p.round_slice(&mut ffn1);
            dropout.apply(&mut ffn1, attrs.training, rng);
            p.round_slice(&mut ffn1);

            let mut ffn2 = int8_linear(
                &ffn1,
                &w.ffn2_weight,
                sc.ffn2_in_scale,
                &sc.ffn2_out_scales,
                &w.ffn2_bias,
                p,
            )?;
            dropout.apply(&mut ffn2, attrs.training, rng);
            p.round_slice(&mut ffn2);
            let residual_out = residual_add(&attn_out, &ffn2, p);

            x = if attrs.pre_layer_norm {
                residual_out
            } else {
                norm_rows(&residual_out, embed, &w.ffn_ln_scale, &w.ffn_ln_bias, eps, p)
            };
            debug!(layer = l, backend = self.name(), "fused layer done");
        }

        Ok(FusedOutput {
            output: Tensor::from_vec(vec![batch, seq, embed], x)?,
            caches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceTransformer;
    use crate::transformer::TransformerWeights;
    use rand::SeedableRng;

    fn small(mode: CacheMode) -> TransformerConfig {
        TransformerConfig {
            num_heads: 2,
            head_dim: 8,
            layers: 2,
            cache_mode: mode,
            ..TransformerConfig::default()
        }
    }

    fn both(config: &TransformerConfig, seed: u64) -> (Tensor<f32>, FusedOutput) {
        let inputs = TransformerInputs::generate(config, seed).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let reference = ReferenceTransformer::new(config)
            .unwrap()
            .forward(&inputs, &mut rng)
            .unwrap();
        let plan = FusedPlan::build(config, &inputs, &reference.scales).unwrap();
        let fused = plan
            .run(&CpuFusedInt8::new(), &inputs.query, &mut rng)
            .unwrap();
        (reference.output, fused)
    }

    #[test]
    fn test_pack_qkv_row_order() {
        let config = small(CacheMode::None);
        let inputs = TransformerInputs::generate(&config, 1).unwrap();
        let params = &inputs.weights.layers[0];
        let packed = FusedLayerWeights::pack(params).unwrap();
        assert_eq!(packed.qkv_weight.out_dim, 48);
        assert_eq!(packed.qkv_weight.in_dim, 16);
        // row 16 + 3 is column 3 of the key weight
        let k_col3: Vec<i8> = (0..16)
            .map(|i| params.k_weight.get(&[i, 3]).unwrap() as i8)
            .collect();
        assert_eq!(packed.qkv_weight.row(19), &k_col3[..]);
        assert_eq!(packed.qkv_bias[16..32], params.k_bias[..]);
    }

    #[test]
    fn test_matches_reference_without_cache() {
        let config = small(CacheMode::None);
        let (expected, fused) = both(&config, 21);
        assert_eq!(fused.output, expected);
        assert!(fused.caches.is_empty());
    }

    #[test]
    fn test_matches_reference_decode_post_norm_fp16() {
        let config = TransformerConfig {
            pre_layer_norm: false,
            precision: Precision::Fp16,
            cache_length: 3,
            ..small(CacheMode::Decode)
        };
        let (expected, fused) = both(&config, 5);
        assert_eq!(fused.output, expected);
        assert_eq!(fused.caches.len(), 2);
        assert_eq!(fused.caches[0].max_seq_len(), 128);
    }

    #[test]
    fn test_request_cache_mode() {
        let x = Tensor::zeros(vec![1, 1, 16]).unwrap();
        let cache = KvCache::new(1, 2, 8, 128, Precision::Fp32).unwrap();
        let mut request = FusedRequest {
            x: &x,
            layers: &[],
            scales: &[],
            attn_mask: None,
            caches: Vec::new(),
            time_step: None,
        };
        assert_eq!(request.cache_mode(), CacheMode::None);
        request.caches.push(cache);
        assert_eq!(request.cache_mode(), CacheMode::Generate);
        request.time_step = Some(1);
        assert_eq!(request.cache_mode(), CacheMode::Decode);
    }

    #[test]
    fn test_rejects_bad_mask_shape() {
        let config = small(CacheMode::None);
        let inputs = TransformerInputs::generate(&config, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let reference = ReferenceTransformer::new(&config)
            .unwrap()
            .forward(&inputs, &mut rng)
            .unwrap();
        let mut plan = FusedPlan::build(&config, &inputs, &reference.scales).unwrap();
        plan.attn_mask = Some(Tensor::zeros(vec![1, 1, 1, 2]).unwrap());
        assert!(plan
            .run(&CpuFusedInt8::new(), &inputs.query, &mut rng)
            .is_err());
    }

    #[test]
    fn test_plan_requires_scales_per_layer() {
        let config = small(CacheMode::None);
        let inputs = TransformerInputs::generate(&config, 2).unwrap();
        assert!(matches!(
            FusedPlan::build(&config, &inputs, &[]).unwrap_err(),
            ComprobarError::InvalidConfig { .. }
        ));
    }

    #[test]
    fn test_short_bias_is_shape_error() {
        let config = small(CacheMode::None);
        let mut inputs = TransformerInputs::generate(&config, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let scales = ReferenceTransformer::new(&config)
            .unwrap()
            .forward(&inputs, &mut rng)
            .unwrap()
            .scales;
        let mut params = LayerParams::clone(&inputs.weights.layers[0]);
        params.out_linear_bias.pop();
        inputs.weights = TransformerWeights::replicated(params, 2);

        let err = FusedPlan::build(&config, &inputs, &scales)
            .unwrap()
            .run(&CpuFusedInt8::new(), &inputs.query, &mut rng)
            .unwrap_err();
        assert!(matches!(
            err,
            ComprobarError::ShapeMismatch {
                op: "int8_linear bias/scales",
                ..
            }
        ));
    }
}
