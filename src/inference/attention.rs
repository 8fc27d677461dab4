//! Scaled dot-product attention
//!
//! ```text
//! softmax((Q · Kᵀ) * head_dim^-0.5 + mask) · V
//! ```
//!
//! The row-level functions [`attention_weights`] and [`weighted_values`] are
//! the single source of attention arithmetic: the tensor-level
//! [`scaled_dot_product_attention`] used by the reference simulator and the
//! row-streaming fused kernel both call them, so the two paths agree bit for
//! bit whenever they see the same keys, values and mask.
//!
//! Each step rounds its result to the storage [`Precision`], mirroring a
//! framework that materializes `qk`, the scaled scores, the masked scores, the
//! softmax and the context as separate tensors.

use rand::rngs::StdRng;

use crate::dtype::Precision;
use crate::error::{ComprobarError, Result};
use crate::inference::simd::{simd_dot, simd_softmax};
use crate::layers::Dropout;
use crate::tensor::Tensor;

/// Score multiplier `head_dim^-0.5`
#[must_use]
pub fn attention_scale(head_dim: usize) -> f32 {
    #[allow(clippy::cast_precision_loss)]
    (head_dim as f32).powf(-0.5)
}

/// Attention weights of one query row over `keys`
///
/// `mask_row`, when present, must hold one additive bias per key.
#[must_use]
pub fn attention_weights<'k, I>(
    query: &[f32],
    keys: I,
    mask_row: Option<&[f32]>,
    scale: f32,
    precision: Precision,
) -> Vec<f32>
where
    I: IntoIterator<Item = &'k [f32]>,
{
    let mut scores: Vec<f32> = keys
        .into_iter()
        .map(|key| precision.round(simd_dot(query, key)))
        .collect();

    for s in &mut scores {
        *s = precision.round(*s * scale);
    }

    if let Some(mask) = mask_row {
        for (s, m) in scores.iter_mut().zip(mask) {
            *s = precision.round(*s + precision.round(*m));
        }
    }

    simd_softmax(&mut scores);
    precision.round_slice(&mut scores);
    scores
}

/// Weighted sum of value rows: `Σ_j weights[j] * values[j]`
#[must_use]
pub fn weighted_values<'v, I>(
    weights: &[f32],
    values: I,
    head_dim: usize,
    precision: Precision,
) -> Vec<f32>
where
    I: IntoIterator<Item = &'v [f32]>,
{
    let mut out = vec![0.0f32; head_dim];
    for (&w, value) in weights.iter().zip(values) {
        for (o, &v) in out.iter_mut().zip(value) {
            *o += w * v;
        }
    }
    precision.round_slice(&mut out);
    out
}

/// Optional dropout applied to attention weights
pub struct AttentionDropout<'a> {
    /// Dropout layer
    pub dropout: &'a Dropout,
    /// Whether training mode is active
    pub training: bool,
    /// Generator drawing the keep mask
    pub rng: &'a mut StdRng,
}

/// Tensor-level attention
///
/// * `q` - `[batch, heads, q_len, head_dim]`
/// * `k`, `v` - `[batch, heads, kv_len, head_dim]`
/// * `mask` - additive, `[batch, 1, q_len, kv_len]`, broadcast over heads
///
/// Returns the context `[batch, heads, q_len, head_dim]`.
///
/// # Errors
///
/// Returns a shape error if the operands disagree.
pub fn scaled_dot_product_attention(
    q: &Tensor<f32>,
    k: &Tensor<f32>,
    v: &Tensor<f32>,
    mask: Option<&Tensor<f32>>,
    precision: Precision,
    mut dropout: Option<AttentionDropout<'_>>,
) -> Result<Tensor<f32>> {
    let (batch, heads, q_len, head_dim) = match q.shape() {
        &[b, h, s, d] => (b, h, s, d),
        other => {
            return Err(ComprobarError::invalid_shape(format!(
                "attention query must be 4-D, got {other:?}"
            )))
        },
    };
    let kv_len = match k.shape() {
        &[b, h, s, d] if b == batch && h == heads && d == head_dim => s,
        other => {
            return Err(ComprobarError::ShapeMismatch {
                op: "matmul(q, k^T)",
                left: q.shape().to_vec(),
                right: other.to_vec(),
            })
        },
    };
    if v.shape() != k.shape() {
        return Err(ComprobarError::ShapeMismatch {
            op: "matmul(weights, v)",
            left: k.shape().to_vec(),
            right: v.shape().to_vec(),
        });
    }
    if let Some(m) = mask {
        if m.shape() != [batch, 1, q_len, kv_len] {
            return Err(ComprobarError::ShapeMismatch {
                op: "attention mask",
                left: vec![batch, 1, q_len, kv_len],
                right: m.shape().to_vec(),
            });
        }
    }

    let scale = attention_scale(head_dim);
    let (qd, kd, vd) = (q.data(), k.data(), v.data());
    let mut out = Vec::with_capacity(q.size());

    for b in 0..batch {
        for h in 0..heads {
            let kv_base = (b * heads + h) * kv_len * head_dim;
            for i in 0..q_len {
                let q_start = ((b * heads + h) * q_len + i) * head_dim;
                let query = &qd[q_start..q_start + head_dim];
                let keys = (0..kv_len).map(|j| {
                    let s = kv_base + j * head_dim;
                    &kd[s..s + head_dim]
                });
                let mask_row = mask.map(|m| {
                    let s = (b * q_len + i) * kv_len;
                    &m.data()[s..s + kv_len]
                });

                let mut weights = attention_weights(query, keys, mask_row, scale, precision);
                if let Some(d) = dropout.as_mut() {
                    d.dropout.apply(&mut weights, d.training, d.rng);
                    precision.round_slice(&mut weights);
                }

                let values = (0..kv_len).map(|j| {
                    let s = kv_base + j * head_dim;
                    &vd[s..s + head_dim]
                });
                out.extend(weighted_values(&weights, values, head_dim, precision));
            }
        }
    }

    Tensor::from_vec(vec![batch, heads, q_len, head_dim], out)
}
