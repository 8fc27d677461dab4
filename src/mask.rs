//! Attention mask construction
//!
//! Masks are built with shape `[batch, 1, query_len, key_len]` and broadcast
//! over heads. Three storage dtypes are supported:
//!
//! | dtype    | no cache / generation        | decode                          |
//! |----------|------------------------------|---------------------------------|
//! | float64  | `(tril(1) - 1) * 1e4`        | ones, column `-2` zeroed, then `(m - 1) * 1e4` |
//! | int64    | `tril(1)`                    | `tril(1)`                       |
//! | bool     | `tril(true)`                 | all true, column `-2` false     |
//!
//! `tril` keeps `j <= i` over the last two dimensions. Integer and bool masks
//! become additive through `(m - 1) * 1e9`; float masks are used as given.

use crate::dtype::{DType, Precision};
use crate::error::{ComprobarError, Result};
use crate::inference::CacheMode;
use crate::tensor::Tensor;

/// Additive magnitude of a masked float mask entry
pub const FLOAT_MASK_NEG: f64 = 1e4;

/// Additive magnitude of a masked integer/bool mask entry
pub const INT_MASK_NEG: f32 = 1e9;

/// An attention mask in its storage dtype
#[derive(Debug, Clone, PartialEq)]
pub enum AttentionMask {
    /// Additive float mask
    Float64(Tensor<f64>),
    /// 1 = attend, 0 = masked
    Int64(Tensor<i64>),
    /// 1 (true) = attend, 0 (false) = masked
    Bool(Tensor<u8>),
}

fn tril<T: num_traits::Num + Clone>(shape: &[usize], one: T, zero: T) -> Result<Tensor<T>> {
    let (q_len, k_len) = (shape[shape.len() - 2], shape[shape.len() - 1]);
    let outer: usize = shape[..shape.len() - 2].iter().product();
    let mut data = Vec::with_capacity(outer * q_len * k_len);
    for _ in 0..outer {
        for i in 0..q_len {
            for j in 0..k_len {
                data.push(if j <= i { one.clone() } else { zero.clone() });
            }
        }
    }
    Tensor::from_vec(shape.to_vec(), data)
}

fn zero_second_to_last_column<T: num_traits::Num + Clone>(t: &mut Tensor<T>) {
    let k_len = t.shape()[t.ndim() - 1];
    if k_len < 2 {
        return;
    }
    for row in t.data_mut().chunks_mut(k_len) {
        row[k_len - 2] = T::zero();
    }
}

impl AttentionMask {
    /// Build the mask for a stage
    ///
    /// # Arguments
    ///
    /// * `dtype` - storage dtype: float64, int64 or bool
    /// * `batch`, `query_len`, `key_len` - mask extent; `key_len` includes
    ///   cached positions when decoding
    /// * `mode` - cache stage
    ///
    /// # Errors
    ///
    /// Returns [`ComprobarError::UnsupportedMaskDtype`] for any other dtype.
    pub fn build(
        dtype: DType,
        batch: usize,
        query_len: usize,
        key_len: usize,
        mode: CacheMode,
    ) -> Result<Self> {
        let shape = [batch, 1, query_len, key_len];
        match dtype {
            DType::I64 => Ok(Self::Int64(tril(&shape, 1i64, 0)?)),
            DType::F64 => {
                let mut m = if mode == CacheMode::Decode {
                    Tensor::ones(shape.to_vec())?
                } else {
                    tril(&shape, 1.0f64, 0.0)?
                };
                if mode == CacheMode::Decode {
                    zero_second_to_last_column(&mut m);
                }
                Ok(Self::Float64(m.map(|&v| (v - 1.0) * FLOAT_MASK_NEG)))
            },
            DType::Bool => {
                let m = if mode == CacheMode::Decode {
                    let mut m = Tensor::ones(shape.to_vec())?;
                    zero_second_to_last_column(&mut m);
                    m
                } else {
                    tril(&shape, 1u8, 0)?
                };
                Ok(Self::Bool(m))
            },
            other => Err(ComprobarError::UnsupportedMaskDtype(other)),
        }
    }

    /// Storage dtype
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Float64(_) => DType::F64,
            Self::Int64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
        }
    }

    /// Mask shape
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float64(t) => t.shape(),
            Self::Int64(t) => t.shape(),
            Self::Bool(t) => t.shape(),
        }
    }

    /// Additive form in the activation precision
    ///
    /// Float masks are cast; integer and bool masks map to `(m - 1) * 1e9`.
    /// Every entry is rounded to `precision`, so a masked fp16 entry becomes
    /// `-inf`.
    #[must_use]
    pub fn to_additive(&self, precision: Precision) -> Tensor<f32> {
        match self {
            #[allow(clippy::cast_possible_truncation)]
            Self::Float64(t) => t.map(|&v| precision.round(v as f32)),
            #[allow(clippy::cast_precision_loss)]
            Self::Int64(t) => t.map(|&v| precision.round((v as f32 - 1.0) * INT_MASK_NEG)),
            Self::Bool(t) => t.map(|&v| precision.round((f32::from(v) - 1.0) * INT_MASK_NEG)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_mask_causal() {
        let m = AttentionMask::build(DType::F64, 1, 3, 3, CacheMode::None).unwrap();
        assert_eq!(m.shape(), &[1, 1, 3, 3]);
        let AttentionMask::Float64(t) = &m else {
            panic!("expected float mask")
        };
        assert_eq!(
            t.data(),
            &[0.0, -1e4, -1e4, 0.0, 0.0, -1e4, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_float_mask_decode_blocks_second_to_last() {
        // cache_len = 1, one new token: key_len = 2
        let m = AttentionMask::build(DType::F64, 2, 1, 2, CacheMode::Decode).unwrap();
        let AttentionMask::Float64(t) = &m else {
            panic!("expected float mask")
        };
        assert_eq!(t.data(), &[-1e4, 0.0, -1e4, 0.0]);
    }

    #[test]
    fn test_int_mask_is_tril_in_every_stage() {
        let m = AttentionMask::build(DType::I64, 1, 1, 2, CacheMode::Decode).unwrap();
        let AttentionMask::Int64(t) = &m else {
            panic!("expected int mask")
        };
        assert_eq!(t.data(), &[1, 0]);
        let add = m.to_additive(Precision::Fp32);
        assert_eq!(add.data(), &[0.0, -1e9]);
    }

    #[test]
    fn test_bool_mask() {
        let m = AttentionMask::build(DType::Bool, 1, 2, 2, CacheMode::Generate).unwrap();
        let AttentionMask::Bool(t) = &m else {
            panic!("expected bool mask")
        };
        assert_eq!(t.data(), &[1, 0, 1, 1]);

        let d = AttentionMask::build(DType::Bool, 1, 1, 3, CacheMode::Decode).unwrap();
        assert_eq!(d.to_additive(Precision::Fp32).data(), &[0.0, -1e9, 0.0]);
    }

    #[test]
    fn test_single_position_mask_is_open() {
        let m = AttentionMask::build(DType::F64, 1, 1, 1, CacheMode::None).unwrap();
        assert_eq!(m.to_additive(Precision::Fp16).data(), &[0.0]);
    }

    #[test]
    fn test_fp16_int_mask_saturates() {
        let m = AttentionMask::build(DType::I64, 1, 2, 2, CacheMode::None).unwrap();
        let add = m.to_additive(Precision::Fp16);
        assert_eq!(add.data()[1], f32::NEG_INFINITY);
    }

    #[test]
    fn test_unsupported_dtype() {
        for dtype in [DType::F32, DType::F16, DType::I8] {
            let err = AttentionMask::build(dtype, 1, 1, 1, CacheMode::None).unwrap_err();
            assert!(matches!(err, ComprobarError::UnsupportedMaskDtype(d) if d == dtype));
        }
    }
}
