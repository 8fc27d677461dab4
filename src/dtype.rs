//! Element types and storage precision
//!
//! All arithmetic runs in `f32` (or wider). A [`Precision`] of `Fp16` emulates
//! half-precision storage by rounding every stored activation through
//! [`half::f16`], which keeps accumulation at 32 bits while matching the value
//! grid of a 16-bit tensor.

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

/// Declared element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit float
    #[serde(rename = "float32")]
    F32,
    /// 16-bit IEEE float
    #[serde(rename = "float16")]
    F16,
    /// 64-bit float
    #[serde(rename = "float64")]
    F64,
    /// 8-bit signed integer
    #[serde(rename = "int8")]
    I8,
    /// 64-bit signed integer
    #[serde(rename = "int64")]
    I64,
    /// Boolean
    Bool,
}

impl DType {
    /// Framework-style name (`float32`, `int8`, ...)
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::F64 => "float64",
            Self::I8 => "int8",
            Self::I64 => "int64",
            Self::Bool => "bool",
        }
    }

    /// Size of one element in bytes
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::F64 | Self::I64 => 8,
            Self::I8 | Self::Bool => 1,
        }
    }

    /// Whether the type is a floating-point type
    #[must_use]
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage precision of activations (`x_type`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Activations stored as f32
    #[default]
    Fp32,
    /// Activations stored as f16, computed in f32
    Fp16,
}

impl Precision {
    /// Matching tensor dtype
    #[must_use]
    pub const fn dtype(&self) -> DType {
        match self {
            Self::Fp32 => DType::F32,
            Self::Fp16 => DType::F16,
        }
    }

    /// Round a single value to the storage grid
    #[inline]
    #[must_use]
    pub fn round(&self, x: f32) -> f32 {
        match self {
            Self::Fp32 => x,
            Self::Fp16 => f16::from_f32(x).to_f32(),
        }
    }

    /// Round a slice in place to the storage grid
    pub fn round_slice(&self, data: &mut [f32]) {
        if *self == Self::Fp16 {
            for x in data.iter_mut() {
                *x = f16::from_f32(*x).to_f32();
            }
        }
    }

    /// Number of K elements interleaved per packed cache vector
    ///
    /// 16-byte vector loads: four f32 or eight f16 values.
    #[must_use]
    pub const fn cache_pack_elems(&self) -> usize {
        match self {
            Self::Fp32 => 4,
            Self::Fp16 => 8,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
        })
    }
}
