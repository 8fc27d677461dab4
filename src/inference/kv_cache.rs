//! Packed key/value cache of the fused kernel
//!
//! The fused kernel keeps one cache per layer. Values are stored plainly as
//! `[batch, heads, max_seq_len, head_dim]`; keys are stored in the packed
//! layout
//!
//! ```text
//! [batch, heads, head_dim / elems, max_seq_len, elems]
//! ```
//!
//! where `elems` is the number of values that fit a 16-byte vector (4 for
//! fp32, 8 for fp16). [`KvCache::unpack`] inverts the packing with plain
//! reshape / slice / transpose so a comparison can be made against a dense
//! `[batch, heads, len, head_dim]` cache.

use serde::{Deserialize, Serialize};

use crate::dtype::Precision;
use crate::error::{ComprobarError, Result};
use crate::tensor::Tensor;

/// Sequence capacity granularity of a cache allocation
pub const CACHE_BLOCK: usize = 128;

/// How a layer interacts with its key/value cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// No cache: attention spans the current tokens only
    #[default]
    None,
    /// Context encoding: attend over the current tokens and record them
    Generate,
    /// Incremental decoding: attend over cached plus current tokens
    Decode,
}

impl CacheMode {
    /// Whether the mode reads or writes a cache
    #[must_use]
    pub fn uses_cache(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Capacity for a cache holding `cache_len` positions:
/// the next multiple of [`CACHE_BLOCK`] strictly above `cache_len`
#[must_use]
pub fn max_seq_len_for(cache_len: usize) -> usize {
    (cache_len + CACHE_BLOCK) / CACHE_BLOCK * CACHE_BLOCK
}

/// Per-layer key/value cache in the fused kernel's layout
#[derive(Debug, Clone, PartialEq)]
pub struct KvCache {
    batch: usize,
    heads: usize,
    head_dim: usize,
    max_seq_len: usize,
    elems: usize,
    key: Vec<f32>,
    value: Vec<f32>,
}

impl KvCache {
    /// Allocate a zeroed cache
    ///
    /// # Errors
    ///
    /// Returns an error if `head_dim` is not a multiple of the packing width
    /// or any dimension is zero.
    pub fn new(
        batch: usize,
        heads: usize,
        head_dim: usize,
        max_seq_len: usize,
        precision: Precision,
    ) -> Result<Self> {
        let elems = precision.cache_pack_elems();
        if batch == 0 || heads == 0 || head_dim == 0 || max_seq_len == 0 {
            return Err(ComprobarError::invalid_shape(format!(
                "cache dimensions must be non-zero: batch={batch} heads={heads} \
                 head_dim={head_dim} max_seq_len={max_seq_len}"
            )));
        }
        if head_dim % elems != 0 {
            return Err(ComprobarError::invalid_shape(format!(
                "head_dim {head_dim} is not a multiple of the {precision} packing width {elems}"
            )));
        }
        let n = batch * heads * max_seq_len * head_dim;
        Ok(Self {
            batch,
            heads,
            head_dim,
            max_seq_len,
            elems,
            key: vec![0.0; n],
            value: vec![0.0; n],
        })
    }

    /// Pack a dense `[2, batch, heads, len, head_dim]` cache into the first
    /// `len` positions of a new cache
    ///
    /// # Errors
    ///
    /// Returns an error if the dense cache is not 5-D with a leading 2, or
    /// `len` exceeds `max_seq_len`.
    pub fn from_dense(dense: &Tensor<f32>, max_seq_len: usize, precision: Precision) -> Result<Self> {
        let (batch, heads, len, head_dim) = match dense.shape() {
            &[2, b, h, l, d] => (b, h, l, d),
            other => {
                return Err(ComprobarError::invalid_shape(format!(
                    "dense cache must be [2, batch, heads, len, head_dim], got {other:?}"
                )))
            },
        };
        if len > max_seq_len {
            return Err(ComprobarError::invalid_shape(format!(
                "cache length {len} exceeds capacity {max_seq_len}"
            )));
        }

        let mut cache = Self::new(batch, heads, head_dim, max_seq_len, precision)?;
        let half = dense.size() / 2;
        let (keys, values) = dense.data().split_at(half);
        for b in 0..batch {
            for h in 0..heads {
                for pos in 0..len {
                    let s = ((b * heads + h) * len + pos) * head_dim;
                    cache.write(
                        b,
                        h,
                        pos,
                        &keys[s..s + head_dim],
                        &values[s..s + head_dim],
                    )?;
                }
            }
        }
        Ok(cache)
    }

    /// Sequence capacity
    #[must_use]
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Values per packed key group
    #[must_use]
    pub fn elems(&self) -> usize {
        self.elems
    }

    fn key_offset(&self, b: usize, h: usize, pos: usize, d: usize) -> usize {
        let groups = self.head_dim / self.elems;
        (((b * self.heads + h) * groups + d / self.elems) * self.max_seq_len + pos) * self.elems
            + d % self.elems
    }

    fn value_offset(&self, b: usize, h: usize, pos: usize) -> usize {
        ((b * self.heads + h) * self.max_seq_len + pos) * self.head_dim
    }

    fn check(&self, b: usize, h: usize, pos: usize) -> Result<()> {
        if b >= self.batch || h >= self.heads || pos >= self.max_seq_len {
            return Err(ComprobarError::invalid_shape(format!(
                "cache slot (batch={b}, head={h}, pos={pos}) out of range for \
                 [{}, {}, {}]",
                self.batch, self.heads, self.max_seq_len
            )));
        }
        Ok(())
    }

    /// Store one key row and one value row at `pos`
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is out of range or a row has the wrong
    /// length.
    pub fn write(&mut self, b: usize, h: usize, pos: usize, key: &[f32], value: &[f32]) -> Result<()> {
        self.check(b, h, pos)?;
        if key.len() != self.head_dim || value.len() != self.head_dim {
            return Err(ComprobarError::ShapeMismatch {
                op: "cache write",
                left: vec![self.head_dim],
                right: vec![key.len(), value.len()],
            });
        }
        for (d, &k) in key.iter().enumerate() {
            let o = self.key_offset(b, h, pos, d);
            self.key[o] = k;
        }
        let o = self.value_offset(b, h, pos);
        self.value[o..o + self.head_dim].copy_from_slice(value);
        Ok(())
    }

    /// Gather the key row at `pos` out of the packed layout
    #[must_use]
    pub fn key(&self, b: usize, h: usize, pos: usize) -> Vec<f32> {
        (0..self.head_dim)
            .map(|d| self.key[self.key_offset(b, h, pos, d)])
            .collect()
    }

    /// Value row at `pos`
    #[must_use]
    pub fn value(&self, b: usize, h: usize, pos: usize) -> &[f32] {
        let o = self.value_offset(b, h, pos);
        &self.value[o..o + self.head_dim]
    }

    /// Raw storage as `[2, batch, heads, max_seq_len, head_dim]`
    ///
    /// Entry 0 holds the keys in packed order; the shape only describes the
    /// allocation.
    ///
    /// # Errors
    ///
    /// Never fails for a cache built through [`KvCache::new`].
    pub fn to_packed_tensor(&self) -> Result<Tensor<f32>> {
        let mut data = Vec::with_capacity(self.key.len() * 2);
        data.extend_from_slice(&self.key);
        data.extend_from_slice(&self.value);
        Tensor::from_vec(
            vec![2, self.batch, self.heads, self.max_seq_len, self.head_dim],
            data,
        )
    }

    /// Recover dense `[batch, heads, len, head_dim]` key and value tensors
    /// from a packed `[2, batch, heads, max_seq_len, head_dim]` allocation
    ///
    /// Keys: reshape to `[batch, heads, head_dim/elems, max_seq_len, elems]`,
    /// keep the first `len` positions, swap the group and position axes, and
    /// merge the groups back into `head_dim`.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocation shape or `len` is invalid.
    pub fn unpack(packed: &Tensor<f32>, len: usize, elems: usize) -> Result<(Tensor<f32>, Tensor<f32>)> {
        let (batch, heads, max_seq_len, head_dim) = match packed.shape() {
            &[2, b, h, s, d] => (b, h, s, d),
            other => {
                return Err(ComprobarError::invalid_shape(format!(
                    "packed cache must be [2, batch, heads, max_seq_len, head_dim], got {other:?}"
                )))
            },
        };
        if elems == 0 || head_dim % elems != 0 {
            return Err(ComprobarError::invalid_shape(format!(
                "head_dim {head_dim} is not a multiple of {elems}"
            )));
        }

        let parts = packed.split(2, 0)?;
        let key = parts[0]
            .reshape(&[batch, heads, head_dim / elems, max_seq_len, elems])?
            .narrow(3, 0, len)?
            .transpose(&[0, 1, 3, 2, 4])?
            .reshape(&[batch, heads, len, head_dim])?;
        let value = parts[1]
            .squeeze(0)?
            .narrow(2, 0, len)?;
        Ok((key, value))
    }

    /// Dense `[2, batch, heads, len, head_dim]` copy of the first `len`
    /// positions
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or exceeds the capacity.
    pub fn to_dense(&self, len: usize) -> Result<Tensor<f32>> {
        let (key, value) = Self::unpack(&self.to_packed_tensor()?, len, self.elems)?;
        let key = key.reshape(&[1, self.batch, self.heads, len, self.head_dim])?;
        let value = value.reshape(&[1, self.batch, self.heads, len, self.head_dim])?;
        Tensor::concat(&[&key, &value], 0)
    }
}
