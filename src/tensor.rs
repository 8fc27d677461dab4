//! Tensor implementation
//!
//! This module provides the core `Tensor` type, an owned N-dimensional array in
//! row-major order, plus the shape operations the oracle needs: reshape,
//! transpose by permutation, concat/split along an axis, squeeze, broadcasting
//! and axis reductions.

use std::fmt;

use num_traits::Num;
use serde::{Deserialize, Serialize};

use crate::error::{ComprobarError, Result};

/// N-dimensional tensor
///
/// # Examples
///
/// ```
/// use comprobar::Tensor;
///
/// // Create a 2x3 tensor
/// let t = Tensor::from_vec(vec![2, 3], vec![
///     1.0, 2.0, 3.0,
///     4.0, 5.0, 6.0,
/// ]).unwrap();
///
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.ndim(), 2);
/// assert_eq!(t.size(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T: Num> {
    /// Flattened data in row-major order
    data: Vec<T>,
    /// Shape of the tensor
    shape: Vec<usize>,
}

/// Row-major strides for `shape`
#[must_use]
pub fn strides_of(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Right-aligned broadcast of two shapes
///
/// # Errors
///
/// Returns `Err` if a dimension pair is neither equal nor contains a 1
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(ComprobarError::ShapeMismatch {
                    op: "broadcast",
                    left: a.to_vec(),
                    right: b.to_vec(),
                })
            },
        };
    }
    Ok(out)
}

/// Source offset in a tensor of `src_shape` for each element of `dst_shape`
/// under right-aligned broadcasting
pub(crate) fn broadcast_offsets(src_shape: &[usize], dst_shape: &[usize]) -> Vec<usize> {
    let rank = dst_shape.len();
    let lead = rank - src_shape.len();
    let src_strides = strides_of(src_shape);
    let total: usize = dst_shape.iter().product();
    let mut offsets = Vec::with_capacity(total);
    let mut index = vec![0usize; rank];
    for _ in 0..total {
        let mut offset = 0;
        for (d, &i) in index.iter().enumerate().skip(lead) {
            let sd = d - lead;
            if src_shape[sd] != 1 {
                offset += i * src_strides[sd];
            }
        }
        offsets.push(offset);
        // advance the multi-index
        for d in (0..rank).rev() {
            index[d] += 1;
            if index[d] < dst_shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    offsets
}

impl<T: Num + Clone> Tensor<T> {
    /// Create a new tensor from a vector and shape
    ///
    /// # Arguments
    ///
    /// * `shape` - Dimensions of the tensor
    /// * `data` - Flattened data in row-major order
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - Shape is empty
    /// - Data size doesn't match shape
    /// - Shape contains zero
    ///
    /// # Examples
    ///
    /// ```
    /// use comprobar::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    /// assert_eq!(t.shape(), &[2, 2]);
    /// ```
    pub fn from_vec(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        if shape.is_empty() {
            return Err(ComprobarError::invalid_shape("Shape cannot be empty"));
        }

        if shape.contains(&0) {
            return Err(ComprobarError::invalid_shape(
                "Shape dimensions cannot be zero",
            ));
        }

        let expected_size = shape.iter().product();
        if data.len() != expected_size {
            return Err(ComprobarError::DataShapeMismatch {
                data_size: data.len(),
                shape: shape.clone(),
                expected: expected_size,
            });
        }

        Ok(Self { data, shape })
    }

    /// Tensor filled with `value`
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero
    pub fn full(shape: Vec<usize>, value: T) -> Result<Self> {
        let n = shape.iter().product();
        Self::from_vec(shape, vec![value; n])
    }

    /// Tensor of zeros
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        Self::full(shape, T::zero())
    }

    /// Tensor of ones
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or contains zero
    pub fn ones(shape: Vec<usize>) -> Result<Self> {
        Self::full(shape, T::one())
    }

    /// Get the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Get a reference to the underlying data
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consume the tensor and return its data
    #[must_use]
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Row-major strides
    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        strides_of(&self.shape)
    }

    /// Element at a multi-dimensional index
    ///
    /// # Errors
    ///
    /// Returns `Err` if the index rank or any coordinate is out of range
    pub fn get(&self, index: &[usize]) -> Result<T> {
        if index.len() != self.shape.len() {
            return Err(ComprobarError::invalid_shape(format!(
                "Index rank {} doesn't match tensor rank {}",
                index.len(),
                self.shape.len()
            )));
        }
        let strides = self.strides();
        let mut offset = 0;
        for (d, (&i, &dim)) in index.iter().zip(self.shape.iter()).enumerate() {
            if i >= dim {
                return Err(ComprobarError::invalid_shape(format!(
                    "Index {i} out of range for dimension {d} of size {dim}"
                )));
            }
            offset += i * strides[d];
        }
        Ok(self.data[offset].clone())
    }

    /// Apply `f` element-wise, producing a tensor of another element type
    #[must_use]
    pub fn map<U: Num + Clone, F: FnMut(&T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor {
            data: self.data.iter().map(f).collect(),
            shape: self.shape.clone(),
        }
    }

    /// Reinterpret the data with a new shape
    ///
    /// A `0` entry keeps the corresponding input dimension, as the framework's
    /// `reshape(shape=[0, 0, heads, head_dim])` does.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the element count changes
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let resolved: Vec<usize> = shape
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                if d == 0 {
                    self.shape.get(i).copied().unwrap_or(0)
                } else {
                    d
                }
            })
            .collect();
        Self::from_vec(resolved, self.data.clone())
    }

    /// Permute dimensions
    ///
    /// # Errors
    ///
    /// Returns `Err` if `perm` is not a permutation of `0..ndim`
    pub fn transpose(&self, perm: &[usize]) -> Result<Self> {
        let rank = self.ndim();
        let mut seen = vec![false; rank];
        if perm.len() != rank {
            return Err(ComprobarError::invalid_shape(format!(
                "Permutation {perm:?} has wrong rank for shape {:?}",
                self.shape
            )));
        }
        for &p in perm {
            if p >= rank || seen[p] {
                return Err(ComprobarError::invalid_shape(format!(
                    "Invalid permutation {perm:?}"
                )));
            }
            seen[p] = true;
        }

        let out_shape: Vec<usize> = perm.iter().map(|&p| self.shape[p]).collect();
        let in_strides = self.strides();
        let src_strides: Vec<usize> = perm.iter().map(|&p| in_strides[p]).collect();

        let mut out = Vec::with_capacity(self.size());
        let mut index = vec![0usize; rank];
        for _ in 0..self.size() {
            let offset: usize = index.iter().zip(&src_strides).map(|(i, s)| i * s).sum();
            out.push(self.data[offset].clone());
            for d in (0..rank).rev() {
                index[d] += 1;
                if index[d] < out_shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }

        Self::from_vec(out_shape, out)
    }

    /// Concatenate tensors along `axis`
    ///
    /// # Errors
    ///
    /// Returns `Err` if the list is empty or the shapes differ off-axis
    pub fn concat(tensors: &[&Self], axis: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| ComprobarError::invalid_shape("concat of zero tensors"))?;
        let rank = first.ndim();
        if axis >= rank {
            return Err(ComprobarError::invalid_shape(format!(
                "concat axis {axis} out of range for rank {rank}"
            )));
        }
        for t in tensors.iter().skip(1) {
            let same_rank = t.ndim() == rank;
            let off_axis_equal = same_rank
                && t
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(d, (a, b))| d == axis || a == b);
            if !off_axis_equal {
                return Err(ComprobarError::ShapeMismatch {
                    op: "concat",
                    left: first.shape.clone(),
                    right: t.shape.clone(),
                });
            }
        }

        let outer: usize = first.shape[..axis].iter().product();
        let inner: usize = first.shape[axis + 1..].iter().product();
        let axis_total: usize = tensors.iter().map(|t| t.shape[axis]).sum();

        let mut out = Vec::with_capacity(outer * axis_total * inner);
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape[axis] * inner;
                out.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }

        let mut shape = first.shape.clone();
        shape[axis] = axis_total;
        Self::from_vec(shape, out)
    }

    /// Split into `sections` equal parts along `axis`
    ///
    /// # Errors
    ///
    /// Returns `Err` if the axis length is not divisible by `sections`
    pub fn split(&self, sections: usize, axis: usize) -> Result<Vec<Self>> {
        if axis >= self.ndim() || sections == 0 || self.shape[axis] % sections != 0 {
            return Err(ComprobarError::invalid_shape(format!(
                "Cannot split shape {:?} into {sections} along axis {axis}",
                self.shape
            )));
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let part = self.shape[axis] / sections;
        let chunk = part * inner;

        let mut parts = Vec::with_capacity(sections);
        for s in 0..sections {
            let mut data = Vec::with_capacity(outer * chunk);
            for o in 0..outer {
                let start = o * self.shape[axis] * inner + s * chunk;
                data.extend_from_slice(&self.data[start..start + chunk]);
            }
            let mut shape = self.shape.clone();
            shape[axis] = part;
            parts.push(Self::from_vec(shape, data)?);
        }
        Ok(parts)
    }

    /// Slice `len` entries starting at `start` along `axis`
    ///
    /// # Errors
    ///
    /// Returns `Err` if the range exceeds the axis
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self> {
        if axis >= self.ndim() || len == 0 || start + len > self.shape[axis] {
            return Err(ComprobarError::invalid_shape(format!(
                "Cannot take [{start}, {}) of axis {axis} in shape {:?}",
                start + len,
                self.shape
            )));
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = (o * self.shape[axis] + start) * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }
        let mut shape = self.shape.clone();
        shape[axis] = len;
        Self::from_vec(shape, data)
    }

    /// Remove a size-1 dimension
    ///
    /// # Errors
    ///
    /// Returns `Err` if the dimension is not 1 or it is the only dimension
    pub fn squeeze(&self, axis: usize) -> Result<Self> {
        if axis >= self.ndim() || self.shape[axis] != 1 || self.ndim() == 1 {
            return Err(ComprobarError::invalid_shape(format!(
                "Cannot squeeze axis {axis} of shape {:?}",
                self.shape
            )));
        }
        let mut shape = self.shape.clone();
        shape.remove(axis);
        Self::from_vec(shape, self.data.clone())
    }

    /// Broadcast to a larger shape (right-aligned)
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is not broadcast-compatible with `target`
    pub fn broadcast_to(&self, target: &[usize]) -> Result<Self> {
        let out_shape = broadcast_shape(&self.shape, target)?;
        if out_shape != target {
            return Err(ComprobarError::ShapeMismatch {
                op: "broadcast_to",
                left: self.shape.clone(),
                right: target.to_vec(),
            });
        }
        let data = broadcast_offsets(&self.shape, target)
            .into_iter()
            .map(|o| self.data[o].clone())
            .collect();
        Self::from_vec(target.to_vec(), data)
    }

    /// Element-wise binary op with broadcasting
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shapes cannot be broadcast together
    pub fn zip_with<F: Fn(T, T) -> T>(&self, other: &Self, f: F) -> Result<Self> {
        let out_shape = broadcast_shape(&self.shape, &other.shape)?;
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| f(a.clone(), b.clone()))
                .collect();
            return Self::from_vec(out_shape, data);
        }
        let lhs = broadcast_offsets(&self.shape, &out_shape);
        let rhs = broadcast_offsets(&other.shape, &out_shape);
        let data = lhs
            .into_iter()
            .zip(rhs)
            .map(|(a, b)| f(self.data[a].clone(), other.data[b].clone()))
            .collect();
        Self::from_vec(out_shape, data)
    }

    /// Sum over `axes`
    ///
    /// Without `keepdim` the reduced axes are removed; reducing every axis
    /// yields shape `[1]`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if an axis is out of range
    pub fn sum_axes(&self, axes: &[usize], keepdim: bool) -> Result<Self> {
        if let Some(&bad) = axes.iter().find(|&&a| a >= self.ndim()) {
            return Err(ComprobarError::invalid_shape(format!(
                "Reduce axis {bad} out of range for shape {:?}",
                self.shape
            )));
        }
        let kept_shape: Vec<usize> = self
            .shape
            .iter()
            .enumerate()
            .map(|(d, &n)| if axes.contains(&d) { 1 } else { n })
            .collect();
        let kept_strides = strides_of(&kept_shape);
        let out_len: usize = kept_shape.iter().product();
        let mut out = vec![T::zero(); out_len];

        let rank = self.ndim();
        let mut index = vec![0usize; rank];
        for value in &self.data {
            let offset: usize = index
                .iter()
                .enumerate()
                .filter(|(d, _)| !axes.contains(d))
                .map(|(d, &i)| i * kept_strides[d])
                .sum();
            out[offset] = out[offset].clone() + value.clone();
            for d in (0..rank).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }

        let shape = if keepdim {
            kept_shape
        } else {
            let reduced: Vec<usize> = self
                .shape
                .iter()
                .enumerate()
                .filter(|(d, _)| !axes.contains(d))
                .map(|(_, &n)| n)
                .collect();
            if reduced.is_empty() {
                vec![1]
            } else {
                reduced
            }
        };
        Self::from_vec(shape, out)
    }
}

impl<T: Num + Clone + fmt::Display> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?}, data=[", self.shape)?;
        for (i, val) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{val}")?;
        }
        write!(f, "])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(shape: Vec<usize>) -> Tensor<f32> {
        let n = shape.iter().product();
        Tensor::from_vec(shape, (0..n).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn test_create_tensor() {
        let t = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.ndim(), 2);
        assert_eq!(t.size(), 6);
    }

    #[test]
    fn test_empty_shape_error() {
        let result = Tensor::from_vec(vec![], vec![1.0, 2.0]);
        assert!(matches!(
            result.unwrap_err(),
            ComprobarError::InvalidShape { .. }
        ));
    }

    #[test]
    fn test_zero_dimension_error() {
        let result = Tensor::<f32>::from_vec(vec![2, 0], vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn test_size_mismatch_error() {
        let result = Tensor::from_vec(vec![2, 3], vec![1.0, 2.0]);
        assert!(matches!(
            result.unwrap_err(),
            ComprobarError::DataShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_display() {
        let t = Tensor::from_vec(vec![2], vec![1.0, 2.0]).unwrap();
        let display = format!("{t}");
        assert!(display.contains("shape=[2]"));
    }

    #[test]
    fn test_reshape_keeps_zero_dims() {
        let t = arange(vec![1, 2, 8]);
        let r = t.reshape(&[0, 0, 2, 4]).unwrap();
        assert_eq!(r.shape(), &[1, 2, 2, 4]);
        assert_eq!(r.data(), t.data());
        assert!(t.reshape(&[3, 5]).is_err());
    }

    #[test]
    fn test_transpose_2d() {
        let t = arange(vec![2, 3]);
        let tt = t.transpose(&[1, 0]).unwrap();
        assert_eq!(tt.shape(), &[3, 2]);
        assert_eq!(tt.data(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_transpose_heads_roundtrip() {
        let t = arange(vec![2, 3, 4, 5]);
        let p = t.transpose(&[0, 2, 1, 3]).unwrap();
        assert_eq!(p.shape(), &[2, 4, 3, 5]);
        assert_eq!(p.get(&[1, 2, 0, 4]).unwrap(), t.get(&[1, 0, 2, 4]).unwrap());
        let back = p.transpose(&[0, 2, 1, 3]).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_transpose_invalid_perm() {
        let t = arange(vec![2, 3]);
        assert!(t.transpose(&[0, 0]).is_err());
        assert!(t.transpose(&[0]).is_err());
    }

    #[test]
    fn test_concat_and_split() {
        let a = arange(vec![2, 1, 3]);
        let b = arange(vec![2, 2, 3]);
        let c = Tensor::concat(&[&a, &b], 1).unwrap();
        assert_eq!(c.shape(), &[2, 3, 3]);
        assert_eq!(c.get(&[1, 0, 2]).unwrap(), a.get(&[1, 0, 2]).unwrap());
        assert_eq!(c.get(&[1, 2, 1]).unwrap(), b.get(&[1, 1, 1]).unwrap());

        let whole = arange(vec![2, 4]);
        let parts = whole.split(2, 0).unwrap();
        assert_eq!(parts[0].data(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(parts[1].data(), &[4.0, 5.0, 6.0, 7.0]);
        assert!(whole.split(3, 1).is_err());
    }

    #[test]
    fn test_concat_shape_mismatch() {
        let a = arange(vec![2, 3]);
        let b = arange(vec![3, 3]);
        assert!(matches!(
            Tensor::concat(&[&a, &b], 1).unwrap_err(),
            ComprobarError::ShapeMismatch { op: "concat", .. }
        ));
    }

    #[test]
    fn test_narrow() {
        let t = arange(vec![2, 4, 2]);
        let n = t.narrow(1, 1, 2).unwrap();
        assert_eq!(n.shape(), &[2, 2, 2]);
        assert_eq!(n.data(), &[2.0, 3.0, 4.0, 5.0, 10.0, 11.0, 12.0, 13.0]);
        assert!(t.narrow(1, 3, 2).is_err());
    }

    #[test]
    fn test_squeeze() {
        let t = arange(vec![1, 2, 3]);
        assert_eq!(t.squeeze(0).unwrap().shape(), &[2, 3]);
        assert!(t.squeeze(1).is_err());
    }

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(
            broadcast_shape(&[2, 3, 3, 4], &[3, 1, 4]).unwrap(),
            vec![2, 3, 3, 4]
        );
        assert!(broadcast_shape(&[2, 3], &[4]).is_err());
    }

    #[test]
    fn test_zip_with_broadcast() {
        let a = arange(vec![2, 3]);
        let b = Tensor::from_vec(vec![3], vec![10.0, 20.0, 30.0]).unwrap();
        let c = a.zip_with(&b, |x, y| x + y).unwrap();
        assert_eq!(c.data(), &[10.0, 21.0, 32.0, 13.0, 24.0, 35.0]);
    }

    #[test]
    fn test_broadcast_to() {
        let a = Tensor::from_vec(vec![2, 1], vec![1.0, 2.0]).unwrap();
        let b = a.broadcast_to(&[2, 3]).unwrap();
        assert_eq!(b.data(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert!(a.broadcast_to(&[3]).is_err());
    }

    #[test]
    fn test_sum_axes() {
        let t = arange(vec![2, 3]);
        let rows = t.sum_axes(&[1], false).unwrap();
        assert_eq!(rows.shape(), &[2]);
        assert_eq!(rows.data(), &[3.0, 12.0]);
        let cols = t.sum_axes(&[0], true).unwrap();
        assert_eq!(cols.shape(), &[1, 3]);
        assert_eq!(cols.data(), &[3.0, 5.0, 7.0]);
        let all = t.sum_axes(&[0, 1], false).unwrap();
        assert_eq!(all.shape(), &[1]);
        assert_eq!(all.data(), &[15.0]);
    }
}
