//! Constant tensor data (parameters, buffers and lifted constants).

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::error::IrError;

/// Backing storage of a constant tensor.
///
/// Floats are kept as `f64` and integers as `i64` regardless of the declared
/// element width; the [`DType`] on [`TensorData`] is authoritative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "lowercase")]
pub enum TensorStorage {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
}

impl TensorStorage {
    pub fn len(&self) -> usize {
        match self {
            TensorStorage::Float(v) => v.len(),
            TensorStorage::Int(v) => v.len(),
            TensorStorage::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gather(&self, indices: &[usize]) -> TensorStorage {
        match self {
            TensorStorage::Float(v) => {
                TensorStorage::Float(indices.iter().map(|&i| v[i]).collect())
            }
            TensorStorage::Int(v) => TensorStorage::Int(indices.iter().map(|&i| v[i]).collect()),
            TensorStorage::Bool(v) => TensorStorage::Bool(indices.iter().map(|&i| v[i]).collect()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub storage: TensorStorage,
}

pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides of a shape.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

impl TensorData {
    pub fn new(dtype: DType, shape: Vec<usize>, storage: TensorStorage) -> Result<Self, IrError> {
        let expected = numel(&shape);
        if storage.len() != expected {
            return Err(IrError::ElementCountMismatch {
                what: format!("{} tensor {:?}", dtype, shape),
                expected,
                actual: storage.len(),
            });
        }
        Ok(TensorData {
            dtype,
            shape,
            storage,
        })
    }

    pub fn from_f64(dtype: DType, shape: Vec<usize>, values: Vec<f64>) -> Result<Self, IrError> {
        let storage = if dtype.is_float() {
            TensorStorage::Float(values)
        } else if dtype == DType::Bool {
            TensorStorage::Bool(values.into_iter().map(|v| v != 0.0).collect())
        } else {
            TensorStorage::Int(values.into_iter().map(|v| cast_to_int(v, dtype)).collect())
        };
        TensorData::new(dtype, shape, storage)
    }

    pub fn from_i64(dtype: DType, shape: Vec<usize>, values: Vec<i64>) -> Result<Self, IrError> {
        let storage = if dtype.is_float() {
            TensorStorage::Float(values.into_iter().map(|v| v as f64).collect())
        } else if dtype == DType::Bool {
            TensorStorage::Bool(values.into_iter().map(|v| v != 0).collect())
        } else {
            TensorStorage::Int(values)
        };
        TensorData::new(dtype, shape, storage)
    }

    /// A tensor filled with `value`.
    pub fn full(dtype: DType, shape: Vec<usize>, value: f64) -> Self {
        let count = numel(&shape);
        let storage = if dtype.is_float() {
            TensorStorage::Float(vec![value; count])
        } else if dtype == DType::Bool {
            TensorStorage::Bool(vec![value != 0.0; count])
        } else {
            TensorStorage::Int(vec![cast_to_int(value, dtype); count])
        };
        TensorData {
            dtype,
            shape,
            storage,
        }
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.storage {
            TensorStorage::Float(v) => v.clone(),
            TensorStorage::Int(v) => v.iter().map(|&x| x as f64).collect(),
            TensorStorage::Bool(v) => v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
        }
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        match &self.storage {
            TensorStorage::Float(v) => v.iter().map(|&x| x.trunc() as i64).collect(),
            TensorStorage::Int(v) => v.clone(),
            TensorStorage::Bool(v) => v.iter().map(|&x| x as i64).collect(),
        }
    }

    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self, IrError> {
        TensorData::new(self.dtype, shape, self.storage.clone())
    }

    /// Transpose the data according to `perm`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self, IrError> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        if perm.len() != rank {
            return Err(IrError::InvalidPermutation {
                perm: perm.to_vec(),
                rank,
            });
        }
        for &p in perm {
            if p >= rank || seen[p] {
                return Err(IrError::InvalidPermutation {
                    perm: perm.to_vec(),
                    rank,
                });
            }
            seen[p] = true;
        }

        let new_shape: Vec<usize> = perm.iter().map(|&p| self.shape[p]).collect();
        let old_strides = strides(&self.shape);
        let indices = index_walk(&new_shape, |counter| {
            counter
                .iter()
                .enumerate()
                .map(|(axis, &c)| c * old_strides[perm[axis]])
                .sum()
        });
        TensorData::new(self.dtype, new_shape, self.storage.gather(&indices))
    }

    /// Tile the data `multiples[d]` times along each dimension.
    pub fn repeat(&self, multiples: &[usize]) -> Result<Self, IrError> {
        let mut shape = self.shape.clone();
        while shape.len() < multiples.len() {
            shape.insert(0, 1);
        }
        if shape.len() != multiples.len() {
            return Err(IrError::ElementCountMismatch {
                what: "repeat multiples".to_string(),
                expected: shape.len(),
                actual: multiples.len(),
            });
        }
        let new_shape: Vec<usize> = shape.iter().zip(multiples).map(|(s, m)| s * m).collect();
        let old_strides = strides(&shape);
        let indices = index_walk(&new_shape, |counter| {
            counter
                .iter()
                .enumerate()
                .map(|(axis, &c)| (c % shape[axis]) * old_strides[axis])
                .sum()
        });
        TensorData::new(self.dtype, new_shape, self.storage.gather(&indices))
    }

    /// Slice `[start, end)` with `step` along `dim`.
    pub fn slice(
        &self,
        dim: usize,
        start: usize,
        end: usize,
        step: usize,
    ) -> Result<Self, IrError> {
        let mut new_shape = self.shape.clone();
        let step = step.max(1);
        let end = end.min(self.shape.get(dim).copied().unwrap_or(0));
        new_shape[dim] = if end > start { (end - start).div_ceil(step) } else { 0 };
        let old_strides = strides(&self.shape);
        let indices = index_walk(&new_shape, |counter| {
            counter
                .iter()
                .enumerate()
                .map(|(axis, &c)| {
                    let c = if axis == dim { start + c * step } else { c };
                    c * old_strides[axis]
                })
                .sum()
        });
        TensorData::new(self.dtype, new_shape, self.storage.gather(&indices))
    }

    /// Convert the element type. Float to integer truncates toward zero and
    /// saturates at the integer range.
    pub fn cast(&self, dtype: DType) -> Self {
        let storage = if dtype.is_float() {
            TensorStorage::Float(self.to_f64_vec())
        } else if dtype == DType::Bool {
            TensorStorage::Bool(self.to_f64_vec().into_iter().map(|v| v != 0.0).collect())
        } else {
            match &self.storage {
                TensorStorage::Int(v) => TensorStorage::Int(
                    v.iter()
                        .map(|&x| saturate(x, dtype))
                        .collect(),
                ),
                _ => TensorStorage::Int(
                    self.to_f64_vec()
                        .into_iter()
                        .map(|x| cast_to_int(x, dtype))
                        .collect(),
                ),
            }
        };
        TensorData {
            dtype,
            shape: self.shape.clone(),
            storage,
        }
    }

    /// Whether all integer values fit in `dtype`.
    pub fn fits_in(&self, dtype: DType) -> bool {
        match (&self.storage, dtype.int_min(), dtype.int_max()) {
            (TensorStorage::Int(v), Some(lo), Some(hi)) => v.iter().all(|&x| x >= lo && x <= hi),
            _ => true,
        }
    }
}

fn saturate(value: i64, dtype: DType) -> i64 {
    match (dtype.int_min(), dtype.int_max()) {
        (Some(lo), Some(hi)) => value.clamp(lo, hi),
        _ => value,
    }
}

fn cast_to_int(value: f64, dtype: DType) -> i64 {
    let lo = dtype.int_min().unwrap_or(i64::MIN) as f64;
    let hi = dtype.int_max().unwrap_or(i64::MAX) as f64;
    value.trunc().clamp(lo, hi) as i64
}

/// Visit every multi-index of `shape` in row-major order and map it to a flat
/// source index.
fn index_walk(shape: &[usize], mut source: impl FnMut(&[usize]) -> usize) -> Vec<usize> {
    let count = numel(shape);
    let mut out = Vec::with_capacity(count);
    let mut counter = vec![0usize; shape.len()];
    for _ in 0..count {
        out.push(source(&counter));
        for d in (0..shape.len()).rev() {
            counter[d] += 1;
            if counter[d] < shape[d] {
                break;
            }
            counter[d] = 0;
        }
    }
    out
}
