//! Tensor data types
//!
//! This module provides the tensor data structures carried through the
//! aggregation engine. Weights are `Float32`; monotonically-tracked counters
//! (step counts and the like) are `Int64`.

use ndarray::{Array, ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of a tensor as a vector of dimensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    /// Dimensions of the tensor
    dims: Vec<i64>,
}

impl TensorShape {
    /// Creates a new tensor shape from dimensions
    pub fn new(dims: Vec<i64>) -> Self {
        Self { dims }
    }

    /// Creates a scalar (rank-0) shape
    pub fn scalar() -> Self {
        Self::new(Vec::new())
    }

    /// Returns the dimensions as a slice
    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// Returns the dimensions as `usize` values
    pub fn dims_usize(&self) -> Vec<usize> {
        self.dims.iter().map(|&d| d as usize).collect()
    }

    /// Returns the number of dimensions (rank)
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Returns the total number of elements
    pub fn num_elements(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    /// Creates a shape for a 1D tensor
    pub fn d1(dim: i64) -> Self {
        Self::new(vec![dim])
    }

    /// Creates a shape for a 2D tensor
    pub fn d2(dim0: i64, dim1: i64) -> Self {
        Self::new(vec![dim0, dim1])
    }

    /// Creates a shape for a 4D tensor
    pub fn d4(dim0: i64, dim1: i64, dim2: i64, dim3: i64) -> Self {
        Self::new(vec![dim0, dim1, dim2, dim3])
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

impl From<Vec<i64>> for TensorShape {
    fn from(dims: Vec<i64>) -> Self {
        Self::new(dims)
    }
}

impl From<&[i64]> for TensorShape {
    fn from(dims: &[i64]) -> Self {
        Self::new(dims.to_vec())
    }
}

/// Tensor data with type information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    /// 32-bit floating point data (trainable weights)
    Float32 {
        /// Data values
        data: Vec<f32>,
        /// Shape of the tensor
        shape: TensorShape,
    },
    /// 64-bit signed integer data (non-trainable counters)
    Int64 {
        /// Data values
        data: Vec<i64>,
        /// Shape of the tensor
        shape: TensorShape,
    },
}

impl TensorData {
    /// Creates a Float32 tensor from data and shape
    pub fn float32(data: Vec<f32>, shape: impl Into<TensorShape>) -> Self {
        TensorData::Float32 {
            data,
            shape: shape.into(),
        }
    }

    /// Creates an Int64 tensor from data and shape
    pub fn int64(data: Vec<i64>, shape: impl Into<TensorShape>) -> Self {
        TensorData::Int64 {
            data,
            shape: shape.into(),
        }
    }

    /// Creates a Float32 tensor filled with zeros
    pub fn zeros_f32(shape: impl Into<TensorShape>) -> Self {
        let shape = shape.into();
        let size = shape.num_elements();
        TensorData::Float32 {
            data: vec![0.0f32; size],
            shape,
        }
    }

    /// Creates a Float32 tensor filled with ones
    pub fn ones_f32(shape: impl Into<TensorShape>) -> Self {
        let shape = shape.into();
        let size = shape.num_elements();
        TensorData::Float32 {
            data: vec![1.0f32; size],
            shape,
        }
    }

    /// Creates a zero tensor of the same dtype and shape as `self`
    pub fn zeros_like(&self) -> Self {
        match self {
            TensorData::Float32 { data, shape } => TensorData::Float32 {
                data: vec![0.0f32; data.len()],
                shape: shape.clone(),
            },
            TensorData::Int64 { data, shape } => TensorData::Int64 {
                data: vec![0i64; data.len()],
                shape: shape.clone(),
            },
        }
    }

    /// Returns the shape of the tensor
    pub fn shape(&self) -> &TensorShape {
        match self {
            TensorData::Float32 { shape, .. } => shape,
            TensorData::Int64 { shape, .. } => shape,
        }
    }

    /// Returns the data type as a string
    pub fn dtype(&self) -> &'static str {
        match self {
            TensorData::Float32 { .. } => "float32",
            TensorData::Int64 { .. } => "int64",
        }
    }

    /// Returns the number of elements in the tensor
    pub fn len(&self) -> usize {
        match self {
            TensorData::Float32 { data, .. } => data.len(),
            TensorData::Int64 { data, .. } => data.len(),
        }
    }

    /// Returns true if the tensor has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a reference to the underlying Float32 data if applicable
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        match self {
            TensorData::Float32 { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Returns a mutable reference to the underlying Float32 data if applicable
    pub fn as_f32_slice_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            TensorData::Float32 { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Returns a reference to the underlying Int64 data if applicable
    pub fn as_i64_slice(&self) -> Option<&[i64]> {
        match self {
            TensorData::Int64 { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Converts Float32 data to ndarray
    pub fn as_f32_array(&self) -> Option<ArrayD<f32>> {
        match self {
            TensorData::Float32 { data, shape } => {
                Array::from_shape_vec(IxDyn(&shape.dims_usize()), data.clone()).ok()
            }
            _ => None,
        }
    }

    /// Validates that the data length matches the shape
    pub fn validate(&self) -> bool {
        self.len() == self.shape().num_elements()
    }

    /// Scales Float32 tensor data by a factor; Int64 data is returned unchanged
    pub fn scale(&self, factor: f32) -> Self {
        match self {
            TensorData::Float32 { data, shape } => TensorData::Float32 {
                data: data.iter().map(|&x| x * factor).collect(),
                shape: shape.clone(),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor<{}>({}, {} elements)", self.dtype(), self.shape(), self.len())
    }
}

impl From<ArrayD<f32>> for TensorData {
    fn from(array: ArrayD<f32>) -> Self {
        let shape = TensorShape::new(array.shape().iter().map(|&d| d as i64).collect());
        let data = array.into_raw_vec();
        TensorData::Float32 { data, shape }
    }
}
