//! Tensor descriptors attached to every edge of the graph.
//!
//! A [`TensorInfo`] describes a tensor without owning any of its values: the shape (where
//! a dimension may be left unspecified), the element type, the quantization parameters and
//! whether the tensor is a constant. Constant payloads live in [`ConstTensor`].
mod constant;
mod error;
pub mod permute;

use derive_more::Display;
use serde::{Deserialize, Serialize};

pub use constant::{Cell, ConstTensor};
pub use error::TensorError;
pub use permute::{depthwise_weights_from_mihw, depthwise_weights_to_mihw, PermutationVector};

/// Element type of a tensor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
pub enum DataType {
    Float16,
    Float32,
    /// Asymmetric 8 bits unsigned, with a zero point.
    QAsymmU8,
    Signed32,
    Boolean,
    /// Symmetric 16 bits signed, zero point is always 0.
    QSymmS16,
    /// Symmetric 8 bits signed, zero point is always 0.
    QSymmS8,
    /// Asymmetric 8 bits signed, with a zero point.
    QAsymmS8,
    BFloat16,
    Signed64,
}

impl DataType {
    pub const ALL: [DataType; 10] = [
        DataType::Float16,
        DataType::Float32,
        DataType::QAsymmU8,
        DataType::Signed32,
        DataType::Boolean,
        DataType::QSymmS16,
        DataType::QSymmS8,
        DataType::QAsymmS8,
        DataType::BFloat16,
        DataType::Signed64,
    ];

    /// Width in bytes of one element, which is also the cell width used on the wire.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Signed64 => 8,
            DataType::Float32 | DataType::Signed32 => 4,
            DataType::Float16 | DataType::BFloat16 | DataType::QSymmS16 => 2,
            DataType::QAsymmU8 | DataType::QAsymmS8 | DataType::QSymmS8 | DataType::Boolean => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            DataType::Float16 | DataType::Float32 | DataType::BFloat16
        )
    }

    pub fn is_quantized(self) -> bool {
        matches!(
            self,
            DataType::QAsymmU8 | DataType::QAsymmS8 | DataType::QSymmS8 | DataType::QSymmS16
        )
    }

    /// Types which carry exact values (indices, shapes, masks) and are never requantized.
    pub fn is_exact(self) -> bool {
        matches!(
            self,
            DataType::Boolean | DataType::Signed32 | DataType::Signed64
        )
    }
}

/// Ordered list of dimensions, where `None` marks a dimension whose size is not known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<Option<u32>>,
}

impl TensorShape {
    pub fn new(dims: &[u32]) -> Self {
        Self {
            dims: dims.iter().map(|d| Some(*d)).collect(),
        }
    }

    pub fn with_unspecified(dims: Vec<Option<u32>>) -> Self {
        Self { dims }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Option<u32>] {
        &self.dims
    }

    pub fn dim(&self, index: usize) -> Option<u32> {
        self.dims.get(index).copied().flatten()
    }

    pub fn is_fully_specified(&self) -> bool {
        self.dims.iter().all(Option::is_some)
    }

    /// Returns the concrete dimensions, or `None` when any of them is unspecified.
    pub fn concrete(&self) -> Option<Vec<u32>> {
        self.dims.iter().copied().collect()
    }

    /// Number of elements described by this shape. A rank 0 shape describes a scalar.
    pub fn num_elements(&self) -> Result<usize, TensorError> {
        self.dims.iter().try_fold(1usize, |acc, d| {
            let d = d.ok_or(TensorError::UnspecifiedShape)?;
            acc.checked_mul(d as usize)
                .ok_or_else(|| TensorError::TooManyElements(self.to_string()))
        })
    }
}

impl From<Vec<u32>> for TensorShape {
    fn from(dims: Vec<u32>) -> Self {
        Self::new(&dims)
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match d {
                Some(d) => write!(f, "{d}")?,
                None => write!(f, "?")?,
            }
        }
        write!(f, "]")
    }
}

/// Quantization parameters of a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Quantization {
    /// A single scale and zero point for the whole tensor.
    PerTensor { scale: f32, offset: i32 },
    /// One scale per slice along `axis`, all sharing the same zero point.
    PerAxis {
        scales: Vec<f32>,
        offset: i32,
        axis: u32,
    },
}

impl Default for Quantization {
    fn default() -> Self {
        Quantization::PerTensor {
            scale: 0.0,
            offset: 0,
        }
    }
}

impl Quantization {
    pub fn offset(&self) -> i32 {
        match self {
            Quantization::PerTensor { offset, .. } | Quantization::PerAxis { offset, .. } => {
                *offset
            }
        }
    }

    pub fn scales(&self) -> &[f32] {
        match self {
            Quantization::PerTensor { scale, .. } => std::slice::from_ref(scale),
            Quantization::PerAxis { scales, .. } => scales,
        }
    }

    pub fn axis(&self) -> Option<u32> {
        match self {
            Quantization::PerTensor { .. } => None,
            Quantization::PerAxis { axis, .. } => Some(*axis),
        }
    }
}

/// Shape, element type and quantization of a tensor flowing through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    shape: TensorShape,
    data_type: DataType,
    quantization: Quantization,
    is_constant: bool,
}

impl TensorInfo {
    pub fn new(shape: impl Into<TensorShape>, data_type: DataType) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            quantization: Quantization::default(),
            is_constant: false,
        }
    }

    pub fn quantized(
        shape: impl Into<TensorShape>,
        data_type: DataType,
        scale: f32,
        offset: i32,
    ) -> Self {
        Self {
            quantization: Quantization::PerTensor { scale, offset },
            ..Self::new(shape, data_type)
        }
    }

    /// Attaches per-axis quantization.
    ///
    /// A single scale is rejected: per-axis and per-tensor quantization are told apart by the
    /// length of the scale vector, so a one element vector is ambiguous.
    pub fn with_per_axis_quantization(
        mut self,
        scales: Vec<f32>,
        offset: i32,
        axis: u32,
    ) -> Result<Self, TensorError> {
        if scales.is_empty() {
            return Err(TensorError::EmptyScales);
        }
        if scales.len() == 1 {
            return Err(TensorError::AmbiguousPerAxisQuantization { axis });
        }
        let rank = self.shape.rank();
        if axis as usize >= rank {
            return Err(TensorError::AxisOutOfRange { axis, rank });
        }
        if let Some(dim) = self.shape.dim(axis as usize) {
            if dim as usize != scales.len() {
                return Err(TensorError::ScaleCountMismatch {
                    scales: scales.len(),
                    dim,
                });
            }
        }
        self.quantization = Quantization::PerAxis {
            scales,
            offset,
            axis,
        };
        Ok(self)
    }

    pub fn with_quantization(mut self, scale: f32, offset: i32) -> Self {
        self.quantization = Quantization::PerTensor { scale, offset };
        self
    }

    pub fn with_constant(mut self, is_constant: bool) -> Self {
        self.is_constant = is_constant;
        self
    }

    pub fn with_shape(&self, shape: impl Into<TensorShape>) -> Self {
        Self {
            shape: shape.into(),
            ..self.clone()
        }
    }

    pub fn with_data_type(&self, data_type: DataType) -> Self {
        Self {
            data_type,
            ..self.clone()
        }
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn quantization(&self) -> &Quantization {
        &self.quantization
    }

    /// Scale of a per-tensor quantized tensor; the first scale for per-axis quantization.
    pub fn scale(&self) -> f32 {
        self.quantization.scales()[0]
    }

    pub fn offset(&self) -> i32 {
        self.quantization.offset()
    }

    pub fn is_per_axis(&self) -> bool {
        matches!(self.quantization, Quantization::PerAxis { .. })
    }

    pub fn is_constant(&self) -> bool {
        self.is_constant
    }

    pub fn num_elements(&self) -> Result<usize, TensorError> {
        self.shape.num_elements()
    }

    pub fn num_bytes(&self) -> Result<usize, TensorError> {
        self.num_elements()?
            .checked_mul(self.data_type.size_in_bytes())
            .ok_or_else(|| TensorError::TooManyElements(self.shape.to_string()))
    }
}

impl std::fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.data_type, self.shape)?;
        match &self.quantization {
            Quantization::PerTensor { scale, offset } if self.data_type.is_quantized() => {
                write!(f, " q({scale}, {offset})")
            }
            Quantization::PerTensor { .. } => Ok(()),
            Quantization::PerAxis { scales, offset, axis } => {
                write!(f, " q(axis {axis}, {} scales, {offset})", scales.len())
            }
        }
    }
}
