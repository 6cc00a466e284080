use super::DataType;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("per-axis quantization needs at least one scale")]
    EmptyScales,
    #[error("per-axis quantization on axis {axis} has a single scale, which reads as per-tensor")]
    AmbiguousPerAxisQuantization { axis: u32 },
    #[error("quantization axis {axis} is out of range for a tensor of rank {rank}")]
    AxisOutOfRange { axis: u32, rank: usize },
    #[error("{scales} quantization scales given for a dimension of size {dim}")]
    ScaleCountMismatch { scales: usize, dim: u32 },
    #[error("constant tensors need a fully specified shape")]
    UnspecifiedShape,
    #[error("element count of shape {0} overflows")]
    TooManyElements(String),
    #[error("constant payload holds {actual} bytes, its descriptor requires {expected}")]
    PayloadSize { expected: usize, actual: usize },
    #[error("{0} values cannot be read as floating point")]
    NotFloat(DataType),
    #[error("{found} cells cannot be stored in a {expected} tensor")]
    CellType { expected: DataType, found: DataType },
    #[error("invalid permutation: {0}")]
    Permutation(String),
}
