use crate::{
    graph::GraphError,
    tensor::{DataType, TensorError},
};

/// Failure to write or read a container. Read errors carry the offset of the offending
/// bytes; a partially read graph is never returned.
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("malformed container at byte {offset}: {reason}")]
    Format { offset: u64, reason: String },
    #[error("unsupported {what} at byte {offset}")]
    UnsupportedVersion { offset: u64, what: String },
    #[error("layer record at byte {offset} refers to undefined layer {producer}")]
    DanglingReference { offset: u64, producer: u32 },
    #[error("constant at byte {offset} declares {data_type} but stores {width} byte cells")]
    CellWidthMismatch {
        offset: u64,
        data_type: DataType,
        width: u8,
    },
    #[error("graph is not complete: {0}")]
    IncompleteGraph(#[from] GraphError),
    #[error("cannot convert constant: {0}")]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
