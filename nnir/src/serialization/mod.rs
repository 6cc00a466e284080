//! Versioned binary container for graphs.
//!
//! [`serialize`] walks a complete graph in topological order and emits one tagged record per
//! layer; [`deserialize`] rebuilds an equivalent graph. Layer ids in the container are local
//! to it and dense, so serializing a deserialized graph reproduces the same bytes.
mod error;
pub mod format;
mod reader;
mod writer;

pub use error::SerializationError;
pub use format::{FeatureVersions, FORMAT_VERSION, MAGIC};
pub use reader::deserialize;
pub use writer::{serialize, serialize_into};
