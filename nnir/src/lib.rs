//! Graph intermediate representation for neural networks.
//!
//! A [`Graph`] is built from a TFLite-style operator list by the [`translator`], can be
//! rewritten into a reduced precision copy by the [`quantization`] pass, and is persisted to
//! a versioned binary container by the [`serialization`] module.
pub mod graph;
pub mod quantization;
pub mod serialization;
pub mod tensor;
pub mod translator;

#[cfg(test)]
mod testing;

pub use graph::{Graph, GraphError, Layer, LayerGuid, LayerId, LayerKind};
pub use quantization::{
    estimate_static_ranges, quantize_graph, QuantizationError, QuantizationScheme,
    QuantizerOptions, RangeTracker,
};
pub use serialization::{deserialize, serialize, SerializationError};
pub use tensor::{ConstTensor, DataType, TensorInfo, TensorShape};
pub use translator::{
    check_support, translate_model, LayerSupport, SourceModel, TranslationError, Translator,
    TranslatorOptions,
};
