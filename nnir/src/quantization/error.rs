use crate::{
    graph::{GraphError, LayerGuid},
    tensor::TensorError,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum QuantizationError {
    #[error("layer {layer} '{name}' of kind {kind} cannot be quantized")]
    UnimplementedOperator {
        layer: LayerGuid,
        name: String,
        kind: &'static str,
    },
    /// A producer was not rewritten before its consumer, which means the traversal order is
    /// broken.
    #[error("producer {producer} of layer {layer} has not been quantized yet")]
    MissingProducer {
        layer: LayerGuid,
        producer: LayerGuid,
    },
    #[error("no range recorded for output slot {slot} of layer {layer}")]
    MissingRange { layer: LayerGuid, slot: usize },
    #[error("range [{min}, {max}] cannot be quantized")]
    InvalidRange { min: f32, max: f32 },
    #[error("a range is already recorded for output slot {slot} of layer {layer}")]
    RangeAlreadyRecorded { layer: LayerGuid, slot: usize },
    #[error(
        "bias scale from input scale {input_scale} and weight scale {weight_scale} is not usable"
    )]
    InvalidBiasScale { input_scale: f32, weight_scale: f32 },
    #[error("no layer named '{0}' in the graph")]
    UnknownLayerName(String),
    #[error("unknown quantization scheme '{0}'")]
    UnknownScheme(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}
