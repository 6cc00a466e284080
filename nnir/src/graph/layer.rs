use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::descriptors::*;
use crate::tensor::{ConstTensor, TensorInfo};

/// Numeric id a caller uses to feed an input or read an output of the graph.
pub type BindingId = i32;

/// Position of a layer inside the arena of the [`super::Graph`] owning it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
pub struct LayerId(pub(crate) usize);

impl LayerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Process-unique identifier of a layer, assigned at construction time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("#{_0}")]
pub struct LayerGuid(u64);

static NEXT_GUID: AtomicU64 = AtomicU64::new(1);

impl LayerGuid {
    pub(crate) fn fresh() -> Self {
        Self(NEXT_GUID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Reference to the `index`-th output slot of a layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{layer}:{index}")]
pub struct OutputSlotRef {
    pub layer: LayerId,
    pub index: usize,
}

impl OutputSlotRef {
    pub fn new(layer: LayerId, index: usize) -> Self {
        Self { layer, index }
    }
}

/// Reference to the `index`-th input slot of a layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{layer}:{index}")]
pub struct InputSlotRef {
    pub layer: LayerId,
    pub index: usize,
}

impl InputSlotRef {
    pub fn new(layer: LayerId, index: usize) -> Self {
        Self { layer, index }
    }
}

/// Consuming end of an edge. It points back at its producer without owning it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSlot {
    pub(crate) connection: Option<OutputSlotRef>,
}

impl InputSlot {
    pub fn connection(&self) -> Option<OutputSlotRef> {
        self.connection
    }
}

/// Producing end of an edge, fanning out to any number of consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSlot {
    pub(crate) info: Option<TensorInfo>,
    pub(crate) connections: Vec<InputSlotRef>,
}

impl OutputSlot {
    pub fn tensor_info(&self) -> Option<&TensorInfo> {
        self.info.as_ref()
    }

    pub fn connections(&self) -> &[InputSlotRef] {
        &self.connections
    }
}

/// Operator kinds a layer can have, each carrying its own descriptor and the constants it
/// owns.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Input {
        binding_id: BindingId,
    },
    Output {
        binding_id: BindingId,
    },
    Activation(ActivationDescriptor),
    Addition,
    ArgMinMax(ArgMinMaxDescriptor),
    BatchNormalization {
        descriptor: BatchNormalizationDescriptor,
        mean: ConstTensor,
        variance: ConstTensor,
        beta: ConstTensor,
        gamma: ConstTensor,
    },
    BatchToSpaceNd(BatchToSpaceNdDescriptor),
    Cast,
    Comparison(ComparisonDescriptor),
    Concat(OriginsDescriptor),
    Constant(ConstTensor),
    Convolution2d {
        descriptor: Convolution2dDescriptor,
        weights: ConstTensor,
        biases: Option<ConstTensor>,
    },
    DepthToSpace(SpaceToDepthDescriptor),
    DepthwiseConvolution2d {
        descriptor: DepthwiseConvolution2dDescriptor,
        /// Laid out as [M, I, H, W].
        weights: ConstTensor,
        biases: Option<ConstTensor>,
    },
    Dequantize,
    Division,
    ElementwiseUnary(ElementwiseUnaryDescriptor),
    Fill(FillDescriptor),
    Floor,
    FullyConnected {
        descriptor: FullyConnectedDescriptor,
        weights: ConstTensor,
        biases: Option<ConstTensor>,
    },
    Gather(GatherDescriptor),
    InstanceNormalization(InstanceNormalizationDescriptor),
    L2Normalization(L2NormalizationDescriptor),
    LogicalBinary(LogicalBinaryDescriptor),
    LogSoftmax(SoftmaxDescriptor),
    Maximum,
    Mean(MeanDescriptor),
    Minimum,
    Multiplication,
    Normalization(NormalizationDescriptor),
    Pad(PadDescriptor),
    Permute(PermuteDescriptor),
    Pooling2d(Pooling2dDescriptor),
    Prelu,
    Quantize,
    Rank,
    Reduce(ReduceDescriptor),
    Reshape(ReshapeDescriptor),
    Resize(ResizeDescriptor),
    Slice(SliceDescriptor),
    Softmax(SoftmaxDescriptor),
    SpaceToBatchNd(SpaceToBatchNdDescriptor),
    SpaceToDepth(SpaceToDepthDescriptor),
    Splitter(ViewsDescriptor),
    Stack(StackDescriptor),
    StandIn(StandInDescriptor),
    StridedSlice(StridedSliceDescriptor),
    Subtraction,
    Transpose(TransposeDescriptor),
    TransposeConvolution2d {
        descriptor: TransposeConvolution2dDescriptor,
        weights: ConstTensor,
        biases: Option<ConstTensor>,
    },
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "Input",
            LayerKind::Output { .. } => "Output",
            LayerKind::Activation(_) => "Activation",
            LayerKind::Addition => "Addition",
            LayerKind::ArgMinMax(_) => "ArgMinMax",
            LayerKind::BatchNormalization { .. } => "BatchNormalization",
            LayerKind::BatchToSpaceNd(_) => "BatchToSpaceNd",
            LayerKind::Cast => "Cast",
            LayerKind::Comparison(_) => "Comparison",
            LayerKind::Concat(_) => "Concat",
            LayerKind::Constant(_) => "Constant",
            LayerKind::Convolution2d { .. } => "Convolution2d",
            LayerKind::DepthToSpace(_) => "DepthToSpace",
            LayerKind::DepthwiseConvolution2d { .. } => "DepthwiseConvolution2d",
            LayerKind::Dequantize => "Dequantize",
            LayerKind::Division => "Division",
            LayerKind::ElementwiseUnary(_) => "ElementwiseUnary",
            LayerKind::Fill(_) => "Fill",
            LayerKind::Floor => "Floor",
            LayerKind::FullyConnected { .. } => "FullyConnected",
            LayerKind::Gather(_) => "Gather",
            LayerKind::InstanceNormalization(_) => "InstanceNormalization",
            LayerKind::L2Normalization(_) => "L2Normalization",
            LayerKind::LogicalBinary(_) => "LogicalBinary",
            LayerKind::LogSoftmax(_) => "LogSoftmax",
            LayerKind::Maximum => "Maximum",
            LayerKind::Mean(_) => "Mean",
            LayerKind::Minimum => "Minimum",
            LayerKind::Multiplication => "Multiplication",
            LayerKind::Normalization(_) => "Normalization",
            LayerKind::Pad(_) => "Pad",
            LayerKind::Permute(_) => "Permute",
            LayerKind::Pooling2d(_) => "Pooling2d",
            LayerKind::Prelu => "Prelu",
            LayerKind::Quantize => "Quantize",
            LayerKind::Rank => "Rank",
            LayerKind::Reduce(_) => "Reduce",
            LayerKind::Reshape(_) => "Reshape",
            LayerKind::Resize(_) => "Resize",
            LayerKind::Slice(_) => "Slice",
            LayerKind::Softmax(_) => "Softmax",
            LayerKind::SpaceToBatchNd(_) => "SpaceToBatchNd",
            LayerKind::SpaceToDepth(_) => "SpaceToDepth",
            LayerKind::Splitter(_) => "Splitter",
            LayerKind::Stack(_) => "Stack",
            LayerKind::StandIn(_) => "StandIn",
            LayerKind::StridedSlice(_) => "StridedSlice",
            LayerKind::Subtraction => "Subtraction",
            LayerKind::Transpose(_) => "Transpose",
            LayerKind::TransposeConvolution2d { .. } => "TransposeConvolution2d",
        }
    }

    pub fn num_inputs(&self) -> usize {
        match self {
            LayerKind::Input { .. } | LayerKind::Constant(_) => 0,
            LayerKind::Addition
            | LayerKind::Comparison(_)
            | LayerKind::Division
            | LayerKind::Gather(_)
            | LayerKind::LogicalBinary(_)
            | LayerKind::Maximum
            | LayerKind::Minimum
            | LayerKind::Multiplication
            | LayerKind::Prelu
            | LayerKind::Subtraction => 2,
            LayerKind::Concat(d) => d.num_views(),
            LayerKind::Stack(d) => d.num_inputs as usize,
            LayerKind::StandIn(d) => d.num_inputs as usize,
            _ => 1,
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            LayerKind::Output { .. } => 0,
            LayerKind::Splitter(d) => d.num_views(),
            LayerKind::StandIn(d) => d.num_outputs as usize,
            _ => 1,
        }
    }

    pub fn binding_id(&self) -> Option<BindingId> {
        match self {
            LayerKind::Input { binding_id } | LayerKind::Output { binding_id } => Some(*binding_id),
            _ => None,
        }
    }

    /// Constant tensors owned by the layer, in a fixed per-kind order.
    pub fn constants(&self) -> Vec<&ConstTensor> {
        match self {
            LayerKind::Constant(t) => vec![t],
            LayerKind::BatchNormalization {
                mean,
                variance,
                beta,
                gamma,
                ..
            } => vec![mean, variance, beta, gamma],
            LayerKind::Convolution2d {
                weights, biases, ..
            }
            | LayerKind::DepthwiseConvolution2d {
                weights, biases, ..
            }
            | LayerKind::FullyConnected {
                weights, biases, ..
            }
            | LayerKind::TransposeConvolution2d {
                weights, biases, ..
            } => std::iter::once(weights).chain(biases.as_ref()).collect(),
            _ => Vec::new(),
        }
    }
}

/// A node of the graph: one operator instance with its slots.
#[derive(Debug, Clone)]
pub struct Layer {
    pub(crate) guid: LayerGuid,
    pub(crate) name: String,
    pub(crate) kind: LayerKind,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<OutputSlot>,
}

impl Layer {
    pub(crate) fn new(kind: LayerKind, name: impl Into<String>) -> Self {
        Self {
            guid: LayerGuid::fresh(),
            name: name.into(),
            inputs: vec![InputSlot::default(); kind.num_inputs()],
            outputs: vec![OutputSlot::default(); kind.num_outputs()],
            kind,
        }
    }

    pub fn guid(&self) -> LayerGuid {
        self.guid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    pub fn input(&self, index: usize) -> Option<&InputSlot> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&OutputSlot> {
        self.outputs.get(index)
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} '{}'", self.kind.name(), self.guid, self.name)
    }
}
