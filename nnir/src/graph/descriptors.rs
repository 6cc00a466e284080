//! Per-operator parameter records carried by [`super::LayerKind`] variants.
use serde::{Deserialize, Serialize};

use crate::tensor::{DataType, PermutationVector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataLayout {
    NCHW,
    #[default]
    NHWC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActivationFunction {
    #[default]
    Sigmoid,
    TanH,
    Linear,
    ReLu,
    /// `min(a, max(b, x))`
    BoundedReLu,
    SoftReLu,
    LeakyReLu,
    Abs,
    Sqrt,
    Square,
    Elu,
    HardSwish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ArgMinMaxFunction {
    Min,
    #[default]
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ComparisonOperation {
    #[default]
    Equal,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UnaryOperation {
    #[default]
    Abs,
    Exp,
    Sqrt,
    Rsqrt,
    Neg,
    LogicalNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LogicalBinaryOperation {
    #[default]
    LogicalAnd,
    LogicalOr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PoolingAlgorithm {
    #[default]
    Max,
    Average,
    L2,
}

/// How padded elements take part in a pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PaddingMethod {
    /// Padding counts as a field with value zero.
    IgnoreValue,
    /// Padding is left out of the window.
    #[default]
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OutputShapeRounding {
    #[default]
    Floor,
    Ceiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NormalizationAlgorithmChannel {
    #[default]
    Across,
    Within,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NormalizationAlgorithmMethod {
    #[default]
    LocalBrightness,
    LocalContrast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PaddingMode {
    #[default]
    Constant,
    Reflect,
    Symmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReduceOperation {
    #[default]
    Sum,
    Max,
    Mean,
    Min,
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResizeMethod {
    #[default]
    Bilinear,
    NearestNeighbor,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivationDescriptor {
    pub function: ActivationFunction,
    /// Alpha upper bound for BoundedReLu, alpha for LeakyReLu, Elu and TanH.
    pub a: f32,
    /// Lower bound for BoundedReLu, beta for TanH.
    pub b: f32,
}

impl ActivationDescriptor {
    pub fn new(function: ActivationFunction, a: f32, b: f32) -> Self {
        Self { function, a, b }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArgMinMaxDescriptor {
    pub function: ArgMinMaxFunction,
    pub axis: i32,
    pub output_type: DataType,
}

impl Default for ArgMinMaxDescriptor {
    fn default() -> Self {
        Self {
            function: ArgMinMaxFunction::Max,
            axis: -1,
            output_type: DataType::Signed32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchNormalizationDescriptor {
    pub eps: f32,
    pub data_layout: DataLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchToSpaceNdDescriptor {
    pub block_shape: Vec<u32>,
    pub crops: Vec<(u32, u32)>,
    pub data_layout: DataLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComparisonDescriptor {
    pub operation: ComparisonOperation,
}

/// Placement of every concatenated input inside the output tensor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OriginsDescriptor {
    pub concat_axis: u32,
    pub view_origins: Vec<Vec<u32>>,
}

impl OriginsDescriptor {
    pub fn num_views(&self) -> usize {
        self.view_origins.len()
    }
}

/// Shared by regular and depthwise 2d convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Convolution2dDescriptor {
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub dilation_x: u32,
    pub dilation_y: u32,
    pub bias_enabled: bool,
    pub data_layout: DataLayout,
}

impl Default for Convolution2dDescriptor {
    fn default() -> Self {
        Self {
            pad_left: 0,
            pad_right: 0,
            pad_top: 0,
            pad_bottom: 0,
            stride_x: 1,
            stride_y: 1,
            dilation_x: 1,
            dilation_y: 1,
            bias_enabled: false,
            data_layout: DataLayout::NHWC,
        }
    }
}

pub type DepthwiseConvolution2dDescriptor = Convolution2dDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ElementwiseUnaryDescriptor {
    pub operation: UnaryOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FillDescriptor {
    pub value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FullyConnectedDescriptor {
    pub bias_enabled: bool,
    pub transpose_weight_matrix: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GatherDescriptor {
    pub axis: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceNormalizationDescriptor {
    pub gamma: f32,
    pub beta: f32,
    pub eps: f32,
    pub data_layout: DataLayout,
}

impl Default for InstanceNormalizationDescriptor {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            beta: 0.0,
            eps: 1e-12,
            data_layout: DataLayout::NCHW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct L2NormalizationDescriptor {
    pub eps: f32,
    pub data_layout: DataLayout,
}

impl Default for L2NormalizationDescriptor {
    fn default() -> Self {
        Self {
            eps: 1e-12,
            data_layout: DataLayout::NHWC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogicalBinaryDescriptor {
    pub operation: LogicalBinaryOperation,
}

/// Used by both Softmax and LogSoftmax.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftmaxDescriptor {
    pub beta: f32,
    pub axis: i32,
}

impl Default for SoftmaxDescriptor {
    fn default() -> Self {
        Self {
            beta: 1.0,
            axis: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeanDescriptor {
    pub axis: Vec<u32>,
    pub keep_dims: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizationDescriptor {
    pub channel_type: NormalizationAlgorithmChannel,
    pub method_type: NormalizationAlgorithmMethod,
    pub norm_size: u32,
    pub alpha: f32,
    pub beta: f32,
    pub k: f32,
    pub data_layout: DataLayout,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PadDescriptor {
    /// (before, after) padding for every dimension.
    pub pad_list: Vec<(u32, u32)>,
    pub pad_value: f32,
    pub mode: PaddingMode,
}

/// Moves source dimension `i` to destination dimension `mappings[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermuteDescriptor {
    pub mappings: PermutationVector,
}

/// Destination dimension `i` reads source dimension `mappings[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeDescriptor {
    pub mappings: PermutationVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pooling2dDescriptor {
    pub pool_type: PoolingAlgorithm,
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub pool_width: u32,
    pub pool_height: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub output_shape_rounding: OutputShapeRounding,
    pub padding_method: PaddingMethod,
    pub data_layout: DataLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReduceDescriptor {
    pub keep_dims: bool,
    pub axis: Vec<u32>,
    pub operation: ReduceOperation,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReshapeDescriptor {
    pub target_shape: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResizeDescriptor {
    pub target_width: u32,
    pub target_height: u32,
    pub method: ResizeMethod,
    pub data_layout: DataLayout,
    pub align_corners: bool,
    pub half_pixel_centers: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SliceDescriptor {
    pub begin: Vec<u32>,
    pub size: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpaceToBatchNdDescriptor {
    pub block_shape: Vec<u32>,
    pub pad_list: Vec<(u32, u32)>,
    pub data_layout: DataLayout,
}

/// Used by both SpaceToDepth and DepthToSpace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpaceToDepthDescriptor {
    pub block_size: u32,
    pub data_layout: DataLayout,
}

/// Origin and size of every view produced by a splitter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewsDescriptor {
    pub origins: Vec<Vec<u32>>,
    pub sizes: Vec<Vec<u32>>,
}

impl ViewsDescriptor {
    pub fn num_views(&self) -> usize {
        self.origins.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StackDescriptor {
    pub axis: u32,
    pub num_inputs: u32,
    pub input_shape: Vec<u32>,
}

/// Placeholder for an operator no backend-independent kind exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StandInDescriptor {
    pub num_inputs: u32,
    pub num_outputs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StridedSliceDescriptor {
    pub begin: Vec<i32>,
    pub end: Vec<i32>,
    pub stride: Vec<i32>,
    pub begin_mask: i32,
    pub end_mask: i32,
    pub shrink_axis_mask: i32,
    pub ellipsis_mask: i32,
    pub new_axis_mask: i32,
    pub data_layout: DataLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeConvolution2dDescriptor {
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub bias_enabled: bool,
    pub data_layout: DataLayout,
    pub output_shape_enabled: bool,
    pub output_shape: Vec<u32>,
}

impl Default for TransposeConvolution2dDescriptor {
    fn default() -> Self {
        Self {
            pad_left: 0,
            pad_right: 0,
            pad_top: 0,
            pad_bottom: 0,
            stride_x: 1,
            stride_y: 1,
            bias_enabled: false,
            data_layout: DataLayout::NHWC,
            output_shape_enabled: false,
            output_shape: Vec::new(),
        }
    }
}
