//! Constants and tags of the binary container.
//!
//! All integers are little-endian. A container is laid out as:
//!
//! ```text
//! magic "NNIR" | u32 format version
//! u32 feature count | (u16 feature id, u32 version)*
//! u32 layer count   | layer record*
//! u32 input count   | i32 input id*
//! u32 output count  | i32 output id*
//! ```
//!
//! A layer record is `u16 kind tag | u32 layer id | name | input slots | output slots |
//! u32 body length | body`, where the body holds the descriptor fields and the constant
//! payloads of the kind.
use crate::graph::{
    ActivationFunction, ArgMinMaxFunction, ComparisonOperation, DataLayout, LayerKind,
    LogicalBinaryOperation, NormalizationAlgorithmChannel, NormalizationAlgorithmMethod,
    OutputShapeRounding, PaddingMethod, PaddingMode, PoolingAlgorithm, ReduceOperation,
    ResizeMethod, UnaryOperation,
};
use crate::tensor::DataType;

pub const MAGIC: [u8; 4] = *b"NNIR";
pub const FORMAT_VERSION: u32 = 1;

/// Marks a per-tensor quantization in the axis field of a tensor descriptor.
pub(crate) const NO_AXIS: u32 = u32::MAX;

pub(crate) const FEATURE_BINDING_IDS_SCHEME: u16 = 0;
pub(crate) const FEATURE_WEIGHTS_LAYOUT_SCHEME: u16 = 1;
pub(crate) const FEATURE_CONSTANT_TENSORS_AS_INPUTS: u16 = 2;

/// Versions of the independently evolving parts of the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureVersions {
    /// 0: input and output id lists hold layer ids. 1: they hold binding ids.
    pub binding_ids_scheme: u32,
    /// 0: depthwise weights are stored as `[1, H, W, I * M]`. 1: as `[M, I, H, W]`.
    pub weights_layout_scheme: u32,
    /// Only 0 is defined: constants are owned by the layers using them.
    pub constant_tensors_as_inputs: u32,
}

impl FeatureVersions {
    /// What this version of the writer produces, and the newest the reader understands.
    pub const CURRENT: FeatureVersions = FeatureVersions {
        binding_ids_scheme: 1,
        weights_layout_scheme: 1,
        constant_tensors_as_inputs: 0,
    };

    /// Assumed for features missing from a container's table.
    pub const LEGACY: FeatureVersions = FeatureVersions {
        binding_ids_scheme: 0,
        weights_layout_scheme: 0,
        constant_tensors_as_inputs: 0,
    };

    pub(crate) fn entries(&self) -> [(u16, u32); 3] {
        [
            (FEATURE_BINDING_IDS_SCHEME, self.binding_ids_scheme),
            (FEATURE_WEIGHTS_LAYOUT_SCHEME, self.weights_layout_scheme),
            (
                FEATURE_CONSTANT_TENSORS_AS_INPUTS,
                self.constant_tensors_as_inputs,
            ),
        ]
    }
}

impl Default for FeatureVersions {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// One byte tags of the small enums found in descriptors.
pub(crate) trait WireEnum: Sized + Copy {
    const NAME: &'static str;
    fn tag(self) -> u8;
    fn from_tag(tag: u8) -> Option<Self>;
}

macro_rules! wire_enum {
    ($ty:ident { $($variant:ident = $tag:literal),+ $(,)? }) => {
        impl WireEnum for $ty {
            const NAME: &'static str = stringify!($ty);

            fn tag(self) -> u8 {
                match self {
                    $($ty::$variant => $tag),+
                }
            }

            fn from_tag(tag: u8) -> Option<Self> {
                match tag {
                    $($tag => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum!(DataType {
    Float16 = 0,
    Float32 = 1,
    QAsymmU8 = 2,
    Signed32 = 3,
    Boolean = 4,
    QSymmS16 = 5,
    QSymmS8 = 7,
    QAsymmS8 = 8,
    BFloat16 = 9,
    Signed64 = 10,
});

wire_enum!(DataLayout { NCHW = 0, NHWC = 1 });

wire_enum!(ActivationFunction {
    Sigmoid = 0,
    TanH = 1,
    Linear = 2,
    ReLu = 3,
    BoundedReLu = 4,
    SoftReLu = 5,
    LeakyReLu = 6,
    Abs = 7,
    Sqrt = 8,
    Square = 9,
    Elu = 10,
    HardSwish = 11,
});

wire_enum!(ArgMinMaxFunction { Min = 0, Max = 1 });

wire_enum!(ComparisonOperation {
    Equal = 0,
    Greater = 1,
    GreaterOrEqual = 2,
    Less = 3,
    LessOrEqual = 4,
    NotEqual = 5,
});

wire_enum!(UnaryOperation {
    Abs = 0,
    Exp = 1,
    Sqrt = 2,
    Rsqrt = 3,
    Neg = 4,
    LogicalNot = 5,
});

wire_enum!(LogicalBinaryOperation {
    LogicalAnd = 0,
    LogicalOr = 1,
});

wire_enum!(PoolingAlgorithm {
    Max = 0,
    Average = 1,
    L2 = 2,
});

wire_enum!(PaddingMethod {
    IgnoreValue = 0,
    Exclude = 1,
});

wire_enum!(OutputShapeRounding { Floor = 0, Ceiling = 1 });

wire_enum!(NormalizationAlgorithmChannel {
    Across = 0,
    Within = 1,
});

wire_enum!(NormalizationAlgorithmMethod {
    LocalBrightness = 0,
    LocalContrast = 1,
});

wire_enum!(PaddingMode {
    Constant = 0,
    Reflect = 1,
    Symmetric = 2,
});

wire_enum!(ReduceOperation {
    Sum = 0,
    Max = 1,
    Mean = 2,
    Min = 3,
    Prod = 4,
});

wire_enum!(ResizeMethod {
    Bilinear = 0,
    NearestNeighbor = 1,
});

macro_rules! layer_tags {
    ($($variant:ident = $tag:literal),+ $(,)?) => {
        /// Top-level tag of a layer record.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub(crate) enum LayerTag {
            $($variant),+
        }

        impl LayerTag {
            pub(crate) fn to_u16(self) -> u16 {
                match self {
                    $(LayerTag::$variant => $tag),+
                }
            }

            pub(crate) fn from_u16(tag: u16) -> Option<Self> {
                match tag {
                    $($tag => Some(LayerTag::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

layer_tags!(
    Input = 0,
    Output = 1,
    Activation = 2,
    Addition = 3,
    ArgMinMax = 4,
    BatchNormalization = 5,
    BatchToSpaceNd = 6,
    Cast = 7,
    Comparison = 8,
    Concat = 9,
    Constant = 10,
    Convolution2d = 11,
    DepthToSpace = 12,
    DepthwiseConvolution2d = 13,
    Dequantize = 14,
    Division = 15,
    ElementwiseUnary = 16,
    Fill = 17,
    Floor = 18,
    FullyConnected = 19,
    Gather = 20,
    InstanceNormalization = 21,
    L2Normalization = 22,
    LogicalBinary = 23,
    LogSoftmax = 24,
    Maximum = 25,
    Mean = 26,
    Minimum = 27,
    Multiplication = 28,
    Normalization = 29,
    Pad = 30,
    Permute = 31,
    Pooling2d = 32,
    Prelu = 33,
    Quantize = 34,
    Rank = 35,
    Reduce = 36,
    Reshape = 37,
    Resize = 38,
    Slice = 39,
    Softmax = 40,
    SpaceToBatchNd = 41,
    SpaceToDepth = 42,
    Splitter = 43,
    Stack = 44,
    StandIn = 45,
    StridedSlice = 46,
    Subtraction = 47,
    Transpose = 48,
    TransposeConvolution2d = 49,
);

impl LayerTag {
    pub(crate) fn of(kind: &LayerKind) -> Self {
        match kind {
            LayerKind::Input { .. } => LayerTag::Input,
            LayerKind::Output { .. } => LayerTag::Output,
            LayerKind::Activation(_) => LayerTag::Activation,
            LayerKind::Addition => LayerTag::Addition,
            LayerKind::ArgMinMax(_) => LayerTag::ArgMinMax,
            LayerKind::BatchNormalization { .. } => LayerTag::BatchNormalization,
            LayerKind::BatchToSpaceNd(_) => LayerTag::BatchToSpaceNd,
            LayerKind::Cast => LayerTag::Cast,
            LayerKind::Comparison(_) => LayerTag::Comparison,
            LayerKind::Concat(_) => LayerTag::Concat,
            LayerKind::Constant(_) => LayerTag::Constant,
            LayerKind::Convolution2d { .. } => LayerTag::Convolution2d,
            LayerKind::DepthToSpace(_) => LayerTag::DepthToSpace,
            LayerKind::DepthwiseConvolution2d { .. } => LayerTag::DepthwiseConvolution2d,
            LayerKind::Dequantize => LayerTag::Dequantize,
            LayerKind::Division => LayerTag::Division,
            LayerKind::ElementwiseUnary(_) => LayerTag::ElementwiseUnary,
            LayerKind::Fill(_) => LayerTag::Fill,
            LayerKind::Floor => LayerTag::Floor,
            LayerKind::FullyConnected { .. } => LayerTag::FullyConnected,
            LayerKind::Gather(_) => LayerTag::Gather,
            LayerKind::InstanceNormalization(_) => LayerTag::InstanceNormalization,
            LayerKind::L2Normalization(_) => LayerTag::L2Normalization,
            LayerKind::LogicalBinary(_) => LayerTag::LogicalBinary,
            LayerKind::LogSoftmax(_) => LayerTag::LogSoftmax,
            LayerKind::Maximum => LayerTag::Maximum,
            LayerKind::Mean(_) => LayerTag::Mean,
            LayerKind::Minimum => LayerTag::Minimum,
            LayerKind::Multiplication => LayerTag::Multiplication,
            LayerKind::Normalization(_) => LayerTag::Normalization,
            LayerKind::Pad(_) => LayerTag::Pad,
            LayerKind::Permute(_) => LayerTag::Permute,
            LayerKind::Pooling2d(_) => LayerTag::Pooling2d,
            LayerKind::Prelu => LayerTag::Prelu,
            LayerKind::Quantize => LayerTag::Quantize,
            LayerKind::Rank => LayerTag::Rank,
            LayerKind::Reduce(_) => LayerTag::Reduce,
            LayerKind::Reshape(_) => LayerTag::Reshape,
            LayerKind::Resize(_) => LayerTag::Resize,
            LayerKind::Slice(_) => LayerTag::Slice,
            LayerKind::Softmax(_) => LayerTag::Softmax,
            LayerKind::SpaceToBatchNd(_) => LayerTag::SpaceToBatchNd,
            LayerKind::SpaceToDepth(_) => LayerTag::SpaceToDepth,
            LayerKind::Splitter(_) => LayerTag::Splitter,
            LayerKind::Stack(_) => LayerTag::Stack,
            LayerKind::StandIn(_) => LayerTag::StandIn,
            LayerKind::StridedSlice(_) => LayerTag::StridedSlice,
            LayerKind::Subtraction => LayerTag::Subtraction,
            LayerKind::Transpose(_) => LayerTag::Transpose,
            LayerKind::TransposeConvolution2d { .. } => LayerTag::TransposeConvolution2d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_tags_are_unique() {
        for dt in DataType::ALL {
            assert_eq!(DataType::from_tag(dt.tag()), Some(dt));
        }
        assert_eq!(DataType::from_tag(6), None);
    }

    #[test]
    fn test_layer_tags_are_dense() {
        for tag in 0..50u16 {
            assert_eq!(LayerTag::from_u16(tag).map(LayerTag::to_u16), Some(tag));
        }
        assert_eq!(LayerTag::from_u16(50), None);
    }
}
