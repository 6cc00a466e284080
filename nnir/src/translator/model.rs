//! In-memory form of the source model: one subgraph made of a tensor table and an ordered
//! operator list, as found in a TFLite flatbuffer. Models are read from JSON.
use serde::{Deserialize, Serialize};

use super::TranslationError;
use crate::tensor::{DataType, TensorInfo, TensorShape};

/// Index of the only subgraph a model holds; part of layer names and binding ids.
pub const SUBGRAPH: usize = 0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceModel {
    pub tensors: Vec<SourceTensor>,
    pub operators: Vec<SourceOperator>,
    /// Tensor indices fed by the caller.
    pub inputs: Vec<i32>,
    /// Tensor indices read back by the caller.
    pub outputs: Vec<i32>,
}

impl SourceModel {
    pub fn from_json(json: &str) -> Result<Self, TranslationError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, TranslationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn tensor(&self, index: usize) -> Option<&SourceTensor> {
        self.tensors.get(index)
    }
}

/// Binding id under which the graph exposes the model input or output `tensor`.
pub fn binding_id(tensor: usize) -> i32 {
    ((tensor << 8) + SUBGRAPH) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TensorType {
    Float32,
    Float16,
    Int32,
    Uint8,
    Int64,
    String,
    Bool,
    Int16,
    Complex64,
    Int8,
    Float64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceQuantization {
    pub scale: Vec<f32>,
    #[serde(default)]
    pub zero_point: Vec<i64>,
    #[serde(default)]
    pub quantized_dimension: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTensor {
    pub name: String,
    pub shape: Vec<i32>,
    /// Same as `shape`, with -1 for the dimensions only known at run time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape_signature: Option<Vec<i32>>,
    #[serde(rename = "type")]
    pub tensor_type: TensorType,
    /// Little-endian payload of constant tensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<SourceQuantization>,
}

impl SourceTensor {
    pub fn is_constant(&self) -> bool {
        self.data.as_ref().is_some_and(|d| !d.is_empty())
    }

    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().any(|d| *d < 0)
            || self
                .shape_signature
                .as_ref()
                .is_some_and(|s| s.iter().any(|d| *d < 0))
    }

    /// Element type of the tensor in the graph. 8 bit signed tensors are asymmetric when
    /// they carry a single zero point, symmetric otherwise.
    pub fn data_type(&self) -> Result<DataType, String> {
        let data_type = match self.tensor_type {
            TensorType::Float32 => DataType::Float32,
            TensorType::Float16 => DataType::Float16,
            TensorType::Int32 => DataType::Signed32,
            TensorType::Int64 => DataType::Signed64,
            TensorType::Uint8 => DataType::QAsymmU8,
            TensorType::Int16 => DataType::QSymmS16,
            TensorType::Bool => DataType::Boolean,
            TensorType::Int8 => match &self.quantization {
                Some(q) if q.zero_point.len() == 1 => DataType::QAsymmS8,
                _ => DataType::QSymmS8,
            },
            other => return Err(format!("element type {other:?} is not supported")),
        };
        Ok(data_type)
    }

    /// Descriptor of the tensor. Dimensions unknown until run time are left unspecified;
    /// a rank 0 tensor becomes a one element vector.
    pub fn tensor_info(&self) -> Result<TensorInfo, String> {
        let data_type = self.data_type()?;
        let dims: Vec<Option<u32>> = if self.shape.is_empty() {
            vec![Some(1)]
        } else {
            self.shape
                .iter()
                .enumerate()
                .map(|(i, d)| {
                    let dynamic = self
                        .shape_signature
                        .as_ref()
                        .and_then(|s| s.get(i))
                        .is_some_and(|s| *s < 0);
                    u32::try_from(*d).ok().filter(|_| !dynamic)
                })
                .collect()
        };
        let info = TensorInfo::new(TensorShape::with_unspecified(dims), data_type);
        let info = match &self.quantization {
            Some(q) if q.scale.len() > 1 => {
                let offset = q.zero_point.first().copied().unwrap_or_default();
                info.with_per_axis_quantization(
                    q.scale.clone(),
                    narrow_offset(offset)?,
                    q.quantized_dimension,
                )
                .map_err(|e| e.to_string())?
            }
            Some(q) if q.scale.len() == 1 => {
                let offset = q.zero_point.first().copied().unwrap_or_default();
                info.with_quantization(q.scale[0], narrow_offset(offset)?)
            }
            _ => info,
        };
        Ok(info.with_constant(self.is_constant()))
    }
}

fn narrow_offset(zero_point: i64) -> Result<i32, String> {
    i32::try_from(zero_point).map_err(|_| format!("zero point {zero_point} is out of range"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceOperator {
    pub op: BuiltinOperator,
    /// Tensor indices, -1 marking an omitted optional input.
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
    #[serde(default)]
    pub options: OperatorOptions,
}

macro_rules! builtin_operators {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Operator codes, named as in the TFLite schema.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub enum BuiltinOperator {
            $(
                #[serde(rename = $name)]
                $variant,
            )*
            /// Any operator code the translator does not know.
            #[serde(untagged)]
            Other(String),
        }

        impl BuiltinOperator {
            pub fn name(&self) -> &str {
                match self {
                    $(BuiltinOperator::$variant => $name,)*
                    BuiltinOperator::Other(name) => name,
                }
            }
        }
    };
}

builtin_operators! {
    Abs => "ABS",
    Add => "ADD",
    ArgMax => "ARG_MAX",
    ArgMin => "ARG_MIN",
    AveragePool2d => "AVERAGE_POOL_2D",
    BatchToSpaceNd => "BATCH_TO_SPACE_ND",
    Cast => "CAST",
    Concatenation => "CONCATENATION",
    Conv2d => "CONV_2D",
    DepthToSpace => "DEPTH_TO_SPACE",
    DepthwiseConv2d => "DEPTHWISE_CONV_2D",
    Dequantize => "DEQUANTIZE",
    Div => "DIV",
    Elu => "ELU",
    Equal => "EQUAL",
    Exp => "EXP",
    ExpandDims => "EXPAND_DIMS",
    FullyConnected => "FULLY_CONNECTED",
    Gather => "GATHER",
    Greater => "GREATER",
    GreaterEqual => "GREATER_EQUAL",
    HardSwish => "HARD_SWISH",
    L2Normalization => "L2_NORMALIZATION",
    LeakyRelu => "LEAKY_RELU",
    Less => "LESS",
    LessEqual => "LESS_EQUAL",
    LocalResponseNormalization => "LOCAL_RESPONSE_NORMALIZATION",
    LogSoftmax => "LOG_SOFTMAX",
    LogicalNot => "LOGICAL_NOT",
    Logistic => "LOGISTIC",
    MaxPool2d => "MAX_POOL_2D",
    Maximum => "MAXIMUM",
    Mean => "MEAN",
    Minimum => "MINIMUM",
    MirrorPad => "MIRROR_PAD",
    Mul => "MUL",
    Neg => "NEG",
    NotEqual => "NOT_EQUAL",
    Pack => "PACK",
    Pad => "PAD",
    PadV2 => "PADV2",
    Prelu => "PRELU",
    Quantize => "QUANTIZE",
    ReduceMax => "REDUCE_MAX",
    ReduceMin => "REDUCE_MIN",
    ReduceProd => "REDUCE_PROD",
    Relu => "RELU",
    Relu6 => "RELU6",
    Reshape => "RESHAPE",
    ResizeBilinear => "RESIZE_BILINEAR",
    ResizeNearestNeighbor => "RESIZE_NEAREST_NEIGHBOR",
    Rsqrt => "RSQRT",
    Slice => "SLICE",
    Softmax => "SOFTMAX",
    SpaceToBatchNd => "SPACE_TO_BATCH_ND",
    SpaceToDepth => "SPACE_TO_DEPTH",
    Split => "SPLIT",
    SplitV => "SPLIT_V",
    Squeeze => "SQUEEZE",
    StridedSlice => "STRIDED_SLICE",
    Sub => "SUB",
    Sum => "SUM",
    Tanh => "TANH",
    Transpose => "TRANSPOSE",
    TransposeConv => "TRANSPOSE_CONV",
}

impl Default for BuiltinOperator {
    fn default() -> Self {
        BuiltinOperator::Other(String::new())
    }
}

impl std::fmt::Display for BuiltinOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Padding {
    #[default]
    Same,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FusedActivation {
    #[default]
    None,
    Relu,
    #[serde(rename = "RELU_N1_TO_1")]
    ReluN1To1,
    Relu6,
    Tanh,
    SignBit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorPadMode {
    #[default]
    Reflect,
    Symmetric,
}

/// Union of the builtin options of every supported operator. Each operator reads the fields
/// it knows about; the defaults are those of the TFLite schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorOptions {
    pub padding: Padding,
    pub stride_w: u32,
    pub stride_h: u32,
    pub dilation_w_factor: u32,
    pub dilation_h_factor: u32,
    pub filter_width: u32,
    pub filter_height: u32,
    pub fused_activation_function: FusedActivation,
    pub axis: i32,
    pub keep_dims: bool,
    pub alpha: f32,
    pub beta: f32,
    pub radius: i32,
    pub bias: f32,
    pub block_size: u32,
    pub new_shape: Option<Vec<i32>>,
    pub squeeze_dims: Vec<i32>,
    pub num_splits: u32,
    pub begin_mask: i32,
    pub end_mask: i32,
    pub ellipsis_mask: i32,
    pub new_axis_mask: i32,
    pub shrink_axis_mask: i32,
    pub align_corners: bool,
    pub half_pixel_centers: bool,
    pub mode: MirrorPadMode,
}

impl Default for OperatorOptions {
    fn default() -> Self {
        Self {
            padding: Padding::Same,
            stride_w: 1,
            stride_h: 1,
            dilation_w_factor: 1,
            dilation_h_factor: 1,
            filter_width: 1,
            filter_height: 1,
            fused_activation_function: FusedActivation::None,
            axis: 0,
            keep_dims: false,
            alpha: 0.0,
            beta: 1.0,
            radius: 0,
            bias: 0.0,
            block_size: 1,
            new_shape: None,
            squeeze_dims: Vec::new(),
            num_splits: 1,
            begin_mask: 0,
            end_mask: 0,
            ellipsis_mask: 0,
            new_axis_mask: 0,
            shrink_axis_mask: 0,
            align_corners: false,
            half_pixel_centers: false,
            mode: MirrorPadMode::Reflect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Quantization;

    #[test]
    fn test_operator_codes_from_json() {
        let op: SourceOperator =
            serde_json::from_str(r#"{"op": "CONV_2D", "inputs": [0, 1, -1], "outputs": [2]}"#)
                .unwrap();
        assert_eq!(op.op, BuiltinOperator::Conv2d);
        assert_eq!(op.options, OperatorOptions::default());
        let custom: BuiltinOperator = serde_json::from_str(r#""TFLite_Detection_PostProcess""#)
            .unwrap();
        assert_eq!(
            custom,
            BuiltinOperator::Other("TFLite_Detection_PostProcess".to_string())
        );
        assert_eq!(custom.name(), "TFLite_Detection_PostProcess");
        assert_eq!(BuiltinOperator::ReduceMax.to_string(), "REDUCE_MAX");
    }

    #[test]
    fn test_tensor_type_mapping() {
        let mut tensor = SourceTensor {
            name: "t".to_string(),
            shape: vec![2, 3],
            shape_signature: None,
            tensor_type: TensorType::Int8,
            data: None,
            quantization: Some(SourceQuantization {
                scale: vec![0.5],
                zero_point: vec![-3],
                quantized_dimension: 0,
            }),
        };
        let info = tensor.tensor_info().unwrap();
        assert_eq!(info.data_type(), DataType::QAsymmS8);
        assert_eq!(
            info.quantization(),
            &Quantization::PerTensor {
                scale: 0.5,
                offset: -3
            }
        );

        tensor.quantization = Some(SourceQuantization {
            scale: vec![0.5, 0.25, 0.125],
            zero_point: vec![0, 0, 0],
            quantized_dimension: 1,
        });
        let info = tensor.tensor_info().unwrap();
        assert_eq!(info.data_type(), DataType::QSymmS8);
        assert_eq!(info.quantization().axis(), Some(1));

        tensor.tensor_type = TensorType::String;
        assert!(tensor.tensor_info().is_err());
    }

    #[test]
    fn test_scalars_and_dynamic_dimensions() {
        let scalar = SourceTensor {
            name: "s".to_string(),
            shape: vec![],
            shape_signature: None,
            tensor_type: TensorType::Float32,
            data: Some(vec![0, 0, 128, 63]),
            quantization: None,
        };
        let info = scalar.tensor_info().unwrap();
        assert_eq!(info.shape(), &TensorShape::new(&[1]));
        assert!(info.is_constant());
        assert!(!scalar.is_dynamic());

        let batch = SourceTensor {
            shape: vec![1, 4],
            shape_signature: Some(vec![-1, 4]),
            data: None,
            ..scalar
        };
        assert!(batch.is_dynamic());
        assert_eq!(
            batch.tensor_info().unwrap().shape().dims(),
            &[None, Some(4)]
        );
    }

    #[test]
    fn test_binding_ids() {
        assert_eq!(binding_id(0), 0);
        assert_eq!(binding_id(3), 768);
    }
}
