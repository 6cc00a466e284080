//! Turns one source operator into the layers representing it, without touching a graph.
//!
//! Both translation modes start from the [`OperatorPlan`] computed here: building adds the
//! planned layers to a graph, support checking hands them to a [`super::LayerSupport`].
use std::{collections::BTreeSet, ops::RangeInclusive};

use itertools::Itertools;

use super::{
    model::{BuiltinOperator, FusedActivation, MirrorPadMode, SourceModel, SourceOperator, SUBGRAPH},
    padding::calc_padding,
    TranslationError, TranslatorOptions,
};
use crate::{
    graph::{
        ActivationDescriptor, ActivationFunction, ArgMinMaxDescriptor, ArgMinMaxFunction,
        BatchToSpaceNdDescriptor, ComparisonDescriptor, ComparisonOperation,
        Convolution2dDescriptor, DataLayout, ElementwiseUnaryDescriptor, FullyConnectedDescriptor,
        GatherDescriptor, L2NormalizationDescriptor, LayerKind, MeanDescriptor,
        NormalizationAlgorithmChannel, NormalizationAlgorithmMethod, NormalizationDescriptor,
        OriginsDescriptor, OutputShapeRounding, PadDescriptor, PaddingMethod, PaddingMode,
        Pooling2dDescriptor, PoolingAlgorithm, ReduceDescriptor, ReduceOperation,
        ReshapeDescriptor, ResizeDescriptor, ResizeMethod, SliceDescriptor, SoftmaxDescriptor,
        SpaceToBatchNdDescriptor, SpaceToDepthDescriptor, StackDescriptor, StandInDescriptor,
        StridedSliceDescriptor, TransposeConvolution2dDescriptor, TransposeDescriptor,
        UnaryOperation, ViewsDescriptor,
    },
    tensor::{
        depthwise_weights_to_mihw, ConstTensor, DataType, PermutationVector, TensorInfo,
        TensorShape,
    },
};

type Result<T> = std::result::Result<T, TranslationError>;

/// Upper bound of the arity of variadic operators.
const ANY: usize = usize::MAX;

/// A layer to be created, with the descriptors of what flows in and out of it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedLayer {
    pub kind: LayerKind,
    pub name: String,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
}

/// Where an input slot of the primary layer takes its values from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotSource {
    /// The producer of a source tensor.
    Tensor(usize),
    /// The output of one of the plan's reshapes.
    Reshape(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OperatorPlan {
    /// Reshapes feeding the primary layer, each with the source tensor it consumes.
    pub reshapes: Vec<(usize, PlannedLayer)>,
    pub primary: PlannedLayer,
    pub inputs: Vec<SlotSource>,
    /// Single input layers chained after the primary one.
    pub tail: Vec<PlannedLayer>,
    /// Source tensors produced by the output slots of the last layer of the chain.
    pub outputs: Vec<usize>,
}

impl OperatorPlan {
    /// Layers of the plan in creation order.
    pub fn layers(&self) -> impl Iterator<Item = &PlannedLayer> {
        self.reshapes
            .iter()
            .map(|(_, layer)| layer)
            .chain(std::iter::once(&self.primary))
            .chain(&self.tail)
    }

    /// Source tensors whose producers the plan connects to, without repetitions.
    pub fn consumed_tensors(&self) -> Vec<usize> {
        self.reshapes
            .iter()
            .map(|(tensor, _)| *tensor)
            .chain(self.inputs.iter().filter_map(|source| match source {
                SlotSource::Tensor(tensor) => Some(*tensor),
                SlotSource::Reshape(_) => None,
            }))
            .unique()
            .collect()
    }
}

/// Plans operator `index` of `model`.
pub(crate) fn plan_operator(
    model: &SourceModel,
    index: usize,
    options: &TranslatorOptions,
) -> Result<OperatorPlan> {
    Planner::new(model, index)?.plan(options)
}

/// Resolves a reshape target where a single -1 stands for the size that keeps the number
/// of elements unchanged.
pub(crate) fn reshape_target(
    elements: usize,
    target: &[i64],
) -> std::result::Result<Vec<u32>, String> {
    let stretch = target.iter().positions(|d| *d == -1).collect_vec();
    if stretch.len() > 1 {
        return Err(format!("at most one dimension of {target:?} may be -1"));
    }
    if let Some(d) = target.iter().find(|d| **d < -1) {
        return Err(format!("invalid dimension {d}"));
    }
    let mut dims = target.to_vec();
    if let Some(&i) = stretch.first() {
        let known = target
            .iter()
            .filter(|d| **d >= 0)
            .try_fold(1i64, |acc, d| acc.checked_mul(*d))
            .ok_or_else(|| format!("element count of {target:?} overflows"))?;
        if known == 0 || elements as i64 % known != 0 {
            return Err(format!("cannot stretch {target:?} over {elements} elements"));
        }
        dims[i] = elements as i64 / known;
    }
    let dims = dims
        .into_iter()
        .map(|d| u32::try_from(d).map_err(|_| format!("dimension {d} is too large")))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let count = TensorShape::new(&dims)
        .num_elements()
        .map_err(|e| e.to_string())?;
    if count != elements {
        return Err(format!("shape {dims:?} does not hold {elements} elements"));
    }
    Ok(dims)
}

struct Planner<'a> {
    model: &'a SourceModel,
    index: usize,
    op: &'a SourceOperator,
    /// Input tensors, omitted optional inputs removed.
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

impl<'a> Planner<'a> {
    fn new(model: &'a SourceModel, index: usize) -> Result<Self> {
        let op = model
            .operators
            .get(index)
            .ok_or(TranslationError::UnknownOperator(index))?;
        let resolve = |tensors: &[i32], optional: bool| -> Result<Vec<usize>> {
            tensors
                .iter()
                .filter(|t| !(optional && **t == -1))
                .map(|t| {
                    usize::try_from(*t)
                        .ok()
                        .filter(|t| *t < model.tensors.len())
                        .ok_or_else(|| TranslationError::InvalidTensor {
                            operator: index,
                            tensor: *t,
                            reason: "no such tensor".to_string(),
                        })
                })
                .collect()
        };
        let inputs = resolve(&op.inputs, true)?;
        let outputs = resolve(&op.outputs, false)?;
        if let Some(tensor) = inputs
            .iter()
            .chain(&outputs)
            .find(|t| model.tensors[**t].is_dynamic())
        {
            return Err(TranslationError::UnsupportedDynamicShape {
                operator: index,
                tensor: *tensor,
            });
        }
        Ok(Self {
            model,
            index,
            op,
            inputs,
            outputs,
        })
    }

    fn plan(&self, options: &TranslatorOptions) -> Result<OperatorPlan> {
        use BuiltinOperator as Op;
        let o = &self.op.options;
        match &self.op.op {
            Op::Abs => self.unary(UnaryOperation::Abs, "Abs"),
            Op::Exp => self.unary(UnaryOperation::Exp, "Exp"),
            Op::Neg => self.unary(UnaryOperation::Neg, "Neg"),
            Op::Rsqrt => self.unary(UnaryOperation::Rsqrt, "Rsqrt"),
            Op::LogicalNot => self.unary(UnaryOperation::LogicalNot, "LogicalNot"),
            Op::Add => self.fused(self.elementwise(LayerKind::Addition, "Add")?),
            Op::Sub => self.fused(self.elementwise(LayerKind::Subtraction, "Sub")?),
            Op::Mul => self.fused(self.elementwise(LayerKind::Multiplication, "Mul")?),
            Op::Div => self.fused(self.elementwise(LayerKind::Division, "Div")?),
            Op::Maximum => self.elementwise(LayerKind::Maximum, "Maximum"),
            Op::Minimum => self.elementwise(LayerKind::Minimum, "Minimum"),
            Op::Equal => self.comparison(ComparisonOperation::Equal, "Equal"),
            Op::NotEqual => self.comparison(ComparisonOperation::NotEqual, "NotEqual"),
            Op::Greater => self.comparison(ComparisonOperation::Greater, "Greater"),
            Op::GreaterEqual => {
                self.comparison(ComparisonOperation::GreaterOrEqual, "GreaterOrEqual")
            }
            Op::Less => self.comparison(ComparisonOperation::Less, "Less"),
            Op::LessEqual => self.comparison(ComparisonOperation::LessOrEqual, "LessOrEqual"),
            Op::ArgMax => self.arg_min_max(ArgMinMaxFunction::Max, "ArgMax"),
            Op::ArgMin => self.arg_min_max(ArgMinMaxFunction::Min, "ArgMin"),
            Op::AveragePool2d => self.fused(self.pool(PoolingAlgorithm::Average, "AveragePool2D")?),
            Op::MaxPool2d => self.fused(self.pool(PoolingAlgorithm::Max, "MaxPool2D")?),
            Op::Conv2d => self.fused(self.conv2d()?),
            Op::DepthwiseConv2d => self.fused(self.depthwise_conv2d()?),
            Op::TransposeConv => self.transpose_conv(),
            Op::FullyConnected => self.fused(self.fully_connected()?),
            Op::Concatenation => self.fused(self.concatenation()?),
            Op::L2Normalization => self.fused(self.single(
                LayerKind::L2Normalization(L2NormalizationDescriptor::default()),
                "L2Normalization",
            )?),
            Op::Elu => self.activation(ActivationFunction::Elu, 1.0, 0.0, "ELU"),
            Op::HardSwish => self.activation(ActivationFunction::HardSwish, 0.0, 0.0, "HARDSWISH"),
            Op::LeakyRelu => {
                self.activation(ActivationFunction::LeakyReLu, o.alpha, 0.0, "LEAKYRELU")
            }
            Op::Logistic => self.activation(ActivationFunction::Sigmoid, 0.0, 0.0, "SIGMOID"),
            Op::Relu => self.activation(ActivationFunction::ReLu, 0.0, 0.0, "RELU"),
            Op::Relu6 => self.activation(ActivationFunction::BoundedReLu, 6.0, 0.0, "RELU6"),
            Op::Tanh => self.activation(ActivationFunction::TanH, 1.0, 1.0, "TANH"),
            Op::Softmax => self.single(
                LayerKind::Softmax(SoftmaxDescriptor {
                    beta: o.beta,
                    axis: -1,
                }),
                "Softmax",
            ),
            Op::LogSoftmax => self.single(
                LayerKind::LogSoftmax(SoftmaxDescriptor::default()),
                "LogSoftmax",
            ),
            Op::Cast => self.single(LayerKind::Cast, "Cast"),
            Op::Dequantize => self.single(LayerKind::Dequantize, "Dequantize"),
            Op::Quantize => self.single(LayerKind::Quantize, "Quantize"),
            Op::DepthToSpace => self.space_depth(true),
            Op::SpaceToDepth => self.space_depth(false),
            Op::BatchToSpaceNd => self.batch_to_space(),
            Op::SpaceToBatchNd => self.space_to_batch(),
            Op::LocalResponseNormalization => self.local_response_normalization(),
            Op::Mean => self.mean(),
            Op::ReduceMax => self.reduce(ReduceOperation::Max),
            Op::ReduceMin => self.reduce(ReduceOperation::Min),
            Op::ReduceProd => self.reduce(ReduceOperation::Prod),
            Op::Sum => self.reduce(ReduceOperation::Sum),
            Op::Pad => self.pad("Pad", PaddingMode::Constant, false),
            Op::PadV2 => self.pad("PadV2", PaddingMode::Constant, true),
            Op::MirrorPad => {
                let mode = match o.mode {
                    MirrorPadMode::Reflect => PaddingMode::Reflect,
                    MirrorPadMode::Symmetric => PaddingMode::Symmetric,
                };
                self.pad("MirrorPad", mode, false)
            }
            Op::Pack => self.pack(),
            Op::Gather => self.gather(),
            Op::Prelu => {
                self.arity(2..=2, 1..=1)?;
                self.layer(LayerKind::Prelu, self.name("Prelu"), &self.inputs)
            }
            Op::Reshape => self.reshape(),
            Op::ExpandDims => self.expand_dims(),
            Op::Squeeze => self.squeeze(),
            Op::ResizeBilinear => self.resize(ResizeMethod::Bilinear, "BILINEAR"),
            Op::ResizeNearestNeighbor => {
                self.resize(ResizeMethod::NearestNeighbor, "NEARESTNEIGHBOR")
            }
            Op::Slice => self.slice(),
            Op::StridedSlice => self.strided_slice(),
            Op::Split => self.split(),
            Op::SplitV => self.split_v(),
            Op::Transpose => self.transpose(),
            Op::Other(name) if options.stand_in_for_unsupported => self.stand_in(name),
            Op::Other(_) => Err(self.unsupported("no translation is known for this operator")),
        }
    }

    fn name(&self, label: &str) -> String {
        format!("{label}:{SUBGRAPH}:{}", self.index)
    }

    fn arity(&self, inputs: RangeInclusive<usize>, outputs: RangeInclusive<usize>) -> Result<()> {
        for (direction, expected, actual) in [
            ("input", inputs, self.inputs.len()),
            ("output", outputs, self.outputs.len()),
        ] {
            if !expected.contains(&actual) {
                let expected = match (*expected.start(), *expected.end()) {
                    (lo, hi) if lo == hi => lo.to_string(),
                    (lo, ANY) => format!("at least {lo}"),
                    (lo, hi) => format!("{lo} to {hi}"),
                };
                return Err(TranslationError::Arity {
                    operator: self.index,
                    op: self.op.op.to_string(),
                    direction,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn invalid(&self, tensor: usize, reason: impl std::fmt::Display) -> TranslationError {
        TranslationError::InvalidTensor {
            operator: self.index,
            tensor: tensor as i32,
            reason: reason.to_string(),
        }
    }

    fn unsupported(&self, reason: impl std::fmt::Display) -> TranslationError {
        TranslationError::UnsupportedOperator {
            operator: self.index,
            op: self.op.op.to_string(),
            reason: reason.to_string(),
        }
    }

    fn info(&self, tensor: usize) -> Result<TensorInfo> {
        self.model.tensors[tensor]
            .tensor_info()
            .map_err(|reason| self.invalid(tensor, reason))
    }

    fn dims(&self, tensor: usize) -> Result<Vec<u32>> {
        self.info(tensor)?
            .shape()
            .concrete()
            .ok_or_else(|| self.invalid(tensor, "shape is not fully specified"))
    }

    fn dims4(&self, tensor: usize) -> Result<[u32; 4]> {
        let dims = self.dims(tensor)?;
        <[u32; 4]>::try_from(dims.as_slice())
            .map_err(|_| self.invalid(tensor, format!("expected a rank 4 tensor, found {dims:?}")))
    }

    fn constant(&self, tensor: usize) -> Result<ConstTensor> {
        let data = self.model.tensors[tensor]
            .data
            .as_ref()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| self.invalid(tensor, "tensor should be constant"))?;
        ConstTensor::new(self.info(tensor)?, data.clone()).map_err(|e| self.invalid(tensor, e))
    }

    fn ints(&self, tensor: usize) -> Result<Vec<i64>> {
        self.constant(tensor)?
            .to_i64()
            .map_err(|e| self.invalid(tensor, e))
    }

    fn scalar(&self, tensor: usize) -> Result<i64> {
        match self.ints(tensor)?[..] {
            [value] => Ok(value),
            ref values => Err(self.invalid(
                tensor,
                format!("expected a single value, found {}", values.len()),
            )),
        }
    }

    fn unsigned(&self, tensor: usize, values: Vec<i64>) -> Result<Vec<u32>> {
        values
            .into_iter()
            .map(|v| {
                u32::try_from(v).map_err(|_| self.invalid(tensor, format!("{v} is not a size")))
            })
            .collect()
    }

    fn signed(&self, tensor: usize) -> Result<Vec<i32>> {
        self.ints(tensor)?
            .into_iter()
            .map(|v| {
                i32::try_from(v).map_err(|_| self.invalid(tensor, format!("{v} is out of range")))
            })
            .collect()
    }

    /// Reads a `[n, 2]` tensor of (front, back) amounts.
    fn pairs(&self, tensor: usize) -> Result<Vec<(u32, u32)>> {
        let values = self.unsigned(tensor, self.ints(tensor)?)?;
        if values.len() % 2 != 0 {
            return Err(self.invalid(tensor, "expected pairs of values"));
        }
        Ok(values.into_iter().tuples().collect())
    }

    fn axis(&self, tensor: usize, axis: i64, rank: usize) -> Result<u32> {
        let r = rank as i64;
        if axis < -r || axis >= r {
            return Err(self.invalid(
                tensor,
                format!("axis {axis} is out of range for rank {rank}"),
            ));
        }
        Ok(((axis + r) % r) as u32)
    }

    /// Sorted, deduplicated axes held by `axes`, applied to `input`.
    fn axes(&self, input: usize, axes: usize) -> Result<Vec<u32>> {
        let rank = self.dims(input)?.len();
        let unique: BTreeSet<u32> = self
            .ints(axes)?
            .into_iter()
            .map(|a| self.axis(axes, a, rank))
            .collect::<Result<_>>()?;
        Ok(unique.into_iter().collect())
    }

    /// Plan of a single layer fed by the `connected` tensors and producing every output.
    fn layer(&self, kind: LayerKind, name: String, connected: &[usize]) -> Result<OperatorPlan> {
        let infos = |tensors: &[usize]| {
            tensors
                .iter()
                .map(|t| self.info(*t))
                .collect::<Result<Vec<_>>>()
        };
        Ok(OperatorPlan {
            reshapes: Vec::new(),
            primary: PlannedLayer {
                kind,
                name,
                inputs: infos(connected)?,
                outputs: infos(&self.outputs)?,
            },
            inputs: connected.iter().map(|t| SlotSource::Tensor(*t)).collect(),
            tail: Vec::new(),
            outputs: self.outputs.clone(),
        })
    }

    /// One input, one output.
    fn single(&self, kind: LayerKind, label: &str) -> Result<OperatorPlan> {
        self.arity(1..=1, 1..=1)?;
        self.layer(kind, self.name(label), &self.inputs)
    }

    /// Appends the fused activation of the operator, if any, after the last planned layer.
    fn fused(&self, mut plan: OperatorPlan) -> Result<OperatorPlan> {
        let (function, a, b, suffix) = match self.op.options.fused_activation_function {
            FusedActivation::None => return Ok(plan),
            FusedActivation::Relu => (ActivationFunction::ReLu, 0.0, 0.0, "RELU"),
            FusedActivation::Relu6 => (ActivationFunction::BoundedReLu, 6.0, 0.0, "RELU6"),
            FusedActivation::ReluN1To1 => {
                (ActivationFunction::BoundedReLu, 1.0, -1.0, "RELU_N1_TO_1")
            }
            FusedActivation::Tanh => (ActivationFunction::TanH, 1.0, 1.0, "TANH"),
            other => return Err(self.unsupported(format!("fused activation {other:?}"))),
        };
        let last = plan.tail.last().unwrap_or(&plan.primary);
        let info = last.outputs[0].clone();
        let activation = PlannedLayer {
            kind: LayerKind::Activation(ActivationDescriptor::new(function, a, b)),
            name: format!("{}:{suffix}", last.name),
            inputs: vec![info.clone()],
            outputs: vec![info],
        };
        plan.tail.push(activation);
        Ok(plan)
    }

    fn unary(&self, operation: UnaryOperation, label: &str) -> Result<OperatorPlan> {
        self.single(
            LayerKind::ElementwiseUnary(ElementwiseUnaryDescriptor { operation }),
            label,
        )
    }

    fn activation(
        &self,
        function: ActivationFunction,
        a: f32,
        b: f32,
        label: &str,
    ) -> Result<OperatorPlan> {
        self.arity(1..=1, 1..=1)?;
        self.layer(
            LayerKind::Activation(ActivationDescriptor::new(function, a, b)),
            self.name(&format!("Activation:{label}")),
            &self.inputs,
        )
    }

    /// Binary elementwise operator. When the ranks of the operands differ, the lower rank
    /// one goes through a reshape padding its shape with leading 1s.
    fn elementwise(&self, kind: LayerKind, label: &str) -> Result<OperatorPlan> {
        self.arity(2..=2, 1..=1)?;
        let name = self.name(label);
        let operands = self
            .inputs
            .iter()
            .map(|t| self.info(*t))
            .collect::<Result<Vec<_>>>()?;
        let rank = operands.iter().map(|i| i.shape().rank()).max().unwrap_or_default();
        let mut plan = self.layer(kind, name.clone(), &self.inputs)?;
        for (slot, (tensor, info)) in self.inputs.iter().zip(operands).enumerate() {
            if info.shape().rank() == rank {
                continue;
            }
            let dims = self.dims(*tensor)?;
            let target_shape = itertools::repeat_n(1, rank - dims.len())
                .chain(dims)
                .collect_vec();
            let reshaped = info.with_shape(target_shape.clone());
            plan.inputs[slot] = SlotSource::Reshape(plan.reshapes.len());
            plan.primary.inputs[slot] = reshaped.clone();
            plan.reshapes.push((
                *tensor,
                PlannedLayer {
                    kind: LayerKind::Reshape(ReshapeDescriptor { target_shape }),
                    name: format!("Reshape:for:{name}"),
                    inputs: vec![info],
                    outputs: vec![reshaped],
                },
            ));
        }
        Ok(plan)
    }

    fn comparison(&self, operation: ComparisonOperation, label: &str) -> Result<OperatorPlan> {
        self.elementwise(
            LayerKind::Comparison(ComparisonDescriptor { operation }),
            label,
        )
    }

    fn arg_min_max(&self, function: ArgMinMaxFunction, label: &str) -> Result<OperatorPlan> {
        self.arity(2..=2, 1..=1)?;
        let axis_tensor = self.inputs[1];
        let axis = i32::try_from(self.scalar(axis_tensor)?)
            .map_err(|_| self.invalid(axis_tensor, "axis is out of range"))?;
        let output_type = self.info(self.outputs[0])?.data_type();
        if !matches!(output_type, DataType::Signed32 | DataType::Signed64) {
            return Err(self.invalid(
                self.outputs[0],
                format!("index output must be 32 or 64 bit integers, not {output_type}"),
            ));
        }
        let descriptor = ArgMinMaxDescriptor {
            function,
            axis,
            output_type,
        };
        self.layer(
            LayerKind::ArgMinMax(descriptor),
            self.name(label),
            &self.inputs[..1],
        )
    }

    fn pool(&self, pool_type: PoolingAlgorithm, label: &str) -> Result<OperatorPlan> {
        self.arity(1..=1, 1..=1)?;
        let o = &self.op.options;
        let [_, height, width, _] = self.dims4(self.inputs[0])?;
        let input = self.inputs[0];
        let (pad_top, pad_bottom) = self.padding(input, height, (o.filter_height, o.stride_h, 1))?;
        let (pad_left, pad_right) = self.padding(input, width, (o.filter_width, o.stride_w, 1))?;
        let descriptor = Pooling2dDescriptor {
            pool_type,
            pad_left,
            pad_right,
            pad_top,
            pad_bottom,
            pool_width: o.filter_width,
            pool_height: o.filter_height,
            stride_x: o.stride_w,
            stride_y: o.stride_h,
            output_shape_rounding: OutputShapeRounding::Floor,
            padding_method: PaddingMethod::Exclude,
            data_layout: DataLayout::NHWC,
        };
        self.layer(
            LayerKind::Pooling2d(descriptor),
            self.name(label),
            &self.inputs,
        )
    }

    /// Padding of one spatial dimension of `tensor`, which is `extent` wide.
    fn padding(
        &self,
        tensor: usize,
        extent: u32,
        (kernel, stride, dilation): (u32, u32, u32),
    ) -> Result<(u32, u32)> {
        let padding = self.op.options.padding;
        calc_padding(extent, kernel, stride, dilation, padding).ok_or_else(|| {
            let reason = format!("kernel {kernel} with stride {stride} and dilation {dilation}");
            self.invalid(tensor, format!("{reason} overflows"))
        })
    }

    /// Convolution descriptor for an NHWC input of `height` x `width` and a kernel of
    /// `kernel_height` x `kernel_width`.
    fn convolution_descriptor(
        &self,
        (height, width): (u32, u32),
        (kernel_height, kernel_width): (u32, u32),
    ) -> Result<Convolution2dDescriptor> {
        let o = &self.op.options;
        let input = self.inputs[0];
        let (pad_top, pad_bottom) =
            self.padding(input, height, (kernel_height, o.stride_h, o.dilation_h_factor))?;
        let (pad_left, pad_right) =
            self.padding(input, width, (kernel_width, o.stride_w, o.dilation_w_factor))?;
        Ok(Convolution2dDescriptor {
            pad_left,
            pad_right,
            pad_top,
            pad_bottom,
            stride_x: o.stride_w,
            stride_y: o.stride_h,
            dilation_x: o.dilation_w_factor,
            dilation_y: o.dilation_h_factor,
            bias_enabled: self.inputs.len() == 3,
            data_layout: DataLayout::NHWC,
        })
    }

    fn optional_constant(&self, slot: usize) -> Result<Option<ConstTensor>> {
        self.inputs
            .get(slot)
            .map(|tensor| self.constant(*tensor))
            .transpose()
    }

    fn conv2d(&self) -> Result<OperatorPlan> {
        self.arity(2..=3, 1..=1)?;
        let [_, height, width, _] = self.dims4(self.inputs[0])?;
        // [O, H, W, I]
        let [_, kernel_height, kernel_width, _] = self.dims4(self.inputs[1])?;
        let kind = LayerKind::Convolution2d {
            descriptor: self
                .convolution_descriptor((height, width), (kernel_height, kernel_width))?,
            weights: self.constant(self.inputs[1])?,
            biases: self.optional_constant(2)?,
        };
        self.layer(kind, self.name("Conv2D"), &self.inputs[..1])
    }

    fn depthwise_conv2d(&self) -> Result<OperatorPlan> {
        self.arity(2..=3, 1..=1)?;
        let [_, height, width, channels] = self.dims4(self.inputs[0])?;
        // [1, H, W, I * M]
        let weights_tensor = self.inputs[1];
        let [_, kernel_height, kernel_width, _] = self.dims4(weights_tensor)?;
        let weights = self.constant(weights_tensor)?;
        // per-channel scales run over I * M, which the permutation splits in two
        if weights.info().is_per_axis() {
            return Err(self.unsupported("per-axis quantized depthwise weights"));
        }
        let weights = depthwise_weights_to_mihw(&weights, channels)
            .map_err(|e| self.invalid(weights_tensor, e))?;
        let kind = LayerKind::DepthwiseConvolution2d {
            descriptor: self
                .convolution_descriptor((height, width), (kernel_height, kernel_width))?,
            weights,
            biases: self.optional_constant(2)?,
        };
        self.layer(kind, self.name("DepthwiseConv2D"), &self.inputs[..1])
    }

    /// Inputs are the output shape, the weights, the data and an optional bias. Only the
    /// data is connected.
    fn transpose_conv(&self) -> Result<OperatorPlan> {
        self.arity(3..=4, 1..=1)?;
        let o = &self.op.options;
        let output_shape = self.unsigned(self.inputs[0], self.ints(self.inputs[0])?)?;
        let [_, height, width, _] = self.dims4(self.inputs[2])?;
        let [_, kernel_height, kernel_width, _] = self.dims4(self.inputs[1])?;
        let data = self.inputs[2];
        let (pad_top, pad_bottom) = self.padding(data, height, (kernel_height, o.stride_h, 1))?;
        let (pad_left, pad_right) = self.padding(data, width, (kernel_width, o.stride_w, 1))?;
        let biases = self.optional_constant(3)?;
        let kind = LayerKind::TransposeConvolution2d {
            descriptor: TransposeConvolution2dDescriptor {
                pad_left,
                pad_right,
                pad_top,
                pad_bottom,
                stride_x: o.stride_w,
                stride_y: o.stride_h,
                bias_enabled: biases.is_some(),
                data_layout: DataLayout::NHWC,
                output_shape_enabled: true,
                output_shape,
            },
            weights: self.constant(self.inputs[1])?,
            biases,
        };
        self.layer(kind, self.name("TransposeConv"), &self.inputs[2..3])
    }

    /// Weights are `[units, input size]`. Inputs of rank above 2 are first flattened to
    /// `[batch, input size]`.
    fn fully_connected(&self) -> Result<OperatorPlan> {
        self.arity(2..=3, 1..=1)?;
        let weights_tensor = self.inputs[1];
        let weights = self.constant(weights_tensor)?;
        let Some([_, input_size]) = weights
            .info()
            .shape()
            .concrete()
            .and_then(|dims| <[u32; 2]>::try_from(dims).ok())
        else {
            return Err(self.invalid(
                weights_tensor,
                "fully connected weights must be 2 dimensional",
            ));
        };
        let kind = LayerKind::FullyConnected {
            descriptor: FullyConnectedDescriptor {
                bias_enabled: self.inputs.len() == 3,
                transpose_weight_matrix: true,
            },
            weights,
            biases: self.optional_constant(2)?,
        };
        let name = self.name("FullyConnected");
        let mut plan = self.layer(kind, name.clone(), &self.inputs[..1])?;

        let input = self.inputs[0];
        let info = self.info(input)?;
        if info.shape().rank() > 2 {
            let elements = info.num_elements().map_err(|e| self.invalid(input, e))?;
            if input_size == 0 || elements % input_size as usize != 0 {
                return Err(self.invalid(
                    input,
                    format!("{elements} elements cannot be split in rows of {input_size}"),
                ));
            }
            let target_shape = vec![(elements / input_size as usize) as u32, input_size];
            let reshaped = info.with_shape(target_shape.clone());
            plan.inputs[0] = SlotSource::Reshape(0);
            plan.primary.inputs[0] = reshaped.clone();
            plan.reshapes.push((
                input,
                PlannedLayer {
                    kind: LayerKind::Reshape(ReshapeDescriptor { target_shape }),
                    name: format!("Reshape:for:{name}"),
                    inputs: vec![info],
                    outputs: vec![reshaped],
                },
            ));
        }
        Ok(plan)
    }

    fn concatenation(&self) -> Result<OperatorPlan> {
        self.arity(1..=ANY, 1..=1)?;
        let output_dims = self.dims(self.outputs[0])?;
        let rank = output_dims.len();
        let concat_axis = self.axis(self.outputs[0], self.op.options.axis.into(), rank)?;
        let mut offset = 0;
        let mut view_origins = Vec::with_capacity(self.inputs.len());
        for tensor in &self.inputs {
            let dims = self.dims(*tensor)?;
            if dims.len() != rank {
                return Err(self.invalid(
                    *tensor,
                    format!("rank {} differs from the output rank {rank}", dims.len()),
                ));
            }
            let mut origin = vec![0; rank];
            origin[concat_axis as usize] = offset;
            offset += dims[concat_axis as usize];
            view_origins.push(origin);
        }
        self.layer(
            LayerKind::Concat(OriginsDescriptor {
                concat_axis,
                view_origins,
            }),
            self.name("Concatenation"),
            &self.inputs,
        )
    }

    fn space_depth(&self, to_space: bool) -> Result<OperatorPlan> {
        let block_size = self.op.options.block_size;
        if block_size == 0 {
            return Err(self.invalid(
                self.inputs.first().copied().unwrap_or_default(),
                "block size must be positive",
            ));
        }
        let descriptor = SpaceToDepthDescriptor {
            block_size,
            data_layout: DataLayout::NHWC,
        };
        if to_space {
            self.single(LayerKind::DepthToSpace(descriptor), "DepthToSpace")
        } else {
            self.single(LayerKind::SpaceToDepth(descriptor), "SpaceToDepth")
        }
    }

    fn batch_to_space(&self) -> Result<OperatorPlan> {
        self.arity(3..=3, 1..=1)?;
        let descriptor = BatchToSpaceNdDescriptor {
            block_shape: self.unsigned(self.inputs[1], self.ints(self.inputs[1])?)?,
            crops: self.pairs(self.inputs[2])?,
            data_layout: DataLayout::NHWC,
        };
        self.layer(
            LayerKind::BatchToSpaceNd(descriptor),
            self.name("BatchToSpaceND"),
            &self.inputs[..1],
        )
    }

    fn space_to_batch(&self) -> Result<OperatorPlan> {
        self.arity(3..=3, 1..=1)?;
        let descriptor = SpaceToBatchNdDescriptor {
            block_shape: self.unsigned(self.inputs[1], self.ints(self.inputs[1])?)?,
            pad_list: self.pairs(self.inputs[2])?,
            data_layout: DataLayout::NHWC,
        };
        self.layer(
            LayerKind::SpaceToBatchNd(descriptor),
            self.name("SpaceToBatchND"),
            &self.inputs[..1],
        )
    }

    fn local_response_normalization(&self) -> Result<OperatorPlan> {
        let o = &self.op.options;
        let radius = u32::try_from(o.radius).map_err(|_| {
            self.invalid(self.inputs.first().copied().unwrap_or_default(), "negative radius")
        })?;
        let descriptor = NormalizationDescriptor {
            channel_type: NormalizationAlgorithmChannel::Across,
            method_type: NormalizationAlgorithmMethod::LocalBrightness,
            // window size rather than radius
            norm_size: 1 + 2 * radius,
            alpha: o.alpha,
            beta: o.beta,
            k: o.bias,
            data_layout: DataLayout::NHWC,
        };
        self.single(LayerKind::Normalization(descriptor), "LRN")
    }

    fn mean(&self) -> Result<OperatorPlan> {
        self.arity(2..=2, 1..=1)?;
        let descriptor = MeanDescriptor {
            axis: self.axes(self.inputs[0], self.inputs[1])?,
            keep_dims: self.op.options.keep_dims,
        };
        self.layer(
            LayerKind::Mean(descriptor),
            self.name("Mean"),
            &self.inputs[..1],
        )
    }

    fn reduce(&self, operation: ReduceOperation) -> Result<OperatorPlan> {
        self.arity(2..=2, 1..=1)?;
        let descriptor = ReduceDescriptor {
            keep_dims: self.op.options.keep_dims,
            axis: self.axes(self.inputs[0], self.inputs[1])?,
            operation,
        };
        self.layer(
            LayerKind::Reduce(descriptor),
            self.name("Reduce"),
            &self.inputs[..1],
        )
    }

    /// Constant padding of quantized tensors pads with the zero point unless an explicit
    /// value is given.
    fn pad(&self, label: &str, mode: PaddingMode, with_value: bool) -> Result<OperatorPlan> {
        if with_value {
            self.arity(3..=3, 1..=1)?;
        } else {
            self.arity(2..=2, 1..=1)?;
        }
        let input = self.info(self.inputs[0])?;
        let pad_list = self.pairs(self.inputs[1])?;
        if pad_list.len() != input.shape().rank() {
            return Err(self.invalid(
                self.inputs[1],
                format!("{} pairs given for a rank {} input", pad_list.len(), input.shape().rank()),
            ));
        }
        let pad_value = if with_value {
            let value_tensor = self.inputs[2];
            first_value(&self.constant(value_tensor)?)
                .ok_or_else(|| self.invalid(value_tensor, "pad value cannot be read"))?
        } else if mode == PaddingMode::Constant && input.data_type().is_quantized() {
            input.offset() as f32
        } else {
            0.0
        };
        self.layer(
            LayerKind::Pad(PadDescriptor {
                pad_list,
                pad_value,
                mode,
            }),
            self.name(label),
            &self.inputs[..1],
        )
    }

    fn pack(&self) -> Result<OperatorPlan> {
        self.arity(1..=ANY, 1..=1)?;
        let input_shape = self.dims(self.inputs[0])?;
        if let Some(tensor) = self.inputs[1..]
            .iter()
            .find(|t| self.dims(**t).ok().as_ref() != Some(&input_shape))
        {
            return Err(self.invalid(*tensor, "packed tensors must share one shape"));
        }
        let axis = self.axis(
            self.outputs[0],
            self.op.options.axis.into(),
            input_shape.len() + 1,
        )?;
        let descriptor = StackDescriptor {
            axis,
            num_inputs: self.inputs.len() as u32,
            input_shape,
        };
        self.layer(LayerKind::Stack(descriptor), self.name("Pack"), &self.inputs)
    }

    fn gather(&self) -> Result<OperatorPlan> {
        self.arity(2..=2, 1..=1)?;
        self.layer(
            LayerKind::Gather(GatherDescriptor {
                axis: self.op.options.axis,
            }),
            self.name("Gather"),
            &self.inputs,
        )
    }

    /// The target comes from the options, then from a constant shape input, then from the
    /// output tensor.
    fn reshape(&self) -> Result<OperatorPlan> {
        self.arity(1..=2, 1..=1)?;
        let input = self.inputs[0];
        let target: Vec<i64> = match &self.op.options.new_shape {
            Some(shape) if !shape.is_empty() => shape.iter().map(|d| i64::from(*d)).collect(),
            _ if self.inputs.len() == 2 && self.model.tensors[self.inputs[1]].is_constant() => {
                self.ints(self.inputs[1])?
            }
            _ => self
                .dims(self.outputs[0])?
                .into_iter()
                .map(i64::from)
                .collect(),
        };
        let elements = self
            .info(input)?
            .num_elements()
            .map_err(|e| self.invalid(input, e))?;
        let target_shape = reshape_target(elements, &target)
            .map_err(|reason| self.invalid(self.outputs[0], reason))?;
        self.layer(
            LayerKind::Reshape(ReshapeDescriptor { target_shape }),
            self.name("Reshape"),
            &self.inputs[..1],
        )
    }

    fn expand_dims(&self) -> Result<OperatorPlan> {
        self.arity(2..=2, 1..=1)?;
        let target_shape = self.dims(self.outputs[0])?;
        let elements = self
            .info(self.inputs[0])?
            .num_elements()
            .map_err(|e| self.invalid(self.inputs[0], e))?;
        let expanded = TensorShape::new(&target_shape)
            .num_elements()
            .map_err(|e| self.invalid(self.outputs[0], e))?;
        if elements != expanded {
            return Err(self.invalid(self.outputs[0], "element count differs from the input"));
        }
        self.layer(
            LayerKind::Reshape(ReshapeDescriptor { target_shape }),
            self.name("ExpandDims"),
            &self.inputs[..1],
        )
    }

    /// Drops the listed size 1 dimensions, or all of them when none is listed.
    fn squeeze(&self) -> Result<OperatorPlan> {
        self.arity(1..=1, 1..=1)?;
        let input = self.inputs[0];
        let dims = self.dims(input)?;
        let squeezed: BTreeSet<u32> = self
            .op
            .options
            .squeeze_dims
            .iter()
            .map(|a| self.axis(input, (*a).into(), dims.len()))
            .collect::<Result<_>>()?;
        if let Some(axis) = squeezed.iter().find(|a| dims[**a as usize] != 1) {
            return Err(self.invalid(input, format!("dimension {axis} is not of size 1")));
        }
        let target_shape = dims
            .iter()
            .enumerate()
            .filter(|(i, d)| {
                if squeezed.is_empty() {
                    **d != 1
                } else {
                    !squeezed.contains(&(*i as u32))
                }
            })
            .map(|(_, d)| *d)
            .collect_vec();
        self.layer(
            LayerKind::Reshape(ReshapeDescriptor { target_shape }),
            self.name("Squeeze"),
            &self.inputs,
        )
    }

    fn resize(&self, method: ResizeMethod, label: &str) -> Result<OperatorPlan> {
        self.arity(2..=2, 1..=1)?;
        let size_tensor = self.inputs[1];
        let [target_height, target_width] = self.unsigned(size_tensor, self.ints(size_tensor)?)?[..]
        else {
            return Err(self.invalid(size_tensor, "expected a [height, width] size"));
        };
        let o = &self.op.options;
        let descriptor = ResizeDescriptor {
            target_width,
            target_height,
            method,
            data_layout: DataLayout::NHWC,
            align_corners: o.align_corners,
            half_pixel_centers: o.half_pixel_centers,
        };
        self.layer(
            LayerKind::Resize(descriptor),
            self.name(&format!("Resize:{label}")),
            &self.inputs[..1],
        )
    }

    /// A size of -1 extends the slice to the end of its dimension.
    fn slice(&self) -> Result<OperatorPlan> {
        self.arity(3..=3, 1..=1)?;
        let (input, begin_tensor, size_tensor) = (self.inputs[0], self.inputs[1], self.inputs[2]);
        let dims = self.dims(input)?;
        let begin = self.unsigned(begin_tensor, self.ints(begin_tensor)?)?;
        let sizes = self.ints(size_tensor)?;
        if begin.len() != dims.len() || sizes.len() != dims.len() {
            return Err(self.invalid(input, "begin and size must cover every dimension"));
        }
        let size = sizes
            .iter()
            .zip(&begin)
            .zip(&dims)
            .map(|((s, b), d)| match s {
                -1 => Ok(d.saturating_sub(*b)),
                s => u32::try_from(*s)
                    .map_err(|_| self.invalid(size_tensor, format!("{s} is not a size"))),
            })
            .collect::<Result<Vec<_>>>()?;
        self.layer(
            LayerKind::Slice(SliceDescriptor { begin, size }),
            self.name("Slice"),
            &self.inputs[..1],
        )
    }

    fn strided_slice(&self) -> Result<OperatorPlan> {
        self.arity(4..=4, 1..=1)?;
        let o = &self.op.options;
        let descriptor = StridedSliceDescriptor {
            begin: self.signed(self.inputs[1])?,
            end: self.signed(self.inputs[2])?,
            stride: self.signed(self.inputs[3])?,
            begin_mask: o.begin_mask,
            end_mask: o.end_mask,
            shrink_axis_mask: o.shrink_axis_mask,
            ellipsis_mask: o.ellipsis_mask,
            new_axis_mask: o.new_axis_mask,
            data_layout: DataLayout::NHWC,
        };
        self.layer(
            LayerKind::StridedSlice(descriptor),
            self.name("StridedSlice"),
            &self.inputs[..1],
        )
    }

    /// Inputs are the axis and the data, split in `num_splits` equal views.
    fn split(&self) -> Result<OperatorPlan> {
        let count = self.op.options.num_splits as usize;
        self.arity(2..=2, count..=count)?;
        let (axis_tensor, input) = (self.inputs[0], self.inputs[1]);
        if count == 0 {
            return Err(self.invalid(input, "split count must be positive"));
        }
        let dims = self.dims(input)?;
        let axis = self.axis(axis_tensor, self.scalar(axis_tensor)?, dims.len())? as usize;
        if dims[axis] % count as u32 != 0 {
            return Err(self.invalid(
                input,
                format!("dimension {axis} of size {} does not split in {count}", dims[axis]),
            ));
        }
        let sizes = vec![dims[axis] / count as u32; count];
        self.views(input, &dims, axis, &sizes, "Split")
    }

    /// Inputs are the data, the view sizes, one of which may be -1, and the axis.
    fn split_v(&self) -> Result<OperatorPlan> {
        let count = self.op.options.num_splits as usize;
        self.arity(3..=3, count..=count)?;
        let (input, sizes_tensor, axis_tensor) = (self.inputs[0], self.inputs[1], self.inputs[2]);
        let dims = self.dims(input)?;
        let axis = self.axis(axis_tensor, self.scalar(axis_tensor)?, dims.len())? as usize;
        let mut sizes = self.ints(sizes_tensor)?;
        if sizes.len() != count {
            return Err(self.invalid(
                sizes_tensor,
                format!("{} sizes given for {count} views", sizes.len()),
            ));
        }
        let stretch = sizes.iter().positions(|s| *s == -1).collect_vec();
        if stretch.len() > 1 || sizes.iter().any(|s| *s < -1) {
            return Err(self.invalid(sizes_tensor, "at most one size may be -1"));
        }
        if let Some(&i) = stretch.first() {
            let known: i64 = sizes.iter().filter(|s| **s >= 0).sum();
            sizes[i] = i64::from(dims[axis]) - known;
        }
        if sizes.iter().sum::<i64>() != i64::from(dims[axis]) {
            return Err(self.invalid(
                sizes_tensor,
                format!("sizes {sizes:?} do not add up to {}", dims[axis]),
            ));
        }
        let sizes = self.unsigned(sizes_tensor, sizes)?;
        self.views(input, &dims, axis, &sizes, "SplitV")
    }

    fn views(
        &self,
        input: usize,
        dims: &[u32],
        axis: usize,
        sizes: &[u32],
        label: &str,
    ) -> Result<OperatorPlan> {
        let mut offset = 0;
        let mut descriptor = ViewsDescriptor::default();
        for size in sizes {
            let mut origin = vec![0; dims.len()];
            origin[axis] = offset;
            let mut view = dims.to_vec();
            view[axis] = *size;
            descriptor.origins.push(origin);
            descriptor.sizes.push(view);
            offset += size;
        }
        self.layer(LayerKind::Splitter(descriptor), self.name(label), &[input])
    }

    /// Without a permutation input the dimensions are reversed.
    fn transpose(&self) -> Result<OperatorPlan> {
        self.arity(1..=2, 1..=1)?;
        let input = self.inputs[0];
        let mappings = match self.inputs.get(1) {
            Some(perm) => self.unsigned(*perm, self.ints(*perm)?)?,
            None => (0..self.dims(input)?.len() as u32).rev().collect(),
        };
        let mappings = PermutationVector::new(mappings).map_err(|e| {
            self.invalid(self.inputs.get(1).copied().unwrap_or(input), e)
        })?;
        self.layer(
            LayerKind::Transpose(TransposeDescriptor { mappings }),
            self.name("Transpose"),
            &self.inputs[..1],
        )
    }

    fn stand_in(&self, op: &str) -> Result<OperatorPlan> {
        let descriptor = StandInDescriptor {
            num_inputs: self.inputs.len() as u32,
            num_outputs: self.outputs.len() as u32,
        };
        self.layer(
            LayerKind::StandIn(descriptor),
            format!("StandIn:{SUBGRAPH}:{}:{op}", self.index),
            &self.inputs,
        )
    }
}

/// First value of a scalar constant, dequantized when needed.
fn first_value(tensor: &ConstTensor) -> Option<f32> {
    let info = tensor.info();
    let dequantize = |q: i32| (q - info.offset()) as f32 * info.scale();
    match tensor.data_type() {
        DataType::Float32 | DataType::Float16 | DataType::BFloat16 => {
            tensor.to_f32().ok()?.first().copied()
        }
        DataType::Signed32 | DataType::Signed64 => {
            tensor.to_i64().ok()?.first().map(|v| *v as f32)
        }
        DataType::QAsymmU8 => tensor.data().first().map(|v| dequantize(i32::from(*v))),
        DataType::QAsymmS8 | DataType::QSymmS8 => {
            tensor.data().first().map(|v| dequantize(i32::from(*v as i8)))
        }
        DataType::QSymmS16 | DataType::Boolean => None,
    }
}
