use std::{collections::BTreeMap, io::Cursor};

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::{debug, info, warn};

use super::{
    format::{
        FeatureVersions, LayerTag, WireEnum, FEATURE_BINDING_IDS_SCHEME,
        FEATURE_CONSTANT_TENSORS_AS_INPUTS, FEATURE_WEIGHTS_LAYOUT_SCHEME, FORMAT_VERSION, MAGIC,
        NO_AXIS,
    },
    SerializationError,
};
use crate::{
    graph::{
        ActivationDescriptor, ArgMinMaxDescriptor, BatchNormalizationDescriptor,
        BatchToSpaceNdDescriptor, BindingId, ComparisonDescriptor, Convolution2dDescriptor,
        DataLayout, ElementwiseUnaryDescriptor, FillDescriptor, FullyConnectedDescriptor,
        GatherDescriptor, Graph, GraphError, InputSlotRef, InstanceNormalizationDescriptor,
        L2NormalizationDescriptor, LayerId, LayerKind, LogicalBinaryDescriptor, MeanDescriptor,
        NormalizationDescriptor, OriginsDescriptor, OutputSlotRef, PadDescriptor,
        PermuteDescriptor, Pooling2dDescriptor, ReduceDescriptor, ReshapeDescriptor,
        ResizeDescriptor, SliceDescriptor, SoftmaxDescriptor, SpaceToBatchNdDescriptor,
        SpaceToDepthDescriptor, StackDescriptor, StandInDescriptor, StridedSliceDescriptor,
        TransposeConvolution2dDescriptor, TransposeDescriptor, ViewsDescriptor,
    },
    tensor::{
        depthwise_weights_to_mihw, ConstTensor, DataType, PermutationVector, TensorInfo,
        TensorShape,
    },
};

type Result<T> = std::result::Result<T, SerializationError>;

/// Rebuilds a graph from a container produced by [`super::serialize`].
///
/// Any defect of the buffer aborts the read; the returned graph is always complete.
pub fn deserialize(buffer: &[u8]) -> Result<Graph> {
    let mut reader = GraphReader {
        bytes: ByteReader::new(buffer),
        features: FeatureVersions::LEGACY,
        ids: BTreeMap::new(),
        graph: Graph::new(),
    };
    reader.read_header()?;
    reader.read_features()?;
    reader.read_layers()?;
    reader.read_boundaries()?;
    if reader.bytes.remaining() > 0 {
        return Err(reader
            .bytes
            .format_error(format!("{} trailing bytes", reader.bytes.remaining())));
    }
    let offset = reader.bytes.offset();
    reader
        .graph
        .validate()
        .map_err(|e| graph_format_error(offset, e))?;
    info!("deserialized {} layers", reader.graph.num_layers());
    Ok(reader.graph)
}

fn graph_format_error(offset: u64, error: GraphError) -> SerializationError {
    SerializationError::Format {
        offset,
        reason: error.to_string(),
    }
}

struct GraphReader<'a> {
    bytes: ByteReader<'a>,
    features: FeatureVersions,
    /// Serialization-local id to the layer rebuilt from that record.
    ids: BTreeMap<u32, LayerId>,
    graph: Graph,
}

impl GraphReader<'_> {
    fn read_header(&mut self) -> Result<()> {
        let magic = self.bytes.bytes(MAGIC.len())?;
        if magic != MAGIC {
            return Err(SerializationError::Format {
                offset: 0,
                reason: format!("bad magic {magic:?}"),
            });
        }
        let offset = self.bytes.offset();
        let version = self.bytes.u32()?;
        if version != FORMAT_VERSION {
            return Err(SerializationError::UnsupportedVersion {
                offset,
                what: format!("format version {version}"),
            });
        }
        Ok(())
    }

    /// Features missing from the table keep their legacy version.
    fn read_features(&mut self) -> Result<()> {
        let count = self.bytes.len(6)?;
        let mut seen = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = self.bytes.offset();
            let feature = self.bytes.u16()?;
            let version = self.bytes.u32()?;
            if seen.contains(&feature) {
                return Err(SerializationError::Format {
                    offset,
                    reason: format!("feature {feature} listed twice"),
                });
            }
            seen.push(feature);
            let (slot, newest) = match feature {
                FEATURE_BINDING_IDS_SCHEME => (
                    &mut self.features.binding_ids_scheme,
                    FeatureVersions::CURRENT.binding_ids_scheme,
                ),
                FEATURE_WEIGHTS_LAYOUT_SCHEME => (
                    &mut self.features.weights_layout_scheme,
                    FeatureVersions::CURRENT.weights_layout_scheme,
                ),
                FEATURE_CONSTANT_TENSORS_AS_INPUTS => (
                    &mut self.features.constant_tensors_as_inputs,
                    FeatureVersions::CURRENT.constant_tensors_as_inputs,
                ),
                _ if version == 0 => {
                    warn!("ignoring unknown feature {feature} at version 0");
                    continue;
                }
                _ => {
                    return Err(SerializationError::UnsupportedVersion {
                        offset,
                        what: format!("feature {feature} version {version}"),
                    });
                }
            };
            if version > newest {
                return Err(SerializationError::UnsupportedVersion {
                    offset,
                    what: format!("feature {feature} version {version}"),
                });
            }
            *slot = version;
        }
        debug!("container features {:?}", self.features);
        Ok(())
    }

    fn read_layers(&mut self) -> Result<()> {
        // a record holds at least its tag, id and three lengths
        let count = self.bytes.len(18)?;
        for _ in 0..count {
            self.read_layer()?;
        }
        Ok(())
    }

    fn read_layer(&mut self) -> Result<()> {
        let record_offset = self.bytes.offset();
        let raw_tag = self.bytes.u16()?;
        let tag = LayerTag::from_u16(raw_tag).ok_or_else(|| {
            SerializationError::UnsupportedVersion {
                offset: record_offset,
                what: format!("layer kind tag {raw_tag}"),
            }
        })?;
        let id_offset = self.bytes.offset();
        let serial_id = self.bytes.u32()?;
        if self.ids.contains_key(&serial_id) {
            return Err(SerializationError::Format {
                offset: id_offset,
                reason: format!("layer id {serial_id} defined twice"),
            });
        }
        let name = self.bytes.string()?;

        let num_inputs = self.bytes.len(12)?;
        let mut inputs = Vec::with_capacity(num_inputs);
        for expected in 0..num_inputs {
            let offset = self.bytes.offset();
            let index = self.bytes.u32()?;
            let producer_id = self.bytes.u32()?;
            let producer_slot = self.bytes.u32()?;
            if index as usize != expected {
                return Err(SerializationError::Format {
                    offset,
                    reason: format!("input slot {index} listed at position {expected}"),
                });
            }
            let producer = self.ids.get(&producer_id).copied().ok_or(
                SerializationError::DanglingReference {
                    offset,
                    producer: producer_id,
                },
            )?;
            inputs.push(OutputSlotRef::new(producer, producer_slot as usize));
        }

        let num_outputs = self.bytes.len(5)?;
        let mut outputs = Vec::with_capacity(num_outputs);
        for expected in 0..num_outputs {
            let offset = self.bytes.offset();
            let index = self.bytes.u32()?;
            if index as usize != expected {
                return Err(SerializationError::Format {
                    offset,
                    reason: format!("output slot {index} listed at position {expected}"),
                });
            }
            outputs.push(self.bytes.tensor_info()?);
        }

        let body_len = self.bytes.len(1)?;
        let body_end = self.bytes.offset() + body_len as u64;
        let first_input = inputs
            .first()
            .and_then(|producer| self.graph.tensor_info(*producer))
            .cloned();
        let kind = self.read_body(tag, first_input.as_ref())?;
        if self.bytes.offset() != body_end {
            return Err(SerializationError::Format {
                offset: body_end,
                reason: format!(
                    "{} body of layer {serial_id} ends at byte {}",
                    kind.name(),
                    self.bytes.offset()
                ),
            });
        }
        if kind.num_inputs() != inputs.len() || kind.num_outputs() != outputs.len() {
            return Err(SerializationError::Format {
                offset: record_offset,
                reason: format!(
                    "{} layer {serial_id} has {} inputs and {} outputs, expected {} and {}",
                    kind.name(),
                    inputs.len(),
                    outputs.len(),
                    kind.num_inputs(),
                    kind.num_outputs()
                ),
            });
        }

        let as_format = |e| graph_format_error(record_offset, e);
        let id = self.graph.add_layer(kind, name).map_err(as_format)?;
        for (index, producer) in inputs.into_iter().enumerate() {
            self.graph
                .connect(producer, InputSlotRef::new(id, index))
                .map_err(as_format)?;
        }
        for (index, info) in outputs.into_iter().enumerate() {
            self.graph
                .set_tensor_info(OutputSlotRef::new(id, index), info)
                .map_err(as_format)?;
        }
        debug!("read {} as layer id {serial_id}", self.graph[id]);
        self.ids.insert(serial_id, id);
        Ok(())
    }

    fn read_body(&mut self, tag: LayerTag, first_input: Option<&TensorInfo>) -> Result<LayerKind> {
        let b = &mut self.bytes;
        let kind = match tag {
            LayerTag::Input => LayerKind::Input {
                binding_id: b.i32()?,
            },
            LayerTag::Output => LayerKind::Output {
                binding_id: b.i32()?,
            },
            LayerTag::Activation => LayerKind::Activation(ActivationDescriptor {
                function: b.wire_enum()?,
                a: b.f32()?,
                b: b.f32()?,
            }),
            LayerTag::Addition => LayerKind::Addition,
            LayerTag::ArgMinMax => LayerKind::ArgMinMax(ArgMinMaxDescriptor {
                function: b.wire_enum()?,
                axis: b.i32()?,
                output_type: b.wire_enum()?,
            }),
            LayerTag::BatchNormalization => LayerKind::BatchNormalization {
                descriptor: BatchNormalizationDescriptor {
                    eps: b.f32()?,
                    data_layout: b.wire_enum()?,
                },
                mean: b.const_tensor()?,
                variance: b.const_tensor()?,
                beta: b.const_tensor()?,
                gamma: b.const_tensor()?,
            },
            LayerTag::BatchToSpaceNd => LayerKind::BatchToSpaceNd(BatchToSpaceNdDescriptor {
                block_shape: b.u32s()?,
                crops: b.pairs()?,
                data_layout: b.wire_enum()?,
            }),
            LayerTag::Cast => LayerKind::Cast,
            LayerTag::Comparison => LayerKind::Comparison(ComparisonDescriptor {
                operation: b.wire_enum()?,
            }),
            LayerTag::Concat => {
                let concat_axis = b.u32()?;
                let views = b.len(4)?;
                let view_origins = (0..views).map(|_| b.u32s()).collect::<Result<_>>()?;
                LayerKind::Concat(OriginsDescriptor {
                    concat_axis,
                    view_origins,
                })
            }
            LayerTag::Constant => LayerKind::Constant(b.const_tensor()?),
            LayerTag::Convolution2d => LayerKind::Convolution2d {
                descriptor: b.conv_descriptor()?,
                weights: b.const_tensor()?,
                biases: b.optional_const_tensor()?,
            },
            LayerTag::DepthToSpace => LayerKind::DepthToSpace(SpaceToDepthDescriptor {
                block_size: b.u32()?,
                data_layout: b.wire_enum()?,
            }),
            LayerTag::DepthwiseConvolution2d => {
                let descriptor = b.conv_descriptor()?;
                let weights_offset = b.offset();
                let mut weights = b.const_tensor()?;
                if self.features.weights_layout_scheme == 0 {
                    weights = legacy_depthwise_weights(
                        weights,
                        &descriptor,
                        first_input,
                        weights_offset,
                    )?;
                }
                LayerKind::DepthwiseConvolution2d {
                    descriptor,
                    weights,
                    biases: b.optional_const_tensor()?,
                }
            }
            LayerTag::Dequantize => LayerKind::Dequantize,
            LayerTag::Division => LayerKind::Division,
            LayerTag::ElementwiseUnary => {
                LayerKind::ElementwiseUnary(ElementwiseUnaryDescriptor {
                    operation: b.wire_enum()?,
                })
            }
            LayerTag::Fill => LayerKind::Fill(FillDescriptor { value: b.f32()? }),
            LayerTag::Floor => LayerKind::Floor,
            LayerTag::FullyConnected => LayerKind::FullyConnected {
                descriptor: FullyConnectedDescriptor {
                    bias_enabled: b.bool()?,
                    transpose_weight_matrix: b.bool()?,
                },
                weights: b.const_tensor()?,
                biases: b.optional_const_tensor()?,
            },
            LayerTag::Gather => LayerKind::Gather(GatherDescriptor { axis: b.i32()? }),
            LayerTag::InstanceNormalization => {
                LayerKind::InstanceNormalization(InstanceNormalizationDescriptor {
                    gamma: b.f32()?,
                    beta: b.f32()?,
                    eps: b.f32()?,
                    data_layout: b.wire_enum()?,
                })
            }
            LayerTag::L2Normalization => LayerKind::L2Normalization(L2NormalizationDescriptor {
                eps: b.f32()?,
                data_layout: b.wire_enum()?,
            }),
            LayerTag::LogicalBinary => LayerKind::LogicalBinary(LogicalBinaryDescriptor {
                operation: b.wire_enum()?,
            }),
            LayerTag::LogSoftmax => LayerKind::LogSoftmax(b.softmax_descriptor()?),
            LayerTag::Maximum => LayerKind::Maximum,
            LayerTag::Mean => LayerKind::Mean(MeanDescriptor {
                axis: b.u32s()?,
                keep_dims: b.bool()?,
            }),
            LayerTag::Minimum => LayerKind::Minimum,
            LayerTag::Multiplication => LayerKind::Multiplication,
            LayerTag::Normalization => LayerKind::Normalization(NormalizationDescriptor {
                channel_type: b.wire_enum()?,
                method_type: b.wire_enum()?,
                norm_size: b.u32()?,
                alpha: b.f32()?,
                beta: b.f32()?,
                k: b.f32()?,
                data_layout: b.wire_enum()?,
            }),
            LayerTag::Pad => LayerKind::Pad(PadDescriptor {
                pad_list: b.pairs()?,
                pad_value: b.f32()?,
                mode: b.wire_enum()?,
            }),
            LayerTag::Permute => LayerKind::Permute(PermuteDescriptor {
                mappings: b.permutation()?,
            }),
            LayerTag::Pooling2d => LayerKind::Pooling2d(Pooling2dDescriptor {
                pool_type: b.wire_enum()?,
                pad_left: b.u32()?,
                pad_right: b.u32()?,
                pad_top: b.u32()?,
                pad_bottom: b.u32()?,
                pool_width: b.u32()?,
                pool_height: b.u32()?,
                stride_x: b.u32()?,
                stride_y: b.u32()?,
                output_shape_rounding: b.wire_enum()?,
                padding_method: b.wire_enum()?,
                data_layout: b.wire_enum()?,
            }),
            LayerTag::Prelu => LayerKind::Prelu,
            LayerTag::Quantize => LayerKind::Quantize,
            LayerTag::Rank => LayerKind::Rank,
            LayerTag::Reduce => LayerKind::Reduce(ReduceDescriptor {
                keep_dims: b.bool()?,
                axis: b.u32s()?,
                operation: b.wire_enum()?,
            }),
            LayerTag::Reshape => LayerKind::Reshape(ReshapeDescriptor {
                target_shape: b.u32s()?,
            }),
            LayerTag::Resize => LayerKind::Resize(ResizeDescriptor {
                target_width: b.u32()?,
                target_height: b.u32()?,
                method: b.wire_enum()?,
                data_layout: b.wire_enum()?,
                align_corners: b.bool()?,
                half_pixel_centers: b.bool()?,
            }),
            LayerTag::Slice => LayerKind::Slice(SliceDescriptor {
                begin: b.u32s()?,
                size: b.u32s()?,
            }),
            LayerTag::Softmax => LayerKind::Softmax(b.softmax_descriptor()?),
            LayerTag::SpaceToBatchNd => LayerKind::SpaceToBatchNd(SpaceToBatchNdDescriptor {
                block_shape: b.u32s()?,
                pad_list: b.pairs()?,
                data_layout: b.wire_enum()?,
            }),
            LayerTag::SpaceToDepth => LayerKind::SpaceToDepth(SpaceToDepthDescriptor {
                block_size: b.u32()?,
                data_layout: b.wire_enum()?,
            }),
            LayerTag::Splitter => {
                let views = b.len(8)?;
                let mut origins = Vec::with_capacity(views);
                let mut sizes = Vec::with_capacity(views);
                for _ in 0..views {
                    origins.push(b.u32s()?);
                    sizes.push(b.u32s()?);
                }
                LayerKind::Splitter(ViewsDescriptor { origins, sizes })
            }
            LayerTag::Stack => LayerKind::Stack(StackDescriptor {
                axis: b.u32()?,
                num_inputs: b.u32()?,
                input_shape: b.u32s()?,
            }),
            LayerTag::StandIn => LayerKind::StandIn(StandInDescriptor {
                num_inputs: b.u32()?,
                num_outputs: b.u32()?,
            }),
            LayerTag::StridedSlice => LayerKind::StridedSlice(StridedSliceDescriptor {
                begin: b.i32s()?,
                end: b.i32s()?,
                stride: b.i32s()?,
                begin_mask: b.i32()?,
                end_mask: b.i32()?,
                shrink_axis_mask: b.i32()?,
                ellipsis_mask: b.i32()?,
                new_axis_mask: b.i32()?,
                data_layout: b.wire_enum()?,
            }),
            LayerTag::Subtraction => LayerKind::Subtraction,
            LayerTag::Transpose => LayerKind::Transpose(TransposeDescriptor {
                mappings: b.permutation()?,
            }),
            LayerTag::TransposeConvolution2d => LayerKind::TransposeConvolution2d {
                descriptor: TransposeConvolution2dDescriptor {
                    pad_left: b.u32()?,
                    pad_right: b.u32()?,
                    pad_top: b.u32()?,
                    pad_bottom: b.u32()?,
                    stride_x: b.u32()?,
                    stride_y: b.u32()?,
                    bias_enabled: b.bool()?,
                    data_layout: b.wire_enum()?,
                    output_shape_enabled: b.bool()?,
                    output_shape: b.u32s()?,
                },
                weights: b.const_tensor()?,
                biases: b.optional_const_tensor()?,
            },
        };
        Ok(kind)
    }

    fn read_boundaries(&mut self) -> Result<()> {
        let offset = self.bytes.offset();
        let inputs = self.bytes.i32s()?;
        let inputs = self.boundary_bindings(&inputs, offset)?;
        self.graph
            .reorder_inputs(&inputs)
            .map_err(|e| graph_format_error(offset, e))?;

        let offset = self.bytes.offset();
        let outputs = self.bytes.i32s()?;
        let outputs = self.boundary_bindings(&outputs, offset)?;
        self.graph
            .reorder_outputs(&outputs)
            .map_err(|e| graph_format_error(offset, e))?;
        Ok(())
    }

    /// Turns the ids of a boundary list into binding ids.
    fn boundary_bindings(&self, ids: &[i32], offset: u64) -> Result<Vec<BindingId>> {
        if self.features.binding_ids_scheme != 0 {
            return Ok(ids.to_vec());
        }
        ids.iter()
            .map(|id| {
                u32::try_from(*id)
                    .ok()
                    .and_then(|id| self.ids.get(&id))
                    .and_then(|layer| self.graph[*layer].kind().binding_id())
                    .ok_or_else(|| SerializationError::Format {
                        offset,
                        reason: format!("layer {id} is not a boundary layer"),
                    })
            })
            .collect()
    }
}

/// Converts depthwise weights stored as `[1, H, W, I * M]` to `[M, I, H, W]`, reading `I`
/// off the layer's input.
fn legacy_depthwise_weights(
    weights: ConstTensor,
    descriptor: &Convolution2dDescriptor,
    input: Option<&TensorInfo>,
    offset: u64,
) -> Result<ConstTensor> {
    let channel_dim = match descriptor.data_layout {
        DataLayout::NHWC => 3,
        DataLayout::NCHW => 1,
    };
    let channels = input
        .and_then(|info| info.shape().dim(channel_dim))
        .ok_or_else(|| SerializationError::Format {
            offset,
            reason: "depthwise input channels are unknown".to_string(),
        })?;
    depthwise_weights_to_mihw(&weights, channels).map_err(|e| SerializationError::Format {
        offset,
        reason: e.to_string(),
    })
}

/// Little-endian cursor reporting failures at the offset they happen.
struct ByteReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ByteReader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(buffer),
        }
    }

    fn offset(&self) -> u64 {
        self.cursor.position()
    }

    fn remaining(&self) -> usize {
        self.cursor
            .get_ref()
            .len()
            .saturating_sub(self.cursor.position() as usize)
    }

    fn format_error(&self, reason: impl Into<String>) -> SerializationError {
        SerializationError::Format {
            offset: self.offset(),
            reason: reason.into(),
        }
    }

    fn read<T>(
        &mut self,
        f: impl FnOnce(&mut Cursor<&'a [u8]>) -> std::io::Result<T>,
    ) -> Result<T> {
        let offset = self.offset();
        f(&mut self.cursor).map_err(|_| SerializationError::Format {
            offset,
            reason: "unexpected end of buffer".to_string(),
        })
    }

    fn u8(&mut self) -> Result<u8> {
        self.read(|c| c.read_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.read(|c| c.read_u16::<LittleEndian>())
    }

    fn u32(&mut self) -> Result<u32> {
        self.read(|c| c.read_u32::<LittleEndian>())
    }

    fn i32(&mut self) -> Result<i32> {
        self.read(|c| c.read_i32::<LittleEndian>())
    }

    fn f32(&mut self) -> Result<f32> {
        self.read(|c| c.read_f32::<LittleEndian>())
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SerializationError::Format {
                offset: self.offset() - 1,
                reason: format!("{other} is not a boolean"),
            }),
        }
    }

    fn bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(|c| std::io::Read::read_exact(c, &mut out))?;
        Ok(out)
    }

    /// Reads a length prefix, checking the buffer can hold that many items of at least
    /// `item_size` bytes.
    fn len(&mut self, item_size: usize) -> Result<usize> {
        let offset = self.offset();
        let len = self.u32()? as usize;
        if len.saturating_mul(item_size) > self.remaining() {
            return Err(SerializationError::Format {
                offset,
                reason: format!("length {len} overruns the buffer"),
            });
        }
        Ok(len)
    }

    fn string(&mut self) -> Result<String> {
        let offset = self.offset();
        let len = self.len(1)?;
        String::from_utf8(self.bytes(len)?).map_err(|e| SerializationError::Format {
            offset,
            reason: e.to_string(),
        })
    }

    fn wire_enum<E: WireEnum>(&mut self) -> Result<E> {
        let tag = self.u8()?;
        E::from_tag(tag).ok_or_else(|| SerializationError::Format {
            offset: self.offset() - 1,
            reason: format!("{tag} is not a valid {}", E::NAME),
        })
    }

    fn u32s(&mut self) -> Result<Vec<u32>> {
        let len = self.len(4)?;
        (0..len).map(|_| self.u32()).collect()
    }

    fn i32s(&mut self) -> Result<Vec<i32>> {
        let len = self.len(4)?;
        (0..len).map(|_| self.i32()).collect()
    }

    fn pairs(&mut self) -> Result<Vec<(u32, u32)>> {
        let len = self.len(8)?;
        (0..len)
            .map(|_| Ok::<_, SerializationError>((self.u32()?, self.u32()?)))
            .collect()
    }

    fn permutation(&mut self) -> Result<PermutationVector> {
        let offset = self.offset();
        PermutationVector::new(self.u32s()?).map_err(|e| SerializationError::Format {
            offset,
            reason: e.to_string(),
        })
    }

    fn conv_descriptor(&mut self) -> Result<Convolution2dDescriptor> {
        Ok(Convolution2dDescriptor {
            pad_left: self.u32()?,
            pad_right: self.u32()?,
            pad_top: self.u32()?,
            pad_bottom: self.u32()?,
            stride_x: self.u32()?,
            stride_y: self.u32()?,
            dilation_x: self.u32()?,
            dilation_y: self.u32()?,
            bias_enabled: self.bool()?,
            data_layout: self.wire_enum()?,
        })
    }

    fn softmax_descriptor(&mut self) -> Result<SoftmaxDescriptor> {
        Ok(SoftmaxDescriptor {
            beta: self.f32()?,
            axis: self.i32()?,
        })
    }

    fn tensor_info(&mut self) -> Result<TensorInfo> {
        let offset = self.offset();
        let data_type: DataType = self.wire_enum()?;
        let rank = self.len(5)?;
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            let specified = self.bool()?;
            let size = self.u32()?;
            dims.push(specified.then_some(size));
        }
        let num_scales = self.len(4)?;
        let scales = (0..num_scales)
            .map(|_| self.f32())
            .collect::<Result<Vec<_>>>()?;
        let quantization_offset = self.i32()?;
        let axis = self.u32()?;
        let is_constant = self.bool()?;

        let info = TensorInfo::new(TensorShape::with_unspecified(dims), data_type);
        let format_error = |reason: String| SerializationError::Format { offset, reason };
        let info = match (scales.len(), axis) {
            (0, _) => return Err(format_error("tensor without quantization scale".to_string())),
            (1, NO_AXIS) => info.with_quantization(scales[0], quantization_offset),
            (1, axis) => {
                return Err(format_error(format!(
                    "single scale with quantization axis {axis} is ambiguous"
                )));
            }
            (n, NO_AXIS) => {
                return Err(format_error(format!("{n} scales without a quantization axis")));
            }
            (_, axis) => info
                .with_per_axis_quantization(scales, quantization_offset, axis)
                .map_err(|e| format_error(e.to_string()))?,
        };
        Ok(info.with_constant(is_constant))
    }

    fn const_tensor(&mut self) -> Result<ConstTensor> {
        let info = self.tensor_info()?;
        let offset = self.offset();
        let width = self.u8()?;
        let data_type = info.data_type();
        if width as usize != data_type.size_in_bytes() {
            return Err(SerializationError::CellWidthMismatch {
                offset,
                data_type,
                width,
            });
        }
        let count = self.len(width as usize)?;
        let data = self.bytes(count * width as usize)?;
        ConstTensor::new(info, data).map_err(|e| SerializationError::Format {
            offset,
            reason: e.to_string(),
        })
    }

    fn optional_const_tensor(&mut self) -> Result<Option<ConstTensor>> {
        if self.bool()? {
            Ok(Some(self.const_tensor()?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::writer::write_tensor_info;

    fn tensor_info_bytes(scales: &[f32], axis: u32) -> Vec<u8> {
        let mut out = vec![DataType::QSymmS8.tag()];
        out.extend_from_slice(&2u32.to_le_bytes());
        for dim in [3u32, 2] {
            out.push(1);
            out.extend_from_slice(&dim.to_le_bytes());
        }
        out.extend_from_slice(&(scales.len() as u32).to_le_bytes());
        for scale in scales {
            out.extend_from_slice(&scale.to_le_bytes());
        }
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&axis.to_le_bytes());
        out.push(0);
        out
    }

    #[test]
    fn test_per_axis_quantization_is_read() {
        let bytes = tensor_info_bytes(&[0.1, 0.2, 0.3], 0);
        let info = ByteReader::new(&bytes).tensor_info().unwrap();
        assert_eq!(info.quantization().scales(), &[0.1, 0.2, 0.3]);
        assert_eq!(info.quantization().axis(), Some(0));

        let mut written = Vec::new();
        write_tensor_info(&mut written, &info).unwrap();
        assert_eq!(written, bytes);
    }

    #[test]
    fn test_single_scale_with_axis_is_ambiguous() {
        let bytes = tensor_info_bytes(&[0.1], 0);
        match ByteReader::new(&bytes).tensor_info() {
            Err(SerializationError::Format { offset: 0, reason }) => {
                assert!(reason.contains("ambiguous"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_scales_without_axis_are_rejected() {
        let bytes = tensor_info_bytes(&[0.1, 0.2, 0.3], NO_AXIS);
        assert!(ByteReader::new(&bytes).tensor_info().is_err());
        let bytes = tensor_info_bytes(&[], NO_AXIS);
        assert!(ByteReader::new(&bytes).tensor_info().is_err());
    }

    #[test]
    fn test_constant_with_overflowing_shape_is_malformed() {
        let mut bytes = vec![DataType::Float32.tag()];
        bytes.extend_from_slice(&4u32.to_le_bytes());
        for _ in 0..4 {
            bytes.push(1);
            bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        }
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1f32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&NO_AXIS.to_le_bytes());
        bytes.push(1);
        bytes.push(4);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        match ByteReader::new(&bytes).const_tensor() {
            Err(SerializationError::Format { reason, .. }) => {
                assert!(reason.contains("overflows"), "{reason}")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_lengths_do_not_allocate() {
        let bytes = u32::MAX.to_le_bytes();
        assert!(matches!(
            ByteReader::new(&bytes).u32s(),
            Err(SerializationError::Format { offset: 0, .. })
        ));
    }
}
