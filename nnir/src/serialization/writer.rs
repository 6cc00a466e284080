use std::{borrow::Cow, collections::BTreeMap, io::Write};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, info};

use super::{
    format::{FeatureVersions, LayerTag, WireEnum, FORMAT_VERSION, MAGIC, NO_AXIS},
    SerializationError,
};
use crate::{
    graph::{
        Convolution2dDescriptor, Graph, GraphError, InputSlotRef, Layer, LayerGuid, LayerId,
        LayerKind,
    },
    tensor::{depthwise_weights_from_mihw, ConstTensor, Quantization, TensorInfo},
};

type Result<T> = std::result::Result<T, SerializationError>;

/// Serializes a complete graph into a new buffer.
pub fn serialize(graph: &Graph) -> Result<Vec<u8>> {
    serialize_with_features(graph, FeatureVersions::CURRENT)
}

/// Serializes a complete graph into any byte sink.
pub fn serialize_into<W: Write>(graph: &Graph, mut sink: W) -> Result<()> {
    let buffer = serialize(graph)?;
    sink.write_all(&buffer)?;
    Ok(())
}

/// Serializes with an explicit feature table, which allows producing containers in the
/// legacy layouts.
pub(crate) fn serialize_with_features(graph: &Graph, features: FeatureVersions) -> Result<Vec<u8>> {
    graph.validate()?;
    let mut writer = GraphWriter {
        graph,
        features,
        ids: BTreeMap::new(),
        out: Vec::new(),
    };
    writer.write_graph()?;
    info!(
        "serialized {} layers into {} bytes",
        graph.num_layers(),
        writer.out.len()
    );
    Ok(writer.out)
}

struct GraphWriter<'g> {
    graph: &'g Graph,
    features: FeatureVersions,
    /// Serialization-local ids, assigned in the order layers are first visited.
    ids: BTreeMap<LayerGuid, u32>,
    out: Vec<u8>,
}

impl GraphWriter<'_> {
    fn write_graph(&mut self) -> Result<()> {
        self.out.write_all(&MAGIC)?;
        self.out.write_u32::<LittleEndian>(FORMAT_VERSION)?;

        let entries = self.features.entries();
        write_len(&mut self.out, entries.len())?;
        for (feature, version) in entries {
            self.out.write_u16::<LittleEndian>(feature)?;
            self.out.write_u32::<LittleEndian>(version)?;
        }

        let order = self.graph.topological_order();
        write_len(&mut self.out, order.len())?;
        for id in order {
            self.write_layer(id)?;
        }

        let inputs = self.boundary_ids(self.graph.input_layers());
        let outputs = self.boundary_ids(self.graph.output_layers());
        write_i32s(&mut self.out, &inputs)?;
        write_i32s(&mut self.out, &outputs)?;
        Ok(())
    }

    /// Binding ids of the boundary layers, or their layer ids in the legacy scheme.
    fn boundary_ids(&self, layers: &[LayerId]) -> Vec<i32> {
        layers
            .iter()
            .map(|id| {
                let layer = &self.graph[*id];
                if self.features.binding_ids_scheme == 0 {
                    self.ids[&layer.guid()] as i32
                } else {
                    layer.kind().binding_id().unwrap_or_default()
                }
            })
            .collect()
    }

    fn write_layer(&mut self, id: LayerId) -> Result<()> {
        let layer = &self.graph[id];
        let serial_id = self.ids.len() as u32;
        self.ids.insert(layer.guid(), serial_id);
        debug!("writing {layer} with id {serial_id}");

        self.out
            .write_u16::<LittleEndian>(LayerTag::of(layer.kind()).to_u16())?;
        self.out.write_u32::<LittleEndian>(serial_id)?;
        write_str(&mut self.out, layer.name())?;

        write_len(&mut self.out, layer.inputs().len())?;
        for index in 0..layer.inputs().len() {
            let producer = self
                .graph
                .producer(InputSlotRef::new(id, index))
                .ok_or_else(|| unconnected(layer, index))?;
            let producer_id = self.ids[&self.graph[producer.layer].guid()];
            self.out.write_u32::<LittleEndian>(index as u32)?;
            self.out.write_u32::<LittleEndian>(producer_id)?;
            self.out.write_u32::<LittleEndian>(producer.index as u32)?;
        }

        write_len(&mut self.out, layer.outputs().len())?;
        for (index, slot) in layer.outputs().iter().enumerate() {
            let info = slot
                .tensor_info()
                .ok_or_else(|| GraphError::MissingTensorInfo {
                    layer: layer.guid(),
                    name: layer.name().to_string(),
                    index,
                })?;
            self.out.write_u32::<LittleEndian>(index as u32)?;
            write_tensor_info(&mut self.out, info)?;
        }

        let mut body = Vec::new();
        self.write_body(&mut body, layer.kind())?;
        write_len(&mut self.out, body.len())?;
        self.out.write_all(&body)?;
        Ok(())
    }

    fn write_body(&self, w: &mut Vec<u8>, kind: &LayerKind) -> Result<()> {
        match kind {
            LayerKind::Input { binding_id } | LayerKind::Output { binding_id } => {
                w.write_i32::<LittleEndian>(*binding_id)?;
            }
            LayerKind::Addition
            | LayerKind::Cast
            | LayerKind::Dequantize
            | LayerKind::Division
            | LayerKind::Floor
            | LayerKind::Maximum
            | LayerKind::Minimum
            | LayerKind::Multiplication
            | LayerKind::Prelu
            | LayerKind::Quantize
            | LayerKind::Rank
            | LayerKind::Subtraction => {}
            LayerKind::Activation(d) => {
                write_enum(w, d.function)?;
                w.write_f32::<LittleEndian>(d.a)?;
                w.write_f32::<LittleEndian>(d.b)?;
            }
            LayerKind::ArgMinMax(d) => {
                write_enum(w, d.function)?;
                w.write_i32::<LittleEndian>(d.axis)?;
                write_enum(w, d.output_type)?;
            }
            LayerKind::BatchNormalization {
                descriptor,
                mean,
                variance,
                beta,
                gamma,
            } => {
                w.write_f32::<LittleEndian>(descriptor.eps)?;
                write_enum(w, descriptor.data_layout)?;
                for tensor in [mean, variance, beta, gamma] {
                    write_const_tensor(w, tensor)?;
                }
            }
            LayerKind::BatchToSpaceNd(d) => {
                write_u32s(w, &d.block_shape)?;
                write_pairs(w, &d.crops)?;
                write_enum(w, d.data_layout)?;
            }
            LayerKind::Comparison(d) => write_enum(w, d.operation)?,
            LayerKind::Concat(d) => {
                w.write_u32::<LittleEndian>(d.concat_axis)?;
                write_len(w, d.view_origins.len())?;
                for origin in &d.view_origins {
                    write_u32s(w, origin)?;
                }
            }
            LayerKind::Constant(tensor) => write_const_tensor(w, tensor)?,
            LayerKind::Convolution2d {
                descriptor,
                weights,
                biases,
            } => {
                write_conv_descriptor(w, descriptor)?;
                write_const_tensor(w, weights)?;
                write_optional_const_tensor(w, biases.as_ref())?;
            }
            LayerKind::DepthToSpace(d) | LayerKind::SpaceToDepth(d) => {
                w.write_u32::<LittleEndian>(d.block_size)?;
                write_enum(w, d.data_layout)?;
            }
            LayerKind::DepthwiseConvolution2d {
                descriptor,
                weights,
                biases,
            } => {
                let weights = if self.features.weights_layout_scheme == 0 {
                    Cow::Owned(depthwise_weights_from_mihw(weights)?)
                } else {
                    Cow::Borrowed(weights)
                };
                write_conv_descriptor(w, descriptor)?;
                write_const_tensor(w, &weights)?;
                write_optional_const_tensor(w, biases.as_ref())?;
            }
            LayerKind::ElementwiseUnary(d) => write_enum(w, d.operation)?,
            LayerKind::Fill(d) => w.write_f32::<LittleEndian>(d.value)?,
            LayerKind::FullyConnected {
                descriptor,
                weights,
                biases,
            } => {
                write_bool(w, descriptor.bias_enabled)?;
                write_bool(w, descriptor.transpose_weight_matrix)?;
                write_const_tensor(w, weights)?;
                write_optional_const_tensor(w, biases.as_ref())?;
            }
            LayerKind::Gather(d) => w.write_i32::<LittleEndian>(d.axis)?,
            LayerKind::InstanceNormalization(d) => {
                w.write_f32::<LittleEndian>(d.gamma)?;
                w.write_f32::<LittleEndian>(d.beta)?;
                w.write_f32::<LittleEndian>(d.eps)?;
                write_enum(w, d.data_layout)?;
            }
            LayerKind::L2Normalization(d) => {
                w.write_f32::<LittleEndian>(d.eps)?;
                write_enum(w, d.data_layout)?;
            }
            LayerKind::LogicalBinary(d) => write_enum(w, d.operation)?,
            LayerKind::LogSoftmax(d) | LayerKind::Softmax(d) => {
                w.write_f32::<LittleEndian>(d.beta)?;
                w.write_i32::<LittleEndian>(d.axis)?;
            }
            LayerKind::Mean(d) => {
                write_u32s(w, &d.axis)?;
                write_bool(w, d.keep_dims)?;
            }
            LayerKind::Normalization(d) => {
                write_enum(w, d.channel_type)?;
                write_enum(w, d.method_type)?;
                w.write_u32::<LittleEndian>(d.norm_size)?;
                w.write_f32::<LittleEndian>(d.alpha)?;
                w.write_f32::<LittleEndian>(d.beta)?;
                w.write_f32::<LittleEndian>(d.k)?;
                write_enum(w, d.data_layout)?;
            }
            LayerKind::Pad(d) => {
                write_pairs(w, &d.pad_list)?;
                w.write_f32::<LittleEndian>(d.pad_value)?;
                write_enum(w, d.mode)?;
            }
            LayerKind::Permute(d) => write_u32s(w, d.mappings.mappings())?,
            LayerKind::Transpose(d) => write_u32s(w, d.mappings.mappings())?,
            LayerKind::Pooling2d(d) => {
                write_enum(w, d.pool_type)?;
                for v in [
                    d.pad_left,
                    d.pad_right,
                    d.pad_top,
                    d.pad_bottom,
                    d.pool_width,
                    d.pool_height,
                    d.stride_x,
                    d.stride_y,
                ] {
                    w.write_u32::<LittleEndian>(v)?;
                }
                write_enum(w, d.output_shape_rounding)?;
                write_enum(w, d.padding_method)?;
                write_enum(w, d.data_layout)?;
            }
            LayerKind::Reduce(d) => {
                write_bool(w, d.keep_dims)?;
                write_u32s(w, &d.axis)?;
                write_enum(w, d.operation)?;
            }
            LayerKind::Reshape(d) => write_u32s(w, &d.target_shape)?,
            LayerKind::Resize(d) => {
                w.write_u32::<LittleEndian>(d.target_width)?;
                w.write_u32::<LittleEndian>(d.target_height)?;
                write_enum(w, d.method)?;
                write_enum(w, d.data_layout)?;
                write_bool(w, d.align_corners)?;
                write_bool(w, d.half_pixel_centers)?;
            }
            LayerKind::Slice(d) => {
                write_u32s(w, &d.begin)?;
                write_u32s(w, &d.size)?;
            }
            LayerKind::SpaceToBatchNd(d) => {
                write_u32s(w, &d.block_shape)?;
                write_pairs(w, &d.pad_list)?;
                write_enum(w, d.data_layout)?;
            }
            LayerKind::Splitter(d) => {
                write_len(w, d.origins.len())?;
                for (origin, size) in d.origins.iter().zip(&d.sizes) {
                    write_u32s(w, origin)?;
                    write_u32s(w, size)?;
                }
            }
            LayerKind::Stack(d) => {
                w.write_u32::<LittleEndian>(d.axis)?;
                w.write_u32::<LittleEndian>(d.num_inputs)?;
                write_u32s(w, &d.input_shape)?;
            }
            LayerKind::StandIn(d) => {
                w.write_u32::<LittleEndian>(d.num_inputs)?;
                w.write_u32::<LittleEndian>(d.num_outputs)?;
            }
            LayerKind::StridedSlice(d) => {
                write_i32s(w, &d.begin)?;
                write_i32s(w, &d.end)?;
                write_i32s(w, &d.stride)?;
                for mask in [
                    d.begin_mask,
                    d.end_mask,
                    d.shrink_axis_mask,
                    d.ellipsis_mask,
                    d.new_axis_mask,
                ] {
                    w.write_i32::<LittleEndian>(mask)?;
                }
                write_enum(w, d.data_layout)?;
            }
            LayerKind::TransposeConvolution2d {
                descriptor: d,
                weights,
                biases,
            } => {
                for v in [
                    d.pad_left,
                    d.pad_right,
                    d.pad_top,
                    d.pad_bottom,
                    d.stride_x,
                    d.stride_y,
                ] {
                    w.write_u32::<LittleEndian>(v)?;
                }
                write_bool(w, d.bias_enabled)?;
                write_enum(w, d.data_layout)?;
                write_bool(w, d.output_shape_enabled)?;
                write_u32s(w, &d.output_shape)?;
                write_const_tensor(w, weights)?;
                write_optional_const_tensor(w, biases.as_ref())?;
            }
        }
        Ok(())
    }
}

fn unconnected(layer: &Layer, index: usize) -> SerializationError {
    GraphError::UnconnectedInput {
        layer: layer.guid(),
        name: layer.name().to_string(),
        index,
    }
    .into()
}

fn write_len<W: Write>(w: &mut W, len: usize) -> std::io::Result<()> {
    let len = u32::try_from(len).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("length {len} does not fit in 32 bits"),
        )
    })?;
    w.write_u32::<LittleEndian>(len)
}

fn write_str<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    write_len(w, s.len())?;
    w.write_all(s.as_bytes())
}

fn write_bool<W: Write>(w: &mut W, b: bool) -> std::io::Result<()> {
    w.write_u8(u8::from(b))
}

fn write_enum<W: Write, E: WireEnum>(w: &mut W, e: E) -> std::io::Result<()> {
    w.write_u8(e.tag())
}

fn write_u32s<W: Write>(w: &mut W, values: &[u32]) -> std::io::Result<()> {
    write_len(w, values.len())?;
    values
        .iter()
        .try_for_each(|v| w.write_u32::<LittleEndian>(*v))
}

fn write_i32s<W: Write>(w: &mut W, values: &[i32]) -> std::io::Result<()> {
    write_len(w, values.len())?;
    values
        .iter()
        .try_for_each(|v| w.write_i32::<LittleEndian>(*v))
}

fn write_pairs<W: Write>(w: &mut W, pairs: &[(u32, u32)]) -> std::io::Result<()> {
    write_len(w, pairs.len())?;
    for (before, after) in pairs {
        w.write_u32::<LittleEndian>(*before)?;
        w.write_u32::<LittleEndian>(*after)?;
    }
    Ok(())
}

fn write_conv_descriptor<W: Write>(
    w: &mut W,
    d: &Convolution2dDescriptor,
) -> std::io::Result<()> {
    for v in [
        d.pad_left,
        d.pad_right,
        d.pad_top,
        d.pad_bottom,
        d.stride_x,
        d.stride_y,
        d.dilation_x,
        d.dilation_y,
    ] {
        w.write_u32::<LittleEndian>(v)?;
    }
    write_bool(w, d.bias_enabled)?;
    write_enum(w, d.data_layout)
}

pub(crate) fn write_tensor_info<W: Write>(w: &mut W, info: &TensorInfo) -> std::io::Result<()> {
    write_enum(w, info.data_type())?;
    let dims = info.shape().dims();
    write_len(w, dims.len())?;
    for dim in dims {
        write_bool(w, dim.is_some())?;
        w.write_u32::<LittleEndian>(dim.unwrap_or_default())?;
    }
    let quantization = info.quantization();
    let scales = quantization.scales();
    write_len(w, scales.len())?;
    for scale in scales {
        w.write_f32::<LittleEndian>(*scale)?;
    }
    w.write_i32::<LittleEndian>(quantization.offset())?;
    let axis = match quantization {
        Quantization::PerTensor { .. } => NO_AXIS,
        Quantization::PerAxis { axis, .. } => *axis,
    };
    w.write_u32::<LittleEndian>(axis)?;
    write_bool(w, info.is_constant())
}

/// Descriptor, cell width, cell count, then the raw cells.
fn write_const_tensor<W: Write>(w: &mut W, tensor: &ConstTensor) -> std::io::Result<()> {
    write_tensor_info(w, tensor.info())?;
    w.write_u8(tensor.data_type().size_in_bytes() as u8)?;
    write_len(w, tensor.num_elements())?;
    w.write_all(tensor.data())
}

fn write_optional_const_tensor<W: Write>(
    w: &mut W,
    tensor: Option<&ConstTensor>,
) -> std::io::Result<()> {
    write_bool(w, tensor.is_some())?;
    match tensor {
        Some(tensor) => write_const_tensor(w, tensor),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorShape};

    #[test]
    fn test_tensor_info_encoding() {
        let info = TensorInfo::quantized(vec![1, 2], DataType::QAsymmU8, 0.5, 3);
        let mut out = Vec::new();
        write_tensor_info(&mut out, &info).unwrap();
        #[rustfmt::skip]
        let expected: Vec<u8> = vec![
            2,              // QAsymmU8
            2, 0, 0, 0,     // rank
            1, 1, 0, 0, 0,  // specified 1
            1, 2, 0, 0, 0,  // specified 2
            1, 0, 0, 0,     // one scale
            0, 0, 0, 0x3f,  // 0.5
            3, 0, 0, 0,     // offset
            0xff, 0xff, 0xff, 0xff, // no axis
            0,              // not constant
        ];
        assert_eq!(out, expected);
    }

    #[test]
    fn test_unspecified_dimension_encoding() {
        let info = TensorInfo::new(
            TensorShape::with_unspecified(vec![None, Some(4)]),
            DataType::Float32,
        );
        let mut out = Vec::new();
        write_tensor_info(&mut out, &info).unwrap();
        assert_eq!(&out[5..15], &[0, 0, 0, 0, 0, 1, 4, 0, 0, 0]);
    }

    #[test]
    fn test_incomplete_graph_is_rejected() {
        let mut graph = Graph::new();
        graph.add_input_layer(0, "in").unwrap();
        assert!(matches!(
            serialize(&graph),
            Err(SerializationError::IncompleteGraph(_))
        ));
    }
}
