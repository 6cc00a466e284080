//! Builds a quantized copy of a graph.
//!
//! Layers are visited producers first. Every rewritten layer is recorded in a side table
//! mapping the GUID of the original layer to the GUID of its quantized counterpart, which is
//! how consumers find the slots to connect to.
use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{quantize_bias, QuantizationError, QuantizationScheme, RangeTracker};
use crate::{
    graph::{
        Graph, GraphError, InputSlotRef, Layer, LayerGuid, LayerId, LayerKind, OutputSlotRef,
    },
    tensor::{ConstTensor, TensorInfo},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantizerOptions {
    pub scheme: QuantizationScheme,
    /// Keeps floating point graph inputs and outputs floating point by inserting Quantize
    /// and Dequantize layers at the boundaries.
    pub preserve_type: bool,
}

/// Rewrites `graph` into an independent quantized graph. The input graph must be complete.
pub fn quantize_graph(
    graph: &Graph,
    ranges: &RangeTracker,
    options: QuantizerOptions,
) -> Result<Graph, QuantizationError> {
    graph.validate()?;
    info!(
        "Quantizing {} layers with {} (preserve type: {})",
        graph.num_layers(),
        options.scheme,
        options.preserve_type
    );
    let mut rewrite = Rewrite {
        source: graph,
        ranges,
        options,
        target: Graph::new(),
        guid_map: BTreeMap::new(),
    };
    graph.for_each_layer_in_topological_order(|id, layer| rewrite.visit(id, layer))?;
    let Rewrite {
        mut target,
        guid_map,
        ..
    } = rewrite;
    // keep the boundary order of the source graph
    target.reorder_inputs(&graph.input_bindings())?;
    target.reorder_outputs(&graph.output_bindings())?;
    info!(
        "Quantized graph has {} layers ({} rewritten)",
        target.num_layers(),
        guid_map.len()
    );
    Ok(target)
}

struct Rewrite<'a> {
    source: &'a Graph,
    ranges: &'a RangeTracker,
    options: QuantizerOptions,
    target: Graph,
    /// original GUID -> GUID of the layer whose outputs replace the original's outputs
    guid_map: BTreeMap<LayerGuid, LayerGuid>,
}

impl Rewrite<'_> {
    fn visit(&mut self, id: LayerId, layer: &Layer) -> Result<(), QuantizationError> {
        let inputs = self.quantized_inputs(id, layer)?;
        let new_guid = match layer.kind() {
            LayerKind::Input { binding_id } => self.rewrite_input(*binding_id, layer)?,
            LayerKind::Output { binding_id } => {
                self.rewrite_output(*binding_id, id, layer, &inputs)?
            }
            kind => {
                let (kind, constant_info) = self.quantized_kind(layer, kind, &inputs)?;
                let new_id = self.target.add_layer(kind, layer.name())?;
                for (index, producer) in inputs.iter().enumerate() {
                    self.target
                        .connect(*producer, InputSlotRef::new(new_id, index))?;
                }
                for index in 0..layer.outputs().len() {
                    let info = match &constant_info {
                        Some(info) => info.clone(),
                        None => self.quantized_info(layer, index)?,
                    };
                    self.target
                        .set_tensor_info(OutputSlotRef::new(new_id, index), info)?;
                }
                self.target[new_id].guid()
            }
        };
        debug!("quantized {layer} into {new_guid}");
        self.guid_map.insert(layer.guid(), new_guid);
        Ok(())
    }

    /// Output slots of the target graph feeding the counterpart of each input slot.
    fn quantized_inputs(
        &self,
        id: LayerId,
        layer: &Layer,
    ) -> Result<Vec<OutputSlotRef>, QuantizationError> {
        (0..layer.inputs().len())
            .map(|index| {
                let producer = self
                    .source
                    .producer(InputSlotRef::new(id, index))
                    .ok_or_else(|| GraphError::UnconnectedInput {
                        layer: layer.guid(),
                        name: layer.name().to_string(),
                        index,
                    })?;
                let producer_guid = self.source[producer.layer].guid();
                let missing = QuantizationError::MissingProducer {
                    layer: layer.guid(),
                    producer: producer_guid,
                };
                let mapped = self.guid_map.get(&producer_guid).ok_or(missing.clone())?;
                let mapped = self.target.layer_by_guid(*mapped).ok_or(missing)?;
                Ok(OutputSlotRef::new(mapped, producer.index))
            })
            .collect()
    }

    /// Output descriptor of `layer`'s slot `index` once quantized with the observed range.
    /// Exact types (booleans, indices) keep their descriptor.
    fn quantized_info(&self, layer: &Layer, index: usize) -> Result<TensorInfo, QuantizationError> {
        let info = layer
            .output(index)
            .and_then(|o| o.tensor_info())
            .ok_or_else(|| GraphError::MissingTensorInfo {
                layer: layer.guid(),
                name: layer.name().to_string(),
                index,
            })?;
        if info.data_type().is_exact() {
            return Ok(info.clone());
        }
        let (min, max) = self
            .ranges
            .range(layer.guid(), index)
            .ok_or(QuantizationError::MissingRange {
                layer: layer.guid(),
                slot: index,
            })?;
        let (scale, offset) = self.options.scheme.compute(min as f64, max as f64)?;
        Ok(TensorInfo::quantized(
            info.shape().clone(),
            self.options.scheme.data_type(),
            scale,
            offset,
        )
        .with_constant(info.is_constant()))
    }

    fn rewrite_input(
        &mut self,
        binding_id: i32,
        layer: &Layer,
    ) -> Result<LayerGuid, QuantizationError> {
        let input = self.target.add_input_layer(binding_id, layer.name())?;
        let original = layer
            .output(0)
            .and_then(|o| o.tensor_info())
            .cloned()
            .ok_or_else(|| GraphError::MissingTensorInfo {
                layer: layer.guid(),
                name: layer.name().to_string(),
                index: 0,
            })?;
        let quantized = self.quantized_info(layer, 0)?;
        if self.options.preserve_type && original.data_type().is_float() {
            self.target
                .set_tensor_info(OutputSlotRef::new(input, 0), original)?;
            let quantize = self
                .target
                .add_layer(LayerKind::Quantize, format!("{}:Quantize", layer.name()))?;
            self.target.connect(
                OutputSlotRef::new(input, 0),
                InputSlotRef::new(quantize, 0),
            )?;
            self.target
                .set_tensor_info(OutputSlotRef::new(quantize, 0), quantized)?;
            Ok(self.target[quantize].guid())
        } else {
            self.target
                .set_tensor_info(OutputSlotRef::new(input, 0), quantized)?;
            Ok(self.target[input].guid())
        }
    }

    fn rewrite_output(
        &mut self,
        binding_id: i32,
        id: LayerId,
        layer: &Layer,
        inputs: &[OutputSlotRef],
    ) -> Result<LayerGuid, QuantizationError> {
        let [producer] = inputs else {
            return Err(GraphError::UnconnectedInput {
                layer: layer.guid(),
                name: layer.name().to_string(),
                index: 0,
            }
            .into());
        };
        let original = self
            .source
            .input_tensor_info(InputSlotRef::new(id, 0))
            .cloned();
        let mut producer = *producer;
        if let Some(original) = original.filter(|i| i.data_type().is_float()) {
            if self.options.preserve_type {
                let dequantize = self
                    .target
                    .add_layer(LayerKind::Dequantize, format!("{}:Dequantize", layer.name()))?;
                self.target
                    .connect(producer, InputSlotRef::new(dequantize, 0))?;
                self.target
                    .set_tensor_info(OutputSlotRef::new(dequantize, 0), original)?;
                producer = OutputSlotRef::new(dequantize, 0);
            }
        }
        let output = self.target.add_output_layer(binding_id, layer.name())?;
        self.target
            .connect(producer, InputSlotRef::new(output, 0))?;
        Ok(self.target[output].guid())
    }

    /// Quantized counterpart of an interior layer kind. For constant layers the descriptor
    /// of the requantized payload is returned too, since it becomes the output descriptor.
    fn quantized_kind(
        &self,
        layer: &Layer,
        kind: &LayerKind,
        inputs: &[OutputSlotRef],
    ) -> Result<(LayerKind, Option<TensorInfo>), QuantizationError> {
        let scheme = self.options.scheme;
        let input_scale = || -> Result<f32, QuantizationError> {
            let producer = inputs.first().ok_or(QuantizationError::MissingProducer {
                layer: layer.guid(),
                producer: layer.guid(),
            })?;
            Ok(self
                .target
                .tensor_info(*producer)
                .map(TensorInfo::scale)
                .unwrap_or_default())
        };
        let weights_and_bias = |weights: &ConstTensor,
                                biases: &Option<ConstTensor>|
         -> Result<(ConstTensor, Option<ConstTensor>), QuantizationError> {
            let weights = scheme.quantize_constant(weights)?;
            let biases = biases
                .as_ref()
                .map(|b| quantize_bias(b, input_scale()?, weights.info().scale()))
                .transpose()?;
            Ok((weights, biases))
        };
        let quantized = match kind {
            LayerKind::Constant(t) => {
                let t = scheme.quantize_constant(t)?;
                let info = t.info().clone();
                return Ok((LayerKind::Constant(t), Some(info)));
            }
            LayerKind::Convolution2d {
                descriptor,
                weights,
                biases,
            } => {
                let (weights, biases) = weights_and_bias(weights, biases)?;
                LayerKind::Convolution2d {
                    descriptor: *descriptor,
                    weights,
                    biases,
                }
            }
            LayerKind::DepthwiseConvolution2d {
                descriptor,
                weights,
                biases,
            } => {
                let (weights, biases) = weights_and_bias(weights, biases)?;
                LayerKind::DepthwiseConvolution2d {
                    descriptor: *descriptor,
                    weights,
                    biases,
                }
            }
            LayerKind::FullyConnected {
                descriptor,
                weights,
                biases,
            } => {
                let (weights, biases) = weights_and_bias(weights, biases)?;
                LayerKind::FullyConnected {
                    descriptor: *descriptor,
                    weights,
                    biases,
                }
            }
            LayerKind::TransposeConvolution2d {
                descriptor,
                weights,
                biases,
            } => {
                let (weights, biases) = weights_and_bias(weights, biases)?;
                LayerKind::TransposeConvolution2d {
                    descriptor: descriptor.clone(),
                    weights,
                    biases,
                }
            }
            LayerKind::BatchNormalization {
                descriptor,
                mean,
                variance,
                beta,
                gamma,
            } => LayerKind::BatchNormalization {
                descriptor: *descriptor,
                mean: scheme.quantize_constant(mean)?,
                variance: scheme.quantize_constant(variance)?,
                beta: scheme.quantize_constant(beta)?,
                gamma: scheme.quantize_constant(gamma)?,
            },
            LayerKind::Activation(_)
            | LayerKind::Addition
            | LayerKind::ArgMinMax(_)
            | LayerKind::BatchToSpaceNd(_)
            | LayerKind::Comparison(_)
            | LayerKind::Concat(_)
            | LayerKind::DepthToSpace(_)
            | LayerKind::Division
            | LayerKind::ElementwiseUnary(_)
            | LayerKind::Fill(_)
            | LayerKind::Floor
            | LayerKind::Gather(_)
            | LayerKind::InstanceNormalization(_)
            | LayerKind::L2Normalization(_)
            | LayerKind::LogSoftmax(_)
            | LayerKind::Maximum
            | LayerKind::Mean(_)
            | LayerKind::Minimum
            | LayerKind::Multiplication
            | LayerKind::Normalization(_)
            | LayerKind::Pad(_)
            | LayerKind::Permute(_)
            | LayerKind::Pooling2d(_)
            | LayerKind::Prelu
            | LayerKind::Reduce(_)
            | LayerKind::Reshape(_)
            | LayerKind::Resize(_)
            | LayerKind::Slice(_)
            | LayerKind::Softmax(_)
            | LayerKind::SpaceToBatchNd(_)
            | LayerKind::SpaceToDepth(_)
            | LayerKind::Splitter(_)
            | LayerKind::Stack(_)
            | LayerKind::StridedSlice(_)
            | LayerKind::Subtraction
            | LayerKind::Transpose(_) => kind.clone(),
            LayerKind::Input { .. }
            | LayerKind::Output { .. }
            | LayerKind::Cast
            | LayerKind::Dequantize
            | LayerKind::LogicalBinary(_)
            | LayerKind::Quantize
            | LayerKind::Rank
            | LayerKind::StandIn(_) => {
                return Err(QuantizationError::UnimplementedOperator {
                    layer: layer.guid(),
                    name: layer.name().to_string(),
                    kind: kind.name(),
                });
            }
        };
        Ok((quantized, None))
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{ByteOrder, LittleEndian};

    use super::*;
    use crate::{
        graph::{
            ActivationDescriptor, ActivationFunction, Convolution2dDescriptor,
            FullyConnectedDescriptor,
        },
        tensor::DataType,
    };

    fn connect(g: &mut Graph, from: LayerId, to: LayerId, index: usize) {
        g.connect(OutputSlotRef::new(from, 0), InputSlotRef::new(to, index))
            .unwrap();
    }

    /// input -> fully connected -> relu -> output, all Float32
    fn float_graph() -> (Graph, RangeTracker) {
        let mut g = Graph::new();
        let input = g.add_input_layer(0, "in").unwrap();
        let fc = g
            .add_layer(
                LayerKind::FullyConnected {
                    descriptor: FullyConnectedDescriptor {
                        bias_enabled: true,
                        transpose_weight_matrix: false,
                    },
                    weights: ConstTensor::from_f32(&[2, 2], &[-12.75, 0.0, 1.0, 12.75]).unwrap(),
                    biases: Some(ConstTensor::from_f32(&[2], &[3.0, -1.0]).unwrap()),
                },
                "fc",
            )
            .unwrap();
        let relu = g
            .add_layer(
                LayerKind::Activation(ActivationDescriptor::new(
                    ActivationFunction::ReLu,
                    0.0,
                    0.0,
                )),
                "relu",
            )
            .unwrap();
        let output = g.add_output_layer(0, "out").unwrap();
        connect(&mut g, input, fc, 0);
        connect(&mut g, fc, relu, 0);
        connect(&mut g, relu, output, 0);
        for id in [input, fc, relu] {
            g.set_tensor_info(
                OutputSlotRef::new(id, 0),
                TensorInfo::new(vec![1, 2], DataType::Float32),
            )
            .unwrap();
        }
        let mut ranges = RangeTracker::new();
        // 127.5 / 255 = 0.5
        ranges.set_range(g[input].guid(), 0, 0.0, 127.5).unwrap();
        ranges.set_range(g[fc].guid(), 0, -10.0, 10.0).unwrap();
        ranges.set_range(g[relu].guid(), 0, 0.0, 10.0).unwrap();
        (g, ranges)
    }

    #[test]
    fn test_interior_layers_are_quantized() {
        let (g, ranges) = float_graph();
        let q = quantize_graph(&g, &ranges, QuantizerOptions::default()).unwrap();
        q.validate().unwrap();
        let kinds: Vec<_> = q.topological_order().iter().map(|id| q[*id].kind().name()).collect();
        assert_eq!(kinds, vec!["Input", "FullyConnected", "Activation", "Output"]);

        let input = q.input_layers()[0];
        let info = q.tensor_info(OutputSlotRef::new(input, 0)).unwrap();
        assert_eq!(info.data_type(), DataType::QAsymmU8);
        assert_eq!(info.scale(), 0.5);
        assert_eq!(info.offset(), 0);

        let relu = q.layers().find(|(_, l)| l.name() == "relu").unwrap().0;
        let info = q.tensor_info(OutputSlotRef::new(relu, 0)).unwrap();
        assert_eq!(info.scale(), (10.0f64 / 255.0) as f32);
        assert_eq!(info.offset(), 0);
        // the source graph is left untouched
        assert_eq!(
            g.tensor_info(OutputSlotRef::new(g.input_layers()[0], 0)).unwrap().data_type(),
            DataType::Float32
        );
    }

    #[test]
    fn test_bias_scale_couples_input_and_weights() {
        let (g, ranges) = float_graph();
        let q = quantize_graph(&g, &ranges, QuantizerOptions::default()).unwrap();
        let fc = q
            .layers()
            .find(|(_, l)| l.name() == "fc")
            .map(|(id, _)| id)
            .unwrap();
        let LayerKind::FullyConnected {
            weights, biases, ..
        } = q[fc].kind()
        else {
            panic!("expected a fully connected layer");
        };
        // weights span [-12.75, 12.75] -> scale 0.1
        assert_eq!(weights.data_type(), DataType::QAsymmU8);
        assert_eq!(weights.info().scale(), 0.1);
        let biases = biases.as_ref().unwrap();
        assert_eq!(biases.data_type(), DataType::Signed32);
        assert_eq!(biases.info().scale(), 0.05);
        let mut values = [0i32; 2];
        LittleEndian::read_i32_into(biases.data(), &mut values);
        assert_eq!(values, [60, -20]);
    }

    #[test]
    fn test_preserve_type_inserts_boundary_layers() {
        let (g, ranges) = float_graph();
        let options = QuantizerOptions {
            scheme: QuantizationScheme::QAsymmS8,
            preserve_type: true,
        };
        let q = quantize_graph(&g, &ranges, options).unwrap();
        let order = q.topological_order();
        let kinds: Vec<_> = order.iter().map(|id| q[*id].kind().name()).collect();
        assert_eq!(kinds, vec![
            "Input",
            "Quantize",
            "FullyConnected",
            "Activation",
            "Dequantize",
            "Output"
        ]);
        let input_info = q.tensor_info(OutputSlotRef::new(order[0], 0)).unwrap();
        assert_eq!(input_info.data_type(), DataType::Float32);
        let quantize_info = q.tensor_info(OutputSlotRef::new(order[1], 0)).unwrap();
        assert_eq!(quantize_info.data_type(), DataType::QAsymmS8);
        let dequantize_info = q.tensor_info(OutputSlotRef::new(order[4], 0)).unwrap();
        assert_eq!(dequantize_info, &TensorInfo::new(vec![1, 2], DataType::Float32));
        assert_eq!(q.output_bindings(), vec![0]);
    }

    #[test]
    fn test_missing_range_is_reported() {
        let (g, _) = float_graph();
        let err = quantize_graph(&g, &RangeTracker::new(), QuantizerOptions::default())
            .unwrap_err();
        assert!(matches!(err, QuantizationError::MissingRange { slot: 0, .. }));
    }

    #[test]
    fn test_unimplemented_kind_is_fatal() {
        let mut g = Graph::new();
        let input = g.add_input_layer(0, "in").unwrap();
        let cast = g.add_layer(LayerKind::Cast, "cast").unwrap();
        let output = g.add_output_layer(0, "out").unwrap();
        connect(&mut g, input, cast, 0);
        connect(&mut g, cast, output, 0);
        for id in [input, cast] {
            g.set_tensor_info(
                OutputSlotRef::new(id, 0),
                TensorInfo::new(vec![2], DataType::Float32),
            )
            .unwrap();
        }
        let ranges = RangeTracker::new().with_default_range((-1.0, 1.0));
        let err = quantize_graph(&g, &ranges, QuantizerOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            QuantizationError::UnimplementedOperator { kind: "Cast", .. }
        ));
    }

    #[test]
    fn test_exact_types_are_kept() {
        let mut g = Graph::new();
        let input = g.add_input_layer(0, "in").unwrap();
        let reshape = g
            .add_layer(
                LayerKind::Reshape(crate::graph::ReshapeDescriptor {
                    target_shape: vec![4],
                }),
                "reshape",
            )
            .unwrap();
        let output = g.add_output_layer(0, "out").unwrap();
        connect(&mut g, input, reshape, 0);
        connect(&mut g, reshape, output, 0);
        g.set_tensor_info(
            OutputSlotRef::new(input, 0),
            TensorInfo::new(vec![2, 2], DataType::Signed32),
        )
        .unwrap();
        g.set_tensor_info(
            OutputSlotRef::new(reshape, 0),
            TensorInfo::new(vec![4], DataType::Signed32),
        )
        .unwrap();
        let q = quantize_graph(&g, &RangeTracker::new(), QuantizerOptions::default()).unwrap();
        let order = q.topological_order();
        assert_eq!(
            q.tensor_info(OutputSlotRef::new(order[1], 0)),
            Some(&TensorInfo::new(vec![4], DataType::Signed32))
        );
    }

    #[test]
    fn test_convolution_without_bias() {
        let mut g = Graph::new();
        let input = g.add_input_layer(0, "in").unwrap();
        let conv = g
            .add_layer(
                LayerKind::Convolution2d {
                    descriptor: Convolution2dDescriptor::default(),
                    weights: ConstTensor::from_f32(&[1, 1, 1, 1], &[0.5]).unwrap(),
                    biases: None,
                },
                "conv",
            )
            .unwrap();
        let output = g.add_output_layer(0, "out").unwrap();
        connect(&mut g, input, conv, 0);
        connect(&mut g, conv, output, 0);
        for id in [input, conv] {
            g.set_tensor_info(
                OutputSlotRef::new(id, 0),
                TensorInfo::new(vec![1, 1, 1, 1], DataType::Float32),
            )
            .unwrap();
        }
        let ranges = RangeTracker::new().with_default_range((-1.0, 1.0));
        let options = QuantizerOptions {
            scheme: QuantizationScheme::QSymmS8,
            preserve_type: false,
        };
        let q = quantize_graph(&g, &ranges, options).unwrap();
        let LayerKind::Convolution2d {
            weights, biases, ..
        } = q[q.topological_order()[1]].kind()
        else {
            panic!("expected a convolution");
        };
        assert!(biases.is_none());
        assert_eq!(weights.data(), &[127]);
    }
}
