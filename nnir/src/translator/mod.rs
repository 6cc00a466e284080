//! Operator translator: imports a TFLite-style operator list into a [`Graph`].
//!
//! Operators are translated one at a time, in source order. Each one is first planned (see
//! [`plan`]) into the layers representing it, then the plan is added to the graph as a
//! whole: when any step fails, the graph is rolled back to its state before the operator.
//! The same plans feed [`check_support`], which asks a [`LayerSupport`] about every planned
//! layer instead of building anything.
mod error;
pub mod model;
mod padding;
mod plan;
mod support;

use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::{debug, info};

pub use error::TranslationError;
pub use model::{
    binding_id, BuiltinOperator, FusedActivation, MirrorPadMode, OperatorOptions, Padding,
    SourceModel, SourceOperator, SourceQuantization, SourceTensor, TensorType,
};
pub use padding::calc_padding;
pub use support::{check_support, LayerSupport};

use plan::{plan_operator, OperatorPlan, SlotSource};

use crate::{
    graph::{Graph, GraphError, InputSlotRef, LayerId, LayerKind, OutputSlotRef},
    tensor::ConstTensor,
};

type Result<T> = std::result::Result<T, TranslationError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatorOptions {
    /// Translate unknown operators into `StandIn` layers instead of failing.
    pub stand_in_for_unsupported: bool,
}

/// Builds a graph from a source model, keeping track of the output slot producing each
/// source tensor.
pub struct Translator<'a> {
    model: &'a SourceModel,
    options: TranslatorOptions,
    graph: Graph,
    producers: BTreeMap<usize, OutputSlotRef>,
}

impl<'a> Translator<'a> {
    /// Starts a graph holding one Input layer per model input.
    pub fn new(model: &'a SourceModel, options: TranslatorOptions) -> Result<Self> {
        let mut graph = Graph::new();
        let mut producers = BTreeMap::new();
        for &tensor in &model.inputs {
            let boundary = |reason: String| TranslationError::InvalidBoundary {
                direction: "input",
                tensor,
                reason,
            };
            let (index, source) = usize::try_from(tensor)
                .ok()
                .and_then(|t| Some((t, model.tensor(t)?)))
                .ok_or_else(|| boundary("no such tensor".to_string()))?;
            if source.is_dynamic() {
                return Err(boundary("tensor is dynamically shaped".to_string()));
            }
            let info = source.tensor_info().map_err(boundary)?;
            let layer = graph
                .add_input_layer(binding_id(index), source.name.clone())
                .map_err(|e| boundary(e.to_string()))?;
            let slot = OutputSlotRef::new(layer, 0);
            graph
                .set_tensor_info(slot, info)
                .map_err(|e| boundary(e.to_string()))?;
            producers.insert(index, slot);
        }
        Ok(Self {
            model,
            options,
            graph,
            producers,
        })
    }

    /// Translates operator `index`, returning the layer representing it. Layers synthesized
    /// around it (constants, broadcast reshapes, fused activation) are added as well.
    pub fn translate(&mut self, index: usize) -> Result<LayerId> {
        let plan = plan_operator(self.model, index, &self.options)?;
        let invalid = |tensor: usize, reason: &str| TranslationError::InvalidTensor {
            operator: index,
            tensor: tensor as i32,
            reason: reason.to_string(),
        };

        let mut sources = BTreeMap::new();
        let mut constants = Vec::new();
        for tensor in plan.consumed_tensors() {
            if let Some(slot) = self.producers.get(&tensor) {
                sources.insert(tensor, *slot);
                continue;
            }
            let source = &self.model.tensors[tensor];
            let Some(data) = source.data.as_ref().filter(|d| !d.is_empty()) else {
                return Err(invalid(tensor, "tensor has no producer"));
            };
            let constant = source
                .tensor_info()
                .map_err(|reason| invalid(tensor, &reason))
                .and_then(|info| {
                    ConstTensor::new(info, data.clone())
                        .map_err(|e| invalid(tensor, &e.to_string()))
                })?;
            constants.push((tensor, format!("Constant:{}", source.name), constant));
        }
        if let Some(tensor) = plan.outputs.iter().find(|t| self.producers.contains_key(*t)) {
            return Err(invalid(*tensor, "tensor already has a producer"));
        }
        if !plan.outputs.iter().all_unique() {
            return Err(invalid(plan.outputs[0], "operator produces a tensor twice"));
        }

        let checkpoint = self.graph.checkpoint();
        let before = self.graph.num_layers();
        match self.build(&plan, sources, constants) {
            Ok((layer, produced)) => {
                debug!(
                    "operator {index} ({}) -> {} layer(s), primary '{}'",
                    self.model.operators[index].op,
                    self.graph.num_layers() - before,
                    plan.primary.name
                );
                self.producers.extend(produced);
                Ok(layer)
            }
            Err(source) => {
                self.graph.rollback(checkpoint);
                Err(TranslationError::Graph {
                    operator: index,
                    source,
                })
            }
        }
    }

    /// Adds the planned layers. Returns the primary layer and the slots producing each
    /// tensor, constants included.
    fn build(
        &mut self,
        plan: &OperatorPlan,
        mut sources: BTreeMap<usize, OutputSlotRef>,
        constants: Vec<(usize, String, ConstTensor)>,
    ) -> std::result::Result<(LayerId, Vec<(usize, OutputSlotRef)>), GraphError> {
        let mut produced = Vec::new();
        for (tensor, name, constant) in constants {
            let info = constant.info().clone();
            let layer = self.graph.add_layer(LayerKind::Constant(constant), name)?;
            let slot = OutputSlotRef::new(layer, 0);
            self.graph.set_tensor_info(slot, info)?;
            sources.insert(tensor, slot);
            produced.push((tensor, slot));
        }

        let mut reshapes = Vec::with_capacity(plan.reshapes.len());
        for (tensor, reshape) in &plan.reshapes {
            let layer = self.add_planned(reshape)?;
            self.graph
                .connect(sources[tensor], InputSlotRef::new(layer, 0))?;
            reshapes.push(layer);
        }

        let primary = self.add_planned(&plan.primary)?;
        for (index, source) in plan.inputs.iter().enumerate() {
            let from = match source {
                SlotSource::Tensor(tensor) => sources[tensor],
                SlotSource::Reshape(reshape) => OutputSlotRef::new(reshapes[*reshape], 0),
            };
            self.graph.connect(from, InputSlotRef::new(primary, index))?;
        }

        let mut last = primary;
        for layer in &plan.tail {
            let next = self.add_planned(layer)?;
            self.graph
                .connect(OutputSlotRef::new(last, 0), InputSlotRef::new(next, 0))?;
            last = next;
        }
        produced.extend(
            plan.outputs
                .iter()
                .enumerate()
                .map(|(slot, tensor)| (*tensor, OutputSlotRef::new(last, slot))),
        );
        Ok((primary, produced))
    }

    /// Adds a planned layer and sets the descriptors of its outputs.
    fn add_planned(
        &mut self,
        planned: &plan::PlannedLayer,
    ) -> std::result::Result<LayerId, GraphError> {
        let layer = self
            .graph
            .add_layer(planned.kind.clone(), planned.name.clone())?;
        for (slot, info) in planned.outputs.iter().enumerate() {
            self.graph
                .set_tensor_info(OutputSlotRef::new(layer, slot), info.clone())?;
        }
        Ok(layer)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Adds one Output layer per model output and returns the completed graph.
    pub fn finish(mut self) -> Result<Graph> {
        for &tensor in &self.model.outputs {
            let boundary = |reason: String| TranslationError::InvalidBoundary {
                direction: "output",
                tensor,
                reason,
            };
            let (index, source) = usize::try_from(tensor)
                .ok()
                .and_then(|t| Some((t, self.model.tensor(t)?)))
                .ok_or_else(|| boundary("no such tensor".to_string()))?;
            let producer = *self
                .producers
                .get(&index)
                .ok_or_else(|| boundary("no operator produces this tensor".to_string()))?;
            let layer = self
                .graph
                .add_output_layer(binding_id(index), source.name.clone())
                .map_err(|e| boundary(e.to_string()))?;
            self.graph
                .connect(producer, InputSlotRef::new(layer, 0))
                .map_err(|e| boundary(e.to_string()))?;
        }
        self.graph.validate().map_err(TranslationError::Incomplete)?;
        Ok(self.graph)
    }
}

/// Translates every operator of `model`, in order, stopping at the first failure.
pub fn translate_model(model: &SourceModel, options: TranslatorOptions) -> Result<Graph> {
    info!(
        "translating {} operator(s) over {} tensor(s)",
        model.operators.len(),
        model.tensors.len()
    );
    let mut translator = Translator::new(model, options)?;
    for index in 0..model.operators.len() {
        translator.translate(index)?;
    }
    let graph = translator.finish()?;
    info!("translation done: {} layer(s)", graph.num_layers());
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{ActivationDescriptor, ActivationFunction, ReshapeDescriptor},
        testing::{const_tensor, float_tensor, int_tensor, model_with, operator},
    };

    fn layer_named<'g>(graph: &'g Graph, name: &str) -> (LayerId, &'g crate::Layer) {
        graph
            .layers()
            .find(|(_, l)| l.name() == name)
            .unwrap_or_else(|| panic!("no layer '{name}'"))
    }

    #[test]
    fn test_fused_activation_feeds_the_consumer() {
        let mut model = model_with(
            vec![
                float_tensor("in", &[1, 3, 3, 1]),
                const_tensor("w", &[1, 1, 1, 1], &[2.0]),
                float_tensor("conv", &[1, 3, 3, 1]),
                float_tensor("out", &[1, 3, 3, 1]),
            ],
            vec![
                operator(BuiltinOperator::Conv2d, &[0, 1], &[2]),
                operator(BuiltinOperator::Relu, &[2], &[3]),
            ],
        );
        model.operators[0].options.fused_activation_function = FusedActivation::Relu6;
        let graph = translate_model(&model, TranslatorOptions::default()).unwrap();

        // in, conv, its activation, relu, out
        assert_eq!(graph.num_layers(), 5);
        let (conv, _) = layer_named(&graph, "Conv2D:0:0");
        let (fused, activation) = layer_named(&graph, "Conv2D:0:0:RELU6");
        assert_eq!(
            activation.kind(),
            &LayerKind::Activation(ActivationDescriptor::new(
                ActivationFunction::BoundedReLu,
                6.0,
                0.0
            ))
        );
        assert_eq!(
            graph.producer(InputSlotRef::new(fused, 0)),
            Some(OutputSlotRef::new(conv, 0))
        );
        let (relu, _) = layer_named(&graph, "Activation:RELU:0:1");
        assert_eq!(
            graph.producer(InputSlotRef::new(relu, 0)),
            Some(OutputSlotRef::new(fused, 0))
        );
        assert_eq!(graph.input_bindings(), vec![0]);
        assert_eq!(graph.output_bindings(), vec![3 << 8]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_constants_are_created_once_on_demand() {
        let model = model_with(
            vec![
                float_tensor("x", &[1, 2]),
                const_tensor("offsets", &[1, 2], &[0.5, -0.5]),
                float_tensor("y", &[1, 2]),
                float_tensor("z", &[1, 2]),
            ],
            vec![
                operator(BuiltinOperator::Add, &[0, 1], &[2]),
                operator(BuiltinOperator::Sub, &[2, 1], &[3]),
            ],
        );
        let graph = translate_model(&model, TranslatorOptions::default()).unwrap();
        let constants = graph
            .layers()
            .filter(|(_, l)| matches!(l.kind(), LayerKind::Constant(_)))
            .collect::<Vec<_>>();
        assert_eq!(constants.len(), 1);
        let (constant, layer) = constants[0];
        assert_eq!(layer.name(), "Constant:offsets");
        let (sub, _) = layer_named(&graph, "Sub:0:1");
        assert_eq!(
            graph.producer(InputSlotRef::new(sub, 1)),
            Some(OutputSlotRef::new(constant, 0))
        );
    }

    #[test]
    fn test_broadcast_reshape_is_wired_between_producer_and_consumer() {
        let model = model_with(
            vec![
                float_tensor("x", &[1, 2, 2, 3]),
                const_tensor("scale", &[3], &[1.0, 2.0, 3.0]),
                float_tensor("y", &[1, 2, 2, 3]),
            ],
            vec![operator(BuiltinOperator::Mul, &[0, 1], &[2])],
        );
        let graph = translate_model(&model, TranslatorOptions::default()).unwrap();
        let (reshape, layer) = layer_named(&graph, "Reshape:for:Mul:0:0");
        assert_eq!(
            layer.kind(),
            &LayerKind::Reshape(ReshapeDescriptor {
                target_shape: vec![1, 1, 1, 3]
            })
        );
        let (constant, _) = layer_named(&graph, "Constant:scale");
        let (mul, _) = layer_named(&graph, "Mul:0:0");
        assert_eq!(
            graph.producer(InputSlotRef::new(reshape, 0)),
            Some(OutputSlotRef::new(constant, 0))
        );
        assert_eq!(
            graph.producer(InputSlotRef::new(mul, 1)),
            Some(OutputSlotRef::new(reshape, 0))
        );
    }

    #[test]
    fn test_failed_operator_leaves_the_graph_untouched() {
        let mut model = model_with(
            vec![
                float_tensor("x", &[1, 2]),
                const_tensor("k", &[1, 2], &[1.0, 1.0]),
                float_tensor("y", &[1, 2]),
                float_tensor("z", &[1, 2]),
            ],
            vec![
                // z is produced by nothing, k is resolved before z
                operator(BuiltinOperator::Add, &[1, 3], &[2]),
                operator(BuiltinOperator::Add, &[0, 1], &[2]),
            ],
        );
        model.inputs.retain(|t| *t != 3);
        let mut translator = Translator::new(&model, TranslatorOptions::default()).unwrap();
        let before = translator.graph().num_layers();
        assert!(matches!(
            translator.translate(0),
            Err(TranslationError::InvalidTensor {
                operator: 0,
                tensor: 3,
                ..
            })
        ));
        assert_eq!(translator.graph().num_layers(), before);

        translator.translate(1).unwrap();
        // x, Constant:k, Add
        assert_eq!(translator.graph().num_layers(), 3);
    }

    #[test]
    fn test_arity_mismatch_leaves_the_graph_untouched() {
        let model = model_with(
            vec![
                float_tensor("x", &[1, 4]),
                float_tensor("y", &[1, 4]),
                float_tensor("z", &[1, 4]),
            ],
            vec![
                operator(BuiltinOperator::Relu, &[0], &[1]),
                operator(BuiltinOperator::Add, &[1], &[2]),
            ],
        );
        let connections = |graph: &Graph| {
            graph
                .layers()
                .map(|(id, layer)| {
                    let outputs = layer
                        .outputs()
                        .iter()
                        .map(|slot| slot.connections().to_vec())
                        .collect_vec();
                    let inputs = layer
                        .inputs()
                        .iter()
                        .map(|slot| slot.connection())
                        .collect_vec();
                    (id, inputs, outputs)
                })
                .collect_vec()
        };
        let mut translator = Translator::new(&model, TranslatorOptions::default()).unwrap();
        translator.translate(0).unwrap();
        let layers = translator.graph().num_layers();
        let wiring = connections(translator.graph());

        match translator.translate(1) {
            Err(TranslationError::Arity {
                operator: 1,
                direction: "input",
                expected,
                actual: 1,
                ..
            }) => assert_eq!(expected, "2"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(translator.graph().num_layers(), layers);
        assert_eq!(connections(translator.graph()), wiring);
    }

    #[test]
    fn test_a_tensor_has_one_producer() {
        let model = model_with(
            vec![float_tensor("x", &[4]), float_tensor("y", &[4])],
            vec![
                operator(BuiltinOperator::Relu, &[0], &[1]),
                operator(BuiltinOperator::Tanh, &[0], &[1]),
            ],
        );
        match translate_model(&model, TranslatorOptions::default()) {
            Err(TranslationError::InvalidTensor {
                operator: 1,
                tensor: 1,
                reason,
            }) => assert_eq!(reason, "tensor already has a producer"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_translation_stops_at_the_first_failure() {
        let model = model_with(
            vec![
                float_tensor("x", &[4]),
                float_tensor("y", &[4]),
                float_tensor("z", &[4]),
            ],
            vec![
                operator(BuiltinOperator::Other("CUSTOM".to_string()), &[0], &[1]),
                operator(BuiltinOperator::Relu, &[1], &[2]),
            ],
        );
        assert!(matches!(
            translate_model(&model, TranslatorOptions::default()),
            Err(TranslationError::UnsupportedOperator { operator: 0, .. })
        ));

        let graph = translate_model(
            &model,
            TranslatorOptions {
                stand_in_for_unsupported: true,
            },
        )
        .unwrap();
        let (stand_in, _) = layer_named(&graph, "StandIn:0:0:CUSTOM");
        let (relu, _) = layer_named(&graph, "Activation:RELU:0:1");
        assert_eq!(
            graph.producer(InputSlotRef::new(relu, 0)),
            Some(OutputSlotRef::new(stand_in, 0))
        );
    }

    #[test]
    fn test_multi_output_operators_bind_every_slot() {
        let model = model_with(
            vec![
                int_tensor("axis", &[], &[1]),
                float_tensor("x", &[1, 4]),
                float_tensor("a", &[1, 2]),
                float_tensor("b", &[1, 2]),
            ],
            vec![{
                let mut op = operator(BuiltinOperator::Split, &[0, 1], &[2, 3]);
                op.options.num_splits = 2;
                op
            }],
        );
        let graph = translate_model(&model, TranslatorOptions::default()).unwrap();
        let (split, _) = layer_named(&graph, "Split:0:0");
        for (binding, slot) in [(2 << 8, 0), (3 << 8, 1)] {
            let output = graph.output_layer_by_binding(binding).unwrap();
            assert_eq!(
                graph.producer(InputSlotRef::new(output, 0)),
                Some(OutputSlotRef::new(split, slot))
            );
        }
        // the axis is only read, never connected
        assert!(graph
            .layers()
            .all(|(_, l)| !matches!(l.kind(), LayerKind::Constant(_))));
    }

    #[test]
    fn test_boundaries_are_checked() {
        let mut model = model_with(
            vec![float_tensor("x", &[4]), float_tensor("y", &[4])],
            vec![operator(BuiltinOperator::Relu, &[0], &[1])],
        );
        model.outputs.push(0);
        model.outputs.push(7);
        assert!(matches!(
            translate_model(&model, TranslatorOptions::default()),
            Err(TranslationError::InvalidBoundary {
                direction: "output",
                tensor: 7,
                ..
            })
        ));

        model.outputs.truncate(1);
        model.inputs.push(1);
        model.operators.clear();
        // without operators, y goes straight from its Input to its Output layer
        let graph = translate_model(&model, TranslatorOptions::default()).unwrap();
        assert_eq!(graph.input_bindings(), vec![0, 1 << 8]);
    }
}
