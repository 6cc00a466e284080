//! The graph model: an arena of layers connected through their slots.
//!
//! Layers live in a vector owned by the [`Graph`] and refer to each other through
//! [`LayerId`] indices, never through pointers. An [`InputSlot`] records the output slot
//! feeding it, an [`OutputSlot`] records every input slot it feeds. The connection relation
//! is kept acyclic by [`Graph::connect`].
pub mod descriptors;
mod error;
mod layer;

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
    ops::Index,
};

use tracing::trace;

pub use descriptors::*;
pub use error::GraphError;
pub use layer::{
    BindingId, InputSlot, InputSlotRef, Layer, LayerGuid, LayerId, LayerKind, OutputSlot,
    OutputSlotRef,
};

use crate::tensor::TensorInfo;

#[derive(Debug, Clone, Default)]
pub struct Graph {
    layers: Vec<Layer>,
    guids: BTreeMap<LayerGuid, LayerId>,
    inputs: Vec<LayerId>,
    outputs: Vec<LayerId>,
}

/// Marker returned by [`Graph::checkpoint`], see [`Graph::rollback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    layers: usize,
    inputs: usize,
    outputs: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer of the given kind, with as many unconnected slots as the kind needs.
    /// Input and Output layers are registered as graph boundaries; their binding ids must be
    /// unique among inputs, respectively outputs.
    pub fn add_layer(
        &mut self,
        kind: LayerKind,
        name: impl Into<String>,
    ) -> Result<LayerId, GraphError> {
        match &kind {
            LayerKind::Input { binding_id } => {
                self.ensure_binding_free(&self.inputs, "input", *binding_id)?
            }
            LayerKind::Output { binding_id } => {
                self.ensure_binding_free(&self.outputs, "output", *binding_id)?
            }
            _ => {}
        }
        let id = LayerId(self.layers.len());
        let layer = Layer::new(kind, name);
        trace!("adding layer {layer} as {id}");
        self.guids.insert(layer.guid, id);
        match layer.kind {
            LayerKind::Input { .. } => self.inputs.push(id),
            LayerKind::Output { .. } => self.outputs.push(id),
            _ => {}
        }
        self.layers.push(layer);
        Ok(id)
    }

    pub fn add_input_layer(
        &mut self,
        binding_id: BindingId,
        name: impl Into<String>,
    ) -> Result<LayerId, GraphError> {
        self.add_layer(LayerKind::Input { binding_id }, name)
    }

    pub fn add_output_layer(
        &mut self,
        binding_id: BindingId,
        name: impl Into<String>,
    ) -> Result<LayerId, GraphError> {
        self.add_layer(LayerKind::Output { binding_id }, name)
    }

    fn ensure_binding_free(
        &self,
        boundary: &[LayerId],
        direction: &'static str,
        binding_id: BindingId,
    ) -> Result<(), GraphError> {
        if boundary
            .iter()
            .any(|id| self.layers[id.0].kind.binding_id() == Some(binding_id))
        {
            return Err(GraphError::DuplicateBinding {
                direction,
                binding_id,
            });
        }
        Ok(())
    }

    /// Connects an output slot to an input slot. The input slot must be free and the new edge
    /// must not close a cycle.
    pub fn connect(&mut self, from: OutputSlotRef, to: InputSlotRef) -> Result<(), GraphError> {
        let producer = self.layer(from.layer)?;
        if from.index >= producer.outputs.len() {
            return Err(GraphError::InvalidSlot {
                layer: producer.guid,
                direction: "output",
                index: from.index,
            });
        }
        let consumer = self.layer(to.layer)?;
        let slot = consumer
            .inputs
            .get(to.index)
            .ok_or(GraphError::InvalidSlot {
                layer: consumer.guid,
                direction: "input",
                index: to.index,
            })?;
        if slot.connection.is_some() {
            return Err(GraphError::AlreadyConnected {
                layer: consumer.guid,
                index: to.index,
            });
        }
        if self.reaches(to.layer, from.layer) {
            return Err(GraphError::Cycle {
                from: producer.guid,
                to: consumer.guid,
            });
        }
        self.layers[to.layer.0].inputs[to.index].connection = Some(from);
        self.layers[from.layer.0].outputs[from.index]
            .connections
            .push(to);
        Ok(())
    }

    /// Whether `target` can be reached from `start` following connections downstream.
    fn reaches(&self, start: LayerId, target: LayerId) -> bool {
        let mut visited = vec![false; self.layers.len()];
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if std::mem::replace(&mut visited[id.0], true) {
                continue;
            }
            stack.extend(
                self.layers[id.0]
                    .outputs
                    .iter()
                    .flat_map(|o| o.connections.iter().map(|c| c.layer)),
            );
        }
        false
    }

    pub fn set_tensor_info(
        &mut self,
        slot: OutputSlotRef,
        info: TensorInfo,
    ) -> Result<(), GraphError> {
        let layer = self
            .layers
            .get_mut(slot.layer.0)
            .ok_or(GraphError::UnknownLayer(slot.layer))?;
        let guid = layer.guid;
        let output = layer
            .outputs
            .get_mut(slot.index)
            .ok_or(GraphError::InvalidSlot {
                layer: guid,
                direction: "output",
                index: slot.index,
            })?;
        output.info = Some(info);
        Ok(())
    }

    pub fn layer(&self, id: LayerId) -> Result<&Layer, GraphError> {
        self.layers.get(id.0).ok_or(GraphError::UnknownLayer(id))
    }

    pub fn layer_by_guid(&self, guid: LayerGuid) -> Option<LayerId> {
        self.guids.get(&guid).copied()
    }

    /// Layers in insertion order.
    pub fn layers(&self) -> impl Iterator<Item = (LayerId, &Layer)> {
        self.layers.iter().enumerate().map(|(i, l)| (LayerId(i), l))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn input_layers(&self) -> &[LayerId] {
        &self.inputs
    }

    pub fn output_layers(&self) -> &[LayerId] {
        &self.outputs
    }

    pub fn input_bindings(&self) -> Vec<BindingId> {
        self.bindings(&self.inputs)
    }

    pub fn output_bindings(&self) -> Vec<BindingId> {
        self.bindings(&self.outputs)
    }

    fn bindings(&self, boundary: &[LayerId]) -> Vec<BindingId> {
        boundary
            .iter()
            .filter_map(|id| self.layers[id.0].kind.binding_id())
            .collect()
    }

    pub fn input_layer_by_binding(&self, binding_id: BindingId) -> Option<LayerId> {
        self.inputs
            .iter()
            .copied()
            .find(|id| self.layers[id.0].kind.binding_id() == Some(binding_id))
    }

    pub fn output_layer_by_binding(&self, binding_id: BindingId) -> Option<LayerId> {
        self.outputs
            .iter()
            .copied()
            .find(|id| self.layers[id.0].kind.binding_id() == Some(binding_id))
    }

    /// Reorders the registered input layers to follow `order`, which must be a permutation of
    /// the current input binding ids.
    pub fn reorder_inputs(&mut self, order: &[BindingId]) -> Result<(), GraphError> {
        self.inputs = self.reordered(&self.inputs, "input", order)?;
        Ok(())
    }

    pub fn reorder_outputs(&mut self, order: &[BindingId]) -> Result<(), GraphError> {
        self.outputs = self.reordered(&self.outputs, "output", order)?;
        Ok(())
    }

    fn reordered(
        &self,
        boundary: &[LayerId],
        direction: &'static str,
        order: &[BindingId],
    ) -> Result<Vec<LayerId>, GraphError> {
        let mut reordered = Vec::with_capacity(order.len());
        for binding_id in order {
            let id = boundary
                .iter()
                .copied()
                .find(|id| self.layers[id.0].kind.binding_id() == Some(*binding_id))
                .ok_or(GraphError::UnknownBinding {
                    direction,
                    binding_id: *binding_id,
                })?;
            if reordered.contains(&id) {
                return Err(GraphError::DuplicateBinding {
                    direction,
                    binding_id: *binding_id,
                });
            }
            reordered.push(id);
        }
        if reordered.len() != boundary.len() {
            let missing = boundary
                .iter()
                .find(|id| !reordered.contains(id))
                .and_then(|id| self.layers[id.0].kind.binding_id())
                .unwrap_or_default();
            return Err(GraphError::UnknownBinding {
                direction,
                binding_id: missing,
            });
        }
        Ok(reordered)
    }

    pub fn producer(&self, slot: InputSlotRef) -> Option<OutputSlotRef> {
        self.layers
            .get(slot.layer.0)?
            .inputs
            .get(slot.index)?
            .connection
    }

    pub fn tensor_info(&self, slot: OutputSlotRef) -> Option<&TensorInfo> {
        self.layers
            .get(slot.layer.0)?
            .outputs
            .get(slot.index)?
            .info
            .as_ref()
    }

    /// Descriptor of the tensor flowing into an input slot, read from its producer.
    pub fn input_tensor_info(&self, slot: InputSlotRef) -> Option<&TensorInfo> {
        self.tensor_info(self.producer(slot)?)
    }

    /// Every layer, producers before consumers. Among layers ready at the same time the one
    /// added first comes first, so the order only depends on the graph structure and the
    /// insertion order.
    pub fn topological_order(&self) -> Vec<LayerId> {
        let mut pending: Vec<usize> = self
            .layers
            .iter()
            .map(|l| l.inputs.iter().filter(|s| s.connection.is_some()).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<LayerId>> = pending
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(LayerId(i)))
            .collect();
        let mut order = Vec::with_capacity(self.layers.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for consumer in self.layers[id.0]
                .outputs
                .iter()
                .flat_map(|o| o.connections.iter())
            {
                let n = &mut pending[consumer.layer.0];
                *n -= 1;
                if *n == 0 {
                    ready.push(Reverse(consumer.layer));
                }
            }
        }
        order
    }

    pub fn for_each_layer_in_topological_order<E, F>(&self, mut visitor: F) -> Result<(), E>
    where
        F: FnMut(LayerId, &Layer) -> Result<(), E>,
    {
        for id in self.topological_order() {
            visitor(id, &self.layers[id.0])?;
        }
        Ok(())
    }

    /// Checks the graph is complete: every input slot connected, every output slot typed.
    pub fn validate(&self) -> Result<(), GraphError> {
        for layer in &self.layers {
            if let Some(index) = layer.inputs.iter().position(|s| s.connection.is_none()) {
                return Err(GraphError::UnconnectedInput {
                    layer: layer.guid,
                    name: layer.name.clone(),
                    index,
                });
            }
            if let Some(index) = layer.outputs.iter().position(|s| s.info.is_none()) {
                return Err(GraphError::MissingTensorInfo {
                    layer: layer.guid,
                    name: layer.name.clone(),
                    index,
                });
            }
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            layers: self.layers.len(),
            inputs: self.inputs.len(),
            outputs: self.outputs.len(),
        }
    }

    /// Removes every layer added after `checkpoint`, together with every connection between
    /// them and older layers, in either direction.
    ///
    /// Changes made after the checkpoint to the layers which survive are kept: connections
    /// between two older layers and descriptors set on their output slots are not undone.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        for layer in self.layers.drain(checkpoint.layers..) {
            self.guids.remove(&layer.guid);
        }
        for layer in &mut self.layers {
            for output in &mut layer.outputs {
                output
                    .connections
                    .retain(|c| c.layer.0 < checkpoint.layers);
            }
            for input in &mut layer.inputs {
                if matches!(input.connection, Some(c) if c.layer.0 >= checkpoint.layers) {
                    input.connection = None;
                }
            }
        }
        self.inputs.truncate(checkpoint.inputs);
        self.outputs.truncate(checkpoint.outputs);
    }
}

impl Index<LayerId> for Graph {
    type Output = Layer;

    fn index(&self, id: LayerId) -> &Layer {
        &self.layers[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;

    fn out(layer: LayerId) -> OutputSlotRef {
        OutputSlotRef::new(layer, 0)
    }

    fn inp(layer: LayerId, index: usize) -> InputSlotRef {
        InputSlotRef::new(layer, index)
    }

    /// input -> relu -> output, with a second input added to the relu output.
    fn diamond() -> (Graph, Vec<LayerId>) {
        let mut g = Graph::new();
        let a = g.add_input_layer(0, "a").unwrap();
        let b = g.add_input_layer(1, "b").unwrap();
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
        let add = g.add_layer(LayerKind::Addition, "add").unwrap();
        let o = g.add_output_layer(0, "out").unwrap();
        g.connect(out(a), inp(relu, 0)).unwrap();
        g.connect(out(relu), inp(add, 0)).unwrap();
        g.connect(out(b), inp(add, 1)).unwrap();
        g.connect(out(add), inp(o, 0)).unwrap();
        (g, vec![a, b, relu, add, o])
    }

    #[test]
    fn test_slots_follow_kind() {
        let (g, ids) = diamond();
        assert_eq!(g[ids[0]].inputs().len(), 0);
        assert_eq!(g[ids[0]].outputs().len(), 1);
        assert_eq!(g[ids[3]].inputs().len(), 2);
        assert_eq!(g[ids[4]].outputs().len(), 0);
        assert_eq!(g.input_bindings(), vec![0, 1]);
        assert_eq!(g.output_bindings(), vec![0]);
        assert_eq!(g.producer(inp(ids[3], 1)), Some(out(ids[1])));
        assert_eq!(g.layer_by_guid(g[ids[2]].guid()), Some(ids[2]));
    }

    #[test]
    fn test_connect_rejects_invalid_edges() {
        let (mut g, ids) = diamond();
        assert!(matches!(
            g.connect(out(ids[0]), inp(ids[3], 0)),
            Err(GraphError::AlreadyConnected { index: 0, .. })
        ));
        assert!(matches!(
            g.connect(out(ids[0]), inp(ids[3], 2)),
            Err(GraphError::InvalidSlot {
                direction: "input",
                ..
            })
        ));
        assert!(matches!(
            g.connect(OutputSlotRef::new(ids[0], 1), inp(ids[3], 0)),
            Err(GraphError::InvalidSlot {
                direction: "output",
                ..
            })
        ));
        let floor = g.add_layer(LayerKind::Floor, "floor").unwrap();
        g.connect(out(ids[3]), inp(floor, 0)).unwrap();
        let mul = g.add_layer(LayerKind::Multiplication, "mul").unwrap();
        g.connect(out(floor), inp(mul, 0)).unwrap();
        assert!(matches!(
            g.connect(out(mul), inp(mul, 1)),
            Err(GraphError::Cycle { .. })
        ));
        assert!(matches!(
            g.connect(out(mul), inp(ids[2], 0)),
            Err(GraphError::AlreadyConnected { .. })
        ));
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut g = Graph::new();
        let a = g.add_layer(LayerKind::Floor, "a").unwrap();
        let b = g.add_layer(LayerKind::Floor, "b").unwrap();
        g.connect(out(a), inp(b, 0)).unwrap();
        assert!(matches!(
            g.connect(out(b), inp(a, 0)),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_duplicate_binding() {
        let mut g = Graph::new();
        g.add_input_layer(3, "a").unwrap();
        assert!(matches!(
            g.add_input_layer(3, "b"),
            Err(GraphError::DuplicateBinding {
                direction: "input",
                binding_id: 3
            })
        ));
        // inputs and outputs have separate id spaces
        g.add_output_layer(3, "c").unwrap();
    }

    #[test]
    fn test_topological_order_is_stable() {
        let (g, ids) = diamond();
        assert_eq!(g.topological_order(), ids);

        // a layer added last but feeding an early one still comes first among its consumers
        let mut g = Graph::new();
        let out_layer = g.add_output_layer(0, "out").unwrap();
        let floor = g.add_layer(LayerKind::Floor, "floor").unwrap();
        let input = g.add_input_layer(0, "in").unwrap();
        g.connect(out(floor), inp(out_layer, 0)).unwrap();
        g.connect(out(input), inp(floor, 0)).unwrap();
        assert_eq!(g.topological_order(), vec![input, floor, out_layer]);
    }

    #[test]
    fn test_validate() {
        let (mut g, ids) = diamond();
        assert!(matches!(
            g.validate(),
            Err(GraphError::MissingTensorInfo { index: 0, .. })
        ));
        for id in &ids[..4] {
            g.set_tensor_info(out(*id), TensorInfo::new(vec![1, 4], DataType::Float32))
                .unwrap();
        }
        g.validate().unwrap();
        g.add_layer(LayerKind::Floor, "dangling").unwrap();
        assert!(matches!(
            g.validate(),
            Err(GraphError::UnconnectedInput { index: 0, .. })
        ));
    }

    #[test]
    fn test_rollback_restores_graph() {
        let (mut g, ids) = diamond();
        let before = g.checkpoint();
        let floor = g.add_layer(LayerKind::Floor, "floor").unwrap();
        g.connect(out(ids[2]), inp(floor, 0)).unwrap();
        g.add_output_layer(7, "extra").unwrap();
        assert_eq!(g[ids[2]].outputs()[0].connections().len(), 2);

        let floor_guid = g[floor].guid();
        g.rollback(before);
        assert_eq!(g.num_layers(), 5);
        assert_eq!(g[ids[2]].outputs()[0].connections().len(), 1);
        assert_eq!(g.output_bindings(), vec![0]);
        assert_eq!(g.layer_by_guid(floor_guid), None);
    }

    #[test]
    fn test_rollback_frees_inputs_fed_by_removed_layers() {
        let mut g = Graph::new();
        let a = g.add_input_layer(0, "a").unwrap();
        let floor = g.add_layer(LayerKind::Floor, "floor").unwrap();
        let before = g.checkpoint();
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
        g.connect(out(a), inp(relu, 0)).unwrap();
        g.connect(out(relu), inp(floor, 0)).unwrap();

        g.rollback(before);
        assert_eq!(g.num_layers(), 2);
        assert_eq!(g[floor].inputs()[0].connection(), None);
        assert!(g[a].outputs()[0].connections().is_empty());
        // the freed slot can be fed again
        g.connect(out(a), inp(floor, 0)).unwrap();
    }

    #[test]
    fn test_reorder_inputs() {
        let (mut g, ids) = diamond();
        g.reorder_inputs(&[1, 0]).unwrap();
        assert_eq!(g.input_layers(), &[ids[1], ids[0]]);
        assert!(g.reorder_inputs(&[1]).is_err());
        assert!(g.reorder_inputs(&[1, 1]).is_err());
        assert!(g.reorder_inputs(&[0, 5]).is_err());
    }
}
