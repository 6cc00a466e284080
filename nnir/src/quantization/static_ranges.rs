//! Range estimation without running the network.
//!
//! Ranges follow from what each operator is known to produce: bounded activations have fixed
//! ranges, constants use their own values and layers which only move data around keep the
//! range of their input. Anything else falls back to the default range.
use tracing::debug;

use super::{default_range, MinMaxRange, QuantizationError, RangeTracker};
use crate::graph::{ActivationFunction, Graph, InputSlotRef, LayerId, LayerKind};

pub fn estimate_static_ranges(graph: &Graph) -> Result<RangeTracker, QuantizationError> {
    let default = default_range();
    let mut tracker = RangeTracker::new().with_default_range(default);
    graph.for_each_layer_in_topological_order(|id, layer| {
        let range = match layer.kind() {
            LayerKind::Activation(d) => match d.function {
                ActivationFunction::Abs
                | ActivationFunction::Linear
                | ActivationFunction::ReLu
                | ActivationFunction::SoftReLu => (0.0, default.1),
                ActivationFunction::BoundedReLu => (d.b.min(d.a), d.a.max(d.b)),
                ActivationFunction::TanH => (-1.0, 1.0),
                ActivationFunction::Sigmoid => (0.0, 1.0),
                ActivationFunction::LeakyReLu => (default.0 / 3.0, default.1),
                _ => default,
            },
            LayerKind::Softmax(_) => (0.0, 1.0),
            LayerKind::Constant(t) if t.data_type().is_float() => t.min_max()?,
            LayerKind::Concat(d) => (0..d.num_views())
                .map(|i| input_range(graph, &tracker, id, i))
                .fold((f32::MAX, f32::MIN), |(lo, hi), (min, max)| {
                    (lo.min(min), hi.max(max))
                }),
            LayerKind::BatchToSpaceNd(_)
            | LayerKind::DepthToSpace(_)
            | LayerKind::Gather(_)
            | LayerKind::Pad(_)
            | LayerKind::Permute(_)
            | LayerKind::Pooling2d(_)
            | LayerKind::Reshape(_)
            | LayerKind::Resize(_)
            | LayerKind::Slice(_)
            | LayerKind::SpaceToBatchNd(_)
            | LayerKind::SpaceToDepth(_)
            | LayerKind::Splitter(_)
            | LayerKind::StridedSlice(_)
            | LayerKind::Transpose(_) => input_range(graph, &tracker, id, 0),
            _ => default,
        };
        debug!("static range of {layer}: [{}, {}]", range.0, range.1);
        for slot in 0..layer.outputs().len() {
            tracker.set_range(layer.guid(), slot, range.0, range.1)?;
        }
        Ok::<_, QuantizationError>(())
    })?;
    Ok(tracker)
}

fn input_range(graph: &Graph, tracker: &RangeTracker, id: LayerId, index: usize) -> MinMaxRange {
    graph
        .producer(InputSlotRef::new(id, index))
        .and_then(|p| tracker.range(graph[p.layer].guid(), p.index))
        .unwrap_or_else(default_range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::{ActivationDescriptor, OriginsDescriptor, OutputSlotRef, ReshapeDescriptor},
        tensor::ConstTensor,
    };

    #[test]
    fn test_static_ranges() {
        let mut g = Graph::new();
        let input = g.add_input_layer(0, "in").unwrap();
        let relu6 = g
            .add_layer(
                LayerKind::Activation(ActivationDescriptor::new(
                    ActivationFunction::BoundedReLu,
                    6.0,
                    0.0,
                )),
                "relu6",
            )
            .unwrap();
        let reshape = g
            .add_layer(
                LayerKind::Reshape(ReshapeDescriptor {
                    target_shape: vec![4],
                }),
                "reshape",
            )
            .unwrap();
        let constant = g
            .add_layer(
                LayerKind::Constant(ConstTensor::from_f32(&[4], &[-8.0, 0.0, 1.0, 2.0]).unwrap()),
                "const",
            )
            .unwrap();
        let concat = g
            .add_layer(
                LayerKind::Concat(OriginsDescriptor {
                    concat_axis: 0,
                    view_origins: vec![vec![0], vec![4]],
                }),
                "concat",
            )
            .unwrap();
        g.connect(OutputSlotRef::new(input, 0), InputSlotRef::new(relu6, 0))
            .unwrap();
        g.connect(OutputSlotRef::new(relu6, 0), InputSlotRef::new(reshape, 0))
            .unwrap();
        g.connect(OutputSlotRef::new(reshape, 0), InputSlotRef::new(concat, 0))
            .unwrap();
        g.connect(OutputSlotRef::new(constant, 0), InputSlotRef::new(concat, 1))
            .unwrap();

        let tracker = estimate_static_ranges(&g).unwrap();
        assert_eq!(tracker.range(g[input].guid(), 0), Some(default_range()));
        assert_eq!(tracker.range(g[relu6].guid(), 0), Some((0.0, 6.0)));
        assert_eq!(tracker.range(g[reshape].guid(), 0), Some((0.0, 6.0)));
        assert_eq!(tracker.range(g[constant].guid(), 0), Some((-8.0, 2.0)));
        assert_eq!(tracker.range(g[concat].guid(), 0), Some((-8.0, 6.0)));
    }
}
