//! Builders shared by the test modules of the crate.
use std::collections::BTreeMap;

use crate::{
    graph::{
        Convolution2dDescriptor, Graph, InputSlotRef, LayerId, LayerKind, OriginsDescriptor,
        OutputSlotRef, SoftmaxDescriptor, ViewsDescriptor,
    },
    tensor::{ConstTensor, DataType, TensorInfo},
    translator::model::{BuiltinOperator, SourceModel, SourceOperator, SourceTensor, TensorType},
};

pub(crate) fn connect(g: &mut Graph, from: LayerId, to: LayerId, index: usize) {
    connect_slot(g, from, 0, to, index);
}

pub(crate) fn connect_slot(g: &mut Graph, from: LayerId, slot: usize, to: LayerId, index: usize) {
    g.connect(OutputSlotRef::new(from, slot), InputSlotRef::new(to, index))
        .unwrap();
}

pub(crate) fn set_info(g: &mut Graph, layer: LayerId, slot: usize, shape: &[u32]) {
    g.set_tensor_info(
        OutputSlotRef::new(layer, slot),
        TensorInfo::new(shape.to_vec(), DataType::Float32),
    )
    .unwrap();
}

pub(crate) fn add(g: &mut Graph, kind: LayerKind, name: &str) -> LayerId {
    g.add_layer(kind, name).unwrap()
}

/// A float NHWC graph touching constants, fan-out, multi-output layers and two outputs:
///
/// ```text
/// in -> depthwise -> splitter =(swapped)=> concat -> add(const) -> conv -> softmax -> out0
///                                                       \-> aux (binding 1)
/// ```
pub(crate) fn sample_graph() -> Graph {
    let mut g = Graph::new();
    let input = g.add_input_layer(0, "in").unwrap();
    set_info(&mut g, input, 0, &[1, 4, 4, 2]);

    let weights: Vec<f32> = (0..18).map(|v| v as f32 * 0.25 - 2.0).collect();
    let depthwise = add(
        &mut g,
        LayerKind::DepthwiseConvolution2d {
            descriptor: Convolution2dDescriptor {
                pad_left: 1,
                pad_right: 1,
                pad_top: 1,
                pad_bottom: 1,
                bias_enabled: true,
                ..Default::default()
            },
            weights: ConstTensor::from_f32(&[1, 2, 3, 3], &weights).unwrap(),
            biases: Some(ConstTensor::from_f32(&[2], &[0.5, -0.5]).unwrap()),
        },
        "depthwise",
    );
    connect(&mut g, input, depthwise, 0);
    set_info(&mut g, depthwise, 0, &[1, 4, 4, 2]);

    let splitter = add(
        &mut g,
        LayerKind::Splitter(ViewsDescriptor {
            origins: vec![vec![0, 0, 0, 0], vec![0, 0, 0, 1]],
            sizes: vec![vec![1, 4, 4, 1], vec![1, 4, 4, 1]],
        }),
        "split",
    );
    connect(&mut g, depthwise, splitter, 0);
    set_info(&mut g, splitter, 0, &[1, 4, 4, 1]);
    set_info(&mut g, splitter, 1, &[1, 4, 4, 1]);

    let concat = add(
        &mut g,
        LayerKind::Concat(OriginsDescriptor {
            concat_axis: 3,
            view_origins: vec![vec![0, 0, 0, 0], vec![0, 0, 0, 1]],
        }),
        "concat",
    );
    connect_slot(&mut g, splitter, 1, concat, 0);
    connect_slot(&mut g, splitter, 0, concat, 1);
    set_info(&mut g, concat, 0, &[1, 4, 4, 2]);

    let constant = add(
        &mut g,
        LayerKind::Constant(ConstTensor::from_f32(&[1, 1, 1, 2], &[1.5, 2.5]).unwrap()),
        "Constant:offsets",
    );
    set_info(&mut g, constant, 0, &[1, 1, 1, 2]);
    let addition = add(&mut g, LayerKind::Addition, "add");
    connect(&mut g, concat, addition, 0);
    connect(&mut g, constant, addition, 1);
    set_info(&mut g, addition, 0, &[1, 4, 4, 2]);

    let conv = add(
        &mut g,
        LayerKind::Convolution2d {
            descriptor: Convolution2dDescriptor::default(),
            weights: ConstTensor::from_f32(&[3, 1, 1, 2], &[1.0, -1.0, 0.5, 0.5, -2.0, 2.0])
                .unwrap(),
            biases: None,
        },
        "conv",
    );
    connect(&mut g, addition, conv, 0);
    set_info(&mut g, conv, 0, &[1, 4, 4, 3]);

    let softmax = add(
        &mut g,
        LayerKind::Softmax(SoftmaxDescriptor::default()),
        "softmax",
    );
    connect(&mut g, conv, softmax, 0);
    set_info(&mut g, softmax, 0, &[1, 4, 4, 3]);

    let aux = g.add_output_layer(1, "aux").unwrap();
    connect(&mut g, addition, aux, 0);
    let output = g.add_output_layer(0, "out").unwrap();
    connect(&mut g, softmax, output, 0);
    g
}

/// Asserts two graphs hold the same layers, in the same topological order, wired the same
/// way, with the same boundaries.
pub(crate) fn assert_equivalent(a: &Graph, b: &Graph) {
    let order_a = a.topological_order();
    let order_b = b.topological_order();
    assert_eq!(order_a.len(), order_b.len(), "layer counts differ");
    let position = |order: &[LayerId]| -> BTreeMap<LayerId, usize> {
        order.iter().enumerate().map(|(p, id)| (*id, p)).collect()
    };
    let (pos_a, pos_b) = (position(&order_a), position(&order_b));
    for (ia, ib) in order_a.iter().zip(&order_b) {
        let (la, lb) = (&a[*ia], &b[*ib]);
        assert_eq!(la.name(), lb.name());
        assert_eq!(la.kind(), lb.kind(), "layer '{}'", la.name());
        let infos = |l: &crate::Layer| -> Vec<Option<TensorInfo>> {
            l.outputs().iter().map(|o| o.tensor_info().cloned()).collect()
        };
        assert_eq!(infos(la), infos(lb), "layer '{}'", la.name());
        for index in 0..la.inputs().len() {
            let pa = a.producer(InputSlotRef::new(*ia, index)).unwrap();
            let pb = b.producer(InputSlotRef::new(*ib, index)).unwrap();
            assert_eq!(pos_a[&pa.layer], pos_b[&pb.layer], "layer '{}'", la.name());
            assert_eq!(pa.index, pb.index, "layer '{}'", la.name());
        }
    }
    assert_eq!(a.input_bindings(), b.input_bindings());
    assert_eq!(a.output_bindings(), b.output_bindings());
}

pub(crate) fn float_tensor(name: &str, shape: &[i32]) -> SourceTensor {
    SourceTensor {
        name: name.to_string(),
        shape: shape.to_vec(),
        shape_signature: None,
        tensor_type: TensorType::Float32,
        data: None,
        quantization: None,
    }
}

pub(crate) fn const_tensor(name: &str, shape: &[i32], values: &[f32]) -> SourceTensor {
    SourceTensor {
        data: Some(values.iter().flat_map(|v| v.to_le_bytes()).collect()),
        ..float_tensor(name, shape)
    }
}

pub(crate) fn int_tensor(name: &str, shape: &[i32], values: &[i32]) -> SourceTensor {
    SourceTensor {
        tensor_type: TensorType::Int32,
        data: Some(values.iter().flat_map(|v| v.to_le_bytes()).collect()),
        ..float_tensor(name, shape)
    }
}

pub(crate) fn operator(op: BuiltinOperator, inputs: &[i32], outputs: &[i32]) -> SourceOperator {
    SourceOperator {
        op,
        inputs: inputs.to_vec(),
        outputs: outputs.to_vec(),
        ..Default::default()
    }
}

/// A model whose inputs are the non-constant tensors no operator produces, and whose outputs
/// are the produced tensors no operator consumes.
pub(crate) fn model_with(
    tensors: Vec<SourceTensor>,
    operators: Vec<SourceOperator>,
) -> SourceModel {
    let produced = |t: i32| operators.iter().any(|op| op.outputs.contains(&t));
    let consumed = |t: i32| operators.iter().any(|op| op.inputs.contains(&t));
    let ids = 0..tensors.len() as i32;
    let inputs = ids
        .clone()
        .filter(|t| !tensors[*t as usize].is_constant() && !produced(*t))
        .collect();
    let outputs = ids.filter(|t| produced(*t) && !consumed(*t)).collect();
    SourceModel {
        tensors,
        operators,
        inputs,
        outputs,
    }
}
