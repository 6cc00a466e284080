use tracing::debug;

use super::{
    model::SourceModel,
    plan::plan_operator,
    TranslationError, TranslatorOptions,
};
use crate::{graph::LayerKind, tensor::TensorInfo};

/// Capability of some executor to run a layer, consulted by [`check_support`].
pub trait LayerSupport {
    /// Returns whether a layer of `kind` with the given input and output descriptors can
    /// run, and when it cannot, why.
    fn is_supported(
        &self,
        kind: &LayerKind,
        inputs: &[TensorInfo],
        outputs: &[TensorInfo],
    ) -> (bool, String);
}

impl<F> LayerSupport for F
where
    F: Fn(&LayerKind, &[TensorInfo], &[TensorInfo]) -> (bool, String),
{
    fn is_supported(
        &self,
        kind: &LayerKind,
        inputs: &[TensorInfo],
        outputs: &[TensorInfo],
    ) -> (bool, String) {
        self(kind, inputs, outputs)
    }
}

/// Checks whether operator `index` of `model` could run on `support`, without building
/// anything. Every layer the operator translates into is queried; the first one refused
/// decides the answer and its name prefixes the reason.
///
/// Operators which cannot be translated at all are errors, not refusals.
pub fn check_support(
    model: &SourceModel,
    index: usize,
    support: &dyn LayerSupport,
) -> Result<(bool, String), TranslationError> {
    let plan = plan_operator(model, index, &TranslatorOptions::default())?;
    for layer in plan.layers() {
        let (supported, reason) = support.is_supported(&layer.kind, &layer.inputs, &layer.outputs);
        if !supported {
            debug!("operator {index}: layer '{}' refused: {reason}", layer.name);
            return Ok((false, format!("{}: {reason}", layer.name)));
        }
    }
    Ok((true, String::new()))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{
        graph::ActivationFunction,
        testing::{const_tensor, float_tensor, model_with, operator},
        translator::model::{BuiltinOperator, FusedActivation},
        DataType,
    };

    fn conv_relu6() -> SourceModel {
        let mut model = model_with(
            vec![
                float_tensor("in", &[1, 3, 3, 1]),
                const_tensor("w", &[1, 1, 1, 1], &[2.0]),
                float_tensor("out", &[1, 3, 3, 1]),
            ],
            vec![operator(BuiltinOperator::Conv2d, &[0, 1], &[2])],
        );
        model.operators[0].options.fused_activation_function = FusedActivation::Relu6;
        model
    }

    #[test]
    fn test_every_planned_layer_is_queried() {
        let queried = RefCell::new(Vec::new());
        let support = |kind: &LayerKind, inputs: &[TensorInfo], outputs: &[TensorInfo]| {
            queried
                .borrow_mut()
                .push((kind.name(), inputs.len(), outputs.len()));
            (true, String::new())
        };
        assert_eq!(
            check_support(&conv_relu6(), 0, &support).unwrap(),
            (true, String::new())
        );
        assert_eq!(
            queried.into_inner(),
            vec![("Convolution2d", 1, 1), ("Activation", 1, 1)]
        );
    }

    #[test]
    fn test_refusal_names_the_layer() {
        let support = |kind: &LayerKind, _: &[TensorInfo], _: &[TensorInfo]| match kind {
            LayerKind::Activation(d) if d.function == ActivationFunction::BoundedReLu => {
                (false, "bounded activations are not available".to_string())
            }
            _ => (true, String::new()),
        };
        assert_eq!(
            check_support(&conv_relu6(), 0, &support).unwrap(),
            (
                false,
                "Conv2D:0:0:RELU6: bounded activations are not available".to_string()
            )
        );
    }

    #[test]
    fn test_descriptors_reach_the_query() {
        let support = |_: &LayerKind, inputs: &[TensorInfo], _: &[TensorInfo]| {
            let float = inputs.iter().all(|i| i.data_type() == DataType::Float32);
            (float, "only float inputs".to_string())
        };
        assert!(check_support(&conv_relu6(), 0, &support).unwrap().0);
    }

    #[test]
    fn test_untranslatable_operator_is_an_error() {
        let model = model_with(
            vec![float_tensor("a", &[2]), float_tensor("b", &[2])],
            vec![operator(
                BuiltinOperator::Other("WHILE".to_string()),
                &[0],
                &[1],
            )],
        );
        let support = |_: &LayerKind, _: &[TensorInfo], _: &[TensorInfo]| (true, String::new());
        assert!(matches!(
            check_support(&model, 0, &support),
            Err(TranslationError::UnsupportedOperator { operator: 0, .. })
        ));
    }
}
