use super::{BindingId, LayerGuid, LayerId};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("layer {0} does not exist in this graph")]
    UnknownLayer(LayerId),
    #[error("layer {layer} has no {direction} slot {index}")]
    InvalidSlot {
        layer: LayerGuid,
        direction: &'static str,
        index: usize,
    },
    #[error("input slot {index} of layer {layer} is already connected")]
    AlreadyConnected { layer: LayerGuid, index: usize },
    #[error("connecting layer {from} to layer {to} would create a cycle")]
    Cycle { from: LayerGuid, to: LayerGuid },
    #[error("{direction} binding id {binding_id} is already in use")]
    DuplicateBinding {
        direction: &'static str,
        binding_id: BindingId,
    },
    #[error("no {direction} layer is bound to id {binding_id}")]
    UnknownBinding {
        direction: &'static str,
        binding_id: BindingId,
    },
    #[error("input slot {index} of layer {layer} '{name}' is not connected")]
    UnconnectedInput {
        layer: LayerGuid,
        name: String,
        index: usize,
    },
    #[error("output slot {index} of layer {layer} '{name}' has no tensor info")]
    MissingTensorInfo {
        layer: LayerGuid,
        name: String,
        index: usize,
    },
}
