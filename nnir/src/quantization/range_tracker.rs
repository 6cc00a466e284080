use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::QuantizationError;
use crate::graph::{Graph, LayerGuid};

/// Observed `(min, max)` of the values flowing out of one output slot.
pub type MinMaxRange = (f32, f32);

/// Write-once table of observed ranges, keyed by producing layer and output slot index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeTracker {
    ranges: BTreeMap<(LayerGuid, usize), MinMaxRange>,
    default_range: Option<MinMaxRange>,
}

impl RangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Range reported for slots nothing was recorded for. Without one, such slots are an
    /// error during quantization.
    pub fn with_default_range(mut self, range: MinMaxRange) -> Self {
        self.default_range = Some(range);
        self
    }

    pub fn default_range(&self) -> Option<MinMaxRange> {
        self.default_range
    }

    pub fn set_range(
        &mut self,
        layer: LayerGuid,
        slot: usize,
        min: f32,
        max: f32,
    ) -> Result<(), QuantizationError> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(QuantizationError::InvalidRange { min, max });
        }
        if self.ranges.contains_key(&(layer, slot)) {
            return Err(QuantizationError::RangeAlreadyRecorded { layer, slot });
        }
        self.ranges.insert((layer, slot), (min, max));
        Ok(())
    }

    /// Whether a range was explicitly recorded, ignoring the default.
    pub fn has_range(&self, layer: LayerGuid, slot: usize) -> bool {
        self.ranges.contains_key(&(layer, slot))
    }

    pub fn range(&self, layer: LayerGuid, slot: usize) -> Option<MinMaxRange> {
        self.ranges
            .get(&(layer, slot))
            .copied()
            .or(self.default_range)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Records every range of `named` against the layers of `graph` carrying those names.
    pub fn record_named(
        &mut self,
        graph: &Graph,
        named: &NamedRanges,
    ) -> Result<(), QuantizationError> {
        for (name, ranges) in &named.0 {
            let guid = graph
                .layers()
                .find(|(_, l)| l.name() == name)
                .map(|(_, l)| l.guid())
                .ok_or_else(|| QuantizationError::UnknownLayerName(name.clone()))?;
            for (slot, (min, max)) in ranges.iter().enumerate() {
                self.set_range(guid, slot, *min, *max)?;
            }
        }
        Ok(())
    }
}

/// Ranges keyed by layer name, one entry per output slot. This is the form ranges take
/// outside of a process, since layer GUIDs are only meaningful within one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedRanges(pub BTreeMap<String, Vec<MinMaxRange>>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LayerKind;

    #[test]
    fn test_write_once() {
        let mut g = Graph::new();
        let id = g.add_input_layer(0, "in").unwrap();
        let guid = g[id].guid();
        let mut tracker = RangeTracker::new();
        tracker.set_range(guid, 0, -1.0, 2.0).unwrap();
        assert_eq!(tracker.range(guid, 0), Some((-1.0, 2.0)));
        assert!(matches!(
            tracker.set_range(guid, 0, 0.0, 1.0),
            Err(QuantizationError::RangeAlreadyRecorded { slot: 0, .. })
        ));
        assert_eq!(tracker.range(guid, 0), Some((-1.0, 2.0)));
        assert_eq!(tracker.range(guid, 1), None);
        assert!(matches!(
            tracker.set_range(guid, 1, 3.0, 1.0),
            Err(QuantizationError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_default_range() {
        let mut g = Graph::new();
        let id = g.add_layer(LayerKind::Floor, "floor").unwrap();
        let tracker = RangeTracker::new().with_default_range((-15.0, 15.0));
        assert_eq!(tracker.range(g[id].guid(), 0), Some((-15.0, 15.0)));
        assert!(!tracker.has_range(g[id].guid(), 0));
    }

    #[test]
    fn test_named_ranges() {
        let mut g = Graph::new();
        let id = g.add_input_layer(0, "in").unwrap();
        let named: NamedRanges = serde_json::from_str(r#"{"in": [[-2.0, 4.0]]}"#).unwrap();
        let mut tracker = RangeTracker::new();
        tracker.record_named(&g, &named).unwrap();
        assert_eq!(tracker.range(g[id].guid(), 0), Some((-2.0, 4.0)));

        let unknown: NamedRanges = serde_json::from_str(r#"{"nope": [[0.0, 1.0]]}"#).unwrap();
        assert!(matches!(
            tracker.record_named(&g, &unknown),
            Err(QuantizationError::UnknownLayerName(_))
        ));
    }
}
