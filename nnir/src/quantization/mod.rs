//! Module that takes care of quantizing a floating point graph.
mod error;
mod range_tracker;
mod rewriter;
mod scheme;
mod static_ranges;

use once_cell::sync::Lazy;
use std::env;

pub use error::QuantizationError;
pub use range_tracker::{MinMaxRange, NamedRanges, RangeTracker};
pub use rewriter::{quantize_graph, QuantizerOptions};
pub use scheme::{quantize_bias, QuantizationScheme};
pub use static_ranges::estimate_static_ranges;

// Half width of the fallback range, overridable through NNIR_DEFAULT_RANGE
pub static DEFAULT_RANGE_EXTENT: Lazy<f32> = Lazy::new(|| {
    env::var("NNIR_DEFAULT_RANGE")
        .ok()
        .and_then(|val| val.parse::<f32>().ok())
        .filter(|val| val.is_finite() && *val > 0.0)
        .unwrap_or(15.0)
});

/// Symmetric range assumed for tensors nothing is known about.
pub fn default_range() -> MinMaxRange {
    (-*DEFAULT_RANGE_EXTENT, *DEFAULT_RANGE_EXTENT)
}
