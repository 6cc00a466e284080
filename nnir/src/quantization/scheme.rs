use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::QuantizationError;
use crate::tensor::{ConstTensor, DataType, TensorInfo};

/// Maps an observed `[min, max]` range to a `(scale, offset)` pair in a reduced precision
/// data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
pub enum QuantizationScheme {
    /// 8 bits unsigned with a zero point.
    #[default]
    QAsymmU8,
    /// 8 bits signed with a zero point.
    QAsymmS8,
    /// 8 bits signed, zero point fixed at 0.
    QSymmS8,
    /// 16 bits signed, zero point fixed at 0.
    QSymmS16,
}

impl QuantizationScheme {
    pub fn data_type(&self) -> DataType {
        match self {
            QuantizationScheme::QAsymmU8 => DataType::QAsymmU8,
            QuantizationScheme::QAsymmS8 => DataType::QAsymmS8,
            QuantizationScheme::QSymmS8 => DataType::QSymmS8,
            QuantizationScheme::QSymmS16 => DataType::QSymmS16,
        }
    }

    pub fn num_bits(&self) -> u32 {
        match self {
            QuantizationScheme::QSymmS16 => 16,
            _ => 8,
        }
    }

    /// Range of the integer container, used to clamp quantized values.
    pub fn quantized_domain(&self) -> (i32, i32) {
        match self {
            QuantizationScheme::QAsymmU8 => (u8::MIN as i32, u8::MAX as i32),
            QuantizationScheme::QAsymmS8 | QuantizationScheme::QSymmS8 => {
                (i8::MIN as i32, i8::MAX as i32)
            }
            QuantizationScheme::QSymmS16 => (i16::MIN as i32, i16::MAX as i32),
        }
    }

    /// Computes the quantization parameters for values observed in `[min, max]`.
    ///
    /// The range is always widened to contain zero so that zero is exactly representable.
    pub fn compute(&self, min: f64, max: f64) -> Result<(f32, i32), QuantizationError> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(QuantizationError::InvalidRange {
                min: min as f32,
                max: max as f32,
            });
        }
        let min = min.min(0.0);
        let mut max = max.max(0.0);
        // avoids a zero scale for all-zero tensors
        if min == 0.0 && max == 0.0 {
            max = 1.0;
        }
        match self {
            QuantizationScheme::QAsymmU8 | QuantizationScheme::QAsymmS8 => {
                let highest = ((1u32 << self.num_bits()) - 1) as f64;
                let scale = (max - min) / highest;
                let offset = (-min / scale).clamp(0.0, highest).round() as i32;
                let offset = if *self == QuantizationScheme::QAsymmS8 {
                    offset - 128
                } else {
                    offset
                };
                Ok((scale as f32, offset))
            }
            QuantizationScheme::QSymmS8 | QuantizationScheme::QSymmS16 => {
                let highest = ((1u32 << (self.num_bits() - 1)) - 1) as f64;
                let extent = min.abs().max(max.abs());
                Ok(((extent / highest) as f32, 0))
            }
        }
    }

    /// `q = clamp(round(value / scale) + offset)`
    pub fn quantize_value(&self, value: f32, scale: f32, offset: i32) -> i32 {
        let (lo, hi) = self.quantized_domain();
        let quantized = (value / scale).round() as i64 + offset as i64;
        if quantized < lo as i64 || quantized > hi as i64 {
            warn!("Quantized value {quantized} from {value} is out of range [{lo}, {hi}]");
        }
        quantized.clamp(lo as i64, hi as i64) as i32
    }

    /// Requantizes a floating point constant over its own value range. Constants which are
    /// not floating point are returned unchanged.
    pub fn quantize_constant(
        &self,
        tensor: &ConstTensor,
    ) -> Result<ConstTensor, QuantizationError> {
        if !tensor.data_type().is_float() {
            return Ok(tensor.clone());
        }
        let values = tensor.to_f32()?;
        let (min, max) = tensor.min_max()?;
        let (scale, offset) = self.compute(min as f64, max as f64)?;
        let info = TensorInfo::quantized(
            tensor.info().shape().clone(),
            self.data_type(),
            scale,
            offset,
        );
        let quantized = values
            .iter()
            .map(|v| self.quantize_value(*v, scale, offset));
        let tensor = match self {
            QuantizationScheme::QAsymmU8 => {
                ConstTensor::from_values(info, &quantized.map(|q| q as u8).collect::<Vec<_>>())
            }
            QuantizationScheme::QAsymmS8 | QuantizationScheme::QSymmS8 => {
                ConstTensor::from_values(info, &quantized.map(|q| q as i8).collect::<Vec<_>>())
            }
            QuantizationScheme::QSymmS16 => {
                ConstTensor::from_values(info, &quantized.map(|q| q as i16).collect::<Vec<_>>())
            }
        }?;
        Ok(tensor)
    }
}

/// Requantizes a bias against the scale of the activations it is added to.
///
/// The bias scale is the product of the input scale and the weight scale, with a zero
/// offset, and values are stored as 32 bits signed integers.
pub fn quantize_bias(
    bias: &ConstTensor,
    input_scale: f32,
    weight_scale: f32,
) -> Result<ConstTensor, QuantizationError> {
    if !bias.data_type().is_float() {
        return Ok(bias.clone());
    }
    let scale = input_scale * weight_scale;
    if !(scale.is_finite() && scale > 0.0) {
        return Err(QuantizationError::InvalidBiasScale {
            input_scale,
            weight_scale,
        });
    }
    let values = bias
        .to_f32()?
        .iter()
        .map(|v| {
            let quantized = f64::from((v / scale).round());
            if !(f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&quantized) {
                warn!(
                    "Quantized bias {quantized} from {v} is out of range [{}, {}]",
                    i32::MIN,
                    i32::MAX
                );
            }
            quantized as i32
        })
        .collect::<Vec<_>>();
    let info = TensorInfo::quantized(
        bias.info().shape().clone(),
        DataType::Signed32,
        scale,
        0,
    );
    Ok(ConstTensor::from_values(info, &values)?)
}

impl FromStr for QuantizationScheme {
    type Err = QuantizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "qasymmu8" | "qasymm8" => Ok(QuantizationScheme::QAsymmU8),
            "qasymms8" => Ok(QuantizationScheme::QAsymmS8),
            "qsymms8" | "qsymm8" => Ok(QuantizationScheme::QSymmS8),
            "qsymms16" | "qsymm16" => Ok(QuantizationScheme::QSymmS16),
            _ => Err(QuantizationError::UnknownScheme(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::tensor::Cell;

    #[rstest]
    #[case(QuantizationScheme::QAsymmU8, -1.0, 1.0, 2.0 / 255.0, 128)]
    #[case(QuantizationScheme::QAsymmU8, 0.0, 0.0, 1.0 / 255.0, 0)]
    #[case(QuantizationScheme::QAsymmU8, 1.0, 5.0, 5.0 / 255.0, 0)]
    #[case(QuantizationScheme::QAsymmU8, -5.0, -1.0, 5.0 / 255.0, 255)]
    #[case(QuantizationScheme::QAsymmS8, -1.0, 1.0, 2.0 / 255.0, 0)]
    #[case(QuantizationScheme::QSymmS8, -2.0, 1.0, 2.0 / 127.0, 0)]
    #[case(QuantizationScheme::QSymmS16, -1.0, 3.0, 3.0 / 32767.0, 0)]
    fn test_compute(
        #[case] scheme: QuantizationScheme,
        #[case] min: f64,
        #[case] max: f64,
        #[case] scale: f64,
        #[case] offset: i32,
    ) {
        let (s, o) = scheme.compute(min, max).unwrap();
        assert_eq!(s, scale as f32);
        assert_eq!(o, offset);
    }

    #[test]
    fn test_invalid_range() {
        assert!(matches!(
            QuantizationScheme::QAsymmU8.compute(1.0, -1.0),
            Err(QuantizationError::InvalidRange { .. })
        ));
        assert!(QuantizationScheme::QSymmS8.compute(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_quantize_value_clamps() {
        let scheme = QuantizationScheme::QAsymmU8;
        assert_eq!(scheme.quantize_value(1.0, 0.5, 10), 12);
        assert_eq!(scheme.quantize_value(1000.0, 0.5, 10), 255);
        assert_eq!(scheme.quantize_value(-1000.0, 0.5, 10), 0);
        assert_eq!(QuantizationScheme::QSymmS16.quantize_value(-1.0, 1e-4, 0), -10000);
    }

    #[test]
    fn test_quantize_constant() {
        let t = ConstTensor::from_f32(&[4], &[-1.0, 0.0, 0.5, 1.0]).unwrap();
        let q = QuantizationScheme::QAsymmU8.quantize_constant(&t).unwrap();
        assert_eq!(q.data_type(), DataType::QAsymmU8);
        assert_eq!(q.info().offset(), 128);
        assert_eq!(q.info().scale(), (2.0f64 / 255.0) as f32);
        assert_eq!(q.data(), &[1, 128, 192, 255]);
        assert!(q.info().is_constant());

        let ints = ConstTensor::from_values(TensorInfo::new(vec![2], DataType::Signed32), &[
            1i32, 2,
        ])
        .unwrap();
        assert_eq!(
            QuantizationScheme::QSymmS8.quantize_constant(&ints).unwrap(),
            ints
        );
    }

    #[test]
    fn test_bias_uses_product_of_scales() {
        let bias = ConstTensor::from_f32(&[2], &[3.0, -1.0]).unwrap();
        let q = quantize_bias(&bias, 0.5, 0.1).unwrap();
        assert_eq!(q.data_type(), DataType::Signed32);
        assert_eq!(q.info().scale(), 0.05f32);
        assert_eq!(q.info().offset(), 0);
        let mut expected = Vec::new();
        i32::write_cells(&[60, -20], &mut expected);
        assert_eq!(q.data(), expected.as_slice());
    }

    #[test]
    fn test_bias_beyond_32_bits_is_clamped() {
        let bias = ConstTensor::from_f32(&[3], &[1.0, -1.0, 0.0]).unwrap();
        let q = quantize_bias(&bias, 1e-6, 1e-6).unwrap();
        assert_eq!(q.to_i64().unwrap(), vec![i32::MAX as i64, i32::MIN as i64, 0]);
    }

    #[test]
    fn test_scheme_from_str() {
        assert_eq!(
            "QAsymmS8".parse::<QuantizationScheme>().unwrap(),
            QuantizationScheme::QAsymmS8
        );
        assert_eq!(
            "qsymm-s16".parse::<QuantizationScheme>().unwrap(),
            QuantizationScheme::QSymmS16
        );
        assert!("int4".parse::<QuantizationScheme>().is_err());
    }
}
