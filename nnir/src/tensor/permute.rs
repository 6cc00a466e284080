//! Dimension permutations of shapes and constant payloads.
use serde::{Deserialize, Serialize};

use super::{ConstTensor, TensorError, TensorShape};

/// Maps every source dimension `i` to the destination dimension `mappings[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermutationVector(Vec<u32>);

impl PermutationVector {
    pub fn new(mappings: Vec<u32>) -> Result<Self, TensorError> {
        let mut seen = vec![false; mappings.len()];
        for m in &mappings {
            match seen.get_mut(*m as usize) {
                Some(slot) if !*slot => *slot = true,
                _ => {
                    return Err(TensorError::Permutation(format!(
                        "{mappings:?} is not a permutation of 0..{}",
                        mappings.len()
                    )));
                }
            }
        }
        Ok(Self(mappings))
    }

    pub fn mappings(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The permutation undoing this one.
    pub fn inverse(&self) -> Self {
        let mut inverse = vec![0u32; self.0.len()];
        for (src, dst) in self.0.iter().enumerate() {
            inverse[*dst as usize] = src as u32;
        }
        Self(inverse)
    }

    pub fn permute_shape(&self, shape: &[u32]) -> Result<Vec<u32>, TensorError> {
        self.check_rank(shape.len())?;
        let mut out = vec![0u32; shape.len()];
        for (src, dst) in self.0.iter().enumerate() {
            out[*dst as usize] = shape[src];
        }
        Ok(out)
    }

    /// Moves every `cell_size` wide cell of a row-major tensor of `shape` to its permuted
    /// position.
    pub fn permute_data(
        &self,
        shape: &[u32],
        data: &[u8],
        cell_size: usize,
    ) -> Result<Vec<u8>, TensorError> {
        let dst_shape = self.permute_shape(shape)?;
        let src_shape = TensorShape::new(shape);
        let num_elements = src_shape.num_elements()?;
        let expected = num_elements
            .checked_mul(cell_size)
            .ok_or_else(|| TensorError::TooManyElements(src_shape.to_string()))?;
        if data.len() != expected {
            return Err(TensorError::PayloadSize {
                expected,
                actual: data.len(),
            });
        }
        let dst_strides = row_major_strides(&dst_shape);
        let mut out = vec![0u8; data.len()];
        let mut coords = vec![0usize; shape.len()];
        for src_index in 0..num_elements {
            let dst_index: usize = coords
                .iter()
                .zip(&self.0)
                .map(|(c, dst_dim)| c * dst_strides[*dst_dim as usize])
                .sum();
            out[dst_index * cell_size..(dst_index + 1) * cell_size]
                .copy_from_slice(&data[src_index * cell_size..(src_index + 1) * cell_size]);
            // row-major increment of the source coordinates
            for dim in (0..coords.len()).rev() {
                coords[dim] += 1;
                if coords[dim] < shape[dim] as usize {
                    break;
                }
                coords[dim] = 0;
            }
        }
        Ok(out)
    }

    /// Permutes both the descriptor and the payload of a constant.
    pub fn permute_tensor(&self, tensor: &ConstTensor) -> Result<ConstTensor, TensorError> {
        let shape = tensor
            .info()
            .shape()
            .concrete()
            .ok_or(TensorError::UnspecifiedShape)?;
        let data = self.permute_data(&shape, tensor.data(), tensor.data_type().size_in_bytes())?;
        let info = tensor.info().with_shape(self.permute_shape(&shape)?);
        ConstTensor::new(info, data)
    }

    fn check_rank(&self, rank: usize) -> Result<(), TensorError> {
        if rank != self.0.len() {
            return Err(TensorError::Permutation(format!(
                "permutation of length {} applied to rank {rank}",
                self.0.len()
            )));
        }
        Ok(())
    }
}

/// Converts depthwise convolution weights from the `[1, H, W, I * M]` layout to
/// `[M, I, H, W]`, given the number of input channels `I`.
pub fn depthwise_weights_to_mihw(
    weights: &ConstTensor,
    input_channels: u32,
) -> Result<ConstTensor, TensorError> {
    let shape = weights
        .info()
        .shape()
        .concrete()
        .ok_or(TensorError::UnspecifiedShape)?;
    let [1, h, w, channels] = shape[..] else {
        return Err(TensorError::Permutation(format!(
            "depthwise weights of shape {shape:?} are not [1, H, W, I * M]"
        )));
    };
    if input_channels == 0 || channels % input_channels != 0 {
        return Err(TensorError::Permutation(format!(
            "{channels} weight channels are not a multiple of {input_channels} input channels"
        )));
    }
    let hwim = weights
        .clone()
        .with_info(weights.info().with_shape(vec![
            h,
            w,
            input_channels,
            channels / input_channels,
        ]))?;
    // [H, W, I, M] -> [M, I, H, W]
    PermutationVector::new(vec![2, 3, 1, 0])?.permute_tensor(&hwim)
}

/// Inverse of [`depthwise_weights_to_mihw`].
pub fn depthwise_weights_from_mihw(weights: &ConstTensor) -> Result<ConstTensor, TensorError> {
    // [M, I, H, W] -> [H, W, I, M]
    let hwim = PermutationVector::new(vec![3, 2, 0, 1])?.permute_tensor(weights)?;
    let shape = hwim
        .info()
        .shape()
        .concrete()
        .ok_or(TensorError::UnspecifiedShape)?;
    let info = hwim
        .info()
        .with_shape(vec![1, shape[0], shape[1], shape[2] * shape[3]]);
    hwim.with_info(info)
}

fn row_major_strides(shape: &[u32]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1] as usize;
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, TensorInfo};

    #[test]
    fn test_rejects_non_permutations() {
        assert!(PermutationVector::new(vec![0, 0, 1]).is_err());
        assert!(PermutationVector::new(vec![0, 3]).is_err());
        assert!(PermutationVector::new(vec![2, 0, 1]).is_ok());
    }

    #[test]
    fn test_permute_shape_and_inverse() {
        let p = PermutationVector::new(vec![2, 3, 1, 0]).unwrap();
        // [H, W, I, M] -> [M, I, H, W]
        assert_eq!(p.permute_shape(&[3, 5, 2, 4]).unwrap(), vec![4, 2, 3, 5]);
        assert_eq!(
            p.inverse().permute_shape(&[4, 2, 3, 5]).unwrap(),
            vec![3, 5, 2, 4]
        );
    }

    #[test]
    fn test_permute_data_transposes_matrix() {
        // 2x3 matrix, swapping both dimensions is a transpose
        let p = PermutationVector::new(vec![1, 0]).unwrap();
        let t = ConstTensor::from_values(TensorInfo::new(vec![2, 3], DataType::QAsymmU8), &[
            1u8, 2, 3, 4, 5, 6,
        ])
        .unwrap();
        let permuted = p.permute_tensor(&t).unwrap();
        assert_eq!(permuted.info().shape().concrete().unwrap(), vec![3, 2]);
        assert_eq!(permuted.data(), &[1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_depthwise_layouts() {
        // H = 1, W = 2, I = 2, M = 3, channel c = i * M + m holds 100 * w + c
        let values: Vec<f32> = (0..2)
            .flat_map(|w| (0..6).map(move |c| (100 * w + c) as f32))
            .collect();
        let external = ConstTensor::from_f32(&[1, 1, 2, 6], &values).unwrap();
        let mihw = depthwise_weights_to_mihw(&external, 2).unwrap();
        assert_eq!(mihw.info().shape().concrete().unwrap(), vec![3, 2, 1, 2]);
        let mihw_values = mihw.to_f32().unwrap();
        // element [m, i, 0, w] is channel i * 3 + m at column w
        for m in 0..3 {
            for i in 0..2 {
                for w in 0..2 {
                    let index = (m * 2 + i) * 2 + w;
                    assert_eq!(mihw_values[index], (100 * w + i * 3 + m) as f32);
                }
            }
        }
        assert_eq!(depthwise_weights_from_mihw(&mihw).unwrap(), external);
        assert!(depthwise_weights_to_mihw(&external, 4).is_err());
    }

    #[test]
    fn test_permute_round_trip_keeps_cells_intact() {
        let p = PermutationVector::new(vec![2, 0, 1]).unwrap();
        let values: Vec<f32> = (0..24).map(|v| v as f32 * 0.5).collect();
        let t = ConstTensor::from_f32(&[2, 3, 4], &values).unwrap();
        let there = p.permute_tensor(&t).unwrap();
        let back = p.inverse().permute_tensor(&there).unwrap();
        assert_eq!(back, t);
    }
}
