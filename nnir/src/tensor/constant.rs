use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};

use super::{DataType, TensorError, TensorInfo};

/// Rust scalar types which can back the cells of a constant tensor.
pub trait Cell: Copy {
    /// The data type naturally described by this scalar.
    const NATIVE: DataType;

    /// Whether cells of this scalar may be stored in a tensor of `data_type`.
    fn accepts(data_type: DataType) -> bool {
        data_type == Self::NATIVE
    }

    /// Appends the little-endian encoding of `values` to `out`.
    fn write_cells(values: &[Self], out: &mut Vec<u8>);
}

impl Cell for f32 {
    const NATIVE: DataType = DataType::Float32;
    fn write_cells(values: &[Self], out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + values.len() * 4, 0);
        LittleEndian::write_f32_into(values, &mut out[start..]);
    }
}

impl Cell for i32 {
    const NATIVE: DataType = DataType::Signed32;
    fn write_cells(values: &[Self], out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + values.len() * 4, 0);
        LittleEndian::write_i32_into(values, &mut out[start..]);
    }
}

impl Cell for i64 {
    const NATIVE: DataType = DataType::Signed64;
    fn write_cells(values: &[Self], out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + values.len() * 8, 0);
        LittleEndian::write_i64_into(values, &mut out[start..]);
    }
}

impl Cell for i16 {
    const NATIVE: DataType = DataType::QSymmS16;
    fn write_cells(values: &[Self], out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + values.len() * 2, 0);
        LittleEndian::write_i16_into(values, &mut out[start..]);
    }
}

impl Cell for u8 {
    const NATIVE: DataType = DataType::QAsymmU8;
    fn accepts(data_type: DataType) -> bool {
        matches!(data_type, DataType::QAsymmU8 | DataType::Boolean)
    }
    fn write_cells(values: &[Self], out: &mut Vec<u8>) {
        out.extend_from_slice(values);
    }
}

impl Cell for i8 {
    const NATIVE: DataType = DataType::QAsymmS8;
    fn accepts(data_type: DataType) -> bool {
        matches!(data_type, DataType::QAsymmS8 | DataType::QSymmS8)
    }
    fn write_cells(values: &[Self], out: &mut Vec<u8>) {
        out.extend(values.iter().map(|v| *v as u8));
    }
}

impl Cell for bool {
    const NATIVE: DataType = DataType::Boolean;
    fn write_cells(values: &[Self], out: &mut Vec<u8>) {
        out.extend(values.iter().map(|v| u8::from(*v)));
    }
}

impl Cell for f16 {
    const NATIVE: DataType = DataType::Float16;
    fn write_cells(values: &[Self], out: &mut Vec<u8>) {
        for v in values {
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
    }
}

impl Cell for bf16 {
    const NATIVE: DataType = DataType::BFloat16;
    fn write_cells(values: &[Self], out: &mut Vec<u8>) {
        for v in values {
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
    }
}

/// A tensor descriptor together with its backing values, stored as little-endian cells whose
/// width is given by the descriptor's data type.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstTensor {
    info: TensorInfo,
    data: Vec<u8>,
}

impl ConstTensor {
    /// Wraps raw little-endian cells. The payload must hold exactly one cell per element.
    pub fn new(info: TensorInfo, data: Vec<u8>) -> Result<Self, TensorError> {
        let expected = info.num_bytes()?;
        if expected != data.len() {
            return Err(TensorError::PayloadSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            info: info.with_constant(true),
            data,
        })
    }

    pub fn from_values<T: Cell>(info: TensorInfo, values: &[T]) -> Result<Self, TensorError> {
        if !T::accepts(info.data_type()) {
            return Err(TensorError::CellType {
                expected: info.data_type(),
                found: T::NATIVE,
            });
        }
        let mut data = Vec::with_capacity(values.len() * info.data_type().size_in_bytes());
        T::write_cells(values, &mut data);
        Self::new(info, data)
    }

    /// Convenience constructor for float constants.
    pub fn from_f32(shape: &[u32], values: &[f32]) -> Result<Self, TensorError> {
        Self::from_values(TensorInfo::new(shape.to_vec(), DataType::Float32), values)
    }

    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_type(&self) -> DataType {
        self.info.data_type()
    }

    pub fn num_elements(&self) -> usize {
        self.data.len() / self.info.data_type().size_in_bytes()
    }

    /// Replaces the descriptor, keeping the payload. Shape and data type must describe the
    /// same number of bytes.
    pub fn with_info(self, info: TensorInfo) -> Result<Self, TensorError> {
        Self::new(info, self.data)
    }

    /// Decodes floating point cells.
    pub fn to_f32(&self) -> Result<Vec<f32>, TensorError> {
        match self.data_type() {
            DataType::Float32 => {
                let mut out = vec![0f32; self.num_elements()];
                LittleEndian::read_f32_into(&self.data, &mut out);
                Ok(out)
            }
            DataType::Float16 => Ok(self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_bits(LittleEndian::read_u16(c)).to_f32())
                .collect()),
            DataType::BFloat16 => Ok(self
                .data
                .chunks_exact(2)
                .map(|c| bf16::from_bits(LittleEndian::read_u16(c)).to_f32())
                .collect()),
            other => Err(TensorError::NotFloat(other)),
        }
    }

    /// Decodes integer cells of index-like tensors (axes, shapes, paddings).
    pub fn to_i64(&self) -> Result<Vec<i64>, TensorError> {
        match self.data_type() {
            DataType::Signed32 => {
                let mut out = vec![0i32; self.num_elements()];
                LittleEndian::read_i32_into(&self.data, &mut out);
                Ok(out.into_iter().map(i64::from).collect())
            }
            DataType::Signed64 => {
                let mut out = vec![0i64; self.num_elements()];
                LittleEndian::read_i64_into(&self.data, &mut out);
                Ok(out)
            }
            other => Err(TensorError::CellType {
                expected: DataType::Signed32,
                found: other,
            }),
        }
    }

    /// Smallest and largest value held by a floating point constant.
    pub fn min_max(&self) -> Result<(f32, f32), TensorError> {
        let values = self.to_f32()?;
        if values.is_empty() {
            return Ok((0.0, 0.0));
        }
        Ok(values
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v))))
    }
}
