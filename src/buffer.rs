//! Flat numeric buffers in reduced or full precision.
//!
//! A [`Buffer`] is one owned, contiguous block of elements in a storage
//! dtype. The partitioning engine never reshapes buffers; every "view" is an
//! offset/length window over one allocation, and all arithmetic happens on
//! f32 copies read out of (and written back into) those windows.

use std::fmt;

use half::{bf16, f16};

use crate::error::{Error, Result};

/// Element type of a [`Buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DType {
    /// IEEE 754 half precision
    F16,
    /// bfloat16
    BF16,
    /// IEEE 754 single precision
    F32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::F32 => write!(f, "f32"),
        }
    }
}

#[derive(Debug, Clone)]
enum Data {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
}

/// An owned, contiguous block of numeric elements.
///
/// Values are converted through f32 at every window boundary; for f16/bf16
/// storage the f32 round-trip is exact.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Data,
}

impl Buffer {
    /// A zero-filled buffer of `numel` elements.
    pub fn zeros(numel: usize, dtype: DType) -> Self {
        let data = match dtype {
            DType::F16 => Data::F16(vec![f16::ZERO; numel]),
            DType::BF16 => Data::BF16(vec![bf16::ZERO; numel]),
            DType::F32 => Data::F32(vec![0.0; numel]),
        };
        Self { data }
    }

    /// Build a buffer from f32 values, converting into the storage dtype.
    pub fn from_f32(values: &[f32], dtype: DType) -> Self {
        let data = match dtype {
            DType::F16 => Data::F16(values.iter().map(|&v| f16::from_f32(v)).collect()),
            DType::BF16 => Data::BF16(values.iter().map(|&v| bf16::from_f32(v)).collect()),
            DType::F32 => Data::F32(values.to_vec()),
        };
        Self { data }
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        match &self.data {
            Data::F16(v) => v.len(),
            Data::BF16(v) => v.len(),
            Data::F32(v) => v.len(),
        }
    }

    /// True if the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    /// Storage element type.
    pub fn dtype(&self) -> DType {
        match &self.data {
            Data::F16(_) => DType::F16,
            Data::BF16(_) => DType::BF16,
            Data::F32(_) => DType::F32,
        }
    }

    /// All elements as f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.numel()];
        self.read_f32(0, &mut out).expect("full-length window");
        out
    }

    /// Copy the window `[start, start + out.len())` into `out` as f32.
    pub fn read_f32(&self, start: usize, out: &mut [f32]) -> Result<()> {
        let end = start + out.len();
        if end > self.numel() {
            return Err(window_error(start, out.len(), self.numel()));
        }
        match &self.data {
            Data::F16(v) => {
                for (dst, src) in out.iter_mut().zip(&v[start..end]) {
                    *dst = src.to_f32();
                }
            }
            Data::BF16(v) => {
                for (dst, src) in out.iter_mut().zip(&v[start..end]) {
                    *dst = src.to_f32();
                }
            }
            Data::F32(v) => out.copy_from_slice(&v[start..end]),
        }
        Ok(())
    }

    /// The window `[start, start + len)` as a fresh f32 vector.
    pub fn slice_f32(&self, start: usize, len: usize) -> Result<Vec<f32>> {
        let mut out = vec![0.0; len];
        self.read_f32(start, &mut out)?;
        Ok(out)
    }

    /// Overwrite the window `[start, start + values.len())` from f32 values,
    /// converting into the storage dtype.
    pub fn write_f32(&mut self, start: usize, values: &[f32]) -> Result<()> {
        let end = start + values.len();
        if end > self.numel() {
            return Err(window_error(start, values.len(), self.numel()));
        }
        match &mut self.data {
            Data::F16(v) => {
                for (dst, &src) in v[start..end].iter_mut().zip(values) {
                    *dst = f16::from_f32(src);
                }
            }
            Data::BF16(v) => {
                for (dst, &src) in v[start..end].iter_mut().zip(values) {
                    *dst = bf16::from_f32(src);
                }
            }
            Data::F32(v) => v[start..end].copy_from_slice(values),
        }
        Ok(())
    }

    /// Append another buffer's elements. Both buffers must share a dtype.
    pub fn append(&mut self, other: &Buffer) -> Result<()> {
        match (&mut self.data, &other.data) {
            (Data::F16(dst), Data::F16(src)) => dst.extend_from_slice(src),
            (Data::BF16(dst), Data::BF16(src)) => dst.extend_from_slice(src),
            (Data::F32(dst), Data::F32(src)) => dst.extend_from_slice(src),
            _ => {
                return Err(Error::InvalidArgument {
                    arg: "other",
                    reason: format!(
                        "dtype mismatch: cannot append {} to {}",
                        other.dtype(),
                        self.dtype()
                    ),
                })
            }
        }
        Ok(())
    }

    /// Iterate all elements as f32.
    pub fn iter_f32(&self) -> impl Iterator<Item = f32> + '_ {
        (0..self.numel()).map(move |i| match &self.data {
            Data::F16(v) => v[i].to_f32(),
            Data::BF16(v) => v[i].to_f32(),
            Data::F32(v) => v[i],
        })
    }
}

fn window_error(start: usize, len: usize, numel: usize) -> Error {
    Error::InvalidArgument {
        arg: "window",
        reason: format!("[{start}, {}) out of bounds for {numel} elements", start + len),
    }
}
