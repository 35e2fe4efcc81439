//! Dense tensors as seen by the coordinator: a placement, an element type,
//! a shape and a shared byte buffer standing in for device memory.
//!
//! Views created with [`DenseTensor::partial`] share storage with their
//! parent, so a collective writing into a view updates the parent in place.

use std::sync::Arc;

use bytemuck::Pod;
use candle_core::{DType, Device, Tensor};
use parking_lot::RwLock;

use super::place::Place;
use crate::utils::error::{Result, XcclError};

/// Element types understood by the communication library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8,
    Uint8,
    Int32,
    Uint32,
    Int64,
    Float16,
    Bfloat16,
    Float32,
    Float64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Float16 | DataType::Bfloat16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            DataType::Float16 | DataType::Bfloat16 | DataType::Float32 | DataType::Float64
        )
    }

    pub fn from_candle(dtype: DType) -> Result<Self> {
        match dtype {
            DType::U8 => Ok(DataType::Uint8),
            DType::U32 => Ok(DataType::Uint32),
            DType::I64 => Ok(DataType::Int64),
            DType::F16 => Ok(DataType::Float16),
            DType::BF16 => Ok(DataType::Bfloat16),
            DType::F32 => Ok(DataType::Float32),
            DType::F64 => Ok(DataType::Float64),
            #[allow(unreachable_patterns)]
            other => Err(XcclError::Unimplemented(format!(
                "Data type {:?} is not supported by the collective library",
                other
            ))),
        }
    }
}

/// Host element types that map one-to-one onto a [`DataType`].
pub trait Element: Pod {
    const DTYPE: DataType;
}

macro_rules! impl_element {
    ($($t:ty => $dt:ident),* $(,)?) => {
        $(impl Element for $t {
            const DTYPE: DataType = DataType::$dt;
        })*
    };
}

impl_element!(
    i8 => Int8,
    u8 => Uint8,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
);

#[derive(Debug, Clone)]
pub struct DenseTensor {
    place: Place,
    dtype: DataType,
    dims: Vec<usize>,
    storage: Arc<RwLock<Vec<u8>>>,
    /// Start of this view in elements.
    offset: usize,
    numel: usize,
}

impl DenseTensor {
    /// Allocates a zero-filled tensor on `place`.
    pub fn zeros(place: Place, dtype: DataType, dims: &[usize]) -> Self {
        let numel = dims.iter().product();
        let storage = vec![0u8; numel * dtype.size_of()];
        Self {
            place,
            dtype,
            dims: dims.to_vec(),
            storage: Arc::new(RwLock::new(storage)),
            offset: 0,
            numel,
        }
    }

    pub fn from_vec<T: Element>(place: Place, data: Vec<T>, dims: &[usize]) -> Result<Self> {
        let numel: usize = dims.iter().product();
        if numel != data.len() {
            return Err(XcclError::InvalidArgument(format!(
                "Shape {:?} holds {} elements but {} were given",
                dims,
                numel,
                data.len()
            )));
        }
        let bytes = bytemuck::cast_slice::<T, u8>(&data).to_vec();
        Ok(Self {
            place,
            dtype: T::DTYPE,
            dims: dims.to_vec(),
            storage: Arc::new(RwLock::new(bytes)),
            offset: 0,
            numel,
        })
    }

    /// Copies a host candle tensor into a new tensor placed on `place`.
    pub fn from_candle(tensor: &Tensor, place: Place) -> Result<Self> {
        let dims = tensor.dims().to_vec();
        let flat = tensor.flatten_all()?;
        match DataType::from_candle(tensor.dtype())? {
            DataType::Uint8 => Self::from_vec(place, flat.to_vec1::<u8>()?, &dims),
            DataType::Uint32 => Self::from_vec(place, flat.to_vec1::<u32>()?, &dims),
            DataType::Int64 => Self::from_vec(place, flat.to_vec1::<i64>()?, &dims),
            DataType::Float32 => Self::from_vec(place, flat.to_vec1::<f32>()?, &dims),
            DataType::Float64 => Self::from_vec(place, flat.to_vec1::<f64>()?, &dims),
            other => Err(XcclError::Unimplemented(format!(
                "Host transfer of {:?} tensors",
                other
            ))),
        }
    }

    /// Copies this view back into a host candle tensor.
    pub fn to_candle(&self) -> Result<Tensor> {
        let device = Device::Cpu;
        let dims = self.dims.clone();
        let tensor = match self.dtype {
            DataType::Uint8 => Tensor::from_vec(self.to_vec::<u8>()?, dims, &device)?,
            DataType::Uint32 => Tensor::from_vec(self.to_vec::<u32>()?, dims, &device)?,
            DataType::Int64 => Tensor::from_vec(self.to_vec::<i64>()?, dims, &device)?,
            DataType::Float32 => Tensor::from_vec(self.to_vec::<f32>()?, dims, &device)?,
            DataType::Float64 => Tensor::from_vec(self.to_vec::<f64>()?, dims, &device)?,
            other => {
                return Err(XcclError::Unimplemented(format!(
                    "Host transfer of {:?} tensors",
                    other
                )))
            }
        };
        Ok(tensor)
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(XcclError::InvalidArgument(format!(
                "Tensor holds {:?}, requested {:?}",
                self.dtype,
                T::DTYPE
            )));
        }
        let bytes = self.read_bytes();
        Ok(bytes
            .chunks_exact(self.dtype.size_of())
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    /// A flat view of `numel` elements starting at `offset`, sharing storage.
    pub fn partial(&self, offset: usize, numel: usize) -> Result<Self> {
        let end = offset.checked_add(numel);
        if end.map_or(true, |end| end > self.numel) {
            return Err(XcclError::InvalidArgument(format!(
                "Slice [{}, {}+{}) exceeds tensor of {} elements",
                offset, offset, numel, self.numel
            )));
        }
        Ok(Self {
            place: self.place.clone(),
            dtype: self.dtype,
            dims: vec![numel],
            storage: Arc::clone(&self.storage),
            offset: self.offset + offset,
            numel,
        })
    }

    pub fn place(&self) -> &Place {
        &self.place
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn nbytes(&self) -> usize {
        self.numel * self.dtype.size_of()
    }

    /// Byte offset of this view inside its storage.
    pub fn byte_offset(&self) -> usize {
        self.offset * self.dtype.size_of()
    }

    pub fn shares_storage_with(&self, other: &DenseTensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Snapshot of the bytes covered by this view.
    pub fn read_bytes(&self) -> Vec<u8> {
        self.read_prefix(self.nbytes())
    }

    /// Snapshot of the first `nbytes` bytes of this view.
    pub fn read_prefix(&self, nbytes: usize) -> Vec<u8> {
        let start = self.byte_offset();
        let len = nbytes.min(self.nbytes());
        self.storage.read()[start..start + len].to_vec()
    }

    /// Overwrites the first `bytes.len()` bytes of this view.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.nbytes() {
            return Err(XcclError::InvalidArgument(format!(
                "Writing {} bytes into a view of {} bytes",
                bytes.len(),
                self.nbytes()
            )));
        }
        let start = self.byte_offset();
        self.storage.write()[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
