//! Data types for tensor elements and KV cache quantisation

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported data types for device tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    /// 32-bit signed integer (token IDs, lengths, indirection tables)
    I32,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer (RNG state)
    U64,
    /// 8-bit unsigned integer (finished flags, quantised cache bytes)
    U8,
}

impl DType {
    /// Size of the dtype in bytes per element.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::U64 => 8,
            Self::F32 | Self::I32 | Self::U32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::U8 => 1,
        }
    }

    /// Whether this is a 16-bit floating point type (fused context attention
    /// is only selected for these).
    #[must_use]
    pub const fn is_half(self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::I32 => write!(f, "i32"),
            Self::U32 => write!(f, "u32"),
            Self::U64 => write!(f, "u64"),
            Self::U8 => write!(f, "u8"),
        }
    }
}

/// KV cache element quantisation, orthogonal to the activation dtype.
///
/// `None` stores cache elements in the activation dtype; `Int8` and `Fp8`
/// store one byte per element with a per-channel scale supplied by the
/// caller at read/write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheQuant {
    #[default]
    None,
    Int8,
    Fp8,
}

impl CacheQuant {
    /// Element size in bytes for a cache storing activations of `dtype`.
    #[must_use]
    pub const fn element_size(self, dtype: DType) -> usize {
        match self {
            Self::None => dtype.size_in_bytes(),
            Self::Int8 | Self::Fp8 => 1,
        }
    }

    /// Whether cache reads/writes go through a quantisation scale.
    #[must_use]
    pub const fn is_quantised(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Trait for types that can be used as device tensor elements
pub trait TensorDType: Copy + Clone + Default + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;
}

impl TensorDType for f32 {
    const DTYPE: DType = DType::F32;
}

impl TensorDType for half::f16 {
    const DTYPE: DType = DType::F16;
}

impl TensorDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
}

impl TensorDType for i32 {
    const DTYPE: DType = DType::I32;
}

impl TensorDType for u32 {
    const DTYPE: DType = DType::U32;
}

impl TensorDType for u8 {
    const DTYPE: DType = DType::U8;
}

impl TensorDType for u64 {
    const DTYPE: DType = DType::U64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_is_half() {
        assert!(DType::F16.is_half());
        assert!(DType::BF16.is_half());
        assert!(!DType::F32.is_half());
        assert!(!DType::I32.is_half());
    }

    #[test]
    fn test_cache_quant_element_size() {
        assert_eq!(CacheQuant::None.element_size(DType::F32), 4);
        assert_eq!(CacheQuant::None.element_size(DType::F16), 2);
        assert_eq!(CacheQuant::Int8.element_size(DType::F16), 1);
        assert_eq!(CacheQuant::Fp8.element_size(DType::BF16), 1);
    }

    #[test]
    fn test_cache_quant_is_quantised() {
        assert!(!CacheQuant::None.is_quantised());
        assert!(CacheQuant::Int8.is_quantised());
        assert!(CacheQuant::Fp8.is_quantised());
    }

    #[test]
    fn test_tensor_dtype_trait() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(half::f16::DTYPE, DType::F16);
        assert_eq!(half::bf16::DTYPE, DType::BF16);
        assert_eq!(i32::DTYPE, DType::I32);
    }
}
