//! Constant data.

use crate::shape::{ArrayShape, PrimitiveType};
use crate::{HloError, HloResult};
use serde::{Deserialize, Serialize};

/// An array constant, stored as little-endian bytes in physical order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Literal {
    shape: ArrayShape,
    data: Vec<u8>,
}

impl Literal {
    /// Wrap raw bytes; the length must match the shape.
    pub fn from_raw(shape: ArrayShape, data: Vec<u8>) -> HloResult<Self> {
        let expected = shape.byte_size() as usize;
        if data.len() != expected {
            return Err(HloError::LiteralSize {
                shape: shape.to_string(),
                expected,
                got: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Row-major `f32` array.
    pub fn from_f32s(dims: &[i64], values: &[f32]) -> HloResult<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_raw(ArrayShape::new(PrimitiveType::F32, dims), data)
    }

    /// Row-major `s32` array.
    pub fn from_i32s(dims: &[i64], values: &[i32]) -> HloResult<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_raw(ArrayShape::new(PrimitiveType::S32, dims), data)
    }

    /// Scalar `f32`.
    #[must_use]
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            shape: ArrayShape::scalar(PrimitiveType::F32),
            data: value.to_le_bytes().to_vec(),
        }
    }

    /// Scalar `s32`.
    #[must_use]
    pub fn scalar_i32(value: i32) -> Self {
        Self {
            shape: ArrayShape::scalar(PrimitiveType::S32),
            data: value.to_le_bytes().to_vec(),
        }
    }

    /// Scalar `pred`.
    #[must_use]
    pub fn scalar_pred(value: bool) -> Self {
        Self {
            shape: ArrayShape::scalar(PrimitiveType::Pred),
            data: vec![u8::from(value)],
        }
    }

    /// Scalar of any type from its little-endian bytes.
    pub fn scalar_from_bytes(ty: PrimitiveType, bytes: &[u8]) -> HloResult<Self> {
        Self::from_raw(ArrayShape::scalar(ty), bytes.to_vec())
    }

    /// The literal's shape.
    #[must_use]
    pub fn shape(&self) -> &ArrayShape {
        &self.shape
    }

    /// Raw bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns true if every byte is zero.
    #[must_use]
    pub fn is_all_zero_bytes(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    /// Decode as `f32` values in physical order.
    #[must_use]
    pub fn to_f32s(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Decode as `i32` values in physical order.
    #[must_use]
    pub fn to_i32s(&self) -> Vec<i32> {
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_checked() {
        let err = Literal::from_f32s(&[2, 2], &[1.0, 2.0, 3.0]);
        assert!(matches!(err, Err(HloError::LiteralSize { expected: 16, got: 12, .. })));
    }

    #[test]
    fn test_round_trip_values() {
        let lit = Literal::from_i32s(&[3], &[1, -2, 3]).unwrap();
        assert_eq!(lit.to_i32s(), vec![1, -2, 3]);
        assert!(!lit.is_all_zero_bytes());
        assert!(Literal::scalar_f32(0.0).is_all_zero_bytes());
        assert!(!Literal::scalar_f32(-0.0).is_all_zero_bytes());
    }

    #[test]
    fn test_scalars_from_bytes() {
        assert_eq!(Literal::scalar_pred(true).data(), &[1]);
        let lit = Literal::scalar_from_bytes(PrimitiveType::S32, &(-7_i32).to_le_bytes()).unwrap();
        assert_eq!(lit.to_i32s(), vec![-7]);
        assert!(Literal::scalar_from_bytes(PrimitiveType::S32, &[0, 0]).is_err());
    }
}
