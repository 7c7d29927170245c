//! # kgen Kernel IR
//!
//! A small structured IR for GPU kernels, produced by the code generator in
//! `kgen-gpu` and consumed by its PTX printer and simulator.
//!
//! ## Overview
//!
//! Kernel IR makes the SIMT execution model explicit:
//!
//! - **Scalar registers**: every [`ValueId`] has one [`ScalarType`];
//!   pointers are `u64`.
//! - **Address spaces**: global, per-block shared, per-thread local.
//! - **Structured control flow**: `if` / counted `for`, no arbitrary jumps.
//! - **Thread primitives**: special registers, block barriers, warp
//!   shuffles and atomics.
//! - **Functions**: scalar sub-programs (reducers, comparators) invoked
//!   with [`Stmt::Call`].
//!
//! ## IR Pipeline Position
//!
//! ```text
//! [Operator graph]  <- kgen-hlo
//!     |
//!     v
//! [Kernel IR]       <- This crate
//!     |
//!     +--> [PTX text]    (kgen-gpu codegen)
//!     +--> [Simulator]   (kgen-gpu runtime)
//! ```
//!
//! ## Main Types
//!
//! - [`Kernel`] / [`Function`] / [`KirModule`]
//! - [`Stmt`] / [`Expr`]: statements and right-hand sides
//! - [`Builder`]: emission API with closure-scoped control flow

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]

use kgen_hlo::PrimitiveType;
use kgen_index::newtype_index;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

// ============================================================================
// Submodules
// ============================================================================

pub mod builder;
pub mod eval;
pub mod ir;

pub use builder::Builder;
pub use ir::{
    AddressSpace, AtomicOp, BinOp, Block, CmpOp, Expr, Function, GlobalDecl, Kernel,
    KernelParam, KirModule, LocalDecl, ParamFlags, SharedDecl, SpecialReg, Stmt, UnOp,
};

newtype_index! {
    /// An SSA register within one kernel or function.
    pub struct ValueId;
}

newtype_index! {
    /// A function within a [`KirModule`].
    pub struct FuncId;
}

newtype_index! {
    /// A shared-memory array within one kernel.
    pub struct SharedId;
}

newtype_index! {
    /// A per-thread local array within one kernel or function.
    pub struct LocalId;
}

newtype_index! {
    /// A module-level constant array.
    pub struct GlobalId;
}

/// Scalar register types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarType {
    /// Predicate.
    Pred,
    /// 8-bit signed.
    S8,
    /// 16-bit signed.
    S16,
    /// 32-bit signed.
    S32,
    /// 64-bit signed.
    S64,
    /// 8-bit unsigned.
    U8,
    /// 16-bit unsigned.
    U16,
    /// 32-bit unsigned.
    U32,
    /// 64-bit unsigned; also used for addresses.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl ScalarType {
    /// Storage size in bytes (predicates occupy one byte).
    #[must_use]
    pub const fn byte_size(self) -> usize {
        match self {
            Self::Pred | Self::S8 | Self::U8 => 1,
            Self::S16 | Self::U16 => 2,
            Self::S32 | Self::U32 | Self::F32 => 4,
            Self::S64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Width in bits of the value (1 for predicates).
    #[must_use]
    pub const fn bit_width(self) -> u32 {
        match self {
            Self::Pred => 1,
            other => other.byte_size() as u32 * 8,
        }
    }

    /// Returns true for floats.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Returns true for signed integers.
    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::S8 | Self::S16 | Self::S32 | Self::S64)
    }

    /// Returns true for unsigned integers.
    #[must_use]
    pub const fn is_unsigned(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    /// Returns true for any integer type.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    /// Mask of the meaningful low bits.
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self.bit_width() {
            64 => u64::MAX,
            w => (1u64 << w) - 1,
        }
    }
}

impl From<PrimitiveType> for ScalarType {
    fn from(ty: PrimitiveType) -> Self {
        match ty {
            PrimitiveType::Pred => Self::Pred,
            PrimitiveType::S8 => Self::S8,
            PrimitiveType::S16 => Self::S16,
            PrimitiveType::S32 => Self::S32,
            PrimitiveType::S64 => Self::S64,
            PrimitiveType::U8 => Self::U8,
            PrimitiveType::U16 => Self::U16,
            PrimitiveType::U32 => Self::U32,
            PrimitiveType::U64 => Self::U64,
            PrimitiveType::F32 => Self::F32,
            PrimitiveType::F64 => Self::F64,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pred => "pred",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A typed scalar value, stored as its raw bits.
///
/// Integers hold their two's complement bits masked to the type width,
/// floats their IEEE bits, predicates 0 or 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scalar {
    ty: ScalarType,
    bits: u64,
}

impl Scalar {
    /// From raw bits; bits above the type width are dropped.
    #[must_use]
    pub const fn from_bits(ty: ScalarType, bits: u64) -> Self {
        let bits = match ty {
            ScalarType::Pred => (bits != 0) as u64,
            _ => bits & ty.mask(),
        };
        Self { ty, bits }
    }

    /// From a signed integer, wrapping (or converting, for floats).
    #[must_use]
    pub fn from_i64(ty: ScalarType, value: i64) -> Self {
        match ty {
            ScalarType::F32 => Self::f32(value as f32),
            ScalarType::F64 => Self::f64(value as f64),
            _ => Self::from_bits(ty, value as u64),
        }
    }

    /// From an unsigned integer, wrapping (or converting, for floats).
    #[must_use]
    pub fn from_u64(ty: ScalarType, value: u64) -> Self {
        match ty {
            ScalarType::F32 => Self::f32(value as f32),
            ScalarType::F64 => Self::f64(value as f64),
            _ => Self::from_bits(ty, value),
        }
    }

    /// From a float, truncating (saturating) for integers.
    #[must_use]
    pub fn from_f64(ty: ScalarType, value: f64) -> Self {
        match ty {
            ScalarType::F32 => Self::f32(value as f32),
            ScalarType::F64 => Self::f64(value),
            ScalarType::Pred => Self::pred(value != 0.0),
            t if t.is_unsigned() => Self::from_bits(t, value as u64),
            t => Self::from_bits(t, value as i64 as u64),
        }
    }

    /// A predicate.
    #[must_use]
    pub const fn pred(value: bool) -> Self {
        Self {
            ty: ScalarType::Pred,
            bits: value as u64,
        }
    }

    /// An `f32`.
    #[must_use]
    pub fn f32(value: f32) -> Self {
        Self {
            ty: ScalarType::F32,
            bits: u64::from(value.to_bits()),
        }
    }

    /// An `f64`.
    #[must_use]
    pub fn f64(value: f64) -> Self {
        Self {
            ty: ScalarType::F64,
            bits: value.to_bits(),
        }
    }

    /// An `s32`.
    #[must_use]
    pub fn i32(value: i32) -> Self {
        Self::from_i64(ScalarType::S32, i64::from(value))
    }

    /// An `s64`.
    #[must_use]
    pub fn i64(value: i64) -> Self {
        Self::from_i64(ScalarType::S64, value)
    }

    /// A `u32`.
    #[must_use]
    pub fn u32(value: u32) -> Self {
        Self::from_u64(ScalarType::U32, u64::from(value))
    }

    /// A `u64`.
    #[must_use]
    pub fn u64(value: u64) -> Self {
        Self::from_u64(ScalarType::U64, value)
    }

    /// Zero of any type.
    #[must_use]
    pub const fn zero(ty: ScalarType) -> Self {
        Self { ty, bits: 0 }
    }

    /// The type.
    #[must_use]
    pub const fn ty(self) -> ScalarType {
        self.ty
    }

    /// The raw bits.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    /// Value as `f32` (only meaningful for `F32`).
    #[must_use]
    pub fn as_f32_bits(self) -> f32 {
        f32::from_bits(self.bits as u32)
    }

    /// Numeric value as a signed integer.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self.ty {
            ScalarType::F32 => self.as_f32_bits() as i64,
            ScalarType::F64 => f64::from_bits(self.bits) as i64,
            t if t.is_signed() => {
                let shift = 64 - t.bit_width();
                ((self.bits << shift) as i64) >> shift
            }
            _ => self.bits as i64,
        }
    }

    /// Numeric value as an unsigned integer (signed values reinterpret).
    #[must_use]
    pub fn as_u64(self) -> u64 {
        match self.ty {
            ScalarType::F32 | ScalarType::F64 => self.as_f64() as u64,
            t if t.is_signed() => self.as_i64() as u64,
            _ => self.bits,
        }
    }

    /// Numeric value as a float.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self.ty {
            ScalarType::F32 => f64::from(self.as_f32_bits()),
            ScalarType::F64 => f64::from_bits(self.bits),
            t if t.is_signed() => self.as_i64() as f64,
            _ => self.bits as f64,
        }
    }

    /// Truthiness.
    #[must_use]
    pub fn as_bool(self) -> bool {
        match self.ty {
            ScalarType::F32 | ScalarType::F64 => self.as_f64() != 0.0,
            _ => self.bits != 0,
        }
    }

    /// Value conversion to another type.
    #[must_use]
    pub fn cast(self, to: ScalarType) -> Self {
        if self.ty == to {
            return self;
        }
        if to == ScalarType::Pred {
            return Self::pred(self.as_bool());
        }
        if self.ty.is_float() {
            return Self::from_f64(to, self.as_f64());
        }
        if to.is_float() {
            return Self::from_f64(to, self.as_f64());
        }
        if self.ty.is_signed() {
            Self::from_i64(to, self.as_i64())
        } else {
            Self::from_u64(to, self.bits)
        }
    }

    /// Little-endian storage bytes.
    #[must_use]
    pub fn to_le_bytes(self) -> SmallVec<[u8; 8]> {
        self.bits.to_le_bytes()[..self.ty.byte_size()]
            .iter()
            .copied()
            .collect()
    }

    /// Decode from little-endian storage bytes.
    #[must_use]
    pub fn from_le_bytes(ty: ScalarType, bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        let n = ty.byte_size().min(bytes.len());
        raw[..n].copy_from_slice(&bytes[..n]);
        Self::from_bits(ty, u64::from_le_bytes(raw))
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ty {
            ScalarType::F32 | ScalarType::F64 => write!(f, "{}", self.as_f64()),
            ScalarType::Pred => write!(f, "{}", self.bits != 0),
            t if t.is_signed() => write!(f, "{}", self.as_i64()),
            _ => write!(f, "{}", self.bits),
        }
    }
}

/// Errors in kernel IR evaluation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum KirError {
    /// Operand types differ.
    #[error("type mismatch in {op}: {lhs} vs {rhs}")]
    TypeMismatch {
        /// Operation name.
        op: String,
        /// Left operand type.
        lhs: ScalarType,
        /// Right operand type.
        rhs: ScalarType,
    },

    /// An operation applied to a type it does not support.
    #[error("{op} is not defined for {ty}")]
    UnsupportedType {
        /// Operation name.
        op: String,
        /// Operand type.
        ty: ScalarType,
    },
}

/// Result type for IR evaluation.
pub type KirResult<T> = Result<T, KirError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_extension() {
        let v = Scalar::from_i64(ScalarType::S8, -3);
        assert_eq!(v.bits(), 0xfd);
        assert_eq!(v.as_i64(), -3);
        assert_eq!(v.cast(ScalarType::S64).as_i64(), -3);
        assert_eq!(v.cast(ScalarType::U64).bits(), u64::MAX - 2);
    }

    #[test]
    fn test_wrapping() {
        let v = Scalar::from_i64(ScalarType::U8, 300);
        assert_eq!(v.as_u64(), 44);
        assert_eq!(Scalar::from_i64(ScalarType::S32, 1 << 31).as_i64(), i64::from(i32::MIN));
    }

    #[test]
    fn test_float_casts() {
        let v = Scalar::f32(3.75);
        assert_eq!(v.cast(ScalarType::S32).as_i64(), 3);
        assert_eq!(Scalar::f32(-1.5).cast(ScalarType::S32).as_i64(), -1);
        assert_eq!(Scalar::i32(7).cast(ScalarType::F64).as_f64(), 7.0);
        assert!(Scalar::f32(0.5).cast(ScalarType::Pred).as_bool());
    }

    #[test]
    fn test_bytes_round_trip() {
        let v = Scalar::f32(1.25);
        let bytes = v.to_le_bytes();
        assert_eq!(bytes.len(), 4);
        assert_eq!(Scalar::from_le_bytes(ScalarType::F32, &bytes), v);
    }

    #[test]
    fn test_from_primitive() {
        assert_eq!(ScalarType::from(PrimitiveType::U16), ScalarType::U16);
        assert_eq!(ScalarType::U16.mask(), 0xffff);
    }
}
