//! Textual code generation from kernel IR.
//!
//! ```text
//! KirModule
//!     │
//!     ▼
//! ┌─────────────┐
//! │ PTX printer │ ──▶ .version / .target header
//! └─────────────┘     globals, functions, entry points
//! ```

pub mod ptx;

use kgen_kir::ScalarType;

/// PTX register type. Sub-word integers live in 16-bit registers.
pub(crate) fn register_type(ty: ScalarType) -> &'static str {
    match ty {
        ScalarType::Pred => "pred",
        ScalarType::S8 | ScalarType::S16 => "s16",
        ScalarType::U8 | ScalarType::U16 => "u16",
        ScalarType::S32 => "s32",
        ScalarType::S64 => "s64",
        ScalarType::U32 => "u32",
        ScalarType::U64 => "u64",
        ScalarType::F32 => "f32",
        ScalarType::F64 => "f64",
    }
}

/// PTX type of a memory access. Predicates are stored as bytes.
pub(crate) fn memory_type(ty: ScalarType) -> &'static str {
    match ty {
        ScalarType::Pred | ScalarType::U8 => "u8",
        ScalarType::S8 => "s8",
        other => register_type(other),
    }
}

/// Untyped bit-size PTX type of the same width.
pub(crate) fn bit_type(ty: ScalarType) -> &'static str {
    match ty.byte_size() {
        1 | 2 => "b16",
        4 => "b32",
        _ => "b64",
    }
}
