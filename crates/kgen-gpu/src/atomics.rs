//! Atomic combines of a value into global memory.

use crate::context::ModuleContext;
use crate::GpuResult;
use kgen_hlo::{BinaryOp, CompId};
use kgen_kir::{AddressSpace, AtomicOp, Builder, ScalarType, ValueId};
use tracing::trace;

/// The native atomic implementing `op` on `ty`, if the hardware has one.
#[must_use]
pub fn native_atomic(op: BinaryOp, ty: ScalarType) -> Option<AtomicOp> {
    let wide = matches!(ty.bit_width(), 32 | 64);
    match op {
        BinaryOp::Add if wide && (ty.is_integer() || ty.is_float()) => Some(AtomicOp::Add),
        BinaryOp::Minimum if wide && ty.is_integer() => Some(AtomicOp::Min),
        BinaryOp::Maximum if wide && ty.is_integer() => Some(AtomicOp::Max),
        _ => None,
    }
}

/// Atomically replace `*address` with `computation(*address, value)`.
///
/// Single-op add/min/max computations use the native atomic where one
/// exists; anything else runs the lowered computation in a
/// compare-and-swap loop.
pub fn emit_atomic_operation(
    mcx: &mut ModuleContext<'_>,
    b: &mut Builder,
    computation: CompId,
    address: ValueId,
    value: ValueId,
) -> GpuResult<()> {
    let ty = b.value_type(value);
    let native = mcx
        .hlo
        .as_binary_reducer(computation)
        .and_then(|op| native_atomic(op, ty));
    let op = match native {
        Some(op) => op,
        None => AtomicOp::Cas(mcx.function_for(computation)?),
    };
    trace!(?op, %ty, "atomic combine");
    b.atomic(AddressSpace::Global, op, address, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_atomics() {
        assert_eq!(native_atomic(BinaryOp::Add, ScalarType::F32), Some(AtomicOp::Add));
        assert_eq!(native_atomic(BinaryOp::Add, ScalarType::U64), Some(AtomicOp::Add));
        assert_eq!(native_atomic(BinaryOp::Maximum, ScalarType::S32), Some(AtomicOp::Max));
        assert_eq!(native_atomic(BinaryOp::Maximum, ScalarType::F32), None);
        assert_eq!(native_atomic(BinaryOp::Add, ScalarType::S16), None);
        assert_eq!(native_atomic(BinaryOp::Multiply, ScalarType::F32), None);
    }
}
