//! Initialization of accumulating outputs.
//!
//! Reductions and select-and-scatter combine into their output with
//! atomics, so the output must hold the init value first. A constant init
//! becomes a device fill when its bytes allow one; anything else is written
//! by a small loop kernel.

use crate::context::ModuleContext;
use crate::elemental::Elemental;
use crate::ir_array::IrIndex;
use crate::loop_emitter::{emit_parallel_loop, LoopGeometry};
use crate::prototype::build_kernel_prototype;
use crate::thunk::{Thunk, ThunkInfo};
use crate::{GpuError, GpuResult};
use kgen_hlo::{HloInstruction, InstrId, Opcode};
use kgen_kir::Builder;
use tracing::debug;

/// A device fill equivalent to writing a constant init value everywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fill {
    /// All bytes zero.
    Zero,
    /// A repeated 32-bit word.
    Word(u32),
}

/// The fill writing `value` (one element's bytes) over `output_bytes` bytes,
/// if there is one.
#[must_use]
pub fn fill_for_constant(value: &[u8], output_bytes: u64) -> Option<Fill> {
    if value.iter().all(|&byte| byte == 0) {
        return Some(Fill::Zero);
    }
    if (value.len() == 1 || value.len() == 2) && output_bytes % 4 == 0 {
        let pattern16 = if value.len() == 1 {
            u16::from(value[0]) | (u16::from(value[0]) << 8)
        } else {
            u16::from_le_bytes([value[0], value[1]])
        };
        let pattern32 = u32::from(pattern16) | (u32::from(pattern16) << 16);
        return Some(Fill::Word(pattern32));
    }
    if value.len() >= 4 && value.len() % 4 == 0 && value[..value.len() - 4] == value[4..] {
        return Some(Fill::Word(u32::from_le_bytes([value[0], value[1], value[2], value[3]])));
    }
    None
}

/// The instruction producing the init value for output `index` of `instr`.
///
/// Returns `(init, fused)`: `fused` is true when `init` lives inside the
/// fused computation of `instr`.
fn init_value_operand(mcx: &ModuleContext<'_>, instr: &HloInstruction, index: &[usize]) -> GpuResult<(InstrId, bool)> {
    let hlo = mcx.hlo;
    let (inner, fused) = match hlo.fused_root(instr.id()) {
        Some(root) => (hlo.instr(root), true),
        None => (instr, false),
    };
    let init = match inner.opcode() {
        Opcode::SelectAndScatter { .. } => inner.operand(2),
        Opcode::Reduce { .. } => inner.operand(1),
        Opcode::Tuple if fused => {
            let element = index.last().copied().ok_or_else(|| {
                GpuError::Internal(format!("{} needs an output index", instr.name()))
            })?;
            let reduce = hlo.instr(inner.operand(element));
            if !matches!(reduce.opcode(), Opcode::Reduce { .. }) {
                return Err(GpuError::Internal(format!(
                    "found {} in {} but expected reduce",
                    reduce.opcode().name(),
                    inner.name()
                )));
            }
            reduce.operand(1)
        }
        other => {
            return Err(GpuError::Internal(format!(
                "{} should not need an initializer",
                other.name()
            )))
        }
    };
    Ok((init, fused))
}

/// The thunk writing the init value into output `index` of `instr`.
pub fn build_initializer_thunk(mcx: &mut ModuleContext<'_>, instr: InstrId, index: &[usize]) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let unnested = hlo.instr(instr);
    let (init_operand, fused) = init_value_operand(mcx, unnested, index)?;
    let mut init_value = hlo.instr(init_operand);
    if fused {
        if let Some(operand) = hlo.fusion_operand_for_parameter(init_operand) {
            init_value = hlo.instr(operand);
        }
    }
    let destination = mcx.slice(instr, index)?;
    let info = ThunkInfo::new(unnested.name(), None);

    if let Opcode::Constant(literal) = init_value.opcode() {
        if literal.shape().num_elements() == 1 {
            match fill_for_constant(literal.data(), destination.size) {
                Some(Fill::Zero) => {
                    debug!(instruction = unnested.name(), "zero initializer");
                    return Ok(Thunk::Memzero { info, destination });
                }
                Some(Fill::Word(value)) => {
                    debug!(instruction = unnested.name(), value, "memset initializer");
                    return Ok(Thunk::Memset32 {
                        info,
                        value,
                        destination,
                    });
                }
                None => {}
            }
        }
    }

    let mut kcx = build_kernel_prototype(mcx, instr)?;
    let output = kcx.array_for(hlo, instr, index)?;
    let shape = output.shape().clone();
    let geometry = LoopGeometry::for_instruction(mcx, instr, &shape, Some(1));

    let mut elemental = Elemental::new();
    let source = if fused {
        kcx.bind_inputs(hlo, instr, &mut elemental)?;
        init_operand
    } else {
        let array = kcx.array_for(hlo, init_value.id(), &[])?;
        elemental.bind_array(init_value.id(), array);
        init_value.id()
    };
    let source_shape = hlo.instr(source).shape().array_shape()?.clone();

    let mut body = |mcx: &mut ModuleContext<'_>, b: &mut Builder, index: &IrIndex| -> GpuResult<()> {
        let scalar = IrIndex::new([], &source_shape, index.index_type());
        let value = elemental.generate(mcx, b, source, &scalar)?;
        output.emit_write(b, index, value);
        Ok(())
    };
    emit_parallel_loop(mcx, &mut kcx.builder, &shape, &geometry, &mut body)?;
    debug!(instruction = unnested.name(), "kernel initializer");
    Ok(kcx.into_thunk(mcx, info, geometry.launch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_fill() {
        assert_eq!(fill_for_constant(&0.0_f32.to_le_bytes(), 16), Some(Fill::Zero));
        assert_eq!(fill_for_constant(&[0], 3), Some(Fill::Zero));
    }

    #[test]
    fn test_narrow_values_repeat() {
        assert_eq!(fill_for_constant(&[0xab], 8), Some(Fill::Word(0xabab_abab)));
        assert_eq!(fill_for_constant(&[0x34, 0x12], 8), Some(Fill::Word(0x1234_1234)));
        assert_eq!(fill_for_constant(&[0xab], 6), None);
    }

    #[test]
    fn test_word_values() {
        let one = 1.0_f32.to_le_bytes();
        assert_eq!(fill_for_constant(&one, 12), Some(Fill::Word(0x3f80_0000)));
        let min = f64::MIN.to_le_bytes();
        assert_eq!(fill_for_constant(&min, 16), None);
        let mut repeated = [0_u8; 8];
        repeated[..4].copy_from_slice(&7_u32.to_le_bytes());
        repeated[4..].copy_from_slice(&7_u32.to_le_bytes());
        assert_eq!(fill_for_constant(&repeated, 16), Some(Fill::Word(7)));
    }
}
