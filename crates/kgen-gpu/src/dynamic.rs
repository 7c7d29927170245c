//! Dynamic-update-slice in place, and conversions between static arrays
//! and dynamic ones.
//!
//! A dynamic array's buffer holds its data at the static bounds followed by
//! one `s32` per dimension giving the runtime size. The elements of a
//! runtime size are packed densely in the layout's physical order.

use crate::context::ModuleContext;
use crate::elemental::{read_dynamic_size, Elemental};
use crate::ir_array::IrIndex;
use crate::loop_emitter::{emit_parallel_loop, emit_tuple_pointer_table, LoopGeometry};
use crate::prototype::build_kernel_prototype;
use crate::thunk::{sequence_or_single, Thunk, ThunkInfo};
use crate::{GpuError, GpuResult};
use kgen_hlo::{ArrayShape, InstrId, Opcode};
use kgen_kir::{AddressSpace, Builder, CmpOp, ScalarType, SpecialReg, ValueId};
use smallvec::SmallVec;
use tracing::debug;

/// Returns true if `fusion`, rooted at a dynamic-update-slice, can write
/// the update straight into its output: the updated operand is a fused
/// parameter read by nothing else and sharing the fusion's buffer.
#[must_use]
pub fn can_update_fusion_in_place(mcx: &ModuleContext<'_>, fusion: InstrId) -> bool {
    let hlo = mcx.hlo;
    let Some(root) = hlo.fused_root(fusion) else {
        return false;
    };
    let root_instr = hlo.instr(root);
    if !matches!(root_instr.opcode(), Opcode::DynamicUpdateSlice) {
        return false;
    }
    let operand = hlo.instr(root_instr.operand(0));
    if !matches!(operand.opcode(), Opcode::Parameter { .. }) || operand.users() != &[root] {
        return false;
    }
    let Some(outer) = hlo.fusion_operand_for_parameter(operand.id()) else {
        return false;
    };
    match (
        mcx.assignment.unique_top_level_slice(outer),
        mcx.assignment.unique_top_level_slice(fusion),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// An unfused dynamic-update-slice: the operand is copied to the output
/// unless they share a buffer, then the update is written over it.
pub fn emit_dynamic_update_slice(mcx: &mut ModuleContext<'_>, instr: InstrId) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let dus = hlo.instr(instr);
    let info = mcx.thunk_info(instr);
    let mut thunks = Vec::with_capacity(2);
    let operand = mcx.slice(dus.operand(0), &[])?;
    let output = mcx.slice(instr, &[])?;
    if operand != output {
        thunks.push(Thunk::Copy {
            info: ThunkInfo::new(dus.name(), None),
            source: operand,
            destination: output,
        });
    }
    thunks.push(emit_update_in_place(mcx, instr, instr)?);
    sequence_or_single(info, thunks).ok_or_else(|| GpuError::Internal(format!("no thunks for {}", dus.name())))
}

/// A kernel launched over the update of `dus`, writing each update element
/// at its clamped position in the output of `kernel_instr` (`dus` itself,
/// or the fusion it is the root of).
pub fn emit_update_in_place(mcx: &mut ModuleContext<'_>, kernel_instr: InstrId, dus: InstrId) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let dus_instr = hlo.instr(dus);
    let update = dus_instr.operand(1);
    let update_shape = hlo.instr(update).shape().array_shape()?.clone();
    let operand_shape = dus_instr.shape().array_shape()?.clone();
    let limits: SmallVec<[i64; 4]> = (0..operand_shape.rank())
        .map(|dim| operand_shape.dim(dim) - update_shape.dim(dim))
        .collect();
    let starts: Vec<InstrId> = dus_instr.operands()[2..].to_vec();

    let mut kcx = build_kernel_prototype(mcx, kernel_instr)?;
    let output = kcx.array_for(hlo, kernel_instr, &[])?;
    let mut elemental = Elemental::new();
    kcx.bind_inputs(hlo, kernel_instr, &mut elemental)?;
    let geometry = LoopGeometry::for_instruction(mcx, kernel_instr, &update_shape, Some(1));
    debug!(
        instruction = hlo.instr(kernel_instr).name(),
        update = %update_shape,
        launch = %geometry.launch,
        "dynamic-update-slice in place"
    );

    let mut body = |mcx: &mut ModuleContext<'_>, b: &mut Builder, index: &IrIndex| -> GpuResult<()> {
        let offsets = elemental.dynamic_starts(mcx, b, &starts, &limits, index.index_type())?;
        let value = elemental.generate(mcx, b, update, index)?;
        let coords: SmallVec<[ValueId; 4]> = index
            .multidim()
            .iter()
            .zip(&offsets)
            .map(|(&coord, &offset)| b.add(coord, offset))
            .collect();
        let target = IrIndex::new(coords, output.shape(), index.index_type());
        output.emit_write(b, &target, value);
        Ok(())
    };
    emit_parallel_loop(mcx, &mut kcx.builder, &update_shape, &geometry, &mut body)?;
    let info = mcx.thunk_info(kernel_instr);
    Ok(kcx.into_thunk(mcx, info, geometry.launch))
}

/// `PadToStatic`: writes the runtime sizes of the dynamic operand to the
/// scalar outputs and scatters its packed elements to their coordinates in
/// the static output. Elements past the runtime sizes are left unwritten.
pub fn emit_pad_to_static(mcx: &mut ModuleContext<'_>, instr: InstrId) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let custom_call = hlo.instr(instr);
    let operand = custom_call.operand(0);
    let mut kcx = build_kernel_prototype(mcx, instr)?;
    let source = kcx.array_for(hlo, operand, &[])?;
    if !source.shape().is_dynamic() {
        return Err(GpuError::FailedPrecondition(format!(
            "PadToStatic {} reads the static array {}",
            custom_call.name(),
            source.shape()
        )));
    }
    let outputs = kcx.output_arrays(hlo, instr)?;
    let rank = source.shape().rank();
    if outputs.len() != rank + 1 {
        return Err(GpuError::Internal(format!(
            "PadToStatic {} has {} outputs for rank {rank}",
            custom_call.name(),
            outputs.len()
        )));
    }
    emit_tuple_pointer_table(&mut kcx, hlo, instr)?;

    let shape = source.shape().clone();
    let geometry = LoopGeometry::for_instruction(mcx, instr, &shape, Some(1));
    let ty = geometry.index_type;
    let b = &mut kcx.builder;
    let raw_sizes: Vec<ValueId> = (0..rank).map(|dim| read_dynamic_size(b, &source, dim)).collect();
    let first = emit_is_first_thread(b);
    b.if_then(first, |b| {
        for (dim, &size) in raw_sizes.iter().enumerate() {
            let scalar = IrIndex::new([], outputs[dim + 1].shape(), ty);
            outputs[dim + 1].emit_write(b, &scalar, size);
        }
        Ok::<_, GpuError>(())
    })?;
    let sizes: Vec<ValueId> = raw_sizes.iter().map(|&size| b.cast(size, ty)).collect();
    let total = emit_product(b, &sizes, ty);
    debug!(instruction = custom_call.name(), %shape, launch = %geometry.launch, "pad to static");

    let data = &outputs[0];
    let mut body = |_: &mut ModuleContext<'_>, b: &mut Builder, index: &IrIndex| -> GpuResult<()> {
        let linear = index.linearize(b, &shape);
        let live = b.cmp(CmpOp::Lt, linear, total);
        b.if_then(live, |b| {
            let value = source.emit_read(b, index);
            let coords = delinearize_dynamic(b, linear, &sizes, data.shape());
            let target = IrIndex::new(coords, data.shape(), ty);
            data.emit_write(b, &target, value);
            Ok::<_, GpuError>(())
        })
    };
    emit_parallel_loop(mcx, &mut kcx.builder, &shape, &geometry, &mut body)?;
    let info = mcx.thunk_info(instr);
    Ok(kcx.into_thunk(mcx, info, geometry.launch))
}

/// `SliceToDynamic`: packs the leading elements of the static operand, as
/// given by the `s32` size operands, into a dynamic output and records the
/// sizes after its data.
pub fn emit_slice_to_dynamic(mcx: &mut ModuleContext<'_>, instr: InstrId) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let custom_call = hlo.instr(instr);
    let operand = custom_call.operand(0);
    let operand_shape = hlo.instr(operand).shape().array_shape()?.clone();
    let mut kcx = build_kernel_prototype(mcx, instr)?;
    let output = kcx.array_for(hlo, instr, &[])?;
    let rank = output.shape().rank();
    if !output.shape().is_dynamic() || custom_call.operands().len() != rank + 1 {
        return Err(GpuError::FailedPrecondition(format!(
            "SliceToDynamic {} needs a dynamic result and one size per dimension",
            custom_call.name()
        )));
    }
    let mut elemental = Elemental::new();
    kcx.bind_inputs(hlo, instr, &mut elemental)?;

    let shape = output.shape().clone();
    let geometry = LoopGeometry::for_instruction(mcx, instr, &shape, Some(1));
    let ty = geometry.index_type;
    let mut raw_sizes = Vec::with_capacity(rank);
    for &size in &custom_call.operands()[1..] {
        let size_shape = hlo.instr(size).shape().array_shape()?;
        let scalar = IrIndex::new([], size_shape, ty);
        let value = elemental.generate(mcx, &mut kcx.builder, size, &scalar)?;
        raw_sizes.push(kcx.builder.cast(value, ScalarType::S32));
    }
    let b = &mut kcx.builder;
    let first = emit_is_first_thread(b);
    b.if_then(first, |b| {
        for (dim, &size) in raw_sizes.iter().enumerate() {
            let slot = b.byte_offset(output.base(), shape.data_byte_size() + 4 * dim as u64);
            b.store(AddressSpace::Global, slot, size);
        }
        Ok::<_, GpuError>(())
    })?;
    let sizes: Vec<ValueId> = raw_sizes.iter().map(|&size| b.cast(size, ty)).collect();
    let total = emit_product(b, &sizes, ty);
    debug!(instruction = custom_call.name(), %shape, launch = %geometry.launch, "slice to dynamic");

    let mut body = |mcx: &mut ModuleContext<'_>, b: &mut Builder, index: &IrIndex| -> GpuResult<()> {
        let linear = index.linearize(b, &shape);
        let live = b.cmp(CmpOp::Lt, linear, total);
        b.if_then(live, |b| {
            let coords = delinearize_dynamic(b, linear, &sizes, &operand_shape);
            let source = IrIndex::new(coords, &operand_shape, ty);
            let value = elemental.generate(mcx, b, operand, &source)?;
            output.emit_write(b, index, value);
            Ok(())
        })
    };
    emit_parallel_loop(mcx, &mut kcx.builder, &shape, &geometry, &mut body)?;
    let info = mcx.thunk_info(instr);
    Ok(kcx.into_thunk(mcx, info, geometry.launch))
}

fn emit_is_first_thread(b: &mut Builder) -> ValueId {
    let block = b.special(SpecialReg::BlockIdX);
    let thread = b.special(SpecialReg::ThreadIdX);
    let first_block = b.cmp_imm(CmpOp::Eq, block, 0);
    let first_thread = b.cmp_imm(CmpOp::Eq, thread, 0);
    b.and(first_block, first_thread)
}

fn emit_product(b: &mut Builder, values: &[ValueId], ty: ScalarType) -> ValueId {
    let one = b.int(ty, 1);
    values.iter().fold(one, |acc, &v| b.mul(acc, v))
}

/// Coordinates of packed position `linear` within runtime `sizes`, peeled
/// off in `shape`'s physical order.
fn delinearize_dynamic(b: &mut Builder, linear: ValueId, sizes: &[ValueId], shape: &ArrayShape) -> SmallVec<[ValueId; 4]> {
    let ty = b.value_type(linear);
    let zero = b.int(ty, 0);
    let mut coords: SmallVec<[ValueId; 4]> = SmallVec::from_elem(zero, shape.rank());
    let order = shape.layout().minor_to_major();
    let mut divisor: Option<ValueId> = None;
    for (i, &dim) in order.iter().enumerate() {
        let quot = match divisor {
            Some(d) => b.div(linear, d),
            None => linear,
        };
        coords[dim] = if i + 1 == order.len() {
            quot
        } else {
            b.rem(quot, sizes[dim])
        };
        divisor = Some(match divisor {
            Some(d) => b.mul(d, sizes[dim]),
            None => sizes[dim],
        });
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmitterConfig;
    use crate::device::DeviceInfo;
    use kgen_hlo::{BufferAssignment, FusionKind, HloModule, PrimitiveType, Shape};

    fn dus_fusion(module: &mut HloModule) -> (InstrId, InstrId) {
        let mut fb = module.builder("fused_dus");
        let p = fb.parameter(0, Shape::array(PrimitiveType::F32, &[8, 4]));
        let u = fb.parameter(1, Shape::array(PrimitiveType::F32, &[2, 4]));
        let i = fb.parameter(2, Shape::scalar(PrimitiveType::S32));
        let j = fb.parameter(3, Shape::scalar(PrimitiveType::S32));
        let root = fb.dynamic_update_slice(p, u, &[i, j]).unwrap();
        let fused = fb.build(root);
        let mut b = module.builder("entry");
        let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[8, 4]));
        let y = b.parameter(1, Shape::array(PrimitiveType::F32, &[2, 4]));
        let s = b.parameter(2, Shape::scalar(PrimitiveType::S32));
        let t = b.parameter(3, Shape::scalar(PrimitiveType::S32));
        let fusion = b.fusion(FusionKind::Loop, fused, &[x, y, s, t]);
        let entry = b.build(fusion);
        module.set_entry(entry);
        (x, fusion)
    }

    #[test]
    fn test_fusion_in_place_needs_shared_buffer() {
        let mut module = HloModule::new("m");
        let (x, fusion) = dus_fusion(&mut module);
        let config = EmitterConfig::default();
        let device = DeviceInfo::mock();

        let assignment = BufferAssignment::assign(&module).unwrap();
        let mcx = ModuleContext::new(&module, &assignment, &config, &device);
        assert!(!can_update_fusion_in_place(&mcx, fusion));

        let mut shared = BufferAssignment::assign(&module).unwrap();
        shared.share(&module, x, fusion);
        let mcx = ModuleContext::new(&module, &shared, &config, &device);
        assert!(can_update_fusion_in_place(&mcx, fusion));
    }
}
