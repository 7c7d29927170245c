//! Kernel entry points and the binding of values to kernel arguments.
//!
//! A kernel gets one pointer per allocation it touches (plus the temp
//! allocation, always), sorted by allocation index. Every value the kernel
//! reads or writes is then bound to an address computed from those
//! pointers at kernel entry.
//!
//! ```text
//! alloc0 ──► param 0 ──► + offset ─────────────────► p0
//! temp_buf ─► param 1 ──► + offset ──► load [idx*8] ─► gte(t, idx)
//! constant ─► global  ──► + offset ─────────────────► c
//! ```

use crate::context::ModuleContext;
use crate::elemental::Elemental;
use crate::ir_array::IrArray;
use crate::launch::LaunchDimensions;
use crate::thunk::{Thunk, ThunkInfo};
use crate::{GpuError, GpuResult};
use kgen_hlo::{
    AllocationKind, BufferAssignment, BufferSlice, HloModule, InstrId, Opcode, ShapeIndex,
};
use kgen_kir::{AddressSpace, Builder, Kernel, ParamFlags, ScalarType, ValueId};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

/// Alignment guaranteed for entry parameter buffers.
pub const ENTRY_PARAMETER_ALIGN_BYTES: u32 = 16;
/// Alignment guaranteed for every other buffer.
pub const BUFFER_ALIGN_BYTES: u32 = 64;

/// Where `(instr, index)` lives: a slice, plus the tuple indices to follow
/// through pointer tables from there.
pub type ResolvedSlice = (BufferSlice, ShapeIndex);

/// Resolve the storage of `(instr, index)`.
///
/// Tried in order: the value's own slice; the slices of bitcast sources;
/// the slices of get-tuple-element sources (indirecting through their
/// pointer tables); the slices of enclosing tuples of `instr` itself.
#[must_use]
pub fn find_slice_for(
    module: &HloModule,
    assignment: &BufferAssignment,
    instr: InstrId,
    index: &[usize],
) -> Option<ResolvedSlice> {
    if let Some(slice) = assignment.unique_slice(instr, index) {
        return Some((slice, ShapeIndex::new()));
    }

    let mut parent = module.instr(instr);
    while matches!(parent.opcode(), Opcode::Bitcast) {
        parent = module.instr(parent.operand(0));
        if let Some(slice) = assignment.unique_top_level_slice(parent.id()) {
            return Some((slice, ShapeIndex::new()));
        }
    }

    let mut gte_indices = ShapeIndex::new();
    while let Opcode::GetTupleElement { index: element } = parent.opcode() {
        gte_indices.insert(0, *element);
        parent = module.instr(parent.operand(0));
        if let Some(slice) = assignment.unique_top_level_slice(parent.id()) {
            return Some((slice, gte_indices));
        }
    }

    let mut prefix: ShapeIndex = index.iter().copied().collect();
    let mut gte_indices = ShapeIndex::new();
    while let Some(last) = prefix.pop() {
        gte_indices.insert(0, last);
        if let Some(slice) = assignment.unique_slice(instr, &prefix) {
            return Some((slice, gte_indices));
        }
    }
    None
}

/// Slices of every subshape of `instr` and of its operands.
#[must_use]
pub fn hlo_buffer_slices(
    module: &HloModule,
    assignment: &BufferAssignment,
    instr: InstrId,
) -> Vec<((InstrId, ShapeIndex), ResolvedSlice)> {
    let mut seen = FxHashSet::default();
    let mut slices = Vec::new();
    let hlo = module.instr(instr);
    for value in std::iter::once(instr).chain(hlo.operands().iter().copied()) {
        for (index, _) in module.instr(value).shape().subshapes() {
            let key = (value, index);
            if seen.contains(&key) {
                continue;
            }
            if let Some(resolved) = find_slice_for(module, assignment, value, &key.1) {
                slices.push((key.clone(), resolved));
            } else {
                trace!(
                    instruction = module.instr(value).name(),
                    index = ?key.1,
                    "no buffer for value"
                );
            }
            seen.insert(key);
        }
    }
    slices
}

/// A kernel under construction, with its values bound to arguments.
#[derive(Debug)]
pub struct KernelContext {
    /// The kernel body builder.
    pub builder: Builder,
    /// Allocation index of each kernel parameter.
    pub args: Vec<usize>,
    bindings: FxHashMap<(InstrId, ShapeIndex), ValueId>,
}

impl KernelContext {
    /// Name of the kernel.
    #[must_use]
    pub fn name(&self) -> &str {
        self.builder.name()
    }

    /// Address of `(instr, index)`, if it was bound.
    #[must_use]
    pub fn address(&self, instr: InstrId, index: &[usize]) -> Option<ValueId> {
        self.bindings
            .get(&(instr, index.iter().copied().collect()))
            .copied()
    }

    /// The array subshape `(instr, index)` as a buffer view.
    pub fn array_for(&self, module: &HloModule, instr: InstrId, index: &[usize]) -> GpuResult<IrArray> {
        let hlo = module.instr(instr);
        let shape = hlo.shape().try_subshape(index)?.array_shape()?.clone();
        let base = self.address(instr, index).ok_or_else(|| {
            GpuError::Internal(format!(
                "no buffer bound for {} at {index:?} in kernel {}",
                hlo.name(),
                self.name()
            ))
        })?;
        Ok(IrArray::new(base, shape))
    }

    /// Buffers for each array output of `instr`: the value itself, or each
    /// tuple element.
    pub fn output_arrays(&self, module: &HloModule, instr: InstrId) -> GpuResult<Vec<IrArray>> {
        let shape = module.instr(instr).shape();
        if shape.is_array() {
            return Ok(vec![self.array_for(module, instr, &[])?]);
        }
        (0..shape.tuple_shapes().len())
            .map(|i| self.array_for(module, instr, &[i]))
            .collect()
    }

    /// Bind the operands of `instr` (or, for a fusion, its fused
    /// parameters) for reading.
    pub fn bind_inputs(&self, module: &HloModule, instr: InstrId, elemental: &mut Elemental) -> GpuResult<()> {
        let hlo = module.instr(instr);
        if hlo.fused_computation().is_some() {
            for (number, &param) in module.fused_parameters(instr).iter().enumerate() {
                let operand = hlo.operand(number);
                if module.instr(operand).shape().is_array() {
                    elemental.bind_array(param, self.array_for(module, operand, &[])?);
                }
            }
        } else {
            for &operand in hlo.operands() {
                if module.instr(operand).shape().is_array() {
                    if let Some(base) = self.address(operand, &[]) {
                        let shape = module.instr(operand).shape().array_shape()?.clone();
                        elemental.bind_array(operand, IrArray::new(base, shape));
                    }
                }
            }
        }
        Ok(())
    }

    /// Finish the kernel.
    #[must_use]
    pub fn finish(self) -> Kernel {
        self.builder.finish_kernel()
    }

    /// Finish the kernel, add it to the module and return the thunk
    /// launching it.
    pub fn into_thunk(self, mcx: &mut ModuleContext<'_>, info: ThunkInfo, launch: LaunchDimensions) -> Thunk {
        let args = self.args.clone();
        let kernel = self.finish();
        let kernel_name = kernel.name.clone();
        trace!(kernel = %kernel_name, %launch, "kernel thunk");
        mcx.add_kernel(kernel);
        Thunk::Kernel {
            info,
            kernel_name,
            args,
            launch,
        }
    }
}

/// Declare a kernel for `instr` and bind every value it touches.
pub fn build_kernel_prototype(mcx: &mut ModuleContext<'_>, instr: InstrId) -> GpuResult<KernelContext> {
    let hlo = mcx.hlo;
    let assignment = mcx.assignment;
    let slices = hlo_buffer_slices(hlo, assignment, instr);

    let mut needed: Vec<usize> = slices.iter().map(|(_, (slice, _))| slice.allocation).collect();
    if let Some(temp) = assignment.temp_allocation() {
        needed.push(temp.index());
    }
    needed.sort_unstable();
    needed.dedup();
    needed.retain(|&a| !assignment.allocation(a).is_constant());

    let written: FxHashSet<usize> = hlo
        .instr(instr)
        .shape()
        .subshapes()
        .iter()
        .filter_map(|(index, _)| find_slice_for(hlo, assignment, instr, index))
        .map(|(slice, _)| slice.allocation)
        .collect();

    let name = mcx.unique_name(hlo.instr(instr).name());
    let mut b = Builder::new(name);
    let mut params = FxHashMap::default();
    for &index in &needed {
        let allocation = assignment.allocation(index);
        let arg_name = if allocation.is_temp() {
            "temp_buf".to_string()
        } else {
            format!("alloc{index}")
        };
        let align = if allocation.is_entry_parameter() {
            ENTRY_PARAMETER_ALIGN_BYTES
        } else {
            BUFFER_ALIGN_BYTES
        };
        let mut flags = ParamFlags::NOALIAS;
        if allocation.is_entry_parameter() && !written.contains(&index) {
            flags |= ParamFlags::READ_ONLY;
        }
        let position = b.add_param(arg_name, flags, align, allocation.size());
        params.insert(index, position);
    }

    let mut bindings = FxHashMap::default();
    for ((value, index), (slice, gte_indices)) in slices {
        let allocation = assignment.allocation(slice.allocation);
        let base = match allocation.kind() {
            AllocationKind::Constant { instruction } => {
                let global = mcx.constant_global(*instruction)?;
                b.global_addr(global)
            }
            _ => {
                let position = params.get(&slice.allocation).copied().ok_or_else(|| {
                    GpuError::Internal(format!(
                        "allocation {} missing from kernel arguments",
                        slice.allocation
                    ))
                })?;
                b.param_addr(position)
            }
        };
        let mut address = b.byte_offset(base, slice.offset);
        for &element in &gte_indices {
            let entry = b.byte_offset(address, element as u64 * 8);
            address = b.load(AddressSpace::Global, ScalarType::U64, entry);
        }
        bindings.insert((value, index), address);
    }

    trace!(
        kernel = b.name(),
        args = needed.len(),
        values = bindings.len(),
        "built kernel prototype"
    );
    Ok(KernelContext {
        builder: b,
        args: needed,
        bindings,
    })
}
