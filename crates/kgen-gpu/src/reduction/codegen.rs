//! The reduction kernel.
//!
//! Output groups run side by side in one launch, selected by `blockIdx.y`.
//! Within a group every thread folds its share of a tile into per-thread
//! partial results, then the block combines them and one thread (row) or
//! one lane per column (column) folds the block's result into the output
//! with an atomic. The outputs are filled with the init value beforehand.

use super::{
    check_fused_outputs_consistent, compute_reduction_codegen_info, divide_output_instructions_into_groups,
    is_reduction_from_or_to_contiguous_dimensions, kept_element_shape, root_outputs, ReductionCodegenInfo,
};
use crate::atomics::emit_atomic_operation;
use crate::context::ModuleContext;
use crate::elemental::Elemental;
use crate::initializer::build_initializer_thunk;
use crate::ir_array::{IrArray, IrIndex};
use crate::launch::{index_type_for_kernel, Dim3, LaunchDimensions};
use crate::loop_emitter::{emit_tuple_pointer_table, output_index};
use crate::prototype::build_kernel_prototype;
use crate::thunk::Thunk;
use crate::tile_emitter::{
    emit_start_offset_x, emit_tile, emit_tiling_kernel, unnormalized_index, ThreadIdInfo, TilingKernelInfo, WARP_SIZE,
};
use crate::tiling::{DIM_X, DIM_Y, DIM_Z};
use crate::{GpuError, GpuResult};
use kgen_hlo::{ArrayShape, CompId, InstrId, Opcode};
use kgen_kir::{AddressSpace, BinOp, Builder, CmpOp, FuncId, LocalId, ScalarType, SharedId, SpecialReg, ValueId};
use tracing::debug;

/// Lane distances of a warp-wide tree reduction.
const SHUFFLE_DISTANCES: [u32; 5] = [16, 8, 4, 2, 1];

/// Per-reduce state of one output group.
#[derive(Clone, Debug)]
struct ReductionCodegenState {
    /// Position among the unnested instruction's outputs.
    position: usize,
    reduce: InstrId,
    reducer: CompId,
    function: FuncId,
    result_types: Vec<ScalarType>,
    ty: ScalarType,
    init: ValueId,
    input: LocalId,
    partials: LocalId,
    scratch: LocalId,
    shared: SharedId,
}

struct ReductionEmitter<'a> {
    info: &'a ReductionCodegenInfo,
    outputs: &'a [InstrId],
    arrays: &'a [IrArray],
    elemental: &'a Elemental,
    input_shape: &'a ArrayShape,
    index_type: ScalarType,
}

/// Emit the initializers and the kernel of a contiguous reduction: an
/// unfused reduce or an input fusion rooted at reduces.
pub fn emit_reduction(mcx: &mut ModuleContext<'_>, instr: InstrId) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let unnested = hlo.instr(instr);
    if let Some(root) = hlo.fused_root(instr) {
        let root = hlo.instr(root);
        if matches!(root.opcode(), Opcode::Reduce { .. }) && root.shape().is_tuple() {
            return Err(GpuError::Unimplemented(
                "Vectorized variadic reduce is not supported on GPU".to_string(),
            ));
        }
    }

    let outputs = root_outputs(hlo, unnested);
    let reduce_positions: Vec<usize> = outputs
        .iter()
        .enumerate()
        .filter(|&(_, &output)| is_reduction_from_or_to_contiguous_dimensions(hlo, hlo.instr(output)))
        .map(|(position, _)| position)
        .collect();
    let Some(&first_position) = reduce_positions.first() else {
        return Err(GpuError::Internal(format!(
            "{} has no reduction from or to contiguous dimensions",
            unnested.name()
        )));
    };
    let first_reduce = outputs[first_position];
    if outputs.len() > 1 {
        check_fused_outputs_consistent(hlo, &outputs, first_reduce)?;
    }

    let multi_output = hlo.is_multi_output_fusion(instr);
    let mut thunks = Vec::with_capacity(reduce_positions.len() + 1);
    for &position in &reduce_positions {
        let index: &[usize] = if multi_output { &[position] } else { &[] };
        thunks.push(build_initializer_thunk(mcx, instr, index)?);
    }

    let info = compute_reduction_codegen_info(mcx, instr, first_reduce)?;
    let groups = divide_output_instructions_into_groups(hlo, instr);
    let blocks = info.scheme.number_of_blocks() as u64;
    let threads = info.scheme.threads_per_block() as u64;
    let index_type = index_type_for_kernel(hlo, unnested, LaunchDimensions::new(blocks, threads).launch_bound());
    let launch = LaunchDimensions {
        blocks: Dim3::new(blocks, groups.len() as u64, 1),
        threads_per_block: Dim3::x(threads),
    };
    debug!(
        instruction = unnested.name(),
        groups = groups.len(),
        partials = info.num_partial_results,
        %launch,
        "reduction kernel"
    );

    let mut kcx = build_kernel_prototype(mcx, instr)?;
    emit_tuple_pointer_table(&mut kcx, hlo, instr)?;
    let arrays = kcx.output_arrays(hlo, instr)?;
    let mut elemental = Elemental::new();
    kcx.bind_inputs(hlo, instr, &mut elemental)?;
    let input_shape = hlo.operand(first_reduce, 0).shape().array_shape()?.clone();

    let emitter = ReductionEmitter {
        info: &info,
        outputs: &outputs,
        arrays: &arrays,
        elemental: &elemental,
        input_shape: &input_shape,
        index_type,
    };
    let b = &mut kcx.builder;
    let raw_block_y = b.special(SpecialReg::BlockIdY);
    let block_y = b.cast(raw_block_y, index_type);
    for (i, group) in groups.iter().enumerate() {
        let selected = b.cmp_imm(CmpOp::Eq, block_y, i as i64);
        b.if_then(selected, |b| emitter.emit_group(mcx, b, group))?;
    }

    let thunk_info = mcx.thunk_info(instr);
    thunks.push(kcx.into_thunk(mcx, thunk_info.clone(), launch));
    Ok(Thunk::Sequential {
        info: thunk_info,
        thunks,
    })
}

impl ReductionEmitter<'_> {
    fn emit_group(&self, mcx: &mut ModuleContext<'_>, b: &mut Builder, group: &[usize]) -> GpuResult<()> {
        let hlo = mcx.hlo;
        let scheme = &self.info.scheme;
        let states = self.emit_prologue(mcx, b, group)?;
        let extra_outputs: Vec<usize> = group
            .iter()
            .copied()
            .filter(|&position| states.iter().all(|state| state.position != position))
            .collect();

        let is_row = self.info.is_row_reduction;
        let mut emit_element = |mcx: &mut ModuleContext<'_>,
                                b: &mut Builder,
                                index: &IrIndex,
                                _y_loc: ValueId,
                                _x_loc: ValueId,
                                x_iter_num: i64|
         -> GpuResult<()> {
            let input_index = unnormalized_index(b, index, self.input_shape, scheme);
            for state in &states {
                let source = hlo.instr(state.reduce).operand(0);
                let value = self.elemental.generate(mcx, b, source, &input_index)?;
                b.store_local(state.input, 0, value);
                let slot = if is_row { 0 } else { x_iter_num as u64 };
                let partial = b.load_local(state.partials, slot);
                let input = b.load_local(state.input, 0);
                let combined = call_reducer(b, state, partial, input)?;
                b.store_local(state.partials, slot, combined);
            }
            let mut values = Vec::with_capacity(extra_outputs.len());
            for &position in &extra_outputs {
                values.push(self.elemental.generate(mcx, b, self.outputs[position], &input_index)?);
            }
            for (&position, value) in extra_outputs.iter().zip(values) {
                let array = &self.arrays[position];
                array.emit_write(b, &output_index(&input_index, array.shape()), value);
            }
            Ok(())
        };
        let mut tile_fn = |mcx: &mut ModuleContext<'_>,
                           b: &mut Builder,
                           thread: &ThreadIdInfo,
                           origin: &IrIndex,
                           bounds: [ValueId; 3]|
         -> GpuResult<()> {
            emit_tile(mcx, b, scheme, origin, thread, bounds[DIM_Y], bounds[DIM_X], &mut emit_element)
        };
        let tiling = emit_tiling_kernel(mcx, b, scheme, self.index_type, &mut tile_fn)?;
        self.emit_epilogue(mcx, b, &states, &tiling)
    }

    /// Seed the partial results and declare the staging memory of every
    /// reduce in `group`.
    fn emit_prologue(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        group: &[usize],
    ) -> GpuResult<Vec<ReductionCodegenState>> {
        let hlo = mcx.hlo;
        let scheme = &self.info.scheme;
        let partials = self.info.num_partial_results as u64;
        let shared_len = if self.info.is_row_reduction {
            partials * WARP_SIZE as u64
        } else {
            let n = scheme.num_threads_x() as u64;
            partials * n * (n + 1)
        };

        let mut states = Vec::new();
        for &position in group {
            let reduce = self.outputs[position];
            let instr = hlo.instr(reduce);
            let Opcode::Reduce { to_apply, .. } = instr.opcode() else {
                continue;
            };
            let ty = ScalarType::from(instr.shape().array_shape()?.element_type());
            let init_operand = instr.operand(1);
            let init_shape = hlo.instr(init_operand).shape().array_shape()?;
            let scalar = IrIndex::new([], init_shape, self.index_type);
            let init = self.elemental.generate(mcx, b, init_operand, &scalar)?;

            let input = b.alloc_local(format!("reduction_input_{position}"), ty, 1);
            let partial_results = b.alloc_local(format!("partial_reduction_result_{position}"), ty, partials);
            for slot in 0..partials {
                b.store_local(partial_results, slot, init);
            }
            let scratch = b.alloc_local(format!("block_accum_{position}"), ty, 1);
            let shared = b.alloc_shared(format!("shared_cache_{position}"), ty, shared_len);
            states.push(ReductionCodegenState {
                position,
                reduce,
                reducer: *to_apply,
                function: mcx.function_for(*to_apply)?,
                result_types: mcx.function_result_types(*to_apply)?,
                ty,
                init,
                input,
                partials: partial_results,
                scratch,
                shared,
            });
        }
        Ok(states)
    }

    fn emit_epilogue(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        states: &[ReductionCodegenState],
        tiling: &TilingKernelInfo,
    ) -> GpuResult<()> {
        let hlo = mcx.hlo;
        for state in states {
            let Opcode::Reduce { dimensions, .. } = hlo.instr(state.reduce).opcode() else {
                continue;
            };
            let kept_shape = kept_element_shape(self.input_shape, dimensions);
            let output = &self.arrays[state.position];
            for j in 0..self.info.num_partial_results {
                let address = self.output_address(b, tiling, &kept_shape, output, j);
                if self.info.is_row_reduction {
                    self.emit_row_epilogue(mcx, b, state, &tiling.thread, j, address)?;
                } else {
                    self.emit_column_epilogue(mcx, b, state, tiling, j, address)?;
                }
            }
        }
        Ok(())
    }

    /// Address of the output element partial result `j` of this thread
    /// belongs to.
    fn output_address(
        &self,
        b: &mut Builder,
        tiling: &TilingKernelInfo,
        kept_shape: &ArrayShape,
        output: &IrArray,
        j: i64,
    ) -> ValueId {
        let scheme = &self.info.scheme;
        let thread = &tiling.thread;
        let (x_loc, y_loc) = if self.info.is_row_reduction {
            (thread.thread_id_x, thread.thread_id_y)
        } else {
            (thread.thread_id_y, thread.thread_id_x)
        };
        let start_x = emit_start_offset_x(b, scheme, x_loc);
        let at_row = tiling.tile_origin.add_offset_to_dim(b, y_loc, DIM_Y);
        let start = at_row.add_offset_to_dim(b, start_x, DIM_X);
        let offset = b.int(self.index_type, j);
        let element = start.add_offset_to_dim(b, offset, DIM_X);

        let linear = if self.info.is_row_reduction {
            element.get(DIM_Y)
        } else {
            let major = b.binary_imm(BinOp::Mul, element.get(DIM_Z), scheme.dims_in_elems()[DIM_X]);
            b.add(major, element.get(DIM_X))
        };
        let kept_index = IrIndex::from_linear(b, linear, kept_shape);
        output.element_address(b, &kept_index.with_shape(output.shape()))
    }

    fn shuffle_reduce(&self, b: &mut Builder, state: &ReductionCodegenState, cell: LocalId, slot: u64) -> GpuResult<()> {
        for distance in SHUFFLE_DISTANCES {
            let value = b.load_local(cell, slot);
            let other = b.shfl_down(value, distance);
            let combined = call_reducer(b, state, value, other)?;
            b.store_local(cell, slot, combined);
        }
        Ok(())
    }

    fn shared_element(&self, b: &mut Builder, state: &ReductionCodegenState, index: ValueId) -> ValueId {
        let base = b.shared_addr(state.shared);
        b.element_addr(base, index, state.ty.byte_size())
    }

    /// Warp shuffles, then one partial per warp through shared memory,
    /// then warp 0 combines those and thread 0 writes.
    fn emit_row_epilogue(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        state: &ReductionCodegenState,
        thread: &ThreadIdInfo,
        j: i64,
        address: ValueId,
    ) -> GpuResult<()> {
        let slot = j as u64;
        let num_warps = self.info.scheme.num_threads_x() / WARP_SIZE;
        self.shuffle_reduce(b, state, state.partials, slot)?;

        let warp_id = b.binary_imm(BinOp::Div, thread.thread_id_x, WARP_SIZE);
        let lane_zero = b.cmp_imm(CmpOp::Eq, thread.lane_id, 0);
        b.if_then(lane_zero, |b| -> GpuResult<()> {
            let index = b.binary_imm(BinOp::Add, warp_id, j * WARP_SIZE);
            let addr = self.shared_element(b, state, index);
            let value = b.load_local(state.partials, slot);
            b.store(AddressSpace::Shared, addr, value);
            Ok(())
        })?;
        b.barrier();

        let warp_zero = b.cmp_imm(CmpOp::Eq, warp_id, 0);
        b.if_then(warp_zero, |b| -> GpuResult<()> {
            b.store_local(state.scratch, 0, state.init);
            let warp_exists = b.cmp_imm(CmpOp::Lt, thread.thread_id_x, num_warps);
            b.if_then(warp_exists, |b| -> GpuResult<()> {
                let index = b.binary_imm(BinOp::Add, thread.lane_id, j * WARP_SIZE);
                let addr = self.shared_element(b, state, index);
                let value = b.load(AddressSpace::Shared, state.ty, addr);
                b.store_local(state.scratch, 0, value);
                Ok(())
            })?;
            self.shuffle_reduce(b, state, state.scratch, 0)?;
            let thread_zero = b.cmp_imm(CmpOp::Eq, thread.thread_id_x, 0);
            b.if_then(thread_zero, |b| {
                let value = b.load_local(state.scratch, 0);
                emit_atomic_operation(mcx, b, state.reducer, address, value)
            })
        })
    }

    /// Transpose the partials through shared memory so each warp holds one
    /// column, then shuffle and let lane 0 write.
    fn emit_column_epilogue(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        state: &ReductionCodegenState,
        tiling: &TilingKernelInfo,
        j: i64,
        address: ValueId,
    ) -> GpuResult<()> {
        let scheme = &self.info.scheme;
        let thread = &tiling.thread;
        let slot = j as u64;
        let n = scheme.num_threads_x();
        let plane = j * n * (n + 1);

        let row = b.binary_imm(BinOp::Mul, thread.thread_id_x, n + 1);
        let written = b.add(row, thread.thread_id_y);
        let written = b.binary_imm(BinOp::Add, written, plane);
        let addr = self.shared_element(b, state, written);
        let partial = b.load_local(state.partials, slot);
        b.store(AddressSpace::Shared, addr, partial);
        b.barrier();

        let row = b.binary_imm(BinOp::Mul, thread.thread_id_y, n + 1);
        let read = b.add(row, thread.thread_id_x);
        let read = b.binary_imm(BinOp::Add, read, plane);
        let addr = self.shared_element(b, state, read);
        let transposed = b.load(AddressSpace::Shared, state.ty, addr);
        b.store_local(state.scratch, 0, transposed);
        self.shuffle_reduce(b, state, state.scratch, 0)?;

        let start_x = emit_start_offset_x(b, scheme, thread.thread_id_y);
        let column = b.binary_imm(BinOp::Add, start_x, j);
        let column_in_tile = b.cmp(CmpOp::Lt, column, tiling.output_tile_bounds[DIM_X]);
        let row_in_tile = b.cmp(CmpOp::Lt, thread.thread_id_x, tiling.output_tile_bounds[DIM_Y]);
        let lane_zero = b.cmp_imm(CmpOp::Eq, thread.lane_id, 0);
        let in_tile = b.and(column_in_tile, row_in_tile);
        let has_output = b.and(in_tile, lane_zero);
        b.if_then(has_output, |b| {
            let value = b.load_local(state.scratch, 0);
            emit_atomic_operation(mcx, b, state.reducer, address, value)
        })
    }
}

fn call_reducer(b: &mut Builder, state: &ReductionCodegenState, accumulator: ValueId, value: ValueId) -> GpuResult<ValueId> {
    b.call(state.function, &[accumulator, value], &state.result_types)
        .first()
        .copied()
        .ok_or_else(|| GpuError::Internal(format!("reducer of output {} returns nothing", state.position)))
}
