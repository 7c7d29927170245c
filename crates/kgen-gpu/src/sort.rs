//! Bitonic sort.
//!
//! The sort runs in place on the output buffers as a sequence of
//! compare-exchange passes. Pass `mask` compares position `i` with
//! `i ^ mask`. Consecutive passes whose masks stay inside one tile run in a
//! single kernel on a shared-memory copy of the tile; every other pass is
//! its own kernel over global memory.

use crate::context::ModuleContext;
use crate::ir_array::{IrArray, IrIndex};
use crate::launch::{calculate_launch_dimensions, index_type_for_kernel, LaunchDimensions};
use crate::loop_emitter::{emit_parallel_loop, emit_tuple_pointer_table, LoopGeometry};
use crate::prototype::build_kernel_prototype;
use crate::thunk::{Thunk, ThunkInfo};
use crate::tiling::{ceil_of_ratio, round_up_to};
use crate::{DeviceInfo, GpuError, GpuResult};
use kgen_hlo::{ArrayShape, InstrId, Opcode, PrimitiveType};
use kgen_kir::{AddressSpace, BinOp, Builder, CmpOp, FuncId, ScalarType, SharedId, SpecialReg, ValueId};
use smallvec::SmallVec;
use tracing::debug;

/// Largest tile sorted in shared memory.
pub const MAX_SORT_TILE: i64 = 2048;

/// Tiles smaller than this are not worth a shared-memory kernel.
const MIN_TILED_SORT_TILE: i64 = 128;

/// `ceil(log2(n))`, 0 for `n <= 1`.
#[must_use]
pub fn num_stages(n: i64) -> u32 {
    if n <= 1 {
        0
    } else {
        64 - (n as u64 - 1).leading_zeros()
    }
}

/// The compare-exchange masks of a bitonic sort with `stages` stages, in
/// order: stage `s` contributes `2^(s+1) - 1`, then `2^(s-1)` down to `1`.
#[must_use]
pub fn xor_masks(stages: u32) -> Vec<i64> {
    let mut masks = Vec::new();
    for stage in 0..stages {
        masks.push((1_i64 << (stage + 1)) - 1);
        for m in (0..stage).rev() {
            masks.push(1_i64 << m);
        }
    }
    masks
}

/// Half-width of the comparison blocks of pass `mask`.
///
/// A first pass of a stage (`mask = 2^k - 1`) compares mirrored positions
/// of blocks of `mask + 1`; a later pass (`mask = 2^k`) compares positions
/// `mask` apart.
#[must_use]
pub fn comparison_block(mask: i64) -> i64 {
    if mask > 1 && mask & (mask + 1) == 0 {
        (mask + 1) / 2
    } else {
        mask
    }
}

/// How a sort of `n` elements along the sort dimension is split into
/// kernels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortPlan {
    /// Elements along the sort dimension.
    pub bound: i64,
    /// `ceil(log2(bound))`.
    pub num_stages: u32,
    /// Elements per shared-memory tile.
    pub tile_size: i64,
    /// Whether passes may be batched into shared-memory kernels.
    pub use_tiling: bool,
    /// Masks per kernel, in launch order. Batches of more than one mask
    /// run tiled.
    pub kernels: Vec<Vec<i64>>,
}

impl SortPlan {
    /// The plan for sorting `bound` elements of operands with the given
    /// element sizes on `device`.
    #[must_use]
    pub fn new(bound: i64, element_bytes: &[usize], device: &DeviceInfo) -> Self {
        let num_stages = num_stages(bound);
        let tile_size = MAX_SORT_TILE.min(1_i64 << num_stages);
        let shared_bytes: u64 = element_bytes
            .iter()
            .map(|&bytes| tile_size as u64 * bytes as u64)
            .sum();
        let use_tiling = tile_size >= MIN_TILED_SORT_TILE
            && (tile_size / 2) as u64 <= device.threads_per_block_limit
            && shared_bytes <= device.shared_memory_per_block;

        let mut kernels = Vec::new();
        let mut batch = Vec::new();
        for mask in xor_masks(num_stages) {
            if mask >= tile_size || !use_tiling {
                if !batch.is_empty() {
                    kernels.push(std::mem::take(&mut batch));
                }
                kernels.push(vec![mask]);
            } else {
                batch.push(mask);
            }
        }
        if !batch.is_empty() {
            kernels.push(batch);
        }
        Self {
            bound,
            num_stages,
            tile_size,
            use_tiling,
            kernels,
        }
    }
}

/// Reads element `position` (along the sort dimension) of operand `i`.
type ReadFn<'f> = dyn Fn(&mut Builder, usize, ValueId) -> ValueId + 'f;
/// Writes `value` to element `position` of operand `i`.
type WriteFn<'f> = dyn Fn(&mut Builder, usize, ValueId, ValueId) + 'f;

/// One compare-exchange of pass `mask` for pair `pair_index`, over
/// positions below `bound`.
#[allow(clippy::too_many_arguments)]
fn emit_compare_loop_body(
    b: &mut Builder,
    bound: i64,
    needs_bounds_check: bool,
    num_values: usize,
    pair_index: ValueId,
    mask: i64,
    comparator: FuncId,
    read: &ReadFn<'_>,
    write: &WriteFn<'_>,
) -> GpuResult<()> {
    let block = comparison_block(mask);
    let (current, compare) = if block == 1 {
        let current = b.binary_imm(BinOp::Mul, pair_index, 2);
        let compare = b.binary_imm(BinOp::Xor, current, mask);
        (current, compare)
    } else {
        let quotient = b.binary_imm(BinOp::Div, pair_index, block);
        let remainder = b.binary_imm(BinOp::Rem, pair_index, block);
        let base = b.binary_imm(BinOp::Mul, quotient, 2 * block);
        let current = b.add(base, remainder);
        let compare = b.binary_imm(BinOp::Xor, current, mask);
        (current, compare)
    };

    let mut condition = b.cmp(CmpOp::Lt, current, compare);
    if needs_bounds_check {
        let in_bounds = b.cmp_imm(CmpOp::Lt, compare, bound);
        condition = b.and(condition, in_bounds);
    }
    b.if_then(condition, |b| -> GpuResult<()> {
        let mut args = Vec::with_capacity(2 * num_values);
        for i in 0..num_values {
            args.push(read(b, i, compare));
            args.push(read(b, i, current));
        }
        let swap = b
            .call(comparator, &args, &[ScalarType::Pred])
            .first()
            .copied()
            .ok_or_else(|| GpuError::Internal("sort comparator returns nothing".to_string()))?;
        b.if_then(swap, |b| {
            for i in 0..num_values {
                write(b, i, current, args[2 * i]);
                write(b, i, compare, args[2 * i + 1]);
            }
            Ok(())
        })
    })
}

/// Static description of one sort instruction.
struct SortKernels<'a> {
    instr: InstrId,
    dimension: usize,
    keys_shape: &'a ArrayShape,
    /// Iteration dimension `k` covers logical dimension `iteration_to_logical[k]`.
    iteration_to_logical: SmallVec<[usize; 4]>,
    element_types: Vec<ScalarType>,
    comparator: FuncId,
    plan: SortPlan,
}

impl SortKernels<'_> {
    fn iteration_shape(&self, pairs: i64) -> ArrayShape {
        let dims: SmallVec<[i64; 4]> = self
            .iteration_to_logical
            .iter()
            .map(|&dim| if dim == self.dimension { pairs } else { self.keys_shape.dim(dim) })
            .collect();
        ArrayShape::new(PrimitiveType::Pred, &dims)
    }

    fn keys_coords(&self, iteration: &IrIndex) -> SmallVec<[ValueId; 4]> {
        let mut coords: SmallVec<[ValueId; 4]> = SmallVec::from_elem(iteration.get(0), self.keys_shape.rank());
        for (k, &dim) in self.iteration_to_logical.iter().enumerate() {
            coords[dim] = iteration.get(k);
        }
        coords
    }

    /// Emit one kernel running the passes in `masks`.
    fn emit_kernel(&self, mcx: &mut ModuleContext<'_>, masks: &[i64], last: bool) -> GpuResult<Thunk> {
        let hlo = mcx.hlo;
        let unnested = hlo.instr(self.instr);
        let tiled = masks.len() > 1;
        let bound = self.plan.bound;
        let tile = self.plan.tile_size;
        let (pairs, launch) = if tiled {
            let pairs = round_up_to(bound, tile) / 2;
            let iterations = self.iteration_shape(pairs).num_elements();
            let threads = tile / 2;
            let launch = LaunchDimensions::new(ceil_of_ratio(iterations, threads) as u64, threads as u64);
            (pairs, launch)
        } else {
            let pairs = 1_i64 << (self.plan.num_stages - 1);
            let iterations = self.iteration_shape(pairs).num_elements();
            (pairs, calculate_launch_dimensions(iterations, mcx.device, 1, false))
        };
        let shape = self.iteration_shape(pairs);
        let geometry = LoopGeometry {
            launch,
            unroll_factor: 1,
            index_type: index_type_for_kernel(hlo, unnested, launch.launch_bound()),
            few_waves: false,
        };
        debug!(
            instruction = unnested.name(),
            masks = ?masks,
            tiled,
            %launch,
            "sort kernel"
        );

        let mut kcx = build_kernel_prototype(mcx, self.instr)?;
        let arrays: Vec<IrArray> = kcx.output_arrays(hlo, self.instr)?;
        if last {
            emit_tuple_pointer_table(&mut kcx, hlo, self.instr)?;
        }
        let tiles: Vec<SharedId> = if tiled {
            self.element_types
                .iter()
                .enumerate()
                .map(|(i, &ty)| {
                    kcx.builder
                        .alloc_shared(format!("sort_tile_param_{i}"), ty, tile.max(64) as u64)
                })
                .collect()
        } else {
            Vec::new()
        };

        let num_values = arrays.len();
        let dimension = self.dimension;
        let comparator = self.comparator;
        let element_types = &self.element_types;
        let mut body = |_: &mut ModuleContext<'_>, b: &mut Builder, iteration: &IrIndex| -> GpuResult<()> {
            let coords = self.keys_coords(iteration);
            let index_type = iteration.index_type();
            let pair = iteration.get(iteration.rank() - 1);
            let global_index = |position: ValueId, i: usize| {
                let mut at = coords.clone();
                at[dimension] = position;
                IrIndex::new(at, arrays[i].shape(), index_type)
            };
            if !tiled {
                let read = |b: &mut Builder, i: usize, position: ValueId| arrays[i].emit_read(b, &global_index(position, i));
                let write = |b: &mut Builder, i: usize, position: ValueId, value: ValueId| {
                    arrays[i].emit_write(b, &global_index(position, i), value);
                };
                return emit_compare_loop_body(b, bound, true, num_values, pair, masks[0], comparator, &read, &write);
            }

            let shared_slot = |b: &mut Builder, i: usize, position: ValueId| {
                let base = b.shared_addr(tiles[i]);
                b.element_addr(base, position, element_types[i].byte_size())
            };
            let raw_thread = b.special(SpecialReg::ThreadIdX);
            let thread = b.cast(raw_thread, index_type);
            let first = b.binary_imm(BinOp::Mul, pair, 2);
            let cache_first = b.binary_imm(BinOp::Mul, thread, 2);

            let copy_element = |b: &mut Builder, i: usize, position: ValueId, cache: ValueId, to_shared: bool| {
                let slot = shared_slot(b, i, cache);
                let index = global_index(position, i);
                if to_shared {
                    let value = arrays[i].emit_read(b, &index);
                    b.store(AddressSpace::Shared, slot, value);
                } else {
                    let value = b.load(AddressSpace::Shared, element_types[i], slot);
                    arrays[i].emit_write(b, &index, value);
                }
            };

            // Two adjacent elements per thread, each bounds-checked.
            let copy_pair = |b: &mut Builder, to_shared: bool| -> GpuResult<()> {
                for i in 0..num_values {
                    let in_bounds = b.cmp_imm(CmpOp::Lt, first, bound);
                    b.if_then(in_bounds, |b| {
                        copy_element(b, i, first, cache_first, to_shared);
                        let second = b.binary_imm(BinOp::Add, first, 1);
                        let second_in_bounds = b.cmp_imm(CmpOp::Lt, second, bound);
                        b.if_then(second_in_bounds, |b| {
                            let cache_second = b.binary_imm(BinOp::Add, cache_first, 1);
                            copy_element(b, i, second, cache_second, to_shared);
                            Ok::<_, GpuError>(())
                        })
                    })?;
                }
                Ok(())
            };
            copy_pair(b, true)?;
            b.barrier();

            let read = |b: &mut Builder, i: usize, position: ValueId| {
                let slot = shared_slot(b, i, position);
                b.load(AddressSpace::Shared, element_types[i], slot)
            };
            let write = |b: &mut Builder, i: usize, position: ValueId, value: ValueId| {
                let slot = shared_slot(b, i, position);
                b.store(AddressSpace::Shared, slot, value);
            };
            let last_tile_size = bound % tile;
            for &mask in masks {
                if last_tile_size == 0 {
                    emit_compare_loop_body(b, tile, false, num_values, thread, mask, comparator, &read, &write)?;
                } else {
                    let is_last_tile = b.cmp_imm(CmpOp::Ge, first, bound - last_tile_size);
                    b.if_then_else(
                        is_last_tile,
                        |b| emit_compare_loop_body(b, last_tile_size, true, num_values, thread, mask, comparator, &read, &write),
                        |b| emit_compare_loop_body(b, tile, false, num_values, thread, mask, comparator, &read, &write),
                    )?;
                }
                b.barrier();
            }

            copy_pair(b, false)
        };
        emit_parallel_loop(mcx, &mut kcx.builder, &shape, &geometry, &mut body)?;
        Ok(kcx.into_thunk(mcx, ThunkInfo::new(unnested.name(), None), launch))
    }
}

/// Emit `instr`, a sort, as copies of operands into their outputs
/// followed by the compare-exchange kernels.
pub fn emit_sort(mcx: &mut ModuleContext<'_>, instr: InstrId) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let sort = hlo.instr(instr);
    let Opcode::Sort {
        dimension,
        comparator,
        ..
    } = sort.opcode()
    else {
        return Err(GpuError::Internal(format!("{} is not a sort", sort.name())));
    };
    let keys_shape = hlo.instr(sort.operand(0)).shape().array_shape()?;
    let multi = sort.operands().len() > 1;

    let mut thunks = Vec::new();
    let mut element_types = Vec::with_capacity(sort.operands().len());
    for (i, &operand) in sort.operands().iter().enumerate() {
        let operand_shape = hlo.instr(operand).shape().array_shape()?;
        if operand_shape.layout() != keys_shape.layout() {
            return Err(GpuError::Internal(format!(
                "operand {i} of {} has a different layout than the keys",
                sort.name()
            )));
        }
        element_types.push(ScalarType::from(operand_shape.element_type()));
        let index: &[usize] = if multi { &[i] } else { &[] };
        let source = mcx.slice(operand, &[])?;
        let destination = mcx.slice(instr, index)?;
        if source != destination {
            debug!(instruction = sort.name(), operand = i, "sort copies its operand first");
            thunks.push(Thunk::Copy {
                info: ThunkInfo::new(sort.name(), None),
                source,
                destination,
            });
        }
    }

    let bound = keys_shape.dim(*dimension);
    let element_bytes: Vec<usize> = element_types.iter().map(|ty| ty.byte_size()).collect();
    let plan = SortPlan::new(bound, &element_bytes, mcx.device);
    debug!(
        instruction = sort.name(),
        stages = plan.num_stages,
        tile = plan.tile_size,
        tiled = plan.use_tiling,
        kernels = plan.kernels.len(),
        "sort plan"
    );

    let mut iteration_to_logical: SmallVec<[usize; 4]> = keys_shape
        .layout()
        .major_to_minor()
        .into_iter()
        .filter(|&dim| dim != *dimension)
        .collect();
    iteration_to_logical.push(*dimension);
    let kernels = SortKernels {
        instr,
        dimension: *dimension,
        keys_shape,
        iteration_to_logical,
        element_types,
        comparator: mcx.function_for(*comparator)?,
        plan,
    };

    let count = kernels.plan.kernels.len();
    for (k, masks) in kernels.plan.kernels.iter().enumerate() {
        thunks.push(kernels.emit_kernel(mcx, masks, k + 1 == count)?);
    }
    if count == 0 && multi {
        let elements = (0..sort.operands().len())
            .map(|i| mcx.slice(instr, &[i]))
            .collect::<GpuResult<Vec<_>>>()?;
        thunks.push(Thunk::Tuple {
            info: ThunkInfo::new(sort.name(), None),
            elements,
            destination: mcx.slice(instr, &[])?,
        });
    }

    let info = mcx.thunk_info(instr);
    Ok(match thunks.len() {
        1 => thunks.remove(0),
        _ => Thunk::Sequential { info, thunks },
    })
}
