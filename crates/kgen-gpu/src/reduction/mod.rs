//! Reductions from or to contiguous dimensions.
//!
//! A reduce whose kept (or reduced) dimensions are physically consecutive
//! is normalized to a 3-D `[z, y, x]` problem. In a *row* reduction `x`
//! is reduced (and `z` too); in a *column* reduction `y` is reduced. Each
//! block reduces one tile into per-thread partial results, combines them
//! through warp shuffles and shared memory, and folds the block's result
//! into the output with an atomic.
//!
//! This module holds the analysis; [`codegen`] emits the kernel.

pub mod codegen;

pub use codegen::emit_reduction;

use crate::context::ModuleContext;
use crate::launch::may_prevent_vectorization;
use crate::tile_emitter::WARP_SIZE;
use crate::tiling::{ceil_of_ratio, round_up_to, IndexingOrder, KernelMappingScheme, DIM_X, DIM_Y, DIM_Z};
use crate::{GpuError, GpuResult};
use indexmap::IndexMap;
use kgen_hlo::{ArrayShape, HloInstruction, HloModule, InstrId, Opcode, ReachabilityMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Max z extent of a row reduction tile.
const MAX_TILE_Z: i64 = 8;

/// Tile height of a column reduction.
const COLUMN_TILE_Y: i64 = 128;

/// Smallest block a row reduction uses, whatever the fan out.
const MIN_ROW_BLOCK_SIZE: i64 = 64;

/// A reduce normalized to three dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionDimensions {
    /// `x` (and `z`) are reduced when true, `y` otherwise.
    pub is_row_reduction: bool,
    /// `[z, y, x]` element counts.
    pub dimensions: [i64; 3],
}

impl ReductionDimensions {
    fn row(dimensions: [i64; 3]) -> Self {
        Self {
            is_row_reduction: true,
            dimensions,
        }
    }

    fn column(dimensions: [i64; 3]) -> Self {
        Self {
            is_row_reduction: false,
            dimensions,
        }
    }
}

fn kept_dimensions(rank: usize, reduced: &[usize]) -> Vec<usize> {
    (0..rank).filter(|d| !reduced.contains(d)).collect()
}

/// Classify a reduction of `input` over `reduced`.
#[must_use]
pub fn reduction_kind_and_contiguous_components(input: &ArrayShape, reduced: &[usize]) -> ReductionDimensions {
    let kept = kept_dimensions(input.rank(), reduced);
    if kept.is_empty() {
        return ReductionDimensions::row([1, 1, input.num_elements()]);
    }

    if input.layout().are_dimensions_consecutive(&kept) {
        let [major, kept, minor] = input.partition_by_middle_dimensions(&kept);
        if kept == 1 {
            return ReductionDimensions::row([1, 1, major * minor]);
        }
        if minor == 1 {
            return ReductionDimensions::column([1, major, kept]);
        }
        return ReductionDimensions::row([major, kept, minor]);
    }

    let [major, reduced, minor] = input.partition_by_middle_dimensions(reduced);
    if minor == 1 {
        return ReductionDimensions::row([1, major, reduced]);
    }
    ReductionDimensions::column([major, reduced, minor])
}

/// Returns true if `instr` is a reduce the tiled reduction kernel handles.
#[must_use]
pub fn is_reduction_from_or_to_contiguous_dimensions(module: &HloModule, instr: &HloInstruction) -> bool {
    let Opcode::Reduce { dimensions, .. } = instr.opcode() else {
        return false;
    };
    let Some(input) = module.operand(instr.id(), 0).shape().as_array() else {
        return false;
    };
    let kept = kept_dimensions(input.rank(), dimensions);
    let layout = input.layout();
    if !layout.are_dimensions_consecutive(&kept) && !layout.are_dimensions_consecutive(dimensions) {
        return false;
    }
    let reduction = reduction_kind_and_contiguous_components(input, dimensions);
    if reduction.is_row_reduction {
        reduction.dimensions[DIM_X] >= WARP_SIZE
    } else {
        reduction.dimensions[DIM_Y] >= WARP_SIZE
    }
}

/// The shape of the kept dimensions of `input`, in their original order
/// and physical layout.
#[must_use]
pub fn kept_element_shape(input: &ArrayShape, reduced: &[usize]) -> ArrayShape {
    let kept = kept_dimensions(input.rank(), reduced);
    let dims: Vec<i64> = kept.iter().map(|&d| input.dim(d)).collect();
    let minor_to_major: Vec<usize> = input
        .layout()
        .minor_to_major()
        .iter()
        .filter_map(|d| kept.iter().position(|k| k == d))
        .collect();
    ArrayShape::with_layout(input.element_type(), &dims, &minor_to_major)
}

/// The power of two closest to `v`, rounding ties down. Zero for negative
/// `v`.
#[must_use]
pub fn nearest_power_of_two(v: i64) -> i64 {
    if v < 0 {
        return 0;
    }
    let upper = (v.max(1) as u64).next_power_of_two() as i64;
    let lower = upper >> 1;
    if upper - v < v - lower {
        upper
    } else {
        lower
    }
}

/// Per-thread tile of a reduction, before scaling by the thread counts.
#[must_use]
pub fn reduction_tiling(reduction: &ReductionDimensions, smallest_input_bits: u32, cc_major: u32) -> [i64; 3] {
    let [z, y, x] = reduction.dimensions;
    if !reduction.is_row_reduction {
        return [1, COLUMN_TILE_Y, 1];
    }
    let tile_z = z.min(MAX_TILE_Z);
    if y == 1 {
        return [tile_z, 1, 16];
    }
    if x % (WARP_SIZE * WARP_SIZE * 64) == 0 {
        return [tile_z, 1, 64];
    }
    let unroll_x = match smallest_input_bits {
        16 if cc_major >= 6 => 16,
        8 if cc_major >= 6 => 64,
        _ => 8,
    };
    [tile_z, 1, unroll_x]
}

/// How a reduction kernel tiles its input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReductionCodegenInfo {
    /// Tiling of the normalized input.
    pub scheme: KernelMappingScheme,
    /// Partial results each thread keeps; two for unrolled column
    /// reductions.
    pub num_partial_results: i64,
    /// Row or column.
    pub is_row_reduction: bool,
}

fn smallest_input_bits(module: &HloModule, unnested: &HloInstruction, input: &ArrayShape) -> u32 {
    unnested
        .operands()
        .iter()
        .filter_map(|&operand| module.instr(operand).shape().as_array())
        .map(|shape| shape.element_type().bit_width())
        .fold(input.element_type().bit_width(), u32::min)
}

pub(crate) fn root_outputs(module: &HloModule, unnested: &HloInstruction) -> Vec<InstrId> {
    match module.fused_root(unnested.id()) {
        Some(root) if matches!(module.instr(root).opcode(), Opcode::Tuple) => module.instr(root).operands().to_vec(),
        Some(root) => vec![root],
        None => vec![unnested.id()],
    }
}

/// Returns true if every path from `id` through its users stays
/// elementwise until it reaches one of `outputs`.
fn elementwise_until_outputs(module: &HloModule, id: InstrId, outputs: &[InstrId]) -> bool {
    module.instr(id).users().iter().all(|&user| {
        if outputs.contains(&user) {
            return true;
        }
        let instr = module.instr(user);
        instr.is_elementwise() && elementwise_until_outputs(module, user, outputs)
    })
}

/// Whether a column reduction benefits from two partial results per
/// thread: true when `x` is a power of two and at least as many accesses
/// vectorize as do not.
fn is_unrolling_column_reduction_beneficial(
    module: &HloModule,
    unnested: &HloInstruction,
    input: &ArrayShape,
    num_kept_minor: i64,
) -> bool {
    if num_kept_minor <= 0 || (num_kept_minor & (num_kept_minor - 1)) != 0 {
        return false;
    }
    if is_reduction_from_or_to_contiguous_dimensions(module, unnested) {
        return true;
    }
    let outputs = root_outputs(module, unnested);
    let mut can_be_vectorized = 0_usize;
    let mut cannot_be_vectorized = 0_usize;
    for &output in &outputs {
        if is_reduction_from_or_to_contiguous_dimensions(module, module.instr(output)) {
            cannot_be_vectorized += 1;
        } else {
            can_be_vectorized += 1;
        }
    }
    for &param in module.fused_parameters(unnested.id()) {
        let Some(shape) = module.instr(param).shape().as_array() else {
            continue;
        };
        if shape.same_dimensions(input) && elementwise_until_outputs(module, param, &outputs) {
            can_be_vectorized += 1;
        }
        if shape.num_elements() > input.num_elements() {
            cannot_be_vectorized += 1;
        }
    }
    can_be_vectorized >= cannot_be_vectorized
}

/// Pick tiles, thread counts and indexing order for the reduction of
/// `first_reduce` inside `unnested`.
pub fn compute_reduction_codegen_info(
    mcx: &ModuleContext<'_>,
    unnested: InstrId,
    first_reduce: InstrId,
) -> GpuResult<ReductionCodegenInfo> {
    let hlo = mcx.hlo;
    let unnested = hlo.instr(unnested);
    let reduce = hlo.instr(first_reduce);
    let Opcode::Reduce { dimensions, .. } = reduce.opcode() else {
        return Err(GpuError::Internal(format!("{} is not a reduce", reduce.name())));
    };
    let input = hlo.operand(first_reduce, 0).shape().array_shape()?;
    let reduction = reduction_kind_and_contiguous_components(input, dimensions);
    let [_, _, dim_x] = reduction.dimensions;

    let smallest_bits = smallest_input_bits(hlo, unnested, input);
    let cc_major = mcx.device.compute_capability.0;
    let mut tiling = reduction_tiling(&reduction, smallest_bits, cc_major);

    let (num_threads_y, num_threads_x) = if reduction.is_row_reduction {
        let fan_out = root_outputs(hlo, unnested).len() as i64;
        let max_block_size = i64::try_from(mcx.config.row_reduction_max_block_size).unwrap_or(i64::MAX);
        let max_block = MIN_ROW_BLOCK_SIZE.max(max_block_size / nearest_power_of_two(fan_out).max(1));
        let needed = round_up_to(ceil_of_ratio(dim_x, tiling[DIM_X]), WARP_SIZE);
        (1, max_block.min(needed))
    } else {
        (WARP_SIZE, WARP_SIZE)
    };

    let tile_fits = dim_x % (tiling[DIM_X] * num_threads_x) == 0;
    let mut num_partial_results = 1;
    let mut indexing_order = if reduction.is_row_reduction {
        let pascal = cc_major == 6 && smallest_bits <= 32 && tile_fits;
        let volta = mcx.device.supports_compute(7, 0) && dim_x % 2 == 0;
        if pascal || volta {
            IndexingOrder::StridedLinear
        } else {
            IndexingOrder::Strided
        }
    } else if is_unrolling_column_reduction_beneficial(hlo, unnested, input, dim_x) {
        num_partial_results = 2;
        tiling[DIM_X] *= 2;
        IndexingOrder::Linear
    } else {
        IndexingOrder::Strided
    };

    let mut vector_size = 1;
    if indexing_order == IndexingOrder::StridedLinear {
        if dim_x % 2 == 0 && !may_prevent_vectorization(hlo, unnested) {
            vector_size = 2;
        } else {
            indexing_order = IndexingOrder::Strided;
        }
    }

    let scheme = KernelMappingScheme::new(
        reduction.dimensions,
        [
            tiling[DIM_Z],
            tiling[DIM_Y] * num_threads_y,
            tiling[DIM_X] * num_threads_x,
        ],
        num_threads_y,
        num_threads_x,
        indexing_order,
        vector_size,
        false,
    );
    debug!(
        instruction = unnested.name(),
        row = reduction.is_row_reduction,
        dims = ?reduction.dimensions,
        tiles = ?[scheme.tile_size_z(), scheme.tile_size_y(), scheme.tile_size_x()],
        num_threads_x,
        ?indexing_order,
        vector_size,
        "reduction tiling"
    );
    Ok(ReductionCodegenInfo {
        scheme,
        num_partial_results,
        is_row_reduction: reduction.is_row_reduction,
    })
}

fn is_broadcasted_constant_or_scalar(module: &HloModule, instr: &HloInstruction) -> bool {
    let scalar_like = |i: &HloInstruction| {
        matches!(i.opcode(), Opcode::Constant(_)) || i.shape().as_array().is_some_and(ArrayShape::is_scalar)
    };
    match instr.opcode() {
        Opcode::Broadcast { .. } => scalar_like(module.operand(instr.id(), 0)),
        _ => scalar_like(instr),
    }
}

fn find_root(parents: &mut [usize], mut i: usize) -> usize {
    while parents[i] != i {
        parents[i] = parents[parents[i]];
        i = parents[i];
    }
    i
}

/// Partition the outputs of a multi-output reduction fusion into groups
/// that share no computation, returned as output positions.
///
/// Two outputs land in one group when some fused instruction reaches both,
/// except that scalars and broadcasted scalars never tie a reduce to
/// anything. Groups are ordered by their first output.
#[must_use]
pub fn divide_output_instructions_into_groups(module: &HloModule, unnested: InstrId) -> Vec<Vec<usize>> {
    let outputs = root_outputs(module, module.instr(unnested));
    let Some(fused) = module.instr(unnested).fused_computation() else {
        return vec![(0..outputs.len()).collect()];
    };
    let reachability = ReachabilityMap::build(module, fused);
    let mut parents: Vec<usize> = (0..outputs.len()).collect();

    for &id in module.computation(fused).instructions() {
        let instr = module.instr(id);
        let skip_reduces = is_broadcasted_constant_or_scalar(module, instr);
        let reached: Vec<usize> = outputs
            .iter()
            .enumerate()
            .filter(|&(_, &output)| reachability.is_reachable(id, output))
            .filter(|&(_, &output)| !(skip_reduces && matches!(module.instr(output).opcode(), Opcode::Reduce { .. })))
            .map(|(position, _)| position)
            .collect();
        if let Some((&first, rest)) = reached.split_first() {
            for &other in rest {
                let a = find_root(&mut parents, first);
                let b = find_root(&mut parents, other);
                if a != b {
                    parents[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut groups: IndexMap<usize, Vec<usize>> = IndexMap::new();
    for position in 0..outputs.len() {
        let root = find_root(&mut parents, position);
        groups.entry(root).or_default().push(position);
    }
    groups.into_values().collect()
}

/// Check that every output of a multi-output reduction fusion fits the
/// first reduce's tiling.
pub fn check_fused_outputs_consistent(module: &HloModule, outputs: &[InstrId], first_reduce: InstrId) -> GpuResult<()> {
    let first = module.instr(first_reduce);
    let Opcode::Reduce {
        dimensions: first_dims, ..
    } = first.opcode()
    else {
        return Err(GpuError::Internal(format!("{} is not a reduce", first.name())));
    };
    let first_input = module.operand(first_reduce, 0).shape();
    let first_init = module.operand(first_reduce, 1).shape();
    let inconsistent = || GpuError::Internal("Inconsistent reduction fusion outputs".to_string());

    for &output in outputs {
        let instr = module.instr(output);
        match instr.opcode() {
            Opcode::Reduce { dimensions, .. } if is_reduction_from_or_to_contiguous_dimensions(module, instr) => {
                let same = instr.shape() == first.shape()
                    && module.operand(output, 0).shape() == first_input
                    && module.operand(output, 1).shape() == first_init
                    && dimensions == first_dims;
                if !same {
                    return Err(inconsistent());
                }
            }
            _ => {
                let (Some(shape), Some(input)) = (instr.shape().as_array(), first_input.as_array()) else {
                    return Err(inconsistent());
                };
                if !shape.same_dimensions(input) || shape.layout() != input.layout() {
                    return Err(inconsistent());
                }
            }
        }
    }
    Ok(())
}
