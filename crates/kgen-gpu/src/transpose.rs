//! Shared-memory tiled 0-2-1 transposes.
//!
//! When an operand of a copy or a loop fusion is a 0-2-1 transpose of the
//! output in physical memory, reading it element by element in output order
//! is uncoalesced. Instead each block stages a `32 × 32` tile of the operand
//! in shared memory with coalesced reads, waits at a barrier, and then
//! writes the output tile reading the staged operand transposed.

use crate::context::ModuleContext;
use crate::elemental::Elemental;
use crate::ir_array::{IrArray, IrIndex};
use crate::launch::{index_type_for_kernel, LaunchDimensions};
use crate::loop_emitter::emit_tuple_pointer_table;
use crate::prototype::build_kernel_prototype;
use crate::thunk::Thunk;
use crate::tile_emitter::{emit_tile, emit_tiling_kernel, unnormalized_index, ThreadIdInfo, WARP_SIZE};
use crate::tiling::{IndexingOrder, KernelMappingScheme, DIM_X, DIM_Y, DIM_Z};
use crate::GpuResult;
use kgen_hlo::{find_transpose_021, ArrayShape, HloModule, InstrId, Opcode};
use kgen_kir::{AddressSpace, BinOp, Builder, ScalarType, SharedId, ValueId};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// Smallest normalized minor extent worth tiling.
pub const MIN_DIMENSION_TO_TRANSPOSE_TILED: i64 = 16;

/// Rows of threads per block.
const NUM_ROWS: i64 = 4;

/// Shared memory one core is assumed to have.
const SHMEM_PER_CORE: i64 = 48 * 1024;

/// Blocks that should fit on one core at once.
const MIN_BLOCKS_PER_CORE: i64 = 3;

/// Elements per staged tile, padded by one column against bank conflicts.
const TILE_ELEMENTS: i64 = WARP_SIZE * (WARP_SIZE + 1);

/// Memoized check that every transitive user of a fused instruction reads
/// only the element at its own output index.
///
/// Staging a tile is only sound when computing an output tile needs no
/// operand element outside the matching operand tile.
#[derive(Debug)]
pub struct ShmemTransposeSafety<'a> {
    module: &'a HloModule,
    root: InstrId,
    cache: FxHashMap<InstrId, bool>,
}

impl<'a> ShmemTransposeSafety<'a> {
    /// A checker for the fused computation of `fusion`.
    #[must_use]
    pub fn new(module: &'a HloModule, fusion: InstrId) -> Self {
        Self {
            module,
            root: module.fused_root(fusion).unwrap_or(fusion),
            cache: FxHashMap::default(),
        }
    }

    /// Returns true if a shared-memory transpose may stage `instr`.
    pub fn is_safe(&mut self, instr: InstrId) -> bool {
        if let Some(&safe) = self.cache.get(&instr) {
            return safe;
        }
        let safe = self.compute(instr);
        self.cache.insert(instr, safe);
        safe
    }

    fn compute(&mut self, instr: InstrId) -> bool {
        if instr == self.root {
            return true;
        }
        let hlo = self.module.instr(instr);
        let users_safe = |this: &mut Self| {
            let users = this.module.instr(instr).users().to_vec();
            users.into_iter().all(|user| this.is_safe(user))
        };
        if hlo.is_elementwise() {
            return users_safe(self);
        }
        match hlo.opcode() {
            Opcode::GetDimensionSize { .. } => true,
            Opcode::GetTupleElement { .. }
            | Opcode::Map { .. }
            | Opcode::Parameter { .. }
            | Opcode::Tuple
            | Opcode::TupleSelect => users_safe(self),
            _ => false,
        }
    }
}

/// The staged operands and the normalized output of a 0-2-1 transpose.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transpose021 {
    /// Normalized `[z, y, x]` extents of the output.
    pub output_dims: [i64; 3],
    /// Positions of the operands (fused parameters) staged in shared memory.
    pub tiled_params: Vec<usize>,
}

/// The instructions a transpose kernel reads: the operand of a copy or the
/// fused parameters of a fusion.
fn transpose_inputs(module: &HloModule, instr: InstrId) -> Vec<InstrId> {
    let hlo = module.instr(instr);
    if hlo.fused_computation().is_some() {
        module.fused_parameters(instr).to_vec()
    } else {
        hlo.operands().to_vec()
    }
}

/// Decide whether `instr` (a copy or loop fusion) should use the tiled
/// transpose, and which operands to stage.
#[must_use]
pub fn analyze_transpose_021(module: &HloModule, instr: InstrId) -> Option<Transpose021> {
    let hlo = module.instr(instr);
    if module.is_multi_output_fusion(instr) {
        return None;
    }
    let output = hlo.shape().as_array()?;
    let inputs = transpose_inputs(module, instr);

    let mut output_dims: Option<[i64; 3]> = None;
    let mut tiled_params = Vec::new();
    for (position, &input) in inputs.iter().enumerate() {
        let Some(shape) = module.instr(input).shape().as_array() else {
            continue;
        };
        let Some(dims) = find_transpose_021(shape, output) else {
            continue;
        };
        match output_dims {
            None => output_dims = Some(dims),
            Some(existing) if existing != dims => return None,
            Some(_) => {}
        }
        tiled_params.push(position);
    }
    let output_dims = output_dims?;
    if output_dims[DIM_Y] < MIN_DIMENSION_TO_TRANSPOSE_TILED || output_dims[DIM_X] < MIN_DIMENSION_TO_TRANSPOSE_TILED {
        return None;
    }

    if hlo.fused_computation().is_some() {
        let mut safety = ShmemTransposeSafety::new(module, instr);
        tiled_params.retain(|&position| safety.is_safe(inputs[position]));
    }

    let mut shmem_used = 0;
    for (i, &position) in tiled_params.iter().enumerate() {
        let bytes = module
            .instr(inputs[position])
            .shape()
            .as_array()
            .map_or(0, |shape| shape.element_type().byte_size() as i64);
        shmem_used += TILE_ELEMENTS * bytes;
        if MIN_BLOCKS_PER_CORE * shmem_used > SHMEM_PER_CORE {
            warn!(
                instruction = hlo.name(),
                kept = i,
                dropped = tiled_params.len() - i,
                "shared memory budget exceeded, staging fewer operands"
            );
            tiled_params.truncate(i);
            break;
        }
    }
    if tiled_params.is_empty() {
        return None;
    }
    debug!(
        instruction = hlo.name(),
        dims = ?output_dims,
        tiled = ?tiled_params,
        "tiled 0-2-1 transpose"
    );
    Some(Transpose021 {
        output_dims,
        tiled_params,
    })
}

/// The tiling every transpose kernel uses.
#[must_use]
pub fn transpose_mapping_scheme(output_dims: [i64; 3]) -> KernelMappingScheme {
    KernelMappingScheme::new(
        output_dims,
        [1, WARP_SIZE, WARP_SIZE],
        NUM_ROWS,
        WARP_SIZE,
        IndexingOrder::Linear,
        1,
        false,
    )
}

struct StagedParam {
    param: InstrId,
    tile: SharedId,
    ty: ScalarType,
    /// The operand viewed in the normalized, transposed shape.
    normalized: IrArray,
}

fn tile_slot(b: &mut Builder, tile: SharedId, ty: ScalarType, row: ValueId, column: ValueId) -> ValueId {
    let offset = b.binary_imm(BinOp::Mul, row, WARP_SIZE + 1);
    let index = b.add(offset, column);
    let base = b.shared_addr(tile);
    b.element_addr(base, index, ty.byte_size())
}

/// Emit `instr` as a tiled transpose if [`analyze_transpose_021`] accepts
/// it; `None` otherwise.
pub fn check_and_emit_021_transpose(mcx: &mut ModuleContext<'_>, instr: InstrId) -> GpuResult<Option<Thunk>> {
    if !mcx.config.enable_tiled_transpose {
        return Ok(None);
    }
    let hlo = mcx.hlo;
    let Some(plan) = analyze_transpose_021(hlo, instr) else {
        return Ok(None);
    };
    emit_transpose_021(mcx, instr, &plan).map(Some)
}

/// Emit the tiled transpose kernel for `instr` following `plan`.
pub fn emit_transpose_021(mcx: &mut ModuleContext<'_>, instr: InstrId, plan: &Transpose021) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let unnested = hlo.instr(instr);
    let is_fusion = unnested.fused_computation().is_some();
    let scheme = transpose_mapping_scheme(plan.output_dims);
    let launch = LaunchDimensions::new(
        scheme.number_of_blocks() as u64,
        scheme.threads_per_block() as u64,
    );
    let index_type = index_type_for_kernel(hlo, unnested, launch.launch_bound());

    let mut kcx = build_kernel_prototype(mcx, instr)?;
    emit_tuple_pointer_table(&mut kcx, hlo, instr)?;
    let output = kcx.array_for(hlo, instr, &[])?;
    let inputs = transpose_inputs(hlo, instr);
    let [z, y, x] = plan.output_dims;

    let mut staged = Vec::with_capacity(plan.tiled_params.len());
    for &position in &plan.tiled_params {
        let operand = unnested.operand(position);
        let array = kcx.array_for(hlo, operand, &[])?;
        let element_type = array.element_type();
        let ty = ScalarType::from(element_type);
        let tile = kcx
            .builder
            .alloc_shared(format!("tile{position}"), ty, TILE_ELEMENTS as u64);
        staged.push(StagedParam {
            param: inputs[position],
            tile,
            ty,
            normalized: array.cast_to_shape(ArrayShape::new(element_type, &[z, x, y])),
        });
    }

    let mut elemental = Elemental::new();
    if is_fusion {
        kcx.bind_inputs(hlo, instr, &mut elemental)?;
    }
    let root = hlo.fused_root(instr).unwrap_or(instr);
    let normalized_output = output.cast_to_shape(ArrayShape::new(output.element_type(), &plan.output_dims));
    let input_tile_shape = ArrayShape::new(output.element_type(), &[z, x, y]);

    let mut copy_in = |_: &mut ModuleContext<'_>,
                       b: &mut Builder,
                       index: &IrIndex,
                       y_loc: ValueId,
                       x_loc: ValueId,
                       _: i64|
     -> GpuResult<()> {
        for param in &staged {
            let value = param.normalized.emit_read(b, index);
            let addr = tile_slot(b, param.tile, param.ty, y_loc, x_loc);
            b.store(AddressSpace::Shared, addr, value);
        }
        Ok(())
    };

    let mut write_out = |mcx: &mut ModuleContext<'_>,
                         b: &mut Builder,
                         index: &IrIndex,
                         y_loc: ValueId,
                         x_loc: ValueId,
                         _: i64|
     -> GpuResult<()> {
        if !is_fusion {
            let param = &staged[0];
            let addr = tile_slot(b, param.tile, param.ty, x_loc, y_loc);
            let value = b.load(AddressSpace::Shared, param.ty, addr);
            normalized_output.emit_write(b, index, value);
            return Ok(());
        }
        for param in &staged {
            let addr = tile_slot(b, param.tile, param.ty, x_loc, y_loc);
            let value = b.load(AddressSpace::Shared, param.ty, addr);
            elemental.bind_value(param.param, value);
        }
        let output_index = unnormalized_index(b, index, output.shape(), &scheme);
        let value = elemental.generate(mcx, b, root, &output_index)?;
        output.emit_write(b, &output_index, value);
        Ok(())
    };

    let mut tile_fn = |mcx: &mut ModuleContext<'_>,
                       b: &mut Builder,
                       thread: &ThreadIdInfo,
                       origin: &IrIndex,
                       bounds: [ValueId; 3]|
     -> GpuResult<()> {
        let input_origin = IrIndex::new(
            [origin.get(DIM_Z), origin.get(DIM_X), origin.get(DIM_Y)],
            &input_tile_shape,
            origin.index_type(),
        );
        emit_tile(mcx, b, &scheme, &input_origin, thread, bounds[DIM_X], bounds[DIM_Y], &mut copy_in)?;
        b.barrier();
        emit_tile(mcx, b, &scheme, origin, thread, bounds[DIM_Y], bounds[DIM_X], &mut write_out)?;
        if scheme.tile_size_z() > 1 {
            b.barrier();
        }
        Ok(())
    };
    emit_tiling_kernel(mcx, &mut kcx.builder, &scheme, index_type, &mut tile_fn)?;

    let info = mcx.thunk_info(instr);
    Ok(kcx.into_thunk(mcx, info, launch))
}
