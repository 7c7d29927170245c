//! Tile iteration shared by the reduction and transpose kernels.
//!
//! [`emit_tiling_kernel`] maps the block id to a tile of the normalized
//! `[z, y, x]` space and calls back once per z slice of that tile.
//! [`emit_tile`] then walks the elements of one slice owned by the current
//! thread, in the order the [`KernelMappingScheme`] prescribes.

use crate::context::ModuleContext;
use crate::ir_array::IrIndex;
use crate::tiling::{IndexingOrder, KernelMappingScheme, DIM_X, DIM_Y, DIM_Z};
use crate::GpuResult;
use kgen_hlo::{ArrayShape, PrimitiveType};
use kgen_kir::{BinOp, Builder, CmpOp, ScalarType, SpecialReg, ValueId};

/// Warp width assumed by every tiled kernel.
pub const WARP_SIZE: i64 = 32;

/// Where the current thread sits in its block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadIdInfo {
    /// Linear thread id in the block.
    pub thread_id: ValueId,
    /// `thread_id % num_threads_x`.
    pub thread_id_x: ValueId,
    /// `thread_id / num_threads_x`.
    pub thread_id_y: ValueId,
    /// `thread_id % 32`.
    pub lane_id: ValueId,
}

/// What [`emit_tiling_kernel`] computed for the current block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TilingKernelInfo {
    /// Extent of this block's tile per dimension; smaller than the tile
    /// size only for the last tile of a dimension.
    pub output_tile_bounds: [ValueId; 3],
    /// First element of the tile.
    pub tile_origin: IrIndex,
    /// Thread coordinates.
    pub thread: ThreadIdInfo,
}

/// Emits the code for one element of a tile.
///
/// Arguments are the element's index in the normalized shape, its
/// tile-relative `y` and `x` positions, and the x iteration number.
pub type TileElementFn<'f, 'm> =
    dyn FnMut(&mut ModuleContext<'m>, &mut Builder, &IrIndex, ValueId, ValueId, i64) -> GpuResult<()> + 'f;

/// Emits the code for one z slice of the block's tile, given the thread
/// coordinates, the slice origin and the tile bounds.
pub type TileFn<'f, 'm> =
    dyn FnMut(&mut ModuleContext<'m>, &mut Builder, &ThreadIdInfo, &IrIndex, [ValueId; 3]) -> GpuResult<()> + 'f;

/// Thread coordinates under `scheme`.
pub fn emit_thread_id_info(b: &mut Builder, scheme: &KernelMappingScheme, ty: ScalarType) -> ThreadIdInfo {
    let raw = b.special(SpecialReg::ThreadIdX);
    let thread_id = b.cast(raw, ty);
    let thread_id_x = b.binary_imm(BinOp::Rem, thread_id, scheme.num_threads_x());
    let thread_id_y = b.binary_imm(BinOp::Div, thread_id, scheme.num_threads_x());
    let lane_id = b.binary_imm(BinOp::Rem, thread_id, WARP_SIZE);
    ThreadIdInfo {
        thread_id,
        thread_id_x,
        thread_id_y,
        lane_id,
    }
}

/// The normalized shape `scheme` iterates, as a descending-layout array.
#[must_use]
pub fn normalized_shape(scheme: &KernelMappingScheme) -> ArrayShape {
    ArrayShape::new(PrimitiveType::Pred, &scheme.dims_in_elems())
}

/// Map `normalized`, an index of the normalized shape, to the same element
/// of `shape`.
pub fn unnormalized_index(
    b: &mut Builder,
    normalized: &IrIndex,
    shape: &ArrayShape,
    scheme: &KernelMappingScheme,
) -> IrIndex {
    let dims = scheme.dims_in_elems();
    let plain_2d = shape.rank() == 2
        && shape.dims() == [dims[DIM_Y], dims[DIM_X]]
        && shape.layout().minor_to_major() == [1, 0];
    if plain_2d {
        return IrIndex::new(
            [normalized.get(DIM_Y), normalized.get(DIM_X)],
            shape,
            normalized.index_type(),
        );
    }
    let linear = normalized.linearize(b, normalized.shape());
    IrIndex::from_linear(b, linear, shape)
}

/// First x offset of the thread within a tile row.
pub fn emit_start_offset_x(b: &mut Builder, scheme: &KernelMappingScheme, thread_id_x: ValueId) -> ValueId {
    match scheme.indexing_order() {
        IndexingOrder::Strided => thread_id_x,
        IndexingOrder::StridedLinear => b.binary_imm(BinOp::Mul, thread_id_x, scheme.vector_size()),
        IndexingOrder::Linear => b.binary_imm(BinOp::Mul, thread_id_x, scheme.x_num_steps()),
    }
}

/// Map the block id to a tile and run `tile_fn` once per z slice.
pub fn emit_tiling_kernel<'m>(
    mcx: &mut ModuleContext<'m>,
    b: &mut Builder,
    scheme: &KernelMappingScheme,
    index_type: ScalarType,
    tile_fn: &mut TileFn<'_, 'm>,
) -> GpuResult<TilingKernelInfo> {
    let dims_in_elems = scheme.dims_in_elems();
    let dims_in_blocks = scheme.dims_in_blocks();
    let thread = emit_thread_id_info(b, scheme, index_type);

    let raw_block = b.special(SpecialReg::BlockIdX);
    let block_id = b.cast(raw_block, index_type);
    let blocks_shape = ArrayShape::new(PrimitiveType::Pred, &dims_in_blocks);
    let block = IrIndex::from_linear(b, block_id, &blocks_shape);

    let mut bounds = [block.get(DIM_Z); 3];
    bounds[DIM_Z] = b.int(index_type, scheme.tile_size_z());
    for dim in [DIM_Y, DIM_X] {
        let tile = scheme.tile_size_for(dim);
        let is_last = b.cmp_imm(CmpOp::Eq, block.get(dim), dims_in_blocks[dim] - 1);
        let partial = b.int(index_type, dims_in_elems[dim] - (dims_in_blocks[dim] - 1) * tile);
        let full = b.int(index_type, tile);
        bounds[dim] = b.select(is_last, partial, full);
    }

    let shape = normalized_shape(scheme);
    let origin_z = b.binary_imm(BinOp::Mul, block.get(DIM_Z), scheme.tile_size_z());
    let origin_y = b.binary_imm(BinOp::Mul, block.get(DIM_Y), scheme.tile_size_y());
    let origin_x = b.binary_imm(BinOp::Mul, block.get(DIM_X), scheme.tile_size_x());
    let tile_origin = IrIndex::new([origin_z, origin_y, origin_x], &shape, index_type);

    if scheme.tile_size_z() == 1 {
        tile_fn(mcx, b, &thread, &tile_origin, bounds)?;
    } else {
        let is_last = b.cmp_imm(CmpOp::Eq, block.get(DIM_Z), dims_in_blocks[DIM_Z] - 1);
        let partial = b.int(
            index_type,
            dims_in_elems[DIM_Z] - (dims_in_blocks[DIM_Z] - 1) * scheme.tile_size_z(),
        );
        let full = b.int(index_type, scheme.tile_size_z());
        let num_tiles = b.select(is_last, partial, full);
        let start = b.int(index_type, 0);
        let step = b.int(index_type, 1);
        b.for_loop(start, num_tiles, step, |b, z| {
            let slice_origin = tile_origin.add_offset_to_dim(b, z, DIM_Z);
            tile_fn(mcx, b, &thread, &slice_origin, bounds)
        })?;
    }

    Ok(TilingKernelInfo {
        output_tile_bounds: bounds,
        tile_origin,
        thread,
    })
}

/// Walk the thread's elements of the tile at `tile_origin`, bounded by
/// `tile_height × tile_width`.
pub fn emit_tile<'m>(
    mcx: &mut ModuleContext<'m>,
    b: &mut Builder,
    scheme: &KernelMappingScheme,
    tile_origin: &IrIndex,
    thread: &ThreadIdInfo,
    tile_height: ValueId,
    tile_width: ValueId,
    emit_elem: &mut TileElementFn<'_, 'm>,
) -> GpuResult<()> {
    let ty = b.value_type(tile_width);
    let start_x = emit_start_offset_x(b, scheme, thread.thread_id_x);
    let source = tile_origin.add_offset_to_dim(b, start_x, DIM_X);
    let num_threads_y = scheme.num_threads_y();

    let remaining = b.sub(tile_height, thread.thread_id_y);
    let rounded = b.binary_imm(BinOp::Add, remaining, num_threads_y - 1);
    let y_steps = b.binary_imm(BinOp::Div, rounded, num_threads_y);
    let start = b.int(ty, 0);
    let step = b.int(ty, 1);
    b.for_loop(start, y_steps, step, |b, y_indvar| {
        let y_offset = b.binary_imm(BinOp::Mul, y_indvar, num_threads_y);
        let y_loc = b.add(thread.thread_id_y, y_offset);
        let row = Row {
            scheme,
            source: &source,
            y_loc,
            start_x,
            tile_width,
        };
        if !scheme.x_tile_fits() && scheme.indexing_order() == IndexingOrder::StridedLinear {
            let full = b.cmp_imm(CmpOp::Eq, tile_width, scheme.tile_size_x());
            let partial = b.cmp_imm(CmpOp::Ne, tile_width, scheme.tile_size_x());
            b.if_then(full, |b| row.emit(mcx, b, false, emit_elem))?;
            b.if_then(partial, |b| row.emit(mcx, b, true, emit_elem))
        } else {
            row.emit(mcx, b, !scheme.x_tile_fits(), emit_elem)
        }
    })
}

struct Row<'a> {
    scheme: &'a KernelMappingScheme,
    source: &'a IrIndex,
    y_loc: ValueId,
    start_x: ValueId,
    tile_width: ValueId,
}

impl Row<'_> {
    fn emit<'m>(
        &self,
        mcx: &mut ModuleContext<'m>,
        b: &mut Builder,
        check_x_bounds: bool,
        emit_elem: &mut TileElementFn<'_, 'm>,
    ) -> GpuResult<()> {
        let vector_size = self.scheme.vector_size();
        let step_x = self.scheme.step_x();
        let ty = b.value_type(self.start_x);
        for j in 0..self.scheme.x_num_steps() / vector_size {
            for i in 0..vector_size {
                let offset = j * step_x * vector_size + i;
                let x_iter_num = j * vector_size + i;
                let offset_value = b.int(ty, offset);
                let x_loc = b.add(offset_value, self.start_x);
                let at_row = self.source.add_offset_to_dim(b, self.y_loc, DIM_Y);
                let index = at_row.add_offset_to_dim(b, offset_value, DIM_X);
                if check_x_bounds {
                    let in_tile = b.cmp(CmpOp::Lt, x_loc, self.tile_width);
                    b.if_then(in_tile, |b| emit_elem(mcx, b, &index, self.y_loc, x_loc, x_iter_num))?;
                } else {
                    emit_elem(mcx, b, &index, self.y_loc, x_loc, x_iter_num)?;
                }
            }
        }
        Ok(())
    }
}
