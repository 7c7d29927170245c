//! Select-and-scatter.
//!
//! Two launches: the initializer fills the output with the init value,
//! then one thread per source element walks its operand window, selects
//! an element with the `select` computation and combines the source
//! element into the matching output element with the `scatter`
//! computation.

use crate::atomics::emit_atomic_operation;
use crate::context::ModuleContext;
use crate::elemental::emit_loop_nest;
use crate::initializer::build_initializer_thunk;
use crate::ir_array::IrIndex;
use crate::loop_emitter::{emit_parallel_loop, LoopGeometry};
use crate::prototype::build_kernel_prototype;
use crate::scatter::emit_unsigned_lt;
use crate::thunk::{Thunk, ThunkInfo};
use crate::{GpuError, GpuResult};
use kgen_hlo::{ArrayShape, InstrId, Opcode, PrimitiveType};
use kgen_kir::{BinOp, Builder, ScalarType, ValueId};
use smallvec::SmallVec;
use tracing::debug;

/// Emit `instr`, a select-and-scatter, as an initializer followed by the
/// scatter kernel.
pub fn emit_select_and_scatter(mcx: &mut ModuleContext<'_>, instr: InstrId) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let unnested = hlo.instr(instr);
    let Opcode::SelectAndScatter {
        window,
        select,
        scatter,
    } = unnested.opcode()
    else {
        return Err(GpuError::Internal(format!(
            "{} is not a select-and-scatter",
            unnested.name()
        )));
    };
    let operand_id = unnested.operand(0);
    let source_id = unnested.operand(1);
    let operand_shape = hlo.instr(operand_id).shape().array_shape()?.clone();
    let source_shape = hlo.instr(source_id).shape().array_shape()?.clone();
    let rank = operand_shape.rank();
    if source_shape.rank() != rank || window.dimensions.len() != rank {
        return Err(GpuError::Internal(format!(
            "rank mismatch in {}: operand {rank}, source {}, window {}",
            unnested.name(),
            source_shape.rank(),
            window.dimensions.len()
        )));
    }
    if window.has_dilation() {
        return Err(GpuError::Unimplemented(
            "Dilation for SelectAndScatter not implemented on GPU.".to_string(),
        ));
    }

    let initializer = build_initializer_thunk(mcx, instr, &[])?;

    let mut kcx = build_kernel_prototype(mcx, instr)?;
    let operand = kcx.array_for(hlo, operand_id, &[])?;
    let source = kcx.array_for(hlo, source_id, &[])?;
    let output = kcx.array_for(hlo, instr, &[])?;
    let geometry = LoopGeometry::for_instruction(mcx, instr, &source_shape, Some(1));
    let index_type = geometry.index_type;
    let element_type = ScalarType::from(operand.element_type());
    let select_fn = mcx.function_for(*select)?;

    let b = &mut kcx.builder;
    let selected_value = b.alloc_local("selected_value", element_type, 1);
    let selected_index = b.alloc_local("selected_index", index_type, rank as u64);
    let initialized = b.alloc_local("initialized_flag", ScalarType::Pred, 1);
    let window_dims: SmallVec<[i64; 4]> = window.dimensions.iter().map(|d| d.size).collect();
    let window_shape = ArrayShape::new(PrimitiveType::Pred, &window_dims);
    let all_dims: Vec<usize> = (0..rank).collect();
    debug!(
        instruction = unnested.name(),
        window = ?window_dims,
        launch = %geometry.launch,
        "select-and-scatter kernel"
    );

    let mut body = |mcx: &mut ModuleContext<'_>, b: &mut Builder, source_index: &IrIndex| -> GpuResult<()> {
        let no = b.pred(false);
        b.store_local(initialized, 0, no);

        let zero = b.int(index_type, 0);
        let mut coords: SmallVec<[ValueId; 4]> = SmallVec::from_elem(zero, rank);
        let mut visit = |_: &mut ModuleContext<'_>, b: &mut Builder, window_index: &[ValueId]| -> GpuResult<()> {
            let mut in_bounds = b.pred(true);
            let mut operand_coords: SmallVec<[ValueId; 4]> = SmallVec::with_capacity(rank);
            for (dim, wd) in window.dimensions.iter().enumerate() {
                let strided = b.binary_imm(BinOp::Mul, source_index.get(dim), wd.stride);
                let shifted = b.add(strided, window_index[dim]);
                let coord = b.binary_imm(BinOp::Sub, shifted, wd.padding_low);
                let valid = emit_unsigned_lt(b, coord, operand_shape.dim(dim));
                in_bounds = b.and(in_bounds, valid);
                operand_coords.push(coord);
            }
            b.if_then(in_bounds, |b| -> GpuResult<()> {
                let operand_index = IrIndex::new(operand_coords.iter().copied(), &operand_shape, index_type);
                let value = operand.emit_read(b, &operand_index);
                let save = |b: &mut Builder| {
                    b.store_local(selected_value, 0, value);
                    for (dim, &coord) in operand_coords.iter().enumerate() {
                        b.store_local(selected_index, dim as u64, coord);
                    }
                };
                let seen = b.load_local(initialized, 0);
                b.if_then_else(
                    seen,
                    |b: &mut Builder| -> GpuResult<()> {
                        let current = b.load_local(selected_value, 0);
                        let keep = b
                            .call(select_fn, &[current, value], &[ScalarType::Pred])
                            .first()
                            .copied()
                            .ok_or_else(|| GpuError::Internal("select computation returns nothing".to_string()))?;
                        b.if_then_else(keep, |_| Ok::<_, GpuError>(()), |b| {
                            save(b);
                            Ok(())
                        })
                    },
                    |b: &mut Builder| -> GpuResult<()> {
                        save(b);
                        let yes = b.pred(true);
                        b.store_local(initialized, 0, yes);
                        Ok(())
                    },
                )
            })
        };
        emit_loop_nest(mcx, b, &window_shape, &all_dims, &mut coords, &mut visit)?;

        // A window lying entirely in the padding selects nothing.
        let selected = b.load_local(initialized, 0);
        b.if_then(selected, |b| {
            let coords: SmallVec<[ValueId; 4]> = (0..rank)
                .map(|dim| b.load_local(selected_index, dim as u64))
                .collect();
            let target = IrIndex::new(coords, output.shape(), index_type);
            let address = output.element_address(b, &target);
            let value = source.emit_read(b, source_index);
            emit_atomic_operation(mcx, b, *scatter, address, value)
        })
    };
    emit_parallel_loop(mcx, &mut kcx.builder, &source_shape, &geometry, &mut body)?;
    let kernel = kcx.into_thunk(mcx, ThunkInfo::new(unnested.name(), None), geometry.launch);

    Ok(Thunk::Sequential {
        info: mcx.thunk_info(instr),
        thunks: vec![initializer, kernel],
    })
}
