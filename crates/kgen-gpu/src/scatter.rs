//! Scatter kernels.
//!
//! A scatter kernel iterates the updates shape. Each update element is
//! split into window coordinates and scatter coordinates; the scatter
//! coordinates select an index vector, which offsets the window into the
//! operand. Windows starting out of bounds are skipped.

use crate::atomics::emit_atomic_operation;
use crate::context::ModuleContext;
use crate::elemental::Elemental;
use crate::ir_array::{IrArray, IrIndex};
use crate::loop_emitter::{emit_parallel_loop, LoopGeometry};
use crate::prototype::{build_kernel_prototype, KernelContext};
use crate::thunk::{sequence_or_single, Thunk, ThunkInfo};
use crate::{GpuError, GpuResult};
use kgen_hlo::{ArrayShape, CompId, HloModule, InstrId, Opcode, ScatterDimensionNumbers};
use kgen_kir::{AddressSpace, Builder, CmpOp, ScalarType, ValueId};
use smallvec::SmallVec;
use tracing::debug;

/// Everything a scatter kernel needs to know about one scatter.
#[derive(Clone, Debug)]
pub struct ScatterDescriptor {
    /// Name used for diagnostics.
    pub name: String,
    /// Operand (and output) shape.
    pub operand_shape: ArrayShape,
    /// Shape of the index vectors' array.
    pub indices_shape: ArrayShape,
    /// Shape of the updates.
    pub updates_shape: ArrayShape,
    /// How updates map onto the operand.
    pub dimension_numbers: ScatterDimensionNumbers,
    /// Combines the current output element with an update.
    pub update_computation: CompId,
    /// Set when no two updates hit the same element.
    pub unique_indices: bool,
    /// Instruction producing the index vectors.
    pub indices: InstrId,
    /// Instruction producing the updates.
    pub updates: InstrId,
}

impl ScatterDescriptor {
    /// The descriptor of `scatter`, a scatter instruction (possibly inside
    /// a fused computation).
    pub fn for_instruction(module: &HloModule, scatter: InstrId) -> GpuResult<Self> {
        let hlo = module.instr(scatter);
        let Opcode::Scatter {
            dimension_numbers,
            to_apply,
            unique_indices,
        } = hlo.opcode()
        else {
            return Err(GpuError::Internal(format!("{} is not a scatter", hlo.name())));
        };
        let shape_of = |i: usize| -> GpuResult<ArrayShape> {
            Ok(module.instr(hlo.operand(i)).shape().array_shape()?.clone())
        };
        let desc = Self {
            name: hlo.name().to_string(),
            operand_shape: shape_of(0)?,
            indices_shape: shape_of(1)?,
            updates_shape: shape_of(2)?,
            dimension_numbers: dimension_numbers.clone(),
            update_computation: *to_apply,
            unique_indices: *unique_indices,
            indices: hlo.operand(1),
            updates: hlo.operand(2),
        };
        let window = desc.operand_window_bounds();
        for (dim, &bound) in window.iter().enumerate() {
            if bound > desc.operand_shape.dim(dim) {
                return Err(GpuError::FailedPrecondition(format!(
                    "scatter {} has a window of {bound} along operand dimension {dim} of size {}",
                    desc.name,
                    desc.operand_shape.dim(dim)
                )));
            }
        }
        Ok(desc)
    }

    /// Window extent of every operand dimension: 1 for inserted window
    /// dimensions, else the matching update window dimension.
    #[must_use]
    pub fn operand_window_bounds(&self) -> SmallVec<[i64; 4]> {
        let numbers = &self.dimension_numbers;
        let mut window = numbers
            .update_window_dims
            .iter()
            .map(|&dim| self.updates_shape.dim(dim));
        (0..self.operand_shape.rank())
            .map(|dim| {
                if numbers.inserted_window_dims.contains(&dim) {
                    1
                } else {
                    window.next().unwrap_or(1)
                }
            })
            .collect()
    }

    /// Exclusive upper bound of a valid window start along `operand_dim`.
    #[must_use]
    pub fn max_start(&self, operand_dim: usize) -> i64 {
        (self.operand_shape.dim(operand_dim) - self.operand_window_bounds()[operand_dim] + 1).max(0)
    }
}

/// `value <u bound`, which also rejects negative `value`.
pub(crate) fn emit_unsigned_lt(b: &mut Builder, value: ValueId, bound: i64) -> ValueId {
    let unsigned = match b.value_type(value).bit_width() {
        64 => ScalarType::U64,
        _ => ScalarType::U32,
    };
    let value = b.cast(value, unsigned);
    let bound = b.int(unsigned, bound);
    b.cmp(CmpOp::Lt, value, bound)
}

/// Emit the scatter loop of `desc` into `kcx`, writing `output`.
///
/// `elemental` must produce `desc.indices` and `desc.updates`.
fn emit_scatter_loop(
    mcx: &mut ModuleContext<'_>,
    kcx: &mut KernelContext,
    owner: InstrId,
    desc: &ScatterDescriptor,
    elemental: &Elemental,
    output: &IrArray,
) -> GpuResult<LoopGeometry> {
    let geometry = LoopGeometry::for_instruction(mcx, owner, &desc.updates_shape, Some(1));
    let numbers = &desc.dimension_numbers;
    let window_bounds = desc.operand_window_bounds();
    let implicit_index_vector = numbers.index_vector_dim == desc.indices_shape.rank();
    let element_type = ScalarType::from(output.element_type());
    debug!(
        scatter = %desc.name,
        unique = desc.unique_indices,
        window = ?window_bounds,
        "scatter kernel"
    );

    let mut body = |mcx: &mut ModuleContext<'_>, b: &mut Builder, index: &IrIndex| -> GpuResult<()> {
        let ty = index.index_type();
        let mut raw_window = SmallVec::<[ValueId; 4]>::new();
        let mut scatter_coords = SmallVec::<[ValueId; 4]>::new();
        for dim in 0..index.rank() {
            if numbers.update_window_dims.contains(&dim) {
                raw_window.push(index.get(dim));
            } else {
                scatter_coords.push(index.get(dim));
            }
        }

        let zero = b.int(ty, 0);
        let mut raw_window = raw_window.into_iter();
        let mut window: SmallVec<[ValueId; 4]> = (0..desc.operand_shape.rank())
            .map(|dim| {
                if numbers.inserted_window_dims.contains(&dim) {
                    zero
                } else {
                    raw_window.next().unwrap_or(zero)
                }
            })
            .collect();

        let mut in_bounds = b.pred(true);
        for (i, &operand_dim) in numbers.scatter_dims_to_operand_dims.iter().enumerate() {
            let mut coords = scatter_coords.clone();
            if !implicit_index_vector {
                let component = b.int(ty, i as i64);
                coords.insert(numbers.index_vector_dim, component);
            }
            let lookup = IrIndex::new(coords, &desc.indices_shape, ty);
            let loaded = elemental.generate(mcx, b, desc.indices, &lookup)?;
            let start = b.cast(loaded, ty);
            window[operand_dim] = b.add(window[operand_dim], start);
            let valid = emit_unsigned_lt(b, start, desc.max_start(operand_dim));
            in_bounds = b.and(in_bounds, valid);
        }

        b.if_then(in_bounds, |b| -> GpuResult<()> {
            let target = IrIndex::new(window.iter().copied(), output.shape(), ty);
            let address = output.element_address(b, &target);
            let update = elemental.generate(mcx, b, desc.updates, index)?;
            if desc.unique_indices {
                let function = mcx.function_for(desc.update_computation)?;
                let current = b.load(AddressSpace::Global, element_type, address);
                let combined = b
                    .call(function, &[current, update], &[element_type])
                    .first()
                    .copied()
                    .ok_or_else(|| GpuError::Internal(format!("update computation of {} returns nothing", desc.name)))?;
                b.store(AddressSpace::Global, address, combined);
                Ok(())
            } else {
                emit_atomic_operation(mcx, b, desc.update_computation, address, update)
            }
        })
    };
    emit_parallel_loop(mcx, &mut kcx.builder, &desc.updates_shape, &geometry, &mut body)?;
    Ok(geometry)
}

/// Thunks for an unfused scatter: a copy of the operand into the output
/// when they live apart, then the scatter kernel.
pub fn emit_scatter(mcx: &mut ModuleContext<'_>, instr: InstrId) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let scatter = hlo.instr(instr);
    let desc = ScatterDescriptor::for_instruction(hlo, instr)?;
    let info = mcx.thunk_info(instr);

    let mut thunks = Vec::with_capacity(2);
    let operand = mcx.slice(scatter.operand(0), &[])?;
    let output_slice = mcx.slice(instr, &[])?;
    if operand != output_slice {
        thunks.push(Thunk::Copy {
            info: ThunkInfo::new(scatter.name(), None),
            source: operand,
            destination: output_slice,
        });
    }

    let mut kcx = build_kernel_prototype(mcx, instr)?;
    let output = kcx.array_for(hlo, instr, &[])?;
    let mut elemental = Elemental::new();
    kcx.bind_inputs(hlo, instr, &mut elemental)?;
    let geometry = emit_scatter_loop(mcx, &mut kcx, instr, &desc, &elemental, &output)?;
    thunks.push(kcx.into_thunk(mcx, info.clone(), geometry.launch));

    sequence_or_single(info, thunks)
        .ok_or_else(|| GpuError::Internal(format!("no thunks for {}", scatter.name())))
}

/// Thunks for a fusion whose root is a scatter: a loop kernel filling the
/// output from the fused operand expression, then the scatter kernel
/// reading fused indices and updates.
pub fn emit_fused_scatter(mcx: &mut ModuleContext<'_>, fusion: InstrId) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let name = hlo.instr(fusion).name();
    let root = hlo
        .fused_root(fusion)
        .ok_or_else(|| GpuError::Internal(format!("{name} is not a fusion")))?;
    let desc = ScatterDescriptor::for_instruction(hlo, root)?;
    let operand = hlo.instr(root).operand(0);

    let mut init = build_kernel_prototype(mcx, fusion)?;
    let output = init.array_for(hlo, fusion, &[])?;
    let shape = output.shape().clone();
    let geometry = LoopGeometry::for_instruction(mcx, fusion, &shape, None);
    let mut elemental = Elemental::new();
    init.bind_inputs(hlo, fusion, &mut elemental)?;
    let mut fill = |mcx: &mut ModuleContext<'_>, b: &mut Builder, index: &IrIndex| -> GpuResult<()> {
        let value = elemental.generate(mcx, b, operand, index)?;
        output.emit_write(b, index, value);
        Ok(())
    };
    emit_parallel_loop(mcx, &mut init.builder, &shape, &geometry, &mut fill)?;
    let init_thunk = init.into_thunk(mcx, ThunkInfo::new(name, None), geometry.launch);

    let mut kcx = build_kernel_prototype(mcx, fusion)?;
    let output = kcx.array_for(hlo, fusion, &[])?;
    let mut elemental = Elemental::new();
    kcx.bind_inputs(hlo, fusion, &mut elemental)?;
    let geometry = emit_scatter_loop(mcx, &mut kcx, fusion, &desc, &elemental, &output)?;
    let scatter_thunk = kcx.into_thunk(mcx, ThunkInfo::new(name, None), geometry.launch);

    Ok(Thunk::Sequential {
        info: mcx.thunk_info(fusion),
        thunks: vec![init_thunk, scatter_thunk],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmitterConfig;
    use crate::device::DeviceInfo;
    use kgen_hlo::{
        scalar_binary_computation, BinaryOp, BufferAssignment, PrimitiveType, Shape,
    };
    use kgen_kir::Stmt;

    /// `operand[8, 4]`, three row updates of width 4 at the given row
    /// indices.
    fn row_scatter(unique: bool) -> (HloModule, InstrId) {
        let mut module = HloModule::new("m");
        let add = scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
        let mut b = module.builder("entry");
        let operand = b.parameter(0, Shape::array(PrimitiveType::F32, &[8, 4]));
        let indices = b.parameter(1, Shape::array(PrimitiveType::S32, &[3]));
        let updates = b.parameter(2, Shape::array(PrimitiveType::F32, &[3, 4]));
        let numbers = ScatterDimensionNumbers {
            update_window_dims: vec![1],
            inserted_window_dims: vec![0],
            scatter_dims_to_operand_dims: vec![0],
            index_vector_dim: 1,
        };
        let scatter = b.scatter(operand, indices, updates, numbers, add, unique);
        let entry = b.build(scatter);
        module.set_entry(entry);
        (module, scatter)
    }

    #[test]
    fn test_window_bounds() {
        let (module, scatter) = row_scatter(false);
        let desc = ScatterDescriptor::for_instruction(&module, scatter).unwrap();
        assert_eq!(desc.operand_window_bounds().as_slice(), &[1, 4]);
        assert_eq!(desc.max_start(0), 8);
        assert_eq!(desc.max_start(1), 1);
    }

    #[test]
    fn test_copy_precedes_kernel() {
        let (module, scatter) = row_scatter(false);
        let assignment = BufferAssignment::assign(&module).unwrap();
        let config = EmitterConfig::default();
        let device = DeviceInfo::mock();
        let mut mcx = ModuleContext::new(&module, &assignment, &config, &device);
        let thunk = emit_scatter(&mut mcx, scatter).unwrap();
        let Thunk::Sequential { thunks, .. } = thunk else {
            panic!("expected a sequence");
        };
        assert!(matches!(thunks[0], Thunk::Copy { .. }));
        let Thunk::Kernel { launch, .. } = &thunks[1] else {
            panic!("expected a kernel");
        };
        assert!(launch.launch_bound() >= 12);
    }

    #[test]
    fn test_in_place_scatter_is_a_single_kernel() {
        let (module, scatter) = row_scatter(true);
        let mut assignment = BufferAssignment::assign(&module).unwrap();
        let operand = module.instr(scatter).operand(0);
        assignment.share(&module, operand, scatter);
        let config = EmitterConfig::default();
        let device = DeviceInfo::mock();
        let mut mcx = ModuleContext::new(&module, &assignment, &config, &device);
        let thunk = emit_scatter(&mut mcx, scatter).unwrap();
        assert!(matches!(thunk, Thunk::Kernel { .. }));
        // Unique indices combine with a plain call rather than an atomic.
        let kernel = &mcx.kir.kernels[0];
        let mut calls = 0;
        let mut atomics = 0;
        kernel.walk(&mut |stmt| match stmt {
            Stmt::Call { .. } => calls += 1,
            Stmt::Atomic { .. } => atomics += 1,
            _ => {}
        });
        assert_eq!(calls, 1);
        assert_eq!(atomics, 0);
    }

    #[test]
    fn test_window_wider_than_operand_is_rejected() {
        let mut module = HloModule::new("m");
        let add = scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
        let mut b = module.builder("entry");
        let operand = b.parameter(0, Shape::array(PrimitiveType::F32, &[8, 4]));
        let indices = b.parameter(1, Shape::array(PrimitiveType::S32, &[3]));
        let updates = b.parameter(2, Shape::array(PrimitiveType::F32, &[3, 6]));
        let numbers = ScatterDimensionNumbers {
            update_window_dims: vec![1],
            inserted_window_dims: vec![0],
            scatter_dims_to_operand_dims: vec![0],
            index_vector_dim: 1,
        };
        let scatter = b.scatter(operand, indices, updates, numbers, add, false);
        let entry = b.build(scatter);
        module.set_entry(entry);

        let err = ScatterDescriptor::for_instruction(&module, scatter).unwrap_err();
        assert!(matches!(err, GpuError::FailedPrecondition(ref m) if m.contains("window of 6")));

        let (module, scatter) = row_scatter(false);
        let mut desc = ScatterDescriptor::for_instruction(&module, scatter).unwrap();
        desc.updates_shape = ArrayShape::new(PrimitiveType::F32, &[3, 6]);
        assert_eq!(desc.max_start(1), 0);
    }
}
