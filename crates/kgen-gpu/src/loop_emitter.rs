//! Element-parallel kernels.
//!
//! Each thread handles `unroll_factor` consecutive physical positions of the
//! iteration shape, starting at `(block_id * threads_per_block + thread_id) *
//! unroll_factor`. In few-waves mode the grid is smaller than the shape and
//! every thread strides over it by the whole launch.

use crate::context::ModuleContext;
use crate::elemental::Elemental;
use crate::ir_array::{IrArray, IrIndex};
use crate::launch::{
    calculate_launch_dimensions, compute_max_unroll_factor, few_waves_allowed,
    index_type_for_kernel, may_prevent_vectorization, LaunchDimensions,
};
use crate::prototype::{build_kernel_prototype, KernelContext};
use crate::thunk::Thunk;
use crate::{GpuError, GpuResult};
use kgen_hlo::{ArrayShape, InstrId, Opcode};
use kgen_kir::{AddressSpace, BinOp, Builder, CmpOp, ScalarType, SpecialReg, ValueId};
use tracing::debug;

/// Emits the code for one element; called once per unrolled position.
pub type ElementBody<'f, 'm> =
    dyn FnMut(&mut ModuleContext<'m>, &mut Builder, &IrIndex) -> GpuResult<()> + 'f;

/// Geometry of an element-parallel kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopGeometry {
    /// Launch dimensions.
    pub launch: LaunchDimensions,
    /// Elements per thread.
    pub unroll_factor: u64,
    /// Integer type of every index computation.
    pub index_type: ScalarType,
    /// Whether threads stride over the shape.
    pub few_waves: bool,
}

impl LoopGeometry {
    /// Geometry for evaluating `instr` over `shape`.
    ///
    /// Unrolling is applied only when nothing in `instr` may prevent
    /// vectorization; `unroll_factor` caps it.
    #[must_use]
    pub fn for_instruction(mcx: &ModuleContext<'_>, instr: InstrId, shape: &ArrayShape, unroll_factor: Option<u64>) -> Self {
        let hlo = mcx.hlo.instr(instr);
        let unroll_factor = match unroll_factor {
            Some(factor) => factor,
            None if may_prevent_vectorization(mcx.hlo, hlo) => 1,
            None => compute_max_unroll_factor(mcx.hlo, hlo, mcx.config),
        };
        let unroll_factor = if shape.num_elements() as u64 % unroll_factor == 0 {
            unroll_factor
        } else {
            1
        };
        let few_waves = mcx.config.enable_few_waves && few_waves_allowed(mcx.hlo, hlo);
        let launch = calculate_launch_dimensions(shape.num_elements(), mcx.device, unroll_factor, few_waves);
        let index_type = index_type_for_kernel(mcx.hlo, hlo, launch.launch_bound() * unroll_factor);
        debug!(
            instruction = hlo.name(),
            unroll_factor,
            few_waves,
            %launch,
            "loop geometry"
        );
        Self {
            launch,
            unroll_factor,
            index_type,
            few_waves,
        }
    }
}

/// `block_id * threads_per_block + thread_id` in `ty`.
pub fn emit_global_thread_id(b: &mut Builder, ty: ScalarType) -> ValueId {
    let block = b.special(SpecialReg::BlockIdX);
    let block = b.cast(block, ty);
    let dim = b.special(SpecialReg::BlockDimX);
    let dim = b.cast(dim, ty);
    let thread = b.special(SpecialReg::ThreadIdX);
    let thread = b.cast(thread, ty);
    let base = b.mul(block, dim);
    b.add(base, thread)
}

/// Run `body` for every element of `shape` under `geometry`.
///
/// The bound check is on the first unrolled position only; the unroll
/// factor divides the element count.
pub fn emit_parallel_loop<'m>(
    mcx: &mut ModuleContext<'m>,
    b: &mut Builder,
    shape: &ArrayShape,
    geometry: &LoopGeometry,
    body: &mut ElementBody<'_, 'm>,
) -> GpuResult<()> {
    let ty = geometry.index_type;
    let unroll = geometry.unroll_factor as i64;
    let num_elements = shape.num_elements();
    let thread_id = emit_global_thread_id(b, ty);
    let base = if unroll == 1 {
        thread_id
    } else {
        b.binary_imm(BinOp::Mul, thread_id, unroll)
    };

    let mut unrolled = |mcx: &mut ModuleContext<'m>, b: &mut Builder, base: ValueId| -> GpuResult<()> {
        for i in 0..unroll {
            let linear = if i == 0 {
                base
            } else {
                b.binary_imm(BinOp::Add, base, i)
            };
            let index = IrIndex::from_linear(b, linear, shape);
            body(mcx, b, &index)?;
        }
        Ok(())
    };

    if geometry.few_waves {
        let stride = geometry.launch.launch_bound() as i64 * unroll;
        let end = b.int(ty, num_elements);
        let step = b.int(ty, stride);
        b.for_loop(base, end, step, |b, linear| unrolled(mcx, b, linear))
    } else {
        let in_bounds = b.cmp_imm(CmpOp::Lt, base, num_elements);
        b.if_then(in_bounds, |b| unrolled(mcx, b, base))
    }
}

/// Block 0, thread 0 stores the address of each element of tuple `instr`
/// into its pointer table.
pub fn emit_tuple_pointer_table(kcx: &mut KernelContext, module: &kgen_hlo::HloModule, instr: InstrId) -> GpuResult<()> {
    let shape = module.instr(instr).shape();
    if !shape.is_tuple() {
        return Ok(());
    }
    let Some(table) = kcx.address(instr, &[]) else {
        return Err(GpuError::Internal(format!(
            "no pointer table bound for {}",
            module.instr(instr).name()
        )));
    };
    let mut elements = Vec::with_capacity(shape.tuple_shapes().len());
    for i in 0..shape.tuple_shapes().len() {
        elements.push(kcx.address(instr, &[i]).ok_or_else(|| {
            GpuError::Internal(format!(
                "no buffer bound for element {i} of {}",
                module.instr(instr).name()
            ))
        })?);
    }
    let b = &mut kcx.builder;
    let block = b.special(SpecialReg::BlockIdX);
    let thread = b.special(SpecialReg::ThreadIdX);
    let first_block = b.cmp_imm(CmpOp::Eq, block, 0);
    let first_thread = b.cmp_imm(CmpOp::Eq, thread, 0);
    let first = b.and(first_block, first_thread);
    b.if_then(first, |b| {
        for (i, &element) in elements.iter().enumerate() {
            let slot = b.byte_offset(table, i as u64 * 8);
            b.store(AddressSpace::Global, slot, element);
        }
        Ok::<_, GpuError>(())
    })
}

/// The arrays a loop kernel for `instr` writes, in output order, and the
/// instructions computing them.
fn loop_outputs(mcx: &ModuleContext<'_>, kcx: &KernelContext, instr: InstrId) -> GpuResult<Vec<(InstrId, IrArray)>> {
    let hlo = mcx.hlo;
    let arrays = kcx.output_arrays(hlo, instr)?;
    let values: Vec<InstrId> = match hlo.fused_root(instr) {
        Some(root) if matches!(hlo.instr(root).opcode(), Opcode::Tuple) => hlo.instr(root).operands().to_vec(),
        Some(root) => vec![root],
        None => vec![instr],
    };
    if values.len() != arrays.len() {
        return Err(GpuError::Internal(format!(
            "{} has {} outputs but {} buffers",
            hlo.instr(instr).name(),
            values.len(),
            arrays.len()
        )));
    }
    Ok(values.into_iter().zip(arrays).collect())
}

/// A kernel evaluating `instr` element by element, writing every output.
///
/// Handles unfused instructions the elemental generator understands and
/// loop fusions, including multi-output ones (iterated over the first
/// output's shape).
pub fn emit_loop_kernel(mcx: &mut ModuleContext<'_>, instr: InstrId, unroll_factor: Option<u64>) -> GpuResult<Thunk> {
    let hlo = mcx.hlo;
    let mut kcx = build_kernel_prototype(mcx, instr)?;
    let outputs = loop_outputs(mcx, &kcx, instr)?;
    let Some(shape) = outputs.first().map(|(_, array)| array.shape().clone()) else {
        return Err(GpuError::Internal(format!(
            "{} has no outputs",
            hlo.instr(instr).name()
        )));
    };
    for (_, array) in &outputs {
        if !array.shape().same_dimensions(&shape) {
            return Err(GpuError::Internal(format!(
                "outputs of {} do not share dimensions",
                hlo.instr(instr).name()
            )));
        }
    }

    let geometry = LoopGeometry::for_instruction(mcx, instr, &shape, unroll_factor);
    let mut elemental = Elemental::new();
    kcx.bind_inputs(hlo, instr, &mut elemental)?;
    emit_tuple_pointer_table(&mut kcx, hlo, instr)?;

    let mut body = |mcx: &mut ModuleContext<'_>, b: &mut Builder, index: &IrIndex| -> GpuResult<()> {
        let mut values = Vec::with_capacity(outputs.len());
        for (value, _) in &outputs {
            values.push(elemental.generate(mcx, b, *value, index)?);
        }
        for ((_, array), value) in outputs.iter().zip(values) {
            array.emit_write(b, &output_index(index, array.shape()), value);
        }
        Ok(())
    };
    emit_parallel_loop(mcx, &mut kcx.builder, &shape, &geometry, &mut body)?;

    let info = mcx.thunk_info(instr);
    Ok(kcx.into_thunk(mcx, info, geometry.launch))
}

/// `index` re-targeted at an output with the same dimensions, keeping its
/// linear position when the layouts agree.
#[must_use]
pub fn output_index(index: &IrIndex, shape: &ArrayShape) -> IrIndex {
    if index.linear_valid_on(shape) {
        index.clone()
    } else {
        index.with_shape(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmitterConfig;
    use crate::device::DeviceInfo;
    use kgen_hlo::{BinaryOp, BufferAssignment, FusionKind, HloModule, Literal, PrimitiveType, Shape, UnaryOp};
    use kgen_kir::{Expr, Stmt};

    fn add_constant_fusion() -> (HloModule, InstrId) {
        let mut module = HloModule::new("m");
        let mut fb = module.builder("fused_add");
        let p = fb.parameter(0, Shape::array(PrimitiveType::F32, &[3, 4]));
        let c = fb.constant(Literal::scalar_f32(10.0));
        let bc = fb.broadcast(c, ArrayShape::new(PrimitiveType::F32, &[3, 4]), &[]);
        let add = fb.binary(BinaryOp::Add, p, bc);
        let fused = fb.build(add);
        let mut b = module.builder("entry");
        let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[3, 4]));
        let fusion = b.fusion(FusionKind::Loop, fused, &[x]);
        let entry = b.build(fusion);
        module.set_entry(entry);
        (module, fusion)
    }

    #[test]
    fn test_loop_fusion_geometry_covers_shape() {
        let (module, fusion) = add_constant_fusion();
        let assignment = BufferAssignment::assign(&module).unwrap();
        let config = EmitterConfig::default();
        let device = DeviceInfo::mock();
        let mut mcx = ModuleContext::new(&module, &assignment, &config, &device);
        let thunk = emit_loop_kernel(&mut mcx, fusion, None).unwrap();
        let Thunk::Kernel { launch, .. } = thunk else {
            panic!("expected a kernel thunk");
        };
        assert_eq!(launch.launch_bound() * 4, 12);
        assert_eq!(mcx.kir.kernels.len(), 1);
    }

    #[test]
    fn test_few_waves_uses_grid_stride_loop() {
        let mut module = HloModule::new("m");
        let mut b = module.builder("entry");
        let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[1 << 22]));
        let neg = b.unary(UnaryOp::Neg, x);
        let entry = b.build(neg);
        module.set_entry(entry);
        let assignment = BufferAssignment::assign(&module).unwrap();
        let config = EmitterConfig::default();
        let device = DeviceInfo::mock();
        let mut mcx = ModuleContext::new(&module, &assignment, &config, &device);

        let shape = ArrayShape::new(PrimitiveType::F32, &[1 << 22]);
        let geometry = LoopGeometry::for_instruction(&mcx, neg, &shape, None);
        assert!(geometry.few_waves);
        assert_eq!(geometry.launch.threads_per_block.x, 128);
        assert!(geometry.launch.blocks.x <= device.core_count * (device.threads_per_core_limit / 128));

        emit_loop_kernel(&mut mcx, neg, None).unwrap();
        let kernel = &mcx.kir.kernels[0];
        assert!(kernel.body.iter().any(|s| matches!(s, Stmt::For { .. })));
    }

    #[test]
    fn test_unrolled_positions_follow_base() {
        let mut b = Builder::new("k");
        let module = HloModule::new("m");
        let assignment = BufferAssignment::new();
        let config = EmitterConfig::default();
        let device = DeviceInfo::mock();
        let mut mcx = ModuleContext::new(&module, &assignment, &config, &device);
        let shape = ArrayShape::new(PrimitiveType::F32, &[8]);
        let geometry = LoopGeometry {
            launch: LaunchDimensions::new(1, 2),
            unroll_factor: 4,
            index_type: ScalarType::S32,
            few_waves: false,
        };
        let mut seen = Vec::new();
        let mut body = |_: &mut ModuleContext<'_>, _: &mut Builder, index: &IrIndex| -> GpuResult<()> {
            seen.push(index.linear());
            Ok(())
        };
        emit_parallel_loop(&mut mcx, &mut b, &shape, &geometry, &mut body).unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(Option::is_some));
        let kernel = b.finish_kernel();
        assert!(matches!(kernel.body.last(), Some(Stmt::If { .. })));
        assert!(kernel
            .body
            .iter()
            .any(|s| matches!(s, Stmt::Let { expr: Expr::Special(SpecialReg::BlockDimX), .. })));
    }
}
