//! The thunk sequencer.
//!
//! [`IrEmitterUnnested`] walks a computation in post order and turns every
//! instruction into zero or more thunks. Kernels land in the module's
//! kernel IR; control flow recurses into nested computations.

use crate::context::ModuleContext;
use crate::dynamic::{
    can_update_fusion_in_place, emit_dynamic_update_slice, emit_pad_to_static, emit_slice_to_dynamic,
    emit_update_in_place,
};
use crate::elemental::Elemental;
use crate::ir_array::IrIndex;
use crate::loop_emitter::{emit_loop_kernel, emit_parallel_loop, emit_tuple_pointer_table, output_index, LoopGeometry};
use crate::prototype::build_kernel_prototype;
use crate::reduction::{emit_reduction, is_reduction_from_or_to_contiguous_dimensions};
use crate::scatter::{emit_fused_scatter, emit_scatter};
use crate::select_and_scatter::emit_select_and_scatter;
use crate::sort::emit_sort;
use crate::thunk::{sequence_or_single, Thunk};
use crate::transpose::check_and_emit_021_transpose;
use crate::{DeviceInfo, EmitterConfig, GpuError, GpuResult, LaunchDimensions};
use kgen_hlo::{
    ArrayShape, BufferAssignment, CompId, FusionKind, HloModule, InstrId, Opcode, PrimitiveType,
};
use kgen_kir::{Builder, CmpOp, KirModule, ValueId};
use smallvec::SmallVec;
use tracing::{debug, trace};

/// Emits thunks and kernels for the computations of one module.
#[derive(Debug)]
pub struct IrEmitterUnnested<'a> {
    mcx: ModuleContext<'a>,
}

impl<'a> IrEmitterUnnested<'a> {
    /// An emitter with an empty kernel module.
    #[must_use]
    pub fn new(
        module: &'a HloModule,
        assignment: &'a BufferAssignment,
        config: &'a EmitterConfig,
        device: &'a DeviceInfo,
    ) -> Self {
        Self {
            mcx: ModuleContext::new(module, assignment, config, device),
        }
    }

    /// The shared emission context.
    #[must_use]
    pub fn context(&self) -> &ModuleContext<'a> {
        &self.mcx
    }

    /// The kernels, functions and globals emitted so far.
    #[must_use]
    pub fn into_kir_module(self) -> KirModule {
        self.mcx.kir
    }

    /// Thunks for every instruction of `comp`, in order.
    pub fn emit_computation(&mut self, comp: CompId) -> GpuResult<Vec<Thunk>> {
        let hlo = self.mcx.hlo;
        let computation = hlo.computation(comp);
        let is_entry = hlo.entry().ok() == Some(comp);
        let mut thunks = Vec::new();
        for &id in computation.instructions() {
            // The entry result is read through its element slices.
            if is_entry && id == computation.root() && matches!(hlo.instr(id).opcode(), Opcode::Tuple) {
                continue;
            }
            if let Some(thunk) = self.emit_instruction(id)? {
                trace!(
                    instruction = hlo.instr(id).name(),
                    thunk = thunk.kind_name(),
                    "emitted thunk"
                );
                thunks.push(thunk);
            }
        }
        Ok(thunks)
    }

    /// The thunk for one instruction, or `None` for instructions that need
    /// no work at run time.
    pub fn emit_instruction(&mut self, id: InstrId) -> GpuResult<Option<Thunk>> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        match instr.opcode() {
            Opcode::Parameter { .. }
            | Opcode::Constant(_)
            | Opcode::GetTupleElement { .. }
            | Opcode::Bitcast
            | Opcode::AfterAll => Ok(None),

            Opcode::Iota { .. }
            | Opcode::Unary(_)
            | Opcode::Binary(_)
            | Opcode::Compare(_)
            | Opcode::Select
            | Opcode::Clamp
            | Opcode::Convert
            | Opcode::Broadcast { .. }
            | Opcode::Reshape
            | Opcode::Transpose { .. }
            | Opcode::Slice { .. }
            | Opcode::Concatenate { .. }
            | Opcode::Map { .. }
            | Opcode::DynamicSlice { .. }
            | Opcode::GetDimensionSize { .. } => emit_loop_kernel(&mut self.mcx, id, None).map(Some),

            Opcode::Copy => self.emit_copy(id),
            Opcode::Reduce { .. } => {
                if is_reduction_from_or_to_contiguous_dimensions(hlo, instr) {
                    emit_reduction(&mut self.mcx, id).map(Some)
                } else {
                    emit_loop_kernel(&mut self.mcx, id, None).map(Some)
                }
            }
            Opcode::DynamicUpdateSlice => emit_dynamic_update_slice(&mut self.mcx, id).map(Some),
            Opcode::Fusion { kind, .. } => self.emit_fusion(id, *kind).map(Some),
            Opcode::Tuple => self.emit_tuple(id).map(Some),
            Opcode::TupleSelect => self.emit_tuple_select(id),
            Opcode::Scatter { .. } => emit_scatter(&mut self.mcx, id).map(Some),
            Opcode::SelectAndScatter { .. } => emit_select_and_scatter(&mut self.mcx, id).map(Some),
            Opcode::Sort { .. } => emit_sort(&mut self.mcx, id).map(Some),
            Opcode::While { .. } => self.emit_while(id).map(Some),
            Opcode::Conditional { .. } => self.emit_conditional(id).map(Some),
            Opcode::AllReduce { to_apply } => self.emit_all_reduce(id, *to_apply),
            Opcode::CollectivePermute { source_target_pairs } => Ok(Some(Thunk::CollectivePermute {
                info: self.mcx.thunk_info(id),
                source_target_pairs: source_target_pairs.clone(),
                source: self.mcx.slice(instr.operand(0), &[])?,
                destination: self.mcx.slice(id, &[])?,
                replica_count: self.mcx.config.replica_count,
            })),
            Opcode::CustomCall { target } => match target.as_str() {
                "PadToStatic" => emit_pad_to_static(&mut self.mcx, id).map(Some),
                "SliceToDynamic" => emit_slice_to_dynamic(&mut self.mcx, id).map(Some),
                _ => Err(GpuError::Unimplemented(format!(
                    "custom call {} to {target}",
                    instr.name()
                ))),
            },
            Opcode::ReplicaId => Ok(Some(Thunk::ReplicaId {
                info: self.mcx.thunk_info(id),
                destination: self.mcx.slice(id, &[])?,
            })),
            Opcode::Rng => Err(GpuError::Unimplemented(
                "Rng should be expanded for GPU.".to_string(),
            )),
        }
    }

    // ========================================================================
    // Data movement
    // ========================================================================

    /// A layout-preserving copy between known slices is a device copy (or
    /// nothing, in place); anything else is a transpose or loop kernel.
    fn emit_copy(&mut self, id: InstrId) -> GpuResult<Option<Thunk>> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        let operand = instr.operand(0);
        if let (Some(source_shape), Some(shape)) = (hlo.instr(operand).shape().as_array(), instr.shape().as_array()) {
            if source_shape.layout() == shape.layout() && source_shape.same_dimensions(shape) {
                let assignment = self.mcx.assignment;
                if let (Some(source), Some(destination)) = (
                    assignment.unique_top_level_slice(operand),
                    assignment.unique_top_level_slice(id),
                ) {
                    if source == destination {
                        return Ok(None);
                    }
                    return Ok(Some(Thunk::Copy {
                        info: self.mcx.thunk_info(id),
                        source,
                        destination,
                    }));
                }
            }
        }
        if let Some(thunk) = check_and_emit_021_transpose(&mut self.mcx, id)? {
            return Ok(Some(thunk));
        }
        emit_loop_kernel(&mut self.mcx, id, None).map(Some)
    }

    /// A pointer table write when every element has a slice, else a kernel
    /// storing the element addresses.
    fn emit_tuple(&mut self, id: InstrId) -> GpuResult<Thunk> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        let assignment = self.mcx.assignment;
        let elements: Option<Vec<_>> = instr
            .operands()
            .iter()
            .map(|&operand| assignment.unique_top_level_slice(operand))
            .collect();
        if let Some(elements) = elements {
            return Ok(Thunk::Tuple {
                info: self.mcx.thunk_info(id),
                elements,
                destination: self.mcx.slice(id, &[])?,
            });
        }

        let mut kcx = build_kernel_prototype(&mut self.mcx, id)?;
        emit_tuple_pointer_table(&mut kcx, hlo, id)?;
        let info = self.mcx.thunk_info(id);
        Ok(kcx.into_thunk(&mut self.mcx, info, LaunchDimensions::new(1, 1)))
    }

    /// One kernel per element choosing between the two operands' element
    /// values, the last one also writing the pointer table.
    fn emit_tuple_select(&mut self, id: InstrId) -> GpuResult<Option<Thunk>> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        let count = instr.shape().tuple_shapes().len();
        let predicate = instr.operand(0);
        let mut thunks = Vec::with_capacity(count);
        for i in 0..count {
            let Some(shape) = instr.shape().tuple_shapes()[i].as_array().cloned() else {
                return Err(GpuError::Unimplemented(format!(
                    "nested tuple element {i} of {}",
                    instr.name()
                )));
            };
            let mut kcx = build_kernel_prototype(&mut self.mcx, id)?;
            let pred = kcx.array_for(hlo, predicate, &[])?;
            let on_true = kcx.array_for(hlo, instr.operand(1), &[i])?;
            let on_false = kcx.array_for(hlo, instr.operand(2), &[i])?;
            let output = kcx.array_for(hlo, id, &[i])?;
            if i + 1 == count {
                emit_tuple_pointer_table(&mut kcx, hlo, id)?;
            }
            let geometry = LoopGeometry::for_instruction(&self.mcx, id, &shape, Some(1));
            let mut body = |_: &mut ModuleContext<'_>, b: &mut Builder, index: &IrIndex| -> GpuResult<()> {
                let origin = IrIndex::constant(b, &[], pred.shape(), index.index_type());
                let condition = pred.emit_read(b, &origin);
                let a = on_true.emit_read(b, &output_index(index, on_true.shape()));
                let c = on_false.emit_read(b, &output_index(index, on_false.shape()));
                let value = b.select(condition, a, c);
                output.emit_write(b, &output_index(index, output.shape()), value);
                Ok(())
            };
            emit_parallel_loop(&mut self.mcx, &mut kcx.builder, &shape, &geometry, &mut body)?;
            let info = self.mcx.thunk_info(id);
            thunks.push(kcx.into_thunk(&mut self.mcx, info, geometry.launch));
        }
        Ok(sequence_or_single(self.mcx.thunk_info(id), thunks))
    }

    // ========================================================================
    // Fusions
    // ========================================================================

    fn emit_fusion(&mut self, id: InstrId, kind: FusionKind) -> GpuResult<Thunk> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        let root = hlo
            .fused_root(id)
            .ok_or_else(|| GpuError::Internal(format!("{} has no fused computation", instr.name())))?;
        let root_instr = hlo.instr(root);
        debug!(instruction = instr.name(), ?kind, root = root_instr.opcode().name(), "fusion");

        if can_update_fusion_in_place(&self.mcx, id) {
            let update = root_instr.operand(1);
            debug!(instruction = instr.name(), update = hlo.instr(update).name(), "in-place update fusion");
            return emit_update_in_place(&mut self.mcx, id, root);
        }

        if kind == FusionKind::Loop {
            if let Some(thunk) = check_and_emit_021_transpose(&mut self.mcx, id)? {
                return Ok(thunk);
            }
            return emit_loop_kernel(&mut self.mcx, id, None);
        }

        match root_instr.opcode() {
            Opcode::Scatter { .. } => emit_fused_scatter(&mut self.mcx, id),
            Opcode::Slice { .. } => self.emit_slice_input_fusion(id),
            Opcode::Tuple => {
                let all_slices = root_instr
                    .operands()
                    .iter()
                    .all(|&operand| matches!(hlo.instr(operand).opcode(), Opcode::Slice { .. }));
                if all_slices {
                    self.emit_slice_input_fusion(id)
                } else if self.has_contiguous_reduction(root_instr.operands()) {
                    emit_reduction(&mut self.mcx, id)
                } else {
                    emit_loop_kernel(&mut self.mcx, id, None)
                }
            }
            Opcode::Reduce { .. } => {
                if root_instr.shape().is_tuple() {
                    return Err(GpuError::Unimplemented(
                        "Vectorized variadic reduce is not supported on GPU".to_string(),
                    ));
                }
                if self.has_contiguous_reduction(&[root]) {
                    emit_reduction(&mut self.mcx, id)
                } else {
                    emit_loop_kernel(&mut self.mcx, id, None)
                }
            }
            other => Err(GpuError::Internal(format!(
                "Bad opcode for input fusion: {}",
                other.name()
            ))),
        }
    }

    fn has_contiguous_reduction(&self, outputs: &[InstrId]) -> bool {
        let hlo = self.mcx.hlo;
        outputs
            .iter()
            .any(|&output| is_reduction_from_or_to_contiguous_dimensions(hlo, hlo.instr(output)))
    }

    /// An input fusion whose root slices all read one shape: every thread
    /// takes one input element and writes it to each slice containing it.
    fn emit_slice_input_fusion(&mut self, id: InstrId) -> GpuResult<Thunk> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        let root = hlo
            .fused_root(id)
            .ok_or_else(|| GpuError::Internal(format!("{} has no fused computation", instr.name())))?;
        let slices: Vec<InstrId> = match hlo.instr(root).opcode() {
            Opcode::Tuple => hlo.instr(root).operands().to_vec(),
            _ => vec![root],
        };

        let mut starts: Vec<SmallVec<[i64; 4]>> = Vec::with_capacity(slices.len());
        let mut limits: Vec<SmallVec<[i64; 4]>> = Vec::with_capacity(slices.len());
        let mut input_shape: Option<ArrayShape> = None;
        for &slice in &slices {
            let Opcode::Slice {
                starts: s,
                limits: l,
                strides,
            } = hlo.instr(slice).opcode()
            else {
                return Err(unsupported_slice_root());
            };
            if strides.iter().any(|&stride| stride != 1) {
                return Err(unsupported_slice_root());
            }
            let operand_shape = hlo.operand(slice, 0).shape().array_shape()?;
            match &input_shape {
                None => input_shape = Some(operand_shape.clone()),
                Some(shape) if shape.same_dimensions(operand_shape) => {}
                Some(_) => {
                    return Err(GpuError::FailedPrecondition(format!(
                        "Fused slices do not have the same input shape, fused computation = {}.",
                        hlo.computation(hlo.instr(root).parent()).name()
                    )));
                }
            }
            starts.push(s.iter().copied().collect());
            limits.push(l.iter().copied().collect());
        }
        let Some(input_shape) = input_shape else {
            return Err(unsupported_slice_root());
        };
        let input_shape = input_shape.with_element_type(PrimitiveType::Pred);

        let mut kcx = build_kernel_prototype(&mut self.mcx, id)?;
        let outputs = kcx.output_arrays(hlo, id)?;
        let mut elemental = Elemental::new();
        kcx.bind_inputs(hlo, id, &mut elemental)?;
        emit_tuple_pointer_table(&mut kcx, hlo, id)?;
        let geometry = LoopGeometry::for_instruction(&self.mcx, id, &input_shape, Some(1));
        debug!(instruction = instr.name(), slices = slices.len(), launch = %geometry.launch, "slice input fusion");

        let mut body = |mcx: &mut ModuleContext<'_>, b: &mut Builder, index: &IrIndex| -> GpuResult<()> {
            for (i, &slice) in slices.iter().enumerate() {
                let mut inside = b.pred(true);
                for dim in 0..index.rank() {
                    let above = b.cmp_imm(CmpOp::Ge, index.get(dim), starts[i][dim]);
                    let below = b.cmp_imm(CmpOp::Lt, index.get(dim), limits[i][dim]);
                    let within = b.and(above, below);
                    inside = b.and(inside, within);
                }
                let operand = hlo.instr(slice).operand(0);
                b.if_then(inside, |b| -> GpuResult<()> {
                    let value = elemental.generate(mcx, b, operand, index)?;
                    let coords: SmallVec<[ValueId; 4]> = (0..index.rank())
                        .map(|dim| b.binary_imm(kgen_kir::BinOp::Sub, index.get(dim), starts[i][dim]))
                        .collect();
                    let target = IrIndex::new(coords, outputs[i].shape(), index.index_type());
                    outputs[i].emit_write(b, &target, value);
                    Ok(())
                })?;
            }
            Ok(())
        };
        emit_parallel_loop(&mut self.mcx, &mut kcx.builder, &input_shape, &geometry, &mut body)?;
        let info = self.mcx.thunk_info(id);
        Ok(kcx.into_thunk(&mut self.mcx, info, geometry.launch))
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    fn emit_while(&mut self, id: InstrId) -> GpuResult<Thunk> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        let Opcode::While {
            condition,
            body,
            known_trip_count,
        } = instr.opcode()
        else {
            return Err(GpuError::Internal(format!("{} is not a while", instr.name())));
        };
        let condition_root = hlo.computation(*condition).root();
        let condition_shape = hlo.instr(condition_root).shape();
        let is_pred_scalar = condition_shape
            .as_array()
            .is_some_and(|s| s.is_scalar() && s.element_type() == PrimitiveType::Pred);
        if !is_pred_scalar {
            return Err(GpuError::Internal(format!(
                "While condition computation must return bool; got: {condition_shape:?}"
            )));
        }
        self.check_while_buffers_share_allocation(id, *condition, *body)?;

        let info = self.mcx.thunk_info(id);
        if let Some(trip_count) = known_trip_count {
            debug!(instruction = instr.name(), trip_count, "while with known trip count");
            let body = self.emit_computation(*body)?;
            return Ok(Thunk::For {
                info,
                loop_limit: *trip_count,
                body,
            });
        }
        let condition_result = self.mcx.slice(condition_root, &[])?;
        let condition = self.emit_computation(*condition)?;
        let body = self.emit_computation(*body)?;
        Ok(Thunk::While {
            info,
            condition_result,
            condition,
            body,
        })
    }

    /// Every subshape of the loop value lives in one place: the while, its
    /// operand, both parameters and the body root.
    fn check_while_buffers_share_allocation(&self, id: InstrId, condition: CompId, body: CompId) -> GpuResult<()> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        let others = [
            instr.operand(0),
            hlo.computation(condition).parameter(0),
            hlo.computation(body).parameter(0),
            hlo.computation(body).root(),
        ];
        for (index, _) in instr.shape().subshapes() {
            for &other in &others {
                self.check_shared(id, other, &index)?;
            }
        }
        Ok(())
    }

    fn check_shared(&self, a: InstrId, b: InstrId, index: &[usize]) -> GpuResult<()> {
        let slice_a = self.mcx.slice(a, index)?;
        let slice_b = self.mcx.slice(b, index)?;
        if slice_a != slice_b {
            let hlo = self.mcx.hlo;
            return Err(GpuError::Internal(format!(
                "instruction {} {} does not share allocation with instruction {} {}",
                hlo.instr(a).name(),
                slice_a,
                hlo.instr(b).name(),
                slice_b
            )));
        }
        Ok(())
    }

    fn emit_conditional(&mut self, id: InstrId) -> GpuResult<Thunk> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        let Opcode::Conditional { branches } = instr.opcode() else {
            return Err(GpuError::Internal(format!("{} is not a conditional", instr.name())));
        };
        let selector = instr.operand(0);
        let branch_index_is_bool = hlo.instr(selector).shape().as_array().map(ArrayShape::element_type)
            == Some(PrimitiveType::Pred);

        for (b, &branch) in branches.iter().enumerate() {
            let computation = hlo.computation(branch);
            let operand = instr.operand(b + 1);
            for (index, _) in hlo.instr(operand).shape().subshapes() {
                self.check_shared(computation.parameter(0), operand, &index)?;
            }
            for (index, _) in instr.shape().subshapes() {
                self.check_shared(computation.root(), id, &index)?;
            }
        }

        let info = self.mcx.thunk_info(id);
        let branch_index = self.mcx.slice(selector, &[])?;
        let mut branch_thunks = Vec::with_capacity(branches.len());
        for &branch in branches {
            branch_thunks.push(self.emit_computation(branch)?);
        }
        debug!(
            instruction = instr.name(),
            branches = branches.len(),
            branch_index_is_bool,
            "conditional"
        );
        Ok(Thunk::Conditional {
            info,
            branch_index,
            branch_index_is_bool,
            branches: branch_thunks,
        })
    }

    // ========================================================================
    // Collectives
    // ========================================================================

    /// On one replica an all-reduce is the identity: copy each operand to
    /// its output.
    fn emit_all_reduce(&mut self, id: InstrId, to_apply: CompId) -> GpuResult<Option<Thunk>> {
        let hlo = self.mcx.hlo;
        let instr = hlo.instr(id);
        let multi = instr.operands().len() > 1;
        let mut buffers = Vec::with_capacity(instr.operands().len());
        for (i, &operand) in instr.operands().iter().enumerate() {
            let index: &[usize] = if multi { &[i] } else { &[] };
            buffers.push((self.mcx.slice(operand, &[])?, self.mcx.slice(id, index)?));
        }
        let info = self.mcx.thunk_info(id);

        let replica_count = self.mcx.config.replica_count;
        if replica_count > 1 {
            let Some(reducer) = hlo.as_binary_reducer(to_apply) else {
                return Err(GpuError::Unimplemented(format!(
                    "AllReduce {} with a combiner that is not a single binary op is not implemented on GPU",
                    instr.name()
                )));
            };
            return Ok(Some(Thunk::AllReduce {
                info,
                reducer,
                buffers,
                replica_count,
            }));
        }

        let mut thunks: Vec<Thunk> = buffers
            .into_iter()
            .filter(|(source, destination)| source != destination)
            .map(|(source, destination)| Thunk::Copy {
                info: info.clone(),
                source,
                destination,
            })
            .collect();
        if multi {
            let elements = (0..instr.operands().len())
                .map(|i| self.mcx.slice(id, &[i]))
                .collect::<GpuResult<Vec<_>>>()?;
            thunks.push(Thunk::Tuple {
                info: info.clone(),
                elements,
                destination: self.mcx.slice(id, &[])?,
            });
        }
        Ok(sequence_or_single(info, thunks))
    }
}

fn unsupported_slice_root() -> GpuError {
    GpuError::FailedPrecondition(
        "Unsupported root for slice input fusion. Only non-strided slices are supported.".to_string(),
    )
}
