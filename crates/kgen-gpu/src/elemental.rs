//! Per-element value generation.
//!
//! [`Elemental::generate`] emits the code computing one element of an
//! instruction at a given index, recursing into operands. Parameters (and
//! anything else a kernel has already materialized) are resolved through
//! bindings: either a buffer to read from or a register holding the value.

use crate::context::ModuleContext;
use crate::ir_array::{ArrayShapeExt, IrArray, IrIndex};
use crate::{GpuError, GpuResult};
use kgen_hlo::{
    ArrayShape, BinaryOp, ComparisonDirection, HloInstruction, InstrId, Opcode, UnaryOp,
};
use kgen_kir::{AddressSpace, BinOp, Builder, CmpOp, Scalar, ScalarType, UnOp, ValueId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// How a bound instruction is read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Bound {
    /// Read the element from a buffer.
    Array(IrArray),
    /// Every element is this register.
    Value(ValueId),
}

/// Element generator for one kernel or function.
#[derive(Clone, Debug, Default)]
pub struct Elemental {
    bindings: FxHashMap<InstrId, Bound>,
}

impl Elemental {
    /// A generator with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `instr` from `array`.
    pub fn bind_array(&mut self, instr: InstrId, array: IrArray) {
        self.bindings.insert(instr, Bound::Array(array));
    }

    /// Use `value` for every element of `instr`.
    pub fn bind_value(&mut self, instr: InstrId, value: ValueId) {
        self.bindings.insert(instr, Bound::Value(value));
    }

    /// The binding of `instr`, if any.
    #[must_use]
    pub fn binding(&self, instr: InstrId) -> Option<&Bound> {
        self.bindings.get(&instr)
    }

    /// Emit the element of `id` at `index`.
    pub fn generate(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        id: InstrId,
        index: &IrIndex,
    ) -> GpuResult<ValueId> {
        match self.bindings.get(&id) {
            Some(Bound::Array(array)) => return Ok(array.emit_read(b, index)),
            Some(Bound::Value(value)) => return Ok(*value),
            None => {}
        }

        let hlo = mcx.hlo;
        let instr = hlo.instr(id);
        match instr.opcode() {
            Opcode::Parameter { number } => Err(GpuError::Internal(format!(
                "parameter {number} ({}) has no binding",
                instr.name()
            ))),
            Opcode::Constant(literal) => {
                let shape = literal.shape();
                if shape.num_elements() == 1 {
                    let value = Scalar::from_le_bytes(shape.scalar_type(), literal.data());
                    return Ok(b.constant(value));
                }
                let global = mcx.constant_global(id)?;
                let base = b.global_addr(global);
                Ok(IrArray::new(base, shape.clone()).emit_read(b, index))
            }
            Opcode::Iota { dimension } => {
                let coord = index.get(*dimension);
                Ok(b.cast(coord, array_shape(instr)?.scalar_type()))
            }
            Opcode::Unary(op) => {
                let x = self.operand(mcx, b, instr, 0, index)?;
                Ok(b.unary(unary_op(*op), x))
            }
            Opcode::Binary(op) => {
                let lhs = self.operand(mcx, b, instr, 0, index)?;
                let rhs = self.operand(mcx, b, instr, 1, index)?;
                Ok(b.binary(binary_op(*op), lhs, rhs))
            }
            Opcode::Compare(direction) => {
                let lhs = self.operand(mcx, b, instr, 0, index)?;
                let rhs = self.operand(mcx, b, instr, 1, index)?;
                Ok(b.cmp(compare_op(*direction), lhs, rhs))
            }
            Opcode::Select => {
                let pred = self.operand(mcx, b, instr, 0, index)?;
                let on_true = self.operand(mcx, b, instr, 1, index)?;
                let on_false = self.operand(mcx, b, instr, 2, index)?;
                Ok(b.select(pred, on_true, on_false))
            }
            Opcode::Clamp => {
                let lo = self.operand(mcx, b, instr, 0, index)?;
                let x = self.operand(mcx, b, instr, 1, index)?;
                let hi = self.operand(mcx, b, instr, 2, index)?;
                let low_bounded = b.binary(BinOp::Max, x, lo);
                Ok(b.min(low_bounded, hi))
            }
            Opcode::Convert | Opcode::Copy => {
                let x = self.operand(mcx, b, instr, 0, index)?;
                Ok(b.cast(x, array_shape(instr)?.scalar_type()))
            }
            Opcode::Map { to_apply } => {
                let mut args = Vec::with_capacity(instr.operands().len());
                for i in 0..instr.operands().len() {
                    args.push(self.operand(mcx, b, instr, i, index)?);
                }
                let func = mcx.function_for(*to_apply)?;
                let types = mcx.function_result_types(*to_apply)?;
                first_result(b.call(func, &args, &types), instr)
            }
            Opcode::Broadcast { dimensions } => {
                let operand = hlo.instr(instr.operand(0));
                let operand_shape = array_shape(operand)?;
                let coords: SmallVec<[ValueId; 4]> =
                    dimensions.iter().map(|&d| index.get(d)).collect();
                let operand_index = IrIndex::new(coords, operand_shape, index.index_type());
                self.generate(mcx, b, operand.id(), &operand_index)
            }
            Opcode::Reshape => {
                let operand = hlo.instr(instr.operand(0));
                let operand_shape = array_shape(operand)?;
                let operand_index = reshape_source_index(b, index, operand_shape);
                self.generate(mcx, b, operand.id(), &operand_index)
            }
            Opcode::Bitcast => {
                let operand = hlo.instr(instr.operand(0));
                let operand_shape = array_shape(operand)?;
                let linear = index.linearize(b, array_shape(instr)?);
                let operand_index = IrIndex::from_linear(b, linear, operand_shape);
                self.generate(mcx, b, operand.id(), &operand_index)
            }
            Opcode::Transpose { dimensions } => {
                let operand = hlo.instr(instr.operand(0));
                let operand_shape = array_shape(operand)?;
                let zero = b.int(index.index_type(), 0);
                let mut coords: SmallVec<[ValueId; 4]> = SmallVec::from_elem(zero, dimensions.len());
                for (i, &d) in dimensions.iter().enumerate() {
                    coords[d] = index.get(i);
                }
                let operand_index = IrIndex::new(coords, operand_shape, index.index_type());
                self.generate(mcx, b, operand.id(), &operand_index)
            }
            Opcode::Slice {
                starts, strides, ..
            } => {
                let operand = hlo.instr(instr.operand(0));
                let operand_shape = array_shape(operand)?;
                let mut coords: SmallVec<[ValueId; 4]> = SmallVec::new();
                for (dim, &coord) in index.multidim().iter().enumerate() {
                    let strided = if strides[dim] == 1 {
                        coord
                    } else {
                        b.binary_imm(BinOp::Mul, coord, strides[dim])
                    };
                    coords.push(if starts[dim] == 0 {
                        strided
                    } else {
                        b.binary_imm(BinOp::Add, strided, starts[dim])
                    });
                }
                let operand_index = IrIndex::new(coords, operand_shape, index.index_type());
                self.generate(mcx, b, operand.id(), &operand_index)
            }
            Opcode::DynamicSlice { slice_sizes } => {
                let operand = hlo.instr(instr.operand(0));
                let operand_shape = array_shape(operand)?;
                let limits: SmallVec<[i64; 4]> = slice_sizes
                    .iter()
                    .enumerate()
                    .map(|(dim, &size)| operand_shape.dim(dim) - size)
                    .collect();
                let starts = self.dynamic_starts(mcx, b, &instr.operands()[1..], &limits, index.index_type())?;
                let coords: SmallVec<[ValueId; 4]> = index
                    .multidim()
                    .iter()
                    .zip(&starts)
                    .map(|(&coord, &start)| b.add(coord, start))
                    .collect();
                let operand_index = IrIndex::new(coords, operand_shape, index.index_type());
                self.generate(mcx, b, operand.id(), &operand_index)
            }
            Opcode::DynamicUpdateSlice => self.dynamic_update_slice(mcx, b, instr, index),
            Opcode::Concatenate { dimension } => self.concatenate(mcx, b, instr, *dimension, index),
            Opcode::Reduce { .. } => {
                let values = self.reduce(mcx, b, instr, index)?;
                if instr.shape().is_tuple() {
                    return Err(GpuError::Internal(format!(
                        "variadic reduce {} read without get-tuple-element",
                        instr.name()
                    )));
                }
                first_result(values, instr)
            }
            Opcode::GetTupleElement { index: element } => {
                let values = self.generate_multi(mcx, b, instr.operand(0), index)?;
                values.get(*element).copied().ok_or_else(|| {
                    GpuError::Internal(format!(
                        "{} reads element {element} of a {}-tuple",
                        instr.name(),
                        values.len()
                    ))
                })
            }
            Opcode::GetDimensionSize { dimension } => {
                let operand = hlo.instr(instr.operand(0));
                let operand_shape = array_shape(operand)?;
                if let (true, Some(Bound::Array(array))) = (operand_shape.is_dynamic(), self.bindings.get(&operand.id())) {
                    return Ok(read_dynamic_size(b, array, *dimension));
                }
                Ok(b.int(ScalarType::S32, operand_shape.dim(*dimension)))
            }
            Opcode::TupleSelect => Err(GpuError::Unimplemented(format!(
                "tuple-select {} in elemental code",
                instr.name()
            ))),
            Opcode::Tuple
            | Opcode::Fusion { .. }
            | Opcode::Scatter { .. }
            | Opcode::SelectAndScatter { .. }
            | Opcode::Sort { .. }
            | Opcode::While { .. }
            | Opcode::Conditional { .. }
            | Opcode::AllReduce { .. }
            | Opcode::CollectivePermute { .. }
            | Opcode::CustomCall { .. }
            | Opcode::ReplicaId
            | Opcode::AfterAll
            | Opcode::Rng => Err(GpuError::Unimplemented(format!(
                "unhandled opcode {} for elemental code ({})",
                instr.opcode().name(),
                instr.name()
            ))),
        }
    }

    /// Emit every element value of a tuple-shaped `id` at `index`.
    pub fn generate_multi(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        id: InstrId,
        index: &IrIndex,
    ) -> GpuResult<Vec<ValueId>> {
        let hlo = mcx.hlo;
        let instr = hlo.instr(id);
        match instr.opcode() {
            Opcode::Reduce { .. } => self.reduce(mcx, b, instr, index),
            Opcode::Tuple => {
                let mut values = Vec::with_capacity(instr.operands().len());
                for &operand in instr.operands() {
                    values.push(self.generate(mcx, b, operand, index)?);
                }
                Ok(values)
            }
            _ => Err(GpuError::Unimplemented(format!(
                "tuple-valued {} ({}) in elemental code",
                instr.opcode().name(),
                instr.name()
            ))),
        }
    }

    fn operand(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        instr: &HloInstruction,
        i: usize,
        index: &IrIndex,
    ) -> GpuResult<ValueId> {
        let hlo = mcx.hlo;
        let operand = hlo.instr(instr.operand(i));
        let shape = array_shape(operand)?;
        if shape.rank() == 0 && index.rank() != 0 {
            let scalar = IrIndex::new([], shape, index.index_type());
            return self.generate(mcx, b, operand.id(), &scalar);
        }
        self.generate(mcx, b, operand.id(), index)
    }

    /// Runtime start of each dimension, read from the scalar `starts` and
    /// clamped to `[0, limits[dim]]`.
    pub fn dynamic_starts(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        starts: &[InstrId],
        limits: &[i64],
        index_type: ScalarType,
    ) -> GpuResult<SmallVec<[ValueId; 4]>> {
        let hlo = mcx.hlo;
        let mut out = SmallVec::with_capacity(starts.len());
        for (&start, &limit) in starts.iter().zip(limits) {
            let shape = array_shape(hlo.instr(start))?;
            let scalar = IrIndex::new([], shape, index_type);
            let value = self.generate(mcx, b, start, &scalar)?;
            let value = b.cast(value, index_type);
            let zero = b.int(index_type, 0);
            let above = b.binary(BinOp::Max, value, zero);
            let limit = b.int(index_type, limit.max(0));
            out.push(b.min(above, limit));
        }
        Ok(out)
    }

    /// The operand's element, or the update's where the clamped window
    /// covers `index`.
    fn dynamic_update_slice(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        instr: &HloInstruction,
        index: &IrIndex,
    ) -> GpuResult<ValueId> {
        let hlo = mcx.hlo;
        let shape = array_shape(instr)?;
        let update = hlo.instr(instr.operand(1));
        let update_shape = array_shape(update)?;
        let limits: SmallVec<[i64; 4]> = (0..shape.rank())
            .map(|dim| shape.dim(dim) - update_shape.dim(dim))
            .collect();
        let starts = self.dynamic_starts(mcx, b, &instr.operands()[2..], &limits, index.index_type())?;

        let cell = b.alloc_local(format!("{}_value", crate::context::sanitize(instr.name())), shape.scalar_type(), 1);
        let original = self.operand(mcx, b, instr, 0, index)?;
        b.store_local(cell, 0, original);
        let mut inside = b.pred(true);
        let mut coords: SmallVec<[ValueId; 4]> = SmallVec::with_capacity(shape.rank());
        for (dim, &start) in starts.iter().enumerate() {
            let local = b.sub(index.get(dim), start);
            let above = b.cmp_imm(CmpOp::Ge, local, 0);
            let below = b.cmp_imm(CmpOp::Lt, local, update_shape.dim(dim));
            let within = b.and(above, below);
            inside = b.and(inside, within);
            coords.push(local);
        }
        b.if_then(inside, |b| {
            let update_index = IrIndex::new(coords, update_shape, index.index_type());
            let value = self.generate(mcx, b, update.id(), &update_index)?;
            b.store_local(cell, 0, value);
            Ok::<_, GpuError>(())
        })?;
        Ok(b.load_local(cell, 0))
    }

    fn concatenate(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        instr: &HloInstruction,
        dimension: usize,
        index: &IrIndex,
    ) -> GpuResult<ValueId> {
        let hlo = mcx.hlo;
        let ty = array_shape(instr)?.scalar_type();
        let cell = b.alloc_local(format!("{}_value", crate::context::sanitize(instr.name())), ty, 1);
        let coord = index.get(dimension);
        let mut offset = 0_i64;
        for &operand in instr.operands() {
            let operand_shape = array_shape(hlo.instr(operand))?;
            let extent = operand_shape.dim(dimension);
            let lo = b.cmp_imm(CmpOp::Ge, coord, offset);
            let hi = b.cmp_imm(CmpOp::Lt, coord, offset + extent);
            let inside = b.and(lo, hi);
            let start = offset;
            b.if_then(inside, |b| {
                let local = b.binary_imm(BinOp::Sub, coord, start);
                let mut coords: SmallVec<[ValueId; 4]> = index.multidim().iter().copied().collect();
                coords[dimension] = local;
                let operand_index = IrIndex::new(coords, operand_shape, index.index_type());
                let value = self.generate(mcx, b, operand, &operand_index)?;
                b.store_local(cell, 0, value);
                Ok::<_, GpuError>(())
            })?;
            offset += extent;
        }
        Ok(b.load_local(cell, 0))
    }

    /// Sequential fold of one output element: the reduced dimensions are
    /// walked major to minor in the input's physical order.
    fn reduce(
        &self,
        mcx: &mut ModuleContext<'_>,
        b: &mut Builder,
        instr: &HloInstruction,
        index: &IrIndex,
    ) -> GpuResult<Vec<ValueId>> {
        let Opcode::Reduce {
            dimensions,
            to_apply,
        } = instr.opcode()
        else {
            return Err(GpuError::Internal(format!("{} is not a reduce", instr.name())));
        };
        let hlo = mcx.hlo;
        let count = instr.operands().len() / 2;
        let input_shape = array_shape(hlo.instr(instr.operand(0)))?.clone();
        let ty = index.index_type();
        let name = crate::context::sanitize(instr.name());

        let mut cells = Vec::with_capacity(count);
        for k in 0..count {
            let init_id = instr.operand(count + k);
            let init_shape = array_shape(hlo.instr(init_id))?;
            let scalar = IrIndex::new([], init_shape, ty);
            let init = self.generate(mcx, b, init_id, &scalar)?;
            let cell = b.alloc_local(format!("{name}_acc{k}"), init_shape.scalar_type(), 1);
            b.store_local(cell, 0, init);
            cells.push(cell);
        }

        let zero = b.int(ty, 0);
        let mut coords: SmallVec<[ValueId; 4]> = SmallVec::from_elem(zero, input_shape.rank());
        let mut kept = 0;
        for (dim, coord) in coords.iter_mut().enumerate() {
            if !dimensions.contains(&dim) {
                *coord = index.get(kept);
                kept += 1;
            }
        }
        let loop_dims: SmallVec<[usize; 4]> = input_shape
            .layout()
            .major_to_minor()
            .iter()
            .copied()
            .filter(|d| dimensions.contains(d))
            .collect();

        let func = mcx.function_for(*to_apply)?;
        let result_types = mcx.function_result_types(*to_apply)?;
        let mut body = |mcx: &mut ModuleContext<'_>, b: &mut Builder, coords: &[ValueId]| -> GpuResult<()> {
            let input_index = IrIndex::new(coords.iter().copied(), &input_shape, ty);
            let mut args = Vec::with_capacity(2 * count);
            for &cell in &cells {
                args.push(b.load_local(cell, 0));
            }
            for k in 0..count {
                args.push(self.generate(mcx, b, instr.operand(k), &input_index)?);
            }
            let results = b.call(func, &args, &result_types);
            for (&cell, &value) in cells.iter().zip(&results) {
                b.store_local(cell, 0, value);
            }
            Ok(())
        };
        emit_loop_nest(mcx, b, &input_shape, &loop_dims, &mut coords, &mut body)?;

        Ok(cells.iter().map(|&cell| b.load_local(cell, 0)).collect())
    }
}

type NestBody<'f, 'm> = dyn FnMut(&mut ModuleContext<'m>, &mut Builder, &[ValueId]) -> GpuResult<()> + 'f;

/// Nested loops over `dims` of `shape`, outermost first, writing each
/// induction variable into `coords`.
pub fn emit_loop_nest<'m>(
    mcx: &mut ModuleContext<'m>,
    b: &mut Builder,
    shape: &ArrayShape,
    dims: &[usize],
    coords: &mut SmallVec<[ValueId; 4]>,
    body: &mut NestBody<'_, 'm>,
) -> GpuResult<()> {
    let Some((&dim, rest)) = dims.split_first() else {
        return body(mcx, b, coords);
    };
    let ty = b.value_type(coords[dim]);
    b.for_range(ty, shape.dim(dim), |b, iv| {
        coords[dim] = iv;
        emit_loop_nest(mcx, b, shape, rest, coords, body)
    })
}

/// The operand index read by a row-major reshape to `index`.
pub fn reshape_source_index(b: &mut Builder, index: &IrIndex, operand_shape: &ArrayShape) -> IrIndex {
    if index.shape().dims() == operand_shape.dims() {
        return index.with_shape(operand_shape);
    }
    let linear = index.linearize_row_major(b);
    let descending = operand_shape.with_layout_descending();
    IrIndex::from_linear(b, linear, &descending).with_shape(operand_shape)
}

fn first_result(values: Vec<ValueId>, instr: &HloInstruction) -> GpuResult<ValueId> {
    values.first().copied().ok_or_else(|| {
        GpuError::Internal(format!("{} produced no value", instr.name()))
    })
}

/// The runtime size of `dim` stored after the data of a dynamic array.
pub fn read_dynamic_size(b: &mut Builder, array: &IrArray, dim: usize) -> ValueId {
    let offset = array.shape().data_byte_size() + 4 * dim as u64;
    let addr = b.byte_offset(array.base(), offset);
    b.load(AddressSpace::Global, ScalarType::S32, addr)
}

fn array_shape(instr: &HloInstruction) -> GpuResult<&ArrayShape> {
    Ok(instr.shape().array_shape()?)
}

/// The IR operation for an elementwise unary op.
#[must_use]
pub fn unary_op(op: UnaryOp) -> UnOp {
    match op {
        UnaryOp::Abs => UnOp::Abs,
        UnaryOp::Neg => UnOp::Neg,
        UnaryOp::Not => UnOp::Not,
        UnaryOp::Exp => UnOp::Exp,
        UnaryOp::Log => UnOp::Log,
        UnaryOp::Sqrt => UnOp::Sqrt,
        UnaryOp::Rsqrt => UnOp::Rsqrt,
        UnaryOp::Tanh => UnOp::Tanh,
        UnaryOp::Floor => UnOp::Floor,
        UnaryOp::Ceil => UnOp::Ceil,
        UnaryOp::Sign => UnOp::Sign,
        UnaryOp::Sin => UnOp::Sin,
        UnaryOp::Cos => UnOp::Cos,
    }
}

/// The IR operation for an elementwise binary op.
#[must_use]
pub fn binary_op(op: BinaryOp) -> BinOp {
    match op {
        BinaryOp::Add => BinOp::Add,
        BinaryOp::Subtract => BinOp::Sub,
        BinaryOp::Multiply => BinOp::Mul,
        BinaryOp::Divide => BinOp::Div,
        BinaryOp::Remainder => BinOp::Rem,
        BinaryOp::Maximum => BinOp::Max,
        BinaryOp::Minimum => BinOp::Min,
        BinaryOp::Power => BinOp::Pow,
        BinaryOp::Atan2 => BinOp::Atan2,
        BinaryOp::And => BinOp::And,
        BinaryOp::Or => BinOp::Or,
        BinaryOp::Xor => BinOp::Xor,
    }
}

/// The IR comparison for a comparison direction.
#[must_use]
pub fn compare_op(direction: ComparisonDirection) -> CmpOp {
    match direction {
        ComparisonDirection::Eq => CmpOp::Eq,
        ComparisonDirection::Ne => CmpOp::Ne,
        ComparisonDirection::Lt => CmpOp::Lt,
        ComparisonDirection::Le => CmpOp::Le,
        ComparisonDirection::Gt => CmpOp::Gt,
        ComparisonDirection::Ge => CmpOp::Ge,
    }
}
