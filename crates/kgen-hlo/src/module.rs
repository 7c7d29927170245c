//! Modules, computations and the graph builder.

use crate::instruction::{
    BinaryOp, ComparisonDirection, FusionKind, HloInstruction, Opcode, ScatterDimensionNumbers,
    UnaryOp, Window,
};
use crate::literal::Literal;
use crate::shape::{ArrayShape, DimVec, PrimitiveType, Shape};
use crate::{CompId, HloError, HloResult, InstrId};
use kgen_index::{Idx, IndexVec};
use serde::{Deserialize, Serialize};

/// A DAG of instructions with parameters and a root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HloComputation {
    id: CompId,
    name: String,
    instructions: Vec<InstrId>,
    parameters: Vec<InstrId>,
    root: InstrId,
    fusion_instruction: Option<InstrId>,
}

impl HloComputation {
    /// This computation's id.
    #[must_use]
    pub fn id(&self) -> CompId {
        self.id
    }

    /// Name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instructions in post order (operands before users).
    #[must_use]
    pub fn instructions(&self) -> &[InstrId] {
        &self.instructions
    }

    /// Parameters ordered by parameter number.
    #[must_use]
    pub fn parameters(&self) -> &[InstrId] {
        &self.parameters
    }

    /// Parameter `number`.
    #[must_use]
    pub fn parameter(&self, number: usize) -> InstrId {
        self.parameters[number]
    }

    /// The root instruction.
    #[must_use]
    pub fn root(&self) -> InstrId {
        self.root
    }

    /// The fusion instruction this computation is the body of, if any.
    #[must_use]
    pub fn fusion_instruction(&self) -> Option<InstrId> {
        self.fusion_instruction
    }
}

/// A complete program.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HloModule {
    name: String,
    instructions: IndexVec<InstrId, HloInstruction>,
    computations: IndexVec<CompId, HloComputation>,
    entry: Option<CompId>,
}

impl HloModule {
    /// An empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: IndexVec::new(),
            computations: IndexVec::new(),
            entry: None,
        }
    }

    /// Module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start building a new computation.
    pub fn builder(&mut self, name: impl Into<String>) -> ComputationBuilder<'_> {
        let comp = self.computations.next_index();
        ComputationBuilder {
            module: self,
            comp,
            name: name.into(),
            instructions: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Mark a computation as the entry.
    pub fn set_entry(&mut self, comp: CompId) {
        self.entry = Some(comp);
    }

    /// The entry computation id.
    pub fn entry(&self) -> HloResult<CompId> {
        self.entry.ok_or_else(|| HloError::NoEntry(self.name.clone()))
    }

    /// The entry computation.
    pub fn entry_computation(&self) -> HloResult<&HloComputation> {
        Ok(&self.computations[self.entry()?])
    }

    /// Look up an instruction.
    #[must_use]
    pub fn instr(&self, id: InstrId) -> &HloInstruction {
        &self.instructions[id]
    }

    /// Look up a computation.
    #[must_use]
    pub fn computation(&self, id: CompId) -> &HloComputation {
        &self.computations[id]
    }

    /// All computations.
    pub fn computations(&self) -> impl Iterator<Item = &HloComputation> {
        self.computations.iter()
    }

    /// The `i`-th operand of `id`.
    #[must_use]
    pub fn operand(&self, id: InstrId, i: usize) -> &HloInstruction {
        &self.instructions[self.instructions[id].operand(i)]
    }

    /// Root of the computation fused into `fusion`.
    pub fn fused_root(&self, fusion: InstrId) -> Option<InstrId> {
        self.instr(fusion)
            .fused_computation()
            .map(|c| self.computation(c).root())
    }

    /// Fused parameters of `fusion`, by parameter number.
    #[must_use]
    pub fn fused_parameters(&self, fusion: InstrId) -> &[InstrId] {
        match self.instr(fusion).fused_computation() {
            Some(c) => self.computation(c).parameters(),
            None => &[],
        }
    }

    /// Returns true for a fusion whose root is a tuple.
    #[must_use]
    pub fn is_multi_output_fusion(&self, id: InstrId) -> bool {
        self.fused_root(id)
            .is_some_and(|root| matches!(self.instr(root).opcode(), Opcode::Tuple))
    }

    /// For a parameter of a fused computation, the fusion operand feeding it.
    #[must_use]
    pub fn fusion_operand_for_parameter(&self, param: InstrId) -> Option<InstrId> {
        let instr = self.instr(param);
        let Opcode::Parameter { number } = instr.opcode() else {
            return None;
        };
        let fusion = self.computation(instr.parent()).fusion_instruction()?;
        self.instr(fusion).operands().get(*number).copied()
    }

    /// Scalar computations such as `add(p0, p1)` whose root is one binary
    /// op over the two parameters.
    #[must_use]
    pub fn as_binary_reducer(&self, comp: CompId) -> Option<BinaryOp> {
        let computation = self.computation(comp);
        if computation.parameters().len() != 2 {
            return None;
        }
        let root = self.instr(computation.root());
        let Opcode::Binary(op) = root.opcode() else {
            return None;
        };
        let params = computation.parameters();
        let operands = root.operands();
        let direct = operands == [params[0], params[1]];
        let swapped = operands == [params[1], params[0]];
        (direct || swapped).then_some(*op)
    }
}

/// Incrementally builds one computation.
///
/// Operand computations (reducers, fused bodies) must be built first, since
/// a builder holds the module mutably until [`ComputationBuilder::build`].
pub struct ComputationBuilder<'m> {
    module: &'m mut HloModule,
    comp: CompId,
    name: String,
    instructions: Vec<InstrId>,
    parameters: Vec<(usize, InstrId)>,
}

impl<'m> ComputationBuilder<'m> {
    /// Add an instruction with an explicit opcode and shape.
    pub fn add(&mut self, opcode: Opcode, operands: &[InstrId], shape: Shape) -> InstrId {
        let id = self.module.instructions.next_index();
        let name = format!("{}.{}", opcode.name(), id.index());
        for &operand in operands {
            let users = &mut self.module.instructions[operand].users;
            if !users.contains(&id) {
                users.push(id);
            }
        }
        self.module.instructions.push(HloInstruction {
            id,
            name,
            opcode,
            operands: operands.to_vec(),
            users: Vec::new(),
            shape,
            parent: self.comp,
        });
        self.instructions.push(id);
        id
    }

    /// Rename an instruction.
    pub fn set_name(&mut self, id: InstrId, name: impl Into<String>) {
        self.module.instructions[id].name = name.into();
    }

    /// Shape of an instruction built so far.
    #[must_use]
    pub fn shape_of(&self, id: InstrId) -> &Shape {
        &self.module.instructions[id].shape
    }

    fn array_of(&self, id: InstrId) -> HloResult<ArrayShape> {
        self.shape_of(id).array_shape().cloned()
    }

    /// Parameter `number` with the given shape.
    pub fn parameter(&mut self, number: usize, shape: Shape) -> InstrId {
        let id = self.add(Opcode::Parameter { number }, &[], shape);
        self.set_name(id, format!("p{number}.{}", id.index()));
        self.parameters.push((number, id));
        id
    }

    /// Constant.
    pub fn constant(&mut self, literal: Literal) -> InstrId {
        let shape = Shape::Array(literal.shape().clone());
        self.add(Opcode::Constant(literal), &[], shape)
    }

    /// Iota along `dimension`.
    pub fn iota(&mut self, shape: ArrayShape, dimension: usize) -> InstrId {
        self.add(Opcode::Iota { dimension }, &[], Shape::Array(shape))
    }

    /// Elementwise unary.
    pub fn unary(&mut self, op: UnaryOp, x: InstrId) -> InstrId {
        let shape = self.shape_of(x).clone();
        self.add(Opcode::Unary(op), &[x], shape)
    }

    /// Elementwise binary; the result takes `a`'s shape.
    pub fn binary(&mut self, op: BinaryOp, a: InstrId, b: InstrId) -> InstrId {
        let shape = self.shape_of(a).clone();
        self.add(Opcode::Binary(op), &[a, b], shape)
    }

    /// Elementwise comparison.
    pub fn compare(&mut self, direction: ComparisonDirection, a: InstrId, b: InstrId) -> HloResult<InstrId> {
        let shape = self.array_of(a)?.with_element_type(PrimitiveType::Pred);
        Ok(self.add(Opcode::Compare(direction), &[a, b], Shape::Array(shape)))
    }

    /// Elementwise select.
    pub fn select(&mut self, pred: InstrId, on_true: InstrId, on_false: InstrId) -> InstrId {
        let shape = self.shape_of(on_true).clone();
        self.add(Opcode::Select, &[pred, on_true, on_false], shape)
    }

    /// Elementwise clamp of `x` into `[lo, hi]`.
    pub fn clamp(&mut self, lo: InstrId, x: InstrId, hi: InstrId) -> InstrId {
        let shape = self.shape_of(x).clone();
        self.add(Opcode::Clamp, &[lo, x, hi], shape)
    }

    /// Element type conversion.
    pub fn convert(&mut self, x: InstrId, ty: PrimitiveType) -> HloResult<InstrId> {
        let shape = self.array_of(x)?.with_element_type(ty);
        Ok(self.add(Opcode::Convert, &[x], Shape::Array(shape)))
    }

    /// Broadcast into `shape`; operand dim `i` maps to `dimensions[i]`.
    pub fn broadcast(&mut self, x: InstrId, shape: ArrayShape, dimensions: &[usize]) -> InstrId {
        self.add(
            Opcode::Broadcast {
                dimensions: dimensions.to_vec(),
            },
            &[x],
            Shape::Array(shape),
        )
    }

    /// Row-major reshape.
    pub fn reshape(&mut self, x: InstrId, shape: ArrayShape) -> InstrId {
        self.add(Opcode::Reshape, &[x], Shape::Array(shape))
    }

    /// Bitcast to a shape with the same physical bytes.
    pub fn bitcast(&mut self, x: InstrId, shape: ArrayShape) -> InstrId {
        self.add(Opcode::Bitcast, &[x], Shape::Array(shape))
    }

    /// Transpose; output dim `i` is operand dim `permutation[i]`.
    pub fn transpose(&mut self, x: InstrId, permutation: &[usize]) -> HloResult<InstrId> {
        let operand = self.array_of(x)?;
        let dims: Vec<i64> = permutation.iter().map(|&p| operand.dim(p)).collect();
        let shape = ArrayShape::new(operand.element_type(), &dims);
        Ok(self.add(
            Opcode::Transpose {
                dimensions: permutation.to_vec(),
            },
            &[x],
            Shape::Array(shape),
        ))
    }

    /// Copy into the same dims with a new layout.
    pub fn copy_with_layout(&mut self, x: InstrId, minor_to_major: &[usize]) -> HloResult<InstrId> {
        let operand = self.array_of(x)?;
        let shape =
            ArrayShape::with_layout(operand.element_type(), operand.dims(), minor_to_major);
        Ok(self.add(Opcode::Copy, &[x], Shape::Array(shape)))
    }

    /// Copy with the operand's shape.
    pub fn copy(&mut self, x: InstrId) -> InstrId {
        let shape = self.shape_of(x).clone();
        self.add(Opcode::Copy, &[x], shape)
    }

    /// Strided slice.
    pub fn slice(&mut self, x: InstrId, starts: &[i64], limits: &[i64], strides: &[i64]) -> HloResult<InstrId> {
        let operand = self.array_of(x)?;
        let dims: Vec<i64> = (0..starts.len())
            .map(|i| (limits[i] - starts[i] + strides[i] - 1) / strides[i])
            .collect();
        let shape = ArrayShape::new(operand.element_type(), &dims);
        Ok(self.add(
            Opcode::Slice {
                starts: starts.iter().copied().collect(),
                limits: limits.iter().copied().collect(),
                strides: strides.iter().copied().collect(),
            },
            &[x],
            Shape::Array(shape),
        ))
    }

    /// Window of `slice_sizes` starting at the scalar `starts`, one per
    /// dimension. Starts are clamped so the window stays in bounds.
    pub fn dynamic_slice(&mut self, x: InstrId, starts: &[InstrId], slice_sizes: &[i64]) -> HloResult<InstrId> {
        let operand = self.array_of(x)?;
        self.check_starts("dynamic-slice", &operand, starts, slice_sizes)?;
        let shape = ArrayShape::new(operand.element_type(), slice_sizes);
        let mut operands = vec![x];
        operands.extend_from_slice(starts);
        Ok(self.add(
            Opcode::DynamicSlice {
                slice_sizes: slice_sizes.iter().copied().collect(),
            },
            &operands,
            Shape::Array(shape),
        ))
    }

    /// `x` with `update` written at the scalar `starts`, clamped so the
    /// update stays in bounds.
    pub fn dynamic_update_slice(&mut self, x: InstrId, update: InstrId, starts: &[InstrId]) -> HloResult<InstrId> {
        let operand = self.array_of(x)?;
        let update_shape = self.array_of(update)?;
        self.check_starts("dynamic-update-slice", &operand, starts, update_shape.dims())?;
        let mut operands = vec![x, update];
        operands.extend_from_slice(starts);
        Ok(self.add(Opcode::DynamicUpdateSlice, &operands, Shape::Array(operand)))
    }

    fn check_starts(&self, context: &str, operand: &ArrayShape, starts: &[InstrId], sizes: &[i64]) -> HloResult<()> {
        let mismatch = |detail: String| HloError::ShapeMismatch {
            context: context.to_string(),
            detail,
        };
        if starts.len() != operand.rank() || sizes.len() != operand.rank() {
            return Err(mismatch(format!(
                "{} starts and {} sizes for rank {}",
                starts.len(),
                sizes.len(),
                operand.rank()
            )));
        }
        for (dim, &size) in sizes.iter().enumerate() {
            if !(0..=operand.dim(dim)).contains(&size) {
                return Err(mismatch(format!("window of {size} in dimension {dim} of {operand}")));
            }
        }
        for &start in starts {
            let start = self.array_of(start)?;
            let ty = start.element_type();
            if !start.is_scalar() || !(ty.is_signed_integral() || ty.is_unsigned_integral()) {
                return Err(mismatch(format!("start index of shape {start}")));
            }
        }
        Ok(())
    }

    /// Concatenate along `dimension`.
    pub fn concatenate(&mut self, xs: &[InstrId], dimension: usize) -> HloResult<InstrId> {
        let first = self.array_of(xs[0])?;
        let mut dims: DimVec = first.dims().iter().copied().collect();
        dims[dimension] = 0;
        for &x in xs {
            dims[dimension] += self.array_of(x)?.dim(dimension);
        }
        let shape = ArrayShape::new(first.element_type(), &dims);
        Ok(self.add(Opcode::Concatenate { dimension }, xs, Shape::Array(shape)))
    }

    /// Single-operand reduction over `dimensions`.
    pub fn reduce(
        &mut self,
        x: InstrId,
        init: InstrId,
        dimensions: &[usize],
        to_apply: CompId,
    ) -> HloResult<InstrId> {
        let operand = self.array_of(x)?;
        let kept: Vec<i64> = (0..operand.rank())
            .filter(|d| !dimensions.contains(d))
            .map(|d| operand.dim(d))
            .collect();
        let shape = ArrayShape::new(operand.element_type(), &kept);
        Ok(self.add(
            Opcode::Reduce {
                dimensions: dimensions.to_vec(),
                to_apply,
            },
            &[x, init],
            Shape::Array(shape),
        ))
    }

    /// Multi-operand reduction producing a tuple.
    pub fn reduce_variadic(
        &mut self,
        xs: &[InstrId],
        inits: &[InstrId],
        dimensions: &[usize],
        to_apply: CompId,
    ) -> HloResult<InstrId> {
        let mut elements = Vec::with_capacity(xs.len());
        for &x in xs {
            let operand = self.array_of(x)?;
            let kept: Vec<i64> = (0..operand.rank())
                .filter(|d| !dimensions.contains(d))
                .map(|d| operand.dim(d))
                .collect();
            elements.push(Shape::array(operand.element_type(), &kept));
        }
        let operands: Vec<InstrId> = xs.iter().chain(inits).copied().collect();
        Ok(self.add(
            Opcode::Reduce {
                dimensions: dimensions.to_vec(),
                to_apply,
            },
            &operands,
            Shape::tuple(elements),
        ))
    }

    /// Elementwise map of a scalar computation.
    pub fn map(&mut self, xs: &[InstrId], to_apply: CompId) -> HloResult<InstrId> {
        let root = self.module.computation(to_apply).root();
        let ty = self.module.instr(root).shape().array_shape()?.element_type();
        let shape = self.array_of(xs[0])?.with_element_type(ty);
        Ok(self.add(Opcode::Map { to_apply }, xs, Shape::Array(shape)))
    }

    /// Tuple of values.
    pub fn tuple(&mut self, xs: &[InstrId]) -> InstrId {
        let shape = Shape::tuple(xs.iter().map(|&x| self.shape_of(x).clone()).collect());
        self.add(Opcode::Tuple, xs, shape)
    }

    /// Tuple element `index`.
    pub fn get_tuple_element(&mut self, x: InstrId, index: usize) -> HloResult<InstrId> {
        let shape = self.shape_of(x).try_subshape(&[index])?.clone();
        Ok(self.add(Opcode::GetTupleElement { index }, &[x], shape))
    }

    /// Fusion of a previously built computation.
    pub fn fusion(&mut self, kind: FusionKind, fused: CompId, operands: &[InstrId]) -> InstrId {
        let root = self.module.computation(fused).root();
        let shape = self.module.instr(root).shape().clone();
        let id = self.add(Opcode::Fusion { kind, fused }, operands, shape);
        self.module.computations[fused].fusion_instruction = Some(id);
        id
    }

    /// Scatter; the result has the operand's shape.
    pub fn scatter(
        &mut self,
        operand: InstrId,
        indices: InstrId,
        updates: InstrId,
        dimension_numbers: ScatterDimensionNumbers,
        to_apply: CompId,
        unique_indices: bool,
    ) -> InstrId {
        let shape = self.shape_of(operand).clone();
        self.add(
            Opcode::Scatter {
                dimension_numbers,
                to_apply,
                unique_indices,
            },
            &[operand, indices, updates],
            shape,
        )
    }

    /// Select-and-scatter; the result has the operand's shape.
    pub fn select_and_scatter(
        &mut self,
        operand: InstrId,
        source: InstrId,
        init: InstrId,
        window: Window,
        select: CompId,
        scatter: CompId,
    ) -> InstrId {
        let shape = self.shape_of(operand).clone();
        self.add(
            Opcode::SelectAndScatter {
                window,
                select,
                scatter,
            },
            &[operand, source, init],
            shape,
        )
    }

    /// Sort; one operand yields an array, several yield a tuple.
    pub fn sort(&mut self, operands: &[InstrId], dimension: usize, comparator: CompId, is_stable: bool) -> InstrId {
        let shape = if operands.len() == 1 {
            self.shape_of(operands[0]).clone()
        } else {
            Shape::tuple(operands.iter().map(|&x| self.shape_of(x).clone()).collect())
        };
        self.add(
            Opcode::Sort {
                dimension,
                comparator,
                is_stable,
            },
            operands,
            shape,
        )
    }

    /// While loop over a carried value.
    pub fn while_loop(
        &mut self,
        condition: CompId,
        body: CompId,
        init: InstrId,
        known_trip_count: Option<i64>,
    ) -> InstrId {
        let shape = self.shape_of(init).clone();
        self.add(
            Opcode::While {
                condition,
                body,
                known_trip_count,
            },
            &[init],
            shape,
        )
    }

    /// Conditional selected by `branch_index` (`pred` or `s32`).
    pub fn conditional(
        &mut self,
        branch_index: InstrId,
        branch_operands: &[InstrId],
        branches: &[CompId],
    ) -> InstrId {
        let root = self.module.computation(branches[0]).root();
        let shape = self.module.instr(root).shape().clone();
        let mut operands = vec![branch_index];
        operands.extend_from_slice(branch_operands);
        self.add(
            Opcode::Conditional {
                branches: branches.to_vec(),
            },
            &operands,
            shape,
        )
    }

    /// Cross-replica reduction.
    pub fn all_reduce(&mut self, operands: &[InstrId], to_apply: CompId) -> InstrId {
        let shape = if operands.len() == 1 {
            self.shape_of(operands[0]).clone()
        } else {
            Shape::tuple(operands.iter().map(|&x| self.shape_of(x).clone()).collect())
        };
        self.add(Opcode::AllReduce { to_apply }, operands, shape)
    }

    /// The replica id.
    pub fn replica_id(&mut self) -> InstrId {
        self.add(Opcode::ReplicaId, &[], Shape::scalar(PrimitiveType::U32))
    }

    /// The size of `dimension` of `x` as an `s32`: the runtime size for a
    /// dynamic array, the bound otherwise.
    pub fn get_dimension_size(&mut self, x: InstrId, dimension: usize) -> HloResult<InstrId> {
        let operand = self.array_of(x)?;
        if dimension >= operand.rank() {
            return Err(HloError::ShapeMismatch {
                context: "get-dimension-size".to_string(),
                detail: format!("dimension {dimension} of {operand}"),
            });
        }
        Ok(self.add(
            Opcode::GetDimensionSize { dimension },
            &[x],
            Shape::scalar(PrimitiveType::S32),
        ))
    }

    /// Exchange `x` between replicas along `source_target_pairs`.
    pub fn collective_permute(&mut self, x: InstrId, source_target_pairs: &[(i64, i64)]) -> InstrId {
        let shape = self.shape_of(x).clone();
        self.add(
            Opcode::CollectivePermute {
                source_target_pairs: source_target_pairs.to_vec(),
            },
            &[x],
            shape,
        )
    }

    /// Custom call to `target` with an explicit result shape.
    pub fn custom_call(&mut self, target: &str, operands: &[InstrId], shape: Shape) -> InstrId {
        self.add(
            Opcode::CustomCall {
                target: target.to_string(),
            },
            operands,
            shape,
        )
    }

    /// `PadToStatic`: a dynamic array to `(static array, s32 size per dimension)`.
    pub fn pad_to_static(&mut self, x: InstrId) -> HloResult<InstrId> {
        let operand = self.array_of(x)?;
        if !operand.is_dynamic() {
            return Err(HloError::ShapeMismatch {
                context: "PadToStatic".to_string(),
                detail: format!("operand {operand} is not dynamic"),
            });
        }
        let mut elements = vec![Shape::Array(ArrayShape::with_layout(
            operand.element_type(),
            operand.dims(),
            operand.layout().minor_to_major(),
        ))];
        elements.extend((0..operand.rank()).map(|_| Shape::scalar(PrimitiveType::S32)));
        Ok(self.custom_call("PadToStatic", &[x], Shape::tuple(elements)))
    }

    /// `SliceToDynamic`: a static array and one `s32` size per dimension to a
    /// dynamic array.
    pub fn slice_to_dynamic(&mut self, x: InstrId, sizes: &[InstrId]) -> HloResult<InstrId> {
        let operand = self.array_of(x)?;
        if sizes.len() != operand.rank() {
            return Err(HloError::ShapeMismatch {
                context: "SliceToDynamic".to_string(),
                detail: format!("{} sizes for rank {}", sizes.len(), operand.rank()),
            });
        }
        let mut operands = vec![x];
        operands.extend_from_slice(sizes);
        Ok(self.custom_call("SliceToDynamic", &operands, Shape::Array(operand.into_dynamic())))
    }

    /// Finish the computation with `root` and register it in the module.
    pub fn build(self, root: InstrId) -> CompId {
        let mut parameters = self.parameters;
        parameters.sort_by_key(|&(number, _)| number);
        let comp = self.module.computations.push(HloComputation {
            id: self.comp,
            name: self.name,
            instructions: self.instructions,
            parameters: parameters.into_iter().map(|(_, id)| id).collect(),
            root,
            fusion_instruction: None,
        });
        debug_assert_eq!(comp, self.comp);
        comp
    }
}

/// A scalar computation `(p0, p1) -> op(p0, p1)` over `ty`.
pub fn scalar_binary_computation(
    module: &mut HloModule,
    name: &str,
    op: BinaryOp,
    ty: PrimitiveType,
) -> CompId {
    let mut b = module.builder(name);
    let lhs = b.parameter(0, Shape::scalar(ty));
    let rhs = b.parameter(1, Shape::scalar(ty));
    let root = b.binary(op, lhs, rhs);
    b.build(root)
}

/// A scalar comparator `(p0, p1) -> p0 <direction> p1` over `ty`.
pub fn scalar_compare_computation(
    module: &mut HloModule,
    name: &str,
    direction: ComparisonDirection,
    ty: PrimitiveType,
) -> HloResult<CompId> {
    let mut b = module.builder(name);
    let lhs = b.parameter(0, Shape::scalar(ty));
    let rhs = b.parameter(1, Shape::scalar(ty));
    let root = b.compare(direction, lhs, rhs)?;
    Ok(b.build(root))
}
