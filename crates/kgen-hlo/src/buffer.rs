//! Buffer assignment: where every value lives.
//!
//! The code generator only queries a [`BufferAssignment`]; how it was
//! produced is not its concern. [`BufferAssignment::assign`] is a simple
//! assigner with no liveness-based reuse:
//!
//! - entry parameters and constants get one allocation per subshape
//! - the entry root gets live-out allocations
//! - every other defined value is packed into a single temp allocation
//! - tuples, get-tuple-element and bitcast alias their sources
//! - while/conditional carried values share storage with their bodies
//!
//! [`BufferAssignment::set_slice`] and [`BufferAssignment::share`] allow
//! callers to express in-place updates the naive policy does not find.

use crate::instruction::Opcode;
use crate::module::HloModule;
use crate::shape::ShapeIndex;
use crate::{CompId, HloResult, InstrId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Alignment of values packed into the temp allocation.
const TEMP_ALIGNMENT: u64 = 64;

/// What an allocation holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationKind {
    /// A subshape of an entry computation parameter.
    EntryParameter {
        /// Parameter number.
        number: usize,
        /// Subshape within the parameter.
        index: ShapeIndex,
    },
    /// Constant data, materialized as a module global.
    Constant {
        /// The constant instruction.
        instruction: InstrId,
    },
    /// Scratch storage shared by intermediate values.
    Temp,
    /// Part of the program's result.
    Output,
}

/// One physical allocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAllocation {
    index: usize,
    size: u64,
    kind: AllocationKind,
}

impl BufferAllocation {
    /// Position in [`BufferAssignment::allocations`].
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// What this allocation holds.
    #[must_use]
    pub fn kind(&self) -> &AllocationKind {
        &self.kind
    }

    /// Returns true for entry parameters.
    #[must_use]
    pub fn is_entry_parameter(&self) -> bool {
        matches!(self.kind, AllocationKind::EntryParameter { .. })
    }

    /// Returns true for constants.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, AllocationKind::Constant { .. })
    }

    /// Returns true for the temp allocation.
    #[must_use]
    pub fn is_temp(&self) -> bool {
        matches!(self.kind, AllocationKind::Temp)
    }

    /// Returns true if the allocation is part of the program result.
    #[must_use]
    pub fn maybe_live_out(&self) -> bool {
        matches!(self.kind, AllocationKind::Output)
    }
}

/// A byte range of an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferSlice {
    /// Allocation index.
    pub allocation: usize,
    /// Byte offset into the allocation.
    pub offset: u64,
    /// Byte length.
    pub size: u64,
}

impl BufferSlice {
    /// A new slice.
    #[must_use]
    pub const fn new(allocation: usize, offset: u64, size: u64) -> Self {
        Self {
            allocation,
            offset,
            size,
        }
    }
}

impl fmt::Display for BufferSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{allocation:{}, offset:{}, size:{}}}",
            self.allocation, self.offset, self.size
        )
    }
}

/// Map from `(instruction, shape index)` to physical storage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BufferAssignment {
    allocations: Vec<BufferAllocation>,
    slices: FxHashMap<(InstrId, ShapeIndex), BufferSlice>,
}

impl BufferAssignment {
    /// An empty assignment, for manual construction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an allocation and return its index.
    pub fn add_allocation(&mut self, size: u64, kind: AllocationKind) -> usize {
        let index = self.allocations.len();
        self.allocations.push(BufferAllocation { index, size, kind });
        index
    }

    /// Place `(instr, index)` at `slice`, replacing any previous placement.
    pub fn set_slice(&mut self, instr: InstrId, index: &[usize], slice: BufferSlice) {
        self.slices.insert((instr, index.iter().copied().collect()), slice);
    }

    /// Make every subshape of `to` use the storage of the same subshape of
    /// `from`.
    pub fn share(&mut self, module: &HloModule, from: InstrId, to: InstrId) {
        for (index, _) in module.instr(to).shape().subshapes() {
            if let Some(slice) = self.unique_slice(from, &index) {
                self.slices.insert((to, index), slice);
            }
        }
    }

    /// The slice holding `(instr, index)`, if it has one.
    #[must_use]
    pub fn unique_slice(&self, instr: InstrId, index: &[usize]) -> Option<BufferSlice> {
        let key: ShapeIndex = index.iter().copied().collect();
        self.slices.get(&(instr, key)).copied()
    }

    /// The slice holding the whole value of `instr`.
    #[must_use]
    pub fn unique_top_level_slice(&self, instr: InstrId) -> Option<BufferSlice> {
        self.unique_slice(instr, &[])
    }

    /// All allocations, by index.
    #[must_use]
    pub fn allocations(&self) -> &[BufferAllocation] {
        &self.allocations
    }

    /// One allocation.
    #[must_use]
    pub fn allocation(&self, index: usize) -> &BufferAllocation {
        &self.allocations[index]
    }

    /// The temp allocation, if any value needed scratch storage.
    #[must_use]
    pub fn temp_allocation(&self) -> Option<&BufferAllocation> {
        self.allocations.iter().find(|a| a.is_temp())
    }

    /// The allocation holding entry parameter `number` at `index`.
    #[must_use]
    pub fn parameter_allocation(&self, number: usize, index: &[usize]) -> Option<usize> {
        self.allocations.iter().position(|a| {
            matches!(&a.kind, AllocationKind::EntryParameter { number: n, index: i }
                if *n == number && i.as_slice() == index)
        })
    }

    /// Run the naive assigner over the entry computation.
    pub fn assign(module: &HloModule) -> HloResult<Self> {
        let entry = module.entry()?;
        let mut assigner = Assigner {
            module,
            allocations: Vec::new(),
            places: FxHashMap::default(),
            temp_size: 0,
        };
        let root = module.computation(entry).root();
        assigner.assign_computation(entry, &FxHashMap::default(), Some(root))?;
        Ok(assigner.finish())
    }
}

/// Storage decided before the temp allocation's index is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Place {
    Fixed(BufferSlice),
    Temp { offset: u64, size: u64 },
}

type Places = FxHashMap<(InstrId, ShapeIndex), Place>;

struct Assigner<'m> {
    module: &'m HloModule,
    allocations: Vec<BufferAllocation>,
    places: Places,
    temp_size: u64,
}

impl Assigner<'_> {
    fn new_allocation(&mut self, size: u64, kind: AllocationKind) -> Place {
        let index = self.allocations.len();
        self.allocations.push(BufferAllocation { index, size, kind });
        Place::Fixed(BufferSlice::new(index, 0, size))
    }

    fn new_temp(&mut self, size: u64) -> Place {
        let offset = self.temp_size.div_ceil(TEMP_ALIGNMENT) * TEMP_ALIGNMENT;
        self.temp_size = offset + size;
        Place::Temp { offset, size }
    }

    fn places_of(&self, instr: InstrId) -> Vec<(ShapeIndex, Place)> {
        self.module
            .instr(instr)
            .shape()
            .subshapes()
            .into_iter()
            .filter_map(|(index, _)| {
                self.places
                    .get(&(instr, index.clone()))
                    .map(|p| (index, *p))
            })
            .collect()
    }

    fn alias(&mut self, to: InstrId, to_prefix: &[usize], from: InstrId, from_prefix: &[usize]) {
        let subshapes = self
            .module
            .instr(from)
            .shape()
            .subshape(from_prefix)
            .map(|s| s.subshapes())
            .unwrap_or_default();
        for (rest, _) in subshapes {
            let mut from_index: ShapeIndex = from_prefix.iter().copied().collect();
            from_index.extend(rest.iter().copied());
            let mut to_index: ShapeIndex = to_prefix.iter().copied().collect();
            to_index.extend(rest.iter().copied());
            if let Some(&place) = self.places.get(&(from, from_index)) {
                self.places.insert((to, to_index), place);
            }
        }
    }

    fn define(&mut self, instr: InstrId, forced: &Places, entry_root: Option<InstrId>) {
        let subshapes: Vec<(ShapeIndex, u64)> = self
            .module
            .instr(instr)
            .shape()
            .subshapes()
            .into_iter()
            .map(|(index, shape)| (index, shape.byte_size()))
            .collect();
        for (index, size) in subshapes {
            let key = (instr, index);
            let place = if let Some(&place) = forced.get(&key) {
                place
            } else if entry_root == Some(instr) {
                self.new_allocation(size, AllocationKind::Output)
            } else {
                self.new_temp(size)
            };
            self.places.insert(key, place);
        }
    }

    /// Records that `root` (and, through tuples, its operands) must be
    /// written into `target`.
    fn force_root(&self, root: InstrId, target: &[(ShapeIndex, Place)], forced: &mut Places) {
        for (index, place) in target {
            forced.insert((root, index.clone()), *place);
        }
        let instr = self.module.instr(root);
        if matches!(instr.opcode(), Opcode::Tuple) {
            for (i, &operand) in instr.operands().iter().enumerate() {
                let sub: Vec<(ShapeIndex, Place)> = target
                    .iter()
                    .filter(|(index, _)| index.first() == Some(&i))
                    .map(|(index, place)| (index[1..].iter().copied().collect(), *place))
                    .collect();
                self.force_root(operand, &sub, forced);
            }
        }
    }

    fn assign_computation(
        &mut self,
        comp: CompId,
        forced: &Places,
        entry_root: Option<InstrId>,
    ) -> HloResult<()> {
        let module = self.module;
        let is_entry = entry_root.is_some();
        for &id in module.computation(comp).instructions() {
            let instr = module.instr(id);
            match instr.opcode() {
                Opcode::Parameter { number } => {
                    if is_entry {
                        for (index, shape) in instr.shape().subshapes() {
                            let place = self.new_allocation(
                                shape.byte_size(),
                                AllocationKind::EntryParameter {
                                    number: *number,
                                    index: index.clone(),
                                },
                            );
                            self.places.insert((id, index), place);
                        }
                    } else {
                        for (index, _) in instr.shape().subshapes() {
                            if let Some(&place) = forced.get(&(id, index.clone())) {
                                self.places.insert((id, index), place);
                            }
                        }
                    }
                }
                Opcode::Constant(literal) => {
                    let place = self.new_allocation(
                        literal.shape().byte_size(),
                        AllocationKind::Constant { instruction: id },
                    );
                    self.places.insert((id, ShapeIndex::new()), place);
                }
                Opcode::GetTupleElement { index } => {
                    self.alias(id, &[], instr.operand(0), &[*index]);
                }
                Opcode::Bitcast => {
                    self.alias(id, &[], instr.operand(0), &[]);
                }
                Opcode::Tuple => {
                    let key = (id, ShapeIndex::new());
                    let place = match forced.get(&key) {
                        Some(&place) => place,
                        None if entry_root == Some(id) => self.new_allocation(
                            instr.shape().byte_size(),
                            AllocationKind::Output,
                        ),
                        None => self.new_temp(instr.shape().byte_size()),
                    };
                    self.places.insert(key, place);
                    for (i, &operand) in instr.operands().iter().enumerate() {
                        self.alias(id, &[i], operand, &[]);
                    }
                }
                Opcode::While {
                    condition, body, ..
                } => {
                    self.alias(id, &[], instr.operand(0), &[]);
                    let carried = self.places_of(id);
                    for sub in [*condition, *body] {
                        let computation = module.computation(sub);
                        let param = computation.parameter(0);
                        let mut inner = Places::default();
                        for (index, place) in &carried {
                            inner.insert((param, index.clone()), *place);
                        }
                        if sub == *body {
                            self.force_root(computation.root(), &carried, &mut inner);
                        }
                        self.assign_computation(sub, &inner, None)?;
                    }
                }
                Opcode::Conditional { branches } => {
                    self.define(id, forced, entry_root);
                    let result = self.places_of(id);
                    for (b, &branch) in branches.iter().enumerate() {
                        let computation = module.computation(branch);
                        let param = computation.parameter(0);
                        let operand = instr.operand(b + 1);
                        let mut inner = Places::default();
                        for (index, place) in self.places_of(operand) {
                            inner.insert((param, index), place);
                        }
                        self.force_root(computation.root(), &result, &mut inner);
                        self.assign_computation(branch, &inner, None)?;
                    }
                }
                Opcode::AfterAll => {}
                _ => self.define(id, forced, entry_root),
            }
        }
        Ok(())
    }

    fn finish(mut self) -> BufferAssignment {
        let has_temp = self
            .places
            .values()
            .any(|p| matches!(p, Place::Temp { .. }));
        let temp_index = has_temp.then(|| {
            let index = self.allocations.len();
            self.allocations.push(BufferAllocation {
                index,
                size: self.temp_size,
                kind: AllocationKind::Temp,
            });
            index
        });
        let slices = self
            .places
            .into_iter()
            .filter_map(|(key, place)| {
                let slice = match place {
                    Place::Fixed(slice) => slice,
                    Place::Temp { offset, size } => BufferSlice::new(temp_index?, offset, size),
                };
                Some((key, slice))
            })
            .collect();
        debug!(
            allocations = self.allocations.len(),
            temp_bytes = self.temp_size,
            "assigned buffers"
        );
        BufferAssignment {
            allocations: self.allocations,
            slices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{BinaryOp, ComparisonDirection, UnaryOp};
    use crate::literal::Literal;
    use crate::shape::{PrimitiveType, Shape};

    fn f32s(dims: &[i64]) -> Shape {
        Shape::array(PrimitiveType::F32, dims)
    }

    #[test]
    fn test_straight_line_assignment() {
        let mut module = HloModule::new("m");
        let mut b = module.builder("entry");
        let p = b.parameter(0, f32s(&[4]));
        let c = b.constant(Literal::from_f32s(&[4], &[1.0; 4]).unwrap());
        let add = b.binary(BinaryOp::Add, p, c);
        let neg = b.unary(UnaryOp::Neg, add);
        let exp = b.unary(UnaryOp::Exp, neg);
        let entry = b.build(exp);
        module.set_entry(entry);

        let assignment = BufferAssignment::assign(&module).unwrap();
        let p_slice = assignment.unique_top_level_slice(p).unwrap();
        assert!(assignment.allocation(p_slice.allocation).is_entry_parameter());
        let c_slice = assignment.unique_top_level_slice(c).unwrap();
        assert!(assignment.allocation(c_slice.allocation).is_constant());
        let add_slice = assignment.unique_top_level_slice(add).unwrap();
        let neg_slice = assignment.unique_top_level_slice(neg).unwrap();
        assert!(assignment.allocation(add_slice.allocation).is_temp());
        assert_eq!(add_slice.allocation, neg_slice.allocation);
        assert_eq!(neg_slice.offset, 64);
        let out = assignment.unique_top_level_slice(exp).unwrap();
        assert!(assignment.allocation(out.allocation).maybe_live_out());
        assert_eq!(assignment.parameter_allocation(0, &[]), Some(p_slice.allocation));
    }

    #[test]
    fn test_while_shares_carried_buffers() {
        let mut module = HloModule::new("m");
        let state = Shape::tuple(vec![Shape::scalar(PrimitiveType::S32), f32s(&[8])]);

        let mut cb = module.builder("cond");
        let cp = cb.parameter(0, state.clone());
        let counter = cb.get_tuple_element(cp, 0).unwrap();
        let limit = cb.constant(Literal::scalar_i32(3));
        let pred = cb.compare(ComparisonDirection::Lt, counter, limit).unwrap();
        let cond = cb.build(pred);

        let mut bb = module.builder("body");
        let bp = bb.parameter(0, state.clone());
        let i = bb.get_tuple_element(bp, 0).unwrap();
        let one = bb.constant(Literal::scalar_i32(1));
        let next_i = bb.binary(BinaryOp::Add, i, one);
        let v = bb.get_tuple_element(bp, 1).unwrap();
        let next_v = bb.unary(UnaryOp::Neg, v);
        let root = bb.tuple(&[next_i, next_v]);
        let body = bb.build(root);

        let mut b = module.builder("entry");
        let init = b.parameter(0, state);
        let w = b.while_loop(cond, body, init, None);
        let entry = b.build(w);
        module.set_entry(entry);

        let assignment = BufferAssignment::assign(&module).unwrap();
        for index in [&[][..], &[0][..], &[1][..]] {
            let expected = assignment.unique_slice(init, index).unwrap();
            assert_eq!(assignment.unique_slice(w, index), Some(expected));
            assert_eq!(assignment.unique_slice(bp, index), Some(expected));
            assert_eq!(assignment.unique_slice(cp, index), Some(expected));
            assert_eq!(assignment.unique_slice(root, index), Some(expected));
        }
        assert_eq!(
            assignment.unique_top_level_slice(next_v),
            assignment.unique_slice(init, &[1])
        );
    }

    #[test]
    fn test_share_overrides() {
        let mut module = HloModule::new("m");
        let mut b = module.builder("entry");
        let p = b.parameter(0, f32s(&[4]));
        let neg = b.unary(UnaryOp::Neg, p);
        let entry = b.build(neg);
        module.set_entry(entry);

        let mut assignment = BufferAssignment::assign(&module).unwrap();
        assert_ne!(
            assignment.unique_top_level_slice(p),
            assignment.unique_top_level_slice(neg)
        );
        assignment.share(&module, p, neg);
        assert_eq!(
            assignment.unique_top_level_slice(p),
            assignment.unique_top_level_slice(neg)
        );
    }
}
