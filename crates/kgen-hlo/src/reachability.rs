//! Precomputed ancestor sets for one computation.

use crate::module::HloModule;
use crate::{CompId, InstrId};
use fixedbitset::FixedBitSet;
use rustc_hash::FxHashMap;

/// For each instruction of a computation, the set of instructions it is
/// reachable from (itself included).
#[derive(Debug, Clone)]
pub struct ReachabilityMap {
    slots: FxHashMap<InstrId, usize>,
    ancestors: Vec<FixedBitSet>,
}

impl ReachabilityMap {
    /// Compute ancestor sets in one post-order sweep.
    #[must_use]
    pub fn build(module: &HloModule, comp: CompId) -> Self {
        let instructions = module.computation(comp).instructions();
        let n = instructions.len();
        let slots: FxHashMap<InstrId, usize> = instructions
            .iter()
            .enumerate()
            .map(|(slot, &id)| (id, slot))
            .collect();
        let mut ancestors: Vec<FixedBitSet> = Vec::with_capacity(n);
        for (slot, &id) in instructions.iter().enumerate() {
            let mut bits = FixedBitSet::with_capacity(n);
            bits.insert(slot);
            for operand in module.instr(id).operands() {
                if let Some(&op_slot) = slots.get(operand) {
                    bits.union_with(&ancestors[op_slot]);
                }
            }
            ancestors.push(bits);
        }
        Self { slots, ancestors }
    }

    /// Returns true if `to` is reachable from `from` along operand edges,
    /// i.e. `from` is `to` or one of its transitive operands.
    #[must_use]
    pub fn is_reachable(&self, from: InstrId, to: InstrId) -> bool {
        match (self.slots.get(&from), self.slots.get(&to)) {
            (Some(&f), Some(&t)) => self.ancestors[t].contains(f),
            _ => false,
        }
    }

    /// Returns true if either instruction reaches the other.
    #[must_use]
    pub fn is_connected(&self, a: InstrId, b: InstrId) -> bool {
        self.is_reachable(a, b) || self.is_reachable(b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{BinaryOp, UnaryOp};
    use crate::shape::{PrimitiveType, Shape};

    #[test]
    fn test_reachability_diamond() {
        let mut module = HloModule::new("m");
        let mut b = module.builder("entry");
        let p = b.parameter(0, Shape::array(PrimitiveType::F32, &[4]));
        let q = b.parameter(1, Shape::array(PrimitiveType::F32, &[4]));
        let left = b.unary(UnaryOp::Neg, p);
        let right = b.unary(UnaryOp::Exp, p);
        let join = b.binary(BinaryOp::Add, left, right);
        let other = b.unary(UnaryOp::Abs, q);
        let root = b.tuple(&[join, other]);
        let comp = b.build(root);

        let map = ReachabilityMap::build(&module, comp);
        assert!(map.is_reachable(p, join));
        assert!(map.is_reachable(join, join));
        assert!(!map.is_reachable(join, p));
        assert!(!map.is_reachable(left, right));
        assert!(!map.is_reachable(p, other));
        assert!(map.is_connected(other, q));
        assert!(map.is_reachable(q, root));
    }
}
