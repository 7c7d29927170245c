//! Typed views of device buffers and multi-dimensional indices into them.

use kgen_hlo::{ArrayShape, PrimitiveType};
use kgen_kir::{AddressSpace, BinOp, Builder, ScalarType, ValueId};
use smallvec::SmallVec;

/// Per-dimension coordinates of one element.
///
/// When the index came from a linear position, that position is kept so a
/// buffer with the same physical order can be addressed without
/// re-linearizing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrIndex {
    multidim: SmallVec<[ValueId; 4]>,
    linear: Option<ValueId>,
    shape: ArrayShape,
    index_type: ScalarType,
}

impl IrIndex {
    /// An index from explicit coordinates into `shape`.
    #[must_use]
    pub fn new(multidim: impl IntoIterator<Item = ValueId>, shape: &ArrayShape, index_type: ScalarType) -> Self {
        let multidim: SmallVec<[ValueId; 4]> = multidim.into_iter().collect();
        debug_assert_eq!(multidim.len(), shape.rank());
        Self {
            multidim,
            linear: None,
            shape: shape.clone(),
            index_type,
        }
    }

    /// The index of physical position `linear` in `shape`.
    ///
    /// Coordinates are peeled off most-minor first. The most-major
    /// coordinate is not reduced, so positions past the end map past the
    /// end.
    pub fn from_linear(b: &mut Builder, linear: ValueId, shape: &ArrayShape) -> Self {
        let index_type = b.value_type(linear);
        let rank = shape.rank();
        let zero = b.int(index_type, 0);
        let mut multidim: SmallVec<[ValueId; 4]> = SmallVec::from_elem(zero, rank);
        let mut divisor = 1_i64;
        let order = shape.layout().minor_to_major();
        for (i, &dim) in order.iter().enumerate() {
            let extent = shape.dim(dim);
            let is_major = i + 1 == order.len();
            if extent == 1 && !is_major {
                continue;
            }
            let quot = if divisor == 1 {
                linear
            } else {
                b.binary_imm(BinOp::Div, linear, divisor)
            };
            multidim[dim] = if is_major {
                quot
            } else {
                b.binary_imm(BinOp::Rem, quot, extent)
            };
            divisor *= extent;
        }
        Self {
            multidim,
            linear: Some(linear),
            shape: shape.clone(),
            index_type,
        }
    }

    /// An index of constant coordinates.
    pub fn constant(b: &mut Builder, coords: &[i64], shape: &ArrayShape, index_type: ScalarType) -> Self {
        let multidim: SmallVec<[ValueId; 4]> = coords.iter().map(|&c| b.int(index_type, c)).collect();
        Self::new(multidim, shape, index_type)
    }

    /// Coordinates, one per dimension.
    #[must_use]
    pub fn multidim(&self) -> &[ValueId] {
        &self.multidim
    }

    /// Coordinate along `dim`.
    #[must_use]
    pub fn get(&self, dim: usize) -> ValueId {
        self.multidim[dim]
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.multidim.len()
    }

    /// The physical position this index was derived from, if any.
    #[must_use]
    pub fn linear(&self) -> Option<ValueId> {
        self.linear
    }

    /// The shape being indexed.
    #[must_use]
    pub fn shape(&self) -> &ArrayShape {
        &self.shape
    }

    /// Integer type of every coordinate.
    #[must_use]
    pub fn index_type(&self) -> ScalarType {
        self.index_type
    }

    /// A copy with `offset` added to coordinate `dim`.
    #[must_use]
    pub fn add_offset_to_dim(&self, b: &mut Builder, offset: ValueId, dim: usize) -> Self {
        let mut multidim = self.multidim.clone();
        multidim[dim] = b.add(multidim[dim], offset);
        Self {
            multidim,
            linear: None,
            shape: self.shape.clone(),
            index_type: self.index_type,
        }
    }

    /// The same coordinates reinterpreted as indexing `shape`.
    #[must_use]
    pub fn with_shape(&self, shape: &ArrayShape) -> Self {
        Self {
            multidim: self.multidim.clone(),
            linear: None,
            shape: shape.clone(),
            index_type: self.index_type,
        }
    }

    /// Physical position of this index in `shape`, whose extents must match
    /// the index's.
    pub fn linearize(&self, b: &mut Builder, shape: &ArrayShape) -> ValueId {
        if let Some(linear) = self.linear.filter(|_| self.linear_valid_on(shape)) {
            return linear;
        }
        let mut linear: Option<ValueId> = None;
        let mut stride = 1_i64;
        for &dim in shape.layout().minor_to_major() {
            let extent = shape.dim(dim);
            if extent != 1 {
                let coord = self.multidim[dim];
                let term = if stride == 1 {
                    coord
                } else {
                    b.binary_imm(BinOp::Mul, coord, stride)
                };
                linear = Some(match linear {
                    Some(acc) => b.add(acc, term),
                    None => term,
                });
            }
            stride *= extent;
        }
        match linear {
            Some(l) => l,
            None => b.int(self.index_type, 0),
        }
    }

    /// Row-major position of this index, ignoring any layout.
    pub fn linearize_row_major(&self, b: &mut Builder) -> ValueId {
        let descending = self.shape.with_layout_descending();
        self.with_shape(&descending).linearize(b, &descending)
    }

    /// Returns true if the stored linear position addresses the same element
    /// of `shape`.
    #[must_use]
    pub fn linear_valid_on(&self, shape: &ArrayShape) -> bool {
        self.linear.is_some()
            && self.shape.dims() == shape.dims()
            && physical_non_unit_order(&self.shape) == physical_non_unit_order(shape)
    }
}

fn physical_non_unit_order(shape: &ArrayShape) -> SmallVec<[usize; 4]> {
    shape
        .layout()
        .minor_to_major()
        .iter()
        .copied()
        .filter(|&d| shape.dim(d) != 1)
        .collect()
}

/// Extension used by index arithmetic on shapes.
pub trait ArrayShapeExt {
    /// The same element type and extents with a descending layout.
    fn with_layout_descending(&self) -> ArrayShape;

    /// The element type as an IR scalar type.
    fn scalar_type(&self) -> ScalarType;
}

impl ArrayShapeExt for ArrayShape {
    fn with_layout_descending(&self) -> ArrayShape {
        ArrayShape::new(self.element_type(), self.dims())
    }

    fn scalar_type(&self) -> ScalarType {
        ScalarType::from(self.element_type())
    }
}

/// A device buffer viewed as an array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrArray {
    base: ValueId,
    shape: ArrayShape,
}

impl IrArray {
    /// View the bytes at `base` (a global `u64` address) as `shape`.
    #[must_use]
    pub fn new(base: ValueId, shape: ArrayShape) -> Self {
        Self { base, shape }
    }

    /// Base address.
    #[must_use]
    pub fn base(&self) -> ValueId {
        self.base
    }

    /// The array's shape.
    #[must_use]
    pub fn shape(&self) -> &ArrayShape {
        &self.shape
    }

    /// Element type.
    #[must_use]
    pub fn element_type(&self) -> PrimitiveType {
        self.shape.element_type()
    }

    /// The same bytes viewed as `shape`.
    #[must_use]
    pub fn cast_to_shape(&self, shape: ArrayShape) -> Self {
        Self {
            base: self.base,
            shape,
        }
    }

    /// Byte address of the element at `index`.
    pub fn element_address(&self, b: &mut Builder, index: &IrIndex) -> ValueId {
        if self.shape.is_scalar() {
            return self.base;
        }
        let linear = index.linearize(b, &self.shape);
        b.element_addr(self.base, linear, self.shape.element_type().byte_size())
    }

    /// Load the element at `index`.
    pub fn emit_read(&self, b: &mut Builder, index: &IrIndex) -> ValueId {
        let addr = self.element_address(b, index);
        b.load(AddressSpace::Global, self.shape.scalar_type(), addr)
    }

    /// Store `value` at `index`.
    pub fn emit_write(&self, b: &mut Builder, index: &IrIndex, value: ValueId) {
        let addr = self.element_address(b, index);
        b.store(AddressSpace::Global, addr, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgen_kir::{Expr, Stmt};

    #[test]
    fn test_from_linear_skips_unit_dims() {
        let shape = ArrayShape::new(PrimitiveType::F32, &[3, 1, 4]);
        let mut b = Builder::new("k");
        let linear = b.int(ScalarType::S32, 5);
        let index = IrIndex::from_linear(&mut b, linear, &shape);
        assert_eq!(index.rank(), 3);
        assert_eq!(index.linear(), Some(linear));
        assert_eq!(index.index_type(), ScalarType::S32);
        let kernel = b.finish_kernel();
        let Stmt::Let { expr, .. } = &kernel.body[1] else {
            panic!("expected let");
        };
        assert_eq!(*expr, Expr::Const(kgen_kir::Scalar::i32(0)));
    }

    #[test]
    fn test_linear_reuse_requires_same_physical_order() {
        let row_major = ArrayShape::new(PrimitiveType::F32, &[4, 4]);
        let col_major = ArrayShape::with_layout(PrimitiveType::F32, &[4, 4], &[0, 1]);
        let mut b = Builder::new("k");
        let linear = b.int(ScalarType::S32, 6);
        let index = IrIndex::from_linear(&mut b, linear, &row_major);
        assert!(index.linear_valid_on(&row_major));
        assert!(!index.linear_valid_on(&col_major));
        assert_eq!(index.linearize(&mut b, &row_major), linear);
        assert_ne!(index.linearize(&mut b, &col_major), linear);

        let unit = ArrayShape::with_layout(PrimitiveType::F32, &[1, 8], &[0, 1]);
        let unit_desc = ArrayShape::new(PrimitiveType::F32, &[1, 8]);
        let index = IrIndex::from_linear(&mut b, linear, &unit);
        assert!(index.linear_valid_on(&unit_desc));
    }

    #[test]
    fn test_add_offset_drops_linear() {
        let shape = ArrayShape::new(PrimitiveType::S32, &[2, 8]);
        let mut b = Builder::new("k");
        let linear = b.int(ScalarType::S32, 3);
        let index = IrIndex::from_linear(&mut b, linear, &shape);
        let one = b.int(ScalarType::S32, 1);
        let moved = index.add_offset_to_dim(&mut b, one, 1);
        assert!(moved.linear().is_none());
        assert_ne!(moved.get(1), index.get(1));
        assert_eq!(moved.get(0), index.get(0));
    }
}
