//! Shapes, layouts, and element types.

use crate::{HloError, HloResult};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Dimension extents.
pub type DimVec = SmallVec<[i64; 4]>;

/// A path into a (possibly nested) tuple shape. Empty addresses the root.
pub type ShapeIndex = SmallVec<[usize; 2]>;

/// Tensor element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveType {
    /// Boolean, stored as one byte.
    Pred,
    /// 8-bit signed integer.
    S8,
    /// 16-bit signed integer.
    S16,
    /// 32-bit signed integer.
    S32,
    /// 64-bit signed integer.
    S64,
    /// 8-bit unsigned integer.
    U8,
    /// 16-bit unsigned integer.
    U16,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit unsigned integer.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl PrimitiveType {
    /// Size in bytes of one element.
    #[must_use]
    pub const fn byte_size(self) -> usize {
        match self {
            Self::Pred | Self::S8 | Self::U8 => 1,
            Self::S16 | Self::U16 => 2,
            Self::S32 | Self::U32 | Self::F32 => 4,
            Self::S64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Width in bits.
    #[must_use]
    pub const fn bit_width(self) -> u32 {
        match self {
            Self::Pred => 1,
            other => other.byte_size() as u32 * 8,
        }
    }

    /// Returns true for floating-point types.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Returns true for signed integer types.
    #[must_use]
    pub const fn is_signed_integral(self) -> bool {
        matches!(self, Self::S8 | Self::S16 | Self::S32 | Self::S64)
    }

    /// Returns true for unsigned integer types.
    #[must_use]
    pub const fn is_unsigned_integral(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    /// Short lowercase name, as printed in shapes.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pred => "pred",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Physical dimension order of an array, listed minor to major.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    minor_to_major: SmallVec<[usize; 4]>,
}

impl Layout {
    /// Row-major layout: the last logical dimension is the most minor.
    #[must_use]
    pub fn descending(rank: usize) -> Self {
        Self {
            minor_to_major: (0..rank).rev().collect(),
        }
    }

    /// Layout from an explicit minor-to-major permutation.
    #[must_use]
    pub fn new(minor_to_major: impl IntoIterator<Item = usize>) -> Self {
        Self {
            minor_to_major: minor_to_major.into_iter().collect(),
        }
    }

    /// Dimensions from most minor to most major.
    #[must_use]
    pub fn minor_to_major(&self) -> &[usize] {
        &self.minor_to_major
    }

    /// Dimensions from most major to most minor.
    #[must_use]
    pub fn major_to_minor(&self) -> SmallVec<[usize; 4]> {
        self.minor_to_major.iter().rev().copied().collect()
    }

    /// Position of `dim` in the minor-to-major list.
    #[must_use]
    pub fn position_of(&self, dim: usize) -> Option<usize> {
        self.minor_to_major.iter().position(|&d| d == dim)
    }

    /// Returns true if `dims` occupy adjacent physical positions.
    #[must_use]
    pub fn are_dimensions_consecutive(&self, dims: &[usize]) -> bool {
        let mut positions: SmallVec<[usize; 4]> =
            dims.iter().filter_map(|&d| self.position_of(d)).collect();
        positions.sort_unstable();
        positions.windows(2).all(|w| w[1] - w[0] == 1)
    }
}

/// An array shape: element type, extents and layout.
///
/// A dynamic array keeps its static extents as upper bounds. Its buffer holds
/// the data followed by one `s32` runtime size per dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayShape {
    element_type: PrimitiveType,
    dims: DimVec,
    layout: Layout,
    #[serde(default)]
    dynamic: bool,
}

impl ArrayShape {
    /// Array with the default descending layout.
    #[must_use]
    pub fn new(element_type: PrimitiveType, dims: &[i64]) -> Self {
        Self {
            element_type,
            dims: dims.iter().copied().collect(),
            layout: Layout::descending(dims.len()),
            dynamic: false,
        }
    }

    /// Array with an explicit minor-to-major layout.
    #[must_use]
    pub fn with_layout(element_type: PrimitiveType, dims: &[i64], minor_to_major: &[usize]) -> Self {
        Self {
            element_type,
            dims: dims.iter().copied().collect(),
            layout: Layout::new(minor_to_major.iter().copied()),
            dynamic: false,
        }
    }

    /// The same bounds as a dynamic array.
    #[must_use]
    pub fn into_dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Returns true if the buffer carries runtime dimension sizes.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// A rank-0 array.
    #[must_use]
    pub fn scalar(element_type: PrimitiveType) -> Self {
        Self::new(element_type, &[])
    }

    /// Element type.
    #[must_use]
    pub fn element_type(&self) -> PrimitiveType {
        self.element_type
    }

    /// All extents.
    #[must_use]
    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// Extent of one dimension.
    #[must_use]
    pub fn dim(&self, i: usize) -> i64 {
        self.dims[i]
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// The physical layout.
    #[must_use]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Returns true for rank-0 arrays.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Total element count.
    #[must_use]
    pub fn num_elements(&self) -> i64 {
        self.dims.iter().product()
    }

    /// Size of the element data in bytes.
    #[must_use]
    pub fn data_byte_size(&self) -> u64 {
        self.num_elements() as u64 * self.element_type.byte_size() as u64
    }

    /// Size of the array's storage in bytes, including the runtime sizes of
    /// a dynamic array.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        let metadata = if self.dynamic { 4 * self.rank() as u64 } else { 0 };
        self.data_byte_size() + metadata
    }

    /// Returns true if both shapes have identical extents.
    #[must_use]
    pub fn same_dimensions(&self, other: &ArrayShape) -> bool {
        self.dims == other.dims
    }

    /// Same extents and layout, element type replaced.
    #[must_use]
    pub fn with_element_type(&self, element_type: PrimitiveType) -> Self {
        Self {
            element_type,
            dims: self.dims.clone(),
            layout: self.layout.clone(),
            dynamic: self.dynamic,
        }
    }

    /// Same physical memory order, expressed with a descending layout.
    ///
    /// The returned dimensions are this shape's extents in major-to-minor
    /// physical order.
    #[must_use]
    pub fn with_descending_layout_same_physical(&self) -> Self {
        let dims: DimVec = self
            .layout
            .major_to_minor()
            .iter()
            .map(|&d| self.dims[d])
            .collect();
        Self {
            element_type: self.element_type,
            layout: Layout::descending(dims.len()),
            dims,
            dynamic: false,
        }
    }

    /// Physical linear position of a multi-dimensional index.
    #[must_use]
    pub fn linearize(&self, index: &[i64]) -> i64 {
        let mut linear = 0;
        let mut stride = 1;
        for &d in self.layout.minor_to_major() {
            linear += index[d] * stride;
            stride *= self.dims[d];
        }
        linear
    }

    /// Multi-dimensional index of a physical linear position.
    #[must_use]
    pub fn delinearize(&self, mut linear: i64) -> DimVec {
        let mut index: DimVec = smallvec::smallvec![0; self.rank()];
        for &d in self.layout.minor_to_major() {
            let extent = self.dims[d];
            index[d] = linear % extent;
            linear /= extent;
        }
        index
    }

    /// Splits the shape into `[major, middle, minor]` element counts, where
    /// `middle` covers `dims_middle` (which must be physically consecutive).
    #[must_use]
    pub fn partition_by_middle_dimensions(&self, dims_middle: &[usize]) -> [i64; 3] {
        const MAJOR: usize = 0;
        const MIDDLE: usize = 1;
        const MINOR: usize = 2;
        let mut values = [1_i64; 3];
        let mut segment = MINOR;
        for &d in self.layout.minor_to_major() {
            if segment != MAJOR {
                let in_middle = dims_middle.contains(&d);
                if segment == MINOR && in_middle {
                    segment = MIDDLE;
                } else if segment == MIDDLE && !in_middle {
                    segment = MAJOR;
                }
            }
            values[segment] *= self.dims[d];
        }
        values
    }
}

impl fmt::Display for ArrayShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.element_type)?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]{")?;
        for (i, d) in self.layout.minor_to_major().iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("}")?;
        if self.dynamic {
            f.write_str(" dynamic")?;
        }
        Ok(())
    }
}

/// A value's shape: an array or a tuple of shapes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    /// A dense array.
    Array(ArrayShape),
    /// An ordered tuple.
    Tuple(Vec<Shape>),
}

impl Shape {
    /// Array shape with a descending layout.
    #[must_use]
    pub fn array(element_type: PrimitiveType, dims: &[i64]) -> Self {
        Self::Array(ArrayShape::new(element_type, dims))
    }

    /// Array shape with an explicit layout.
    #[must_use]
    pub fn array_with_layout(
        element_type: PrimitiveType,
        dims: &[i64],
        minor_to_major: &[usize],
    ) -> Self {
        Self::Array(ArrayShape::with_layout(element_type, dims, minor_to_major))
    }

    /// Rank-0 array.
    #[must_use]
    pub fn scalar(element_type: PrimitiveType) -> Self {
        Self::Array(ArrayShape::scalar(element_type))
    }

    /// Tuple of shapes.
    #[must_use]
    pub fn tuple(elements: Vec<Shape>) -> Self {
        Self::Tuple(elements)
    }

    /// Returns true for arrays.
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// Returns true for tuples.
    #[must_use]
    pub fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    /// The array shape, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&ArrayShape> {
        match self {
            Self::Array(a) => Some(a),
            Self::Tuple(_) => None,
        }
    }

    /// The array shape, or an error naming this shape.
    pub fn array_shape(&self) -> HloResult<&ArrayShape> {
        self.as_array().ok_or_else(|| HloError::NotAnArray {
            shape: self.to_string(),
        })
    }

    /// Tuple elements; empty for arrays.
    #[must_use]
    pub fn tuple_shapes(&self) -> &[Shape] {
        match self {
            Self::Tuple(elements) => elements,
            Self::Array(_) => &[],
        }
    }

    /// The subshape at `index`.
    #[must_use]
    pub fn subshape(&self, index: &[usize]) -> Option<&Shape> {
        let mut current = self;
        for &i in index {
            current = current.tuple_shapes().get(i)?;
        }
        Some(current)
    }

    /// The subshape at `index`, or an error.
    pub fn try_subshape(&self, index: &[usize]) -> HloResult<&Shape> {
        self.subshape(index)
            .ok_or_else(|| HloError::InvalidShapeIndex {
                index: index.to_vec(),
                shape: self.to_string(),
            })
    }

    /// All subshapes in pre-order (the root first).
    #[must_use]
    pub fn subshapes(&self) -> Vec<(ShapeIndex, &Shape)> {
        fn walk<'a>(shape: &'a Shape, prefix: &mut ShapeIndex, out: &mut Vec<(ShapeIndex, &'a Shape)>) {
            out.push((prefix.clone(), shape));
            for (i, element) in shape.tuple_shapes().iter().enumerate() {
                prefix.push(i);
                walk(element, prefix, out);
                prefix.pop();
            }
        }
        let mut out = Vec::new();
        walk(self, &mut ShapeIndex::new(), &mut out);
        out
    }

    /// All array leaves with their indices.
    #[must_use]
    pub fn array_subshapes(&self) -> Vec<(ShapeIndex, &ArrayShape)> {
        self.subshapes()
            .into_iter()
            .filter_map(|(index, shape)| shape.as_array().map(|a| (index, a)))
            .collect()
    }

    /// Storage size: array bytes, or one 8-byte pointer per tuple element.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        match self {
            Self::Array(a) => a.byte_size(),
            Self::Tuple(elements) => 8 * elements.len() as u64,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array(a) => write!(f, "{a}"),
            Self::Tuple(elements) => {
                f.write_str("(")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<ArrayShape> for Shape {
    fn from(a: ArrayShape) -> Self {
        Self::Array(a)
    }
}

/// Start positions of maximal runs where `values[i] == values[i - 1] + 1`.
fn consecutive_segments(values: &[usize]) -> SmallVec<[usize; 4]> {
    let mut starts = SmallVec::new();
    for i in 0..values.len() {
        if i == 0 || values[i] != values[i - 1] + 1 {
            starts.push(i);
        }
    }
    starts
}

/// Detects whether `b` is a 0-2-1 transpose of `a` in physical memory.
///
/// Both shapes must have the same logical extents. Physical dimensions are
/// merged into maximal runs that stay adjacent in both layouts; if that
/// leaves the form `[A, B, C] -> [A, C, B]` (or `[B, C] -> [C, B]`), the
/// normalized extents of `b` are returned, major to minor.
#[must_use]
pub fn find_transpose_021(a: &ArrayShape, b: &ArrayShape) -> Option<[i64; 3]> {
    if !a.same_dimensions(b) || a.rank() < 2 {
        return None;
    }
    let major_to_minor_a = a.layout().major_to_minor();
    let major_to_minor_b = b.layout().major_to_minor();
    let permutation: SmallVec<[usize; 4]> = major_to_minor_a
        .iter()
        .map(|d| major_to_minor_b.iter().position(|x| x == d))
        .collect::<Option<_>>()?;
    let segments = consecutive_segments(&permutation);
    if !((segments.len() == 3 && permutation[0] == 0) || segments.len() == 2) {
        return None;
    }
    let mut merged: SmallVec<[i64; 3]> = SmallVec::new();
    for (s, &start) in segments.iter().enumerate() {
        let end = segments.get(s + 1).copied().unwrap_or(permutation.len());
        merged.push(
            major_to_minor_a[start..end]
                .iter()
                .map(|&d| a.dim(d))
                .product(),
        );
    }
    if segments.len() == 2 {
        Some([1, merged[1], merged[0]])
    } else {
        Some([merged[0], merged[2], merged[1]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_sizes() {
        assert!(PrimitiveType::S8.is_signed_integral());
        assert!(!PrimitiveType::U8.is_signed_integral());
        assert!(PrimitiveType::U64.is_unsigned_integral());
        assert!(!PrimitiveType::F32.is_unsigned_integral());
        assert_eq!(PrimitiveType::F32.byte_size(), 4);
        assert_eq!(PrimitiveType::Pred.byte_size(), 1);
        assert_eq!(PrimitiveType::U16.bit_width(), 16);
        assert_eq!(PrimitiveType::Pred.bit_width(), 1);
    }

    #[test]
    fn test_linearize_descending() {
        let shape = ArrayShape::new(PrimitiveType::F32, &[3, 4]);
        assert_eq!(shape.linearize(&[1, 2]), 6);
        assert_eq!(shape.delinearize(6).as_slice(), &[1, 2]);
    }

    #[test]
    fn test_linearize_column_major() {
        let shape = ArrayShape::with_layout(PrimitiveType::F32, &[3, 4], &[0, 1]);
        assert_eq!(shape.linearize(&[1, 2]), 7);
        assert_eq!(shape.delinearize(7).as_slice(), &[1, 2]);
    }

    #[test]
    fn test_subshapes_preorder() {
        let shape = Shape::tuple(vec![
            Shape::array(PrimitiveType::F32, &[2]),
            Shape::tuple(vec![Shape::scalar(PrimitiveType::S32)]),
        ]);
        let indices: Vec<Vec<usize>> = shape
            .subshapes()
            .into_iter()
            .map(|(i, _)| i.to_vec())
            .collect();
        assert_eq!(indices, vec![vec![], vec![0], vec![1], vec![1, 0]]);
        assert_eq!(shape.byte_size(), 16);
        assert!(shape.subshape(&[1, 0]).is_some_and(Shape::is_array));
        assert!(shape.subshape(&[2]).is_none());
    }

    #[test]
    fn test_display() {
        let shape = Shape::array_with_layout(PrimitiveType::F32, &[3, 4], &[0, 1]);
        assert_eq!(shape.to_string(), "f32[3,4]{0,1}");
    }

    #[test]
    fn test_consecutive_dimensions() {
        let layout = Layout::new([2, 1, 0]);
        assert!(layout.are_dimensions_consecutive(&[0, 1]));
        assert!(!layout.are_dimensions_consecutive(&[0, 2]));
        assert!(layout.are_dimensions_consecutive(&[]));
    }

    #[test]
    fn test_partition_by_middle() {
        let shape = ArrayShape::new(PrimitiveType::F32, &[2, 3, 4, 5]);
        assert_eq!(shape.partition_by_middle_dimensions(&[1, 2]), [2, 12, 5]);
        assert_eq!(shape.partition_by_middle_dimensions(&[3]), [24, 5, 1]);
        assert_eq!(shape.partition_by_middle_dimensions(&[0]), [1, 2, 60]);
    }

    #[test]
    fn test_find_transpose_021_rank3() {
        let input = ArrayShape::new(PrimitiveType::F32, &[2, 3, 4]);
        let output = ArrayShape::with_layout(PrimitiveType::F32, &[2, 3, 4], &[1, 2, 0]);
        assert_eq!(find_transpose_021(&input, &output), Some([2, 4, 3]));
    }

    #[test]
    fn test_find_transpose_021_rank2() {
        let input = ArrayShape::new(PrimitiveType::F32, &[64, 48]);
        let output = ArrayShape::with_layout(PrimitiveType::F32, &[64, 48], &[0, 1]);
        assert_eq!(find_transpose_021(&input, &output), Some([1, 48, 64]));
    }

    #[test]
    fn test_find_transpose_021_merges_segments() {
        let input = ArrayShape::new(PrimitiveType::F32, &[2, 3, 4, 5]);
        // physical order of output: 0, 3, 1, 2
        let output = ArrayShape::with_layout(PrimitiveType::F32, &[2, 3, 4, 5], &[2, 1, 3, 0]);
        assert_eq!(find_transpose_021(&input, &output), Some([2, 5, 12]));
    }

    #[test]
    fn test_find_transpose_021_rejects_identity_and_other_permutations() {
        let input = ArrayShape::new(PrimitiveType::F32, &[2, 3, 4]);
        assert_eq!(find_transpose_021(&input, &input), None);
        let output = ArrayShape::with_layout(PrimitiveType::F32, &[2, 3, 4], &[0, 1, 2]);
        assert_eq!(find_transpose_021(&input, &output), None);
    }

    #[test]
    fn test_descending_same_physical() {
        let shape = ArrayShape::with_layout(PrimitiveType::F32, &[3, 4], &[0, 1]);
        let normalized = shape.with_descending_layout_same_physical();
        assert_eq!(normalized.dims(), &[4, 3]);
        assert_eq!(normalized.layout(), &Layout::descending(2));
    }

    #[test]
    fn test_dynamic_arrays_carry_sizes() {
        let shape = ArrayShape::new(PrimitiveType::F32, &[3, 4]).into_dynamic();
        assert!(shape.is_dynamic());
        assert_eq!(shape.data_byte_size(), 48);
        assert_eq!(shape.byte_size(), 56);
        assert!(shape.with_element_type(PrimitiveType::S32).is_dynamic());
        assert_eq!(shape.to_string(), "f32[3,4]{1,0} dynamic");
    }
}
