//! Property tests for kgen-hlo shapes.

use kgen_hlo::{ArrayShape, PrimitiveType};
use proptest::prelude::*;

/// Dimensions of rank 1 through 4 with a random minor-to-major order.
fn shape_with_any_layout() -> impl Strategy<Value = ArrayShape> {
    (1_usize..=4).prop_flat_map(|rank| {
        (
            prop::collection::vec(1_i64..6, rank),
            Just((0..rank).collect::<Vec<usize>>()).prop_shuffle(),
        )
            .prop_map(|(dims, minor_to_major)| ArrayShape::with_layout(PrimitiveType::F32, &dims, &minor_to_major))
    })
}

// ============================================================
// Layouts
// ============================================================

proptest! {
    #[test]
    fn linear_positions_round_trip(shape in shape_with_any_layout()) {
        let count: i64 = shape.dims().iter().product();
        for linear in 0..count {
            let index = shape.delinearize(linear);
            for (dim, &coord) in index.iter().enumerate() {
                prop_assert!((0..shape.dim(dim)).contains(&coord));
            }
            prop_assert_eq!(shape.linearize(&index), linear);
        }
    }

    #[test]
    fn most_minor_dimension_has_unit_stride(shape in shape_with_any_layout()) {
        let minor = shape.layout().minor_to_major()[0];
        let count: i64 = shape.dims().iter().product();
        for linear in 0..count {
            let mut index = shape.delinearize(linear);
            if index[minor] + 1 < shape.dim(minor) {
                index[minor] += 1;
                prop_assert_eq!(shape.linearize(&index), linear + 1);
            }
        }
    }
}
