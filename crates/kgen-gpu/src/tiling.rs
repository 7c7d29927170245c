//! How a `[z, y, x]` iteration space is split over blocks and threads.
//!
//! A block owns one tile of `tile_z × tile_y × tile_x` elements. Its
//! `num_threads_y × num_threads_x` threads walk the tile: each thread starts
//! at `(tid_y, start_x)` and steps by `num_threads_y` rows and, depending on
//! the [`IndexingOrder`], by `num_threads_x` or `1` columns.

use serde::{Deserialize, Serialize};

/// Dimension positions in a normalized 3-D shape.
pub const DIM_Z: usize = 0;
/// Middle dimension.
pub const DIM_Y: usize = 1;
/// Minor-most dimension.
pub const DIM_X: usize = 2;

/// How a thread's x offsets are laid out within a tile row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexingOrder {
    /// Each thread owns `tile_x / num_threads_x` contiguous elements.
    Linear,
    /// Thread `t` visits `t, t + num_threads_x, ...`.
    Strided,
    /// Like `Strided`, but in runs of `vector_size` contiguous elements.
    StridedLinear,
}

/// An immutable tiling of a 3-D iteration space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMappingScheme {
    dims_in_elems: [i64; 3],
    tile_sizes: [i64; 3],
    num_threads_y: i64,
    num_threads_x: i64,
    indexing_order: IndexingOrder,
    vector_size: i64,
    row_contiguous: bool,
}

impl KernelMappingScheme {
    /// A new scheme.
    ///
    /// `tile_sizes[DIM_Y]` must be a multiple of `num_threads_y` and
    /// `tile_sizes[DIM_X]` a multiple of `num_threads_x * vector_size`.
    #[must_use]
    pub fn new(
        dims_in_elems: [i64; 3],
        tile_sizes: [i64; 3],
        num_threads_y: i64,
        num_threads_x: i64,
        indexing_order: IndexingOrder,
        vector_size: i64,
        row_contiguous: bool,
    ) -> Self {
        debug_assert_eq!(tile_sizes[DIM_Y] % num_threads_y, 0);
        debug_assert_eq!(tile_sizes[DIM_X] % (num_threads_x * vector_size), 0);
        Self {
            dims_in_elems,
            tile_sizes,
            num_threads_y,
            num_threads_x,
            indexing_order,
            vector_size,
            row_contiguous,
        }
    }

    /// The iteration space.
    #[must_use]
    pub fn dims_in_elems(&self) -> [i64; 3] {
        self.dims_in_elems
    }

    /// Tiles per dimension, rounded up.
    #[must_use]
    pub fn dims_in_blocks(&self) -> [i64; 3] {
        [
            ceil_of_ratio(self.dims_in_elems[DIM_Z], self.tile_sizes[DIM_Z]),
            ceil_of_ratio(self.dims_in_elems[DIM_Y], self.tile_sizes[DIM_Y]),
            ceil_of_ratio(self.dims_in_elems[DIM_X], self.tile_sizes[DIM_X]),
        ]
    }

    /// Total blocks.
    #[must_use]
    pub fn number_of_blocks(&self) -> i64 {
        self.dims_in_blocks().iter().product()
    }

    /// Tile extent along `dim`.
    #[must_use]
    pub fn tile_size_for(&self, dim: usize) -> i64 {
        self.tile_sizes[dim]
    }

    /// Tile extent along z.
    #[must_use]
    pub fn tile_size_z(&self) -> i64 {
        self.tile_sizes[DIM_Z]
    }

    /// Tile extent along y.
    #[must_use]
    pub fn tile_size_y(&self) -> i64 {
        self.tile_sizes[DIM_Y]
    }

    /// Tile extent along x.
    #[must_use]
    pub fn tile_size_x(&self) -> i64 {
        self.tile_sizes[DIM_X]
    }

    /// Threads per block along y.
    #[must_use]
    pub fn num_threads_y(&self) -> i64 {
        self.num_threads_y
    }

    /// Threads per block along x.
    #[must_use]
    pub fn num_threads_x(&self) -> i64 {
        self.num_threads_x
    }

    /// Threads per block.
    #[must_use]
    pub fn threads_per_block(&self) -> i64 {
        self.num_threads_x * self.num_threads_y
    }

    /// How x offsets are assigned.
    #[must_use]
    pub fn indexing_order(&self) -> IndexingOrder {
        self.indexing_order
    }

    /// Contiguous elements per run for `StridedLinear`.
    #[must_use]
    pub fn vector_size(&self) -> i64 {
        self.vector_size
    }

    /// Returns true if consecutive rows are adjacent in memory, so whole
    /// rows can be iterated without a bounds check when the tile fits.
    #[must_use]
    pub fn row_contiguous(&self) -> bool {
        self.row_contiguous
    }

    /// Elements a thread visits along x per row.
    #[must_use]
    pub fn x_num_steps(&self) -> i64 {
        self.tile_sizes[DIM_X] / self.num_threads_x
    }

    /// Distance between a thread's consecutive runs along x.
    #[must_use]
    pub fn step_x(&self) -> i64 {
        match self.indexing_order {
            IndexingOrder::Linear => 1,
            IndexingOrder::Strided | IndexingOrder::StridedLinear => self.num_threads_x,
        }
    }

    /// First x offset of thread `tid_x` within its tile.
    #[must_use]
    pub fn start_offset_x(&self, tid_x: i64) -> i64 {
        match self.indexing_order {
            IndexingOrder::Strided => tid_x,
            IndexingOrder::StridedLinear => tid_x * self.vector_size,
            IndexingOrder::Linear => tid_x * self.x_num_steps(),
        }
    }

    /// The tile-relative x offsets thread `tid_x` visits, in order.
    #[must_use]
    pub fn thread_x_offsets(&self, tid_x: i64) -> Vec<i64> {
        let start = self.start_offset_x(tid_x);
        let vec = self.vector_size;
        let step = self.step_x();
        (0..self.x_num_steps() / vec)
            .flat_map(|j| (0..vec).map(move |i| j * step * vec + i + start))
            .collect()
    }

    /// Returns true if full tiles never need an x bounds check.
    #[must_use]
    pub fn x_tile_fits(&self) -> bool {
        self.dims_in_elems[DIM_X] % self.tile_sizes[DIM_X] == 0 && self.row_contiguous
    }
}

/// `ceil(a / b)` for positive `b`.
#[must_use]
pub fn ceil_of_ratio(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

/// Round `a` up to a multiple of `b`.
#[must_use]
pub fn round_up_to(a: i64, b: i64) -> i64 {
    ceil_of_ratio(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn scheme(order: IndexingOrder, vec: i64) -> KernelMappingScheme {
        KernelMappingScheme::new([2, 64, 1000], [1, 8, 256], 1, 32, order, vec, false)
    }

    #[test]
    fn test_block_counts() {
        let s = scheme(IndexingOrder::Strided, 1);
        assert_eq!(s.dims_in_blocks(), [2, 8, 4]);
        assert_eq!(s.number_of_blocks(), 64);
        assert_eq!(s.threads_per_block(), 32);
        assert!(!s.x_tile_fits());
    }

    #[test]
    fn test_thread_offsets_partition_the_row() {
        for (order, vec) in [
            (IndexingOrder::Linear, 1),
            (IndexingOrder::Strided, 1),
            (IndexingOrder::StridedLinear, 2),
        ] {
            let s = scheme(order, vec);
            let mut seen = BTreeSet::new();
            for tid in 0..s.num_threads_x() {
                for x in s.thread_x_offsets(tid) {
                    assert!(seen.insert(x), "{order:?} visits {x} twice");
                }
            }
            let expected: BTreeSet<i64> = (0..s.tile_size_x()).collect();
            assert_eq!(seen, expected, "{order:?}");
        }
    }

    #[test]
    fn test_offsets_shape() {
        let s = scheme(IndexingOrder::StridedLinear, 2);
        assert_eq!(&s.thread_x_offsets(1)[..4], &[2, 3, 66, 67]);
        let s = scheme(IndexingOrder::Linear, 1);
        assert_eq!(&s.thread_x_offsets(1)[..3], &[8, 9, 10]);
        let s = scheme(IndexingOrder::Strided, 1);
        assert_eq!(&s.thread_x_offsets(3)[..3], &[3, 35, 67]);
    }

    #[test]
    fn test_ratio_helpers() {
        assert_eq!(ceil_of_ratio(10, 4), 3);
        assert_eq!(ceil_of_ratio(8, 4), 2);
        assert_eq!(round_up_to(33, 32), 64);
    }
}
