//! Executable units produced by the emitter.
//!
//! A program is a `Vec<Thunk>` run in order. Control-flow thunks own their
//! nested sequences.

use crate::launch::LaunchDimensions;
use kgen_hlo::{BinaryOp, BufferSlice};
use serde::{Deserialize, Serialize};

/// Provenance of a thunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThunkInfo {
    /// Name of the operation the thunk implements.
    pub op_name: String,
    /// Position of the operation in its computation, when profiling.
    pub profile_index: Option<usize>,
}

impl ThunkInfo {
    /// Info for `op_name`.
    #[must_use]
    pub fn new(op_name: impl Into<String>, profile_index: Option<usize>) -> Self {
        Self {
            op_name: op_name.into(),
            profile_index,
        }
    }
}

/// One unit of device work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Thunk {
    /// Launch a kernel.
    Kernel {
        /// Provenance.
        info: ThunkInfo,
        /// Kernel entry point.
        kernel_name: String,
        /// Allocation indices bound to the kernel's parameters, in order.
        args: Vec<usize>,
        /// Launch geometry.
        launch: LaunchDimensions,
    },
    /// Device-to-device copy.
    Copy {
        /// Provenance.
        info: ThunkInfo,
        /// Source bytes.
        source: BufferSlice,
        /// Destination bytes.
        destination: BufferSlice,
    },
    /// Fill with a repeated 32-bit pattern.
    Memset32 {
        /// Provenance.
        info: ThunkInfo,
        /// Pattern.
        value: u32,
        /// Filled bytes.
        destination: BufferSlice,
    },
    /// Fill with zeros.
    Memzero {
        /// Provenance.
        info: ThunkInfo,
        /// Filled bytes.
        destination: BufferSlice,
    },
    /// Run thunks in order.
    Sequential {
        /// Provenance.
        info: ThunkInfo,
        /// Nested thunks.
        thunks: Vec<Thunk>,
    },
    /// Run one of several sequences, picked by a predicate or an index.
    Conditional {
        /// Provenance.
        info: ThunkInfo,
        /// Holds the `pred` or `s32` selector.
        branch_index: BufferSlice,
        /// True when the selector is a `pred` (branch 0 runs on true).
        branch_index_is_bool: bool,
        /// One sequence per branch. Out-of-range indices run the last.
        branches: Vec<Vec<Thunk>>,
    },
    /// Run a sequence a fixed number of times.
    For {
        /// Provenance.
        info: ThunkInfo,
        /// Trip count.
        loop_limit: i64,
        /// Loop body.
        body: Vec<Thunk>,
    },
    /// Run `condition`, then `body` while the predicate it writes is true.
    While {
        /// Provenance.
        info: ThunkInfo,
        /// Where `condition` leaves its `pred`.
        condition_result: BufferSlice,
        /// Condition sequence.
        condition: Vec<Thunk>,
        /// Body sequence.
        body: Vec<Thunk>,
    },
    /// Write a table of element pointers.
    Tuple {
        /// Provenance.
        info: ThunkInfo,
        /// Element buffers, in tuple order.
        elements: Vec<BufferSlice>,
        /// Pointer table.
        destination: BufferSlice,
    },
    /// Combine buffers across replicas.
    AllReduce {
        /// Provenance.
        info: ThunkInfo,
        /// Combining operation.
        reducer: BinaryOp,
        /// `(source, destination)` per operand.
        buffers: Vec<(BufferSlice, BufferSlice)>,
        /// Participating replicas.
        replica_count: u64,
    },
    /// Send `source` to other replicas and receive `destination` from them.
    CollectivePermute {
        /// Provenance.
        info: ThunkInfo,
        /// `(source replica, target replica)` pairs.
        source_target_pairs: Vec<(i64, i64)>,
        /// Bytes sent.
        source: BufferSlice,
        /// Bytes received; zero on replicas no pair targets.
        destination: BufferSlice,
        /// Participating replicas.
        replica_count: u64,
    },
    /// Write this replica's id as `u32`.
    ReplicaId {
        /// Provenance.
        info: ThunkInfo,
        /// Destination.
        destination: BufferSlice,
    },
}

impl Thunk {
    /// Provenance of this thunk.
    #[must_use]
    pub fn info(&self) -> &ThunkInfo {
        match self {
            Self::Kernel { info, .. }
            | Self::Copy { info, .. }
            | Self::Memset32 { info, .. }
            | Self::Memzero { info, .. }
            | Self::Sequential { info, .. }
            | Self::Conditional { info, .. }
            | Self::For { info, .. }
            | Self::While { info, .. }
            | Self::Tuple { info, .. }
            | Self::AllReduce { info, .. }
            | Self::CollectivePermute { info, .. }
            | Self::ReplicaId { info, .. } => info,
        }
    }

    /// Short name of the variant.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Kernel { .. } => "kernel",
            Self::Copy { .. } => "copy",
            Self::Memset32 { .. } => "memset32",
            Self::Memzero { .. } => "memzero",
            Self::Sequential { .. } => "sequential",
            Self::Conditional { .. } => "conditional",
            Self::For { .. } => "for",
            Self::While { .. } => "while",
            Self::Tuple { .. } => "tuple",
            Self::AllReduce { .. } => "all-reduce",
            Self::CollectivePermute { .. } => "collective-permute",
            Self::ReplicaId { .. } => "replica-id",
        }
    }

    /// Kernel launches in this thunk, counting nested ones once each.
    #[must_use]
    pub fn kernel_count(&self) -> usize {
        match self {
            Self::Kernel { .. } => 1,
            Self::Sequential { thunks, .. } => thunks.iter().map(Self::kernel_count).sum(),
            Self::Conditional { branches, .. } => branches
                .iter()
                .flatten()
                .map(Self::kernel_count)
                .sum(),
            Self::For { body, .. } => body.iter().map(Self::kernel_count).sum(),
            Self::While {
                condition, body, ..
            } => condition.iter().chain(body).map(Self::kernel_count).sum(),
            _ => 0,
        }
    }

    /// Every kernel thunk's launch, depth first.
    #[must_use]
    pub fn kernel_launches(&self) -> Vec<(&str, LaunchDimensions)> {
        let mut out = Vec::new();
        self.collect_launches(&mut out);
        out
    }

    fn collect_launches<'a>(&'a self, out: &mut Vec<(&'a str, LaunchDimensions)>) {
        let nested: Box<dyn Iterator<Item = &Thunk>> = match self {
            Self::Kernel {
                kernel_name,
                launch,
                ..
            } => {
                out.push((kernel_name.as_str(), *launch));
                return;
            }
            Self::Sequential { thunks, .. } => Box::new(thunks.iter()),
            Self::Conditional { branches, .. } => Box::new(branches.iter().flatten()),
            Self::For { body, .. } => Box::new(body.iter()),
            Self::While {
                condition, body, ..
            } => Box::new(condition.iter().chain(body)),
            _ => return,
        };
        for thunk in nested {
            thunk.collect_launches(out);
        }
    }
}

/// Wrap `thunks` in a [`Thunk::Sequential`] unless there is exactly one.
#[must_use]
pub fn sequence_or_single(info: ThunkInfo, mut thunks: Vec<Thunk>) -> Option<Thunk> {
    match thunks.len() {
        0 => None,
        1 => thunks.pop(),
        _ => Some(Thunk::Sequential { info, thunks }),
    }
}
