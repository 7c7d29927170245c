//! # kgen HLO
//!
//! The operator-graph data model consumed by the GPU code generator.
//!
//! ## Overview
//!
//! A program is an [`HloModule`]: a set of [`HloComputation`]s, one of which
//! is the entry. Each computation is a DAG of [`HloInstruction`]s stored in
//! post order. Instructions reference nested computations for reducers,
//! comparators, fused bodies and control flow.
//!
//! Alongside the graph this crate carries the two collaborators the code
//! generator queries:
//!
//! - [`ReachabilityMap`]: precomputed "is `a` an ancestor of `b`" bitsets.
//! - [`BufferAssignment`]: which physical allocation (and byte range) backs
//!   every `(instruction, shape index)` pair.
//!
//! ## Pipeline Position
//!
//! ```text
//! [Operator graph]     <- This crate
//!     |
//!     +--> [Buffer assignment]   <- This crate (naive assigner)
//!     |
//!     v
//! [Kernel IR + thunks] <- kgen-gpu
//! ```
//!
//! ## Main Types
//!
//! - [`Shape`] / [`ArrayShape`] / [`Layout`]: element type, dims, physical order
//! - [`Literal`]: constant data
//! - [`Opcode`]: tagged operation kinds with their attributes
//! - [`ComputationBuilder`]: convenience API for constructing graphs

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use kgen_index::newtype_index;
use serde::{Deserialize, Serialize};

// ============================================================================
// Submodules
// ============================================================================

pub mod buffer;
pub mod instruction;
pub mod literal;
pub mod module;
pub mod reachability;
pub mod shape;

pub use buffer::{AllocationKind, BufferAllocation, BufferAssignment, BufferSlice};
pub use instruction::{
    BinaryOp, ComparisonDirection, FusionKind, HloInstruction, Opcode, ScatterDimensionNumbers,
    UnaryOp, Window, WindowDimension,
};
pub use literal::Literal;
pub use module::{
    scalar_binary_computation, scalar_compare_computation, ComputationBuilder, HloComputation,
    HloModule,
};
pub use reachability::ReachabilityMap;
pub use shape::{find_transpose_021, ArrayShape, DimVec, Layout, PrimitiveType, Shape, ShapeIndex};

newtype_index! {
    /// Identifies an instruction within an [`HloModule`].
    pub struct InstrId;
}

newtype_index! {
    /// Identifies a computation within an [`HloModule`].
    pub struct CompId;
}

/// Errors raised while building or querying the operator graph.
#[derive(Clone, Debug, thiserror::Error, Serialize, Deserialize)]
pub enum HloError {
    /// A shape was not what the operation requires.
    #[error("shape mismatch in {context}: {detail}")]
    ShapeMismatch {
        /// Where the mismatch was found.
        context: String,
        /// Description of the mismatch.
        detail: String,
    },

    /// A tuple shape was used where an array was required.
    #[error("expected array shape, got {shape}")]
    NotAnArray {
        /// The offending shape, formatted.
        shape: String,
    },

    /// A shape index does not address a subshape.
    #[error("invalid shape index {index:?} into {shape}")]
    InvalidShapeIndex {
        /// The index.
        index: Vec<usize>,
        /// The shape it was applied to.
        shape: String,
    },

    /// Literal data length does not match its shape.
    #[error("literal of shape {shape} needs {expected} bytes, got {got}")]
    LiteralSize {
        /// The literal shape.
        shape: String,
        /// Bytes required.
        expected: usize,
        /// Bytes supplied.
        got: usize,
    },

    /// The module has no entry computation.
    #[error("module {0} has no entry computation")]
    NoEntry(String),

    /// The buffer assigner met an instruction it cannot place.
    #[error("cannot assign buffers for {instruction}: {reason}")]
    Assignment {
        /// Instruction name.
        instruction: String,
        /// Why assignment failed.
        reason: String,
    },
}

/// Result type for graph operations.
pub type HloResult<T> = Result<T, HloError>;
