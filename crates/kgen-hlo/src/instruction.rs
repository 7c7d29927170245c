//! Instructions and their operation kinds.

use crate::literal::Literal;
use crate::shape::{DimVec, Shape};
use crate::{CompId, InstrId};
use serde::{Deserialize, Serialize};

/// Elementwise unary operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Absolute value.
    Abs,
    /// Negation.
    Neg,
    /// Logical/bitwise not.
    Not,
    /// e^x.
    Exp,
    /// Natural log.
    Log,
    /// Square root.
    Sqrt,
    /// 1 / sqrt(x).
    Rsqrt,
    /// Hyperbolic tangent.
    Tanh,
    /// Round toward negative infinity.
    Floor,
    /// Round toward positive infinity.
    Ceil,
    /// -1, 0 or 1.
    Sign,
    /// Sine.
    Sin,
    /// Cosine.
    Cos,
}

/// Elementwise binary operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// a + b
    Add,
    /// a - b
    Subtract,
    /// a * b
    Multiply,
    /// a / b
    Divide,
    /// a % b
    Remainder,
    /// max(a, b)
    Maximum,
    /// min(a, b)
    Minimum,
    /// a ^ b
    Power,
    /// atan2(a, b)
    Atan2,
    /// Logical/bitwise and.
    And,
    /// Logical/bitwise or.
    Or,
    /// Logical/bitwise xor.
    Xor,
}

/// Comparison directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonDirection {
    /// ==
    Eq,
    /// !=
    Ne,
    /// <
    Lt,
    /// <=
    Le,
    /// >
    Gt,
    /// >=
    Ge,
}

/// How a fusion is code-generated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FusionKind {
    /// One thread per output element.
    Loop,
    /// Driven by the shape of an input (reductions, slices, scatter).
    Input,
}

/// One dimension of a sliding window.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowDimension {
    /// Window extent.
    pub size: i64,
    /// Step between windows.
    pub stride: i64,
    /// Padding before the first element.
    pub padding_low: i64,
    /// Padding after the last element.
    pub padding_high: i64,
    /// Dilation between window elements.
    pub window_dilation: i64,
    /// Dilation between operand elements.
    pub base_dilation: i64,
}

impl WindowDimension {
    /// An undilated window dimension.
    #[must_use]
    pub fn new(size: i64, stride: i64, padding_low: i64, padding_high: i64) -> Self {
        Self {
            size,
            stride,
            padding_low,
            padding_high,
            window_dilation: 1,
            base_dilation: 1,
        }
    }
}

/// A sliding window over every operand dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    /// Per-dimension window parameters.
    pub dimensions: Vec<WindowDimension>,
}

impl Window {
    /// Returns true if any dimension is dilated.
    #[must_use]
    pub fn has_dilation(&self) -> bool {
        self.dimensions
            .iter()
            .any(|d| d.window_dilation != 1 || d.base_dilation != 1)
    }
}

/// How scatter updates map onto operand dimensions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScatterDimensionNumbers {
    /// Update dimensions that are window dimensions.
    pub update_window_dims: Vec<usize>,
    /// Operand dimensions with an implicit window of size 1.
    pub inserted_window_dims: Vec<usize>,
    /// For each index-vector component, the operand dimension it offsets.
    pub scatter_dims_to_operand_dims: Vec<usize>,
    /// The dimension of the indices array holding index vectors.
    pub index_vector_dim: usize,
}

/// Operation kind plus its attributes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Computation parameter.
    Parameter {
        /// Parameter number.
        number: usize,
    },
    /// Constant array.
    Constant(Literal),
    /// Values equal to the index along `dimension`.
    Iota {
        /// Counting dimension.
        dimension: usize,
    },
    /// Elementwise unary.
    Unary(UnaryOp),
    /// Elementwise binary.
    Binary(BinaryOp),
    /// Elementwise comparison producing `pred`.
    Compare(ComparisonDirection),
    /// `pred ? on_true : on_false`.
    Select,
    /// `min(max(x, lo), hi)` with operands `(lo, x, hi)`.
    Clamp,
    /// Element type conversion.
    Convert,
    /// Broadcast; `dimensions[i]` is the output dimension of operand dimension `i`.
    Broadcast {
        /// Mapping from operand dims to output dims.
        dimensions: Vec<usize>,
    },
    /// Logical reshape in row-major order.
    Reshape,
    /// Reinterpretation of the same bytes under a new shape.
    Bitcast,
    /// Dimension permutation; output dim `i` is operand dim `dimensions[i]`.
    Transpose {
        /// The permutation.
        dimensions: Vec<usize>,
    },
    /// Copy, possibly changing layout.
    Copy,
    /// Strided sub-array.
    Slice {
        /// Inclusive starts.
        starts: DimVec,
        /// Exclusive limits.
        limits: DimVec,
        /// Strides.
        strides: DimVec,
    },
    /// A window of the operand at runtime start indices, given as one scalar
    /// operand per dimension after the array.
    DynamicSlice {
        /// Window extents.
        slice_sizes: DimVec,
    },
    /// The operand with `update` written at runtime start indices; operands
    /// are `(operand, update, start_0, .., start_n)`.
    DynamicUpdateSlice,
    /// Concatenation along one dimension.
    Concatenate {
        /// Joined dimension.
        dimension: usize,
    },
    /// Reduction of `operands[..n]` with inits `operands[n..]`.
    Reduce {
        /// Reduced dimensions.
        dimensions: Vec<usize>,
        /// Reducer computation.
        to_apply: CompId,
    },
    /// Elementwise application of a scalar computation.
    Map {
        /// Mapped computation.
        to_apply: CompId,
    },
    /// Tuple construction.
    Tuple,
    /// Tuple element extraction.
    GetTupleElement {
        /// Element index.
        index: usize,
    },
    /// Selects between two tuples with a scalar predicate.
    TupleSelect,
    /// The extent of a dimension as `s32`; the runtime size when the
    /// operand is dynamic.
    GetDimensionSize {
        /// Queried dimension.
        dimension: usize,
    },
    /// A fused sub-computation.
    Fusion {
        /// Code-generation strategy.
        kind: FusionKind,
        /// Fused body.
        fused: CompId,
    },
    /// Scatter of `updates` into `operand` at `indices`.
    Scatter {
        /// Dimension mapping.
        dimension_numbers: ScatterDimensionNumbers,
        /// Update combiner.
        to_apply: CompId,
        /// Indices are known to be distinct.
        unique_indices: bool,
    },
    /// Window selection plus scatter of `source` values.
    SelectAndScatter {
        /// Window over the operand.
        window: Window,
        /// Selection predicate `(a, b) -> pred`.
        select: CompId,
        /// Combiner for scattered values.
        scatter: CompId,
    },
    /// Sort of all operands along one dimension, keyed by the comparator.
    Sort {
        /// Sorted dimension.
        dimension: usize,
        /// Comparator over `2 * operand_count` scalars.
        comparator: CompId,
        /// Whether equal keys keep their order.
        is_stable: bool,
    },
    /// Loop while `condition` holds.
    While {
        /// Condition computation.
        condition: CompId,
        /// Body computation.
        body: CompId,
        /// Trip count, when known statically.
        known_trip_count: Option<i64>,
    },
    /// Branch on a predicate or an index.
    Conditional {
        /// Branch computations.
        branches: Vec<CompId>,
    },
    /// Cross-replica reduction.
    AllReduce {
        /// Reducer computation.
        to_apply: CompId,
    },
    /// The current replica id as `u32`.
    ReplicaId,
    /// Sends the operand from each source replica to its target replica.
    CollectivePermute {
        /// `(source, target)` replica pairs.
        source_target_pairs: Vec<(i64, i64)>,
    },
    /// A call to a named backend routine.
    CustomCall {
        /// Routine name.
        target: String,
    },
    /// Token join.
    AfterAll,
    /// Random number generation.
    Rng,
}

impl Opcode {
    /// Short name used in instruction names and diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Parameter { .. } => "parameter",
            Self::Constant(_) => "constant",
            Self::Iota { .. } => "iota",
            Self::Unary(op) => match op {
                UnaryOp::Abs => "abs",
                UnaryOp::Neg => "negate",
                UnaryOp::Not => "not",
                UnaryOp::Exp => "exponential",
                UnaryOp::Log => "log",
                UnaryOp::Sqrt => "sqrt",
                UnaryOp::Rsqrt => "rsqrt",
                UnaryOp::Tanh => "tanh",
                UnaryOp::Floor => "floor",
                UnaryOp::Ceil => "ceil",
                UnaryOp::Sign => "sign",
                UnaryOp::Sin => "sine",
                UnaryOp::Cos => "cosine",
            },
            Self::Binary(op) => match op {
                BinaryOp::Add => "add",
                BinaryOp::Subtract => "subtract",
                BinaryOp::Multiply => "multiply",
                BinaryOp::Divide => "divide",
                BinaryOp::Remainder => "remainder",
                BinaryOp::Maximum => "maximum",
                BinaryOp::Minimum => "minimum",
                BinaryOp::Power => "power",
                BinaryOp::Atan2 => "atan2",
                BinaryOp::And => "and",
                BinaryOp::Or => "or",
                BinaryOp::Xor => "xor",
            },
            Self::Compare(_) => "compare",
            Self::Select => "select",
            Self::Clamp => "clamp",
            Self::Convert => "convert",
            Self::Broadcast { .. } => "broadcast",
            Self::Reshape => "reshape",
            Self::Bitcast => "bitcast",
            Self::Transpose { .. } => "transpose",
            Self::Copy => "copy",
            Self::Slice { .. } => "slice",
            Self::DynamicSlice { .. } => "dynamic-slice",
            Self::DynamicUpdateSlice => "dynamic-update-slice",
            Self::Concatenate { .. } => "concatenate",
            Self::Reduce { .. } => "reduce",
            Self::Map { .. } => "map",
            Self::Tuple => "tuple",
            Self::GetTupleElement { .. } => "get-tuple-element",
            Self::TupleSelect => "tuple-select",
            Self::GetDimensionSize { .. } => "get-dimension-size",
            Self::Fusion { .. } => "fusion",
            Self::Scatter { .. } => "scatter",
            Self::SelectAndScatter { .. } => "select-and-scatter",
            Self::Sort { .. } => "sort",
            Self::While { .. } => "while",
            Self::Conditional { .. } => "conditional",
            Self::AllReduce { .. } => "all-reduce",
            Self::ReplicaId => "replica-id",
            Self::CollectivePermute { .. } => "collective-permute",
            Self::CustomCall { .. } => "custom-call",
            Self::AfterAll => "after-all",
            Self::Rng => "rng",
        }
    }

    /// Returns true if output element `i` depends only on operand elements `i`.
    #[must_use]
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Self::Unary(_)
                | Self::Binary(_)
                | Self::Compare(_)
                | Self::Select
                | Self::Clamp
                | Self::Convert
                | Self::Copy
                | Self::Map { .. }
        )
    }

    /// Nested computations referenced by this operation.
    #[must_use]
    pub fn called_computations(&self) -> Vec<CompId> {
        match self {
            Self::Reduce { to_apply, .. }
            | Self::Map { to_apply }
            | Self::Scatter { to_apply, .. }
            | Self::AllReduce { to_apply } => vec![*to_apply],
            Self::Fusion { fused, .. } => vec![*fused],
            Self::SelectAndScatter { select, scatter, .. } => vec![*select, *scatter],
            Self::Sort { comparator, .. } => vec![*comparator],
            Self::While {
                condition, body, ..
            } => vec![*condition, *body],
            Self::Conditional { branches } => branches.clone(),
            _ => Vec::new(),
        }
    }
}

/// A node of the operator graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HloInstruction {
    pub(crate) id: InstrId,
    pub(crate) name: String,
    pub(crate) opcode: Opcode,
    pub(crate) operands: Vec<InstrId>,
    pub(crate) users: Vec<InstrId>,
    pub(crate) shape: Shape,
    pub(crate) parent: CompId,
}

impl HloInstruction {
    /// This instruction's id.
    #[must_use]
    pub fn id(&self) -> InstrId {
        self.id
    }

    /// Unique name within the module.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operation kind.
    #[must_use]
    pub fn opcode(&self) -> &Opcode {
        &self.opcode
    }

    /// Operands in order.
    #[must_use]
    pub fn operands(&self) -> &[InstrId] {
        &self.operands
    }

    /// The `i`-th operand.
    #[must_use]
    pub fn operand(&self, i: usize) -> InstrId {
        self.operands[i]
    }

    /// Instructions that use this one, in creation order.
    #[must_use]
    pub fn users(&self) -> &[InstrId] {
        &self.users
    }

    /// Result shape.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The computation containing this instruction.
    #[must_use]
    pub fn parent(&self) -> CompId {
        self.parent
    }

    /// Returns true if this operation is elementwise.
    #[must_use]
    pub fn is_elementwise(&self) -> bool {
        self.opcode.is_elementwise()
    }

    /// The fused computation of a fusion instruction.
    #[must_use]
    pub fn fused_computation(&self) -> Option<CompId> {
        match self.opcode {
            Opcode::Fusion { fused, .. } => Some(fused),
            _ => None,
        }
    }
}
