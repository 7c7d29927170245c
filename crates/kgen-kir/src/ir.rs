//! Kernel IR data structures.
//!
//! Statements are in three-address form: every [`Expr`] operand is a
//! [`ValueId`] defined by an earlier [`Stmt::Let`]. A `Let` inside a loop
//! body redefines its register on every iteration. State that must survive
//! across iterations or branches lives in local arrays.

use crate::{FuncId, GlobalId, LocalId, Scalar, ScalarType, SharedId, ValueId};
use bitflags::bitflags;
use kgen_index::IndexVec;
use serde::{Deserialize, Serialize};

/// Hardware-provided per-thread values. All are `u32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialReg {
    /// `%tid.x`
    ThreadIdX,
    /// `%ctaid.x`
    BlockIdX,
    /// `%ctaid.y`
    BlockIdY,
    /// `%ntid.x`
    BlockDimX,
    /// `%nctaid.x`
    GridDimX,
}

impl SpecialReg {
    /// PTX spelling.
    #[must_use]
    pub const fn ptx_name(self) -> &'static str {
        match self {
            Self::ThreadIdX => "%tid.x",
            Self::BlockIdX => "%ctaid.x",
            Self::BlockIdY => "%ctaid.y",
            Self::BlockDimX => "%ntid.x",
            Self::GridDimX => "%nctaid.x",
        }
    }
}

/// Memory address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSpace {
    /// Device memory, visible to every thread.
    Global,
    /// Per-block scratch memory.
    Shared,
    /// Per-thread scratch memory.
    Local,
}

impl AddressSpace {
    /// PTX state space qualifier.
    #[must_use]
    pub const fn ptx_name(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Shared => "shared",
            Self::Local => "local",
        }
    }
}

/// Binary arithmetic and logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    /// Wrapping or IEEE addition.
    Add,
    /// Wrapping or IEEE subtraction.
    Sub,
    /// Wrapping or IEEE multiplication.
    Mul,
    /// Division; integer division by zero yields all ones.
    Div,
    /// Remainder; integer remainder by zero yields the dividend.
    Rem,
    /// Minimum, NaN-propagating for floats.
    Min,
    /// Maximum, NaN-propagating for floats.
    Max,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Left shift.
    Shl,
    /// Right shift (arithmetic for signed types).
    Shr,
    /// Float power.
    Pow,
    /// Float `atan2`.
    Atan2,
}

/// Unary arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    /// Absolute value.
    Abs,
    /// Negation.
    Neg,
    /// Bitwise (or logical, for predicates) not.
    Not,
    /// e^x.
    Exp,
    /// Natural log.
    Log,
    /// Square root.
    Sqrt,
    /// Reciprocal square root.
    Rsqrt,
    /// Hyperbolic tangent.
    Tanh,
    /// Round down.
    Floor,
    /// Round up.
    Ceil,
    /// Sign as -1, 0 or 1 (NaN stays NaN).
    Sign,
    /// Sine.
    Sin,
    /// Cosine.
    Cos,
}

/// Comparisons. Integer signedness follows the operand type; float
/// comparisons are ordered except `Ne`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
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

/// Read-modify-write operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOp {
    /// Native `atom.add`.
    Add,
    /// Native `atom.min`.
    Min,
    /// Native `atom.max`.
    Max,
    /// Compare-and-swap loop around a two-argument function
    /// `(current, value) -> new`.
    Cas(FuncId),
}

/// Right-hand side of a [`Stmt::Let`]. The result type is the type of the
/// destination register.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// A constant.
    Const(Scalar),
    /// A special register.
    Special(SpecialReg),
    /// `lhs op rhs`.
    Binary {
        /// Operation.
        op: BinOp,
        /// Left operand.
        lhs: ValueId,
        /// Right operand.
        rhs: ValueId,
    },
    /// `op value`.
    Unary {
        /// Operation.
        op: UnOp,
        /// Operand.
        value: ValueId,
    },
    /// `lhs op rhs`, producing a predicate.
    Cmp {
        /// Comparison.
        op: CmpOp,
        /// Left operand.
        lhs: ValueId,
        /// Right operand.
        rhs: ValueId,
    },
    /// `cond ? on_true : on_false`.
    Select {
        /// Predicate.
        cond: ValueId,
        /// Value when true.
        on_true: ValueId,
        /// Value when false.
        on_false: ValueId,
    },
    /// Numeric conversion to the destination type.
    Cast(ValueId),
    /// Load from an address.
    Load {
        /// Address space.
        space: AddressSpace,
        /// Byte address.
        addr: ValueId,
    },
    /// Value of `value` in the lane `delta` above this one, or this
    /// lane's own value when that lane is outside the warp or inactive.
    ShflDown {
        /// Shuffled value.
        value: ValueId,
        /// Lane distance.
        delta: u32,
    },
    /// Pointer passed as kernel parameter `n`.
    ParamAddr(usize),
    /// Base address of a shared array.
    SharedAddr(SharedId),
    /// Base address of a local array.
    LocalAddr(LocalId),
    /// Base address of a module global.
    GlobalAddr(GlobalId),
}

/// A statement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// Define (or redefine) a register.
    Let {
        /// Destination.
        dst: ValueId,
        /// Value.
        expr: Expr,
    },
    /// Store a register to memory.
    Store {
        /// Address space.
        space: AddressSpace,
        /// Byte address.
        addr: ValueId,
        /// Stored value; its type decides the width.
        value: ValueId,
    },
    /// Two-way branch.
    If {
        /// Predicate.
        cond: ValueId,
        /// Taken when true.
        then_body: Block,
        /// Taken when false.
        else_body: Block,
    },
    /// Counted loop: `for var = start; var < end; var += step`.
    For {
        /// Induction register.
        var: ValueId,
        /// First value.
        start: ValueId,
        /// Exclusive bound.
        end: ValueId,
        /// Increment.
        step: ValueId,
        /// Loop body.
        body: Block,
    },
    /// Block-wide barrier.
    Barrier,
    /// Atomic read-modify-write.
    Atomic {
        /// Address space.
        space: AddressSpace,
        /// Combining operation.
        op: AtomicOp,
        /// Byte address.
        addr: ValueId,
        /// Operand.
        value: ValueId,
    },
    /// Call a function, binding its results.
    Call {
        /// Callee.
        func: FuncId,
        /// Arguments.
        args: Vec<ValueId>,
        /// Result registers.
        results: Vec<ValueId>,
    },
}

/// A sequence of statements.
pub type Block = Vec<Stmt>;

bitflags! {
    /// Kernel pointer parameter attributes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ParamFlags: u8 {
        /// The pointee is not reachable through any other parameter.
        const NOALIAS = 1;
        /// The kernel never writes through this pointer.
        const READ_ONLY = 1 << 1;
    }
}

/// A kernel pointer parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelParam {
    /// Parameter name.
    pub name: String,
    /// Attributes.
    pub flags: ParamFlags,
    /// Guaranteed pointer alignment in bytes.
    pub align: u32,
    /// Bytes known to be dereferenceable.
    pub dereferenceable: u64,
}

/// A shared-memory array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDecl {
    /// Symbol name.
    pub name: String,
    /// Element type.
    pub ty: ScalarType,
    /// Number of elements.
    pub len: u64,
}

impl SharedDecl {
    /// Size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.len * self.ty.byte_size() as u64
    }
}

/// A per-thread local array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDecl {
    /// Symbol name.
    pub name: String,
    /// Element type.
    pub ty: ScalarType,
    /// Number of elements.
    pub len: u64,
}

impl LocalDecl {
    /// Size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.len * self.ty.byte_size() as u64
    }
}

/// Constant data emitted as a module-level global.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDecl {
    /// Symbol name.
    pub name: String,
    /// Initial contents.
    pub bytes: Vec<u8>,
    /// Alignment in bytes.
    pub align: u32,
}

/// A kernel entry point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    /// Entry point name.
    pub name: String,
    /// Pointer parameters.
    pub params: Vec<KernelParam>,
    /// Shared arrays.
    pub shared: IndexVec<SharedId, SharedDecl>,
    /// Local arrays.
    pub locals: IndexVec<LocalId, LocalDecl>,
    /// Register types.
    pub values: IndexVec<ValueId, ScalarType>,
    /// Body.
    pub body: Block,
}

impl Kernel {
    /// Total shared memory in bytes.
    #[must_use]
    pub fn shared_bytes(&self) -> u64 {
        self.shared.iter().map(SharedDecl::byte_size).sum()
    }

    /// Number of statements, counting nested ones.
    #[must_use]
    pub fn statement_count(&self) -> usize {
        count_statements(&self.body)
    }

    /// Visit every statement, parents before their nested blocks.
    pub fn walk(&self, f: &mut impl FnMut(&Stmt)) {
        walk_block(&self.body, f);
    }
}

/// A scalar function, the lowered form of a nested computation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Parameter registers, bound from the call arguments.
    pub params: Vec<ValueId>,
    /// Result registers, read when the body finishes.
    pub results: Vec<ValueId>,
    /// Local arrays.
    pub locals: IndexVec<LocalId, LocalDecl>,
    /// Register types.
    pub values: IndexVec<ValueId, ScalarType>,
    /// Body.
    pub body: Block,
}

impl Function {
    /// Parameter types.
    #[must_use]
    pub fn param_types(&self) -> Vec<ScalarType> {
        self.params.iter().map(|&p| self.values[p]).collect()
    }

    /// Result types.
    #[must_use]
    pub fn result_types(&self) -> Vec<ScalarType> {
        self.results.iter().map(|&r| self.values[r]).collect()
    }
}

fn count_statements(block: &[Stmt]) -> usize {
    block
        .iter()
        .map(|stmt| match stmt {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => 1 + count_statements(then_body) + count_statements(else_body),
            Stmt::For { body, .. } => 1 + count_statements(body),
            _ => 1,
        })
        .sum()
}

fn walk_block(block: &[Stmt], f: &mut impl FnMut(&Stmt)) {
    for stmt in block {
        f(stmt);
        match stmt {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                walk_block(then_body, f);
                walk_block(else_body, f);
            }
            Stmt::For { body, .. } => walk_block(body, f),
            _ => {}
        }
    }
}

/// Kernels, functions and constant globals compiled together.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KirModule {
    /// Module name.
    pub name: String,
    /// Kernels in emission order.
    pub kernels: Vec<Kernel>,
    /// Functions.
    pub functions: IndexVec<FuncId, Function>,
    /// Constant globals.
    pub globals: IndexVec<GlobalId, GlobalDecl>,
}

impl KirModule {
    /// An empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a kernel.
    pub fn add_kernel(&mut self, kernel: Kernel) {
        self.kernels.push(kernel);
    }

    /// Add a function.
    pub fn add_function(&mut self, function: Function) -> FuncId {
        self.functions.push(function)
    }

    /// Add a constant global.
    pub fn add_global(&mut self, global: GlobalDecl) -> GlobalId {
        self.globals.push(global)
    }

    /// Find a kernel by name.
    #[must_use]
    pub fn kernel(&self, name: &str) -> Option<&Kernel> {
        self.kernels.iter().find(|k| k.name == name)
    }

    /// Returns true if a kernel, function or global already uses `name`.
    #[must_use]
    pub fn has_symbol(&self, name: &str) -> bool {
        self.kernels.iter().any(|k| k.name == name)
            || self.functions.iter().any(|f| f.name == name)
            || self.globals.iter().any(|g| g.name == name)
    }
}
