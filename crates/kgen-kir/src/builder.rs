//! Emission API for kernels and functions.
//!
//! The builder keeps a stack of open blocks. Structured control flow is
//! scoped by closures: [`Builder::if_then`] and [`Builder::for_loop`] open a
//! block, run the closure against it, and close it again, so the emitted
//! tree is always well nested.
//!
//! ```text
//! let tid = b.special(SpecialReg::ThreadIdX);
//! let n = b.int(ScalarType::U32, 128);
//! let in_bounds = b.cmp(CmpOp::Lt, tid, n);
//! b.if_then(in_bounds, |b| { ...; Ok::<_, E>(()) })?;
//! ```

use crate::ir::{
    AddressSpace, AtomicOp, BinOp, Block, CmpOp, Expr, Function, Kernel, KernelParam, LocalDecl,
    ParamFlags, SharedDecl, SpecialReg, Stmt, UnOp,
};
use crate::{FuncId, GlobalId, LocalId, Scalar, ScalarType, SharedId, ValueId};
use kgen_index::IndexVec;

/// Builds one [`Kernel`] or [`Function`].
#[derive(Debug)]
pub struct Builder {
    name: String,
    params: Vec<KernelParam>,
    shared: IndexVec<SharedId, SharedDecl>,
    locals: IndexVec<LocalId, LocalDecl>,
    values: IndexVec<ValueId, ScalarType>,
    frames: Vec<Block>,
}

impl Builder {
    /// Start building `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            shared: IndexVec::new(),
            locals: IndexVec::new(),
            values: IndexVec::new(),
            frames: vec![Vec::new()],
        }
    }

    /// Name of the kernel or function being built.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    // ========================================================================
    // Declarations
    // ========================================================================

    /// Declare a pointer parameter, returning its position.
    pub fn add_param(
        &mut self,
        name: impl Into<String>,
        flags: ParamFlags,
        align: u32,
        dereferenceable: u64,
    ) -> usize {
        self.params.push(KernelParam {
            name: name.into(),
            flags,
            align,
            dereferenceable,
        });
        self.params.len() - 1
    }

    /// Declared parameters.
    #[must_use]
    pub fn params(&self) -> &[KernelParam] {
        &self.params
    }

    /// Declare a shared-memory array.
    pub fn alloc_shared(&mut self, name: impl Into<String>, ty: ScalarType, len: u64) -> SharedId {
        self.shared.push(SharedDecl {
            name: name.into(),
            ty,
            len,
        })
    }

    /// Declare a per-thread local array.
    pub fn alloc_local(&mut self, name: impl Into<String>, ty: ScalarType, len: u64) -> LocalId {
        self.locals.push(LocalDecl {
            name: name.into(),
            ty,
            len,
        })
    }

    /// A register that is not yet defined (function parameters).
    pub fn fresh(&mut self, ty: ScalarType) -> ValueId {
        self.values.push(ty)
    }

    /// Type of a register.
    #[must_use]
    pub fn value_type(&self, value: ValueId) -> ScalarType {
        self.values[value]
    }

    // ========================================================================
    // Straight-line code
    // ========================================================================

    /// Append a statement to the innermost open block.
    pub fn push(&mut self, stmt: Stmt) {
        if let Some(frame) = self.frames.last_mut() {
            frame.push(stmt);
        }
    }

    /// Define a new register of type `ty` as `expr`.
    pub fn emit(&mut self, ty: ScalarType, expr: Expr) -> ValueId {
        let dst = self.fresh(ty);
        self.push(Stmt::Let { dst, expr });
        dst
    }

    /// A constant.
    pub fn constant(&mut self, value: Scalar) -> ValueId {
        self.emit(value.ty(), Expr::Const(value))
    }

    /// An integer (or float) constant of type `ty`.
    pub fn int(&mut self, ty: ScalarType, value: i64) -> ValueId {
        self.constant(Scalar::from_i64(ty, value))
    }

    /// An `f32` constant.
    pub fn f32(&mut self, value: f32) -> ValueId {
        self.constant(Scalar::f32(value))
    }

    /// A predicate constant.
    pub fn pred(&mut self, value: bool) -> ValueId {
        self.constant(Scalar::pred(value))
    }

    /// A special register, as `u32`.
    pub fn special(&mut self, reg: SpecialReg) -> ValueId {
        self.emit(ScalarType::U32, Expr::Special(reg))
    }

    /// Kernel parameter pointer.
    pub fn param_addr(&mut self, index: usize) -> ValueId {
        self.emit(ScalarType::U64, Expr::ParamAddr(index))
    }

    /// Shared array base address.
    pub fn shared_addr(&mut self, id: SharedId) -> ValueId {
        self.emit(ScalarType::U64, Expr::SharedAddr(id))
    }

    /// Local array base address.
    pub fn local_addr(&mut self, id: LocalId) -> ValueId {
        self.emit(ScalarType::U64, Expr::LocalAddr(id))
    }

    /// Module global base address.
    pub fn global_addr(&mut self, id: GlobalId) -> ValueId {
        self.emit(ScalarType::U64, Expr::GlobalAddr(id))
    }

    /// `lhs op rhs`, typed as `lhs`.
    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        debug_assert_eq!(self.values[lhs], self.values[rhs], "{op:?} operand types");
        let ty = self.values[lhs];
        self.emit(ty, Expr::Binary { op, lhs, rhs })
    }

    /// `lhs + rhs`.
    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Add, lhs, rhs)
    }

    /// `lhs - rhs`.
    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    /// `lhs * rhs`.
    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    /// `lhs / rhs`.
    pub fn div(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Div, lhs, rhs)
    }

    /// `lhs % rhs`.
    pub fn rem(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Rem, lhs, rhs)
    }

    /// `min(lhs, rhs)`.
    pub fn min(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::Min, lhs, rhs)
    }

    /// `lhs && rhs` on predicates.
    pub fn and(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinOp::And, lhs, rhs)
    }

    /// `lhs op constant`, with the constant typed as `lhs`.
    pub fn binary_imm(&mut self, op: BinOp, lhs: ValueId, rhs: i64) -> ValueId {
        let ty = self.values[lhs];
        let rhs = self.int(ty, rhs);
        self.binary(op, lhs, rhs)
    }

    /// `op value`.
    pub fn unary(&mut self, op: UnOp, value: ValueId) -> ValueId {
        let ty = self.values[value];
        self.emit(ty, Expr::Unary { op, value })
    }

    /// `lhs op rhs` as a predicate.
    pub fn cmp(&mut self, op: CmpOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        debug_assert_eq!(self.values[lhs], self.values[rhs], "{op:?} operand types");
        self.emit(ScalarType::Pred, Expr::Cmp { op, lhs, rhs })
    }

    /// `lhs op constant` as a predicate.
    pub fn cmp_imm(&mut self, op: CmpOp, lhs: ValueId, rhs: i64) -> ValueId {
        let ty = self.values[lhs];
        let rhs = self.int(ty, rhs);
        self.cmp(op, lhs, rhs)
    }

    /// `cond ? on_true : on_false`.
    pub fn select(&mut self, cond: ValueId, on_true: ValueId, on_false: ValueId) -> ValueId {
        let ty = self.values[on_true];
        self.emit(
            ty,
            Expr::Select {
                cond,
                on_true,
                on_false,
            },
        )
    }

    /// Convert `value` to `ty`; a no-op when the type already matches.
    pub fn cast(&mut self, value: ValueId, ty: ScalarType) -> ValueId {
        if self.values[value] == ty {
            value
        } else {
            self.emit(ty, Expr::Cast(value))
        }
    }

    /// Load a `ty` from `addr`.
    pub fn load(&mut self, space: AddressSpace, ty: ScalarType, addr: ValueId) -> ValueId {
        self.emit(ty, Expr::Load { space, addr })
    }

    /// Store `value` to `addr`.
    pub fn store(&mut self, space: AddressSpace, addr: ValueId, value: ValueId) {
        self.push(Stmt::Store { space, addr, value });
    }

    /// `base + index * elem_bytes`, with `index` widened to `u64`.
    pub fn element_addr(&mut self, base: ValueId, index: ValueId, elem_bytes: usize) -> ValueId {
        let index = self.cast(index, ScalarType::U64);
        let offset = if elem_bytes == 1 {
            index
        } else {
            self.binary_imm(BinOp::Mul, index, elem_bytes as i64)
        };
        self.add(base, offset)
    }

    /// `base + bytes`.
    pub fn byte_offset(&mut self, base: ValueId, bytes: u64) -> ValueId {
        if bytes == 0 {
            return base;
        }
        let offset = self.constant(Scalar::u64(bytes));
        self.add(base, offset)
    }

    /// Load element `index` of local array `id`.
    pub fn load_local(&mut self, id: LocalId, index: u64) -> ValueId {
        let ty = self.locals[id].ty;
        let base = self.local_addr(id);
        let addr = self.byte_offset(base, index * ty.byte_size() as u64);
        self.load(AddressSpace::Local, ty, addr)
    }

    /// Store into element `index` of local array `id`.
    pub fn store_local(&mut self, id: LocalId, index: u64, value: ValueId) {
        let ty = self.locals[id].ty;
        let base = self.local_addr(id);
        let addr = self.byte_offset(base, index * ty.byte_size() as u64);
        self.store(AddressSpace::Local, addr, value);
    }

    /// Value of `value` in the lane `delta` above.
    pub fn shfl_down(&mut self, value: ValueId, delta: u32) -> ValueId {
        let ty = self.values[value];
        self.emit(ty, Expr::ShflDown { value, delta })
    }

    /// Block-wide barrier.
    pub fn barrier(&mut self) {
        self.push(Stmt::Barrier);
    }

    /// Atomic read-modify-write of `value` into `addr`.
    pub fn atomic(&mut self, space: AddressSpace, op: AtomicOp, addr: ValueId, value: ValueId) {
        self.push(Stmt::Atomic {
            space,
            op,
            addr,
            value,
        });
    }

    /// Call `func`, defining one register per result type.
    pub fn call(&mut self, func: FuncId, args: &[ValueId], result_types: &[ScalarType]) -> Vec<ValueId> {
        let results: Vec<ValueId> = result_types.iter().map(|&ty| self.fresh(ty)).collect();
        self.push(Stmt::Call {
            func,
            args: args.to_vec(),
            results: results.clone(),
        });
        results
    }

    // ========================================================================
    // Control flow
    // ========================================================================

    fn scoped<E>(&mut self, f: impl FnOnce(&mut Self) -> Result<(), E>) -> Result<Block, E> {
        self.frames.push(Vec::new());
        let result = f(self);
        let block = self.frames.pop().unwrap_or_default();
        result.map(|()| block)
    }

    /// `if cond { then }`.
    pub fn if_then<E>(
        &mut self,
        cond: ValueId,
        then: impl FnOnce(&mut Self) -> Result<(), E>,
    ) -> Result<(), E> {
        let then_body = self.scoped(then)?;
        self.push(Stmt::If {
            cond,
            then_body,
            else_body: Vec::new(),
        });
        Ok(())
    }

    /// `if cond { then } else { otherwise }`.
    pub fn if_then_else<E>(
        &mut self,
        cond: ValueId,
        then: impl FnOnce(&mut Self) -> Result<(), E>,
        otherwise: impl FnOnce(&mut Self) -> Result<(), E>,
    ) -> Result<(), E> {
        let then_body = self.scoped(then)?;
        let else_body = self.scoped(otherwise)?;
        self.push(Stmt::If {
            cond,
            then_body,
            else_body,
        });
        Ok(())
    }

    /// `for iv = start; iv < end; iv += step { body(iv) }`. The induction
    /// variable has the type of `start`.
    pub fn for_loop<E>(
        &mut self,
        start: ValueId,
        end: ValueId,
        step: ValueId,
        body: impl FnOnce(&mut Self, ValueId) -> Result<(), E>,
    ) -> Result<(), E> {
        let var = self.fresh(self.values[start]);
        let body = self.scoped(|b| body(b, var))?;
        self.push(Stmt::For {
            var,
            start,
            end,
            step,
            body,
        });
        Ok(())
    }

    /// `for_loop` over `[0, end)` with constant bounds of type `ty`.
    pub fn for_range<E>(
        &mut self,
        ty: ScalarType,
        end: i64,
        body: impl FnOnce(&mut Self, ValueId) -> Result<(), E>,
    ) -> Result<(), E> {
        let start = self.int(ty, 0);
        let end = self.int(ty, end);
        let step = self.int(ty, 1);
        self.for_loop(start, end, step, body)
    }

    // ========================================================================
    // Finishing
    // ========================================================================

    fn take_body(&mut self) -> Block {
        let mut body = Vec::new();
        while let Some(frame) = self.frames.pop() {
            body = frame;
        }
        body
    }

    /// Finish as a kernel.
    #[must_use]
    pub fn finish_kernel(mut self) -> Kernel {
        let body = self.take_body();
        Kernel {
            name: self.name,
            params: self.params,
            shared: self.shared,
            locals: self.locals,
            values: self.values,
            body,
        }
    }

    /// Finish as a function with the given parameter and result registers.
    #[must_use]
    pub fn finish_function(mut self, params: Vec<ValueId>, results: Vec<ValueId>) -> Function {
        let body = self.take_body();
        Function {
            name: self.name,
            params,
            results,
            locals: self.locals,
            values: self.values,
            body,
        }
    }
}
