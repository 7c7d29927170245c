//! Lockstep interpretation of kernel IR.
//!
//! A block runs as one unit: each statement executes for every active
//! thread before the next begins. `if` splits the active mask, the two
//! sides running one after the other; a `for` keeps the threads whose
//! induction variable is still below its bound.
//!
//! Checks made while running:
//!
//! - a barrier must be reached by every thread of the block
//! - a shared-memory load must not see bytes another thread stored since
//!   the last barrier
//! - a shuffle reads its source lane only when that lane is active in the
//!   same warp; otherwise the lane keeps its own value
//! - atomics apply one thread at a time, in thread order

use crate::launch::LaunchDimensions;
use crate::memory::{DeviceMemory, DevicePtr};
use crate::{GpuError, GpuResult};
use fixedbitset::FixedBitSet;
use kgen_index::{Idx, IndexVec};
use kgen_kir::eval::{eval_binary, eval_cmp, eval_unary};
use kgen_kir::{
    AddressSpace, AtomicOp, BinOp, CmpOp, Expr, FuncId, Kernel, KirModule, Scalar, ScalarType,
    SpecialReg, Stmt, ValueId,
};

const WARP_SIZE: usize = 32;

/// Alignment of each shared or local array within its arena.
const ARRAY_ALIGN: u64 = 16;

const NO_WRITER: u32 = u32::MAX;

/// Work done by one kernel launch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LaunchStats {
    /// Blocks run.
    pub blocks: u64,
    /// Threads run.
    pub threads: u64,
    /// Barriers passed, counted once per block.
    pub barriers: u64,
    /// Atomic updates applied.
    pub atomics: u64,
}

/// Byte offsets of the arrays of one arena.
#[derive(Clone, Debug, Default)]
struct ArrayLayout {
    offsets: Vec<u64>,
    total: u64,
}

impl ArrayLayout {
    fn new(sizes: impl Iterator<Item = u64>) -> Self {
        let mut offsets = Vec::new();
        let mut total: u64 = 0;
        for size in sizes {
            let offset = total.div_ceil(ARRAY_ALIGN) * ARRAY_ALIGN;
            offsets.push(offset);
            total = offset + size;
        }
        Self { offsets, total }
    }
}

/// Everything shared by the blocks of one launch.
struct Env<'a> {
    module: &'a KirModule,
    kernel: &'a Kernel,
    params: &'a [DevicePtr],
    globals: &'a [DevicePtr],
    shared: ArrayLayout,
    kernel_locals: ArrayLayout,
    function_locals: Vec<ArrayLayout>,
    block_dim: u32,
    grid_dim: u32,
}

/// Run `kernel` over the grid of `launch`, with `params[i]` bound to its
/// `i`-th pointer parameter and `globals[g]` holding module global `g`.
pub(crate) fn run_kernel(
    memory: &mut DeviceMemory,
    module: &KirModule,
    kernel: &Kernel,
    params: &[DevicePtr],
    globals: &[DevicePtr],
    launch: LaunchDimensions,
) -> GpuResult<LaunchStats> {
    if launch.threads_per_block.y != 1 || launch.threads_per_block.z != 1 || launch.blocks.z != 1 {
        return Err(GpuError::RuntimeError(format!(
            "kernel {} launched with {launch}; only x threads and x/y blocks are simulated",
            kernel.name
        )));
    }
    if params.len() != kernel.params.len() {
        return Err(GpuError::RuntimeError(format!(
            "kernel {} takes {} parameters, launched with {}",
            kernel.name,
            kernel.params.len(),
            params.len()
        )));
    }
    let threads = usize::try_from(launch.threads_per_block.x)
        .map_err(|_| GpuError::RuntimeError(format!("block of {} threads", launch.threads_per_block.x)))?;
    let env = Env {
        module,
        kernel,
        params,
        globals,
        shared: ArrayLayout::new(kernel.shared.iter().map(|d| d.byte_size())),
        kernel_locals: ArrayLayout::new(kernel.locals.iter().map(|d| d.byte_size())),
        function_locals: module
            .functions
            .iter()
            .map(|f| ArrayLayout::new(f.locals.iter().map(|d| d.byte_size())))
            .collect(),
        block_dim: launch.threads_per_block.x as u32,
        grid_dim: launch.blocks.x as u32,
    };

    let mut stats = LaunchStats::default();
    let mask = full_mask(threads);
    for y in 0..launch.blocks.y {
        for x in 0..launch.blocks.x {
            let ids: Vec<u32> = (0..threads as u32).collect();
            let mut frame = Frame::new(
                &env,
                &mut *memory,
                &kernel.values,
                &env.kernel_locals,
                &ids,
                [x as u32, y as u32],
                env.shared.total,
            );
            frame.exec(&kernel.body, &mask)?;
            stats.blocks += 1;
            stats.threads += threads as u64;
            stats.barriers += frame.barriers;
            stats.atomics += frame.atomics;
        }
    }
    Ok(stats)
}

fn full_mask(n: usize) -> FixedBitSet {
    let mut mask = FixedBitSet::with_capacity(n);
    mask.insert_range(..);
    mask
}

fn is_empty(mask: &FixedBitSet) -> bool {
    mask.ones().next().is_none()
}

struct Thread {
    id: u32,
    regs: Vec<Scalar>,
    local: Vec<u8>,
}

/// One block of a kernel, or one thread inside a function call.
struct Frame<'a, 'm> {
    env: &'a Env<'a>,
    memory: &'m mut DeviceMemory,
    values: &'a IndexVec<ValueId, ScalarType>,
    locals: &'a ArrayLayout,
    block: [u32; 2],
    threads: Vec<Thread>,
    shared: Vec<u8>,
    writers: Vec<u32>,
    barriers: u64,
    atomics: u64,
}

impl<'a, 'm> Frame<'a, 'm> {
    fn new(
        env: &'a Env<'a>,
        memory: &'m mut DeviceMemory,
        values: &'a IndexVec<ValueId, ScalarType>,
        locals: &'a ArrayLayout,
        ids: &[u32],
        block: [u32; 2],
        shared_bytes: u64,
    ) -> Self {
        let regs: Vec<Scalar> = values.iter().map(|&ty| Scalar::zero(ty)).collect();
        let threads = ids
            .iter()
            .map(|&id| Thread {
                id,
                regs: regs.clone(),
                local: vec![0; locals.total as usize],
            })
            .collect();
        Self {
            env,
            memory,
            values,
            locals,
            block,
            threads,
            shared: vec![0; shared_bytes as usize],
            writers: vec![NO_WRITER; shared_bytes as usize],
            barriers: 0,
            atomics: 0,
        }
    }

    fn fault(&self, message: impl std::fmt::Display) -> GpuError {
        GpuError::RuntimeError(format!(
            "kernel {} block ({}, {}): {message}",
            self.env.kernel.name, self.block[0], self.block[1]
        ))
    }

    fn reg(&self, t: usize, value: ValueId) -> Scalar {
        self.threads[t].regs[value.index()]
    }

    fn set(&mut self, t: usize, value: ValueId, scalar: Scalar) {
        self.threads[t].regs[value.index()] = scalar;
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn exec(&mut self, body: &[Stmt], mask: &FixedBitSet) -> GpuResult<()> {
        for stmt in body {
            self.stmt(stmt, mask)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt, mask: &FixedBitSet) -> GpuResult<()> {
        match stmt {
            Stmt::Let {
                dst,
                expr: Expr::ShflDown { value, delta },
            } => self.shuffle_down(*dst, *value, *delta, mask),
            Stmt::Let { dst, expr } => {
                let ty = self.values[*dst];
                for t in mask.ones() {
                    let value = self.eval(t, ty, expr)?;
                    self.set(t, *dst, value);
                }
                Ok(())
            }
            Stmt::Store { space, addr, value } => {
                for t in mask.ones() {
                    let address = self.reg(t, *addr).bits();
                    let value = self.reg(t, *value);
                    self.store(t, *space, address, value, true)?;
                }
                Ok(())
            }
            Stmt::Barrier => {
                let arrived = mask.count_ones(..);
                if arrived != self.threads.len() {
                    return Err(self.fault(format_args!(
                        "barrier reached by {arrived} of {} threads",
                        self.threads.len()
                    )));
                }
                self.writers.fill(NO_WRITER);
                self.barriers += 1;
                Ok(())
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let mut then_mask = FixedBitSet::with_capacity(self.threads.len());
                let mut else_mask = FixedBitSet::with_capacity(self.threads.len());
                for t in mask.ones() {
                    if self.reg(t, *cond).as_bool() {
                        then_mask.insert(t);
                    } else {
                        else_mask.insert(t);
                    }
                }
                if !is_empty(&then_mask) {
                    self.exec(then_body, &then_mask)?;
                }
                if !is_empty(&else_mask) && !else_body.is_empty() {
                    self.exec(else_body, &else_mask)?;
                }
                Ok(())
            }
            Stmt::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                for t in mask.ones() {
                    let start = self.reg(t, *start);
                    self.set(t, *var, start);
                }
                loop {
                    let mut live = FixedBitSet::with_capacity(self.threads.len());
                    for t in mask.ones() {
                        if eval_cmp(CmpOp::Lt, self.reg(t, *var), self.reg(t, *end))?.as_bool() {
                            live.insert(t);
                        }
                    }
                    if is_empty(&live) {
                        return Ok(());
                    }
                    self.exec(body, &live)?;
                    for t in live.ones() {
                        let next = eval_binary(BinOp::Add, self.reg(t, *var), self.reg(t, *step))?;
                        self.set(t, *var, next);
                    }
                }
            }
            Stmt::Atomic {
                space,
                op,
                addr,
                value,
            } => {
                for t in mask.ones() {
                    let address = self.reg(t, *addr).bits();
                    let operand = self.reg(t, *value);
                    let old = self.load(t, *space, address, operand.ty(), false)?;
                    let new = match op {
                        AtomicOp::Add => eval_binary(BinOp::Add, old, operand)?,
                        AtomicOp::Min => eval_binary(BinOp::Min, old, operand)?,
                        AtomicOp::Max => eval_binary(BinOp::Max, old, operand)?,
                        AtomicOp::Cas(func) => {
                            let results = self.call(t, *func, &[old, operand])?;
                            results
                                .first()
                                .copied()
                                .ok_or_else(|| self.fault("atomic combiner returns nothing"))?
                        }
                    };
                    self.store(t, *space, address, new, false)?;
                    self.atomics += 1;
                }
                Ok(())
            }
            Stmt::Call {
                func,
                args,
                results,
            } => {
                for t in mask.ones() {
                    let actuals: Vec<Scalar> = args.iter().map(|&a| self.reg(t, a)).collect();
                    let outputs = self.call(t, *func, &actuals)?;
                    if outputs.len() != results.len() {
                        return Err(self.fault(format_args!(
                            "call returns {} values into {} registers",
                            outputs.len(),
                            results.len()
                        )));
                    }
                    for (&dst, value) in results.iter().zip(outputs) {
                        self.set(t, dst, value);
                    }
                }
                Ok(())
            }
        }
    }

    fn shuffle_down(&mut self, dst: ValueId, value: ValueId, delta: u32, mask: &FixedBitSet) -> GpuResult<()> {
        let n = self.threads.len();
        let received: Vec<(usize, Scalar)> = mask
            .ones()
            .map(|t| {
                let lane = t % WARP_SIZE;
                let source_lane = lane + delta as usize;
                let source = t - lane + source_lane;
                let from = if source_lane < WARP_SIZE && source < n && mask.contains(source) {
                    source
                } else {
                    t
                };
                (t, self.reg(from, value))
            })
            .collect();
        for (t, scalar) in received {
            self.set(t, dst, scalar);
        }
        Ok(())
    }

    /// Run `func` for thread `t`.
    fn call(&mut self, t: usize, func: FuncId, args: &[Scalar]) -> GpuResult<Vec<Scalar>> {
        let env = self.env;
        let function = env
            .module
            .functions
            .get(func)
            .ok_or_else(|| self.fault(format_args!("call of undefined function {}", func.index())))?;
        if function.params.len() != args.len() {
            return Err(self.fault(format_args!(
                "{} takes {} arguments, called with {}",
                function.name,
                function.params.len(),
                args.len()
            )));
        }
        let layout = &env.function_locals[func.index()];
        let id = self.threads[t].id;
        let mut frame = Frame::new(env, &mut *self.memory, &function.values, layout, &[id], self.block, 0);
        for (&param, &arg) in function.params.iter().zip(args) {
            frame.set(0, param, arg);
        }
        frame.exec(&function.body, &full_mask(1))?;
        self.atomics += frame.atomics;
        Ok(function.results.iter().map(|&r| frame.reg(0, r)).collect())
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval(&self, t: usize, ty: ScalarType, expr: &Expr) -> GpuResult<Scalar> {
        let env = self.env;
        let value = match expr {
            Expr::Const(value) => value.cast(ty),
            Expr::Special(special) => Scalar::u32(match special {
                SpecialReg::ThreadIdX => self.threads[t].id,
                SpecialReg::BlockIdX => self.block[0],
                SpecialReg::BlockIdY => self.block[1],
                SpecialReg::BlockDimX => env.block_dim,
                SpecialReg::GridDimX => env.grid_dim,
            }),
            Expr::Binary { op, lhs, rhs } => {
                let a = self.reg(t, *lhs);
                let mut b = self.reg(t, *rhs);
                if matches!(op, BinOp::Shl | BinOp::Shr) {
                    b = b.cast(a.ty());
                }
                eval_binary(*op, a, b)?
            }
            Expr::Unary { op, value } => eval_unary(*op, self.reg(t, *value))?,
            Expr::Cmp { op, lhs, rhs } => eval_cmp(*op, self.reg(t, *lhs), self.reg(t, *rhs))?,
            Expr::Select {
                cond,
                on_true,
                on_false,
            } => {
                if self.reg(t, *cond).as_bool() {
                    self.reg(t, *on_true)
                } else {
                    self.reg(t, *on_false)
                }
            }
            Expr::Cast(value) => self.reg(t, *value).cast(ty),
            Expr::Load { space, addr } => self.load(t, *space, self.reg(t, *addr).bits(), ty, true)?,
            Expr::ShflDown { value, .. } => self.reg(t, *value),
            Expr::ParamAddr(position) => {
                let ptr = env
                    .params
                    .get(*position)
                    .ok_or_else(|| self.fault(format_args!("no parameter {position}")))?;
                Scalar::u64(ptr.as_raw())
            }
            Expr::SharedAddr(id) => {
                let offset = env
                    .shared
                    .offsets
                    .get(id.index())
                    .ok_or_else(|| self.fault(format_args!("no shared array {}", id.index())))?;
                Scalar::u64(*offset)
            }
            Expr::LocalAddr(id) => {
                let offset = self
                    .locals
                    .offsets
                    .get(id.index())
                    .ok_or_else(|| self.fault(format_args!("no local array {}", id.index())))?;
                Scalar::u64(*offset)
            }
            Expr::GlobalAddr(id) => {
                let ptr = env
                    .globals
                    .get(id.index())
                    .ok_or_else(|| self.fault(format_args!("no global {}", id.index())))?;
                Scalar::u64(ptr.as_raw())
            }
        };
        Ok(value)
    }

    // ========================================================================
    // Memory
    // ========================================================================

    fn arena_range(&self, space: AddressSpace, len: usize, address: u64, size: usize) -> GpuResult<std::ops::Range<usize>> {
        let start = usize::try_from(address).unwrap_or(usize::MAX);
        match start.checked_add(size) {
            Some(end) if end <= len => Ok(start..end),
            _ => Err(self.fault(format_args!(
                "{} access of {size} bytes at {address} outside its {len}-byte arena",
                space.ptx_name()
            ))),
        }
    }

    /// Load a `ty` at `address`. Tracked shared loads check for races.
    fn load(&self, t: usize, space: AddressSpace, address: u64, ty: ScalarType, tracked: bool) -> GpuResult<Scalar> {
        let size = ty.byte_size();
        let bytes = match space {
            AddressSpace::Global => self.memory.read(DevicePtr::from_raw(address), size)?,
            AddressSpace::Shared => {
                let range = self.arena_range(space, self.shared.len(), address, size)?;
                if tracked {
                    if let Some(&writer) = self.writers[range.clone()]
                        .iter()
                        .find(|&&w| w != NO_WRITER && w != t as u32)
                    {
                        return Err(self.fault(format_args!(
                            "shared memory race: thread {} reads offset {address} written by thread {writer} since the last barrier",
                            self.threads[t].id
                        )));
                    }
                }
                &self.shared[range]
            }
            AddressSpace::Local => {
                let local = &self.threads[t].local;
                let range = self.arena_range(space, local.len(), address, size)?;
                &local[range]
            }
        };
        Ok(Scalar::from_le_bytes(ty, bytes))
    }

    /// Store `value` at `address`. Tracked shared stores record the writer.
    fn store(&mut self, t: usize, space: AddressSpace, address: u64, value: Scalar, tracked: bool) -> GpuResult<()> {
        let bytes = value.to_le_bytes();
        match space {
            AddressSpace::Global => self.memory.write(DevicePtr::from_raw(address), &bytes)?,
            AddressSpace::Shared => {
                let range = self.arena_range(space, self.shared.len(), address, bytes.len())?;
                if tracked {
                    self.writers[range.clone()].fill(t as u32);
                }
                self.shared[range].copy_from_slice(&bytes);
            }
            AddressSpace::Local => {
                let len = self.threads[t].local.len();
                let range = self.arena_range(space, len, address, bytes.len())?;
                self.threads[t].local[range].copy_from_slice(&bytes);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgen_kir::{Builder, ParamFlags};

    fn run(module: &KirModule, memory: &mut DeviceMemory, params: &[DevicePtr], launch: LaunchDimensions) -> GpuResult<LaunchStats> {
        run_kernel(memory, module, &module.kernels[0], params, &[], launch)
    }

    fn read_u32s(memory: &DeviceMemory, ptr: DevicePtr, n: usize) -> Vec<u32> {
        memory
            .read(ptr, n * 4)
            .unwrap()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// out[block * dim + tid] = tid.
    fn thread_id_kernel() -> KirModule {
        let mut b = Builder::new("ids");
        let out = b.add_param("out", ParamFlags::NOALIAS, 16, 0);
        let tid = b.special(SpecialReg::ThreadIdX);
        let block = b.special(SpecialReg::BlockIdX);
        let dim = b.special(SpecialReg::BlockDimX);
        let base = b.mul(block, dim);
        let linear = b.add(base, tid);
        let ptr = b.param_addr(out);
        let addr = b.element_addr(ptr, linear, 4);
        b.store(AddressSpace::Global, addr, tid);
        let mut module = KirModule::new("m");
        module.add_kernel(b.finish_kernel());
        module
    }

    #[test]
    fn test_grid_covers_every_thread() {
        let module = thread_id_kernel();
        let mut memory = DeviceMemory::new();
        let out = memory.alloc(24, "out").unwrap();
        let stats = run(&module, &mut memory, &[out], LaunchDimensions::new(2, 3)).unwrap();
        assert_eq!(read_u32s(&memory, out, 6), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.threads, 6);
    }

    #[test]
    fn test_out_of_bounds_store_faults() {
        let module = thread_id_kernel();
        let mut memory = DeviceMemory::new();
        let out = memory.alloc(8, "out").unwrap();
        let err = run(&module, &mut memory, &[out], LaunchDimensions::new(1, 4)).unwrap_err();
        assert!(matches!(err, GpuError::RuntimeError(_)));
    }

    #[test]
    fn test_divergent_barrier_is_an_error() {
        let mut b = Builder::new("k");
        let tid = b.special(SpecialReg::ThreadIdX);
        let low = b.cmp_imm(CmpOp::Lt, tid, 2);
        b.if_then(low, |b| {
            b.barrier();
            Ok::<_, GpuError>(())
        })
        .unwrap();
        let mut module = KirModule::new("m");
        module.add_kernel(b.finish_kernel());
        let mut memory = DeviceMemory::new();
        let err = run(&module, &mut memory, &[], LaunchDimensions::new(1, 4)).unwrap_err();
        assert!(err.to_string().contains("barrier reached by 2 of 4 threads"));
    }

    /// Each thread stores its id to shared[tid] and reads shared[(tid + 1) % n].
    fn neighbour_kernel(with_barrier: bool) -> KirModule {
        let mut b = Builder::new("k");
        let out = b.add_param("out", ParamFlags::NOALIAS, 16, 0);
        let tile = b.alloc_shared("tile", ScalarType::U32, 4);
        let tid = b.special(SpecialReg::ThreadIdX);
        let base = b.shared_addr(tile);
        let mine = b.element_addr(base, tid, 4);
        b.store(AddressSpace::Shared, mine, tid);
        if with_barrier {
            b.barrier();
        }
        let next = b.binary_imm(BinOp::Add, tid, 1);
        let wrapped = b.binary_imm(BinOp::Rem, next, 4);
        let theirs = b.element_addr(base, wrapped, 4);
        let value = b.load(AddressSpace::Shared, ScalarType::U32, theirs);
        let ptr = b.param_addr(out);
        let addr = b.element_addr(ptr, tid, 4);
        b.store(AddressSpace::Global, addr, value);
        let mut module = KirModule::new("m");
        module.add_kernel(b.finish_kernel());
        module
    }

    #[test]
    fn test_shared_memory_after_barrier() {
        let module = neighbour_kernel(true);
        let mut memory = DeviceMemory::new();
        let out = memory.alloc(16, "out").unwrap();
        let stats = run(&module, &mut memory, &[out], LaunchDimensions::new(1, 4)).unwrap();
        assert_eq!(read_u32s(&memory, out, 4), vec![1, 2, 3, 0]);
        assert_eq!(stats.barriers, 1);
    }

    #[test]
    fn test_shared_memory_race_is_detected() {
        let module = neighbour_kernel(false);
        let mut memory = DeviceMemory::new();
        let out = memory.alloc(16, "out").unwrap();
        let err = run(&module, &mut memory, &[out], LaunchDimensions::new(1, 4)).unwrap_err();
        assert!(err.to_string().contains("shared memory race"));
    }

    #[test]
    fn test_shuffle_down_stays_in_warp() {
        let mut b = Builder::new("k");
        let out = b.add_param("out", ParamFlags::NOALIAS, 16, 0);
        let tid = b.special(SpecialReg::ThreadIdX);
        let shuffled = b.shfl_down(tid, 16);
        let ptr = b.param_addr(out);
        let addr = b.element_addr(ptr, tid, 4);
        b.store(AddressSpace::Global, addr, shuffled);
        let mut module = KirModule::new("m");
        module.add_kernel(b.finish_kernel());

        let mut memory = DeviceMemory::new();
        let out = memory.alloc(40 * 4, "out").unwrap();
        run(&module, &mut memory, &[out], LaunchDimensions::new(1, 40)).unwrap();
        let values = read_u32s(&memory, out, 40);
        assert_eq!(values[0], 16);
        assert_eq!(values[15], 31);
        // Lanes 16..32 would read past the warp.
        assert_eq!(values[16], 16);
        // The second warp has 8 lanes; lane 7 + 16 does not exist.
        assert_eq!(values[32], 32);
        assert_eq!(values[39], 39);
    }

    #[test]
    fn test_atomics_serialize() {
        let mut b = Builder::new("k");
        let out = b.add_param("out", ParamFlags::NOALIAS, 16, 0);
        let ptr = b.param_addr(out);
        let one = b.int(ScalarType::U32, 1);
        b.atomic(AddressSpace::Global, AtomicOp::Add, ptr, one);
        let mut module = KirModule::new("m");
        module.add_kernel(b.finish_kernel());

        let mut memory = DeviceMemory::new();
        let out = memory.alloc(4, "out").unwrap();
        let stats = run(&module, &mut memory, &[out], LaunchDimensions::new(3, 64)).unwrap();
        assert_eq!(read_u32s(&memory, out, 1), vec![192]);
        assert_eq!(stats.atomics, 192);
    }

    #[test]
    fn test_compare_and_swap_calls_function() {
        let mut module = KirModule::new("m");
        let mut f = Builder::new("mul");
        let x = f.fresh(ScalarType::S32);
        let y = f.fresh(ScalarType::S32);
        let product = f.mul(x, y);
        let mul = module.add_function(f.finish_function(vec![x, y], vec![product]));

        let mut b = Builder::new("k");
        let out = b.add_param("out", ParamFlags::NOALIAS, 16, 0);
        let ptr = b.param_addr(out);
        let two = b.int(ScalarType::S32, 2);
        b.atomic(AddressSpace::Global, AtomicOp::Cas(mul), ptr, two);
        module.add_kernel(b.finish_kernel());

        let mut memory = DeviceMemory::new();
        let out = memory.alloc(4, "out").unwrap();
        memory.write(out, &3i32.to_le_bytes()).unwrap();
        run(&module, &mut memory, &[out], LaunchDimensions::new(1, 5)).unwrap();
        assert_eq!(read_u32s(&memory, out, 1), vec![96]);
    }

    #[test]
    fn test_divergent_loop_trip_counts() {
        // out[tid] = sum of 0..tid
        let mut b = Builder::new("k");
        let out = b.add_param("out", ParamFlags::NOALIAS, 16, 0);
        let acc = b.alloc_local("acc", ScalarType::U32, 1);
        let tid = b.special(SpecialReg::ThreadIdX);
        let zero = b.int(ScalarType::U32, 0);
        let one = b.int(ScalarType::U32, 1);
        b.store_local(acc, 0, zero);
        b.for_loop(zero, tid, one, |b, i| {
            let current = b.load_local(acc, 0);
            let next = b.add(current, i);
            b.store_local(acc, 0, next);
            Ok::<_, GpuError>(())
        })
        .unwrap();
        let total = b.load_local(acc, 0);
        let ptr = b.param_addr(out);
        let addr = b.element_addr(ptr, tid, 4);
        b.store(AddressSpace::Global, addr, total);
        let mut module = KirModule::new("m");
        module.add_kernel(b.finish_kernel());

        let mut memory = DeviceMemory::new();
        let out = memory.alloc(20, "out").unwrap();
        run(&module, &mut memory, &[out], LaunchDimensions::new(1, 5)).unwrap();
        assert_eq!(read_u32s(&memory, out, 5), vec![0, 0, 1, 3, 6]);
    }
}
