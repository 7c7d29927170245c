//! Thunk execution against simulated device memory.

use super::interp::{run_kernel, LaunchStats};
use crate::device::DeviceInfo;
use crate::memory::{DeviceMemory, DevicePtr};
use crate::thunk::Thunk;
use crate::{GpuError, GpuExecutable, GpuResult};
use kgen_hlo::{AllocationKind, BufferSlice};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Size of one pointer-table entry.
const POINTER_BYTES: usize = 8;

/// Counters accumulated over [`Executor::run`] calls.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Kernel launches.
    pub kernel_launches: u64,
    /// Blocks run across all launches.
    pub blocks: u64,
    /// Threads run across all launches.
    pub threads: u64,
    /// Block-wide barriers passed.
    pub barriers: u64,
    /// Atomic updates applied.
    pub atomics: u64,
    /// Device-to-device copies.
    pub copies: u64,
    /// Bytes moved by copies.
    pub bytes_copied: u64,
    /// Memset and memzero fills.
    pub fills: u64,
    /// Iterations of `for` and `while` bodies.
    pub loop_iterations: u64,
}

impl ExecutionStats {
    fn add_launch(&mut self, launch: LaunchStats) {
        self.kernel_launches += 1;
        self.blocks += launch.blocks;
        self.threads += launch.threads;
        self.barriers += launch.barriers;
        self.atomics += launch.atomics;
    }
}

/// Runs a [`GpuExecutable`] on the simulator.
///
/// Every allocation of the executable is backed by one device allocation,
/// created zeroed. Constant allocations and module globals are initialized
/// from the executable; tuple-shaped entry parameters get their pointer
/// tables filled in.
///
/// # Example
///
/// ```rust,ignore
/// let mut executor = Executor::new(&executable, &DeviceInfo::mock())?;
/// executor.write_parameter(0, &[], &bytes)?;
/// executor.run()?;
/// let output = executor.read_output(&[])?;
/// ```
pub struct Executor<'e> {
    executable: &'e GpuExecutable,
    device: DeviceInfo,
    memory: DeviceMemory,
    buffers: Vec<DevicePtr>,
    globals: Vec<DevicePtr>,
    stats: ExecutionStats,
}

impl<'e> Executor<'e> {
    /// Allocate and initialize device memory for `executable`.
    pub fn new(executable: &'e GpuExecutable, device: &DeviceInfo) -> GpuResult<Self> {
        let mut memory = DeviceMemory::new();
        let mut buffers = Vec::with_capacity(executable.allocations.len());
        for allocation in &executable.allocations {
            let label = match allocation.kind() {
                AllocationKind::EntryParameter { number, index } => format!("parameter {number} {index:?}"),
                AllocationKind::Constant { .. } => format!("constant allocation {}", allocation.index()),
                AllocationKind::Temp => "temp allocation".to_string(),
                AllocationKind::Output => format!("output allocation {}", allocation.index()),
            };
            buffers.push(memory.alloc(allocation.size(), label)?);
        }
        for (&index, bytes) in &executable.constants {
            let ptr = buffers
                .get(index)
                .copied()
                .ok_or_else(|| GpuError::Internal(format!("constant for missing allocation {index}")))?;
            memory.write(ptr, bytes)?;
        }

        let mut globals = Vec::with_capacity(executable.kir.globals.len());
        for global in executable.kir.globals.iter() {
            let ptr = memory.alloc(global.bytes.len() as u64, global.name.clone())?;
            memory.write(ptr, &global.bytes)?;
            globals.push(ptr);
        }

        let mut executor = Self {
            executable,
            device: device.clone(),
            memory,
            buffers,
            globals,
            stats: ExecutionStats::default(),
        };
        executor.write_parameter_tables()?;
        debug!(
            allocations = executor.buffers.len(),
            globals = executor.globals.len(),
            bytes = executor.memory.usage().live_bytes,
            device = %executor.device,
            "executor ready"
        );
        Ok(executor)
    }

    fn write_parameter_tables(&mut self) -> GpuResult<()> {
        let executable = self.executable;
        for (number, shape) in executable.parameter_shapes.iter().enumerate() {
            for (index, subshape) in shape.subshapes() {
                if !subshape.is_tuple() {
                    continue;
                }
                let mut table = Vec::with_capacity(subshape.tuple_shapes().len() * POINTER_BYTES);
                for i in 0..subshape.tuple_shapes().len() {
                    let mut element = index.to_vec();
                    element.push(i);
                    let ptr = self.buffers[self.parameter_allocation(number, &element)?];
                    table.extend_from_slice(&ptr.as_raw().to_le_bytes());
                }
                let ptr = self.buffers[self.parameter_allocation(number, &index)?];
                self.memory.write(ptr, &table)?;
            }
        }
        Ok(())
    }

    fn parameter_allocation(&self, number: usize, index: &[usize]) -> GpuResult<usize> {
        self.executable
            .allocations
            .iter()
            .position(|a| {
                matches!(a.kind(), AllocationKind::EntryParameter { number: n, index: i }
                    if *n == number && i.as_slice() == index)
            })
            .ok_or_else(|| GpuError::RuntimeError(format!("no allocation for parameter {number} at {index:?}")))
    }

    /// Upload the bytes of entry parameter `number` at subshape `index`.
    pub fn write_parameter(&mut self, number: usize, index: &[usize], bytes: &[u8]) -> GpuResult<()> {
        let allocation = self.parameter_allocation(number, index)?;
        let size = self.executable.allocations[allocation].size();
        if bytes.len() as u64 != size {
            return Err(GpuError::RuntimeError(format!(
                "parameter {number} at {index:?} holds {size} bytes, got {}",
                bytes.len()
            )));
        }
        self.memory.write(self.buffers[allocation], bytes)
    }

    /// Run every top-level thunk in order.
    pub fn run(&mut self) -> GpuResult<()> {
        let executable = self.executable;
        for thunk in &executable.thunks {
            self.execute(thunk)?;
        }
        debug!(
            launches = self.stats.kernel_launches,
            threads = self.stats.threads,
            copies = self.stats.copies,
            "executable finished"
        );
        Ok(())
    }

    fn slice_ptr(&self, slice: &BufferSlice) -> GpuResult<DevicePtr> {
        let base = self
            .buffers
            .get(slice.allocation)
            .ok_or_else(|| GpuError::RuntimeError(format!("slice {slice} names a missing allocation")))?;
        Ok(base.offset(slice.offset))
    }

    fn slice_len(slice: &BufferSlice) -> GpuResult<usize> {
        usize::try_from(slice.size).map_err(|_| GpuError::RuntimeError(format!("slice {slice} is too large")))
    }

    fn execute_all(&mut self, thunks: &[Thunk]) -> GpuResult<()> {
        for thunk in thunks {
            self.execute(thunk)?;
        }
        Ok(())
    }

    fn execute(&mut self, thunk: &Thunk) -> GpuResult<()> {
        trace!(kind = thunk.kind_name(), op = %thunk.info().op_name, "execute thunk");
        match thunk {
            Thunk::Kernel {
                kernel_name,
                args,
                launch,
                ..
            } => {
                let executable = self.executable;
                let kernel = executable
                    .kir
                    .kernel(kernel_name)
                    .ok_or_else(|| GpuError::RuntimeError(format!("no kernel named {kernel_name}")))?;
                if launch.thread_count() > self.device.threads_per_block_limit {
                    return Err(GpuError::RuntimeError(format!(
                        "kernel {kernel_name} launches {} threads per block; the device allows {}",
                        launch.thread_count(),
                        self.device.threads_per_block_limit
                    )));
                }
                if kernel.shared_bytes() > self.device.shared_memory_per_block {
                    return Err(GpuError::RuntimeError(format!(
                        "kernel {kernel_name} uses {} bytes of shared memory; the device has {}",
                        kernel.shared_bytes(),
                        self.device.shared_memory_per_block
                    )));
                }
                let params = args
                    .iter()
                    .map(|&a| {
                        self.buffers
                            .get(a)
                            .copied()
                            .ok_or_else(|| GpuError::RuntimeError(format!("kernel argument {a} is not an allocation")))
                    })
                    .collect::<GpuResult<Vec<_>>>()?;
                let stats = run_kernel(&mut self.memory, &executable.kir, kernel, &params, &self.globals, *launch)?;
                trace!(kernel = %kernel_name, %launch, atomics = stats.atomics, "kernel done");
                self.stats.add_launch(stats);
            }
            Thunk::Copy {
                source,
                destination,
                ..
            } => {
                if source.size != destination.size {
                    return Err(GpuError::RuntimeError(format!(
                        "copy from {source} to {destination} changes size"
                    )));
                }
                let (from, to) = (self.slice_ptr(source)?, self.slice_ptr(destination)?);
                self.memory.copy(from, to, Self::slice_len(source)?)?;
                self.stats.copies += 1;
                self.stats.bytes_copied += source.size;
            }
            Thunk::Memset32 {
                value, destination, ..
            } => {
                let to = self.slice_ptr(destination)?;
                self.memory.fill32(to, Self::slice_len(destination)?, *value)?;
                self.stats.fills += 1;
            }
            Thunk::Memzero { destination, .. } => {
                let to = self.slice_ptr(destination)?;
                self.memory.fill32(to, Self::slice_len(destination)?, 0)?;
                self.stats.fills += 1;
            }
            Thunk::Sequential { thunks, .. } => self.execute_all(thunks)?,
            Thunk::Conditional {
                branch_index,
                branch_index_is_bool,
                branches,
                ..
            } => {
                let Some(last) = branches.len().checked_sub(1) else {
                    return Ok(());
                };
                let selector = self.slice_ptr(branch_index)?;
                let branch = if *branch_index_is_bool {
                    let taken = self.memory.read(selector, 1)?[0] != 0;
                    if taken {
                        0
                    } else {
                        1.min(last)
                    }
                } else {
                    let bytes = self.memory.read(selector, 4)?;
                    let index = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    usize::try_from(index).ok().filter(|&i| i < last).unwrap_or(last)
                };
                debug!(branch, op = %thunk.info().op_name, "conditional");
                self.execute_all(&branches[branch])?;
            }
            Thunk::For { loop_limit, body, .. } => {
                for _ in 0..*loop_limit {
                    self.execute_all(body)?;
                    self.stats.loop_iterations += 1;
                }
            }
            Thunk::While {
                condition_result,
                condition,
                body,
                ..
            } => loop {
                self.execute_all(condition)?;
                let predicate = self.slice_ptr(condition_result)?;
                if self.memory.read(predicate, 1)?[0] == 0 {
                    break;
                }
                self.execute_all(body)?;
                self.stats.loop_iterations += 1;
            },
            Thunk::Tuple {
                elements,
                destination,
                ..
            } => {
                let mut table = Vec::with_capacity(elements.len() * POINTER_BYTES);
                for element in elements {
                    table.extend_from_slice(&self.slice_ptr(element)?.as_raw().to_le_bytes());
                }
                if table.len() as u64 > destination.size {
                    return Err(GpuError::RuntimeError(format!(
                        "pointer table of {} entries does not fit {destination}",
                        elements.len()
                    )));
                }
                let to = self.slice_ptr(destination)?;
                self.memory.write(to, &table)?;
            }
            Thunk::AllReduce { replica_count, .. } => {
                return Err(GpuError::RuntimeError(format!(
                    "all-reduce across {replica_count} replicas needs a multi-device runtime"
                )));
            }
            Thunk::CollectivePermute {
                source_target_pairs,
                source,
                destination,
                replica_count,
                ..
            } => {
                if *replica_count > 1 {
                    return Err(GpuError::RuntimeError(format!(
                        "collective-permute across {replica_count} replicas needs a multi-device runtime"
                    )));
                }
                let to = self.slice_ptr(destination)?;
                if source_target_pairs.contains(&(0, 0)) {
                    if source.size != destination.size {
                        return Err(GpuError::RuntimeError(format!(
                            "collective-permute from {source} to {destination} changes size"
                        )));
                    }
                    let from = self.slice_ptr(source)?;
                    self.memory.copy(from, to, Self::slice_len(source)?)?;
                    self.stats.copies += 1;
                    self.stats.bytes_copied += source.size;
                } else {
                    self.memory.fill32(to, Self::slice_len(destination)?, 0)?;
                    self.stats.fills += 1;
                }
            }
            Thunk::ReplicaId { destination, .. } => {
                let to = self.slice_ptr(destination)?;
                self.memory.write(to, &0u32.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Download the bytes of `slice`.
    pub fn read_slice(&self, slice: &BufferSlice) -> GpuResult<Vec<u8>> {
        let ptr = self.slice_ptr(slice)?;
        Ok(self.memory.read(ptr, Self::slice_len(slice)?)?.to_vec())
    }

    /// Download the result subshape at `index`.
    pub fn read_output(&self, index: &[usize]) -> GpuResult<Vec<u8>> {
        let slice = self
            .executable
            .result_slices
            .iter()
            .find(|(i, _)| i.as_slice() == index)
            .map(|(_, slice)| *slice)
            .ok_or_else(|| GpuError::RuntimeError(format!("the result has no buffer at {index:?}")))?;
        self.read_slice(&slice)
    }

    /// Counters for the runs so far.
    #[must_use]
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// The simulated device memory.
    #[must_use]
    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::LaunchDimensions;
    use crate::thunk::ThunkInfo;
    use kgen_hlo::{BufferAllocation, BufferAssignment, PrimitiveType, Shape};
    use kgen_kir::KirModule;
    use rustc_hash::FxHashMap;

    fn info(name: &str) -> ThunkInfo {
        ThunkInfo::new(name, None)
    }

    /// Two 16-byte allocations: a parameter and an output.
    fn executable(thunks: Vec<Thunk>) -> GpuExecutable {
        let mut assignment = BufferAssignment::new();
        assignment.add_allocation(
            16,
            AllocationKind::EntryParameter {
                number: 0,
                index: Default::default(),
            },
        );
        assignment.add_allocation(16, AllocationKind::Output);
        let allocations: Vec<BufferAllocation> = assignment.allocations().to_vec();
        GpuExecutable {
            thunks,
            kir: KirModule::new("m"),
            allocations,
            constants: FxHashMap::default(),
            parameter_shapes: vec![Shape::array(PrimitiveType::S32, &[4])],
            result_shape: Shape::array(PrimitiveType::S32, &[4]),
            result_slices: vec![(Default::default(), BufferSlice::new(1, 0, 16))],
        }
    }

    fn words(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn bytes(words: &[i32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_copy_and_fill() {
        let exe = executable(vec![
            Thunk::Memset32 {
                info: info("fill"),
                value: 7,
                destination: BufferSlice::new(1, 0, 16),
            },
            Thunk::Copy {
                info: info("copy"),
                source: BufferSlice::new(0, 4, 8),
                destination: BufferSlice::new(1, 8, 8),
            },
        ]);
        let mut executor = Executor::new(&exe, &DeviceInfo::mock()).unwrap();
        executor.write_parameter(0, &[], &bytes(&[1, 2, 3, 4])).unwrap();
        executor.run().unwrap();
        assert_eq!(words(&executor.read_output(&[]).unwrap()), vec![7, 7, 2, 3]);
        assert_eq!(executor.stats().copies, 1);
        assert_eq!(executor.stats().fills, 1);
    }

    #[test]
    fn test_parameter_size_is_checked() {
        let exe = executable(Vec::new());
        let mut executor = Executor::new(&exe, &DeviceInfo::mock()).unwrap();
        let err = executor.write_parameter(0, &[], &[0; 4]).unwrap_err();
        assert!(err.to_string().contains("holds 16 bytes"));
        assert!(executor.write_parameter(1, &[], &[0; 16]).is_err());
    }

    #[test]
    fn test_for_loop_repeats_body() {
        let exe = executable(vec![
            Thunk::Copy {
                info: info("seed"),
                source: BufferSlice::new(0, 0, 16),
                destination: BufferSlice::new(1, 0, 16),
            },
            Thunk::For {
                info: info("loop"),
                loop_limit: 3,
                body: vec![Thunk::Copy {
                    info: info("shift"),
                    source: BufferSlice::new(1, 0, 12),
                    destination: BufferSlice::new(1, 4, 12),
                }],
            },
        ]);
        let mut executor = Executor::new(&exe, &DeviceInfo::mock()).unwrap();
        executor.write_parameter(0, &[], &bytes(&[5, 6, 7, 8])).unwrap();
        executor.run().unwrap();
        assert_eq!(words(&executor.read_output(&[]).unwrap()), vec![5, 5, 5, 5]);
        assert_eq!(executor.stats().loop_iterations, 3);
    }

    #[test]
    fn test_conditional_index_out_of_range_runs_last_branch() {
        let branch = |value: u32| {
            vec![Thunk::Memset32 {
                info: info("fill"),
                value,
                destination: BufferSlice::new(1, 0, 16),
            }]
        };
        let exe = executable(vec![Thunk::Conditional {
            info: info("cond"),
            branch_index: BufferSlice::new(0, 0, 4),
            branch_index_is_bool: false,
            branches: vec![branch(10), branch(20), branch(30)],
        }]);
        for (index, expected) in [(1, 20), (0, 10), (7, 30), (-1, 30)] {
            let mut executor = Executor::new(&exe, &DeviceInfo::mock()).unwrap();
            executor.write_parameter(0, &[], &bytes(&[index, 0, 0, 0])).unwrap();
            executor.run().unwrap();
            assert_eq!(words(&executor.read_output(&[]).unwrap())[0], expected);
        }
    }

    #[test]
    fn test_tuple_writes_pointer_table() {
        let exe = executable(vec![Thunk::Tuple {
            info: info("tuple"),
            elements: vec![BufferSlice::new(0, 0, 16), BufferSlice::new(0, 8, 8)],
            destination: BufferSlice::new(1, 0, 16),
        }]);
        let mut executor = Executor::new(&exe, &DeviceInfo::mock()).unwrap();
        executor.run().unwrap();
        let table = executor.read_output(&[]).unwrap();
        let first = u64::from_le_bytes(table[..8].try_into().unwrap());
        let second = u64::from_le_bytes(table[8..].try_into().unwrap());
        assert_eq!(second - first, 8);
    }

    #[test]
    fn test_all_reduce_is_rejected() {
        let exe = executable(vec![Thunk::AllReduce {
            info: info("ar"),
            reducer: kgen_hlo::BinaryOp::Add,
            buffers: vec![(BufferSlice::new(0, 0, 16), BufferSlice::new(1, 0, 16))],
            replica_count: 2,
        }]);
        let mut executor = Executor::new(&exe, &DeviceInfo::mock()).unwrap();
        let err = executor.run().unwrap_err();
        assert!(matches!(err, GpuError::RuntimeError(ref m) if m.contains("2 replicas")));
    }

    #[test]
    fn test_oversized_block_is_rejected() {
        let mut exe = executable(vec![Thunk::Kernel {
            info: info("k"),
            kernel_name: "k".to_string(),
            args: vec![],
            launch: LaunchDimensions::new(1, 2048),
        }]);
        exe.kir.add_kernel(kgen_kir::Builder::new("k").finish_kernel());
        let mut executor = Executor::new(&exe, &DeviceInfo::mock()).unwrap();
        let err = executor.run().unwrap_err();
        assert!(err.to_string().contains("2048 threads per block"));
    }
}
