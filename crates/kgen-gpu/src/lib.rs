//! # kgen GPU Backend
//!
//! Kernel code generation and thunk sequencing for operator graphs.
//!
//! ## Overview
//!
//! Given an [`HloModule`] and the [`BufferAssignment`] that places every value
//! in memory, this crate produces a [`GpuExecutable`]: an ordered sequence of
//! [`Thunk`]s (kernel launches, device copies, fills and control flow) plus
//! the kernel IR module those launches refer to.
//!
//! - **Launch geometry**: block/thread counts and index widths
//! - **Kernel prototypes**: one `noalias` pointer per touched allocation
//! - **Loop kernels**: elementwise fusions, optionally unrolled
//! - **Tiled kernels**: reductions (warp shuffles + shared memory + atomics)
//!   and 0-2-1 transposes staged through shared memory
//! - **Scatter, select-and-scatter and bitonic sort** kernels
//! - **Control flow**: while, conditional and bounded-loop thunks
//! - **Dynamic shapes**: in-place dynamic-update-slice, `PadToStatic` and
//!   `SliceToDynamic` kernels
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────────────────┐
//!                     │  HloModule + BufferAssignment │
//!                     └──────────────┬───────────────┘
//!                                    │ post-order walk
//!                                    ▼
//!                       ┌────────────────────────┐
//!                       │   IrEmitterUnnested    │
//!                       └───┬───────────────┬────┘
//!                           │               │
//!                 ┌─────────▼──────┐  ┌─────▼───────────┐
//!                 │  Kernel IR     │  │  Thunk sequence │
//!                 │  (kgen-kir)    │  │                 │
//!                 └───┬────────┬───┘  └────────┬────────┘
//!                     │        │               │
//!               ┌─────▼───┐ ┌──▼───────────────▼──┐
//!               │ PTX text│ │ Simulator (runtime) │
//!               └─────────┘ └─────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kgen_gpu::{compile_module, DeviceInfo, EmitterConfig};
//! use kgen_gpu::runtime::Executor;
//!
//! let assignment = BufferAssignment::assign(&module)?;
//! let executable = compile_module(&module, &assignment, &EmitterConfig::default(), &DeviceInfo::mock())?;
//! println!("{}", executable.ptx()?);
//!
//! let mut executor = Executor::new(&executable, &DeviceInfo::mock())?;
//! executor.write_parameter(0, &[], &input_bytes)?;
//! executor.run()?;
//! let result = executor.read_output(&[])?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]

pub mod atomics;
pub mod codegen;
pub mod config;
pub mod context;
pub mod device;
pub mod dynamic;
pub mod elemental;
pub mod emitter;
pub mod initializer;
pub mod ir_array;
pub mod launch;
pub mod loop_emitter;
pub mod memory;
pub mod prototype;
pub mod reduction;
pub mod runtime;
pub mod scatter;
pub mod select_and_scatter;
pub mod sort;
pub mod thunk;
pub mod tile_emitter;
pub mod tiling;
pub mod transpose;

use kgen_hlo::{BufferAllocation, BufferAssignment, BufferSlice, HloError, HloModule, Shape, ShapeIndex};
use kgen_kir::{KirError, KirModule};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use config::EmitterConfig;
pub use device::{DeviceInfo, DeviceKind};
pub use emitter::IrEmitterUnnested;
pub use launch::{Dim3, LaunchDimensions};
pub use memory::{DeviceMemory, DevicePtr, MemoryUsage};
pub use thunk::{Thunk, ThunkInfo};
pub use tiling::{IndexingOrder, KernelMappingScheme};

/// Errors raised while generating or running GPU code.
#[derive(Debug, Error)]
pub enum GpuError {
    /// A recognized construct this backend does not support.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// An invariant established by an earlier pass does not hold.
    #[error("internal GPU error: {0}")]
    Internal(String),

    /// The input graph does not have the structure an emitter requires.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Invalid emitter or device configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operator graph or buffer assignment lookup failed.
    #[error(transparent)]
    Hlo(#[from] HloError),

    /// Kernel IR evaluation failed.
    #[error(transparent)]
    Kir(#[from] KirError),

    /// A fault while executing thunks in the simulator.
    #[error("GPU runtime error: {0}")]
    RuntimeError(String),
}

/// Result type for GPU operations.
pub type GpuResult<T> = Result<T, GpuError>;

/// Everything needed to run a compiled module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GpuExecutable {
    /// Top-level thunks, in execution order.
    pub thunks: Vec<Thunk>,
    /// Kernels, nested-computation functions and constant globals.
    pub kir: KirModule,
    /// The allocations thunks address by index.
    pub allocations: Vec<BufferAllocation>,
    /// Initial contents of constant allocations.
    pub constants: FxHashMap<usize, Vec<u8>>,
    /// Shapes of the entry parameters, by parameter number.
    pub parameter_shapes: Vec<Shape>,
    /// Shape of the entry result.
    pub result_shape: Shape,
    /// Where each subshape of the entry result lives.
    pub result_slices: Vec<(ShapeIndex, BufferSlice)>,
}

impl GpuExecutable {
    /// The kernel module as PTX text.
    pub fn ptx(&self, device: &DeviceInfo) -> GpuResult<String> {
        codegen::ptx::print_module(&self.kir, device)
    }

    /// Number of kernel launches, counting nested thunks.
    #[must_use]
    pub fn kernel_launch_count(&self) -> usize {
        self.thunks.iter().map(Thunk::kernel_count).sum()
    }

    /// The thunk sequence as pretty-printed JSON.
    pub fn thunks_to_json(&self) -> GpuResult<String> {
        serde_json::to_string_pretty(&self.thunks)
            .map_err(|e| GpuError::Internal(format!("cannot serialize thunks: {e}")))
    }
}

/// Compile every instruction of the entry computation into thunks.
///
/// # Errors
///
/// Returns the first error met by any emitter; no partial sequence is
/// produced.
pub fn compile_module(
    module: &HloModule,
    assignment: &BufferAssignment,
    config: &EmitterConfig,
    device: &DeviceInfo,
) -> GpuResult<GpuExecutable> {
    let entry = module.entry_computation()?;
    let mut emitter = IrEmitterUnnested::new(module, assignment, config, device);
    let thunks = emitter.emit_computation(entry.id())?;
    let kir = emitter.into_kir_module();

    let mut constants = FxHashMap::default();
    for allocation in assignment.allocations() {
        if let kgen_hlo::AllocationKind::Constant { instruction } = allocation.kind() {
            if let kgen_hlo::Opcode::Constant(literal) = module.instr(*instruction).opcode() {
                constants.insert(allocation.index(), literal.data().to_vec());
            }
        }
    }

    let parameter_shapes = entry
        .parameters()
        .iter()
        .map(|&p| module.instr(p).shape().clone())
        .collect();
    let root = module.instr(entry.root());
    let result_slices = root
        .shape()
        .subshapes()
        .into_iter()
        .filter_map(|(index, _)| {
            assignment
                .unique_slice(root.id(), &index)
                .map(|slice| (index, slice))
        })
        .collect();

    debug!(
        module = module.name(),
        thunks = thunks.len(),
        kernels = kir.kernels.len(),
        functions = kir.functions.len(),
        "compiled module"
    );

    Ok(GpuExecutable {
        thunks,
        kir,
        allocations: assignment.allocations().to_vec(),
        constants,
        parameter_shapes,
        result_shape: root.shape().clone(),
        result_slices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpuError::Unimplemented("Rng should be expanded for GPU.".to_string());
        assert!(err.to_string().contains("Rng should be expanded"));

        let err = GpuError::Internal("Inconsistent reduction fusion outputs".to_string());
        assert!(err.to_string().starts_with("internal GPU error"));
    }

    #[test]
    fn test_hlo_error_converts() {
        let err: GpuError = HloError::NoEntry("m".to_string()).into();
        assert!(matches!(err, GpuError::Hlo(_)));
        assert!(err.to_string().contains("no entry"));
    }
}
