//! Single-device simulator for compiled executables.
//!
//! The simulator stands in for a GPU runtime: it backs every buffer
//! allocation with [`DeviceMemory`](crate::memory::DeviceMemory), walks the
//! thunk sequence and interprets each kernel launch block by block.
//!
//! ```text
//! GpuExecutable ──▶ Executor::new ──▶ write_parameter ──▶ run ──▶ read_output
//!                     │                                    │
//!                     │ allocations, constants, globals    │ thunks
//!                     ▼                                    ▼
//!                DeviceMemory ◀──────────────────── lockstep kernel interpreter
//! ```
//!
//! Collectives across replicas are rejected with
//! [`GpuError::RuntimeError`](crate::GpuError::RuntimeError).

pub mod executor;
mod interp;

pub use executor::{ExecutionStats, Executor};
pub use interp::LaunchStats;
