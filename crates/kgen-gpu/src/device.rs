//! Target device description.
//!
//! Code generation only needs a handful of limits from the device: launch
//! bounds, warp width, shared memory, and the compute capability that picks
//! between reduction strategies.
//!
//! ```rust,ignore
//! use kgen_gpu::device::DeviceInfo;
//!
//! let device = DeviceInfo::mock();
//! assert_eq!(device.arch_name(), "sm_70");
//! ```

use crate::{GpuError, GpuResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where kernels run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// NVIDIA GPU (CUDA).
    Cuda,
    /// Simulated device; kernels run in [`crate::runtime`].
    Mock,
}

impl DeviceKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cuda => "CUDA",
            Self::Mock => "Mock",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Information about a GPU device.
///
/// Contains the hardware limits that affect kernel compilation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    /// Device type.
    pub kind: DeviceKind,

    /// Human-readable device name.
    pub name: String,

    /// Compute capability (major, minor), e.g. (7, 0) for sm_70.
    pub compute_capability: (u32, u32),

    /// Maximum threads per block.
    pub threads_per_block_limit: u64,

    /// Warp size.
    pub warp_size: u32,

    /// Shared memory per block in bytes.
    pub shared_memory_per_block: u64,

    /// Maximum resident threads per multiprocessor.
    pub threads_per_core_limit: u64,

    /// Number of multiprocessors.
    pub core_count: u64,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self::mock()
    }
}

impl DeviceInfo {
    /// Create a mock device for testing.
    #[must_use]
    pub fn mock() -> Self {
        Self {
            kind: DeviceKind::Mock,
            name: "Mock GPU Device".to_string(),
            compute_capability: (7, 0),
            threads_per_block_limit: 1024,
            warp_size: 32,
            shared_memory_per_block: 48 * 1024,
            threads_per_core_limit: 2048,
            core_count: 80,
        }
    }

    /// The mock device with a different compute capability.
    #[must_use]
    pub fn with_compute_capability(mut self, major: u32, minor: u32) -> Self {
        self.compute_capability = (major, minor);
        self
    }

    /// Parse a device description from TOML. Missing keys take the mock
    /// device's values.
    pub fn from_toml_str(text: &str) -> GpuResult<Self> {
        let device: Self = toml::from_str(text)
            .map_err(|e| GpuError::InvalidConfig(format!("device description: {e}")))?;
        device.validate()?;
        Ok(device)
    }

    /// Check the limits are usable for code generation.
    pub fn validate(&self) -> GpuResult<()> {
        if self.warp_size != 32 {
            return Err(GpuError::InvalidConfig(format!(
                "warp size must be 32, got {}",
                self.warp_size
            )));
        }
        if self.threads_per_block_limit < 32 || self.threads_per_core_limit == 0 || self.core_count == 0
        {
            return Err(GpuError::InvalidConfig(format!(
                "unusable launch limits on {}",
                self.name
            )));
        }
        Ok(())
    }

    /// Get the architecture name for code generation.
    #[must_use]
    pub fn arch_name(&self) -> String {
        format!(
            "sm_{}{}",
            self.compute_capability.0, self.compute_capability.1
        )
    }

    /// Check if this device supports the given compute capability.
    #[must_use]
    pub fn supports_compute(&self, major: u32, minor: u32) -> bool {
        self.compute_capability.0 > major
            || (self.compute_capability.0 == major && self.compute_capability.1 >= minor)
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, {} SMs)",
            self.name,
            self.kind,
            self.arch_name(),
            self.core_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device() {
        let device = DeviceInfo::mock();
        assert_eq!(device.kind, DeviceKind::Mock);
        assert_eq!(device.warp_size, 32);
        assert_eq!(device.threads_per_block_limit, 1024);
        assert_eq!(device.shared_memory_per_block, 48 * 1024);
        assert!(device.validate().is_ok());
    }

    #[test]
    fn test_arch_name() {
        assert_eq!(DeviceInfo::mock().arch_name(), "sm_70");
        let pascal = DeviceInfo::mock().with_compute_capability(6, 1);
        assert_eq!(pascal.arch_name(), "sm_61");
    }

    #[test]
    fn test_supports_compute() {
        let device = DeviceInfo::mock();
        assert!(device.supports_compute(6, 0));
        assert!(device.supports_compute(7, 0));
        assert!(!device.supports_compute(7, 5));
        assert!(!device.supports_compute(8, 0));
    }

    #[test]
    fn test_from_toml() {
        let device = DeviceInfo::from_toml_str(
            "kind = \"Cuda\"\nname = \"V100\"\ncompute_capability = [7, 0]\ncore_count = 84\n",
        )
        .unwrap();
        assert_eq!(device.kind, DeviceKind::Cuda);
        assert_eq!(device.core_count, 84);
        assert_eq!(device.threads_per_core_limit, 2048);
        assert!(device.to_string().contains("sm_70"));

        let err = DeviceInfo::from_toml_str("warp_size = 64\n").unwrap_err();
        assert!(matches!(err, GpuError::InvalidConfig(_)));
    }
}
