//! Emitter configuration.
//!
//! Every knob has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! max_kernel_unroll_factor = 2
//! row_reduction_max_block_size = 128
//! ```

use crate::{GpuError, GpuResult};
use serde::{Deserialize, Serialize};

/// Knobs that change the generated code but never its results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Upper bound on elements per thread for loop kernels. Must be a power
    /// of two.
    pub max_kernel_unroll_factor: u64,

    /// Upper bound on threads per block for row reductions.
    pub row_reduction_max_block_size: u64,

    /// Number of replicas the program runs on.
    pub replica_count: u64,

    /// Allow grid-stride loops with a capped block count.
    pub enable_few_waves: bool,

    /// Use the shared-memory transpose for 0-2-1 copies and fusions.
    pub enable_tiled_transpose: bool,

    /// Tag every thunk with its position in the computation.
    pub hlo_profiling: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            max_kernel_unroll_factor: 4,
            row_reduction_max_block_size: 512,
            replica_count: 1,
            enable_few_waves: true,
            enable_tiled_transpose: true,
            hlo_profiling: false,
        }
    }
}

impl EmitterConfig {
    /// Parse a configuration from TOML.
    pub fn from_toml_str(text: &str) -> GpuResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| GpuError::InvalidConfig(format!("emitter config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every knob is in range.
    pub fn validate(&self) -> GpuResult<()> {
        if !self.max_kernel_unroll_factor.is_power_of_two() {
            return Err(GpuError::InvalidConfig(format!(
                "max_kernel_unroll_factor must be a power of two, got {}",
                self.max_kernel_unroll_factor
            )));
        }
        if self.row_reduction_max_block_size < 32 || self.row_reduction_max_block_size % 32 != 0 {
            return Err(GpuError::InvalidConfig(format!(
                "row_reduction_max_block_size must be a positive multiple of 32, got {}",
                self.row_reduction_max_block_size
            )));
        }
        if self.replica_count == 0 {
            return Err(GpuError::InvalidConfig(
                "replica_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EmitterConfig::default();
        assert_eq!(config.max_kernel_unroll_factor, 4);
        assert_eq!(config.row_reduction_max_block_size, 512);
        assert_eq!(config.replica_count, 1);
        assert!(config.enable_few_waves);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = EmitterConfig::from_toml_str("row_reduction_max_block_size = 128\n").unwrap();
        assert_eq!(config.row_reduction_max_block_size, 128);
        assert_eq!(config.max_kernel_unroll_factor, 4);
    }

    #[test]
    fn test_invalid_values() {
        let err = EmitterConfig::from_toml_str("max_kernel_unroll_factor = 3\n").unwrap_err();
        assert!(err.to_string().contains("power of two"));
        let err = EmitterConfig::from_toml_str("replica_count = 0\n").unwrap_err();
        assert!(matches!(err, GpuError::InvalidConfig(_)));
        let err = EmitterConfig::from_toml_str("enable_few_waves = 7\n").unwrap_err();
        assert!(matches!(err, GpuError::InvalidConfig(_)));
    }
}
