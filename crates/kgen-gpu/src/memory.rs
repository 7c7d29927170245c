//! Simulated device memory.
//!
//! Allocations live in one flat 64-bit address space and are addressed by
//! [`DevicePtr`]. Kernels see the same addresses: a parameter pointer is the
//! base of its allocation and pointer tables hold raw `DevicePtr` values.
//!
//! ```text
//! 0x7000_0000_0000            0x7000_0000_0100
//! ┌──────────────────────────┐┌──────────────────┐
//! │ alloc0 (entry param 0)   ││ alloc1 (temp)    │ ...
//! └──────────────────────────┘└──────────────────┘
//!   256-byte aligned bases, accesses bounded by their allocation
//! ```

use crate::{GpuError, GpuResult};
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// First address handed out.
const BASE_ADDRESS: u64 = 0x7000_0000_0000;

/// Alignment of every allocation base.
pub const ALLOCATION_ALIGNMENT: u64 = 256;

/// A device memory address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub(crate) u64);

impl DevicePtr {
    /// The null pointer.
    #[must_use]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Check if this is the null pointer.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The raw address.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// From a raw address. Validity is checked on access.
    #[must_use]
    pub const fn from_raw(ptr: u64) -> Self {
        Self(ptr)
    }

    /// Offset the pointer by a number of bytes.
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Byte and allocation counters for a [`DeviceMemory`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
    pub allocs: usize,
    pub frees: usize,
}

impl MemoryUsage {
    fn on_alloc(&mut self, size: usize) {
        self.live_bytes += size;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
        self.allocs += 1;
    }

    fn on_free(&mut self, size: usize) {
        self.live_bytes -= size;
        self.frees += 1;
    }

    /// Allocations not yet freed.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.allocs - self.frees
    }
}

#[derive(Debug)]
struct Region {
    label: String,
    bytes: Vec<u8>,
}

/// The simulated device's global memory.
#[derive(Debug)]
pub struct DeviceMemory {
    regions: BTreeMap<u64, Region>,
    next_address: u64,
    usage: MemoryUsage,
}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory {
    /// Empty memory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_address: BASE_ADDRESS,
            usage: MemoryUsage::default(),
        }
    }

    /// Allocate `size` zeroed bytes.
    pub fn alloc(&mut self, size: u64, label: impl Into<String>) -> GpuResult<DevicePtr> {
        let len = usize::try_from(size)
            .map_err(|_| GpuError::RuntimeError(format!("cannot allocate {size} bytes")))?;
        let base = self.next_address;
        let reserved = size.max(1).div_ceil(ALLOCATION_ALIGNMENT) * ALLOCATION_ALIGNMENT;
        self.next_address = base
            .checked_add(reserved)
            .ok_or_else(|| GpuError::RuntimeError("device address space exhausted".to_string()))?;
        let label = label.into();
        trace!(base = %DevicePtr(base), size, label = %label, "device alloc");
        self.regions.insert(
            base,
            Region {
                label,
                bytes: vec![0; len],
            },
        );
        self.usage.on_alloc(len);
        Ok(DevicePtr(base))
    }

    /// Release the allocation starting at `ptr`.
    pub fn free(&mut self, ptr: DevicePtr) -> GpuResult<()> {
        let region = self
            .regions
            .remove(&ptr.0)
            .ok_or_else(|| GpuError::RuntimeError(format!("free of {ptr}, which is not an allocation base")))?;
        self.usage.on_free(region.bytes.len());
        Ok(())
    }

    fn locate(&self, ptr: DevicePtr, len: usize) -> GpuResult<(u64, usize)> {
        let fault = || GpuError::RuntimeError(format!("invalid device access of {len} bytes at {ptr}"));
        let (&base, region) = self.regions.range(..=ptr.0).next_back().ok_or_else(fault)?;
        let start = usize::try_from(ptr.0 - base).map_err(|_| fault())?;
        if start + len > region.bytes.len() {
            return Err(GpuError::RuntimeError(format!(
                "device access of {len} bytes at {ptr} overruns {} ({} bytes at {})",
                region.label,
                region.bytes.len(),
                DevicePtr(base)
            )));
        }
        Ok((base, start))
    }

    /// `len` bytes at `ptr`.
    pub fn read(&self, ptr: DevicePtr, len: usize) -> GpuResult<&[u8]> {
        let (base, start) = self.locate(ptr, len)?;
        let region = &self.regions[&base];
        Ok(&region.bytes[start..start + len])
    }

    /// Overwrite the bytes at `ptr`.
    pub fn write(&mut self, ptr: DevicePtr, bytes: &[u8]) -> GpuResult<()> {
        let (base, start) = self.locate(ptr, bytes.len())?;
        let region = self
            .regions
            .get_mut(&base)
            .ok_or_else(|| GpuError::Internal(format!("allocation at {} vanished", DevicePtr(base))))?;
        region.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `len` bytes from `source` to `destination`. The ranges may overlap.
    pub fn copy(&mut self, source: DevicePtr, destination: DevicePtr, len: usize) -> GpuResult<()> {
        let data = self.read(source, len)?.to_vec();
        self.write(destination, &data)
    }

    /// Fill `len` bytes with a repeated little-endian 32-bit pattern. A
    /// trailing partial word takes the pattern's leading bytes.
    pub fn fill32(&mut self, destination: DevicePtr, len: usize, pattern: u32) -> GpuResult<()> {
        let data: Vec<u8> = pattern.to_le_bytes().iter().copied().cycle().take(len).collect();
        self.write(destination, &data)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn usage(&self) -> MemoryUsage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ptr() {
        let ptr = DevicePtr::null();
        assert!(ptr.is_null());
        assert_eq!(ptr.as_raw(), 0);

        let ptr2 = DevicePtr::from_raw(0x1000);
        assert!(!ptr2.is_null());
        assert_eq!(ptr2.offset(256).as_raw(), 0x1100);
        assert_eq!(ptr2.to_string(), "0x1000");
    }

    #[test]
    fn test_usage_tracks_peak() {
        let mut memory = DeviceMemory::new();
        let a = memory.alloc(1024, "a").unwrap();
        memory.alloc(2048, "b").unwrap();
        memory.free(a).unwrap();
        let usage = memory.usage();
        assert_eq!(usage.live_bytes, 2048);
        assert_eq!(usage.peak_bytes, 3072);
        assert_eq!(usage.live_allocations(), 1);
        assert!(memory.free(a).is_err());
        assert!(memory.read(a, 1).is_err());
    }

    #[test]
    fn test_allocations_are_aligned_and_zeroed() {
        let mut memory = DeviceMemory::new();
        let a = memory.alloc(10, "a").unwrap();
        let b = memory.alloc(0, "b").unwrap();
        let c = memory.alloc(300, "c").unwrap();
        assert_eq!(a.as_raw() % ALLOCATION_ALIGNMENT, 0);
        assert_eq!(b.as_raw() - a.as_raw(), ALLOCATION_ALIGNMENT);
        assert_eq!(c.as_raw() - b.as_raw(), ALLOCATION_ALIGNMENT);
        assert_eq!(memory.read(c, 300).unwrap(), &[0u8; 300][..]);
        assert_eq!(memory.allocation_count(), 3);
    }

    #[test]
    fn test_out_of_bounds_access_faults() {
        let mut memory = DeviceMemory::new();
        let a = memory.alloc(8, "a").unwrap();
        assert!(memory.write(a.offset(4), &[1, 2, 3, 4]).is_ok());
        let err = memory.write(a.offset(6), &[1, 2, 3, 4]).unwrap_err();
        assert!(err.to_string().contains("overruns a"));
        assert!(memory.read(DevicePtr::from_raw(16), 1).is_err());
    }

    #[test]
    fn test_copy_and_fill() {
        let mut memory = DeviceMemory::new();
        let a = memory.alloc(8, "a").unwrap();
        let b = memory.alloc(8, "b").unwrap();
        memory.fill32(a, 6, 0x0403_0201).unwrap();
        assert_eq!(memory.read(a, 8).unwrap(), &[1, 2, 3, 4, 1, 2, 0, 0]);
        memory.copy(a, b.offset(2), 6).unwrap();
        assert_eq!(memory.read(b, 8).unwrap(), &[0, 0, 1, 2, 3, 4, 1, 2]);
    }
}
