//! Launch geometry and index width.
//!
//! Loop kernels cover `num_elements / unroll` threads, one block of up to
//! `threads_per_block_limit` threads at a time. In few-waves mode the block
//! count is capped at what the device keeps resident and the kernel body
//! becomes a grid-stride loop.

use crate::config::EmitterConfig;
use crate::device::DeviceInfo;
use kgen_hlo::{BinaryOp, HloInstruction, HloModule, Opcode, UnaryOp};
use kgen_kir::ScalarType;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Block cap for few-waves kernels.
const FEW_WAVES_THREADS_PER_BLOCK: u64 = 128;

/// A three-dimensional extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim3 {
    /// X extent.
    pub x: u64,
    /// Y extent.
    pub y: u64,
    /// Z extent.
    pub z: u64,
}

impl Dim3 {
    /// `{x, 1, 1}`.
    #[must_use]
    pub const fn x(x: u64) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// `{x, y, z}`.
    #[must_use]
    pub const fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }

    /// `x * y * z`.
    #[must_use]
    pub const fn product(&self) -> u64 {
        self.x * self.y * self.z
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}, {}}}", self.x, self.y, self.z)
    }
}

/// Block and thread counts of one kernel launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaunchDimensions {
    /// Grid extent in blocks.
    pub blocks: Dim3,
    /// Block extent in threads.
    pub threads_per_block: Dim3,
}

impl LaunchDimensions {
    /// A one-dimensional launch.
    #[must_use]
    pub const fn new(blocks: u64, threads_per_block: u64) -> Self {
        Self {
            blocks: Dim3::x(blocks),
            threads_per_block: Dim3::x(threads_per_block),
        }
    }

    /// Total threads launched.
    #[must_use]
    pub const fn launch_bound(&self) -> u64 {
        self.blocks.product() * self.threads_per_block.product()
    }

    /// Total blocks launched.
    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.blocks.product()
    }

    /// Threads in one block.
    #[must_use]
    pub const fn thread_count(&self) -> u64 {
        self.threads_per_block.product()
    }
}

impl fmt::Display for LaunchDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocks: {}, threads/block: {}",
            self.blocks, self.threads_per_block
        )
    }
}

/// Launch dimensions covering `num_elements` elements, `unroll_factor` per
/// thread.
///
/// An unroll factor that does not divide `num_elements` is discarded.
#[must_use]
pub fn calculate_launch_dimensions(
    num_elements: i64,
    device: &DeviceInfo,
    unroll_factor: u64,
    few_waves: bool,
) -> LaunchDimensions {
    if num_elements <= 1 {
        return LaunchDimensions::new(1, 1);
    }
    let mut num_elements = num_elements as u64;
    if num_elements % unroll_factor == 0 {
        num_elements /= unroll_factor;
    } else {
        warn!(
            num_elements,
            unroll_factor, "unroll factor does not divide the element count; not unrolling"
        );
    }

    let mut threads_per_block = device.threads_per_block_limit;
    if few_waves {
        threads_per_block = threads_per_block.min(FEW_WAVES_THREADS_PER_BLOCK);
    }
    if num_elements < threads_per_block {
        threads_per_block = num_elements;
    }

    let mut block_count = num_elements.div_ceil(threads_per_block);
    if few_waves {
        let capped = device.core_count * (device.threads_per_core_limit / threads_per_block);
        block_count = block_count.min(capped.max(1));
    }

    let dims = LaunchDimensions::new(block_count, threads_per_block);
    debug!(
        num_elements,
        blocks = block_count,
        threads_per_block,
        few_waves,
        "launch dimensions"
    );
    dims
}

/// Returns true if every instruction the kernel evaluates is elementwise, a
/// parameter, or a broadcast of a scalar.
#[must_use]
pub fn few_waves_allowed(module: &HloModule, instr: &HloInstruction) -> bool {
    let ok = |i: &HloInstruction| match i.opcode() {
        Opcode::Parameter { .. } => true,
        Opcode::Broadcast { dimensions } => dimensions.is_empty(),
        _ => i.is_elementwise(),
    };
    match instr.fused_computation() {
        Some(fused) => module
            .computation(fused)
            .instructions()
            .iter()
            .all(|&id| ok(module.instr(id))),
        None => ok(instr),
    }
}

fn is_vectorization_hostile(opcode: &Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Unary(UnaryOp::Sin | UnaryOp::Cos)
            | Opcode::Binary(BinaryOp::Power | BinaryOp::Atan2)
    )
}

/// Returns true if unrolling `instr` is unlikely to produce vector loads.
#[must_use]
pub fn may_prevent_vectorization(module: &HloModule, instr: &HloInstruction) -> bool {
    if let Some(fused) = instr.fused_computation() {
        return module.computation(fused).instructions().iter().any(|&id| {
            let i = module.instr(id);
            is_vectorization_hostile(i.opcode()) || matches!(i.opcode(), Opcode::Sort { .. })
        });
    }
    if instr.is_elementwise() {
        return is_vectorization_hostile(instr.opcode());
    }
    !(matches!(instr.opcode(), Opcode::Reduce { .. }) && instr.shape().is_array())
}

/// Largest power of two no greater than the configured maximum that divides
/// the element count of `instr` (the first output of a multi-output fusion).
#[must_use]
pub fn compute_max_unroll_factor(
    module: &HloModule,
    instr: &HloInstruction,
    config: &EmitterConfig,
) -> u64 {
    let max = config.max_kernel_unroll_factor;
    if max <= 1 {
        return 1;
    }
    let element_shape = if module.is_multi_output_fusion(instr.id()) {
        instr.shape().subshape(&[0])
    } else {
        Some(instr.shape())
    };
    let Some(num_elements) = element_shape
        .and_then(|s| s.as_array())
        .map(kgen_hlo::ArrayShape::num_elements)
    else {
        return 1;
    };
    let num_elements = num_elements as u64;
    let mut factor = max;
    while factor > 1 {
        if num_elements % factor == 0 {
            return factor;
        }
        factor /= 2;
    }
    1
}

/// `S32` if every count fits in a signed 32-bit integer, else `S64`.
#[must_use]
pub fn index_type_for_counts(counts: impl IntoIterator<Item = i64>) -> ScalarType {
    let fits = counts.into_iter().all(|n| i32::try_from(n).is_ok());
    if fits {
        ScalarType::S32
    } else {
        ScalarType::S64
    }
}

fn shape_counts(module: &HloModule, instr: &HloInstruction, counts: &mut Vec<i64>) {
    let mut add = |i: &HloInstruction| {
        counts.extend(
            i.shape()
                .array_subshapes()
                .into_iter()
                .map(|(_, a)| a.num_elements()),
        );
    };
    add(instr);
    for &operand in instr.operands() {
        add(module.instr(operand));
    }
}

/// Index width for a kernel evaluating `instr` with `launch_size` threads.
#[must_use]
pub fn index_type_for_kernel(module: &HloModule, instr: &HloInstruction, launch_size: u64) -> ScalarType {
    let mut counts = vec![i64::try_from(launch_size).unwrap_or(i64::MAX)];
    match instr.fused_computation() {
        Some(fused) => {
            for &id in module.computation(fused).instructions() {
                shape_counts(module, module.instr(id), &mut counts);
            }
        }
        None => shape_counts(module, instr, &mut counts),
    }
    let ty = index_type_for_counts(counts);
    debug!(instruction = instr.name(), index_type = %ty, "index type");
    ty
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgen_hlo::{FusionKind, Literal, PrimitiveType, Shape};

    #[test]
    fn test_tiny_launch() {
        let device = DeviceInfo::mock();
        assert_eq!(calculate_launch_dimensions(0, &device, 4, false), LaunchDimensions::new(1, 1));
        assert_eq!(calculate_launch_dimensions(1, &device, 1, false), LaunchDimensions::new(1, 1));
    }

    #[test]
    fn test_launch_dimensions() {
        let device = DeviceInfo::mock();
        let dims = calculate_launch_dimensions(12, &device, 4, false);
        assert_eq!(dims, LaunchDimensions::new(1, 3));
        assert_eq!(dims.launch_bound() * 4, 12);

        let dims = calculate_launch_dimensions(1 << 20, &device, 1, false);
        assert_eq!(dims.threads_per_block.x, 1024);
        assert_eq!(dims.blocks.x, 1024);

        let dims = calculate_launch_dimensions(1025, &device, 1, false);
        assert_eq!(dims.blocks.x, 2);
        assert!(dims.to_string().contains("{2, 1, 1}"));
    }

    #[test]
    fn test_unroll_fallback() {
        let device = DeviceInfo::mock();
        let dims = calculate_launch_dimensions(10, &device, 4, false);
        assert_eq!(dims.launch_bound(), 10);
    }

    #[test]
    fn test_few_waves_caps() {
        let device = DeviceInfo::mock();
        let dims = calculate_launch_dimensions(1 << 26, &device, 1, true);
        assert_eq!(dims.threads_per_block.x, 128);
        assert_eq!(dims.blocks.x, 80 * (2048 / 128));
    }

    #[test]
    fn test_index_type_boundary() {
        assert_eq!(index_type_for_counts([1, i64::from(i32::MAX)]), ScalarType::S32);
        assert_eq!(index_type_for_counts([1, 1 << 31]), ScalarType::S64);
    }

    fn f32s(dims: &[i64]) -> Shape {
        Shape::array(PrimitiveType::F32, dims)
    }

    #[test]
    fn test_unroll_and_vectorization() {
        let mut module = HloModule::new("m");
        let mut fb = module.builder("fused");
        let p = fb.parameter(0, f32s(&[12]));
        let s = fb.unary(UnaryOp::Sin, p);
        let fused_sin = fb.build(s);
        let mut fb = module.builder("fused_add");
        let p = fb.parameter(0, f32s(&[12]));
        let a = fb.binary(BinaryOp::Add, p, p);
        let fused_add = fb.build(a);

        let mut b = module.builder("entry");
        let x = b.parameter(0, f32s(&[12]));
        let sin = b.fusion(FusionKind::Loop, fused_sin, &[x]);
        let add = b.fusion(FusionKind::Loop, fused_add, &[sin]);
        let c = b.constant(Literal::scalar_f32(1.0));
        let entry = b.build(add);
        module.set_entry(entry);

        let config = EmitterConfig::default();
        assert!(may_prevent_vectorization(&module, module.instr(sin)));
        assert!(!may_prevent_vectorization(&module, module.instr(add)));
        assert!(may_prevent_vectorization(&module, module.instr(c)));
        assert_eq!(compute_max_unroll_factor(&module, module.instr(add), &config), 4);
        assert!(few_waves_allowed(&module, module.instr(add)));
        assert!(!few_waves_allowed(&module, module.instr(c)));
        assert_eq!(index_type_for_kernel(&module, module.instr(add), 12), ScalarType::S32);
    }

    #[test]
    fn test_fused_variadic_reduce_keeps_vectorization() {
        let mut module = HloModule::new("m");
        let add = kgen_hlo::scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
        let mut fb = module.builder("fused");
        let x = fb.parameter(0, f32s(&[3, 4]));
        let y = fb.parameter(1, f32s(&[3, 4]));
        let zero = fb.constant(Literal::scalar_f32(0.0));
        let reduce = fb.reduce_variadic(&[x, y], &[zero, zero], &[0], add).unwrap();
        let first = fb.get_tuple_element(reduce, 0).unwrap();
        let fused = fb.build(first);

        let mut b = module.builder("entry");
        let x = b.parameter(0, f32s(&[3, 4]));
        let y = b.parameter(1, f32s(&[3, 4]));
        let fusion = b.fusion(FusionKind::Loop, fused, &[x, y]);
        let entry = b.build(fusion);
        module.set_entry(entry);

        assert!(!may_prevent_vectorization(&module, module.instr(fusion)));
    }
}
