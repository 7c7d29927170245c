//! Dynamic slices, in-place updates, dynamic arrays and collective-permute
//! run on the simulator.

use kgen_gpu::runtime::Executor;
use kgen_gpu::{compile_module, DeviceInfo, EmitterConfig, GpuError, GpuExecutable, Thunk};
use kgen_hlo::{ArrayShape, BufferAssignment, FusionKind, HloModule, InstrId, PrimitiveType, Shape};

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn to_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn f32s(dims: &[i64]) -> Shape {
    Shape::array(PrimitiveType::F32, dims)
}

fn s32() -> Shape {
    Shape::scalar(PrimitiveType::S32)
}

fn compile_with(module: &HloModule, assignment: &BufferAssignment) -> GpuExecutable {
    compile_module(module, assignment, &EmitterConfig::default(), &DeviceInfo::mock()).unwrap()
}

fn compile(module: &HloModule) -> GpuExecutable {
    compile_with(module, &BufferAssignment::assign(module).unwrap())
}

fn iota(count: usize) -> Vec<f32> {
    (0..count).map(|i| i as f32).collect()
}

/// `operand` (row-major `[rows, cols]`) with `update` written at the
/// clamped `(row, col)`.
fn host_update(operand: &[f32], cols: usize, update: &[f32], update_dims: [usize; 2], start: [i32; 2]) -> Vec<f32> {
    let rows = operand.len() / cols;
    let row = (start[0].max(0) as usize).min(rows - update_dims[0]);
    let col = (start[1].max(0) as usize).min(cols - update_dims[1]);
    let mut out = operand.to_vec();
    for r in 0..update_dims[0] {
        for c in 0..update_dims[1] {
            out[(row + r) * cols + col + c] = update[r * update_dims[1] + c];
        }
    }
    out
}

// =========================================================================
// Dynamic Slice
// =========================================================================

fn dynamic_slice_module() -> HloModule {
    let mut module = HloModule::new("dynamic_slice");
    let mut b = module.builder("entry");
    let x = b.parameter(0, f32s(&[6, 4]));
    let i = b.parameter(1, s32());
    let j = b.parameter(2, s32());
    let ds = b.dynamic_slice(x, &[i, j], &[3, 2]).unwrap();
    let entry = b.build(ds);
    module.set_entry(entry);
    module
}

fn run_dynamic_slice(start: [i32; 2]) -> Vec<f32> {
    let executable = compile(&dynamic_slice_module());
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(&executable, &device).unwrap();
    executor.write_parameter(0, &[], &f32_bytes(&iota(24))).unwrap();
    executor.write_parameter(1, &[], &i32_bytes(&[start[0]])).unwrap();
    executor.write_parameter(2, &[], &i32_bytes(&[start[1]])).unwrap();
    executor.run().unwrap();
    to_f32s(&executor.read_output(&[]).unwrap())
}

#[test]
fn test_dynamic_slice_reads_window() {
    assert_eq!(run_dynamic_slice([1, 2]), vec![6.0, 7.0, 10.0, 11.0, 14.0, 15.0]);
}

#[test]
fn test_dynamic_slice_clamps_starts() {
    // Rows clamp to 3 (6 - 3), columns to 0.
    assert_eq!(run_dynamic_slice([5, -3]), vec![12.0, 13.0, 16.0, 17.0, 20.0, 21.0]);
}

// =========================================================================
// Dynamic Update Slice
// =========================================================================

fn update_rows() -> Vec<f32> {
    vec![-1.0, -2.0, -3.0, -4.0, -5.0, -6.0, -7.0, -8.0]
}

fn run_update(executable: &GpuExecutable, start: [i32; 2]) -> Vec<f32> {
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(executable, &device).unwrap();
    executor.write_parameter(0, &[], &f32_bytes(&iota(32))).unwrap();
    executor.write_parameter(1, &[], &f32_bytes(&update_rows())).unwrap();
    executor.write_parameter(2, &[], &i32_bytes(&[start[0]])).unwrap();
    executor.write_parameter(3, &[], &i32_bytes(&[start[1]])).unwrap();
    executor.run().unwrap();
    to_f32s(&executor.read_output(&[]).unwrap())
}

#[test]
fn test_unfused_update_copies_then_writes_window() {
    let mut module = HloModule::new("dus");
    let mut b = module.builder("entry");
    let x = b.parameter(0, f32s(&[8, 4]));
    let u = b.parameter(1, f32s(&[2, 4]));
    let i = b.parameter(2, s32());
    let j = b.parameter(3, s32());
    let dus = b.dynamic_update_slice(x, u, &[i, j]).unwrap();
    let entry = b.build(dus);
    module.set_entry(entry);

    let executable = compile(&module);
    let Thunk::Sequential { thunks, .. } = &executable.thunks[0] else {
        panic!("expected a copy then a kernel");
    };
    assert!(matches!(thunks[0], Thunk::Copy { .. }));
    let launches = thunks[1].kernel_launches();
    assert_eq!(launches[0].1.launch_bound(), 8);

    let output = run_update(&executable, [3, 0]);
    assert_eq!(output, host_update(&iota(32), 4, &update_rows(), [2, 4], [3, 0]));
}

/// A loop fusion `dynamic-update-slice(p0, negate(p1), p2, p3)`; returns
/// the module with the operand parameter and the fusion.
fn update_fusion_module() -> (HloModule, InstrId, InstrId) {
    let mut module = HloModule::new("dus_fusion");
    let mut fb = module.builder("fused_update");
    let p = fb.parameter(0, f32s(&[8, 4]));
    let u = fb.parameter(1, f32s(&[2, 4]));
    let i = fb.parameter(2, s32());
    let j = fb.parameter(3, s32());
    let negated = fb.unary(kgen_hlo::UnaryOp::Neg, u);
    let root = fb.dynamic_update_slice(p, negated, &[i, j]).unwrap();
    let fused = fb.build(root);

    let mut b = module.builder("entry");
    let x = b.parameter(0, f32s(&[8, 4]));
    let y = b.parameter(1, f32s(&[2, 4]));
    let s = b.parameter(2, s32());
    let t = b.parameter(3, s32());
    let fusion = b.fusion(FusionKind::Loop, fused, &[x, y, s, t]);
    let entry = b.build(fusion);
    module.set_entry(entry);
    (module, x, fusion)
}

fn negated_update_rows() -> Vec<f32> {
    update_rows().iter().map(|v| -v).collect()
}

#[test]
fn test_shared_update_fusion_runs_in_place() {
    let (module, x, fusion) = update_fusion_module();
    let mut assignment = BufferAssignment::assign(&module).unwrap();
    assignment.share(&module, x, fusion);
    let executable = compile_with(&module, &assignment);

    assert_eq!(executable.thunks.len(), 1);
    let launches = executable.thunks[0].kernel_launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].1.launch_bound(), 8);

    let output = run_update(&executable, [7, 1]);
    assert_eq!(output, host_update(&iota(32), 4, &negated_update_rows(), [2, 4], [7, 1]));
}

#[test]
fn test_unshared_update_fusion_rewrites_every_element() {
    let (module, _, _) = update_fusion_module();
    let executable = compile(&module);
    assert!(matches!(executable.thunks[0], Thunk::Kernel { .. }));

    let output = run_update(&executable, [2, 0]);
    assert_eq!(output, host_update(&iota(32), 4, &negated_update_rows(), [2, 4], [2, 0]));
}

// =========================================================================
// Dynamic Arrays
// =========================================================================

/// Bytes of a dynamic `f32[3, 4]` holding `sizes` and the packed elements.
fn dynamic_bytes(packed: &[f32], sizes: [i32; 2]) -> Vec<u8> {
    let mut data = packed.to_vec();
    data.resize(12, f32::NAN);
    let mut bytes = f32_bytes(&data);
    bytes.extend(i32_bytes(&sizes));
    bytes
}

fn dynamic_f32s() -> Shape {
    Shape::Array(ArrayShape::new(PrimitiveType::F32, &[3, 4]).into_dynamic())
}

#[test]
fn test_pad_to_static_spreads_packed_elements() {
    let mut module = HloModule::new("pad");
    let mut b = module.builder("entry");
    let x = b.parameter(0, dynamic_f32s());
    let padded = b.pad_to_static(x).unwrap();
    let entry = b.build(padded);
    module.set_entry(entry);

    let executable = compile(&module);
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(&executable, &device).unwrap();
    let packed = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    executor.write_parameter(0, &[], &dynamic_bytes(&packed, [2, 3])).unwrap();
    executor.run().unwrap();

    let data = to_f32s(&executor.read_output(&[0]).unwrap());
    assert_eq!(&data[0..3], &[1.0, 2.0, 3.0]);
    assert_eq!(&data[4..7], &[4.0, 5.0, 6.0]);
    assert_eq!(to_i32s(&executor.read_output(&[1]).unwrap()), vec![2]);
    assert_eq!(to_i32s(&executor.read_output(&[2]).unwrap()), vec![3]);
}

#[test]
fn test_slice_to_dynamic_packs_leading_elements() {
    let mut module = HloModule::new("slice_to_dynamic");
    let mut b = module.builder("entry");
    let x = b.parameter(0, f32s(&[3, 4]));
    let rows = b.parameter(1, s32());
    let cols = b.parameter(2, s32());
    let dynamic = b.slice_to_dynamic(x, &[rows, cols]).unwrap();
    let entry = b.build(dynamic);
    module.set_entry(entry);

    let executable = compile(&module);
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(&executable, &device).unwrap();
    executor.write_parameter(0, &[], &f32_bytes(&iota(12))).unwrap();
    executor.write_parameter(1, &[], &i32_bytes(&[2])).unwrap();
    executor.write_parameter(2, &[], &i32_bytes(&[3])).unwrap();
    executor.run().unwrap();

    let bytes = executor.read_output(&[]).unwrap();
    assert_eq!(bytes.len(), 56);
    assert_eq!(&to_f32s(&bytes[..24]), &[0.0, 1.0, 2.0, 4.0, 5.0, 6.0]);
    assert_eq!(to_i32s(&bytes[48..]), vec![2, 3]);
}

#[test]
fn test_dimension_size_of_dynamic_array_is_read_at_run_time() {
    let mut module = HloModule::new("dimension_size");
    let mut b = module.builder("entry");
    let x = b.parameter(0, dynamic_f32s());
    let size = b.get_dimension_size(x, 1).unwrap();
    let entry = b.build(size);
    module.set_entry(entry);

    let executable = compile(&module);
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(&executable, &device).unwrap();
    executor.write_parameter(0, &[], &dynamic_bytes(&[0.0; 4], [1, 4])).unwrap();
    executor.run().unwrap();
    assert_eq!(to_i32s(&executor.read_output(&[]).unwrap()), vec![4]);
}

#[test]
fn test_pad_to_static_rejects_static_operand() {
    let mut module = HloModule::new("pad");
    let mut b = module.builder("entry");
    let x = b.parameter(0, f32s(&[3, 4]));
    let call = b.custom_call(
        "PadToStatic",
        &[x],
        Shape::tuple(vec![f32s(&[3, 4]), s32(), s32()]),
    );
    let entry = b.build(call);
    module.set_entry(entry);
    let assignment = BufferAssignment::assign(&module).unwrap();
    let err = compile_module(&module, &assignment, &EmitterConfig::default(), &DeviceInfo::mock()).unwrap_err();
    assert!(matches!(err, GpuError::FailedPrecondition(ref m) if m.contains("static array")));
}

// =========================================================================
// Collective Permute
// =========================================================================

fn permute_module(pairs: &[(i64, i64)]) -> HloModule {
    let mut module = HloModule::new("permute");
    let mut b = module.builder("entry");
    let x = b.parameter(0, f32s(&[4]));
    let permute = b.collective_permute(x, pairs);
    let entry = b.build(permute);
    module.set_entry(entry);
    module
}

fn run_permute(executable: &GpuExecutable) -> Result<Vec<f32>, GpuError> {
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(executable, &device)?;
    executor.write_parameter(0, &[], &f32_bytes(&[1.0, 2.0, 3.0, 4.0]))?;
    executor.run()?;
    Ok(to_f32s(&executor.read_output(&[])?))
}

#[test]
fn test_permute_to_self_copies() {
    let executable = compile(&permute_module(&[(0, 0)]));
    assert_eq!(run_permute(&executable).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_permute_without_incoming_pair_zeroes() {
    let executable = compile(&permute_module(&[(0, 1)]));
    assert_eq!(run_permute(&executable).unwrap(), vec![0.0; 4]);
}

#[test]
fn test_multi_replica_permute_needs_multi_device_runtime() {
    let module = permute_module(&[(0, 1), (1, 0)]);
    let assignment = BufferAssignment::assign(&module).unwrap();
    let config = EmitterConfig {
        replica_count: 2,
        ..EmitterConfig::default()
    };
    let executable = compile_module(&module, &assignment, &config, &DeviceInfo::mock()).unwrap();
    let err = run_permute(&executable).unwrap_err();
    assert!(matches!(err, GpuError::RuntimeError(ref m) if m.contains("multi-device")));
}
