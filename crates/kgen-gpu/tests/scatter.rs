//! Scatter kernels run on the simulator.

use kgen_gpu::runtime::Executor;
use kgen_gpu::{compile_module, DeviceInfo, EmitterConfig, GpuExecutable, Thunk};
use kgen_hlo::{
    scalar_binary_computation, BinaryOp, BufferAssignment, CompId, FusionKind, HloModule, PrimitiveType,
    ScatterDimensionNumbers, Shape, UnaryOp,
};

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

fn compile(module: &HloModule) -> GpuExecutable {
    let assignment = BufferAssignment::assign(module).unwrap();
    compile_module(module, &assignment, &EmitterConfig::default(), &DeviceInfo::mock()).unwrap()
}

fn run(executable: &GpuExecutable, operand: &[f32], indices: &[i32], updates: &[f32]) -> Vec<f32> {
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(executable, &device).unwrap();
    executor.write_parameter(0, &[], &f32_bytes(operand)).unwrap();
    executor.write_parameter(1, &[], &i32_bytes(indices)).unwrap();
    executor.write_parameter(2, &[], &f32_bytes(updates)).unwrap();
    executor.run().unwrap();
    to_f32s(&executor.read_output(&[]).unwrap())
}

/// `(current, update) -> update`.
fn assign_computation(module: &mut HloModule) -> CompId {
    let mut b = module.builder("assign");
    let _current = b.parameter(0, Shape::scalar(PrimitiveType::F32));
    let update = b.parameter(1, Shape::scalar(PrimitiveType::F32));
    b.build(update)
}

/// Whole rows of an `[8, 4]` operand, one per entry of an `s32[3]` index.
fn row_numbers() -> ScatterDimensionNumbers {
    ScatterDimensionNumbers {
        update_window_dims: vec![1],
        inserted_window_dims: vec![0],
        scatter_dims_to_operand_dims: vec![0],
        index_vector_dim: 1,
    }
}

fn row_scatter_module(unique: bool) -> HloModule {
    let mut module = HloModule::new("row_scatter");
    let update = if unique {
        assign_computation(&mut module)
    } else {
        scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32)
    };
    let mut b = module.builder("entry");
    let operand = b.parameter(0, Shape::array(PrimitiveType::F32, &[8, 4]));
    let indices = b.parameter(1, Shape::array(PrimitiveType::S32, &[3]));
    let updates = b.parameter(2, Shape::array(PrimitiveType::F32, &[3, 4]));
    let scatter = b.scatter(operand, indices, updates, row_numbers(), update, unique);
    let entry = b.build(scatter);
    module.set_entry(entry);
    module
}

fn operand_rows() -> Vec<f32> {
    (0..32).map(|i| i as f32).collect()
}

fn update_rows() -> Vec<f32> {
    (0..12).map(|i| 100.0 * (i / 4 + 1) as f32).collect()
}

/// Host scatter of `update_rows` into `operand_rows` with `combine`.
fn host_row_scatter(indices: &[i32], combine: impl Fn(f32, f32) -> f32) -> Vec<f32> {
    let mut out = operand_rows();
    let updates = update_rows();
    for (k, &row) in indices.iter().enumerate() {
        if !(0..8).contains(&row) {
            continue;
        }
        let row = row as usize;
        for c in 0..4 {
            out[row * 4 + c] = combine(out[row * 4 + c], updates[k * 4 + c]);
        }
    }
    out
}

// =========================================================================
// Row Scatters
// =========================================================================

#[test]
fn test_unique_scatter_overwrites_rows() {
    let executable = compile(&row_scatter_module(true));
    let Thunk::Sequential { thunks, .. } = &executable.thunks[0] else {
        panic!("expected a copy then a kernel");
    };
    assert!(matches!(thunks[0], Thunk::Copy { .. }));

    let indices = [5, 0, 2];
    let output = run(&executable, &operand_rows(), &indices, &update_rows());
    assert_eq!(output, host_row_scatter(&indices, |_, update| update));
}

#[test]
fn test_duplicate_indices_accumulate_atomically() {
    let executable = compile(&row_scatter_module(false));
    let ptx = executable.ptx(&DeviceInfo::mock()).unwrap();
    assert!(ptx.contains("red.global.add.f32"));

    let indices = [1, 1, 6];
    let output = run(&executable, &operand_rows(), &indices, &update_rows());
    assert_eq!(output, host_row_scatter(&indices, |current, update| current + update));
}

#[test]
fn test_out_of_bounds_windows_are_skipped() {
    let executable = compile(&row_scatter_module(false));
    let indices = [9, -1, 3];
    let output = run(&executable, &operand_rows(), &indices, &update_rows());
    assert_eq!(output, host_row_scatter(&indices, |current, update| current + update));
    assert_eq!(&output[12..16], &[312.0, 313.0, 314.0, 315.0][..]);
}

// =========================================================================
// Point Scatters
// =========================================================================

#[test]
fn test_point_scatter_with_index_vectors() {
    let mut module = HloModule::new("point_scatter");
    let add = scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
    let mut b = module.builder("entry");
    let operand = b.parameter(0, Shape::array(PrimitiveType::F32, &[4, 5]));
    let indices = b.parameter(1, Shape::array(PrimitiveType::S32, &[3, 2]));
    let updates = b.parameter(2, Shape::array(PrimitiveType::F32, &[3]));
    let numbers = ScatterDimensionNumbers {
        update_window_dims: vec![],
        inserted_window_dims: vec![0, 1],
        scatter_dims_to_operand_dims: vec![0, 1],
        index_vector_dim: 1,
    };
    let scatter = b.scatter(operand, indices, updates, numbers, add, false);
    let entry = b.build(scatter);
    module.set_entry(entry);

    let executable = compile(&module);
    let operand = vec![0.0; 20];
    // (3, 4) twice and (0, 2) once.
    let output = run(&executable, &operand, &[3, 4, 0, 2, 3, 4], &[1.0, 2.0, 4.0]);
    let mut expected = vec![0.0; 20];
    expected[3 * 5 + 4] = 5.0;
    expected[2] = 2.0;
    assert_eq!(output, expected);

    // (4, 0) is outside the operand.
    let output = run(&executable, &operand, &[4, 0, 0, 2, 1, 1], &[1.0, 2.0, 4.0]);
    let mut expected = vec![0.0; 20];
    expected[2] = 2.0;
    expected[5 + 1] = 4.0;
    assert_eq!(output, expected);
}

// =========================================================================
// Fused Scatters
// =========================================================================

#[test]
fn test_fused_scatter_fills_output_from_operand_expression() {
    let mut module = HloModule::new("fused_scatter");
    let add = scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
    let mut fb = module.builder("fused");
    let p0 = fb.parameter(0, Shape::array(PrimitiveType::F32, &[8, 4]));
    let p1 = fb.parameter(1, Shape::array(PrimitiveType::S32, &[3]));
    let p2 = fb.parameter(2, Shape::array(PrimitiveType::F32, &[3, 4]));
    let negated = fb.unary(UnaryOp::Neg, p0);
    let scatter = fb.scatter(negated, p1, p2, row_numbers(), add, false);
    let fused = fb.build(scatter);
    let mut b = module.builder("entry");
    let operand = b.parameter(0, Shape::array(PrimitiveType::F32, &[8, 4]));
    let indices = b.parameter(1, Shape::array(PrimitiveType::S32, &[3]));
    let updates = b.parameter(2, Shape::array(PrimitiveType::F32, &[3, 4]));
    let fusion = b.fusion(FusionKind::Input, fused, &[operand, indices, updates]);
    let entry = b.build(fusion);
    module.set_entry(entry);

    let executable = compile(&module);
    assert_eq!(executable.kernel_launch_count(), 2);

    let indices = [7, 2, 7];
    let output = run(&executable, &operand_rows(), &indices, &update_rows());
    let mut expected: Vec<f32> = operand_rows().iter().map(|v| -v).collect();
    let updates = update_rows();
    for (k, &row) in indices.iter().enumerate() {
        for c in 0..4 {
            expected[row as usize * 4 + c] += updates[k * 4 + c];
        }
    }
    assert_eq!(output, expected);
}
