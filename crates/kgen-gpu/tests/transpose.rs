//! Layout-changing copies and fusions, with and without shared-memory tiles.

use kgen_gpu::runtime::{ExecutionStats, Executor};
use kgen_gpu::{compile_module, DeviceInfo, EmitterConfig, GpuExecutable};
use kgen_hlo::{BinaryOp, BufferAssignment, FusionKind, HloModule, PrimitiveType, Shape};

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn iota(n: usize) -> Vec<f32> {
    (0..n).map(|i| i as f32).collect()
}

fn compile(module: &HloModule, config: &EmitterConfig) -> GpuExecutable {
    let assignment = BufferAssignment::assign(module).unwrap();
    compile_module(module, &assignment, config, &DeviceInfo::mock()).unwrap()
}

/// Runs with physical parameter bytes and returns the physical output.
fn run(executable: &GpuExecutable, params: &[Vec<f32>]) -> (Vec<f32>, ExecutionStats) {
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(executable, &device).unwrap();
    for (number, values) in params.iter().enumerate() {
        executor.write_parameter(number, &[], &f32_bytes(values)).unwrap();
    }
    executor.run().unwrap();
    let output = to_f32s(&executor.read_output(&[]).unwrap());
    (output, executor.stats().clone())
}

fn untiled() -> EmitterConfig {
    EmitterConfig {
        enable_tiled_transpose: false,
        ..EmitterConfig::default()
    }
}

/// `copy(p0)` from a row-major `[rows, cols]` into column-major layout.
fn to_column_major_module(rows: i64, cols: i64) -> HloModule {
    let mut module = HloModule::new("to_column_major");
    let mut b = module.builder("entry");
    let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[rows, cols]));
    let copy = b.copy_with_layout(x, &[0, 1]).unwrap();
    let entry = b.build(copy);
    module.set_entry(entry);
    module
}

/// Physical column-major bytes of a row-major `[rows, cols]` array.
fn column_major(values: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = values[i * cols + j];
        }
    }
    out
}

// =========================================================================
// Copies
// =========================================================================

#[test]
fn test_copy_to_column_major_uses_shared_tiles() {
    let (rows, cols) = (64, 48);
    let input = iota(rows * cols);
    let executable = compile(&to_column_major_module(rows as i64, cols as i64), &EmitterConfig::default());
    assert_eq!(executable.kernel_launch_count(), 1);
    let ptx = executable.ptx(&DeviceInfo::mock()).unwrap();
    assert!(ptx.contains(".shared"));
    assert!(ptx.contains("bar.sync"));

    let (output, stats) = run(&executable, &[input.clone()]);
    assert_eq!(output, column_major(&input, rows, cols));
    assert!(stats.barriers > 0);
}

#[test]
fn test_untiled_copy_matches_tiled() {
    let (rows, cols) = (64, 48);
    let input = iota(rows * cols);
    let module = to_column_major_module(rows as i64, cols as i64);

    let (tiled, _) = run(&compile(&module, &EmitterConfig::default()), &[input.clone()]);
    let (plain, stats) = run(&compile(&module, &untiled()), &[input.clone()]);
    assert_eq!(tiled, plain);
    assert_eq!(stats.barriers, 0);
}

#[test]
fn test_narrow_transpose_is_not_tiled() {
    let (rows, cols) = (40, 8);
    let input = iota(rows * cols);
    let executable = compile(&to_column_major_module(rows as i64, cols as i64), &EmitterConfig::default());
    let (output, stats) = run(&executable, &[input.clone()]);
    assert_eq!(output, column_major(&input, rows, cols));
    assert_eq!(stats.barriers, 0);
}

#[test]
fn test_batched_021_copy() {
    let (batch, rows, cols) = (4_usize, 32_usize, 40_usize);
    let mut module = HloModule::new("batched");
    let mut b = module.builder("entry");
    let x = b.parameter(
        0,
        Shape::array_with_layout(PrimitiveType::F32, &[batch as i64, rows as i64, cols as i64], &[1, 2, 0]),
    );
    let copy = b.copy_with_layout(x, &[2, 1, 0]).unwrap();
    let entry = b.build(copy);
    module.set_entry(entry);

    // Physically each batch is a [cols, rows] row-major block.
    let input = iota(batch * rows * cols);
    let executable = compile(&module, &EmitterConfig::default());
    let (output, stats) = run(&executable, &[input.clone()]);
    assert!(stats.barriers > 0);

    let mut expected = vec![0.0; batch * rows * cols];
    for a in 0..batch {
        for r in 0..rows {
            for c in 0..cols {
                expected[a * rows * cols + r * cols + c] = input[a * rows * cols + c * rows + r];
            }
        }
    }
    assert_eq!(output, expected);
}

// =========================================================================
// Fusions
// =========================================================================

#[test]
fn test_fusion_with_transposed_operand() {
    let (rows, cols) = (48_usize, 64_usize);
    let dims = [rows as i64, cols as i64];
    let mut module = HloModule::new("add_column_major");
    let mut fb = module.builder("fused_add");
    let p0 = fb.parameter(0, Shape::array_with_layout(PrimitiveType::F32, &dims, &[0, 1]));
    let p1 = fb.parameter(1, Shape::array(PrimitiveType::F32, &dims));
    let sum = fb.binary(BinaryOp::Add, p1, p0);
    let fused = fb.build(sum);
    let mut b = module.builder("entry");
    let x = b.parameter(0, Shape::array_with_layout(PrimitiveType::F32, &dims, &[0, 1]));
    let y = b.parameter(1, Shape::array(PrimitiveType::F32, &dims));
    let fusion = b.fusion(FusionKind::Loop, fused, &[x, y]);
    let entry = b.build(fusion);
    module.set_entry(entry);

    let xs = iota(rows * cols);
    let ys: Vec<f32> = (0..rows * cols).map(|i| (i % 17) as f32 * 1000.0).collect();
    let mut expected = vec![0.0; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            expected[i * cols + j] = ys[i * cols + j] + xs[j * rows + i];
        }
    }

    let (tiled, stats) = run(&compile(&module, &EmitterConfig::default()), &[xs.clone(), ys.clone()]);
    assert_eq!(tiled, expected);
    assert!(stats.barriers > 0);

    let (plain, _) = run(&compile(&module, &untiled()), &[xs, ys]);
    assert_eq!(plain, expected);
}
