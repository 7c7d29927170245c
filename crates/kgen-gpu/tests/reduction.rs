//! Reduction kernels run on the simulator and checked against host folds.
//!
//! Inputs hold small integers so every partial sum is exact in `f32`,
//! whatever order the kernel combines them in.

use kgen_gpu::runtime::Executor;
use kgen_gpu::{compile_module, DeviceInfo, EmitterConfig, GpuExecutable, Thunk};
use kgen_hlo::{
    scalar_binary_computation, BinaryOp, BufferAssignment, FusionKind, HloModule, Literal, PrimitiveType, Shape,
    UnaryOp,
};

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn small_ints(n: usize, modulus: usize) -> Vec<f32> {
    (0..n).map(|i| (i % modulus) as f32).collect()
}

fn compile(module: &HloModule, config: &EmitterConfig) -> GpuExecutable {
    let assignment = BufferAssignment::assign(module).unwrap();
    compile_module(module, &assignment, config, &DeviceInfo::mock()).unwrap()
}

fn run(executable: &GpuExecutable, params: &[Vec<f32>], outputs: &[&[usize]]) -> Vec<Vec<f32>> {
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(executable, &device).unwrap();
    for (number, values) in params.iter().enumerate() {
        executor.write_parameter(number, &[], &f32_bytes(values)).unwrap();
    }
    executor.run().unwrap();
    outputs
        .iter()
        .map(|index| to_f32s(&executor.read_output(index).unwrap()))
        .collect()
}

/// An unfused `reduce(p0, init, dims)` with `op` as the reducer.
fn reduce_module(dims: &[i64], reduced: &[usize], op: BinaryOp, init: f32) -> HloModule {
    let mut module = HloModule::new("reduce");
    let reducer = scalar_binary_computation(&mut module, "reducer", op, PrimitiveType::F32);
    let mut b = module.builder("entry");
    let x = b.parameter(0, Shape::array(PrimitiveType::F32, dims));
    let init = b.constant(Literal::scalar_f32(init));
    let reduce = b.reduce(x, init, reduced, reducer).unwrap();
    let entry = b.build(reduce);
    module.set_entry(entry);
    module
}

/// Host fold of a row-major `[rows, cols]` array along its rows.
fn row_sums(values: &[f32], cols: usize) -> Vec<f32> {
    values.chunks_exact(cols).map(|row| row.iter().sum()).collect()
}

fn kernel_launch(executable: &GpuExecutable) -> kgen_gpu::LaunchDimensions {
    fn find(thunks: &[Thunk]) -> Option<kgen_gpu::LaunchDimensions> {
        thunks.iter().find_map(|thunk| match thunk {
            Thunk::Kernel { launch, .. } => Some(*launch),
            Thunk::Sequential { thunks, .. } => find(thunks),
            _ => None,
        })
    }
    find(&executable.thunks).expect("a kernel launch")
}

// =========================================================================
// Row Reductions
// =========================================================================

#[test]
fn test_row_reduction_at_every_block_size() {
    let input = small_ints(4096, 7);
    let expected: f32 = input.iter().sum();
    for (block_size, blocks) in [(64, 4), (128, 2), (512, 1)] {
        let module = reduce_module(&[1, 4096], &[1], BinaryOp::Add, 0.0);
        let config = EmitterConfig {
            row_reduction_max_block_size: block_size,
            ..EmitterConfig::default()
        };
        let executable = compile(&module, &config);
        let launch = kernel_launch(&executable);
        assert_eq!(launch.blocks.x, blocks, "block size {block_size}");

        let outputs = run(&executable, &[input.clone()], &[&[]]);
        assert_eq!(outputs[0], vec![expected], "block size {block_size}");
    }
}

#[test]
fn test_row_reduction_of_many_rows() {
    let input = small_ints(8 * 256, 9);
    let module = reduce_module(&[8, 256], &[1], BinaryOp::Add, 0.0);
    let executable = compile(&module, &EmitterConfig::default());
    let outputs = run(&executable, &[input.clone()], &[&[]]);
    assert_eq!(outputs[0], row_sums(&input, 256));
}

#[test]
fn test_full_reduction_to_scalar() {
    let input = small_ints(1000, 11);
    let module = reduce_module(&[1000], &[0], BinaryOp::Add, 0.0);
    let executable = compile(&module, &EmitterConfig::default());
    let outputs = run(&executable, &[input.clone()], &[&[]]);
    assert_eq!(outputs[0], vec![input.iter().sum::<f32>()]);
}

#[test]
fn test_row_reduction_over_outer_and_minor_dimensions() {
    let (z, y, x) = (16, 4, 64);
    let input = small_ints(z * y * x, 5);
    let module = reduce_module(&[z as i64, y as i64, x as i64], &[0, 2], BinaryOp::Add, 0.0);
    let executable = compile(&module, &EmitterConfig::default());
    let outputs = run(&executable, &[input.clone()], &[&[]]);

    let mut expected = vec![0.0_f32; y];
    for (i, value) in input.iter().enumerate() {
        expected[(i / x) % y] += value;
    }
    assert_eq!(outputs[0], expected);
}

#[test]
fn test_max_reduction_uses_compare_and_swap() {
    let input: Vec<f32> = (0..2048).map(|i| ((i * 37) % 1000) as f32 - 500.0).collect();
    let module = reduce_module(&[2, 1024], &[1], BinaryOp::Maximum, f32::NEG_INFINITY);
    let executable = compile(&module, &EmitterConfig::default());
    assert!(executable.ptx(&DeviceInfo::mock()).unwrap().contains("atom.global.cas.b32"));

    let outputs = run(&executable, &[input.clone()], &[&[]]);
    let expected: Vec<f32> = input
        .chunks_exact(1024)
        .map(|row| row.iter().copied().fold(f32::NEG_INFINITY, f32::max))
        .collect();
    assert_eq!(outputs[0], expected);
}

// =========================================================================
// Column Reductions
// =========================================================================

#[test]
fn test_column_reduction() {
    let (rows, cols) = (256, 64);
    let input = small_ints(rows * cols, 13);
    let module = reduce_module(&[rows as i64, cols as i64], &[0], BinaryOp::Add, 0.0);
    let executable = compile(&module, &EmitterConfig::default());
    let launch = kernel_launch(&executable);
    assert_eq!(launch.threads_per_block.x, 1024);

    let outputs = run(&executable, &[input.clone()], &[&[]]);
    let mut expected = vec![0.0_f32; cols];
    for (i, value) in input.iter().enumerate() {
        expected[i % cols] += value;
    }
    assert_eq!(outputs[0], expected);
}

#[test]
fn test_column_reduction_with_partial_tile() {
    let (rows, cols) = (100, 40);
    let input = small_ints(rows * cols, 3);
    let module = reduce_module(&[rows as i64, cols as i64], &[0], BinaryOp::Add, 0.0);
    let executable = compile(&module, &EmitterConfig::default());
    let outputs = run(&executable, &[input.clone()], &[&[]]);
    let mut expected = vec![0.0_f32; cols];
    for (i, value) in input.iter().enumerate() {
        expected[i % cols] += value;
    }
    assert_eq!(outputs[0], expected);
}

// =========================================================================
// Fused Reductions
// =========================================================================

#[test]
fn test_sum_of_squares_fusion() {
    let mut module = HloModule::new("sum_of_squares");
    let add = scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
    let mut fb = module.builder("fused_reduce");
    let p = fb.parameter(0, Shape::array(PrimitiveType::F32, &[2, 1024]));
    let squared = fb.binary(BinaryOp::Multiply, p, p);
    let zero = fb.constant(Literal::scalar_f32(0.0));
    let reduce = fb.reduce(squared, zero, &[1], add).unwrap();
    let fused = fb.build(reduce);
    let mut b = module.builder("entry");
    let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[2, 1024]));
    let fusion = b.fusion(FusionKind::Input, fused, &[x]);
    let entry = b.build(fusion);
    module.set_entry(entry);

    let input = small_ints(2048, 4);
    let executable = compile(&module, &EmitterConfig::default());
    let outputs = run(&executable, &[input.clone()], &[&[]]);
    let expected: Vec<f32> = input
        .chunks_exact(1024)
        .map(|row| row.iter().map(|v| v * v).sum())
        .collect();
    assert_eq!(outputs[0], expected);
}

#[test]
fn test_independent_reductions_run_as_groups() {
    let mut module = HloModule::new("two_reductions");
    let add = scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
    let mut fb = module.builder("fused_reduces");
    let p0 = fb.parameter(0, Shape::array(PrimitiveType::F32, &[4, 512]));
    let p1 = fb.parameter(1, Shape::array(PrimitiveType::F32, &[4, 512]));
    let zero = fb.constant(Literal::scalar_f32(0.0));
    let r0 = fb.reduce(p0, zero, &[1], add).unwrap();
    let r1 = fb.reduce(p1, zero, &[1], add).unwrap();
    let root = fb.tuple(&[r0, r1]);
    let fused = fb.build(root);
    let mut b = module.builder("entry");
    let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[4, 512]));
    let y = b.parameter(1, Shape::array(PrimitiveType::F32, &[4, 512]));
    let fusion = b.fusion(FusionKind::Input, fused, &[x, y]);
    let entry = b.build(fusion);
    module.set_entry(entry);

    let executable = compile(&module, &EmitterConfig::default());
    assert_eq!(kernel_launch(&executable).blocks.y, 2);

    let xs = small_ints(2048, 6);
    let ys: Vec<f32> = small_ints(2048, 10).iter().map(|v| v * 2.0).collect();
    let outputs = run(&executable, &[xs.clone(), ys.clone()], &[&[0], &[1]]);
    assert_eq!(outputs[0], row_sums(&xs, 512));
    assert_eq!(outputs[1], row_sums(&ys, 512));
}

#[test]
fn test_reduction_with_elementwise_side_output() {
    let mut module = HloModule::new("reduce_and_negate");
    let add = scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
    let mut fb = module.builder("fused");
    let p = fb.parameter(0, Shape::array(PrimitiveType::F32, &[4, 256]));
    let negated = fb.unary(UnaryOp::Neg, p);
    let zero = fb.constant(Literal::scalar_f32(0.0));
    let reduce = fb.reduce(negated, zero, &[1], add).unwrap();
    let root = fb.tuple(&[reduce, negated]);
    let fused = fb.build(root);
    let mut b = module.builder("entry");
    let x = b.parameter(0, Shape::array(PrimitiveType::F32, &[4, 256]));
    let fusion = b.fusion(FusionKind::Input, fused, &[x]);
    let entry = b.build(fusion);
    module.set_entry(entry);

    let input = small_ints(1024, 8);
    let executable = compile(&module, &EmitterConfig::default());
    assert_eq!(kernel_launch(&executable).blocks.y, 1);
    let outputs = run(&executable, &[input.clone()], &[&[0], &[1]]);
    let negated: Vec<f32> = input.iter().map(|v| -v).collect();
    assert_eq!(outputs[0], row_sums(&negated, 256));
    assert_eq!(outputs[1], negated);
}
