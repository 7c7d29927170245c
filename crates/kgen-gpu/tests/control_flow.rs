//! Loops, conditionals and collectives run on the simulator.

use kgen_gpu::runtime::Executor;
use kgen_gpu::{compile_module, DeviceInfo, EmitterConfig, GpuError, GpuExecutable, Thunk};
use kgen_hlo::{
    scalar_binary_computation, BinaryOp, BufferAssignment, CompId, ComparisonDirection, HloModule, InstrId,
    Literal, PrimitiveType, Shape, UnaryOp,
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

fn to_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn compile_with(module: &HloModule, config: &EmitterConfig) -> GpuExecutable {
    let assignment = BufferAssignment::assign(module).unwrap();
    compile_module(module, &assignment, config, &DeviceInfo::mock()).unwrap()
}

fn compile(module: &HloModule) -> GpuExecutable {
    compile_with(module, &EmitterConfig::default())
}

fn vector() -> Shape {
    Shape::array(PrimitiveType::F32, &[4])
}

fn counter_and_vector() -> Shape {
    Shape::tuple(vec![Shape::scalar(PrimitiveType::S32), vector()])
}

// =========================================================================
// While Loops
// =========================================================================

/// The loop `(i, x) -> (i + 1, x + x)` while `i < 5`.
struct DoublingLoop {
    module: HloModule,
    condition_root: InstrId,
    body_root: InstrId,
}

fn doubling_loop(known_trip_count: Option<i64>) -> DoublingLoop {
    let mut module = HloModule::new("doubling");

    let mut cb = module.builder("condition");
    let state = cb.parameter(0, counter_and_vector());
    let i = cb.get_tuple_element(state, 0).unwrap();
    let limit = cb.constant(Literal::scalar_i32(5));
    let condition_root = cb.compare(ComparisonDirection::Lt, i, limit).unwrap();
    let condition = cb.build(condition_root);

    let mut bb = module.builder("body");
    let state = bb.parameter(0, counter_and_vector());
    let i = bb.get_tuple_element(state, 0).unwrap();
    let x = bb.get_tuple_element(state, 1).unwrap();
    let one = bb.constant(Literal::scalar_i32(1));
    let next_i = bb.binary(BinaryOp::Add, i, one);
    let next_x = bb.binary(BinaryOp::Add, x, x);
    let body_root = bb.tuple(&[next_i, next_x]);
    let body = bb.build(body_root);

    let mut b = module.builder("entry");
    let i = b.parameter(0, Shape::scalar(PrimitiveType::S32));
    let x = b.parameter(1, vector());
    let init = b.tuple(&[i, x]);
    let result = b.while_loop(condition, body, init, known_trip_count);
    let entry = b.build(result);
    module.set_entry(entry);
    DoublingLoop {
        module,
        condition_root,
        body_root,
    }
}

fn run_loop(executable: &GpuExecutable, start: i32, x: &[f32]) -> (i32, Vec<f32>, u64) {
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(executable, &device).unwrap();
    executor.write_parameter(0, &[], &start.to_le_bytes()).unwrap();
    executor.write_parameter(1, &[], &f32_bytes(x)).unwrap();
    executor.run().unwrap();
    let i = to_i32(&executor.read_output(&[0]).unwrap());
    let x = to_f32s(&executor.read_output(&[1]).unwrap());
    (i, x, executor.stats().loop_iterations)
}

#[test]
fn test_while_with_known_trip_count_becomes_for() {
    let lp = doubling_loop(Some(5));
    let executable = compile(&lp.module);
    assert!(matches!(executable.thunks.last(), Some(Thunk::For { loop_limit: 5, .. })));

    let (i, x, iterations) = run_loop(&executable, 0, &[1.0, -2.0, 0.5, 3.0]);
    assert_eq!(i, 5);
    assert_eq!(x, vec![32.0, -64.0, 16.0, 96.0]);
    assert_eq!(iterations, 5);
}

#[test]
fn test_while_evaluates_condition_each_iteration() {
    let lp = doubling_loop(None);
    let executable = compile(&lp.module);
    assert!(matches!(executable.thunks.last(), Some(Thunk::While { .. })));

    let (i, x, iterations) = run_loop(&executable, 3, &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(i, 5);
    assert_eq!(x, vec![4.0, 8.0, 12.0, 16.0]);
    assert_eq!(iterations, 2);

    let (i, x, iterations) = run_loop(&executable, 9, &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(i, 9);
    assert_eq!(x, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(iterations, 0);
}

#[test]
fn test_loop_state_must_share_one_allocation() {
    let lp = doubling_loop(None);
    let mut assignment = BufferAssignment::assign(&lp.module).unwrap();
    let elsewhere = assignment.unique_slice(lp.condition_root, &[]).unwrap();
    assignment.set_slice(lp.body_root, &[0], elsewhere);

    let err = compile_module(&lp.module, &assignment, &EmitterConfig::default(), &DeviceInfo::mock()).unwrap_err();
    assert!(matches!(err, GpuError::Internal(ref m) if m.contains("does not share allocation")));
}

// =========================================================================
// Conditionals
// =========================================================================

fn unary_branch(module: &mut HloModule, name: &str, op: UnaryOp) -> CompId {
    let mut b = module.builder(name);
    let x = b.parameter(0, vector());
    let y = b.unary(op, x);
    b.build(y)
}

fn binary_branch(module: &mut HloModule, name: &str, op: BinaryOp) -> CompId {
    let mut b = module.builder(name);
    let x = b.parameter(0, vector());
    let y = b.binary(op, x, x);
    b.build(y)
}

fn run_conditional(executable: &GpuExecutable, selector: &[u8], x: &[f32]) -> Vec<f32> {
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(executable, &device).unwrap();
    executor.write_parameter(0, &[], selector).unwrap();
    executor.write_parameter(1, &[], &f32_bytes(x)).unwrap();
    executor.run().unwrap();
    to_f32s(&executor.read_output(&[]).unwrap())
}

#[test]
fn test_predicated_conditional() {
    let mut module = HloModule::new("pred_conditional");
    let negate = unary_branch(&mut module, "negate", UnaryOp::Neg);
    let double = binary_branch(&mut module, "double", BinaryOp::Add);
    let mut b = module.builder("entry");
    let pred = b.parameter(0, Shape::scalar(PrimitiveType::Pred));
    let x = b.parameter(1, vector());
    let result = b.conditional(pred, &[x, x], &[negate, double]);
    let entry = b.build(result);
    module.set_entry(entry);

    let executable = compile(&module);
    let x = [1.0, -2.0, 3.0, -4.0];
    assert_eq!(run_conditional(&executable, &[1], &x), vec![-1.0, 2.0, -3.0, 4.0]);
    assert_eq!(run_conditional(&executable, &[0], &x), vec![2.0, -4.0, 6.0, -8.0]);
}

#[test]
fn test_indexed_conditional_runs_last_branch_when_out_of_range() {
    let mut module = HloModule::new("indexed_conditional");
    let negate = unary_branch(&mut module, "negate", UnaryOp::Neg);
    let double = binary_branch(&mut module, "double", BinaryOp::Add);
    let square = binary_branch(&mut module, "square", BinaryOp::Multiply);
    let mut b = module.builder("entry");
    let index = b.parameter(0, Shape::scalar(PrimitiveType::S32));
    let x = b.parameter(1, vector());
    let result = b.conditional(index, &[x, x, x], &[negate, double, square]);
    let entry = b.build(result);
    module.set_entry(entry);

    let executable = compile(&module);
    let x = [1.0, -2.0, 3.0, -4.0];
    let negated = vec![-1.0, 2.0, -3.0, 4.0];
    let doubled = vec![2.0, -4.0, 6.0, -8.0];
    let squared = vec![1.0, 4.0, 9.0, 16.0];
    assert_eq!(run_conditional(&executable, &0_i32.to_le_bytes(), &x), negated);
    assert_eq!(run_conditional(&executable, &1_i32.to_le_bytes(), &x), doubled);
    assert_eq!(run_conditional(&executable, &2_i32.to_le_bytes(), &x), squared);
    assert_eq!(run_conditional(&executable, &7_i32.to_le_bytes(), &x), squared);
    assert_eq!(run_conditional(&executable, &(-1_i32).to_le_bytes(), &x), squared);
}

// =========================================================================
// Collectives
// =========================================================================

fn all_reduce_module() -> HloModule {
    let mut module = HloModule::new("all_reduce");
    let add = scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
    let mut b = module.builder("entry");
    let x = b.parameter(0, vector());
    let sum = b.all_reduce(&[x], add);
    let entry = b.build(sum);
    module.set_entry(entry);
    module
}

#[test]
fn test_single_replica_all_reduce_is_a_copy() {
    let executable = compile(&all_reduce_module());
    assert!(matches!(executable.thunks[0], Thunk::Copy { .. }));

    let device = DeviceInfo::mock();
    let mut executor = Executor::new(&executable, &device).unwrap();
    executor.write_parameter(0, &[], &f32_bytes(&[1.0, 2.0, 3.0, 4.0])).unwrap();
    executor.run().unwrap();
    assert_eq!(to_f32s(&executor.read_output(&[]).unwrap()), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_cross_replica_all_reduce_needs_multiple_devices() {
    let config = EmitterConfig {
        replica_count: 2,
        ..EmitterConfig::default()
    };
    let executable = compile_with(&all_reduce_module(), &config);
    assert!(matches!(executable.thunks[0], Thunk::AllReduce { replica_count: 2, .. }));

    let device = DeviceInfo::mock();
    let mut executor = Executor::new(&executable, &device).unwrap();
    executor.write_parameter(0, &[], &f32_bytes(&[1.0, 2.0, 3.0, 4.0])).unwrap();
    let err = executor.run().unwrap_err();
    assert!(matches!(err, GpuError::RuntimeError(ref m) if m.contains("2 replicas")));
}

#[test]
fn test_replica_id_is_zero_on_one_device() {
    let mut module = HloModule::new("replica_id");
    let mut b = module.builder("entry");
    let id = b.replica_id();
    let entry = b.build(id);
    module.set_entry(entry);

    let executable = compile(&module);
    assert!(matches!(executable.thunks[0], Thunk::ReplicaId { .. }));
    let device = DeviceInfo::mock();
    let mut executor = Executor::new(&executable, &device).unwrap();
    executor.run().unwrap();
    assert_eq!(executor.read_output(&[]).unwrap(), 0_u32.to_le_bytes().to_vec());
}
