//! PTX text for a kernel IR module.
//!
//! Every register `v` of a kernel or function prints as `%v{n}` with its
//! own PTX register type. Structured control flow becomes labels and
//! branches; transcendental functions call libdevice.
//!
//! ```ptx
//! .version 7.0
//! .target sm_70
//! .address_size 64
//!
//! .visible .entry fusion(
//!     .param .u64 .ptr .global .align 16 alloc0, // noalias readonly dereferenceable(48)
//!     .param .u64 .ptr .global .align 64 alloc1 // noalias dereferenceable(48)
//! )
//! {
//!     .reg .u64 %v0, %v1;
//!     ld.param.u64 %v0, [alloc0];
//!     cvta.to.global.u64 %v0, %v0;
//!     ...
//!     ret;
//! }
//! ```

use super::{bit_type, memory_type, register_type};
use crate::device::DeviceInfo;
use crate::{GpuError, GpuResult};
use kgen_index::{Idx, IndexVec};
use kgen_kir::{
    AddressSpace, AtomicOp, BinOp, CmpOp, Expr, Function, Kernel, KirModule, LocalDecl, ParamFlags,
    Scalar, ScalarType, Stmt, UnOp, ValueId,
};
use std::collections::BTreeMap;
use tracing::debug;

/// PTX ISA version of the emitted text.
pub const PTX_VERSION: &str = "7.0";

/// Alignment of shared and local arrays.
const ARRAY_ALIGN: u32 = 16;

/// Print `module` for `device`.
pub fn print_module(module: &KirModule, device: &DeviceInfo) -> GpuResult<String> {
    let mut externs = BTreeMap::new();
    let mut functions = Vec::with_capacity(module.functions.len());
    for function in module.functions.iter() {
        functions.push(print_function(module, function, &mut externs)?);
    }
    let mut kernels = Vec::with_capacity(module.kernels.len());
    for kernel in &module.kernels {
        kernels.push(print_kernel(module, kernel, &mut externs)?);
    }

    let mut out = format!(
        ".version {PTX_VERSION}\n.target {}\n.address_size 64\n\n// Module: {}\n// Device: {}\n\n",
        device.arch_name(),
        module.name,
        device.name
    );
    for (name, (ty, arity)) in &externs {
        let t = register_type(*ty);
        let args: Vec<String> = (0..*arity).map(|i| format!(".reg .{t} %a{i}")).collect();
        out.push_str(&format!(".extern .func (.reg .{t} %r) {name}({});\n", args.join(", ")));
    }
    if !externs.is_empty() {
        out.push('\n');
    }
    for global in module.globals.iter() {
        let len = global.bytes.len().max(1);
        if global.bytes.is_empty() {
            out.push_str(&format!(".global .align {} .b8 {}[{len}];\n", global.align, global.name));
        } else {
            let bytes: Vec<String> = global.bytes.iter().map(u8::to_string).collect();
            out.push_str(&format!(
                ".global .align {} .b8 {}[{len}] = {{{}}};\n",
                global.align,
                global.name,
                bytes.join(", ")
            ));
        }
    }
    if !module.globals.is_empty() {
        out.push('\n');
    }
    for text in functions.into_iter().chain(kernels) {
        out.push_str(&text);
        out.push('\n');
    }
    debug!(
        module = %module.name,
        kernels = module.kernels.len(),
        bytes = out.len(),
        "printed PTX"
    );
    Ok(out)
}

/// libdevice functions called, with their type and arity.
type Externs = BTreeMap<&'static str, (ScalarType, usize)>;

fn print_kernel(module: &KirModule, kernel: &Kernel, externs: &mut Externs) -> GpuResult<String> {
    let shared: Vec<String> = kernel
        .shared
        .iter()
        .enumerate()
        .map(|(i, decl)| format!("s{i}_{}", decl.name))
        .collect();
    let params: Vec<String> = kernel.params.iter().map(|p| p.name.clone()).collect();
    let mut printer = BodyPrinter::new(module, &kernel.values, &kernel.locals, externs);
    printer.shared = shared.clone();
    printer.params = params;
    printer.block(&kernel.body)?;
    printer.line("ret;");

    let mut out = format!(
        "// {}: {} statements, {} bytes shared\n.visible .entry {}(\n",
        kernel.name,
        kernel.statement_count(),
        kernel.shared_bytes(),
        kernel.name
    );
    for (i, param) in kernel.params.iter().enumerate() {
        let separator = if i + 1 == kernel.params.len() { "" } else { "," };
        let mut attributes = Vec::new();
        if param.flags.contains(ParamFlags::NOALIAS) {
            attributes.push("noalias".to_string());
        }
        if param.flags.contains(ParamFlags::READ_ONLY) {
            attributes.push("readonly".to_string());
        }
        attributes.push(format!("dereferenceable({})", param.dereferenceable));
        out.push_str(&format!(
            "    .param .u64 .ptr .global .align {} {}{separator} // {}\n",
            param.align,
            param.name,
            attributes.join(" ")
        ));
    }
    out.push_str(")\n{\n");
    out.push_str(&register_declarations(&kernel.values, &[], &printer.scratch));
    for (name, decl) in shared.iter().zip(kernel.shared.iter()) {
        out.push_str(&format!(
            "    .shared .align {ARRAY_ALIGN} .b8 {name}[{}];\n",
            decl.byte_size().max(1)
        ));
    }
    out.push_str(&printer.local_declarations());
    out.push_str(&printer.out);
    out.push_str("}\n");
    Ok(out)
}

fn print_function(module: &KirModule, function: &Function, externs: &mut Externs) -> GpuResult<String> {
    let mut printer = BodyPrinter::new(module, &function.values, &function.locals, externs);
    printer.block(&function.body)?;
    for (i, &result) in function.results.iter().enumerate() {
        let t = register_type(function.values[result]);
        printer.line(&format!("mov.{} %ret{i}, {};", move_type(function.values[result], t), reg(result)));
    }
    printer.line("ret;");

    let results: Vec<String> = function
        .results
        .iter()
        .enumerate()
        .map(|(i, &r)| format!(".reg .{} %ret{i}", register_type(function.values[r])))
        .collect();
    let params: Vec<String> = function
        .params
        .iter()
        .map(|&p| format!(".reg .{} {}", register_type(function.values[p]), reg(p)))
        .collect();
    let mut out = format!(
        ".func ({}) {}(\n    {}\n)\n{{\n",
        results.join(", "),
        function.name,
        params.join(",\n    ")
    );
    out.push_str(&register_declarations(&function.values, &function.params, &printer.scratch));
    out.push_str(&printer.local_declarations());
    out.push_str(&printer.out);
    out.push_str("}\n");
    Ok(out)
}

fn reg(value: ValueId) -> String {
    format!("%v{}", value.index())
}

/// `mov` has no signed sub-word forms worth distinguishing; predicates move
/// as `pred`.
fn move_type(ty: ScalarType, register: &'static str) -> &'static str {
    if ty == ScalarType::Pred {
        "pred"
    } else {
        register
    }
}

/// `.reg` lines for every register except `skip`, grouped by type.
fn register_declarations(values: &IndexVec<ValueId, ScalarType>, skip: &[ValueId], scratch: &[ScalarType]) -> String {
    let mut by_type: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for (value, &ty) in values.iter_enumerated() {
        if !skip.contains(&value) {
            by_type.entry(register_type(ty)).or_default().push(reg(value));
        }
    }
    for (i, &ty) in scratch.iter().enumerate() {
        by_type.entry(register_type(ty)).or_default().push(format!("%x{i}"));
    }
    let mut out = String::new();
    for (ty, names) in by_type {
        for chunk in names.chunks(8) {
            out.push_str(&format!("    .reg .{ty} {};\n", chunk.join(", ")));
        }
    }
    out
}

fn float_literal(value: Scalar) -> String {
    match value.ty() {
        ScalarType::F64 => format!("0d{:016X}", value.bits()),
        _ => format!("0f{:08X}", value.bits()),
    }
}

/// Immediate form of `value` for an instruction on type `ty`.
fn immediate(ty: ScalarType, value: i64) -> String {
    if ty.is_float() {
        float_literal(Scalar::from_i64(ty, value))
    } else {
        value.to_string()
    }
}

fn libdevice(name: &str, ty: ScalarType) -> GpuResult<&'static str> {
    let f64_names = [
        ("exp", "__nv_exp"),
        ("log", "__nv_log"),
        ("tanh", "__nv_tanh"),
        ("sin", "__nv_sin"),
        ("cos", "__nv_cos"),
        ("pow", "__nv_pow"),
        ("atan2", "__nv_atan2"),
        ("fmod", "__nv_fmod"),
    ];
    let f32_names = [
        ("exp", "__nv_expf"),
        ("log", "__nv_logf"),
        ("tanh", "__nv_tanhf"),
        ("sin", "__nv_sinf"),
        ("cos", "__nv_cosf"),
        ("pow", "__nv_powf"),
        ("atan2", "__nv_atan2f"),
        ("fmod", "__nv_fmodf"),
    ];
    let table = match ty {
        ScalarType::F32 => &f32_names,
        ScalarType::F64 => &f64_names,
        other => {
            return Err(GpuError::Internal(format!("no libdevice {name} for {other}")));
        }
    };
    table
        .iter()
        .find(|(op, _)| *op == name)
        .map(|(_, symbol)| *symbol)
        .ok_or_else(|| GpuError::Internal(format!("no libdevice function {name}")))
}

struct BodyPrinter<'m, 'e> {
    module: &'m KirModule,
    values: &'m IndexVec<ValueId, ScalarType>,
    locals: &'m IndexVec<kgen_kir::LocalId, LocalDecl>,
    externs: &'e mut Externs,
    shared: Vec<String>,
    params: Vec<String>,
    scratch: Vec<ScalarType>,
    labels: usize,
    depth: usize,
    out: String,
}

impl<'m, 'e> BodyPrinter<'m, 'e> {
    fn new(
        module: &'m KirModule,
        values: &'m IndexVec<ValueId, ScalarType>,
        locals: &'m IndexVec<kgen_kir::LocalId, LocalDecl>,
        externs: &'e mut Externs,
    ) -> Self {
        Self {
            module,
            values,
            locals,
            externs,
            shared: Vec::new(),
            params: Vec::new(),
            scratch: Vec::new(),
            labels: 0,
            depth: 1,
            out: String::new(),
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn label(&mut self, name: &str) {
        self.out.push_str(name);
        self.out.push_str(":\n");
    }

    fn fresh_label(&mut self, kind: &str) -> String {
        self.labels += 1;
        format!("$L_{kind}_{}", self.labels)
    }

    fn scratch(&mut self, ty: ScalarType) -> String {
        self.scratch.push(ty);
        format!("%x{}", self.scratch.len() - 1)
    }

    fn local_name(&self, index: usize) -> String {
        format!("l{index}_{}", self.locals.as_slice()[index].name)
    }

    fn local_declarations(&self) -> String {
        let mut out = String::new();
        for (i, decl) in self.locals.iter().enumerate() {
            out.push_str(&format!(
                "    .local .align {ARRAY_ALIGN} .b8 {}[{}];\n",
                self.local_name(i),
                decl.byte_size().max(1)
            ));
        }
        out
    }

    fn ty(&self, value: ValueId) -> ScalarType {
        self.values[value]
    }

    fn call_libdevice(&mut self, dst: ValueId, name: &str, args: &[ValueId]) -> GpuResult<()> {
        let ty = self.ty(dst);
        let symbol = libdevice(name, ty)?;
        self.externs.insert(symbol, (ty, args.len()));
        let args: Vec<String> = args.iter().map(|&a| reg(a)).collect();
        self.line(&format!("call.uni ({}), {symbol}, ({});", reg(dst), args.join(", ")));
        Ok(())
    }

    fn block(&mut self, block: &[Stmt]) -> GpuResult<()> {
        for stmt in block {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> GpuResult<()> {
        match stmt {
            Stmt::Let { dst, expr } => self.expr(*dst, expr)?,
            Stmt::Store { space, addr, value } => {
                let ty = self.ty(*value);
                if ty == ScalarType::Pred {
                    let byte = self.scratch(ScalarType::U16);
                    self.line(&format!("selp.u16 {byte}, 1, 0, {};", reg(*value)));
                    self.line(&format!("st.{}.u8 [{}], {byte};", space.ptx_name(), reg(*addr)));
                } else {
                    self.line(&format!(
                        "st.{}.{} [{}], {};",
                        space.ptx_name(),
                        memory_type(ty),
                        reg(*addr),
                        reg(*value)
                    ));
                }
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let else_label = self.fresh_label("else");
                let end_label = self.fresh_label("endif");
                let target = if else_body.is_empty() { &end_label } else { &else_label };
                self.line(&format!("@!{} bra {target};", reg(*cond)));
                self.depth += 1;
                self.block(then_body)?;
                self.depth -= 1;
                if !else_body.is_empty() {
                    self.line(&format!("bra.uni {end_label};"));
                    self.label(&else_label);
                    self.depth += 1;
                    self.block(else_body)?;
                    self.depth -= 1;
                }
                self.label(&end_label);
            }
            Stmt::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                let ty = self.ty(*var);
                let t = register_type(ty);
                let head = self.fresh_label("loop");
                let exit = self.fresh_label("endloop");
                let done = self.scratch(ScalarType::Pred);
                self.line(&format!("mov.{t} {}, {};", reg(*var), reg(*start)));
                self.label(&head);
                self.line(&format!("setp.ge.{t} {done}, {}, {};", reg(*var), reg(*end)));
                self.line(&format!("@{done} bra {exit};"));
                self.depth += 1;
                self.block(body)?;
                self.depth -= 1;
                self.line(&format!("add.{t} {0}, {0}, {1};", reg(*var), reg(*step)));
                self.line(&format!("bra.uni {head};"));
                self.label(&exit);
            }
            Stmt::Barrier => self.line("bar.sync 0;"),
            Stmt::Atomic {
                space,
                op,
                addr,
                value,
            } => self.atomic(*space, *op, *addr, *value)?,
            Stmt::Call {
                func,
                args,
                results,
            } => {
                let name = &self.module.functions[*func].name;
                let args: Vec<String> = args.iter().map(|&a| reg(a)).collect();
                let text = if results.is_empty() {
                    format!("call.uni {name}, ({});", args.join(", "))
                } else {
                    let results: Vec<String> = results.iter().map(|&r| reg(r)).collect();
                    format!("call.uni ({}), {name}, ({});", results.join(", "), args.join(", "))
                };
                self.line(&text);
            }
        }
        Ok(())
    }

    fn atomic(&mut self, space: AddressSpace, op: AtomicOp, addr: ValueId, value: ValueId) -> GpuResult<()> {
        let ty = self.ty(value);
        let space = space.ptx_name();
        let native = |name: &str| {
            let t = match ty {
                ScalarType::S64 if name == "add" => "u64",
                other => register_type(other),
            };
            format!("red.{space}.{name}.{t} [{}], {};", reg(addr), reg(value))
        };
        match op {
            AtomicOp::Add => self.line(&native("add")),
            AtomicOp::Min => self.line(&native("min")),
            AtomicOp::Max => self.line(&native("max")),
            AtomicOp::Cas(func) => {
                let t = register_type(ty);
                let m = memory_type(ty);
                let b = bit_type(ty);
                let name = self.module.functions[func].name.clone();
                let old = self.scratch(ty);
                let new = self.scratch(ty);
                let seen = self.scratch(ty);
                let retry = self.scratch(ScalarType::Pred);
                let head = self.fresh_label("cas");
                self.line(&format!("ld.{space}.{m} {old}, [{}];", reg(addr)));
                self.label(&head);
                self.line(&format!("call.uni ({new}), {name}, ({old}, {});", reg(value)));
                self.line(&format!("atom.{space}.cas.{b} {seen}, [{}], {old}, {new};", reg(addr)));
                self.line(&format!("setp.ne.{b} {retry}, {seen}, {old};"));
                self.line(&format!("mov.{} {old}, {seen};", move_type(ty, t)));
                self.line(&format!("@{retry} bra {head};"));
            }
        }
        Ok(())
    }

    fn expr(&mut self, dst: ValueId, expr: &Expr) -> GpuResult<()> {
        let d = reg(dst);
        let ty = self.ty(dst);
        let t = register_type(ty);
        match expr {
            Expr::Const(value) => {
                let text = match ty {
                    ScalarType::Pred => format!("setp.ne.u32 {d}, {}, 0;", value.bits()),
                    ScalarType::F32 | ScalarType::F64 => format!("mov.{t} {d}, {};", float_literal(*value)),
                    other if other.is_signed() => format!("mov.{t} {d}, {};", value.as_i64()),
                    _ => format!("mov.{t} {d}, {};", value.bits()),
                };
                self.line(&text);
            }
            Expr::Special(special) => self.line(&format!("mov.u32 {d}, {};", special.ptx_name())),
            Expr::Binary { op, lhs, rhs } => self.binary(dst, *op, *lhs, *rhs)?,
            Expr::Unary { op, value } => self.unary(dst, *op, *value)?,
            Expr::Cmp { op, lhs, rhs } => self.compare(dst, *op, *lhs, *rhs),
            Expr::Select {
                cond,
                on_true,
                on_false,
            } => {
                if ty == ScalarType::Pred {
                    self.line(&format!("@{} mov.pred {d}, {};", reg(*cond), reg(*on_true)));
                    self.line(&format!("@!{} mov.pred {d}, {};", reg(*cond), reg(*on_false)));
                } else {
                    self.line(&format!(
                        "selp.{t} {d}, {}, {}, {};",
                        reg(*on_true),
                        reg(*on_false),
                        reg(*cond)
                    ));
                }
            }
            Expr::Cast(value) => self.cast(dst, *value),
            Expr::Load { space, addr } => {
                if ty == ScalarType::Pred {
                    let byte = self.scratch(ScalarType::U16);
                    self.line(&format!("ld.{}.u8 {byte}, [{}];", space.ptx_name(), reg(*addr)));
                    self.line(&format!("setp.ne.u16 {d}, {byte}, 0;"));
                } else {
                    self.line(&format!(
                        "ld.{}.{} {d}, [{}];",
                        space.ptx_name(),
                        memory_type(ty),
                        reg(*addr)
                    ));
                }
            }
            Expr::ShflDown { value, delta } => self.shuffle_down(dst, *value, *delta),
            Expr::ParamAddr(position) => {
                let name = self.params.get(*position).cloned().ok_or_else(|| {
                    GpuError::Internal(format!("kernel parameter {position} is not declared"))
                })?;
                self.line(&format!("ld.param.u64 {d}, [{name}];"));
                self.line(&format!("cvta.to.global.u64 {d}, {d};"));
            }
            Expr::SharedAddr(id) => {
                let name = self.shared.get(id.index()).cloned().ok_or_else(|| {
                    GpuError::Internal(format!("shared array {} is not declared", id.index()))
                })?;
                self.line(&format!("mov.u64 {d}, {name};"));
            }
            Expr::LocalAddr(id) => {
                let name = self.local_name(id.index());
                self.line(&format!("mov.u64 {d}, {name};"));
            }
            Expr::GlobalAddr(id) => {
                let name = &self.module.globals[*id].name;
                self.line(&format!("mov.u64 {d}, {name};"));
            }
        }
        Ok(())
    }

    fn binary(&mut self, dst: ValueId, op: BinOp, lhs: ValueId, rhs: ValueId) -> GpuResult<()> {
        let ty = self.ty(dst);
        let (d, a, b) = (reg(dst), reg(lhs), reg(rhs));
        let t = register_type(ty);
        if ty == ScalarType::Pred {
            let name = match op {
                BinOp::And | BinOp::Min | BinOp::Mul => "and",
                BinOp::Or | BinOp::Max => "or",
                BinOp::Xor | BinOp::Add | BinOp::Sub => "xor",
                other => {
                    return Err(GpuError::Internal(format!("cannot print {other:?} on pred")));
                }
            };
            self.line(&format!("{name}.pred {d}, {a}, {b};"));
            return Ok(());
        }
        let text = match op {
            BinOp::Add => format!("add.{t} {d}, {a}, {b};"),
            BinOp::Sub => format!("sub.{t} {d}, {a}, {b};"),
            BinOp::Mul if ty.is_float() => format!("mul.{t} {d}, {a}, {b};"),
            BinOp::Mul => format!("mul.lo.{t} {d}, {a}, {b};"),
            BinOp::Div if ty.is_float() => format!("div.rn.{t} {d}, {a}, {b};"),
            BinOp::Div => format!("div.{t} {d}, {a}, {b};"),
            BinOp::Rem if ty.is_float() => return self.call_libdevice(dst, "fmod", &[lhs, rhs]),
            BinOp::Rem => format!("rem.{t} {d}, {a}, {b};"),
            BinOp::Min => format!("min.{t} {d}, {a}, {b};"),
            BinOp::Max => format!("max.{t} {d}, {a}, {b};"),
            BinOp::And => format!("and.{} {d}, {a}, {b};", bit_type(ty)),
            BinOp::Or => format!("or.{} {d}, {a}, {b};", bit_type(ty)),
            BinOp::Xor => format!("xor.{} {d}, {a}, {b};", bit_type(ty)),
            BinOp::Shl | BinOp::Shr => {
                let amount = if matches!(self.ty(rhs), ScalarType::U32 | ScalarType::S32) {
                    b
                } else {
                    let amount = self.scratch(ScalarType::U32);
                    self.line(&format!("cvt.u32.{} {amount}, {b};", register_type(self.ty(rhs))));
                    amount
                };
                if op == BinOp::Shl {
                    format!("shl.{} {d}, {a}, {amount};", bit_type(ty))
                } else {
                    format!("shr.{t} {d}, {a}, {amount};")
                }
            }
            BinOp::Pow => return self.call_libdevice(dst, "pow", &[lhs, rhs]),
            BinOp::Atan2 => return self.call_libdevice(dst, "atan2", &[lhs, rhs]),
        };
        self.line(&text);
        Ok(())
    }

    fn unary(&mut self, dst: ValueId, op: UnOp, value: ValueId) -> GpuResult<()> {
        let ty = self.ty(dst);
        let (d, a) = (reg(dst), reg(value));
        let t = register_type(ty);
        let text = match op {
            UnOp::Not if ty == ScalarType::Pred => format!("not.pred {d}, {a};"),
            UnOp::Not => format!("not.{} {d}, {a};", bit_type(ty)),
            UnOp::Abs | UnOp::Neg if ty == ScalarType::Pred => format!("mov.pred {d}, {a};"),
            UnOp::Abs if ty.is_unsigned() => format!("mov.{t} {d}, {a};"),
            UnOp::Abs => format!("abs.{t} {d}, {a};"),
            UnOp::Neg if ty.is_unsigned() => {
                format!("neg.s{} {d}, {a};", register_type(ty).trim_start_matches('u'))
            }
            UnOp::Neg => format!("neg.{t} {d}, {a};"),
            UnOp::Sqrt => format!("sqrt.rn.{t} {d}, {a};"),
            UnOp::Rsqrt => format!("rsqrt.approx.{t} {d}, {a};"),
            UnOp::Floor => format!("cvt.rmi.{t}.{t} {d}, {a};"),
            UnOp::Ceil => format!("cvt.rpi.{t}.{t} {d}, {a};"),
            UnOp::Exp => return self.call_libdevice(dst, "exp", &[value]),
            UnOp::Log => return self.call_libdevice(dst, "log", &[value]),
            UnOp::Tanh => return self.call_libdevice(dst, "tanh", &[value]),
            UnOp::Sin => return self.call_libdevice(dst, "sin", &[value]),
            UnOp::Cos => return self.call_libdevice(dst, "cos", &[value]),
            UnOp::Sign => {
                self.sign(dst, value);
                return Ok(());
            }
        };
        self.line(&text);
        Ok(())
    }

    fn sign(&mut self, dst: ValueId, value: ValueId) {
        let ty = self.ty(dst);
        let (d, a) = (reg(dst), reg(value));
        let t = register_type(ty);
        let zero = immediate(ty, 0);
        let one = immediate(ty, 1);
        if ty == ScalarType::Pred {
            self.line(&format!("mov.pred {d}, {a};"));
            return;
        }
        if ty.is_unsigned() {
            let nonzero = self.scratch(ScalarType::Pred);
            self.line(&format!("setp.ne.{t} {nonzero}, {a}, 0;"));
            self.line(&format!("selp.{t} {d}, 1, 0, {nonzero};"));
            return;
        }
        let positive = self.scratch(ScalarType::Pred);
        let negative = self.scratch(ScalarType::Pred);
        let up = self.scratch(ty);
        let down = self.scratch(ty);
        self.line(&format!("setp.gt.{t} {positive}, {a}, {zero};"));
        self.line(&format!("setp.lt.{t} {negative}, {a}, {zero};"));
        self.line(&format!("selp.{t} {up}, {one}, {zero}, {positive};"));
        self.line(&format!("selp.{t} {down}, {one}, {zero}, {negative};"));
        self.line(&format!("sub.{t} {d}, {up}, {down};"));
        if ty.is_float() {
            let nan = self.scratch(ScalarType::Pred);
            self.line(&format!("setp.nan.{t} {nan}, {a}, {a};"));
            self.line(&format!("@{nan} mov.{t} {d}, {a};"));
        }
    }

    fn compare(&mut self, dst: ValueId, op: CmpOp, lhs: ValueId, rhs: ValueId) {
        let operand = self.ty(lhs);
        let d = reg(dst);
        let (a, b, ty) = if operand == ScalarType::Pred {
            let a = self.scratch(ScalarType::U16);
            let b = self.scratch(ScalarType::U16);
            self.line(&format!("selp.u16 {a}, 1, 0, {};", reg(lhs)));
            self.line(&format!("selp.u16 {b}, 1, 0, {};", reg(rhs)));
            (a, b, ScalarType::U16)
        } else {
            (reg(lhs), reg(rhs), operand)
        };
        let name = match op {
            CmpOp::Eq => "eq",
            CmpOp::Ne if ty.is_float() => "neu",
            CmpOp::Ne => "ne",
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
        };
        self.line(&format!("setp.{name}.{} {d}, {a}, {b};", register_type(ty)));
    }

    fn cast(&mut self, dst: ValueId, value: ValueId) {
        let to = self.ty(dst);
        let from = self.ty(value);
        let (d, a) = (reg(dst), reg(value));
        let text = if to == from {
            format!("mov.{} {d}, {a};", move_type(to, register_type(to)))
        } else if to == ScalarType::Pred {
            format!("setp.ne.{} {d}, {a}, {};", register_type(from), immediate(from, 0))
        } else if from == ScalarType::Pred {
            format!(
                "selp.{} {d}, {}, {}, {a};",
                register_type(to),
                immediate(to, 1),
                immediate(to, 0)
            )
        } else if to.is_float() && from.is_float() {
            if to.byte_size() < from.byte_size() {
                format!("cvt.rn.{}.{} {d}, {a};", register_type(to), register_type(from))
            } else {
                format!("cvt.{}.{} {d}, {a};", register_type(to), register_type(from))
            }
        } else if from.is_float() {
            format!("cvt.rzi.{}.{} {d}, {a};", memory_type(to), register_type(from))
        } else if to.is_float() {
            format!("cvt.rn.{}.{} {d}, {a};", register_type(to), memory_type(from))
        } else {
            format!("cvt.{}.{} {d}, {a};", memory_type(to), memory_type(from))
        };
        self.line(&text);
    }

    fn shuffle_down(&mut self, dst: ValueId, value: ValueId, delta: u32) {
        let ty = self.ty(dst);
        let (d, a) = (reg(dst), reg(value));
        let shfl = |out: &str, input: &str| format!("shfl.sync.down.b32 {out}, {input}, {delta}, 0x1f, 0xffffffff;");
        match ty.byte_size() {
            4 if ty != ScalarType::Pred => self.line(&shfl(&d, &a)),
            8 => {
                let lo = self.scratch(ScalarType::U32);
                let hi = self.scratch(ScalarType::U32);
                self.line(&format!("mov.b64 {{{lo}, {hi}}}, {a};"));
                self.line(&shfl(&lo, &lo));
                self.line(&shfl(&hi, &hi));
                self.line(&format!("mov.b64 {d}, {{{lo}, {hi}}};"));
            }
            _ => {
                let word = self.scratch(ScalarType::U32);
                if ty == ScalarType::Pred {
                    self.line(&format!("selp.u32 {word}, 1, 0, {a};"));
                    self.line(&shfl(&word, &word));
                    self.line(&format!("setp.ne.u32 {d}, {word}, 0;"));
                } else {
                    self.line(&format!("cvt.u32.{} {word}, {a};", register_type(ty)));
                    self.line(&shfl(&word, &word));
                    self.line(&format!("cvt.{}.u32 {d}, {word};", memory_type(ty)));
                }
            }
        }
    }
}
