//! State shared by every emitter while compiling one module.

use crate::config::EmitterConfig;
use crate::device::DeviceInfo;
use crate::elemental::Elemental;
use crate::ir_array::IrIndex;
use crate::thunk::ThunkInfo;
use crate::{GpuError, GpuResult};
use indexmap::IndexMap;
use kgen_hlo::{ArrayShape, BufferAssignment, BufferSlice, CompId, HloModule, InstrId, Opcode, Shape};
use kgen_kir::{Builder, FuncId, GlobalDecl, GlobalId, KirModule, ScalarType};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Alignment of constant globals.
const CONSTANT_ALIGNMENT: u32 = 64;

/// Graph, assignment and target, plus the kernel module being built.
#[derive(Debug)]
pub struct ModuleContext<'a> {
    /// The operator graph.
    pub hlo: &'a HloModule,
    /// Where every value lives.
    pub assignment: &'a BufferAssignment,
    /// Emitter knobs.
    pub config: &'a EmitterConfig,
    /// Target limits.
    pub device: &'a DeviceInfo,
    /// Kernels, functions and globals emitted so far.
    pub kir: KirModule,
    functions: FxHashMap<CompId, FuncId>,
    constants: FxHashMap<InstrId, GlobalId>,
    names: IndexMap<String, usize>,
}

impl<'a> ModuleContext<'a> {
    /// A context with an empty kernel module named after `hlo`.
    #[must_use]
    pub fn new(
        hlo: &'a HloModule,
        assignment: &'a BufferAssignment,
        config: &'a EmitterConfig,
        device: &'a DeviceInfo,
    ) -> Self {
        Self {
            hlo,
            assignment,
            config,
            device,
            kir: KirModule::new(sanitize(hlo.name())),
            functions: FxHashMap::default(),
            constants: FxHashMap::default(),
            names: IndexMap::new(),
        }
    }

    /// A symbol derived from `base` that no other kernel, function or
    /// global uses: `base`, then `base_1`, `base_2`, ...
    pub fn unique_name(&mut self, base: &str) -> String {
        let base = sanitize(base);
        let mut count = self.names.get(&base).copied().unwrap_or(0);
        loop {
            let candidate = if count == 0 {
                base.clone()
            } else {
                format!("{base}_{count}")
            };
            count += 1;
            if !self.names.contains_key(&candidate) && !self.kir.has_symbol(&candidate) {
                self.names.insert(base, count);
                self.names.entry(candidate.clone()).or_insert(1);
                return candidate;
            }
        }
    }

    /// The module global holding constant `instr`, created on first use.
    pub fn constant_global(&mut self, instr: InstrId) -> GpuResult<GlobalId> {
        if let Some(&id) = self.constants.get(&instr) {
            return Ok(id);
        }
        let hlo = self.hlo;
        let constant = hlo.instr(instr);
        let Opcode::Constant(literal) = constant.opcode() else {
            return Err(GpuError::Internal(format!(
                "{} is not a constant",
                constant.name()
            )));
        };
        let name = self.unique_name(constant.name());
        let id = self.kir.add_global(GlobalDecl {
            name,
            bytes: literal.data().to_vec(),
            align: CONSTANT_ALIGNMENT,
        });
        self.constants.insert(instr, id);
        Ok(id)
    }

    /// The lowered form of nested computation `comp`, created on first use.
    ///
    /// Parameters and results must be scalars; a tuple root returns one
    /// result per element.
    pub fn function_for(&mut self, comp: CompId) -> GpuResult<FuncId> {
        if let Some(&id) = self.functions.get(&comp) {
            return Ok(id);
        }
        let hlo = self.hlo;
        let computation = hlo.computation(comp);
        let name = self.unique_name(computation.name());
        let mut b = Builder::new(name);
        let mut elemental = Elemental::new();

        let mut params = Vec::with_capacity(computation.parameters().len());
        for &param in computation.parameters() {
            let shape = scalar_shape_of(hlo.instr(param).shape(), computation.name())?;
            let value = b.fresh(ScalarType::from(shape.element_type()));
            elemental.bind_value(param, value);
            params.push(value);
        }

        let root = hlo.instr(computation.root());
        let outputs: Vec<InstrId> = if matches!(root.opcode(), Opcode::Tuple) {
            root.operands().to_vec()
        } else {
            vec![root.id()]
        };
        let mut results = Vec::with_capacity(outputs.len());
        for output in outputs {
            let shape = scalar_shape_of(hlo.instr(output).shape(), computation.name())?;
            let index = IrIndex::constant(&mut b, &vec![0; shape.rank()], shape, ScalarType::S32);
            results.push(elemental.generate(self, &mut b, output, &index)?);
        }

        let function = b.finish_function(params, results);
        trace!(function = %function.name, "lowered nested computation");
        let id = self.kir.add_function(function);
        self.functions.insert(comp, id);
        Ok(id)
    }

    /// Result types of the function lowered from `comp`.
    pub fn function_result_types(&mut self, comp: CompId) -> GpuResult<Vec<ScalarType>> {
        let id = self.function_for(comp)?;
        Ok(self.kir.functions[id].result_types())
    }

    /// Add a finished kernel.
    pub fn add_kernel(&mut self, kernel: kgen_kir::Kernel) {
        trace!(kernel = %kernel.name, statements = kernel.statement_count(), "emitted kernel");
        self.kir.add_kernel(kernel);
    }

    /// The slice holding `(instr, index)`.
    pub fn slice(&self, instr: InstrId, index: &[usize]) -> GpuResult<BufferSlice> {
        self.assignment.unique_slice(instr, index).ok_or_else(|| {
            GpuError::Internal(format!(
                "no buffer slice for {} at {index:?}",
                self.hlo.instr(instr).name()
            ))
        })
    }

    /// Provenance for thunks emitted for `instr`. The profile index is the
    /// instruction's position in its computation, when profiling.
    #[must_use]
    pub fn thunk_info(&self, instr: InstrId) -> ThunkInfo {
        let hlo = self.hlo.instr(instr);
        let profile_index = self
            .config
            .hlo_profiling
            .then(|| {
                self.hlo
                    .computation(hlo.parent())
                    .instructions()
                    .iter()
                    .position(|&id| id == instr)
            })
            .flatten();
        ThunkInfo::new(hlo.name(), profile_index)
    }
}

fn scalar_shape_of<'s>(shape: &'s Shape, computation: &str) -> GpuResult<&'s ArrayShape> {
    match shape.as_array() {
        Some(array) if array.num_elements() == 1 => Ok(array),
        _ => Err(GpuError::Unimplemented(format!(
            "nested computation {computation} must take and return scalars, found {shape:?}"
        ))),
    }
}

/// Restrict `name` to `[A-Za-z0-9_]`, prefixing `_` if it starts with a
/// digit.
#[must_use]
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgen_hlo::{scalar_binary_computation, BinaryOp, PrimitiveType};

    fn context_parts() -> (HloModule, BufferAssignment, EmitterConfig, DeviceInfo) {
        (
            HloModule::new("test.module"),
            BufferAssignment::new(),
            EmitterConfig::default(),
            DeviceInfo::mock(),
        )
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("add.3"), "add_3");
        assert_eq!(sanitize("7up"), "_7up");
        assert_eq!(sanitize("fusion-1"), "fusion_1");
        assert_eq!(sanitize(""), "_");
    }

    #[test]
    fn test_unique_names() {
        let (module, assignment, config, device) = context_parts();
        let mut mcx = ModuleContext::new(&module, &assignment, &config, &device);
        assert_eq!(mcx.unique_name("fusion"), "fusion");
        assert_eq!(mcx.unique_name("fusion"), "fusion_1");
        assert_eq!(mcx.unique_name("fusion.1"), "fusion_1_1");
        assert_eq!(mcx.unique_name("fusion"), "fusion_2");
        assert_eq!(mcx.kir.name, "test_module");
    }

    #[test]
    fn test_function_is_cached() {
        let (mut module, assignment, config, device) = context_parts();
        let add = scalar_binary_computation(&mut module, "add", BinaryOp::Add, PrimitiveType::F32);
        let mut mcx = ModuleContext::new(&module, &assignment, &config, &device);
        let f = mcx.function_for(add).unwrap();
        assert_eq!(mcx.function_for(add).unwrap(), f);
        assert_eq!(mcx.kir.functions.len(), 1);
        assert_eq!(
            mcx.function_result_types(add).unwrap(),
            vec![ScalarType::F32]
        );
        assert_eq!(mcx.kir.functions[f].param_types().len(), 2);
    }
}
