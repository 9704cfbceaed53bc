//! # Module state for one instrumentation run
//!
//! Wraps the [`rspirv`] in-memory representation of a single shader together
//! with the per-shader settings handed down by the device core. Passes mutate
//! the module through [`Module::inject_check_call`] and record which helper
//! functions have to be linked in afterwards.

use rspirv::{
    binary::Assemble,
    dr::{Function, Instruction, Operand},
    spirv::{Capability, Decoration, FunctionControl, LinkageType, Op},
};
use smallvec::SmallVec;

use crate::{spirv_ext::SpirvExt, InstrumentError};

///Per-shader knobs resolved by the device core before rewriting starts.
#[derive(Debug, Clone)]
pub struct ModuleSettings {
    ///Id embedded into every injected check so GPU-side fault records can
    /// name the shader.
    pub shader_id: u32,
    ///Descriptor set index the runtime's I/O buffers live in.
    pub output_buffer_descriptor_set: u32,
    ///Log every injected check while instrumenting.
    pub print_debug_info: bool,
    ///Upper bound on injected checks per module. Zero means unlimited.
    pub max_instrumentations_count: u32,
    pub support_non_semantic_info: bool,
    pub support_int64: bool,
    pub support_memory_model_device_scope: bool,
    ///The bound pipeline layout contains partially-bound or
    /// update-after-bind bindings.
    pub has_bindless_descriptors: bool,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        ModuleSettings {
            shader_id: 0,
            output_buffer_descriptor_set: 0,
            print_debug_info: false,
            max_instrumentations_count: 0,
            support_non_semantic_info: false,
            support_int64: false,
            support_memory_model_device_scope: false,
            has_bindless_descriptors: false,
        }
    }
}

///A helper function a pass wants resolved at link time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    ///Linkage name of the helper, e.g. `inst_buffer_device_address`.
    pub name: &'static str,
}

///Position of an instruction inside [`rspirv::dr::Module::functions`].
#[derive(Debug, Clone, Copy)]
pub struct InstructionRef {
    pub function: usize,
    pub block: usize,
    pub instruction: usize,
}

///Single shader module being instrumented.
pub struct Module {
    spv: rspirv::dr::Module,
    settings: ModuleSettings,
    link_requests: SmallVec<[LinkRequest; 4]>,
    ///Running ordinal of injected checks, also used as the per-site index
    /// passed to the helper.
    instrumented_count: u32,
}

impl Module {
    ///Parses the word stream. The caller has already rejected non-SPIR-V
    /// input via the magic number.
    pub fn load(words: &[u32], settings: ModuleSettings) -> Result<Self, InstrumentError> {
        let spv = rspirv::dr::load_words(words)
            .map_err(|e| InstrumentError::Parse(format!("{e:?}")))?;
        Ok(Module {
            spv,
            settings,
            link_requests: SmallVec::new(),
            instrumented_count: 0,
        })
    }

    pub fn spirv(&self) -> &rspirv::dr::Module {
        &self.spv
    }

    pub fn spirv_mut(&mut self) -> &mut rspirv::dr::Module {
        &mut self.spv
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.settings
    }

    pub fn instrumented_count(&self) -> u32 {
        self.instrumented_count
    }

    ///True while the module is still below `max_instrumentations_count`.
    pub fn within_budget(&self) -> bool {
        self.settings.max_instrumentations_count == 0
            || self.instrumented_count < self.settings.max_instrumentations_count
    }

    pub fn link_requests(&self) -> &[LinkRequest] {
        &self.link_requests
    }

    ///Records that `name` has to be linked in. Duplicate requests collapse.
    pub fn request_link(&mut self, name: &'static str) {
        if !self.link_requests.iter().any(|r| r.name == name) {
            self.link_requests.push(LinkRequest { name });
        }
    }

    ///Inserts a call to the (imported) helper `name` directly before the
    /// instruction at `at`, passing the shader id and the site ordinal.
    /// Returns false when the instrumentation budget is exhausted.
    pub fn inject_check_call(&mut self, name: &'static str, at: InstructionRef) -> bool {
        // Checked before the import is declared: a declaration without a
        // matching link request would be an unresolved import at link time.
        if !self.within_budget() {
            return false;
        }
        let void_id = self.ensure_type_void();
        let u32_id = self.ensure_type_u32();
        let helper_id = self.ensure_import(name, void_id, u32_id);
        if !self.inject_call(name, helper_id, at) {
            return false;
        }
        self.request_link(name);
        true
    }

    ///Like [`inject_check_call`](Self::inject_check_call), but the helper is
    /// generated in-module instead of resolved by the linker. Used by passes
    /// that must run after the link step.
    pub fn inject_local_call(&mut self, name: &'static str, at: InstructionRef) -> bool {
        if !self.within_budget() {
            return false;
        }
        let void_id = self.ensure_type_void();
        let u32_id = self.ensure_type_u32();
        let helper_id = self.ensure_local_helper(name, void_id, u32_id);
        self.inject_call(name, helper_id, at)
    }

    fn inject_call(&mut self, name: &'static str, helper_id: u32, at: InstructionRef) -> bool {
        if !self.within_budget() {
            return false;
        }

        let shader_id = self.settings.shader_id;
        let site = self.instrumented_count;

        let void_id = self.ensure_type_void();
        let shader_id_const = self.ensure_constant_u32(shader_id);
        let site_const = self.ensure_constant_u32(site);

        let call_id = self.fresh_id();
        let call = Instruction::new(
            Op::FunctionCall,
            Some(void_id),
            Some(call_id),
            vec![
                Operand::IdRef(helper_id),
                Operand::IdRef(shader_id_const),
                Operand::IdRef(site_const),
            ],
        );
        self.spv.functions[at.function].blocks[at.block]
            .instructions
            .insert(at.instruction, call);

        if self.settings.print_debug_info {
            log::debug!(
                "shader {:#x}: injected {} at function {} block {} instruction {}",
                shader_id,
                name,
                at.function,
                at.block,
                at.instruction
            );
        }

        self.instrumented_count += 1;
        true
    }

    ///Finds or generates the in-module helper `fn name(shader_id: u32,
    /// site: u32)` with an empty body, for passes that run after linking.
    fn ensure_local_helper(&mut self, name: &'static str, void_id: u32, u32_id: u32) -> u32 {
        let wanted = Operand::LiteralString(name.to_string());
        for dbg in self.spv.debug_names.iter() {
            if dbg.class.opcode == Op::Name && dbg.operands.get(1) == Some(&wanted) {
                if let Some(Operand::IdRef(id)) = dbg.operands.first() {
                    return *id;
                }
            }
        }

        let fn_ty = self.ensure_fn_type(void_id, u32_id);
        let fid = self.fresh_id();
        let mut helper = Function::new();
        helper.def = Some(Instruction::new(
            Op::Function,
            Some(void_id),
            Some(fid),
            vec![
                Operand::FunctionControl(FunctionControl::NONE),
                Operand::IdRef(fn_ty),
            ],
        ));
        for _ in 0..2 {
            let pid = self.fresh_id();
            helper.parameters.push(Instruction::new(
                Op::FunctionParameter,
                Some(u32_id),
                Some(pid),
                vec![],
            ));
        }
        let label_id = self.fresh_id();
        let mut block = rspirv::dr::Block::new();
        block.label = Some(Instruction::new(Op::Label, None, Some(label_id), vec![]));
        block
            .instructions
            .push(Instruction::new(Op::Return, None, None, vec![]));
        helper.blocks.push(block);
        helper.end = Some(Instruction::new(Op::FunctionEnd, None, None, vec![]));
        self.spv.functions.push(helper);

        self.spv.debug_names.push(Instruction::new(
            Op::Name,
            None,
            None,
            vec![Operand::IdRef(fid), Operand::LiteralString(name.to_string())],
        ));
        fid
    }

    ///Cleanup after the passes ran: function declarations are hoisted above
    /// definitions and the module is tagged as instrumented.
    pub fn post_process(&mut self) {
        // OpFunction declarations (no body) must precede definitions.
        let (declarations, definitions): (Vec<Function>, Vec<Function>) = self
            .spv
            .functions
            .drain(..)
            .partition(|f| f.blocks.is_empty());
        self.spv.functions = declarations;
        self.spv.functions.extend(definitions);

        self.spv.debug_module_processed.push(Instruction::new(
            Op::ModuleProcessed,
            None,
            None,
            vec![Operand::LiteralString(format!(
                "instrumented shader {:#010x}",
                self.settings.shader_id
            ))],
        ));
    }

    ///Serializes the module back into a word stream.
    pub fn assemble(&self) -> Vec<u32> {
        self.spv.assemble()
    }

    fn fresh_id(&mut self) -> u32 {
        let header = self
            .spv
            .header
            .as_mut()
            .expect("loaded module always carries a header");
        let id = header.bound;
        header.bound += 1;
        id
    }

    fn find_type(&self, opcode: Op, operands: &[Operand]) -> Option<u32> {
        self.spv.types_global_values.iter().find_map(|inst| {
            if inst.class.opcode == opcode && inst.operands == operands {
                inst.result_id
            } else {
                None
            }
        })
    }

    fn ensure_type_void(&mut self) -> u32 {
        if let Some(id) = self.find_type(Op::TypeVoid, &[]) {
            return id;
        }
        let id = self.fresh_id();
        self.spv
            .types_global_values
            .push(Instruction::new(Op::TypeVoid, None, Some(id), vec![]));
        id
    }

    fn ensure_type_u32(&mut self) -> u32 {
        let operands = [Operand::LiteralInt32(32), Operand::LiteralInt32(0)];
        if let Some(id) = self.find_type(Op::TypeInt, &operands) {
            return id;
        }
        let id = self.fresh_id();
        self.spv.types_global_values.push(Instruction::new(
            Op::TypeInt,
            None,
            Some(id),
            operands.to_vec(),
        ));
        id
    }

    ///`void (u32, u32)`, the signature every check helper shares.
    fn ensure_fn_type(&mut self, void_id: u32, u32_id: u32) -> u32 {
        let operands = [
            Operand::IdRef(void_id),
            Operand::IdRef(u32_id),
            Operand::IdRef(u32_id),
        ];
        if let Some(id) = self.find_type(Op::TypeFunction, &operands) {
            return id;
        }
        let id = self.fresh_id();
        self.spv.types_global_values.push(Instruction::new(
            Op::TypeFunction,
            None,
            Some(id),
            operands.to_vec(),
        ));
        id
    }

    fn ensure_constant_u32(&mut self, value: u32) -> u32 {
        let u32_id = self.ensure_type_u32();
        let found = self.spv.types_global_values.iter().find_map(|inst| {
            if inst.class.opcode == Op::Constant
                && inst.result_type == Some(u32_id)
                && inst.operands.first() == Some(&Operand::LiteralInt32(value))
            {
                inst.result_id
            } else {
                None
            }
        });
        if let Some(id) = found {
            return id;
        }
        let id = self.fresh_id();
        self.spv.types_global_values.push(Instruction::new(
            Op::Constant,
            Some(u32_id),
            Some(id),
            vec![Operand::LiteralInt32(value)],
        ));
        id
    }

    ///Finds or declares the import stub `fn name(shader_id: u32, site: u32)`.
    fn ensure_import(&mut self, name: &'static str, void_id: u32, u32_id: u32) -> u32 {
        // Already declared by an earlier site of the same pass?
        for ann in self.spv.annotations.iter() {
            if ann.class.opcode == Op::Decorate
                && ann.operands.get(1)
                    == Some(&Operand::Decoration(Decoration::LinkageAttributes))
                && ann.operands.get(2) == Some(&Operand::LiteralString(name.to_string()))
            {
                if let Some(Operand::IdRef(id)) = ann.operands.first() {
                    return *id;
                }
            }
        }

        let fn_ty = self.ensure_fn_type(void_id, u32_id);
        let fid = self.fresh_id();
        let mut decl = Function::new();
        decl.def = Some(Instruction::new(
            Op::Function,
            Some(void_id),
            Some(fid),
            vec![
                Operand::FunctionControl(FunctionControl::NONE),
                Operand::IdRef(fn_ty),
            ],
        ));
        for _ in 0..2 {
            let pid = self.fresh_id();
            decl.parameters.push(Instruction::new(
                Op::FunctionParameter,
                Some(u32_id),
                Some(pid),
                vec![],
            ));
        }
        decl.end = Some(Instruction::new(Op::FunctionEnd, None, None, vec![]));
        // Appended here, hoisted above definitions in post_process so sites
        // captured by index stay valid while a pass is still injecting.
        self.spv.functions.push(decl);

        self.spv.annotations.push(Instruction::new(
            Op::Decorate,
            None,
            None,
            vec![
                Operand::IdRef(fid),
                Operand::Decoration(Decoration::LinkageAttributes),
                Operand::LiteralString(name.to_string()),
                Operand::LinkageType(LinkageType::Import),
            ],
        ));
        self.spv.debug_names.push(Instruction::new(
            Op::Name,
            None,
            None,
            vec![Operand::IdRef(fid), Operand::LiteralString(name.to_string())],
        ));
        self.spv.add_capability(Capability::Linkage);
        fid
    }
}
