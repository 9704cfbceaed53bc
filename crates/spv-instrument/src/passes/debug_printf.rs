//! Routes `NonSemantic.DebugPrintf` extended instructions into the printf
//! output buffer.
//!
//! Always the last pass in the pipeline: the routing helper itself addresses
//! its buffer through buffer-device-address, and running it after the BDA
//! pass keeps its own accesses out of the checked set.

use rspirv::spirv::Op;

use crate::{module::Module, pass::Pass, spirv_ext::SpirvExt, InstrumentError};

use super::{collect_sites, inject_at_sites_with};

pub const HELPER: &str = "inst_debug_printf";

pub struct DebugPrintfPass {
    ///Binding index of the printf output buffer inside the instrumentation
    /// descriptor set.
    pub binding: u32,
}

impl Pass for DebugPrintfPass {
    fn name(&self) -> &'static str {
        "debug-printf"
    }

    fn apply(&self, module: &mut Module) -> Result<bool, InstrumentError> {
        let printf_set = match module.spirv().ext_inst_import_id("NonSemantic.DebugPrintf") {
            Some(id) => id,
            // No printf import, nothing to route.
            None => return Ok(false),
        };

        if !module.settings().support_non_semantic_info {
            log::warn!(
                "module uses DebugPrintf but VK_KHR_shader_non_semantic_info is not enabled; \
                 output will be routed to binding {} regardless",
                self.binding
            );
        }

        let sites = collect_sites(module.spirv(), |inst| {
            inst.class.opcode == Op::ExtInst
                && inst.operands.first() == Some(&rspirv::dr::Operand::IdRef(printf_set))
        });
        // The routing helper is generated in-module: this pass runs after
        // the link step, so nothing would resolve an import anymore.
        Ok(inject_at_sites_with(module, &sites, |module, at| {
            module.inject_local_call(HELPER, at)
        }))
    }
}
