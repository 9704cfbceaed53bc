//! Guards descriptor-array accesses. Bindless bindings (partially bound or
//! update-after-bind) cannot be proven in-bounds or initialized at bind time,
//! so every indexed access gets a runtime length/initialization check.

use rspirv::spirv::Op;

use crate::{module::Module, pass::Pass, InstrumentError};

use super::{collect_sites, descriptor_variables, first_id_ref, inject_at_sites};

pub const HELPER: &str = "inst_bindless_descriptor";

pub struct BindlessDescriptorPass;

impl Pass for BindlessDescriptorPass {
    fn name(&self) -> &'static str {
        "bindless-descriptor"
    }

    fn apply(&self, module: &mut Module) -> Result<bool, InstrumentError> {
        let variables = descriptor_variables(module.spirv());
        let sites = collect_sites(module.spirv(), |inst| {
            matches!(inst.class.opcode, Op::AccessChain | Op::InBoundsAccessChain)
                && first_id_ref(inst)
                    .and_then(|base| variables.get(&base))
                    .map(|var| var.arrayed)
                    .unwrap_or(false)
        });
        Ok(inject_at_sites(module, HELPER, &sites))
    }
}
