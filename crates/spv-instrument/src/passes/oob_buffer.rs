//! Guards accesses into plain (non-arrayed) uniform and storage buffer
//! bindings against out-of-bounds offsets the descriptor range cannot cover.

use rspirv::spirv::{Op, StorageClass};

use crate::{module::Module, pass::Pass, InstrumentError};

use super::{collect_sites, descriptor_variables, first_id_ref, inject_at_sites};

pub const HELPER: &str = "inst_non_bindless_oob_buffer";

pub struct NonBindlessOobBufferPass;

impl Pass for NonBindlessOobBufferPass {
    fn name(&self) -> &'static str {
        "non-bindless-oob-buffer"
    }

    fn apply(&self, module: &mut Module) -> Result<bool, InstrumentError> {
        let variables = descriptor_variables(module.spirv());
        let sites = collect_sites(module.spirv(), |inst| {
            matches!(inst.class.opcode, Op::AccessChain | Op::InBoundsAccessChain)
                && first_id_ref(inst)
                    .and_then(|base| variables.get(&base))
                    .map(|var| {
                        !var.arrayed
                            && matches!(
                                var.storage_class,
                                StorageClass::Uniform | StorageClass::StorageBuffer
                            )
                    })
                    .unwrap_or(false)
        });
        Ok(inject_at_sites(module, HELPER, &sites))
    }
}
