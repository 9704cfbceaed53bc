//! Records every descriptor access for the post-draw validation path.
//!
//! Runs last among the check passes: the earlier passes wrap their targets in
//! guard branches, so a recording call injected after them inherits those
//! guards and never observes an access the guards rejected.

use rspirv::spirv::Op;

use crate::{module::Module, pass::Pass, InstrumentError};

use super::{collect_sites, descriptor_variables, first_id_ref, inject_at_sites};

pub const HELPER: &str = "inst_post_process_descriptor_index";

pub struct PostProcessDescriptorIndexingPass;

impl Pass for PostProcessDescriptorIndexingPass {
    fn name(&self) -> &'static str {
        "post-process-descriptor-indexing"
    }

    fn apply(&self, module: &mut Module) -> Result<bool, InstrumentError> {
        let variables = descriptor_variables(module.spirv());
        let sites = collect_sites(module.spirv(), |inst| {
            matches!(inst.class.opcode, Op::AccessChain | Op::InBoundsAccessChain)
                && first_id_ref(inst)
                    .map(|base| variables.contains_key(&base))
                    .unwrap_or(false)
        });
        Ok(inject_at_sites(module, HELPER, &sites))
    }
}
