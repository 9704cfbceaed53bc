//! Guards texel-buffer reads and writes. Texel buffers are fetched by texel
//! index rather than through an access chain, so the OOB check hooks the
//! image instructions directly.

use rspirv::spirv::Op;

use crate::{module::Module, pass::Pass, InstrumentError};

use super::{collect_sites, inject_at_sites, is_texel_buffer_image, result_types};

pub const HELPER: &str = "inst_non_bindless_oob_texel_buffer";

pub struct NonBindlessOobTexelBufferPass;

impl Pass for NonBindlessOobTexelBufferPass {
    fn name(&self) -> &'static str {
        "non-bindless-oob-texel-buffer"
    }

    fn apply(&self, module: &mut Module) -> Result<bool, InstrumentError> {
        let types = result_types(module.spirv());
        let sites = collect_sites(module.spirv(), |inst| {
            if !matches!(
                inst.class.opcode,
                Op::ImageRead | Op::ImageWrite | Op::ImageFetch
            ) {
                return false;
            }
            // operand 0 is the image value; trace it back to its type
            super::first_id_ref(inst)
                .and_then(|image| types.get(&image))
                .map(|image_type| is_texel_buffer_image(module.spirv(), *image_type))
                .unwrap_or(false)
        });
        Ok(inject_at_sites(module, HELPER, &sites))
    }
}
