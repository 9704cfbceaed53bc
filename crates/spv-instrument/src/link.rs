//! Resolves the helper imports the passes requested against a generated
//! helper library, using `spirv-linker`.

use crate::{module::Module, passes::helpers, InstrumentError};

///Links every requested helper into the module. No-op without requests.
pub fn link_helpers(module: &mut Module) -> Result<(), InstrumentError> {
    if module.link_requests().is_empty() {
        return Ok(());
    }

    let mut library = helpers::build_helper_library(module.link_requests())?;

    let spv = module.spirv_mut();
    let linked = spirv_linker::link(
        &mut [spv, &mut library],
        &spirv_linker::Options {
            lib: false,
            partial: false,
        },
    )
    .map_err(|e| InstrumentError::Link(e.to_string()))?;

    *spv = linked;
    Ok(())
}
