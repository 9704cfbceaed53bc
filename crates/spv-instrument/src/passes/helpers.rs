//! Builds the export side of the helper functions the passes import.
//!
//! The stubs only carry the linkage surface (name, `void(u32, u32)`
//! signature, Export attribute); the runtime replaces their bodies with the
//! real check code when it assembles its shader library.

use rspirv::{
    dr::{Builder, Operand},
    spirv::{
        AddressingModel, Capability, Decoration, FunctionControl, LinkageType, MemoryModel, Word,
    },
};

use crate::{module::LinkRequest, InstrumentError};

///Assembles a library module exporting one stub per requested helper.
pub fn build_helper_library(
    requests: &[LinkRequest],
) -> Result<rspirv::dr::Module, InstrumentError> {
    let mut b = Builder::new();
    b.set_version(1, 5);
    b.capability(Capability::Shader);
    b.capability(Capability::Linkage);
    b.memory_model(AddressingModel::Logical, MemoryModel::GLSL450);

    let void = b.type_void();
    let u32_ty = b.type_int(32, 0);
    let fn_ty = b.type_function(void, vec![u32_ty, u32_ty]);

    for request in requests {
        let f = b.begin_function(void, None, FunctionControl::NONE, fn_ty)?;
        let _shader_id: Word = b.function_parameter(u32_ty)?;
        let _site: Word = b.function_parameter(u32_ty)?;
        b.begin_block(None)?;
        b.ret()?;
        b.end_function()?;

        b.decorate(
            f,
            Decoration::LinkageAttributes,
            [
                Operand::LiteralString(request.name.to_string()),
                Operand::LinkageType(LinkageType::Export),
            ],
        );
        b.name(f, request.name.to_string());
    }

    Ok(b.module())
}
