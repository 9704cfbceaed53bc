//! Guards loads and stores through physical-storage-buffer pointers. The
//! address arrives as raw data, so the only place it can be range-checked is
//! in the shader itself.

use rspirv::{
    dr::Operand,
    spirv::{Op, StorageClass},
};

use crate::{module::Module, pass::Pass, InstrumentError};

use super::{collect_sites, result_types, type_def};

pub const HELPER: &str = "inst_buffer_device_address";

pub struct BufferDeviceAddressPass;

impl Pass for BufferDeviceAddressPass {
    fn name(&self) -> &'static str {
        "buffer-device-address"
    }

    fn apply(&self, module: &mut Module) -> Result<bool, InstrumentError> {
        let types = result_types(module.spirv());

        let is_physical_pointer = |id: u32| -> bool {
            types
                .get(&id)
                .and_then(|ty| type_def(module.spirv(), *ty))
                .map(|def| {
                    def.class.opcode == Op::TypePointer
                        && def.operands.first()
                            == Some(&Operand::StorageClass(StorageClass::PhysicalStorageBuffer))
                })
                .unwrap_or(false)
        };

        let sites = collect_sites(module.spirv(), |inst| {
            matches!(inst.class.opcode, Op::Load | Op::Store)
                && super::first_id_ref(inst)
                    .map(|id| is_physical_pointer(id))
                    .unwrap_or(false)
        });
        Ok(super::inject_at_sites(module, HELPER, &sites))
    }
}
