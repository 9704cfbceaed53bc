//! Guards `OpRayQueryInitializeKHR`. The ray origin, direction and t-range
//! come straight from shader values and have to be checked for NaN/inf and
//! negative ranges at runtime.

use rspirv::spirv::Op;

use crate::{module::Module, pass::Pass, InstrumentError};

use super::{collect_sites, inject_at_sites};

pub const HELPER: &str = "inst_ray_query";

pub struct RayQueryPass;

impl Pass for RayQueryPass {
    fn name(&self) -> &'static str {
        "ray-query"
    }

    fn apply(&self, module: &mut Module) -> Result<bool, InstrumentError> {
        let sites = collect_sites(module.spirv(), |inst| {
            inst.class.opcode == Op::RayQueryInitializeKHR
        });
        Ok(inject_at_sites(module, HELPER, &sites))
    }
}
