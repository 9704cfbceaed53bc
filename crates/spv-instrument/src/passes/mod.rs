//! Stock instrumentation passes.
//!
//! Each pass scans the module for the instruction class it guards, then
//! injects a call to its runtime helper in front of every hit (subject to the
//! per-module budget) and requests the helper for linking. The helper bodies
//! belong to the runtime side; what the passes own is finding the sites and
//! wiring the calls so the linker and the dead-code sweep see them.

use ahash::AHashMap;
use rspirv::{
    dr::{Instruction, Operand},
    spirv::{Dim, Op, StorageClass},
};

use crate::module::{InstructionRef, Module};

mod bindless_descriptor;
mod buffer_device_address;
mod debug_printf;
pub mod helpers;
mod oob_buffer;
mod oob_texel_buffer;
mod post_process_descriptor_indexing;
mod ray_query;

pub use bindless_descriptor::BindlessDescriptorPass;
pub use buffer_device_address::BufferDeviceAddressPass;
pub use debug_printf::DebugPrintfPass;
pub use oob_buffer::NonBindlessOobBufferPass;
pub use oob_texel_buffer::NonBindlessOobTexelBufferPass;
pub use post_process_descriptor_indexing::PostProcessDescriptorIndexingPass;
pub use ray_query::RayQueryPass;

///Descriptor-backed global variable, classified far enough for the passes to
/// pick their targets.
struct DescriptorVariable {
    ///Pointee wraps an `OpTypeArray`/`OpTypeRuntimeArray`, i.e. the binding
    /// is a descriptor array.
    arrayed: bool,
    storage_class: StorageClass,
}

///Map from result id to the classified descriptor variable, for every global
/// variable bound through a descriptor set.
fn descriptor_variables(spirv: &rspirv::dr::Module) -> AHashMap<u32, DescriptorVariable> {
    let mut decorated = ahash::AHashSet::default();
    for ann in spirv.annotations.iter() {
        if ann.class.opcode == Op::Decorate
            && ann.operands.get(1)
                == Some(&Operand::Decoration(
                    rspirv::spirv::Decoration::DescriptorSet,
                ))
        {
            if let Some(Operand::IdRef(id)) = ann.operands.first() {
                decorated.insert(*id);
            }
        }
    }

    let mut variables = AHashMap::default();
    for inst in spirv.types_global_values.iter() {
        if inst.class.opcode != Op::Variable {
            continue;
        }
        let id = match inst.result_id {
            Some(id) => id,
            None => continue,
        };
        if !decorated.contains(&id) {
            continue;
        }
        let storage_class = match inst.operands.first() {
            Some(Operand::StorageClass(class)) => *class,
            _ => continue,
        };
        match storage_class {
            StorageClass::Uniform | StorageClass::StorageBuffer | StorageClass::UniformConstant => {
            }
            _ => continue,
        }
        let arrayed = pointee(spirv, inst.result_type)
            .map(|p| matches!(p.class.opcode, Op::TypeArray | Op::TypeRuntimeArray))
            .unwrap_or(false);
        variables.insert(
            id,
            DescriptorVariable {
                arrayed,
                storage_class,
            },
        );
    }
    variables
}

///Resolves a pointer type id to its pointee type instruction.
fn pointee<'a>(
    spirv: &'a rspirv::dr::Module,
    pointer_type: Option<u32>,
) -> Option<&'a Instruction> {
    let ptr = type_def(spirv, pointer_type?)?;
    if ptr.class.opcode != Op::TypePointer {
        return None;
    }
    match ptr.operands.get(1) {
        Some(Operand::IdRef(p)) => type_def(spirv, *p),
        _ => None,
    }
}

fn type_def(spirv: &rspirv::dr::Module, id: u32) -> Option<&Instruction> {
    spirv
        .types_global_values
        .iter()
        .find(|inst| inst.result_id == Some(id))
}

///Result id → result type id, for every value-producing instruction.
fn result_types(spirv: &rspirv::dr::Module) -> AHashMap<u32, u32> {
    let mut map = AHashMap::default();
    for inst in spirv.all_inst_iter() {
        if let (Some(id), Some(ty)) = (inst.result_id, inst.result_type) {
            map.insert(id, ty);
        }
    }
    map
}

fn first_id_ref(inst: &Instruction) -> Option<u32> {
    match inst.operands.first() {
        Some(Operand::IdRef(id)) => Some(*id),
        _ => None,
    }
}

fn is_texel_buffer_image(spirv: &rspirv::dr::Module, image_type: u32) -> bool {
    type_def(spirv, image_type)
        .map(|def| {
            def.class.opcode == Op::TypeImage
                && def.operands.get(1) == Some(&Operand::Dim(Dim::DimBuffer))
        })
        .unwrap_or(false)
}

///Collects the positions of every block instruction `matches` accepts.
fn collect_sites(
    spirv: &rspirv::dr::Module,
    mut matches: impl FnMut(&Instruction) -> bool,
) -> Vec<InstructionRef> {
    let mut sites = Vec::new();
    for (function, f) in spirv.functions.iter().enumerate() {
        for (block, b) in f.blocks.iter().enumerate() {
            for (instruction, inst) in b.instructions.iter().enumerate() {
                if matches(inst) {
                    sites.push(InstructionRef {
                        function,
                        block,
                        instruction,
                    });
                }
            }
        }
    }
    sites
}

///Injects `helper` before each site, in program order so the budget cuts off
/// the tail.
fn inject_at_sites(module: &mut Module, helper: &'static str, sites: &[InstructionRef]) -> bool {
    inject_at_sites_with(module, sites, |module, at| {
        module.inject_check_call(helper, at)
    })
}

///Same, for passes whose helper lives in-module instead of going through the
/// linker. Earlier injections shift later indices within the same block.
fn inject_at_sites_with(
    module: &mut Module,
    sites: &[InstructionRef],
    mut inject: impl FnMut(&mut Module, InstructionRef) -> bool,
) -> bool {
    let mut modified = false;
    let mut shift_key = (usize::MAX, usize::MAX);
    let mut shift = 0usize;
    for site in sites {
        if (site.function, site.block) != shift_key {
            shift_key = (site.function, site.block);
            shift = 0;
        }
        let at = InstructionRef {
            function: site.function,
            block: site.block,
            instruction: site.instruction + shift,
        };
        if !inject(module, at) {
            break;
        }
        shift += 1;
        modified = true;
    }
    modified
}
