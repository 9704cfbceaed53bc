//! Aggressive dead-code elimination.
//!
//! Runs after linking so it can strip whatever parts of the injected
//! instrumentation the selected guards made unreachable: functions no entry
//! point reaches, then types, constants and globals nothing references.

use ahash::AHashSet;
use rspirv::{
    binary::Assemble,
    dr::{Instruction, Operand},
    spirv::{Decoration, LinkageType, Op},
};

use crate::{validate, InstrumentError};

#[derive(Debug, Clone)]
pub struct DceOptions {
    ///Keep every `OpEntryPoint` interface variable alive even when the
    /// remaining code no longer references it.
    pub preserve_interface: bool,
    ///Re-validate the module after the sweep; a validation failure is
    /// reported as a DCE failure.
    pub run_validator: bool,
}

impl Default for DceOptions {
    fn default() -> Self {
        DceOptions {
            preserve_interface: true,
            run_validator: false,
        }
    }
}

///Sweeps the module. Returns true if anything was removed.
pub fn run(spirv: &mut rspirv::dr::Module, options: &DceOptions) -> Result<bool, InstrumentError> {
    let mut modified = false;

    // Roots: entry points and exported functions.
    let mut reachable = AHashSet::default();
    let mut queue = Vec::new();
    for entry in spirv.entry_points.iter() {
        if let Some(Operand::IdRef(f)) = entry.operands.get(1) {
            queue.push(*f);
        }
    }
    for ann in spirv.annotations.iter() {
        if is_linkage(ann, LinkageType::Export) {
            if let Some(Operand::IdRef(f)) = ann.operands.first() {
                queue.push(*f);
            }
        }
    }

    while let Some(f) = queue.pop() {
        if !reachable.insert(f) {
            continue;
        }
        if let Some(function) = spirv.functions.iter().find(|func| func.def_id() == Some(f)) {
            for block in function.blocks.iter() {
                for inst in block.instructions.iter() {
                    if inst.class.opcode == Op::FunctionCall {
                        if let Some(Operand::IdRef(callee)) = inst.operands.first() {
                            queue.push(*callee);
                        }
                    }
                }
            }
        }
    }

    let before = spirv.functions.len();
    spirv
        .functions
        .retain(|f| f.def_id().map(|id| reachable.contains(&id)).unwrap_or(false));
    modified |= spirv.functions.len() != before;

    // Ids referenced by everything that survives.
    let mut live = AHashSet::default();
    let mut reference = |inst: &Instruction, live: &mut AHashSet<u32>| {
        if let Some(ty) = inst.result_type {
            live.insert(ty);
        }
        for op in inst.operands.iter() {
            if let Some(id) = op.id_ref_any() {
                live.insert(id);
            }
        }
    };

    if !options.preserve_interface {
        // Drop interface variables nothing references anymore. Collect the
        // function-side references first so entry-point operands don't keep
        // themselves alive.
        let mut used = AHashSet::default();
        for function in spirv.functions.iter() {
            for block in function.blocks.iter() {
                for inst in block.instructions.iter() {
                    for op in inst.operands.iter() {
                        if let Some(id) = op.id_ref_any() {
                            used.insert(id);
                        }
                    }
                }
            }
        }
        for entry in spirv.entry_points.iter_mut() {
            let before = entry.operands.len();
            // operands 0..=2 are execution model, function and name
            let mut index = 0;
            entry.operands.retain(|op| {
                index += 1;
                if index <= 3 {
                    return true;
                }
                match op.id_ref_any() {
                    Some(id) => used.contains(&id),
                    None => true,
                }
            });
            modified |= entry.operands.len() != before;
        }
    }

    for entry in spirv.entry_points.iter() {
        reference(entry, &mut live);
    }
    for mode in spirv.execution_modes.iter() {
        reference(mode, &mut live);
    }
    for function in spirv.functions.iter() {
        if let Some(def) = function.def.as_ref() {
            reference(def, &mut live);
        }
        for param in function.parameters.iter() {
            reference(param, &mut live);
        }
        for block in function.blocks.iter() {
            if let Some(label) = block.label.as_ref() {
                reference(label, &mut live);
            }
            for inst in block.instructions.iter() {
                reference(inst, &mut live);
            }
        }
    }

    // Globals only reference earlier globals, so one reverse pass closes the
    // set.
    let mut kept = Vec::with_capacity(spirv.types_global_values.len());
    for inst in spirv.types_global_values.drain(..).rev() {
        let alive = inst.result_id.map(|id| live.contains(&id)).unwrap_or(true);
        if alive {
            reference(&inst, &mut live);
            kept.push(inst);
        } else {
            modified = true;
        }
    }
    kept.reverse();
    spirv.types_global_values = kept;

    // Debug info and decorations that pointed at removed ids go with them.
    let target_live = |inst: &Instruction| match inst.operands.first() {
        Some(Operand::IdRef(id)) => live.contains(id),
        _ => true,
    };
    spirv.annotations.retain(|inst| target_live(inst));
    spirv.debug_names.retain(|inst| target_live(inst));
    spirv
        .ext_inst_imports
        .retain(|inst| inst.result_id.map(|id| live.contains(&id)).unwrap_or(true));

    if options.run_validator {
        let words = spirv.assemble();
        validate::validate_words(&words, &validate::ValidatorOptions::default())
            .map_err(InstrumentError::DeadCode)?;
    }

    Ok(modified)
}

fn is_linkage(ann: &Instruction, linkage: LinkageType) -> bool {
    ann.class.opcode == Op::Decorate
        && ann.operands.get(1) == Some(&Operand::Decoration(Decoration::LinkageAttributes))
        && ann.operands.last() == Some(&Operand::LinkageType(linkage))
}
