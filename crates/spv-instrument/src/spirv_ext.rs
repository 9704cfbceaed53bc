//! Extensions to [`rspirv::dr::Module`]. Adds the querying and mutation
//! helpers the instrumentation passes share.

use rspirv::{
    dr::{Instruction, Operand},
    spirv::{Capability, ExecutionModel, Op},
};

pub trait SpirvExt {
    ///Returns true if the extension is declared in the module.
    fn has_extension(&self, ext: &str) -> bool;

    ///Returns true if the capability is declared in the module.
    fn has_capability(&self, cap: Capability) -> bool;

    ///Adds the capability, if not already present.
    fn add_capability(&mut self, cap: Capability);

    ///Removes the capability, if present.
    fn remove_capability(&mut self, cap: Capability);

    ///Adds the extension, if not already declared.
    fn add_extension(&mut self, ext: &str);

    ///Returns the execution model of the first entry point, if any.
    fn get_execution_model(&self) -> Option<ExecutionModel>;

    ///Returns the result id of the `OpExtInstImport` with the given name.
    fn ext_inst_import_id(&self, name: &str) -> Option<u32>;
}

impl SpirvExt for rspirv::dr::Module {
    fn has_extension(&self, ext: &str) -> bool {
        self.extensions
            .iter()
            .any(|inst| inst.operands.first() == Some(&Operand::LiteralString(ext.to_string())))
    }

    fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities
            .iter()
            .any(|inst| inst.operands.first() == Some(&Operand::Capability(cap)))
    }

    fn add_capability(&mut self, cap: Capability) {
        if !self.has_capability(cap) {
            self.capabilities.push(Instruction::new(
                Op::Capability,
                None,
                None,
                vec![Operand::Capability(cap)],
            ));
        }
    }

    fn remove_capability(&mut self, cap: Capability) {
        self.capabilities
            .retain(|inst| inst.operands.first() != Some(&Operand::Capability(cap)));
    }

    fn add_extension(&mut self, ext: &str) {
        if !self.has_extension(ext) {
            self.extensions.push(Instruction::new(
                Op::Extension,
                None,
                None,
                vec![Operand::LiteralString(ext.to_string())],
            ));
        }
    }

    fn get_execution_model(&self) -> Option<ExecutionModel> {
        let entry = self.entry_points.first()?;
        match entry.operands.first() {
            Some(Operand::ExecutionModel(m)) => Some(*m),
            _ => None,
        }
    }

    fn ext_inst_import_id(&self, name: &str) -> Option<u32> {
        self.ext_inst_imports.iter().find_map(|inst| {
            if inst.operands.first() == Some(&Operand::LiteralString(name.to_string())) {
                inst.result_id
            } else {
                None
            }
        })
    }
}
