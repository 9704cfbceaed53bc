//! The `Pass` API. A pass is a self-contained transformation over a loaded
//! [`Module`] that inserts runtime checks for one class of error.

use crate::{module::Module, InstrumentError};

pub trait Pass {
    ///Short name used in logs and dumps.
    fn name(&self) -> &'static str;

    ///Applies the pass. Returns true if the module was modified.
    fn apply(&self, module: &mut Module) -> Result<bool, InstrumentError>;
}
