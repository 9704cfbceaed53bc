//! # SPIR-V instrumentation pipeline.
//!
//! Rewrites application shader binaries so they carry runtime validation
//! checks. The crate is structured around three stages:
//!
//! - Module: loads a SPIR-V word stream and owns the per-shader
//!   instrumentation settings and link bookkeeping.
//! - Pass: defines the [`Pass`](pass::Pass) API plus the stock check passes
//!   (bindless descriptors, OOB buffers, buffer device address, ray query,
//!   descriptor-index post processing, debug printf).
//! - Rewrite: drives the fixed pass order over one module, links requested
//!   helper functions, optionally re-validates with `spirv-val` and finishes
//!   with an aggressive dead-code sweep.
//!
//! Nothing in here talks to a driver; the caller hands in words and gets
//! words back (or the input unchanged).

use thiserror::Error;

pub use rspirv;

pub mod cache;
pub mod dce;
pub mod link;
pub mod module;
pub mod pass;
pub mod passes;
pub mod rewrite;
pub mod spirv_ext;
pub mod validate;

pub use module::{Module, ModuleSettings};
pub use rewrite::{Rewrite, RewriteSettings, Rewriter};

#[derive(Error, Debug)]
pub enum InstrumentError {
    #[error("failed to parse SPIR-V module: {0}")]
    Parse(String),
    #[error("SPIRV builder error: {0}")]
    Builder(#[from] rspirv::dr::Error),
    #[error("failed to link instrumentation helpers: {0}")]
    Link(String),
    #[error("instrumented shader failed validation: {0}")]
    Validation(String),
    #[error("dead-code elimination failed: {0}")]
    DeadCode(String),
}
