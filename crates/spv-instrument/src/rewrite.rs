//! # The rewriting pipeline
//!
//! Drives the enabled passes over one module in a fixed order:
//! check passes, helper linking, debug printf, then cleanup. The ordering is
//! load-bearing: every check pass assumes its guarded region is valid
//! SPIR-V, the printf pass must not have its own buffer accesses checked,
//! and the dead-code sweep runs last so it can drop whatever instrumentation
//! the selected guards made unreachable.

use rspirv::spirv;

use crate::{
    dce,
    link,
    module::{Module, ModuleSettings},
    pass::Pass,
    passes,
    validate, InstrumentError,
};

///Binding index of the printf output buffer inside the instrumentation
/// descriptor set.
pub const BINDING_INST_DEBUG_PRINTF: u32 = 3;

///Which checks to compile in and how to finish the module. Resolved once per
/// device from the settings surface and the device's capabilities.
#[derive(Debug, Clone)]
pub struct RewriteSettings {
    pub bindless_descriptor: bool,
    pub buffer_device_address: bool,
    pub ray_query: bool,
    pub post_process_descriptor_index: bool,
    pub debug_printf_enabled: bool,
    ///Printf is the only instrumentation; skips the dead-code sweep since
    /// the printf pass leaves nothing unreachable behind.
    pub debug_printf_only: bool,

    pub debug_dump_instrumented_shaders: bool,
    pub debug_validate_instrumented_shaders: bool,
    pub debug_print_instrumentation_info: bool,
    ///Per-module cap on injected checks. Zero means unlimited.
    pub debug_max_instrumentations_count: u32,

    ///Descriptor set slot reserved for the runtime's I/O buffers.
    pub output_buffer_descriptor_set: u32,
    pub support_non_semantic_info: bool,
    pub support_int64: bool,
    pub support_memory_model_device_scope: bool,
    ///VK_KHR_relaxed_block_layout enabled on the device.
    pub relax_block_layout: bool,
    ///VK_EXT_scalar_block_layout enabled on the device.
    pub scalar_block_layout: bool,
}

impl Default for RewriteSettings {
    fn default() -> Self {
        RewriteSettings {
            bindless_descriptor: false,
            buffer_device_address: false,
            ray_query: false,
            post_process_descriptor_index: false,
            debug_printf_enabled: false,
            debug_printf_only: false,
            debug_dump_instrumented_shaders: false,
            debug_validate_instrumented_shaders: false,
            debug_print_instrumentation_info: false,
            debug_max_instrumentations_count: 0,
            output_buffer_descriptor_set: 0,
            support_non_semantic_info: false,
            support_int64: false,
            support_memory_model_device_scope: false,
            relax_block_layout: false,
            scalar_block_layout: false,
        }
    }
}

///Outcome of one rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    ///Input was not SPIR-V, or no enabled pass had anything to check.
    /// The caller keeps using the original binary.
    Unchanged,
    Instrumented(Vec<u32>),
}

///Rewrites one shader at a time. Stateless apart from the settings, so one
/// instance serves a whole device.
pub struct Rewriter {
    settings: RewriteSettings,
}

impl Rewriter {
    pub fn new(settings: RewriteSettings) -> Self {
        Rewriter { settings }
    }

    pub fn settings(&self) -> &RewriteSettings {
        &self.settings
    }

    ///Instruments one module. `Err` is fatal (validation or cleanup broke
    /// the rewritten module); the caller reports it and keeps the original.
    pub fn instrument(
        &self,
        words: &[u32],
        unique_shader_id: u32,
        has_bindless_descriptors: bool,
    ) -> Result<Rewrite, InstrumentError> {
        if words.first() != Some(&spirv::MAGIC_NUMBER) {
            return Ok(Rewrite::Unchanged);
        }

        if self.settings.debug_dump_instrumented_shaders {
            dump_words(words, unique_shader_id, "before");
        }

        let module_settings = ModuleSettings {
            shader_id: unique_shader_id,
            output_buffer_descriptor_set: self.settings.output_buffer_descriptor_set,
            print_debug_info: self.settings.debug_print_instrumentation_info,
            max_instrumentations_count: self.settings.debug_max_instrumentations_count,
            support_non_semantic_info: self.settings.support_non_semantic_info,
            support_int64: self.settings.support_int64,
            support_memory_model_device_scope: self.settings.support_memory_model_device_scope,
            has_bindless_descriptors,
        };

        let mut module = match Module::load(words, module_settings) {
            Ok(module) => module,
            Err(e) => {
                // Whatever the app submitted, it is not something we can
                // rewrite; hand it to the driver untouched.
                log::warn!("skipping instrumentation, module did not parse: {e}");
                return Ok(Rewrite::Unchanged);
            }
        };

        let mut modified = false;

        if self.settings.bindless_descriptor {
            modified |= passes::BindlessDescriptorPass.apply(&mut module)?;
            modified |= passes::NonBindlessOobBufferPass.apply(&mut module)?;
            modified |= passes::NonBindlessOobTexelBufferPass.apply(&mut module)?;
        }

        if self.settings.buffer_device_address {
            modified |= passes::BufferDeviceAddressPass.apply(&mut module)?;
        }

        if self.settings.ray_query {
            modified |= passes::RayQueryPass.apply(&mut module)?;
        }

        // Runs last among the check passes: the guards the passes above
        // emitted contain whatever this one records.
        if self.settings.post_process_descriptor_index {
            modified |= passes::PostProcessDescriptorIndexingPass.apply(&mut module)?;
        }

        link::link_helpers(&mut module)?;

        // Printf stays behind the link step; its helper uses buffer device
        // address itself and must not be covered by the checks above.
        if self.settings.debug_printf_enabled {
            modified |= passes::DebugPrintfPass {
                binding: BINDING_INST_DEBUG_PRINTF,
            }
            .apply(&mut module)?;
        }

        if !modified {
            return Ok(Rewrite::Unchanged);
        }

        module.post_process();
        let mut out = module.assemble();

        if self.settings.debug_dump_instrumented_shaders {
            dump_words(&out, unique_shader_id, "after");
        }

        if self.settings.debug_validate_instrumented_shaders {
            let options = validate::ValidatorOptions {
                relax_block_layout: self.settings.relax_block_layout,
                scalar_block_layout: self.settings.scalar_block_layout,
            };
            validate::validate_words(&out, &options).map_err(|e| {
                InstrumentError::Validation(format!(
                    "instrumented shader (id {unique_shader_id:#x}) is invalid: {e}"
                ))
            })?;
        }

        if !self.settings.debug_printf_only {
            let options = dce::DceOptions {
                preserve_interface: true,
                run_validator: false,
            };
            dce::run(module.spirv_mut(), &options)?;
            out = module.assemble();

            if self.settings.debug_dump_instrumented_shaders {
                dump_words(&out, unique_shader_id, "opt");
            }
        }

        Ok(Rewrite::Instrumented(out))
    }
}

///Writes the raw word stream to `dump_<id>_<suffix>.spv` in the working
/// directory.
fn dump_words(words: &[u32], unique_shader_id: u32, suffix: &str) {
    let file_name = format!("dump_{unique_shader_id}_{suffix}.spv");
    if let Err(e) = std::fs::write(&file_name, bytemuck::cast_slice::<u32, u8>(words)) {
        log::warn!("failed to write {file_name}: {e}");
    }
}
