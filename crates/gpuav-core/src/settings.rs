//! Read-only settings surface. Filled by the layer's configuration machinery
//! before device creation; the core never writes it back.

///Which shader checks are compiled into instrumented binaries.
#[derive(Debug, Clone, Default)]
pub struct ShaderInstrumentationFlags {
    pub bindless_descriptor: bool,
    pub buffer_device_address: bool,
    pub ray_query: bool,
    pub post_process_descriptor_index: bool,
}

#[derive(Debug, Clone)]
pub struct GpuavSettings {
    ///Memoize instrumented binaries by fingerprint instead of re-running the
    /// pass pipeline per creation call.
    pub cache_instrumented_shaders: bool,
    ///Only instrument shaders the application opted in via the validation
    /// features sidecar.
    pub select_instrumented_shaders: bool,
    pub debug_dump_instrumented_shaders: bool,
    pub debug_validate_instrumented_shaders: bool,
    pub debug_printf_enabled: bool,
    ///Printf is the only reason to rewrite; check passes are off.
    pub debug_printf_only: bool,
    pub debug_print_instrumentation_info: bool,
    ///Per-module cap on injected checks. Zero means unlimited.
    pub debug_max_instrumentations_count: u32,
    pub shader_instrumentation: ShaderInstrumentationFlags,
    ///Hide one descriptor set slot from the application so the reserved slot
    /// can never collide.
    pub gpu_validation_reserve_binding_slot: bool,
    ///The outer state tracker already serializes at a finer level; the
    /// core-wide lock is handed back unheld.
    pub fine_grained_locking: bool,
}

impl Default for GpuavSettings {
    fn default() -> Self {
        GpuavSettings {
            cache_instrumented_shaders: true,
            select_instrumented_shaders: false,
            debug_dump_instrumented_shaders: false,
            debug_validate_instrumented_shaders: false,
            debug_printf_enabled: false,
            debug_printf_only: false,
            debug_print_instrumentation_info: false,
            debug_max_instrumentations_count: 0,
            shader_instrumentation: ShaderInstrumentationFlags::default(),
            gpu_validation_reserve_binding_slot: false,
            fine_grained_locking: false,
        }
    }
}

impl GpuavSettings {
    ///True iff any rewriting will occur; everything in the creation paths is
    /// gated on this.
    pub fn is_spirv_modified(&self) -> bool {
        let checks = &self.shader_instrumentation;
        checks.bindless_descriptor
            || checks.buffer_device_address
            || checks.ray_query
            || checks.post_process_descriptor_index
            || self.debug_printf_enabled
    }
}
