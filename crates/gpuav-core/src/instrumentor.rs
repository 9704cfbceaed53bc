//! Device-scoped core state: reserved slot, instrumentation layouts, caches,
//! abort handling and the shader-object / pipeline-layout interception
//! hooks. The pipeline creation paths live in [`crate::intercept`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use ash::vk::{self, Handle};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use spv_instrument::cache::{shader_fingerprint, SpirvCache};
use spv_instrument::{Rewrite, RewriteSettings, Rewriter};

use crate::chassis::{
    PipelineDescriptor, PipelineInstrumentationData, PipelineLayoutDescriptor,
    ShaderInstrumentationMetadata, ShaderModuleDescriptor, ShaderObjectChassisState,
    ShaderObjectDescriptor, ShaderStageState,
};
use crate::driver::{DescriptorBinding, DeviceDriver};
use crate::layout::LayoutAdapter;
use crate::registry::{InstrumentedShader, InstrumentedShaderRegistry};
use crate::settings::GpuavSettings;

///Largest descriptor set slot the instrumentation will ever claim, clamping
/// devices that report an unreasonably large `maxBoundDescriptorSets`.
pub const MAX_ADJUSTED_BOUND_DESCRIPTOR_SET: u32 = 33;

///Device facts resolved by the chassis before the core is brought up.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub max_bound_descriptor_sets: u32,
    pub fragment_stores_and_atomics: bool,
    pub vertex_pipeline_stores_and_atomics: bool,
    pub shader_int64: bool,
    pub vulkan_memory_model_device_scope: bool,
    ///VK_KHR_shader_non_semantic_info enabled.
    pub non_semantic_info: bool,
    ///VK_KHR_relaxed_block_layout enabled.
    pub relaxed_block_layout: bool,
    ///VK_EXT_scalar_block_layout enabled.
    pub scalar_block_layout: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            max_bound_descriptor_sets: 4,
            fragment_stores_and_atomics: true,
            vertex_pipeline_stores_and_atomics: true,
            shader_int64: false,
            vulkan_memory_model_device_scope: false,
            non_semantic_info: false,
            relaxed_block_layout: false,
            scalar_block_layout: false,
        }
    }
}

///Invoked once when the core aborts, standing in for releasing the
/// per-device dispatch registration.
pub type ReleaseDispatch = Box<dyn FnOnce() + Send>;

///Handles created at device init, destroyed in the pre-destroy hook.
#[derive(Default)]
struct DeviceObjects {
    instrumentation_layout: vk::DescriptorSetLayout,
    dummy_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

pub struct ShaderInstrumentor {
    pub(crate) driver: Arc<dyn DeviceDriver>,
    pub(crate) settings: GpuavSettings,
    pub(crate) rewriter: Rewriter,
    pub(crate) reserved_slot: u32,

    objects: Mutex<DeviceObjects>,
    aborted: AtomicBool,
    release_dispatch: Mutex<Option<ReleaseDispatch>>,

    ///The core-wide lock of the coarse locking mode. Advisory: under
    /// fine-grained locking the guards are not taken and the chassis owns
    /// ordering. The registry and the grow-only stores below carry their own
    /// interior locks either way.
    core_lock: RwLock<()>,

    cache: Mutex<SpirvCache>,
    ///Raw module handles the app opted into instrumenting.
    selected_shaders: Mutex<AHashSet<u64>>,
    ///Fallback id source when the instrumented-shader cache is off.
    unique_shader_module_id: AtomicU32,

    pub(crate) registry: Arc<InstrumentedShaderRegistry>,
}

impl ShaderInstrumentor {
    ///Brings up the per-device state. Never fails the device: an unsupported
    /// device or a refused sub-resource logs an internal error and leaves the
    /// core aborted (inert) instead.
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        settings: GpuavSettings,
        profile: &DeviceProfile,
        instrumentation_bindings: &[DescriptorBinding],
        release_dispatch: Option<ReleaseDispatch>,
    ) -> Self {
        let adjusted_max_desc_sets_limit =
            MAX_ADJUSTED_BOUND_DESCRIPTOR_SET.min(profile.max_bound_descriptor_sets);
        let reserved_slot = adjusted_max_desc_sets_limit.saturating_sub(1);

        let rewriter = Rewriter::new(RewriteSettings {
            bindless_descriptor: settings.shader_instrumentation.bindless_descriptor,
            buffer_device_address: settings.shader_instrumentation.buffer_device_address,
            ray_query: settings.shader_instrumentation.ray_query,
            post_process_descriptor_index: settings
                .shader_instrumentation
                .post_process_descriptor_index,
            debug_printf_enabled: settings.debug_printf_enabled,
            debug_printf_only: settings.debug_printf_only,
            debug_dump_instrumented_shaders: settings.debug_dump_instrumented_shaders,
            debug_validate_instrumented_shaders: settings.debug_validate_instrumented_shaders,
            debug_print_instrumentation_info: settings.debug_print_instrumentation_info,
            debug_max_instrumentations_count: settings.debug_max_instrumentations_count,
            output_buffer_descriptor_set: reserved_slot,
            support_non_semantic_info: profile.non_semantic_info,
            support_int64: profile.shader_int64,
            support_memory_model_device_scope: profile.vulkan_memory_model_device_scope,
            relax_block_layout: profile.relaxed_block_layout,
            scalar_block_layout: profile.scalar_block_layout,
        });

        let instrumentor = ShaderInstrumentor {
            driver,
            settings,
            rewriter,
            reserved_slot,
            objects: Mutex::new(DeviceObjects::default()),
            aborted: AtomicBool::new(false),
            release_dispatch: Mutex::new(release_dispatch),
            core_lock: RwLock::new(()),
            cache: Mutex::new(SpirvCache::default()),
            selected_shaders: Mutex::new(AHashSet::default()),
            unique_shader_module_id: AtomicU32::new(1),
            registry: Arc::new(InstrumentedShaderRegistry::default()),
        };

        instrumentor.post_create_device(profile, instrumentation_bindings, adjusted_max_desc_sets_limit);
        instrumentor
    }

    fn post_create_device(
        &self,
        profile: &DeviceProfile,
        instrumentation_bindings: &[DescriptorBinding],
        adjusted_max_desc_sets_limit: u32,
    ) {
        if !profile.fragment_stores_and_atomics {
            self.internal_error(
                "GPU shader instrumentation requires fragmentStoresAndAtomics to allow writing \
                 out data inside the fragment shader.",
            );
            return;
        }
        if !profile.vertex_pipeline_stores_and_atomics {
            self.internal_error(
                "GPU shader instrumentation requires vertexPipelineStoresAndAtomics to allow \
                 writing out data inside the vertex shader.",
            );
            return;
        }

        // Device probably not a legit Vulkan device, since there should be
        // at least 4. Protect ourselves.
        if adjusted_max_desc_sets_limit == 1 {
            self.internal_error("Device can bind only a single descriptor set.");
            return;
        }

        let instrumentation_layout =
            match self.driver.create_descriptor_set_layout(instrumentation_bindings) {
                Ok(layout) => layout,
                Err(_) => {
                    self.internal_error(
                        "vkCreateDescriptorSetLayout failed for the instrumentation descriptor set",
                    );
                    return;
                }
            };
        self.objects.lock().instrumentation_layout = instrumentation_layout;

        let dummy_layout = match self.driver.create_descriptor_set_layout(&[]) {
            Ok(layout) => layout,
            Err(_) => {
                self.internal_error(
                    "vkCreateDescriptorSetLayout failed for the internal dummy descriptor set",
                );
                self.cleanup();
                return;
            }
        };
        self.objects.lock().dummy_layout = dummy_layout;

        let mut debug_layouts: Vec<vk::DescriptorSetLayout> = Vec::new();
        for _ in 0..self.reserved_slot {
            debug_layouts.push(dummy_layout);
        }
        debug_layouts.push(instrumentation_layout);
        match self.driver.create_pipeline_layout(&debug_layouts) {
            Ok(layout) => self.objects.lock().pipeline_layout = layout,
            Err(_) => {
                self.internal_error("vkCreatePipelineLayout failed for the internal pipeline layout");
                self.cleanup();
            }
        }
    }

    ///Best-effort teardown of whatever init managed to create.
    fn cleanup(&self) {
        let mut objects = self.objects.lock();
        if objects.instrumentation_layout != vk::DescriptorSetLayout::null() {
            self.driver
                .destroy_descriptor_set_layout(objects.instrumentation_layout);
            objects.instrumentation_layout = vk::DescriptorSetLayout::null();
        }
        if objects.dummy_layout != vk::DescriptorSetLayout::null() {
            self.driver.destroy_descriptor_set_layout(objects.dummy_layout);
            objects.dummy_layout = vk::DescriptorSetLayout::null();
        }
        if objects.pipeline_layout != vk::PipelineLayout::null() {
            self.driver.destroy_pipeline_layout(objects.pipeline_layout);
            objects.pipeline_layout = vk::PipelineLayout::null();
        }
    }

    pub fn pre_destroy_device(&self) {
        self.cleanup();
    }

    ///Adjusts the limits reported to the application so the reserved slot
    /// can never collide with app usage.
    pub fn reserve_binding_slot(settings: &GpuavSettings, max_bound_descriptor_sets: &mut u32) {
        // An implicit layer can report 0 here; ignore such calls.
        if *max_bound_descriptor_sets == 0 {
            return;
        }

        if *max_bound_descriptor_sets > MAX_ADJUSTED_BOUND_DESCRIPTOR_SET {
            log::warn!(
                "{} | A descriptor binding slot is required to store GPU-side information, but \
                 the device maxBoundDescriptorSets is {} which is too large, so we will be \
                 trying to use slot {}",
                warning_vuid(settings),
                max_bound_descriptor_sets,
                MAX_ADJUSTED_BOUND_DESCRIPTOR_SET
            );
        }

        if settings.gpu_validation_reserve_binding_slot {
            if *max_bound_descriptor_sets > 1 {
                *max_bound_descriptor_sets -= 1;
            } else {
                log::warn!(
                    "{} | Unable to reserve descriptor binding slot on a device with only one slot.",
                    warning_vuid(settings)
                );
            }
        }
    }

    ///A host-signalled wait recorded while GPU-assisted validation waits on
    /// queue completion deadlocks; flag it before it hangs the app.
    pub fn validate_cmd_wait_events(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags2,
    ) {
        if src_stage_mask.contains(vk::PipelineStageFlags2::HOST) {
            self.internal_error(&format!(
                "Command buffer {:#x} recorded with VK_PIPELINE_STAGE_HOST_BIT set. GPU-Assisted \
                 validation waits on queue completion. This wait could block the host's \
                 signaling of this event, resulting in deadlock.",
                command_buffer.as_raw()
            ));
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &GpuavSettings {
        &self.settings
    }

    pub fn reserved_slot(&self) -> u32 {
        self.reserved_slot
    }

    pub fn registry(&self) -> &Arc<InstrumentedShaderRegistry> {
        &self.registry
    }

    ///Coarse-mode read guard over the device-scoped state. `None` under
    /// fine-grained locking: the caller retains responsibility for ordering.
    pub fn read_lock(&self) -> Option<RwLockReadGuard<'_, ()>> {
        if self.settings.fine_grained_locking {
            None
        } else {
            Some(self.core_lock.read())
        }
    }

    pub fn write_lock(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        if self.settings.fine_grained_locking {
            None
        } else {
            Some(self.core_lock.write())
        }
    }

    ///Reports an unrecoverable condition and disconnects everything. Once
    /// aborted the per-device dispatch registration is released and every
    /// later intercept is a no-op; the core never re-enables.
    pub(crate) fn internal_error(&self, message: &str) {
        self.aborted.store(true, Ordering::Release);

        let layer_name = if self.settings.debug_printf_only {
            "DebugPrintf"
        } else {
            "GPU-AV"
        };
        log::error!(
            "{} | Internal Error, {} is being disabled. Details:\n{}",
            error_vuid(&self.settings),
            layer_name,
            message
        );

        if let Some(release) = self.release_dispatch.lock().take() {
            release();
        }
    }

    ///A failed rewrite only costs that one shader its checks; the core
    /// stays live so other shaders still get instrumented.
    pub(crate) fn rewrite_error(&self, message: &str) {
        log::error!(
            "{} | Error during shader instrumentation: {}",
            error_vuid(&self.settings),
            message
        );
    }

    pub(crate) fn internal_warning(&self, message: &str) {
        log::warn!(
            "{} | Internal Warning: {}",
            warning_vuid(&self.settings),
            message
        );
    }

    pub(crate) fn layout_adapter(&self) -> Option<LayoutAdapter> {
        if self.is_aborted() {
            return None;
        }
        let objects = self.objects.lock();
        if objects.instrumentation_layout == vk::DescriptorSetLayout::null() {
            return None;
        }
        Some(LayoutAdapter {
            reserved_slot: self.reserved_slot,
            dummy_layout: objects.dummy_layout,
            instrumentation_layout: objects.instrumentation_layout,
        })
    }

    // ---- pipeline layout ---------------------------------------------------

    pub fn pre_create_pipeline_layout(&self, descriptor: &mut PipelineLayoutDescriptor) {
        if self.is_aborted() || !self.settings.is_spirv_modified() {
            return;
        }
        let adapter = match self.layout_adapter() {
            Some(adapter) => adapter,
            None => return,
        };
        let _guard = self.read_lock();
        if let Err(overflow) = adapter.adapt(&mut descriptor.set_layouts) {
            self.internal_warning(&format!("pCreateInfo::{overflow}"));
        }
    }

    pub fn post_create_pipeline_layout(&self, result: vk::Result) {
        if result != vk::Result::SUCCESS {
            self.internal_error("Unable to create pipeline layout.");
        }
    }

    // ---- shader modules ----------------------------------------------------

    ///By default everything gets instrumented; with selection enabled, only
    /// the modules the app flagged are remembered here for pipeline time.
    pub fn post_create_shader_module(
        &self,
        descriptor: &ShaderModuleDescriptor,
        shader_module: vk::ShaderModule,
    ) {
        if self.is_aborted() {
            return;
        }
        if self.settings.select_instrumented_shaders && descriptor.gpu_assisted_flagged {
            let _guard = self.write_lock();
            self.selected_shaders.lock().insert(shader_module.as_raw());
        }
    }

    // ---- shader objects ----------------------------------------------------

    pub fn pre_create_shaders(
        &self,
        create_infos: &[ShaderObjectDescriptor],
        chassis_state: &mut ShaderObjectChassisState,
    ) {
        if self.is_aborted() || !self.settings.is_spirv_modified() {
            return;
        }

        chassis_state.modified_create_infos = create_infos.to_vec();
        chassis_state.instrumentations_data =
            vec![ShaderInstrumentationMetadata::default(); create_infos.len()];

        let adapter = match self.layout_adapter() {
            Some(adapter) => adapter,
            None => return,
        };

        for (i, info) in chassis_state.modified_create_infos.iter_mut().enumerate() {
            let _guard = self.read_lock();
            if let Err(overflow) = adapter.adapt(&mut info.set_layouts) {
                self.internal_warning(&format!("pCreateInfos[{i}]::{overflow}"));
            }

            self.shader_object_instrumentation(info, &mut chassis_state.instrumentations_data[i]);
        }
    }

    fn shader_object_instrumentation(
        &self,
        info: &mut ShaderObjectDescriptor,
        metadata: &mut ShaderInstrumentationMetadata,
    ) {
        if self.settings.select_instrumented_shaders && !info.gpu_assisted_flagged {
            return;
        }
        if let Some((unique_shader_id, words, _cached)) =
            self.instrument_words(&info.code, info.has_bindless)
        {
            metadata.unique_shader_id = unique_shader_id;
            metadata.instrumented = true;
            info.code = words;
        }
    }

    pub fn post_create_shaders(
        &self,
        create_infos: &[ShaderObjectDescriptor],
        shaders: &[vk::ShaderEXT],
        chassis_state: &ShaderObjectChassisState,
    ) {
        if !self.settings.is_spirv_modified() {
            return;
        }
        for (i, shader) in shaders.iter().enumerate() {
            let metadata = match chassis_state.instrumentations_data.get(i) {
                Some(metadata) if metadata.instrumented => metadata,
                _ => continue,
            };
            self.registry.insert_or_assign(
                metadata.unique_shader_id,
                InstrumentedShader {
                    pipeline: vk::Pipeline::null(),
                    shader_module: vk::ShaderModule::null(),
                    shader_object: *shader,
                    original_words: create_infos[i].code.clone(),
                },
            );
        }
    }

    ///Remove all shader trackers associated with this destroyed object.
    pub fn pre_destroy_shader_object(&self, shader: vk::ShaderEXT) {
        let to_erase = self.registry.snapshot(|entry| entry.shader_object == shader);
        for (id, _) in to_erase {
            self.registry.erase(id);
        }
    }

    // ---- the shared rewrite front door ------------------------------------

    ///Fingerprints, consults the cache and runs the pass pipeline. Returns
    /// the unique shader id, the words to hand the driver and whether they
    /// came from the cache; `None` leaves the original binary in place.
    pub(crate) fn instrument_words(
        &self,
        words: &[u32],
        has_bindless_descriptors: bool,
    ) -> Option<(u32, Vec<u32>, bool)> {
        let unique_shader_id = if self.settings.cache_instrumented_shaders {
            let fingerprint = shader_fingerprint(words);
            let _guard = self.read_lock();
            if let Some(hit) = self.cache.lock().get(fingerprint).map(<[u32]>::to_vec) {
                return Some((fingerprint, hit, true));
            }
            fingerprint
        } else {
            self.unique_shader_module_id.fetch_add(1, Ordering::Relaxed)
        };

        match self
            .rewriter
            .instrument(words, unique_shader_id, has_bindless_descriptors)
        {
            Ok(Rewrite::Instrumented(instrumented)) => {
                if self.settings.cache_instrumented_shaders {
                    let _guard = self.write_lock();
                    self.cache.lock().add(unique_shader_id, instrumented.clone());
                }
                Some((unique_shader_id, instrumented, false))
            }
            Ok(Rewrite::Unchanged) => None,
            Err(e) => {
                self.rewrite_error(&format!("{e}. Proceeding with non-instrumented shader."));
                None
            }
        }
    }

    ///The selection filter applied per pipeline stage: the stage (or its
    /// nested module descriptor) carries the feature flag, or its module was
    /// flagged at module-creation time.
    pub(crate) fn stage_selected(&self, stage: &ShaderStageState) -> bool {
        if !self.settings.select_instrumented_shaders {
            return true;
        }
        if stage.gpu_assisted_flagged {
            return true;
        }
        if stage.inlined_create_info {
            return false;
        }
        let _guard = self.read_lock();
        self.selected_shaders.lock().contains(&stage.module.as_raw())
    }

    ///`Needs-Instrumentation?` for one pipeline create-info slot.
    pub(crate) fn needs_instrumentation(&self, descriptor: &PipelineDescriptor) -> bool {
        // Hit when using pipeline libraries without shaders in them
        // (e.g. fragment output).
        if descriptor.stages.is_empty() && !descriptor.linking_shaders {
            return false;
        }
        // Move all instrumentation until final linking time.
        if descriptor.is_library() {
            return false;
        }
        // If the app claims every available set, the layout was left alone at
        // layout-creation time and pipelines built on it cannot be
        // instrumented.
        if descriptor.layout.active_slots.contains(&self.reserved_slot) {
            return false;
        }
        if descriptor.layout.set_layout_count > self.reserved_slot {
            return false;
        }
        true
    }

    ///Frees the objects the core created for a destroyed pipeline and sweeps
    /// its registry records.
    pub fn pre_destroy_pipeline(
        &self,
        pipeline: vk::Pipeline,
        instrumentation_data: Option<&PipelineInstrumentationData>,
    ) {
        let to_erase = self.registry.snapshot(|entry| entry.pipeline == pipeline);
        for (id, _) in to_erase {
            self.registry.erase(id);
        }

        if let Some(data) = instrumentation_data {
            for module in data.instrumented_shader_modules.iter() {
                self.driver.destroy_shader_module(*module);
            }
            if data.pre_raster_lib != vk::Pipeline::null() {
                self.driver.destroy_pipeline(data.pre_raster_lib);
            }
            if data.frag_out_lib != vk::Pipeline::null() {
                self.driver.destroy_pipeline(data.frag_out_lib);
            }
        }
    }
}

fn error_vuid(settings: &GpuavSettings) -> &'static str {
    if settings.debug_printf_only {
        "UNASSIGNED-DEBUG-PRINTF"
    } else {
        "UNASSIGNED-GPU-Assisted-Validation"
    }
}

fn warning_vuid(settings: &GpuavSettings) -> &'static str {
    if settings.debug_printf_only {
        "WARNING-DEBUG-PRINTF"
    } else {
        "WARNING-GPU-Assisted-Validation"
    }
}
