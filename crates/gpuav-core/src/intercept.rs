//! Pipeline creation interception.
//!
//! Instruments all SPIR-V sent through pipeline creation. It arrives in
//! several shapes:
//! 1. a `VkShaderModule` handle — a replacement module is created from the
//!    instrumented binary and owned by the pipeline record;
//! 2. a graphics-pipeline-library fragment — deferred until final link time,
//!    where each referenced library is re-created with instrumented code;
//! 3. inlined through the stage-create-info's nested chain — the copied
//!    descriptor's words are swapped in place;
//! 4. a shader-module-identifier stage — skipped, the SPIR-V is unknown.
//! Shader objects take their own path through the instrumentor.

use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::chassis::{
    inlined_stage_sentinel, DeferredOperationJoins, PipelineChassisState, PipelineDescriptor,
    PipelineInstrumentationData, PipelineLayoutDescriptor, PipelineStateTracker,
    ShaderInstrumentationMetadata, ShaderModuleDescriptor, ShaderObjectChassisState,
    ShaderObjectDescriptor, ShaderStageState,
};
use crate::instrumentor::ShaderInstrumentor;
use crate::registry::{InstrumentedShader, InstrumentedShaderRegistry};

impl ShaderInstrumentor {
    ///Pre-call half of every pipeline creation entry point (graphics,
    /// compute, both ray-tracing variants). Deep-copies each create info and
    /// substitutes instrumented binaries into the copies.
    pub fn pre_create_pipelines(
        &self,
        tracker: &dyn PipelineStateTracker,
        create_infos: &[PipelineDescriptor],
        chassis_state: &mut PipelineChassisState,
    ) {
        if self.is_aborted() || !self.settings.is_spirv_modified() {
            return;
        }

        // The deep copy exists even for skipped slots so inlined SPIR-V the
        // caller handed us is never visible through the driver call.
        chassis_state.modified_create_infos = create_infos.to_vec();
        chassis_state.shader_instrumentations_metadata =
            vec![SmallVec::new(); create_infos.len()];
        chassis_state.instrumentation_data =
            vec![PipelineInstrumentationData::default(); create_infos.len()];

        let infos = chassis_state.modified_create_infos.iter_mut();
        let metas = chassis_state.shader_instrumentations_metadata.iter_mut();
        let datas = chassis_state.instrumentation_data.iter_mut();
        for ((descriptor, metadata), data) in infos.zip(metas).zip(datas) {
            if !self.needs_instrumentation(descriptor) {
                continue;
            }

            if descriptor.linking_shaders {
                self.pipeline_instrumentation_gpl(tracker, descriptor, metadata, data);
            } else {
                self.pipeline_instrumentation(descriptor, metadata, data);
            }
        }
    }

    fn pipeline_instrumentation(
        &self,
        descriptor: &mut PipelineDescriptor,
        metadata: &mut SmallVec<[ShaderInstrumentationMetadata; 4]>,
        data: &mut PipelineInstrumentationData,
    ) {
        metadata.resize(
            descriptor.stages.len(),
            ShaderInstrumentationMetadata::default(),
        );
        let has_bindless_descriptors = descriptor.layout.has_bindless;

        for (stage, meta) in descriptor.stages.iter_mut().zip(metadata.iter_mut()) {
            if !self.stage_selected(stage) {
                continue;
            }
            let (unique_shader_id, instrumented, _cached) =
                match self.instrument_words(&stage.spirv, has_bindless_descriptors) {
                    Some(result) => result,
                    None => continue,
                };
            meta.unique_shader_id = unique_shader_id;
            meta.instrumented = true;

            self.substitute_stage(stage, meta, instrumented, data);
        }
    }

    ///Puts the instrumented words where the driver will read them: a fresh
    /// module for handle-based stages, in place for inlined ones.
    fn substitute_stage(
        &self,
        stage: &mut ShaderStageState,
        meta: &mut ShaderInstrumentationMetadata,
        instrumented: Vec<u32>,
        data: &mut PipelineInstrumentationData,
    ) {
        if stage.module != vk::ShaderModule::null() {
            match self.driver.create_shader_module(&instrumented) {
                Ok(module) => {
                    stage.module = module;
                    data.instrumented_shader_modules.push(module);
                }
                Err(_) => {
                    self.internal_error(
                        "Unable to replace non-instrumented shader with instrumented one.",
                    );
                }
            }
        } else if stage.inlined_create_info {
            meta.passed_in_shader_stage_ci = true;
            stage.spirv = instrumented;
        } else {
            debug_assert!(
                false,
                "stage carries neither a module handle nor an inlined create info"
            );
        }
    }

    ///Final-link instrumentation for graphics pipeline libraries: each
    /// referenced library is re-created with instrumented stages and the
    /// link info rewritten to the replacements. The `pStages` equivalent is
    /// spread across libraries, so the metadata index runs flat across them.
    fn pipeline_instrumentation_gpl(
        &self,
        tracker: &dyn PipelineStateTracker,
        descriptor: &mut PipelineDescriptor,
        metadata: &mut SmallVec<[ShaderInstrumentationMetadata; 4]>,
        data: &mut PipelineInstrumentationData,
    ) {
        let has_bindless_descriptors = descriptor.layout.has_bindless;

        for library in descriptor.libraries.iter_mut() {
            let lib_descriptor = match tracker.library_descriptor(*library) {
                Some(descriptor) => descriptor,
                None => continue,
            };
            if lib_descriptor.stages.is_empty() {
                continue;
            }

            let mut new_lib = lib_descriptor;
            let has_fragment = new_lib
                .stages
                .iter()
                .any(|stage| stage.stage.contains(vk::ShaderStageFlags::FRAGMENT));

            for stage in new_lib.stages.iter_mut() {
                metadata.push(ShaderInstrumentationMetadata::default());
                let meta = metadata.last_mut().expect("just pushed");

                if !self.stage_selected(stage) {
                    continue;
                }
                let (unique_shader_id, instrumented, _cached) =
                    match self.instrument_words(&stage.spirv, has_bindless_descriptors) {
                        Some(result) => result,
                        None => continue,
                    };
                meta.unique_shader_id = unique_shader_id;
                meta.instrumented = true;

                self.substitute_stage(stage, meta, instrumented, data);
            }

            match self.driver.create_graphics_pipeline(&new_lib) {
                Ok(new_lib_pipeline) => {
                    if has_fragment {
                        data.frag_out_lib = new_lib_pipeline;
                    } else {
                        data.pre_raster_lib = new_lib_pipeline;
                    }
                    *library = new_lib_pipeline;
                }
                Err(_) => {
                    self.internal_error(
                        "Unable to create instrumented library pipeline at link time.",
                    );
                }
            }
        }
    }

    ///Post-call half: copies observable creation feedback back to the
    /// caller's structures and, now that the handles exist, fills the
    /// registry for each instrumented stage.
    pub fn post_create_pipelines(
        &self,
        tracker: &dyn PipelineStateTracker,
        pipelines: &[vk::Pipeline],
        create_infos: &mut [PipelineDescriptor],
        chassis_state: &mut PipelineChassisState,
    ) {
        if !self.settings.is_spirv_modified() {
            return;
        }

        for (i, pipeline) in pipelines.iter().enumerate() {
            let modified = match chassis_state.modified_create_infos.get(i) {
                Some(modified) => modified,
                None => continue,
            };
            copy_creation_feedback(modified, &mut create_infos[i]);

            // Library fragments get their registry entries at link time.
            if create_infos[i].is_library() {
                continue;
            }

            let metadata = &chassis_state.shader_instrumentations_metadata[i];
            if metadata.is_empty() {
                continue;
            }
            let data = &mut chassis_state.instrumentation_data[i];

            if create_infos[i].linking_shaders {
                self.post_gpl_records(tracker, &create_infos[i], metadata, data);
            } else if insert_stage_records(
                &self.registry,
                *pipeline,
                &create_infos[i].stages,
                metadata,
            ) {
                data.was_instrumented = true;
            }
        }
    }

    ///Registry records for a linked pipeline: keyed by the original library
    /// handles, whose records still own the shader identities.
    fn post_gpl_records(
        &self,
        tracker: &dyn PipelineStateTracker,
        create_info: &PipelineDescriptor,
        metadata: &[ShaderInstrumentationMetadata],
        data: &mut PipelineInstrumentationData,
    ) {
        let mut shader_index = 0;
        for library in create_info.libraries.iter() {
            let lib_descriptor = match tracker.library_descriptor(*library) {
                Some(descriptor) => descriptor,
                None => continue,
            };
            if lib_descriptor.stages.is_empty() {
                continue;
            }

            let stage_count = lib_descriptor.stages.len();
            let start = shader_index.min(metadata.len());
            let end = (shader_index + stage_count).min(metadata.len());
            let lib_metadata = &metadata[start..end];
            shader_index += stage_count;

            if insert_stage_records(&self.registry, *library, &lib_descriptor.stages, lib_metadata)
            {
                data.was_instrumented = true;
            }
        }
    }

    ///Ray-tracing post path. A deferred driver result means the handles are
    /// not final yet: instead of populating the registry, a continuation is
    /// appended to the per-deferred-operation queue the state tracker
    /// seeded, and runs with the final handles at completion.
    #[allow(clippy::too_many_arguments)]
    pub fn post_create_ray_tracing_pipelines(
        &self,
        tracker: &dyn PipelineStateTracker,
        deferred_operation: vk::DeferredOperationKHR,
        result: vk::Result,
        pipelines: &[vk::Pipeline],
        create_infos: &mut [PipelineDescriptor],
        chassis_state: Arc<Mutex<PipelineChassisState>>,
        joins: &DeferredOperationJoins,
    ) {
        if !self.settings.is_spirv_modified() {
            return;
        }

        let is_operation_deferred =
            deferred_operation != vk::DeferredOperationKHR::null()
                && result == vk::Result::OPERATION_DEFERRED_KHR;

        if !is_operation_deferred {
            self.post_create_pipelines(
                tracker,
                pipelines,
                create_infos,
                &mut chassis_state.lock(),
            );
            return;
        }

        {
            let chassis = chassis_state.lock();
            for (i, create_info) in create_infos.iter_mut().enumerate() {
                if let Some(modified) = chassis.modified_create_infos.get(i) {
                    copy_creation_feedback(modified, create_info);
                }
            }
        }

        let mut callbacks = match joins.pop(deferred_operation) {
            Some(callbacks) => callbacks,
            None => {
                // The state tracker's post hook seeds this queue before ours
                // runs; an empty slot is a programming error upstream.
                debug_assert!(
                    false,
                    "deferred-operation post checks were not seeded by the state tracker"
                );
                return;
            }
        };

        let registry = self.registry.clone();
        let originals: Vec<PipelineDescriptor> = create_infos.to_vec();
        let held_chassis_state = chassis_state.clone();
        callbacks.push(Box::new(move |vk_pipelines: &[vk::Pipeline]| {
            let mut chassis = held_chassis_state.lock();
            for (i, pipeline) in vk_pipelines.iter().enumerate() {
                let original = match originals.get(i) {
                    Some(original) => original,
                    None => continue,
                };
                if original.is_library() {
                    continue;
                }
                let inserted = match chassis.shader_instrumentations_metadata.get(i) {
                    Some(metadata) => {
                        insert_stage_records(&registry, *pipeline, &original.stages, metadata)
                    }
                    None => continue,
                };
                if inserted {
                    if let Some(data) = chassis.instrumentation_data.get_mut(i) {
                        data.was_instrumented = true;
                    }
                }
            }
        }));
        joins.insert(deferred_operation, callbacks);
    }
}

///One registry record per instrumented stage. The original words are taken
/// from the caller-visible descriptor, which substitution never touched.
fn insert_stage_records(
    registry: &InstrumentedShaderRegistry,
    pipeline: vk::Pipeline,
    stages: &[ShaderStageState],
    metadata: &[ShaderInstrumentationMetadata],
) -> bool {
    let mut inserted = false;
    for (stage, meta) in stages.iter().zip(metadata.iter()) {
        if !meta.instrumented {
            continue;
        }
        let mut shader_module = stage.module;
        if shader_module == vk::ShaderModule::null() && meta.passed_in_shader_stage_ci {
            shader_module = inlined_stage_sentinel();
        }
        registry.insert_or_assign(
            meta.unique_shader_id,
            InstrumentedShader {
                pipeline,
                shader_module,
                shader_object: vk::ShaderEXT::null(),
                original_words: stage.spirv.clone(),
            },
        );
        inserted = true;
    }
    inserted
}

///Copies one feedback struct from the side copy back to the caller's
/// creation info, preserving the timings the application observes.
fn copy_creation_feedback(from: &PipelineDescriptor, to: &mut PipelineDescriptor) {
    if let (Some(source), Some(destination)) =
        (&from.creation_feedback, &mut to.creation_feedback)
    {
        *destination = source.clone();
    }
}

///The per-entry-point hook surface the chassis drives. Every hook defaults
/// to a no-op so a plain state tracker composes for free; the instrumentor
/// overrides the ones it cares about and the chassis calls base and
/// instrumentor in its own order.
pub trait CreationHooks {
    fn pre_create_pipeline_layout(&self, _descriptor: &mut PipelineLayoutDescriptor) {}
    fn post_create_pipeline_layout(&self, _result: vk::Result) {}

    fn post_create_shader_module(
        &self,
        _descriptor: &ShaderModuleDescriptor,
        _shader_module: vk::ShaderModule,
    ) {
    }

    fn pre_create_shaders(
        &self,
        _create_infos: &[ShaderObjectDescriptor],
        _chassis_state: &mut ShaderObjectChassisState,
    ) {
    }
    fn post_create_shaders(
        &self,
        _create_infos: &[ShaderObjectDescriptor],
        _shaders: &[vk::ShaderEXT],
        _chassis_state: &ShaderObjectChassisState,
    ) {
    }
    fn pre_destroy_shader_object(&self, _shader: vk::ShaderEXT) {}

    fn pre_create_pipelines(
        &self,
        _tracker: &dyn PipelineStateTracker,
        _create_infos: &[PipelineDescriptor],
        _chassis_state: &mut PipelineChassisState,
    ) {
    }
    fn post_create_pipelines(
        &self,
        _tracker: &dyn PipelineStateTracker,
        _pipelines: &[vk::Pipeline],
        _create_infos: &mut [PipelineDescriptor],
        _chassis_state: &mut PipelineChassisState,
    ) {
    }
    #[allow(clippy::too_many_arguments)]
    fn post_create_ray_tracing_pipelines(
        &self,
        _tracker: &dyn PipelineStateTracker,
        _deferred_operation: vk::DeferredOperationKHR,
        _result: vk::Result,
        _pipelines: &[vk::Pipeline],
        _create_infos: &mut [PipelineDescriptor],
        _chassis_state: Arc<Mutex<PipelineChassisState>>,
        _joins: &DeferredOperationJoins,
    ) {
    }
    fn pre_destroy_pipeline(
        &self,
        _pipeline: vk::Pipeline,
        _instrumentation_data: Option<&PipelineInstrumentationData>,
    ) {
    }

    fn pre_destroy_device(&self) {}
}

impl CreationHooks for ShaderInstrumentor {
    fn pre_create_pipeline_layout(&self, descriptor: &mut PipelineLayoutDescriptor) {
        ShaderInstrumentor::pre_create_pipeline_layout(self, descriptor);
    }

    fn post_create_pipeline_layout(&self, result: vk::Result) {
        ShaderInstrumentor::post_create_pipeline_layout(self, result);
    }

    fn post_create_shader_module(
        &self,
        descriptor: &ShaderModuleDescriptor,
        shader_module: vk::ShaderModule,
    ) {
        ShaderInstrumentor::post_create_shader_module(self, descriptor, shader_module);
    }

    fn pre_create_shaders(
        &self,
        create_infos: &[ShaderObjectDescriptor],
        chassis_state: &mut ShaderObjectChassisState,
    ) {
        ShaderInstrumentor::pre_create_shaders(self, create_infos, chassis_state);
    }

    fn post_create_shaders(
        &self,
        create_infos: &[ShaderObjectDescriptor],
        shaders: &[vk::ShaderEXT],
        chassis_state: &ShaderObjectChassisState,
    ) {
        ShaderInstrumentor::post_create_shaders(self, create_infos, shaders, chassis_state);
    }

    fn pre_destroy_shader_object(&self, shader: vk::ShaderEXT) {
        ShaderInstrumentor::pre_destroy_shader_object(self, shader);
    }

    fn pre_create_pipelines(
        &self,
        tracker: &dyn PipelineStateTracker,
        create_infos: &[PipelineDescriptor],
        chassis_state: &mut PipelineChassisState,
    ) {
        ShaderInstrumentor::pre_create_pipelines(self, tracker, create_infos, chassis_state);
    }

    fn post_create_pipelines(
        &self,
        tracker: &dyn PipelineStateTracker,
        pipelines: &[vk::Pipeline],
        create_infos: &mut [PipelineDescriptor],
        chassis_state: &mut PipelineChassisState,
    ) {
        ShaderInstrumentor::post_create_pipelines(self, tracker, pipelines, create_infos, chassis_state);
    }

    fn post_create_ray_tracing_pipelines(
        &self,
        tracker: &dyn PipelineStateTracker,
        deferred_operation: vk::DeferredOperationKHR,
        result: vk::Result,
        pipelines: &[vk::Pipeline],
        create_infos: &mut [PipelineDescriptor],
        chassis_state: Arc<Mutex<PipelineChassisState>>,
        joins: &DeferredOperationJoins,
    ) {
        ShaderInstrumentor::post_create_ray_tracing_pipelines(
            self,
            tracker,
            deferred_operation,
            result,
            pipelines,
            create_infos,
            chassis_state,
            joins,
        );
    }

    fn pre_destroy_pipeline(
        &self,
        pipeline: vk::Pipeline,
        instrumentation_data: Option<&PipelineInstrumentationData>,
    ) {
        ShaderInstrumentor::pre_destroy_pipeline(self, pipeline, instrumentation_data);
    }

    fn pre_destroy_device(&self) {
        ShaderInstrumentor::pre_destroy_device(self);
    }
}
