//! End-to-end interception scenarios against the mock driver.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use common::{
    bindless_settings, compute_pipeline, compute_shader, instrumentation_bindings, MockDriver,
    NoLibraries,
};
use gpuav_core::chassis::{
    inlined_stage_sentinel, DeferredOperationJoins, PipelineChassisState, PipelineDescriptor,
    PipelineKind, PipelineLayoutDescriptor, PipelineLayoutState, PipelineStateTracker,
    ShaderObjectChassisState, ShaderObjectDescriptor, ShaderStageState,
};
use gpuav_core::{DeviceProfile, GpuavSettings, ShaderInstrumentor};
use parking_lot::Mutex;
use smallvec::SmallVec;

fn instrumentor(
    driver: Arc<MockDriver>,
    settings: GpuavSettings,
    profile: &DeviceProfile,
) -> ShaderInstrumentor {
    ShaderInstrumentor::new(driver, settings, profile, &instrumentation_bindings(), None)
}

#[test]
fn minimal_compute_pipeline() {
    let driver = MockDriver::new();
    let core = instrumentor(driver.clone(), bindless_settings(), &DeviceProfile::default());
    assert!(!core.is_aborted());
    // maxBoundDescriptorSets of 4 puts the reserved slot at 3
    assert_eq!(core.reserved_slot(), 3);

    // App layout with zero sets is padded out to reserved_slot + 1.
    let mut layout = PipelineLayoutDescriptor::default();
    core.pre_create_pipeline_layout(&mut layout);
    assert_eq!(layout.set_layouts.len(), 4);
    assert_eq!(
        layout.set_layouts[3].as_raw(),
        driver.instrumentation_layout()
    );
    for slot in &layout.set_layouts[0..3] {
        assert_eq!(slot.as_raw(), driver.dummy_layout());
    }

    let words = compute_shader(0);
    let create_infos = vec![compute_pipeline(0x77, words.clone())];
    let mut chassis = PipelineChassisState::default();
    core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);

    // The side copy got a replacement module carrying different words.
    let replacement = chassis.modified_create_infos[0].stages[0].module;
    assert_ne!(replacement.as_raw(), 0x77);
    let modules = driver.shader_modules.lock();
    assert_eq!(modules.len(), 1);
    assert_ne!(modules[0].1, words);
    drop(modules);

    // After the driver call, the registry names the pipeline.
    let pipeline = vk::Pipeline::from_raw(0xfeed);
    let mut originals = create_infos;
    core.post_create_pipelines(&NoLibraries, &[pipeline], &mut originals, &mut chassis);
    assert_eq!(core.registry().len(), 1);
    let records = core.registry().snapshot(|_| true);
    let (_, record) = &records[0];
    assert_eq!(record.pipeline, pipeline);
    assert_eq!(record.shader_module.as_raw(), 0x77);
    assert_eq!(record.original_words, words);
    assert!(chassis.instrumentation_data[0].was_instrumented);
}

#[test]
fn layout_overflow_skips_instrumentation() {
    let driver = MockDriver::new();
    let core = instrumentor(driver.clone(), bindless_settings(), &DeviceProfile::default());

    // App declares as many sets as the device allows; the reserved slot is
    // already taken.
    let mut layout = PipelineLayoutDescriptor::default();
    layout.set_layouts = (0..4u64).map(vk::DescriptorSetLayout::from_raw).collect();
    core.pre_create_pipeline_layout(&mut layout);
    assert_eq!(layout.set_layouts.len(), 4, "overflowing layout stays as-is");

    let words = compute_shader(0);
    let mut create_info = compute_pipeline(0x77, words.clone());
    create_info.layout.set_layout_count = 4;
    let create_infos = vec![create_info];
    let mut chassis = PipelineChassisState::default();
    core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);

    // Untouched copy, no replacement module, empty registry afterwards.
    assert_eq!(chassis.modified_create_infos[0].stages[0].module.as_raw(), 0x77);
    assert_eq!(chassis.modified_create_infos[0].stages[0].spirv, words);
    assert!(driver.shader_modules.lock().is_empty());

    let mut originals = create_infos;
    core.post_create_pipelines(
        &NoLibraries,
        &[vk::Pipeline::from_raw(0xfeed)],
        &mut originals,
        &mut chassis,
    );
    assert!(core.registry().is_empty());
}

#[test]
fn inlined_stage_is_replaced_in_place() {
    let driver = MockDriver::new();
    let core = instrumentor(driver.clone(), bindless_settings(), &DeviceProfile::default());

    let words = compute_shader(0);
    let mut create_info = compute_pipeline(0, words.clone());
    create_info.stages[0].module = vk::ShaderModule::null();
    create_info.stages[0].inlined_create_info = true;
    let create_infos = vec![create_info];

    let mut chassis = PipelineChassisState::default();
    core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);

    // No replacement module handle; the nested descriptor's code changed.
    assert!(driver.shader_modules.lock().is_empty());
    assert_ne!(chassis.modified_create_infos[0].stages[0].spirv, words);
    assert!(chassis.modified_create_infos[0].stages[0].module.is_null());

    let mut originals = create_infos;
    core.post_create_pipelines(
        &NoLibraries,
        &[vk::Pipeline::from_raw(0xfeed)],
        &mut originals,
        &mut chassis,
    );
    let records = core.registry().snapshot(|_| true);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.shader_module, inlined_stage_sentinel());
}

#[test]
fn cache_hit_reuses_instrumented_binary() {
    let driver = MockDriver::new();
    let core = instrumentor(driver.clone(), bindless_settings(), &DeviceProfile::default());

    let words = compute_shader(0);
    for round in 0..2u64 {
        let create_infos = vec![compute_pipeline(0x80 + round, words.clone())];
        let mut chassis = PipelineChassisState::default();
        core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);
        let mut originals = create_infos;
        core.post_create_pipelines(
            &NoLibraries,
            &[vk::Pipeline::from_raw(0xf000 + round)],
            &mut originals,
            &mut chassis,
        );
    }

    let modules = driver.shader_modules.lock();
    assert_eq!(modules.len(), 2);
    assert_eq!(modules[0].1, modules[1].1, "second call must serve the cached bytes");

    // Fingerprint-keyed: both creations share one registry id.
    assert_eq!(core.registry().len(), 1);
}

#[test]
fn pass_through_when_nothing_modifies_spirv() {
    let driver = MockDriver::new();
    let core = instrumentor(driver.clone(), GpuavSettings::default(), &DeviceProfile::default());

    let mut layout = PipelineLayoutDescriptor::default();
    core.pre_create_pipeline_layout(&mut layout);
    assert!(layout.set_layouts.is_empty(), "layout untouched when disabled");

    let create_infos = vec![compute_pipeline(0x77, compute_shader(0))];
    let mut chassis = PipelineChassisState::default();
    core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);
    assert!(chassis.modified_create_infos.is_empty());
    assert!(driver.shader_modules.lock().is_empty());

    let mut originals = create_infos;
    core.post_create_pipelines(
        &NoLibraries,
        &[vk::Pipeline::from_raw(0xfeed)],
        &mut originals,
        &mut chassis,
    );
    assert!(core.registry().is_empty());
}

#[test]
fn destroy_sweeps_registry_and_owned_modules() {
    let driver = MockDriver::new();
    let mut settings = bindless_settings();
    // distinct counter ids instead of fingerprints
    settings.cache_instrumented_shaders = false;
    let core = instrumentor(driver.clone(), settings, &DeviceProfile::default());

    let pipelines = [vk::Pipeline::from_raw(0xa), vk::Pipeline::from_raw(0xb)];
    let mut all_chassis = Vec::new();
    for (i, pipeline) in pipelines.iter().enumerate() {
        let create_infos = vec![compute_pipeline(0x70 + i as u64, compute_shader(i as u32))];
        let mut chassis = PipelineChassisState::default();
        core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);
        let mut originals = create_infos;
        core.post_create_pipelines(&NoLibraries, &[*pipeline], &mut originals, &mut chassis);
        all_chassis.push(chassis);
    }
    assert_eq!(core.registry().len(), 2);

    core.pre_destroy_pipeline(pipelines[0], Some(&all_chassis[0].instrumentation_data[0]));

    assert_eq!(core.registry().len(), 1);
    let survivors = core.registry().snapshot(|entry| entry.pipeline == pipelines[0]);
    assert!(survivors.is_empty());

    // The replacement module the core created for pipeline A was freed.
    let replacement = all_chassis[0].instrumentation_data[0].instrumented_shader_modules[0];
    assert!(driver
        .destroyed_shader_modules
        .lock()
        .contains(&replacement.as_raw()));
}

#[test]
fn selective_instrumentation_honors_the_selected_set() {
    let driver = MockDriver::new();
    let mut settings = bindless_settings();
    settings.select_instrumented_shaders = true;
    let core = instrumentor(driver.clone(), settings, &DeviceProfile::default());

    let words = compute_shader(0);

    // Unselected module: stage is skipped entirely.
    let create_infos = vec![compute_pipeline(0x77, words.clone())];
    let mut chassis = PipelineChassisState::default();
    core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);
    assert!(driver.shader_modules.lock().is_empty());

    // Flag the module through its creation descriptor, then retry.
    core.post_create_shader_module(
        &gpuav_core::chassis::ShaderModuleDescriptor {
            code: words.clone(),
            gpu_assisted_flagged: true,
        },
        vk::ShaderModule::from_raw(0x77),
    );
    let mut chassis = PipelineChassisState::default();
    core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);
    assert_eq!(driver.shader_modules.lock().len(), 1);
}

#[test]
fn deferred_ray_tracing_populates_registry_at_completion() {
    let driver = MockDriver::new();
    let core = instrumentor(driver.clone(), bindless_settings(), &DeviceProfile::default());

    let words = compute_shader(0);
    let mut create_info = compute_pipeline(0x90, words);
    create_info.kind = PipelineKind::RayTracing;
    create_info.stages[0].stage = vk::ShaderStageFlags::RAYGEN_KHR;
    let create_infos = vec![create_info];

    let mut chassis = PipelineChassisState::default();
    core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);

    let joins = DeferredOperationJoins::default();
    let operation = vk::DeferredOperationKHR::from_raw(0xdef);
    // the state tracker's own post hook seeds the queue first
    joins.seed(operation);

    let mut originals = create_infos;
    let chassis = Arc::new(Mutex::new(chassis));
    core.post_create_ray_tracing_pipelines(
        &NoLibraries,
        operation,
        vk::Result::OPERATION_DEFERRED_KHR,
        &[],
        &mut originals,
        chassis.clone(),
        &joins,
    );

    // Nothing lands until the deferred operation completes.
    assert!(core.registry().is_empty());

    let final_pipeline = vk::Pipeline::from_raw(0xf00d);
    joins.complete(operation, &[final_pipeline]);

    assert_eq!(core.registry().len(), 1);
    let records = core.registry().snapshot(|_| true);
    assert_eq!(records[0].1.pipeline, final_pipeline);
    assert!(chassis.lock().instrumentation_data[0].was_instrumented);
}

#[test]
fn shader_objects_are_adapted_and_registered() {
    let driver = MockDriver::new();
    let core = instrumentor(driver.clone(), bindless_settings(), &DeviceProfile::default());

    let words = compute_shader(0);
    let create_infos = vec![ShaderObjectDescriptor {
        stage: vk::ShaderStageFlags::COMPUTE,
        code: words.clone(),
        set_layouts: SmallVec::new(),
        gpu_assisted_flagged: false,
        has_bindless: false,
    }];

    let mut chassis = ShaderObjectChassisState::default();
    core.pre_create_shaders(&create_infos, &mut chassis);

    let modified = &chassis.modified_create_infos[0];
    assert_eq!(modified.set_layouts.len(), 4);
    assert_eq!(
        modified.set_layouts[3].as_raw(),
        driver.instrumentation_layout()
    );
    assert_ne!(modified.code, words);

    let shader = vk::ShaderEXT::from_raw(0x50);
    core.post_create_shaders(&create_infos, &[shader], &chassis);
    let records = core.registry().snapshot(|entry| entry.shader_object == shader);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.original_words, words);
    assert!(records[0].1.pipeline.is_null());

    core.pre_destroy_shader_object(shader);
    assert!(core.registry().is_empty());
}

#[test]
fn graphics_pipeline_library_link_reinstruments_libraries() {
    struct Libraries {
        vertex: PipelineDescriptor,
        fragment: PipelineDescriptor,
    }
    impl PipelineStateTracker for Libraries {
        fn library_descriptor(&self, pipeline: vk::Pipeline) -> Option<PipelineDescriptor> {
            match pipeline.as_raw() {
                0x111 => Some(self.vertex.clone()),
                0x222 => Some(self.fragment.clone()),
                _ => None,
            }
        }
    }

    fn library(stage: vk::ShaderStageFlags, module: u64, marker: u32) -> PipelineDescriptor {
        PipelineDescriptor {
            kind: PipelineKind::Graphics,
            flags: vk::PipelineCreateFlags::LIBRARY_KHR,
            stages: vec![ShaderStageState {
                stage,
                module: vk::ShaderModule::from_raw(module),
                spirv: compute_shader(marker),
                inlined_create_info: false,
                gpu_assisted_flagged: false,
            }],
            layout: PipelineLayoutState::default(),
            libraries: Default::default(),
            linking_shaders: false,
            creation_feedback: None,
        }
    }

    let driver = MockDriver::new();
    let core = instrumentor(driver.clone(), bindless_settings(), &DeviceProfile::default());
    let tracker = Libraries {
        vertex: library(vk::ShaderStageFlags::VERTEX, 0x71, 1),
        fragment: library(vk::ShaderStageFlags::FRAGMENT, 0x72, 2),
    };

    // The linking pipeline itself has no stages; they live in the libraries.
    let link = PipelineDescriptor {
        kind: PipelineKind::Graphics,
        flags: vk::PipelineCreateFlags::empty(),
        stages: Vec::new(),
        layout: PipelineLayoutState::default(),
        libraries: [vk::Pipeline::from_raw(0x111), vk::Pipeline::from_raw(0x222)]
            .into_iter()
            .collect(),
        linking_shaders: true,
        creation_feedback: None,
    };
    let create_infos = vec![link];

    let mut chassis = PipelineChassisState::default();
    core.pre_create_pipelines(&tracker, &create_infos, &mut chassis);

    // Both libraries were rebuilt with instrumented code and the link info
    // now references the replacements.
    assert_eq!(driver.graphics_pipelines.lock().len(), 2);
    let data = &chassis.instrumentation_data[0];
    assert!(!data.pre_raster_lib.is_null());
    assert!(!data.frag_out_lib.is_null());
    let rewritten = &chassis.modified_create_infos[0].libraries;
    assert_ne!(rewritten[0].as_raw(), 0x111);
    assert_ne!(rewritten[1].as_raw(), 0x222);

    let mut originals = create_infos;
    core.post_create_pipelines(
        &tracker,
        &[vk::Pipeline::from_raw(0xfeed)],
        &mut originals,
        &mut chassis,
    );

    // Registry entries stay keyed by the original library handles.
    assert_eq!(core.registry().len(), 2);
    assert_eq!(
        core.registry()
            .snapshot(|entry| entry.pipeline.as_raw() == 0x111)
            .len(),
        1
    );
    assert_eq!(
        core.registry()
            .snapshot(|entry| entry.pipeline.as_raw() == 0x222)
            .len(),
        1
    );
}

#[test]
fn unsupported_device_aborts_and_releases_dispatch() {
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();

    let driver = MockDriver::new();
    let profile = DeviceProfile {
        fragment_stores_and_atomics: false,
        ..DeviceProfile::default()
    };
    let core = ShaderInstrumentor::new(
        driver.clone(),
        bindless_settings(),
        &profile,
        &instrumentation_bindings(),
        Some(Box::new(move || flag.store(true, Ordering::Release))),
    );

    assert!(core.is_aborted());
    assert!(released.load(Ordering::Acquire));

    // Aborted core is inert: nothing is copied, nothing is created.
    let create_infos = vec![compute_pipeline(0x77, compute_shader(0))];
    let mut chassis = PipelineChassisState::default();
    core.pre_create_pipelines(&NoLibraries, &create_infos, &mut chassis);
    assert!(chassis.modified_create_infos.is_empty());
    assert!(driver.shader_modules.lock().is_empty());
}

#[test]
fn single_descriptor_set_device_aborts() {
    let driver = MockDriver::new();
    let profile = DeviceProfile {
        max_bound_descriptor_sets: 1,
        ..DeviceProfile::default()
    };
    let core = instrumentor(driver, bindless_settings(), &profile);
    assert!(core.is_aborted());
}

#[test]
fn host_stage_wait_is_flagged_as_deadlock_risk() {
    let driver = MockDriver::new();
    let core = instrumentor(driver, bindless_settings(), &DeviceProfile::default());
    assert!(!core.is_aborted());

    core.validate_cmd_wait_events(
        vk::CommandBuffer::from_raw(0x11),
        vk::PipelineStageFlags2::TRANSFER,
    );
    assert!(!core.is_aborted());

    core.validate_cmd_wait_events(
        vk::CommandBuffer::from_raw(0x11),
        vk::PipelineStageFlags2::HOST | vk::PipelineStageFlags2::TRANSFER,
    );
    assert!(core.is_aborted());
}

#[test]
fn fine_grained_locking_returns_no_guards() {
    let driver = MockDriver::new();
    let mut settings = bindless_settings();
    settings.fine_grained_locking = true;
    let core = instrumentor(driver, settings, &DeviceProfile::default());
    assert!(core.read_lock().is_none());
    assert!(core.write_lock().is_none());

    let driver = MockDriver::new();
    let core = instrumentor(driver, bindless_settings(), &DeviceProfile::default());
    assert!(core.read_lock().is_some());
}

#[test]
fn reserve_binding_slot_adjusts_reported_limits() {
    let mut settings = GpuavSettings::default();
    settings.gpu_validation_reserve_binding_slot = true;

    let mut max_sets = 8;
    ShaderInstrumentor::reserve_binding_slot(&settings, &mut max_sets);
    assert_eq!(max_sets, 7);

    // Never below one, and implicit-layer zeros are ignored.
    let mut max_sets = 1;
    ShaderInstrumentor::reserve_binding_slot(&settings, &mut max_sets);
    assert_eq!(max_sets, 1);
    let mut max_sets = 0;
    ShaderInstrumentor::reserve_binding_slot(&settings, &mut max_sets);
    assert_eq!(max_sets, 0);
}
