//! Shared fixtures: a mock driver that hands out fake handles and records
//! every call, plus builder-made test shaders.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use gpuav_core::chassis::{
    PipelineDescriptor, PipelineKind, PipelineLayoutState, PipelineStateTracker, ShaderStageState,
};
use gpuav_core::driver::{DescriptorBinding, DeviceDriver, DriverResult};
use gpuav_core::settings::GpuavSettings;
use parking_lot::Mutex;
use rspirv::binary::Assemble;
use rspirv::dr::{Builder, Operand};
use rspirv::spirv::{
    AddressingModel, Capability, Decoration, ExecutionMode, ExecutionModel, FunctionControl,
    MemoryModel, StorageClass,
};

#[derive(Default)]
pub struct MockDriver {
    next_handle: AtomicU64,
    pub set_layouts: Mutex<Vec<u64>>,
    pub pipeline_layouts: Mutex<Vec<u64>>,
    ///(handle, code) per created replacement module.
    pub shader_modules: Mutex<Vec<(u64, Vec<u32>)>>,
    pub destroyed_shader_modules: Mutex<Vec<u64>>,
    pub graphics_pipelines: Mutex<Vec<u64>>,
    pub destroyed_pipelines: Mutex<Vec<u64>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(MockDriver {
            next_handle: AtomicU64::new(0x1000),
            ..MockDriver::default()
        })
    }

    fn allocate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    ///Layout created first at device init.
    pub fn instrumentation_layout(&self) -> u64 {
        self.set_layouts.lock()[0]
    }

    ///Layout created second at device init.
    pub fn dummy_layout(&self) -> u64 {
        self.set_layouts.lock()[1]
    }
}

impl DeviceDriver for MockDriver {
    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> DriverResult<vk::DescriptorSetLayout> {
        let handle = self.allocate();
        self.set_layouts.lock().push(handle);
        Ok(vk::DescriptorSetLayout::from_raw(handle))
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {}

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
    ) -> DriverResult<vk::PipelineLayout> {
        let handle = self.allocate();
        self.pipeline_layouts.lock().push(handle);
        Ok(vk::PipelineLayout::from_raw(handle))
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {}

    fn create_shader_module(&self, code: &[u32]) -> DriverResult<vk::ShaderModule> {
        let handle = self.allocate();
        self.shader_modules.lock().push((handle, code.to_vec()));
        Ok(vk::ShaderModule::from_raw(handle))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.destroyed_shader_modules.lock().push(module.as_raw());
    }

    fn create_graphics_pipeline(
        &self,
        _descriptor: &PipelineDescriptor,
    ) -> DriverResult<vk::Pipeline> {
        let handle = self.allocate();
        self.graphics_pipelines.lock().push(handle);
        Ok(vk::Pipeline::from_raw(handle))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.destroyed_pipelines.lock().push(pipeline.as_raw());
    }
}

///Tracker with no library pipelines.
pub struct NoLibraries;

impl PipelineStateTracker for NoLibraries {
    fn library_descriptor(&self, _pipeline: vk::Pipeline) -> Option<PipelineDescriptor> {
        None
    }
}

///Settings with the bindless checks enabled, everything else default.
pub fn bindless_settings() -> GpuavSettings {
    let mut settings = GpuavSettings::default();
    settings.shader_instrumentation.bindless_descriptor = true;
    settings
}

pub fn instrumentation_bindings() -> Vec<DescriptorBinding> {
    vec![DescriptorBinding {
        binding: 0,
        descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::ALL,
    }]
}

///Compute shader with one storage-buffer access; `marker` varies a constant
/// so different callers get different fingerprints.
pub fn compute_shader(marker: u32) -> Vec<u32> {
    let mut b = Builder::new();
    b.set_version(1, 5);
    b.capability(Capability::Shader);
    b.memory_model(AddressingModel::Logical, MemoryModel::GLSL450);

    let void = b.type_void();
    let u32_ty = b.type_int(32, 0);
    let block = b.type_struct([u32_ty]);
    b.decorate(block, Decoration::Block, []);
    b.member_decorate(block, 0, Decoration::Offset, [Operand::LiteralInt32(0)]);
    let ptr_block = b.type_pointer(None, StorageClass::StorageBuffer, block);
    let ptr_u32 = b.type_pointer(None, StorageClass::StorageBuffer, u32_ty);
    let buffer = b.variable(ptr_block, None, StorageClass::StorageBuffer, None);
    b.decorate(buffer, Decoration::DescriptorSet, [Operand::LiteralInt32(0)]);
    b.decorate(buffer, Decoration::Binding, [Operand::LiteralInt32(0)]);

    let index = b.constant_u32(u32_ty, marker);
    let fn_ty = b.type_function(void, []);
    let main = b
        .begin_function(void, None, FunctionControl::NONE, fn_ty)
        .unwrap();
    b.begin_block(None).unwrap();
    let chain = b.access_chain(ptr_u32, None, buffer, [index]).unwrap();
    let _value = b.load(u32_ty, None, chain, None, []).unwrap();
    b.ret().unwrap();
    b.end_function().unwrap();
    b.entry_point(ExecutionModel::GLCompute, main, "main".to_string(), [buffer]);
    b.execution_mode(main, ExecutionMode::LocalSize, [1, 1, 1]);

    b.module().assemble()
}

///A compute pipeline descriptor around one module-handle stage.
pub fn compute_pipeline(module_handle: u64, spirv: Vec<u32>) -> PipelineDescriptor {
    PipelineDescriptor {
        kind: PipelineKind::Compute,
        flags: vk::PipelineCreateFlags::empty(),
        stages: vec![ShaderStageState {
            stage: vk::ShaderStageFlags::COMPUTE,
            module: vk::ShaderModule::from_raw(module_handle),
            spirv,
            inlined_create_info: false,
            gpu_assisted_flagged: false,
        }],
        layout: PipelineLayoutState::default(),
        libraries: Default::default(),
        linking_shaders: false,
        creation_feedback: None,
    }
}
