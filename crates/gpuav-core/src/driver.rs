//! The dispatch calls the core makes downward. A trait seam so the core can
//! be driven against a mock in tests and against the chassis' dispatch table
//! in the layer.

use ash::vk;

use crate::chassis::PipelineDescriptor;

pub type DriverResult<T> = Result<T, vk::Result>;

///One binding of the instrumentation descriptor set.
///
/// Kept apart from `vk::DescriptorSetLayoutBinding` so the core's state stays
/// `Send` (the raw struct carries an immutable-sampler pointer).
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

pub trait DeviceDriver: Send + Sync {
    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> DriverResult<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> DriverResult<vk::PipelineLayout>;

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_shader_module(&self, code: &[u32]) -> DriverResult<vk::ShaderModule>;

    fn destroy_shader_module(&self, module: vk::ShaderModule);

    ///Creates the replacement library pipeline during a graphics-pipeline-
    /// library link.
    fn create_graphics_pipeline(
        &self,
        descriptor: &PipelineDescriptor,
    ) -> DriverResult<vk::Pipeline>;

    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}
