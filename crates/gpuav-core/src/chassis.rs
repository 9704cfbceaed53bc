//! Side-copy creation descriptors and per-call interception state.
//!
//! The chassis deep-copies every creation info it intercepts into these
//! owned structures; the core mutates only the copies and the caller-visible
//! structures stay untouched. Pipeline variants (graphics, compute, ray
//! tracing) collapse into one tagged descriptor with a common stage array,
//! so the rewriting path is variant-agnostic.

use ahash::AHashMap;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use smallvec::SmallVec;

///`shader_module` value recorded when the stage inlined its module through
/// the stage-create-info's nested chain instead of passing a handle.
pub fn inlined_stage_sentinel() -> vk::ShaderModule {
    vk::ShaderModule::from_raw(0xEEEE_EEEE_EEEE_EEEE)
}

///One shader stage of a pipeline creation call, flattened from either a
/// module handle or a nested shader-module create info.
#[derive(Debug, Clone)]
pub struct ShaderStageState {
    pub stage: vk::ShaderStageFlags,
    ///Null when the stage inlined its SPIR-V.
    pub module: vk::ShaderModule,
    ///The words as submitted. Substitution rewrites this copy in place for
    /// inlined stages.
    pub spirv: Vec<u32>,
    ///Stage carries a nested shader-module create info.
    pub inlined_create_info: bool,
    ///The nested chain opted into GPU-assisted validation.
    pub gpu_assisted_flagged: bool,
}

///What the core needs to know about the pipeline layout at creation time.
#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutState {
    pub handle: vk::PipelineLayout,
    pub set_layout_count: u32,
    ///Descriptor set indices the stages actually consume.
    pub active_slots: SmallVec<[u32; 8]>,
    ///Any binding is partially-bound or update-after-bind.
    pub has_bindless: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Graphics,
    Compute,
    RayTracing,
}

///Timings observably returned to the application; copied back from the side
/// copy after the driver call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineCreationFeedback {
    pub flags: u32,
    pub duration_ns: u64,
    pub stage_durations_ns: SmallVec<[u64; 4]>,
}

///Deep-copied pipeline creation info, one per create-info slot.
#[derive(Debug, Clone)]
pub struct PipelineDescriptor {
    pub kind: PipelineKind,
    pub flags: vk::PipelineCreateFlags,
    pub stages: Vec<ShaderStageState>,
    pub layout: PipelineLayoutState,
    ///Graphics-pipeline-library link info: referenced library pipelines.
    pub libraries: SmallVec<[vk::Pipeline; 2]>,
    ///This create links libraries that carry the stages.
    pub linking_shaders: bool,
    pub creation_feedback: Option<PipelineCreationFeedback>,
}

impl PipelineDescriptor {
    ///Library fragments defer instrumentation to final link time.
    pub fn is_library(&self) -> bool {
        self.flags.contains(vk::PipelineCreateFlags::LIBRARY_KHR)
    }
}

///Shader-object (VK_EXT_shader_object) creation info copy.
#[derive(Debug, Clone)]
pub struct ShaderObjectDescriptor {
    pub stage: vk::ShaderStageFlags,
    pub code: Vec<u32>,
    pub set_layouts: SmallVec<[vk::DescriptorSetLayout; 8]>,
    pub gpu_assisted_flagged: bool,
    pub has_bindless: bool,
}

///Shader-module creation info copy.
#[derive(Debug, Clone)]
pub struct ShaderModuleDescriptor {
    pub code: Vec<u32>,
    pub gpu_assisted_flagged: bool,
}

///Pipeline-layout creation info copy.
#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutDescriptor {
    pub set_layouts: SmallVec<[vk::DescriptorSetLayout; 8]>,
}

///Per-stage record of what the rewriter did, carried from the pre- to the
/// post-call half of one creation call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShaderInstrumentationMetadata {
    pub unique_shader_id: u32,
    pub instrumented: bool,
    ///The instrumented words were written into the nested create info
    /// instead of a replacement module.
    pub passed_in_shader_stage_ci: bool,
}

///Objects the core created for one pipeline; owned by the pipeline record
/// and destroyed with it.
#[derive(Debug, Clone, Default)]
pub struct PipelineInstrumentationData {
    pub was_instrumented: bool,
    pub instrumented_shader_modules: SmallVec<[vk::ShaderModule; 4]>,
    ///Replacement libraries created at graphics-pipeline-library link time.
    pub pre_raster_lib: vk::Pipeline,
    pub frag_out_lib: vk::Pipeline,
}

///Interception state of one pipeline creation call.
#[derive(Debug, Clone, Default)]
pub struct PipelineChassisState {
    ///Deep copies handed to the driver. Empty when no rewriting occurs, in
    /// which case the chassis forwards the caller's structures verbatim.
    pub modified_create_infos: Vec<PipelineDescriptor>,
    ///Flat per-stage metadata, one vector per create-info slot.
    pub shader_instrumentations_metadata: Vec<SmallVec<[ShaderInstrumentationMetadata; 4]>>,
    pub instrumentation_data: Vec<PipelineInstrumentationData>,
}

///Interception state of one `vkCreateShadersEXT` call.
#[derive(Debug, Clone, Default)]
pub struct ShaderObjectChassisState {
    pub modified_create_infos: Vec<ShaderObjectDescriptor>,
    pub instrumentations_data: Vec<ShaderInstrumentationMetadata>,
}

///Read access to the state tracker's pipeline records, needed when a
/// graphics-pipeline-library link has to walk its referenced libraries.
pub trait PipelineStateTracker: Send + Sync {
    fn library_descriptor(&self, pipeline: vk::Pipeline) -> Option<PipelineDescriptor>;
}

///Continuation invoked with the final pipeline handles once a deferred
/// operation completes.
pub type DeferredPipelineCallback = Box<dyn FnOnce(&[vk::Pipeline]) + Send>;

///Per-deferred-operation post-check queues. Owned by the state tracker; the
/// interceptor only appends to a queue the tracker already seeded.
#[derive(Default)]
pub struct DeferredOperationJoins {
    joins: Mutex<AHashMap<u64, Vec<DeferredPipelineCallback>>>,
}

impl DeferredOperationJoins {
    ///Seeds the queue for `operation`. The state tracker calls this before
    /// the instrumentor's post hook can run.
    pub fn seed(&self, operation: vk::DeferredOperationKHR) {
        self.joins
            .lock()
            .entry(operation.as_raw())
            .or_insert_with(Vec::new);
    }

    ///Takes the queue for `operation`, or nothing if it was never seeded.
    pub fn pop(&self, operation: vk::DeferredOperationKHR) -> Option<Vec<DeferredPipelineCallback>> {
        self.joins.lock().remove(&operation.as_raw())
    }

    pub fn insert(
        &self,
        operation: vk::DeferredOperationKHR,
        callbacks: Vec<DeferredPipelineCallback>,
    ) {
        self.joins.lock().insert(operation.as_raw(), callbacks);
    }

    ///Runs and drops every callback queued for `operation`. Called by the
    /// chassis when the driver signals completion.
    pub fn complete(&self, operation: vk::DeferredOperationKHR, pipelines: &[vk::Pipeline]) {
        let callbacks = self.pop(operation).unwrap_or_default();
        for callback in callbacks {
            callback(pipelines);
        }
    }
}
