//! Post-mortem diagnostics: turns a GPU-side fault record into a
//! human-readable, source-linked message.
//!
//! Two kinds of debug info are recognized when recovering the source line:
//! 1. classic `OpLine`/`OpSource` directives;
//! 2. `NonSemantic.Shader.DebugInfo.100` extended instructions (`DebugLine`).

pub mod instruction;

use ahash::AHashMap;
use ash::vk::{self, Handle};
use spv_instrument::rspirv::spirv::{ExecutionModel, Op};

use crate::chassis::inlined_stage_sentinel;
use crate::registry::InstrumentedShader;
use instruction::{instructions, RawInstruction};

///Stage id recorded when the shader had several entry points and the
/// instrumentation could not tell which one ran.
pub const STAGE_ID_MULTI_ENTRY_POINT: u32 = 0x7fff_ffff;

const DEBUG_INFO_EXT_NAME: &str = "NonSemantic.Shader.DebugInfo.100";
///`DebugLine` opcode within NonSemantic.Shader.DebugInfo.100.
const NONSEMANTIC_DEBUG_LINE: u32 = 103;
///`DebugSource` opcode within NonSemantic.Shader.DebugInfo.100.
const NONSEMANTIC_DEBUG_SOURCE: u32 = 35;

// Execution models rspirv spells with vendor suffixes; matched by value so
// KHR/NV aliases collapse.
const EXEC_RAY_GENERATION: u32 = 5313;
const EXEC_INTERSECTION: u32 = 5314;
const EXEC_ANY_HIT: u32 = 5315;
const EXEC_CLOSEST_HIT: u32 = 5316;
const EXEC_MISS: u32 = 5317;
const EXEC_CALLABLE: u32 = 5318;
const EXEC_TASK_NV: u32 = 5267;
const EXEC_MESH_NV: u32 = 5268;
const EXEC_TASK_EXT: u32 = 5364;
const EXEC_MESH_EXT: u32 = 5365;

///Debug-utils label lookup; implemented by the chassis' debug-report state.
pub trait DebugAnnotation {
    fn object_label(&self, raw_handle: u64) -> Option<String>;
}

///No labels available (headless tests, early device teardown).
pub struct NoDebugAnnotation;

impl DebugAnnotation for NoDebugAnnotation {
    fn object_label(&self, _raw_handle: u64) -> Option<String> {
        None
    }
}

///Everything a fault record carries about where the shader blew up.
#[derive(Debug, Clone)]
pub struct FaultContext {
    pub command_buffer: vk::CommandBuffer,
    ///Execution-model id written by the instrumentation, or
    /// [`STAGE_ID_MULTI_ENTRY_POINT`].
    pub stage_id: u32,
    ///Stage-specific payload (invocation ids, fragment coords, ...).
    pub stage_info: [u32; 3],
    ///1-based index into the shader's instruction stream.
    pub instruction_index: u32,
    pub shader_id: u32,
    pub bind_point: vk::PipelineBindPoint,
    ///Index of the draw/dispatch/trace within the command buffer.
    pub operation_index: u32,
}

///Builds the full diagnostic message in its fixed order: stage context,
/// command buffer, operation, owner handles, source location.
pub fn generate_debug_info_message(
    context: &FaultContext,
    original_words: &[u32],
    instrumented_shader: Option<&InstrumentedShader>,
    labels: &dyn DebugAnnotation,
    debug_printf_only: bool,
) -> String {
    let mut message = String::new();

    let shader = match instrumented_shader {
        Some(shader) if !original_words.is_empty() => shader,
        _ => {
            message.push_str("[Internal Error] - Can't get instructions from shader map\n");
            return message;
        }
    };

    stage_message(&mut message, context, original_words);

    let command_buffer = context.command_buffer.as_raw();
    if shader.shader_module == vk::ShaderModule::null()
        && shader.shader_object == vk::ShaderEXT::null()
    {
        message.push_str(&format!(
            "[Internal Error] - Unable to locate shader/pipeline handles used in command buffer \
             {}({:#x})\n",
            label_of(labels, command_buffer),
            command_buffer
        ));
        debug_assert!(false, "registry record carries no owner handle");
    } else {
        message.push_str(&format!(
            "Command buffer {}({:#x})\n",
            label_of(labels, command_buffer),
            command_buffer
        ));

        let operation = match context.bind_point {
            vk::PipelineBindPoint::GRAPHICS => "Draw",
            vk::PipelineBindPoint::COMPUTE => "Compute Dispatch",
            vk::PipelineBindPoint::RAY_TRACING_KHR => "Ray Trace",
            _ => {
                debug_assert!(false, "unexpected pipeline bind point");
                "Unknown Pipeline Operation"
            }
        };
        // The tab shows the index is expressed with respect to the command
        // buffer.
        message.push_str(&format!("\t{} Index {}\n", operation, context.operation_index));

        if shader.shader_module == vk::ShaderModule::null() {
            message.push_str(&format!(
                "Shader Object {}({:#x}) (internal ID {})\n",
                label_of(labels, shader.shader_object.as_raw()),
                shader.shader_object.as_raw(),
                context.shader_id
            ));
        } else {
            message.push_str(&format!(
                "Pipeline {}({:#x})",
                label_of(labels, shader.pipeline.as_raw()),
                shader.pipeline.as_raw()
            ));
            if shader.shader_module == inlined_stage_sentinel() {
                message.push_str(&format!(
                    " (internal ID {})\nShader Module was passed in via \
                     VkPipelineShaderStageCreateInfo::pNext\n",
                    context.shader_id
                ));
            } else {
                message.push_str(&format!(
                    "\nShader Module {}({:#x}) (internal ID {})\n",
                    label_of(labels, shader.shader_module.as_raw()),
                    shader.shader_module.as_raw(),
                    context.shader_id
                ));
            }
        }
    }

    find_shader_source(
        &mut message,
        original_words,
        context.instruction_index,
        debug_printf_only,
    );

    message
}

fn label_of(labels: &dyn DebugAnnotation, raw_handle: u64) -> String {
    labels
        .object_label(raw_handle)
        .map(|label| format!("({label})"))
        .unwrap_or_default()
}

///The stage-specific first line, keyed off the execution-model id the
/// instrumentation wrote into the fault record.
fn stage_message(message: &mut String, context: &FaultContext, words: &[u32]) {
    let [info_0, info_1, info_2] = context.stage_info;
    let line = match context.stage_id {
        STAGE_ID_MULTI_ENTRY_POINT => {
            let mut models = Vec::new();
            for inst in instructions(words) {
                // entry points always precede the first function
                if inst.opcode() == Op::Function as u32 {
                    break;
                }
                if inst.opcode() == Op::EntryPoint as u32 {
                    models.push(execution_model_name(inst.word(1)));
                }
            }
            format!(
                "Stage has multiple OpEntryPoint ({}) and could not detect stage. ",
                models.join(", ")
            )
        }
        id if id == ExecutionModel::Vertex as u32 => format!(
            "Stage = Vertex. Vertex Index = {info_0} Instance Index = {info_1}. "
        ),
        id if id == ExecutionModel::TessellationControl as u32 => format!(
            "Stage = Tessellation Control.  Invocation ID = {info_0}, Primitive ID = {info_1}"
        ),
        id if id == ExecutionModel::TessellationEvaluation as u32 => format!(
            "Stage = Tessellation Eval.  Primitive ID = {info_0}, TessCoord (u, v) = \
             ({info_1}, {info_2}). "
        ),
        id if id == ExecutionModel::Geometry as u32 => format!(
            "Stage = Geometry.  Primitive ID = {info_0} Invocation ID = {info_1}. "
        ),
        id if id == ExecutionModel::Fragment as u32 => {
            // The two info words are float bit patterns.
            let x_coord = f32::from_bits(info_0);
            let y_coord = f32::from_bits(info_1);
            format!("Stage = Fragment.  Fragment coord (x,y) = ({x_coord}, {y_coord}). ")
        }
        id if id == ExecutionModel::GLCompute as u32 => format!(
            "Stage = Compute.  Global invocation ID (x, y, z) = ({info_0}, {info_1}, {info_2})"
        ),
        EXEC_RAY_GENERATION => format!(
            "Stage = Ray Generation.  Global Launch ID (x,y,z) = ({info_0}, {info_1}, {info_2}). "
        ),
        EXEC_INTERSECTION => format!(
            "Stage = Intersection.  Global Launch ID (x,y,z) = ({info_0}, {info_1}, {info_2}). "
        ),
        EXEC_ANY_HIT => format!(
            "Stage = Any Hit.  Global Launch ID (x,y,z) = ({info_0}, {info_1}, {info_2}). "
        ),
        EXEC_CLOSEST_HIT => format!(
            "Stage = Closest Hit.  Global Launch ID (x,y,z) = ({info_0}, {info_1}, {info_2}). "
        ),
        EXEC_MISS => format!(
            "Stage = Miss.  Global Launch ID (x,y,z) = ({info_0}, {info_1}, {info_2}). "
        ),
        EXEC_CALLABLE => format!(
            "Stage = Callable.  Global Launch ID (x,y,z) = ({info_0}, {info_1}, {info_2}). "
        ),
        EXEC_TASK_EXT => format!(
            "Stage = TaskEXT. Global invocation ID (x, y, z) = ({info_0}, {info_1}, {info_2} )"
        ),
        EXEC_MESH_EXT => format!(
            "Stage = MeshEXT. Global invocation ID (x, y, z) = ({info_0}, {info_1}, {info_2} )"
        ),
        EXEC_TASK_NV => format!(
            "Stage = TaskNV. Global invocation ID (x, y, z) = ({info_0}, {info_1}, {info_2} )"
        ),
        EXEC_MESH_NV => format!(
            "Stage = MeshNV. Global invocation ID (x, y, z) = ({info_0}, {info_1}, {info_2} )"
        ),
        unknown => {
            debug_assert!(false, "unexpected stage id {unknown}");
            format!("Internal Error (unexpected stage = {unknown}). ")
        }
    };
    message.push_str(&line);
    message.push('\n');
}

fn execution_model_name(model: u32) -> &'static str {
    match model {
        id if id == ExecutionModel::Vertex as u32 => "Vertex",
        id if id == ExecutionModel::TessellationControl as u32 => "TessellationControl",
        id if id == ExecutionModel::TessellationEvaluation as u32 => "TessellationEvaluation",
        id if id == ExecutionModel::Geometry as u32 => "Geometry",
        id if id == ExecutionModel::Fragment as u32 => "Fragment",
        id if id == ExecutionModel::GLCompute as u32 => "GLCompute",
        id if id == ExecutionModel::Kernel as u32 => "Kernel",
        EXEC_RAY_GENERATION => "RayGeneration",
        EXEC_INTERSECTION => "Intersection",
        EXEC_ANY_HIT => "AnyHit",
        EXEC_CLOSEST_HIT => "ClosestHit",
        EXEC_MISS => "Miss",
        EXEC_CALLABLE => "Callable",
        EXEC_TASK_NV => "TaskNV",
        EXEC_MESH_NV => "MeshNV",
        EXEC_TASK_EXT => "TaskEXT",
        EXEC_MESH_EXT => "MeshEXT",
        _ => "Unknown",
    }
}

///The most recent line directive in scope at `instruction_position`.
enum TrackedLine {
    ///`OpLine file line column`, all literal except the file string id.
    OpLine { file_id: u32, line: u32, column: u32 },
    ///`DebugLine source line_start .. column_start ..`, all ids.
    DebugLine {
        source_id: u32,
        line_id: u32,
        column_id: u32,
    },
}

///Walks the stream forward tracking the last line directive; the tracker
/// resets at `OpFunctionEnd` because debug-line scope never crosses function
/// boundaries.
fn find_shader_source(
    message: &mut String,
    words: &[u32],
    instruction_position: u32,
    debug_printf_only: bool,
) {
    message.push_str(&format!(
        "SPIR-V Instruction Index = {instruction_position}\n"
    ));

    let mut strings: AHashMap<u32, String> = AHashMap::default();
    let mut constants: AHashMap<u32, u32> = AHashMap::default();
    // DebugSource result id -> file string id
    let mut sources: AHashMap<u32, u32> = AHashMap::default();
    let mut debug_info_set_id = 0u32;
    let mut last_line: Option<TrackedLine> = None;

    let mut index = 1u32;
    for inst in instructions(words) {
        track_line_state(
            &inst,
            &mut strings,
            &mut constants,
            &mut sources,
            &mut debug_info_set_id,
            &mut last_line,
        );
        if index == instruction_position {
            break;
        }
        index += 1;
    }

    match last_line {
        Some(tracked) => {
            let (file, line, column) = match tracked {
                TrackedLine::OpLine {
                    file_id,
                    line,
                    column,
                } => (
                    strings.get(&file_id).cloned().unwrap_or_default(),
                    line,
                    column,
                ),
                TrackedLine::DebugLine {
                    source_id,
                    line_id,
                    column_id,
                } => {
                    let file = sources
                        .get(&source_id)
                        .and_then(|file_id| strings.get(file_id))
                        .cloned()
                        .unwrap_or_default();
                    let line = constants.get(&line_id).copied().unwrap_or(0);
                    let column = constants.get(&column_id).copied().unwrap_or(0);
                    (file, line, column)
                }
            };
            let prefix = if debug_printf_only {
                "Debug shader printf message generated "
            } else {
                "Shader validation error occurred "
            };
            message.push_str(&format!(
                "{prefix}in file {file} at line {line}, column {column}\n"
            ));
        }
        None => {
            message.push_str(
                "Unable to source. Build shader with debug info to get source information.\n",
            );
        }
    }
}

fn track_line_state(
    inst: &RawInstruction<'_>,
    strings: &mut AHashMap<u32, String>,
    constants: &mut AHashMap<u32, u32>,
    sources: &mut AHashMap<u32, u32>,
    debug_info_set_id: &mut u32,
    last_line: &mut Option<TrackedLine>,
) {
    match inst.opcode() {
        op if op == Op::String as u32 => {
            strings.insert(inst.word(1), inst.string_at(2));
        }
        op if op == Op::Constant as u32 => {
            // 32-bit literals only; line/column constants always are.
            if inst.len() == 4 {
                constants.insert(inst.word(2), inst.word(3));
            }
        }
        op if op == Op::ExtInstImport as u32 => {
            if inst.string_at(2) == DEBUG_INFO_EXT_NAME {
                *debug_info_set_id = inst.word(1);
            }
        }
        op if op == Op::ExtInst as u32 => {
            if *debug_info_set_id != 0 && inst.word(3) == *debug_info_set_id {
                match inst.word(4) {
                    NONSEMANTIC_DEBUG_SOURCE => {
                        sources.insert(inst.word(2), inst.word_or(5, 0));
                    }
                    NONSEMANTIC_DEBUG_LINE => {
                        *last_line = Some(TrackedLine::DebugLine {
                            source_id: inst.word_or(5, 0),
                            line_id: inst.word_or(6, 0),
                            column_id: inst.word_or(8, 0),
                        });
                    }
                    _ => {}
                }
            }
        }
        op if op == Op::Line as u32 => {
            *last_line = Some(TrackedLine::OpLine {
                file_id: inst.word(1),
                line: inst.word(2),
                column: inst.word(3),
            });
        }
        op if op == Op::FunctionEnd as u32 => {
            // debug lines can't cross function boundaries
            *last_line = None;
        }
        _ => {}
    }
}
