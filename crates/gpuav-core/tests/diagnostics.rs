//! Fault-record formatting, including source-line recovery from raw word
//! streams.

use ash::vk::{self, Handle};
use gpuav_core::diagnostic::{
    generate_debug_info_message, FaultContext, NoDebugAnnotation, STAGE_ID_MULTI_ENTRY_POINT,
};
use gpuav_core::registry::InstrumentedShader;

const OP_STRING: u32 = 7;
const OP_LINE: u32 = 8;
const OP_EXT_INST_IMPORT: u32 = 11;
const OP_EXT_INST: u32 = 12;
const OP_ENTRY_POINT: u32 = 15;
const OP_TYPE_INT: u32 = 21;
const OP_CONSTANT: u32 = 43;
const OP_FUNCTION: u32 = 54;
const OP_FUNCTION_END: u32 = 56;
const OP_NOP: u32 = 0;

///Encodes a nul-terminated literal string into words.
fn string_words(text: &str) -> Vec<u32> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn instruction(opcode: u32, operands: &[u32]) -> Vec<u32> {
    let mut words = vec![(((operands.len() + 1) as u32) << 16) | opcode];
    words.extend_from_slice(operands);
    words
}

fn record(words: Vec<u32>) -> InstrumentedShader {
    InstrumentedShader {
        pipeline: vk::Pipeline::from_raw(0xab),
        shader_module: vk::ShaderModule::from_raw(0xcd),
        shader_object: vk::ShaderEXT::null(),
        original_words: words,
    }
}

fn context(stage_id: u32, stage_info: [u32; 3], instruction_index: u32) -> FaultContext {
    FaultContext {
        command_buffer: vk::CommandBuffer::from_raw(0x11),
        stage_id,
        stage_info,
        instruction_index,
        shader_id: 9,
        bind_point: vk::PipelineBindPoint::GRAPHICS,
        operation_index: 2,
    }
}

#[test]
fn fragment_stage_line_round_trips_coordinates() {
    let words = instruction(OP_NOP, &[]);
    let shader = record(words.clone());
    let ctx = context(
        4, // Fragment
        [1.5f32.to_bits(), 2.25f32.to_bits(), 0],
        1,
    );
    let message =
        generate_debug_info_message(&ctx, &words, Some(&shader), &NoDebugAnnotation, false);
    assert!(
        message.contains("Fragment coord (x,y) = (1.5, 2.25)"),
        "unexpected message: {message}"
    );
    assert!(message.contains("Draw Index 2"));
    assert!(message.contains("0xab"));
    assert!(message.contains("0xcd"));
    assert!(message.contains("internal ID 9"));
}

#[test]
fn op_line_source_recovery_and_function_boundary_reset() {
    // 1: OpString "f"  2: OpLine f 42 7  3: OpNop  4: OpFunctionEnd  5: OpNop
    let mut words = Vec::new();
    let mut file = vec![1u32];
    file.extend(string_words("f"));
    words.extend(instruction(OP_STRING, &file));
    words.extend(instruction(OP_LINE, &[1, 42, 7]));
    words.extend(instruction(OP_NOP, &[]));
    words.extend(instruction(OP_FUNCTION_END, &[]));
    words.extend(instruction(OP_NOP, &[]));

    let shader = record(words.clone());

    // At instruction 3 the OpLine is in scope.
    let message = generate_debug_info_message(
        &context(4, [0; 3], 3),
        &words,
        Some(&shader),
        &NoDebugAnnotation,
        false,
    );
    assert!(message.contains("SPIR-V Instruction Index = 3"));
    assert!(
        message.contains("in file f at line 42, column 7"),
        "unexpected message: {message}"
    );

    // Two instructions later the OpFunctionEnd has reset the tracker.
    let message = generate_debug_info_message(
        &context(4, [0; 3], 5),
        &words,
        Some(&shader),
        &NoDebugAnnotation,
        false,
    );
    assert!(
        message.contains("Unable to source."),
        "unexpected message: {message}"
    );
}

#[test]
fn non_semantic_debug_line_resolves_through_constants() {
    // ids: 2 = import set, 3 = file string, 4 = int type, 5 = line const,
    // 6 = column const, 7 = DebugSource, 8 = DebugLine
    let mut words = Vec::new();
    let mut import = vec![2u32];
    import.extend(string_words("NonSemantic.Shader.DebugInfo.100"));
    words.extend(instruction(OP_EXT_INST_IMPORT, &import));
    let mut file = vec![3u32];
    file.extend(string_words("shader.hlsl"));
    words.extend(instruction(OP_STRING, &file));
    words.extend(instruction(OP_TYPE_INT, &[4, 32, 0]));
    words.extend(instruction(OP_CONSTANT, &[4, 5, 42]));
    words.extend(instruction(OP_CONSTANT, &[4, 6, 7]));
    // DebugSource %7 = (file %3)
    words.extend(instruction(OP_EXT_INST, &[0, 7, 2, 35, 3]));
    // DebugLine %8 = (source %7, line %5..%5, column %6..%6)
    words.extend(instruction(OP_EXT_INST, &[0, 8, 2, 103, 7, 5, 5, 6, 6]));
    words.extend(instruction(OP_NOP, &[]));

    let shader = record(words.clone());
    let message = generate_debug_info_message(
        &context(4, [0; 3], 8),
        &words,
        Some(&shader),
        &NoDebugAnnotation,
        true,
    );
    assert!(
        message.contains("in file shader.hlsl at line 42, column 7"),
        "unexpected message: {message}"
    );
    assert!(message.contains("Debug shader printf message generated"));
}

#[test]
fn multi_entry_point_lists_execution_models() {
    // OpEntryPoint Vertex, OpEntryPoint Fragment, OpFunction
    let mut words = Vec::new();
    let mut vertex = vec![0u32, 9];
    vertex.extend(string_words("main"));
    words.extend(instruction(OP_ENTRY_POINT, &vertex));
    let mut fragment = vec![4u32, 10];
    fragment.extend(string_words("main_fs"));
    words.extend(instruction(OP_ENTRY_POINT, &fragment));
    words.extend(instruction(OP_FUNCTION, &[1, 9, 0, 2]));

    let shader = record(words.clone());
    let message = generate_debug_info_message(
        &context(STAGE_ID_MULTI_ENTRY_POINT, [0; 3], 1),
        &words,
        Some(&shader),
        &NoDebugAnnotation,
        false,
    );
    assert!(
        message.contains("multiple OpEntryPoint (Vertex, Fragment)"),
        "unexpected message: {message}"
    );
}

#[test]
fn missing_record_reports_internal_error() {
    let message = generate_debug_info_message(
        &context(4, [0; 3], 1),
        &[],
        None,
        &NoDebugAnnotation,
        false,
    );
    assert!(message.contains("[Internal Error]"));
}

#[test]
fn labels_are_parenthesized_when_present() {
    struct Labels;
    impl gpuav_core::diagnostic::DebugAnnotation for Labels {
        fn object_label(&self, raw_handle: u64) -> Option<String> {
            (raw_handle == 0x11).then(|| "frame-cb".to_string())
        }
    }

    let words = instruction(OP_NOP, &[]);
    let shader = record(words.clone());
    let message =
        generate_debug_info_message(&context(4, [0; 3], 1), &words, Some(&shader), &Labels, false);
    assert!(
        message.contains("Command buffer (frame-cb)(0x11)"),
        "unexpected message: {message}"
    );
}
