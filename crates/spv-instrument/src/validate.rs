//! `spirv-val` based re-validation of instrumented modules.

use std::io::Write;
use std::process::{Command, Stdio};

///Layout options keyed to the device's enabled extensions.
#[derive(Debug, Clone, Default)]
pub struct ValidatorOptions {
    ///VK_KHR_relaxed_block_layout is enabled on the device.
    pub relax_block_layout: bool,
    ///VK_EXT_scalar_block_layout is enabled on the device.
    pub scalar_block_layout: bool,
}

///Tries to run the validator over the word stream. Returns `Ok` if validated
/// successfully or `Err` containing `spirv-val`'s error if not.
pub fn validate_words(words: &[u32], options: &ValidatorOptions) -> Result<(), String> {
    let mut command = Command::new("spirv-val");
    if options.relax_block_layout {
        command.arg("--relax-block-layout");
    }
    if options.scalar_block_layout {
        command.arg("--scalar-block-layout");
    }

    let mut child = match command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            log::error!("Failed to spawn spirv-val: {}", e);
            return Err(String::from(
                "Failed to find spirv-val, is it installed and in $PATH?",
            ));
        }
    };

    let code: Vec<u8> = bytemuck::cast_slice(words).to_vec();

    let mut stdin = child.stdin.take().expect("Failed to open stdin");
    std::thread::spawn(move || {
        // A closed pipe just means the validator bailed early; its exit
        // status carries the actual verdict.
        let _ = stdin.write_all(&code);
    });

    match child.wait_with_output() {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(String::from_utf8_lossy(&output.stderr).to_string()),
        Err(e) => {
            log::error!("Failed to run spirv-val: {}", e);
            Err(format!("{}", e))
        }
    }
}
