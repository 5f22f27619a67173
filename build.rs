// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/triangle.vert");
    println!("cargo:rerun-if-changed=shaders/triangle.frag");

    // Compile shaders using glslc (part of Vulkan SDK)
    compile_shader("shaders/triangle.vert", "shaders/vert.spv");
    compile_shader("shaders/triangle.frag", "shaders/frag.spv");
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            // Keep building without glslc; the renderer reports missing
            // bytecode at startup instead.
            println!("cargo:warning=glslc not found ({e}), skipping {input}");
            println!("cargo:warning=compile manually: glslc {input} -o {output}");
        }
    }
}
