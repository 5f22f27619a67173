// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. The two blobs are read from disk at setup
// time; a missing or malformed file is a fatal setup error.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;

/// Read a SPIR-V blob into 4-byte words.
pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open shader file: {:?}", path))?;

    // read_spv checks the length and the magic number and fixes endianness
    ash::util::read_spv(&mut file).with_context(|| format!("Failed to read SPIR-V from {:?}", path))
}

/// Shader module that lives only as long as pipeline creation needs it
pub struct ShaderModule<'a> {
    device: &'a ash::Device,
    pub module: vk::ShaderModule,
}

impl<'a> ShaderModule<'a> {
    pub fn from_file(device: &'a ash::Device, path: &Path) -> Result<Self> {
        let code = load_spirv(path)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe { device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module from {:?}", path))?;

        log::debug!("Loaded shader {:?} ({} words)", path, code.len());
        Ok(Self { device, module })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn write_blob(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn loads_valid_spirv_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let file = write_blob(&bytes);

        let code = load_spirv(file.path()).unwrap();
        assert_eq!(code, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_spirv(&dir.path().join("vert.spv")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to open shader file"));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let file = write_blob(&[0x03, 0x02, 0x23, 0x07, 0x00]);
        assert!(load_spirv(file.path()).is_err());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let file = write_blob(b"#version 450\n\0\0\0");
        let err = load_spirv(file.path()).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("Failed to read SPIR-V from"));
        assert!(message.contains("missing SPIR-V magic number"));
    }

    #[test]
    fn byte_swapped_spirv_is_normalized() {
        let mut bytes = SPIRV_MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&7u32.to_be_bytes());
        let file = write_blob(&bytes);

        assert_eq!(load_spirv(file.path()).unwrap(), vec![SPIRV_MAGIC, 7]);
    }

    #[test]
    fn empty_blob_is_rejected() {
        let file = write_blob(&[]);
        let err = load_spirv(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("missing SPIR-V magic number"));
    }
}
