use std::borrow::Cow;
use std::ffi::CString;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::DeviceContext;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Error)]
pub enum CreateShaderModuleError {
    #[error("Failed to read SPIR-V file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("SPIR-V byte slice length ({0}) is not a multiple of 4")]
    InvalidLength(usize),

    #[error("SPIR-V magic number mismatch, found {0:#010x}")]
    InvalidMagic(u32),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// Reinterpret little-endian SPIR-V bytes as words.
///
/// Borrows when the slice is already `u32` aligned on a little-endian
/// target, copies otherwise.
pub(crate) fn spirv_words(
    spirv_bytes: &[u8],
) -> Result<Cow<'_, [u32]>, CreateShaderModuleError> {
    if !spirv_bytes.len().is_multiple_of(4) {
        return Err(CreateShaderModuleError::InvalidLength(spirv_bytes.len()));
    }

    let words: Cow<'_, [u32]> = match bytemuck::try_cast_slice(spirv_bytes) {
        Ok(words) if cfg!(target_endian = "little") => Cow::Borrowed(words),
        _ => Cow::Owned(
            spirv_bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
    };

    match words.first().copied() {
        Some(SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(CreateShaderModuleError::InvalidMagic(other)),
        None => Err(CreateShaderModuleError::InvalidLength(0)),
    }
}

pub struct ShaderModule {
    parent: Arc<DeviceContext>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from raw SPIR-V bytes.
    ///
    /// `spirv_bytes` must have a length that is a multiple of 4 and start
    /// with the SPIR-V magic number.
    ///
    /// `name` is an optional debug label. Naming failures are logged as
    /// warnings and do not cause the call to fail.
    pub fn new(
        device: &Arc<DeviceContext>,
        spirv_bytes: &[u8],
        name: Option<&str>,
    ) -> Result<Self, CreateShaderModuleError> {
        let code = spirv_words(spirv_bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        // SAFETY: create_info contains SPIR-V code words with a valid header.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(CreateShaderModuleError::Vulkan)?;

        // SAFETY: handle is a valid shader module created from device.
        let name_result = unsafe { device.set_object_name_str(handle, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name shader module {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Read a `.spv` file and create a module from it, named after the
    /// file.
    pub fn from_file(
        device: &Arc<DeviceContext>,
        path: impl AsRef<Path>,
    ) -> Result<Self, CreateShaderModuleError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| {
            CreateShaderModuleError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;
        tracing::debug!("Loaded {} bytes of SPIR-V from {:?}", bytes.len(), path);
        let name = path.file_name().and_then(|n| n.to_str());
        Self::new(device, &bytes, name)
    }

    /// A compute [`EntryPoint`] view into this module.
    ///
    /// Returns `Err` only if `name` contains an interior NUL byte.
    pub fn compute_entry_point(
        &self,
        name: &str,
    ) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
        })
    }

    pub fn raw_shader_module(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn parent(&self) -> &Arc<DeviceContext> {
        &self.parent
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipelines keep no reference
        // to the module once created.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

/// A borrow-view pairing a [`ShaderModule`] with a compute entry point
/// name.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
}

impl EntryPoint<'_> {
    /// The returned struct borrows from `self`, so it must not outlive this
    /// `EntryPoint`.
    pub fn as_pipeline_stage_create_info(
        &self,
    ) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(self.module.raw_shader_module())
            .name(&self.name)
    }

    pub fn name(&self) -> &std::ffi::CStr {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn valid_header_is_accepted() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0600, 0, 8, 0]);
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words[1], 0x0001_0600);
    }

    #[test]
    fn unaligned_input_is_copied() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 42]);
        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        let words = spirv_words(&shifted[1..]).unwrap();
        assert_eq!(&*words, &[SPIRV_MAGIC, 42]);
    }

    #[test]
    fn length_must_be_word_multiple() {
        let mut bytes = module_bytes(&[SPIRV_MAGIC]);
        bytes.push(0);
        assert!(matches!(
            spirv_words(&bytes),
            Err(CreateShaderModuleError::InvalidLength(5))
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            spirv_words(&[]),
            Err(CreateShaderModuleError::InvalidLength(0))
        ));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let bytes = module_bytes(&[0xdead_beef]);
        assert!(matches!(
            spirv_words(&bytes),
            Err(CreateShaderModuleError::InvalidMagic(0xdead_beef))
        ));
    }

    #[test]
    fn big_endian_magic_is_rejected() {
        let bytes = SPIRV_MAGIC.to_be_bytes();
        assert!(matches!(
            spirv_words(&bytes),
            Err(CreateShaderModuleError::InvalidMagic(0x0302_2307))
        ));
    }
}
