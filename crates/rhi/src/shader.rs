//! Shader module management.
//!
//! SPIR-V is validated on the CPU before a module is created, so a bad file
//! fails at the load call instead of surfacing later as a broken pipeline.
//!
//! # Overview
//!
//! - [`ShaderStage`] defines the type of shader (vertex, fragment, compute)
//! - [`ShaderCode`] is validated SPIR-V plus stage and entry point
//! - [`Shader`] is a created module ready for pipeline creation
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use renderer_rhi::GpuBackend;
//! use renderer_rhi::shader::{Shader, ShaderStage};
//!
//! # fn example(backend: &dyn GpuBackend) -> Result<(), renderer_rhi::RhiError> {
//! let vertex_shader = Shader::from_spirv_file(
//!     backend,
//!     Path::new("shaders/mesh.vert.spv"),
//!     ShaderStage::Vertex,
//!     "main",
//! )?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use tracing::{debug, info};

use crate::backend::GpuBackend;
use crate::descriptor::ShaderStages;
use crate::error::{RhiError, RhiResult};
use crate::handle::ShaderModuleHandle;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Words in a SPIR-V module header.
const SPIRV_HEADER_WORDS: usize = 5;

/// Shader stage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader stage - processes each vertex
    Vertex,
    /// Fragment (pixel) shader stage - processes each fragment
    Fragment,
    /// Compute shader stage - general-purpose GPU computation
    Compute,
}

impl ShaderStage {
    /// Converts the stage to the flag set used by descriptor bindings.
    pub fn to_stages(self) -> ShaderStages {
        match self {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
            ShaderStage::Compute => ShaderStages::COMPUTE,
        }
    }

    /// Returns a human-readable name for the shader stage.
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Validated SPIR-V code for one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderCode {
    stage: ShaderStage,
    words: Vec<u32>,
    entry_point: String,
}

impl ShaderCode {
    /// Validates SPIR-V bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::ShaderError`] if:
    /// - The byte length is not a multiple of 4
    /// - The module is shorter than a SPIR-V header
    /// - The magic number is wrong
    /// - The entry point name is empty or contains null bytes
    pub fn from_spirv_bytes(
        bytes: &[u8],
        stage: ShaderStage,
        entry_point: &str,
    ) -> RhiResult<Self> {
        if !bytes.len().is_multiple_of(4) {
            return Err(RhiError::ShaderError(format!(
                "SPIR-V code must be 4-byte aligned, got {} bytes",
                bytes.len()
            )));
        }

        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Self::from_words(words, stage, entry_point)
    }

    /// Validates SPIR-V that is already split into words.
    pub fn from_words(words: Vec<u32>, stage: ShaderStage, entry_point: &str) -> RhiResult<Self> {
        if words.len() < SPIRV_HEADER_WORDS {
            return Err(RhiError::ShaderError(format!(
                "SPIR-V module too short: {} words",
                words.len()
            )));
        }
        if words[0] != SPIRV_MAGIC {
            return Err(RhiError::ShaderError(format!(
                "Bad SPIR-V magic number {:#010x}",
                words[0]
            )));
        }
        if entry_point.is_empty() || entry_point.contains('\0') {
            return Err(RhiError::ShaderError(format!(
                "Invalid entry point name {:?}",
                entry_point
            )));
        }

        Ok(Self {
            stage,
            words,
            entry_point: entry_point.to_string(),
        })
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[inline]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}

/// A created shader module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shader {
    module: ShaderModuleHandle,
    stage: ShaderStage,
    entry_point: String,
}

impl Shader {
    /// Loads and creates a shader module from a SPIR-V file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the code is not valid
    /// SPIR-V, or module creation fails.
    pub fn from_spirv_file(
        backend: &dyn GpuBackend,
        path: &Path,
        stage: ShaderStage,
        entry_point: &str,
    ) -> RhiResult<Self> {
        debug!("Loading {} shader from {:?}", stage, path);

        let bytes = std::fs::read(path).map_err(|e| {
            RhiError::ShaderError(format!("Failed to read shader file {:?}: {}", path, e))
        })?;

        Self::from_spirv_bytes(backend, &bytes, stage, entry_point)
    }

    /// Creates a shader module from SPIR-V bytes.
    pub fn from_spirv_bytes(
        backend: &dyn GpuBackend,
        bytes: &[u8],
        stage: ShaderStage,
        entry_point: &str,
    ) -> RhiResult<Self> {
        let code = ShaderCode::from_spirv_bytes(bytes, stage, entry_point)?;
        Self::from_code(backend, &code)
    }

    /// Creates a shader module from already validated code.
    pub fn from_code(backend: &dyn GpuBackend, code: &ShaderCode) -> RhiResult<Self> {
        let module = backend.create_shader_module(code)?;

        info!(
            "Created {} shader module with entry point '{}'",
            code.stage(),
            code.entry_point()
        );

        Ok(Self {
            module,
            stage: code.stage(),
            entry_point: code.entry_point().to_string(),
        })
    }

    #[inline]
    pub fn handle(&self) -> ShaderModuleHandle {
        self.module
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    #[inline]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Releases the module. Pipelines created from it stay valid.
    pub fn destroy(self, backend: &dyn GpuBackend) {
        backend.destroy_shader_module(self.module);
        debug!("Destroyed {} shader module", self.stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes() -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_shader_stage_name() {
        assert_eq!(ShaderStage::Vertex.name(), "vertex");
        assert_eq!(ShaderStage::Fragment.name(), "fragment");
        assert_eq!(ShaderStage::Compute.name(), "compute");
        assert_eq!(format!("{}", ShaderStage::Vertex), "vertex");
    }

    #[test]
    fn test_shader_stage_to_stages() {
        assert_eq!(ShaderStage::Vertex.to_stages(), ShaderStages::VERTEX);
        assert_eq!(ShaderStage::Fragment.to_stages(), ShaderStages::FRAGMENT);
    }

    #[test]
    fn test_valid_spirv_header() {
        let code =
            ShaderCode::from_spirv_bytes(&header_bytes(), ShaderStage::Vertex, "main").unwrap();
        assert_eq!(code.words().len(), 5);
        assert_eq!(code.entry_point(), "main");
    }

    #[test]
    fn test_invalid_spirv_alignment() {
        let mut bytes = header_bytes();
        bytes.push(0);
        let err = ShaderCode::from_spirv_bytes(&bytes, ShaderStage::Vertex, "main").unwrap_err();
        assert!(matches!(err, RhiError::ShaderError(_)));
    }

    #[test]
    fn test_invalid_spirv_magic() {
        let mut bytes = header_bytes();
        bytes[0] = 0xFF;
        assert!(ShaderCode::from_spirv_bytes(&bytes, ShaderStage::Fragment, "main").is_err());
        assert!(ShaderCode::from_spirv_bytes(&[0; 8], ShaderStage::Fragment, "main").is_err());
    }

    #[test]
    fn test_invalid_entry_point() {
        let bytes = header_bytes();
        assert!(ShaderCode::from_spirv_bytes(&bytes, ShaderStage::Vertex, "").is_err());
        assert!(ShaderCode::from_spirv_bytes(&bytes, ShaderStage::Vertex, "ma\0in").is_err());
    }

    #[test]
    fn test_missing_file_fails_fast() {
        let backend = crate::headless::HeadlessBackend::new();
        let result = Shader::from_spirv_file(
            &backend,
            Path::new("does/not/exist.spv"),
            ShaderStage::Vertex,
            "main",
        );
        assert!(matches!(result, Err(RhiError::ShaderError(_))));
    }
}
