//! GPU buffer descriptions.
//!
//! This module describes vertex, index, uniform, storage and staging buffers.
//! The backend owns the memory; [`Buffer`] is a copyable capability that
//! remembers the handle, size and usage so writes can be checked on the CPU side
//! before they reach the backend.
//!
//! # Overview
//!
//! - [`BufferUsage`] defines how a buffer will be used (vertex, index, uniform, etc.)
//! - [`MemoryLocation`] says where its memory lives
//! - [`Buffer`] pairs a [`BufferHandle`] with its size and usage
//!
//! # Example
//!
//! ```no_run
//! use renderer_rhi::GpuBackend;
//! use renderer_rhi::buffer::{Buffer, BufferUsage};
//!
//! # fn example(backend: &dyn GpuBackend) -> Result<(), renderer_rhi::RhiError> {
//! let data = [0u8; 64];
//! let staging = Buffer::with_data(backend, BufferUsage::Staging, &data, "upload staging")?;
//! // ... record a copy out of `staging` ...
//! staging.destroy(backend);
//! # Ok(())
//! # }
//! ```

use tracing::debug;

use crate::backend::GpuBackend;
use crate::error::{RhiError, RhiResult};
use crate::handle::BufferHandle;

/// Buffer usage type.
///
/// Defines the intended use of the buffer, which decides its memory location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Vertex buffer, filled once through a staging copy
    Vertex,
    /// Index buffer, filled once through a staging copy
    Index,
    /// Uniform buffer, rewritten by the CPU every frame
    Uniform,
    /// Storage buffer, rewritten by the CPU every frame
    Storage,
    /// Staging buffer, CPU-writable source of transfers
    Staging,
}

/// Where a buffer's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device-local, not mappable.
    GpuOnly,
    /// Host-visible, written by the CPU and read by the GPU.
    CpuToGpu,
    /// Host-visible, written by the GPU and read back by the CPU.
    GpuToCpu,
}

impl BufferUsage {
    /// Returns the preferred memory location for this buffer type.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            // Filled through the upload context, never mapped
            BufferUsage::Vertex | BufferUsage::Index => MemoryLocation::GpuOnly,
            BufferUsage::Uniform | BufferUsage::Storage => MemoryLocation::CpuToGpu,
            BufferUsage::Staging => MemoryLocation::CpuToGpu,
        }
    }

    /// Whether the CPU may write this buffer directly.
    #[inline]
    pub fn is_host_visible(self) -> bool {
        self.memory_location() != MemoryLocation::GpuOnly
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Storage => "storage",
            BufferUsage::Staging => "staging",
        }
    }
}

/// Creation parameters for a buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    /// Debug name.
    pub label: String,
}

impl BufferDesc {
    pub fn new(usage: BufferUsage, size: u64, label: impl Into<String>) -> Self {
        Self {
            size,
            usage,
            label: label.into(),
        }
    }
}

/// A backend buffer together with its size and usage.
///
/// Copying a `Buffer` copies the capability, not the memory. Exactly one owner
/// should call [`destroy`](Self::destroy), usually through a deletion queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Buffer {
    handle: BufferHandle,
    size: u64,
    usage: BufferUsage,
}

impl Buffer {
    /// Creates a new buffer with the specified size.
    ///
    /// # Arguments
    ///
    /// * `backend` - The GPU backend that will own the memory
    /// * `usage` - The intended buffer usage
    /// * `size` - Buffer size in bytes
    /// * `label` - Debug name
    ///
    /// # Errors
    ///
    /// Returns an error if the size is zero or the backend cannot allocate.
    pub fn new(
        backend: &dyn GpuBackend,
        usage: BufferUsage,
        size: u64,
        label: &str,
    ) -> RhiResult<Self> {
        if size == 0 {
            return Err(RhiError::InvalidUsage(format!(
                "Cannot create empty {} buffer '{}'",
                usage.name(),
                label
            )));
        }

        let handle = backend.create_buffer(&BufferDesc::new(usage, size, label))?;
        debug!("Created {} buffer '{}' ({} bytes)", usage.name(), label, size);

        Ok(Self {
            handle,
            size,
            usage,
        })
    }

    /// Creates a host-visible buffer and fills it with `data`.
    pub fn with_data(
        backend: &dyn GpuBackend,
        usage: BufferUsage,
        data: &[u8],
        label: &str,
    ) -> RhiResult<Self> {
        let buffer = Self::new(backend, usage, data.len() as u64, label)?;
        if let Err(e) = buffer.write(backend, 0, data) {
            buffer.destroy(backend);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Writes `data` through the mapped pointer at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not host-visible or the write would run
    /// past its end.
    pub fn write(&self, backend: &dyn GpuBackend, offset: u64, data: &[u8]) -> RhiResult<()> {
        if !self.usage.is_host_visible() {
            return Err(RhiError::InvalidUsage(format!(
                "{} buffer {:?} is not host-visible",
                self.usage.name(),
                self.handle
            )));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                RhiError::InvalidUsage(format!(
                    "Write exceeds buffer size: offset {} + {} bytes > {} bytes",
                    offset,
                    data.len(),
                    self.size
                ))
            })?;
        debug_assert!(end <= self.size);

        backend.write_buffer(self.handle, offset, data)
    }

    /// Writes a plain-old-data value at `offset`.
    pub fn write_pod<T: bytemuck::Pod>(
        &self,
        backend: &dyn GpuBackend,
        offset: u64,
        value: &T,
    ) -> RhiResult<()> {
        self.write(backend, offset, bytemuck::bytes_of(value))
    }

    /// Releases the buffer.
    pub fn destroy(self, backend: &dyn GpuBackend) {
        backend.destroy_buffer(self.handle);
        debug!("Destroyed {} buffer {:?}", self.usage.name(), self.handle);
    }

    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}
