//! The GPU backend seam.
//!
//! Everything above this crate talks to the GPU through [`GpuBackend`]. Handles
//! are opaque; the backend is the sole owner of the memory and objects behind
//! them. Methods take `&self` so one backend can be shared as
//! `Arc<dyn GpuBackend>`; implementations synchronize internally.

use std::time::Duration;

use crate::buffer::BufferDesc;
use crate::command::CommandList;
use crate::descriptor::{DescriptorBinding, DescriptorPoolSize, DescriptorWrite};
use crate::error::RhiResult;
use crate::handle::{
    BufferHandle, CommandPoolHandle, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, FenceHandle, ImageHandle, PipelineHandle, PipelineLayoutHandle,
    SamplerHandle, SemaphoreHandle, ShaderModuleHandle,
};
use crate::image::{Extent2D, ImageDesc, ImageFormat, SamplerDesc};
use crate::pipeline::{GraphicsPipelineDesc, PipelineLayoutDesc};
use crate::shader::ShaderCode;

/// Device capabilities the renderer depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Alignment required for uniform buffer offsets, including dynamic ones.
    pub min_uniform_buffer_offset_alignment: u64,
    /// Alignment required for storage buffer offsets.
    pub min_storage_buffer_offset_alignment: u64,
    pub max_bound_descriptor_sets: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            max_bound_descriptor_sets: 4,
        }
    }
}

/// One queue submission.
#[derive(Clone, Copy, Debug)]
pub struct Submission<'a> {
    pub commands: &'a CommandList,
    /// Semaphores that must be signaled before execution starts.
    pub wait_semaphores: &'a [SemaphoreHandle],
    /// Semaphores signaled when execution completes.
    pub signal_semaphores: &'a [SemaphoreHandle],
    /// Fence signaled when execution completes.
    pub signal_fence: Option<FenceHandle>,
}

/// Result of acquiring a swapchain image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The image is usable but the swapchain no longer matches the surface.
    pub suboptimal: bool,
}

/// Result of a successful present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the swapchain should be recreated.
    Suboptimal,
}

/// Opaque GPU backend.
///
/// `destroy_*` methods never fail; destroying an unknown handle is a caller
/// bug that backends may log or record.
pub trait GpuBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    fn limits(&self) -> DeviceLimits;

    // Buffers

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<BufferHandle>;

    /// Writes through the buffer's persistent mapping.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RhiResult<()>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    // Images

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<ImageHandle>;

    fn destroy_image(&self, image: ImageHandle);

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<SamplerHandle>;

    fn destroy_sampler(&self, sampler: SamplerHandle);

    // Shaders and pipelines

    fn create_shader_module(&self, code: &ShaderCode) -> RhiResult<ShaderModuleHandle>;

    fn destroy_shader_module(&self, module: ShaderModuleHandle);

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> RhiResult<PipelineLayoutHandle>;

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle);

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> RhiResult<PipelineHandle>;

    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    // Descriptors

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> RhiResult<DescriptorSetLayoutHandle>;

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[DescriptorPoolSize],
    ) -> RhiResult<DescriptorPoolHandle>;

    /// Frees every set allocated from `pool`.
    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> RhiResult<()>;

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);

    /// Allocates one set.
    ///
    /// Fails with [`RhiError::OutOfPoolMemory`](crate::RhiError::OutOfPoolMemory)
    /// or [`RhiError::FragmentedPool`](crate::RhiError::FragmentedPool) when the
    /// pool cannot hold it.
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> RhiResult<DescriptorSetHandle>;

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> RhiResult<()>;

    // Commands and synchronization

    fn create_command_pool(&self) -> RhiResult<CommandPoolHandle>;

    /// Recycles every command buffer allocated from `pool`.
    fn reset_command_pool(&self, pool: CommandPoolHandle) -> RhiResult<()>;

    fn destroy_command_pool(&self, pool: CommandPoolHandle);

    fn create_fence(&self, signaled: bool) -> RhiResult<FenceHandle>;

    /// Blocks until `fence` is signaled or `timeout` expires.
    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> RhiResult<()>;

    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()>;

    fn is_fence_signaled(&self, fence: FenceHandle) -> RhiResult<bool>;

    fn destroy_fence(&self, fence: FenceHandle);

    fn create_semaphore(&self) -> RhiResult<SemaphoreHandle>;

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn submit(&self, submission: Submission<'_>) -> RhiResult<()>;

    // Presentation

    fn surface_extent(&self) -> Extent2D;

    fn swapchain_format(&self) -> ImageFormat;

    fn swapchain_image_count(&self) -> u32;

    /// Acquires the next swapchain image, signaling `signal` when it is ready.
    ///
    /// Fails with [`RhiError::OutOfDate`](crate::RhiError::OutOfDate) when the
    /// swapchain must be recreated before rendering.
    fn acquire_next_image(
        &self,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> RhiResult<AcquiredImage>;

    /// Presents `image_index` once `wait` is signaled.
    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> RhiResult<PresentOutcome>;

    /// Rebuilds the swapchain for `extent`. The device must be idle.
    fn recreate_swapchain(&self, extent: Extent2D) -> RhiResult<()>;

    /// Blocks until all submitted work has completed.
    fn wait_idle(&self) -> RhiResult<()>;
}
