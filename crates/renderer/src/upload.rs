//! Blocking one-shot transfers.
//!
//! [`UploadContext`] owns a command pool and a fence that are used for nothing
//! else. Each [`submit_blocking`](UploadContext::submit_blocking) call records,
//! submits and waits for completion before returning, so staging buffers can be
//! destroyed as soon as it returns.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use renderer_rhi::buffer::{Buffer, BufferUsage};
//! use renderer_rhi::command::BufferCopy;
//! use renderer_rhi::headless::HeadlessBackend;
//! use renderer_renderer::deletion_queue::DeletionQueue;
//! use renderer_renderer::upload::UploadContext;
//!
//! # fn main() -> Result<(), renderer_renderer::RenderError> {
//! let backend = HeadlessBackend::new();
//! let mut deletion = DeletionQueue::new("main");
//! let mut upload = UploadContext::new(&backend, &mut deletion, Duration::from_secs(1))?;
//!
//! let staging = Buffer::with_data(&backend, BufferUsage::Staging, &[1, 2, 3, 4], "staging")?;
//! let gpu = Buffer::new(&backend, BufferUsage::Vertex, 4, "vertices")?;
//! upload.submit_blocking(&backend, |cmd| {
//!     cmd.copy_buffer(staging.handle(), gpu.handle(), &[BufferCopy::whole(4)]);
//! })?;
//!
//! staging.destroy(&backend);
//! gpu.destroy(&backend);
//! deletion.flush(&backend);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use tracing::{debug, error, info, warn};

use renderer_assets::{MeshData, TextureData, TextureFormat};
use renderer_core::ScopedTimer;
use renderer_rhi::buffer::{Buffer, BufferUsage};
use renderer_rhi::command::{BufferCopy, BufferImageCopy, CommandRecorder, ImageBarrier, IndexType};
use renderer_rhi::image::{Extent2D, ImageDesc, ImageFormat, ImageLayout};
use renderer_rhi::{CommandPoolHandle, FenceHandle, GpuBackend, Submission};

use crate::deletion_queue::{Deletion, DeletionQueue};
use crate::error::{RenderError, RenderResult};
use crate::resources::{GpuMesh, GpuTexture};

/// Dedicated command pool and fence for blocking uploads.
///
/// Taking `&mut self` serializes uploads; share it behind a mutex if asset
/// loading moves to several threads.
#[derive(Debug)]
pub struct UploadContext {
    pool: CommandPoolHandle,
    fence: FenceHandle,
    timeout: Duration,
}

impl UploadContext {
    /// Creates the pool and an unsignaled fence and queues their destruction.
    pub fn new(
        backend: &dyn GpuBackend,
        deletion: &mut DeletionQueue,
        timeout: Duration,
    ) -> RenderResult<Self> {
        let pool = backend.create_command_pool()?;
        deletion.push(Deletion::CommandPool(pool));
        let fence = backend.create_fence(false)?;
        deletion.push(Deletion::Fence(fence));

        debug!("Upload context created (timeout {:?})", timeout);
        Ok(Self {
            pool,
            fence,
            timeout,
        })
    }

    /// Records commands with `record`, submits them and waits for completion.
    ///
    /// # Errors
    ///
    /// Returns an error if recording was invalid, submission failed, or the GPU
    /// did not finish within the timeout. When the wait fails the queue is
    /// drained before returning, so buffers the commands referenced may be
    /// destroyed and the context stays usable.
    pub fn submit_blocking<F>(&mut self, backend: &dyn GpuBackend, record: F) -> RenderResult<()>
    where
        F: FnOnce(&mut CommandRecorder),
    {
        let mut cmd = CommandRecorder::begin(self.pool);
        record(&mut cmd);
        let commands = cmd.end()?;

        backend.submit(Submission {
            commands: &commands,
            wait_semaphores: &[],
            signal_semaphores: &[],
            signal_fence: Some(self.fence),
        })?;
        if let Err(e) = backend.wait_for_fence(self.fence, self.timeout) {
            warn!("Upload wait failed ({}), draining the queue", e);
            if let Err(drain) = self.drain(backend) {
                error!("Failed to drain after upload failure: {}", drain);
            }
            return Err(e.into());
        }

        backend.reset_fence(self.fence)?;
        backend.reset_command_pool(self.pool)?;
        Ok(())
    }

    /// Waits for the device to go idle and rearms the fence and pool.
    fn drain(&self, backend: &dyn GpuBackend) -> RenderResult<()> {
        backend.wait_idle()?;
        backend.reset_fence(self.fence)?;
        backend.reset_command_pool(self.pool)?;
        Ok(())
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Copies a mesh into device-local vertex and index buffers.
///
/// Both buffers are staged through one host-visible buffer, vertices first.
/// On success their destruction is queued on `deletion`.
pub fn upload_mesh(
    backend: &dyn GpuBackend,
    upload: &mut UploadContext,
    deletion: &mut DeletionQueue,
    mesh: &MeshData,
    label: &str,
) -> RenderResult<GpuMesh> {
    let _timer = ScopedTimer::new("upload mesh");

    let stride = mesh.info.vertex_format.stride().ok_or_else(|| {
        RenderError::Unsupported(format!("mesh '{}' has no known vertex format", label))
    })?;
    if mesh.vertices.is_empty() {
        return Err(RenderError::Unsupported(format!(
            "mesh '{}' has no vertices",
            label
        )));
    }
    let index_type = IndexType::from_size(u32::from(mesh.info.index_size)).ok_or_else(|| {
        RenderError::Unsupported(format!(
            "mesh '{}' uses {}-byte indices",
            label, mesh.info.index_size
        ))
    })?;

    let mut staged = Vec::with_capacity(mesh.vertices.len() + mesh.indices.len());
    staged.extend_from_slice(&mesh.vertices);
    staged.extend_from_slice(&mesh.indices);
    let staging = Buffer::with_data(backend, BufferUsage::Staging, &staged, label)?;

    let mut created = DeletionQueue::new("mesh upload");
    let result = copy_mesh_buffers(backend, upload, &mut created, &staging, mesh, label);
    staging.destroy(backend);

    match result {
        Ok((vertex_buffer, index_buffer)) => {
            deletion.append(&mut created);
            let gpu = GpuMesh {
                vertex_buffer,
                index_buffer,
                index_type,
                vertex_count: (mesh.vertices.len() / stride) as u32,
                index_count: (mesh.indices.len() / index_type.size() as usize) as u32,
                format: mesh.info.vertex_format,
                bounds: mesh.info.bounds,
            };
            info!(
                "Uploaded mesh '{}': {} vertices, {} indices",
                label, gpu.vertex_count, gpu.index_count
            );
            Ok(gpu)
        }
        Err(e) => {
            created.flush(backend);
            Err(e)
        }
    }
}

fn copy_mesh_buffers(
    backend: &dyn GpuBackend,
    upload: &mut UploadContext,
    created: &mut DeletionQueue,
    staging: &Buffer,
    mesh: &MeshData,
    label: &str,
) -> RenderResult<(Buffer, Option<Buffer>)> {
    let vertex_size = mesh.vertices.len() as u64;
    let index_size = mesh.indices.len() as u64;

    let vertex_buffer = Buffer::new(backend, BufferUsage::Vertex, vertex_size, label)?;
    created.push(Deletion::Buffer(vertex_buffer.handle()));
    let index_buffer = if index_size > 0 {
        let buffer = Buffer::new(backend, BufferUsage::Index, index_size, label)?;
        created.push(Deletion::Buffer(buffer.handle()));
        Some(buffer)
    } else {
        None
    };

    upload.submit_blocking(backend, |cmd| {
        cmd.copy_buffer(
            staging.handle(),
            vertex_buffer.handle(),
            &[BufferCopy::whole(vertex_size)],
        );
        if let Some(index_buffer) = &index_buffer {
            cmd.copy_buffer(
                staging.handle(),
                index_buffer.handle(),
                &[BufferCopy {
                    src_offset: vertex_size,
                    dst_offset: 0,
                    size: index_size,
                }],
            );
        }
    })?;

    Ok((vertex_buffer, index_buffer))
}

/// GPU format for a cooked texture format.
pub fn image_format(format: TextureFormat) -> Option<ImageFormat> {
    match format {
        TextureFormat::Rgba8 => Some(ImageFormat::Rgba8Srgb),
        TextureFormat::Unknown => None,
    }
}

/// Creates a sampled image and copies every page into its mip level.
///
/// The image goes `Undefined -> TransferDst`, receives one copy per mip with
/// the buffer offset advancing by each page's size, then moves to
/// `ShaderReadOnly`. On success its destruction is queued on `deletion`.
pub fn upload_texture(
    backend: &dyn GpuBackend,
    upload: &mut UploadContext,
    deletion: &mut DeletionQueue,
    texture: &TextureData,
    label: &str,
) -> RenderResult<GpuTexture> {
    let _timer = ScopedTimer::new("upload texture");

    let info = &texture.info;
    let format = image_format(info.format).ok_or_else(|| {
        RenderError::Unsupported(format!("texture '{}' has format {}", label, info.format))
    })?;
    if info.pages.is_empty() {
        return Err(RenderError::Unsupported(format!(
            "texture '{}' has no pages",
            label
        )));
    }

    let base = info.extent();
    let extent = Extent2D::new(base.width, base.height);
    let mip_levels = info.mip_levels();
    let mut regions = Vec::with_capacity(info.pages.len());
    let mut offset = 0;
    for (level, page) in info.pages.iter().enumerate() {
        regions.push(BufferImageCopy {
            buffer_offset: offset,
            mip_level: level as u32,
            extent: Extent2D::new(page.width, page.height),
        });
        offset += page.original_size;
    }

    let staging = Buffer::with_data(backend, BufferUsage::Staging, &texture.pixels, label)?;
    let image = match backend.create_image(&ImageDesc::texture(extent, format, mip_levels, label)) {
        Ok(image) => image,
        Err(e) => {
            staging.destroy(backend);
            return Err(e.into());
        }
    };

    let result = upload.submit_blocking(backend, |cmd| {
        cmd.pipeline_barrier(&[ImageBarrier::all_levels(
            image,
            mip_levels,
            ImageLayout::Undefined,
            ImageLayout::TransferDst,
        )]);
        cmd.copy_buffer_to_image(staging.handle(), image, ImageLayout::TransferDst, &regions);
        cmd.pipeline_barrier(&[ImageBarrier::all_levels(
            image,
            mip_levels,
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        )]);
    });
    staging.destroy(backend);

    if let Err(e) = result {
        backend.destroy_image(image);
        return Err(e);
    }
    deletion.push(Deletion::Image(image));

    info!(
        "Uploaded texture '{}': {}x{}, {} mip level(s)",
        label, extent.width, extent.height, mip_levels
    );
    Ok(GpuTexture {
        image,
        extent,
        mip_levels,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderer_assets::{
        AssetContainer, TextureFormat, VertexPncvF32, generate_mip_chain, pack_texture,
        pack_vertices,
    };
    use renderer_rhi::RhiError;
    use renderer_rhi::headless::HeadlessBackend;
    use glam::Vec3;

    fn triangle() -> MeshData {
        let vertices = [
            VertexPncvF32::new(Vec3::ZERO, Vec3::Z, Vec3::ONE, [0.0, 0.0]),
            VertexPncvF32::new(Vec3::X, Vec3::Z, Vec3::ONE, [1.0, 0.0]),
            VertexPncvF32::new(Vec3::Y, Vec3::Z, Vec3::ONE, [0.0, 1.0]),
        ];
        let container = pack_vertices(&vertices, &[0, 1, 2], "triangle.obj").unwrap();
        MeshData::from_container(&container).unwrap()
    }

    fn checker(size: u32) -> TextureData {
        let pixels: Vec<u8> = (0..size * size)
            .flat_map(|i| {
                let v = if (i + i / size) % 2 == 0 { 255 } else { 0 };
                [v, v, v, 255]
            })
            .collect();
        let (extents, chain) = generate_mip_chain(size, size, &pixels).unwrap();
        let container: AssetContainer =
            pack_texture(TextureFormat::Rgba8, &extents, &chain, "checker.png").unwrap();
        TextureData::from_container(&container).unwrap()
    }

    fn context(backend: &HeadlessBackend, deletion: &mut DeletionQueue) -> UploadContext {
        UploadContext::new(backend, deletion, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_submit_blocking_leaves_fence_reset() {
        let backend = HeadlessBackend::new();
        let mut deletion = DeletionQueue::new("test");
        let mut upload = context(&backend, &mut deletion);

        upload.submit_blocking(&backend, |_| {}).unwrap();
        upload.submit_blocking(&backend, |_| {}).unwrap();

        assert!(!backend.is_fence_signaled(upload.fence).unwrap());
        assert_eq!(backend.in_flight_count(), 0);
        assert!(backend.hazards().is_empty());
        deletion.flush(&backend);
    }

    #[test]
    fn test_submit_blocking_propagates_timeout() {
        let backend = HeadlessBackend::new();
        let mut deletion = DeletionQueue::new("test");
        let mut upload = context(&backend, &mut deletion);

        backend.fail_next_fence_wait(RhiError::Timeout(upload.timeout()));
        let err = upload.submit_blocking(&backend, |_| {}).unwrap_err();
        assert!(matches!(err, RenderError::Rhi(RhiError::Timeout(_))));

        // Drained and rearmed: nothing in flight, fence unsignaled
        assert_eq!(backend.in_flight_count(), 0);
        assert!(!backend.is_fence_signaled(upload.fence).unwrap());
        upload.submit_blocking(&backend, |_| {}).unwrap();
        assert!(backend.hazards().is_empty());
        deletion.flush(&backend);
    }

    #[test]
    fn test_mesh_upload_retry_after_timeout() {
        let backend = HeadlessBackend::new();
        let mut deletion = DeletionQueue::new("test");
        let mut upload = context(&backend, &mut deletion);
        let mesh = triangle();

        backend.fail_next_fence_wait(RhiError::Timeout(upload.timeout()));
        let err = upload_mesh(&backend, &mut upload, &mut deletion, &mesh, "triangle").unwrap_err();
        assert!(!err.is_fatal());
        assert!(backend.hazards().is_empty());
        // Only the pool and fence remain queued
        assert_eq!(deletion.len(), 2);

        let gpu = upload_mesh(&backend, &mut upload, &mut deletion, &mesh, "triangle").unwrap();
        assert_eq!(
            backend.buffer_contents(gpu.vertex_buffer.handle()).unwrap(),
            mesh.vertices
        );
        assert!(backend.hazards().is_empty());

        deletion.flush(&backend);
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    fn test_texture_upload_retry_after_timeout() {
        let backend = HeadlessBackend::new();
        let mut deletion = DeletionQueue::new("test");
        let mut upload = context(&backend, &mut deletion);
        let texture = checker(4);

        backend.fail_next_fence_wait(RhiError::Timeout(upload.timeout()));
        assert!(upload_texture(&backend, &mut upload, &mut deletion, &texture, "checker").is_err());
        assert!(backend.hazards().is_empty());

        upload_texture(&backend, &mut upload, &mut deletion, &texture, "checker").unwrap();
        assert!(backend.hazards().is_empty());

        deletion.flush(&backend);
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    fn test_upload_mesh_copies_vertices_and_indices() {
        let backend = HeadlessBackend::new();
        let mut deletion = DeletionQueue::new("test");
        let mut upload = context(&backend, &mut deletion);
        let mesh = triangle();

        let gpu = upload_mesh(&backend, &mut upload, &mut deletion, &mesh, "triangle").unwrap();

        assert_eq!(gpu.vertex_count, 3);
        assert_eq!(gpu.index_count, 3);
        assert_eq!(gpu.index_type, IndexType::U32);
        assert_eq!(
            backend.buffer_contents(gpu.vertex_buffer.handle()).unwrap(),
            mesh.vertices
        );
        let index_buffer = gpu.index_buffer.unwrap();
        assert_eq!(
            backend.buffer_contents(index_buffer.handle()).unwrap(),
            mesh.indices
        );
        assert!(backend.hazards().is_empty());

        // Pool, fence and the two mesh buffers; staging is gone
        assert_eq!(deletion.len(), 4);
        deletion.flush(&backend);
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    fn test_upload_texture_fills_every_mip() {
        let backend = HeadlessBackend::new();
        let mut deletion = DeletionQueue::new("test");
        let mut upload = context(&backend, &mut deletion);
        let texture = checker(8);

        let gpu =
            upload_texture(&backend, &mut upload, &mut deletion, &texture, "checker").unwrap();

        assert_eq!(gpu.mip_levels, 4);
        assert_eq!(gpu.extent, Extent2D::new(8, 8));
        for level in 0..gpu.mip_levels {
            assert_eq!(
                backend.image_mip(gpu.image, level).unwrap(),
                texture.page(level as usize).unwrap()
            );
            assert_eq!(
                backend.image_layout(gpu.image, level),
                Some(ImageLayout::ShaderReadOnly)
            );
        }
        assert!(backend.hazards().is_empty());
        deletion.flush(&backend);
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    fn test_failed_upload_releases_buffers() {
        let backend = HeadlessBackend::new();
        let mut deletion = DeletionQueue::new("test");
        let mut upload = context(&backend, &mut deletion);
        let mesh = triangle();

        backend.fail_next_fence_wait(RhiError::DeviceLost("test".to_string()));
        let err = upload_mesh(&backend, &mut upload, &mut deletion, &mesh, "triangle").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(deletion.len(), 2);
        assert!(backend.hazards().is_empty());

        deletion.flush(&backend);
        assert_eq!(backend.live_resource_count(), 0);
    }
}
