//! Depth buffer management.
//!
//! The depth image is sized to the swapchain, so it lives in the swapchain
//! deletion queue and is rebuilt whenever the swapchain is recreated.

use tracing::info;

use renderer_rhi::command::ImageBarrier;
use renderer_rhi::image::{Extent2D, ImageDesc, ImageFormat, ImageLayout};
use renderer_rhi::{GpuBackend, ImageHandle};

use crate::deletion_queue::{Deletion, DeletionQueue};
use crate::error::RenderResult;
use crate::upload::UploadContext;

/// Default depth buffer format (32-bit floating point).
pub const DEFAULT_DEPTH_FORMAT: ImageFormat = ImageFormat::D32Float;

/// Depth attachment matching the swapchain extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthBuffer {
    image: ImageHandle,
    extent: Extent2D,
}

impl DepthBuffer {
    /// Creates the depth image and transitions it to `DepthAttachment`.
    ///
    /// Its destruction is queued on `deletion`, which should be the
    /// swapchain deletion queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the extent is empty or the image cannot be created
    /// or transitioned.
    pub fn new(
        backend: &dyn GpuBackend,
        upload: &mut UploadContext,
        deletion: &mut DeletionQueue,
        extent: Extent2D,
    ) -> RenderResult<Self> {
        let image = backend.create_image(&ImageDesc::depth(extent, "depth buffer"))?;
        deletion.push(Deletion::Image(image));

        upload.submit_blocking(backend, |cmd| {
            cmd.pipeline_barrier(&[ImageBarrier::all_levels(
                image,
                1,
                ImageLayout::Undefined,
                ImageLayout::DepthAttachment,
            )]);
        })?;

        info!(
            "Depth buffer created: {}x{} {:?}",
            extent.width, extent.height, DEFAULT_DEPTH_FORMAT
        );
        Ok(Self { image, extent })
    }

    #[inline]
    pub fn image(&self) -> ImageHandle {
        self.image
    }

    #[inline]
    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> ImageFormat {
        DEFAULT_DEPTH_FORMAT
    }
}
