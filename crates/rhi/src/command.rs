//! Command recording.
//!
//! Commands are recorded on the CPU into a [`CommandRecorder`] tied to a backend
//! command pool, then sealed into a [`CommandList`] that is handed to
//! [`GpuBackend::submit`](crate::backend::GpuBackend::submit).
//!
//! # Overview
//!
//! - [`Command`] is one recorded GPU command
//! - [`CommandRecorder`] provides the recording methods
//! - [`CommandList`] is the immutable result of [`CommandRecorder::end`]
//!
//! # Example
//!
//! ```no_run
//! use renderer_rhi::GpuBackend;
//! use renderer_rhi::command::{BufferCopy, CommandRecorder};
//! use renderer_rhi::handle::BufferHandle;
//!
//! # fn example(backend: &dyn GpuBackend, src: BufferHandle, dst: BufferHandle) -> Result<(), renderer_rhi::RhiError> {
//! let pool = backend.create_command_pool()?;
//! let mut cmd = CommandRecorder::begin(pool);
//! cmd.copy_buffer(src, dst, &[BufferCopy::whole(256)]);
//! let list = cmd.end()?;
//! # Ok(())
//! # }
//! ```

use crate::error::{RhiError, RhiResult};
use crate::handle::{
    BufferHandle, CommandPoolHandle, DescriptorSetHandle, ImageHandle, PipelineHandle,
    PipelineLayoutHandle,
};
use crate::image::{Extent2D, ImageLayout};

/// Element type of an index buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    /// Maps an index element size in bytes to an index type.
    pub fn from_size(size: u32) -> Option<Self> {
        match size {
            2 => Some(IndexType::U16),
            4 => Some(IndexType::U32),
            _ => None,
        }
    }

    pub fn size(self) -> u32 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// One buffer-to-buffer copy region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

impl BufferCopy {
    /// Copies `size` bytes from the start of one buffer to the start of another.
    pub fn whole(size: u64) -> Self {
        Self {
            src_offset: 0,
            dst_offset: 0,
            size,
        }
    }
}

/// One buffer-to-image copy region covering a full mip level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub mip_level: u32,
    pub extent: Extent2D,
}

/// An image layout transition over a range of mip levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub base_mip_level: u32,
    pub level_count: u32,
}

impl ImageBarrier {
    /// Transitions every mip level of `image`.
    pub fn all_levels(
        image: ImageHandle,
        level_count: u32,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) -> Self {
        Self {
            image,
            old_layout,
            new_layout,
            base_mip_level: 0,
            level_count,
        }
    }
}

/// Viewport rectangle and depth range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-surface viewport with a `[0, 1]` depth range.
    pub fn from_extent(extent: Extent2D) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Attachments and clear values for a rendering scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderingInfo {
    /// Swapchain image rendered into.
    pub image_index: u32,
    pub depth: Option<ImageHandle>,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub extent: Extent2D,
}

/// A single recorded GPU command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BeginRendering(RenderingInfo),
    EndRendering,
    SetViewport(Viewport),
    SetScissor(Extent2D),
    BindPipeline(PipelineHandle),
    BindDescriptorSets {
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: Vec<DescriptorSetHandle>,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffer {
        buffer: BufferHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        index_type: IndexType,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    PushConstants {
        layout: PipelineLayoutHandle,
        offset: u32,
        data: Vec<u8>,
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        regions: Vec<BufferCopy>,
    },
    CopyBufferToImage {
        src: BufferHandle,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        regions: Vec<BufferImageCopy>,
    },
    PipelineBarrier(Vec<ImageBarrier>),
}

impl Command {
    /// Whether this command issues a draw.
    pub fn is_draw(&self) -> bool {
        matches!(self, Command::Draw { .. } | Command::DrawIndexed { .. })
    }
}

/// Records commands for one submission.
///
/// Recording methods never fail. Misuse such as drawing outside a rendering
/// scope is remembered and reported by [`end`](Self::end), the same point where
/// a driver would reject the command buffer.
#[derive(Debug)]
pub struct CommandRecorder {
    pool: CommandPoolHandle,
    commands: Vec<Command>,
    in_rendering: bool,
    pipeline_bound: bool,
    misuse: Option<String>,
}

impl CommandRecorder {
    /// Begins recording commands allocated from `pool`.
    pub fn begin(pool: CommandPoolHandle) -> Self {
        Self {
            pool,
            commands: Vec::new(),
            in_rendering: false,
            pipeline_bound: false,
            misuse: None,
        }
    }

    /// Ends recording and seals the commands for submission.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidUsage`] for the first misuse seen while
    /// recording, or if a rendering scope is still open.
    pub fn end(self) -> RhiResult<CommandList> {
        if let Some(misuse) = self.misuse {
            return Err(RhiError::InvalidUsage(misuse));
        }
        if self.in_rendering {
            return Err(RhiError::InvalidUsage(
                "Command list ended inside a rendering scope".to_string(),
            ));
        }
        Ok(CommandList {
            pool: self.pool,
            commands: self.commands,
        })
    }

    #[inline]
    pub fn pool(&self) -> CommandPoolHandle {
        self.pool
    }

    /// Number of commands recorded so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn flag(&mut self, message: &str) {
        if self.misuse.is_none() {
            self.misuse = Some(format!("{} (command #{})", message, self.commands.len()));
        }
    }

    // =========================================================================
    // Dynamic Rendering
    // =========================================================================

    /// Begins a rendering scope on a swapchain image.
    pub fn begin_rendering(&mut self, info: RenderingInfo) {
        if self.in_rendering {
            self.flag("Nested rendering scope");
        }
        self.in_rendering = true;
        self.commands.push(Command::BeginRendering(info));
    }

    /// Ends the current rendering scope.
    pub fn end_rendering(&mut self) {
        if !self.in_rendering {
            self.flag("end_rendering without begin_rendering");
        }
        self.in_rendering = false;
        self.pipeline_bound = false;
        self.commands.push(Command::EndRendering);
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(Command::SetViewport(viewport));
    }

    pub fn set_scissor(&mut self, extent: Extent2D) {
        self.commands.push(Command::SetScissor(extent));
    }

    // =========================================================================
    // Binding Commands
    // =========================================================================

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipeline_bound = true;
        self.commands.push(Command::BindPipeline(pipeline));
    }

    /// Binds descriptor sets starting at `first_set`.
    ///
    /// `dynamic_offsets` supplies one offset per dynamic binding, in set then
    /// binding order.
    pub fn bind_descriptor_sets(
        &mut self,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
        dynamic_offsets: &[u32],
    ) {
        self.commands.push(Command::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    pub fn bind_vertex_buffer(&mut self, buffer: BufferHandle, offset: u64) {
        self.commands
            .push(Command::BindVertexBuffer { buffer, offset });
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        self.commands.push(Command::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
    }

    /// Records push constant bytes at `offset`.
    pub fn push_constants<T: bytemuck::Pod>(
        &mut self,
        layout: PipelineLayoutHandle,
        offset: u32,
        value: &T,
    ) {
        self.commands.push(Command::PushConstants {
            layout,
            offset,
            data: bytemuck::bytes_of(value).to_vec(),
        });
    }

    // =========================================================================
    // Drawing Commands
    // =========================================================================

    fn check_draw(&mut self) {
        if !self.in_rendering {
            self.flag("Draw outside a rendering scope");
        } else if !self.pipeline_bound {
            self.flag("Draw without a bound pipeline");
        }
    }

    /// Issues a non-indexed draw command.
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.check_draw();
        self.commands.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    /// Issues an indexed draw command.
    ///
    /// # Arguments
    ///
    /// * `index_count` - Number of indices to draw
    /// * `instance_count` - Number of instances to draw
    /// * `first_index` - Offset to the first index
    /// * `vertex_offset` - Constant added to each index
    /// * `first_instance` - First instance index, visible to shaders
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.check_draw();
        self.commands.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    // =========================================================================
    // Transfer and Synchronization
    // =========================================================================

    /// Inserts image layout transitions.
    pub fn pipeline_barrier(&mut self, barriers: &[ImageBarrier]) {
        if self.in_rendering {
            self.flag("Pipeline barrier inside a rendering scope");
        }
        self.commands.push(Command::PipelineBarrier(barriers.to_vec()));
    }

    /// Copies data between buffers.
    pub fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopy]) {
        if self.in_rendering {
            self.flag("Copy inside a rendering scope");
        }
        self.commands.push(Command::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    /// Copies data from a buffer to an image in `dst_layout`.
    pub fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        regions: &[BufferImageCopy],
    ) {
        if self.in_rendering {
            self.flag("Copy inside a rendering scope");
        }
        self.commands.push(Command::CopyBufferToImage {
            src,
            dst,
            dst_layout,
            regions: regions.to_vec(),
        });
    }
}

/// A sealed sequence of commands ready for submission.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandList {
    pool: CommandPoolHandle,
    commands: Vec<Command>,
}

impl CommandList {
    /// A list with no commands, used to signal a fence without doing work.
    pub fn empty(pool: CommandPoolHandle) -> Self {
        Self {
            pool,
            commands: Vec::new(),
        }
    }

    #[inline]
    pub fn pool(&self) -> CommandPoolHandle {
        self.pool
    }

    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of draw commands in the list.
    pub fn draw_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_draw()).count()
    }
}
