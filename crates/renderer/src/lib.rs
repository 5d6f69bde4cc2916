//! Frame-pipelined renderer core.
//!
//! This crate orchestrates the rendering process on top of a
//! [`GpuBackend`](renderer_rhi::GpuBackend):
//! - Frame management: a ring of [`MAX_FRAMES_IN_FLIGHT`] slots with fenced reuse
//! - Deferred destruction through LIFO deletion queues
//! - Dynamic uniform packing and per-object storage buffers
//! - Blocking uploads of cooked meshes and textures
//! - Sorted draw recording with redundant binds skipped

pub mod deletion_queue;
pub mod depth_buffer;
mod error;
pub mod frame_manager;
pub mod render_object;
pub mod renderer;
pub mod resources;
pub mod ubo;
pub mod uniform;
pub mod upload;

pub use deletion_queue::{Deletion, DeletionQueue};
pub use error::{RenderError, RenderResult};
pub use frame_manager::{BeginFrame, FrameRing, FrameSlot, FrameTarget, FrameTimeouts};
pub use render_object::{DrawStats, RenderObject};
pub use renderer::{FrameOutcome, RenderStats, Renderer};
pub use resources::{MaterialId, MeshId, TextureId};
pub use ubo::{CameraUBO, ObjectData, SceneUBO};
pub use uniform::{UniformLayout, UniformSlot, pad_uniform_size};

/// Maximum number of frames that can be in flight simultaneously.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
