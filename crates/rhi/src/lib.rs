//! GPU abstraction layer (Render Hardware Interface).
//!
//! Everything above this crate talks to the GPU through the [`GpuBackend`]
//! trait and opaque handles. The crate provides:
//! - Buffer, image and sampler descriptions
//! - Command recording into backend-neutral command lists
//! - Descriptor set layout caching and pool-growing allocation
//! - Shader module loading and graphics pipeline building
//! - Per-frame synchronization primitives
//! - [`headless::HeadlessBackend`], a CPU implementation that records hazards

mod error;

pub mod backend;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod handle;
pub mod headless;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod sync;
pub mod vertex;

pub use backend::{AcquiredImage, DeviceLimits, GpuBackend, PresentOutcome, Submission};
pub use error::{RhiError, RhiResult};
pub use handle::*;
