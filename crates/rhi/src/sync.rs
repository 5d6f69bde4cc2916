//! Per-frame synchronization primitives.
//!
//! - Semaphores order work on the GPU timeline (acquire before render, render
//!   before present) and are never waited on by the CPU
//! - Fences let the CPU wait for the GPU
//!
//! [`FrameSync`] groups the three objects one frame slot needs:
//!
//! ```text
//! 1. Wait on in_flight fence, then reset it
//! 2. Acquire swapchain image (signals image_available)
//! 3. Submit (waits image_available, signals render_finished and in_flight)
//! 4. Present (waits render_finished)
//! ```

use tracing::debug;

use crate::backend::GpuBackend;
use crate::error::RhiResult;
use crate::handle::{FenceHandle, SemaphoreHandle};

/// Synchronization objects owned by one frame slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSync {
    image_available: SemaphoreHandle,
    render_finished: SemaphoreHandle,
    in_flight: FenceHandle,
}

impl FrameSync {
    /// Creates a new set of frame synchronization primitives.
    ///
    /// The in-flight fence starts signaled so the first frame can proceed
    /// without waiting.
    pub fn new(backend: &dyn GpuBackend) -> RhiResult<Self> {
        let image_available = backend.create_semaphore()?;
        let render_finished = match backend.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                backend.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        // Start signaled so the first wait doesn't block forever
        let in_flight = match backend.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                backend.destroy_semaphore(render_finished);
                backend.destroy_semaphore(image_available);
                return Err(e);
            }
        };

        debug!("Created frame synchronization primitives");

        Ok(Self {
            image_available,
            render_finished,
            in_flight,
        })
    }

    /// Signaled by swapchain acquisition, waited on by the frame's submission.
    #[inline]
    pub fn image_available(&self) -> SemaphoreHandle {
        self.image_available
    }

    /// Signaled by the frame's submission, waited on by present.
    #[inline]
    pub fn render_finished(&self) -> SemaphoreHandle {
        self.render_finished
    }

    /// Signaled when the frame's submission completes.
    #[inline]
    pub fn in_flight(&self) -> FenceHandle {
        self.in_flight
    }

    /// Destroys all three objects. The fence must have been waited on.
    pub fn destroy(self, backend: &dyn GpuBackend) {
        backend.destroy_fence(self.in_flight);
        backend.destroy_semaphore(self.render_finished);
        backend.destroy_semaphore(self.image_available);
        debug!("Destroyed frame synchronization primitives");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;

    #[test]
    fn test_frame_sync_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FrameSync>();
    }

    #[test]
    fn test_frame_sync_fence_starts_signaled() {
        let backend = HeadlessBackend::new();
        let sync = FrameSync::new(&backend).unwrap();
        assert!(backend.is_fence_signaled(sync.in_flight()).unwrap());
        assert_ne!(sync.image_available(), sync.render_finished());

        sync.destroy(&backend);
        assert_eq!(backend.live_resource_count(), 0);
        assert!(backend.hazards().is_empty());
    }
}
