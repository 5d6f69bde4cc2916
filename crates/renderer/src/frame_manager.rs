//! Frame management and synchronization.
//!
//! This module provides the [`FrameRing`], which owns [`MAX_FRAMES_IN_FLIGHT`]
//! [`FrameSlot`]s and drives the per-frame protocol:
//!
//! ```text
//! begin_frame:  1. wait on the slot's fence (its previous frame retired)
//!               2. reset the fence
//!               3. acquire a swapchain image (signals image_available)
//!               4. reset the slot's command pool, hand out a recorder
//! caller:       5. write uniforms and object data through the ring
//! submit:       6. submit (waits image_available, signals render_finished + fence)
//! present:      7. present (waits render_finished)
//!               8. advance the frame counter
//! ```
//!
//! CPU writes to a slot's buffers are only accepted between steps 4 and 6,
//! which is the window in which the GPU is guaranteed not to read them.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use renderer_rhi::GpuBackend;
//! use renderer_rhi::descriptor::{DescriptorAllocator, DescriptorLayoutCache};
//! use renderer_rhi::headless::HeadlessBackend;
//! use renderer_renderer::deletion_queue::DeletionQueue;
//! use renderer_renderer::frame_manager::{BeginFrame, FrameRing, FrameTimeouts};
//!
//! # fn main() -> Result<(), renderer_renderer::RenderError> {
//! let backend: Arc<dyn GpuBackend> = Arc::new(HeadlessBackend::new());
//! let mut deletion = DeletionQueue::new("main");
//! let mut cache = DescriptorLayoutCache::new();
//! let mut allocator = DescriptorAllocator::new();
//! let mut ring = FrameRing::new(
//!     Arc::clone(&backend),
//!     &mut deletion,
//!     &mut cache,
//!     &mut allocator,
//!     16,
//!     FrameTimeouts::default(),
//! )?;
//!
//! if let BeginFrame::Ready(target) = ring.begin_frame()? {
//!     ring.submit(target.recorder.end()?)?;
//!     ring.present()?;
//! }
//!
//! ring.wait_all()?;
//! deletion.flush(backend.as_ref());
//! allocator.cleanup(backend.as_ref());
//! cache.cleanup(backend.as_ref());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytemuck::Pod;
use tracing::{debug, info, warn};

use renderer_rhi::buffer::{Buffer, BufferUsage};
use renderer_rhi::command::{CommandList, CommandRecorder};
use renderer_rhi::descriptor::{
    DescriptorAllocator, DescriptorBuilder, DescriptorLayoutCache, DescriptorType, ShaderStages,
};
use renderer_rhi::sync::FrameSync;
use renderer_rhi::{
    CommandPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, GpuBackend, PresentOutcome,
    RhiError, Submission,
};

use crate::MAX_FRAMES_IN_FLIGHT;
use crate::deletion_queue::{Deletion, DeletionQueue};
use crate::error::{RenderError, RenderResult};
use crate::ubo::ObjectData;
use crate::uniform::{UniformLayout, UniformSlot};

/// How long the ring blocks on the GPU and the presentation engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTimeouts {
    pub fence: Duration,
    pub acquire: Duration,
}

impl Default for FrameTimeouts {
    fn default() -> Self {
        Self {
            fence: Duration::from_secs(1),
            acquire: Duration::from_secs(1),
        }
    }
}

/// Resources owned by one frame in flight.
#[derive(Clone, Copy, Debug)]
pub struct FrameSlot {
    sync: FrameSync,
    command_pool: CommandPoolHandle,
    /// Per-object transforms, indexed by draw order.
    object_buffer: Buffer,
    /// Set 1: the object buffer as a storage buffer.
    object_set: DescriptorSetHandle,
}

impl FrameSlot {
    fn new(
        backend: &dyn GpuBackend,
        deletion: &mut DeletionQueue,
        cache: &mut DescriptorLayoutCache,
        allocator: &mut DescriptorAllocator,
        max_objects: u32,
    ) -> RenderResult<(Self, DescriptorSetLayoutHandle)> {
        let sync = FrameSync::new(backend)?;
        deletion.push(Deletion::Semaphore(sync.image_available()));
        deletion.push(Deletion::Semaphore(sync.render_finished()));
        deletion.push(Deletion::Fence(sync.in_flight()));

        let command_pool = backend.create_command_pool()?;
        deletion.push(Deletion::CommandPool(command_pool));

        let object_buffer = Buffer::new(
            backend,
            BufferUsage::Storage,
            u64::from(max_objects) * ObjectData::SIZE as u64,
            "object buffer",
        )?;
        deletion.push(Deletion::Buffer(object_buffer.handle()));

        let (object_set, object_layout) = DescriptorBuilder::begin(cache, allocator)
            .bind_buffer(
                0,
                object_buffer.handle(),
                0,
                object_buffer.size(),
                DescriptorType::StorageBuffer,
                ShaderStages::VERTEX,
            )
            .build(backend)?;

        Ok((
            Self {
                sync,
                command_pool,
                object_buffer,
                object_set,
            },
            object_layout,
        ))
    }

    #[inline]
    pub fn sync(&self) -> &FrameSync {
        &self.sync
    }

    #[inline]
    pub fn command_pool(&self) -> CommandPoolHandle {
        self.command_pool
    }

    #[inline]
    pub fn object_buffer(&self) -> &Buffer {
        &self.object_buffer
    }

    #[inline]
    pub fn object_set(&self) -> DescriptorSetHandle {
        self.object_set
    }
}

/// Result of [`FrameRing::begin_frame`].
#[derive(Debug)]
pub enum BeginFrame {
    /// The frame may be recorded.
    Ready(FrameTarget),
    /// No image was acquired; nothing to record this time.
    Skipped,
}

/// Where the current frame renders and how to record it.
#[derive(Debug)]
pub struct FrameTarget {
    pub image_index: u32,
    pub slot_index: usize,
    pub recorder: CommandRecorder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Recording { image_index: u32 },
    Submitted { image_index: u32 },
}

/// Ring of frame slots selected by `frame_number % MAX_FRAMES_IN_FLIGHT`.
///
/// The ring is used from the render thread only.
pub struct FrameRing {
    backend: Arc<dyn GpuBackend>,
    slots: Vec<FrameSlot>,
    object_layout: DescriptorSetLayoutHandle,
    max_objects: u32,
    frame_number: u64,
    phase: Phase,
    swapchain_dirty: bool,
    timeouts: FrameTimeouts,
}

impl FrameRing {
    /// Creates every slot up front and queues their destruction on `deletion`.
    ///
    /// # Errors
    ///
    /// Returns an error if any resource creation fails. Resources created
    /// before the failure are already on `deletion`.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        deletion: &mut DeletionQueue,
        cache: &mut DescriptorLayoutCache,
        allocator: &mut DescriptorAllocator,
        max_objects: u32,
        timeouts: FrameTimeouts,
    ) -> RenderResult<Self> {
        if max_objects == 0 {
            return Err(RhiError::InvalidUsage(
                "Frame ring needs room for at least one object".to_string(),
            )
            .into());
        }

        let mut slots = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut object_layout = None;
        for i in 0..MAX_FRAMES_IN_FLIGHT {
            let (slot, layout) =
                FrameSlot::new(backend.as_ref(), deletion, cache, allocator, max_objects)?;
            debug!("Created frame slot {}", i);
            slots.push(slot);
            object_layout = Some(layout);
        }
        let object_layout = object_layout
            .ok_or(RenderError::FrameOrder("frame ring created without slots"))?;

        info!(
            "Frame ring created with {} frames in flight, {} objects per frame",
            MAX_FRAMES_IN_FLIGHT, max_objects
        );

        Ok(Self {
            backend,
            slots,
            object_layout,
            max_objects,
            frame_number: 0,
            phase: Phase::Idle,
            swapchain_dirty: false,
            timeouts,
        })
    }

    /// Number of frames presented so far.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Index of the slot the current frame uses.
    #[inline]
    pub fn slot_index(&self) -> usize {
        (self.frame_number % MAX_FRAMES_IN_FLIGHT as u64) as usize
    }

    #[inline]
    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.slot_index()]
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    /// Layout of every slot's object set.
    #[inline]
    pub fn object_layout(&self) -> DescriptorSetLayoutHandle {
        self.object_layout
    }

    #[inline]
    pub fn max_objects(&self) -> u32 {
        self.max_objects
    }

    /// Returns true once, after an acquire or present reported the swapchain
    /// as out of date or suboptimal.
    pub fn take_swapchain_dirty(&mut self) -> bool {
        std::mem::take(&mut self.swapchain_dirty)
    }

    /// Steps 1 to 4 of the frame protocol.
    ///
    /// If acquisition fails with a recoverable error the fence is signaled
    /// again through an empty submission, so the next wait on this slot does
    /// not block, and [`BeginFrame::Skipped`] is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is already in progress, the fence wait
    /// fails, or acquisition fails with a fatal error.
    pub fn begin_frame(&mut self) -> RenderResult<BeginFrame> {
        if self.phase != Phase::Idle {
            return Err(RenderError::FrameOrder("begin_frame while a frame is in progress"));
        }
        let slot_index = self.slot_index();
        let slot = self.slots[slot_index];
        let backend = self.backend.as_ref();

        backend.wait_for_fence(slot.sync.in_flight(), self.timeouts.fence)?;
        backend.reset_fence(slot.sync.in_flight())?;

        let acquired = match backend
            .acquire_next_image(slot.sync.image_available(), self.timeouts.acquire)
        {
            Ok(acquired) => acquired,
            Err(e) if e.is_recoverable() => {
                if e == RhiError::OutOfDate {
                    debug!("Swapchain out of date during acquire");
                    self.swapchain_dirty = true;
                } else {
                    warn!("Skipping frame {}: {}", self.frame_number, e);
                }
                self.resignal_fence(&slot)?;
                return Ok(BeginFrame::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        if acquired.suboptimal {
            debug!("Swapchain suboptimal during acquire");
            self.swapchain_dirty = true;
        }

        backend.reset_command_pool(slot.command_pool)?;
        self.phase = Phase::Recording {
            image_index: acquired.index,
        };

        Ok(BeginFrame::Ready(FrameTarget {
            image_index: acquired.index,
            slot_index,
            recorder: CommandRecorder::begin(slot.command_pool),
        }))
    }

    fn resignal_fence(&self, slot: &FrameSlot) -> RenderResult<()> {
        self.backend.submit(Submission {
            commands: &CommandList::empty(slot.command_pool),
            wait_semaphores: &[],
            signal_semaphores: &[],
            signal_fence: Some(slot.sync.in_flight()),
        })?;
        Ok(())
    }

    fn recording_slot(&self) -> RenderResult<&FrameSlot> {
        match self.phase {
            Phase::Recording { .. } => Ok(self.current_slot()),
            _ => Err(RenderError::FrameOrder(
                "frame data written outside the recording window",
            )),
        }
    }

    /// Step 5: writes object transforms into the current slot's object buffer.
    ///
    /// # Errors
    ///
    /// Returns an error outside the recording window or if `objects` exceeds
    /// the buffer capacity.
    pub fn write_objects(&self, objects: &[ObjectData]) -> RenderResult<()> {
        let slot = self.recording_slot()?;
        if objects.len() > self.max_objects as usize {
            return Err(RenderError::TooManyObjects {
                count: objects.len(),
                capacity: self.max_objects,
            });
        }
        if objects.is_empty() {
            return Ok(());
        }
        slot.object_buffer
            .write(self.backend.as_ref(), 0, bytemuck::cast_slice(objects))?;
        Ok(())
    }

    /// Step 5: writes `value` into this slot's region of a dynamic uniform
    /// buffer and returns the dynamic offset to bind it with.
    ///
    /// # Errors
    ///
    /// Returns an error outside the recording window or if `slot` is not part
    /// of `layout`.
    pub fn write_uniform<T: Pod>(
        &self,
        buffer: &Buffer,
        layout: &UniformLayout,
        slot: UniformSlot,
        value: &T,
    ) -> RenderResult<u32> {
        self.recording_slot()?;
        let offset = layout
            .dynamic_offset(self.slot_index(), slot)
            .ok_or_else(|| RhiError::InvalidUsage(format!("{:?} not in uniform layout", slot)))?;
        buffer.write_pod(self.backend.as_ref(), u64::from(offset), value)?;
        Ok(offset)
    }

    /// Dynamic offset of `slot` for the current frame, without writing.
    pub fn uniform_offset(&self, layout: &UniformLayout, slot: UniformSlot) -> Option<u32> {
        layout.dynamic_offset(self.slot_index(), slot)
    }

    /// Step 6: submits the frame's commands.
    ///
    /// # Errors
    ///
    /// Returns an error if no frame is being recorded or submission fails.
    pub fn submit(&mut self, commands: CommandList) -> RenderResult<()> {
        let Phase::Recording { image_index } = self.phase else {
            return Err(RenderError::FrameOrder("submit without begin_frame"));
        };
        let slot = self.current_slot();
        if commands.pool() != slot.command_pool {
            return Err(RenderError::FrameOrder(
                "submitted commands were not recorded for this slot",
            ));
        }

        self.backend.submit(Submission {
            commands: &commands,
            wait_semaphores: &[slot.sync.image_available()],
            signal_semaphores: &[slot.sync.render_finished()],
            signal_fence: Some(slot.sync.in_flight()),
        })?;
        self.phase = Phase::Submitted { image_index };
        Ok(())
    }

    /// Gives up on a frame that was begun but could not be submitted.
    ///
    /// Consumes the acquired image's semaphore and signals the slot's fence
    /// with an empty submission so the slot can be reused. The frame counter
    /// does not advance. Does nothing when no frame is being recorded.
    pub fn abandon_frame(&mut self) -> RenderResult<()> {
        let Phase::Recording { image_index } = self.phase else {
            return Ok(());
        };
        let slot = *self.current_slot();
        warn!("Abandoning frame {} (image {})", self.frame_number, image_index);

        self.phase = Phase::Idle;
        self.backend.submit(Submission {
            commands: &CommandList::empty(slot.command_pool),
            wait_semaphores: &[slot.sync.image_available()],
            signal_semaphores: &[],
            signal_fence: Some(slot.sync.in_flight()),
        })?;
        Ok(())
    }

    /// Requests swapchain recreation before the next frame.
    pub fn mark_swapchain_dirty(&mut self) {
        self.swapchain_dirty = true;
    }

    /// Steps 7 and 8: presents and advances to the next slot.
    ///
    /// An out-of-date or suboptimal swapchain marks the ring dirty instead of
    /// failing; the frame still counts as done.
    pub fn present(&mut self) -> RenderResult<()> {
        let Phase::Submitted { image_index } = self.phase else {
            return Err(RenderError::FrameOrder("present without submit"));
        };
        let slot = *self.current_slot();

        let result = self
            .backend
            .present(image_index, slot.sync.render_finished());
        self.phase = Phase::Idle;
        self.frame_number += 1;

        match result {
            Ok(PresentOutcome::Presented) => Ok(()),
            Ok(PresentOutcome::Suboptimal) => {
                debug!("Swapchain suboptimal during present");
                self.swapchain_dirty = true;
                Ok(())
            }
            Err(RhiError::OutOfDate) => {
                debug!("Swapchain out of date during present");
                self.swapchain_dirty = true;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Waits until every slot's last submission has finished.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is mid-flight or a wait fails.
    pub fn wait_all(&self) -> RenderResult<()> {
        if self.phase != Phase::Idle {
            return Err(RenderError::FrameOrder("wait_all while a frame is in progress"));
        }
        for slot in &self.slots {
            self.backend
                .wait_for_fence(slot.sync.in_flight(), self.timeouts.fence)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderer_rhi::headless::{Event, HeadlessBackend};

    struct Fixture {
        backend: Arc<HeadlessBackend>,
        deletion: DeletionQueue,
        cache: DescriptorLayoutCache,
        allocator: DescriptorAllocator,
        ring: FrameRing,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = Arc::new(HeadlessBackend::new());
            let mut deletion = DeletionQueue::new("test");
            let mut cache = DescriptorLayoutCache::new();
            let mut allocator = DescriptorAllocator::new();
            let ring = FrameRing::new(
                backend.clone(),
                &mut deletion,
                &mut cache,
                &mut allocator,
                4,
                FrameTimeouts::default(),
            )
            .unwrap();
            Self {
                backend,
                deletion,
                cache,
                allocator,
                ring,
            }
        }

        fn run_frame(&mut self, objects: &[ObjectData]) {
            let BeginFrame::Ready(target) = self.ring.begin_frame().unwrap() else {
                panic!("frame skipped");
            };
            self.ring.write_objects(objects).unwrap();
            self.ring.submit(target.recorder.end().unwrap()).unwrap();
            self.ring.present().unwrap();
        }

        fn finish(mut self) {
            self.ring.wait_all().unwrap();
            self.deletion.flush(self.backend.as_ref());
            self.allocator.cleanup(self.backend.as_ref());
            self.cache.cleanup(self.backend.as_ref());
            assert_eq!(self.backend.live_resource_count(), 0);
        }
    }

    #[test]
    fn test_max_frames_in_flight_constant() {
        assert_eq!(MAX_FRAMES_IN_FLIGHT, 2);
    }

    #[test]
    fn test_slots_share_object_layout() {
        let fixture = Fixture::new();
        assert_eq!(fixture.ring.slots().len(), MAX_FRAMES_IN_FLIGHT);
        assert_eq!(fixture.cache.len(), 1);
        let sets: Vec<_> = fixture.ring.slots().iter().map(|s| s.object_set()).collect();
        assert_ne!(sets[0], sets[1]);
        fixture.finish();
    }

    #[test]
    fn test_protocol_order_within_frame() {
        let mut fixture = Fixture::new();
        fixture.backend.clear_events();
        fixture.run_frame(&[ObjectData::default()]);

        let slot = fixture.ring.slots()[0];
        let events = fixture.backend.events();
        assert!(matches!(events[0], Event::FenceWaited(f) if f == slot.sync().in_flight()));
        assert!(matches!(events[1], Event::FenceReset(f) if f == slot.sync().in_flight()));
        assert!(matches!(events[2], Event::ImageAcquired(_)));
        assert!(matches!(events[3], Event::CommandPoolReset(p) if p == slot.command_pool()));
        assert!(matches!(events[4], Event::BufferWritten { .. }));
        assert!(matches!(
            events[5],
            Event::Submitted { fence: Some(f), .. } if f == slot.sync().in_flight()
        ));
        assert!(matches!(events[6], Event::Presented(_)));
        fixture.finish();
    }

    #[test]
    fn test_ring_alternates_slots_without_hazards() {
        let mut fixture = Fixture::new();
        let objects = [ObjectData::default(); 4];
        for frame in 0..(4 * MAX_FRAMES_IN_FLIGHT as u64) {
            assert_eq!(fixture.ring.slot_index(), (frame % 2) as usize);
            fixture.run_frame(&objects);
        }
        assert_eq!(fixture.ring.frame_number(), 8);
        assert!(fixture.backend.hazards().is_empty());
        fixture.finish();
    }

    #[test]
    fn test_writes_rejected_outside_recording_window() {
        let mut fixture = Fixture::new();
        assert!(matches!(
            fixture.ring.write_objects(&[ObjectData::default()]),
            Err(RenderError::FrameOrder(_))
        ));

        let BeginFrame::Ready(target) = fixture.ring.begin_frame().unwrap() else {
            panic!("frame skipped");
        };
        fixture.ring.submit(target.recorder.end().unwrap()).unwrap();
        assert!(matches!(
            fixture.ring.write_objects(&[ObjectData::default()]),
            Err(RenderError::FrameOrder(_))
        ));
        fixture.ring.present().unwrap();
        assert!(fixture.backend.hazards().is_empty());
        fixture.finish();
    }

    #[test]
    fn test_too_many_objects() {
        let mut fixture = Fixture::new();
        let BeginFrame::Ready(target) = fixture.ring.begin_frame().unwrap() else {
            panic!("frame skipped");
        };
        let err = fixture.ring.write_objects(&[ObjectData::default(); 5]).unwrap_err();
        assert!(matches!(err, RenderError::TooManyObjects { count: 5, capacity: 4 }));
        fixture.ring.submit(target.recorder.end().unwrap()).unwrap();
        fixture.ring.present().unwrap();
        fixture.finish();
    }

    #[test]
    fn test_out_of_date_acquire_skips_and_resignals() {
        let mut fixture = Fixture::new();
        fixture.backend.fail_next_acquire(RhiError::OutOfDate);

        assert!(matches!(fixture.ring.begin_frame().unwrap(), BeginFrame::Skipped));
        assert!(fixture.ring.take_swapchain_dirty());
        assert!(!fixture.ring.take_swapchain_dirty());
        assert_eq!(fixture.ring.frame_number(), 0);

        // Same slot again; its fence was re-signaled so the wait succeeds
        fixture.run_frame(&[]);
        fixture.run_frame(&[]);
        assert!(fixture.backend.hazards().is_empty());
        fixture.finish();
    }

    #[test]
    fn test_out_of_date_present_marks_dirty() {
        let mut fixture = Fixture::new();
        fixture.backend.fail_next_present(RhiError::OutOfDate);
        fixture.run_frame(&[]);
        assert!(fixture.ring.take_swapchain_dirty());
        assert_eq!(fixture.ring.frame_number(), 1);

        fixture.run_frame(&[]);
        fixture.run_frame(&[]);
        assert!(fixture.backend.hazards().is_empty());
        fixture.finish();
    }

    #[test]
    fn test_fatal_acquire_propagates() {
        let mut fixture = Fixture::new();
        fixture
            .backend
            .fail_next_acquire(RhiError::DeviceLost("gone".to_string()));
        let err = fixture.ring.begin_frame().unwrap_err();
        assert!(err.is_fatal());
        // Leave the ring in a state the fixture can tear down
        fixture.ring.resignal_fence(&fixture.ring.slots()[0]).unwrap();
        fixture.finish();
    }

    #[test]
    fn test_abandoned_frame_leaves_slot_reusable() {
        let mut fixture = Fixture::new();
        let BeginFrame::Ready(target) = fixture.ring.begin_frame().unwrap() else {
            panic!("frame skipped");
        };
        drop(target);
        fixture.ring.abandon_frame().unwrap();
        assert_eq!(fixture.ring.frame_number(), 0);
        // No-op when idle
        fixture.ring.abandon_frame().unwrap();

        for _ in 0..3 {
            fixture.run_frame(&[ObjectData::default()]);
        }
        assert!(fixture.backend.hazards().is_empty());
        fixture.finish();
    }

    #[test]
    fn test_submit_and_present_need_begin() {
        let mut fixture = Fixture::new();
        let pool = fixture.ring.current_slot().command_pool();
        assert!(fixture.ring.submit(CommandList::empty(pool)).is_err());
        assert!(fixture.ring.present().is_err());
        fixture.finish();
    }
}
