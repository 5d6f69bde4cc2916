//! Headless GPU backend.
//!
//! [`HeadlessBackend`] implements [`GpuBackend`] entirely on the CPU. It keeps
//! buffer and image contents, executes copies, tracks image layouts and
//! simulates an asynchronous GPU timeline:
//!
//! - every submission gets a sequence number and stays *in flight* until the
//!   CPU observes its completion through a fence wait, a signaled fence query
//!   or [`wait_idle`](GpuBackend::wait_idle)
//! - the queue completes in order, so observing submission `n` retires every
//!   submission up to `n`
//!
//! Anything the CPU does that would race the GPU on real hardware is recorded
//! as a [`Hazard`] instead of failing the call, so a test can drive many frames
//! and inspect [`hazards`](HeadlessBackend::hazards) afterwards.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::backend::{AcquiredImage, DeviceLimits, GpuBackend, PresentOutcome, Submission};
use crate::buffer::{BufferDesc, BufferUsage};
use crate::command::Command;
use crate::descriptor::{
    DescriptorBinding, DescriptorPoolSize, DescriptorResource, DescriptorType, DescriptorWrite,
};
use crate::error::{RhiError, RhiResult};
use crate::handle::{
    BufferHandle, CommandPoolHandle, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, FenceHandle, ImageHandle, PipelineHandle, PipelineLayoutHandle,
    SamplerHandle, SemaphoreHandle, ShaderModuleHandle,
};
use crate::image::{Extent2D, ImageDesc, ImageFormat, ImageLayout, SamplerDesc};
use crate::pipeline::{GraphicsPipelineDesc, PipelineLayoutDesc};
use crate::shader::ShaderCode;

/// A CPU/GPU race or API misuse detected by the headless backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Hazard {
    #[error("CPU wrote {buffer:?} bytes {range:?} while submission #{submission} still reads them")]
    WriteWhileInFlight {
        buffer: BufferHandle,
        range: Range<u64>,
        submission: u64,
    },

    #[error("{pool:?} reset while submission #{submission} still executes from it")]
    CommandPoolResetInFlight {
        pool: CommandPoolHandle,
        submission: u64,
    },

    #[error("{fence:?} reset while its submission #{submission} is unobserved")]
    FenceResetInFlight { fence: FenceHandle, submission: u64 },

    #[error("{fence:?} submitted while already signaled")]
    FenceAlreadySignaled { fence: FenceHandle },

    #[error("Wait on unsignaled {semaphore:?}")]
    UnsignaledSemaphoreWait { semaphore: SemaphoreHandle },

    #[error("{semaphore:?} signaled again before being waited on")]
    SemaphoreSignaledTwice { semaphore: SemaphoreHandle },

    #[error("{resource} destroyed while submission #{submission} uses it")]
    DestroyedInFlight { resource: String, submission: u64 },

    #[error("{resource} destroyed twice or never created")]
    DoubleDestroy { resource: String },

    #[error("{set:?} updated while submission #{submission} uses it")]
    DescriptorSetUpdatedInFlight {
        set: DescriptorSetHandle,
        submission: u64,
    },

    #[error("{pool:?} reset while submission #{submission} uses one of its sets")]
    DescriptorPoolResetInFlight {
        pool: DescriptorPoolHandle,
        submission: u64,
    },

    #[error("{image:?} mip {mip_level} is in {actual:?}, command expects {expected:?}")]
    ImageLayoutMismatch {
        image: ImageHandle,
        mip_level: u32,
        expected: ImageLayout,
        actual: ImageLayout,
    },

    #[error("Dynamic offset {offset} for {set:?} binding {binding}: {reason}")]
    BadDynamicOffset {
        set: DescriptorSetHandle,
        binding: u32,
        offset: u32,
        reason: String,
    },

    #[error("Swapchain recreated while submission #{submission} is in flight")]
    RecreateWhileInFlight { submission: u64 },
}

/// Observable backend activity, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    FenceWaited(FenceHandle),
    FenceReset(FenceHandle),
    ImageAcquired(u32),
    CommandPoolReset(CommandPoolHandle),
    BufferWritten {
        buffer: BufferHandle,
        offset: u64,
        len: u64,
    },
    Submitted {
        submission: u64,
        pool: CommandPoolHandle,
        fence: Option<FenceHandle>,
    },
    Presented(u32),
    SwapchainRecreated(Extent2D),
    Destroyed(String),
}

#[derive(Debug)]
struct BufferState {
    desc: BufferDesc,
    data: Vec<u8>,
    last_use: u64,
}

#[derive(Debug)]
struct ImageState {
    desc: ImageDesc,
    layouts: Vec<ImageLayout>,
    mips: Vec<Option<Vec<u8>>>,
    last_use: u64,
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    pending: Option<u64>,
}

#[derive(Debug)]
struct DescriptorPoolState {
    max_sets: u32,
    capacity: HashMap<DescriptorType, u32>,
    remaining: HashMap<DescriptorType, u32>,
    sets: Vec<DescriptorSetHandle>,
}

#[derive(Debug)]
struct DescriptorSetState {
    layout: DescriptorSetLayoutHandle,
    writes: BTreeMap<u32, DescriptorWrite>,
    last_use: u64,
}

#[derive(Debug)]
struct Span {
    submission: u64,
    buffer: BufferHandle,
    range: Range<u64>,
}

#[derive(Debug, Default)]
struct Faults {
    acquire: Option<RhiError>,
    present: Option<RhiError>,
    fence_wait: Option<RhiError>,
}

#[derive(Debug)]
struct State {
    limits: DeviceLimits,
    next_id: u64,
    next_submission: u64,
    retired: u64,

    buffers: HashMap<BufferHandle, BufferState>,
    images: HashMap<ImageHandle, ImageState>,
    samplers: HashMap<SamplerHandle, SamplerDesc>,
    shader_modules: HashMap<ShaderModuleHandle, usize>,
    pipeline_layouts: HashMap<PipelineLayoutHandle, PipelineLayoutDesc>,
    pipelines: HashMap<PipelineHandle, u64>,
    set_layouts: HashMap<DescriptorSetLayoutHandle, Vec<DescriptorBinding>>,
    descriptor_pools: HashMap<DescriptorPoolHandle, DescriptorPoolState>,
    descriptor_sets: HashMap<DescriptorSetHandle, DescriptorSetState>,
    command_pools: HashMap<CommandPoolHandle, u64>,
    fences: HashMap<FenceHandle, FenceState>,
    semaphores: HashMap<SemaphoreHandle, bool>,

    spans: Vec<Span>,
    surface_extent: Extent2D,
    swapchain_extent: Extent2D,
    swapchain_image_count: u32,
    next_image: u32,
    draw_count: u64,

    faults: Faults,
    hazards: Vec<Hazard>,
    events: Vec<Event>,
    record_events: bool,
}

impl State {
    fn new(extent: Extent2D, limits: DeviceLimits) -> Self {
        Self {
            limits,
            next_id: 1,
            next_submission: 1,
            retired: 0,
            buffers: HashMap::new(),
            images: HashMap::new(),
            samplers: HashMap::new(),
            shader_modules: HashMap::new(),
            pipeline_layouts: HashMap::new(),
            pipelines: HashMap::new(),
            set_layouts: HashMap::new(),
            descriptor_pools: HashMap::new(),
            descriptor_sets: HashMap::new(),
            command_pools: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            spans: Vec::new(),
            surface_extent: extent,
            swapchain_extent: extent,
            swapchain_image_count: 3,
            next_image: 0,
            draw_count: 0,
            faults: Faults::default(),
            hazards: Vec::new(),
            events: Vec::new(),
            record_events: true,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn hazard(&mut self, hazard: Hazard) {
        warn!("GPU hazard: {}", hazard);
        self.hazards.push(hazard);
    }

    fn event(&mut self, event: Event) {
        if self.record_events {
            self.events.push(event);
        }
    }

    /// The submission that still uses a resource last used by `last_use`, if any.
    fn in_flight(&self, last_use: u64) -> Option<u64> {
        (last_use > self.retired).then_some(last_use)
    }

    fn retire(&mut self, submission: u64) {
        if submission <= self.retired {
            return;
        }
        self.retired = submission;
        let retired = self.retired;
        self.spans.retain(|span| span.submission > retired);
        for fence in self.fences.values_mut() {
            if let Some(pending) = fence.pending
                && pending <= retired
            {
                fence.pending = None;
                fence.signaled = true;
            }
        }
        trace!("Retired submissions up to #{}", retired);
    }

    fn destroyed(&mut self, resource: String, last_use: Option<u64>) {
        match last_use {
            None => self.hazard(Hazard::DoubleDestroy { resource }),
            Some(last_use) => {
                if let Some(submission) = self.in_flight(last_use) {
                    self.hazard(Hazard::DestroyedInFlight {
                        resource: resource.clone(),
                        submission,
                    });
                }
                self.event(Event::Destroyed(resource));
            }
        }
    }

    fn take_dynamic_offset(
        &mut self,
        set: DescriptorSetHandle,
        binding: u32,
        offsets: &mut std::slice::Iter<'_, u32>,
    ) -> Option<u32> {
        let offset = offsets.next().copied();
        if offset.is_none() {
            self.hazard(Hazard::BadDynamicOffset {
                set,
                binding,
                offset: 0,
                reason: "no offset supplied".to_string(),
            });
        }
        offset
    }

    /// Checks handles and bounds before any state changes.
    fn validate_submission(&self, submission: &Submission<'_>) -> RhiResult<()> {
        let list = submission.commands;
        if !self.command_pools.contains_key(&list.pool()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", list.pool())));
        }
        if let Some(fence) = submission.signal_fence
            && !self.fences.contains_key(&fence)
        {
            return Err(RhiError::InvalidHandle(format!("{:?}", fence)));
        }
        for semaphore in submission
            .wait_semaphores
            .iter()
            .chain(submission.signal_semaphores)
        {
            if !self.semaphores.contains_key(semaphore) {
                return Err(RhiError::InvalidHandle(format!("{:?}", semaphore)));
            }
        }

        for command in list.commands() {
            match command {
                Command::BeginRendering(info) => {
                    if info.image_index >= self.swapchain_image_count {
                        return Err(RhiError::InvalidUsage(format!(
                            "Swapchain image {} out of range",
                            info.image_index
                        )));
                    }
                    if let Some(depth) = info.depth {
                        self.image(depth)?;
                    }
                }
                Command::BindPipeline(pipeline) => {
                    if !self.pipelines.contains_key(pipeline) {
                        return Err(RhiError::InvalidHandle(format!("{:?}", pipeline)));
                    }
                }
                Command::BindDescriptorSets { layout, sets, .. } => {
                    if !self.pipeline_layouts.contains_key(layout) {
                        return Err(RhiError::InvalidHandle(format!("{:?}", layout)));
                    }
                    for set in sets {
                        if !self.descriptor_sets.contains_key(set) {
                            return Err(RhiError::InvalidHandle(format!("{:?}", set)));
                        }
                    }
                }
                Command::PushConstants { layout, .. } => {
                    if !self.pipeline_layouts.contains_key(layout) {
                        return Err(RhiError::InvalidHandle(format!("{:?}", layout)));
                    }
                }
                Command::BindVertexBuffer { buffer, offset }
                | Command::BindIndexBuffer { buffer, offset, .. } => {
                    let state = self.buffer(*buffer)?;
                    if *offset >= state.desc.size {
                        return Err(RhiError::InvalidUsage(format!(
                            "Bind offset {} past end of {:?}",
                            offset, buffer
                        )));
                    }
                }
                Command::CopyBuffer { src, dst, regions } => {
                    let src_size = self.buffer(*src)?.desc.size;
                    let dst_size = self.buffer(*dst)?.desc.size;
                    for region in regions {
                        if region.src_offset + region.size > src_size
                            || region.dst_offset + region.size > dst_size
                        {
                            return Err(RhiError::InvalidUsage(format!(
                                "Copy region {:?} out of bounds ({} -> {} bytes)",
                                region, src_size, dst_size
                            )));
                        }
                    }
                }
                Command::CopyBufferToImage {
                    src, dst, regions, ..
                } => {
                    let src_size = self.buffer(*src)?.desc.size;
                    let image = self.image(*dst)?;
                    for region in regions {
                        if region.mip_level >= image.desc.mip_levels {
                            return Err(RhiError::InvalidUsage(format!(
                                "Mip {} out of range for {:?}",
                                region.mip_level, dst
                            )));
                        }
                        let expected = image.desc.extent.mip(region.mip_level);
                        if region.extent != expected {
                            return Err(RhiError::InvalidUsage(format!(
                                "Copy extent {:?} does not match mip {} extent {:?}",
                                region.extent, region.mip_level, expected
                            )));
                        }
                        let size = mip_byte_size(region.extent, image.desc.format);
                        if region.buffer_offset + size > src_size {
                            return Err(RhiError::InvalidUsage(format!(
                                "Image copy reads past end of {:?}",
                                src
                            )));
                        }
                    }
                }
                Command::PipelineBarrier(barriers) => {
                    for barrier in barriers {
                        let image = self.image(barrier.image)?;
                        if barrier.base_mip_level + barrier.level_count > image.desc.mip_levels {
                            return Err(RhiError::InvalidUsage(format!(
                                "Barrier mips {}..{} out of range for {:?}",
                                barrier.base_mip_level,
                                barrier.base_mip_level + barrier.level_count,
                                barrier.image
                            )));
                        }
                    }
                }
                Command::EndRendering
                | Command::SetViewport(_)
                | Command::SetScissor(_)
                | Command::Draw { .. }
                | Command::DrawIndexed { .. } => {}
            }
        }
        Ok(())
    }

    fn buffer(&self, buffer: BufferHandle) -> RhiResult<&BufferState> {
        self.buffers
            .get(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", buffer)))
    }

    fn image(&self, image: ImageHandle) -> RhiResult<&ImageState> {
        self.images
            .get(&image)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", image)))
    }

    fn read_span(&mut self, submission: u64, buffer: BufferHandle, range: Range<u64>) {
        if let Some(state) = self.buffers.get_mut(&buffer) {
            state.last_use = submission;
        }
        self.spans.push(Span {
            submission,
            buffer,
            range,
        });
    }

    fn bind_descriptor_sets(
        &mut self,
        submission: u64,
        sets: &[DescriptorSetHandle],
        dynamic_offsets: &[u32],
    ) {
        let mut offsets = dynamic_offsets.iter();
        for &set in sets {
            let writes: Vec<DescriptorWrite> = match self.descriptor_sets.get_mut(&set) {
                Some(state) => {
                    state.last_use = submission;
                    state.writes.values().copied().collect()
                }
                None => continue,
            };

            for write in writes {
                match write.resource {
                    DescriptorResource::Buffer {
                        buffer,
                        offset,
                        range,
                    } => {
                        let start = if write.descriptor_type.is_dynamic() {
                            let Some(dynamic) =
                                self.take_dynamic_offset(set, write.binding, &mut offsets)
                            else {
                                continue;
                            };
                            let alignment = match write.descriptor_type {
                                DescriptorType::UniformBufferDynamic => {
                                    self.limits.min_uniform_buffer_offset_alignment
                                }
                                _ => self.limits.min_storage_buffer_offset_alignment,
                            };
                            if !(dynamic as u64).is_multiple_of(alignment) {
                                self.hazard(Hazard::BadDynamicOffset {
                                    set,
                                    binding: write.binding,
                                    offset: dynamic,
                                    reason: format!("not a multiple of {}", alignment),
                                });
                            }
                            offset + dynamic as u64
                        } else {
                            offset
                        };

                        let size = self.buffers.get(&buffer).map_or(0, |b| b.desc.size);
                        if start + range > size {
                            self.hazard(Hazard::BadDynamicOffset {
                                set,
                                binding: write.binding,
                                offset: (start - offset) as u32,
                                reason: format!(
                                    "range {}..{} past end of {} byte buffer",
                                    start,
                                    start + range,
                                    size
                                ),
                            });
                        }
                        self.read_span(submission, buffer, start..start + range);
                    }
                    DescriptorResource::Image { image, .. } => {
                        if let Some(state) = self.images.get_mut(&image) {
                            state.last_use = submission;
                        }
                    }
                }
            }
        }

        let extra = offsets.len();
        if extra > 0 {
            warn!("{} unused dynamic offset(s) in descriptor bind", extra);
        }
    }

    fn check_layout(&mut self, image: ImageHandle, mip_level: u32, expected: ImageLayout) {
        let actual = self
            .images
            .get(&image)
            .and_then(|state| state.layouts.get(mip_level as usize).copied());
        if let Some(actual) = actual
            && actual != expected
        {
            self.hazard(Hazard::ImageLayoutMismatch {
                image,
                mip_level,
                expected,
                actual,
            });
        }
    }

    fn execute(&mut self, submission: u64, command: &Command) {
        match command {
            Command::BeginRendering(info) => {
                if let Some(depth) = info.depth {
                    if let Some(state) = self.images.get_mut(&depth) {
                        state.last_use = submission;
                    }
                    self.check_layout(depth, 0, ImageLayout::DepthAttachment);
                }
            }
            Command::BindPipeline(pipeline) => {
                if let Some(last_use) = self.pipelines.get_mut(pipeline) {
                    *last_use = submission;
                }
            }
            Command::BindDescriptorSets {
                sets,
                dynamic_offsets,
                ..
            } => self.bind_descriptor_sets(submission, sets, dynamic_offsets),
            Command::BindVertexBuffer { buffer, offset }
            | Command::BindIndexBuffer { buffer, offset, .. } => {
                let size = self.buffers.get(buffer).map_or(0, |b| b.desc.size);
                self.read_span(submission, *buffer, *offset..size);
            }
            Command::Draw { .. } | Command::DrawIndexed { .. } => self.draw_count += 1,
            Command::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let src_range = region.src_offset..region.src_offset + region.size;
                    let dst_range = region.dst_offset..region.dst_offset + region.size;
                    let bytes = self
                        .buffers
                        .get(src)
                        .map(|b| b.data[src_range.start as usize..src_range.end as usize].to_vec())
                        .unwrap_or_default();
                    if let Some(state) = self.buffers.get_mut(dst) {
                        state.data[dst_range.start as usize..dst_range.end as usize]
                            .copy_from_slice(&bytes);
                    }
                    self.read_span(submission, *src, src_range);
                    self.read_span(submission, *dst, dst_range);
                }
            }
            Command::CopyBufferToImage {
                src,
                dst,
                dst_layout,
                regions,
            } => {
                for region in regions {
                    self.check_layout(*dst, region.mip_level, *dst_layout);
                    if *dst_layout != ImageLayout::TransferDst {
                        self.hazard(Hazard::ImageLayoutMismatch {
                            image: *dst,
                            mip_level: region.mip_level,
                            expected: ImageLayout::TransferDst,
                            actual: *dst_layout,
                        });
                    }

                    let Some(format) = self.images.get(dst).map(|i| i.desc.format) else {
                        continue;
                    };
                    let size = mip_byte_size(region.extent, format);
                    let range = region.buffer_offset..region.buffer_offset + size;
                    let bytes = self
                        .buffers
                        .get(src)
                        .map(|b| b.data[range.start as usize..range.end as usize].to_vec())
                        .unwrap_or_default();
                    if let Some(image) = self.images.get_mut(dst) {
                        image.last_use = submission;
                        image.mips[region.mip_level as usize] = Some(bytes);
                    }
                    self.read_span(submission, *src, range);
                }
            }
            Command::PipelineBarrier(barriers) => {
                for barrier in barriers {
                    let first = barrier.base_mip_level;
                    for level in first..first + barrier.level_count {
                        if barrier.old_layout != ImageLayout::Undefined {
                            self.check_layout(barrier.image, level, barrier.old_layout);
                        }
                        if let Some(image) = self.images.get_mut(&barrier.image) {
                            image.layouts[level as usize] = barrier.new_layout;
                            image.last_use = submission;
                        }
                    }
                }
            }
            Command::EndRendering
            | Command::SetViewport(_)
            | Command::SetScissor(_)
            | Command::PushConstants { .. } => {}
        }
    }

    fn live_count(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.samplers.len()
            + self.shader_modules.len()
            + self.pipeline_layouts.len()
            + self.pipelines.len()
            + self.set_layouts.len()
            + self.descriptor_pools.len()
            + self.command_pools.len()
            + self.fences.len()
            + self.semaphores.len()
    }
}

fn mip_byte_size(extent: Extent2D, format: ImageFormat) -> u64 {
    extent.width as u64 * extent.height as u64 * format.bytes_per_pixel() as u64
}

/// A CPU-only [`GpuBackend`] that records hazards.
///
/// # Example
///
/// ```
/// use renderer_rhi::GpuBackend;
/// use renderer_rhi::buffer::{BufferDesc, BufferUsage};
/// use renderer_rhi::headless::HeadlessBackend;
///
/// let backend = HeadlessBackend::new();
/// let buffer = backend
///     .create_buffer(&BufferDesc::new(BufferUsage::Uniform, 64, "camera"))
///     .unwrap();
/// backend.write_buffer(buffer, 0, &[1, 2, 3, 4]).unwrap();
/// assert_eq!(&backend.buffer_contents(buffer).unwrap()[..4], &[1, 2, 3, 4]);
/// assert!(backend.hazards().is_empty());
/// ```
#[derive(Debug)]
pub struct HeadlessBackend {
    state: Mutex<State>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// Creates a backend with an 800x600 surface and default limits.
    pub fn new() -> Self {
        Self::with_surface(Extent2D::new(800, 600), DeviceLimits::default())
    }

    pub fn with_surface(extent: Extent2D, limits: DeviceLimits) -> Self {
        debug!(
            "Headless backend created ({}x{}, uniform alignment {})",
            extent.width, extent.height, limits.min_uniform_buffer_offset_alignment
        );
        Self {
            state: Mutex::new(State::new(extent, limits)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every hazard recorded so far.
    pub fn hazards(&self) -> Vec<Hazard> {
        self.state().hazards.clone()
    }

    /// Returns and clears the recorded hazards.
    pub fn take_hazards(&self) -> Vec<Hazard> {
        std::mem::take(&mut self.state().hazards)
    }

    /// Every event recorded so far.
    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Turns event recording on or off. Long runs turn it off.
    pub fn set_record_events(&self, record: bool) {
        self.state().record_events = record;
    }

    /// Current contents of a buffer.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state().buffers.get(&buffer).map(|b| b.data.clone())
    }

    /// Bytes last copied into one mip level of an image.
    pub fn image_mip(&self, image: ImageHandle, mip_level: u32) -> Option<Vec<u8>> {
        self.state()
            .images
            .get(&image)
            .and_then(|i| i.mips.get(mip_level as usize).cloned().flatten())
    }

    pub fn image_layout(&self, image: ImageHandle, mip_level: u32) -> Option<ImageLayout> {
        self.state()
            .images
            .get(&image)
            .and_then(|i| i.layouts.get(mip_level as usize).copied())
    }

    /// Writes recorded for a descriptor set, ordered by binding.
    pub fn descriptor_bindings(&self, set: DescriptorSetHandle) -> Vec<DescriptorWrite> {
        self.state()
            .descriptor_sets
            .get(&set)
            .map(|s| s.writes.values().copied().collect())
            .unwrap_or_default()
    }

    /// Objects created and not yet destroyed. Descriptor sets are not counted.
    pub fn live_resource_count(&self) -> usize {
        self.state().live_count()
    }

    /// Submissions made so far.
    pub fn submission_count(&self) -> u64 {
        self.state().next_submission - 1
    }

    /// Submissions whose completion the CPU has not observed yet.
    pub fn in_flight_count(&self) -> u64 {
        let state = self.state();
        state.next_submission - 1 - state.retired
    }

    /// Draw commands executed so far.
    pub fn draw_count(&self) -> u64 {
        self.state().draw_count
    }

    /// Simulates a window resize. The next acquire reports out-of-date.
    pub fn resize_surface(&self, extent: Extent2D) {
        self.state().surface_extent = extent;
    }

    pub fn swapchain_extent(&self) -> Extent2D {
        self.state().swapchain_extent
    }

    /// Makes the next acquire fail with `error`.
    pub fn fail_next_acquire(&self, error: RhiError) {
        self.state().faults.acquire = Some(error);
    }

    /// Makes the next present fail with `error`.
    pub fn fail_next_present(&self, error: RhiError) {
        self.state().faults.present = Some(error);
    }

    /// Makes the next fence wait fail with `error`.
    pub fn fail_next_fence_wait(&self, error: RhiError) {
        self.state().faults.fence_wait = Some(error);
    }
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn limits(&self) -> DeviceLimits {
        self.state().limits
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<BufferHandle> {
        if desc.size == 0 {
            return Err(RhiError::InvalidUsage(format!(
                "Buffer '{}' has zero size",
                desc.label
            )));
        }
        let mut state = self.state();
        let handle = BufferHandle::from_raw(state.next_id());
        state.buffers.insert(
            handle,
            BufferState {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
                last_use: 0,
            },
        );
        trace!("Created {:?} '{}' ({} bytes)", handle, desc.label, desc.size);
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state();
        let (size, usage) = {
            let b = state.buffer(buffer)?;
            (b.desc.size, b.desc.usage)
        };
        if !usage.is_host_visible() {
            return Err(RhiError::InvalidUsage(format!(
                "{:?} ({} buffer) is not mapped",
                buffer,
                usage.name()
            )));
        }
        let end = offset + data.len() as u64;
        if end > size {
            return Err(RhiError::InvalidUsage(format!(
                "Write {}..{} past end of {:?} ({} bytes)",
                offset, end, buffer, size
            )));
        }

        let retired = state.retired;
        let conflict = state
            .spans
            .iter()
            .find(|s| {
                s.buffer == buffer
                    && s.submission > retired
                    && s.range.start < end
                    && offset < s.range.end
            })
            .map(|s| s.submission);
        if let Some(submission) = conflict {
            state.hazard(Hazard::WriteWhileInFlight {
                buffer,
                range: offset..end,
                submission,
            });
        }

        if let Some(b) = state.buffers.get_mut(&buffer) {
            b.data[offset as usize..end as usize].copy_from_slice(data);
        }
        state.event(Event::BufferWritten {
            buffer,
            offset,
            len: data.len() as u64,
        });
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state();
        let last_use = state.buffers.remove(&buffer).map(|b| b.last_use);
        state.destroyed(format!("{:?}", buffer), last_use);
    }

    fn create_image(&self, desc: &ImageDesc) -> RhiResult<ImageHandle> {
        desc.validate()?;
        let mut state = self.state();
        let handle = ImageHandle::from_raw(state.next_id());
        state.images.insert(
            handle,
            ImageState {
                desc: desc.clone(),
                layouts: vec![ImageLayout::Undefined; desc.mip_levels as usize],
                mips: vec![None; desc.mip_levels as usize],
                last_use: 0,
            },
        );
        trace!(
            "Created {:?} '{}' ({}x{}, {} mips)",
            handle, desc.label, desc.extent.width, desc.extent.height, desc.mip_levels
        );
        Ok(handle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        let mut state = self.state();
        let last_use = state.images.remove(&image).map(|i| i.last_use);
        state.destroyed(format!("{:?}", image), last_use);
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> RhiResult<SamplerHandle> {
        let mut state = self.state();
        let handle = SamplerHandle::from_raw(state.next_id());
        state.samplers.insert(handle, *desc);
        Ok(handle)
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        let mut state = self.state();
        let last_use = state.samplers.remove(&sampler).map(|_| 0);
        state.destroyed(format!("{:?}", sampler), last_use);
    }

    fn create_shader_module(&self, code: &ShaderCode) -> RhiResult<ShaderModuleHandle> {
        let mut state = self.state();
        let handle = ShaderModuleHandle::from_raw(state.next_id());
        state.shader_modules.insert(handle, code.words().len());
        Ok(handle)
    }

    fn destroy_shader_module(&self, module: ShaderModuleHandle) {
        let mut state = self.state();
        let last_use = state.shader_modules.remove(&module).map(|_| 0);
        state.destroyed(format!("{:?}", module), last_use);
    }

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> RhiResult<PipelineLayoutHandle> {
        let mut state = self.state();
        if desc.set_layouts.len() as u32 > state.limits.max_bound_descriptor_sets {
            return Err(RhiError::PipelineError(format!(
                "{} set layouts exceed the limit of {}",
                desc.set_layouts.len(),
                state.limits.max_bound_descriptor_sets
            )));
        }
        for layout in &desc.set_layouts {
            if !state.set_layouts.contains_key(layout) {
                return Err(RhiError::InvalidHandle(format!("{:?}", layout)));
            }
        }
        let handle = PipelineLayoutHandle::from_raw(state.next_id());
        state.pipeline_layouts.insert(handle, desc.clone());
        Ok(handle)
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutHandle) {
        let mut state = self.state();
        let last_use = state.pipeline_layouts.remove(&layout).map(|_| 0);
        state.destroyed(format!("{:?}", layout), last_use);
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> RhiResult<PipelineHandle> {
        let mut state = self.state();
        if !state.pipeline_layouts.contains_key(&desc.layout) {
            return Err(RhiError::InvalidHandle(format!("{:?}", desc.layout)));
        }
        for stage in &desc.stages {
            if !state.shader_modules.contains_key(&stage.module) {
                return Err(RhiError::PipelineError(format!(
                    "{} stage uses unknown {:?}",
                    stage.stage, stage.module
                )));
            }
        }
        let handle = PipelineHandle::from_raw(state.next_id());
        state.pipelines.insert(handle, 0);
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        let mut state = self.state();
        let last_use = state.pipelines.remove(&pipeline);
        state.destroyed(format!("{:?}", pipeline), last_use);
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> RhiResult<DescriptorSetLayoutHandle> {
        let mut state = self.state();
        let handle = DescriptorSetLayoutHandle::from_raw(state.next_id());
        let mut bindings = bindings.to_vec();
        bindings.sort_by_key(|b| b.binding);
        state.set_layouts.insert(handle, bindings);
        Ok(handle)
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        let mut state = self.state();
        let last_use = state.set_layouts.remove(&layout).map(|_| 0);
        state.destroyed(format!("{:?}", layout), last_use);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[DescriptorPoolSize],
    ) -> RhiResult<DescriptorPoolHandle> {
        let mut state = self.state();
        let handle = DescriptorPoolHandle::from_raw(state.next_id());
        let mut capacity = HashMap::new();
        for size in sizes {
            *capacity.entry(size.descriptor_type).or_insert(0) += size.count;
        }
        state.descriptor_pools.insert(
            handle,
            DescriptorPoolState {
                max_sets,
                remaining: capacity.clone(),
                capacity,
                sets: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> RhiResult<()> {
        let mut state = self.state();
        let sets = match state.descriptor_pools.get(&pool) {
            Some(p) => p.sets.clone(),
            None => return Err(RhiError::InvalidHandle(format!("{:?}", pool))),
        };

        let last_use = sets
            .iter()
            .filter_map(|set| state.descriptor_sets.get(set).map(|s| s.last_use))
            .max()
            .unwrap_or(0);
        if let Some(submission) = state.in_flight(last_use) {
            state.hazard(Hazard::DescriptorPoolResetInFlight { pool, submission });
        }

        for set in &sets {
            state.descriptor_sets.remove(set);
        }
        if let Some(p) = state.descriptor_pools.get_mut(&pool) {
            p.sets.clear();
            p.remaining = p.capacity.clone();
        }
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state();
        let removed = state.descriptor_pools.remove(&pool);
        let last_use = removed.map(|p| {
            p.sets
                .iter()
                .filter_map(|set| state.descriptor_sets.remove(set).map(|s| s.last_use))
                .max()
                .unwrap_or(0)
        });
        state.destroyed(format!("{:?}", pool), last_use);
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> RhiResult<DescriptorSetHandle> {
        let mut state = self.state();
        let bindings = state
            .set_layouts
            .get(&layout)
            .cloned()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", layout)))?;
        let pool_state = state
            .descriptor_pools
            .get(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", pool)))?;

        if pool_state.sets.len() as u32 >= pool_state.max_sets {
            return Err(RhiError::OutOfPoolMemory);
        }
        for binding in &bindings {
            let remaining = pool_state
                .remaining
                .get(&binding.descriptor_type)
                .copied()
                .unwrap_or(0);
            if remaining < binding.count {
                return Err(RhiError::OutOfPoolMemory);
            }
        }

        let handle = DescriptorSetHandle::from_raw(state.next_id());
        if let Some(pool_state) = state.descriptor_pools.get_mut(&pool) {
            for binding in &bindings {
                if let Some(remaining) = pool_state.remaining.get_mut(&binding.descriptor_type) {
                    *remaining -= binding.count;
                }
            }
            pool_state.sets.push(handle);
        }
        state.descriptor_sets.insert(
            handle,
            DescriptorSetState {
                layout,
                writes: BTreeMap::new(),
                last_use: 0,
            },
        );
        Ok(handle)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> RhiResult<()> {
        let mut state = self.state();
        for write in writes {
            let (layout, last_use) = state
                .descriptor_sets
                .get(&write.set)
                .map(|s| (s.layout, s.last_use))
                .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", write.set)))?;

            let declared = state
                .set_layouts
                .get(&layout)
                .and_then(|b| b.iter().find(|b| b.binding == write.binding))
                .map(|b| b.descriptor_type);
            if declared != Some(write.descriptor_type) {
                return Err(RhiError::InvalidUsage(format!(
                    "{:?} binding {} is {:?}, write is {:?}",
                    write.set, write.binding, declared, write.descriptor_type
                )));
            }

            match write.resource {
                DescriptorResource::Buffer { buffer, .. } => {
                    state.buffer(buffer)?;
                }
                DescriptorResource::Image { image, sampler, .. } => {
                    state.image(image)?;
                    if let Some(sampler) = sampler
                        && !state.samplers.contains_key(&sampler)
                    {
                        return Err(RhiError::InvalidHandle(format!("{:?}", sampler)));
                    }
                }
            }

            if let Some(submission) = state.in_flight(last_use) {
                state.hazard(Hazard::DescriptorSetUpdatedInFlight {
                    set: write.set,
                    submission,
                });
            }
            if let Some(set) = state.descriptor_sets.get_mut(&write.set) {
                set.writes.insert(write.binding, *write);
            }
        }
        Ok(())
    }

    fn create_command_pool(&self) -> RhiResult<CommandPoolHandle> {
        let mut state = self.state();
        let handle = CommandPoolHandle::from_raw(state.next_id());
        state.command_pools.insert(handle, 0);
        Ok(handle)
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> RhiResult<()> {
        let mut state = self.state();
        let last_use = state
            .command_pools
            .get(&pool)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", pool)))?;
        if let Some(submission) = state.in_flight(last_use) {
            state.hazard(Hazard::CommandPoolResetInFlight { pool, submission });
        }
        state.event(Event::CommandPoolReset(pool));
        Ok(())
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.state();
        let last_use = state.command_pools.remove(&pool);
        state.destroyed(format!("{:?}", pool), last_use);
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<FenceHandle> {
        let mut state = self.state();
        let handle = FenceHandle::from_raw(state.next_id());
        state.fences.insert(
            handle,
            FenceState {
                signaled,
                pending: None,
            },
        );
        Ok(handle)
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> RhiResult<()> {
        let mut state = self.state();
        if let Some(error) = state.faults.fence_wait.take() {
            return Err(error);
        }
        let fence_state = state
            .fences
            .get(&fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))?;

        match (fence_state.signaled, fence_state.pending) {
            (true, _) => {}
            (false, Some(submission)) => state.retire(submission),
            // Nothing will ever signal it
            (false, None) => return Err(RhiError::Timeout(timeout)),
        }
        state.event(Event::FenceWaited(fence));
        Ok(())
    }

    fn reset_fence(&self, fence: FenceHandle) -> RhiResult<()> {
        let mut state = self.state();
        let pending = state
            .fences
            .get(&fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))?
            .pending;
        if let Some(submission) = pending.and_then(|s| state.in_flight(s)) {
            state.hazard(Hazard::FenceResetInFlight { fence, submission });
        }
        if let Some(f) = state.fences.get_mut(&fence) {
            f.signaled = false;
            f.pending = None;
        }
        state.event(Event::FenceReset(fence));
        Ok(())
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> RhiResult<bool> {
        let mut state = self.state();
        let fence_state = state
            .fences
            .get(&fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))?;
        match (fence_state.signaled, fence_state.pending) {
            (true, _) => Ok(true),
            (false, Some(submission)) => {
                state.retire(submission);
                Ok(true)
            }
            (false, None) => Ok(false),
        }
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        let mut state = self.state();
        let last_use = state
            .fences
            .remove(&fence)
            .map(|f| f.pending.unwrap_or(0));
        state.destroyed(format!("{:?}", fence), last_use);
    }

    fn create_semaphore(&self) -> RhiResult<SemaphoreHandle> {
        let mut state = self.state();
        let handle = SemaphoreHandle::from_raw(state.next_id());
        state.semaphores.insert(handle, false);
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        let mut state = self.state();
        let last_use = state.semaphores.remove(&semaphore).map(|_| 0);
        state.destroyed(format!("{:?}", semaphore), last_use);
    }

    fn submit(&self, submission: Submission<'_>) -> RhiResult<()> {
        let mut state = self.state();
        state.validate_submission(&submission)?;

        let seq = state.next_submission;
        state.next_submission += 1;

        if let Some(fence) = submission.signal_fence {
            let (signaled, pending) = state
                .fences
                .get(&fence)
                .map_or((false, None), |f| (f.signaled, f.pending));
            if signaled || pending.is_some() {
                state.hazard(Hazard::FenceAlreadySignaled { fence });
            }
            if let Some(f) = state.fences.get_mut(&fence) {
                f.signaled = false;
                f.pending = Some(seq);
            }
        }

        for &semaphore in submission.wait_semaphores {
            if state.semaphores.get(&semaphore) != Some(&true) {
                state.hazard(Hazard::UnsignaledSemaphoreWait { semaphore });
            }
            state.semaphores.insert(semaphore, false);
        }

        for command in submission.commands.commands() {
            state.execute(seq, command);
        }
        let pool = submission.commands.pool();
        state.command_pools.insert(pool, seq);

        for &semaphore in submission.signal_semaphores {
            if state.semaphores.get(&semaphore) == Some(&true) {
                state.hazard(Hazard::SemaphoreSignaledTwice { semaphore });
            }
            state.semaphores.insert(semaphore, true);
        }

        state.event(Event::Submitted {
            submission: seq,
            pool,
            fence: submission.signal_fence,
        });
        trace!(
            "Submission #{} ({} commands)",
            seq,
            submission.commands.len()
        );
        Ok(())
    }

    fn surface_extent(&self) -> Extent2D {
        self.state().surface_extent
    }

    fn swapchain_format(&self) -> ImageFormat {
        ImageFormat::Bgra8Srgb
    }

    fn swapchain_image_count(&self) -> u32 {
        self.state().swapchain_image_count
    }

    fn acquire_next_image(
        &self,
        signal: SemaphoreHandle,
        _timeout: Duration,
    ) -> RhiResult<AcquiredImage> {
        let mut state = self.state();
        if let Some(error) = state.faults.acquire.take() {
            return Err(error);
        }
        let signaled = *state
            .semaphores
            .get(&signal)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", signal)))?;
        if state.surface_extent != state.swapchain_extent {
            return Err(RhiError::OutOfDate);
        }
        if signaled {
            state.hazard(Hazard::SemaphoreSignaledTwice { semaphore: signal });
        }
        state.semaphores.insert(signal, true);

        let index = state.next_image % state.swapchain_image_count;
        state.next_image = state.next_image.wrapping_add(1);
        state.event(Event::ImageAcquired(index));
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> RhiResult<PresentOutcome> {
        let mut state = self.state();
        if image_index >= state.swapchain_image_count {
            return Err(RhiError::InvalidUsage(format!(
                "Present of swapchain image {} out of range",
                image_index
            )));
        }
        match state.semaphores.get(&wait) {
            None => return Err(RhiError::InvalidHandle(format!("{:?}", wait))),
            Some(false) => state.hazard(Hazard::UnsignaledSemaphoreWait { semaphore: wait }),
            Some(true) => {}
        }
        // The wait happens even when presentation itself fails
        state.semaphores.insert(wait, false);
        if let Some(error) = state.faults.present.take() {
            return Err(error);
        }
        state.event(Event::Presented(image_index));

        if state.surface_extent != state.swapchain_extent {
            Ok(PresentOutcome::Suboptimal)
        } else {
            Ok(PresentOutcome::Presented)
        }
    }

    fn recreate_swapchain(&self, extent: Extent2D) -> RhiResult<()> {
        let mut state = self.state();
        let last = state.next_submission - 1;
        if let Some(submission) = state.in_flight(last) {
            state.hazard(Hazard::RecreateWhileInFlight { submission });
        }
        state.swapchain_extent = extent;
        state.next_image = 0;
        state.event(Event::SwapchainRecreated(extent));
        debug!("Swapchain recreated at {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state();
        let last = state.next_submission - 1;
        state.retire(last);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BufferCopy, BufferImageCopy, CommandList, CommandRecorder, ImageBarrier};

    fn submit(backend: &HeadlessBackend, list: &CommandList, fence: Option<FenceHandle>) {
        backend
            .submit(Submission {
                commands: list,
                wait_semaphores: &[],
                signal_semaphores: &[],
                signal_fence: fence,
            })
            .unwrap();
    }

    #[test]
    fn test_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HeadlessBackend>();
    }

    #[test]
    fn test_write_after_fence_wait_is_clean() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let fence = backend.create_fence(false).unwrap();
        let src = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Staging, 16, "src"))
            .unwrap();
        let dst = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Vertex, 16, "dst"))
            .unwrap();
        backend.write_buffer(src, 0, &[7; 16]).unwrap();

        let mut cmd = CommandRecorder::begin(pool);
        cmd.copy_buffer(src, dst, &[BufferCopy::whole(16)]);
        submit(&backend, &cmd.end().unwrap(), Some(fence));

        backend.wait_for_fence(fence, Duration::from_secs(1)).unwrap();
        backend.write_buffer(src, 0, &[1; 16]).unwrap();

        assert!(backend.hazards().is_empty());
        assert_eq!(backend.buffer_contents(dst).unwrap(), vec![7; 16]);
    }

    #[test]
    fn test_write_before_fence_wait_is_hazard() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let src = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Staging, 16, "src"))
            .unwrap();
        let dst = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Vertex, 16, "dst"))
            .unwrap();

        let mut cmd = CommandRecorder::begin(pool);
        cmd.copy_buffer(src, dst, &[BufferCopy::whole(8)]);
        submit(&backend, &cmd.end().unwrap(), None);

        // Outside the copied range
        backend.write_buffer(src, 8, &[0; 8]).unwrap();
        assert!(backend.hazards().is_empty());

        backend.write_buffer(src, 4, &[0; 2]).unwrap();
        let hazards = backend.take_hazards();
        assert_eq!(hazards.len(), 1);
        assert!(matches!(
            hazards[0],
            Hazard::WriteWhileInFlight { submission: 1, .. }
        ));

        backend.wait_idle().unwrap();
        backend.write_buffer(src, 4, &[0; 2]).unwrap();
        assert!(backend.hazards().is_empty());
    }

    #[test]
    fn test_unsignaled_fence_wait_times_out() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence(false).unwrap();
        let timeout = Duration::from_millis(5);
        assert_eq!(
            backend.wait_for_fence(fence, timeout),
            Err(RhiError::Timeout(timeout))
        );
    }

    #[test]
    fn test_fence_and_pool_reset_in_flight() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let fence = backend.create_fence(false).unwrap();
        submit(&backend, &CommandList::empty(pool), Some(fence));

        backend.reset_command_pool(pool).unwrap();
        backend.reset_fence(fence).unwrap();

        let hazards = backend.hazards();
        assert!(matches!(hazards[0], Hazard::CommandPoolResetInFlight { .. }));
        assert!(matches!(hazards[1], Hazard::FenceResetInFlight { .. }));
    }

    #[test]
    fn test_submit_with_signaled_fence_is_hazard() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let fence = backend.create_fence(true).unwrap();
        submit(&backend, &CommandList::empty(pool), Some(fence));
        assert_eq!(
            backend.hazards(),
            vec![Hazard::FenceAlreadySignaled { fence }]
        );
    }

    #[test]
    fn test_semaphore_protocol() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let rendered = backend.create_semaphore().unwrap();

        let image = backend
            .acquire_next_image(acquired, Duration::from_secs(1))
            .unwrap();
        backend
            .submit(Submission {
                commands: &CommandList::empty(pool),
                wait_semaphores: &[acquired],
                signal_semaphores: &[rendered],
                signal_fence: None,
            })
            .unwrap();
        backend.present(image.index, rendered).unwrap();
        assert!(backend.hazards().is_empty());

        // Nothing signals `rendered` this time
        backend.present(image.index, rendered).unwrap();
        assert_eq!(
            backend.hazards(),
            vec![Hazard::UnsignaledSemaphoreWait { semaphore: rendered }]
        );
    }

    #[test]
    fn test_double_destroy_and_destroy_in_flight() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let buffer = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Vertex, 64, "vb"))
            .unwrap();

        let mut cmd = CommandRecorder::begin(pool);
        cmd.copy_buffer(buffer, buffer, &[BufferCopy {
            src_offset: 0,
            dst_offset: 32,
            size: 16,
        }]);
        submit(&backend, &cmd.end().unwrap(), None);

        backend.destroy_buffer(buffer);
        backend.destroy_buffer(buffer);
        let hazards = backend.hazards();
        assert_eq!(hazards.len(), 2);
        assert!(matches!(hazards[0], Hazard::DestroyedInFlight { .. }));
        assert!(matches!(hazards[1], Hazard::DoubleDestroy { .. }));
    }

    #[test]
    fn test_image_upload_tracks_layouts() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let image = backend
            .create_image(&ImageDesc::texture(
                Extent2D::new(2, 2),
                ImageFormat::Rgba8Srgb,
                2,
                "tex",
            ))
            .unwrap();
        let staging = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Staging, 20, "staging"))
            .unwrap();
        let pixels: Vec<u8> = (0..20).collect();
        backend.write_buffer(staging, 0, &pixels).unwrap();

        let mut cmd = CommandRecorder::begin(pool);
        cmd.pipeline_barrier(&[ImageBarrier::all_levels(
            image,
            2,
            ImageLayout::Undefined,
            ImageLayout::TransferDst,
        )]);
        cmd.copy_buffer_to_image(
            staging,
            image,
            ImageLayout::TransferDst,
            &[
                BufferImageCopy {
                    buffer_offset: 0,
                    mip_level: 0,
                    extent: Extent2D::new(2, 2),
                },
                BufferImageCopy {
                    buffer_offset: 16,
                    mip_level: 1,
                    extent: Extent2D::new(1, 1),
                },
            ],
        );
        cmd.pipeline_barrier(&[ImageBarrier::all_levels(
            image,
            2,
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
        )]);
        submit(&backend, &cmd.end().unwrap(), None);

        assert!(backend.hazards().is_empty());
        assert_eq!(backend.image_mip(image, 0).unwrap(), pixels[..16].to_vec());
        assert_eq!(backend.image_mip(image, 1).unwrap(), pixels[16..].to_vec());
        assert_eq!(
            backend.image_layout(image, 1),
            Some(ImageLayout::ShaderReadOnly)
        );
    }

    #[test]
    fn test_copy_into_undefined_layout_is_hazard() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let image = backend
            .create_image(&ImageDesc::texture(
                Extent2D::new(1, 1),
                ImageFormat::Rgba8Srgb,
                1,
                "tex",
            ))
            .unwrap();
        let staging = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Staging, 4, "staging"))
            .unwrap();

        let mut cmd = CommandRecorder::begin(pool);
        cmd.copy_buffer_to_image(
            staging,
            image,
            ImageLayout::TransferDst,
            &[BufferImageCopy {
                buffer_offset: 0,
                mip_level: 0,
                extent: Extent2D::new(1, 1),
            }],
        );
        submit(&backend, &cmd.end().unwrap(), None);
        assert!(matches!(
            backend.hazards()[0],
            Hazard::ImageLayoutMismatch {
                actual: ImageLayout::Undefined,
                ..
            }
        ));
    }

    #[test]
    fn test_out_of_bounds_copy_is_rejected() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let a = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Staging, 8, "a"))
            .unwrap();
        let b = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Vertex, 4, "b"))
            .unwrap();
        let mut cmd = CommandRecorder::begin(pool);
        cmd.copy_buffer(a, b, &[BufferCopy::whole(8)]);
        let list = cmd.end().unwrap();
        let result = backend.submit(Submission {
            commands: &list,
            wait_semaphores: &[],
            signal_semaphores: &[],
            signal_fence: None,
        });
        assert!(matches!(result, Err(RhiError::InvalidUsage(_))));
        assert_eq!(backend.submission_count(), 0);
    }

    #[test]
    fn test_resize_reports_out_of_date() {
        let backend = HeadlessBackend::new();
        let semaphore = backend.create_semaphore().unwrap();
        backend.resize_surface(Extent2D::new(1024, 768));
        assert_eq!(
            backend.acquire_next_image(semaphore, Duration::from_secs(1)),
            Err(RhiError::OutOfDate)
        );
        backend.recreate_swapchain(Extent2D::new(1024, 768)).unwrap();
        assert!(
            backend
                .acquire_next_image(semaphore, Duration::from_secs(1))
                .is_ok()
        );
    }

    #[test]
    fn test_write_to_device_local_buffer_is_rejected() {
        let backend = HeadlessBackend::new();
        let buffer = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Index, 8, "ib"))
            .unwrap();
        assert!(backend.write_buffer(buffer, 0, &[0; 4]).is_err());
    }
}
