//! Descriptor set management for shader resource binding.
//!
//! This module connects buffers and images to shaders:
//! - [`DescriptorBinding`] and [`DescriptorBindingBuilder`] describe set layouts
//! - [`DescriptorLayoutCache`] deduplicates set layouts by their bindings
//! - [`DescriptorAllocator`] hands out sets from a growing list of pools
//! - [`DescriptorBuilder`] builds a layout, allocates a set and writes it in one call
//!
//! # Example
//!
//! ```no_run
//! use renderer_rhi::GpuBackend;
//! use renderer_rhi::descriptor::{
//!     DescriptorAllocator, DescriptorBuilder, DescriptorLayoutCache, DescriptorType, ShaderStages,
//! };
//! use renderer_rhi::handle::BufferHandle;
//!
//! # fn example(backend: &dyn GpuBackend, camera: BufferHandle) -> Result<(), renderer_rhi::RhiError> {
//! let mut cache = DescriptorLayoutCache::new();
//! let mut allocator = DescriptorAllocator::new();
//!
//! let (set, layout) = DescriptorBuilder::begin(&mut cache, &mut allocator)
//!     .bind_buffer(
//!         0,
//!         camera,
//!         0,
//!         256,
//!         DescriptorType::UniformBufferDynamic,
//!         ShaderStages::VERTEX,
//!     )
//!     .build(backend)?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::backend::GpuBackend;
use crate::error::{RhiError, RhiResult};
use crate::handle::{
    BufferHandle, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle,
    ImageHandle, SamplerHandle,
};
use crate::image::ImageLayout;

/// Number of sets each pool grabbed by [`DescriptorAllocator`] can hold.
pub const POOL_SET_COUNT: u32 = 1000;

bitflags::bitflags! {
    /// Set of shader stages that may access a binding.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// Kind of resource a binding refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorType {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    InputAttachment,
}

impl DescriptorType {
    /// Whether the buffer offset is supplied at bind time.
    pub fn is_dynamic(self) -> bool {
        matches!(
            self,
            DescriptorType::UniformBufferDynamic | DescriptorType::StorageBufferDynamic
        )
    }

    /// Whether the binding refers to a buffer range.
    pub fn is_buffer(self) -> bool {
        matches!(
            self,
            DescriptorType::UniformBuffer
                | DescriptorType::StorageBuffer
                | DescriptorType::UniformBufferDynamic
                | DescriptorType::StorageBufferDynamic
        )
    }
}

/// One binding slot in a descriptor set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Builder for creating descriptor set layout bindings.
///
/// # Example
///
/// ```
/// use renderer_rhi::descriptor::{DescriptorBindingBuilder, ShaderStages};
///
/// let bindings = [
///     DescriptorBindingBuilder::uniform_buffer(0, ShaderStages::VERTEX),
///     DescriptorBindingBuilder::combined_image_sampler(1, ShaderStages::FRAGMENT),
/// ];
/// ```
pub struct DescriptorBindingBuilder;

impl DescriptorBindingBuilder {
    #[inline]
    fn single(
        binding: u32,
        descriptor_type: DescriptorType,
        stages: ShaderStages,
    ) -> DescriptorBinding {
        DescriptorBinding {
            binding,
            descriptor_type,
            count: 1,
            stages,
        }
    }

    /// Creates a uniform buffer binding.
    #[inline]
    pub fn uniform_buffer(binding: u32, stages: ShaderStages) -> DescriptorBinding {
        Self::single(binding, DescriptorType::UniformBuffer, stages)
    }

    /// Creates a storage buffer binding.
    #[inline]
    pub fn storage_buffer(binding: u32, stages: ShaderStages) -> DescriptorBinding {
        Self::single(binding, DescriptorType::StorageBuffer, stages)
    }

    /// Creates a combined image sampler binding.
    #[inline]
    pub fn combined_image_sampler(binding: u32, stages: ShaderStages) -> DescriptorBinding {
        Self::single(binding, DescriptorType::CombinedImageSampler, stages)
    }

    /// Creates a dynamic uniform buffer binding.
    ///
    /// Dynamic uniform buffers take their offset at bind time.
    #[inline]
    pub fn uniform_buffer_dynamic(binding: u32, stages: ShaderStages) -> DescriptorBinding {
        Self::single(binding, DescriptorType::UniformBufferDynamic, stages)
    }
}

/// Number of descriptors of one type a pool can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorPoolSize {
    pub descriptor_type: DescriptorType,
    pub count: u32,
}

/// The resource written into a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    Image {
        sampler: Option<SamplerHandle>,
        image: ImageHandle,
        layout: ImageLayout,
    },
}

/// A single descriptor update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: DescriptorSetHandle,
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub resource: DescriptorResource,
}

/// Creates a buffer resource for descriptor set updates.
///
/// For dynamic bindings `offset` is the base that bind-time offsets add to and
/// `range` is the window visible to the shader.
#[inline]
pub fn buffer_info(buffer: BufferHandle, offset: u64, range: u64) -> DescriptorResource {
    DescriptorResource::Buffer {
        buffer,
        offset,
        range,
    }
}

/// Creates an image resource for descriptor set updates.
#[inline]
pub fn image_info(
    sampler: Option<SamplerHandle>,
    image: ImageHandle,
    layout: ImageLayout,
) -> DescriptorResource {
    DescriptorResource::Image {
        sampler,
        image,
        layout,
    }
}

/// Descriptors reserved per set, by type.
const POOL_RATIOS: [(DescriptorType, f32); 11] = [
    (DescriptorType::Sampler, 0.5),
    (DescriptorType::CombinedImageSampler, 4.0),
    (DescriptorType::SampledImage, 4.0),
    (DescriptorType::StorageImage, 1.0),
    (DescriptorType::UniformTexelBuffer, 1.0),
    (DescriptorType::StorageTexelBuffer, 1.0),
    (DescriptorType::UniformBuffer, 2.0),
    (DescriptorType::StorageBuffer, 2.0),
    (DescriptorType::UniformBufferDynamic, 1.0),
    (DescriptorType::StorageBufferDynamic, 1.0),
    (DescriptorType::InputAttachment, 0.5),
];

/// Pool sizes for a pool holding `set_count` sets.
pub fn pool_sizes(set_count: u32) -> Vec<DescriptorPoolSize> {
    POOL_RATIOS
        .iter()
        .map(|&(descriptor_type, ratio)| DescriptorPoolSize {
            descriptor_type,
            count: ((ratio * set_count as f32) as u32).max(1),
        })
        .collect()
}

/// Allocates descriptor sets from a list of pools.
///
/// When the current pool reports exhaustion or fragmentation, a fresh pool is
/// grabbed and the allocation retried once. [`reset_pools`](Self::reset_pools)
/// makes every pool reusable at once.
#[derive(Debug)]
pub struct DescriptorAllocator {
    set_count: u32,
    current: Option<DescriptorPoolHandle>,
    used_pools: Vec<DescriptorPoolHandle>,
    free_pools: Vec<DescriptorPoolHandle>,
}

impl Default for DescriptorAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorAllocator {
    pub fn new() -> Self {
        Self::with_pool_set_count(POOL_SET_COUNT)
    }

    /// Uses pools holding `set_count` sets each.
    pub fn with_pool_set_count(set_count: u32) -> Self {
        Self {
            set_count: set_count.max(1),
            current: None,
            used_pools: Vec::new(),
            free_pools: Vec::new(),
        }
    }

    fn grab_pool(&mut self, backend: &dyn GpuBackend) -> RhiResult<DescriptorPoolHandle> {
        if let Some(pool) = self.free_pools.pop() {
            return Ok(pool);
        }
        let pool = backend.create_descriptor_pool(self.set_count, &pool_sizes(self.set_count))?;
        debug!("Created descriptor pool {:?} ({} sets)", pool, self.set_count);
        Ok(pool)
    }

    fn next_pool(&mut self, backend: &dyn GpuBackend) -> RhiResult<DescriptorPoolHandle> {
        let pool = self.grab_pool(backend)?;
        self.used_pools.push(pool);
        self.current = Some(pool);
        Ok(pool)
    }

    /// Allocates one set with `layout`.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the set cannot be allocated even from a
    /// fresh pool.
    pub fn allocate(
        &mut self,
        backend: &dyn GpuBackend,
        layout: DescriptorSetLayoutHandle,
    ) -> RhiResult<DescriptorSetHandle> {
        let pool = match self.current {
            Some(pool) => pool,
            None => self.next_pool(backend)?,
        };

        match backend.allocate_descriptor_set(pool, layout) {
            Ok(set) => Ok(set),
            Err(RhiError::OutOfPoolMemory | RhiError::FragmentedPool) => {
                let pool = self.next_pool(backend)?;
                backend.allocate_descriptor_set(pool, layout)
            }
            Err(e) => Err(e),
        }
    }

    /// Resets every used pool and returns it to the free list.
    ///
    /// Sets allocated before the reset become invalid.
    pub fn reset_pools(&mut self, backend: &dyn GpuBackend) -> RhiResult<()> {
        for pool in self.used_pools.drain(..) {
            backend.reset_descriptor_pool(pool)?;
            self.free_pools.push(pool);
        }
        self.current = None;
        Ok(())
    }

    /// Number of pools created so far.
    pub fn pool_count(&self) -> usize {
        self.used_pools.len() + self.free_pools.len()
    }

    /// Destroys every pool.
    pub fn cleanup(&mut self, backend: &dyn GpuBackend) {
        for pool in self.used_pools.drain(..).chain(self.free_pools.drain(..)) {
            backend.destroy_descriptor_pool(pool);
        }
        self.current = None;
    }
}

/// Deduplicates descriptor set layouts by their bindings.
#[derive(Debug, Default)]
pub struct DescriptorLayoutCache {
    layouts: HashMap<Vec<DescriptorBinding>, DescriptorSetLayoutHandle>,
}

impl DescriptorLayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the layout for `bindings`, creating it on first use.
    ///
    /// Bindings are compared after sorting by binding index, so the order they
    /// are given in does not matter.
    pub fn create_layout(
        &mut self,
        backend: &dyn GpuBackend,
        bindings: &[DescriptorBinding],
    ) -> RhiResult<DescriptorSetLayoutHandle> {
        let mut key = bindings.to_vec();
        key.sort_by_key(|b| b.binding);
        if key.windows(2).any(|w| w[0].binding == w[1].binding) {
            return Err(RhiError::InvalidUsage(
                "Descriptor set layout has duplicate binding indices".to_string(),
            ));
        }

        if let Some(&layout) = self.layouts.get(&key) {
            return Ok(layout);
        }

        let layout = backend.create_descriptor_set_layout(&key)?;
        debug!(
            "Created descriptor set layout {:?} with {} binding(s)",
            layout,
            key.len()
        );
        self.layouts.insert(key, layout);
        Ok(layout)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Destroys every cached layout.
    pub fn cleanup(&mut self, backend: &dyn GpuBackend) {
        for (_, layout) in self.layouts.drain() {
            backend.destroy_descriptor_set_layout(layout);
        }
    }
}

/// Builds a layout, allocates a set and writes its bindings in one call.
pub struct DescriptorBuilder<'a> {
    cache: &'a mut DescriptorLayoutCache,
    allocator: &'a mut DescriptorAllocator,
    bindings: Vec<DescriptorBinding>,
    resources: Vec<(u32, DescriptorType, DescriptorResource)>,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn begin(
        cache: &'a mut DescriptorLayoutCache,
        allocator: &'a mut DescriptorAllocator,
    ) -> Self {
        Self {
            cache,
            allocator,
            bindings: Vec::new(),
            resources: Vec::new(),
        }
    }

    /// Binds a buffer range.
    pub fn bind_buffer(
        mut self,
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
        range: u64,
        descriptor_type: DescriptorType,
        stages: ShaderStages,
    ) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            descriptor_type,
            count: 1,
            stages,
        });
        self.resources
            .push((binding, descriptor_type, buffer_info(buffer, offset, range)));
        self
    }

    /// Binds an image, optionally with a sampler.
    pub fn bind_image(
        mut self,
        binding: u32,
        sampler: Option<SamplerHandle>,
        image: ImageHandle,
        descriptor_type: DescriptorType,
        stages: ShaderStages,
    ) -> Self {
        self.bindings.push(DescriptorBinding {
            binding,
            descriptor_type,
            count: 1,
            stages,
        });
        self.resources.push((
            binding,
            descriptor_type,
            image_info(sampler, image, ImageLayout::ShaderReadOnly),
        ));
        self
    }

    /// Creates (or reuses) the layout, allocates a set and writes every binding.
    pub fn build(
        self,
        backend: &dyn GpuBackend,
    ) -> RhiResult<(DescriptorSetHandle, DescriptorSetLayoutHandle)> {
        let layout = self.cache.create_layout(backend, &self.bindings)?;
        let set = self.allocator.allocate(backend, layout)?;

        let writes: Vec<DescriptorWrite> = self
            .resources
            .iter()
            .map(|&(binding, descriptor_type, resource)| DescriptorWrite {
                set,
                binding,
                descriptor_type,
                resource,
            })
            .collect();
        if writes.is_empty() {
            warn!("Descriptor set {:?} built with no bindings", set);
        } else {
            backend.update_descriptor_sets(&writes)?;
        }

        Ok((set, layout))
    }
}
