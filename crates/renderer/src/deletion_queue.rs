//! Deferred GPU resource destruction.
//!
//! GPU objects often depend on objects created before them: a pipeline on its
//! layout, a descriptor set on its pool. A [`DeletionQueue`] records one
//! [`Deletion`] per created object and destroys them in reverse creation
//! order when flushed, which never destroys a dependency before its user.
//!
//! The queue is not synchronized. It belongs to the render thread, and
//! flushing must only happen once the GPU no longer uses the queued objects.

use std::fmt;

use tracing::{debug, trace, warn};

use renderer_rhi::{
    BufferHandle, CommandPoolHandle, DescriptorPoolHandle, FenceHandle, GpuBackend, ImageHandle,
    PipelineHandle, PipelineLayoutHandle, SamplerHandle, SemaphoreHandle, ShaderModuleHandle,
};

/// One deferred teardown action.
pub enum Deletion {
    Buffer(BufferHandle),
    Image(ImageHandle),
    Sampler(SamplerHandle),
    ShaderModule(ShaderModuleHandle),
    Pipeline(PipelineHandle),
    PipelineLayout(PipelineLayoutHandle),
    DescriptorPool(DescriptorPoolHandle),
    CommandPool(CommandPoolHandle),
    Fence(FenceHandle),
    Semaphore(SemaphoreHandle),
    /// Arbitrary teardown owning whatever it captured.
    Custom(Box<dyn FnOnce(&dyn GpuBackend) + Send>),
}

impl Deletion {
    /// Wraps a closure.
    pub fn custom(action: impl FnOnce(&dyn GpuBackend) + Send + 'static) -> Self {
        Deletion::Custom(Box::new(action))
    }

    fn execute(self, backend: &dyn GpuBackend) {
        match self {
            Deletion::Buffer(h) => backend.destroy_buffer(h),
            Deletion::Image(h) => backend.destroy_image(h),
            Deletion::Sampler(h) => backend.destroy_sampler(h),
            Deletion::ShaderModule(h) => backend.destroy_shader_module(h),
            Deletion::Pipeline(h) => backend.destroy_pipeline(h),
            Deletion::PipelineLayout(h) => backend.destroy_pipeline_layout(h),
            Deletion::DescriptorPool(h) => backend.destroy_descriptor_pool(h),
            Deletion::CommandPool(h) => backend.destroy_command_pool(h),
            Deletion::Fence(h) => backend.destroy_fence(h),
            Deletion::Semaphore(h) => backend.destroy_semaphore(h),
            Deletion::Custom(action) => action(backend),
        }
    }
}

impl fmt::Debug for Deletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deletion::Buffer(h) => fmt::Debug::fmt(h, f),
            Deletion::Image(h) => fmt::Debug::fmt(h, f),
            Deletion::Sampler(h) => fmt::Debug::fmt(h, f),
            Deletion::ShaderModule(h) => fmt::Debug::fmt(h, f),
            Deletion::Pipeline(h) => fmt::Debug::fmt(h, f),
            Deletion::PipelineLayout(h) => fmt::Debug::fmt(h, f),
            Deletion::DescriptorPool(h) => fmt::Debug::fmt(h, f),
            Deletion::CommandPool(h) => fmt::Debug::fmt(h, f),
            Deletion::Fence(h) => fmt::Debug::fmt(h, f),
            Deletion::Semaphore(h) => fmt::Debug::fmt(h, f),
            Deletion::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// LIFO list of deferred teardown actions.
#[derive(Debug)]
pub struct DeletionQueue {
    label: &'static str,
    entries: Vec<Deletion>,
}

impl DeletionQueue {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: Vec::new(),
        }
    }

    /// Queues `deletion` to run before everything queued earlier.
    pub fn push(&mut self, deletion: Deletion) {
        trace!("{} queue: deferred {:?}", self.label, deletion);
        self.entries.push(deletion);
    }

    /// Queues a closure.
    pub fn push_fn(&mut self, action: impl FnOnce(&dyn GpuBackend) + Send + 'static) {
        self.push(Deletion::custom(action));
    }

    /// Moves every entry of `other` to the end of this queue, keeping their order.
    pub fn append(&mut self, other: &mut DeletionQueue) {
        self.entries.append(&mut other.entries);
    }

    /// Runs every queued action, newest first, and empties the queue.
    ///
    /// Returns the number of actions run.
    pub fn flush(&mut self, backend: &dyn GpuBackend) -> usize {
        let count = self.entries.len();
        while let Some(deletion) = self.entries.pop() {
            deletion.execute(backend);
        }
        if count > 0 {
            debug!("{} queue: flushed {} deletion(s)", self.label, count);
        }
        count
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                "{} queue dropped with {} unflushed deletion(s); GPU objects leaked",
                self.label,
                self.entries.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use renderer_rhi::buffer::{BufferDesc, BufferUsage};
    use renderer_rhi::headless::{Event, HeadlessBackend};

    #[test]
    fn test_flush_runs_newest_first() {
        let backend = HeadlessBackend::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut queue = DeletionQueue::new("test");

        for name in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            queue.push_fn(move |_| order.lock().unwrap().push(name));
        }

        assert_eq!(queue.flush(&backend), 3);
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_second_flush_is_noop() {
        let backend = HeadlessBackend::new();
        let count = Arc::new(Mutex::new(0));
        let mut queue = DeletionQueue::new("test");
        let counter = Arc::clone(&count);
        queue.push_fn(move |_| *counter.lock().unwrap() += 1);

        queue.flush(&backend);
        assert_eq!(queue.flush(&backend), 0);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_typed_entries_destroy_in_reverse() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool().unwrap();
        let buffer = backend
            .create_buffer(&BufferDesc::new(BufferUsage::Uniform, 16, "ubo"))
            .unwrap();
        let fence = backend.create_fence(true).unwrap();

        let mut queue = DeletionQueue::new("test");
        queue.push(Deletion::CommandPool(pool));
        queue.push(Deletion::Buffer(buffer));
        queue.push(Deletion::Fence(fence));
        backend.clear_events();
        queue.flush(&backend);

        let destroyed: Vec<String> = backend
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Destroyed(name) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(
            destroyed,
            vec![
                format!("{:?}", fence),
                format!("{:?}", buffer),
                format!("{:?}", pool)
            ]
        );
        assert_eq!(backend.live_resource_count(), 0);
        assert!(backend.hazards().is_empty());
    }

    #[test]
    fn test_append_keeps_order() {
        let backend = HeadlessBackend::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut main = DeletionQueue::new("main");
        let mut scratch = DeletionQueue::new("scratch");

        let o = Arc::clone(&order);
        main.push_fn(move |_| o.lock().unwrap().push(1));
        for i in [2, 3] {
            let o = Arc::clone(&order);
            scratch.push_fn(move |_| o.lock().unwrap().push(i));
        }
        main.append(&mut scratch);

        assert!(scratch.is_empty());
        assert_eq!(main.len(), 3);
        main.flush(&backend);
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn test_queue_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<DeletionQueue>();
    }
}
