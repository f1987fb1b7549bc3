//! Per-frame-in-flight GPU objects.
//!
//! Each [`FrameSlot`] owns the objects one in-flight frame needs: a primary
//! command buffer, the fence signaled when the frame's submission finishes,
//! the semaphore signaled for presentation, and a host-visible dynamic
//! uniform buffer with its descriptor sets. Only the orchestrating thread
//! touches [`FrameData`], once per frame, so it needs no locking.

use std::sync::Arc;

use crate::backend::{CommandBufferLevel, GpuBackend};
use crate::destruction::DestructionQueue;
use crate::error::{GraphicsError, fatal};
use crate::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, FenceHandle, SemaphoreHandle,
};
use crate::resource::{GpuResource, PartialBuild};
use crate::types::{BufferDescriptor, DescriptorType};

/// Per-slot resources requested at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDataLayout {
    /// One descriptor set is allocated per layout. Binding 0 of the first
    /// layout must be a dynamic uniform buffer.
    pub descriptor_set_layouts: Vec<DescriptorSetLayoutHandle>,
    /// Size of each slot's dynamic uniform buffer.
    pub dynamic_uniform_size: u64,
    /// Window of the dynamic buffer visible to one draw.
    pub dynamic_uniform_range: u64,
}

impl FrameDataLayout {
    pub fn new(dynamic_uniform_size: u64) -> Self {
        Self {
            descriptor_set_layouts: Vec::new(),
            dynamic_uniform_size,
            dynamic_uniform_range: dynamic_uniform_size.min(256),
        }
    }

    pub fn with_descriptor_set_layout(mut self, layout: DescriptorSetLayoutHandle) -> Self {
        self.descriptor_set_layouts.push(layout);
        self
    }

    pub fn with_dynamic_uniform_range(mut self, range: u64) -> Self {
        self.dynamic_uniform_range = range;
        self
    }
}

/// GPU objects dedicated to one frame in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlot {
    pub command_pool: CommandPoolHandle,
    pub command_buffer: CommandBufferHandle,
    /// Created signaled so the first wait on a fresh slot returns at once.
    pub fence: FenceHandle,
    pub render_finished: SemaphoreHandle,
    pub dynamic_uniform_buffer: BufferHandle,
    pub descriptor_sets: Vec<DescriptorSetHandle>,
}

/// The set of frame slots and the index of the active one.
pub struct FrameData {
    backend: Arc<dyn GpuBackend>,
    slots: Vec<FrameSlot>,
    current: usize,
    dynamic_uniform_size: u64,
}

impl FrameData {
    /// Allocate `frame_count` slots.
    pub fn initialize(
        backend: Arc<dyn GpuBackend>,
        frame_count: u32,
        layout: &FrameDataLayout,
    ) -> Result<Self, GraphicsError> {
        assert!(frame_count > 0, "at least one frame slot is required");
        log::debug!("Allocating {frame_count} frame slots");

        let mut build = PartialBuild::new(Arc::clone(&backend));
        let slots = (0..frame_count)
            .map(|index| create_slot(backend.as_ref(), index, layout, &mut build))
            .collect::<Result<Vec<_>, _>>()?;
        build.finish();

        Ok(Self {
            backend,
            slots,
            current: 0,
            dynamic_uniform_size: layout.dynamic_uniform_size,
        })
    }

    /// Select the slot used by the upcoming frame.
    pub fn set_current_frame(&mut self, index: u32) {
        assert!(
            (index as usize) < self.slots.len(),
            "frame index {index} out of range for {} slots",
            self.slots.len()
        );
        self.current = index as usize;
    }

    pub fn current_frame(&self) -> u32 {
        self.current as u32
    }

    pub fn frame_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub fn slot(&self, index: u32) -> &FrameSlot {
        &self.slots[index as usize]
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    pub fn current_fence(&self) -> FenceHandle {
        self.current_slot().fence
    }

    pub fn current_command_buffer(&self) -> CommandBufferHandle {
        self.current_slot().command_buffer
    }

    pub fn current_render_finished(&self) -> SemaphoreHandle {
        self.current_slot().render_finished
    }

    pub fn current_dynamic_uniform_buffer(&self) -> BufferHandle {
        self.current_slot().dynamic_uniform_buffer
    }

    pub fn current_descriptor_set(&self, index: usize) -> DescriptorSetHandle {
        self.current_slot().descriptor_sets[index]
    }

    /// Upload `data` into the active slot's dynamic uniform buffer.
    pub fn write_dynamic_uniforms(&self, offset: u64, data: &[u8]) {
        assert!(
            offset + data.len() as u64 <= self.dynamic_uniform_size,
            "dynamic uniform write past the end of the buffer"
        );
        let buffer = self.current_dynamic_uniform_buffer();
        if let Err(e) = self.backend.write_buffer(buffer, offset, data) {
            fatal("write dynamic uniforms", e);
        }
    }

    /// Whether each slot's fence has signaled, in slot order.
    pub fn fence_statuses(&self) -> Vec<bool> {
        self.slots
            .iter()
            .map(|slot| match self.backend.is_fence_signaled(slot.fence) {
                Ok(signaled) => signaled,
                Err(e) => fatal("query a frame fence", e),
            })
            .collect()
    }

    /// Retire every slot object. Used at shutdown.
    pub fn release(self, queue: &DestructionQueue) {
        for slot in self.slots {
            // Destroying the pool frees the primary command buffer with it.
            queue.retire(GpuResource::CommandPool(slot.command_pool));
            queue.retire(GpuResource::Fence(slot.fence));
            queue.retire(GpuResource::Semaphore(slot.render_finished));
            queue.retire_all(slot.descriptor_sets.into_iter().map(GpuResource::DescriptorSet));
            queue.retire(GpuResource::Buffer(slot.dynamic_uniform_buffer));
        }
    }
}

impl std::fmt::Debug for FrameData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameData")
            .field("frame_count", &self.slots.len())
            .field("current", &self.current)
            .finish()
    }
}

fn create_slot(
    backend: &dyn GpuBackend,
    index: u32,
    layout: &FrameDataLayout,
    build: &mut PartialBuild,
) -> Result<FrameSlot, GraphicsError> {
    let command_pool = backend.create_command_pool()?;
    // The pool frees the primary buffer with it.
    build.track(GpuResource::CommandPool(command_pool));
    let command_buffer = backend
        .allocate_command_buffers(command_pool, CommandBufferLevel::Primary, 1)?
        .pop()
        .ok_or_else(|| GraphicsError::Internal("no primary command buffer allocated".into()))?;
    let fence = backend.create_fence(true)?;
    build.track(GpuResource::Fence(fence));
    let render_finished = backend.create_semaphore()?;
    build.track(GpuResource::Semaphore(render_finished));
    let dynamic_uniform_buffer = backend.create_buffer(
        &BufferDescriptor::dynamic_uniform(layout.dynamic_uniform_size)
            .with_label(format!("frame {index} dynamic uniforms")),
    )?;
    build.track(GpuResource::Buffer(dynamic_uniform_buffer));

    let mut descriptor_sets = Vec::with_capacity(layout.descriptor_set_layouts.len());
    for set_layout in &layout.descriptor_set_layouts {
        let set = backend.allocate_descriptor_set(*set_layout)?;
        build.track(GpuResource::DescriptorSet(set));
        descriptor_sets.push(set);
    }
    if let Some(&first) = descriptor_sets.first() {
        backend.write_buffer_descriptor(
            first,
            0,
            DescriptorType::UniformBufferDynamic,
            dynamic_uniform_buffer,
            0,
            layout.dynamic_uniform_range,
        )?;
    }

    Ok(FrameSlot {
        command_pool,
        command_buffer,
        fence,
        render_finished,
        dynamic_uniform_buffer,
        descriptor_sets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::types::{DescriptorBinding, ShaderStages};
    use inflight_core::tasks::TaskSystem;
    use std::time::Duration;

    fn uniform_layout(backend: &DummyBackend) -> DescriptorSetLayoutHandle {
        backend
            .create_descriptor_set_layout(&[DescriptorBinding {
                binding: 0,
                ty: DescriptorType::UniformBufferDynamic,
                count: 1,
                stages: ShaderStages::VERTEX | ShaderStages::FRAGMENT,
            }])
            .unwrap()
    }

    #[test]
    fn test_initialize_allocates_distinct_slots() {
        let backend = Arc::new(DummyBackend::new());
        let layout =
            FrameDataLayout::new(1024).with_descriptor_set_layout(uniform_layout(&backend));
        let frames = FrameData::initialize(backend.clone(), 3, &layout).unwrap();

        assert_eq!(frames.frame_count(), 3);
        let fences: std::collections::HashSet<_> =
            frames.slots().iter().map(|s| s.fence).collect();
        assert_eq!(fences.len(), 3);
        for slot in frames.slots() {
            assert_eq!(slot.descriptor_sets.len(), 1);
            // Fresh slots must not block the first frame.
            assert!(backend.wait_fence(slot.fence, Duration::ZERO).unwrap());
        }
    }

    #[test]
    fn test_current_accessors_follow_selected_slot() {
        let backend = Arc::new(DummyBackend::new());
        let mut frames = FrameData::initialize(backend, 2, &FrameDataLayout::new(256)).unwrap();
        frames.set_current_frame(1);
        assert_eq!(frames.current_frame(), 1);
        assert_eq!(frames.current_fence(), frames.slot(1).fence);
        assert_eq!(frames.current_command_buffer(), frames.slot(1).command_buffer);
        assert_eq!(frames.current_render_finished(), frames.slot(1).render_finished);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_set_current_frame_out_of_range() {
        let backend = Arc::new(DummyBackend::new());
        let mut frames = FrameData::initialize(backend, 2, &FrameDataLayout::new(256)).unwrap();
        frames.set_current_frame(2);
    }

    #[test]
    fn test_dynamic_uniforms_go_to_current_slot() {
        let backend = Arc::new(DummyBackend::new());
        let mut frames =
            FrameData::initialize(backend.clone(), 2, &FrameDataLayout::new(16)).unwrap();
        frames.set_current_frame(1);
        frames.write_dynamic_uniforms(4, &[9, 9]);

        let written = backend
            .buffer_contents(frames.slot(1).dynamic_uniform_buffer)
            .unwrap();
        assert_eq!(&written[4..6], &[9, 9]);
        let untouched = backend
            .buffer_contents(frames.slot(0).dynamic_uniform_buffer)
            .unwrap();
        assert!(untouched.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_initialize_propagates_allocation_failure() {
        let backend = Arc::new(DummyBackend::new());
        let result = FrameData::initialize(backend.clone(), 2, &FrameDataLayout::new(0));
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
        // Pool, fence and semaphore came before the failing buffer.
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_descriptor_write_failure_releases_the_slot() {
        let backend = Arc::new(DummyBackend::new());
        // Binding 0 must be a dynamic uniform buffer.
        let set_layout = backend
            .create_descriptor_set_layout(&[DescriptorBinding {
                binding: 0,
                ty: DescriptorType::StorageBuffer,
                count: 1,
                stages: ShaderStages::VERTEX,
            }])
            .unwrap();
        let layout = FrameDataLayout::new(256).with_descriptor_set_layout(set_layout);
        let result = FrameData::initialize(backend.clone(), 3, &layout);

        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
        assert_eq!(backend.live_objects(), 1);
        assert_eq!(backend.stats().double_destroys, 0);
    }

    #[test]
    fn test_release_destroys_every_slot_object() {
        let backend = Arc::new(DummyBackend::new());
        let set_layout = uniform_layout(&backend);
        let layout = FrameDataLayout::new(256).with_descriptor_set_layout(set_layout);
        let frames = FrameData::initialize(backend.clone(), 3, &layout).unwrap();

        let queue = DestructionQueue::new(backend.clone(), Arc::new(TaskSystem::new(0)), 3);
        frames.release(&queue);
        queue.flush();

        // Only the caller-owned set layout remains.
        assert_eq!(backend.live_objects(), 1);
        assert_eq!(backend.stats().double_destroys, 0);
    }
}
