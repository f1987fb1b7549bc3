//! Retirable GPU resources as a sum type.
//!
//! Anything whose lifetime ends through the destruction queue is wrapped in
//! a [`GpuResource`], so the queue and the backend dispatch on the variant
//! instead of casting opaque pointers.

use std::fmt;
use std::sync::Arc;

use crate::backend::GpuBackend;
use crate::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, FenceHandle, FramebufferHandle, PipelineHandle,
    PipelineLayoutHandle, RenderPassHandle, SemaphoreHandle, ShaderModuleHandle, TextureHandle,
};

/// Kind tag carried by every destruction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Buffer,
    Texture,
    RenderTarget,
    DepthBuffer,
    DescriptorSet,
    DescriptorSetLayout,
    Pipeline,
    PipelineLayout,
    RenderPass,
    Framebuffer,
    CommandPool,
    CommandBuffers,
    Fence,
    Semaphore,
    ShaderModule,
}

impl ResourceKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Buffer => "buffer",
            Self::Texture => "texture",
            Self::RenderTarget => "render target",
            Self::DepthBuffer => "depth buffer",
            Self::DescriptorSet => "descriptor set",
            Self::DescriptorSetLayout => "descriptor set layout",
            Self::Pipeline => "pipeline",
            Self::PipelineLayout => "pipeline layout",
            Self::RenderPass => "render pass",
            Self::Framebuffer => "framebuffer",
            Self::CommandPool => "command pool",
            Self::CommandBuffers => "command buffers",
            Self::Fence => "fence",
            Self::Semaphore => "semaphore",
            Self::ShaderModule => "shader module",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A native object whose lifetime has ended.
///
/// Render targets and depth buffers are textures at the device level; they
/// keep separate variants so destruction logs and statistics stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GpuResource {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    RenderTarget(TextureHandle),
    DepthBuffer(TextureHandle),
    /// Descriptor sets are freed back into the pool they came from.
    DescriptorSet(DescriptorSetHandle),
    DescriptorSetLayout(DescriptorSetLayoutHandle),
    Pipeline(PipelineHandle),
    PipelineLayout(PipelineLayoutHandle),
    RenderPass(RenderPassHandle),
    Framebuffer(FramebufferHandle),
    CommandPool(CommandPoolHandle),
    /// Buffers freed back to their pool without destroying the pool.
    CommandBuffers {
        pool: CommandPoolHandle,
        buffers: Vec<CommandBufferHandle>,
    },
    Fence(FenceHandle),
    Semaphore(SemaphoreHandle),
    ShaderModule(ShaderModuleHandle),
}

/// Identity of a retired resource, used to detect double retirement.
pub type ResourceKey = (ResourceKind, u64);

impl GpuResource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Buffer(_) => ResourceKind::Buffer,
            Self::Texture(_) => ResourceKind::Texture,
            Self::RenderTarget(_) => ResourceKind::RenderTarget,
            Self::DepthBuffer(_) => ResourceKind::DepthBuffer,
            Self::DescriptorSet(_) => ResourceKind::DescriptorSet,
            Self::DescriptorSetLayout(_) => ResourceKind::DescriptorSetLayout,
            Self::Pipeline(_) => ResourceKind::Pipeline,
            Self::PipelineLayout(_) => ResourceKind::PipelineLayout,
            Self::RenderPass(_) => ResourceKind::RenderPass,
            Self::Framebuffer(_) => ResourceKind::Framebuffer,
            Self::CommandPool(_) => ResourceKind::CommandPool,
            Self::CommandBuffers { .. } => ResourceKind::CommandBuffers,
            Self::Fence(_) => ResourceKind::Fence,
            Self::Semaphore(_) => ResourceKind::Semaphore,
            Self::ShaderModule(_) => ResourceKind::ShaderModule,
        }
    }

    /// Raw handle value identifying the object.
    ///
    /// Command buffer batches are keyed by their first buffer.
    pub fn raw(&self) -> u64 {
        match self {
            Self::Buffer(h) => h.raw(),
            Self::Texture(h) | Self::RenderTarget(h) | Self::DepthBuffer(h) => h.raw(),
            Self::DescriptorSet(h) => h.raw(),
            Self::DescriptorSetLayout(h) => h.raw(),
            Self::Pipeline(h) => h.raw(),
            Self::PipelineLayout(h) => h.raw(),
            Self::RenderPass(h) => h.raw(),
            Self::Framebuffer(h) => h.raw(),
            Self::CommandPool(h) => h.raw(),
            Self::CommandBuffers { buffers, .. } => buffers.first().map_or(0, |h| h.raw()),
            Self::Fence(h) => h.raw(),
            Self::Semaphore(h) => h.raw(),
            Self::ShaderModule(h) => h.raw(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        (self.kind(), self.raw())
    }
}

impl fmt::Display for GpuResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:#x}", self.kind(), self.raw())
    }
}

/// Objects created by a build that has not finished yet.
///
/// The device has never used them, so dropping the guard destroys them
/// immediately, newest first. A build that returns an error halfway through
/// therefore leaves nothing behind. [`PartialBuild::finish`] hands the
/// objects over to the caller instead.
pub(crate) struct PartialBuild {
    backend: Arc<dyn GpuBackend>,
    created: Vec<GpuResource>,
}

impl PartialBuild {
    pub(crate) fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            created: Vec::new(),
        }
    }

    pub(crate) fn track(&mut self, resource: GpuResource) {
        self.created.push(resource);
    }

    /// The build succeeded; keep everything it created.
    pub(crate) fn finish(mut self) {
        self.created.clear();
    }
}

impl Drop for PartialBuild {
    fn drop(&mut self) {
        if self.created.is_empty() {
            return;
        }
        log::debug!("Destroying {} objects of a failed build", self.created.len());
        for resource in self.created.drain(..).rev() {
            self.backend.destroy(resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::types::{BufferDescriptor, BufferUsage};

    #[test]
    fn test_unfinished_build_destroys_what_it_created() {
        let backend = Arc::new(DummyBackend::new());
        let kept = backend.create_fence(true).unwrap();

        let mut build = PartialBuild::new(backend.clone());
        let fence = backend.create_fence(false).unwrap();
        build.track(GpuResource::Fence(fence));
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::UNIFORM))
            .unwrap();
        build.track(GpuResource::Buffer(buffer));
        drop(build);

        assert_eq!(backend.live_objects(), 1);
        assert!(backend.is_alive(&GpuResource::Fence(kept)));
        assert_eq!(backend.stats().double_destroys, 0);
    }

    #[test]
    fn test_finished_build_keeps_its_objects() {
        let backend = Arc::new(DummyBackend::new());
        let mut build = PartialBuild::new(backend.clone());
        build.track(GpuResource::Semaphore(backend.create_semaphore().unwrap()));
        build.finish();
        assert_eq!(backend.live_objects(), 1);
    }

    #[test]
    fn test_texture_variants_keep_distinct_kinds() {
        let texture = TextureHandle::from_raw(7);
        let a = GpuResource::RenderTarget(texture);
        let b = GpuResource::DepthBuffer(texture);
        assert_eq!(a.raw(), b.raw());
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_command_buffer_batch_key() {
        let resource = GpuResource::CommandBuffers {
            pool: CommandPoolHandle::from_raw(1),
            buffers: vec![
                CommandBufferHandle::from_raw(40),
                CommandBufferHandle::from_raw(41),
            ],
        };
        assert_eq!(resource.key(), (ResourceKind::CommandBuffers, 40));
        assert_eq!(resource.to_string(), "command buffers 0x28");
    }
}
