//! GPU backend abstraction layer.
//!
//! Every backend implements [`GpuBackend`] over typed native handles
//! ([`FenceHandle`], [`CommandBufferHandle`], ...). The rest of the crate
//! never sees backend-specific types.
//!
//! # Available Backends
//!
//! - `dummy` (default): deterministic software device for tests and headless runs
//! - `vulkan-backend` (default): native Vulkan backend using ash

pub mod command;
pub mod descriptor;

#[cfg(feature = "dummy")]
pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendType, RendererConfig};
use crate::error::GraphicsError;
use crate::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, FenceHandle, FramebufferHandle, PipelineHandle,
    PipelineLayoutHandle, RenderPassHandle, SemaphoreHandle, ShaderModuleHandle, TextureHandle,
};
use crate::resource::GpuResource;
use crate::types::{
    BufferDescriptor, DescriptorBinding, DescriptorType, ShaderStages, TextureDescriptor,
    TextureLayout,
};

pub use command::{
    Command, CommandBufferBegin, CommandBufferLevel, InheritanceInfo, SubpassContents, Submission,
};
pub use descriptor::{
    AttachmentDescriptor, FramebufferDescriptor, GraphicsPipelineDescriptor,
    PipelineLayoutDescriptor, PipelineShaderStage, RenderPassDescriptor, SubpassDependency,
    SubpassDescriptor,
};

/// GPU backend trait for abstracting different GPU APIs.
///
/// Creation methods return errors; the callers decide whether a failure is
/// fatal. Recording methods may be called concurrently from worker threads
/// as long as each thread records into command buffers from its own pool.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    // === Synchronization ===

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle, GraphicsError>;

    fn create_semaphore(&self) -> Result<SemaphoreHandle, GraphicsError>;

    /// Block until the fence is signaled or the timeout expires.
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<bool, GraphicsError>;

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), GraphicsError>;

    /// Check if a fence is signaled (non-blocking).
    fn is_fence_signaled(&self, fence: FenceHandle) -> Result<bool, GraphicsError>;

    /// Wait until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<(), GraphicsError>;

    // === Resources ===

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferHandle, GraphicsError>;

    /// Write data into a host-visible buffer.
    fn write_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError>;

    fn create_texture(&self, descriptor: &TextureDescriptor)
    -> Result<TextureHandle, GraphicsError>;

    /// Read back the full contents of a texture currently in `layout`.
    ///
    /// Blocks until the device is idle. Intended for tests and tools.
    fn read_texture(
        &self,
        texture: TextureHandle,
        layout: TextureLayout,
    ) -> Result<Vec<u8>, GraphicsError>;

    // === Pipeline objects ===

    /// Create a shader module from SPIR-V words.
    fn create_shader_module(
        &self,
        stage: ShaderStages,
        code: &[u32],
    ) -> Result<ShaderModuleHandle, GraphicsError>;

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutHandle, GraphicsError>;

    fn allocate_descriptor_set(
        &self,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle, GraphicsError>;

    /// Point a buffer binding of a descriptor set at `buffer[offset..offset + range]`.
    fn write_buffer_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        ty: DescriptorType,
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    ) -> Result<(), GraphicsError>;

    fn create_pipeline_layout(
        &self,
        descriptor: &PipelineLayoutDescriptor,
    ) -> Result<PipelineLayoutHandle, GraphicsError>;

    fn create_render_pass(
        &self,
        descriptor: &RenderPassDescriptor,
    ) -> Result<RenderPassHandle, GraphicsError>;

    fn create_framebuffer(
        &self,
        descriptor: &FramebufferDescriptor,
    ) -> Result<FramebufferHandle, GraphicsError>;

    fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> Result<PipelineHandle, GraphicsError>;

    /// Destroy a native object immediately.
    ///
    /// The caller guarantees the GPU no longer references it; normally this
    /// is only called from the destruction queue.
    fn destroy(&self, resource: GpuResource);

    // === Commands ===

    /// Create a command pool whose buffers can be reset individually.
    fn create_command_pool(&self) -> Result<CommandPoolHandle, GraphicsError>;

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        level: CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>, GraphicsError>;

    /// Reset and begin recording.
    fn begin_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        begin: &CommandBufferBegin,
    ) -> Result<(), GraphicsError>;

    fn end_command_buffer(&self, command_buffer: CommandBufferHandle)
    -> Result<(), GraphicsError>;

    /// Record one command.
    fn record(&self, command_buffer: CommandBufferHandle, command: Command);

    fn submit(&self, submission: &Submission) -> Result<(), GraphicsError>;
}

/// Selects and creates the backend requested by the configuration.
///
/// [`BackendType::Auto`] tries Vulkan first and falls back to the dummy
/// device.
pub fn create_backend(config: &RendererConfig) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    match config.backend {
        BackendType::Dummy => create_dummy(),
        BackendType::Vulkan => create_vulkan(config),
        BackendType::Auto => match create_vulkan(config) {
            Ok(backend) => Ok(backend),
            Err(e) => {
                log::warn!("Failed to create Vulkan backend: {e}");
                create_dummy()
            }
        },
    }
}

#[cfg(feature = "vulkan-backend")]
fn create_vulkan(config: &RendererConfig) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    let backend = vulkan::VulkanBackend::new(config)?;
    log::info!("Using Vulkan backend (ash)");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "vulkan-backend"))]
fn create_vulkan(_config: &RendererConfig) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    Err(GraphicsError::FeatureNotSupported(
        "built without the vulkan-backend feature".to_string(),
    ))
}

#[cfg(feature = "dummy")]
fn create_dummy() -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    log::info!("Using dummy backend");
    Ok(Arc::new(dummy::DummyBackend::new()))
}

#[cfg(not(feature = "dummy"))]
fn create_dummy() -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    Err(GraphicsError::FeatureNotSupported(
        "built without the dummy feature".to_string(),
    ))
}

/// Check if a real GPU backend is compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(feature = "vulkan-backend")
}
