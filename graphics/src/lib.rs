//! # inflight graphics
//!
//! Frame orchestration and GPU resource lifecycle.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`PipelineAssembler`] - Turns declarative [`RenderStageDescription`]s into
//!   render passes, framebuffers, pipelines and per-slot command buffers
//! - [`FrameEngine`] - The frames-in-flight loop: parallel stage recording,
//!   concatenation into one primary buffer, fence-gated submission
//! - [`FrameData`] - Per-slot command buffers, fences, semaphores and
//!   dynamic uniforms
//! - [`DestructionQueue`] - Deferred destruction of retired GPU objects
//! - Backends: Vulkan and Dummy (for testing)
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use inflight_graphics::{
//!     BackendType, ClearValue, FrameDataLayout, FrameEngine, FrameScene, LoadOp, OutputTarget,
//!     PipelineAssembler, PresentImage, RenderStageDescription, RendererConfig, RenderingContext,
//! };
//! # use inflight_graphics::{Extent2d, GpuBackend, SwapchainImages, TextureDescriptor,
//! #     TextureFormat, TextureUsage};
//!
//! let config = RendererConfig::new().with_backend(BackendType::Dummy);
//! let context = RenderingContext::new(config).unwrap();
//! # let extent = Extent2d::new(64, 64);
//! # let image = context.backend().create_texture(&TextureDescriptor::new(
//! #     extent, TextureFormat::Bgra8Unorm, TextureUsage::RENDER_ATTACHMENT)).unwrap();
//! # let swapchain = SwapchainImages { images: vec![image], format: TextureFormat::Bgra8Unorm, extent };
//!
//! let mut assembler = PipelineAssembler::new(&context, swapchain);
//! assembler
//!     .finalize(
//!         RenderStageDescription::new("clear")
//!             .with_output(OutputTarget::Screen)
//!             .with_color_load(LoadOp::Clear(ClearValue::color(0.1, 0.1, 0.1, 1.0))),
//!     )
//!     .unwrap();
//!
//! let mut engine = FrameEngine::new(&context, &FrameDataLayout::new(256)).unwrap();
//! let image = PresentImage { index: 0, image_available: None };
//! engine.render_frame(&assembler, image, Arc::new(FrameScene::new()));
//!
//! engine.shutdown();
//! assembler.release();
//! context.shutdown().unwrap();
//! ```

pub mod arena;
pub mod assembler;
pub mod backend;
pub mod concat;
pub mod config;
pub mod context;
pub mod destruction;
pub mod engine;
pub mod error;
pub mod frame_data;
pub mod handle;
pub mod recording;
pub mod renderable;
pub mod resource;
pub mod stage;
pub mod targets;
pub mod types;

// Re-export main types for convenience
pub use assembler::{NativeCopy, NativeStageData, PipelineAssembler, StageHandle};
#[cfg(feature = "dummy")]
pub use backend::dummy::{CompletionMode, DummyBackend, DummyStats};
pub use backend::{GpuBackend, create_backend};
pub use config::{BackendType, MAX_FRAMES_IN_FLIGHT, RendererConfig, ShadowConfig};
pub use context::RenderingContext;
pub use destruction::{DestructionQueue, DestructionRecord};
pub use engine::{FrameEngine, FrameStats};
pub use error::GraphicsError;
pub use frame_data::{FrameData, FrameDataLayout, FrameSlot};
pub use handle::*;
pub use recording::{
    FullscreenStage, RenderableStage, ShadowCascadeStage, StageEncoder, StageFrame, StageRecorder,
};
pub use renderable::{Bounds, FrameScene, Renderable, VisibilityFlags};
pub use resource::{GpuResource, ResourceKind};
pub use stage::{OutputTarget, RenderStageDescription, ShaderStageSource};
pub use targets::{
    PresentImage, RenderTargetDescriptor, RenderTargetId, SwapchainImages, TargetSize,
};
pub use types::{
    BufferDescriptor, BufferUsage, ClearValue, DepthStencilState, Extent2d, LoadOp, SampleCount,
    ShaderStages, StoreOp, TextureDescriptor, TextureFormat, TextureLayout, TextureUsage,
};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
