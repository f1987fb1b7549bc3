//! Common utilities for frame loop integration tests.
//!
//! This module provides a small harness that wires a [`RenderingContext`],
//! a [`PipelineAssembler`] and a [`FrameEngine`] together for a backend.

#![allow(dead_code)]

use std::sync::Arc;

use inflight_graphics::{
    BackendType, CompletionMode, DummyBackend, Extent2d, FrameDataLayout, FrameEngine, FrameScene,
    GpuBackend, GpuResource, GraphicsError, PipelineAssembler, PresentImage, RendererConfig,
    RenderingContext, SwapchainImages, TextureDescriptor, TextureFormat, TextureHandle,
    TextureLayout, TextureUsage,
};

/// Extent of the presentable images used by the tests.
pub const EXTENT: Extent2d = Extent2d::new(8, 8);

/// Format of the presentable images used by the tests.
pub const SWAPCHAIN_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// Initialize logging once per test binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Available device backends for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Software device with manually completed submissions.
    Dummy,
    /// Vulkan backend (native via ash).
    Vulkan,
}

impl Backend {
    /// Check if this backend is compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Dummy => true,
            #[cfg(feature = "vulkan-backend")]
            Backend::Vulkan => true,
            #[cfg(not(feature = "vulkan-backend"))]
            Backend::Vulkan => false,
        }
    }

    /// Get the backend name for display.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Dummy => "dummy",
            Backend::Vulkan => "vulkan",
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// Everything a frame loop test needs.
pub struct TestContext {
    pub backend: Backend,
    /// Set for the dummy backend so tests can drive completion and inspect state.
    pub dummy: Option<Arc<DummyBackend>>,
    pub context: RenderingContext,
    pub assembler: PipelineAssembler,
    pub swapchain: SwapchainImages,
}

impl TestContext {
    /// Create a context with `frames` frame slots and `images` swapchain images.
    ///
    /// Returns `None` if the backend is not available on this machine.
    pub fn new(backend: Backend, frames: u32, images: u32) -> Option<Self> {
        init_logging();
        if !backend.is_available() {
            return None;
        }

        let config = RendererConfig::new()
            .with_frames_in_flight(frames)
            .with_worker_threads(2)
            .with_validation(false);
        let (context, dummy) = match backend {
            Backend::Dummy => {
                let dummy = Arc::new(DummyBackend::with_completion(CompletionMode::Deferred));
                let context = RenderingContext::with_backend(
                    config.with_backend(BackendType::Dummy),
                    dummy.clone(),
                );
                (context, Some(dummy))
            }
            Backend::Vulkan => {
                let context =
                    RenderingContext::new(config.with_backend(BackendType::Vulkan)).ok()?;
                (context, None)
            }
        };

        let swapchain = create_swapchain(context.backend().as_ref(), images).ok()?;
        let assembler = PipelineAssembler::new(&context, swapchain.clone());

        Some(Self {
            backend,
            dummy,
            context,
            assembler,
            swapchain,
        })
    }

    /// The dummy device. Panics for other backends.
    pub fn dummy(&self) -> &DummyBackend {
        self.dummy
            .as_deref()
            .expect("test requires the dummy backend")
    }

    pub fn engine(&self) -> FrameEngine {
        FrameEngine::new(&self.context, &FrameDataLayout::new(256))
            .expect("Failed to create frame engine")
    }

    pub fn screen_image(&self, index: u32) -> TextureHandle {
        self.swapchain.images[index as usize]
    }

    /// Read back a presented swapchain image.
    pub fn read_screen(&self, index: u32) -> Vec<u8> {
        self.context
            .backend()
            .read_texture(self.screen_image(index), TextureLayout::PresentSrc)
            .expect("Failed to read back swapchain image")
    }

    /// Retire everything and destroy it, in shutdown order.
    pub fn shutdown(mut self, engine: FrameEngine) {
        engine.shutdown();
        self.assembler.release();
        self.context
            .shutdown()
            .expect("Failed to shut down rendering context");
        for image in self.swapchain.images.drain(..) {
            self.context.backend().destroy(GpuResource::Texture(image));
        }
    }
}

/// Present image `index` with no acquire semaphore.
pub fn present(index: u32) -> PresentImage {
    PresentImage {
        index,
        image_available: None,
    }
}

pub fn empty_scene() -> Arc<FrameScene> {
    Arc::new(FrameScene::new())
}

/// Offscreen stand-ins for the images a platform swapchain would provide.
fn create_swapchain(
    backend: &dyn GpuBackend,
    images: u32,
) -> Result<SwapchainImages, GraphicsError> {
    let descriptor = TextureDescriptor::new(
        EXTENT,
        SWAPCHAIN_FORMAT,
        TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
    );
    let images = (0..images)
        .map(|_| backend.create_texture(&descriptor))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SwapchainImages {
        images,
        format: SWAPCHAIN_FORMAT,
        extent: EXTENT,
    })
}

/// Expected bytes of an RGBA8 image cleared to `rgba`.
pub fn rgba8_image(rgba: [u8; 4]) -> Vec<u8> {
    rgba.repeat(EXTENT.area() as usize)
}
