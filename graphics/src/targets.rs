//! Render targets and swapchain images.
//!
//! Stages name their outputs by [`RenderTargetId`]; the registry maps ids to
//! the current native textures. Targets sized relative to the swapchain are
//! recreated on resize while their ids stay stable.
//!
//! New textures start out `Undefined`; the frame that first uses them moves
//! them into their settled layout.

use std::sync::Arc;

use crate::backend::GpuBackend;
use crate::destruction::DestructionQueue;
use crate::error::GraphicsError;
use crate::handle::{SemaphoreHandle, TextureHandle};
use crate::resource::{GpuResource, PartialBuild};
use crate::types::{Extent2d, SampleCount, TextureDescriptor, TextureFormat, TextureUsage};

/// Presentable images owned by the platform layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainImages {
    pub images: Vec<TextureHandle>,
    pub format: TextureFormat,
    pub extent: Extent2d,
}

/// The image acquired for the upcoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentImage {
    /// Index into [`SwapchainImages::images`].
    pub index: u32,
    /// Signaled by the platform once the image may be rendered to.
    pub image_available: Option<SemaphoreHandle>,
}

/// Identifier of a registered render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTargetId(pub(crate) u32);

impl RenderTargetId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetSize {
    Absolute(Extent2d),
    /// Scaled from the swapchain extent, at least one pixel.
    SwapchainRelative(f32),
}

impl TargetSize {
    fn resolve(self, swapchain: Extent2d) -> Extent2d {
        match self {
            Self::Absolute(extent) => extent,
            Self::SwapchainRelative(scale) => Extent2d::new(
                ((swapchain.width as f32 * scale) as u32).max(1),
                ((swapchain.height as f32 * scale) as u32).max(1),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetDescriptor {
    pub label: String,
    pub format: TextureFormat,
    pub size: TargetSize,
    pub samples: SampleCount,
}

impl RenderTargetDescriptor {
    pub fn new(label: impl Into<String>, format: TextureFormat, size: TargetSize) -> Self {
        Self {
            label: label.into(),
            format,
            size,
            samples: SampleCount::X1,
        }
    }

    pub fn with_samples(mut self, samples: SampleCount) -> Self {
        self.samples = samples;
        self
    }
}

/// Current native state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetInfo {
    pub texture: TextureHandle,
    pub format: TextureFormat,
    pub extent: Extent2d,
    pub samples: SampleCount,
}

impl RenderTargetInfo {
    pub(crate) fn resource(&self) -> GpuResource {
        if self.format.is_depth_stencil() {
            GpuResource::DepthBuffer(self.texture)
        } else {
            GpuResource::RenderTarget(self.texture)
        }
    }
}

#[derive(Clone)]
struct Entry {
    descriptor: RenderTargetDescriptor,
    info: RenderTargetInfo,
}

/// Registry of render targets.
pub struct RenderTargets {
    backend: Arc<dyn GpuBackend>,
    entries: Vec<Entry>,
}

impl RenderTargets {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            entries: Vec::new(),
        }
    }

    /// Create a target. `swapchain` resolves relative sizes.
    pub fn create(
        &mut self,
        descriptor: RenderTargetDescriptor,
        swapchain: Extent2d,
    ) -> Result<RenderTargetId, GraphicsError> {
        let info = self.allocate(&descriptor, swapchain)?;
        log::debug!(
            "Render target '{}' created ({}x{}, {:?})",
            descriptor.label,
            info.extent.width,
            info.extent.height,
            info.format
        );
        self.entries.push(Entry { descriptor, info });
        Ok(RenderTargetId(self.entries.len() as u32 - 1))
    }

    fn allocate(
        &self,
        descriptor: &RenderTargetDescriptor,
        swapchain: Extent2d,
    ) -> Result<RenderTargetInfo, GraphicsError> {
        let extent = descriptor.size.resolve(swapchain);
        let mut usage = TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING;
        if !descriptor.format.is_depth_stencil() {
            usage |= TextureUsage::COPY_SRC | TextureUsage::COPY_DST;
        }
        let texture = self.backend.create_texture(
            &TextureDescriptor::new(extent, descriptor.format, usage)
                .with_label(descriptor.label.clone())
                .with_samples(descriptor.samples),
        )?;
        Ok(RenderTargetInfo {
            texture,
            format: descriptor.format,
            extent,
            samples: descriptor.samples,
        })
    }

    /// Look up a target. Unknown ids are a programmer error.
    pub fn get(&self, id: RenderTargetId) -> &RenderTargetInfo {
        match self.entries.get(id.index()) {
            Some(entry) => &entry.info,
            None => panic!("unknown render target {id:?}"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderTargetInfo> {
        self.entries.iter().map(|entry| &entry.info)
    }

    /// The registry for a new swapchain extent.
    ///
    /// Swapchain-relative targets get new textures in the returned registry;
    /// `self` is left untouched and keeps its textures. On error nothing
    /// created here survives.
    pub fn resized(&self, swapchain: Extent2d) -> Result<Self, GraphicsError> {
        let mut build = PartialBuild::new(Arc::clone(&self.backend));
        let mut entries = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let mut entry = entry.clone();
            if let TargetSize::SwapchainRelative(_) = entry.descriptor.size {
                entry.info = self.allocate(&entry.descriptor, swapchain)?;
                build.track(entry.info.resource());
            }
            entries.push(entry);
        }
        build.finish();
        Ok(Self {
            backend: Arc::clone(&self.backend),
            entries,
        })
    }

    /// Targets whose texture is not the one `other` has for the same id.
    pub fn changed_from(&self, other: &Self) -> Vec<RenderTargetInfo> {
        self.entries
            .iter()
            .zip(&other.entries)
            .filter(|(entry, previous)| entry.info.texture != previous.info.texture)
            .map(|(entry, _)| entry.info)
            .collect()
    }

    /// Retire every target texture.
    pub fn release(&mut self, queue: &DestructionQueue) {
        queue.retire_all(self.entries.drain(..).map(|entry| entry.info.resource()));
    }
}

impl std::fmt::Debug for RenderTargets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| &e.descriptor.label))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use inflight_core::tasks::TaskSystem;

    #[test]
    fn test_relative_targets_follow_swapchain() {
        let backend = Arc::new(DummyBackend::new());
        let queue = DestructionQueue::new(backend.clone(), Arc::new(TaskSystem::new(0)), 2);
        let mut targets = RenderTargets::new(backend.clone());

        let half = targets
            .create(
                RenderTargetDescriptor::new(
                    "half",
                    TextureFormat::Rgba16Float,
                    TargetSize::SwapchainRelative(0.5),
                ),
                Extent2d::new(800, 600),
            )
            .unwrap();
        let fixed = targets
            .create(
                RenderTargetDescriptor::new(
                    "shadow",
                    TextureFormat::Depth32Float,
                    TargetSize::Absolute(Extent2d::new(1024, 1024)),
                ),
                Extent2d::new(800, 600),
            )
            .unwrap();
        assert_eq!(targets.get(half).extent, Extent2d::new(400, 300));

        let resized = targets.resized(Extent2d::new(1000, 500)).unwrap();
        assert_eq!(resized.get(half).extent, Extent2d::new(500, 250));
        assert_ne!(resized.get(half).texture, targets.get(half).texture);
        assert_eq!(resized.get(fixed).texture, targets.get(fixed).texture);
        // The original registry still owns its textures until swapped out.
        assert!(backend.is_alive(&GpuResource::RenderTarget(targets.get(half).texture)));

        let replaced = targets.changed_from(&resized);
        assert_eq!(replaced, vec![*targets.get(half)]);
        queue.retire_all(replaced.iter().map(RenderTargetInfo::resource));
        targets = resized;
        queue.flush();
        assert_eq!(backend.live_objects(), 2);
        targets.release(&queue);
        queue.flush();
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_failed_resize_keeps_the_old_targets() {
        let backend = Arc::new(DummyBackend::new());
        let mut targets = RenderTargets::new(backend.clone());
        for (label, scale) in [("full", 1.0), ("supersampled", 2.0)] {
            targets
                .create(
                    RenderTargetDescriptor::new(
                        label,
                        TextureFormat::Rgba8Unorm,
                        TargetSize::SwapchainRelative(scale),
                    ),
                    Extent2d::new(64, 64),
                )
                .unwrap();
        }

        // The first target fits the device limit, the doubled one does not.
        assert!(targets.resized(Extent2d::new(9_000, 1)).is_err());
        assert_eq!(backend.live_objects(), 2);
        assert!(targets.iter().all(|info| backend
            .is_alive(&GpuResource::RenderTarget(info.texture))));
    }
}
