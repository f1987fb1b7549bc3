//! Textures, attachment formats and the layouts attachments move through.

use bitflags::bitflags;

use super::{Extent2d, LoadOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum TextureFormat {
    R32Float,
    #[default]
    Rgba8Unorm,
    Rgba8UnormSrgb,
    /// Common swapchain format.
    Bgra8Unorm,
    Bgra8UnormSrgb,
    /// HDR color targets.
    Rgba16Float,
    Rgba32Float,
    Depth16Unorm,
    Depth24PlusStencil8,
    /// Shadow maps and scene depth.
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth_stencil(&self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm | Self::Depth24PlusStencil8 | Self::Depth32Float
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, Self::Depth24PlusStencil8)
    }

    /// Bytes per texel.
    pub fn block_size(&self) -> u32 {
        match self {
            Self::Depth16Unorm => 2,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
            _ => 4,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        /// Sampled by later stages.
        const TEXTURE_BINDING = 1 << 2;
        const RENDER_ATTACHMENT = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum SampleCount {
    #[default]
    X1,
    X2,
    X4,
    X8,
}

impl SampleCount {
    pub fn count(self) -> u32 {
        1 << self as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub extent: Extent2d,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub samples: SampleCount,
}

impl TextureDescriptor {
    /// Single-sampled texture.
    pub fn new(extent: Extent2d, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            extent,
            format,
            usage,
            samples: SampleCount::X1,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_samples(mut self, samples: SampleCount) -> Self {
        self.samples = samples;
        self
    }

    /// Bytes of one sample plane.
    pub fn byte_size(&self) -> u64 {
        self.extent.area() * self.format.block_size() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureLayout {
    /// Contents undefined; only valid as the layout a pass starts from.
    #[default]
    Undefined,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

impl TextureLayout {
    /// Layout an attachment of `format` rests in between frames.
    ///
    /// Depth stays attachment-optimal, the screen image is left ready to
    /// present and every other color target is left sampleable.
    pub fn settled(format: TextureFormat, on_screen: bool) -> Self {
        if format.is_depth_stencil() {
            Self::DepthStencilAttachment
        } else if on_screen {
            Self::PresentSrc
        } else {
            Self::ShaderReadOnly
        }
    }

    /// Layout a pass starts from when it applies `load` to an attachment
    /// settled in `self`. Anything but a load discards the old contents.
    pub fn before_pass(self, load: LoadOp) -> Self {
        match load {
            LoadOp::Load => self,
            _ => Self::Undefined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClearValue;

    #[test]
    fn test_settled_layouts() {
        assert_eq!(
            TextureLayout::settled(TextureFormat::Depth32Float, false),
            TextureLayout::DepthStencilAttachment
        );
        assert_eq!(
            TextureLayout::settled(TextureFormat::Bgra8Unorm, true),
            TextureLayout::PresentSrc
        );
        assert_eq!(
            TextureLayout::settled(TextureFormat::Rgba16Float, false),
            TextureLayout::ShaderReadOnly
        );
    }

    #[test]
    fn test_only_load_keeps_contents() {
        let settled = TextureLayout::ShaderReadOnly;
        assert_eq!(settled.before_pass(LoadOp::Load), settled);
        assert_eq!(
            settled.before_pass(LoadOp::Clear(ClearValue::depth(1.0))),
            TextureLayout::Undefined
        );
        assert_eq!(settled.before_pass(LoadOp::DontCare), TextureLayout::Undefined);
    }

    #[test]
    fn test_byte_size() {
        let descriptor = TextureDescriptor::new(
            Extent2d::new(4, 2),
            TextureFormat::Rgba16Float,
            TextureUsage::RENDER_ATTACHMENT,
        );
        assert_eq!(descriptor.byte_size(), 64);
        assert_eq!(SampleCount::X8.count(), 8);
    }
}
