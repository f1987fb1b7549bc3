//! Creation descriptors for render passes, framebuffers and pipelines.

use crate::handle::{
    DescriptorSetLayoutHandle, PipelineLayoutHandle, RenderPassHandle, ShaderModuleHandle,
    TextureHandle,
};
use crate::types::{
    BlendState, DepthStencilState, Extent2d, LoadOp, PrimitiveTopology, PushConstantRange,
    RasterState, SampleCount, ShaderStages, StoreOp, TextureFormat, TextureLayout, VertexLayout,
    Viewport,
};

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentDescriptor {
    pub format: TextureFormat,
    pub samples: SampleCount,
    pub load: LoadOp,
    pub store: StoreOp,
    pub initial_layout: TextureLayout,
    pub final_layout: TextureLayout,
}

/// Attachment references of one subpass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubpassDescriptor {
    /// Indices into the render pass attachment list.
    pub color_attachments: Vec<u32>,
    pub depth_attachment: Option<u32>,
}

/// Execution and memory ordering between two subpasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubpassDependency {
    /// `None` orders against work outside the render pass.
    pub src_subpass: Option<u32>,
    pub dst_subpass: u32,
    /// Color attachment writes must complete first.
    pub color: bool,
    /// Depth attachment accesses must complete first.
    pub depth: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub attachments: Vec<AttachmentDescriptor>,
    pub subpasses: Vec<SubpassDescriptor>,
    pub dependencies: Vec<SubpassDependency>,
}

impl RenderPassDescriptor {
    /// Clear value for every attachment, in attachment order.
    ///
    /// Attachments that are not cleared get a placeholder value.
    pub fn clear_values(&self) -> Vec<crate::types::ClearValue> {
        self.attachments
            .iter()
            .map(|attachment| attachment.load.clear_value().unwrap_or_default())
            .collect()
    }

    /// Returns true if beginning this pass clears any attachment.
    pub fn has_clears(&self) -> bool {
        self.attachments.iter().any(|a| a.load.is_clear())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDescriptor {
    pub render_pass: RenderPassHandle,
    /// One texture per render pass attachment, in the same order.
    pub attachments: Vec<TextureHandle>,
    pub extent: Extent2d,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineLayoutDescriptor {
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub push_constants: Vec<PushConstantRange>,
}

/// A compiled shader bound to one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineShaderStage {
    /// Exactly one stage bit.
    pub stage: ShaderStages,
    pub module: ShaderModuleHandle,
    pub entry_point: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<String>,
    pub stages: Vec<PipelineShaderStage>,
    pub vertex_layout: VertexLayout,
    pub topology: PrimitiveTopology,
    /// Control points per patch, used with [`PrimitiveTopology::PatchList`].
    pub patch_control_points: u32,
    pub raster: RasterState,
    pub depth_stencil: DepthStencilState,
    /// `None` disables blending.
    pub blend: Option<BlendState>,
    pub color_attachment_count: u32,
    pub samples: SampleCount,
    pub layout: PipelineLayoutHandle,
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub viewport: Viewport,
    pub scissor: Extent2d,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClearValue;

    #[test]
    fn test_clear_values_follow_attachment_order() {
        let depth = AttachmentDescriptor {
            format: TextureFormat::Depth32Float,
            samples: SampleCount::X1,
            load: LoadOp::Clear(ClearValue::depth(1.0)),
            store: StoreOp::DontCare,
            initial_layout: TextureLayout::Undefined,
            final_layout: TextureLayout::DepthStencilAttachment,
        };
        let color = AttachmentDescriptor {
            format: TextureFormat::Rgba8Unorm,
            load: LoadOp::Load,
            store: StoreOp::Store,
            initial_layout: TextureLayout::ShaderReadOnly,
            final_layout: TextureLayout::ShaderReadOnly,
            ..depth
        };
        let desc = RenderPassDescriptor {
            attachments: vec![depth, color],
            ..Default::default()
        };

        assert!(desc.has_clears());
        assert_eq!(
            desc.clear_values(),
            vec![ClearValue::depth(1.0), ClearValue::default()]
        );
    }
}
