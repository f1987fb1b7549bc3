//! Command stream vocabulary shared by every backend.
//!
//! The engine and stage recorders talk to a command buffer through
//! [`Command`] values. Native backends translate each one into the matching
//! API call as it arrives; the dummy backend stores them for replay.

use crate::handle::{
    BufferHandle, CommandBufferHandle, DescriptorSetHandle, FenceHandle, FramebufferHandle,
    PipelineHandle, PipelineLayoutHandle, RenderPassHandle, SemaphoreHandle, TextureHandle,
};
use crate::types::{ClearValue, Extent2d, IndexFormat, ShaderStages, TextureLayout};

/// Level of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    /// Submitted directly to a queue.
    Primary,
    /// Executed from inside a primary buffer's render pass.
    Secondary,
}

/// Render pass state a secondary buffer continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InheritanceInfo {
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    /// Framebuffer the buffer will run against, when known at record time.
    pub framebuffer: Option<FramebufferHandle>,
}

/// How a command buffer is begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferBegin {
    /// One-time-submit primary buffer.
    Primary,
    /// Secondary buffer continuing a render pass.
    Secondary(InheritanceInfo),
}

/// Where the contents of a subpass come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubpassContents {
    Inline,
    SecondaryCommandBuffers,
}

/// A single recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2d,
        /// One entry per attachment, in attachment order.
        clear_values: Vec<ClearValue>,
        contents: SubpassContents,
    },
    NextSubpass {
        contents: SubpassContents,
    },
    EndRenderPass,
    ExecuteCommands(Vec<CommandBufferHandle>),
    /// Full-image layout transition.
    TextureBarrier {
        texture: TextureHandle,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
    },
    /// Whole-image copy. Both textures must match in extent and format.
    CopyTexture {
        source: TextureHandle,
        destination: TextureHandle,
        extent: Extent2d,
    },
    BindPipeline(PipelineHandle),
    BindDescriptorSets {
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: Vec<DescriptorSetHandle>,
        dynamic_offsets: Vec<u32>,
    },
    PushConstants {
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        data: Vec<u8>,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<(BufferHandle, u64)>,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

impl Command {
    /// Returns true for draw calls.
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. })
    }
}

/// One queue submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub command_buffer: CommandBufferHandle,
    /// Waited on at the color-attachment-output stage.
    pub wait_semaphores: Vec<SemaphoreHandle>,
    pub signal_semaphores: Vec<SemaphoreHandle>,
    /// Signaled once the submission has finished executing.
    pub fence: Option<FenceHandle>,
}
