//! Stage recording on worker threads.
//!
//! Each frame the engine spawns one task per stage with a registered
//! [`StageRecorder`]. The task receives a [`StageFrame`] by value, begins the
//! stage's secondary command buffer for the current slot and hands the
//! recorder a [`StageEncoder`]. Tasks share no mutable state.

use std::sync::Arc;

use inflight_core::math::Mat4;

use crate::assembler::StageHandle;
use crate::backend::{Command, CommandBufferBegin, GpuBackend, InheritanceInfo};
use crate::error::fatal;
use crate::handle::{
    BufferHandle, CommandBufferHandle, DescriptorSetHandle, PipelineHandle, PipelineLayoutHandle,
};
use crate::renderable::{FrameScene, Renderable, VisibilityFlags};
use crate::types::{Extent2d, IndexFormat, ShaderStages};

/// Everything a stage task needs for one frame, passed by value.
#[derive(Debug, Clone)]
pub struct StageFrame {
    /// Frame slot being recorded.
    pub frame_index: u32,
    /// Swapchain image the frame presents to.
    pub image_index: u32,
    pub stage: StageHandle,
    pub command_buffer: CommandBufferHandle,
    pub inheritance: InheritanceInfo,
    pub pipeline: Option<PipelineHandle>,
    pub pipeline_layout: PipelineLayoutHandle,
    pub extent: Extent2d,
    /// Descriptor sets of the frame slot.
    pub descriptor_sets: Vec<DescriptorSetHandle>,
    pub dynamic_uniform_buffer: BufferHandle,
    pub scene: Arc<FrameScene>,
}

static_assertions::assert_impl_all!(StageFrame: Send, Sync);

/// Records the commands of one stage.
///
/// Called from worker threads, once per frame, with the stage's own
/// secondary command buffer already begun.
pub trait StageRecorder: Send + Sync + 'static {
    fn record(&self, frame: &StageFrame, encoder: &mut StageEncoder);
}

impl<F> StageRecorder for F
where
    F: Fn(&StageFrame, &mut StageEncoder) + Send + Sync + 'static,
{
    fn record(&self, frame: &StageFrame, encoder: &mut StageEncoder) {
        self(frame, encoder)
    }
}

/// Command writer over one secondary command buffer.
pub struct StageEncoder {
    backend: Arc<dyn GpuBackend>,
    command_buffer: CommandBufferHandle,
    draws: u32,
}

impl StageEncoder {
    pub fn new(backend: Arc<dyn GpuBackend>, command_buffer: CommandBufferHandle) -> Self {
        Self {
            backend,
            command_buffer,
            draws: 0,
        }
    }

    fn push(&mut self, command: Command) {
        log::trace!("Recording {command:?}");
        self.backend.record(self.command_buffer, command);
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.push(Command::BindPipeline(pipeline));
    }

    pub fn bind_descriptor_sets(
        &mut self,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
        dynamic_offsets: &[u32],
    ) {
        self.push(Command::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    pub fn push_constants<T: bytemuck::Pod>(
        &mut self,
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        value: &T,
    ) {
        self.push(Command::PushConstants {
            layout,
            stages,
            offset,
            data: bytemuck::bytes_of(value).to_vec(),
        });
    }

    /// Push a column-major 4x4 matrix.
    pub fn push_matrix(
        &mut self,
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        matrix: &Mat4,
    ) {
        self.push(Command::PushConstants {
            layout,
            stages,
            offset,
            data: bytemuck::cast_slice::<f32, u8>(matrix.as_slice()).to_vec(),
        });
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: BufferHandle, offset: u64) {
        self.push(Command::BindVertexBuffers {
            first_binding: binding,
            buffers: vec![(buffer, offset)],
        });
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.push(Command::BindIndexBuffer {
            buffer,
            offset,
            format,
        });
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        });
        self.draws += 1;
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, vertex_offset: i32) {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index: 0,
            vertex_offset,
            first_instance: 0,
        });
        self.draws += 1;
    }

    /// Draw calls recorded so far.
    pub fn draw_count(&self) -> u32 {
        self.draws
    }

    /// Bind and draw one renderable with its transform pushed to the vertex stage.
    fn draw_renderable(
        &mut self,
        layout: PipelineLayoutHandle,
        matrix: &Mat4,
        renderable: &Renderable,
        material_set: Option<u32>,
    ) {
        if let (Some(set), Some(material)) = (material_set, renderable.material) {
            self.bind_descriptor_sets(layout, set, &[material], &[]);
        }
        self.push_matrix(layout, ShaderStages::VERTEX, 0, matrix);
        self.bind_vertex_buffer(0, renderable.vertex_buffer, 0);
        match renderable.index_buffer {
            Some((buffer, format)) => {
                self.bind_index_buffer(buffer, 0, format);
                self.draw_indexed(renderable.element_count, 1, 0);
            }
            None => self.draw(renderable.element_count, 1),
        }
    }
}

/// Result of one stage task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StageOutput {
    pub stage: StageHandle,
    pub draws: u32,
}

/// Body of a stage task: begin, record, end.
pub(crate) fn record_stage(
    backend: Arc<dyn GpuBackend>,
    recorder: &dyn StageRecorder,
    frame: StageFrame,
) -> StageOutput {
    inflight_core::profile_scope!("record_stage");
    if let Err(e) = backend.begin_command_buffer(
        frame.command_buffer,
        &CommandBufferBegin::Secondary(frame.inheritance),
    ) {
        fatal("begin a stage command buffer", e);
    }
    let mut encoder = StageEncoder::new(Arc::clone(&backend), frame.command_buffer);
    recorder.record(&frame, &mut encoder);
    let draws = encoder.draw_count();
    if let Err(e) = backend.end_command_buffer(frame.command_buffer) {
        fatal("end a stage command buffer", e);
    }
    StageOutput {
        stage: frame.stage,
        draws,
    }
}

/// Draws every renderable whose visibility contains a mask.
///
/// Pushes `view_projection * transform` at offset 0 of the vertex stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderableStage {
    mask: VisibilityFlags,
    frame_set: Option<u32>,
    material_set: Option<u32>,
}

impl RenderableStage {
    pub fn new(mask: VisibilityFlags) -> Self {
        Self {
            mask,
            frame_set: None,
            material_set: None,
        }
    }

    /// Bind the frame slot's first descriptor set at `set`.
    pub fn with_frame_set(mut self, set: u32) -> Self {
        self.frame_set = Some(set);
        self
    }

    /// Bind each renderable's material at `set`.
    pub fn with_material_set(mut self, set: u32) -> Self {
        self.material_set = Some(set);
        self
    }
}

impl StageRecorder for RenderableStage {
    fn record(&self, frame: &StageFrame, encoder: &mut StageEncoder) {
        let mut visible = frame.scene.filter(self.mask).peekable();
        if visible.peek().is_none() {
            return;
        }
        let Some(pipeline) = frame.pipeline else {
            return;
        };
        encoder.bind_pipeline(pipeline);
        bind_frame_set(encoder, frame, self.frame_set);
        for renderable in visible {
            let matrix = frame.scene.view_projection * renderable.transform;
            encoder.draw_renderable(frame.pipeline_layout, &matrix, renderable, self.material_set);
        }
    }
}

/// Draws the shadow casters of one cascade with its light matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowCascadeStage {
    cascade: usize,
}

impl ShadowCascadeStage {
    pub fn new(cascade: usize) -> Self {
        Self { cascade }
    }
}

impl StageRecorder for ShadowCascadeStage {
    fn record(&self, frame: &StageFrame, encoder: &mut StageEncoder) {
        let (Some(cascade), Some(pipeline)) =
            (frame.scene.cascades.get(self.cascade), frame.pipeline)
        else {
            return;
        };
        let mask = VisibilityFlags::SHADOW_CASTER | VisibilityFlags::cascade(self.cascade);
        let mut bound = false;
        for renderable in frame.scene.filter(mask) {
            if !bound {
                encoder.bind_pipeline(pipeline);
                bound = true;
            }
            let matrix = cascade.light_matrix * renderable.transform;
            encoder.draw_renderable(frame.pipeline_layout, &matrix, renderable, None);
        }
    }
}

/// One full-screen triangle, for post-processing and composition stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FullscreenStage {
    frame_set: Option<u32>,
}

impl FullscreenStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_set(mut self, set: u32) -> Self {
        self.frame_set = Some(set);
        self
    }
}

impl StageRecorder for FullscreenStage {
    fn record(&self, frame: &StageFrame, encoder: &mut StageEncoder) {
        let Some(pipeline) = frame.pipeline else {
            return;
        };
        encoder.bind_pipeline(pipeline);
        bind_frame_set(encoder, frame, self.frame_set);
        encoder.draw(3, 1);
    }
}

fn bind_frame_set(encoder: &mut StageEncoder, frame: &StageFrame, set: Option<u32>) {
    if let (Some(set), Some(&descriptor_set)) = (set, frame.descriptor_sets.first()) {
        // Dynamic offset 0: the stage reads the start of the slot's uniform buffer.
        encoder.bind_descriptor_sets(frame.pipeline_layout, set, &[descriptor_set], &[0]);
    }
}
