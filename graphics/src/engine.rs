//! The frames-in-flight loop.
//!
//! A frame runs in two halves:
//!
//! - [`FrameEngine::begin_frame`] selects the next slot, waits for the slot's
//!   previous submission to finish, sweeps the destruction queue, resets the
//!   slot fence and spawns one recording task per stage.
//! - [`FrameEngine::end_frame`] waits for every stage task (helping with
//!   queued work meanwhile), moves attachments no frame has used yet out of
//!   `Undefined`, concatenates the stage buffers into the slot's primary
//!   command buffer and submits it.
//!
//! The application may do other CPU work between the two calls while the
//! workers record.
//!
//! Slots are used round-robin in frame order, independent of which swapchain
//! image is presented. A slot's command buffers are only rewritten after its
//! fence reports that the device has finished with them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use inflight_core::tasks::{TaskHandle, TaskSystem};

use crate::assembler::{PipelineAssembler, StageHandle};
use crate::backend::{
    Command, CommandBufferBegin, GpuBackend, InheritanceInfo, Submission, SubpassContents,
};
use crate::concat::{PassOp, PlanStage, plan};
use crate::context::RenderingContext;
use crate::destruction::DestructionQueue;
use crate::error::{GraphicsError, fatal};
use crate::frame_data::{FrameData, FrameDataLayout};
use crate::handle::SemaphoreHandle;
use crate::recording::{StageFrame, StageOutput, StageRecorder, record_stage};
use crate::renderable::FrameScene;
use crate::targets::PresentImage;
use crate::types::TextureLayout;

/// Counters for one frame or accumulated over many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub frames: u64,
    pub render_passes_begun: u64,
    pub subpasses_advanced: u64,
    /// Stage buffers executed from the primary buffer.
    pub stages_executed: u64,
    pub copies: u64,
    pub draws: u64,
}

impl std::ops::AddAssign for FrameStats {
    fn add_assign(&mut self, other: Self) {
        self.frames += other.frames;
        self.render_passes_begun += other.render_passes_begun;
        self.subpasses_advanced += other.subpasses_advanced;
        self.stages_executed += other.stages_executed;
        self.copies += other.copies;
        self.draws += other.draws;
    }
}

struct FrameInFlight {
    slot: u32,
    image: PresentImage,
    tasks: Vec<TaskHandle<StageOutput>>,
}

/// Drives recording, concatenation and submission of frames.
pub struct FrameEngine {
    backend: Arc<dyn GpuBackend>,
    tasks: Arc<TaskSystem>,
    destruction: Arc<DestructionQueue>,
    frame_data: FrameData,
    recorders: HashMap<StageHandle, Arc<dyn StageRecorder>>,
    fence_timeout: Duration,
    frame_number: u64,
    current: Option<FrameInFlight>,
    last_stats: FrameStats,
    total_stats: FrameStats,
}

impl FrameEngine {
    /// Allocate the frame slots.
    pub fn new(
        context: &RenderingContext,
        layout: &FrameDataLayout,
    ) -> Result<Self, GraphicsError> {
        let frame_data =
            FrameData::initialize(Arc::clone(context.backend()), context.frame_count(), layout)?;
        Ok(Self {
            backend: Arc::clone(context.backend()),
            tasks: Arc::clone(context.tasks()),
            destruction: Arc::clone(context.destruction()),
            frame_data,
            recorders: HashMap::new(),
            fence_timeout: context.config().fence_timeout,
            frame_number: 0,
            current: None,
            last_stats: FrameStats::default(),
            total_stats: FrameStats::default(),
        })
    }

    /// Set the recorder invoked for `stage` every frame.
    ///
    /// Stages without a recorder record nothing but still take part in
    /// concatenation, so their clears happen.
    pub fn register_recorder(&mut self, stage: StageHandle, recorder: impl StageRecorder) {
        self.recorders.insert(stage, Arc::new(recorder));
    }

    pub fn unregister_recorder(&mut self, stage: StageHandle) {
        self.recorders.remove(&stage);
    }

    pub fn frame_data(&self) -> &FrameData {
        &self.frame_data
    }

    /// Frames begun so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn is_frame_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn last_stats(&self) -> FrameStats {
        self.last_stats
    }

    pub fn total_stats(&self) -> FrameStats {
        self.total_stats
    }

    /// Start a frame: wait for its slot, then dispatch stage recording.
    pub fn begin_frame(
        &mut self,
        assembler: &PipelineAssembler,
        image: PresentImage,
        scene: Arc<FrameScene>,
    ) {
        inflight_core::profile_function!();
        assert!(
            self.current.is_none(),
            "begin_frame called while frame {} is still open",
            self.frame_number
        );
        let slot = (self.frame_number % self.frame_data.frame_count() as u64) as u32;
        self.await_slot(slot);

        let frame_slot = self.frame_data.current_slot();
        let mut tasks = Vec::with_capacity(self.recorders.len());
        for &stage in assembler.stages() {
            let Some(recorder) = self.recorders.get(&stage) else {
                continue;
            };
            let native = assembler.native(stage);
            let frame = StageFrame {
                frame_index: slot,
                image_index: image.index,
                stage,
                command_buffer: native.command_buffers[slot as usize],
                inheritance: InheritanceInfo {
                    render_pass: native.render_pass,
                    subpass: native.subpass,
                    framebuffer: Some(native.framebuffer(image.index)),
                },
                pipeline: native.pipeline,
                pipeline_layout: native.pipeline_layout,
                extent: native.extent,
                descriptor_sets: frame_slot.descriptor_sets.clone(),
                dynamic_uniform_buffer: frame_slot.dynamic_uniform_buffer,
                scene: Arc::clone(&scene),
            };
            let backend = Arc::clone(&self.backend);
            let recorder = Arc::clone(recorder);
            tasks.push(
                self.tasks
                    .spawn(move || record_stage(backend, recorder.as_ref(), frame)),
            );
        }
        log::trace!("Frame {}: slot {slot}, {} stage tasks", self.frame_number, tasks.len());

        self.current = Some(FrameInFlight { slot, image, tasks });
    }

    /// Select the slot, wait for its fence, sweep retired resources, reset the fence.
    fn await_slot(&mut self, slot: u32) {
        inflight_core::profile_scope!("await_slot");
        self.frame_data.set_current_frame(slot);
        let fence = self.frame_data.current_fence();
        match self.backend.wait_fence(fence, self.fence_timeout) {
            Ok(true) => {}
            Ok(false) => fatal(
                "wait for the frame fence",
                GraphicsError::Timeout(self.fence_timeout),
            ),
            Err(e) => fatal("wait for the frame fence", e),
        }
        self.destruction
            .sweep(slot, &self.frame_data.fence_statuses());
        if let Err(e) = self.backend.reset_fence(fence) {
            fatal("reset the frame fence", e);
        }
    }

    /// Finish the frame: concatenate stage buffers and submit.
    ///
    /// Returns the semaphore the presentation must wait on.
    pub fn end_frame(&mut self, assembler: &PipelineAssembler) -> SemaphoreHandle {
        inflight_core::profile_function!();
        let Some(frame) = self.current.take() else {
            panic!("end_frame called without begin_frame");
        };

        let draws: HashMap<StageHandle, u32> = {
            inflight_core::profile_scope!("wait_all_stages");
            self.tasks
                .wait_all(frame.tasks)
                .into_iter()
                .map(|output| (output.stage, output.draws))
                .collect()
        };

        let stages = assembler.stages();
        let planned: Vec<PlanStage> = stages
            .iter()
            .map(|&stage| {
                let native = assembler.native(stage);
                PlanStage {
                    render_pass: native.render_pass,
                    subpass: native.subpass,
                    draws: draws.get(&stage).copied().unwrap_or(0),
                    has_copy: native.copy.is_some(),
                }
            })
            .collect();
        let ops = plan(&planned);

        let primary = self.frame_data.current_command_buffer();
        if let Err(e) = self
            .backend
            .begin_command_buffer(primary, &CommandBufferBegin::Primary)
        {
            fatal("begin the frame command buffer", e);
        }
        // Attachments this frame may load must not still be Undefined.
        for (texture, layout) in assembler.take_unsettled(frame.image.index) {
            self.backend.record(
                primary,
                Command::TextureBarrier {
                    texture,
                    old_layout: TextureLayout::Undefined,
                    new_layout: layout,
                },
            );
        }
        let mut stats = FrameStats {
            frames: 1,
            ..FrameStats::default()
        };
        for op in ops {
            self.encode(assembler, stages, frame.slot, frame.image.index, op, &mut stats);
        }
        stats.draws = planned.iter().map(|p| p.draws as u64).sum();
        if let Err(e) = self.backend.end_command_buffer(primary) {
            fatal("end the frame command buffer", e);
        }

        let render_finished = self.frame_data.current_render_finished();
        let submission = Submission {
            command_buffer: primary,
            wait_semaphores: frame.image.image_available.into_iter().collect(),
            signal_semaphores: vec![render_finished],
            fence: Some(self.frame_data.current_fence()),
        };
        if let Err(e) = self.backend.submit(&submission) {
            fatal("submit the frame", e);
        }

        log::debug!(
            "Frame {} submitted: {} passes, {} stage buffers, {} draws",
            self.frame_number,
            stats.render_passes_begun,
            stats.stages_executed,
            stats.draws
        );
        self.last_stats = stats;
        self.total_stats += stats;
        self.frame_number += 1;
        inflight_core::profile_plot!("draws", stats.draws);
        inflight_core::frame_mark!();
        render_finished
    }

    /// Translate one planned step into primary buffer commands.
    fn encode(
        &self,
        assembler: &PipelineAssembler,
        stages: &[StageHandle],
        slot: u32,
        image_index: u32,
        op: PassOp,
        stats: &mut FrameStats,
    ) {
        let primary = self.frame_data.current_command_buffer();
        match op {
            PassOp::Copy(index) => {
                let Some(copy) = assembler.native(stages[index]).copy else {
                    return;
                };
                let barrier = |texture, old_layout, new_layout| Command::TextureBarrier {
                    texture,
                    old_layout,
                    new_layout,
                };
                let commands = [
                    barrier(copy.source, TextureLayout::ShaderReadOnly, TextureLayout::TransferSrc),
                    barrier(copy.destination, TextureLayout::Undefined, TextureLayout::TransferDst),
                    Command::CopyTexture {
                        source: copy.source,
                        destination: copy.destination,
                        extent: copy.extent,
                    },
                    barrier(copy.source, TextureLayout::TransferSrc, TextureLayout::ShaderReadOnly),
                    barrier(
                        copy.destination,
                        TextureLayout::TransferDst,
                        TextureLayout::ShaderReadOnly,
                    ),
                ];
                for command in commands {
                    self.backend.record(primary, command);
                }
                stats.copies += 1;
            }
            PassOp::BeginRenderPass(index) => {
                let native = assembler.native(stages[index]);
                self.backend.record(
                    primary,
                    Command::BeginRenderPass {
                        render_pass: native.render_pass,
                        framebuffer: native.framebuffer(image_index),
                        extent: native.extent,
                        clear_values: native.clear_values.clone(),
                        contents: SubpassContents::SecondaryCommandBuffers,
                    },
                );
                stats.render_passes_begun += 1;
            }
            PassOp::NextSubpass => {
                self.backend.record(
                    primary,
                    Command::NextSubpass {
                        contents: SubpassContents::SecondaryCommandBuffers,
                    },
                );
                stats.subpasses_advanced += 1;
            }
            PassOp::Execute(index) => {
                let native = assembler.native(stages[index]);
                self.backend.record(
                    primary,
                    Command::ExecuteCommands(vec![native.command_buffers[slot as usize]]),
                );
                stats.stages_executed += 1;
            }
            PassOp::EndRenderPass => self.backend.record(primary, Command::EndRenderPass),
        }
    }

    /// [`begin_frame`](Self::begin_frame) followed by [`end_frame`](Self::end_frame).
    pub fn render_frame(
        &mut self,
        assembler: &PipelineAssembler,
        image: PresentImage,
        scene: Arc<FrameScene>,
    ) -> SemaphoreHandle {
        self.begin_frame(assembler, image, scene);
        self.end_frame(assembler)
    }

    /// Block until the device has finished every submitted frame.
    pub fn wait_idle(&self) {
        assert!(self.current.is_none(), "wait_idle called inside a frame");
        if let Err(e) = self.backend.wait_idle() {
            fatal("wait for the device to go idle", e);
        }
    }

    /// Wait for the device and retire the frame slots.
    ///
    /// Retired objects are destroyed by the next
    /// [`DestructionQueue::flush`] or [`RenderingContext::shutdown`].
    pub fn shutdown(self) {
        self.wait_idle();
        log::info!(
            "Frame engine shut down after {} frames ({} draws)",
            self.total_stats.frames,
            self.total_stats.draws
        );
        self.frame_data.release(&self.destruction);
    }
}

impl std::fmt::Debug for FrameEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEngine")
            .field("frame_number", &self.frame_number)
            .field("frame_data", &self.frame_data)
            .field("recorders", &self.recorders.len())
            .field("in_frame", &self.current.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{CompletionMode, DummyBackend};
    use crate::config::{BackendType, RendererConfig};
    use crate::recording::StageEncoder;
    use crate::stage::{OutputTarget, RenderStageDescription};
    use crate::targets::SwapchainImages;
    use crate::types::{
        ClearValue, Extent2d, LoadOp, TextureDescriptor, TextureFormat, TextureUsage,
    };

    fn setup(frames: u32) -> (Arc<DummyBackend>, RenderingContext, PipelineAssembler) {
        let backend = Arc::new(DummyBackend::with_completion(CompletionMode::Deferred));
        let config = RendererConfig::new()
            .with_backend(BackendType::Dummy)
            .with_frames_in_flight(frames)
            .with_worker_threads(2);
        let context = RenderingContext::with_backend(config, backend.clone());
        let extent = Extent2d::new(4, 4);
        let image = backend
            .create_texture(&TextureDescriptor::new(
                extent,
                TextureFormat::Bgra8Unorm,
                TextureUsage::RENDER_ATTACHMENT,
            ))
            .unwrap();
        let assembler = PipelineAssembler::new(
            &context,
            SwapchainImages {
                images: vec![image],
                format: TextureFormat::Bgra8Unorm,
                extent,
            },
        );
        (backend, context, assembler)
    }

    fn image() -> PresentImage {
        PresentImage {
            index: 0,
            image_available: None,
        }
    }

    #[test]
    fn test_slots_rotate_and_fences_gate_reuse() {
        let (backend, context, mut assembler) = setup(2);
        let stage = assembler
            .finalize(
                RenderStageDescription::new("clear")
                    .with_output(OutputTarget::Screen)
                    .with_color_load(LoadOp::Clear(ClearValue::color(0.0, 0.0, 0.0, 1.0))),
            )
            .unwrap();
        let mut engine = FrameEngine::new(&context, &FrameDataLayout::new(256)).unwrap();
        engine.register_recorder(stage, |_: &StageFrame, encoder: &mut StageEncoder| {
            encoder.draw(3, 1)
        });

        let scene = Arc::new(FrameScene::new());
        for _ in 0..2 {
            engine.render_frame(&assembler, image(), scene.clone());
        }
        assert_eq!(backend.pending_submissions(), 2);

        // Third frame reuses slot 0 and must wait for its first submission.
        engine.render_frame(&assembler, image(), scene);
        let stats = backend.stats();
        assert_eq!(stats.writes_while_pending, 0);
        assert_eq!(backend.pending_submissions(), 2);
        assert_eq!(engine.total_stats().frames, 3);
        assert_eq!(engine.total_stats().draws, 3);

        engine.shutdown();
        assembler.release();
        context.shutdown().unwrap();
        assert_eq!(backend.stats().destroyed_while_pending, 0);
    }

    #[test]
    #[should_panic(expected = "still open")]
    fn test_double_begin_panics() {
        let (_backend, context, assembler) = setup(2);
        let mut engine = FrameEngine::new(&context, &FrameDataLayout::new(256)).unwrap();
        let scene = Arc::new(FrameScene::new());
        engine.begin_frame(&assembler, image(), scene.clone());
        engine.begin_frame(&assembler, image(), scene);
    }

    #[test]
    #[should_panic(expected = "wait for the frame fence")]
    fn test_lost_device_is_fatal() {
        let (backend, context, assembler) = setup(1);
        let mut engine = FrameEngine::new(&context, &FrameDataLayout::new(256)).unwrap();
        backend.lose_device();
        engine.begin_frame(&assembler, image(), Arc::new(FrameScene::new()));
    }
}
