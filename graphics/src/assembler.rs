//! Pipeline and render pass assembly.
//!
//! [`PipelineAssembler::finalize`] turns a [`RenderStageDescription`] into
//! the native objects the frame engine needs: render pass, framebuffers,
//! pipeline, pipeline layout and one secondary command buffer per frame
//! slot. Stages finalized together with
//! [`PipelineAssembler::finalize_group`] share a render pass as consecutive
//! subpasses.
//!
//! Attachment order is fixed: the depth attachment (if any) comes first,
//! followed by one color attachment per output. Off-screen color targets end
//! every pass in `ShaderReadOnly` so later stages can sample them; screen
//! targets end in `PresentSrc`. Attachments created here start out
//! `Undefined`; [`PipelineAssembler::take_unsettled`] hands them to the
//! frame engine, which moves each into its settled layout before the first
//! pass that could load it.
//!
//! Builds that fail halfway destroy what they created, and a failed
//! [`PipelineAssembler::rebuild`] leaves the previous objects in place.
//!
//! Malformed descriptions are programmer errors and fail assertions here,
//! at assembly time, rather than at draw time.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::{Arena, ArenaIndex};
use crate::backend::{
    AttachmentDescriptor, CommandBufferLevel, FramebufferDescriptor, GpuBackend,
    GraphicsPipelineDescriptor, PipelineLayoutDescriptor, PipelineShaderStage,
    RenderPassDescriptor, SubpassDependency, SubpassDescriptor,
};
use crate::context::RenderingContext;
use crate::destruction::DestructionQueue;
use crate::error::GraphicsError;
use crate::handle::{
    CommandBufferHandle, CommandPoolHandle, FramebufferHandle, PipelineHandle,
    PipelineLayoutHandle, RenderPassHandle, TextureHandle,
};
use crate::resource::{GpuResource, PartialBuild};
use crate::stage::{OutputTarget, RenderStageDescription};
use crate::targets::{
    RenderTargetDescriptor, RenderTargetId, RenderTargetInfo, RenderTargets, SwapchainImages,
};
use crate::types::{
    ClearValue, Extent2d, SampleCount, ShaderStages, TextureFormat, TextureLayout, Viewport,
};

/// Opaque handle to a finalized stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageHandle(pub(crate) ArenaIndex);

/// Whole-image copy resolved to native textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCopy {
    pub source: TextureHandle,
    pub destination: TextureHandle,
    pub extent: Extent2d,
}

/// Native objects built for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeStageData {
    pub render_pass: RenderPassHandle,
    /// One per swapchain image for screen stages, otherwise exactly one.
    pub framebuffers: Vec<FramebufferHandle>,
    /// `None` for stages without shaders.
    pub pipeline: Option<PipelineHandle>,
    pub pipeline_layout: PipelineLayoutHandle,
    pub command_pool: CommandPoolHandle,
    /// One secondary command buffer per frame slot.
    pub command_buffers: Vec<CommandBufferHandle>,
    pub subpass: u32,
    /// One entry per render pass attachment.
    pub clear_values: Vec<ClearValue>,
    /// Whether beginning the render pass clears an attachment.
    pub has_clears: bool,
    pub extent: Extent2d,
    pub targets_screen: bool,
    pub copy: Option<NativeCopy>,
}

impl NativeStageData {
    /// Framebuffer to use with the given swapchain image.
    pub fn framebuffer(&self, image_index: u32) -> FramebufferHandle {
        if self.targets_screen {
            self.framebuffers[image_index as usize]
        } else {
            self.framebuffers[0]
        }
    }
}

struct StageEntry {
    name: String,
    group: usize,
    native: NativeStageData,
}

/// Stages sharing one render pass, in subpass order.
struct StageGroup {
    descriptions: Vec<RenderStageDescription>,
    members: Vec<StageHandle>,
}

/// Attachments and subpasses shared by every member of a group.
struct PassLayout {
    render_pass: RenderPassHandle,
    framebuffers: Vec<FramebufferHandle>,
    clear_values: Vec<ClearValue>,
    has_clears: bool,
    extent: Extent2d,
    samples: SampleCount,
}

/// Builds and owns the native objects of every render stage.
pub struct PipelineAssembler {
    backend: Arc<dyn GpuBackend>,
    destruction: Arc<DestructionQueue>,
    frame_count: u32,
    swapchain: SwapchainImages,
    targets: RenderTargets,
    stages: Arena<StageEntry>,
    groups: Vec<StageGroup>,
    order: Vec<StageHandle>,
    /// Textures no frame has moved out of `Undefined` yet.
    unsettled: Mutex<Vec<(TextureHandle, TextureLayout)>>,
}

impl PipelineAssembler {
    pub fn new(context: &RenderingContext, swapchain: SwapchainImages) -> Self {
        let backend = Arc::clone(context.backend());
        let screen = TextureLayout::settled(swapchain.format, true);
        let unsettled = swapchain.images.iter().map(|&image| (image, screen)).collect();
        Self {
            targets: RenderTargets::new(Arc::clone(&backend)),
            backend,
            destruction: Arc::clone(context.destruction()),
            frame_count: context.frame_count(),
            swapchain,
            stages: Arena::new(),
            groups: Vec::new(),
            order: Vec::new(),
            unsettled: Mutex::new(unsettled),
        }
    }

    pub fn swapchain(&self) -> &SwapchainImages {
        &self.swapchain
    }

    pub fn targets(&self) -> &RenderTargets {
        &self.targets
    }

    pub fn create_render_target(
        &mut self,
        descriptor: RenderTargetDescriptor,
    ) -> Result<RenderTargetId, GraphicsError> {
        let id = self.targets.create(descriptor, self.swapchain.extent)?;
        let info = self.targets.get(id);
        self.unsettled
            .get_mut()
            .push((info.texture, TextureLayout::settled(info.format, false)));
        Ok(id)
    }

    pub fn render_target(&self, id: RenderTargetId) -> &RenderTargetInfo {
        self.targets.get(id)
    }

    /// Attachments the frame rendering to swapchain image `image_index`
    /// must move from `Undefined` into the returned layouts before any pass.
    ///
    /// Render targets are handed out once. A swapchain image is handed out
    /// with the first frame that acquires it.
    pub fn take_unsettled(&self, image_index: u32) -> Vec<(TextureHandle, TextureLayout)> {
        let acquired = self.swapchain.images.get(image_index as usize).copied();
        let mut unsettled = self.unsettled.lock();
        let mut ready = Vec::new();
        unsettled.retain(|&(texture, layout)| {
            let waiting = Some(texture) != acquired && self.swapchain.images.contains(&texture);
            if !waiting {
                ready.push((texture, layout));
            }
            waiting
        });
        ready
    }

    /// Build the native objects of one stage.
    pub fn finalize(
        &mut self,
        description: RenderStageDescription,
    ) -> Result<StageHandle, GraphicsError> {
        let handles = self.finalize_group(vec![description])?;
        Ok(handles[0])
    }

    /// Build stages that share one render pass, one subpass per stage.
    ///
    /// Every member must bind the same attachments with the same operators.
    pub fn finalize_group(
        &mut self,
        descriptions: Vec<RenderStageDescription>,
    ) -> Result<Vec<StageHandle>, GraphicsError> {
        inflight_core::profile_function!();
        let mut build = PartialBuild::new(Arc::clone(&self.backend));
        let natives =
            self.build_group(&self.targets, &self.swapchain, &descriptions, &mut build)?;
        build.finish();

        let group = self.groups.len();
        let members: Vec<StageHandle> = natives
            .into_iter()
            .zip(&descriptions)
            .map(|(native, description)| {
                StageHandle(self.stages.insert(StageEntry {
                    name: description.name.clone(),
                    group,
                    native,
                }))
            })
            .collect();
        self.order.extend_from_slice(&members);
        self.groups.push(StageGroup {
            descriptions,
            members: members.clone(),
        });
        Ok(members)
    }

    /// Native data of a finalized stage.
    ///
    /// Stale or foreign handles are a programmer error.
    pub fn native(&self, handle: StageHandle) -> &NativeStageData {
        match self.stages.get(handle.0) {
            Some(entry) => &entry.native,
            None => panic!("stage {handle:?} was never finalized or has been released"),
        }
    }

    pub fn stage_name(&self, handle: StageHandle) -> &str {
        self.stages.get(handle.0).map_or("<released>", |e| e.name.as_str())
    }

    /// Description a stage was built from.
    pub fn description(&self, handle: StageHandle) -> &RenderStageDescription {
        let entry = self
            .stages
            .get(handle.0)
            .unwrap_or_else(|| panic!("stage {handle:?} was never finalized"));
        let group = &self.groups[entry.group];
        let position = group
            .members
            .iter()
            .position(|&member| member == handle)
            .unwrap_or_else(|| panic!("stage {handle:?} missing from its group"));
        &group.descriptions[position]
    }

    /// Stages in declared order.
    pub fn stages(&self) -> &[StageHandle] {
        &self.order
    }

    pub fn contains(&self, handle: StageHandle) -> bool {
        self.stages.contains(handle.0)
    }

    /// Rebuild every stage for a new swapchain.
    ///
    /// Swapchain-relative targets are recreated and every stored description
    /// is finalized again before anything is replaced. Only then are the old
    /// native objects and textures retired through the destruction queue.
    /// On error the assembler is unchanged. Stage handles stay valid.
    pub fn rebuild(&mut self, swapchain: SwapchainImages) -> Result<(), GraphicsError> {
        log::info!(
            "Rebuilding {} stages for a {}x{} swapchain",
            self.order.len(),
            swapchain.extent.width,
            swapchain.extent.height
        );
        let targets = self.targets.resized(swapchain.extent)?;
        let fresh = targets.changed_from(&self.targets);
        let mut build = PartialBuild::new(Arc::clone(&self.backend));
        for info in &fresh {
            build.track(info.resource());
        }
        let mut natives = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let built = self.build_group(&targets, &swapchain, &group.descriptions, &mut build)?;
            natives.push(built);
        }
        build.finish();

        self.retire_natives();
        for (group, built) in self.groups.iter().zip(natives) {
            for (member, native) in group.members.iter().zip(built) {
                if let Some(entry) = self.stages.get_mut(member.0) {
                    entry.native = native;
                }
            }
        }
        let old_targets = std::mem::replace(&mut self.targets, targets);
        self.destruction.retire_all(
            old_targets
                .changed_from(&self.targets)
                .iter()
                .map(|info| info.resource()),
        );
        let old_images = std::mem::replace(&mut self.swapchain, swapchain).images;

        let live: Vec<TextureHandle> = self
            .targets
            .iter()
            .map(|info| info.texture)
            .chain(self.swapchain.images.iter().copied())
            .collect();
        let screen = TextureLayout::settled(self.swapchain.format, true);
        let unsettled = self.unsettled.get_mut();
        unsettled.retain(|(texture, _)| live.contains(texture));
        unsettled.extend(
            fresh
                .iter()
                .map(|info| (info.texture, TextureLayout::settled(info.format, false))),
        );
        unsettled.extend(
            self.swapchain
                .images
                .iter()
                .filter(|image| !old_images.contains(image))
                .map(|&image| (image, screen)),
        );
        Ok(())
    }

    /// Retire every stage and render target.
    pub fn release(&mut self) {
        self.retire_natives();
        self.targets.release(&self.destruction);
        self.stages = Arena::new();
        self.groups.clear();
        self.order.clear();
        self.unsettled.get_mut().clear();
    }

    fn retire_natives(&self) {
        for group in &self.groups {
            let Some(first) = group.members.first().and_then(|m| self.stages.get(m.0)) else {
                continue;
            };
            // Render pass and framebuffers are shared by the whole group.
            self.destruction
                .retire(GpuResource::RenderPass(first.native.render_pass));
            self.destruction.retire_all(
                first
                    .native
                    .framebuffers
                    .iter()
                    .map(|&fb| GpuResource::Framebuffer(fb)),
            );
            for member in &group.members {
                let Some(entry) = self.stages.get(member.0) else {
                    continue;
                };
                let native = &entry.native;
                if let Some(pipeline) = native.pipeline {
                    self.destruction.retire(GpuResource::Pipeline(pipeline));
                }
                self.destruction
                    .retire(GpuResource::PipelineLayout(native.pipeline_layout));
                self.destruction
                    .retire(GpuResource::CommandPool(native.command_pool));
            }
        }
    }

    /// Build the objects of one group against `targets` and `swapchain`.
    ///
    /// Everything created is tracked in `build`.
    fn build_group(
        &self,
        targets: &RenderTargets,
        swapchain: &SwapchainImages,
        descriptions: &[RenderStageDescription],
        build: &mut PartialBuild,
    ) -> Result<Vec<NativeStageData>, GraphicsError> {
        validate_group(descriptions);
        let pass = self.build_pass(targets, swapchain, descriptions, build)?;

        let first = &descriptions[0];
        let copy = first.copy_before.map(|request| {
            let source = targets.get(request.source);
            let destination = targets.get(request.destination);
            assert!(
                source.extent == destination.extent && source.format == destination.format,
                "stage '{}': copy source and destination differ in size or format",
                first.name
            );
            assert!(
                !source.format.is_depth_stencil(),
                "stage '{}': only color targets can be copied",
                first.name
            );
            NativeCopy {
                source: source.texture,
                destination: destination.texture,
                extent: source.extent,
            }
        });

        let mut natives = Vec::with_capacity(descriptions.len());
        for (subpass, description) in descriptions.iter().enumerate() {
            let subpass = subpass as u32;
            let (pipeline_layout, pipeline) =
                self.build_pipeline(description, &pass, subpass, build)?;
            let command_pool = self.backend.create_command_pool()?;
            build.track(GpuResource::CommandPool(command_pool));
            let command_buffers = self.backend.allocate_command_buffers(
                command_pool,
                CommandBufferLevel::Secondary,
                self.frame_count,
            )?;
            log::debug!(
                "Finalized stage '{}' (subpass {subpass}, {}x{})",
                description.name,
                pass.extent.width,
                pass.extent.height
            );
            natives.push(NativeStageData {
                render_pass: pass.render_pass,
                framebuffers: pass.framebuffers.clone(),
                pipeline,
                pipeline_layout,
                command_pool,
                command_buffers,
                subpass,
                clear_values: pass.clear_values.clone(),
                has_clears: pass.has_clears,
                extent: pass.extent,
                targets_screen: description.targets_screen(),
                copy: if subpass == 0 { copy } else { None },
            });
        }
        Ok(natives)
    }

    /// Create the render pass and framebuffers for a group.
    fn build_pass(
        &self,
        targets: &RenderTargets,
        swapchain: &SwapchainImages,
        descriptions: &[RenderStageDescription],
        build: &mut PartialBuild,
    ) -> Result<PassLayout, GraphicsError> {
        let first = &descriptions[0];
        let screen = first.targets_screen();

        let depth = first.depth.map(|depth| (depth, *targets.get(depth.target)));
        let colors: Vec<(TextureFormat, SampleCount, Option<TextureHandle>)> = first
            .outputs
            .iter()
            .map(|output| match output {
                OutputTarget::Screen => (swapchain.format, SampleCount::X1, None),
                OutputTarget::RenderTarget(id) => {
                    let info = targets.get(*id);
                    (info.format, info.samples, Some(info.texture))
                }
            })
            .collect();

        let samples = check_sample_counts(first, &colors, depth.map(|(_, info)| info.samples));

        let extent = match (screen, first.resolution) {
            (true, _) => swapchain.extent,
            (false, Some(resolution)) => resolution,
            (false, None) => first
                .outputs
                .first()
                .and_then(|output| match output {
                    OutputTarget::RenderTarget(id) => Some(targets.get(*id).extent),
                    OutputTarget::Screen => None,
                })
                .or(depth.map(|(_, info)| info.extent))
                .unwrap_or(swapchain.extent),
        };

        // Attachment list: depth first, then colors.
        let mut attachments = Vec::with_capacity(colors.len() + 1);
        if let Some((target, info)) = depth {
            assert!(
                info.format.is_depth_stencil(),
                "stage '{}': depth target has color format {:?}",
                first.name,
                info.format
            );
            attachments.push(AttachmentDescriptor {
                format: info.format,
                samples: info.samples,
                load: target.load,
                store: target.store,
                initial_layout: TextureLayout::settled(info.format, false).before_pass(target.load),
                final_layout: TextureLayout::settled(info.format, false),
            });
        }
        for (index, (format, color_samples, _)) in colors.iter().enumerate() {
            let settled = TextureLayout::settled(*format, screen && index == 0);
            attachments.push(AttachmentDescriptor {
                format: *format,
                samples: *color_samples,
                load: first.color_load,
                store: first.color_store,
                initial_layout: settled.before_pass(first.color_load),
                final_layout: settled,
            });
        }

        let has_depth = depth.is_some();
        let depth_offset = has_depth as u32;
        let subpasses = descriptions
            .iter()
            .map(|_| SubpassDescriptor {
                color_attachments: (0..colors.len() as u32).map(|i| i + depth_offset).collect(),
                depth_attachment: has_depth.then_some(0),
            })
            .collect();

        let mut dependencies = subpass_dependencies(descriptions);
        if screen {
            // Order the first subpass after the presentation engine's read.
            dependencies.insert(
                0,
                SubpassDependency {
                    src_subpass: None,
                    dst_subpass: 0,
                    color: true,
                    depth: false,
                },
            );
        }

        let desc = RenderPassDescriptor {
            label: Some(first.name.clone()),
            attachments,
            subpasses,
            dependencies,
        };
        let clear_values = desc.clear_values();
        let has_clears = desc.has_clears();
        let render_pass = self.backend.create_render_pass(&desc)?;
        build.track(GpuResource::RenderPass(render_pass));

        let depth_texture = depth.map(|(_, info)| info.texture);
        let images: Vec<Option<TextureHandle>> = if screen {
            swapchain.images.iter().copied().map(Some).collect()
        } else {
            vec![None]
        };
        let mut framebuffers = Vec::with_capacity(images.len());
        for screen_image in images {
            let attachments = depth_texture
                .into_iter()
                .chain(colors.iter().map(|(_, _, texture)| {
                    texture.or(screen_image).unwrap_or_else(|| {
                        unreachable!("screen output without a swapchain image")
                    })
                }))
                .collect();
            let framebuffer = self.backend.create_framebuffer(&FramebufferDescriptor {
                render_pass,
                attachments,
                extent,
            })?;
            build.track(GpuResource::Framebuffer(framebuffer));
            framebuffers.push(framebuffer);
        }

        Ok(PassLayout {
            render_pass,
            framebuffers,
            clear_values,
            has_clears,
            extent,
            samples,
        })
    }

    fn build_pipeline(
        &self,
        description: &RenderStageDescription,
        pass: &PassLayout,
        subpass: u32,
        build: &mut PartialBuild,
    ) -> Result<(PipelineLayoutHandle, Option<PipelineHandle>), GraphicsError> {
        let layout = self
            .backend
            .create_pipeline_layout(&PipelineLayoutDescriptor {
                set_layouts: description.descriptor_set_layouts.clone(),
                push_constants: description.push_constants.clone(),
            })?;
        build.track(GpuResource::PipelineLayout(layout));
        if !description.has_pipeline() {
            return Ok((layout, None));
        }

        let mut stages = Vec::with_capacity(description.shaders.len());
        let mut modules = Ok(());
        for shader in &description.shaders {
            match self.backend.create_shader_module(shader.stage, &shader.code) {
                Ok(module) => stages.push(PipelineShaderStage {
                    stage: shader.stage,
                    module,
                    entry_point: shader.entry_point.clone(),
                }),
                Err(e) => {
                    modules = Err(e);
                    break;
                }
            }
        }

        let pipeline = modules.and_then(|()| {
            self.backend
                .create_graphics_pipeline(&GraphicsPipelineDescriptor {
                    label: Some(description.name.clone()),
                    stages: stages.clone(),
                    vertex_layout: description.vertex_layout.clone(),
                    topology: description.topology,
                    patch_control_points: description.patch_control_points,
                    raster: description.raster,
                    depth_stencil: description.depth_stencil,
                    blend: description.blend,
                    color_attachment_count: description.outputs.len() as u32,
                    samples: pass.samples,
                    layout,
                    render_pass: pass.render_pass,
                    subpass,
                    viewport: Viewport::from_extent(pass.extent),
                    scissor: pass.extent,
                })
        });

        // Modules are only needed while the pipeline is created.
        for stage in stages {
            self.backend.destroy(GpuResource::ShaderModule(stage.module));
        }
        let pipeline = pipeline?;
        build.track(GpuResource::Pipeline(pipeline));
        Ok((layout, Some(pipeline)))
    }
}

impl std::fmt::Debug for PipelineAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineAssembler")
            .field("stages", &self.order.len())
            .field("groups", &self.groups.len())
            .field("targets", &self.targets)
            .finish()
    }
}

fn validate_group(descriptions: &[RenderStageDescription]) {
    assert!(!descriptions.is_empty(), "a stage group needs at least one stage");
    let first = &descriptions[0];
    for (index, description) in descriptions.iter().enumerate() {
        let name = &description.name;
        assert!(
            !description.outputs.is_empty() || description.depth.is_some(),
            "stage '{name}': no color outputs and no depth target"
        );
        assert!(
            description
                .outputs
                .iter()
                .skip(1)
                .all(|output| *output != OutputTarget::Screen),
            "stage '{name}': the screen must be the first output"
        );
        assert!(
            description.depth.is_some() || !description.depth_stencil.uses_depth(),
            "stage '{name}': depth test or write requested without a depth target"
        );
        if description.has_pipeline() {
            assert!(
                description
                    .shaders
                    .iter()
                    .any(|shader| shader.stage == ShaderStages::VERTEX),
                "stage '{name}': a vertex shader is required"
            );
            assert!(
                description
                    .shaders
                    .iter()
                    .all(|shader| shader.stage.bits().count_ones() == 1),
                "stage '{name}': each shader must target exactly one stage"
            );
        }
        if index > 0 {
            assert!(
                description.same_attachments(first),
                "stage '{name}': attachments differ from '{}' in the same render pass",
                first.name
            );
            assert!(
                description.copy_before.is_none(),
                "stage '{name}': only the first stage of a render pass may copy"
            );
        }
    }
}

/// Validate that multisampled attachments agree; returns the pass sample count.
fn check_sample_counts(
    description: &RenderStageDescription,
    colors: &[(TextureFormat, SampleCount, Option<TextureHandle>)],
    depth: Option<SampleCount>,
) -> SampleCount {
    let all: Vec<SampleCount> = colors.iter().map(|(_, s, _)| *s).chain(depth).collect();
    let multisampled = all.iter().copied().find(|&s| s != SampleCount::X1);
    if let Some(samples) = multisampled {
        assert!(
            all.iter().all(|&s| s == samples),
            "stage '{}': multisampled attachments must share one sample count, got {all:?}",
            description.name
        );
        samples
    } else {
        SampleCount::X1
    }
}

/// Dependencies between consecutive subpasses that touch the same attachments.
fn subpass_dependencies(descriptions: &[RenderStageDescription]) -> Vec<SubpassDependency> {
    descriptions
        .windows(2)
        .enumerate()
        .filter_map(|(index, pair)| {
            let (previous, current) = (&pair[0], &pair[1]);
            let color = !current.outputs.is_empty();
            let depth = current.depth.is_some()
                && ((previous.depth_stencil.depth_write && current.depth_stencil.uses_depth())
                    || (previous.depth_stencil.uses_depth() && current.depth_stencil.depth_write));
            (color || depth).then_some(SubpassDependency {
                src_subpass: Some(index as u32),
                dst_subpass: index as u32 + 1,
                color,
                depth,
            })
        })
        .collect()
}
