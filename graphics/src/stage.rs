//! Declarative render stage descriptions.
//!
//! A [`RenderStageDescription`] says what a stage renders into and with
//! which fixed-function state. It is immutable once handed to the
//! [`PipelineAssembler`](crate::PipelineAssembler).
//!
//! # Example
//!
//! ```
//! use inflight_graphics::{ClearValue, LoadOp, OutputTarget, RenderStageDescription};
//!
//! let stage = RenderStageDescription::new("clear")
//!     .with_output(OutputTarget::Screen)
//!     .with_color_load(LoadOp::Clear(ClearValue::color(0.0, 0.0, 0.0, 1.0)));
//! assert!(stage.targets_screen());
//! ```

use std::sync::Arc;

use crate::handle::DescriptorSetLayoutHandle;
use crate::targets::RenderTargetId;
use crate::types::{
    BlendState, DepthStencilState, Extent2d, LoadOp, PrimitiveTopology, PushConstantRange,
    RasterState, ShaderStages, StoreOp, VertexLayout,
};

/// Where a stage's color output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputTarget {
    /// The presentable swapchain image of the frame. Must be the first output.
    Screen,
    RenderTarget(RenderTargetId),
}

/// Depth attachment of a stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthTarget {
    pub target: RenderTargetId,
    pub load: LoadOp,
    pub store: StoreOp,
}

/// SPIR-V for one shader stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageSource {
    pub stage: ShaderStages,
    pub code: Arc<[u32]>,
    pub entry_point: String,
}

impl ShaderStageSource {
    pub fn new(stage: ShaderStages, code: impl Into<Arc<[u32]>>) -> Self {
        Self {
            stage,
            code: code.into(),
            entry_point: "main".to_string(),
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }
}

/// Full copy of one color target into another before the stage's pass begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyRequest {
    pub source: RenderTargetId,
    pub destination: RenderTargetId,
}

/// Declarative description of one render stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderStageDescription {
    pub name: String,
    pub outputs: Vec<OutputTarget>,
    pub depth: Option<DepthTarget>,
    pub color_load: LoadOp,
    pub color_store: StoreOp,
    /// Empty for stages that only clear.
    pub shaders: Vec<ShaderStageSource>,
    pub vertex_layout: VertexLayout,
    pub topology: PrimitiveTopology,
    pub patch_control_points: u32,
    pub raster: RasterState,
    pub depth_stencil: DepthStencilState,
    pub blend: Option<BlendState>,
    pub descriptor_set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub push_constants: Vec<PushConstantRange>,
    /// Overrides the extent derived from the outputs.
    pub resolution: Option<Extent2d>,
    pub copy_before: Option<CopyRequest>,
}

impl RenderStageDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outputs: Vec::new(),
            depth: None,
            color_load: LoadOp::Load,
            color_store: StoreOp::Store,
            shaders: Vec::new(),
            vertex_layout: VertexLayout::empty(),
            topology: PrimitiveTopology::TriangleList,
            patch_control_points: 0,
            raster: RasterState::default(),
            depth_stencil: DepthStencilState::default(),
            blend: None,
            descriptor_set_layouts: Vec::new(),
            push_constants: Vec::new(),
            resolution: None,
            copy_before: None,
        }
    }

    pub fn with_output(mut self, output: OutputTarget) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_depth(mut self, target: RenderTargetId, load: LoadOp, store: StoreOp) -> Self {
        self.depth = Some(DepthTarget {
            target,
            load,
            store,
        });
        self
    }

    pub fn with_color_load(mut self, load: LoadOp) -> Self {
        self.color_load = load;
        self
    }

    pub fn with_color_store(mut self, store: StoreOp) -> Self {
        self.color_store = store;
        self
    }

    pub fn with_shader(mut self, shader: ShaderStageSource) -> Self {
        self.shaders.push(shader);
        self
    }

    pub fn with_vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    pub fn with_topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Switch to patch topology for tessellation.
    pub fn with_patches(mut self, control_points: u32) -> Self {
        self.topology = PrimitiveTopology::PatchList;
        self.patch_control_points = control_points;
        self
    }

    pub fn with_raster(mut self, raster: RasterState) -> Self {
        self.raster = raster;
        self
    }

    pub fn with_depth_stencil(mut self, state: DepthStencilState) -> Self {
        self.depth_stencil = state;
        self
    }

    pub fn with_blend(mut self, blend: BlendState) -> Self {
        self.blend = Some(blend);
        self
    }

    pub fn with_descriptor_set_layout(mut self, layout: DescriptorSetLayoutHandle) -> Self {
        self.descriptor_set_layouts.push(layout);
        self
    }

    pub fn with_push_constants(mut self, range: PushConstantRange) -> Self {
        self.push_constants.push(range);
        self
    }

    pub fn with_resolution(mut self, extent: Extent2d) -> Self {
        self.resolution = Some(extent);
        self
    }

    pub fn with_copy_before(mut self, source: RenderTargetId, destination: RenderTargetId) -> Self {
        self.copy_before = Some(CopyRequest {
            source,
            destination,
        });
        self
    }

    pub fn targets_screen(&self) -> bool {
        self.outputs.first() == Some(&OutputTarget::Screen)
    }

    /// Returns true if beginning this stage's pass clears an attachment.
    pub fn declares_clears(&self) -> bool {
        (!self.outputs.is_empty() && self.color_load.is_clear())
            || self.depth.is_some_and(|depth| depth.load.is_clear())
    }

    /// Returns true if the stage has a pipeline to build.
    pub fn has_pipeline(&self) -> bool {
        !self.shaders.is_empty()
    }

    /// Returns true if both stages bind the same attachments with the same operators.
    pub fn same_attachments(&self, other: &Self) -> bool {
        self.outputs == other.outputs
            && self.depth == other.depth
            && self.color_load == other.color_load
            && self.color_store == other.color_store
    }
}
