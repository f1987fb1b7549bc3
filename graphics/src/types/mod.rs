//! Common types and descriptors for graphics resources.
//!
//! This module contains format enums, usage flags, fixed-function state and
//! descriptor structs used throughout the graphics system.

mod buffer;
mod common;
mod pipeline;
mod texture;

pub use buffer::{BufferDescriptor, BufferUsage, IndexFormat};
pub use common::{ClearValue, Extent2d, Viewport};
pub use pipeline::{
    BlendFactor, BlendOp, BlendState, CompareOp, CullMode, DepthStencilState, DescriptorBinding,
    DescriptorType, FrontFace, LoadOp, PolygonMode, PrimitiveTopology, PushConstantRange,
    RasterState, ShaderStages, StencilOp, StencilState, StoreOp, VertexAttribute, VertexBinding,
    VertexFormat, VertexLayout, VertexStepMode,
};
pub use texture::{
    SampleCount, TextureDescriptor, TextureFormat, TextureLayout, TextureUsage,
};
