//! Render pass, pipeline and descriptor object creation.

use std::ffi::CString;

use ash::vk;
use ash::vk::Handle;

use crate::backend::{
    GraphicsPipelineDescriptor, PipelineLayoutDescriptor, RenderPassDescriptor, SubpassDependency,
};
use crate::error::GraphicsError;
use crate::types::{DescriptorBinding, PrimitiveTopology};

use super::conversion::{
    convert_blend_state, convert_compare_op, convert_cull_mode, convert_descriptor_type,
    convert_front_face, convert_layout, convert_load_op, convert_polygon_mode,
    convert_sample_count, convert_shader_stages, convert_step_mode, convert_stencil_state,
    convert_store_op, convert_texture_format, convert_topology, convert_vertex_format,
};

/// Sets per descriptor pool; sizes below are per descriptor type.
const DESCRIPTOR_POOL_SETS: u32 = 1024;
const DESCRIPTOR_POOL_SIZE: u32 = 1024;

pub fn creation_error(what: &str, e: vk::Result) -> GraphicsError {
    match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GraphicsError::OutOfMemory
        }
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        e => GraphicsError::ResourceCreationFailed(format!("Failed to create {what}: {e:?}")),
    }
}

/// Pool the backend allocates every descriptor set from.
pub fn create_descriptor_pool(device: &ash::Device) -> Result<vk::DescriptorPool, GraphicsError> {
    let pool_sizes = [
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    ]
    .map(|ty| {
        vk::DescriptorPoolSize::default()
            .ty(ty)
            .descriptor_count(DESCRIPTOR_POOL_SIZE)
    });

    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(DESCRIPTOR_POOL_SETS)
        .pool_sizes(&pool_sizes);

    unsafe { device.create_descriptor_pool(&pool_info, None) }
        .map_err(|e| creation_error("descriptor pool", e))
}

pub fn create_descriptor_set_layout(
    device: &ash::Device,
    bindings: &[DescriptorBinding],
) -> Result<vk::DescriptorSetLayout, GraphicsError> {
    let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
        .iter()
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding.binding)
                .descriptor_type(convert_descriptor_type(binding.ty))
                .descriptor_count(binding.count)
                .stage_flags(convert_shader_stages(binding.stages))
        })
        .collect();

    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
    unsafe { device.create_descriptor_set_layout(&layout_info, None) }
        .map_err(|e| creation_error("descriptor set layout", e))
}

pub fn create_pipeline_layout(
    device: &ash::Device,
    descriptor: &PipelineLayoutDescriptor,
) -> Result<vk::PipelineLayout, GraphicsError> {
    let set_layouts: Vec<vk::DescriptorSetLayout> = descriptor
        .set_layouts
        .iter()
        .map(|layout| vk::DescriptorSetLayout::from_raw(layout.raw()))
        .collect();
    let push_constants: Vec<vk::PushConstantRange> = descriptor
        .push_constants
        .iter()
        .map(|range| {
            vk::PushConstantRange::default()
                .stage_flags(convert_shader_stages(range.stages))
                .offset(range.offset)
                .size(range.size)
        })
        .collect();

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constants);
    unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| creation_error("pipeline layout", e))
}

/// Stage and access scope of one side of a subpass dependency.
fn dependency_scope(
    dependency: &SubpassDependency,
    external: bool,
) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut stages = vk::PipelineStageFlags::empty();
    let mut access = vk::AccessFlags::empty();
    if dependency.color {
        stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        if !external {
            access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        }
    }
    if dependency.depth {
        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        if !external {
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
    }
    if stages.is_empty() {
        stages = vk::PipelineStageFlags::ALL_GRAPHICS;
    }
    (stages, access)
}

fn convert_dependency(dependency: &SubpassDependency) -> vk::SubpassDependency {
    let external = dependency.src_subpass.is_none();
    let (src_stage, src_access) = dependency_scope(dependency, external);
    let (dst_stage, _) = dependency_scope(dependency, false);

    let mut dst_access = vk::AccessFlags::empty();
    if dependency.color {
        dst_access |=
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if dependency.depth {
        dst_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }

    vk::SubpassDependency::default()
        .src_subpass(dependency.src_subpass.unwrap_or(vk::SUBPASS_EXTERNAL))
        .dst_subpass(dependency.dst_subpass)
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .dependency_flags(if external {
            vk::DependencyFlags::empty()
        } else {
            vk::DependencyFlags::BY_REGION
        })
}

pub fn create_render_pass(
    device: &ash::Device,
    descriptor: &RenderPassDescriptor,
) -> Result<vk::RenderPass, GraphicsError> {
    let attachments: Vec<vk::AttachmentDescription> = descriptor
        .attachments
        .iter()
        .map(|attachment| {
            let load = convert_load_op(&attachment.load);
            let store = convert_store_op(attachment.store);
            let has_stencil = attachment.format.has_stencil();
            vk::AttachmentDescription::default()
                .format(convert_texture_format(attachment.format))
                .samples(convert_sample_count(attachment.samples))
                .load_op(load)
                .store_op(store)
                .stencil_load_op(if has_stencil {
                    load
                } else {
                    vk::AttachmentLoadOp::DONT_CARE
                })
                .stencil_store_op(if has_stencil {
                    store
                } else {
                    vk::AttachmentStoreOp::DONT_CARE
                })
                .initial_layout(convert_layout(attachment.initial_layout))
                .final_layout(convert_layout(attachment.final_layout))
        })
        .collect();

    // Reference arrays must outlive the subpass descriptions pointing at them.
    let color_refs: Vec<Vec<vk::AttachmentReference>> = descriptor
        .subpasses
        .iter()
        .map(|subpass| {
            subpass
                .color_attachments
                .iter()
                .map(|&attachment| vk::AttachmentReference {
                    attachment,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                })
                .collect()
        })
        .collect();
    let depth_refs: Vec<Option<vk::AttachmentReference>> = descriptor
        .subpasses
        .iter()
        .map(|subpass| {
            subpass
                .depth_attachment
                .map(|attachment| vk::AttachmentReference {
                    attachment,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                })
        })
        .collect();

    let subpasses: Vec<vk::SubpassDescription> = color_refs
        .iter()
        .zip(&depth_refs)
        .map(|(colors, depth)| {
            let subpass = vk::SubpassDescription::default()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(colors);
            match depth {
                Some(depth) => subpass.depth_stencil_attachment(depth),
                None => subpass,
            }
        })
        .collect();

    let dependencies: Vec<vk::SubpassDependency> = descriptor
        .dependencies
        .iter()
        .map(convert_dependency)
        .collect();

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&create_info, None) }
        .map_err(|e| creation_error("render pass", e))
}

pub fn create_graphics_pipeline(
    device: &ash::Device,
    descriptor: &GraphicsPipelineDescriptor,
) -> Result<vk::Pipeline, GraphicsError> {
    let entry_points: Vec<CString> = descriptor
        .stages
        .iter()
        .map(|stage| {
            CString::new(stage.entry_point.as_str()).map_err(|e| {
                GraphicsError::InvalidParameter(format!(
                    "Invalid entry point name (contains null byte): {e}"
                ))
            })
        })
        .collect::<Result<_, _>>()?;

    let shader_stages: Vec<vk::PipelineShaderStageCreateInfo> = descriptor
        .stages
        .iter()
        .zip(&entry_points)
        .map(|(stage, entry)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(convert_shader_stages(stage.stage))
                .module(vk::ShaderModule::from_raw(stage.module.raw()))
                .name(entry)
        })
        .collect();

    let binding_descriptions: Vec<vk::VertexInputBindingDescription> = descriptor
        .vertex_layout
        .bindings
        .iter()
        .map(|binding| {
            vk::VertexInputBindingDescription::default()
                .binding(binding.binding)
                .stride(binding.stride)
                .input_rate(convert_step_mode(binding.step_mode))
        })
        .collect();
    let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = descriptor
        .vertex_layout
        .attributes
        .iter()
        .map(|attribute| {
            vk::VertexInputAttributeDescription::default()
                .location(attribute.location)
                .binding(attribute.binding)
                .format(convert_vertex_format(attribute.format))
                .offset(attribute.offset)
        })
        .collect();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert_topology(descriptor.topology))
        .primitive_restart_enable(false);

    let tessellation_state = vk::PipelineTessellationStateCreateInfo::default()
        .patch_control_points(descriptor.patch_control_points.max(1));

    let viewport = vk::Viewport {
        x: descriptor.viewport.x,
        y: descriptor.viewport.y,
        width: descriptor.viewport.width,
        height: descriptor.viewport.height,
        min_depth: descriptor.viewport.min_depth,
        max_depth: descriptor.viewport.max_depth,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D {
            width: descriptor.scissor.width,
            height: descriptor.scissor.height,
        },
    };
    let viewports = [viewport];
    let scissors = [scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewports(&viewports)
        .scissors(&scissors);

    let raster = &descriptor.raster;
    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(convert_polygon_mode(raster.polygon_mode))
        .line_width(1.0)
        .cull_mode(convert_cull_mode(raster.cull_mode))
        .front_face(convert_front_face(raster.front_face))
        .depth_bias_enable(false);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(convert_sample_count(descriptor.samples));

    let depth = &descriptor.depth_stencil;
    let stencil = depth
        .stencil
        .as_ref()
        .map(convert_stencil_state)
        .unwrap_or_default();
    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(depth.depth_test)
        .depth_write_enable(depth.depth_write)
        .depth_compare_op(convert_compare_op(depth.depth_compare))
        .depth_bounds_test_enable(false)
        .stencil_test_enable(depth.stencil.is_some())
        .front(stencil)
        .back(stencil);

    let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0..descriptor
        .color_attachment_count)
        .map(|_| convert_blend_state(descriptor.blend.as_ref()))
        .collect();
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .layout(vk::PipelineLayout::from_raw(descriptor.layout.raw()))
        .render_pass(vk::RenderPass::from_raw(descriptor.render_pass.raw()))
        .subpass(descriptor.subpass);
    if descriptor.topology == PrimitiveTopology::PatchList {
        pipeline_info = pipeline_info.tessellation_state(&tessellation_state);
    }

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| creation_error("graphics pipeline", e))?;

    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| GraphicsError::Internal("driver returned no pipeline".to_string()))
}
