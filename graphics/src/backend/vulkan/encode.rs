//! Translation of [`Command`]s into `vkCmd*` calls.

use ash::vk;
use ash::vk::Handle;

use crate::backend::{Command, SubpassContents};
use crate::types::{Extent2d, TextureLayout};

use super::conversion::{
    convert_clear_value, convert_index_format, convert_layout, convert_shader_stages,
    layout_access,
};

pub fn subpass_contents(contents: SubpassContents) -> vk::SubpassContents {
    match contents {
        SubpassContents::Inline => vk::SubpassContents::INLINE,
        SubpassContents::SecondaryCommandBuffers => vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
    }
}

fn extent(extent: Extent2d) -> vk::Extent2D {
    vk::Extent2D {
        width: extent.width,
        height: extent.height,
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    full_range(vk::ImageAspectFlags::COLOR)
}

/// Every mip level and layer of the given aspects.
pub fn full_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

/// Full-image layout transition.
pub fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: TextureLayout,
    new_layout: TextureLayout,
) {
    let (src_access, src_stage) = layout_access(old_layout);
    let (dst_access, dst_stage) = layout_access(new_layout);

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(convert_layout(old_layout))
        .new_layout(convert_layout(new_layout))
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Record one command into `cmd`.
///
/// Handles carry raw Vulkan handles, so no object lookups happen here.
pub fn encode(device: &ash::Device, cmd: vk::CommandBuffer, command: Command) {
    match command {
        Command::BeginRenderPass {
            render_pass,
            framebuffer,
            extent: area,
            clear_values,
            contents,
        } => {
            let clear_values: Vec<vk::ClearValue> =
                clear_values.into_iter().map(convert_clear_value).collect();
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(vk::RenderPass::from_raw(render_pass.raw()))
                .framebuffer(vk::Framebuffer::from_raw(framebuffer.raw()))
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: extent(area),
                })
                .clear_values(&clear_values);
            unsafe {
                device.cmd_begin_render_pass(cmd, &begin_info, subpass_contents(contents));
            }
        }
        Command::NextSubpass { contents } => unsafe {
            device.cmd_next_subpass(cmd, subpass_contents(contents));
        },
        Command::EndRenderPass => unsafe {
            device.cmd_end_render_pass(cmd);
        },
        Command::ExecuteCommands(buffers) => {
            let buffers: Vec<vk::CommandBuffer> = buffers
                .into_iter()
                .map(|b| vk::CommandBuffer::from_raw(b.raw()))
                .collect();
            unsafe { device.cmd_execute_commands(cmd, &buffers) };
        }
        Command::TextureBarrier {
            texture,
            old_layout,
            new_layout,
        } => transition(
            device,
            cmd,
            vk::Image::from_raw(texture.raw()),
            color_range(),
            old_layout,
            new_layout,
        ),
        Command::CopyTexture {
            source,
            destination,
            extent: size,
        } => {
            let layers = vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            };
            let region = vk::ImageCopy::default()
                .src_subresource(layers)
                .dst_subresource(layers)
                .extent(vk::Extent3D {
                    width: size.width,
                    height: size.height,
                    depth: 1,
                });
            unsafe {
                device.cmd_copy_image(
                    cmd,
                    vk::Image::from_raw(source.raw()),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::Image::from_raw(destination.raw()),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        }
        Command::BindPipeline(pipeline) => unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                vk::Pipeline::from_raw(pipeline.raw()),
            );
        },
        Command::BindDescriptorSets {
            layout,
            first_set,
            sets,
            dynamic_offsets,
        } => {
            let sets: Vec<vk::DescriptorSet> = sets
                .into_iter()
                .map(|s| vk::DescriptorSet::from_raw(s.raw()))
                .collect();
            unsafe {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    vk::PipelineLayout::from_raw(layout.raw()),
                    first_set,
                    &sets,
                    &dynamic_offsets,
                );
            }
        }
        Command::PushConstants {
            layout,
            stages,
            offset,
            data,
        } => unsafe {
            device.cmd_push_constants(
                cmd,
                vk::PipelineLayout::from_raw(layout.raw()),
                convert_shader_stages(stages),
                offset,
                &data,
            );
        },
        Command::BindVertexBuffers {
            first_binding,
            buffers,
        } => {
            let (handles, offsets): (Vec<vk::Buffer>, Vec<u64>) = buffers
                .into_iter()
                .map(|(buffer, offset)| (vk::Buffer::from_raw(buffer.raw()), offset))
                .unzip();
            unsafe { device.cmd_bind_vertex_buffers(cmd, first_binding, &handles, &offsets) };
        }
        Command::BindIndexBuffer {
            buffer,
            offset,
            format,
        } => unsafe {
            device.cmd_bind_index_buffer(
                cmd,
                vk::Buffer::from_raw(buffer.raw()),
                offset,
                convert_index_format(format),
            );
        },
        Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        } => unsafe {
            device.cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance);
        },
        Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        } => unsafe {
            device.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        },
    }
}
