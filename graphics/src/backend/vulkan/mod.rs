//! Vulkan backend implementation using ash.
//!
//! Native objects are identified by their raw Vulkan handle, so most
//! [`GpuBackend`] calls translate directly into one Vulkan call. Buffers and
//! textures additionally keep their memory allocation (and the texture's
//! default view) in a side table keyed by that raw handle.
//!
//! Presentation is out of scope: the window layer owns the swapchain and
//! passes its images in through [`VulkanBackend::import_texture`].

mod allocator;
mod conversion;
mod debug;
mod device;
mod encode;
mod instance;
mod pipeline;

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;

use crate::config::RendererConfig;
use crate::error::GraphicsError;
use crate::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, FenceHandle, FramebufferHandle, PipelineHandle,
    PipelineLayoutHandle, RenderPassHandle, SemaphoreHandle, ShaderModuleHandle, TextureHandle,
};
use crate::resource::GpuResource;
use crate::types::{
    BufferDescriptor, BufferUsage, DescriptorBinding, DescriptorType, Extent2d, ShaderStages,
    TextureDescriptor, TextureFormat, TextureLayout,
};

use super::{
    Command, CommandBufferBegin, CommandBufferLevel, FramebufferDescriptor, GpuBackend,
    GraphicsPipelineDescriptor, PipelineLayoutDescriptor, RenderPassDescriptor, Submission,
};

use conversion::{
    aspect_mask, convert_buffer_usage, convert_descriptor_type, convert_sample_count,
    convert_texture_format, convert_texture_usage,
};
use pipeline::creation_error;

pub use conversion::texture_format_from_vk;

fn device_error(what: &str, e: vk::Result) -> GraphicsError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GraphicsError::OutOfMemory
        }
        e => GraphicsError::Internal(format!("{what} failed: {e:?}")),
    }
}

struct BufferEntry {
    allocation: Allocation,
    size: u64,
}

struct TextureEntry {
    view: vk::ImageView,
    /// `None` for imported images the backend does not own.
    allocation: Option<Allocation>,
    format: TextureFormat,
    extent: Extent2d,
}

/// Vulkan implementation of [`GpuBackend`].
pub struct VulkanBackend {
    // Keeps the loader library alive for the lifetime of the instance.
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    device: ash::Device,
    queue_family: u32,
    /// Queue submission and device-wide waits are externally synchronized.
    queue: Mutex<vk::Queue>,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    descriptor_pool: Mutex<vk::DescriptorPool>,
    /// Pool for the backend's own one-shot transfers.
    transfer_pool: Mutex<vk::CommandPool>,
    buffers: Mutex<HashMap<u64, BufferEntry>>,
    textures: Mutex<HashMap<u64, TextureEntry>>,
}

static_assertions::assert_impl_all!(VulkanBackend: Send, Sync);

impl VulkanBackend {
    /// Load Vulkan, pick an adapter and create the device.
    pub fn new(config: &RendererConfig) -> Result<Self, GraphicsError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan: {e}"))
        })?;

        let instance::InstanceBundle {
            instance,
            debug_utils,
            debug_messenger,
        } = instance::create_instance(&entry, &config.application_name, config.validation)?;

        let destroy_instance = || unsafe {
            if let (Some(utils), Some(messenger)) = (&debug_utils, debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            instance.destroy_instance(None);
        };

        let selected = match device::select_physical_device(&instance) {
            Ok(selected) => selected,
            Err(e) => {
                destroy_instance();
                return Err(e);
            }
        };
        let device = match device::create_logical_device(&instance, &selected) {
            Ok(device) => device,
            Err(e) => {
                destroy_instance();
                return Err(e);
            }
        };

        let objects = allocator::create_allocator(&instance, selected.physical_device, &device)
            .and_then(|allocator| {
                let descriptor_pool = pipeline::create_descriptor_pool(&device)?;
                match create_command_pool(&device, selected.queue_family) {
                    Ok(transfer_pool) => Ok((allocator, descriptor_pool, transfer_pool)),
                    Err(e) => {
                        unsafe { device.destroy_descriptor_pool(descriptor_pool, None) };
                        Err(e)
                    }
                }
            });
        let (allocator, descriptor_pool, transfer_pool) = match objects {
            Ok(objects) => objects,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                destroy_instance();
                return Err(e);
            }
        };

        let queue = unsafe { device.get_device_queue(selected.queue_family, 0) };

        log::info!(
            "Vulkan backend initialized (validation: {})",
            debug_messenger.is_some()
        );

        Ok(Self {
            _entry: entry,
            instance,
            debug_utils,
            debug_messenger,
            device,
            queue_family: selected.queue_family,
            queue: Mutex::new(queue),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            descriptor_pool: Mutex::new(descriptor_pool),
            transfer_pool: Mutex::new(transfer_pool),
            buffers: Mutex::new(HashMap::new()),
            textures: Mutex::new(HashMap::new()),
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Wrap an image owned by someone else, typically a swapchain image.
    ///
    /// Only the view is created and later destroyed by the backend; the
    /// image itself stays with its owner.
    pub fn import_texture(
        &self,
        image: vk::Image,
        format: TextureFormat,
        extent: Extent2d,
    ) -> Result<TextureHandle, GraphicsError> {
        let view = self.create_view(image, format)?;
        self.textures.lock().insert(
            image.as_raw(),
            TextureEntry {
                view,
                allocation: None,
                format,
                extent,
            },
        );
        Ok(TextureHandle::from_raw(image.as_raw()))
    }

    fn create_view(
        &self,
        image: vk::Image,
        format: TextureFormat,
    ) -> Result<vk::ImageView, GraphicsError> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert_texture_format(format))
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| creation_error("image view", e))
    }

    fn view(&self, texture: TextureHandle) -> Result<vk::ImageView, GraphicsError> {
        self.textures
            .lock()
            .get(&texture.raw())
            .map(|entry| entry.view)
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("unknown texture {:#x}", texture.raw()))
            })
    }

    fn create_buffer_at(
        &self,
        descriptor: &BufferDescriptor,
        location: MemoryLocation,
    ) -> Result<BufferHandle, GraphicsError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| creation_error("buffer", e))?;

        let name = descriptor.label.as_deref().unwrap_or("buffer");
        let allocation =
            match allocator::bind_buffer(&self.allocator, &self.device, buffer, name, location) {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { self.device.destroy_buffer(buffer, None) };
                    return Err(e);
                }
            };

        self.buffers.lock().insert(
            buffer.as_raw(),
            BufferEntry {
                allocation,
                size: descriptor.size,
            },
        );
        Ok(BufferHandle::from_raw(buffer.as_raw()))
    }

    /// Record into a temporary primary buffer, submit it and wait for it.
    fn submit_and_wait(
        &self,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), GraphicsError> {
        let pool = self.transfer_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| creation_error("transfer command buffer", e))?;
        let fence = match unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { self.device.free_command_buffers(*pool, &buffers) };
                return Err(creation_error("transfer fence", e));
            }
        };

        let result = (|| {
            let cmd = buffers[0];
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
                .map_err(|e| device_error("begin transfer commands", e))?;
            record(cmd);
            unsafe { self.device.end_command_buffer(cmd) }
                .map_err(|e| device_error("end transfer commands", e))?;

            let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);
            {
                let queue = self.queue.lock();
                unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }
                    .map_err(|e| device_error("submit transfer", e))?;
            }
            unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
                .map_err(|e| device_error("wait for transfer", e))
        })();

        unsafe {
            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(*pool, &buffers);
        }
        result
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        let Some(entry) = self.textures.lock().remove(&texture.raw()) else {
            log::warn!("Destroying unknown texture {:#x}", texture.raw());
            return;
        };
        unsafe { self.device.destroy_image_view(entry.view, None) };
        if let Some(allocation) = entry.allocation {
            unsafe {
                self.device
                    .destroy_image(vk::Image::from_raw(texture.raw()), None)
            };
            allocator::free(&self.allocator, allocation);
        }
    }
}

fn create_command_pool(
    device: &ash::Device,
    queue_family: u32,
) -> Result<vk::CommandPool, GraphicsError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
    unsafe { device.create_command_pool(&pool_info, None) }
        .map_err(|e| creation_error("command pool", e))
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle, GraphicsError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.create_fence(&fence_info, None) }
            .map_err(|e| creation_error("fence", e))?;
        Ok(FenceHandle::from_raw(fence.as_raw()))
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle, GraphicsError> {
        let semaphore =
            unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
                .map_err(|e| creation_error("semaphore", e))?;
        Ok(SemaphoreHandle::from_raw(semaphore.as_raw()))
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<bool, GraphicsError> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let fences = [vk::Fence::from_raw(fence.raw())];
        match unsafe { self.device.wait_for_fences(&fences, true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(device_error("fence wait", e)),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), GraphicsError> {
        let fences = [vk::Fence::from_raw(fence.raw())];
        unsafe { self.device.reset_fences(&fences) }.map_err(|e| device_error("fence reset", e))
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> Result<bool, GraphicsError> {
        unsafe { self.device.get_fence_status(vk::Fence::from_raw(fence.raw())) }
            .map_err(|e| device_error("fence status query", e))
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        let _queue = self.queue.lock();
        unsafe { self.device.device_wait_idle() }.map_err(|e| device_error("device wait", e))
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferHandle, GraphicsError> {
        let location = if descriptor.is_host_visible() {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        self.create_buffer_at(descriptor, location)
    }

    fn write_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let buffers = self.buffers.lock();
        let entry = buffers.get(&buffer.raw()).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("unknown buffer {:#x}", buffer.raw()))
        })?;
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > entry.size) {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                entry.size
            )));
        }
        let Some(mapped) = entry.allocation.mapped_ptr() else {
            return Err(GraphicsError::InvalidParameter(
                "buffer is not mapped for CPU access".to_string(),
            ));
        };

        // SAFETY: the range was bounds-checked against the allocation above.
        unsafe {
            let dst = mapped.as_ptr().cast::<u8>().add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    fn create_texture(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<TextureHandle, GraphicsError> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert_texture_format(descriptor.format))
            .extent(vk::Extent3D {
                width: descriptor.extent.width,
                height: descriptor.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(convert_sample_count(descriptor.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_texture_usage(descriptor.usage, descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| creation_error("image", e))?;

        let name = descriptor.label.as_deref().unwrap_or("texture");
        let allocation = match allocator::bind_image(&self.allocator, &self.device, image, name) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        let view = match self.create_view(image, descriptor.format) {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                allocator::free(&self.allocator, allocation);
                return Err(e);
            }
        };

        self.textures.lock().insert(
            image.as_raw(),
            TextureEntry {
                view,
                allocation: Some(allocation),
                format: descriptor.format,
                extent: descriptor.extent,
            },
        );
        Ok(TextureHandle::from_raw(image.as_raw()))
    }

    fn read_texture(
        &self,
        texture: TextureHandle,
        layout: TextureLayout,
    ) -> Result<Vec<u8>, GraphicsError> {
        let (format, extent) = self
            .textures
            .lock()
            .get(&texture.raw())
            .map(|entry| (entry.format, entry.extent))
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("unknown texture {:#x}", texture.raw()))
            })?;
        self.wait_idle()?;

        let size = extent.area() * format.block_size() as u64;
        let staging = self.create_buffer_at(
            &BufferDescriptor::new(size, BufferUsage::COPY_DST).with_label("readback"),
            MemoryLocation::GpuToCpu,
        )?;

        let image = vk::Image::from_raw(texture.raw());
        let range = vk::ImageSubresourceRange {
            aspect_mask: aspect_mask(format),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        // Buffer copies take exactly one aspect.
        let copy_aspect = if format.is_depth_stencil() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: copy_aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });

        let copied = self.submit_and_wait(|cmd| {
            encode::transition(
                &self.device,
                cmd,
                image,
                range,
                layout,
                TextureLayout::TransferSrc,
            );
            unsafe {
                self.device.cmd_copy_image_to_buffer(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::Buffer::from_raw(staging.raw()),
                    &[region],
                );
            }
            if layout != TextureLayout::Undefined {
                encode::transition(
                    &self.device,
                    cmd,
                    image,
                    range,
                    TextureLayout::TransferSrc,
                    layout,
                );
            }
        });

        let data = copied.and_then(|()| {
            let buffers = self.buffers.lock();
            let mapped = buffers
                .get(&staging.raw())
                .and_then(|entry| entry.allocation.mapped_ptr())
                .ok_or_else(|| {
                    GraphicsError::Internal("readback buffer is not mapped".to_string())
                })?;
            let mut data = vec![0u8; size as usize];
            // SAFETY: the staging allocation is `size` bytes and the copy finished.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    mapped.as_ptr().cast::<u8>(),
                    data.as_mut_ptr(),
                    data.len(),
                );
            }
            Ok(data)
        });
        self.destroy(GpuResource::Buffer(staging));
        data
    }

    fn create_shader_module(
        &self,
        _stage: ShaderStages,
        code: &[u32],
    ) -> Result<ShaderModuleHandle, GraphicsError> {
        let module_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { self.device.create_shader_module(&module_info, None) }
            .map_err(|e| creation_error("shader module", e))?;
        Ok(ShaderModuleHandle::from_raw(module.as_raw()))
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorSetLayoutHandle, GraphicsError> {
        let layout = pipeline::create_descriptor_set_layout(&self.device, bindings)?;
        Ok(DescriptorSetLayoutHandle::from_raw(layout.as_raw()))
    }

    fn allocate_descriptor_set(
        &self,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle, GraphicsError> {
        let layouts = [vk::DescriptorSetLayout::from_raw(layout.raw())];
        let pool = self.descriptor_pool.lock();
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(*pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| creation_error("descriptor set", e))?;
        sets.first()
            .map(|set| DescriptorSetHandle::from_raw(set.as_raw()))
            .ok_or_else(|| GraphicsError::Internal("driver returned no descriptor set".to_string()))
    }

    fn write_buffer_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        ty: DescriptorType,
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    ) -> Result<(), GraphicsError> {
        if ty == DescriptorType::CombinedImageSampler {
            return Err(GraphicsError::InvalidParameter(
                "image sampler binding written with a buffer".to_string(),
            ));
        }
        let buffer_infos = [vk::DescriptorBufferInfo::default()
            .buffer(vk::Buffer::from_raw(buffer.raw()))
            .offset(offset)
            .range(range)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(vk::DescriptorSet::from_raw(set.raw()))
            .dst_binding(binding)
            .descriptor_type(convert_descriptor_type(ty))
            .buffer_info(&buffer_infos);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn create_pipeline_layout(
        &self,
        descriptor: &PipelineLayoutDescriptor,
    ) -> Result<PipelineLayoutHandle, GraphicsError> {
        let layout = pipeline::create_pipeline_layout(&self.device, descriptor)?;
        Ok(PipelineLayoutHandle::from_raw(layout.as_raw()))
    }

    fn create_render_pass(
        &self,
        descriptor: &RenderPassDescriptor,
    ) -> Result<RenderPassHandle, GraphicsError> {
        let render_pass = pipeline::create_render_pass(&self.device, descriptor)?;
        Ok(RenderPassHandle::from_raw(render_pass.as_raw()))
    }

    fn create_framebuffer(
        &self,
        descriptor: &FramebufferDescriptor,
    ) -> Result<FramebufferHandle, GraphicsError> {
        let views: Vec<vk::ImageView> = descriptor
            .attachments
            .iter()
            .map(|&texture| self.view(texture))
            .collect::<Result<_, _>>()?;
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(vk::RenderPass::from_raw(descriptor.render_pass.raw()))
            .attachments(&views)
            .width(descriptor.extent.width)
            .height(descriptor.extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None) }
            .map_err(|e| creation_error("framebuffer", e))?;
        Ok(FramebufferHandle::from_raw(framebuffer.as_raw()))
    }

    fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> Result<PipelineHandle, GraphicsError> {
        let pipeline = pipeline::create_graphics_pipeline(&self.device, descriptor)?;
        Ok(PipelineHandle::from_raw(pipeline.as_raw()))
    }

    fn destroy(&self, resource: GpuResource) {
        let device = &self.device;
        unsafe {
            match resource {
                GpuResource::Buffer(buffer) => {
                    let entry = self.buffers.lock().remove(&buffer.raw());
                    device.destroy_buffer(vk::Buffer::from_raw(buffer.raw()), None);
                    if let Some(entry) = entry {
                        allocator::free(&self.allocator, entry.allocation);
                    }
                }
                GpuResource::Texture(texture)
                | GpuResource::RenderTarget(texture)
                | GpuResource::DepthBuffer(texture) => self.destroy_texture(texture),
                GpuResource::DescriptorSet(set) => {
                    let pool = self.descriptor_pool.lock();
                    let sets = [vk::DescriptorSet::from_raw(set.raw())];
                    if let Err(e) = device.free_descriptor_sets(*pool, &sets) {
                        log::warn!("Failed to free descriptor set: {e:?}");
                    }
                }
                GpuResource::DescriptorSetLayout(layout) => device.destroy_descriptor_set_layout(
                    vk::DescriptorSetLayout::from_raw(layout.raw()),
                    None,
                ),
                GpuResource::Pipeline(pipeline) => {
                    device.destroy_pipeline(vk::Pipeline::from_raw(pipeline.raw()), None)
                }
                GpuResource::PipelineLayout(layout) => device
                    .destroy_pipeline_layout(vk::PipelineLayout::from_raw(layout.raw()), None),
                GpuResource::RenderPass(render_pass) => {
                    device.destroy_render_pass(vk::RenderPass::from_raw(render_pass.raw()), None)
                }
                GpuResource::Framebuffer(framebuffer) => device
                    .destroy_framebuffer(vk::Framebuffer::from_raw(framebuffer.raw()), None),
                GpuResource::CommandPool(pool) => {
                    device.destroy_command_pool(vk::CommandPool::from_raw(pool.raw()), None)
                }
                GpuResource::CommandBuffers { pool, buffers } => {
                    let buffers: Vec<vk::CommandBuffer> = buffers
                        .iter()
                        .map(|b| vk::CommandBuffer::from_raw(b.raw()))
                        .collect();
                    device.free_command_buffers(vk::CommandPool::from_raw(pool.raw()), &buffers);
                }
                GpuResource::Fence(fence) => {
                    device.destroy_fence(vk::Fence::from_raw(fence.raw()), None)
                }
                GpuResource::Semaphore(semaphore) => {
                    device.destroy_semaphore(vk::Semaphore::from_raw(semaphore.raw()), None)
                }
                GpuResource::ShaderModule(module) => {
                    device.destroy_shader_module(vk::ShaderModule::from_raw(module.raw()), None)
                }
            }
        }
    }

    fn create_command_pool(&self) -> Result<CommandPoolHandle, GraphicsError> {
        let pool = create_command_pool(&self.device, self.queue_family)?;
        Ok(CommandPoolHandle::from_raw(pool.as_raw()))
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        level: CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBufferHandle>, GraphicsError> {
        let level = match level {
            CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        };
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk::CommandPool::from_raw(pool.raw()))
            .level(level)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| creation_error("command buffers", e))?;
        Ok(buffers
            .into_iter()
            .map(|b| CommandBufferHandle::from_raw(b.as_raw()))
            .collect())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        begin: &CommandBufferBegin,
    ) -> Result<(), GraphicsError> {
        let cmd = vk::CommandBuffer::from_raw(command_buffer.raw());
        // Pools are created with RESET_COMMAND_BUFFER, so beginning resets.
        let result = match begin {
            CommandBufferBegin::Primary => {
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            }
            CommandBufferBegin::Secondary(inheritance) => {
                let framebuffer = inheritance
                    .framebuffer
                    .map_or(vk::Framebuffer::null(), |f| vk::Framebuffer::from_raw(f.raw()));
                let inheritance_info = vk::CommandBufferInheritanceInfo::default()
                    .render_pass(vk::RenderPass::from_raw(inheritance.render_pass.raw()))
                    .subpass(inheritance.subpass)
                    .framebuffer(framebuffer);
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(
                        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                            | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
                    )
                    .inheritance_info(&inheritance_info);
                unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            }
        };
        result.map_err(|e| device_error("begin command buffer", e))
    }

    fn end_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
    ) -> Result<(), GraphicsError> {
        unsafe {
            self.device
                .end_command_buffer(vk::CommandBuffer::from_raw(command_buffer.raw()))
        }
        .map_err(|e| device_error("end command buffer", e))
    }

    fn record(&self, command_buffer: CommandBufferHandle, command: Command) {
        let cmd = vk::CommandBuffer::from_raw(command_buffer.raw());
        if let Command::TextureBarrier {
            texture,
            old_layout,
            new_layout,
        } = command
        {
            // Depth targets transition their depth (and stencil) aspects.
            let format = self.textures.lock().get(&texture.raw()).map(|e| e.format);
            if let Some(format) = format.filter(TextureFormat::is_depth_stencil) {
                encode::transition(
                    &self.device,
                    cmd,
                    vk::Image::from_raw(texture.raw()),
                    encode::full_range(aspect_mask(format)),
                    old_layout,
                    new_layout,
                );
                return;
            }
        }
        encode::encode(&self.device, cmd, command);
    }

    fn submit(&self, submission: &Submission) -> Result<(), GraphicsError> {
        let wait_semaphores: Vec<vk::Semaphore> = submission
            .wait_semaphores
            .iter()
            .map(|s| vk::Semaphore::from_raw(s.raw()))
            .collect();
        let wait_stages =
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];
        let signal_semaphores: Vec<vk::Semaphore> = submission
            .signal_semaphores
            .iter()
            .map(|s| vk::Semaphore::from_raw(s.raw()))
            .collect();
        let command_buffers = [vk::CommandBuffer::from_raw(submission.command_buffer.raw())];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        let fence = submission
            .fence
            .map_or(vk::Fence::null(), |f| vk::Fence::from_raw(f.raw()));

        let queue = self.queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], fence) }
            .map_err(|e| device_error("queue submit", e))
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let buffers = std::mem::take(self.buffers.get_mut());
            let textures = std::mem::take(self.textures.get_mut());
            if !buffers.is_empty() || !textures.is_empty() {
                log::warn!(
                    "Vulkan backend dropped with {} buffers and {} textures still alive",
                    buffers.len(),
                    textures.len()
                );
            }
            for (raw, entry) in buffers {
                self.device.destroy_buffer(vk::Buffer::from_raw(raw), None);
                allocator::free(&self.allocator, entry.allocation);
            }
            for (raw, entry) in textures {
                self.device.destroy_image_view(entry.view, None);
                if let Some(allocation) = entry.allocation {
                    self.device.destroy_image(vk::Image::from_raw(raw), None);
                    allocator::free(&self.allocator, allocation);
                }
            }

            self.device
                .destroy_descriptor_pool(*self.descriptor_pool.get_mut(), None);
            self.device
                .destroy_command_pool(*self.transfer_pool.get_mut(), None);

            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            if let (Some(utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
