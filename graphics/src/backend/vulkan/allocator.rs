//! GPU memory through gpu-allocator.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;

use crate::error::GraphicsError;

pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: &ash::Device,
) -> Result<Allocator, GraphicsError> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {e}"))
    })
}

/// Allocate and bind memory for a buffer.
pub fn bind_buffer(
    allocator: &Mutex<Allocator>,
    device: &ash::Device,
    buffer: vk::Buffer,
    name: &str,
    location: MemoryLocation,
) -> Result<Allocation, GraphicsError> {
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
    let allocation = allocate(allocator, name, requirements, location, true)?;
    if let Err(e) =
        unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
    {
        free(allocator, allocation);
        return Err(GraphicsError::ResourceCreationFailed(format!(
            "Failed to bind buffer memory: {e:?}"
        )));
    }
    Ok(allocation)
}

/// Allocate and bind device-local memory for an optimally tiled image.
pub fn bind_image(
    allocator: &Mutex<Allocator>,
    device: &ash::Device,
    image: vk::Image,
    name: &str,
) -> Result<Allocation, GraphicsError> {
    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let allocation = allocate(allocator, name, requirements, MemoryLocation::GpuOnly, false)?;
    if let Err(e) =
        unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
    {
        free(allocator, allocation);
        return Err(GraphicsError::ResourceCreationFailed(format!(
            "Failed to bind image memory: {e:?}"
        )));
    }
    Ok(allocation)
}

fn allocate(
    allocator: &Mutex<Allocator>,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation, GraphicsError> {
    allocator
        .lock()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| match e {
            gpu_allocator::AllocationError::OutOfMemory => GraphicsError::OutOfMemory,
            e => GraphicsError::ResourceCreationFailed(format!("Failed to allocate {name}: {e}")),
        })
}

pub fn free(allocator: &Mutex<Allocator>, allocation: Allocation) {
    if let Err(e) = allocator.lock().free(allocation) {
        log::warn!("Failed to free GPU allocation: {e}");
    }
}
