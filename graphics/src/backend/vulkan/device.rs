//! Vulkan physical and logical device selection.

use ash::vk;

use crate::error::GraphicsError;

/// The chosen adapter and its graphics queue family.
#[derive(Debug, Clone, Copy)]
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
}

/// Pick the highest scoring adapter that has a graphics queue.
///
/// Discrete GPUs beat integrated ones, ties go to the larger 2D image limit.
pub fn select_physical_device(instance: &ash::Instance) -> Result<SelectedDevice, GraphicsError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to enumerate physical devices: {e:?}"))
    })?;

    if devices.is_empty() {
        return Err(GraphicsError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, SelectedDevice)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let Some(queue_family) = find_graphics_queue_family(instance, device) else {
            continue;
        };

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 1,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            properties.device_name_as_c_str().unwrap_or(c"<unnamed>"),
            properties.device_type,
            score
        );

        if best.is_none_or(|(best_score, _)| score > best_score) {
            best = Some((
                score,
                SelectedDevice {
                    physical_device: device,
                    queue_family,
                },
            ));
        }
    }

    best.map(|(_, selected)| selected)
        .ok_or_else(|| GraphicsError::InitializationFailed("No suitable GPU found".to_string()))
}

fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

/// Create the logical device with one graphics queue.
///
/// The swapchain extension is enabled when the adapter offers it so the
/// window layer can present images rendered through this device.
pub fn create_logical_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
) -> Result<ash::Device, GraphicsError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selected.queue_family)
        .queue_priorities(&queue_priorities)];

    let available =
        unsafe { instance.enumerate_device_extension_properties(selected.physical_device) }
            .map_err(|e| {
                GraphicsError::InitializationFailed(format!(
                    "Failed to enumerate device extensions: {e:?}"
                ))
            })?;
    let has_swapchain = available
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(ash::khr::swapchain::NAME));

    let mut extensions = Vec::new();
    if has_swapchain {
        extensions.push(ash::khr::swapchain::NAME.as_ptr());
    } else {
        log::warn!("Device has no swapchain support, presenting is unavailable");
    }

    let supported = unsafe { instance.get_physical_device_features(selected.physical_device) };
    let features = vk::PhysicalDeviceFeatures::default()
        .tessellation_shader(supported.tessellation_shader == vk::TRUE)
        .geometry_shader(supported.geometry_shader == vk::TRUE)
        .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    unsafe { instance.create_device(selected.physical_device, &create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create logical device: {e:?}"))
    })
}
