//! Vulkan instance creation.
//!
//! The instance is headless: the window layer owns surfaces and swapchains
//! and hands finished images to the renderer, so no surface extensions are
//! requested here.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::error::GraphicsError;

use super::debug;

/// Classic render passes and secondary command buffers need nothing past 1.1.
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 1, 0);

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance plus the optional validation messenger.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub debug_utils: Option<ash::ext::debug_utils::Instance>,
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

/// Create a Vulkan instance, with validation when requested and available.
pub fn create_instance(
    entry: &ash::Entry,
    application_name: &str,
    validation_requested: bool,
) -> Result<InstanceBundle, GraphicsError> {
    let validation = validation_requested && has_validation_layer(entry);
    if validation_requested && !validation {
        log::warn!("Validation layers requested but not available");
    }

    let app_name = CString::new(application_name).map_err(|e| {
        GraphicsError::InvalidParameter(format!("Invalid application name: {e}"))
    })?;
    let engine_name = c"inflight";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let mut extensions = Vec::new();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[allow(unused_mut)]
    let mut create_flags = vk::InstanceCreateFlags::empty();

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        create_flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let layer_names: Vec<*const std::ffi::c_char> = if validation {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .flags(create_flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create Vulkan instance: {e:?}"))
    })?;

    if !validation {
        return Ok(InstanceBundle {
            instance,
            debug_utils: None,
            debug_messenger: None,
        });
    }

    let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
    let messenger = match debug::create_debug_messenger(&debug_utils) {
        Ok(messenger) => messenger,
        Err(e) => {
            unsafe { instance.destroy_instance(None) };
            return Err(e);
        }
    };

    Ok(InstanceBundle {
        instance,
        debug_utils: Some(debug_utils),
        debug_messenger: Some(messenger),
    })
}

fn has_validation_layer(entry: &ash::Entry) -> bool {
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers.iter().any(|layer| {
        layer
            .layer_name_as_c_str()
            .is_ok_and(|name| name == VALIDATION_LAYER_NAME)
    })
}
