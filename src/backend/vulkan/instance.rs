//! Vulkan instance creation.

use std::ffi::{c_char, CStr, CString};

use ash::vk;

use crate::error::{SyncError, SyncResult};

use super::debug;
use super::VulkanParameters;

/// Timeline semaphores are core from Vulkan 1.2.
pub const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance plus the optional debug messenger that belongs to it.
pub struct InstanceBundle {
    pub instance: ash::Instance,
    pub debug_utils: Option<ash::ext::debug_utils::Instance>,
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

/// Compare a fixed-size name array filled in by the loader with `wanted`.
fn fixed_name_eq(raw: &[c_char], wanted: &CStr) -> bool {
    if !raw.contains(&0) {
        return false;
    }
    // SAFETY: raw holds a null terminator within its bounds
    (unsafe { CStr::from_ptr(raw.as_ptr()) }) == wanted
}

/// Surface extensions a window on this platform may need.
fn platform_surface_extensions() -> Vec<&'static CStr> {
    let mut names = vec![ash::khr::surface::NAME];
    if cfg!(target_os = "windows") {
        names.push(ash::khr::win32_surface::NAME);
    }
    if cfg!(target_os = "linux") {
        names.extend([
            ash::khr::xlib_surface::NAME,
            ash::khr::xcb_surface::NAME,
            ash::khr::wayland_surface::NAME,
        ]);
    }
    if cfg!(target_os = "macos") {
        names.push(ash::ext::metal_surface::NAME);
    }
    names
}

/// Create a Vulkan 1.2 instance, with validation and surface extensions as requested.
pub fn create_instance(entry: &ash::Entry, params: &VulkanParameters) -> SyncResult<InstanceBundle> {
    let loader_version = unsafe { entry.try_enumerate_instance_version() }
        .ok()
        .flatten()
        .unwrap_or(vk::API_VERSION_1_0);
    if loader_version < REQUIRED_API_VERSION {
        return Err(SyncError::Native(format!(
            "Vulkan loader reports {}.{}, timeline semaphores need 1.2",
            vk::api_version_major(loader_version),
            vk::api_version_minor(loader_version)
        )));
    }

    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    let has_layer = |wanted: &CStr| {
        layers
            .iter()
            .any(|layer| fixed_name_eq(&layer.layer_name, wanted))
    };
    let validation = params.validation && has_layer(VALIDATION_LAYER);
    if params.validation && !validation {
        log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
    }

    let available = unsafe { entry.enumerate_instance_extension_properties(None) }
        .map_err(|e| SyncError::Native(format!("instance extension query failed: {:?}", e)))?;
    let supported = |wanted: &CStr| {
        available
            .iter()
            .any(|ext| fixed_name_eq(&ext.extension_name, wanted))
    };

    let mut extensions: Vec<&CStr> = Vec::new();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }
    if params.presentation {
        for name in platform_surface_extensions() {
            if supported(name) {
                extensions.push(name);
            } else {
                log::debug!("Skipping unsupported surface extension {:?}", name);
            }
        }
    }
    let portability = cfg!(target_os = "macos")
        && supported(ash::khr::portability_enumeration::NAME);
    if portability {
        extensions.push(ash::khr::portability_enumeration::NAME);
    }

    let app_name = CString::new(params.application_name.as_str())
        .map_err(|e| SyncError::InvalidConfig(format!("application name: {}", e)))?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"frame-sync")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|n| n.as_ptr()).collect();
    let layer_ptrs: Vec<*const c_char> = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };
    let flags = if portability {
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::empty()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .flags(flags)
        .application_info(&app_info)
        .enabled_extension_names(&extension_ptrs)
        .enabled_layer_names(&layer_ptrs);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| SyncError::Native(format!("vkCreateInstance failed: {:?}", e)))?;
    log::info!(
        "Vulkan instance created (loader {}.{}, validation {}, {} extensions)",
        vk::api_version_major(loader_version),
        vk::api_version_minor(loader_version),
        validation,
        extensions.len()
    );

    if !validation {
        return Ok(InstanceBundle {
            instance,
            debug_utils: None,
            debug_messenger: None,
        });
    }

    let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
    match debug::create_debug_messenger(&debug_utils) {
        Ok(messenger) => Ok(InstanceBundle {
            instance,
            debug_utils: Some(debug_utils),
            debug_messenger: Some(messenger),
        }),
        Err(e) => {
            unsafe { instance.destroy_instance(None) };
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_name(name: &CStr) -> [c_char; vk::MAX_EXTENSION_NAME_SIZE] {
        let mut raw = [0 as c_char; vk::MAX_EXTENSION_NAME_SIZE];
        for (dst, &src) in raw.iter_mut().zip(name.to_bytes()) {
            *dst = src as c_char;
        }
        raw
    }

    #[test]
    fn test_fixed_name_eq_matches_layer_names() {
        let raw = fixed_name(VALIDATION_LAYER);
        assert!(fixed_name_eq(&raw, VALIDATION_LAYER));
        assert!(!fixed_name_eq(&raw, c"VK_LAYER_KHRONOS"));
        assert!(!fixed_name_eq(&fixed_name(c"VK_LAYER_LUNARG_api_dump"), VALIDATION_LAYER));
    }

    #[test]
    fn test_fixed_name_eq_rejects_unterminated() {
        let raw = [b'A' as c_char; 8];
        assert!(!fixed_name_eq(&raw, c"AAAAAAAA"));
    }
}
