//! Physical device selection and logical device creation.

use std::ffi::CStr;

use ash::vk;

use crate::backend::QueueKind;
use crate::error::{SyncError, SyncResult};

use super::instance::REQUIRED_API_VERSION;

/// Queue family chosen for each queue kind.
///
/// Compute and copy fall back to the graphics family when the device has no
/// dedicated family for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub copy: u32,
}

impl QueueFamilies {
    pub fn family(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Copy => self.copy,
        }
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.compute, self.copy] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

fn supports_timeline_semaphores(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_12);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    vulkan_12.timeline_semaphore == vk::TRUE
}

/// Select the best physical device with timeline semaphore support.
///
/// Prefers discrete GPUs over integrated GPUs.
pub fn select_physical_device(instance: &ash::Instance) -> SyncResult<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        SyncError::Native(format!("Failed to enumerate physical devices: {:?}", e))
    })?;

    if devices.is_empty() {
        return Err(SyncError::Native("No Vulkan-capable GPU found".to_string()));
    }

    let mut best_device = None;
    let mut best_score = 0;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        // SAFETY: device_name is a null-terminated string filled in by the driver
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

        if properties.api_version < REQUIRED_API_VERSION
            || !supports_timeline_semaphores(instance, device)
        {
            log::info!("Skipping GPU {:?}: no Vulkan 1.2 timeline semaphores", device_name);
            continue;
        }

        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device.ok_or_else(|| SyncError::Native("No suitable GPU found".to_string()))
}

/// Pick queue families, preferring dedicated compute and transfer families.
pub fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> SyncResult<QueueFamilies> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let find = |wanted: vk::QueueFlags, excluded: vk::QueueFlags| {
        families
            .iter()
            .position(|f| f.queue_flags.contains(wanted) && !f.queue_flags.intersects(excluded))
            .map(|index| index as u32)
    };

    let graphics = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty())
        .ok_or_else(|| SyncError::Native("No graphics queue family found".to_string()))?;
    let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(graphics);
    let copy = find(
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
    .unwrap_or(compute);

    Ok(QueueFamilies {
        graphics,
        compute,
        copy,
    })
}

/// Create a logical device with timeline semaphores enabled and one queue per family.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
    presentation: bool,
) -> SyncResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
        })
        .collect();

    let mut device_extensions = Vec::new();
    if presentation {
        device_extensions.push(ash::khr::swapchain::NAME.as_ptr());
    }

    let mut vulkan_12_features =
        vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .push_next(&mut vulkan_12_features);

    unsafe { instance.create_device(physical_device, &create_info, None) }
        .map_err(|e| SyncError::Native(format!("Failed to create logical device: {:?}", e)))
}
