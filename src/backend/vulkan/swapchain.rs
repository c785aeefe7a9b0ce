//! `VK_KHR_swapchain` presentation.
//!
//! Each back buffer owns an image-available and a render-finished binary
//! semaphore. Acquire signals a spare semaphore which is then swapped into the
//! acquired image's slot, so a semaphore is never reused before the image it
//! guarded comes around again. Both semaphores are handed to the queue and
//! attached to the next command submission.

use std::sync::Arc;

use ash::vk;

use crate::backend::{PresentStatus, PresentSurface};
use crate::error::{SyncError, SyncResult};

use super::{vk_error, VulkanBackend, VulkanQueue};

/// Swapchain over a caller-created `VkSurfaceKHR`.
///
/// The swapchain takes ownership of the surface and destroys it on drop.
pub struct VulkanSwapchain {
    backend: Arc<VulkanBackend>,
    queue: VulkanQueue,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    spare_semaphore: vk::Semaphore,
    current: Option<u32>,
    vsync: bool,
}

impl std::fmt::Debug for VulkanSwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanSwapchain")
            .field("images", &self.images.len())
            .field("format", &self.format.format)
            .field("extent", &self.extent)
            .field("current", &self.current)
            .field("vsync", &self.vsync)
            .finish()
    }
}

impl VulkanSwapchain {
    /// Create a swapchain presenting from `queue`.
    pub fn new(
        backend: Arc<VulkanBackend>,
        queue: &VulkanQueue,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> SyncResult<Self> {
        let supported = unsafe {
            backend.surface_loader()?.get_physical_device_surface_support(
                backend.physical_device(),
                queue.family_index(),
                surface,
            )
        }
        .map_err(|e| vk_error("Failed to query surface support", e))?;
        if !supported {
            return Err(SyncError::InvalidConfig(format!(
                "Queue family {} cannot present to this surface",
                queue.family_index()
            )));
        }

        let spare_semaphore = create_semaphore(backend.device())?;
        let mut swapchain = Self {
            backend,
            queue: queue.clone(),
            surface,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            image_available: Vec::new(),
            render_finished: Vec::new(),
            spare_semaphore,
            current: None,
            vsync,
        };
        swapchain.recreate(width, height)?;
        Ok(swapchain)
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Image and view of the acquired back buffer.
    pub fn current_image(&self) -> Option<(vk::Image, vk::ImageView)> {
        self.current
            .map(|index| (self.images[index as usize], self.views[index as usize]))
    }

    fn recreate(&mut self, width: u32, height: u32) -> SyncResult<()> {
        let backend = Arc::clone(&self.backend);
        let device = backend.device();
        let surface_loader = backend.surface_loader()?;
        let swapchain_loader = backend.swapchain_loader()?;
        let physical_device = backend.physical_device();

        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, self.surface)
        }
        .map_err(|e| vk_error("Failed to query surface capabilities", e))?;
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, self.surface)
        }
        .map_err(|e| vk_error("Failed to query surface formats", e))?;
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, self.surface)
        }
        .map_err(|e| vk_error("Failed to query present modes", e))?;

        let format = formats
            .iter()
            .copied()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first().copied())
            .ok_or_else(|| SyncError::Native("Surface reports no formats".to_string()))?;

        let present_mode = if self.vsync {
            vk::PresentModeKHR::FIFO
        } else {
            present_modes
                .iter()
                .copied()
                .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                .unwrap_or(vk::PresentModeKHR::FIFO)
        };

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| vk_error("Failed to create swapchain", e))?;

        self.destroy_images();
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;
        self.current = None;

        self.images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }
            .map_err(|e| vk_error("Failed to get swapchain images", e))?;
        self.format = format;
        self.extent = extent;

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { device.create_image_view(&view_info, None) }
                .map_err(|e| vk_error("Failed to create swapchain image view", e))?;
            self.views.push(view);
            self.image_available.push(create_semaphore(device)?);
            self.render_finished.push(create_semaphore(device)?);
        }

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            format.format,
            present_mode
        );
        Ok(())
    }

    /// Destroy views and per-image semaphores. The swapchain itself survives.
    fn destroy_images(&mut self) {
        let device = self.backend.device();
        unsafe {
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
            for semaphore in self
                .image_available
                .drain(..)
                .chain(self.render_finished.drain(..))
            {
                device.destroy_semaphore(semaphore, None);
            }
        }
        self.images.clear();
    }
}

fn create_semaphore(device: &ash::Device) -> SyncResult<vk::Semaphore> {
    unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
        .map_err(|e| vk_error("Failed to create semaphore", e))
}

impl PresentSurface for VulkanSwapchain {
    fn back_buffer_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn acquire_next(&mut self) -> SyncResult<Option<u32>> {
        let swapchain_loader = self.backend.swapchain_loader()?;
        let acquired = unsafe {
            swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.spare_semaphore,
                vk::Fence::null(),
            )
        };

        let index = match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Acquired suboptimal swapchain image {}", index);
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(None),
            Err(e) => return Err(vk_error("Failed to acquire swapchain image", e)),
        };

        let slot = index as usize;
        std::mem::swap(&mut self.spare_semaphore, &mut self.image_available[slot]);

        let mut sync = self.queue.shared().present_sync.lock();
        sync.wait.push((
            self.image_available[slot],
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ));
        sync.signal.push(self.render_finished[slot]);
        drop(sync);

        self.current = Some(index);
        Ok(Some(index))
    }

    /// Present the acquired image.
    ///
    /// Vulkan fixes the present mode at swapchain creation, so `sync_interval`
    /// takes effect on the next resize.
    fn present(&mut self, sync_interval: u32) -> SyncResult<PresentStatus> {
        self.vsync = sync_interval > 0;
        let index = self.current.take().ok_or_else(|| {
            SyncError::Native("present called without an acquired image".to_string())
        })?;

        let wait_semaphores = [self.render_finished[index as usize]];
        let swapchains = [self.swapchain];
        let image_indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let swapchain_loader = self.backend.swapchain_loader()?;
        let queue = self.queue.shared().raw.lock();
        match unsafe { swapchain_loader.queue_present(*queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(vk_error("Failed to present", e)),
        }
    }

    fn resize(&mut self, width: u32, height: u32) -> SyncResult<()> {
        // Semaphores queued for a submission that never happened are stale now.
        let mut sync = self.queue.shared().present_sync.lock();
        sync.wait.clear();
        sync.signal.clear();
        drop(sync);

        // Presentation may still hold images the frame fences do not cover.
        let queue = self.queue.shared().raw.lock();
        unsafe { self.backend.device().queue_wait_idle(*queue) }
            .map_err(|e| vk_error("Failed to wait for present queue", e))?;
        drop(queue);

        self.recreate(width, height)
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        {
            let queue = self.queue.shared().raw.lock();
            let _ = unsafe { self.backend.device().queue_wait_idle(*queue) };
        }
        self.destroy_images();
        unsafe {
            self.backend
                .device()
                .destroy_semaphore(self.spare_semaphore, None);
            if let Ok(loader) = self.backend.swapchain_loader() {
                loader.destroy_swapchain(self.swapchain, None);
            }
            if let Ok(loader) = self.backend.surface_loader() {
                loader.destroy_surface(self.surface, None);
            }
        }
    }
}
