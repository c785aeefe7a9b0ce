//! Native Vulkan backend using ash.
//!
//! Timelines are Vulkan 1.2 timeline semaphores. Signals and GPU-side waits
//! are empty queue submissions carrying a `VkTimelineSemaphoreSubmitInfo`, and
//! CPU waits block in `vkWaitSemaphores`. A command context is a transient
//! command pool with one primary command buffer, reset as a whole when its
//! frame retires. Memory comes from gpu-allocator.

mod debug;
mod device;
mod instance;
pub mod resource;
pub mod swapchain;

use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::error::{DeviceLostReason, SyncError, SyncResult};
use crate::fence::FenceValue;

use super::{Backend, QueueKind, WaitStatus};

pub use device::QueueFamilies;
pub use resource::VulkanResource;
pub use swapchain::VulkanSwapchain;

/// Map a Vulkan error code, keeping device and surface loss distinct.
pub(crate) fn vk_error(what: &str, result: vk::Result) -> SyncError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => SyncError::DeviceLost(DeviceLostReason::Removed),
        vk::Result::ERROR_SURFACE_LOST_KHR => SyncError::SurfaceLost,
        other => SyncError::Native(format!("{}: {:?}", what, other)),
    }
}

/// Parameters for [`VulkanBackend::new`].
#[derive(Debug, Clone)]
pub struct VulkanParameters {
    /// Enable the Khronos validation layer if it is installed.
    pub validation: bool,
    /// Enable surface and swapchain extensions.
    pub presentation: bool,
    /// Application name reported to the driver.
    pub application_name: String,
}

impl VulkanParameters {
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_presentation(mut self, presentation: bool) -> Self {
        self.presentation = presentation;
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }
}

impl Default for VulkanParameters {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            presentation: true,
            application_name: "frame-sync".to_string(),
        }
    }
}

/// Binary semaphores the next submission on a queue must wait on and signal.
///
/// Filled by [`VulkanSwapchain`] on acquire, consumed by the next submit.
#[derive(Debug, Default)]
pub(crate) struct PresentSync {
    pub wait: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal: Vec<vk::Semaphore>,
}

#[derive(Debug)]
pub(crate) struct QueueShared {
    pub family: u32,
    /// Vulkan requires external synchronization of queue access.
    pub raw: Mutex<vk::Queue>,
    pub present_sync: Mutex<PresentSync>,
}

/// Handle to a device queue. Clones share the underlying queue.
#[derive(Debug, Clone)]
pub struct VulkanQueue {
    kind: QueueKind,
    shared: Arc<QueueShared>,
}

impl VulkanQueue {
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn family_index(&self) -> u32 {
        self.shared.family
    }

    /// Raw queue handle. Do not submit to it while the backend may.
    pub fn raw(&self) -> vk::Queue {
        *self.shared.raw.lock()
    }

    pub(crate) fn shared(&self) -> &Arc<QueueShared> {
        &self.shared
    }

    fn submit(&self, submits: &[vk::SubmitInfo<'_>], what: &str, device: &ash::Device) -> SyncResult<()> {
        let queue = self.shared.raw.lock();
        unsafe { device.queue_submit(*queue, submits, vk::Fence::null()) }
            .map_err(|e| vk_error(what, e))
    }
}

/// Timeline semaphore.
#[derive(Debug)]
pub struct VulkanTimeline {
    semaphore: vk::Semaphore,
}

impl VulkanTimeline {
    pub fn raw(&self) -> vk::Semaphore {
        self.semaphore
    }
}

/// Transient command pool plus one primary command buffer.
#[derive(Debug)]
pub struct VulkanCommandContext {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    label: String,
    recording: bool,
}

impl VulkanCommandContext {
    /// Command buffer to record into. Valid while the context is recording.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }
}

/// Vulkan backend.
///
/// Owns the instance, the logical device, one queue per queue family and the
/// memory allocator. Destroying it waits for the device to go idle.
pub struct VulkanBackend {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    debug_device: Option<ash::ext::debug_utils::Device>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    families: QueueFamilies,
    queues: Vec<(u32, Arc<QueueShared>)>,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    surface_loader: Option<ash::khr::surface::Instance>,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("families", &self.families)
            .field("validation", &self.debug_messenger.is_some())
            .field("presentation", &self.swapchain_loader.is_some())
            .finish()
    }
}

impl VulkanBackend {
    /// Load Vulkan and create a device with timeline semaphore support.
    pub fn new(params: &VulkanParameters) -> SyncResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| SyncError::Native(format!("Failed to load Vulkan: {}", e)))?;

        let bundle = instance::create_instance(&entry, params)?;
        let instance = bundle.instance;

        let physical_device = device::select_physical_device(&instance)?;
        let families = device::find_queue_families(&instance, physical_device)?;
        let device = device::create_logical_device(
            &instance,
            physical_device,
            &families,
            params.presentation,
        )?;

        let queues = families
            .unique()
            .into_iter()
            .map(|family| {
                let raw = unsafe { device.get_device_queue(family, 0) };
                let shared = Arc::new(QueueShared {
                    family,
                    raw: Mutex::new(raw),
                    present_sync: Mutex::new(PresentSync::default()),
                });
                (family, shared)
            })
            .collect();

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| SyncError::Native(format!("Failed to create memory allocator: {}", e)))?;

        let debug_device = bundle
            .debug_utils
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&instance, &device));
        let (surface_loader, swapchain_loader) = if params.presentation {
            (
                Some(ash::khr::surface::Instance::new(&entry, &instance)),
                Some(ash::khr::swapchain::Device::new(&instance, &device)),
            )
        } else {
            (None, None)
        };

        log::info!(
            "Vulkan backend initialized (graphics family {}, compute {}, copy {}, validation: {})",
            families.graphics,
            families.compute,
            families.copy,
            bundle.debug_messenger.is_some()
        );

        Ok(Self {
            entry,
            instance,
            debug_utils: bundle.debug_utils,
            debug_messenger: bundle.debug_messenger,
            debug_device,
            physical_device,
            device,
            families,
            queues,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            surface_loader,
            swapchain_loader,
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    pub(crate) fn surface_loader(&self) -> SyncResult<&ash::khr::surface::Instance> {
        self.surface_loader.as_ref().ok_or_else(|| {
            SyncError::InvalidConfig("Vulkan backend created without presentation".into())
        })
    }

    pub(crate) fn swapchain_loader(&self) -> SyncResult<&ash::khr::swapchain::Device> {
        self.swapchain_loader.as_ref().ok_or_else(|| {
            SyncError::InvalidConfig("Vulkan backend created without presentation".into())
        })
    }

    /// Queue for the given kind. Kinds without a dedicated family share the graphics queue.
    pub fn queue(&self, kind: QueueKind) -> VulkanQueue {
        let family = self.families.family(kind);
        let shared = self
            .queues
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, shared)| Arc::clone(shared))
            .unwrap_or_else(|| Arc::clone(&self.queues[0].1));
        VulkanQueue { kind, shared }
    }

    fn set_object_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(debug_device) = &self.debug_device else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        if let Err(e) = unsafe { debug_device.set_debug_utils_object_name(&info) } {
            log::debug!("Failed to name Vulkan object: {:?}", e);
        }
    }

    /// Create a buffer backed by gpu-allocator memory.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        label: &str,
    ) -> SyncResult<VulkanResource> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| vk_error("Failed to create buffer", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| {
                unsafe { self.device.destroy_buffer(buffer, None) };
                SyncError::Native(format!("Failed to allocate buffer memory: {}", e))
            })?;

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            let resource = VulkanResource::Buffer {
                buffer,
                allocation: Some(allocation),
            };
            // SAFETY: the buffer was never used by the GPU
            unsafe { resource.destroy(&self.device, &self.allocator) };
            return Err(vk_error("Failed to bind buffer memory", e));
        }

        self.set_object_name(buffer, label);
        Ok(VulkanResource::Buffer {
            buffer,
            allocation: Some(allocation),
        })
    }

    /// Wrap a Vulkan error, logging device loss.
    fn check<T>(&self, result: Result<T, vk::Result>, what: &str) -> SyncResult<T> {
        result.map_err(|e| {
            let err = vk_error(what, e);
            if err.is_device_lost() {
                log::error!("{}: device lost", what);
            }
            err
        })
    }

    fn begin_recording(&self, context: &mut VulkanCommandContext) -> SyncResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.check(
            unsafe { self.device.begin_command_buffer(context.buffer, &begin_info) },
            "Failed to begin command buffer",
        )?;
        context.recording = true;
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
        log::info!("Vulkan backend destroyed");
    }
}

fn timeout_nanos(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64)
}

impl Backend for VulkanBackend {
    type Timeline = VulkanTimeline;
    type Queue = VulkanQueue;
    type CommandContext = VulkanCommandContext;
    type Resource = VulkanResource;

    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn create_timeline(&self, initial: FenceValue) -> SyncResult<VulkanTimeline> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let semaphore = self.check(
            unsafe { self.device.create_semaphore(&create_info, None) },
            "Failed to create timeline semaphore",
        )?;
        Ok(VulkanTimeline { semaphore })
    }

    fn destroy_timeline(&self, timeline: &VulkanTimeline) {
        unsafe { self.device.destroy_semaphore(timeline.semaphore, None) };
    }

    fn completed_value(&self, timeline: &VulkanTimeline) -> SyncResult<FenceValue> {
        self.check(
            unsafe { self.device.get_semaphore_counter_value(timeline.semaphore) },
            "Failed to query timeline semaphore",
        )
    }

    fn wait_timeline(
        &self,
        timeline: &VulkanTimeline,
        value: FenceValue,
        timeout: Option<Duration>,
    ) -> SyncResult<WaitStatus> {
        let semaphores = [timeline.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.wait_semaphores(&wait_info, timeout_nanos(timeout)) } {
            Ok(()) => Ok(WaitStatus::Reached),
            Err(vk::Result::TIMEOUT) => Ok(WaitStatus::TimedOut),
            Err(e) => self.check(Err(e), "Failed to wait on timeline semaphore"),
        }
    }

    fn queue_signal(
        &self,
        queue: &VulkanQueue,
        timeline: &VulkanTimeline,
        value: FenceValue,
    ) -> SyncResult<()> {
        let semaphores = [timeline.semaphore];
        let values = [value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        queue.submit(&[submit], "Failed to signal timeline semaphore", &self.device)
    }

    fn queue_wait(
        &self,
        queue: &VulkanQueue,
        timeline: &VulkanTimeline,
        value: FenceValue,
    ) -> SyncResult<()> {
        let semaphores = [timeline.semaphore];
        let values = [value];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().wait_semaphore_values(&values);
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&stages)
            .push_next(&mut timeline_info);

        queue.submit(&[submit], "Failed to wait on timeline semaphore", &self.device)
    }

    fn create_command_context(
        &self,
        queue: &VulkanQueue,
        label: &str,
    ) -> SyncResult<VulkanCommandContext> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue.family_index())
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = self.check(
            unsafe { self.device.create_command_pool(&pool_info, None) },
            "Failed to create command pool",
        )?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return self.check(Err(e), "Failed to allocate command buffer");
            }
        };

        self.set_object_name(pool, label);
        let mut context = VulkanCommandContext {
            pool,
            buffer: buffers[0],
            label: label.to_string(),
            recording: false,
        };
        self.begin_recording(&mut context)?;
        Ok(context)
    }

    fn reset_command_context(&self, context: &mut VulkanCommandContext) -> SyncResult<()> {
        self.check(
            unsafe {
                self.device
                    .reset_command_pool(context.pool, vk::CommandPoolResetFlags::empty())
            },
            "Failed to reset command pool",
        )?;
        self.begin_recording(context)
    }

    fn destroy_command_context(&self, context: VulkanCommandContext) {
        // Destroying the pool frees its command buffer.
        unsafe { self.device.destroy_command_pool(context.pool, None) };
    }

    fn submit(&self, queue: &VulkanQueue, context: &mut VulkanCommandContext) -> SyncResult<()> {
        if context.recording {
            self.check(
                unsafe { self.device.end_command_buffer(context.buffer) },
                "Failed to end command buffer",
            )?;
            context.recording = false;
        }

        let sync = std::mem::take(&mut *queue.shared().present_sync.lock());
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = sync.wait.into_iter().unzip();
        let command_buffers = [context.buffer];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&sync.signal);

        queue.submit(&[submit], "Failed to submit command buffer", &self.device)
    }

    fn destroy_resource(&self, resource: VulkanResource) {
        log::trace!("Destroying Vulkan {}", resource.kind_name());
        // SAFETY: the core only destroys resources whose fence value retired
        unsafe { resource.destroy(&self.device, &self.allocator) };
    }
}
