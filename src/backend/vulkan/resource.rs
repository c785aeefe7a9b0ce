//! Vulkan objects whose destruction goes through the deferred release queue.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;

/// A Vulkan object owned by the caller until released.
///
/// Hand it to [`FramePacer::release`](crate::FramePacer::release) instead of
/// destroying it: the pacer destroys it once the GPU retires the frame that
/// last used it.
#[derive(Debug)]
pub enum VulkanResource {
    /// A buffer with its memory allocation.
    Buffer {
        buffer: vk::Buffer,
        allocation: Option<Allocation>,
    },
    /// An image, its default view and its memory allocation.
    Image {
        image: vk::Image,
        view: Option<vk::ImageView>,
        allocation: Option<Allocation>,
    },
    /// An image view not owned by an image resource.
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    /// A descriptor pool, freeing every set allocated from it.
    DescriptorPool(vk::DescriptorPool),
    /// Command buffers allocated from a pool that outlives them.
    CommandBuffers {
        command_pool: vk::CommandPool,
        buffers: Vec<vk::CommandBuffer>,
    },
}

impl VulkanResource {
    /// Short name used in log messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Buffer { .. } => "buffer",
            Self::Image { .. } => "image",
            Self::ImageView(_) => "image view",
            Self::Sampler(_) => "sampler",
            Self::Semaphore(_) => "semaphore",
            Self::Fence(_) => "fence",
            Self::Pipeline(_) => "pipeline",
            Self::PipelineLayout(_) => "pipeline layout",
            Self::DescriptorPool(_) => "descriptor pool",
            Self::CommandBuffers { .. } => "command buffers",
        }
    }

    /// Destroy the object and free its memory.
    ///
    /// # Safety
    ///
    /// The GPU must no longer use the object, and `device` must be the device
    /// that created it.
    pub(crate) unsafe fn destroy(self, device: &ash::Device, allocator: &Mutex<Allocator>) {
        let free = |allocation: Option<Allocation>, what: &str| {
            if let Some(allocation) = allocation {
                if let Err(e) = allocator.lock().free(allocation) {
                    log::error!("Failed to free {} allocation: {}", what, e);
                }
            }
        };

        unsafe {
            match self {
                Self::Buffer { buffer, allocation } => {
                    free(allocation, "buffer");
                    device.destroy_buffer(buffer, None);
                }
                Self::Image {
                    image,
                    view,
                    allocation,
                } => {
                    free(allocation, "image");
                    if let Some(view) = view {
                        device.destroy_image_view(view, None);
                    }
                    device.destroy_image(image, None);
                }
                Self::ImageView(view) => device.destroy_image_view(view, None),
                Self::Sampler(sampler) => device.destroy_sampler(sampler, None),
                Self::Semaphore(semaphore) => device.destroy_semaphore(semaphore, None),
                Self::Fence(fence) => device.destroy_fence(fence, None),
                Self::Pipeline(pipeline) => device.destroy_pipeline(pipeline, None),
                Self::PipelineLayout(layout) => device.destroy_pipeline_layout(layout, None),
                Self::DescriptorPool(pool) => device.destroy_descriptor_pool(pool, None),
                Self::CommandBuffers {
                    command_pool,
                    buffers,
                } => device.free_command_buffers(command_pool, &buffers),
            }
        }
    }
}
