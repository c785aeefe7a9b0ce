//! Native backend capability interface.
//!
//! The synchronization core never talks to a graphics API directly. Each
//! backend implements [`Backend`], which supplies only the primitive
//! operations the core is built from: timeline signal/wait/query, command
//! context management, submission and resource destruction. The backend
//! object is created once (it owns the loaded driver entry points) and is
//! shared with every component as an `Arc<B>`.
//!
//! # Available Backends
//!
//! - `dummy` (always built): deterministic in-process GPU timeline for tests
//! - `vulkan-backend`: timeline semaphores and command pools via ash
//! - `wgpu-backend`: submission-done callbacks via wgpu

pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

use std::time::Duration;

use crate::error::SyncResult;
use crate::fence::FenceValue;

pub use dummy::{DummyBackend, DummyQueue, DummyResource, DummySurface};

/// Kind of hardware queue a submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueKind {
    /// Graphics (direct) queue, accepts every command type.
    #[default]
    Graphics,
    /// Async compute queue.
    Compute,
    /// Copy/transfer queue.
    Copy,
}

impl QueueKind {
    /// Short name used in labels and log messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Graphics => "graphics",
            Self::Compute => "compute",
            Self::Copy => "copy",
        }
    }
}

/// Result of a blocking timeline wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The timeline reached the requested value.
    Reached,
    /// The timeout elapsed first.
    TimedOut,
}

/// Primitive operations a native graphics API provides to the core.
///
/// Implementations map native failure codes to [`SyncError`](crate::SyncError);
/// device removal must always surface as `SyncError::DeviceLost`.
pub trait Backend: Send + Sync + 'static {
    /// Native fence object (a D3D12 fence, a Vulkan timeline semaphore).
    type Timeline: Send + Sync;
    /// Native queue handle.
    type Queue: Send + Sync;
    /// Native command recording context (allocator plus command list).
    type CommandContext: Send;
    /// Native resource whose destruction may be deferred.
    type Resource: Send;

    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Create a timeline whose completed value starts at `initial`.
    fn create_timeline(&self, initial: FenceValue) -> SyncResult<Self::Timeline>;

    /// Destroy a timeline. No queue may still signal or wait on it.
    fn destroy_timeline(&self, timeline: &Self::Timeline);

    /// Value the device reports as completed. Non-blocking.
    fn completed_value(&self, timeline: &Self::Timeline) -> SyncResult<FenceValue>;

    /// Block the calling thread until the timeline reaches `value`.
    ///
    /// Must block on an OS primitive signaled by the device rather than spin.
    fn wait_timeline(
        &self,
        timeline: &Self::Timeline,
        value: FenceValue,
        timeout: Option<Duration>,
    ) -> SyncResult<WaitStatus>;

    /// Ask `queue` to set the timeline to `value` once all previously submitted work finishes.
    fn queue_signal(
        &self,
        queue: &Self::Queue,
        timeline: &Self::Timeline,
        value: FenceValue,
    ) -> SyncResult<()>;

    /// Make `queue` stall on the GPU until the timeline reaches `value`.
    fn queue_wait(
        &self,
        queue: &Self::Queue,
        timeline: &Self::Timeline,
        value: FenceValue,
    ) -> SyncResult<()>;

    /// Create a command recording context for `queue`, ready to record.
    fn create_command_context(
        &self,
        queue: &Self::Queue,
        label: &str,
    ) -> SyncResult<Self::CommandContext>;

    /// Rewind a context so it can record again. The GPU must be done with it.
    fn reset_command_context(&self, context: &mut Self::CommandContext) -> SyncResult<()>;

    /// Destroy a context. The GPU must be done with it.
    fn destroy_command_context(&self, context: Self::CommandContext);

    /// Close the recording in `context` and submit it to `queue`.
    fn submit(&self, queue: &Self::Queue, context: &mut Self::CommandContext) -> SyncResult<()>;

    /// Destroy a resource immediately. The GPU must be done with it.
    fn destroy_resource(&self, resource: Self::Resource);
}

/// Outcome of a successful present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    /// The back buffer was queued for display.
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// Not presented; the swapchain must be resized before the next acquire.
    OutOfDate,
}

/// Native swapchain operations used by [`SwapchainPresenter`](crate::SwapchainPresenter).
pub trait PresentSurface {
    /// Number of back buffers in the swapchain.
    fn back_buffer_count(&self) -> u32;

    /// Acquire the next back buffer index.
    ///
    /// Returns `Ok(None)` when the swapchain is out of date and must be resized.
    fn acquire_next(&mut self) -> SyncResult<Option<u32>>;

    /// Present the most recently acquired back buffer.
    fn present(&mut self, sync_interval: u32) -> SyncResult<PresentStatus>;

    /// Release and recreate back buffers at the new size.
    ///
    /// Only called once every frame slot's fence value has retired.
    fn resize(&mut self, width: u32, height: u32) -> SyncResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_kind_names() {
        assert_eq!(QueueKind::Graphics.name(), "graphics");
        assert_eq!(QueueKind::Compute.name(), "compute");
        assert_eq!(QueueKind::Copy.name(), "copy");
        assert_eq!(QueueKind::default(), QueueKind::Graphics);
    }
}
