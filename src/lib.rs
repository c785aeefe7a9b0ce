//! # Frame Sync
//!
//! Frame synchronization and GPU resource lifecycle core.
//!
//! Lets one CPU thread submit rendering work several frames ahead of the GPU
//! while never recycling anything the GPU is still reading, bounding how far
//! ahead the CPU gets, and reclaiming per-frame allocations deterministically.
//! Everything is built on a single monotonically increasing fence value.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`Fence`] - CPU/GPU timeline counter with signal, query and blocking wait
//! - [`CommandAllocatorPool`] - Command contexts recycled once their frame retires
//! - [`DescriptorHeapAllocator`] - Persistent free list plus per-frame transient regions
//! - [`DeferredReleaseQueue`] - Resource destruction postponed until the GPU is done
//! - [`FramePacer`] - Frame loop tying the above together with a latency bound
//! - [`SwapchainPresenter`] - Present, out-of-date handling and fenced resize
//! - [`backend`] - Capability interface with Dummy, Vulkan and wgpu implementations
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use frame_sync::backend::{DummyBackend, DummySurface, QueueKind};
//! use frame_sync::{FramePacer, FrameSyncConfig, SwapchainPresenter};
//!
//! let backend = Arc::new(DummyBackend::immediate());
//! let queue = backend.create_queue(QueueKind::Graphics);
//! let mut pacer = FramePacer::new(backend.clone(), QueueKind::Graphics, FrameSyncConfig::default())?;
//! let mut presenter = SwapchainPresenter::new(DummySurface::new(2));
//!
//! for _ in 0..4 {
//!     pacer.begin_frame(&queue)?;        // may block if the GPU is behind
//!     presenter.acquire_next()?;
//!     let views = pacer.descriptors().allocate_range(8)?;
//!     pacer.context_mut().unwrap().record(format!("draw with {:?}", views.indices()));
//!     presenter.present_frame(&mut pacer, &queue, 1)?;
//! }
//!
//! pacer.shutdown()?;
//! # Ok::<(), frame_sync::SyncError>(())
//! ```

pub mod backend;
pub mod command_pool;
pub mod config;
pub mod deferred;
pub mod descriptor;
pub mod error;
pub mod fence;
pub mod pacer;
pub mod presenter;

// Re-export main types for convenience
pub use backend::{Backend, PresentStatus, PresentSurface, QueueKind, WaitStatus};
pub use command_pool::{CommandAllocator, CommandAllocatorPool};
pub use config::FrameSyncConfig;
pub use deferred::DeferredReleaseQueue;
pub use descriptor::{
    DescriptorHeapAllocator, DescriptorHeapKind, DescriptorHeapStats, DescriptorRange,
    DescriptorRegion, DescriptorSlot,
};
pub use error::{DeviceLostReason, SyncError, SyncResult};
pub use fence::{Fence, FenceValue};
pub use pacer::{FrameInfo, FramePacer, FrameStats};
pub use presenter::SwapchainPresenter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the library version and the backends compiled in.
pub fn init() {
    let mut backends = vec!["dummy"];
    if cfg!(feature = "vulkan-backend") {
        backends.push("vulkan");
    }
    if cfg!(feature = "wgpu-backend") {
        backends.push("wgpu");
    }
    log::info!("Frame Sync v{} initialized (backends: {})", VERSION, backends.join(", "));
}
