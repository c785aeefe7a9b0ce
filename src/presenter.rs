//! Back buffer acquisition and presentation.
//!
//! [`SwapchainPresenter`] wraps a native [`PresentSurface`] and adds the parts
//! that matter for synchronization: device removal reported by a present is
//! fatal and sticky, an out-of-date swapchain blocks acquisition until it is
//! resized, and resizing first drains every frame slot's fence value because
//! in-flight GPU work may still reference the old back buffers.

use std::time::Duration;

use crate::backend::{Backend, PresentStatus, PresentSurface};
use crate::error::{DeviceLostReason, SyncError, SyncResult};
use crate::fence::{Fence, FenceValue};
use crate::pacer::FramePacer;

/// Presentation front end over a native swapchain.
#[derive(Debug)]
pub struct SwapchainPresenter<S: PresentSurface> {
    surface: S,
    current_image: Option<u32>,
    needs_resize: bool,
    suboptimal: bool,
    lost: Option<DeviceLostReason>,
    size: Option<(u32, u32)>,
    presented: u64,
}

impl<S: PresentSurface> SwapchainPresenter<S> {
    pub fn new(surface: S) -> Self {
        log::debug!(
            "SwapchainPresenter created with {} back buffers",
            surface.back_buffer_count()
        );
        Self {
            surface,
            current_image: None,
            needs_resize: false,
            suboptimal: false,
            lost: None,
            size: None,
            presented: 0,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn back_buffer_count(&self) -> u32 {
        self.surface.back_buffer_count()
    }

    /// Back buffer acquired for the current frame.
    pub fn current_image(&self) -> Option<u32> {
        self.current_image
    }

    /// Whether the swapchain must be resized before the next acquire.
    pub fn needs_resize(&self) -> bool {
        self.needs_resize
    }

    /// Whether the last present reported a swapchain that no longer matches the surface.
    pub fn is_suboptimal(&self) -> bool {
        self.suboptimal
    }

    /// Size of the last successful resize.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    /// Successful presents so far.
    pub fn presented_count(&self) -> u64 {
        self.presented
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_some()
    }

    fn check_lost(&self) -> SyncResult<()> {
        match &self.lost {
            Some(reason) => Err(SyncError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn track<T>(&mut self, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(SyncError::DeviceLost(reason)) = &result {
            if self.lost.is_none() {
                log::error!("SwapchainPresenter: device lost ({})", reason);
                self.lost = Some(reason.clone());
            }
        }
        result
    }

    /// Acquire the next back buffer.
    ///
    /// Returns `Ok(None)` while the swapchain is out of date; call
    /// [`resize`](Self::resize) and try again.
    pub fn acquire_next(&mut self) -> SyncResult<Option<u32>> {
        self.check_lost()?;
        if self.needs_resize {
            return Ok(None);
        }

        let acquired = self.surface.acquire_next();
        match self.track(acquired)? {
            Some(index) => {
                log::trace!("Acquired back buffer {}", index);
                self.current_image = Some(index);
                Ok(Some(index))
            }
            None => {
                log::warn!("Swapchain out of date on acquire, resize required");
                self.needs_resize = true;
                self.current_image = None;
                Ok(None)
            }
        }
    }

    /// Present the acquired back buffer.
    ///
    /// Device removal is returned as [`SyncError::DeviceLost`] and every later
    /// call fails the same way; the present is never retried.
    pub fn present(&mut self, sync_interval: u32) -> SyncResult<PresentStatus> {
        self.check_lost()?;
        let presented = self.surface.present(sync_interval);
        let status = self.track(presented)?;
        self.current_image = None;

        match status {
            PresentStatus::Presented => {
                self.suboptimal = false;
                self.presented += 1;
            }
            PresentStatus::Suboptimal => {
                log::debug!("Swapchain suboptimal for the surface");
                self.suboptimal = true;
                self.presented += 1;
            }
            PresentStatus::OutOfDate => {
                log::warn!("Swapchain out of date on present, resize required");
                self.needs_resize = true;
            }
        }
        Ok(status)
    }

    /// End the pacer's frame on `queue` and present it.
    ///
    /// Device loss seen by either side is latched into both.
    pub fn present_frame<B: Backend>(
        &mut self,
        pacer: &mut FramePacer<B>,
        queue: &B::Queue,
        sync_interval: u32,
    ) -> SyncResult<(FenceValue, PresentStatus)> {
        let ended = pacer.end_frame(queue);
        let value = self.track(ended)?;
        match self.present(sync_interval) {
            Ok(status) => Ok((value, status)),
            Err(SyncError::DeviceLost(reason)) => {
                pacer.mark_device_lost(reason.clone());
                Err(SyncError::DeviceLost(reason))
            }
            Err(err) => Err(err),
        }
    }

    /// Recreate the back buffers at a new size once the pacer's GPU work drains.
    pub fn resize<B: Backend>(
        &mut self,
        pacer: &mut FramePacer<B>,
        width: u32,
        height: u32,
    ) -> SyncResult<()> {
        self.check_lost()?;
        if let Err(err) = pacer.wait_idle() {
            return self.track(Err(err));
        }
        self.resize_surface(width, height)
    }

    /// Recreate the back buffers once `fence` retires every value it signaled.
    pub fn resize_with_fence<B: Backend>(
        &mut self,
        fence: &Fence<B>,
        timeout: Option<Duration>,
        width: u32,
        height: u32,
    ) -> SyncResult<()> {
        self.check_lost()?;
        let waited = fence.wait_cpu(fence.cpu_value(), timeout);
        self.track(waited)?;
        self.resize_surface(width, height)
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> SyncResult<()> {
        let resized = self.surface.resize(width, height);
        self.track(resized)?;
        self.needs_resize = false;
        self.suboptimal = false;
        self.current_image = None;
        self.size = Some((width, height));
        log::info!("Swapchain resized to {}x{}", width, height);
        Ok(())
    }
}
