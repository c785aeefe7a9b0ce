//! Frame pacing: bounding how far the CPU runs ahead of the GPU.
//!
//! [`FramePacer`] owns the frame fence and the per-frame state built on it:
//! the command allocator pool, the descriptor heaps and the deferred release
//! queue. Each frame is assigned a slot `frame_count % frame_latency`; the slot
//! remembers the fence value its last frame signaled.
//!
//! ```text
//! frame_latency = 2
//!
//! Slot 0: [Frame 0 → 1] ──► [Frame 2 → 3] ──► [Frame 4 → 5] ──►
//! Slot 1: [Frame 1 → 2] ──► [Frame 3 → 4] ──► [Frame 5 → 6] ──►
//!                  └── begin_frame(2) waits on value 1 only
//! ```
//!
//! # Frame Loop
//!
//! ```text
//! begin_frame ─► wait for slot's previous value (the only blocking point)
//!             ─► reset slot's transient descriptors
//!             ─► check out a command allocator
//! record      ─► context_mut(), descriptors().allocate_range(..)
//! end_frame   ─► submit, signal, remember value for the slot
//!             ─► drain deferred releases up to the completed value
//! ```
//!
//! Work from frame `f` is never reordered relative to frame `f-1` on the same
//! queue; ordering across queues is only as strong as explicit
//! [`Fence::wait_gpu`] calls.
//!
//! # Device Loss
//!
//! Once any operation observes [`SyncError::DeviceLost`] the pacer is dead:
//! every later frame call fails fast with the same error, and the owner is
//! expected to tear everything down and recreate the device.
//!
//! # Thread Safety
//!
//! `FramePacer` is driven by a single submission thread. The descriptor heaps
//! it hands out are shared (`Arc`) and may be used from other threads for
//! persistent allocations.

use std::sync::Arc;

use crate::backend::{Backend, QueueKind};
use crate::command_pool::{CommandAllocator, CommandAllocatorPool};
use crate::config::FrameSyncConfig;
use crate::deferred::DeferredReleaseQueue;
use crate::descriptor::{DescriptorHeapAllocator, DescriptorHeapKind};
use crate::error::{DeviceLostReason, SyncError, SyncResult};
use crate::fence::{Fence, FenceValue};

/// Frame handed out by [`FramePacer::begin_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Frames begun before this one.
    pub frame_number: u64,
    /// Frame slot, `frame_number % frame_latency`.
    pub frame_index: usize,
    /// Fence value this frame will signal at `end_frame`.
    pub target_value: FenceValue,
}

/// Diagnostic counters of a [`FramePacer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames started with `begin_frame`.
    pub frames_begun: u64,
    /// Frames whose fence value the GPU has retired.
    pub frames_completed: u64,
    /// `begin_frame` and `wait_idle` calls that had to block on the GPU.
    pub blocking_waits: u64,
    /// Command allocators created so far.
    pub allocators_created: usize,
    /// Resources waiting in the deferred release queue.
    pub pending_releases: usize,
    /// Last signaled fence value.
    pub cpu_value: FenceValue,
    /// Last observed completed fence value.
    pub completed_value: FenceValue,
}

struct ActiveFrame<B: Backend> {
    info: FrameInfo,
    allocator: CommandAllocator<B>,
}

/// Coordinates frames in flight for one queue.
pub struct FramePacer<B: Backend> {
    backend: Arc<B>,
    config: FrameSyncConfig,
    fence: Fence<B>,
    pool: CommandAllocatorPool<B>,
    descriptors: Arc<DescriptorHeapAllocator>,
    extra_heaps: Vec<Arc<DescriptorHeapAllocator>>,
    deferred: DeferredReleaseQueue<B::Resource>,
    /// Fence value signaled by the last frame that used each slot.
    slot_values: Vec<Option<FenceValue>>,
    frame_count: u64,
    active: Option<ActiveFrame<B>>,
    lost: Option<DeviceLostReason>,
    blocking_waits: u64,
    shut_down: bool,
}

impl<B: Backend> std::fmt::Debug for FramePacer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePacer")
            .field("backend", &self.backend.name())
            .field("frame_latency", &self.config.frame_latency)
            .field("frame_count", &self.frame_count)
            .field("fence", &self.fence)
            .field("lost", &self.lost)
            .finish()
    }
}

impl<B: Backend> FramePacer<B> {
    /// Create a pacer for submissions to queues of `queue_kind`.
    pub fn new(backend: Arc<B>, queue_kind: QueueKind, config: FrameSyncConfig) -> SyncResult<Self> {
        config.validate()?;

        let fence = Fence::new(Arc::clone(&backend), format!("{} frame fence", queue_kind.name()))?;
        let pool = CommandAllocatorPool::new(
            Arc::clone(&backend),
            queue_kind,
            config.max_command_allocators,
        );
        let descriptors = Arc::new(DescriptorHeapAllocator::from_config(
            DescriptorHeapKind::ResourceView,
            &config,
        )?);
        descriptors.close_frame();

        log::info!(
            "FramePacer created: {} backend, {} queue, {} frames in flight",
            backend.name(),
            queue_kind.name(),
            config.frame_latency
        );

        Ok(Self {
            backend,
            slot_values: vec![None; config.frame_latency],
            config,
            fence,
            pool,
            descriptors,
            extra_heaps: Vec::new(),
            deferred: DeferredReleaseQueue::new(),
            frame_count: 0,
            active: None,
            lost: None,
            blocking_waits: 0,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &FrameSyncConfig {
        &self.config
    }

    pub fn frame_latency(&self) -> usize {
        self.config.frame_latency
    }

    /// Frames begun so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Slot the next (or current) frame uses.
    pub fn frame_index(&self) -> usize {
        match &self.active {
            Some(active) => active.info.frame_index,
            None => (self.frame_count % self.config.frame_latency as u64) as usize,
        }
    }

    /// The frame fence.
    pub fn fence(&self) -> &Fence<B> {
        &self.fence
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The shader-visible resource view heap.
    pub fn descriptors(&self) -> &Arc<DescriptorHeapAllocator> {
        &self.descriptors
    }

    /// Heap of the given kind, if one is registered.
    pub fn descriptor_heap(&self, kind: DescriptorHeapKind) -> Option<&Arc<DescriptorHeapAllocator>> {
        self.heaps().find(|heap| heap.kind() == kind)
    }

    /// Create another descriptor heap whose transient regions follow this pacer's frames.
    ///
    /// Registered mid-frame, the heap opens on the current frame's slot.
    pub fn register_descriptor_heap(
        &mut self,
        kind: DescriptorHeapKind,
        persistent: u32,
        transient_per_frame: u32,
    ) -> SyncResult<Arc<DescriptorHeapAllocator>> {
        if self.descriptor_heap(kind).is_some() {
            return Err(SyncError::InvalidConfig(format!(
                "a {:?} descriptor heap is already registered",
                kind
            )));
        }
        let heap = Arc::new(DescriptorHeapAllocator::new(
            kind,
            persistent,
            transient_per_frame,
            self.config.frame_latency,
        )?);
        match &self.active {
            Some(active) => heap.reset_frame(active.info.frame_index),
            None => heap.close_frame(),
        }
        self.extra_heaps.push(Arc::clone(&heap));
        Ok(heap)
    }

    /// Whether a frame is between `begin_frame` and `end_frame`.
    pub fn is_frame_active(&self) -> bool {
        self.active.is_some()
    }

    /// Fence value the last frame in `frame_index` signaled.
    pub fn slot_value(&self, frame_index: usize) -> Option<FenceValue> {
        self.slot_values.get(frame_index).copied().flatten()
    }

    /// Highest fence value any frame slot is waiting on.
    pub fn max_outstanding_value(&self) -> FenceValue {
        self.slot_values.iter().flatten().copied().max().unwrap_or(0)
    }

    /// Whether a device loss has been observed.
    pub fn is_lost(&self) -> bool {
        self.lost.is_some()
    }

    /// Record a device loss observed outside the pacer, for example at present.
    pub fn mark_device_lost(&mut self, reason: DeviceLostReason) {
        let _ = self.track::<()>(Err(SyncError::DeviceLost(reason)));
    }

    fn heaps(&self) -> impl Iterator<Item = &Arc<DescriptorHeapAllocator>> {
        std::iter::once(&self.descriptors).chain(self.extra_heaps.iter())
    }

    fn check_lost(&self) -> SyncResult<()> {
        match &self.lost {
            Some(reason) => Err(SyncError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }

    /// Latch device loss if `result` reports it.
    fn track<T>(&mut self, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(SyncError::DeviceLost(reason)) = &result {
            if self.lost.is_none() {
                log::error!("FramePacer: device lost ({}), frames stopped", reason);
                self.lost = Some(reason.clone());
            }
        }
        result
    }

    /// Start a frame.
    ///
    /// Blocks until the GPU retires the last frame that used this frame's
    /// slot, then resets the slot's transient descriptors and checks out a
    /// command allocator. `queue` is where new allocators are created for and
    /// must be the queue later passed to [`end_frame`](Self::end_frame).
    pub fn begin_frame(&mut self, queue: &B::Queue) -> SyncResult<FrameInfo> {
        self.check_lost()?;
        assert!(
            self.active.is_none(),
            "begin_frame called twice without end_frame"
        );

        let frame_index = (self.frame_count % self.config.frame_latency as u64) as usize;
        if let Some(value) = self.slot_values[frame_index] {
            let retired = self.fence.is_complete(value);
            if !self.track(retired)? {
                log::trace!(
                    "Frame {} waits for slot {} (value {})",
                    self.frame_count,
                    frame_index,
                    value
                );
                self.blocking_waits += 1;
                let waited = self.fence.wait_cpu(value, self.config.hang_timeout);
                self.track(waited)?;
            }
        }

        let acquired = self.pool.acquire(&self.fence, queue);
        let allocator = self.track(acquired)?;

        for heap in self.heaps() {
            heap.reset_frame(frame_index);
        }

        let info = FrameInfo {
            frame_number: self.frame_count,
            frame_index,
            target_value: self.fence.next_value(),
        };
        log::trace!("Begin frame {} (slot {})", info.frame_number, frame_index);

        self.active = Some(ActiveFrame { info, allocator });
        Ok(info)
    }

    /// Info of the frame being recorded.
    pub fn current_frame(&self) -> Option<FrameInfo> {
        self.active.as_ref().map(|active| active.info)
    }

    /// Command context of the frame being recorded.
    pub fn context_mut(&mut self) -> Option<&mut B::CommandContext> {
        self.active
            .as_mut()
            .map(|active| active.allocator.context_mut())
    }

    /// Submit the frame's commands and signal its fence value.
    ///
    /// Also destroys every deferred resource the GPU has retired. Returns the
    /// value the GPU reaches when this frame's work completes.
    pub fn end_frame(&mut self, queue: &B::Queue) -> SyncResult<FenceValue> {
        self.check_lost()?;
        let Some(ActiveFrame {
            info,
            mut allocator,
        }) = self.active.take()
        else {
            panic!("end_frame called without begin_frame");
        };
        for heap in self.heaps() {
            heap.close_frame();
        }

        let submitted = self.backend.submit(queue, allocator.context_mut());
        if let Err(err) = self.track(submitted) {
            // Nothing new reached the GPU, the allocator is safe once prior work is.
            self.pool.retire(allocator, self.fence.cpu_value());
            return Err(err);
        }

        let signaled = self.fence.signal(queue);
        let value = match self.track(signaled) {
            Ok(value) => value,
            Err(err) => {
                self.pool.retire(allocator, self.fence.cpu_value() + 1);
                return Err(err);
            }
        };
        debug_assert_eq!(value, info.target_value);

        self.pool.retire(allocator, value);
        self.slot_values[info.frame_index] = Some(value);
        self.frame_count += 1;

        let completed = self.fence.completed_value();
        let completed = self.track(completed)?;
        let backend = &self.backend;
        self.deferred
            .drain(completed, |resource| backend.destroy_resource(resource));

        log::trace!(
            "End frame {} (slot {}): signaled {}, completed {}",
            info.frame_number,
            info.frame_index,
            value,
            completed
        );
        Ok(value)
    }

    /// Give up ownership of a GPU resource.
    ///
    /// The resource is destroyed right away when no frame is recording and the
    /// GPU has retired everything signaled so far; otherwise it is destroyed
    /// once the GPU retires the current frame.
    pub fn release(&mut self, resource: B::Resource) {
        let retire_value = if self.active.is_some() {
            self.fence.next_value()
        } else {
            self.fence.cpu_value()
        };

        let destroy_now = self.lost.is_some()
            || match self.fence.is_complete(retire_value) {
                Ok(retired) => retired,
                Err(err) => {
                    let _ = self.track::<()>(Err(err));
                    true
                }
            };

        if destroy_now {
            self.backend.destroy_resource(resource);
        } else {
            self.deferred.enqueue(resource, retire_value);
        }
    }

    /// Resources waiting for the GPU before they can be destroyed.
    pub fn pending_releases(&self) -> usize {
        self.deferred.pending_count()
    }

    /// Block until the GPU finishes everything signaled so far, then destroy
    /// every deferred resource.
    pub fn wait_idle(&mut self) -> SyncResult<()> {
        self.check_lost()?;

        let target = self.fence.cpu_value();
        let idle = self.fence.is_complete(target);
        if !self.track(idle)? {
            log::debug!("FramePacer: waiting for GPU idle (value {})", target);
            self.blocking_waits += 1;
            let waited = self.fence.wait_cpu(target, self.config.hang_timeout);
            self.track(waited)?;
        }

        let backend = &self.backend;
        self.deferred
            .drain(target, |resource| backend.destroy_resource(resource));
        Ok(())
    }

    /// Wait for the GPU, release every resource the pacer owns and stop.
    ///
    /// Deferred resources and command allocators are destroyed even when the
    /// wait fails because the device was lost. Called automatically on drop.
    pub fn shutdown(&mut self) -> SyncResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        if let Some(active) = self.active.take() {
            log::warn!(
                "FramePacer: shutting down inside frame {}, discarding its commands",
                active.info.frame_number
            );
            self.pool.retire(active.allocator, self.fence.cpu_value());
        }
        for heap in self.heaps() {
            heap.close_frame();
        }

        let waited = if self.lost.is_some() {
            Ok(())
        } else {
            // Releases tagged past the last signal belong to a frame that was never submitted.
            let max_value = self.fence.cpu_value();
            let result = self.fence.wait_cpu(max_value, self.config.hang_timeout);
            self.track(result)
        };

        let backend = &self.backend;
        let released = self
            .deferred
            .flush_all(|resource| backend.destroy_resource(resource));
        self.pool.destroy_all();

        for heap in self.heaps() {
            let leaked = heap.persistent_in_use();
            if leaked > 0 {
                log::warn!(
                    "{:?} descriptor heap: {} persistent descriptors never freed",
                    heap.kind(),
                    leaked
                );
            }
        }

        log::info!(
            "FramePacer shut down after {} frames ({} deferred releases flushed)",
            self.frame_count,
            released
        );
        waited
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> FrameStats {
        let completed_value = self.fence.last_completed();
        let outstanding = self
            .slot_values
            .iter()
            .flatten()
            .filter(|&&value| value > completed_value)
            .count() as u64;

        FrameStats {
            frames_begun: self.frame_count + self.active.is_some() as u64,
            frames_completed: self.frame_count - outstanding,
            blocking_waits: self.blocking_waits,
            allocators_created: self.pool.created_count(),
            pending_releases: self.deferred.pending_count(),
            cpu_value: self.fence.cpu_value(),
            completed_value,
        }
    }
}

impl<B: Backend> Drop for FramePacer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("FramePacer shutdown failed: {}", e);
        }
    }
}
