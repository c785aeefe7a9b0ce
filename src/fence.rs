//! Timeline fence for CPU-GPU synchronization.
//!
//! A [`Fence`] is a monotonically increasing 64-bit counter shared between the
//! CPU and the GPU. The CPU asks a queue to set the counter to a new value once
//! all previously submitted work finishes ([`Fence::signal`]), and later checks
//! ([`Fence::is_complete`]) or blocks ([`Fence::wait_cpu`]) until the GPU gets
//! there. One fence is enough to answer "is the GPU done with everything I
//! submitted up to value V" for any number of resources.
//!
//! ```text
//! signal() ─► cpu_value:       1   2   3   4
//! GPU      ─► completed_value: 0 ─ 1 ─ 1 ─ 2 ─►  (never decreases, never passes cpu_value)
//! ```
//!
//! Device removal observed by any fence operation is reported as
//! [`SyncError::DeviceLost`] and latched: every later call fails the same way.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{Backend, WaitStatus};
use crate::error::{DeviceLostReason, SyncError, SyncResult};

/// Point on a fence timeline.
pub type FenceValue = u64;

/// CPU-GPU timeline fence.
///
/// # Thread Safety
///
/// All methods take `&self`; the signal counter is atomic and the observed
/// completed value is only ever raised. Signals for one fence should still come
/// from a single submission thread so values reach the queue in order.
pub struct Fence<B: Backend> {
    backend: Arc<B>,
    timeline: B::Timeline,
    label: String,
    /// Last value handed to a queue signal.
    cpu_value: AtomicU64,
    /// Highest completed value observed so far.
    completed: AtomicU64,
    /// Serializes signal so the counter and the queue see values in the same order.
    signal_lock: Mutex<()>,
    lost: AtomicBool,
    lost_reason: Mutex<Option<DeviceLostReason>>,
}

impl<B: Backend> std::fmt::Debug for Fence<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("label", &self.label)
            .field("cpu_value", &self.cpu_value())
            .field("last_completed", &self.last_completed())
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl<B: Backend> Fence<B> {
    /// Create a fence with both counters at zero.
    pub fn new(backend: Arc<B>, label: impl Into<String>) -> SyncResult<Self> {
        let label = label.into();
        let timeline = backend.create_timeline(0)?;
        log::debug!("Created fence '{}' on {} backend", label, backend.name());

        Ok(Self {
            backend,
            timeline,
            label,
            cpu_value: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            signal_lock: Mutex::new(()),
            lost: AtomicBool::new(false),
            lost_reason: Mutex::new(None),
        })
    }

    /// Debug label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The native timeline object.
    pub fn timeline(&self) -> &B::Timeline {
        &self.timeline
    }

    /// Last value handed to a queue by [`signal`](Self::signal).
    pub fn cpu_value(&self) -> FenceValue {
        self.cpu_value.load(Ordering::Acquire)
    }

    /// Value the next [`signal`](Self::signal) call will use.
    pub fn next_value(&self) -> FenceValue {
        self.cpu_value() + 1
    }

    /// Highest completed value observed so far, without querying the device.
    pub fn last_completed(&self) -> FenceValue {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether a device loss has been observed through this fence.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Whether every signaled value has been observed as completed.
    pub fn is_idle(&self) -> bool {
        self.last_completed() >= self.cpu_value()
    }

    fn check_lost(&self) -> SyncResult<()> {
        if self.is_lost() {
            let reason = self
                .lost_reason
                .lock()
                .clone()
                .unwrap_or(DeviceLostReason::Removed);
            return Err(SyncError::DeviceLost(reason));
        }
        Ok(())
    }

    /// Latch device loss if `result` reports it.
    fn track<T>(&self, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(SyncError::DeviceLost(reason)) = &result {
            self.mark_lost(reason.clone());
        }
        result
    }

    fn mark_lost(&self, reason: DeviceLostReason) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            log::error!("Fence '{}': device lost ({})", self.label, reason);
            *self.lost_reason.lock() = Some(reason);
        }
    }

    /// Signal the next value on `queue`.
    ///
    /// The queue sets the timeline to the returned value once all work
    /// submitted to it before this call has finished. Every call returns a
    /// value strictly greater than the previous one.
    pub fn signal(&self, queue: &B::Queue) -> SyncResult<FenceValue> {
        self.check_lost()?;

        let _guard = self.signal_lock.lock();
        let value = self.cpu_value.load(Ordering::Acquire) + 1;
        self.track(self.backend.queue_signal(queue, self.timeline(), value))?;
        self.cpu_value.store(value, Ordering::Release);

        log::trace!("Fence '{}': signaled {}", self.label, value);
        Ok(value)
    }

    /// Query the device for the completed value.
    ///
    /// The result never decreases between calls. A device report beyond the
    /// last signaled value means the device was removed.
    pub fn completed_value(&self) -> SyncResult<FenceValue> {
        self.check_lost()?;

        let reported = self.track(self.backend.completed_value(self.timeline()))?;
        let mut signaled = self.cpu_value();
        if reported > signaled {
            // A signal in progress may already have reached the GPU.
            signaled = {
                let _guard = self.signal_lock.lock();
                self.cpu_value()
            };
        }
        if reported > signaled {
            let reason = DeviceLostReason::InvalidCompletedValue {
                completed: reported,
                signaled,
            };
            self.mark_lost(reason.clone());
            return Err(SyncError::DeviceLost(reason));
        }

        let previous = self.completed.fetch_max(reported, Ordering::AcqRel);
        Ok(previous.max(reported))
    }

    /// Whether the GPU has finished `value`. Non-blocking.
    pub fn is_complete(&self, value: FenceValue) -> SyncResult<bool> {
        if value <= self.last_completed() {
            self.check_lost()?;
            return Ok(true);
        }
        Ok(self.completed_value()? >= value)
    }

    /// Block the calling thread until the GPU finishes `value`.
    ///
    /// Returns immediately when `value` has already retired. If `timeout`
    /// elapses first the GPU is considered hung and the fence reports
    /// [`DeviceLostReason::Hung`].
    pub fn wait_cpu(&self, value: FenceValue, timeout: Option<Duration>) -> SyncResult<()> {
        debug_assert!(
            value <= self.cpu_value(),
            "waiting on fence value {} that was never signaled (last signaled {})",
            value,
            self.cpu_value()
        );

        if self.is_complete(value)? {
            return Ok(());
        }

        log::trace!("Fence '{}': waiting for {}", self.label, value);
        let status = self.track(self.backend.wait_timeline(self.timeline(), value, timeout))?;

        match status {
            WaitStatus::Reached => {
                self.completed_value()?;
                Ok(())
            }
            WaitStatus::TimedOut => {
                let timeout = timeout.unwrap_or_default();
                log::warn!(
                    "Fence '{}': no progress to {} within {:?} (completed {})",
                    self.label,
                    value,
                    timeout,
                    self.last_completed()
                );
                let reason = DeviceLostReason::Hung { timeout };
                self.mark_lost(reason.clone());
                Err(SyncError::DeviceLost(reason))
            }
        }
    }

    /// Block until every signaled value has completed.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> SyncResult<()> {
        self.wait_cpu(self.cpu_value(), timeout)
    }

    /// Make `queue` wait on the GPU until this fence reaches `value`.
    ///
    /// Used when work on one queue consumes results produced on another, for
    /// example a graphics queue reading an upload done on a copy queue. The
    /// CPU does not block.
    pub fn wait_gpu(&self, queue: &B::Queue, value: FenceValue) -> SyncResult<()> {
        self.check_lost()?;
        debug_assert!(
            value <= self.cpu_value(),
            "GPU wait on fence value {} that was never signaled",
            value
        );
        log::trace!("Fence '{}': queue waits on GPU for {}", self.label, value);
        self.track(self.backend.queue_wait(queue, self.timeline(), value))
    }
}

impl<B: Backend> Drop for Fence<B> {
    fn drop(&mut self) {
        if !self.is_lost() && !self.is_idle() {
            log::warn!(
                "Fence '{}' dropped with work in flight (signaled {}, completed {})",
                self.label,
                self.cpu_value(),
                self.last_completed()
            );
        }
        self.backend.destroy_timeline(&self.timeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, QueueKind};

    fn setup() -> (Arc<DummyBackend>, crate::backend::DummyQueue) {
        let backend = Arc::new(DummyBackend::new());
        let queue = backend.create_queue(QueueKind::Graphics);
        (backend, queue)
    }

    #[test]
    fn test_new_fence_is_idle() {
        let (backend, _queue) = setup();
        let fence = Fence::new(backend, "frame").unwrap();
        assert_eq!(fence.cpu_value(), 0);
        assert_eq!(fence.last_completed(), 0);
        assert!(fence.is_idle());
        assert!(fence.is_complete(0).unwrap());
    }

    #[test]
    fn test_signal_is_strictly_increasing() {
        let (backend, queue) = setup();
        let fence = Fence::new(backend, "frame").unwrap();

        let mut last = 0;
        for _ in 0..16 {
            let value = fence.signal(&queue).unwrap();
            assert!(value > last);
            last = value;
        }
        assert_eq!(fence.cpu_value(), 16);
        assert_eq!(fence.next_value(), 17);
    }

    #[test]
    fn test_is_complete_tracks_gpu() {
        let (backend, queue) = setup();
        let fence = Fence::new(backend, "frame").unwrap();

        let v1 = fence.signal(&queue).unwrap();
        let v2 = fence.signal(&queue).unwrap();
        assert!(!fence.is_complete(v1).unwrap());

        queue.complete_next();
        assert!(fence.is_complete(v1).unwrap());
        assert!(!fence.is_complete(v2).unwrap());

        queue.complete_all();
        assert!(fence.is_complete(v2).unwrap());
        assert!(fence.is_idle());
    }

    #[test]
    fn test_completed_value_is_monotonic() {
        let (backend, queue) = setup();
        let fence = Fence::new(backend, "frame").unwrap();

        for _ in 0..4 {
            fence.signal(&queue).unwrap();
        }

        let mut observed = Vec::new();
        while queue.complete_next() {
            observed.push(fence.completed_value().unwrap());
        }
        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(observed.last(), Some(&4));
    }

    #[test]
    fn test_wait_cpu_returns_when_retired() {
        let (backend, queue) = setup();
        let fence = Fence::new(backend, "frame").unwrap();
        let value = fence.signal(&queue).unwrap();
        queue.complete_all();

        fence.wait_cpu(value, Some(Duration::from_millis(1))).unwrap();
    }

    #[test]
    fn test_wait_cpu_blocks_until_signal() {
        let backend = Arc::new(DummyBackend::new());
        let queue = Arc::new(backend.create_queue(QueueKind::Graphics));
        let fence = Fence::new(Arc::clone(&backend), "frame").unwrap();
        let value = fence.signal(&queue).unwrap();

        let gpu = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            gpu.complete_all();
        });

        fence.wait_cpu(value, None).unwrap();
        assert!(fence.is_complete(value).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_escalates_to_device_lost() {
        let (backend, queue) = setup();
        let fence = Fence::new(backend, "frame").unwrap();
        let value = fence.signal(&queue).unwrap();

        let err = fence
            .wait_cpu(value, Some(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::DeviceLost(DeviceLostReason::Hung { .. })
        ));

        // Loss is latched even though the queue could still make progress.
        queue.complete_all();
        assert!(fence.is_lost());
        assert!(fence.signal(&queue).unwrap_err().is_device_lost());
    }

    #[test]
    fn test_device_removal_propagates() {
        let (backend, queue) = setup();
        let fence = Fence::new(Arc::clone(&backend), "frame").unwrap();
        let value = fence.signal(&queue).unwrap();

        backend.lose_device();
        let err = fence.wait_cpu(value, None).unwrap_err();
        assert_eq!(err, SyncError::DeviceLost(DeviceLostReason::Removed));
        assert!(fence.is_lost());
    }

    #[test]
    fn test_wait_gpu_orders_queues() {
        let backend = Arc::new(DummyBackend::new());
        let copy = backend.create_queue(QueueKind::Copy);
        let graphics = backend.create_queue(QueueKind::Graphics);
        let upload = Fence::new(Arc::clone(&backend), "upload").unwrap();
        let frame = Fence::new(Arc::clone(&backend), "frame").unwrap();

        let uploaded = upload.signal(&copy).unwrap();
        upload.wait_gpu(&graphics, uploaded).unwrap();
        let drawn = frame.signal(&graphics).unwrap();

        graphics.complete_all();
        assert!(!frame.is_complete(drawn).unwrap());

        copy.complete_all();
        graphics.complete_all();
        assert!(frame.is_complete(drawn).unwrap());
    }
}
