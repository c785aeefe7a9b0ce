//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't talk to a GPU. Each [`DummyQueue`] collects the work,
//! signals and waits submitted to it, and the "GPU" only makes progress when
//! the test says so (`complete_next`, `complete_all`, `complete_through`), or
//! on submission when created with [`DummyBackend::immediate`]. This makes the
//! fence timeline fully deterministic, which the core's tests rely on to
//! simulate completion out of real time.
//!
//! The backend also plays validation layer: resetting a command context whose
//! last submission the GPU has not finished is reported as an error, and every
//! destroyed resource is recorded so tests can check it was destroyed once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{DeviceLostReason, SyncError, SyncResult};
use crate::fence::FenceValue;

use super::{Backend, PresentStatus, PresentSurface, QueueKind, WaitStatus};

/// Device-wide timeline state shared by the backend, its queues and timelines.
#[derive(Debug, Default)]
struct DeviceState {
    inner: Mutex<DeviceInner>,
    progress: Condvar,
}

#[derive(Debug, Default)]
struct DeviceInner {
    /// Completed value per timeline id.
    timelines: HashMap<u64, FenceValue>,
    lost: bool,
}

impl DeviceState {
    fn is_lost(&self) -> bool {
        self.inner.lock().lost
    }

    fn check_lost(&self) -> SyncResult<()> {
        if self.is_lost() {
            Err(SyncError::DeviceLost(DeviceLostReason::Removed))
        } else {
            Ok(())
        }
    }
}

/// Timeline object of the dummy backend.
#[derive(Debug)]
pub struct DummyTimeline {
    id: u64,
}

impl DummyTimeline {
    /// Unique id of this timeline.
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
enum QueueOp {
    Work {
        label: String,
        commands: usize,
        done: Arc<AtomicBool>,
    },
    Signal {
        timeline: u64,
        value: FenceValue,
    },
    Wait {
        timeline: u64,
        value: FenceValue,
    },
}

/// A simulated hardware queue.
///
/// Operations execute in submission order. A pending GPU-side wait blocks
/// everything queued behind it until another queue signals the awaited value.
#[derive(Debug)]
pub struct DummyQueue {
    kind: QueueKind,
    device: Arc<DeviceState>,
    ops: Mutex<VecDeque<QueueOp>>,
    immediate: bool,
    executed_work: AtomicUsize,
}

impl DummyQueue {
    /// Kind of this queue.
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Number of operations waiting for the simulated GPU.
    pub fn pending_ops(&self) -> usize {
        self.ops.lock().len()
    }

    /// Number of command submissions the simulated GPU has executed.
    pub fn executed_work(&self) -> usize {
        self.executed_work.load(Ordering::Acquire)
    }

    fn push(&self, op: QueueOp) {
        self.ops.lock().push_back(op);
        if self.immediate {
            self.complete_all();
        }
    }

    /// Execute the next queued operation.
    ///
    /// Returns `false` if the queue is empty, stalled on a GPU-side wait, or
    /// the device is lost.
    pub fn complete_next(&self) -> bool {
        let mut ops = self.ops.lock();
        let Some(front) = ops.front() else {
            return false;
        };

        let mut device = self.device.inner.lock();
        if device.lost {
            return false;
        }

        match front {
            QueueOp::Wait { timeline, value } => {
                let completed = device.timelines.get(timeline).copied().unwrap_or(0);
                if completed < *value {
                    return false;
                }
                log::trace!(
                    "DummyQueue({}): wait on timeline {} for {} satisfied",
                    self.kind.name(),
                    timeline,
                    value
                );
            }
            QueueOp::Signal { timeline, value } => {
                let completed = device.timelines.entry(*timeline).or_insert(0);
                *completed = (*completed).max(*value);
                log::trace!(
                    "DummyQueue({}): timeline {} reached {}",
                    self.kind.name(),
                    timeline,
                    value
                );
                self.device.progress.notify_all();
            }
            QueueOp::Work {
                label,
                commands,
                done,
            } => {
                log::trace!(
                    "DummyQueue({}): executed '{}' ({} commands)",
                    self.kind.name(),
                    label,
                    commands
                );
                done.store(true, Ordering::Release);
                self.executed_work.fetch_add(1, Ordering::AcqRel);
            }
        }

        drop(device);
        ops.pop_front();
        true
    }

    /// Execute operations until the queue is empty or stalls. Returns how many ran.
    pub fn complete_all(&self) -> usize {
        let mut count = 0;
        while self.complete_next() {
            count += 1;
        }
        count
    }

    /// Execute operations until `timeline` reaches `value`.
    ///
    /// Returns `false` if the queue emptied or stalled first.
    pub fn complete_through(&self, timeline: &DummyTimeline, value: FenceValue) -> bool {
        loop {
            let completed = self
                .device
                .inner
                .lock()
                .timelines
                .get(&timeline.id)
                .copied()
                .unwrap_or(0);
            if completed >= value {
                return true;
            }
            if !self.complete_next() {
                return false;
            }
        }
    }
}

/// Command recording context of the dummy backend.
#[derive(Debug)]
pub struct DummyCommandContext {
    id: u64,
    label: String,
    commands: Vec<String>,
    resets: u32,
    in_flight: Option<Arc<AtomicBool>>,
}

impl DummyCommandContext {
    /// Unique id of this context, stable across resets.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Debug label given at creation.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Record a named command.
    pub fn record(&mut self, command: impl Into<String>) {
        self.commands.push(command.into());
    }

    /// Commands recorded since the last reset.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// How many times this context has been reset.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// Whether the GPU is still executing this context's last submission.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|done| !done.load(Ordering::Acquire))
    }
}

/// Resource handle of the dummy backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DummyResource {
    /// Unique id.
    pub id: u64,
    /// Debug label.
    pub label: String,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    device: Arc<DeviceState>,
    immediate: bool,
    next_id: AtomicU64,
    contexts_created: AtomicUsize,
    contexts_destroyed: AtomicUsize,
    destroyed: Mutex<Vec<u64>>,
}

impl DummyBackend {
    /// Create a backend whose GPU only progresses when driven by the caller.
    pub fn new() -> Self {
        Self::with_mode(false)
    }

    /// Create a backend whose GPU finishes every operation as soon as it is queued.
    pub fn immediate() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(immediate: bool) -> Self {
        log::trace!("DummyBackend: created (immediate: {})", immediate);
        Self {
            device: Arc::new(DeviceState::default()),
            immediate,
            next_id: AtomicU64::new(1),
            contexts_created: AtomicUsize::new(0),
            contexts_destroyed: AtomicUsize::new(0),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a queue of the given kind.
    pub fn create_queue(&self, kind: QueueKind) -> DummyQueue {
        DummyQueue {
            kind,
            device: Arc::clone(&self.device),
            ops: Mutex::new(VecDeque::new()),
            immediate: self.immediate,
            executed_work: AtomicUsize::new(0),
        }
    }

    /// Create a resource handle with a fresh id.
    pub fn create_resource(&self, label: impl Into<String>) -> DummyResource {
        DummyResource {
            id: self.next_id(),
            label: label.into(),
        }
    }

    /// Simulate device removal. Every blocked and future wait fails with `DeviceLost`.
    pub fn lose_device(&self) {
        log::error!("DummyBackend: simulating device removal");
        self.device.inner.lock().lost = true;
        self.device.progress.notify_all();
    }

    /// Whether [`lose_device`](Self::lose_device) was called.
    pub fn is_device_lost(&self) -> bool {
        self.device.is_lost()
    }

    /// Ids of destroyed resources, in destruction order.
    pub fn destroyed_resources(&self) -> Vec<u64> {
        self.destroyed.lock().clone()
    }

    /// How many times the resource with `id` was destroyed.
    pub fn destroy_count(&self, id: u64) -> usize {
        self.destroyed.lock().iter().filter(|&&d| d == id).count()
    }

    /// Number of command contexts created so far.
    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::Relaxed)
    }

    /// Number of command contexts created and not yet destroyed.
    pub fn live_contexts(&self) -> usize {
        self.contexts_created.load(Ordering::Relaxed)
            - self.contexts_destroyed.load(Ordering::Relaxed)
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for DummyBackend {
    type Timeline = DummyTimeline;
    type Queue = DummyQueue;
    type CommandContext = DummyCommandContext;
    type Resource = DummyResource;

    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn create_timeline(&self, initial: FenceValue) -> SyncResult<DummyTimeline> {
        self.device.check_lost()?;
        let id = self.next_id();
        self.device.inner.lock().timelines.insert(id, initial);
        Ok(DummyTimeline { id })
    }

    fn destroy_timeline(&self, timeline: &DummyTimeline) {
        self.device.inner.lock().timelines.remove(&timeline.id);
    }

    fn completed_value(&self, timeline: &DummyTimeline) -> SyncResult<FenceValue> {
        let device = self.device.inner.lock();
        if device.lost {
            return Err(SyncError::DeviceLost(DeviceLostReason::Removed));
        }
        Ok(device.timelines.get(&timeline.id).copied().unwrap_or(0))
    }

    fn wait_timeline(
        &self,
        timeline: &DummyTimeline,
        value: FenceValue,
        timeout: Option<Duration>,
    ) -> SyncResult<WaitStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut device = self.device.inner.lock();
        loop {
            if device.lost {
                return Err(SyncError::DeviceLost(DeviceLostReason::Removed));
            }
            if device.timelines.get(&timeline.id).copied().unwrap_or(0) >= value {
                return Ok(WaitStatus::Reached);
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .device
                        .progress
                        .wait_until(&mut device, deadline)
                        .timed_out()
                    {
                        let reached =
                            device.timelines.get(&timeline.id).copied().unwrap_or(0) >= value;
                        return Ok(if reached {
                            WaitStatus::Reached
                        } else {
                            WaitStatus::TimedOut
                        });
                    }
                }
                None => self.device.progress.wait(&mut device),
            }
        }
    }

    fn queue_signal(
        &self,
        queue: &DummyQueue,
        timeline: &DummyTimeline,
        value: FenceValue,
    ) -> SyncResult<()> {
        self.device.check_lost()?;
        queue.push(QueueOp::Signal {
            timeline: timeline.id,
            value,
        });
        Ok(())
    }

    fn queue_wait(
        &self,
        queue: &DummyQueue,
        timeline: &DummyTimeline,
        value: FenceValue,
    ) -> SyncResult<()> {
        self.device.check_lost()?;
        queue.push(QueueOp::Wait {
            timeline: timeline.id,
            value,
        });
        Ok(())
    }

    fn create_command_context(
        &self,
        queue: &DummyQueue,
        label: &str,
    ) -> SyncResult<DummyCommandContext> {
        self.device.check_lost()?;
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "DummyBackend: creating command context '{}' for {} queue",
            label,
            queue.kind.name()
        );
        Ok(DummyCommandContext {
            id: self.next_id(),
            label: label.to_string(),
            commands: Vec::new(),
            resets: 0,
            in_flight: None,
        })
    }

    fn reset_command_context(&self, context: &mut DummyCommandContext) -> SyncResult<()> {
        if context.is_in_flight() {
            log::error!(
                "DummyBackend: command context '{}' reset while the GPU is still executing it",
                context.label
            );
            return Err(SyncError::Native(format!(
                "command context '{}' reset while in flight",
                context.label
            )));
        }
        context.commands.clear();
        context.in_flight = None;
        context.resets += 1;
        Ok(())
    }

    fn destroy_command_context(&self, context: DummyCommandContext) {
        if context.is_in_flight() {
            log::error!(
                "DummyBackend: command context '{}' destroyed while in flight",
                context.label
            );
        }
        self.contexts_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn submit(&self, queue: &DummyQueue, context: &mut DummyCommandContext) -> SyncResult<()> {
        self.device.check_lost()?;
        let done = Arc::new(AtomicBool::new(false));
        context.in_flight = Some(Arc::clone(&done));
        queue.push(QueueOp::Work {
            label: context.label.clone(),
            commands: context.commands.len(),
            done,
        });
        Ok(())
    }

    fn destroy_resource(&self, resource: DummyResource) {
        log::trace!(
            "DummyBackend: destroying resource {} '{}'",
            resource.id,
            resource.label
        );
        self.destroyed.lock().push(resource.id);
    }
}

/// Scriptable presentation surface for tests.
#[derive(Debug)]
pub struct DummySurface {
    device: Option<Arc<DeviceState>>,
    back_buffers: u32,
    next_image: u32,
    acquired: Option<u32>,
    scripted: VecDeque<SyncResult<PresentStatus>>,
    resizes: Vec<(u32, u32)>,
    presents: u32,
}

impl DummySurface {
    /// Create a surface with `back_buffers` images, not tied to any device.
    pub fn new(back_buffers: u32) -> Self {
        assert!(back_buffers > 0, "back_buffers must be at least 1");
        Self {
            device: None,
            back_buffers,
            next_image: 0,
            acquired: None,
            scripted: VecDeque::new(),
            resizes: Vec::new(),
            presents: 0,
        }
    }

    /// Create a surface that reports device loss when `backend`'s device is lost.
    pub fn for_backend(backend: &DummyBackend, back_buffers: u32) -> Self {
        Self {
            device: Some(Arc::clone(&backend.device)),
            ..Self::new(back_buffers)
        }
    }

    /// Queue the result of an upcoming present call.
    pub fn push_present_result(&mut self, result: SyncResult<PresentStatus>) {
        self.scripted.push_back(result);
    }

    /// Sizes passed to [`PresentSurface::resize`], in order.
    pub fn resizes(&self) -> &[(u32, u32)] {
        &self.resizes
    }

    /// Back buffer acquired and not yet presented.
    pub fn acquired(&self) -> Option<u32> {
        self.acquired
    }

    /// Number of successful presents.
    pub fn presents(&self) -> u32 {
        self.presents
    }

    fn check_lost(&self) -> SyncResult<()> {
        match &self.device {
            Some(device) => device.check_lost(),
            None => Ok(()),
        }
    }
}

impl PresentSurface for DummySurface {
    fn back_buffer_count(&self) -> u32 {
        self.back_buffers
    }

    fn acquire_next(&mut self) -> SyncResult<Option<u32>> {
        self.check_lost()?;
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.back_buffers;
        self.acquired = Some(index);
        Ok(Some(index))
    }

    fn present(&mut self, _sync_interval: u32) -> SyncResult<PresentStatus> {
        self.check_lost()?;
        let status = self
            .scripted
            .pop_front()
            .unwrap_or(Ok(PresentStatus::Presented))?;
        if status != PresentStatus::OutOfDate {
            self.presents += 1;
        }
        self.acquired = None;
        Ok(status)
    }

    fn resize(&mut self, width: u32, height: u32) -> SyncResult<()> {
        self.check_lost()?;
        self.resizes.push((width, height));
        self.next_image = 0;
        self.acquired = None;
        Ok(())
    }
}
