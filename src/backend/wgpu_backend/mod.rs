//! wgpu backend.
//!
//! wgpu exposes a single queue and no native timeline object, so a timeline
//! is a CPU-side counter advanced by `Queue::on_submitted_work_done`
//! callbacks. Callbacks only run while the device is polled; blocking waits
//! poll with `Maintain::Wait` and then park on a condition variable.
//!
//! Device loss arrives through `Device::set_device_lost_callback`. The
//! callback latches a flag and wakes every parked waiter, since a lost
//! device never runs the outstanding submission callbacks.

mod surface;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{DeviceLostReason, SyncError, SyncResult};
use crate::fence::FenceValue;

use super::{Backend, QueueKind, WaitStatus};

pub use surface::WgpuSurface;

#[derive(Debug)]
struct TimelineState {
    completed: Mutex<FenceValue>,
    reached: Condvar,
}

impl TimelineState {
    fn advance(&self, value: FenceValue) {
        let mut completed = self.completed.lock();
        if value > *completed {
            *completed = value;
            self.reached.notify_all();
        }
    }

    /// Park until `value` is reached, the deadline passes or the device is lost.
    fn wait_for(
        &self,
        value: FenceValue,
        deadline: Option<Instant>,
        loss: &DeviceLoss,
    ) -> SyncResult<WaitStatus> {
        let mut completed = self.completed.lock();
        while *completed < value {
            loss.check()?;
            match deadline {
                Some(deadline) => {
                    if self.reached.wait_until(&mut completed, deadline).timed_out() {
                        return Ok(if *completed >= value {
                            WaitStatus::Reached
                        } else {
                            WaitStatus::TimedOut
                        });
                    }
                }
                None => self.reached.wait(&mut completed),
            }
        }
        Ok(WaitStatus::Reached)
    }
}

/// Loss flag shared with the device-lost callback.
#[derive(Debug, Default)]
struct DeviceLoss {
    lost: AtomicBool,
    timelines: Mutex<Vec<Weak<TimelineState>>>,
}

impl DeviceLoss {
    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn check(&self) -> SyncResult<()> {
        if self.is_lost() {
            Err(SyncError::DeviceLost(DeviceLostReason::Removed))
        } else {
            Ok(())
        }
    }

    fn register(&self, state: &Arc<TimelineState>) {
        let mut timelines = self.timelines.lock();
        timelines.retain(|weak| weak.strong_count() > 0);
        timelines.push(Arc::downgrade(state));
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
        for state in self.timelines.lock().iter().filter_map(Weak::upgrade) {
            // Taking the lock orders the wake after any waiter's flag check.
            let _completed = state.completed.lock();
            state.reached.notify_all();
        }
    }
}

/// Timeline advanced by submission-done callbacks.
#[derive(Debug, Clone)]
pub struct WgpuTimeline {
    state: Arc<TimelineState>,
}

/// Handle to the device queue.
///
/// wgpu has one queue per device; every [`QueueKind`] maps onto it and
/// submissions from different kinds execute in submission order.
#[derive(Debug, Clone)]
pub struct WgpuQueue {
    kind: QueueKind,
    queue: Arc<wgpu::Queue>,
}

impl WgpuQueue {
    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn raw(&self) -> &wgpu::Queue {
        &self.queue
    }
}

/// A command encoder that is recreated on every reset.
#[derive(Debug)]
pub struct WgpuCommandContext {
    encoder: Option<wgpu::CommandEncoder>,
    label: String,
}

impl WgpuCommandContext {
    /// Encoder to record into. `None` once submitted, until the next reset.
    pub fn encoder(&mut self) -> Option<&mut wgpu::CommandEncoder> {
        self.encoder.as_mut()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// wgpu objects whose destruction is deferred until the GPU is done with them.
#[derive(Debug)]
pub enum WgpuResource {
    Buffer(wgpu::Buffer),
    Texture(wgpu::Texture),
    TextureView(wgpu::TextureView),
    Sampler(wgpu::Sampler),
    BindGroup(wgpu::BindGroup),
    RenderPipeline(wgpu::RenderPipeline),
    ComputePipeline(wgpu::ComputePipeline),
}

/// wgpu backend over an existing or headless device.
pub struct WgpuBackend {
    instance: Option<wgpu::Instance>,
    adapter: Option<wgpu::Adapter>,
    device: wgpu::Device,
    queue: Arc<wgpu::Queue>,
    loss: Arc<DeviceLoss>,
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.adapter.as_ref().map(|a| a.get_info().name))
            .finish()
    }
}

impl WgpuBackend {
    /// Create a headless device on the best available adapter.
    pub fn new() -> SyncResult<Self> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> SyncResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| SyncError::Native("No suitable wgpu adapter found".into()))?;

        let info = adapter.get_info();
        log::info!("Found adapter: {} ({:?} backend)", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("frame-sync device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| SyncError::Native(format!("Failed to create wgpu device: {}", e)))?;

        Ok(Self::assemble(Some(instance), Some(adapter), device, queue))
    }

    /// Wrap a device created elsewhere, for example by a windowing layer.
    ///
    /// Replaces any device-lost callback already installed on `device`.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self::assemble(None, None, device, queue)
    }

    fn assemble(
        instance: Option<wgpu::Instance>,
        adapter: Option<wgpu::Adapter>,
        device: wgpu::Device,
        queue: wgpu::Queue,
    ) -> Self {
        let loss = Arc::new(DeviceLoss::default());
        let watcher = Arc::clone(&loss);
        device.set_device_lost_callback(move |reason, message| match reason {
            wgpu::DeviceLostReason::Dropped | wgpu::DeviceLostReason::ReplacedCallback => {
                log::debug!("wgpu device-lost callback retired ({:?})", reason);
            }
            _ => {
                log::error!("wgpu device lost ({:?}): {}", reason, message);
                watcher.mark_lost();
            }
        });
        Self {
            instance,
            adapter,
            device,
            queue: Arc::new(queue),
            loss,
        }
    }

    /// Whether the device-lost callback has fired.
    pub fn is_device_lost(&self) -> bool {
        self.loss.is_lost()
    }

    pub fn instance(&self) -> Option<&wgpu::Instance> {
        self.instance.as_ref()
    }

    pub fn adapter(&self) -> Option<&wgpu::Adapter> {
        self.adapter.as_ref()
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Queue handle for the given kind. All kinds share the device queue.
    pub fn queue(&self, kind: QueueKind) -> WgpuQueue {
        WgpuQueue {
            kind,
            queue: Arc::clone(&self.queue),
        }
    }

    fn create_encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }
}

impl Backend for WgpuBackend {
    type Timeline = WgpuTimeline;
    type Queue = WgpuQueue;
    type CommandContext = WgpuCommandContext;
    type Resource = WgpuResource;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_timeline(&self, initial: FenceValue) -> SyncResult<WgpuTimeline> {
        self.loss.check()?;
        let state = Arc::new(TimelineState {
            completed: Mutex::new(initial),
            reached: Condvar::new(),
        });
        self.loss.register(&state);
        Ok(WgpuTimeline { state })
    }

    fn destroy_timeline(&self, _timeline: &WgpuTimeline) {}

    fn completed_value(&self, timeline: &WgpuTimeline) -> SyncResult<FenceValue> {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        self.loss.check()?;
        Ok(*timeline.state.completed.lock())
    }

    fn wait_timeline(
        &self,
        timeline: &WgpuTimeline,
        value: FenceValue,
        timeout: Option<Duration>,
    ) -> SyncResult<WaitStatus> {
        self.loss.check()?;
        if *timeline.state.completed.lock() >= value {
            return Ok(WaitStatus::Reached);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        // Blocks until everything submitted so far is done and runs the callbacks.
        let _ = self.device.poll(wgpu::Maintain::Wait);

        timeline.state.wait_for(value, deadline, &self.loss)
    }

    fn queue_signal(
        &self,
        queue: &WgpuQueue,
        timeline: &WgpuTimeline,
        value: FenceValue,
    ) -> SyncResult<()> {
        self.loss.check()?;
        let state = Arc::clone(&timeline.state);
        queue
            .queue
            .on_submitted_work_done(move || state.advance(value));
        Ok(())
    }

    fn queue_wait(
        &self,
        _queue: &WgpuQueue,
        _timeline: &WgpuTimeline,
        _value: FenceValue,
    ) -> SyncResult<()> {
        // Single queue: submissions already execute in order.
        Ok(())
    }

    fn create_command_context(
        &self,
        _queue: &WgpuQueue,
        label: &str,
    ) -> SyncResult<WgpuCommandContext> {
        Ok(WgpuCommandContext {
            encoder: Some(self.create_encoder(label)),
            label: label.to_string(),
        })
    }

    fn reset_command_context(&self, context: &mut WgpuCommandContext) -> SyncResult<()> {
        context.encoder = Some(self.create_encoder(&context.label));
        Ok(())
    }

    fn destroy_command_context(&self, context: WgpuCommandContext) {
        drop(context);
    }

    fn submit(&self, queue: &WgpuQueue, context: &mut WgpuCommandContext) -> SyncResult<()> {
        let encoder = context.encoder.take().ok_or_else(|| {
            SyncError::Native(format!("{} submitted twice without reset", context.label))
        })?;
        self.loss.check()?;
        queue.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn destroy_resource(&self, resource: WgpuResource) {
        match resource {
            WgpuResource::Buffer(buffer) => buffer.destroy(),
            WgpuResource::Texture(texture) => texture.destroy(),
            other => drop(other),
        }
    }
}
