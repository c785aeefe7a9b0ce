//! Common utilities for the frame synchronization integration tests.
//!
//! Everything runs on the dummy backend, whose GPU only advances when a test
//! tells it to, so fence progress is fully deterministic.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use frame_sync::backend::{DummyBackend, DummyQueue, DummyResource};
use frame_sync::{FenceValue, FramePacer, FrameSyncConfig, QueueKind};

/// Initialise logging once per test binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Hang timeout long enough that no healthy test ever reaches it.
pub const TEST_HANG_TIMEOUT: Duration = Duration::from_secs(5);

/// Config used by most tests: small descriptor table, bounded hang timeout.
pub fn test_config(frame_latency: usize) -> FrameSyncConfig {
    FrameSyncConfig::new(frame_latency)
        .with_descriptors(16, 8)
        .with_hang_timeout(Some(TEST_HANG_TIMEOUT))
}

/// A dummy device with one graphics queue and a pacer driving it.
pub struct TestContext {
    pub backend: Arc<DummyBackend>,
    pub queue: Arc<DummyQueue>,
    pub pacer: FramePacer<DummyBackend>,
}

impl TestContext {
    /// GPU progresses only when the test completes queue work.
    pub fn manual(config: FrameSyncConfig) -> Self {
        Self::with_backend(DummyBackend::new(), config)
    }

    /// GPU finishes every operation as soon as it is queued.
    pub fn immediate(config: FrameSyncConfig) -> Self {
        Self::with_backend(DummyBackend::immediate(), config)
    }

    fn with_backend(backend: DummyBackend, config: FrameSyncConfig) -> Self {
        init_logging();
        let backend = Arc::new(backend);
        let queue = Arc::new(backend.create_queue(QueueKind::Graphics));
        let pacer = FramePacer::new(Arc::clone(&backend), QueueKind::Graphics, config)
            .expect("pacer creation");
        Self {
            backend,
            queue,
            pacer,
        }
    }

    /// Begin, record one command and end a frame.
    pub fn run_frame(&mut self) -> FenceValue {
        self.pacer.begin_frame(&self.queue).expect("begin_frame");
        self.pacer
            .context_mut()
            .expect("active frame")
            .record("draw");
        self.pacer.end_frame(&self.queue).expect("end_frame")
    }

    /// Let the GPU run until the frame fence reaches `value`.
    pub fn complete_through(&self, value: FenceValue) {
        assert!(
            self.queue
                .complete_through(self.pacer.fence().timeline(), value),
            "queue stalled before reaching {}",
            value
        );
    }

    /// A fresh resource handle.
    pub fn resource(&self, label: &str) -> DummyResource {
        self.backend.create_resource(label)
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        // Keep the pacer's shutdown wait from running into the hang timeout.
        self.queue.complete_all();
    }
}
