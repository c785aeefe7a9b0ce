//! Frame loop integration tests.
//!
//! These drive a [`FramePacer`] on the dummy backend through whole frame
//! sequences and check the guarantees the frame loop is built for: the CPU
//! never gets more than `frame_latency` frames ahead, nothing is reused or
//! destroyed while the GPU may still read it, and device loss stops everything.
//!
//! ```bash
//! cargo test --test frame_pacing_tests
//! ```

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rstest::rstest;

use common::{test_config, TestContext};
use frame_sync::backend::{DummyBackend, DummySurface};
use frame_sync::{
    DeviceLostReason, Fence, FrameSyncConfig, PresentStatus, QueueKind, SwapchainPresenter,
    SyncError,
};

// ============================================================================
// Latency bound
// ============================================================================

/// With values 1..=latency outstanding and only 1 retired, the next frame
/// starts without blocking and without waiting for anything newer.
#[rstest]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
#[case::quad_buffered(4)]
fn test_begin_frame_waits_on_slot_value_only(#[case] latency: usize) {
    let mut ctx = TestContext::manual(test_config(latency));

    for expected in 1..=latency as u64 {
        assert_eq!(ctx.run_frame(), expected);
    }
    ctx.complete_through(1);

    let info = ctx.pacer.begin_frame(&ctx.queue).unwrap();
    assert_eq!(info.frame_index, 0);
    assert_eq!(info.target_value, latency as u64 + 1);
    assert_eq!(ctx.pacer.stats().blocking_waits, 0);
    assert!(!ctx.pacer.fence().is_complete(2).unwrap());
    ctx.pacer.end_frame(&ctx.queue).unwrap();
}

/// The frame after `latency` unretired frames blocks until the oldest retires.
#[rstest]
#[case::single(1)]
#[case::double(2)]
#[case::triple(3)]
fn test_cpu_blocks_when_latency_reached(#[case] latency: usize) {
    let mut ctx = TestContext::manual(test_config(latency));
    for _ in 0..latency {
        ctx.run_frame();
    }

    // Frame 0 is a work submission followed by the signal of value 1.
    let gpu = Arc::clone(&ctx.queue);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        assert!(gpu.complete_next());
        assert!(gpu.complete_next());
    });

    ctx.pacer.begin_frame(&ctx.queue).unwrap();
    handle.join().unwrap();

    assert_eq!(ctx.pacer.stats().blocking_waits, 1);
    assert_eq!(ctx.pacer.fence().last_completed(), 1);
    ctx.pacer.end_frame(&ctx.queue).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    /// Random GPU progress never lets the CPU run more than `latency` frames
    /// ahead, and the allocator pool never grows past one allocator per frame slot.
    #[test]
    fn test_latency_bound_under_random_progress(
        latency in 1usize..=3,
        gpu_steps in prop::collection::vec(0usize..4, 1..200),
    ) {
        let mut ctx = TestContext::manual(test_config(latency));

        for &steps in &gpu_steps {
            for _ in 0..steps {
                ctx.queue.complete_next();
            }

            // Never let the test thread block: retire the slot's value first.
            let slot = ctx.pacer.frame_index();
            if let Some(value) = ctx.pacer.slot_value(slot) {
                if !ctx.pacer.fence().is_complete(value).unwrap() {
                    ctx.complete_through(value);
                }
            }

            let info = ctx.pacer.begin_frame(&ctx.queue).unwrap();
            let fence = ctx.pacer.fence();
            let ahead = fence.cpu_value() - fence.last_completed();
            prop_assert!(
                ahead < latency as u64,
                "frame {} started with {} unretired frames",
                info.frame_number,
                ahead
            );
            ctx.pacer.context_mut().unwrap().record("draw");
            ctx.pacer.end_frame(&ctx.queue).unwrap();
        }

        // The dummy backend rejects resetting an in-flight context, so reaching
        // here also proves no allocator was reused early.
        prop_assert!(ctx.pacer.stats().allocators_created <= latency);
        prop_assert_eq!(ctx.pacer.stats().blocking_waits, 0);
    }
}

// ============================================================================
// Transient descriptors
// ============================================================================

/// Resetting a frame slot, once or repeatedly, rewinds its cursor to the region start.
#[rstest]
#[case(1, 1)]
#[case(4, 1)]
#[case(8, 3)]
fn test_transient_reset_is_idempotent(#[case] count: u32, #[case] resets: usize) {
    let ctx = TestContext::manual(test_config(2));
    let heap = ctx.pacer.descriptors();
    let persistent = heap.persistent_capacity();

    heap.allocate_range_in(0, 2).unwrap();
    for _ in 0..resets {
        heap.reset_frame(0);
    }
    let range = heap.allocate_range(count).unwrap();
    assert_eq!(range.indices(), persistent..persistent + count);
}

/// Transient ranges handed out during a frame stay inside that frame's slot.
#[test]
fn test_transient_ranges_stay_in_frame_slot() {
    let mut ctx = TestContext::immediate(test_config(3));

    for _ in 0..9 {
        let info = ctx.pacer.begin_frame(&ctx.queue).unwrap();
        let heap = ctx.pacer.descriptors();
        let region = heap.transient_region(info.frame_index);
        let a = heap.allocate_range(3).unwrap();
        let b = heap.allocate_range(5).unwrap();
        for range in [a, b] {
            assert!(region.start <= range.start().index());
            assert!(range.indices().end <= region.end);
        }
        assert!(heap.allocate_range(1).unwrap_err().is_exhaustion());
        ctx.pacer.end_frame(&ctx.queue).unwrap();
    }
}

// ============================================================================
// Deferred release
// ============================================================================

/// One frame of the release scenario: resources released while recording,
/// then queue operations the GPU runs after submission.
#[derive(Debug, Clone)]
struct ReleaseFrame {
    releases: usize,
    gpu_steps: usize,
}

fn release_frames() -> impl Strategy<Value = Vec<ReleaseFrame>> {
    prop::collection::vec(
        (0usize..3, 0usize..5).prop_map(|(releases, gpu_steps)| ReleaseFrame {
            releases,
            gpu_steps,
        }),
        1..100,
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    /// Resources released at random points are destroyed exactly once, and never
    /// before the fence value they were tagged with retires.
    #[test]
    fn test_no_premature_release(latency in 2usize..=3, frames in release_frames()) {
        let mut ctx = TestContext::manual(test_config(latency));
        let mut retire_values = HashMap::new();

        for frame in &frames {
            let slot = ctx.pacer.frame_index();
            if let Some(value) = ctx.pacer.slot_value(slot) {
                ctx.complete_through(value);
            }

            let info = ctx.pacer.begin_frame(&ctx.queue).unwrap();
            for _ in 0..frame.releases {
                let resource = ctx.resource("buffer");
                retire_values.insert(resource.id, info.target_value);
                ctx.pacer.release(resource);
            }
            ctx.pacer.end_frame(&ctx.queue).unwrap();

            let completed = ctx.pacer.fence().last_completed();
            for id in ctx.backend.destroyed_resources() {
                prop_assert!(
                    retire_values[&id] <= completed,
                    "resource {} destroyed at completed {} before its value {}",
                    id,
                    completed,
                    retire_values[&id]
                );
            }

            for _ in 0..frame.gpu_steps {
                ctx.queue.complete_next();
            }
        }

        ctx.queue.complete_all();
        ctx.pacer.wait_idle().unwrap();
        prop_assert_eq!(ctx.pacer.pending_releases(), 0);
        for &id in retire_values.keys() {
            prop_assert_eq!(ctx.backend.destroy_count(id), 1);
        }
    }
}

#[test]
fn test_shutdown_releases_everything_once() {
    let mut ctx = TestContext::manual(test_config(2));
    let mut ids = Vec::new();

    for _ in 0..2 {
        ctx.pacer.begin_frame(&ctx.queue).unwrap();
        let resource = ctx.resource("texture");
        ids.push(resource.id);
        ctx.pacer.release(resource);
        ctx.pacer.end_frame(&ctx.queue).unwrap();
    }
    assert_eq!(ctx.pacer.pending_releases(), 2);

    let gpu = Arc::clone(&ctx.queue);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        gpu.complete_all();
    });
    ctx.pacer.shutdown().unwrap();
    handle.join().unwrap();

    for id in ids {
        assert_eq!(ctx.backend.destroy_count(id), 1);
    }
    assert_eq!(ctx.backend.live_contexts(), 0);
}

// ============================================================================
// Device loss
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum LossPoint {
    BeforeBegin,
    WhileRecording,
    AfterSubmit,
}

/// Wherever removal is observed, every later frame call fails fast and
/// shutdown still releases everything the pacer owns.
#[rstest]
#[case::before_begin(LossPoint::BeforeBegin)]
#[case::while_recording(LossPoint::WhileRecording)]
#[case::after_submit(LossPoint::AfterSubmit)]
fn test_device_loss_is_sticky(#[case] point: LossPoint) {
    let mut ctx = TestContext::manual(test_config(2));
    ctx.run_frame();
    let pending = ctx.resource("pending");
    let pending_id = pending.id;
    ctx.pacer.release(pending);

    let err = match point {
        LossPoint::BeforeBegin => {
            ctx.backend.lose_device();
            ctx.pacer.begin_frame(&ctx.queue).unwrap_err()
        }
        LossPoint::WhileRecording => {
            ctx.pacer.begin_frame(&ctx.queue).unwrap();
            ctx.backend.lose_device();
            ctx.pacer.end_frame(&ctx.queue).unwrap_err()
        }
        LossPoint::AfterSubmit => {
            ctx.run_frame();
            ctx.backend.lose_device();
            ctx.pacer.wait_idle().unwrap_err()
        }
    };
    assert_eq!(err, SyncError::DeviceLost(DeviceLostReason::Removed));
    assert!(ctx.pacer.is_lost());

    assert!(ctx.pacer.begin_frame(&ctx.queue).unwrap_err().is_device_lost());
    assert!(ctx.pacer.wait_idle().unwrap_err().is_device_lost());

    ctx.pacer.shutdown().unwrap();
    assert_eq!(ctx.backend.destroy_count(pending_id), 1);
    assert_eq!(ctx.backend.live_contexts(), 0);
}

#[test]
fn test_hung_gpu_escalates_to_device_lost() {
    let config = FrameSyncConfig::new(1)
        .with_descriptors(4, 4)
        .with_hang_timeout(Some(Duration::from_millis(25)));
    let mut ctx = TestContext::manual(config);
    ctx.run_frame();

    match ctx.pacer.begin_frame(&ctx.queue).unwrap_err() {
        SyncError::DeviceLost(DeviceLostReason::Hung { timeout }) => {
            assert_eq!(timeout, Duration::from_millis(25));
        }
        other => panic!("expected a hang, got {other:?}"),
    }

    // Late GPU progress does not revive the session.
    ctx.queue.complete_all();
    assert!(ctx.pacer.fence().is_lost());
    assert!(ctx.pacer.begin_frame(&ctx.queue).unwrap_err().is_device_lost());
}

// ============================================================================
// Presentation
// ============================================================================

#[test]
fn test_frame_loop_with_presenter() {
    let mut ctx = TestContext::immediate(test_config(2));
    let mut presenter = SwapchainPresenter::new(DummySurface::for_backend(&ctx.backend, 3));

    for frame in 0..6u64 {
        ctx.pacer.begin_frame(&ctx.queue).unwrap();
        let image = presenter.acquire_next().unwrap().unwrap();
        assert_eq!(image as u64, frame % 3);
        ctx.pacer
            .context_mut()
            .unwrap()
            .record(format!("draw to back buffer {image}"));
        let (value, status) = presenter
            .present_frame(&mut ctx.pacer, &*ctx.queue, 1)
            .unwrap();
        assert_eq!(value, frame + 1);
        assert_eq!(status, PresentStatus::Presented);
    }
    assert_eq!(presenter.presented_count(), 6);
}

/// An out-of-date present blocks acquisition until the swapchain is resized,
/// and the resize only happens once the GPU finished every frame.
#[rstest]
#[case::out_of_date_present(true)]
#[case::window_resized(false)]
fn test_resize_after_present(#[case] out_of_date: bool) {
    let mut ctx = TestContext::manual(test_config(2));
    let mut surface = DummySurface::for_backend(&ctx.backend, 2);
    if out_of_date {
        surface.push_present_result(Ok(PresentStatus::OutOfDate));
    }
    let mut presenter = SwapchainPresenter::new(surface);

    ctx.pacer.begin_frame(&ctx.queue).unwrap();
    presenter.acquire_next().unwrap();
    let (_, status) = presenter
        .present_frame(&mut ctx.pacer, &*ctx.queue, 1)
        .unwrap();

    if out_of_date {
        assert_eq!(status, PresentStatus::OutOfDate);
        assert!(presenter.needs_resize());
        assert_eq!(presenter.acquire_next().unwrap(), None);
    } else {
        assert_eq!(status, PresentStatus::Presented);
        assert!(!presenter.needs_resize());
    }

    ctx.queue.complete_all();
    presenter.resize(&mut ctx.pacer, 1280, 720).unwrap();
    assert!(ctx.pacer.fence().is_idle());
    assert_eq!(presenter.size(), Some((1280, 720)));
    assert!(!presenter.needs_resize());
    assert_eq!(presenter.acquire_next().unwrap(), Some(0));
}

#[test]
fn test_device_lost_at_present_stops_pacer() {
    let mut ctx = TestContext::immediate(test_config(2));
    let mut surface = DummySurface::for_backend(&ctx.backend, 2);
    surface.push_present_result(Err(SyncError::DeviceLost(DeviceLostReason::Removed)));
    let mut presenter = SwapchainPresenter::new(surface);

    ctx.pacer.begin_frame(&ctx.queue).unwrap();
    presenter.acquire_next().unwrap();
    let err = presenter
        .present_frame(&mut ctx.pacer, &*ctx.queue, 1)
        .unwrap_err();
    assert!(err.is_device_lost());
    assert!(presenter.is_lost());
    assert!(ctx.pacer.is_lost());
    assert!(presenter.acquire_next().unwrap_err().is_device_lost());
    assert!(ctx.pacer.begin_frame(&ctx.queue).unwrap_err().is_device_lost());
}

// ============================================================================
// Cross-queue ordering
// ============================================================================

/// A graphics frame that consumes an upload waits for it on the GPU, not the CPU.
#[test]
fn test_upload_on_copy_queue_gates_graphics_frame() {
    let mut ctx = TestContext::manual(test_config(2));
    let copy_queue = ctx.backend.create_queue(QueueKind::Copy);
    let upload_fence = Fence::new(Arc::clone(&ctx.backend), "upload").unwrap();

    let upload_value = upload_fence.signal(&copy_queue).unwrap();
    ctx.pacer.begin_frame(&ctx.queue).unwrap();
    upload_fence.wait_gpu(&ctx.queue, upload_value).unwrap();
    let frame_value = ctx.pacer.end_frame(&ctx.queue).unwrap();

    // Graphics is stalled on the upload.
    assert_eq!(ctx.queue.complete_all(), 0);
    assert!(!ctx.pacer.fence().is_complete(frame_value).unwrap());

    copy_queue.complete_all();
    ctx.complete_through(frame_value);
    assert!(upload_fence.is_complete(upload_value).unwrap());
}

#[test]
fn test_config_rejected_before_any_gpu_object_exists() {
    let backend = Arc::new(DummyBackend::new());
    let err = frame_sync::FramePacer::new(
        Arc::clone(&backend),
        QueueKind::Graphics,
        FrameSyncConfig::new(0),
    )
    .unwrap_err();
    assert!(matches!(err, SyncError::InvalidConfig(_)));
    assert_eq!(backend.contexts_created(), 0);
}
