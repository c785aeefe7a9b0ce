//! Descriptor table allocation.
//!
//! A [`DescriptorHeapAllocator`] hands out slot indices in one fixed-capacity
//! table of GPU-visible descriptors. The table is split into a persistent
//! region, explicitly allocated and freed, followed by one transient region per
//! frame slot:
//!
//! ```text
//! ┌──────────────────────┬───────────────┬───────────────┬─────┐
//! │ persistent           │ frame 0       │ frame 1       │ ... │
//! │ free list, explicit  │ bump cursor   │ bump cursor   │     │
//! │ allocate/free        │ reset per use │ reset per use │     │
//! └──────────────────────┴───────────────┴───────────────┴─────┘
//! 0                      P               P+T             P+2T
//! ```
//!
//! A frame slot's transient region is only rewound once the fence proves the
//! GPU finished the last frame that used it, so resetting one slot never races
//! GPU reads of another.
//!
//! Transient allocation is only open between [`reset_frame`] and
//! [`close_frame`]. A range taken after a frame was submitted would land in
//! that frame's region and be handed out again by the next reset of the slot
//! while the GPU may still read it, so [`allocate_range`] refuses it.
//!
//! [`reset_frame`]: DescriptorHeapAllocator::reset_frame
//! [`close_frame`]: DescriptorHeapAllocator::close_frame
//! [`allocate_range`]: DescriptorHeapAllocator::allocate_range
//!
//! # Thread Safety
//!
//! The allocator is `Send + Sync`. Persistent allocation takes a short lock, so
//! streaming threads may allocate while the render thread records. Transient
//! allocation is a lock-free compare-and-swap on the active slot's cursor.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::FrameSyncConfig;
use crate::error::{SyncError, SyncResult};

/// End-of-list marker in the persistent free list.
const INVALID_SLOT: u32 = u32::MAX;

/// Kind of descriptor a heap stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DescriptorHeapKind {
    /// Buffer and texture views (CBV/SRV/UAV).
    #[default]
    ResourceView,
    /// Samplers.
    Sampler,
    /// Render target views.
    RenderTarget,
    /// Depth stencil views.
    DepthStencil,
}

impl DescriptorHeapKind {
    /// Whether shaders read this kind of descriptor directly from the table.
    pub fn is_shader_visible(self) -> bool {
        matches!(self, Self::ResourceView | Self::Sampler)
    }
}

/// Region of a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorRegion {
    /// Long-lived slots, explicitly freed.
    Persistent,
    /// Per-frame slots, reclaimed by [`DescriptorHeapAllocator::reset_frame`].
    Transient,
}

/// Index of a slot in a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DescriptorSlot(pub u32);

impl DescriptorSlot {
    /// Raw table index.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Contiguous run of transient slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    start: u32,
    count: u32,
}

impl DescriptorRange {
    /// First slot of the range.
    pub fn start(&self) -> DescriptorSlot {
        DescriptorSlot(self.start)
    }

    /// Number of slots.
    pub fn len(&self) -> u32 {
        self.count
    }

    /// Whether the range holds no slots.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Table indices covered by the range.
    pub fn indices(&self) -> Range<u32> {
        self.start..self.start + self.count
    }

    /// Slot at `offset` within the range.
    pub fn slot(&self, offset: u32) -> Option<DescriptorSlot> {
        (offset < self.count).then(|| DescriptorSlot(self.start + offset))
    }
}

/// Usage snapshot of a descriptor heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapStats {
    /// Total table capacity.
    pub capacity: u32,
    /// Slots in the persistent region.
    pub persistent_capacity: u32,
    /// Persistent slots currently free.
    pub persistent_free: u32,
    /// Slots in each frame slot's transient region.
    pub transient_per_frame: u32,
    /// Transient slots used in the active frame slot.
    pub transient_used: u32,
}

/// Intrusive free list over the persistent region.
struct PersistentList {
    /// `next[i]` is the free slot after `i`, valid only while `i` is free.
    next: Vec<u32>,
    head: u32,
    free_count: u32,
    live: Vec<bool>,
}

impl PersistentList {
    fn new(capacity: u32) -> Self {
        let next = (0..capacity)
            .map(|i| if i + 1 < capacity { i + 1 } else { INVALID_SLOT })
            .collect();
        Self {
            next,
            head: if capacity > 0 { 0 } else { INVALID_SLOT },
            free_count: capacity,
            live: vec![false; capacity as usize],
        }
    }

    fn pop(&mut self) -> Option<u32> {
        if self.head == INVALID_SLOT {
            return None;
        }
        let slot = self.head;
        self.head = self.next[slot as usize];
        self.next[slot as usize] = INVALID_SLOT;
        self.live[slot as usize] = true;
        self.free_count -= 1;
        Some(slot)
    }

    fn push(&mut self, slot: u32) {
        self.next[slot as usize] = self.head;
        self.head = slot;
        self.live[slot as usize] = false;
        self.free_count += 1;
    }
}

/// Allocator over one descriptor table.
pub struct DescriptorHeapAllocator {
    kind: DescriptorHeapKind,
    persistent_capacity: u32,
    transient_per_frame: u32,
    frame_slots: usize,
    persistent: Mutex<PersistentList>,
    /// Absolute table index of the next free transient slot, one per frame slot.
    cursors: Vec<AtomicU32>,
    active_frame: AtomicUsize,
    /// Whether `active_frame` accepts transient allocations.
    frame_open: AtomicBool,
}

impl std::fmt::Debug for DescriptorHeapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorHeapAllocator")
            .field("kind", &self.kind)
            .field("stats", &self.stats())
            .field("frame_slots", &self.frame_slots)
            .finish()
    }
}

impl DescriptorHeapAllocator {
    /// Create an allocator with a persistent region of `persistent_capacity`
    /// slots and `frame_slots` transient regions of `transient_per_frame` slots.
    pub fn new(
        kind: DescriptorHeapKind,
        persistent_capacity: u32,
        transient_per_frame: u32,
        frame_slots: usize,
    ) -> SyncResult<Self> {
        if frame_slots == 0 {
            return Err(SyncError::InvalidConfig(
                "descriptor heap needs at least one frame slot".into(),
            ));
        }
        let capacity = persistent_capacity as u64 + transient_per_frame as u64 * frame_slots as u64;
        if capacity == 0 || capacity >= INVALID_SLOT as u64 {
            return Err(SyncError::InvalidConfig(format!(
                "descriptor heap {:?} capacity {} out of range",
                kind, capacity
            )));
        }

        let cursors = (0..frame_slots)
            .map(|slot| AtomicU32::new(persistent_capacity + slot as u32 * transient_per_frame))
            .collect();

        log::debug!(
            "Created {:?} descriptor heap: {} persistent, {} x {} transient",
            kind,
            persistent_capacity,
            frame_slots,
            transient_per_frame
        );

        Ok(Self {
            kind,
            persistent_capacity,
            transient_per_frame,
            frame_slots,
            persistent: Mutex::new(PersistentList::new(persistent_capacity)),
            cursors,
            active_frame: AtomicUsize::new(0),
            frame_open: AtomicBool::new(true),
        })
    }

    /// Create an allocator sized by `config`.
    pub fn from_config(kind: DescriptorHeapKind, config: &FrameSyncConfig) -> SyncResult<Self> {
        Self::new(
            kind,
            config.persistent_descriptors,
            config.transient_descriptors_per_frame,
            config.frame_latency,
        )
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    /// Total number of slots in the table.
    pub fn capacity(&self) -> u32 {
        self.persistent_capacity + self.transient_per_frame * self.frame_slots as u32
    }

    pub fn persistent_capacity(&self) -> u32 {
        self.persistent_capacity
    }

    pub fn transient_per_frame(&self) -> u32 {
        self.transient_per_frame
    }

    pub fn frame_slots(&self) -> usize {
        self.frame_slots
    }

    /// Frame slot that transient allocations currently draw from.
    pub fn active_frame(&self) -> usize {
        self.active_frame.load(Ordering::Acquire)
    }

    /// Whether [`allocate_range`](Self::allocate_range) currently accepts requests.
    pub fn is_frame_open(&self) -> bool {
        self.frame_open.load(Ordering::Acquire)
    }

    fn check_frame_slot(&self, frame_slot: usize) {
        assert!(
            frame_slot < self.frame_slots,
            "frame slot {} out of range (heap has {})",
            frame_slot,
            self.frame_slots
        );
    }

    /// Table indices of `frame_slot`'s transient region.
    pub fn transient_region(&self, frame_slot: usize) -> Range<u32> {
        let start = self.persistent_capacity + frame_slot as u32 * self.transient_per_frame;
        start..start + self.transient_per_frame
    }

    // ---------------------------------------------------------------------
    // Persistent region
    // ---------------------------------------------------------------------

    /// Allocate one persistent slot.
    pub fn allocate(&self) -> SyncResult<DescriptorSlot> {
        let mut list = self.persistent.lock();
        list.pop().map(DescriptorSlot).ok_or(SyncError::DescriptorsExhausted {
            heap: self.kind,
            region: DescriptorRegion::Persistent,
            requested: 1,
            available: 0,
        })
    }

    /// Return a persistent slot to the free list.
    ///
    /// Freeing a transient slot or a slot that is already free is a
    /// programming error and panics in debug builds.
    pub fn free(&self, slot: DescriptorSlot) {
        let index = slot.index();
        debug_assert!(
            index < self.persistent_capacity,
            "descriptor slot {} is not in the persistent region (capacity {})",
            index,
            self.persistent_capacity
        );
        if index >= self.persistent_capacity {
            log::error!(
                "{:?} heap: ignoring free of non-persistent slot {}",
                self.kind,
                index
            );
            return;
        }

        let mut list = self.persistent.lock();
        let live = list.live[index as usize];
        debug_assert!(live, "descriptor slot {} freed twice", index);
        if !live {
            log::error!("{:?} heap: ignoring double free of slot {}", self.kind, index);
            return;
        }
        list.push(index);
    }

    /// Persistent slots currently free.
    pub fn persistent_free(&self) -> u32 {
        self.persistent.lock().free_count
    }

    /// Persistent slots currently allocated.
    pub fn persistent_in_use(&self) -> u32 {
        self.persistent_capacity - self.persistent_free()
    }

    // ---------------------------------------------------------------------
    // Transient region
    // ---------------------------------------------------------------------

    /// Allocate `count` contiguous transient slots from the active frame slot.
    ///
    /// Fails with [`SyncError::NoActiveFrame`] after [`close_frame`](Self::close_frame)
    /// until the next [`reset_frame`](Self::reset_frame).
    pub fn allocate_range(&self, count: u32) -> SyncResult<DescriptorRange> {
        if !self.is_frame_open() {
            return Err(SyncError::NoActiveFrame { heap: self.kind });
        }
        self.allocate_range_in(self.active_frame(), count)
    }

    /// Allocate `count` contiguous transient slots from `frame_slot`'s region.
    ///
    /// The caller vouches that `frame_slot` belongs to a frame still being
    /// recorded; no open-frame check is made.
    pub fn allocate_range_in(&self, frame_slot: usize, count: u32) -> SyncResult<DescriptorRange> {
        self.check_frame_slot(frame_slot);
        let end = self.transient_region(frame_slot).end;
        let cursor = &self.cursors[frame_slot];

        let mut current = cursor.load(Ordering::Relaxed);
        loop {
            let available = end - current;
            if count > available {
                return Err(SyncError::DescriptorsExhausted {
                    heap: self.kind,
                    region: DescriptorRegion::Transient,
                    requested: count,
                    available,
                });
            }
            match cursor.compare_exchange_weak(
                current,
                current + count,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(DescriptorRange {
                        start: current,
                        count,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Rewind `frame_slot`'s transient cursor, make it the active slot and
    /// open it for transient allocation.
    ///
    /// The caller must have proven that the GPU retired the last frame that
    /// used this slot. Calling it repeatedly has the same effect as once.
    pub fn reset_frame(&self, frame_slot: usize) {
        self.check_frame_slot(frame_slot);
        let start = self.transient_region(frame_slot).start;
        self.cursors[frame_slot].store(start, Ordering::Release);
        self.active_frame.store(frame_slot, Ordering::Release);
        self.frame_open.store(true, Ordering::Release);
    }

    /// Stop transient allocation once the active frame has been submitted.
    pub fn close_frame(&self) {
        self.frame_open.store(false, Ordering::Release);
    }

    /// Current transient cursor of `frame_slot` as an absolute table index.
    pub fn transient_cursor(&self, frame_slot: usize) -> u32 {
        self.check_frame_slot(frame_slot);
        self.cursors[frame_slot].load(Ordering::Acquire)
    }

    /// Transient slots used in `frame_slot` since its last reset.
    pub fn transient_used(&self, frame_slot: usize) -> u32 {
        self.transient_cursor(frame_slot) - self.transient_region(frame_slot).start
    }

    /// Usage snapshot.
    pub fn stats(&self) -> DescriptorHeapStats {
        DescriptorHeapStats {
            capacity: self.capacity(),
            persistent_capacity: self.persistent_capacity,
            persistent_free: self.persistent_free(),
            transient_per_frame: self.transient_per_frame,
            transient_used: self.transient_used(self.active_frame()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn heap(persistent: u32, transient: u32, frames: usize) -> DescriptorHeapAllocator {
        DescriptorHeapAllocator::new(DescriptorHeapKind::ResourceView, persistent, transient, frames)
            .unwrap()
    }

    #[test]
    fn test_freed_slot_is_reused_first() {
        let heap = heap(4, 0, 1);
        let slots: Vec<u32> = (0..4).map(|_| heap.allocate().unwrap().index()).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);

        heap.free(DescriptorSlot(2));
        assert_eq!(heap.allocate().unwrap(), DescriptorSlot(2));
    }

    #[test]
    fn test_persistent_exhaustion_is_recoverable() {
        let heap = heap(2, 4, 2);
        let a = heap.allocate().unwrap();
        heap.allocate().unwrap();

        let err = heap.allocate().unwrap_err();
        assert_eq!(
            err,
            SyncError::DescriptorsExhausted {
                heap: DescriptorHeapKind::ResourceView,
                region: DescriptorRegion::Persistent,
                requested: 1,
                available: 0,
            }
        );

        heap.free(a);
        assert_eq!(heap.allocate().unwrap(), a);
    }

    #[test]
    fn test_free_count_never_exceeds_capacity() {
        let heap = heap(8, 0, 1);
        assert_eq!(heap.persistent_free(), 8);
        let slots: Vec<_> = (0..8).map(|_| heap.allocate().unwrap()).collect();
        assert_eq!(heap.persistent_free(), 0);
        assert_eq!(heap.persistent_in_use(), 8);
        for slot in slots {
            heap.free(slot);
            assert!(heap.persistent_free() <= 8);
        }
        assert_eq!(heap.persistent_free(), 8);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    #[cfg(debug_assertions)]
    fn test_double_free_asserts() {
        let heap = heap(4, 0, 1);
        let slot = heap.allocate().unwrap();
        heap.free(slot);
        heap.free(slot);
    }

    #[test]
    fn test_transient_reset_returns_to_region_start() {
        let heap = heap(16, 8, 2);
        heap.reset_frame(0);
        let range = heap.allocate_range(3).unwrap();
        assert_eq!(range.indices(), 16..19);

        heap.reset_frame(0);
        heap.reset_frame(0);
        assert_eq!(heap.transient_cursor(0), 16);
        assert_eq!(heap.allocate_range(5).unwrap().indices(), 16..21);
    }

    #[test]
    fn test_frame_slots_do_not_overlap() {
        let heap = heap(4, 8, 3);
        let mut seen = HashSet::new();
        for slot in 0..3 {
            heap.reset_frame(slot);
            let range = heap.allocate_range(8).unwrap();
            assert_eq!(range.indices(), heap.transient_region(slot));
            for index in range.indices() {
                assert!(index >= 4);
                assert!(seen.insert(index));
            }
        }
        assert_eq!(seen.len(), 24);
    }

    #[test]
    fn test_resetting_one_slot_keeps_others() {
        let heap = heap(0, 8, 2);
        heap.reset_frame(0);
        heap.allocate_range(5).unwrap();
        heap.reset_frame(1);
        heap.allocate_range(2).unwrap();

        heap.reset_frame(1);
        assert_eq!(heap.transient_used(0), 5);
        assert_eq!(heap.transient_used(1), 0);
    }

    #[test]
    fn test_transient_exhaustion_reports_available() {
        let heap = heap(0, 4, 1);
        heap.allocate_range(3).unwrap();
        let err = heap.allocate_range(2).unwrap_err();
        assert!(matches!(
            err,
            SyncError::DescriptorsExhausted {
                region: DescriptorRegion::Transient,
                requested: 2,
                available: 1,
                ..
            }
        ));
        assert_eq!(heap.allocate_range(1).unwrap().indices(), 3..4);
    }

    #[test]
    fn test_closed_frame_rejects_transient_ranges() {
        let heap = heap(0, 4, 2);
        heap.reset_frame(1);
        heap.allocate_range(2).unwrap();
        heap.close_frame();

        assert!(!heap.is_frame_open());
        assert_eq!(
            heap.allocate_range(1).unwrap_err(),
            SyncError::NoActiveFrame {
                heap: DescriptorHeapKind::ResourceView
            }
        );
        assert_eq!(heap.transient_used(1), 2);

        heap.reset_frame(0);
        assert_eq!(heap.allocate_range(1).unwrap().indices(), 0..1);
    }

    #[test]
    #[should_panic(expected = "frame slot 2 out of range")]
    fn test_cursor_query_checks_frame_slot() {
        heap(4, 4, 2).transient_used(2);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert!(DescriptorHeapAllocator::new(DescriptorHeapKind::Sampler, 0, 0, 2).is_err());
        assert!(DescriptorHeapAllocator::new(DescriptorHeapKind::Sampler, 4, 4, 0).is_err());
    }

    #[test]
    fn test_concurrent_persistent_allocations_are_unique() {
        let heap = Arc::new(heap(1024, 0, 1));
        let per_thread = 128;

        let results: Vec<Vec<u32>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let heap = Arc::clone(&heap);
                    scope.spawn(move || {
                        let mut mine = Vec::new();
                        for i in 0..per_thread {
                            let slot = heap.allocate().unwrap();
                            if i % 3 == 0 {
                                heap.free(slot);
                            } else {
                                mine.push(slot.index());
                            }
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let all: Vec<u32> = results.into_iter().flatten().collect();
        let unique: HashSet<u32> = all.iter().copied().collect();
        assert_eq!(all.len(), unique.len());
        assert_eq!(heap.persistent_in_use() as usize, all.len());
    }

    #[test]
    fn test_concurrent_transient_ranges_are_disjoint() {
        let heap = Arc::new(heap(0, 4096, 1));

        let ranges: Vec<DescriptorRange> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let heap = Arc::clone(&heap);
                    scope.spawn(move || {
                        (0..64)
                            .map(|_| heap.allocate_range(4).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let mut seen = HashSet::new();
        for range in &ranges {
            for index in range.indices() {
                assert!(seen.insert(index));
            }
        }
        assert_eq!(seen.len(), 4 * 64 * 4);
    }

    #[test]
    fn test_range_accessors() {
        let heap = heap(2, 4, 1);
        let range = heap.allocate_range(2).unwrap();
        assert_eq!(range.start(), DescriptorSlot(2));
        assert_eq!(range.len(), 2);
        assert!(!range.is_empty());
        assert_eq!(range.slot(1), Some(DescriptorSlot(3)));
        assert_eq!(range.slot(2), None);
    }
}
