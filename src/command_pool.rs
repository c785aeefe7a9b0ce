//! Recycling of command recording contexts.
//!
//! Each entry moves through `Free → CheckedOut → InFlight → Free`:
//!
//! ```text
//!            acquire()                 retire(entry, V)
//!   Free ──────────────► CheckedOut ───────────────────► InFlight
//!    ▲                                                      │
//!    └──────────── reclaimed in acquire() once V retired ───┘
//! ```
//!
//! Reclamation happens lazily inside [`CommandAllocatorPool::acquire`] by
//! comparing in-flight retire values against the fence. When nothing has
//! retired yet the pool creates another context instead of blocking, up to an
//! optional cap.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::{Backend, QueueKind};
use crate::error::{SyncError, SyncResult};
use crate::fence::{Fence, FenceValue};

/// A command recording context checked out of a [`CommandAllocatorPool`].
///
/// Hand it back with [`CommandAllocatorPool::retire`] after submission, or
/// [`CommandAllocatorPool::recycle`] if it was never submitted.
pub struct CommandAllocator<B: Backend> {
    id: usize,
    context: B::CommandContext,
}

impl<B: Backend> CommandAllocator<B> {
    /// Index of this allocator within its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn context(&self) -> &B::CommandContext {
        &self.context
    }

    /// The native context to record into.
    pub fn context_mut(&mut self) -> &mut B::CommandContext {
        &mut self.context
    }
}

impl<B: Backend> std::fmt::Debug for CommandAllocator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAllocator").field("id", &self.id).finish()
    }
}

/// Pool of command recording contexts for one queue.
pub struct CommandAllocatorPool<B: Backend> {
    backend: Arc<B>,
    queue_kind: QueueKind,
    free: Vec<CommandAllocator<B>>,
    in_flight: VecDeque<(FenceValue, CommandAllocator<B>)>,
    created: usize,
    checked_out: usize,
    max_allocators: Option<usize>,
}

impl<B: Backend> std::fmt::Debug for CommandAllocatorPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAllocatorPool")
            .field("queue", &self.queue_kind)
            .field("created", &self.created)
            .field("free", &self.free.len())
            .field("in_flight", &self.in_flight.len())
            .field("checked_out", &self.checked_out)
            .finish()
    }
}

impl<B: Backend> CommandAllocatorPool<B> {
    /// Create an empty pool for queues of `queue_kind`.
    ///
    /// `max_allocators` caps how many contexts the pool may create; `None`
    /// lets it grow as far as the GPU lags behind.
    pub fn new(backend: Arc<B>, queue_kind: QueueKind, max_allocators: Option<usize>) -> Self {
        Self {
            backend,
            queue_kind,
            free: Vec::new(),
            in_flight: VecDeque::new(),
            created: 0,
            checked_out: 0,
            max_allocators,
        }
    }

    pub fn queue_kind(&self) -> QueueKind {
        self.queue_kind
    }

    /// Check out a context ready for recording.
    ///
    /// Retired in-flight contexts are reset and returned to the free list
    /// first. Never blocks: if no context has retired a new one is created,
    /// failing with [`SyncError::AllocatorPoolExhausted`] past the cap.
    pub fn acquire(
        &mut self,
        fence: &Fence<B>,
        queue: &B::Queue,
    ) -> SyncResult<CommandAllocator<B>> {
        self.reclaim(fence)?;

        if let Some(entry) = self.free.pop() {
            log::debug!(
                "Reusing {} command allocator {}",
                self.queue_kind.name(),
                entry.id
            );
            self.checked_out += 1;
            return Ok(entry);
        }

        if let Some(cap) = self.max_allocators {
            if self.created >= cap {
                log::warn!(
                    "{} command allocator pool exhausted ({} in flight, cap {})",
                    self.queue_kind.name(),
                    self.in_flight.len(),
                    cap
                );
                return Err(SyncError::AllocatorPoolExhausted { cap });
            }
        }

        let id = self.created;
        let label = format!("{} command allocator {}", self.queue_kind.name(), id);
        let context = self.backend.create_command_context(queue, &label)?;
        self.created += 1;
        self.checked_out += 1;
        log::debug!("Allocated {}", label);

        Ok(CommandAllocator { id, context })
    }

    /// Move every retired in-flight context to the free list.
    fn reclaim(&mut self, fence: &Fence<B>) -> SyncResult<()> {
        let Some(&(oldest, _)) = self.in_flight.front() else {
            return Ok(());
        };
        let completed = match fence.last_completed() {
            cached if cached >= oldest => cached,
            _ => fence.completed_value()?,
        };
        while self
            .in_flight
            .front()
            .is_some_and(|(retire_value, _)| *retire_value <= completed)
        {
            if let Some((_, entry)) = self.in_flight.pop_front() {
                let entry = self.reset_or_destroy(entry)?;
                self.free.push(entry);
            }
        }
        Ok(())
    }

    /// Rewind `entry`'s context so it can record again.
    ///
    /// The GPU must not be executing the context; entries handed out by
    /// [`acquire`](Self::acquire) are already reset.
    pub fn reset(&self, entry: &mut CommandAllocator<B>) -> SyncResult<()> {
        self.backend.reset_command_context(&mut entry.context)
    }

    /// Reset `entry`, destroying its context if the backend refuses.
    fn reset_or_destroy(&self, mut entry: CommandAllocator<B>) -> SyncResult<CommandAllocator<B>> {
        match self.backend.reset_command_context(&mut entry.context) {
            Ok(()) => Ok(entry),
            Err(err) => {
                log::error!(
                    "{} command allocator {} failed to reset, destroying it: {}",
                    self.queue_kind.name(),
                    entry.id,
                    err
                );
                self.backend.destroy_command_context(entry.context);
                Err(err)
            }
        }
    }

    /// Hand back a submitted entry; it becomes reusable once `retire_value` retires.
    pub fn retire(&mut self, entry: CommandAllocator<B>, retire_value: FenceValue) {
        debug_assert!(
            self.in_flight
                .back()
                .map_or(true, |(last, _)| retire_value >= *last),
            "command allocator retired at {} after one retired at {:?}",
            retire_value,
            self.in_flight.back().map(|(last, _)| *last)
        );
        log::trace!(
            "{} command allocator {} in flight until {}",
            self.queue_kind.name(),
            entry.id,
            retire_value
        );
        self.checked_out = self.checked_out.saturating_sub(1);
        self.in_flight.push_back((retire_value, entry));
    }

    /// Hand back an entry that was never submitted.
    pub fn recycle(&mut self, entry: CommandAllocator<B>) -> SyncResult<()> {
        self.checked_out = self.checked_out.saturating_sub(1);
        let entry = self.reset_or_destroy(entry)?;
        self.free.push(entry);
        Ok(())
    }

    /// Number of contexts created over the pool's lifetime.
    pub fn created_count(&self) -> usize {
        self.created
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn checked_out_count(&self) -> usize {
        self.checked_out
    }

    /// Highest retire value of any in-flight entry.
    pub fn max_retire_value(&self) -> Option<FenceValue> {
        self.in_flight.back().map(|(value, _)| *value)
    }

    /// Destroy every context the pool holds.
    ///
    /// The GPU must have retired every in-flight entry.
    pub fn destroy_all(&mut self) {
        let count = self.free.len() + self.in_flight.len();
        for entry in self.free.drain(..) {
            self.backend.destroy_command_context(entry.context);
        }
        for (_, entry) in self.in_flight.drain(..) {
            self.backend.destroy_command_context(entry.context);
        }
        if count > 0 {
            log::debug!(
                "Destroyed {} {} command allocators",
                count,
                self.queue_kind.name()
            );
        }
        if self.checked_out > 0 {
            log::warn!(
                "{} {} command allocators still checked out",
                self.checked_out,
                self.queue_kind.name()
            );
        }
    }
}

impl<B: Backend> Drop for CommandAllocatorPool<B> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, DummyQueue};
    use proptest::prelude::*;
    use std::collections::HashMap;

    struct Harness {
        backend: Arc<DummyBackend>,
        queue: DummyQueue,
        fence: Fence<DummyBackend>,
    }

    impl Harness {
        fn new() -> Self {
            let backend = Arc::new(DummyBackend::new());
            let queue = backend.create_queue(QueueKind::Graphics);
            let fence = Fence::new(Arc::clone(&backend), "pool").unwrap();
            Self {
                backend,
                queue,
                fence,
            }
        }

        fn pool(&self, cap: Option<usize>) -> CommandAllocatorPool<DummyBackend> {
            CommandAllocatorPool::new(Arc::clone(&self.backend), QueueKind::Graphics, cap)
        }

        /// Record, submit and signal; returns the retire value.
        fn submit(&self, entry: &mut CommandAllocator<DummyBackend>) -> FenceValue {
            entry.context_mut().record("draw");
            self.backend
                .submit(&self.queue, entry.context_mut())
                .unwrap();
            self.fence.signal(&self.queue).unwrap()
        }
    }

    #[test]
    fn test_grows_while_gpu_busy() {
        let h = Harness::new();
        let mut pool = h.pool(None);

        for _ in 0..3 {
            let mut entry = pool.acquire(&h.fence, &h.queue).unwrap();
            let value = h.submit(&mut entry);
            pool.retire(entry, value);
        }
        assert_eq!(pool.created_count(), 3);
        assert_eq!(pool.in_flight_count(), 3);
    }

    #[test]
    fn test_reuses_after_retire() {
        let h = Harness::new();
        let mut pool = h.pool(None);

        let mut entry = pool.acquire(&h.fence, &h.queue).unwrap();
        let first_id = entry.id();
        let value = h.submit(&mut entry);
        pool.retire(entry, value);

        h.queue.complete_all();
        let entry = pool.acquire(&h.fence, &h.queue).unwrap();
        assert_eq!(entry.id(), first_id);
        assert!(entry.context().commands().is_empty());
        assert_eq!(entry.context().resets(), 1);
        assert_eq!(pool.created_count(), 1);
    }

    #[test]
    fn test_labels_name_queue_and_index() {
        let h = Harness::new();
        let mut pool = h.pool(None);
        let first = pool.acquire(&h.fence, &h.queue).unwrap();
        let second = pool.acquire(&h.fence, &h.queue).unwrap();
        assert_eq!(first.context().label(), "graphics command allocator 0");
        assert_eq!(second.context().label(), "graphics command allocator 1");
        pool.recycle(first).unwrap();
        pool.recycle(second).unwrap();
    }

    #[test]
    fn test_cap_reports_exhaustion() {
        let h = Harness::new();
        let mut pool = h.pool(Some(2));

        for _ in 0..2 {
            let mut entry = pool.acquire(&h.fence, &h.queue).unwrap();
            let value = h.submit(&mut entry);
            pool.retire(entry, value);
        }

        let err = pool.acquire(&h.fence, &h.queue).unwrap_err();
        assert_eq!(err, SyncError::AllocatorPoolExhausted { cap: 2 });
        assert!(err.is_exhaustion());

        h.queue.complete_next();
        h.queue.complete_next();
        assert!(pool.acquire(&h.fence, &h.queue).is_ok());
    }

    #[test]
    fn test_partial_completion_reclaims_prefix() {
        let h = Harness::new();
        let mut pool = h.pool(None);

        for _ in 0..3 {
            let mut entry = pool.acquire(&h.fence, &h.queue).unwrap();
            let value = h.submit(&mut entry);
            pool.retire(entry, value);
        }

        // Work and signal for value 1.
        h.queue.complete_next();
        h.queue.complete_next();

        let entry = pool.acquire(&h.fence, &h.queue).unwrap();
        assert_eq!(entry.id(), 0);
        assert_eq!(pool.in_flight_count(), 2);
        pool.recycle(entry).unwrap();
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        /// `gpu_steps[i]` is how many queue operations run after frame `i`.
        #[test]
        fn test_no_premature_reuse(gpu_steps in prop::collection::vec(0usize..4, 1..200)) {
            let h = Harness::new();
            let mut pool = h.pool(None);
            let mut retired_at: HashMap<usize, FenceValue> = HashMap::new();

            for &steps in &gpu_steps {
                let mut entry = pool.acquire(&h.fence, &h.queue).unwrap();
                if let Some(&value) = retired_at.get(&entry.id()) {
                    prop_assert!(
                        h.fence.is_complete(value).unwrap(),
                        "allocator {} reused before {} retired",
                        entry.id(),
                        value
                    );
                }
                let value = h.submit(&mut entry);
                retired_at.insert(entry.id(), value);
                pool.retire(entry, value);

                for _ in 0..steps {
                    h.queue.complete_next();
                }
            }

            h.queue.complete_all();
            prop_assert!(pool.created_count() <= gpu_steps.len());
        }
    }

    #[test]
    fn test_failed_reset_on_recycle_destroys_context() {
        let h = Harness::new();
        let mut pool = h.pool(None);

        let mut entry = pool.acquire(&h.fence, &h.queue).unwrap();
        h.submit(&mut entry);
        // Still executing: the dummy backend refuses the reset.
        assert!(pool.recycle(entry).is_err());
        assert_eq!(h.backend.live_contexts(), 0);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.checked_out_count(), 0);
        h.queue.complete_all();
    }

    #[test]
    fn test_failed_reset_on_reclaim_destroys_context() {
        let h = Harness::new();
        let mut pool = h.pool(None);

        let mut entry = pool.acquire(&h.fence, &h.queue).unwrap();
        h.submit(&mut entry);
        // Tagged with a value that is already complete while the work is not.
        pool.retire(entry, 0);

        assert!(pool.acquire(&h.fence, &h.queue).is_err());
        assert_eq!(pool.in_flight_count(), 0);
        assert_eq!(h.backend.live_contexts(), 0);

        h.queue.complete_all();
        let entry = pool.acquire(&h.fence, &h.queue).unwrap();
        assert_eq!(h.backend.live_contexts(), 1);
        pool.recycle(entry).unwrap();
    }

    #[test]
    fn test_drop_destroys_contexts() {
        let h = Harness::new();
        {
            let mut pool = h.pool(None);
            let mut entry = pool.acquire(&h.fence, &h.queue).unwrap();
            let value = h.submit(&mut entry);
            pool.retire(entry, value);
            let spare = pool.acquire(&h.fence, &h.queue).unwrap();
            pool.recycle(spare).unwrap();
            h.queue.complete_all();
            assert_eq!(h.backend.live_contexts(), 2);
        }
        assert_eq!(h.backend.live_contexts(), 0);
    }
}
