//! Deferred release of GPU resources.
//!
//! The CPU is usually done with a resource long before the GPU is: a buffer
//! dropped while recording frame `f` may still be read by frames `f-1` and `f`
//! in flight. Instead of destroying it, the owner hands it to a
//! [`DeferredReleaseQueue`] tagged with the fence value that frame `f` will
//! signal. Draining the queue with the fence's completed value destroys exactly
//! the entries the GPU has retired.
//!
//! ```text
//!  enqueue(R, 5)        drain(4)             drain(5)
//!  ┌───┬───┬───┐        ┌───┬───┐            ┌───┐
//!  │ 3 │ 4 │ 5 │  ───►  │ 5 │ 6 │    ───►    │ 6 │
//!  └───┴───┴───┘        └───┴───┘            └───┘
//!  head       tail      3 and 4 destroyed    5 destroyed, stops at 6
//! ```
//!
//! Retire values are non-decreasing in enqueue order, so draining stops at the
//! first entry that has not retired.

use std::collections::VecDeque;

use crate::fence::FenceValue;

/// FIFO of resources waiting for a fence value to retire.
pub struct DeferredReleaseQueue<T> {
    entries: VecDeque<(FenceValue, T)>,
    released: u64,
}

impl<T> std::fmt::Debug for DeferredReleaseQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredReleaseQueue")
            .field("pending_count", &self.pending_count())
            .field("max_retire_value", &self.max_retire_value())
            .field("released", &self.released)
            .finish()
    }
}

impl<T> DeferredReleaseQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            released: 0,
        }
    }

    /// Take ownership of `resource` until `retire_value` retires.
    ///
    /// `retire_value` must not be lower than the value of any entry already queued.
    pub fn enqueue(&mut self, resource: T, retire_value: FenceValue) {
        debug_assert!(
            self.max_retire_value()
                .map_or(true, |last| retire_value >= last),
            "deferred release at {} queued after release at {:?}",
            retire_value,
            self.max_retire_value()
        );
        self.entries.push_back((retire_value, resource));
    }

    /// Destroy every entry whose retire value is at most `completed`.
    ///
    /// Returns the number of entries passed to `destroy`.
    pub fn drain(&mut self, completed: FenceValue, mut destroy: impl FnMut(T)) -> usize {
        let mut count = 0;
        while let Some((retire_value, _)) = self.entries.front() {
            if *retire_value > completed {
                break;
            }
            if let Some((_, resource)) = self.entries.pop_front() {
                destroy(resource);
                count += 1;
            }
        }

        self.released += count as u64;
        if count > 0 {
            log::trace!(
                "Released {} deferred resources (completed {}, {} pending)",
                count,
                completed,
                self.entries.len()
            );
        }
        count
    }

    /// Destroy every entry regardless of its retire value.
    ///
    /// Only valid once the GPU is idle, for example after waiting on
    /// [`max_retire_value`](Self::max_retire_value) at shutdown.
    pub fn flush_all(&mut self, mut destroy: impl FnMut(T)) -> usize {
        let count = self.entries.len();
        for (_, resource) in self.entries.drain(..) {
            destroy(resource);
        }
        self.released += count as u64;
        count
    }

    /// Number of entries waiting.
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest retire value queued, which is the value to wait on before flushing.
    pub fn max_retire_value(&self) -> Option<FenceValue> {
        self.entries.back().map(|(value, _)| *value)
    }

    /// Total entries destroyed since creation.
    pub fn released_count(&self) -> u64 {
        self.released
    }
}

impl<T> Default for DeferredReleaseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for DeferredReleaseQueue<T> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            log::warn!(
                "DeferredReleaseQueue dropped with {} resources never released",
                self.entries.len()
            );
        }
    }
}
