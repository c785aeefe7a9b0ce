//! Configuration for the frame synchronization core.

use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Settings fixed when a [`FramePacer`](crate::FramePacer) is created.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use frame_sync::FrameSyncConfig;
///
/// let config = FrameSyncConfig::new(3)
///     .with_descriptors(1024, 256)
///     .with_hang_timeout(Some(Duration::from_secs(2)));
/// assert!(config.validate().is_ok());
/// assert_eq!(config.total_descriptors(), 1024 + 3 * 256);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSyncConfig {
    /// Frames the CPU may submit ahead of the GPU before blocking.
    pub frame_latency: usize,
    /// Slots in the long-lived, explicitly freed descriptor region.
    pub persistent_descriptors: u32,
    /// Slots in each frame slot's transient descriptor region.
    pub transient_descriptors_per_frame: u32,
    /// Upper bound on command allocators the pool may create. `None` is unbounded.
    pub max_command_allocators: Option<usize>,
    /// Longest a fence wait may block before the GPU is declared hung.
    pub hang_timeout: Option<Duration>,
}

impl FrameSyncConfig {
    /// Default hang timeout.
    pub const DEFAULT_HANG_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a configuration with the given frame latency and default sizes.
    pub fn new(frame_latency: usize) -> Self {
        Self {
            frame_latency,
            ..Self::default()
        }
    }

    /// Set the persistent and per-frame transient descriptor capacities.
    pub fn with_descriptors(mut self, persistent: u32, transient_per_frame: u32) -> Self {
        self.persistent_descriptors = persistent;
        self.transient_descriptors_per_frame = transient_per_frame;
        self
    }

    /// Cap the number of command allocators.
    pub fn with_max_command_allocators(mut self, cap: usize) -> Self {
        self.max_command_allocators = Some(cap);
        self
    }

    /// Set the hang timeout. `None` waits forever.
    pub fn with_hang_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hang_timeout = timeout;
        self
    }

    /// Total descriptor table size: persistent region plus one transient region per frame slot.
    pub fn total_descriptors(&self) -> u64 {
        self.persistent_descriptors as u64
            + self.transient_descriptors_per_frame as u64 * self.frame_latency as u64
    }

    /// Check the configuration for values the core cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.frame_latency == 0 {
            return Err(SyncError::InvalidConfig(
                "frame_latency must be at least 1".into(),
            ));
        }
        if self.total_descriptors() == 0 {
            return Err(SyncError::InvalidConfig(
                "descriptor table must have at least one slot".into(),
            ));
        }
        if self.total_descriptors() >= u32::MAX as u64 {
            return Err(SyncError::InvalidConfig(format!(
                "descriptor table of {} slots does not fit a 32-bit slot index",
                self.total_descriptors()
            )));
        }
        if self.max_command_allocators == Some(0) {
            return Err(SyncError::InvalidConfig(
                "max_command_allocators must allow at least one allocator".into(),
            ));
        }
        Ok(())
    }
}

impl Default for FrameSyncConfig {
    /// Two frames in flight, 4096 persistent and 4096 transient slots per frame.
    fn default() -> Self {
        Self {
            frame_latency: 2,
            persistent_descriptors: 4096,
            transient_descriptors_per_frame: 4096,
            max_command_allocators: None,
            hang_timeout: Some(Self::DEFAULT_HANG_TIMEOUT),
        }
    }
}
