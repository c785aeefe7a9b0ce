//! Error types for the synchronization core.
//!
//! Exhaustion errors are local to the component that reports them and the
//! caller decides whether to grow, evict, or drop the frame. [`SyncError::DeviceLost`]
//! is fatal to the device session and is the only error meant to travel all
//! the way up to the application.

use std::time::Duration;

use thiserror::Error;

use crate::descriptor::{DescriptorHeapKind, DescriptorRegion};
use crate::fence::FenceValue;

/// Why the device session was declared lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLostReason {
    /// The driver reported device removal or reset.
    Removed,
    /// A CPU wait on the fence timeline exceeded the hang timeout.
    Hung {
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The device reported a completed value the CPU never signaled.
    InvalidCompletedValue {
        /// Value reported by the device.
        completed: FenceValue,
        /// Highest value signaled by the CPU.
        signaled: FenceValue,
    },
    /// Backend specific failure that invalidates the device.
    Driver(String),
}

impl std::fmt::Display for DeviceLostReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Removed => write!(f, "device removed or reset"),
            Self::Hung { timeout } => write!(f, "GPU hung, no progress within {timeout:?}"),
            Self::InvalidCompletedValue {
                completed,
                signaled,
            } => write!(
                f,
                "completed value {completed} is beyond last signaled value {signaled}"
            ),
            Self::Driver(msg) => write!(f, "{msg}"),
        }
    }
}

/// Errors produced by the synchronization core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Device lost ({0}), please recreate the device")]
    DeviceLost(DeviceLostReason),
    #[error(
        "Descriptor heap {heap:?} exhausted: {region:?} region has {available} free slots, {requested} requested"
    )]
    DescriptorsExhausted {
        heap: DescriptorHeapKind,
        region: DescriptorRegion,
        requested: u32,
        available: u32,
    },
    #[error("No frame is recording, transient {heap:?} descriptors are unavailable")]
    NoActiveFrame { heap: DescriptorHeapKind },
    #[error("Command allocator pool exhausted (cap of {cap} allocators reached)")]
    AllocatorPoolExhausted { cap: usize },
    #[error("Presentation surface lost")]
    SurfaceLost,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Native call failed: {0}")]
    Native(String),
}

impl SyncError {
    /// Whether this error invalidates the whole device session.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }

    /// Whether this error is a recoverable allocation failure.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::DescriptorsExhausted { .. } | Self::AllocatorPoolExhausted { .. }
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_display() {
        let err = SyncError::DeviceLost(DeviceLostReason::Removed);
        assert_eq!(
            err.to_string(),
            "Device lost (device removed or reset), please recreate the device"
        );
        assert!(err.is_device_lost());
        assert!(!err.is_exhaustion());
    }

    #[test]
    fn test_exhaustion_classification() {
        let err = SyncError::DescriptorsExhausted {
            heap: DescriptorHeapKind::ResourceView,
            region: DescriptorRegion::Persistent,
            requested: 1,
            available: 0,
        };
        assert!(err.is_exhaustion());
        assert!(!err.is_device_lost());
        assert!(SyncError::AllocatorPoolExhausted { cap: 4 }.is_exhaustion());
    }

    #[test]
    fn test_hung_reason_mentions_timeout() {
        let reason = DeviceLostReason::Hung {
            timeout: Duration::from_millis(250),
        };
        assert!(reason.to_string().contains("250ms"));
    }
}
