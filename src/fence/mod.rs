//! Fence primitive consumed by nodes.
//!
//! A fence is an opaque handle that transitions once from pending to
//! signalled with a [`FenceResult`]. Nodes create private fences for their
//! outputs, register callbacks with [`FenceProvider::async_wait`] and release
//! them when the last reference is gone. Hardware (or the simulated device)
//! signals them.
//!
//! [`SoftwareFences`] is the in-process implementation used by the simulator,
//! tests and benches.

pub mod software;

pub use software::SoftwareFences;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque fence handle. Zero is never a live fence.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FenceHandle(pub u64);

impl FenceHandle {
    pub const INVALID: FenceHandle = FenceHandle(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for FenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "FenceHandle(INVALID)")
        } else {
            write!(f, "FenceHandle({})", self.0)
        }
    }
}

impl fmt::Display for FenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome carried by a signalled fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FenceResult {
    Success,
    Failed,
    Canceled,
}

impl FenceResult {
    pub fn is_success(self) -> bool {
        self == FenceResult::Success
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            FenceResult::Success => 1,
            FenceResult::Failed => 2,
            FenceResult::Canceled => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FenceResult::Success),
            2 => Some(FenceResult::Failed),
            3 => Some(FenceResult::Canceled),
            _ => None,
        }
    }
}

/// Callback run once when a fence is signalled.
pub type FenceCallback = Box<dyn FnOnce(FenceHandle, FenceResult) + Send + 'static>;

/// Synchronization primitive with wait/signal/release semantics.
pub trait FenceProvider: Send + Sync {
    /// Create a fence owned by the caller
    fn create_private_fence(&self, name: &str) -> Result<FenceHandle>;

    /// Run `callback` asynchronously once `fence` is signalled. If the fence
    /// is already signalled the callback is dispatched right away.
    fn async_wait(&self, fence: FenceHandle, callback: FenceCallback) -> Result<()>;

    /// Signal `fence` with `result`. Signalling twice is an error.
    fn signal(&self, fence: FenceHandle, result: FenceResult) -> Result<()>;

    /// Release the fence. Releasing an unknown fence is an error.
    fn release(&self, fence: FenceHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle() {
        assert!(!FenceHandle::INVALID.is_valid());
        assert!(FenceHandle(3).is_valid());
        assert_eq!(format!("{:?}", FenceHandle::INVALID), "FenceHandle(INVALID)");
    }

    #[test]
    fn test_result_u8_round_trip() {
        for result in [FenceResult::Success, FenceResult::Failed, FenceResult::Canceled] {
            assert_eq!(FenceResult::from_u8(result.to_u8()), Some(result));
        }
        assert_eq!(FenceResult::from_u8(0), None);
    }
}
