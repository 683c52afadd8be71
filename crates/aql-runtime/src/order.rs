//! Caller-selected memory orders

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

/// Memory order for signal and queue-index operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryOrder {
    Relaxed,
    Acquire,
    Release,
    AcqRel,
}

impl MemoryOrder {
    /// Ordering for a load; release orders are rejected.
    pub fn for_load(self) -> Result<Ordering> {
        match self {
            Self::Relaxed => Ok(Ordering::Relaxed),
            Self::Acquire => Ok(Ordering::Acquire),
            other => Err(RuntimeError::invalid_argument(format!("{other:?} is not a load ordering"))),
        }
    }

    /// Ordering for a store; acquire orders are rejected.
    pub fn for_store(self) -> Result<Ordering> {
        match self {
            Self::Relaxed => Ok(Ordering::Relaxed),
            Self::Release => Ok(Ordering::Release),
            other => Err(RuntimeError::invalid_argument(format!("{other:?} is not a store ordering"))),
        }
    }

    /// Ordering for a read-modify-write.
    pub fn for_rmw(self) -> Ordering {
        match self {
            Self::Relaxed => Ordering::Relaxed,
            Self::Acquire => Ordering::Acquire,
            Self::Release => Ordering::Release,
            Self::AcqRel => Ordering::AcqRel,
        }
    }
}

/// Failure ordering to pair with a compare-exchange success ordering.
pub(crate) fn failure_ordering(success: Ordering) -> Ordering {
    match success {
        Ordering::Release | Ordering::Relaxed => Ordering::Relaxed,
        Ordering::SeqCst => Ordering::SeqCst,
        _ => Ordering::Acquire,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_store_orders() {
        assert_eq!(MemoryOrder::Acquire.for_load(), Ok(Ordering::Acquire));
        assert!(MemoryOrder::Release.for_load().is_err());
        assert!(MemoryOrder::AcqRel.for_load().is_err());
        assert_eq!(MemoryOrder::Release.for_store(), Ok(Ordering::Release));
        assert!(MemoryOrder::Acquire.for_store().is_err());
    }

    #[test]
    fn test_failure_ordering() {
        assert_eq!(failure_ordering(Ordering::AcqRel), Ordering::Acquire);
        assert_eq!(failure_ordering(Ordering::Release), Ordering::Relaxed);
    }
}
