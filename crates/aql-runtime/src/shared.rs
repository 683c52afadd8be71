//! State shared by a runtime and every object it hands out

use crate::error::{Result, RuntimeError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Liveness flag and tick clock
///
/// Objects keep an `Arc<Lifecycle>` so that calls made through an `Arc` that
/// outlived [`crate::Runtime::shut_down`] report `NotInitialized`.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    alive: AtomicBool,
    epoch: Instant,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            epoch: Instant::now(),
        }
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RuntimeError::NotInitialized)
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Returns false if the runtime was already shut down.
    pub(crate) fn shut_down(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Nanosecond ticks since the runtime opened.
    pub(crate) fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Absolute deadline `after` from now, in ticks.
    pub(crate) fn deadline_after(&self, after: Duration) -> u64 {
        self.now().saturating_add(after.as_nanos() as u64)
    }

    /// Ticks remaining until `deadline`, `None` once it has passed.
    pub(crate) fn until(&self, deadline: u64) -> Option<Duration> {
        let now = self.now();
        (deadline > now).then(|| Duration::from_nanos(deadline - now))
    }
}
