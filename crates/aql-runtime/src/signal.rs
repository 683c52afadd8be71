//! Signals
//!
//! A signal is a 64-bit value mutated only through atomic operations with a
//! caller-selected memory order. Hosts wait on signals for completion, and the
//! command processor decrements completion signals and watches doorbells.
//!
//! Waiters either spin ([`WaitState::Active`]) or park on a condition variable
//! ([`WaitState::Blocked`]). Every mutation checks for parked waiters and
//! wakes them, so the mutex is only touched while someone is actually parked.

use crate::agent::Agent;
use crate::error::{Result, RuntimeError};
use crate::handle::Handle;
use crate::order::{failure_ordering, MemoryOrder};
use crate::shared::Lifecycle;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Signal value type
pub type SignalValue = i64;

/// Handle to a [`Signal`]
pub type SignalHandle = Handle<Signal>;

// Upper bound on a single park so a missed wakeup costs at most this long
const MAX_PARK: Duration = Duration::from_millis(5);
const SPINS_PER_YIELD: u32 = 64;

/// Comparison a waiter is waiting to become true
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Gte,
}

impl Condition {
    pub fn holds(self, value: SignalValue, compare: SignalValue) -> bool {
        match self {
            Self::Eq => value == compare,
            Self::Ne => value != compare,
            Self::Lt => value < compare,
            Self::Gte => value >= compare,
        }
    }
}

/// How a waiter passes time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WaitState {
    /// Park the thread until a mutation or the timeout
    #[default]
    Blocked,
    /// Busy-poll with spin hints and periodic yields
    Active,
}

/// Atomic synchronization value
pub struct Signal {
    handle: SignalHandle,
    value: AtomicI64,
    consumers: Vec<Handle<Agent>>,
    destroyed: AtomicBool,
    waiters: AtomicUsize,
    park_lock: Mutex<()>,
    park: Condvar,
    lifecycle: Arc<Lifecycle>,
}

impl Signal {
    pub(crate) fn new(
        handle: SignalHandle,
        initial: SignalValue,
        consumers: Vec<Handle<Agent>>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            handle,
            value: AtomicI64::new(initial),
            consumers,
            destroyed: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            park_lock: Mutex::new(()),
            park: Condvar::new(),
            lifecycle,
        }
    }

    pub fn handle(&self) -> SignalHandle {
        self.handle
    }

    /// Agents named as consumers at creation (advisory).
    pub fn consumers(&self) -> &[Handle<Agent>] {
        &self.consumers
    }

    fn check(&self) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        if self.destroyed.load(Ordering::Acquire) {
            return Err(RuntimeError::InvalidSignal(self.handle.to_raw()));
        }
        Ok(())
    }

    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.wake();
    }

    fn wake(&self) {
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.park_lock.lock();
            self.park.notify_all();
        }
    }

    // ============================================================================================
    // Value operations
    // ============================================================================================

    pub fn load(&self, order: MemoryOrder) -> Result<SignalValue> {
        self.check()?;
        let ordering = order.for_load()?;
        Ok(self.value.load(ordering))
    }

    pub fn store(&self, value: SignalValue, order: MemoryOrder) -> Result<()> {
        self.check()?;
        let ordering = order.for_store()?;
        self.value.store(value, ordering);
        self.wake();
        Ok(())
    }

    /// Swap in `value`, returning the previous value.
    pub fn exchange(&self, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.rmw(order, |v, o| v.swap(value, o))
    }

    /// Store `value` if the current value equals `expected`; returns the
    /// observed value either way.
    pub fn compare_and_swap(
        &self,
        expected: SignalValue,
        value: SignalValue,
        order: MemoryOrder,
    ) -> Result<SignalValue> {
        self.rmw(order, |v, o| match v.compare_exchange(expected, value, o, failure_ordering(o)) {
            Ok(previous) | Err(previous) => previous,
        })
    }

    /// Wrapping add; returns the previous value.
    pub fn add(&self, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.rmw(order, |v, o| v.fetch_add(value, o))
    }

    /// Wrapping subtract; returns the previous value.
    pub fn subtract(&self, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.rmw(order, |v, o| v.fetch_sub(value, o))
    }

    pub fn and(&self, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.rmw(order, |v, o| v.fetch_and(value, o))
    }

    pub fn or(&self, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.rmw(order, |v, o| v.fetch_or(value, o))
    }

    pub fn xor(&self, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.rmw(order, |v, o| v.fetch_xor(value, o))
    }

    fn rmw(&self, order: MemoryOrder, op: impl FnOnce(&AtomicI64, Ordering) -> SignalValue) -> Result<SignalValue> {
        self.check()?;
        let previous = op(&self.value, order.for_rmw());
        self.wake();
        Ok(previous)
    }

    // ============================================================================================
    // Waiting
    // ============================================================================================

    /// Wait until `condition(value, compare)` holds or the runtime clock
    /// reaches `timeout` ticks ([`aql_core::constants::WAIT_FOREVER`] never
    /// expires).
    ///
    /// Returns the last value observed (with acquire ordering) in both cases.
    pub fn wait(
        &self,
        condition: Condition,
        compare: SignalValue,
        timeout: u64,
        wait_state: WaitState,
    ) -> Result<SignalValue> {
        self.wait_with(condition, compare, timeout, wait_state, Ordering::Acquire)
    }

    /// [`Signal::wait`] with relaxed observation of the value.
    pub fn wait_relaxed(
        &self,
        condition: Condition,
        compare: SignalValue,
        timeout: u64,
        wait_state: WaitState,
    ) -> Result<SignalValue> {
        self.wait_with(condition, compare, timeout, wait_state, Ordering::Relaxed)
    }

    fn wait_with(
        &self,
        condition: Condition,
        compare: SignalValue,
        timeout: u64,
        wait_state: WaitState,
        ordering: Ordering,
    ) -> Result<SignalValue> {
        self.check()?;
        let mut spins = 0u32;
        loop {
            let value = self.value.load(ordering);
            if condition.holds(value, compare) {
                return Ok(value);
            }
            let Some(remaining) = self.lifecycle.until(timeout) else {
                return Ok(value);
            };
            self.check()?;

            match wait_state {
                WaitState::Active => {
                    spins = spins.wrapping_add(1);
                    if spins % SPINS_PER_YIELD == 0 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                WaitState::Blocked => self.park_while(condition, compare, remaining.min(MAX_PARK)),
            }
        }
    }

    fn park_while(&self, condition: Condition, compare: SignalValue, duration: Duration) {
        let mut guard = self.park_lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let value = self.value.load(Ordering::Relaxed);
        if !condition.holds(value, compare) && !self.destroyed.load(Ordering::Relaxed) {
            self.park.wait_for(&mut guard, duration);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("handle", &self.handle)
            .field("value", &self.value.load(Ordering::Relaxed))
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}
