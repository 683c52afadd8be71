//! User-mode queues
//!
//! A [`Queue`] wraps a [`RingBuffer`] of AQL packets together with the doorbell
//! signal producers ring after publishing. Hardware queues are consumed by a
//! runtime-owned command processor; soft queues are consumed by application
//! code through [`Queue::consumer`].
//!
//! # Producer protocol
//!
//! ```text
//! 1. index = add_write_index(n)                     reserve n slots
//! 2. while index + n - read_index > size: poll      queue full
//! 3. write body of every slot                        header stays INVALID
//! 4. publish header word (release)                   last write to the slot
//! 5. doorbell.store(index, release)                  wake the consumer
//! ```
//!
//! [`Queue::reserve`], the `write_*` helpers, [`Queue::publish`] and
//! [`Queue::ring_doorbell`] are the individual steps; [`Queue::dispatch`] and
//! [`Queue::barrier_and`] run the whole sequence for one packet.

mod consumer;
mod ring;

pub use consumer::{PacketView, ProcessResult, QueueConsumer};
pub use ring::{PacketSlot, RingBuffer};

use crate::agent::{Agent, AgentHandle, QueueType};
use crate::error::{Result, RuntimeError};
use crate::handle::{Arena, Handle};
use crate::memory::DevicePtr;
use crate::order::MemoryOrder;
use crate::shared::Lifecycle;
use crate::signal::{Signal, SignalHandle};
use aql_core::constants::BARRIER_DEP_SIGNALS;
use aql_core::{
    AgentDispatchPacket, AqlPacket, BarrierAndPacket, BarrierOrPacket, Features, KernelDispatchPacket, PacketBody,
    PacketHeader, PacketType,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Handle to a [`Queue`]
pub type QueueHandle = Handle<Queue>;

/// Invoked by the command processor when a packet cannot be processed
pub type ErrorCallback = Arc<dyn Fn(&RuntimeError, QueueHandle) + Send + Sync>;

/// Lifecycle state of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueueState {
    Active = 0,
    /// No new reservations; already published packets are still consumed
    Inactive = 1,
    Destroyed = 2,
}

impl QueueState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::Inactive,
            _ => Self::Destroyed,
        }
    }
}

/// Creation parameters shared by hardware and soft queues
pub(crate) struct QueueParams {
    pub(crate) id: u64,
    pub(crate) queue_type: QueueType,
    pub(crate) features: Features,
    pub(crate) agent: Option<Arc<Agent>>,
    pub(crate) doorbell: Arc<Signal>,
    pub(crate) private_segment_size: u32,
    pub(crate) group_segment_size: u32,
    pub(crate) error_callback: Option<ErrorCallback>,
    /// Region allocation backing a soft queue's ring.
    pub(crate) ring_allocation: Option<DevicePtr>,
}

/// A packet ring plus its doorbell
pub struct Queue {
    handle: QueueHandle,
    id: u64,
    ring: RingBuffer,
    queue_type: QueueType,
    features: Features,
    agent: Option<Arc<Agent>>,
    doorbell: Arc<Signal>,
    state: AtomicU8,
    private_segment_size: u32,
    group_segment_size: u32,
    error_callback: Option<ErrorCallback>,
    ring_allocation: Option<DevicePtr>,
    signals: Arc<Arena<Signal>>,
    lifecycle: Arc<Lifecycle>,
}

impl Queue {
    pub(crate) fn new(
        handle: QueueHandle,
        ring: RingBuffer,
        params: QueueParams,
        signals: Arc<Arena<Signal>>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            handle,
            id: params.id,
            ring,
            queue_type: params.queue_type,
            features: params.features,
            agent: params.agent,
            doorbell: params.doorbell,
            state: AtomicU8::new(QueueState::Active as u8),
            private_segment_size: params.private_segment_size,
            group_segment_size: params.group_segment_size,
            error_callback: params.error_callback,
            ring_allocation: params.ring_allocation,
            signals,
            lifecycle,
        }
    }

    // ============================================================================================
    // Properties
    // ============================================================================================

    pub fn handle(&self) -> QueueHandle {
        self.handle
    }

    /// Identifier unique within the runtime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of packet slots.
    pub fn size(&self) -> u32 {
        self.ring.size()
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn doorbell_signal(&self) -> SignalHandle {
        self.doorbell.handle()
    }

    /// Owning agent; `None` for soft queues.
    pub fn agent(&self) -> Option<AgentHandle> {
        self.agent.as_ref().map(|agent| agent.handle())
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn private_segment_size(&self) -> u32 {
        self.private_segment_size
    }

    pub fn group_segment_size(&self) -> u32 {
        self.group_segment_size
    }

    pub fn is_soft(&self) -> bool {
        self.agent.is_none()
    }

    /// Address of slot 0 of the ring.
    pub fn base_address(&self) -> u64 {
        self.ring.base_address()
    }

    pub(crate) fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub(crate) fn doorbell(&self) -> &Arc<Signal> {
        &self.doorbell
    }

    pub(crate) fn owner(&self) -> Option<&Arc<Agent>> {
        self.agent.as_ref()
    }

    pub(crate) fn signals(&self) -> &Arena<Signal> {
        &self.signals
    }

    pub(crate) fn ring_allocation(&self) -> Option<DevicePtr> {
        self.ring_allocation
    }

    /// Absolute runtime-clock deadline `after` from now.
    pub(crate) fn deadline_after(&self, after: std::time::Duration) -> u64 {
        self.lifecycle.deadline_after(after)
    }

    fn check(&self) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        if self.state() == QueueState::Destroyed {
            return Err(RuntimeError::InvalidQueue(self.handle.to_raw()));
        }
        Ok(())
    }

    fn check_active(&self) -> Result<()> {
        self.check()?;
        if self.state() != QueueState::Active {
            return Err(RuntimeError::InvalidQueue(self.handle.to_raw()));
        }
        Ok(())
    }

    // ============================================================================================
    // Index operations
    // ============================================================================================

    pub fn load_read_index(&self, order: MemoryOrder) -> Result<u64> {
        self.check()?;
        Ok(self.ring.load_read_index(order.for_load()?))
    }

    /// Consumer side: publish how far the ring has been consumed.
    pub fn store_read_index(&self, value: u64, order: MemoryOrder) -> Result<()> {
        self.check()?;
        self.ring.store_read_index(value, order.for_store()?);
        Ok(())
    }

    pub fn load_write_index(&self, order: MemoryOrder) -> Result<u64> {
        self.check()?;
        Ok(self.ring.load_write_index(order.for_load()?))
    }

    pub fn store_write_index(&self, value: u64, order: MemoryOrder) -> Result<()> {
        self.check_active()?;
        self.ring.store_write_index(value, order.for_store()?);
        Ok(())
    }

    /// Returns the observed write index; the swap happened iff it equals
    /// `expected`.
    pub fn compare_and_swap_write_index(&self, expected: u64, value: u64, order: MemoryOrder) -> Result<u64> {
        self.check_active()?;
        Ok(self.ring.compare_and_swap_write_index(expected, value, order.for_rmw()))
    }

    /// Advance the write index by `count`; returns the previous value, the
    /// first index of the reserved range.
    pub fn add_write_index(&self, count: u64, order: MemoryOrder) -> Result<u64> {
        self.check_active()?;
        Ok(self.ring.add_write_index(count, order.for_rmw()))
    }

    // ============================================================================================
    // Producer helpers
    // ============================================================================================

    /// Reserve `count` contiguous slots and wait until all of them are free.
    pub fn reserve(&self, count: u64) -> Result<u64> {
        if count == 0 || count > self.size() as u64 {
            return Err(RuntimeError::invalid_argument(format!(
                "cannot reserve {count} slots in a queue of {}",
                self.size()
            )));
        }
        let index = self.add_write_index(count, MemoryOrder::Relaxed)?;
        let last = index + count - 1;
        let mut spins = 0u32;
        while self.ring.is_full_at(last) {
            if self.state() != QueueState::Active {
                return Err(RuntimeError::InvalidQueue(self.handle.to_raw()));
            }
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        Ok(index)
    }

    fn write_body<T: PacketBody>(&self, index: u64, body: &T) -> Result<()> {
        self.check()?;
        self.ring.slot(index).write(&AqlPacket::from_body(body));
        Ok(())
    }

    /// Fill the body of a reserved slot. The header word is left untouched.
    pub fn write_dispatch(&self, index: u64, packet: &KernelDispatchPacket) -> Result<()> {
        self.write_body(index, packet)
    }

    pub fn write_barrier_and(&self, index: u64, packet: &BarrierAndPacket) -> Result<()> {
        self.write_body(index, packet)
    }

    pub fn write_barrier_or(&self, index: u64, packet: &BarrierOrPacket) -> Result<()> {
        self.write_body(index, packet)
    }

    pub fn write_agent_dispatch(&self, index: u64, packet: &AgentDispatchPacket) -> Result<()> {
        self.write_body(index, packet)
    }

    /// Release-store the header word of `index`, handing the slot to the
    /// consumer.
    pub fn publish(&self, index: u64, header: PacketHeader, rest: u16) -> Result<()> {
        self.check()?;
        self.ring.slot(index).publish(header, rest);
        Ok(())
    }

    /// Store `index` into the doorbell with release ordering.
    pub fn ring_doorbell(&self, index: u64) -> Result<()> {
        self.check()?;
        self.doorbell.store(index as i64, MemoryOrder::Release)
    }

    /// Submit one kernel dispatch; returns its packet index.
    pub fn dispatch(&self, packet: &KernelDispatchPacket) -> Result<u64> {
        let index = self.reserve(1)?;
        self.write_dispatch(index, packet)?;
        self.publish(index, PacketHeader::new(PacketType::KernelDispatch), packet.setup)?;
        self.ring_doorbell(index)?;
        Ok(index)
    }

    /// Submit a barrier that completes once every signal in `deps` reads 0.
    pub fn barrier_and(&self, deps: &[SignalHandle], completion: Option<SignalHandle>) -> Result<u64> {
        if deps.len() > BARRIER_DEP_SIGNALS {
            return Err(RuntimeError::invalid_argument(format!(
                "a barrier takes at most {BARRIER_DEP_SIGNALS} dependencies, got {}",
                deps.len()
            )));
        }
        let mut packet = BarrierAndPacket {
            completion_signal: completion.map_or(0, Handle::to_raw),
            ..Default::default()
        };
        for (slot, dep) in packet.dep_signal.iter_mut().zip(deps) {
            *slot = dep.to_raw();
        }
        let index = self.reserve(1)?;
        self.write_barrier_and(index, &packet)?;
        self.publish(index, PacketHeader::new(PacketType::BarrierAnd).with_barrier(true), 0)?;
        self.ring_doorbell(index)?;
        Ok(index)
    }

    // ============================================================================================
    // Lifecycle
    // ============================================================================================

    /// Consumer for a soft queue. Hardware queues already have one.
    pub fn consumer(self: &Arc<Self>) -> Result<QueueConsumer> {
        self.check()?;
        if !self.is_soft() {
            return Err(RuntimeError::invalid_argument(format!(
                "queue {} is consumed by a command processor",
                self.id
            )));
        }
        Ok(QueueConsumer::new(Arc::clone(self)))
    }

    /// Stop accepting reservations. Idempotent.
    pub(crate) fn inactivate(&self) -> Result<()> {
        self.check()?;
        let _ = self.state.compare_exchange(
            QueueState::Active as u8,
            QueueState::Inactive as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.check()
    }

    pub(crate) fn mark_destroyed(&self) {
        self.state.store(QueueState::Destroyed as u8, Ordering::Release);
    }

    /// Inactivate after a packet failure and tell the application.
    pub(crate) fn report_error(&self, error: &RuntimeError) {
        let _ = self.state.compare_exchange(
            QueueState::Active as u8,
            QueueState::Inactive as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tracing::warn!(queue = self.id, %error, "packet processing failed, queue inactivated");
        if let Some(callback) = &self.error_callback {
            callback(error, self.handle);
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("handle", &self.handle)
            .field("id", &self.id)
            .field("state", &self.state())
            .field("type", &self.queue_type)
            .field("ring", &self.ring)
            .finish_non_exhaustive()
    }
}
