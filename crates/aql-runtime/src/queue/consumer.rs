//! Application-side consumer for soft queues

use super::{Queue, QueueState};
use crate::error::{Result, RuntimeError};
use crate::handle::Handle;
use crate::order::MemoryOrder;
use crate::signal::{Condition, WaitState};
use aql_core::{split_header_word, AqlPacket, PacketBody, PacketHeader, PacketType};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

// Doorbell waits are bounded so that inactivation and destruction are noticed
const DOORBELL_POLL: Duration = Duration::from_millis(1);
const COMPLETION_SIGNAL_OFFSET: usize = 56;

/// What the packet handler wants to happen next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult<T> {
    Continue,
    Exit(T),
}

/// A published packet, copied out of its slot
#[derive(Debug, Clone, Copy)]
pub struct PacketView {
    index: u64,
    header: PacketHeader,
    rest: u16,
    packet: AqlPacket,
}

impl PacketView {
    /// Ring index the packet was published at.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn header(&self) -> PacketHeader {
        self.header
    }

    pub fn packet_type(&self) -> std::result::Result<PacketType, u8> {
        self.header.packet_type()
    }

    /// Companion field of the header word (dispatch setup, agent function type).
    pub fn rest(&self) -> u16 {
        self.rest
    }

    pub fn packet(&self) -> &AqlPacket {
        &self.packet
    }

    /// Typed body, if the published type matches `T`.
    pub fn body<T: PacketBody>(&self) -> Option<T> {
        (self.packet_type() == Ok(T::TYPE)).then(|| self.packet.body())
    }

    /// Raw completion signal handle; the same offset in every packet layout.
    pub fn completion_signal(&self) -> u64 {
        bytemuck::pod_read_unaligned(&self.packet.as_bytes()[COMPLETION_SIGNAL_OFFSET..])
    }
}

/// Processes a soft queue's packets in index order
///
/// For every packet the handler runs first, then the completion signal is
/// decremented, the slot is reset to INVALID and the read index advances.
#[derive(Debug)]
pub struct QueueConsumer {
    queue: Arc<Queue>,
    wait_state: WaitState,
}

impl QueueConsumer {
    pub(crate) fn new(queue: Arc<Queue>) -> Self {
        Self {
            queue,
            wait_state: WaitState::Blocked,
        }
    }

    /// How to wait on the doorbell; blocked by default.
    pub fn with_wait_state(mut self, wait_state: WaitState) -> Self {
        self.wait_state = wait_state;
        self
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Handle the next packet if it is already published.
    pub fn try_next<T>(
        &mut self,
        handler: impl FnOnce(&PacketView) -> ProcessResult<T>,
    ) -> Result<Option<ProcessResult<T>>> {
        let index = self.queue.load_read_index(MemoryOrder::Relaxed)?;
        let word = self.queue.ring().header_word(index, Ordering::Acquire);
        if split_header_word(word).0.is_invalid() {
            return Ok(None);
        }
        self.consume(index, word, handler).map(Some)
    }

    /// Handle packets until the handler returns [`ProcessResult::Exit`].
    ///
    /// Fails with `InvalidQueue` once the queue is inactive and no further
    /// packet has been published.
    pub fn process<T>(&mut self, mut handler: impl FnMut(&PacketView) -> ProcessResult<T>) -> Result<T> {
        loop {
            let index = self.queue.load_read_index(MemoryOrder::Relaxed)?;
            let word = self.wait_published(index)?;
            if let ProcessResult::Exit(value) = self.consume(index, word, &mut handler)? {
                return Ok(value);
            }
        }
    }

    fn wait_published(&self, index: u64) -> Result<u32> {
        let doorbell = self.queue.doorbell();
        loop {
            let word = self.queue.ring().header_word(index, Ordering::Acquire);
            if !split_header_word(word).0.is_invalid() {
                return Ok(word);
            }
            if self.queue.state() != QueueState::Active {
                return Err(RuntimeError::InvalidQueue(self.queue.handle().to_raw()));
            }
            let deadline = self.queue.deadline_after(DOORBELL_POLL);
            let rung = doorbell.wait(Condition::Gte, index as i64, deadline, self.wait_state)?;
            if rung >= index as i64 {
                // Rung past a slot that is still unpublished: a producer gap
                std::thread::yield_now();
            }
        }
    }

    fn consume<T>(
        &self,
        index: u64,
        word: u32,
        handler: impl FnOnce(&PacketView) -> ProcessResult<T>,
    ) -> Result<ProcessResult<T>> {
        let (header, rest) = split_header_word(word);
        let view = PacketView {
            index,
            header,
            rest,
            packet: self.queue.ring().read(index),
        };
        tracing::trace!(queue = self.queue.id(), index, ty = ?view.packet_type(), "soft packet");
        let result = handler(&view);

        // The slot is retired even when completion fails, so the packet is
        // handled exactly once
        let completed = self.complete(view.completion_signal());
        self.queue.ring().retire(index);
        self.queue.ring().store_read_index(index + 1, Ordering::Release);
        completed.map(|()| result)
    }

    fn complete(&self, completion: u64) -> Result<()> {
        if completion == 0 {
            return Ok(());
        }
        let signal = self
            .queue
            .signals()
            .get(Handle::from_raw(completion))
            .ok_or(RuntimeError::InvalidSignal(completion))?;
        signal.subtract(1, MemoryOrder::Release).map(|_| ())
    }
}
