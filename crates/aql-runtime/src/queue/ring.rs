//! Fixed-capacity packet ring
//!
//! Slots are addressed as `base + (index & (size - 1)) * size_of::<P>()`. The
//! first 32-bit word of each slot is the header word; the rest is the body.
//! All slot memory is accessed as 32-bit atomics, so a misbehaving producer
//! can corrupt packets but never cause a data race.
//!
//! Producer side: reserve an index range through the write index, fill each
//! slot with [`PacketSlot::write`], then [`PacketSlot::publish`] the header
//! word with release ordering. Consumer side: acquire-load the header, `read`
//! the slot, `retire` it back to INVALID and advance the read index.

use crate::memory::HostBlock;
use crate::order::failure_ordering;
use aql_core::constants::PACKET_ALIGN;
use aql_core::{header_word, AqlPacket, Packet, PacketHeader};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[repr(align(64))]
struct PaddedIndex(AtomicU64);

/// Lock-free ring of packet slots with embedded read and write indices
pub struct RingBuffer<P: Packet = AqlPacket> {
    storage: Arc<HostBlock>,
    size: u32,
    read_index: PaddedIndex,
    write_index: PaddedIndex,
    _marker: PhantomData<fn() -> P>,
}

impl<P: Packet> RingBuffer<P> {
    const WORDS: usize = {
        assert!(
            size_of::<P>() >= 4 && size_of::<P>() % 4 == 0,
            "packet size must be a non-zero multiple of 4 bytes"
        );
        size_of::<P>() / 4
    };

    /// Bytes of backing storage needed for `size` slots.
    pub fn storage_bytes(size: u32) -> usize {
        size as usize * size_of::<P>()
    }

    /// Ring with its own backing storage; `None` if `size` is not a power of
    /// two or the host allocator fails.
    pub fn new(size: u32) -> Option<Self> {
        if !size.is_power_of_two() {
            return None;
        }
        let storage = HostBlock::zeroed(Self::storage_bytes(size), PACKET_ALIGN.max(align_of::<P>()))?;
        Some(Self::with_storage(Arc::new(storage), size))
    }

    /// Ring over caller-provided storage of at least [`Self::storage_bytes`].
    pub(crate) fn with_storage(storage: Arc<HostBlock>, size: u32) -> Self {
        debug_assert!(size.is_power_of_two());
        let ring = Self {
            storage,
            size,
            read_index: PaddedIndex(AtomicU64::new(0)),
            write_index: PaddedIndex(AtomicU64::new(0)),
            _marker: PhantomData,
        };
        let invalid = words_of(&P::invalid());
        for index in 0..size as u64 {
            for (word, value) in invalid.iter().enumerate() {
                ring.word(index, word).store(*value, Ordering::Relaxed);
            }
        }
        std::sync::atomic::fence(Ordering::Release);
        ring
    }

    /// Number of slots (a power of two).
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Address of slot 0.
    pub fn base_address(&self) -> u64 {
        self.storage.as_ptr() as usize as u64
    }

    fn word(&self, index: u64, word: usize) -> &AtomicU32 {
        let slot = (index & (self.size as u64 - 1)) as usize;
        let offset = slot * size_of::<P>() + word * 4;
        // SAFETY: the offset lies inside the storage (slot < size, word < WORDS),
        // storage is at least 4-byte aligned and slot sizes are multiples of 4,
        // and slot memory is only ever accessed through these atomics.
        unsafe { AtomicU32::from_ptr(self.storage.as_ptr().add(offset) as *mut u32) }
    }

    // ============================================================================================
    // Indices
    // ============================================================================================

    pub fn load_read_index(&self, order: Ordering) -> u64 {
        self.read_index.0.load(order)
    }

    pub fn store_read_index(&self, value: u64, order: Ordering) {
        self.read_index.0.store(value, order)
    }

    pub fn load_write_index(&self, order: Ordering) -> u64 {
        self.write_index.0.load(order)
    }

    pub fn store_write_index(&self, value: u64, order: Ordering) {
        self.write_index.0.store(value, order)
    }

    /// Returns the observed write index; the swap happened iff it equals
    /// `expected`.
    pub fn compare_and_swap_write_index(&self, expected: u64, value: u64, order: Ordering) -> u64 {
        match self
            .write_index
            .0
            .compare_exchange(expected, value, order, failure_ordering(order))
        {
            Ok(previous) | Err(previous) => previous,
        }
    }

    /// Reserve `count` slots; returns the first reserved index.
    pub fn add_write_index(&self, count: u64, order: Ordering) -> u64 {
        self.write_index.0.fetch_add(count, order)
    }

    /// True when `index` is far enough ahead of the reader that its slot is
    /// still occupied.
    pub fn is_full_at(&self, index: u64) -> bool {
        index.wrapping_sub(self.load_read_index(Ordering::Relaxed)) >= self.size as u64
    }

    // ============================================================================================
    // Slots
    // ============================================================================================

    /// Writer for the slot of `index`.
    pub fn slot(&self, index: u64) -> PacketSlot<'_, P> {
        PacketSlot { ring: self, index }
    }

    /// Header word (header plus companion field) of `index`.
    pub fn header_word(&self, index: u64, order: Ordering) -> u32 {
        self.word(index, 0).load(order)
    }

    pub fn header(&self, index: u64, order: Ordering) -> PacketHeader {
        PacketHeader::from_bits(self.header_word(index, order) as u16)
    }

    /// Copy the whole slot out. Call after an acquire load of a published header.
    pub fn read(&self, index: u64) -> P {
        let mut packet = P::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut packet);
        for (word, chunk) in bytes.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&self.word(index, word).load(Ordering::Relaxed).to_ne_bytes());
        }
        packet
    }

    /// Return a consumed slot to INVALID with release ordering.
    pub fn retire(&self, index: u64) {
        let invalid = words_of(&P::invalid())[0];
        self.word(index, 0).store(invalid, Ordering::Release);
    }
}

fn words_of<P: Packet>(packet: &P) -> Vec<u32> {
    bytemuck::bytes_of(packet)
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

impl<P: Packet> std::fmt::Debug for RingBuffer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("size", &self.size)
            .field("read_index", &self.load_read_index(Ordering::Relaxed))
            .field("write_index", &self.load_write_index(Ordering::Relaxed))
            .finish()
    }
}

/// Exclusive writer for one reserved slot
pub struct PacketSlot<'r, P: Packet> {
    ring: &'r RingBuffer<P>,
    index: u64,
}

impl<P: Packet> PacketSlot<'_, P> {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Write every field except the header word.
    pub fn write(&self, packet: &P) {
        let words = words_of(packet);
        for (word, value) in words.iter().enumerate().skip(1).take(RingBuffer::<P>::WORDS - 1) {
            self.ring.word(self.index, word).store(*value, Ordering::Relaxed);
        }
    }

    /// Store the header word with release ordering, handing the slot to the
    /// consumer. This must be the last write to the slot.
    pub fn publish(self, header: PacketHeader, rest: u16) {
        self.ring
            .word(self.index, 0)
            .store(header_word(header, rest), Ordering::Release);
    }
}
