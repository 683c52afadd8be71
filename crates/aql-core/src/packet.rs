//! Bit-exact AQL packet layouts
//!
//! Every packet occupies one 64-byte slot of a queue ring. The first 32 bits of
//! every slot are the *header word*: a 16-bit header (packet type, barrier bit,
//! fence scopes) followed by 16 bits whose meaning depends on the packet type
//! (dispatch setup, agent function type, or reserved).
//!
//! ```text
//! byte  0        2        4                                        64
//!       ┌────────┬────────┬─────────────────────────────────────────┐
//!       │ header │ setup  │ body (written before the header word)   │
//!       └────────┴────────┴─────────────────────────────────────────┘
//!         ▲ stored last, with release ordering, to publish the packet
//! ```
//!
//! Producers write the body first and publish the header word last; a consumer
//! that observes a valid packet type with acquire ordering therefore sees the
//! whole body.

use crate::constants::*;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

// ================================================================================================
// Header
// ================================================================================================

/// Packet type stored in the low byte of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    VendorSpecific = 0,
    /// Slot reserved but not yet published; consumers must wait on it.
    Invalid = 1,
    KernelDispatch = 2,
    BarrierAnd = 3,
    AgentDispatch = 4,
    BarrierOr = 5,
}

impl PacketType {
    /// Decode a raw packet type, returning the raw value when it is unknown.
    pub const fn from_raw(raw: u8) -> Result<Self, u8> {
        match raw {
            0 => Ok(Self::VendorSpecific),
            1 => Ok(Self::Invalid),
            2 => Ok(Self::KernelDispatch),
            3 => Ok(Self::BarrierAnd),
            4 => Ok(Self::AgentDispatch),
            5 => Ok(Self::BarrierOr),
            other => Err(other),
        }
    }
}

/// Memory fence scope applied when a packet is launched or completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum FenceScope {
    None = 0,
    Agent = 1,
    #[default]
    System = 2,
}

impl FenceScope {
    const fn from_bits(bits: u16) -> Self {
        match bits {
            0 => Self::None,
            1 => Self::Agent,
            // 3 is reserved and treated as the strongest scope
            _ => Self::System,
        }
    }
}

/// 16-bit packet header
///
/// # Example
///
/// ```rust
/// use aql_core::{FenceScope, PacketHeader, PacketType};
///
/// let header = PacketHeader::new(PacketType::KernelDispatch)
///     .with_barrier(true)
///     .with_acquire_fence(FenceScope::Agent);
/// assert_eq!(header.packet_type(), Ok(PacketType::KernelDispatch));
/// assert!(header.barrier());
/// assert_eq!(header.acquire_fence(), FenceScope::Agent);
/// assert_eq!(header.release_fence(), FenceScope::System);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct PacketHeader(pub u16);

impl PacketHeader {
    const TYPE_MASK: u16 = (1 << HEADER_TYPE_WIDTH) - 1;
    const FENCE_MASK: u16 = (1 << HEADER_FENCE_WIDTH) - 1;

    /// Header of the given type with system-scope fences on both sides.
    pub const fn new(ty: PacketType) -> Self {
        let bits = ((ty as u16) << HEADER_TYPE_SHIFT)
            | ((FenceScope::System as u16) << HEADER_ACQUIRE_FENCE_SHIFT)
            | ((FenceScope::System as u16) << HEADER_RELEASE_FENCE_SHIFT);
        Self(bits)
    }

    /// Header that marks a slot as reserved-but-unpublished.
    pub const fn invalid() -> Self {
        Self((PacketType::Invalid as u16) << HEADER_TYPE_SHIFT)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn with_barrier(self, barrier: bool) -> Self {
        let cleared = self.0 & !(1 << HEADER_BARRIER_SHIFT);
        Self(cleared | ((barrier as u16) << HEADER_BARRIER_SHIFT))
    }

    pub const fn with_acquire_fence(self, scope: FenceScope) -> Self {
        let cleared = self.0 & !(Self::FENCE_MASK << HEADER_ACQUIRE_FENCE_SHIFT);
        Self(cleared | ((scope as u16) << HEADER_ACQUIRE_FENCE_SHIFT))
    }

    pub const fn with_release_fence(self, scope: FenceScope) -> Self {
        let cleared = self.0 & !(Self::FENCE_MASK << HEADER_RELEASE_FENCE_SHIFT);
        Self(cleared | ((scope as u16) << HEADER_RELEASE_FENCE_SHIFT))
    }

    /// Decoded packet type; `Err` carries an unknown raw type.
    pub const fn packet_type(self) -> Result<PacketType, u8> {
        PacketType::from_raw(((self.0 >> HEADER_TYPE_SHIFT) & Self::TYPE_MASK) as u8)
    }

    /// True while the slot has not been published.
    pub const fn is_invalid(self) -> bool {
        ((self.0 >> HEADER_TYPE_SHIFT) & Self::TYPE_MASK) == PacketType::Invalid as u16
    }

    pub const fn barrier(self) -> bool {
        (self.0 >> HEADER_BARRIER_SHIFT) & 1 == 1
    }

    pub const fn acquire_fence(self) -> FenceScope {
        FenceScope::from_bits((self.0 >> HEADER_ACQUIRE_FENCE_SHIFT) & Self::FENCE_MASK)
    }

    pub const fn release_fence(self) -> FenceScope {
        FenceScope::from_bits((self.0 >> HEADER_RELEASE_FENCE_SHIFT) & Self::FENCE_MASK)
    }
}

impl fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHeader")
            .field("type", &self.packet_type())
            .field("barrier", &self.barrier())
            .field("acquire", &self.acquire_fence())
            .field("release", &self.release_fence())
            .finish()
    }
}

/// Combine a header and its 16-bit companion field into the header word.
pub const fn header_word(header: PacketHeader, rest: u16) -> u32 {
    header.0 as u32 | ((rest as u32) << 16)
}

/// Split a header word into header and companion field.
pub const fn split_header_word(word: u32) -> (PacketHeader, u16) {
    (PacketHeader(word as u16), (word >> 16) as u16)
}

/// Setup field of a kernel dispatch packet for a grid of `dimensions` (1–3).
pub const fn dispatch_setup(dimensions: u8) -> u16 {
    ((dimensions as u16) & ((1 << SETUP_DIMENSIONS_WIDTH) - 1)) << SETUP_DIMENSIONS_SHIFT
}

/// Dimension count encoded in a dispatch setup field.
pub const fn setup_dimensions(setup: u16) -> u8 {
    ((setup >> SETUP_DIMENSIONS_SHIFT) & ((1 << SETUP_DIMENSIONS_WIDTH) - 1)) as u8
}

// ================================================================================================
// Packet bodies
// ================================================================================================

/// A typed packet layout that fits exactly one slot
pub trait PacketBody: Pod {
    /// Packet type published in the header for this layout.
    const TYPE: PacketType;
}

/// Kernel dispatch packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct KernelDispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub reserved2: u64,
    pub completion_signal: u64,
}

impl KernelDispatchPacket {
    /// Workgroup size per dimension.
    pub const fn workgroup_size(&self) -> [u16; 3] {
        [self.workgroup_size_x, self.workgroup_size_y, self.workgroup_size_z]
    }

    /// Grid size per dimension.
    pub const fn grid_size(&self) -> [u32; 3] {
        [self.grid_size_x, self.grid_size_y, self.grid_size_z]
    }

    /// Dimension count from the setup field.
    pub const fn dimensions(&self) -> u8 {
        setup_dimensions(self.setup)
    }
}

impl PacketBody for KernelDispatchPacket {
    const TYPE: PacketType = PacketType::KernelDispatch;
}

/// Agent dispatch packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct AgentDispatchPacket {
    pub header: u16,
    pub function_type: u16,
    pub reserved0: u32,
    pub return_address: u64,
    pub arg: [u64; AGENT_DISPATCH_ARGS],
    pub reserved2: u64,
    pub completion_signal: u64,
}

impl PacketBody for AgentDispatchPacket {
    const TYPE: PacketType = PacketType::AgentDispatch;
}

/// Barrier-AND packet: completes once every non-zero dependency signal reads 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct BarrierAndPacket {
    pub header: u16,
    pub reserved0: u16,
    pub reserved1: u32,
    pub dep_signal: [u64; BARRIER_DEP_SIGNALS],
    pub reserved2: u64,
    pub completion_signal: u64,
}

impl PacketBody for BarrierAndPacket {
    const TYPE: PacketType = PacketType::BarrierAnd;
}

/// Barrier-OR packet: completes once any non-zero dependency signal reads 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct BarrierOrPacket {
    pub header: u16,
    pub reserved0: u16,
    pub reserved1: u32,
    pub dep_signal: [u64; BARRIER_DEP_SIGNALS],
    pub reserved2: u64,
    pub completion_signal: u64,
}

impl PacketBody for BarrierOrPacket {
    const TYPE: PacketType = PacketType::BarrierOr;
}

const _: () = assert!(std::mem::size_of::<KernelDispatchPacket>() == PACKET_SIZE);
const _: () = assert!(std::mem::size_of::<AgentDispatchPacket>() == PACKET_SIZE);
const _: () = assert!(std::mem::size_of::<BarrierAndPacket>() == PACKET_SIZE);
const _: () = assert!(std::mem::size_of::<BarrierOrPacket>() == PACKET_SIZE);

// ================================================================================================
// Raw slot
// ================================================================================================

/// Untyped, slot-aligned packet storage
///
/// This is the element type of a queue ring. Typed packets are converted to and
/// from it with [`AqlPacket::from_body`] and [`AqlPacket::body`].
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct AqlPacket {
    bytes: [u8; PACKET_SIZE],
}

// SAFETY: a single byte array field, size equals alignment, so there is no padding
// and every bit pattern is valid.
unsafe impl Zeroable for AqlPacket {}
unsafe impl Pod for AqlPacket {}

const _: () = assert!(std::mem::size_of::<AqlPacket>() == PACKET_SIZE);
const _: () = assert!(std::mem::align_of::<AqlPacket>() == PACKET_ALIGN);

impl AqlPacket {
    /// A slot holding an INVALID header and a zeroed body.
    pub fn invalid() -> Self {
        let mut packet = Self::zeroed();
        packet.bytes[..2].copy_from_slice(&PacketHeader::invalid().bits().to_le_bytes());
        packet
    }

    /// Copy a typed body into slot storage.
    pub fn from_body<T: PacketBody>(body: &T) -> Self {
        let mut packet = Self::zeroed();
        packet.bytes.copy_from_slice(bytemuck::bytes_of(body));
        packet
    }

    /// Reinterpret the slot as a typed body.
    pub fn body<T: PacketBody>(&self) -> T {
        bytemuck::pod_read_unaligned(&self.bytes)
    }

    /// Header word (header + companion field) as stored in the first 4 bytes.
    pub fn header_word(&self) -> u32 {
        u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    pub fn header(&self) -> PacketHeader {
        split_header_word(self.header_word()).0
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.bytes
    }
}

/// Element type of a queue ring
///
/// Implementors are plain-old-data whose first four bytes hold the header word,
/// so a ring can publish and retire slots with a single 32-bit atomic store.
pub trait Packet: Pod + Send + Sync {
    /// Slot contents before a producer publishes into it.
    fn invalid() -> Self;
}

impl Packet for AqlPacket {
    fn invalid() -> Self {
        AqlPacket::invalid()
    }
}

impl Default for AqlPacket {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Debug for AqlPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AqlPacket").field("header", &self.header()).finish_non_exhaustive()
    }
}

// ================================================================================================
// Tests
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_dispatch_packet_offsets() {
        assert_eq!(offset_of!(KernelDispatchPacket, setup), 2);
        assert_eq!(offset_of!(KernelDispatchPacket, workgroup_size_x), 4);
        assert_eq!(offset_of!(KernelDispatchPacket, grid_size_x), 12);
        assert_eq!(offset_of!(KernelDispatchPacket, private_segment_size), 24);
        assert_eq!(offset_of!(KernelDispatchPacket, group_segment_size), 28);
        assert_eq!(offset_of!(KernelDispatchPacket, kernel_object), 32);
        assert_eq!(offset_of!(KernelDispatchPacket, kernarg_address), 40);
        assert_eq!(offset_of!(KernelDispatchPacket, completion_signal), 56);
    }

    #[test]
    fn test_barrier_packet_offsets() {
        assert_eq!(offset_of!(BarrierAndPacket, dep_signal), 8);
        assert_eq!(offset_of!(BarrierAndPacket, completion_signal), 56);
        assert_eq!(offset_of!(BarrierOrPacket, dep_signal), 8);
        assert_eq!(offset_of!(AgentDispatchPacket, return_address), 8);
        assert_eq!(offset_of!(AgentDispatchPacket, completion_signal), 56);
    }

    #[test]
    fn test_invalid_header() {
        let header = PacketHeader::invalid();
        assert!(header.is_invalid());
        assert_eq!(header.packet_type(), Ok(PacketType::Invalid));
        assert!(AqlPacket::invalid().header().is_invalid());
    }

    #[test]
    fn test_unknown_packet_type() {
        assert_eq!(PacketHeader::from_bits(0x00ff).packet_type(), Err(0xff));
    }

    #[test]
    fn test_header_word_layout() {
        let header = PacketHeader::new(PacketType::KernelDispatch);
        let word = header_word(header, dispatch_setup(3));
        assert_eq!(word & 0xffff, header.bits() as u32);
        assert_eq!(word >> 16, 3);

        let (decoded, setup) = split_header_word(word);
        assert_eq!(decoded, header);
        assert_eq!(setup_dimensions(setup), 3);
    }

    #[test]
    fn test_body_through_slot() {
        let dispatch = KernelDispatchPacket {
            workgroup_size_x: 64,
            grid_size_x: 1024,
            kernel_object: 0xdead_beef,
            completion_signal: 7,
            ..Default::default()
        };
        let slot = AqlPacket::from_body(&dispatch);
        let back: KernelDispatchPacket = slot.body();
        assert_eq!(back, dispatch);
        assert_eq!(back.workgroup_size(), [64, 0, 0]);
    }

    #[test]
    fn test_fence_builder_replaces_previous_scope() {
        let header = PacketHeader::new(PacketType::BarrierAnd)
            .with_release_fence(FenceScope::None)
            .with_release_fence(FenceScope::Agent)
            .with_barrier(true)
            .with_barrier(false);
        assert_eq!(header.release_fence(), FenceScope::Agent);
        assert!(!header.barrier());
        assert_eq!(header.packet_type(), Ok(PacketType::BarrierAnd));
    }
}
