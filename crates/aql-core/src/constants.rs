//! Constants shared by producers, consumers and the runtime

/// Size of every packet slot in a queue ring, in bytes.
pub const PACKET_SIZE: usize = 64;

/// Alignment of every packet slot (and of a ring's base address).
pub const PACKET_ALIGN: usize = 64;

/// Bit offset of the packet type within the header.
pub const HEADER_TYPE_SHIFT: u16 = 0;

/// Width in bits of the packet type field.
pub const HEADER_TYPE_WIDTH: u16 = 8;

/// Bit offset of the barrier flag within the header.
pub const HEADER_BARRIER_SHIFT: u16 = 8;

/// Bit offset of the acquire fence scope within the header.
pub const HEADER_ACQUIRE_FENCE_SHIFT: u16 = 9;

/// Bit offset of the release fence scope within the header.
pub const HEADER_RELEASE_FENCE_SHIFT: u16 = 11;

/// Width in bits of each fence scope field.
pub const HEADER_FENCE_WIDTH: u16 = 2;

/// Bit offset of the dimension count within a dispatch packet's setup field.
pub const SETUP_DIMENSIONS_SHIFT: u16 = 0;

/// Width in bits of the dimension count.
pub const SETUP_DIMENSIONS_WIDTH: u16 = 2;

/// Largest kernarg segment alignment a kernel symbol may declare.
pub const KERNARG_MAX_ALIGN: u32 = 16;

/// Number of dependency signals carried by a barrier packet.
pub const BARRIER_DEP_SIGNALS: usize = 5;

/// Number of 64-bit arguments carried by an agent dispatch packet.
pub const AGENT_DISPATCH_ARGS: usize = 4;

/// System timestamp ticks per second (one tick per nanosecond).
pub const TIMESTAMP_FREQUENCY: u64 = 1_000_000_000;

/// Absolute timeout that never expires.
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Runtime API version implemented by this workspace (major, minor).
pub const API_VERSION: (u16, u16) = (1, 2);
