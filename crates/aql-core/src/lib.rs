//! # aql-core - Packet ABI for the AQL runtime
//!
//! Bit-exact definitions shared by producers, consumers and kernels:
//!
//! - [`packet`] - 64-byte packet layouts, header encoding and ring slot storage
//! - [`status`] - numeric status codes
//! - [`features`] - dispatch feature masks for agents and queues
//! - [`kernarg`] - kernel argument segment marshalling
//! - [`constants`] - field widths, sizes and timing constants
//!
//! This crate holds no runtime state. Everything here is plain data that can be
//! written into device-visible memory as-is.

pub mod constants;
pub mod features;
pub mod kernarg;
pub mod packet;
pub mod status;

pub use features::Features;
pub use kernarg::{KernargBuilder, KernargError, KernargReader};
pub use packet::{
    dispatch_setup, header_word, setup_dimensions, split_header_word, AgentDispatchPacket, AqlPacket,
    BarrierAndPacket, BarrierOrPacket, FenceScope, KernelDispatchPacket, Packet, PacketBody, PacketHeader,
    PacketType,
};
pub use status::Status;
