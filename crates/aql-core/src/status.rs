//! Status codes
//!
//! Numeric values follow the published HSA status numbering so that results can
//! be compared against conformance expectations written in terms of raw codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a runtime operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Status {
    Success = 0x0,
    InfoBreak = 0x1,
    Error = 0x1000,
    InvalidArgument = 0x1001,
    InvalidQueueCreation = 0x1002,
    InvalidAllocation = 0x1003,
    InvalidAgent = 0x1004,
    InvalidRegion = 0x1005,
    InvalidSignal = 0x1006,
    InvalidQueue = 0x1007,
    OutOfResources = 0x1008,
    InvalidPacketFormat = 0x1009,
    ResourceFree = 0x100A,
    NotInitialized = 0x100B,
    RefcountOverflow = 0x100C,
    IncompatibleArguments = 0x100D,
    InvalidIndex = 0x100E,
    InvalidIsa = 0x100F,
    InvalidCodeObject = 0x1010,
    InvalidExecutable = 0x1011,
    FrozenExecutable = 0x1012,
    InvalidSymbolName = 0x1013,
}

impl Status {
    /// Raw numeric code.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// True for `Success` and informational codes.
    pub const fn is_success(self) -> bool {
        (self as u32) < 0x1000
    }

    /// Short, stable identifier used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::InfoBreak => "INFO_BREAK",
            Self::Error => "ERROR",
            Self::InvalidArgument => "ERROR_INVALID_ARGUMENT",
            Self::InvalidQueueCreation => "ERROR_INVALID_QUEUE_CREATION",
            Self::InvalidAllocation => "ERROR_INVALID_ALLOCATION",
            Self::InvalidAgent => "ERROR_INVALID_AGENT",
            Self::InvalidRegion => "ERROR_INVALID_REGION",
            Self::InvalidSignal => "ERROR_INVALID_SIGNAL",
            Self::InvalidQueue => "ERROR_INVALID_QUEUE",
            Self::OutOfResources => "ERROR_OUT_OF_RESOURCES",
            Self::InvalidPacketFormat => "ERROR_INVALID_PACKET_FORMAT",
            Self::ResourceFree => "ERROR_RESOURCE_FREE",
            Self::NotInitialized => "ERROR_NOT_INITIALIZED",
            Self::RefcountOverflow => "ERROR_REFCOUNT_OVERFLOW",
            Self::IncompatibleArguments => "ERROR_INCOMPATIBLE_ARGUMENTS",
            Self::InvalidIndex => "ERROR_INVALID_INDEX",
            Self::InvalidIsa => "ERROR_INVALID_ISA",
            Self::InvalidCodeObject => "ERROR_INVALID_CODE_OBJECT",
            Self::InvalidExecutable => "ERROR_INVALID_EXECUTABLE",
            Self::FrozenExecutable => "ERROR_FROZEN_EXECUTABLE",
            Self::InvalidSymbolName => "ERROR_INVALID_SYMBOL_NAME",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.name(), self.code())
    }
}
