//! Error types for runtime operations

use aql_core::Status;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors returned by runtime operations
///
/// Every variant maps onto exactly one [`Status`] code through
/// [`RuntimeError::status`], so callers that compare against raw codes keep
/// working while Rust callers get context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime that owns the object has been shut down
    #[error("runtime is not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid agent handle: {0:#x}")]
    InvalidAgent(u64),

    #[error("invalid region handle: {0:#x}")]
    InvalidRegion(u64),

    #[error("invalid signal handle: {0:#x}")]
    InvalidSignal(u64),

    #[error("invalid queue handle: {0:#x}")]
    InvalidQueue(u64),

    #[error("invalid executable handle: {0:#x}")]
    InvalidExecutable(u64),

    #[error("queue creation rejected: {0}")]
    InvalidQueueCreation(String),

    #[error("allocation rejected: {0}")]
    InvalidAllocation(String),

    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// A packet the command processor could not execute
    #[error("invalid packet at index {index}: {reason}")]
    InvalidPacket { index: u64, reason: String },

    #[error("incompatible arguments: {0}")]
    IncompatibleArguments(String),

    #[error("invalid code object: {0}")]
    InvalidCodeObject(String),

    #[error("executable is frozen")]
    FrozenExecutable,

    #[error("unknown symbol: {0}")]
    InvalidSymbolName(String),
}

impl RuntimeError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn out_of_resources(msg: impl Into<String>) -> Self {
        Self::OutOfResources(msg.into())
    }

    pub fn invalid_queue_creation(msg: impl Into<String>) -> Self {
        Self::InvalidQueueCreation(msg.into())
    }

    pub fn invalid_packet(index: u64, reason: impl Into<String>) -> Self {
        Self::InvalidPacket {
            index,
            reason: reason.into(),
        }
    }

    /// Numeric status code for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::NotInitialized => Status::NotInitialized,
            Self::InvalidArgument(_) => Status::InvalidArgument,
            Self::InvalidAgent(_) => Status::InvalidAgent,
            Self::InvalidRegion(_) => Status::InvalidRegion,
            Self::InvalidSignal(_) => Status::InvalidSignal,
            Self::InvalidQueue(_) => Status::InvalidQueue,
            Self::InvalidExecutable(_) => Status::InvalidExecutable,
            Self::InvalidQueueCreation(_) => Status::InvalidQueueCreation,
            Self::InvalidAllocation(_) => Status::InvalidAllocation,
            Self::OutOfResources(_) => Status::OutOfResources,
            Self::InvalidPacket { .. } => Status::InvalidPacketFormat,
            Self::IncompatibleArguments(_) => Status::IncompatibleArguments,
            Self::InvalidCodeObject(_) => Status::InvalidCodeObject,
            Self::FrozenExecutable => Status::FrozenExecutable,
            Self::InvalidSymbolName(_) => Status::InvalidSymbolName,
        }
    }
}
