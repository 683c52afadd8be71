//! User-mode accelerator runtime
//!
//! This crate provides:
//! - **Agents and regions**: a configurable topology of compute agents and the
//!   memory pools attached to them
//! - **Signals**: 64-bit atomic values with blocking waits
//! - **Queues**: lock-free rings of 64-byte AQL packets with a doorbell
//! - **Command processor**: one thread per hardware queue executing kernel
//!   dispatches on a shared worker pool
//! - **Executables**: host-function kernels loaded per agent and addressed by
//!   kernel object
//!
//! # Architecture
//!
//! ```text
//!   producer threads                           command processor (per queue)
//!  ┌──────────────────┐   reserve / publish   ┌─────────────────────────────┐
//!  │ write_index += n │ ────────────────────▶ │ wait doorbell ≥ read_index  │
//!  │ body, header     │      ring buffer      │ barrier / dispatch          │
//!  │ doorbell = index │ ◀──────────────────── │ completion -= 1, retire     │
//!  └──────────────────┘      read_index       └──────────────┬──────────────┘
//!                                                            │ par_iter
//!                                                            ▼
//!                                                   rayon worker pool
//! ```
//!
//! # Usage
//!
//! ```rust
//! use aql_runtime::{
//!     dispatch_setup, CodeObjectBuilder, Condition, KernelDescriptor, KernelDispatchPacket, MemoryOrder,
//!     QueueOptions, QueueType, Runtime, RuntimeConfig, WaitState,
//! };
//! use aql_runtime::constants::WAIT_FOREVER;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Runtime::open(RuntimeConfig::default())?;
//! let gpu = runtime.find_agent(|agent| agent.name() == "gpu0").ok_or("no gpu")?;
//! let system = runtime.find_region(|region| region.name() == "system").ok_or("no region")?;
//!
//! // One u32 per work item
//! let out = runtime.allocate(system.handle(), 256 * 4)?;
//! let args = runtime.allocate(system.handle(), 8)?;
//! runtime.memory_write(args, &out.address().to_le_bytes())?;
//!
//! let code = CodeObjectBuilder::new("aql-sim")
//!     .kernel(
//!         KernelDescriptor::new("fill", |item| {
//!             let base = item.kernarg().read_address().unwrap_or(0);
//!             let id = item.flat_global_id();
//!             item.memory().write(base + id * 4, id as u32 * 2);
//!         })
//!         .with_kernarg(8, 8),
//!     )
//!     .build()?;
//! let exe = runtime.executable_create()?;
//! runtime.load_code_object(exe, gpu.handle(), &code)?;
//! runtime.executable_freeze(exe)?;
//! let symbol = runtime.executable_symbol(exe, "fill", gpu.handle())?;
//!
//! let queue = runtime.queue_create(gpu.handle(), 64, QueueType::Multi, QueueOptions::default())?;
//! let done = runtime.signal_create(1, 0, &[])?;
//! queue.dispatch(&KernelDispatchPacket {
//!     setup: dispatch_setup(1),
//!     workgroup_size_x: 64,
//!     workgroup_size_y: 1,
//!     workgroup_size_z: 1,
//!     grid_size_x: 256,
//!     grid_size_y: 1,
//!     grid_size_z: 1,
//!     kernel_object: symbol.kernel_object,
//!     kernarg_address: args.address(),
//!     completion_signal: done.to_raw(),
//!     ..Default::default()
//! })?;
//! runtime.signal_wait(done, Condition::Eq, 0, WAIT_FOREVER, WaitState::Blocked)?;
//!
//! let bytes = runtime.memory_read(out.offset(4 * 10), 4)?;
//! assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 20);
//! runtime.shut_down()?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod executable;
pub mod handle;
pub mod memory;
pub mod order;
mod processor;
pub mod queue;
pub mod region;
pub mod runtime;
mod shared;
pub mod signal;

pub use agent::{Agent, AgentHandle, AgentInfo, AgentIter, AgentRegionIter, DeviceType, QueueType};
pub use config::{ConfigError, RegionConfig, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use executable::{
    CodeObject, CodeObjectBuilder, Executable, ExecutableHandle, KernelDescriptor, KernelFn, SymbolInfo, SymbolIter,
    WorkItem,
};
pub use handle::Handle;
pub use memory::{AccessPermission, AllocationInfo, DevicePtr, GlobalMemory};
pub use order::MemoryOrder;
pub use queue::{
    ErrorCallback, PacketSlot, PacketView, ProcessResult, Queue, QueueConsumer, QueueHandle, QueueState, RingBuffer,
};
pub use region::{GlobalFlags, Region, RegionHandle, RegionInfo, Segment};
pub use runtime::{QueueOptions, Runtime};
pub use signal::{Condition, Signal, SignalHandle, SignalValue, WaitState};

pub use aql_core::{
    constants, dispatch_setup, header_word, split_header_word, AgentDispatchPacket, AqlPacket, BarrierAndPacket,
    BarrierOrPacket, FenceScope, Features, KernargBuilder, KernargError, KernargReader, KernelDispatchPacket, Packet,
    PacketBody, PacketHeader, PacketType, Status,
};
