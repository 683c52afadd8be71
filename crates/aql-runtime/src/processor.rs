//! Software command processor
//!
//! Each hardware queue of a kernel-dispatch agent gets one host thread that
//! plays the role of the device's packet processor. It consumes the ring in
//! strict index order:
//!
//! ```text
//! loop:
//!   header(read_index) == INVALID  -> wait on the doorbell, retry
//!   KERNEL_DISPATCH                -> run workgroups on the worker pool
//!   BARRIER_AND / BARRIER_OR       -> wait on dependency signals
//!   anything else                  -> error callback, queue INACTIVE, stop
//!   completion_signal -= 1 (release), slot := INVALID, read_index += 1
//! ```
//!
//! An unpublished slot stalls the processor even if later slots are already
//! published, which is what makes producer gaps safe.

use crate::error::{Result, RuntimeError};
use crate::executable::{KernelDescriptor, KernelTable, WorkItem};
use crate::handle::{Arena, Handle};
use crate::memory::{DevicePtr, MemoryManager};
use crate::order::MemoryOrder;
use crate::queue::{Queue, QueueState};
use crate::signal::{Condition, Signal, WaitState};
use aql_core::{
    setup_dimensions, split_header_word, BarrierAndPacket, BarrierOrPacket, FenceScope, KernelDispatchPacket,
    PacketHeader, PacketType,
};
use aql_tracing::perf_span;
use aql_tracing::performance::{micros, record_dispatch};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Everything a processor needs besides its queue
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub(crate) signals: Arc<Arena<Signal>>,
    pub(crate) memory: Arc<MemoryManager>,
    pub(crate) kernels: Arc<KernelTable>,
    pub(crate) pool: Arc<ThreadPool>,
    /// Upper bound on a single doorbell or dependency wait.
    pub(crate) poll: Duration,
}

/// Processor thread of one hardware queue
pub(crate) struct CommandProcessor {
    queue_id: u64,
    thread: Option<JoinHandle<()>>,
}

impl CommandProcessor {
    pub(crate) fn spawn(queue: Arc<Queue>, ctx: DispatchContext) -> Result<Self> {
        let queue_id = queue.id();
        let thread = std::thread::Builder::new()
            .name(format!("aql-cp-{queue_id}"))
            .spawn(move || run(&queue, &ctx))
            .map_err(|e| RuntimeError::out_of_resources(format!("command processor thread: {e}")))?;
        Ok(Self {
            queue_id,
            thread: Some(thread),
        })
    }

    /// Wait for the thread to exit. The queue must already be destroyed.
    pub(crate) fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(queue = self.queue_id, "command processor panicked");
            }
        }
    }
}

enum Step {
    Complete(Option<Arc<Signal>>),
    Stop,
}

fn run(queue: &Queue, ctx: &DispatchContext) {
    tracing::debug!(queue = queue.id(), "command processor started");
    let ring = queue.ring();
    let mut index = ring.load_read_index(Ordering::Acquire);

    while queue.state() != QueueState::Destroyed {
        let (header, rest) = split_header_word(ring.header_word(index, Ordering::Acquire));
        if header.is_invalid() {
            // Inactive queues drain what was published, then stop
            if queue.state() != QueueState::Active || wait_doorbell(queue, ctx, index).is_err() {
                break;
            }
            continue;
        }

        let completion = match process(queue, ctx, index, header, rest) {
            Ok(Step::Complete(completion)) => completion,
            Ok(Step::Stop) => break,
            Err(error) => {
                queue.report_error(&error);
                break;
            }
        };

        if header.release_fence() != FenceScope::None {
            fence(Ordering::Release);
        }
        if let Some(signal) = completion {
            if let Err(error) = signal.subtract(1, MemoryOrder::Release) {
                queue.report_error(&error);
                break;
            }
        }
        ring.retire(index);
        ring.store_read_index(index + 1, Ordering::Release);
        index += 1;
    }
    tracing::debug!(queue = queue.id(), read_index = index, "command processor stopped");
}

fn wait_doorbell(queue: &Queue, ctx: &DispatchContext, index: u64) -> Result<()> {
    let doorbell = queue.doorbell();
    let rung = doorbell.wait(Condition::Gte, index as i64, queue.deadline_after(ctx.poll), WaitState::Blocked)?;
    if rung >= index as i64 {
        // Doorbell is ahead of an unpublished slot: a producer gap
        std::thread::yield_now();
    }
    Ok(())
}

fn process(queue: &Queue, ctx: &DispatchContext, index: u64, header: PacketHeader, rest: u16) -> Result<Step> {
    tracing::trace!(queue = queue.id(), index, ?header, "packet");
    match header.packet_type() {
        Ok(PacketType::KernelDispatch) => dispatch(queue, ctx, index, rest),
        Ok(PacketType::BarrierAnd) => {
            let packet: BarrierAndPacket = queue.ring().read(index).body();
            let completion = completion_signal(ctx, packet.completion_signal)?;
            barrier(queue, ctx, &packet.dep_signal, true).map(|done| step(done, completion))
        }
        Ok(PacketType::BarrierOr) => {
            let packet: BarrierOrPacket = queue.ring().read(index).body();
            let completion = completion_signal(ctx, packet.completion_signal)?;
            barrier(queue, ctx, &packet.dep_signal, false).map(|done| step(done, completion))
        }
        Ok(other) => Err(RuntimeError::invalid_packet(
            index,
            format!("{other:?} packets are not supported by this queue"),
        )),
        Err(raw) => Err(RuntimeError::invalid_packet(index, format!("unknown packet type {raw}"))),
    }
}

fn step(done: bool, completion: Option<Arc<Signal>>) -> Step {
    if done {
        Step::Complete(completion)
    } else {
        Step::Stop
    }
}

fn completion_signal(ctx: &DispatchContext, raw: u64) -> Result<Option<Arc<Signal>>> {
    if raw == 0 {
        return Ok(None);
    }
    ctx.signals
        .get(Handle::from_raw(raw))
        .map(Some)
        .ok_or(RuntimeError::InvalidSignal(raw))
}

// ================================================================================================
// Barriers
// ================================================================================================

/// Wait for all (`and`) or any dependency to reach 0. Returns false if the
/// queue was destroyed while waiting.
fn barrier(queue: &Queue, ctx: &DispatchContext, deps: &[u64], and: bool) -> Result<bool> {
    let signals = deps
        .iter()
        .filter(|&&raw| raw != 0)
        .map(|&raw| ctx.signals.get(Handle::from_raw(raw)).ok_or(RuntimeError::InvalidSignal(raw)))
        .collect::<Result<Vec<_>>>()?;
    if signals.is_empty() {
        return Ok(true);
    }

    loop {
        if queue.state() == QueueState::Destroyed {
            return Ok(false);
        }
        let mut pending = None;
        let mut satisfied = 0;
        for signal in &signals {
            if signal.load(MemoryOrder::Acquire)? == 0 {
                satisfied += 1;
            } else if pending.is_none() {
                pending = Some(signal);
            }
        }
        let done = if and { satisfied == signals.len() } else { satisfied > 0 };
        match pending {
            Some(signal) if !done => {
                signal.wait(Condition::Eq, 0, queue.deadline_after(ctx.poll), WaitState::Blocked)?;
            }
            _ => return Ok(true),
        }
    }
}

// ================================================================================================
// Kernel dispatch
// ================================================================================================

struct Launch<'a> {
    kernel: &'a KernelDescriptor,
    kernarg: &'a [u8],
    memory: &'a MemoryManager,
    groups: [u32; 3],
    workgroup: [u16; 3],
    grid: [u32; 3],
    group_bytes: usize,
    private_bytes: usize,
}

fn dispatch(queue: &Queue, ctx: &DispatchContext, index: u64, setup: u16) -> Result<Step> {
    let packet: KernelDispatchPacket = queue.ring().read(index).body();
    let completion = completion_signal(ctx, packet.completion_signal)?;
    let workgroup = packet.workgroup_size();
    let grid = packet.grid_size();

    // An empty grid completes without running anything
    if workgroup.contains(&0) || grid.contains(&0) {
        tracing::trace!(queue = queue.id(), index, ?workgroup, ?grid, "empty dispatch");
        return Ok(Step::Complete(completion));
    }

    let dimensions = setup_dimensions(setup);
    if !(1..=3).contains(&dimensions) {
        return Err(RuntimeError::invalid_packet(index, format!("{dimensions} grid dimensions")));
    }
    let kernel = ctx.kernels.get(packet.kernel_object).ok_or_else(|| {
        RuntimeError::invalid_packet(index, format!("unknown kernel object {:#x}", packet.kernel_object))
    })?;
    if let Some(agent) = queue.owner() {
        let info = agent.info();
        let items: u32 = workgroup.iter().map(|&d| u32::from(d)).product();
        let too_wide = workgroup.iter().zip(info.workgroup_max_dim).any(|(&d, max)| d > max);
        if items > info.workgroup_max_size || too_wide {
            return Err(RuntimeError::invalid_packet(
                index,
                format!("workgroup {workgroup:?} exceeds the agent limits"),
            ));
        }
        let grid_items: u64 = grid.iter().map(|&d| u64::from(d)).product();
        let grid_too_wide = grid.iter().zip(info.grid_max_dim).any(|(&d, max)| d > max);
        if grid_items > info.grid_max_size || grid_too_wide {
            return Err(RuntimeError::invalid_packet(
                index,
                format!("grid {grid:?} exceeds the agent limits"),
            ));
        }
    }

    let kernarg = read_kernarg(ctx, index, &packet, &kernel)?;
    let launch = Launch {
        kernel: &kernel,
        kernarg: &kernarg,
        memory: &ctx.memory,
        groups: [0, 1, 2].map(|d| grid[d].div_ceil(u32::from(workgroup[d]))),
        workgroup,
        grid,
        group_bytes: packet.group_segment_size.max(kernel.group_segment_size()) as usize,
        private_bytes: packet.private_segment_size.max(kernel.private_segment_size()) as usize,
    };
    let total_groups: u64 = launch.groups.iter().map(|&g| u64::from(g)).product();
    let work_items: u64 = grid.iter().map(|&g| u64::from(g)).product();

    let start = Instant::now();
    {
        let _span = perf_span!(
            "aql_dispatch",
            kernel = kernel.name(),
            workgroups = total_groups,
            work_items = work_items
        );
        let launched = std::panic::catch_unwind(AssertUnwindSafe(|| {
            ctx.pool
                .install(|| (0..total_groups).into_par_iter().for_each(|group| run_group(&launch, group)))
        }));
        if launched.is_err() {
            return Err(RuntimeError::invalid_packet(
                index,
                format!("kernel {} panicked", kernel.name()),
            ));
        }
    }
    record_dispatch(
        packet.kernel_object,
        total_groups,
        work_items,
        micros(start),
    );
    Ok(Step::Complete(completion))
}

fn read_kernarg(
    ctx: &DispatchContext,
    index: u64,
    packet: &KernelDispatchPacket,
    kernel: &KernelDescriptor,
) -> Result<Vec<u8>> {
    let size = kernel.kernarg_segment_size() as usize;
    if size == 0 {
        return Ok(Vec::new());
    }
    let address = packet.kernarg_address;
    if address % u64::from(kernel.kernarg_segment_alignment()) != 0 {
        return Err(RuntimeError::invalid_packet(
            index,
            format!("kernarg address {address:#x} is misaligned"),
        ));
    }
    ctx.memory.read_bytes(DevicePtr::new(address), size).map_err(|_| {
        RuntimeError::invalid_packet(
            index,
            format!("kernarg segment {address:#x}+{size} is not accessible"),
        )
    })
}

/// Run every work-item of one workgroup, x fastest.
fn run_group(launch: &Launch<'_>, flat: u64) {
    let [gx, gy, _] = launch.groups.map(u64::from);
    let group_id = [
        (flat % gx) as u32,
        ((flat / gx) % gy) as u32,
        (flat / (gx * gy)) as u32,
    ];
    let mut group_segment = vec![0u8; launch.group_bytes];
    let mut private_segment = vec![0u8; launch.private_bytes];
    let [wx, wy, wz] = launch.workgroup.map(u32::from);

    for z in 0..wz {
        for y in 0..wy {
            for x in 0..wx {
                let local_id = [x, y, z];
                let global = [0, 1, 2]
                    .map(|d| u64::from(group_id[d]) * u64::from(launch.workgroup[d]) + u64::from(local_id[d]));
                // Partial workgroups at the grid edge
                if (0..3).any(|d| global[d] >= u64::from(launch.grid[d])) {
                    continue;
                }
                let global_id = global.map(|g| g as u32);
                private_segment.fill(0);
                let mut item = WorkItem {
                    global_id,
                    local_id,
                    group_id,
                    workgroup_size: launch.workgroup,
                    grid_size: launch.grid,
                    kernarg: launch.kernarg,
                    group_segment: &mut group_segment,
                    private_segment: &mut private_segment,
                    memory: launch.memory,
                };
                launch.kernel.run(&mut item);
            }
        }
    }
}
