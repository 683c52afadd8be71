//! The runtime context
//!
//! [`Runtime`] owns every agent, region, signal, queue and executable. All
//! operations are `&self` methods, so a runtime can be shared by reference or
//! behind an `Arc`. Objects are addressed by generation-checked handles and
//! resolved to `Arc`s; hot loops resolve once and keep the `Arc`.
//!
//! ```rust
//! use aql_runtime::{MemoryOrder, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::open(RuntimeConfig::default()).unwrap();
//! let signal = runtime.signal_create(1, 0, &[]).unwrap();
//! runtime.signal_subtract(signal, 1, MemoryOrder::Release).unwrap();
//! assert_eq!(runtime.signal_load(signal, MemoryOrder::Acquire).unwrap(), 0);
//! runtime.shut_down().unwrap();
//! ```

use crate::agent::{Agent, AgentHandle, AgentIter, AgentRegionIter, QueueType};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::executable::{CodeObject, Executable, ExecutableHandle, KernelTable, SymbolInfo, SymbolIter};
use crate::handle::Arena;
use crate::memory::{AccessPermission, AllocationInfo, AllocationUse, DevicePtr, GlobalMemory, MemoryManager};
use crate::order::MemoryOrder;
use crate::processor::{CommandProcessor, DispatchContext};
use crate::queue::{ErrorCallback, Queue, QueueHandle, QueueParams, RingBuffer};
use crate::region::{Region, RegionHandle};
use crate::shared::Lifecycle;
use crate::signal::{Condition, Signal, SignalHandle, SignalValue, WaitState};
use aql_core::constants::{API_VERSION, PACKET_ALIGN, TIMESTAMP_FREQUENCY};
use aql_core::{AqlPacket, Features};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

// Kernel objects are opaque but non-zero and descriptor-aligned
const FIRST_KERNEL_OBJECT: u64 = 0x1000;
const KERNEL_OBJECT_STRIDE: u64 = 0x40;

// Value a runtime-owned doorbell starts at, below every packet index
const DOORBELL_IDLE: SignalValue = -1;

/// Optional parameters of [`Runtime::queue_create`]
#[derive(Clone, Default)]
pub struct QueueOptions {
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub error_callback: Option<ErrorCallback>,
}

impl QueueOptions {
    pub fn with_error_callback(
        mut self,
        callback: impl Fn(&RuntimeError, QueueHandle) + Send + Sync + 'static,
    ) -> Self {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_segment_sizes(mut self, private_segment_size: u32, group_segment_size: u32) -> Self {
        self.private_segment_size = private_segment_size;
        self.group_segment_size = group_segment_size;
        self
    }
}

impl fmt::Debug for QueueOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueOptions")
            .field("private_segment_size", &self.private_segment_size)
            .field("group_segment_size", &self.group_segment_size)
            .field("error_callback", &self.error_callback.is_some())
            .finish()
    }
}

/// Runtime context owning the whole object graph
pub struct Runtime {
    config: RuntimeConfig,
    lifecycle: Arc<Lifecycle>,
    shutdown: Mutex<()>,
    agents: Arena<Agent>,
    regions: Arena<Region>,
    signals: Arc<Arena<Signal>>,
    queues: Arena<Queue>,
    executables: Arena<Executable>,
    memory: Arc<MemoryManager>,
    kernels: Arc<KernelTable>,
    pool: Arc<ThreadPool>,
    processors: Mutex<HashMap<QueueHandle, CommandProcessor>>,
    next_queue_id: AtomicU64,
    next_kernel_object: AtomicU64,
    soft_queues: AtomicU32,
}

impl Runtime {
    /// Build the topology described by `config` and start the worker pool.
    #[tracing::instrument(level = "debug", skip(config), err)]
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RuntimeError::invalid_argument(e.to_string()))?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("aql-worker-{i}"))
            .build()
            .map_err(|e| RuntimeError::out_of_resources(format!("worker pool: {e}")))?;

        let lifecycle = Arc::new(Lifecycle::new());
        let agents = Arena::new();
        let mut by_name = HashMap::new();
        for info in &config.agents {
            let agent = agents.insert_with(|handle| Ok::<_, RuntimeError>(Arc::new(Agent::new(handle, info.clone()))))?;
            by_name.insert(info.name.clone(), agent.handle());
        }

        let regions = Arena::new();
        for region in &config.regions {
            let owners = region
                .owners
                .iter()
                .filter_map(|name| by_name.get(name).copied())
                .collect::<Vec<_>>();
            regions.insert_with(|handle| {
                Ok::<_, RuntimeError>(Arc::new(Region::new(handle, region.info.clone(), owners)))
            })?;
        }

        tracing::debug!(
            agents = agents.len(),
            regions = regions.len(),
            workers = pool.current_num_threads(),
            "runtime opened"
        );

        Ok(Self {
            config,
            lifecycle,
            shutdown: Mutex::new(()),
            agents,
            regions,
            signals: Arc::new(Arena::new()),
            queues: Arena::new(),
            executables: Arena::new(),
            memory: Arc::new(MemoryManager::new()),
            kernels: Arc::new(KernelTable::default()),
            pool: Arc::new(pool),
            processors: Mutex::new(HashMap::new()),
            next_queue_id: AtomicU64::new(0),
            next_kernel_object: AtomicU64::new(FIRST_KERNEL_OBJECT),
            soft_queues: AtomicU32::new(0),
        })
    }

    /// Tear everything down. Objects still held through `Arc`s report
    /// `NotInitialized` afterwards; a second call does too.
    pub fn shut_down(&self) -> Result<()> {
        let _guard = self.shutdown.lock();
        self.lifecycle.ensure_alive()?;

        for queue in self.queues.drain() {
            self.teardown_queue(&queue);
        }
        for signal in self.signals.drain() {
            signal.mark_destroyed();
        }
        for executable in self.executables.drain() {
            executable.unregister(&self.kernels);
        }
        self.kernels.clear();
        self.memory.release_all();
        self.lifecycle.shut_down();
        tracing::debug!("runtime shut down");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle.is_alive()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// `(major, minor)` of the implemented interface.
    pub fn version(&self) -> (u16, u16) {
        API_VERSION
    }

    /// Ticks since the runtime opened.
    pub fn system_timestamp(&self) -> Result<u64> {
        self.lifecycle.ensure_alive()?;
        Ok(self.lifecycle.now())
    }

    /// Ticks per second of [`Runtime::system_timestamp`].
    pub fn timestamp_frequency(&self) -> u64 {
        TIMESTAMP_FREQUENCY
    }

    fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            signals: Arc::clone(&self.signals),
            memory: Arc::clone(&self.memory),
            kernels: Arc::clone(&self.kernels),
            pool: Arc::clone(&self.pool),
            poll: self.config.processor_poll(),
        }
    }

    // ============================================================================================
    // Agents and regions
    // ============================================================================================

    /// Lazy iterator over every agent.
    pub fn agents(&self) -> AgentIter<'_> {
        AgentIter::new(&self.agents)
    }

    pub fn agent(&self, handle: AgentHandle) -> Result<Arc<Agent>> {
        self.lifecycle.ensure_alive()?;
        self.agents
            .get(handle)
            .ok_or(RuntimeError::InvalidAgent(handle.to_raw()))
    }

    /// First agent matching `predicate`.
    pub fn find_agent(&self, predicate: impl FnMut(&Arc<Agent>) -> bool) -> Option<Arc<Agent>> {
        self.agents().find(predicate)
    }

    /// Lazy iterator over the regions attached to `agent`.
    pub fn agent_regions(&self, agent: AgentHandle) -> Result<AgentRegionIter<'_>> {
        Ok(AgentRegionIter::new(&self.regions, self.agent(agent)?))
    }

    pub fn region(&self, handle: RegionHandle) -> Result<Arc<Region>> {
        self.lifecycle.ensure_alive()?;
        self.regions
            .get(handle)
            .ok_or(RuntimeError::InvalidRegion(handle.to_raw()))
    }

    /// First region matching `predicate`.
    pub fn find_region(&self, predicate: impl FnMut(&Arc<Region>) -> bool) -> Option<Arc<Region>> {
        self.regions.values().into_iter().find(predicate)
    }

    // ============================================================================================
    // Signals
    // ============================================================================================

    /// Create a signal. A non-zero `num_consumers` names the agents expected
    /// to wait on it; `consumers` must then hold exactly that many.
    pub fn signal_create(
        &self,
        initial: SignalValue,
        num_consumers: u32,
        consumers: &[AgentHandle],
    ) -> Result<SignalHandle> {
        self.lifecycle.ensure_alive()?;
        let consumers = if num_consumers == 0 { &[][..] } else { consumers };
        if consumers.len() != num_consumers as usize {
            return Err(RuntimeError::invalid_argument(format!(
                "{num_consumers} consumers declared, {} given",
                consumers.len()
            )));
        }
        for &consumer in consumers {
            self.agent(consumer)?;
        }
        let signal = self.signals.insert_with(|handle| {
            Ok::<_, RuntimeError>(Arc::new(Signal::new(
                handle,
                initial,
                consumers.to_vec(),
                Arc::clone(&self.lifecycle),
            )))
        })?;
        tracing::trace!(signal = %signal.handle(), initial, "signal created");
        Ok(signal.handle())
    }

    /// Resolve a signal handle, e.g. for a hot wait loop.
    pub fn signal(&self, handle: SignalHandle) -> Result<Arc<Signal>> {
        self.lifecycle.ensure_alive()?;
        self.signals
            .get(handle)
            .ok_or(RuntimeError::InvalidSignal(handle.to_raw()))
    }

    pub fn signal_destroy(&self, handle: SignalHandle) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        let signal = self
            .signals
            .remove(handle)
            .ok_or(RuntimeError::InvalidSignal(handle.to_raw()))?;
        signal.mark_destroyed();
        tracing::trace!(signal = %handle, "signal destroyed");
        Ok(())
    }

    pub fn signal_load(&self, handle: SignalHandle, order: MemoryOrder) -> Result<SignalValue> {
        self.signal(handle)?.load(order)
    }

    pub fn signal_store(&self, handle: SignalHandle, value: SignalValue, order: MemoryOrder) -> Result<()> {
        self.signal(handle)?.store(value, order)
    }

    pub fn signal_exchange(&self, handle: SignalHandle, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.signal(handle)?.exchange(value, order)
    }

    pub fn signal_compare_and_swap(
        &self,
        handle: SignalHandle,
        expected: SignalValue,
        value: SignalValue,
        order: MemoryOrder,
    ) -> Result<SignalValue> {
        self.signal(handle)?.compare_and_swap(expected, value, order)
    }

    pub fn signal_add(&self, handle: SignalHandle, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.signal(handle)?.add(value, order)
    }

    pub fn signal_subtract(&self, handle: SignalHandle, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.signal(handle)?.subtract(value, order)
    }

    pub fn signal_and(&self, handle: SignalHandle, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.signal(handle)?.and(value, order)
    }

    pub fn signal_or(&self, handle: SignalHandle, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.signal(handle)?.or(value, order)
    }

    pub fn signal_xor(&self, handle: SignalHandle, value: SignalValue, order: MemoryOrder) -> Result<SignalValue> {
        self.signal(handle)?.xor(value, order)
    }

    /// See [`Signal::wait`]; `timeout` is an absolute [`Runtime::system_timestamp`].
    pub fn signal_wait(
        &self,
        handle: SignalHandle,
        condition: Condition,
        compare: SignalValue,
        timeout: u64,
        wait_state: WaitState,
    ) -> Result<SignalValue> {
        self.signal(handle)?.wait(condition, compare, timeout, wait_state)
    }

    // ============================================================================================
    // Queues
    // ============================================================================================

    /// Create a hardware queue on `agent`.
    ///
    /// Validation order: runtime open, agent live (`InvalidAgent`), size a
    /// power of two then within the agent's range (`InvalidArgument`), agent
    /// able to host queues then supporting `queue_type`
    /// (`InvalidQueueCreation`), agent queue limit (`OutOfResources`).
    #[tracing::instrument(level = "debug", skip(self, options), err)]
    pub fn queue_create(
        &self,
        agent: AgentHandle,
        size: u32,
        queue_type: QueueType,
        options: QueueOptions,
    ) -> Result<Arc<Queue>> {
        let agent = self.agent(agent)?;
        let info = agent.info();
        if !size.is_power_of_two() {
            return Err(RuntimeError::invalid_argument(format!(
                "queue size {size} is not a power of two"
            )));
        }
        if size < info.queue_min_size || size > info.queue_max_size {
            return Err(RuntimeError::invalid_argument(format!(
                "queue size {size} is outside {}..={} for agent {}",
                info.queue_min_size, info.queue_max_size, info.name
            )));
        }
        if !info.features.can_dispatch() || info.queue_max_count == 0 {
            return Err(RuntimeError::invalid_queue_creation(format!(
                "agent {} does not host queues",
                info.name
            )));
        }
        if !info.queue_type.supports(queue_type) {
            return Err(RuntimeError::invalid_queue_creation(format!(
                "agent {} cannot host {queue_type:?} queues",
                info.name
            )));
        }
        if !agent.acquire_queue_slot() {
            return Err(RuntimeError::out_of_resources(format!(
                "agent {} already has {} queues",
                info.name, info.queue_max_count
            )));
        }

        let Some(ring) = RingBuffer::new(size) else {
            agent.release_queue_slot();
            return Err(RuntimeError::out_of_resources(format!("ring of {size} packets")));
        };
        let doorbell = self.signal_create(DOORBELL_IDLE, 0, &[]).and_then(|handle| self.signal(handle));
        let doorbell = match doorbell {
            Ok(doorbell) => doorbell,
            Err(error) => {
                agent.release_queue_slot();
                return Err(error);
            }
        };

        let params = QueueParams {
            id: self.next_queue_id.fetch_add(1, Ordering::Relaxed),
            queue_type,
            features: info.features,
            agent: Some(Arc::clone(&agent)),
            doorbell,
            private_segment_size: options.private_segment_size,
            group_segment_size: options.group_segment_size,
            error_callback: options.error_callback,
            ring_allocation: None,
        };
        let queue = self.insert_queue(ring, params)?;

        if info.features.contains(Features::KERNEL_DISPATCH) {
            match CommandProcessor::spawn(Arc::clone(&queue), self.dispatch_context()) {
                Ok(processor) => {
                    self.processors.lock().insert(queue.handle(), processor);
                }
                Err(error) => {
                    self.queues.remove(queue.handle());
                    self.teardown_queue(&queue);
                    return Err(error);
                }
            }
        }
        tracing::debug!(queue = queue.id(), agent = %info.name, size, "queue created");
        Ok(queue)
    }

    /// Create a queue over memory from `region` with a caller-owned doorbell
    /// and no command processor.
    ///
    /// Validation order: runtime open, size a power of two, doorbell non-null,
    /// features non-empty (all `InvalidArgument`), region live
    /// (`InvalidRegion`), doorbell live (`InvalidSignal`), soft queue capacity
    /// then region space (`OutOfResources`).
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub fn soft_queue_create(
        &self,
        region: RegionHandle,
        size: u32,
        queue_type: QueueType,
        features: Features,
        doorbell: SignalHandle,
    ) -> Result<Arc<Queue>> {
        self.lifecycle.ensure_alive()?;
        if !size.is_power_of_two() {
            return Err(RuntimeError::invalid_argument(format!(
                "queue size {size} is not a power of two"
            )));
        }
        if doorbell.is_null() {
            return Err(RuntimeError::invalid_argument("doorbell signal handle is 0"));
        }
        if features.is_empty() {
            return Err(RuntimeError::invalid_argument("soft queue has no features"));
        }
        let region = self.region(region)?;
        let doorbell = self.signal(doorbell)?;

        let capacity = self.config.soft_queue_capacity;
        let claimed = self
            .soft_queues
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| (live < capacity).then_some(live + 1));
        if claimed.is_err() {
            return Err(RuntimeError::out_of_resources(format!(
                "{capacity} soft queues are already live"
            )));
        }

        let bytes = RingBuffer::<AqlPacket>::storage_bytes(size);
        let (ptr, block) = match self.memory.allocate_aligned(&region, bytes, PACKET_ALIGN, AllocationUse::QueueRing) {
            Ok(allocation) => allocation,
            Err(error) => {
                self.soft_queues.fetch_sub(1, Ordering::AcqRel);
                return Err(RuntimeError::out_of_resources(format!(
                    "region {} cannot hold a {size} packet ring: {error}",
                    region.name()
                )));
            }
        };

        let params = QueueParams {
            id: self.next_queue_id.fetch_add(1, Ordering::Relaxed),
            queue_type,
            features,
            agent: None,
            doorbell,
            private_segment_size: 0,
            group_segment_size: 0,
            error_callback: None,
            ring_allocation: Some(ptr),
        };
        let queue = match self.insert_queue(RingBuffer::with_storage(block, size), params) {
            Ok(queue) => queue,
            Err(error) => {
                let _ = self.memory.free_as(ptr, AllocationUse::QueueRing);
                self.soft_queues.fetch_sub(1, Ordering::AcqRel);
                return Err(error);
            }
        };
        tracing::debug!(queue = queue.id(), region = %region.name(), size, "soft queue created");
        Ok(queue)
    }

    fn insert_queue(&self, ring: RingBuffer, params: QueueParams) -> Result<Arc<Queue>> {
        let signals = Arc::clone(&self.signals);
        let lifecycle = Arc::clone(&self.lifecycle);
        self.queues.insert_with(move |handle| {
            Ok::<_, RuntimeError>(Arc::new(Queue::new(handle, ring, params, signals, lifecycle)))
        })
    }

    pub fn queue(&self, handle: QueueHandle) -> Result<Arc<Queue>> {
        self.lifecycle.ensure_alive()?;
        self.queues
            .get(handle)
            .ok_or(RuntimeError::InvalidQueue(handle.to_raw()))
    }

    /// Stop new reservations. Packets already published are still processed.
    pub fn queue_inactivate(&self, handle: QueueHandle) -> Result<()> {
        self.queue(handle)?.inactivate()?;
        tracing::debug!(queue = %handle, "queue inactivated");
        Ok(())
    }

    /// Destroy a queue, stopping its command processor and releasing its ring.
    pub fn queue_destroy(&self, handle: QueueHandle) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        let queue = self
            .queues
            .remove(handle)
            .ok_or(RuntimeError::InvalidQueue(handle.to_raw()))?;
        self.teardown_queue(&queue);
        Ok(())
    }

    fn teardown_queue(&self, queue: &Arc<Queue>) {
        queue.mark_destroyed();
        let processor = self.processors.lock().remove(&queue.handle());
        if let Some(processor) = processor {
            processor.join();
        }

        match queue.owner() {
            Some(agent) => {
                agent.release_queue_slot();
                if let Some(doorbell) = self.signals.remove(queue.doorbell_signal()) {
                    doorbell.mark_destroyed();
                }
            }
            None => {
                self.soft_queues.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if let Some(ptr) = queue.ring_allocation() {
            // The ring keeps its block alive; this only returns the region space
            let _ = self.memory.free_as(ptr, AllocationUse::QueueRing);
        }
        tracing::debug!(queue = queue.id(), "queue destroyed");
    }

    // ============================================================================================
    // Memory
    // ============================================================================================

    /// Allocate `size` bytes from `region`.
    pub fn allocate(&self, region: RegionHandle, size: usize) -> Result<DevicePtr> {
        let region = self.region(region)?;
        self.memory.allocate(&region, size)
    }

    pub fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        self.memory.free(ptr)
    }

    /// Make `size` bytes of host memory at `ptr` accessible to agents.
    ///
    /// Registering the same range again adds a reference. Ranges overlapping
    /// runtime allocations are rejected.
    ///
    /// # Safety
    ///
    /// Until the matching [`Runtime::deregister`] (or shutdown), the range must
    /// stay allocated, valid for reads and writes, and must not be accessed by
    /// the caller concurrently with copies or kernels that touch it. It must not
    /// cover memory owned by the runtime, such as a hardware queue's ring.
    pub unsafe fn register(&self, ptr: DevicePtr, size: usize) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        // SAFETY: forwarded from the caller.
        unsafe { self.memory.register(ptr, size) }
    }

    pub fn deregister(&self, ptr: DevicePtr, size: usize) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        self.memory.deregister(ptr, size)
    }

    /// Transfer ownership of a coarse-grained allocation to `agent`.
    pub fn assign_agent(&self, ptr: DevicePtr, agent: AgentHandle, access: AccessPermission) -> Result<()> {
        let agent = self.agent(agent)?;
        self.memory.assign_agent(ptr, agent.handle(), access)
    }

    /// Copy `size` bytes; both ranges must be allocated or registered, and
    /// neither may touch soft queue ring storage.
    pub fn copy(&self, dst: DevicePtr, src: DevicePtr, size: usize) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        self.memory.copy(dst, src, size)
    }

    /// Region of the allocation containing `ptr`.
    pub fn region_of(&self, ptr: DevicePtr) -> Result<Option<RegionHandle>> {
        self.lifecycle.ensure_alive()?;
        Ok(self.memory.region_of(ptr))
    }

    pub fn allocation_info(&self, ptr: DevicePtr) -> Result<Option<AllocationInfo>> {
        self.lifecycle.ensure_alive()?;
        Ok(self.memory.allocation_info(ptr))
    }

    pub fn is_accessible(&self, ptr: DevicePtr, len: usize) -> Result<bool> {
        self.lifecycle.ensure_alive()?;
        Ok(self.memory.is_accessible(ptr, len))
    }

    /// Copy `len` bytes out of runtime-visible memory.
    pub fn memory_read(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        self.lifecycle.ensure_alive()?;
        self.memory.read_bytes(ptr, len)
    }

    /// Copy `bytes` into runtime-visible memory.
    pub fn memory_write(&self, ptr: DevicePtr, bytes: &[u8]) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        self.memory.write_bytes(ptr, bytes)
    }

    /// The checked view kernels use, for host-side inspection.
    pub fn global_memory(&self) -> GlobalMemory<'_> {
        GlobalMemory::new(&self.memory)
    }

    /// Number of live region allocations, soft queue rings included.
    pub fn live_allocations(&self) -> usize {
        self.memory.live_allocations()
    }

    // ============================================================================================
    // Executables
    // ============================================================================================

    pub fn executable_create(&self) -> Result<ExecutableHandle> {
        self.lifecycle.ensure_alive()?;
        let executable = self.executables.insert_with(|handle| {
            Ok::<_, RuntimeError>(Arc::new(Executable::new(handle, Arc::clone(&self.lifecycle))))
        })?;
        Ok(executable.handle())
    }

    pub fn executable(&self, handle: ExecutableHandle) -> Result<Arc<Executable>> {
        self.lifecycle.ensure_alive()?;
        self.executables
            .get(handle)
            .ok_or(RuntimeError::InvalidExecutable(handle.to_raw()))
    }

    /// Load every kernel of `code` for `agent`.
    pub fn load_code_object(&self, executable: ExecutableHandle, agent: AgentHandle, code: &CodeObject) -> Result<()> {
        let executable = self.executable(executable)?;
        let agent = self.agent(agent)?;
        if executable.is_frozen() {
            return Err(RuntimeError::FrozenExecutable);
        }
        if code.isa() != agent.info().isa {
            return Err(RuntimeError::IncompatibleArguments(format!(
                "code object ISA {} does not match agent {} ISA {}",
                code.isa(),
                agent.name(),
                agent.info().isa
            )));
        }
        executable.load(agent.handle(), code)
    }

    /// Assign kernel objects, making the kernels dispatchable.
    pub fn executable_freeze(&self, executable: ExecutableHandle) -> Result<()> {
        let executable = self.executable(executable)?;
        executable.freeze(&self.kernels, || {
            self.next_kernel_object.fetch_add(KERNEL_OBJECT_STRIDE, Ordering::Relaxed)
        })?;
        tracing::debug!(executable = %executable.handle(), "executable frozen");
        Ok(())
    }

    pub fn executable_symbol(
        &self,
        executable: ExecutableHandle,
        name: &str,
        agent: AgentHandle,
    ) -> Result<SymbolInfo> {
        let executable = self.executable(executable)?;
        let agent = self.agent(agent)?;
        executable.symbol(name, agent.handle())
    }

    /// Lazy iterator over the executable's symbols.
    pub fn executable_symbols(&self, executable: ExecutableHandle) -> Result<SymbolIter> {
        Ok(SymbolIter::new(self.executable(executable)?))
    }

    pub fn executable_destroy(&self, executable: ExecutableHandle) -> Result<()> {
        self.lifecycle.ensure_alive()?;
        let executable = self
            .executables
            .remove(executable)
            .ok_or(RuntimeError::InvalidExecutable(executable.to_raw()))?;
        executable.unregister(&self.kernels);
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.lifecycle.is_alive() {
            let _ = self.shut_down();
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("open", &self.is_open())
            .field("agents", &self.agents.len())
            .field("regions", &self.regions.len())
            .field("signals", &self.signals.len())
            .field("queues", &self.queues.len())
            .field("executables", &self.executables.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Runtime {
        Runtime::open(RuntimeConfig::default().with_worker_threads(2)).unwrap()
    }

    fn gpu(runtime: &Runtime) -> AgentHandle {
        runtime.find_agent(|a| a.name() == "gpu0").unwrap().handle()
    }

    #[test]
    fn test_open_enumerates_topology() {
        let runtime = runtime();
        assert_eq!(runtime.agents().count(), 3);
        let regions: Vec<_> = runtime
            .agent_regions(gpu(&runtime))
            .unwrap()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(regions, ["system", "gpu0-local", "gpu0-group"]);
        assert_eq!(runtime.timestamp_frequency(), 1_000_000_000);
        assert_eq!(runtime.version(), (1, 2));
    }

    #[test]
    fn test_shut_down_twice() {
        let runtime = runtime();
        let signal = runtime.signal_create(0, 0, &[]).unwrap();
        let resolved = runtime.signal(signal).unwrap();
        runtime.shut_down().unwrap();
        assert_eq!(runtime.shut_down(), Err(RuntimeError::NotInitialized));
        assert_eq!(resolved.load(MemoryOrder::Relaxed), Err(RuntimeError::NotInitialized));
        assert_eq!(runtime.signal_create(0, 0, &[]), Err(RuntimeError::NotInitialized));
    }

    #[test]
    fn test_signal_consumers_are_checked() {
        let runtime = runtime();
        let agent = gpu(&runtime);
        assert!(matches!(
            runtime.signal_create(0, 2, &[agent]),
            Err(RuntimeError::InvalidArgument(_))
        ));
        assert_eq!(
            runtime.signal_create(0, 1, &[AgentHandle::NULL]),
            Err(RuntimeError::InvalidAgent(0))
        );
        assert!(runtime.signal_create(0, 1, &[agent]).is_ok());
    }

    #[test]
    fn test_hardware_queue_releases_agent_slot() {
        let runtime = runtime();
        let agent = runtime.find_agent(|a| a.name() == "dsp0").unwrap();
        let queue = runtime
            .queue_create(agent.handle(), 64, QueueType::Single, QueueOptions::default())
            .unwrap();
        assert_eq!(agent.queue_count(), 1);
        assert_eq!(queue.agent(), Some(agent.handle()));
        let doorbell = queue.doorbell_signal();
        assert_eq!(runtime.signal_load(doorbell, MemoryOrder::Relaxed), Ok(DOORBELL_IDLE));

        runtime.queue_destroy(queue.handle()).unwrap();
        assert_eq!(agent.queue_count(), 0);
        assert_eq!(
            runtime.signal_load(doorbell, MemoryOrder::Relaxed),
            Err(RuntimeError::InvalidSignal(doorbell.to_raw()))
        );
        assert_eq!(
            runtime.queue_destroy(queue.handle()),
            Err(RuntimeError::InvalidQueue(queue.handle().to_raw()))
        );
    }

    #[test]
    fn test_kernel_objects_are_spaced() {
        let runtime = runtime();
        let exe = runtime.executable_create().unwrap();
        let code = crate::CodeObjectBuilder::new("aql-sim")
            .kernel(crate::KernelDescriptor::new("a", |_| {}))
            .kernel(crate::KernelDescriptor::new("b", |_| {}))
            .build()
            .unwrap();
        runtime.load_code_object(exe, gpu(&runtime), &code).unwrap();
        runtime.executable_freeze(exe).unwrap();
        let objects: Vec<_> = runtime.executable_symbols(exe).unwrap().map(|s| s.kernel_object).collect();
        assert_eq!(objects, [FIRST_KERNEL_OBJECT, FIRST_KERNEL_OBJECT + KERNEL_OBJECT_STRIDE]);
    }
}
