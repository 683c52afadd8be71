//! Region allocator and host-visible memory
//!
//! Every allocation is a real, zeroed host block aligned to its region's
//! alignment and rounded to its granule, so a [`DevicePtr`] is simply the block
//! address. Blocks are reference counted: freeing removes the allocation from
//! the address map, and the memory itself is returned when the last user (for
//! example a soft queue ring) lets go.
//!
//! ```text
//! allocations: BTreeMap<start, Allocation>   (region, size, owner, access)
//! registrations: BTreeMap<(start, len), refcount>
//! ```
//!
//! Both maps sit behind `RwLock`s. Copies and kernel accesses validate and
//! touch memory under the read locks, so a concurrent `free` cannot release a
//! block mid-access.

use crate::agent::AgentHandle;
use crate::error::{Result, RuntimeError};
use crate::region::{Region, RegionHandle};
use aql_tracing::performance::{micros, record_allocation, record_copy};
use bytemuck::Pod;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::alloc::Layout;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Address of runtime-managed or registered memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    pub const fn new(address: u64) -> Self {
        Self(address)
    }

    /// Pointer to host memory, e.g. for [`crate::Runtime::register`].
    pub fn from_host<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    pub const fn address(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past this one. Wraps on overflow; every access
    /// validates its range, so a wrapped pointer is simply inaccessible.
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Access an agent is granted to a coarse-grained allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessPermission {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

/// Snapshot of one live allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationInfo {
    pub region: RegionHandle,
    /// Size after granule rounding.
    pub size: usize,
    /// Agent that owns a coarse-grained allocation.
    pub owner: Option<AgentHandle>,
    pub access: AccessPermission,
}

// ================================================================================================
// Host blocks
// ================================================================================================

/// Owned, zero-initialised, aligned host memory
pub(crate) struct HostBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is plain memory; all concurrent access goes through atomics
// or through the allocator's locks.
unsafe impl Send for HostBlock {}
unsafe impl Sync for HostBlock {}

impl HostBlock {
    /// `None` if the layout is invalid or the host allocator fails.
    pub(crate) fn zeroed(size: usize, align: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size.max(1), align).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn address(&self) -> DevicePtr {
        DevicePtr::from_host(self.ptr.as_ptr())
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// ================================================================================================
// Memory manager
// ================================================================================================

/// Who may touch an allocation's bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocationUse {
    /// Application data: copies, host reads and writes, kernels
    Application,
    /// Soft queue ring storage, accessed only through the ring's atomics
    QueueRing,
}

struct Allocation {
    // keeps the memory alive while the allocation is live
    _block: Arc<HostBlock>,
    size: usize,
    region: Arc<Region>,
    owner: Option<AgentHandle>,
    access: AccessPermission,
    usage: AllocationUse,
}

impl Allocation {
    fn contains(&self, start: u64, address: u64, len: usize) -> bool {
        range_within(start, self.size, address, len)
    }
}

fn range_within(start: u64, size: usize, address: u64, len: usize) -> bool {
    let Some(end) = start.checked_add(size as u64) else {
        return false;
    };
    let Some(access_end) = address.checked_add(len as u64) else {
        return false;
    };
    address >= start && access_end <= end
}

/// Allocation bookkeeping for every region of a runtime
pub(crate) struct MemoryManager {
    allocations: RwLock<BTreeMap<u64, Allocation>>,
    registrations: RwLock<BTreeMap<(u64, usize), u32>>,
}

impl MemoryManager {
    pub(crate) fn new() -> Self {
        Self {
            allocations: RwLock::new(BTreeMap::new()),
            registrations: RwLock::new(BTreeMap::new()),
        }
    }

    /// Allocate `size` bytes from `region`.
    ///
    /// Precedence: size 0 (`InvalidArgument`), region not allocatable or size
    /// above its maximum (`InvalidAllocation`), capacity or host exhaustion
    /// (`OutOfResources`).
    pub(crate) fn allocate(&self, region: &Arc<Region>, size: usize) -> Result<DevicePtr> {
        self.allocate_aligned(region, size, region.info().alignment, AllocationUse::Application)
            .map(|(ptr, _)| ptr)
    }

    /// Allocate with at least `align` alignment, also returning the block.
    pub(crate) fn allocate_aligned(
        &self,
        region: &Arc<Region>,
        size: usize,
        align: usize,
        usage: AllocationUse,
    ) -> Result<(DevicePtr, Arc<HostBlock>)> {
        let info = region.info();
        if size == 0 {
            return Err(RuntimeError::invalid_argument("allocation size is 0"));
        }
        if !info.alloc_allowed {
            return Err(RuntimeError::InvalidAllocation(format!(
                "region {} does not allow allocation",
                info.name
            )));
        }
        if size > info.max_allocation {
            return Err(RuntimeError::InvalidAllocation(format!(
                "{size} bytes exceeds the {} byte maximum of region {}",
                info.max_allocation, info.name
            )));
        }
        let rounded = info
            .rounded_size(size)
            .ok_or_else(|| RuntimeError::InvalidAllocation(format!("{size} bytes overflows the granule")))?;

        let start = Instant::now();
        if !region.reserve(rounded) {
            return Err(RuntimeError::out_of_resources(format!(
                "region {} has {} of {} bytes in use",
                info.name,
                region.bytes_in_use(),
                info.capacity
            )));
        }
        let align = align.max(info.alignment);
        let Some(block) = HostBlock::zeroed(rounded, align) else {
            region.release(rounded);
            return Err(RuntimeError::out_of_resources(format!(
                "host allocator failed for {rounded} bytes"
            )));
        };

        let block = Arc::new(block);
        let ptr = block.address();
        self.allocations.write().insert(
            ptr.address(),
            Allocation {
                _block: Arc::clone(&block),
                size: rounded,
                region: Arc::clone(region),
                owner: region.owners().first().copied(),
                access: AccessPermission::ReadWrite,
                usage,
            },
        );

        record_allocation(&info.name, rounded, align, micros(start));
        tracing::trace!(region = %info.name, ptr = %ptr, size = rounded, "allocated");
        Ok((ptr, block))
    }

    /// Free the application allocation starting at `ptr`.
    pub(crate) fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.free_as(ptr, AllocationUse::Application)
    }

    /// Free the allocation starting at `ptr` if it was made for `usage`.
    pub(crate) fn free_as(&self, ptr: DevicePtr, usage: AllocationUse) -> Result<()> {
        if ptr.is_null() {
            return Err(RuntimeError::invalid_argument("free of a null pointer"));
        }
        let allocation = match self.allocations.write().entry(ptr.address()) {
            Entry::Occupied(entry) if entry.get().usage == usage => entry.remove(),
            Entry::Occupied(_) => return Err(RuntimeError::invalid_argument(format!("{ptr} is owned by a queue"))),
            Entry::Vacant(_) => {
                return Err(RuntimeError::invalid_argument(format!(
                    "{ptr} is not the start of a live allocation"
                )))
            }
        };
        allocation.region.release(allocation.size);
        tracing::trace!(region = %allocation.region.name(), %ptr, "freed");
        Ok(())
    }

    /// Make host memory accessible to agents; ranges are reference counted.
    ///
    /// # Safety
    ///
    /// See [`crate::Runtime::register`].
    pub(crate) unsafe fn register(&self, ptr: DevicePtr, size: usize) -> Result<()> {
        if ptr.is_null() {
            return Err(RuntimeError::invalid_argument("register of a null pointer"));
        }
        if size == 0 {
            return Err(RuntimeError::invalid_argument("register of 0 bytes"));
        }
        let allocations = self.allocations.read();
        let mut registrations = self.registrations.write();
        if overlapping(&allocations, ptr.address(), size).next().is_some() {
            return Err(RuntimeError::invalid_argument(format!(
                "{ptr} with {size} bytes overlaps runtime-allocated memory"
            )));
        }
        let count = registrations.entry((ptr.address(), size)).or_insert(0);
        *count = count
            .checked_add(1)
            .ok_or_else(|| RuntimeError::out_of_resources(format!("registration count of {ptr} overflowed")))?;
        Ok(())
    }

    /// Drop one registration of exactly `(ptr, size)`.
    pub(crate) fn deregister(&self, ptr: DevicePtr, size: usize) -> Result<()> {
        let mut registrations = self.registrations.write();
        let key = (ptr.address(), size);
        match registrations.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                registrations.remove(&key);
            }
            None => {
                return Err(RuntimeError::invalid_argument(format!(
                    "{ptr} with {size} bytes is not registered"
                )))
            }
        }
        Ok(())
    }

    /// Re-home a coarse-grained allocation. Fine-grained allocations are
    /// accepted unchanged.
    pub(crate) fn assign_agent(&self, ptr: DevicePtr, agent: AgentHandle, access: AccessPermission) -> Result<()> {
        let mut allocations = self.allocations.write();
        let allocation = allocations
            .get_mut(&ptr.address())
            .ok_or_else(|| RuntimeError::invalid_argument(format!("{ptr} is not the start of a live allocation")))?;
        if allocation.region.is_fine_grained() {
            return Ok(());
        }
        // Writes made under the previous owner must be visible to the new one
        fence(Ordering::SeqCst);
        allocation.owner = Some(agent);
        allocation.access = access;
        Ok(())
    }

    /// Synchronous copy between two accessible ranges; they may overlap.
    pub(crate) fn copy(&self, dst: DevicePtr, src: DevicePtr, size: usize) -> Result<()> {
        if dst.is_null() || src.is_null() {
            return Err(RuntimeError::invalid_argument("copy with a null pointer"));
        }
        if size == 0 {
            return Ok(());
        }
        let allocations = self.allocations.read();
        let registrations = self.registrations.read();
        for (name, ptr) in [("destination", dst), ("source", src)] {
            if !accessible(&allocations, &registrations, ptr, size) {
                return Err(RuntimeError::invalid_argument(format!(
                    "{name} {ptr} is not accessible for {size} bytes"
                )));
            }
        }
        let start = Instant::now();
        // SAFETY: both ranges lie inside live allocations or registered host
        // memory, and the read locks keep allocations from being freed.
        unsafe { std::ptr::copy(src.as_ptr::<u8>(), dst.as_ptr::<u8>(), size) };
        record_copy(size, micros(start));
        Ok(())
    }

    pub(crate) fn region_of(&self, ptr: DevicePtr) -> Option<RegionHandle> {
        let allocations = self.allocations.read();
        let (&start, allocation) = allocations.range(..=ptr.address()).next_back()?;
        allocation
            .contains(start, ptr.address(), 1)
            .then(|| allocation.region.handle())
    }

    pub(crate) fn allocation_info(&self, ptr: DevicePtr) -> Option<AllocationInfo> {
        self.allocations.read().get(&ptr.address()).map(|allocation| AllocationInfo {
            region: allocation.region.handle(),
            size: allocation.size,
            owner: allocation.owner,
            access: allocation.access,
        })
    }

    pub(crate) fn is_accessible(&self, ptr: DevicePtr, len: usize) -> bool {
        let allocations = self.allocations.read();
        let registrations = self.registrations.read();
        accessible(&allocations, &registrations, ptr, len)
    }

    /// Run `f` on a validated raw pointer while allocations are pinned.
    fn with_range<R>(&self, ptr: DevicePtr, len: usize, f: impl FnOnce(*mut u8) -> R) -> Option<R> {
        let allocations = self.allocations.read();
        let registrations = self.registrations.read();
        accessible(&allocations, &registrations, ptr, len).then(|| f(ptr.as_ptr::<u8>()))
    }

    pub(crate) fn read_bytes(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        self.with_range(ptr, len, |p| {
            let mut out = vec![0u8; len];
            // SAFETY: validated by `with_range`.
            unsafe { std::ptr::copy_nonoverlapping(p, out.as_mut_ptr(), len) };
            out
        })
        .ok_or_else(|| RuntimeError::invalid_argument(format!("{ptr} is not accessible for {len} bytes")))
    }

    pub(crate) fn write_bytes(&self, ptr: DevicePtr, bytes: &[u8]) -> Result<()> {
        self.with_range(ptr, bytes.len(), |p| {
            // SAFETY: validated by `with_range`.
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len()) }
        })
        .ok_or_else(|| {
            RuntimeError::invalid_argument(format!("{ptr} is not accessible for {} bytes", bytes.len()))
        })
    }

    /// Forget every allocation. Blocks still referenced elsewhere stay alive.
    pub(crate) fn release_all(&self) {
        let drained = std::mem::take(&mut *self.allocations.write());
        for allocation in drained.into_values() {
            allocation.region.release(allocation.size);
        }
        self.registrations.write().clear();
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.allocations.read().len()
    }
}

fn accessible(
    allocations: &BTreeMap<u64, Allocation>,
    registrations: &BTreeMap<(u64, usize), u32>,
    ptr: DevicePtr,
    len: usize,
) -> bool {
    if ptr.is_null() {
        return false;
    }
    let address = ptr.address();
    if overlapping(allocations, address, len).any(|(_, a)| a.usage == AllocationUse::QueueRing) {
        return false;
    }
    if let Some((&start, allocation)) = allocations.range(..=address).next_back() {
        if allocation.contains(start, address, len) {
            return true;
        }
    }
    registrations
        .range(..=(address, usize::MAX))
        .any(|(&(start, size), _)| range_within(start, size, address, len))
}

/// Allocations sharing at least one byte with `[address, address + len)`.
fn overlapping<'a>(
    allocations: &'a BTreeMap<u64, Allocation>,
    address: u64,
    len: usize,
) -> impl Iterator<Item = (u64, &'a Allocation)> + 'a {
    let end = address.saturating_add(len as u64);
    allocations
        .range(..end)
        .rev()
        .map(|(&start, allocation)| (start, allocation))
        .take_while(move |&(start, allocation)| start.saturating_add(allocation.size as u64) > address)
}

// ================================================================================================
// Kernel view
// ================================================================================================

/// Global memory as seen by a running kernel
///
/// Every access is bounds-checked against live allocations and registered
/// ranges. Work-items writing through [`GlobalMemory::write`] must target
/// disjoint addresses; shared counters use the `fetch_add` helpers.
#[derive(Clone, Copy)]
pub struct GlobalMemory<'a> {
    manager: &'a MemoryManager,
}

impl<'a> GlobalMemory<'a> {
    pub(crate) fn new(manager: &'a MemoryManager) -> Self {
        Self { manager }
    }

    pub fn read<T: Pod>(&self, address: u64) -> Option<T> {
        self.manager.with_range(DevicePtr(address), std::mem::size_of::<T>(), |p| {
            // SAFETY: validated range; unaligned read of plain data.
            unsafe { std::ptr::read_unaligned(p as *const T) }
        })
    }

    /// Returns false if the range is not accessible.
    pub fn write<T: Pod>(&self, address: u64, value: T) -> bool {
        self.manager
            .with_range(DevicePtr(address), std::mem::size_of::<T>(), |p| {
                // SAFETY: validated range; unaligned write of plain data.
                unsafe { std::ptr::write_unaligned(p as *mut T, value) }
            })
            .is_some()
    }

    /// Atomic add on an aligned `u32`; returns the previous value.
    pub fn fetch_add_u32(&self, address: u64, value: u32) -> Option<u32> {
        if address % 4 != 0 {
            return None;
        }
        self.manager.with_range(DevicePtr(address), 4, |p| {
            // SAFETY: aligned, validated, and only accessed atomically here.
            unsafe { AtomicU32::from_ptr(p as *mut u32) }.fetch_add(value, Ordering::AcqRel)
        })
    }

    /// Atomic add on an aligned `u64`; returns the previous value.
    pub fn fetch_add_u64(&self, address: u64, value: u64) -> Option<u64> {
        if address % 8 != 0 {
            return None;
        }
        self.manager.with_range(DevicePtr(address), 8, |p| {
            // SAFETY: aligned, validated, and only accessed atomically here.
            unsafe { AtomicU64::from_ptr(p as *mut u64) }.fetch_add(value, Ordering::AcqRel)
        })
    }
}
