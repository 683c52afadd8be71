//! Memory regions

use crate::agent::AgentHandle;
use crate::handle::Handle;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Handle to a [`Region`]
pub type RegionHandle = Handle<Region>;

/// Address space a region belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Global,
    ReadOnly,
    Private,
    Group,
}

bitflags! {
    /// Properties of a global-segment region
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct GlobalFlags: u32 {
        /// Usable for kernel argument segments
        const KERNARG = 1 << 0;
        /// Coherent between agents at instruction granularity
        const FINE_GRAINED = 1 << 1;
        /// Coherent only at dispatch boundaries; has a single owning agent
        const COARSE_GRAINED = 1 << 2;
    }
}

/// Immutable region attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub name: String,
    pub segment: Segment,
    #[serde(default)]
    pub flags: GlobalFlags,
    pub alloc_allowed: bool,
    /// Largest single allocation in bytes.
    pub max_allocation: usize,
    /// Allocation sizes are rounded up to a multiple of this.
    pub granule: usize,
    /// Every allocation start is aligned to this (a power of two).
    pub alignment: usize,
    /// Total bytes the region can hand out at once.
    pub capacity: usize,
}

impl RegionInfo {
    /// `size` rounded up to the granule, `None` on overflow.
    pub fn rounded_size(&self, size: usize) -> Option<usize> {
        let granule = self.granule.max(1);
        size.checked_add(granule - 1).map(|s| s / granule * granule)
    }
}

/// A memory pool with fixed allocation and coherence properties
#[derive(Debug)]
pub struct Region {
    handle: RegionHandle,
    info: RegionInfo,
    owners: Vec<AgentHandle>,
    in_use: AtomicUsize,
}

impl Region {
    pub(crate) fn new(handle: RegionHandle, info: RegionInfo, owners: Vec<AgentHandle>) -> Self {
        Self {
            handle,
            info,
            owners,
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn handle(&self) -> RegionHandle {
        self.handle
    }

    pub fn info(&self) -> &RegionInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Agents attached to this region.
    pub fn owners(&self) -> &[AgentHandle] {
        &self.owners
    }

    pub fn is_fine_grained(&self) -> bool {
        self.info.flags.contains(GlobalFlags::FINE_GRAINED)
    }

    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Reserve `bytes` of capacity; false if the region is full.
    pub(crate) fn reserve(&self, bytes: usize) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= self.info.capacity)
            })
            .is_ok()
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }
}
