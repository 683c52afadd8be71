//! Agents
//!
//! Agents are enumerated once from the configured topology when the runtime
//! opens and never change afterwards.

use crate::error::{Result, RuntimeError};
use crate::handle::{Arena, Handle};
use crate::region::Region;
use aql_core::Features;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Handle to an [`Agent`]
pub type AgentHandle = Handle<Agent>;

/// Kind of compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Gpu,
    Dsp,
}

/// Producer model of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum QueueType {
    /// Exactly one producer thread reserves slots
    Single = 0,
    /// Any number of producers reserve slots concurrently
    Multi = 1,
}

impl QueueType {
    /// Decode a raw queue type value.
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Single),
            1 => Ok(Self::Multi),
            other => Err(RuntimeError::invalid_argument(format!("unrecognized queue type {other}"))),
        }
    }

    /// Whether an agent with this queue type can host a queue of `requested` type.
    pub fn supports(self, requested: QueueType) -> bool {
        match self {
            Self::Multi => true,
            Self::Single => requested == Self::Single,
        }
    }
}

/// Immutable agent attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub vendor: String,
    pub device_type: DeviceType,
    pub features: Features,
    pub queue_min_size: u32,
    pub queue_max_size: u32,
    /// Maximum number of live queues; 0 means the agent hosts no queues.
    pub queue_max_count: u32,
    pub queue_type: QueueType,
    pub wavefront_size: u32,
    pub workgroup_max_dim: [u16; 3],
    pub workgroup_max_size: u32,
    pub grid_max_dim: [u32; 3],
    pub grid_max_size: u64,
    pub isa: String,
}

/// A compute device
#[derive(Debug)]
pub struct Agent {
    handle: AgentHandle,
    info: AgentInfo,
    live_queues: AtomicU32,
}

impl Agent {
    pub(crate) fn new(handle: AgentHandle, info: AgentInfo) -> Self {
        Self {
            handle,
            info,
            live_queues: AtomicU32::new(0),
        }
    }

    pub fn handle(&self) -> AgentHandle {
        self.handle
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn features(&self) -> Features {
        self.info.features
    }

    /// Number of live queues attached to this agent.
    pub fn queue_count(&self) -> u32 {
        self.live_queues.load(Ordering::Acquire)
    }

    /// Claim one of the agent's queue slots; false when the limit is reached.
    pub(crate) fn acquire_queue_slot(&self) -> bool {
        self.live_queues
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.info.queue_max_count).then_some(live + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_queue_slot(&self) {
        self.live_queues.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lazy iterator over agents
///
/// Cloning the iterator restarts from the clone point; dropping it early is
/// how a caller stops a traversal.
#[derive(Clone)]
pub struct AgentIter<'rt> {
    agents: &'rt Arena<Agent>,
    position: usize,
}

impl<'rt> AgentIter<'rt> {
    pub(crate) fn new(agents: &'rt Arena<Agent>) -> Self {
        Self { agents, position: 0 }
    }
}

impl Iterator for AgentIter<'_> {
    type Item = Arc<Agent>;

    fn next(&mut self) -> Option<Self::Item> {
        let agent = self.agents.nth(self.position)?;
        self.position += 1;
        Some(agent)
    }
}

/// Lazy iterator over the regions one agent is attached to
#[derive(Clone)]
pub struct AgentRegionIter<'rt> {
    regions: &'rt Arena<Region>,
    agent: Arc<Agent>,
    position: usize,
}

impl<'rt> AgentRegionIter<'rt> {
    pub(crate) fn new(regions: &'rt Arena<Region>, agent: Arc<Agent>) -> Self {
        Self {
            regions,
            agent,
            position: 0,
        }
    }
}

impl Iterator for AgentRegionIter<'_> {
    type Item = Arc<Region>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(region) = self.regions.nth(self.position) {
            self.position += 1;
            if region.owners().contains(&self.agent.handle) {
                return Some(region);
            }
        }
        None
    }
}
