//! Runtime configuration
//!
//! A [`RuntimeConfig`] describes the simulated topology (agents and regions)
//! and a few runtime knobs. It round-trips through JSON:
//!
//! ```json
//! {
//!   "agents": [{ "name": "gpu0", "device_type": "gpu", "features": "KERNEL_DISPATCH", ... }],
//!   "regions": [{ "name": "system", "segment": "global", "flags": "KERNARG | FINE_GRAINED",
//!                 "owners": ["gpu0"], ... }],
//!   "soft_queue_capacity": 64,
//!   "worker_threads": 0,
//!   "processor_poll_us": 200
//! }
//! ```
//!
//! # Environment variables
//!
//! - `AQL_TOPOLOGY`: path of a JSON topology file replacing the default
//! - `AQL_WORKER_THREADS`: size of the kernel worker pool
//! - `AQL_SOFT_QUEUE_CAPACITY`: maximum number of live soft queues

use crate::agent::{AgentInfo, DeviceType, QueueType};
use crate::region::{GlobalFlags, RegionInfo, Segment};
use aql_core::Features;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_TOPOLOGY: &str = "AQL_TOPOLOGY";
pub const ENV_WORKER_THREADS: &str = "AQL_WORKER_THREADS";
pub const ENV_SOFT_QUEUE_CAPACITY: &str = "AQL_SOFT_QUEUE_CAPACITY";

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Errors raised while loading or validating a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid topology: {0}")]
    Json(#[from] serde_json::Error),

    #[error("duplicate agent name {0}")]
    DuplicateAgent(String),

    #[error("duplicate region name {0}")]
    DuplicateRegion(String),

    #[error("region {region} lists unknown owner {agent}")]
    UnknownOwner { region: String, agent: String },

    #[error("agent {agent}: queue sizes {min}..={max} must be powers of two with min <= max")]
    InvalidQueueSizes { agent: String, min: u32, max: u32 },

    #[error("region {region}: {reason}")]
    InvalidRegion { region: String, reason: String },

    #[error("{name}={value} is not a valid value")]
    InvalidEnv { name: &'static str, value: String },

    #[error("processor_poll_us must be non-zero")]
    ZeroPollInterval,
}

/// A region plus the names of the agents attached to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    #[serde(flatten)]
    pub info: RegionInfo,
    pub owners: Vec<String>,
}

/// Topology and runtime knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub agents: Vec<AgentInfo>,
    pub regions: Vec<RegionConfig>,
    /// Maximum number of live soft queues.
    pub soft_queue_capacity: u32,
    /// Kernel worker threads; 0 lets rayon choose.
    #[serde(default)]
    pub worker_threads: usize,
    /// Longest single doorbell wait of a command processor, in microseconds.
    pub processor_poll_us: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            agents: vec![cpu_agent(), gpu_agent(), dsp_agent()],
            regions: vec![
                RegionConfig {
                    info: RegionInfo {
                        name: "system".to_string(),
                        segment: Segment::Global,
                        flags: GlobalFlags::KERNARG | GlobalFlags::FINE_GRAINED,
                        alloc_allowed: true,
                        max_allocation: 256 * MIB,
                        granule: 4 * KIB,
                        alignment: 4 * KIB,
                        capacity: 1024 * MIB,
                    },
                    owners: vec!["cpu0".into(), "gpu0".into(), "dsp0".into()],
                },
                RegionConfig {
                    info: coarse_region("gpu0-local", 256 * MIB, 512 * MIB),
                    owners: vec!["gpu0".into()],
                },
                RegionConfig {
                    info: RegionInfo {
                        name: "gpu0-group".to_string(),
                        segment: Segment::Group,
                        flags: GlobalFlags::empty(),
                        alloc_allowed: false,
                        max_allocation: 0,
                        granule: 1,
                        alignment: 16,
                        capacity: 64 * KIB,
                    },
                    owners: vec!["gpu0".into()],
                },
                RegionConfig {
                    info: coarse_region("dsp0-local", 16 * MIB, 64 * MIB),
                    owners: vec!["dsp0".into()],
                },
            ],
            soft_queue_capacity: 64,
            worker_threads: 0,
            processor_poll_us: 200,
        }
    }
}

fn cpu_agent() -> AgentInfo {
    AgentInfo {
        name: "cpu0".to_string(),
        vendor: "aql".to_string(),
        device_type: DeviceType::Cpu,
        features: Features::AGENT_DISPATCH,
        queue_min_size: 64,
        queue_max_size: 4096,
        queue_max_count: 0,
        queue_type: QueueType::Multi,
        wavefront_size: 1,
        workgroup_max_dim: [1, 1, 1],
        workgroup_max_size: 1,
        grid_max_dim: [u32::MAX; 3],
        grid_max_size: u64::MAX,
        isa: "aql-host".to_string(),
    }
}

fn gpu_agent() -> AgentInfo {
    AgentInfo {
        name: "gpu0".to_string(),
        vendor: "aql".to_string(),
        device_type: DeviceType::Gpu,
        features: Features::KERNEL_DISPATCH,
        queue_min_size: 64,
        queue_max_size: 131_072,
        queue_max_count: 128,
        queue_type: QueueType::Multi,
        wavefront_size: 64,
        workgroup_max_dim: [1024, 1024, 1024],
        workgroup_max_size: 1024,
        grid_max_dim: [u32::MAX; 3],
        grid_max_size: u64::MAX,
        isa: "aql-sim".to_string(),
    }
}

fn dsp_agent() -> AgentInfo {
    AgentInfo {
        name: "dsp0".to_string(),
        vendor: "aql".to_string(),
        device_type: DeviceType::Dsp,
        features: Features::KERNEL_DISPATCH,
        queue_min_size: 64,
        queue_max_size: 4096,
        queue_max_count: 4,
        queue_type: QueueType::Single,
        wavefront_size: 16,
        workgroup_max_dim: [256, 256, 256],
        workgroup_max_size: 256,
        grid_max_dim: [u32::MAX; 3],
        grid_max_size: u64::MAX,
        isa: "aql-sim".to_string(),
    }
}

fn coarse_region(name: &str, max_allocation: usize, capacity: usize) -> RegionInfo {
    RegionInfo {
        name: name.to_string(),
        segment: Segment::Global,
        flags: GlobalFlags::COARSE_GRAINED,
        alloc_allowed: true,
        max_allocation,
        granule: 4 * KIB,
        alignment: 4 * KIB,
        capacity,
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Default topology (or `AQL_TOPOLOGY`) with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var(ENV_TOPOLOGY) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };

        if let Ok(value) = env::var(ENV_WORKER_THREADS) {
            config.worker_threads = parse_env(ENV_WORKER_THREADS, &value)?;
        }
        if let Ok(value) = env::var(ENV_SOFT_QUEUE_CAPACITY) {
            config.soft_queue_capacity = parse_env(ENV_SOFT_QUEUE_CAPACITY, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_soft_queue_capacity(mut self, capacity: u32) -> Self {
        self.soft_queue_capacity = capacity;
        self
    }

    pub(crate) fn processor_poll(&self) -> Duration {
        Duration::from_micros(self.processor_poll_us)
    }

    /// Check names, owner references, queue sizes and region geometry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut agents = HashSet::new();
        for agent in &self.agents {
            if !agents.insert(agent.name.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.name.clone()));
            }
            let (min, max) = (agent.queue_min_size, agent.queue_max_size);
            if !min.is_power_of_two() || !max.is_power_of_two() || min > max {
                return Err(ConfigError::InvalidQueueSizes {
                    agent: agent.name.clone(),
                    min,
                    max,
                });
            }
        }

        let mut regions = HashSet::new();
        for region in &self.regions {
            let info = &region.info;
            if !regions.insert(info.name.as_str()) {
                return Err(ConfigError::DuplicateRegion(info.name.clone()));
            }
            if !info.alignment.is_power_of_two() {
                return Err(ConfigError::InvalidRegion {
                    region: info.name.clone(),
                    reason: format!("alignment {} is not a power of two", info.alignment),
                });
            }
            if info.granule == 0 {
                return Err(ConfigError::InvalidRegion {
                    region: info.name.clone(),
                    reason: "granule is 0".to_string(),
                });
            }
            if let Some(owner) = region.owners.iter().find(|owner| !agents.contains(owner.as_str())) {
                return Err(ConfigError::UnknownOwner {
                    region: info.name.clone(),
                    agent: owner.clone(),
                });
            }
        }

        if self.processor_poll_us == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [ENV_TOPOLOGY, ENV_WORKER_THREADS, ENV_SOFT_QUEUE_CAPACITY] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_default_topology_is_valid() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();
        let names: Vec<_> = config.agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["cpu0", "gpu0", "dsp0"]);
        assert_eq!(config.agents[1].queue_max_size, 131_072);
        assert_eq!(config.agents[2].queue_type, QueueType::Single);
        assert!(!config.regions[2].info.alloc_allowed);
    }

    #[test]
    fn test_json_round_trip() {
        let config = RuntimeConfig::default().with_soft_queue_capacity(3);
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"owners\""));
        assert_eq!(RuntimeConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RuntimeConfig::default();
        config.agents.push(config.agents[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateAgent(name)) if name == "cpu0"));

        let mut config = RuntimeConfig::default();
        config.regions[0].owners.push("npu7".into());
        assert!(matches!(config.validate(), Err(ConfigError::UnknownOwner { .. })));

        let mut config = RuntimeConfig::default();
        config.agents[1].queue_min_size = 48;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidQueueSizes { .. })));

        let mut config = RuntimeConfig::default();
        config.regions[1].info.alignment = 3000;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRegion { .. })));

        let mut config = RuntimeConfig::default();
        config.processor_poll_us = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroPollInterval)));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(RuntimeConfig::from_json("{"), Err(ConfigError::Json(_))));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var(ENV_WORKER_THREADS, "3");
        env::set_var(ENV_SOFT_QUEUE_CAPACITY, " 7 ");
        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.soft_queue_capacity, 7);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        env::set_var(ENV_WORKER_THREADS, "many");
        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name, .. } if name == ENV_WORKER_THREADS));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_reads_topology_file() {
        clear_env();
        let path = env::temp_dir().join(format!("aql-topology-{}.json", std::process::id()));
        let config = RuntimeConfig::default().with_worker_threads(2);
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        env::set_var(ENV_TOPOLOGY, &path);
        assert_eq!(RuntimeConfig::from_env().unwrap(), config);
        clear_env();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            RuntimeConfig::from_file(&path),
            Err(ConfigError::Io { .. })
        ));
    }
}
