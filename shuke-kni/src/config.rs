//! Port-bridge configuration table
//!
//! One entry per bridged physical port plus the list of transmit-worker
//! cores. [`BridgeConfig::validate`] turns it into a [`WorkerAssignment`]
//! before any worker launches.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use nix::libc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::{MEMPOOL_CACHE_SIZE, NB_MBUF};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no ports configured")]
    NoPorts,

    #[error("port {0} is configured more than once")]
    DuplicatePort(u16),

    #[error("invalid interface name {name:?} for port {port_id}")]
    InvalidName { port_id: u16, name: String },

    #[error("transmit core {0} has no port bridge")]
    CoreWithoutPort(usize),

    #[error("transmit core {0} is listed more than once")]
    DuplicateCore(usize),

    #[error("port {port_id} uses transmit core {core}, which is not an assigned transmit core")]
    PortWithoutCore { port_id: u16, core: usize },

    #[error("transmit core {core} is shared by ports {first} and {second}")]
    SharedCore { core: usize, first: u16, second: u16 },
}

/// Bridge settings for one physical port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBridgeConfig {
    /// Physical port index
    pub port_id: u16,
    /// Name of the kernel-visible virtual interface
    pub name: String,
    /// Core running the egress loop for this port
    pub lcore_tx: usize,
    /// Core the kernel-side thread should be bound to
    #[serde(default)]
    pub lcore_kthread: Option<usize>,
    /// Transmit queue on the physical port
    #[serde(default)]
    pub tx_queue_id: u16,
}

/// Process-wide bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Ports in bridging order
    pub ports: Vec<PortBridgeConfig>,
    /// Cores dedicated to egress workers
    pub tx_cores: Vec<usize>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_pool_cache_size")]
    pub pool_cache_size: usize,
    /// Pin worker threads to their cores
    #[serde(default = "default_pin_workers")]
    pub pin_workers: bool,
}

fn default_pool_size() -> usize {
    NB_MBUF
}

fn default_pool_cache_size() -> usize {
    MEMPOOL_CACHE_SIZE
}

fn default_pin_workers() -> bool {
    true
}

impl BridgeConfig {
    pub fn new(ports: Vec<PortBridgeConfig>, tx_cores: Vec<usize>) -> Self {
        Self {
            ports,
            tx_cores,
            pool_size: default_pool_size(),
            pool_cache_size: default_pool_cache_size(),
            pin_workers: default_pin_workers(),
        }
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Bridge config served by the given transmit core
    pub fn for_core(&self, core: usize) -> Option<&PortBridgeConfig> {
        self.ports.iter().find(|p| p.lcore_tx == core)
    }

    pub fn port(&self, port_id: u16) -> Option<&PortBridgeConfig> {
        self.ports.iter().find(|p| p.port_id == port_id)
    }

    /// Check the topology and build the core -> port table
    ///
    /// Every transmit core must serve exactly one port and every port must
    /// be served by exactly one transmit core.
    pub fn validate(&self) -> Result<WorkerAssignment, ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }

        let mut by_core: HashMap<usize, u16> = HashMap::new();
        let mut port_ids = HashSet::new();
        for port in &self.ports {
            if !port_ids.insert(port.port_id) {
                return Err(ConfigError::DuplicatePort(port.port_id));
            }
            if port.name.is_empty() || port.name.len() >= libc::IFNAMSIZ {
                return Err(ConfigError::InvalidName {
                    port_id: port.port_id,
                    name: port.name.clone(),
                });
            }
            if let Some(first) = by_core.insert(port.lcore_tx, port.port_id) {
                return Err(ConfigError::SharedCore {
                    core: port.lcore_tx,
                    first,
                    second: port.port_id,
                });
            }
        }

        let mut seen = HashSet::new();
        let mut slots = Vec::with_capacity(self.tx_cores.len());
        for &core in &self.tx_cores {
            if !seen.insert(core) {
                return Err(ConfigError::DuplicateCore(core));
            }
            let port_id = *by_core.get(&core).ok_or(ConfigError::CoreWithoutPort(core))?;
            slots.push(WorkerSlot { core, port_id });
        }

        if let Some(port) = self.ports.iter().find(|p| !seen.contains(&p.lcore_tx)) {
            return Err(ConfigError::PortWithoutCore {
                port_id: port.port_id,
                core: port.lcore_tx,
            });
        }

        Ok(WorkerAssignment { slots })
    }
}

/// One egress worker: the core it runs on and the port it serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSlot {
    pub core: usize,
    pub port_id: u16,
}

/// Validated core -> port mapping, in transmit-core order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAssignment {
    slots: Vec<WorkerSlot>,
}

impl WorkerAssignment {
    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn port(port_id: u16, lcore_tx: usize) -> PortBridgeConfig {
        PortBridgeConfig {
            port_id,
            name: format!("vEth{port_id}"),
            lcore_tx,
            lcore_kthread: None,
            tx_queue_id: 0,
        }
    }

    #[test]
    fn test_validate_builds_assignment() {
        let config = BridgeConfig::new(vec![port(0, 2), port(1, 3)], vec![3, 2]);
        let assignment = config.validate().unwrap();

        assert_eq!(
            assignment.slots(),
            &[
                WorkerSlot { core: 3, port_id: 1 },
                WorkerSlot { core: 2, port_id: 0 },
            ]
        );
        assert_eq!(config.for_core(3).map(|p| p.port_id), Some(1));
        assert!(config.for_core(7).is_none());
    }

    #[test]
    fn test_core_without_port() {
        let config = BridgeConfig::new(vec![port(0, 2)], vec![2, 5]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CoreWithoutPort(5))
        ));
    }

    #[test]
    fn test_port_without_core() {
        let config = BridgeConfig::new(vec![port(0, 2), port(1, 4)], vec![2]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortWithoutCore { port_id: 1, core: 4 })
        ));
    }

    #[test]
    fn test_shared_core_rejected() {
        let config = BridgeConfig::new(vec![port(0, 2), port(1, 2)], vec![2]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SharedCore { core: 2, first: 0, second: 1 })
        ));
    }

    #[test]
    fn test_duplicate_port_and_bad_name() {
        let config = BridgeConfig::new(vec![port(0, 2), port(0, 3)], vec![2, 3]);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicatePort(0))));

        let mut long = port(0, 2);
        long.name = "a-very-long-interface-name".to_string();
        let config = BridgeConfig::new(vec![long], vec![2]);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidName { .. })));

        assert!(matches!(
            BridgeConfig::new(vec![], vec![]).validate(),
            Err(ConfigError::NoPorts)
        ));
    }

    #[test]
    fn test_load_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "ports": [
                    {{ "port_id": 0, "name": "vEth0", "lcore_tx": 1, "lcore_kthread": 3 }}
                ],
                "tx_cores": [1]
            }}"#
        )
        .unwrap();

        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.pool_size, NB_MBUF);
        assert_eq!(config.pool_cache_size, MEMPOOL_CACHE_SIZE);
        assert!(config.pin_workers);
        assert_eq!(config.ports[0].lcore_kthread, Some(3));
        assert_eq!(config.ports[0].tx_queue_id, 0);
    }

    #[test]
    fn test_load_rejects_invalid_topology() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "ports": [{{ "port_id": 0, "name": "vEth0", "lcore_tx": 1 }}], "tx_cores": [] }}"#
        )
        .unwrap();

        assert!(matches!(
            BridgeConfig::load(file.path()),
            Err(ConfigError::PortWithoutCore { .. })
        ));
    }
}
