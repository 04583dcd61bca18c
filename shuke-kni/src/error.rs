use std::io;

use thiserror::Error;

use crate::buffer::PoolError;
use crate::config::ConfigError;
use crate::port::PortError;

/// Startup and topology errors; none of these leave a usable bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid bridge configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("could not initialise buffer pool: {0}")]
    Pool(#[from] PoolError),

    #[error("port {port_id} is not present (driver reports {count} ports)")]
    PortMissing { port_id: u16, count: u16 },

    #[error("failed to query port {port_id}: {source}")]
    PortInfo {
        port_id: u16,
        #[source]
        source: PortError,
    },

    #[error("failed to create virtual interface {name} for port {port_id}: {source}")]
    VifAlloc {
        port_id: u16,
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start worker on core {core}: {source}")]
    WorkerLaunch {
        core: usize,
        #[source]
        source: io::Error,
    },

    #[error("virtual interface for port {0} has been released")]
    Released(u16),

    #[error("workers already started")]
    AlreadyStarted,
}
