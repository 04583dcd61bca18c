//! Hardware reconfiguration requested from the kernel side
//!
//! These handlers run on whatever thread services virtual-interface
//! requests, never on an egress worker. The only serialization against the
//! egress loop is that the port is stopped before it is reconfigured.

use std::sync::Arc;

use nix::libc;
use thiserror::Error;
use tracing::{error, info};

use crate::port::{PortConf, PortController, PortError};

#[derive(Debug, Error)]
pub enum ReconfigError {
    #[error("invalid port id {0}")]
    InvalidPort(u16),

    #[error("MTU {mtu} is out of range for port {port_id}")]
    InvalidMtu { port_id: u16, mtu: u32 },

    #[error("failed to stop port {port_id}: {source}")]
    Stop {
        port_id: u16,
        #[source]
        source: PortError,
    },

    #[error("failed to reconfigure port {port_id}: {source}")]
    Configure {
        port_id: u16,
        #[source]
        source: PortError,
    },

    #[error("failed to restart port {port_id}: {source}")]
    Start {
        port_id: u16,
        #[source]
        source: PortError,
    },
}

impl ReconfigError {
    /// Negative errno for callers that speak the driver convention
    pub fn errno(&self) -> i32 {
        match self {
            ReconfigError::InvalidPort(_) | ReconfigError::InvalidMtu { .. } => -libc::EINVAL,
            ReconfigError::Stop { source, .. }
            | ReconfigError::Configure { source, .. }
            | ReconfigError::Start { source, .. } => source.errno(),
        }
    }
}

/// Callbacks a virtual interface invokes on administrative actions
pub trait ReconfigHandler: Send + Sync {
    fn change_mtu(&self, port_id: u16, new_mtu: u32) -> Result<(), ReconfigError>;

    fn config_network_if(&self, port_id: u16, up: bool) -> Result<(), ReconfigError>;
}

/// Applies kernel reconfiguration requests to the physical ports
pub struct PortReconfigurator {
    ports: Arc<dyn PortController>,
    /// Configuration every port was brought up with
    base: PortConf,
}

impl PortReconfigurator {
    pub fn new(ports: Arc<dyn PortController>, base: PortConf) -> Self {
        Self { ports, base }
    }

    fn check_port(&self, port_id: u16) -> Result<(), ReconfigError> {
        if port_id >= self.ports.port_count() {
            error!(port_id, "Invalid port id");
            return Err(ReconfigError::InvalidPort(port_id));
        }
        Ok(())
    }
}

impl ReconfigHandler for PortReconfigurator {
    fn change_mtu(&self, port_id: u16, new_mtu: u32) -> Result<(), ReconfigError> {
        self.check_port(port_id)?;

        let conf = self.base.with_mtu(new_mtu).ok_or_else(|| {
            error!(port_id, new_mtu, "MTU out of range");
            ReconfigError::InvalidMtu {
                port_id,
                mtu: new_mtu,
            }
        })?;

        info!(port_id, new_mtu, "Changing port MTU");

        self.ports.stop(port_id).map_err(|source| {
            error!(port_id, stage = "stop", error = %source, "Failed to stop port");
            ReconfigError::Stop { port_id, source }
        })?;

        self.ports.configure(port_id, &conf).map_err(|source| {
            error!(port_id, stage = "configure", error = %source, "Failed to reconfigure port");
            ReconfigError::Configure { port_id, source }
        })?;

        self.ports.start(port_id).map_err(|source| {
            error!(port_id, stage = "start", error = %source, "Failed to restart port");
            ReconfigError::Start { port_id, source }
        })?;

        Ok(())
    }

    fn config_network_if(&self, port_id: u16, up: bool) -> Result<(), ReconfigError> {
        self.check_port(port_id)?;

        // Link state is not propagated to the port
        info!(
            port_id,
            state = if up { "up" } else { "down" },
            "Configure network interface"
        );
        Ok(())
    }
}
