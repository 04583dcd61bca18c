//! Physical port abstraction
//!
//! The bridge never talks to a NIC driver directly. Everything it needs
//! (burst I/O, stop/configure/start, port count, hardware descriptor) goes
//! through [`PortController`].

pub mod raw;

pub use raw::RawSocketPorts;

use std::io;

use nix::libc;
use thiserror::Error;

use crate::buffer::{PoolBuffer, PoolCache};

/// Maximum standard Ethernet frame length, FCS included
pub const ETHER_MAX_LEN: u32 = 1518;

/// Ethernet header size
pub const ETHER_HDR_LEN: u32 = 14;

/// Ethernet frame check sequence size
pub const ETHER_CRC_LEN: u32 = 4;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port {0} does not exist")]
    NotFound(u16),

    #[error("driver returned {0}")]
    Driver(i32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PortError {
    /// Negative errno equivalent, as a driver would report it
    pub fn errno(&self) -> i32 {
        match self {
            PortError::NotFound(_) => -libc::ENODEV,
            PortError::Driver(code) => *code,
            PortError::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type PortResult<T> = Result<T, PortError>;

/// Receive-side hardware settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMode {
    pub header_split: bool,
    pub hw_ip_checksum: bool,
    pub hw_vlan_filter: bool,
    pub jumbo_frame: bool,
    pub hw_strip_crc: bool,
    /// Largest frame the port accepts, header and FCS included
    pub max_rx_pkt_len: u32,
}

/// Hardware configuration applied with [`PortController::configure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConf {
    pub rxmode: RxMode,
    pub nb_rx_queues: u16,
    pub nb_tx_queues: u16,
}

impl Default for PortConf {
    /// All offloads off, standard frames, one queue each way
    fn default() -> Self {
        Self {
            rxmode: RxMode {
                header_split: false,
                hw_ip_checksum: false,
                hw_vlan_filter: false,
                jumbo_frame: false,
                hw_strip_crc: false,
                max_rx_pkt_len: ETHER_MAX_LEN,
            },
            nb_rx_queues: 1,
            nb_tx_queues: 1,
        }
    }
}

impl PortConf {
    /// Derive a configuration for a new MTU
    ///
    /// Jumbo frames are enabled above the standard frame size, and the max
    /// receive length becomes `mtu + header + FCS`. Returns `None` if that
    /// length does not fit in a `u32`.
    pub fn with_mtu(&self, mtu: u32) -> Option<Self> {
        let max_rx_pkt_len = mtu.checked_add(ETHER_HDR_LEN + ETHER_CRC_LEN)?;
        let mut conf = *self;
        conf.rxmode.jumbo_frame = mtu > ETHER_MAX_LEN;
        conf.rxmode.max_rx_pkt_len = max_rx_pkt_len;
        Some(conf)
    }

    /// MTU implied by `max_rx_pkt_len`
    pub fn mtu(&self) -> u32 {
        self.rxmode
            .max_rx_pkt_len
            .saturating_sub(ETHER_HDR_LEN + ETHER_CRC_LEN)
    }
}

/// Hardware descriptor of a physical port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    /// Bus address of the device, e.g. "0000:03:00.0"
    pub pci_addr: Option<String>,
    /// PCI vendor and device id
    pub pci_id: Option<(u16, u16)>,
    pub mac: [u8; 6],
}

/// Driver primitives the bridge consumes
///
/// Burst calls never block: they move whatever is available and return.
pub trait PortController: Send + Sync {
    /// Number of ports the driver exposes
    fn port_count(&self) -> u16;

    fn dev_info(&self, port_id: u16) -> PortResult<PortInfo>;

    fn stop(&self, port_id: u16) -> PortResult<()>;

    fn configure(&self, port_id: u16, conf: &PortConf) -> PortResult<()>;

    fn start(&self, port_id: u16) -> PortResult<()>;

    /// Receive up to `max` packets into `pkts`, allocating from `cache`
    fn rx_burst(
        &self,
        port_id: u16,
        queue_id: u16,
        cache: &mut PoolCache,
        pkts: &mut Vec<PoolBuffer>,
        max: usize,
    ) -> usize;

    /// Transmit a burst in order
    ///
    /// The port takes ownership of the accepted prefix, removing it from the
    /// front of `pkts`, and returns how many it accepted. Rejected buffers
    /// stay in `pkts` for the caller to release.
    fn tx_burst(&self, port_id: u16, queue_id: u16, pkts: &mut Vec<PoolBuffer>) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jumbo_mtu() {
        let conf = PortConf::default().with_mtu(9000).unwrap();
        assert!(conf.rxmode.jumbo_frame);
        assert_eq!(conf.rxmode.max_rx_pkt_len, 9018);
        assert_eq!(conf.mtu(), 9000);
    }

    #[test]
    fn test_standard_mtu() {
        let conf = PortConf::default()
            .with_mtu(9000)
            .and_then(|c| c.with_mtu(1500))
            .unwrap();
        assert!(!conf.rxmode.jumbo_frame);
        assert_eq!(conf.rxmode.max_rx_pkt_len, 1518);
        assert_eq!(conf.nb_rx_queues, 1);
        assert_eq!(conf.nb_tx_queues, 1);
    }

    #[test]
    fn test_oversized_mtu_is_rejected() {
        assert!(PortConf::default().with_mtu(u32::MAX).is_none());
        assert!(PortConf::default().with_mtu(u32::MAX - 18).is_some());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(PortError::NotFound(3).errno(), -libc::ENODEV);
        assert_eq!(PortError::Driver(-22).errno(), -22);
        let io = PortError::Io(io::Error::from_raw_os_error(libc::EBUSY));
        assert_eq!(io.errno(), -libc::EBUSY);
    }
}
