//! Per-port bridge counters
//!
//! Each port's counters are written only by the worker serving that port,
//! so relaxed atomics are enough. Readers may observe slightly stale values.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one bridged port
#[derive(Debug, Default)]
pub struct PortStats {
    /// Packets received from the physical port and sent to the virtual interface
    rx_packets: AtomicU64,
    /// Packets received from the physical port that the virtual interface refused
    rx_dropped: AtomicU64,
    /// Packets received from the virtual interface and sent to the physical port
    tx_packets: AtomicU64,
    /// Packets received from the virtual interface that the physical port refused
    tx_dropped: AtomicU64,
}

impl PortStats {
    #[inline]
    pub fn record_rx(&self, sent: u64, dropped: u64) {
        self.rx_packets.fetch_add(sent, Ordering::Relaxed);
        self.rx_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tx(&self, sent: u64, dropped: u64) {
        self.tx_packets.fetch_add(sent, Ordering::Relaxed);
        self.tx_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn snapshot(&self, port_id: u16) -> PortStatsSnapshot {
        PortStatsSnapshot {
            port_id,
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a port's counters, for reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PortStatsSnapshot {
    pub port_id: u16,
    pub rx_packets: u64,
    pub rx_dropped: u64,
    pub tx_packets: u64,
    pub tx_dropped: u64,
}

/// Counters for every port, indexed by port id
#[derive(Debug)]
pub struct StatsTable {
    ports: Vec<PortStats>,
}

impl StatsTable {
    /// Table covering port ids `0..nb_ports`
    pub fn new(nb_ports: usize) -> Self {
        Self {
            ports: (0..nb_ports).map(|_| PortStats::default()).collect(),
        }
    }

    #[inline]
    pub fn port(&self, port_id: u16) -> Option<&PortStats> {
        self.ports.get(port_id as usize)
    }

    pub fn snapshot(&self, port_ids: impl IntoIterator<Item = u16>) -> Vec<PortStatsSnapshot> {
        port_ids
            .into_iter()
            .filter_map(|id| self.port(id).map(|s| s.snapshot(id)))
            .collect()
    }
}
