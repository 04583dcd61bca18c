//! Ingress path: physical port -> virtual interface
//!
//! The fast-path engine hands packets it does not handle to
//! [`IngressPath::forward`]. Without an engine, [`spawn_ingress`] polls the
//! port directly and forwards everything.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::info;

use crate::buffer::{BufferPool, MAX_PKT_BURST, PoolBuffer, PoolCache};
use crate::egress::BurstOutcome;
use crate::port::PortController;
use crate::shutdown::ShutdownToken;
use crate::stats::StatsTable;
use crate::vif::VirtualInterface;

/// Idle backoff for the standalone receive loop
const IDLE_SLEEP: Duration = Duration::from_micros(50);

/// Handle for delivering one port's packets to its virtual interface
#[derive(Clone)]
pub struct IngressPath {
    port_id: u16,
    vif: Arc<dyn VirtualInterface>,
    stats: Arc<StatsTable>,
}

impl IngressPath {
    pub fn new(port_id: u16, vif: Arc<dyn VirtualInterface>, stats: Arc<StatsTable>) -> Self {
        Self {
            port_id,
            vif,
            stats,
        }
    }

    pub fn port_id(&self) -> u16 {
        self.port_id
    }

    /// Deliver `pkts` to the kernel, releasing whatever it refuses
    ///
    /// Leaves `pkts` empty.
    pub fn forward(&self, cache: &mut PoolCache, pkts: &mut Vec<PoolBuffer>) -> BurstOutcome {
        let drained = pkts.len();
        if drained == 0 {
            return BurstOutcome::default();
        }

        let sent = self.vif.tx_burst(pkts).min(drained);
        let dropped = pkts.len();
        for buf in pkts.drain(..) {
            cache.free(buf);
        }

        if let Some(stats) = self.stats.port(self.port_id) {
            stats.record_rx(sent as u64, dropped as u64);
        }

        BurstOutcome {
            drained,
            sent,
            dropped,
        }
    }
}

/// Poll the physical port and forward everything to the virtual interface
pub fn spawn_ingress(
    path: IngressPath,
    ports: Arc<dyn PortController>,
    pool: Arc<BufferPool>,
    shutdown: ShutdownToken,
) -> io::Result<JoinHandle<()>> {
    let port_id = path.port_id;
    thread::Builder::new()
        .name(format!("kni-rx-{port_id}"))
        .spawn(move || {
            info!(port_id, "Ingress worker started");
            let mut cache = PoolCache::new(pool);
            let mut burst = Vec::with_capacity(MAX_PKT_BURST);

            while !shutdown.is_triggered() {
                let n = ports.rx_burst(port_id, 0, &mut cache, &mut burst, MAX_PKT_BURST);
                if n == 0 {
                    thread::sleep(IDLE_SLEEP);
                    continue;
                }
                path.forward(&mut cache, &mut burst);
            }

            info!(port_id, "Ingress worker stopped");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolConfig;
    use crate::test_util::{MockPorts, mock_vif};

    #[test]
    fn test_forward_counts_rx() {
        let pool = Arc::new(
            BufferPool::new(PoolConfig {
                capacity: 32,
                cache_size: 4,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        let ports = Arc::new(MockPorts::new(1));
        let vif = Arc::new(mock_vif(0, ports));
        vif.set_accept_limit(Some(3));

        let stats = Arc::new(StatsTable::new(1));
        let path = IngressPath::new(0, vif.clone(), stats.clone());
        let mut cache = PoolCache::new(pool.clone());

        let mut burst = Vec::new();
        for i in 0..5u8 {
            let mut buf = cache.alloc().unwrap();
            assert!(buf.fill(&[i; 42]));
            burst.push(buf);
        }

        let outcome = path.forward(&mut cache, &mut burst);
        assert_eq!(outcome.sent, 3);
        assert_eq!(outcome.dropped, 2);
        assert!(burst.is_empty());
        assert_eq!(pool.in_use(), 0);

        let delivered = vif.delivered();
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[2][0], 2);

        let snap = stats.port(0).unwrap().snapshot(0);
        assert_eq!((snap.rx_packets, snap.rx_dropped), (3, 2));
    }

    #[test]
    fn test_standalone_ingress_forwards_port_traffic() {
        let pool = Arc::new(
            BufferPool::new(PoolConfig {
                capacity: 32,
                cache_size: 4,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        let ports = Arc::new(MockPorts::new(1));
        let vif = Arc::new(mock_vif(0, ports.clone()));
        let stats = Arc::new(StatsTable::new(1));
        let shutdown = ShutdownToken::new();

        for _ in 0..4 {
            ports.push_rx(0, &[0x11; 60]);
        }

        let path = IngressPath::new(0, vif.clone(), stats.clone());
        let handle = spawn_ingress(path, ports, pool.clone(), shutdown.clone()).unwrap();
        while vif.delivered().len() < 4 {
            thread::yield_now();
        }
        shutdown.trigger();
        handle.join().unwrap();

        assert_eq!(stats.port(0).unwrap().snapshot(0).rx_packets, 4);
        assert_eq!(pool.in_use(), 0);
    }
}
