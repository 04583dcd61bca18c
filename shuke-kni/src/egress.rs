//! Egress bridge loop: virtual interface -> physical port
//!
//! One loop per transmit core. It busy-polls the virtual interface, bursts
//! whatever it drained onto the port's transmit queue and releases anything
//! the port refuses. There is no sleep or yield between iterations.

use std::sync::Arc;

use tracing::{error, info};

use crate::buffer::{BufferPool, MAX_PKT_BURST, PoolBuffer, PoolCache};
use crate::config::PortBridgeConfig;
use crate::port::PortController;
use crate::shutdown::ShutdownToken;
use crate::stats::StatsTable;
use crate::vif::VirtualInterface;

/// What happened to one burst
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstOutcome {
    pub drained: usize,
    pub sent: usize,
    pub dropped: usize,
}

/// State owned by one egress worker
pub struct EgressLoop {
    port_id: u16,
    tx_queue_id: u16,
    core: usize,
    vif: Arc<dyn VirtualInterface>,
    ports: Arc<dyn PortController>,
    stats: Arc<StatsTable>,
    cache: PoolCache,
    burst: Vec<PoolBuffer>,
}

impl EgressLoop {
    pub fn new(
        conf: &PortBridgeConfig,
        vif: Arc<dyn VirtualInterface>,
        ports: Arc<dyn PortController>,
        stats: Arc<StatsTable>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            port_id: conf.port_id,
            tx_queue_id: conf.tx_queue_id,
            core: conf.lcore_tx,
            vif,
            ports,
            stats,
            cache: PoolCache::new(pool),
            burst: Vec::with_capacity(MAX_PKT_BURST + 1),
        }
    }

    pub fn port_id(&self) -> u16 {
        self.port_id
    }

    /// Move one burst from the virtual interface to the port
    pub fn poll_once(&mut self) -> BurstOutcome {
        let num = self
            .vif
            .rx_burst(&mut self.cache, &mut self.burst, MAX_PKT_BURST);
        if num > MAX_PKT_BURST || self.burst.len() > MAX_PKT_BURST {
            error!(
                port_id = self.port_id,
                num,
                max = MAX_PKT_BURST,
                "Error receiving from virtual interface"
            );
            self.release_burst();
            return BurstOutcome::default();
        }

        let drained = self.burst.len();
        if drained == 0 {
            return BurstOutcome::default();
        }

        let sent = self
            .ports
            .tx_burst(self.port_id, self.tx_queue_id, &mut self.burst)
            .min(drained);
        // Whatever is left was refused by the port (queue full)
        let dropped = self.burst.len();
        self.release_burst();

        if let Some(stats) = self.stats.port(self.port_id) {
            stats.record_tx(sent as u64, dropped as u64);
        }

        BurstOutcome {
            drained,
            sent,
            dropped,
        }
    }

    fn release_burst(&mut self) {
        for buf in self.burst.drain(..) {
            self.cache.free(buf);
        }
    }

    /// Poll until `shutdown` is triggered
    pub fn run(mut self, shutdown: &ShutdownToken) {
        info!(
            core = self.core,
            port_id = self.port_id,
            vif = %self.vif.name(),
            "Egress worker is writing to port"
        );

        while !shutdown.is_triggered() {
            self.poll_once();
        }

        info!(core = self.core, port_id = self.port_id, "Egress worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolConfig;
    use crate::test_util::{MockPorts, MockVif, mock_vif};

    fn setup(capacity: usize) -> (Arc<BufferPool>, Arc<MockPorts>, Arc<MockVif>, EgressLoop) {
        let pool = Arc::new(
            BufferPool::new(PoolConfig {
                capacity,
                cache_size: 8,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        let ports = Arc::new(MockPorts::new(1));
        let vif = Arc::new(mock_vif(0, ports.clone()));
        let conf = PortBridgeConfig {
            port_id: 0,
            name: "vEth0".to_string(),
            lcore_tx: 1,
            lcore_kthread: None,
            tx_queue_id: 0,
        };
        let stats = Arc::new(StatsTable::new(1));
        let worker = EgressLoop::new(&conf, vif.clone(), ports.clone(), stats, pool.clone());
        (pool, ports, vif, worker)
    }

    #[test]
    fn test_backpressure_drops_tail() {
        let (pool, ports, vif, mut worker) = setup(128);
        for i in 0..32u8 {
            vif.send_from_kernel(&[i; 64]);
        }
        ports.set_tx_limit(Some(20));

        let outcome = worker.poll_once();
        assert_eq!(
            outcome,
            BurstOutcome {
                drained: 32,
                sent: 20,
                dropped: 12,
            }
        );

        let snap = worker.stats.port(0).unwrap().snapshot(0);
        assert_eq!(snap.tx_packets, 20);
        assert_eq!(snap.tx_dropped, 12);

        // Only the 20 accepted buffers are still out; the 12 dropped ones
        // went back to the pool.
        assert_eq!(pool.in_use(), 20);

        // Accepted prefix keeps submission order
        let sent = ports.transmitted(0);
        assert_eq!(sent.len(), 20);
        assert_eq!(sent[0][0], 0);
        assert_eq!(sent[19][0], 19);
    }

    #[test]
    fn test_sent_plus_dropped_equals_drained() {
        let (_pool, ports, vif, mut worker) = setup(256);
        let mut total_sent = 0;
        let mut total_dropped = 0;

        for (frames, limit) in [(5, None), (32, Some(31)), (17, Some(0)), (40, Some(10))] {
            for _ in 0..frames {
                vif.send_from_kernel(&[0xab; 60]);
            }
            ports.set_tx_limit(limit);

            loop {
                let outcome = worker.poll_once();
                if outcome.drained == 0 {
                    break;
                }
                assert!(outcome.drained <= MAX_PKT_BURST);
                assert_eq!(outcome.sent + outcome.dropped, outcome.drained);
                total_sent += outcome.sent;
                total_dropped += outcome.dropped;
            }
        }

        let snap = worker.stats.port(0).unwrap().snapshot(0);
        assert_eq!(snap.tx_packets, total_sent as u64);
        assert_eq!(snap.tx_dropped, total_dropped as u64);
        assert_eq!(total_sent + total_dropped, 5 + 32 + 17 + 40);
    }

    #[test]
    fn test_overrun_burst_is_discarded() {
        let (pool, ports, vif, mut worker) = setup(64);
        vif.set_overrun(true);

        let outcome = worker.poll_once();
        assert_eq!(outcome, BurstOutcome::default());
        assert!(ports.transmitted(0).is_empty());
        assert_eq!(pool.in_use(), 0);

        let snap = worker.stats.port(0).unwrap().snapshot(0);
        assert_eq!(snap.tx_packets + snap.tx_dropped, 0);
    }

    #[test]
    fn test_empty_poll() {
        let (_pool, ports, _vif, mut worker) = setup(16);
        assert_eq!(worker.poll_once(), BurstOutcome::default());
        assert!(ports.transmitted(0).is_empty());
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let (pool, ports, vif, worker) = setup(64);
        let shutdown = ShutdownToken::new();
        let token = shutdown.clone();

        let handle = std::thread::spawn(move || worker.run(&token));
        for _ in 0..8 {
            vif.send_from_kernel(&[1; 60]);
        }
        while ports.transmitted(0).len() < 8 {
            std::thread::yield_now();
        }

        shutdown.trigger();
        handle.join().unwrap();

        drop(ports.take_transmitted());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.available(), 64);
    }
}
