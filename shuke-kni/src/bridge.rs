//! Bridge lifecycle: init, worker launch, teardown
//!
//! [`KniBridge`] owns everything the process-wide globals used to: the
//! buffer pool, the per-port counters, the shutdown token and one virtual
//! interface per configured port.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::buffer::{BufferPool, MBUF_DATA_SIZE, PoolConfig};
use crate::config::{BridgeConfig, PortBridgeConfig, WorkerAssignment};
use crate::egress::EgressLoop;
use crate::error::BridgeError;
use crate::ingress::IngressPath;
use crate::port::{PortConf, PortController};
use crate::reconfig::PortReconfigurator;
use crate::shutdown::ShutdownToken;
use crate::stats::{PortStatsSnapshot, StatsTable};
use crate::vif::{VifBackend, VifManager, VirtualInterface};
use crate::worker::{self, WorkerHandle};

/// Shared state handed to every bridge component
#[derive(Clone)]
pub struct BridgeContext {
    pub pool: Arc<BufferPool>,
    pub stats: Arc<StatsTable>,
    pub shutdown: ShutdownToken,
}

/// A configured port and its virtual interface (until released)
struct BridgeSlot {
    conf: PortBridgeConfig,
    vif: Option<Arc<dyn VirtualInterface>>,
}

pub struct KniBridge {
    config: BridgeConfig,
    assignment: WorkerAssignment,
    ctx: BridgeContext,
    ports: Arc<dyn PortController>,
    slots: Vec<BridgeSlot>,
    workers: Vec<WorkerHandle>,
    started: bool,
}

impl KniBridge {
    /// Create the buffer pool and one virtual interface per port
    ///
    /// Ports are bridged in configuration order. Any failure aborts the
    /// whole init; interfaces created before the failure are released.
    pub fn init(
        config: BridgeConfig,
        ports: Arc<dyn PortController>,
        backend: Arc<dyn VifBackend>,
        shutdown: ShutdownToken,
    ) -> Result<Self, BridgeError> {
        let assignment = config.validate()?;

        let count = ports.port_count();
        if let Some(port) = config.ports.iter().find(|p| p.port_id >= count) {
            return Err(BridgeError::PortMissing {
                port_id: port.port_id,
                count,
            });
        }

        let numa_node = worker::numa_node_of_core(config.ports[0].lcore_tx);
        let pool = Arc::new(BufferPool::new(PoolConfig {
            capacity: config.pool_size,
            cache_size: config.pool_cache_size,
            data_room: MBUF_DATA_SIZE,
            numa_node,
        })?);

        let nb_ports = config
            .ports
            .iter()
            .map(|p| p.port_id as usize + 1)
            .max()
            .unwrap_or(0);
        let stats = Arc::new(StatsTable::new(nb_ports));

        let handler = Arc::new(PortReconfigurator::new(
            Arc::clone(&ports),
            PortConf::default(),
        ));
        let manager = VifManager::new(backend, Arc::clone(&ports), handler, Arc::clone(&pool));

        let mut slots: Vec<BridgeSlot> = Vec::with_capacity(config.ports.len());
        for port in &config.ports {
            match manager.allocate(port) {
                Ok(vif) => slots.push(BridgeSlot {
                    conf: port.clone(),
                    vif: Some(vif),
                }),
                Err(e) => {
                    for slot in &mut slots {
                        release_slot(slot);
                    }
                    return Err(e);
                }
            }
        }

        info!(ports = slots.len(), numa_node = ?numa_node, "KNI bridge initialised");

        Ok(Self {
            config,
            assignment,
            ctx: BridgeContext {
                pool,
                stats,
                shutdown,
            },
            ports,
            slots,
            workers: Vec::new(),
            started: false,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    /// Launch one egress worker per assigned transmit core
    pub fn start_workers(&mut self) -> Result<(), BridgeError> {
        if self.started {
            return Err(BridgeError::AlreadyStarted);
        }
        self.started = true;

        for assigned in self.assignment.slots().to_vec() {
            // Validation guarantees a slot for every assigned port
            let Some((conf, Some(vif))) = self
                .slots
                .iter()
                .find(|s| s.conf.port_id == assigned.port_id)
                .map(|s| (&s.conf, s.vif.clone()))
            else {
                return Err(BridgeError::Released(assigned.port_id));
            };

            let worker = EgressLoop::new(
                conf,
                vif,
                Arc::clone(&self.ports),
                Arc::clone(&self.ctx.stats),
                Arc::clone(&self.ctx.pool),
            );
            let handle = worker::spawn_worker(
                assigned.core,
                self.config.pin_workers,
                worker,
                self.ctx.shutdown.clone(),
            )?;
            self.workers.push(handle);
        }
        Ok(())
    }

    pub fn running_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_running()).count()
    }

    pub fn virtual_interface(&self, port_id: u16) -> Option<Arc<dyn VirtualInterface>> {
        self.slots
            .iter()
            .find(|s| s.conf.port_id == port_id)
            .and_then(|s| s.vif.clone())
    }

    /// Path for handing a port's packets to the kernel
    pub fn ingress(&self, port_id: u16) -> Option<IngressPath> {
        self.virtual_interface(port_id)
            .map(|vif| IngressPath::new(port_id, vif, Arc::clone(&self.ctx.stats)))
    }

    /// Service pending kernel requests on every virtual interface
    pub fn handle_requests(&self) {
        for slot in &self.slots {
            if let Some(vif) = &slot.vif
                && let Err(e) = vif.handle_requests()
            {
                warn!(port_id = slot.conf.port_id, error = %e, "Failed to handle interface requests");
            }
        }
    }

    pub fn stats(&self) -> Vec<PortStatsSnapshot> {
        self.ctx
            .stats
            .snapshot(self.config.ports.iter().map(|p| p.port_id))
    }

    /// Stop the workers and release every virtual interface
    ///
    /// Safe to call more than once; interfaces are released only once.
    pub fn shutdown(&mut self) {
        self.ctx.shutdown.trigger();

        for handle in self.workers.drain(..) {
            let core = handle.core;
            if let Err(e) = handle.join() {
                error!(core, error = %e, "Egress worker failed");
            }
        }

        for slot in &mut self.slots {
            release_slot(slot);
        }
    }
}

fn release_slot(slot: &mut BridgeSlot) {
    if let Some(vif) = slot.vif.take() {
        match vif.release() {
            Ok(()) => info!(port_id = slot.conf.port_id, name = %vif.name(), "Virtual interface released"),
            Err(e) => error!(
                port_id = slot.conf.port_id,
                name = %vif.name(),
                error = %e,
                "Failed to release virtual interface"
            ),
        }
    }
}

impl Drop for KniBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
