//! Kernel-visible virtual interfaces
//!
//! Each bridged port gets exactly one virtual interface. The backend that
//! creates it is injected ([`VifBackend`]); [`tap::TapBackend`] is the Linux
//! TAP implementation.

pub mod tap;

pub use tap::TapBackend;

use std::io;
use std::sync::Arc;

use tracing::{error, info};

use crate::buffer::{BufferPool, MAX_PACKET_SIZE, PoolBuffer, PoolCache};
use crate::config::PortBridgeConfig;
use crate::error::BridgeError;
use crate::port::{PortController, PortInfo};
use crate::reconfig::{ReconfigError, ReconfigHandler};

/// Everything a backend needs to create one virtual interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VifConf {
    pub name: String,
    /// Core the kernel-side thread is bound to, if `force_bind`
    pub core_id: Option<usize>,
    pub force_bind: bool,
    /// Ties together virtual devices of the same physical port. The first
    /// device created in a group is its master.
    pub group_id: u16,
    pub mbuf_size: usize,
    pub dev_info: PortInfo,
}

/// Reconfiguration callbacks registered with a virtual interface
#[derive(Clone)]
pub struct VifOps {
    pub port_id: u16,
    handler: Arc<dyn ReconfigHandler>,
}

impl VifOps {
    pub fn new(port_id: u16, handler: Arc<dyn ReconfigHandler>) -> Self {
        Self { port_id, handler }
    }

    pub fn change_mtu(&self, new_mtu: u32) -> Result<(), ReconfigError> {
        self.handler.change_mtu(self.port_id, new_mtu)
    }

    pub fn config_network_if(&self, up: bool) -> Result<(), ReconfigError> {
        self.handler.config_network_if(self.port_id, up)
    }
}

/// A virtual interface the bridge exchanges packets with
///
/// `rx_burst` is called only by the port's egress worker and `tx_burst`
/// only by the ingress path, so each direction has a single caller.
pub trait VirtualInterface: Send + Sync {
    fn name(&self) -> &str;

    /// Drain up to `max` packets the kernel sent out of the interface
    fn rx_burst(&self, cache: &mut PoolCache, pkts: &mut Vec<PoolBuffer>, max: usize) -> usize;

    /// Deliver packets to the kernel
    ///
    /// Same contract as [`PortController::tx_burst`]: the accepted prefix is
    /// removed from `pkts`, the rest stays with the caller.
    fn tx_burst(&self, pkts: &mut Vec<PoolBuffer>) -> usize;

    /// Service pending kernel requests (MTU change, up/down)
    fn handle_requests(&self) -> io::Result<()>;

    /// Tear the interface down; later calls are no-ops
    fn release(&self) -> io::Result<()>;
}

/// Creates virtual interfaces
pub trait VifBackend: Send + Sync {
    fn alloc(
        &self,
        pool: &Arc<BufferPool>,
        conf: VifConf,
        ops: VifOps,
    ) -> io::Result<Arc<dyn VirtualInterface>>;
}

/// Builds device descriptors and allocates one virtual interface per port
pub struct VifManager {
    backend: Arc<dyn VifBackend>,
    ports: Arc<dyn PortController>,
    handler: Arc<dyn ReconfigHandler>,
    pool: Arc<BufferPool>,
}

impl VifManager {
    pub fn new(
        backend: Arc<dyn VifBackend>,
        ports: Arc<dyn PortController>,
        handler: Arc<dyn ReconfigHandler>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            backend,
            ports,
            handler,
            pool,
        }
    }

    pub fn vif_conf(&self, port: &PortBridgeConfig) -> Result<VifConf, BridgeError> {
        let dev_info =
            self.ports
                .dev_info(port.port_id)
                .map_err(|source| BridgeError::PortInfo {
                    port_id: port.port_id,
                    source,
                })?;

        Ok(VifConf {
            name: port.name.clone(),
            core_id: port.lcore_kthread,
            force_bind: port.lcore_kthread.is_some(),
            group_id: port.port_id,
            mbuf_size: MAX_PACKET_SIZE,
            dev_info,
        })
    }

    /// Create the virtual interface for a port
    pub fn allocate(
        &self,
        port: &PortBridgeConfig,
    ) -> Result<Arc<dyn VirtualInterface>, BridgeError> {
        let conf = self.vif_conf(port)?;
        let ops = VifOps::new(port.port_id, Arc::clone(&self.handler));

        let vif = self.backend.alloc(&self.pool, conf, ops).map_err(|source| {
            error!(port_id = port.port_id, name = %port.name, error = %source, "Failed to create virtual interface");
            BridgeError::VifAlloc {
                port_id: port.port_id,
                name: port.name.clone(),
                source,
            }
        })?;

        info!(
            port_id = port.port_id,
            name = %vif.name(),
            kthread_core = ?port.lcore_kthread,
            "Virtual interface created"
        );
        Ok(vif)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolConfig;
    use crate::port::PortConf;
    use crate::reconfig::PortReconfigurator;
    use crate::test_util::{MockPorts, MockVifBackend, PortCall};

    fn manager(ports: &Arc<MockPorts>, backend: &Arc<MockVifBackend>) -> VifManager {
        let pool = Arc::new(
            BufferPool::new(PoolConfig {
                capacity: 16,
                cache_size: 4,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        let handler = Arc::new(PortReconfigurator::new(ports.clone(), PortConf::default()));
        VifManager::new(backend.clone(), ports.clone(), handler, pool)
    }

    fn port(port_id: u16, kthread: Option<usize>) -> PortBridgeConfig {
        PortBridgeConfig {
            port_id,
            name: format!("vEth{port_id}"),
            lcore_tx: 1,
            lcore_kthread: kthread,
            tx_queue_id: 0,
        }
    }

    #[test]
    fn test_descriptor_fields() {
        let ports = Arc::new(MockPorts::new(2));
        let backend = Arc::new(MockVifBackend::new());
        let conf = manager(&ports, &backend).vif_conf(&port(1, Some(5))).unwrap();

        assert_eq!(conf.name, "vEth1");
        assert_eq!(conf.group_id, 1);
        assert_eq!(conf.core_id, Some(5));
        assert!(conf.force_bind);
        assert_eq!(conf.mbuf_size, MAX_PACKET_SIZE);
        assert_eq!(conf.dev_info, ports.dev_info(1).unwrap());

        let unbound = manager(&ports, &backend).vif_conf(&port(0, None)).unwrap();
        assert!(!unbound.force_bind);
    }

    #[test]
    fn test_callbacks_are_keyed_by_port() {
        let ports = Arc::new(MockPorts::new(2));
        let backend = Arc::new(MockVifBackend::new());
        manager(&ports, &backend).allocate(&port(1, None)).unwrap();

        let vif = backend.created().pop().unwrap();
        vif.request_mtu(9000);
        vif.handle_requests().unwrap();

        assert_eq!(ports.calls()[0], PortCall::Stop(1));
    }

    #[test]
    fn test_allocation_failure() {
        let ports = Arc::new(MockPorts::new(1));
        let backend = Arc::new(MockVifBackend::new());
        backend.fail_on(0);

        let err = manager(&ports, &backend)
            .allocate(&port(0, None))
            .err()
            .expect("allocation must fail");
        assert!(matches!(err, BridgeError::VifAlloc { port_id: 0, .. }));
    }

    #[test]
    fn test_missing_port_info() {
        let ports = Arc::new(MockPorts::new(1));
        let backend = Arc::new(MockVifBackend::new());
        let err = manager(&ports, &backend)
            .allocate(&port(3, None))
            .err()
            .expect("unknown port must fail");
        assert!(matches!(err, BridgeError::PortInfo { port_id: 3, .. }));
    }
}
