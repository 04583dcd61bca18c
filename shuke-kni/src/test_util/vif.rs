use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::{BufferPool, MAX_PACKET_SIZE, PoolBuffer, PoolCache};
use crate::port::PortConf;
use crate::reconfig::PortReconfigurator;
use crate::vif::{VifBackend, VifConf, VifOps, VirtualInterface};

use super::MockPorts;

/// A request the kernel side makes of the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VifRequest {
    Mtu(u32),
    Link(bool),
}

#[derive(Default)]
struct State {
    /// Frames the kernel sent out of the interface
    outbound: VecDeque<Vec<u8>>,
    /// Frames delivered to the kernel
    delivered: Vec<Vec<u8>>,
    accept_limit: Option<usize>,
    requests: VecDeque<VifRequest>,
    /// Errnos returned by rejected requests
    rejected: Vec<i32>,
    /// Report one packet more than the burst bound allows
    overrun: bool,
}

/// Virtual interface whose kernel side is driven by the test
pub struct MockVif {
    conf: VifConf,
    ops: VifOps,
    state: Mutex<State>,
    releases: AtomicUsize,
}

impl MockVif {
    pub fn new(conf: VifConf, ops: VifOps) -> Self {
        Self {
            conf,
            ops,
            state: Mutex::new(State::default()),
            releases: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn conf(&self) -> &VifConf {
        &self.conf
    }

    pub fn port_id(&self) -> u16 {
        self.ops.port_id
    }

    /// Queue a frame as if the kernel had sent it out of the interface
    ///
    /// # Panics
    /// Panics if the frame does not fit in a pool buffer.
    pub fn send_from_kernel(&self, frame: &[u8]) {
        assert_fits(frame);
        self.state().outbound.push_back(frame.to_vec());
    }

    pub fn pending_outbound(&self) -> usize {
        self.state().outbound.len()
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.state().delivered.clone()
    }

    pub fn set_accept_limit(&self, limit: Option<usize>) {
        self.state().accept_limit = limit;
    }

    pub fn set_overrun(&self, overrun: bool) {
        self.state().overrun = overrun;
    }

    pub fn request_mtu(&self, mtu: u32) {
        self.state().requests.push_back(VifRequest::Mtu(mtu));
    }

    pub fn request_link(&self, up: bool) {
        self.state().requests.push_back(VifRequest::Link(up));
    }

    pub fn rejected(&self) -> Vec<i32> {
        self.state().rejected.clone()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl VirtualInterface for MockVif {
    fn name(&self) -> &str {
        &self.conf.name
    }

    fn rx_burst(&self, cache: &mut PoolCache, pkts: &mut Vec<PoolBuffer>, max: usize) -> usize {
        let mut state = self.state();
        if state.overrun {
            return cache.alloc_bulk(pkts, max + 1);
        }
        let mut received = 0;
        while received < max {
            let Some(frame) = state.outbound.pop_front() else {
                break;
            };
            let Some(mut buf) = cache.alloc() else {
                state.outbound.push_front(frame);
                break;
            };
            assert!(buf.fill(&frame), "frame does not fit in a pool buffer");
            pkts.push(buf);
            received += 1;
        }
        received
    }

    fn tx_burst(&self, pkts: &mut Vec<PoolBuffer>) -> usize {
        let mut state = self.state();
        let accepted = pkts.len().min(state.accept_limit.unwrap_or(usize::MAX));
        for buf in pkts.drain(..accepted) {
            state.delivered.push(buf.data().to_vec());
        }
        accepted
    }

    fn handle_requests(&self) -> io::Result<()> {
        let requests: Vec<_> = self.state().requests.drain(..).collect();
        for request in requests {
            let result = match request {
                VifRequest::Mtu(mtu) => self.ops.change_mtu(mtu),
                VifRequest::Link(up) => self.ops.config_network_if(up),
            };
            if let Err(e) = result {
                self.state().rejected.push(e.errno());
            }
        }
        Ok(())
    }

    fn release(&self) -> io::Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(super) fn assert_fits(frame: &[u8]) {
    assert!(
        frame.len() <= MAX_PACKET_SIZE,
        "{}-byte frame exceeds the {MAX_PACKET_SIZE}-byte buffer",
        frame.len()
    );
}

/// Backend handing out [`MockVif`]s
#[derive(Default)]
pub struct MockVifBackend {
    created: Mutex<Vec<Arc<MockVif>>>,
    fail_on: Mutex<Option<u16>>,
}

impl MockVifBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make allocation fail for `port_id`
    pub fn fail_on(&self, port_id: u16) {
        *self.fail_on.lock().unwrap() = Some(port_id);
    }

    /// Interfaces created so far, in creation order
    pub fn created(&self) -> Vec<Arc<MockVif>> {
        self.created.lock().unwrap().clone()
    }

    pub fn vif(&self, port_id: u16) -> Option<Arc<MockVif>> {
        self.created()
            .into_iter()
            .find(|v| v.port_id() == port_id)
    }
}

impl VifBackend for MockVifBackend {
    fn alloc(
        &self,
        _pool: &Arc<BufferPool>,
        conf: VifConf,
        ops: VifOps,
    ) -> io::Result<Arc<dyn VirtualInterface>> {
        if *self.fail_on.lock().unwrap() == Some(ops.port_id) {
            return Err(io::Error::other("mock allocation failure"));
        }
        let vif = Arc::new(MockVif::new(conf, ops));
        self.created.lock().unwrap().push(Arc::clone(&vif));
        Ok(vif)
    }
}

/// Standalone mock interface for `port_id`, reconfiguring `ports`
pub fn mock_vif(port_id: u16, ports: Arc<MockPorts>) -> MockVif {
    let conf = VifConf {
        name: format!("vEth{port_id}"),
        core_id: None,
        force_bind: false,
        group_id: port_id,
        mbuf_size: MAX_PACKET_SIZE,
        dev_info: Default::default(),
    };
    let handler = Arc::new(PortReconfigurator::new(ports, PortConf::default()));
    MockVif::new(conf, VifOps::new(port_id, handler))
}
