use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use nix::libc;

use crate::buffer::{PoolBuffer, PoolCache};
use crate::port::{PortConf, PortController, PortError, PortInfo, PortResult};

/// A hardware action taken on a mock port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCall {
    Stop(u16),
    Configure(u16, PortConf),
    Start(u16),
}

#[derive(Default)]
struct State {
    calls: Vec<PortCall>,
    fail_stop: bool,
    fail_configure: bool,
    fail_start: bool,
    /// Max packets accepted per tx burst
    tx_limit: Option<usize>,
    transmitted: Vec<(u16, PoolBuffer)>,
    rx_pending: HashMap<u16, VecDeque<Vec<u8>>>,
}

/// Physical ports that live in memory
pub struct MockPorts {
    count: u16,
    state: Mutex<State>,
}

impl MockPorts {
    pub fn new(count: u16) -> Self {
        Self {
            count,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<PortCall> {
        self.state().calls.clone()
    }

    /// Most recent configuration applied to `port_id`
    pub fn last_conf(&self, port_id: u16) -> Option<PortConf> {
        self.state().calls.iter().rev().find_map(|call| match call {
            PortCall::Configure(id, conf) if *id == port_id => Some(*conf),
            _ => None,
        })
    }

    pub fn fail_stop(&self, fail: bool) {
        self.state().fail_stop = fail;
    }

    pub fn fail_configure(&self, fail: bool) {
        self.state().fail_configure = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        self.state().fail_start = fail;
    }

    pub fn set_tx_limit(&self, limit: Option<usize>) {
        self.state().tx_limit = limit;
    }

    /// Copies of the frames accepted on `port_id`, in transmit order
    pub fn transmitted(&self, port_id: u16) -> Vec<Vec<u8>> {
        self.state()
            .transmitted
            .iter()
            .filter(|(id, _)| *id == port_id)
            .map(|(_, buf)| buf.data().to_vec())
            .collect()
    }

    /// Hand the accepted buffers to the caller (dropping them frees them)
    pub fn take_transmitted(&self) -> Vec<PoolBuffer> {
        self.state()
            .transmitted
            .drain(..)
            .map(|(_, buf)| buf)
            .collect()
    }

    /// Queue a frame to be received on `port_id`
    ///
    /// # Panics
    /// Panics if the frame does not fit in a pool buffer.
    pub fn push_rx(&self, port_id: u16, frame: &[u8]) {
        super::vif::assert_fits(frame);
        self.state()
            .rx_pending
            .entry(port_id)
            .or_default()
            .push_back(frame.to_vec());
    }

    fn check(&self, port_id: u16) -> PortResult<()> {
        if port_id >= self.count {
            return Err(PortError::NotFound(port_id));
        }
        Ok(())
    }
}

impl PortController for MockPorts {
    fn port_count(&self) -> u16 {
        self.count
    }

    fn dev_info(&self, port_id: u16) -> PortResult<PortInfo> {
        self.check(port_id)?;
        Ok(PortInfo {
            pci_addr: Some(format!("0000:00:{:02x}.0", port_id)),
            pci_id: Some((0x8086, 0x10fb)),
            mac: [0x02, 0x00, 0x00, 0x00, 0x00, port_id as u8],
        })
    }

    fn stop(&self, port_id: u16) -> PortResult<()> {
        self.check(port_id)?;
        let mut state = self.state();
        state.calls.push(PortCall::Stop(port_id));
        if state.fail_stop {
            return Err(PortError::Driver(-libc::EBUSY));
        }
        Ok(())
    }

    fn configure(&self, port_id: u16, conf: &PortConf) -> PortResult<()> {
        self.check(port_id)?;
        let mut state = self.state();
        state.calls.push(PortCall::Configure(port_id, *conf));
        if state.fail_configure {
            return Err(PortError::Driver(-libc::EIO));
        }
        Ok(())
    }

    fn start(&self, port_id: u16) -> PortResult<()> {
        self.check(port_id)?;
        let mut state = self.state();
        state.calls.push(PortCall::Start(port_id));
        if state.fail_start {
            return Err(PortError::Driver(-libc::EIO));
        }
        Ok(())
    }

    fn rx_burst(
        &self,
        port_id: u16,
        _queue_id: u16,
        cache: &mut PoolCache,
        pkts: &mut Vec<PoolBuffer>,
        max: usize,
    ) -> usize {
        let mut state = self.state();
        let Some(queue) = state.rx_pending.get_mut(&port_id) else {
            return 0;
        };
        let mut received = 0;
        while received < max {
            let Some(frame) = queue.pop_front() else {
                break;
            };
            let Some(mut buf) = cache.alloc() else {
                queue.push_front(frame);
                break;
            };
            assert!(buf.fill(&frame), "frame does not fit in a pool buffer");
            pkts.push(buf);
            received += 1;
        }
        received
    }

    fn tx_burst(&self, port_id: u16, _queue_id: u16, pkts: &mut Vec<PoolBuffer>) -> usize {
        let mut state = self.state();
        let accepted = pkts.len().min(state.tx_limit.unwrap_or(usize::MAX));
        for buf in pkts.drain(..accepted) {
            state.transmitted.push((port_id, buf));
        }
        accepted
    }
}
