//! AF_PACKET-backed physical ports
//!
//! Lets the bridge run against ordinary Linux interfaces (veth pairs, test
//! NICs) when no kernel-bypass driver is present. Port ids are indices into
//! the interface list given to [`RawSocketPorts::open`].

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::libc;
use nix::net::if_::if_nametoindex;
use tracing::{debug, info};

use super::{PortConf, PortController, PortError, PortInfo, PortResult};
use crate::buffer::{PoolBuffer, PoolCache};
use crate::netdev;

/// One raw socket bound to one interface
struct RawPort {
    name: String,
    fd: OwnedFd,
}

/// Physical ports backed by AF_PACKET sockets
pub struct RawSocketPorts {
    ports: Vec<RawPort>,
}

impl RawSocketPorts {
    /// Open one raw socket per interface, in port id order
    pub fn open(interfaces: &[String]) -> io::Result<Self> {
        let ports = interfaces
            .iter()
            .map(|name| RawPort::open(name))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { ports })
    }

    fn port(&self, port_id: u16) -> PortResult<&RawPort> {
        self.ports
            .get(port_id as usize)
            .ok_or(PortError::NotFound(port_id))
    }
}

impl RawPort {
    fn open(name: &str) -> io::Result<Self> {
        let ifindex = if_nametoindex(name).map_err(io::Error::from)?;
        let protocol = (libc::ETH_P_ALL as u16).to_be();

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: socket() returned a fresh descriptor we now own
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: sockaddr_ll is plain data, all-zero is valid
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex as i32;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name, ifindex, "Raw socket port opened");
        Ok(Self {
            name: name.to_string(),
            fd,
        })
    }

    /// Receive one inbound frame; `Ok(None)` when nothing is pending
    fn recv(&self, buf: &mut PoolBuffer) -> io::Result<Option<usize>> {
        loop {
            // SAFETY: sockaddr_ll is plain data, all-zero is valid
            let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
            let mut from_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            let area = buf.write_area();
            let n = unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    area.as_mut_ptr().cast(),
                    area.len(),
                    libc::MSG_DONTWAIT,
                    &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                    &mut from_len,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(None);
                }
                return Err(err);
            }
            // Our own transmissions are looped back to packet sockets
            if from.sll_pkttype == libc::PACKET_OUTGOING as u8 {
                continue;
            }
            return Ok(Some(n as usize));
        }
    }

    /// Send one frame; false when the socket would block
    fn send(&self, frame: &[u8]) -> io::Result<bool> {
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::ENOBUFS)
            {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(true)
    }
}

/// Read the PCI address and ids from sysfs, if the interface has a device
fn pci_identity(name: &str) -> (Option<String>, Option<(u16, u16)>) {
    let device = format!("/sys/class/net/{name}/device");
    let addr = std::fs::read_link(&device)
        .ok()
        .and_then(|p| p.file_name().map(|f| f.to_string_lossy().into_owned()));

    let read_hex = |file: &str| {
        std::fs::read_to_string(format!("{device}/{file}"))
            .ok()
            .and_then(|s| u16::from_str_radix(s.trim().trim_start_matches("0x"), 16).ok())
    };
    let id = read_hex("vendor").zip(read_hex("device"));
    (addr, id)
}

impl PortController for RawSocketPorts {
    fn port_count(&self) -> u16 {
        self.ports.len() as u16
    }

    fn dev_info(&self, port_id: u16) -> PortResult<PortInfo> {
        let port = self.port(port_id)?;
        let (pci_addr, pci_id) = pci_identity(&port.name);
        Ok(PortInfo {
            pci_addr,
            pci_id,
            mac: netdev::get_hw_addr(&port.name)?,
        })
    }

    fn stop(&self, port_id: u16) -> PortResult<()> {
        let port = self.port(port_id)?;
        netdev::set_up(&port.name, false)?;
        debug!(port_id, name = %port.name, "Port stopped");
        Ok(())
    }

    fn configure(&self, port_id: u16, conf: &PortConf) -> PortResult<()> {
        let port = self.port(port_id)?;
        netdev::set_mtu(&port.name, conf.mtu())?;
        debug!(
            port_id,
            name = %port.name,
            mtu = conf.mtu(),
            jumbo_frame = conf.rxmode.jumbo_frame,
            "Port configured"
        );
        Ok(())
    }

    fn start(&self, port_id: u16) -> PortResult<()> {
        let port = self.port(port_id)?;
        netdev::set_up(&port.name, true)?;
        debug!(port_id, name = %port.name, "Port started");
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
        let Ok(port) = self.port(port_id) else {
            return 0;
        };
        let mut received = 0;
        while received < max {
            let Some(mut buf) = cache.alloc() else {
                break;
            };
            match port.recv(&mut buf) {
                Ok(Some(n)) => {
                    buf.set_len(n);
                    pkts.push(buf);
                    received += 1;
                }
                Ok(None) => {
                    cache.free(buf);
                    break;
                }
                Err(e) => {
                    debug!(port_id, error = %e, "Raw socket receive failed");
                    cache.free(buf);
                    break;
                }
            }
        }
        received
    }

    fn tx_burst(&self, port_id: u16, _queue_id: u16, pkts: &mut Vec<PoolBuffer>) -> usize {
        let Ok(port) = self.port(port_id) else {
            return 0;
        };
        let mut accepted = 0;
        for buf in pkts.iter() {
            match port.send(buf.data()) {
                Ok(true) => accepted += 1,
                Ok(false) => break,
                Err(e) => {
                    debug!(port_id, error = %e, "Raw socket send failed");
                    break;
                }
            }
        }
        // Frames are copied into the kernel, so the buffers can go back now
        pkts.drain(..accepted);
        accepted
    }
}
