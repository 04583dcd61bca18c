//! TAP-backed virtual interfaces
//!
//! The kernel does not call back into a TAP owner, so administrative
//! changes are picked up by [`TapDevice::handle_requests`] polling the
//! interface MTU and IFF_UP flag.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use nix::libc;
use tracing::{debug, info, warn};

use super::{VifBackend, VifConf, VifOps, VirtualInterface};
use crate::buffer::{BufferPool, PoolBuffer, PoolCache};
use crate::netdev;

/// TUN/TAP flags from linux/if_tun.h
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for TUN/TAP device configuration
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Creates [`TapDevice`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct TapBackend;

impl VifBackend for TapBackend {
    fn alloc(
        &self,
        _pool: &Arc<BufferPool>,
        conf: VifConf,
        ops: VifOps,
    ) -> io::Result<Arc<dyn VirtualInterface>> {
        let tap = TapDevice::create(&conf, ops)?;
        Ok(Arc::new(tap))
    }
}

/// Layer 2 TAP device standing in for one physical port
pub struct TapDevice {
    name: String,
    file: File,
    ops: VifOps,
    /// Last MTU seen on the interface
    mtu: AtomicU32,
    /// Last IFF_UP state seen on the interface
    up: AtomicBool,
    released: AtomicBool,
}

impl TapDevice {
    /// Create the TAP device described by `conf`
    pub fn create(conf: &VifConf, ops: VifOps) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let ifr = IfReq {
            ifr_name: netdev::ifname(&conf.name)?,
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        if conf.dev_info.mac != [0; 6]
            && let Err(e) = netdev::set_hw_addr(&conf.name, conf.dev_info.mac)
        {
            warn!(name = %conf.name, error = %e, "Failed to set TAP MAC address");
        }

        if conf.force_bind {
            debug!(
                name = %conf.name,
                core_id = ?conf.core_id,
                "TAP devices have no kernel thread, core binding ignored"
            );
        }

        let mtu = netdev::get_mtu(&conf.name)?;
        let up = netdev::is_up(&conf.name)?;

        info!(
            name = %conf.name,
            port_id = ops.port_id,
            group_id = conf.group_id,
            pci_addr = ?conf.dev_info.pci_addr,
            mtu,
            "TAP device created"
        );

        Ok(Self {
            name: conf.name.clone(),
            file,
            ops,
            mtu: AtomicU32::new(mtu),
            up: AtomicBool::new(up),
            released: AtomicBool::new(false),
        })
    }
}

impl VirtualInterface for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn rx_burst(&self, cache: &mut PoolCache, pkts: &mut Vec<PoolBuffer>, max: usize) -> usize {
        if self.released.load(Ordering::Relaxed) {
            return 0;
        }
        let mut received = 0;
        while received < max {
            let Some(mut buf) = cache.alloc() else {
                break;
            };
            match (&self.file).read(buf.write_area()) {
                Ok(n) if n > 0 => {
                    buf.set_len(n);
                    pkts.push(buf);
                    received += 1;
                }
                Ok(_) => {
                    cache.free(buf);
                    break;
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        debug!(name = %self.name, error = %e, "TAP read failed");
                    }
                    cache.free(buf);
                    break;
                }
            }
        }
        received
    }

    fn tx_burst(&self, pkts: &mut Vec<PoolBuffer>) -> usize {
        if self.released.load(Ordering::Relaxed) {
            return 0;
        }
        let mut accepted = 0;
        for buf in pkts.iter() {
            match (&self.file).write(buf.data()) {
                Ok(_) => accepted += 1,
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        debug!(name = %self.name, error = %e, "TAP write failed");
                    }
                    break;
                }
            }
        }
        pkts.drain(..accepted);
        accepted
    }

    fn handle_requests(&self) -> io::Result<()> {
        if self.released.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mtu = netdev::get_mtu(&self.name)?;
        if self.mtu.swap(mtu, Ordering::Relaxed) != mtu
            && let Err(e) = self.ops.change_mtu(mtu)
        {
            warn!(name = %self.name, mtu, errno = e.errno(), error = %e, "MTU change rejected");
        }

        let up = netdev::is_up(&self.name)?;
        if self.up.swap(up, Ordering::Relaxed) != up
            && let Err(e) = self.ops.config_network_if(up)
        {
            warn!(name = %self.name, up, errno = e.errno(), error = %e, "Link change rejected");
        }

        Ok(())
    }

    fn release(&self) -> io::Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // The device itself disappears once the last handle closes the fd
        netdev::set_up(&self.name, false)?;
        info!(name = %self.name, "TAP device released");
        Ok(())
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        debug!(name = %self.name, "TAP device closed");
    }
}
