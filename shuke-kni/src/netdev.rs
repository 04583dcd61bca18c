//! Interface ioctls shared by the TAP backend and the raw-socket port
//!
//! Thin wrappers around SIOC[GS]IF* on a throwaway AF_INET socket.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::libc::{self, c_char, c_int, c_short};

/// ifreq with the flags member of the union
#[repr(C)]
struct IfReqFlags {
    ifr_name: [c_char; libc::IFNAMSIZ],
    ifr_flags: c_short,
    _pad: [u8; 22],
}

/// ifreq with the MTU member of the union
#[repr(C)]
struct IfReqMtu {
    ifr_name: [c_char; libc::IFNAMSIZ],
    ifr_mtu: c_int,
    _pad: [u8; 20],
}

/// ifreq with the hardware address member of the union
#[repr(C)]
struct IfReqHwAddr {
    ifr_name: [c_char; libc::IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
    _pad: [u8; 8],
}

/// Copy an interface name into an ifreq name field
pub(crate) fn ifname(name: &str) -> io::Result<[c_char; libc::IFNAMSIZ]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }
    let mut out = [0 as c_char; libc::IFNAMSIZ];
    for (i, &b) in bytes.iter().enumerate() {
        out[i] = b as c_char;
    }
    Ok(out)
}

fn control_socket() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socket() returned a fresh descriptor we now own
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ioctl<T>(request: libc::c_ulong, req: &mut T) -> io::Result<()> {
    let sock = control_socket()?;
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), request as _, req as *mut T) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn get_flags(name: &str) -> io::Result<c_short> {
    let mut req = IfReqFlags {
        ifr_name: ifname(name)?,
        ifr_flags: 0,
        _pad: [0; 22],
    };
    ioctl(libc::SIOCGIFFLAGS as _, &mut req)?;
    Ok(req.ifr_flags)
}

fn set_flags(name: &str, flags: c_short) -> io::Result<()> {
    let mut req = IfReqFlags {
        ifr_name: ifname(name)?,
        ifr_flags: flags,
        _pad: [0; 22],
    };
    ioctl(libc::SIOCSIFFLAGS as _, &mut req)
}

pub fn is_up(name: &str) -> io::Result<bool> {
    Ok(get_flags(name)? & libc::IFF_UP as c_short != 0)
}

/// Set or clear IFF_UP, leaving the other flags alone
pub fn set_up(name: &str, up: bool) -> io::Result<()> {
    let flags = get_flags(name)?;
    let flags = if up {
        flags | libc::IFF_UP as c_short
    } else {
        flags & !(libc::IFF_UP as c_short)
    };
    set_flags(name, flags)
}

pub fn get_mtu(name: &str) -> io::Result<u32> {
    let mut req = IfReqMtu {
        ifr_name: ifname(name)?,
        ifr_mtu: 0,
        _pad: [0; 20],
    };
    ioctl(libc::SIOCGIFMTU as _, &mut req)?;
    u32::try_from(req.ifr_mtu).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("negative MTU {} on {name}", req.ifr_mtu),
        )
    })
}

pub fn set_mtu(name: &str, mtu: u32) -> io::Result<()> {
    let ifr_mtu = c_int::try_from(mtu)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "MTU out of range"))?;
    let mut req = IfReqMtu {
        ifr_name: ifname(name)?,
        ifr_mtu,
        _pad: [0; 20],
    };
    ioctl(libc::SIOCSIFMTU as _, &mut req)
}

pub fn get_hw_addr(name: &str) -> io::Result<[u8; 6]> {
    // SAFETY: sockaddr is plain data, all-zero is valid
    let mut req = IfReqHwAddr {
        ifr_name: ifname(name)?,
        ifr_hwaddr: unsafe { std::mem::zeroed() },
        _pad: [0; 8],
    };
    ioctl(libc::SIOCGIFHWADDR as _, &mut req)?;
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(req.ifr_hwaddr.sa_data.iter()) {
        *dst = *src as u8;
    }
    Ok(mac)
}

pub fn set_hw_addr(name: &str, mac: [u8; 6]) -> io::Result<()> {
    // SAFETY: sockaddr is plain data, all-zero is valid
    let mut hwaddr: libc::sockaddr = unsafe { std::mem::zeroed() };
    hwaddr.sa_family = libc::ARPHRD_ETHER;
    for (dst, src) in hwaddr.sa_data.iter_mut().zip(mac.iter()) {
        *dst = *src as c_char;
    }
    let mut req = IfReqHwAddr {
        ifr_name: ifname(name)?,
        ifr_hwaddr: hwaddr,
        _pad: [0; 8],
    };
    ioctl(libc::SIOCSIFHWADDR as _, &mut req)
}
