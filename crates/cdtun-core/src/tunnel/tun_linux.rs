//! Linux TUN device backend.
//!
//! Opens `/dev/net/tun` and configures the interface with
//! `IFF_TUN | IFF_NO_PI`, so reads and writes carry raw IP datagrams with
//! no packet-info prefix. Requires CAP_NET_ADMIN.

use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};

use super::{TunDevice, check_packet_len, check_read_len};

const TUN_PATH: &[u8] = b"/dev/net/tun\0";
const IFNAMSIZ: usize = 16;

// From <linux/if_tun.h>.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// `struct ifreq` as consumed by TUNSETIFF: name plus a flags short in the
/// request union, padded to the union's full width.
#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

struct Inner {
    fd: RawFd,
    closed: bool,
}

/// Linux TUN device handle.
pub struct LinuxTun {
    inner: Mutex<Inner>,
    name: String,
}

impl LinuxTun {
    /// Open the TUN device, suggesting `name_hint` to the kernel.
    pub fn open(name_hint: Option<&str>) -> Result<Self> {
        let fd = unsafe { libc::open(TUN_PATH.as_ptr().cast(), libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::from_device_io(
                io::Error::last_os_error(),
                "open /dev/net/tun",
            ));
        }

        let mut req = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        if let Some(hint) = name_hint {
            // Leave room for the NUL terminator.
            for (dst, src) in req.ifr_name[..IFNAMSIZ - 1].iter_mut().zip(hint.bytes()) {
                *dst = src;
            }
        }

        if unsafe { libc::ioctl(fd, TUNSETIFF, &mut req as *mut IfReq) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::from_device_io(err, "TUNSETIFF"));
        }

        if let Err(err) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let end = req.ifr_name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        let name = String::from_utf8_lossy(&req.ifr_name[..end]).into_owned();
        debug!(name, fd, "opened tun device");

        Ok(Self {
            inner: Mutex::new(Inner { fd, closed: false }),
            name,
        })
    }
}

impl TunDevice for LinuxTun {
    fn read_packet(&self, max_len: usize) -> Result<Vec<u8>> {
        check_read_len(max_len)?;
        let inner = self.inner.lock().expect("device lock");
        if inner.closed {
            return Err(Error::AlreadyClosed);
        }

        let mut buf = vec![0u8; max_len];
        let n = unsafe { libc::read(inner.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(Vec::new());
            }
            return Err(Error::Io(err));
        }

        buf.truncate(n as usize);
        Ok(buf)
    }

    fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        check_packet_len(packet.len())?;
        if packet.is_empty() {
            return Ok(0);
        }

        let inner = self.inner.lock().expect("device lock");
        if inner.closed {
            return Err(Error::AlreadyClosed);
        }

        let n = unsafe { libc::write(inner.fd, packet.as_ptr().cast(), packet.len()) };
        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    fn close(&self) {
        let mut inner = self.inner.lock().expect("device lock");
        if !inner.closed {
            unsafe { libc::close(inner.fd) };
            inner.closed = true;
            debug!(name = %self.name, "closed tun device");
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().expect("device lock").closed
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn handle_id(&self) -> i64 {
        let inner = self.inner.lock().expect("device lock");
        if inner.closed { -1 } else { inner.fd as i64 }
    }
}

impl Drop for LinuxTun {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Creating a real tun device needs CAP_NET_ADMIN; exercised by the
    // ignored test below when run as root.

    #[test]
    #[ignore = "requires CAP_NET_ADMIN"]
    fn open_read_close() {
        let tun = LinuxTun::open(Some("cdtun-test0")).unwrap();
        assert!(tun.name().starts_with("cdtun"));
        assert!(tun.handle_id() >= 0);

        // Non-blocking read on a quiet interface returns empty.
        let pkt = tun.read_packet(2048).unwrap();
        assert!(pkt.is_empty());

        tun.close();
        tun.close();
        assert!(tun.is_closed());
        assert_eq!(tun.handle_id(), -1);
        assert!(matches!(tun.read_packet(2048), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn ifreq_layout_matches_kernel() {
        // TUNSETIFF copies 40 bytes (IFNAMSIZ + union).
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }
}
