//! Darwin utun backend.
//!
//! utun devices are kernel control sockets: open
//! `PF_SYSTEM/SOCK_DGRAM/SYSPROTO_CONTROL`, resolve the
//! `com.apple.net.utun_control` id with `CTLIOCGINFO`, and `connect` to a
//! unit. Every read and write carries a 4-byte big-endian protocol-family
//! prefix, stripped and prepended here so callers see raw IPv6 datagrams.

use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;

use tracing::debug;

use crate::constants::UTUN_FAMILY_PREFIX_LEN;
use crate::error::{Error, Result};

use super::frame::{prepend_family_header, strip_family_header, utun_unit_from_hint};
use super::{TunDevice, check_packet_len, check_read_len};

const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
const MAX_KCTL_NAME: usize = 96;

// From <sys/kern_control.h> and <sys/sys_domain.h>.
const CTLIOCGINFO: libc::c_ulong = 0xC064_4E03; // _IOWR('N', 3, struct ctl_info)
const AF_SYSTEM: u8 = 32;
const AF_SYS_CONTROL: u16 = 2;
const UTUN_OPT_IFNAME: libc::c_int = 2;

/// The kernel rejects units at or above this bound.
const MAX_UTUN_UNIT: u32 = 255;

#[repr(C)]
struct CtlInfo {
    ctl_id: u32,
    ctl_name: [u8; MAX_KCTL_NAME],
}

#[repr(C)]
struct SockaddrCtl {
    sc_len: u8,
    sc_family: u8,
    ss_sysaddr: u16,
    sc_id: u32,
    sc_unit: u32,
    sc_reserved: [u32; 5],
}

struct Inner {
    fd: RawFd,
    closed: bool,
}

/// Darwin utun device handle.
pub struct DarwinTun {
    inner: Mutex<Inner>,
    name: String,
}

impl DarwinTun {
    /// Open a utun device.
    ///
    /// A `utun<N>` hint requests unit N+1 specifically; any other hint (or
    /// none) takes the first free unit in `[1, 255)`.
    pub fn open(name_hint: Option<&str>) -> Result<Self> {
        let fd =
            unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL) };
        if fd < 0 {
            return Err(Error::from_device_io(
                io::Error::last_os_error(),
                "utun control socket",
            ));
        }

        match Self::connect_control(fd, name_hint.and_then(utun_unit_from_hint)) {
            Ok(()) => {}
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        }

        let name = match Self::interface_name(fd) {
            Ok(name) => name,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };

        if let Err(err) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(err);
        }

        debug!(name, fd, "opened utun device");
        Ok(Self {
            inner: Mutex::new(Inner { fd, closed: false }),
            name,
        })
    }

    fn control_id(fd: RawFd) -> Result<u32> {
        let mut info = CtlInfo {
            ctl_id: 0,
            ctl_name: [0; MAX_KCTL_NAME],
        };
        info.ctl_name[..UTUN_CONTROL_NAME.len()].copy_from_slice(UTUN_CONTROL_NAME);

        if unsafe { libc::ioctl(fd, CTLIOCGINFO, &mut info as *mut CtlInfo) } < 0 {
            return Err(Error::from_device_io(
                io::Error::last_os_error(),
                "CTLIOCGINFO",
            ));
        }
        Ok(info.ctl_id)
    }

    fn connect_control(fd: RawFd, requested_unit: Option<u32>) -> Result<()> {
        let ctl_id = Self::control_id(fd)?;
        let mut addr = SockaddrCtl {
            sc_len: std::mem::size_of::<SockaddrCtl>() as u8,
            sc_family: AF_SYSTEM,
            ss_sysaddr: AF_SYS_CONTROL,
            sc_id: ctl_id,
            sc_unit: 0,
            sc_reserved: [0; 5],
        };

        if let Some(unit) = requested_unit {
            addr.sc_unit = unit;
            if connect_unit(fd, &addr) < 0 {
                return Err(Error::from_device_io(
                    io::Error::last_os_error(),
                    "connect requested utun unit",
                ));
            }
            return Ok(());
        }

        // Walk units until the kernel accepts one; EBUSY means taken.
        for unit in 1..MAX_UTUN_UNIT {
            addr.sc_unit = unit;
            if connect_unit(fd, &addr) == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EBUSY) {
                return Err(Error::from_device_io(err, "connect utun unit"));
            }
        }
        Err(Error::DeviceUnavailable {
            message: "no free utun unit".into(),
        })
    }

    fn interface_name(fd: RawFd) -> Result<String> {
        let mut name = [0u8; 20];
        let mut len = name.len() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SYSPROTO_CONTROL,
                UTUN_OPT_IFNAME,
                name.as_mut_ptr().cast(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(Error::from_device_io(
                io::Error::last_os_error(),
                "UTUN_OPT_IFNAME",
            ));
        }
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Ok(String::from_utf8_lossy(&name[..end]).into_owned())
    }
}

fn connect_unit(fd: RawFd, addr: &SockaddrCtl) -> libc::c_int {
    unsafe {
        libc::connect(
            fd,
            (addr as *const SockaddrCtl).cast(),
            std::mem::size_of::<SockaddrCtl>() as libc::socklen_t,
        )
    }
}

impl TunDevice for DarwinTun {
    fn read_packet(&self, max_len: usize) -> Result<Vec<u8>> {
        check_read_len(max_len)?;
        let inner = self.inner.lock().expect("device lock");
        if inner.closed {
            return Err(Error::AlreadyClosed);
        }

        // Read room for the family prefix on top of the caller's budget.
        let mut buf = vec![0u8; max_len + UTUN_FAMILY_PREFIX_LEN];
        let n = unsafe { libc::read(inner.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(Vec::new());
            }
            return Err(Error::Io(err));
        }

        buf.truncate(n as usize);
        Ok(strip_family_header(&buf).map(<[u8]>::to_vec).unwrap_or_default())
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

        let framed = prepend_family_header(packet);
        let n = unsafe { libc::write(inner.fd, framed.as_ptr().cast(), framed.len()) };
        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        // Report payload bytes, excluding the family prefix.
        Ok((n as usize).saturating_sub(UTUN_FAMILY_PREFIX_LEN))
    }

    fn close(&self) {
        let mut inner = self.inner.lock().expect("device lock");
        if !inner.closed {
            unsafe { libc::close(inner.fd) };
            inner.closed = true;
            debug!(name = %self.name, "closed utun device");
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

impl Drop for DarwinTun {
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
