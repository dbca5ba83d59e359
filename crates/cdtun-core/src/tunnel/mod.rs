//! Tunnel data plane: virtual interface driver and forwarding session.
//!
//! This module provides:
//! - The [`TunDevice`] capability set every backend implements
//! - Platform backends (Darwin utun, Linux /dev/net/tun, Windows WinTun)
//! - The [`TunnelSession`] forwarding lifecycle

pub mod frame;
mod session;

#[cfg(target_os = "macos")]
mod tun_darwin;
#[cfg(target_os = "linux")]
mod tun_linux;
#[cfg(target_os = "windows")]
mod tun_windows;

#[cfg(target_os = "macos")]
pub use tun_darwin::DarwinTun;
#[cfg(target_os = "linux")]
pub use tun_linux::LinuxTun;
#[cfg(target_os = "windows")]
pub use tun_windows::WintunDevice;

pub use session::{SessionState, TunnelSession, TunnelStats, connect};

use std::sync::Arc;

use crate::constants::MAX_PACKET_SIZE;
use crate::error::{Error, Result};

/// Capability set of a TUN-style virtual interface handle.
///
/// All operations serialize on a per-handle lock inside the backend; a
/// closed handle stays closed and fails every I/O call with
/// [`Error::AlreadyClosed`].
pub trait TunDevice: Send + Sync {
    /// Read one packet, or empty bytes if none is pending.
    ///
    /// `max_len` must be in `[1, 65536]`.
    fn read_packet(&self, max_len: usize) -> Result<Vec<u8>>;

    /// Transmit a single packet, returning the payload bytes written.
    ///
    /// An empty packet returns 0 without touching the device.
    fn write_packet(&self, packet: &[u8]) -> Result<usize>;

    /// Release OS resources. Idempotent.
    fn close(&self);

    /// Whether `close` has run.
    fn is_closed(&self) -> bool;

    /// Interface name assigned by the OS.
    fn name(&self) -> String;

    /// Raw fd (Unix) or wait-event handle value (Windows); −1 when closed.
    fn handle_id(&self) -> i64;
}

/// Open the host's TUN device, optionally honoring a name hint.
///
/// Fails with [`Error::PlatformUnsupported`] on any OS other than Linux,
/// Darwin, or Windows.
pub fn open_tun(name_hint: Option<&str>) -> Result<Arc<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(tun_linux::LinuxTun::open(name_hint)?))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(tun_darwin::DarwinTun::open(name_hint)?))
    }
    #[cfg(target_os = "windows")]
    {
        Ok(Arc::new(tun_windows::WintunDevice::open(name_hint)?))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        let _ = name_hint;
        Err(Error::PlatformUnsupported)
    }
}

/// Validate a caller-supplied read size.
pub(crate) fn check_read_len(max_len: usize) -> Result<()> {
    if max_len == 0 || max_len > MAX_PACKET_SIZE {
        return Err(Error::invalid_argument(format!(
            "read size must be between 1 and {MAX_PACKET_SIZE}, got {max_len}"
        )));
    }
    Ok(())
}

/// Validate a caller-supplied write payload length.
pub(crate) fn check_packet_len(len: usize) -> Result<()> {
    if len > MAX_PACKET_SIZE {
        return Err(Error::invalid_argument(format!(
            "packet exceeds {MAX_PACKET_SIZE} bytes: {len}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_len_bounds() {
        assert!(check_read_len(0).is_err());
        assert!(check_read_len(1).is_ok());
        assert!(check_read_len(MAX_PACKET_SIZE).is_ok());
        assert!(check_read_len(MAX_PACKET_SIZE + 1).is_err());
    }

    #[test]
    fn packet_len_bounds() {
        assert!(check_packet_len(0).is_ok());
        assert!(check_packet_len(MAX_PACKET_SIZE).is_ok());
        assert!(check_packet_len(MAX_PACKET_SIZE + 1).is_err());
    }
}
