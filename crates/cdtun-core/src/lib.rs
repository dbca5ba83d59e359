//! cdtun-core: user-space IPv6 tunnel endpoint.
//!
//! This crate provides:
//! - A platform-abstracted TUN device driver (Darwin utun, Linux tun,
//!   Windows WinTun)
//! - Interface address/MTU/route configuration via OS tooling
//! - The framed `CDTunnel` JSON handshake
//! - Bidirectional packet forwarding between a byte stream and the
//!   interface, with demultiplexing of the inbound stream
//! - Publish/subscribe fanout of parsed TCP/UDP packet records
//! - A process-wide registry with signal-driven shutdown

pub mod constants;
pub mod demux;
pub mod error;
pub mod fanout;
pub mod handshake;
pub mod logging;
pub mod netconfig;
pub mod protocol;
pub mod registry;
pub mod tunnel;

pub use error::{Error, Result};
pub use handshake::perform_handshake;
pub use logging::{LogFormat, init_logging};
pub use protocol::TunnelParameters;
pub use tunnel::{TunDevice, TunnelSession, connect, open_tun};
