//! CDTunnel control-frame protocol.
//!
//! Handshake frames are `"CDTunnel"` (8 bytes ASCII) followed by a
//! big-endian u16 payload length and a UTF-8 JSON payload. One request and
//! one response are exchanged per tunnel.

mod codec;
mod params;

pub use codec::FrameCodec;
pub use params::{ClientParameters, HandshakeRequest, HandshakeResponse, TunnelParameters};
