//! Protocol and configuration constants for cdtun.

use std::time::Duration;

// =============================================================================
// Handshake Framing
// =============================================================================

/// Magic prefix of every handshake control frame.
pub const HANDSHAKE_MAGIC: &[u8; 8] = b"CDTunnel";

/// Length of the frame magic.
pub const FRAME_MAGIC_LEN: usize = 8;

/// Length of the big-endian payload length field.
pub const FRAME_LENGTH_LEN: usize = 2;

/// Total frame header length (magic + length field).
pub const FRAME_HEADER_LEN: usize = FRAME_MAGIC_LEN + FRAME_LENGTH_LEN;

/// Maximum frame payload size (16-bit length field).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// MTU advertised in the client handshake request.
pub const HANDSHAKE_MTU: u16 = 16000;

/// Deadline from request send to fully parsed response.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// IPv6
// =============================================================================

/// Fixed IPv6 header length.
pub const IPV6_HEADER_LEN: usize = 40;

/// Next-header value for TCP.
pub const NEXT_HEADER_TCP: u8 = 6;

/// Next-header value for UDP.
pub const NEXT_HEADER_UDP: u8 = 17;

// =============================================================================
// Tunnel Interface
// =============================================================================

/// Minimum MTU accepted for the tunnel interface (IPv6 minimum link MTU).
pub const MIN_TUNNEL_MTU: u32 = 1280;

/// Maximum MTU accepted for the tunnel interface.
pub const MAX_TUNNEL_MTU: u32 = 65535;

/// Upper bound on a single packet read from or written to the interface.
pub const MAX_PACKET_SIZE: usize = 65536;

/// Length of the protocol-family prefix on Darwin utun I/O.
pub const UTUN_FAMILY_PREFIX_LEN: usize = 4;

/// WinTun ring buffer capacity (4 MiB).
pub const WINTUN_RING_CAPACITY: u32 = 0x0040_0000;

/// Maximum WinTun adapter name length.
pub const WINTUN_MAX_ADAPTER_NAME: usize = 128;

// =============================================================================
// Forwarding
// =============================================================================

/// Interval between egress polls of the interface.
pub const EGRESS_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Read budget for a single egress poll.
pub const EGRESS_READ_BUDGET: usize = 16384;

/// Size of the ingress stream read buffer.
pub const INGRESS_BUFFER_SIZE: usize = 64 * 1024;

/// How long a graceful close waits for the data paths to wind down on
/// their own before aborting them.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_is_ten_bytes() {
        assert_eq!(FRAME_HEADER_LEN, 10);
        assert_eq!(HANDSHAKE_MAGIC.len(), FRAME_MAGIC_LEN);
    }

    #[test]
    fn magic_is_ascii() {
        assert!(HANDSHAKE_MAGIC.iter().all(u8::is_ascii));
    }

    #[test]
    fn mtu_bounds_are_ordered() {
        assert!(MIN_TUNNEL_MTU < MAX_TUNNEL_MTU);
        assert!((HANDSHAKE_MTU as u32) <= MAX_TUNNEL_MTU);
    }

    #[test]
    fn egress_budget_within_packet_bound() {
        assert!(EGRESS_READ_BUDGET <= MAX_PACKET_SIZE);
    }
}
