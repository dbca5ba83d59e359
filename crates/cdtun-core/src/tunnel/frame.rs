//! Pure helpers for Darwin utun framing and unit selection.
//!
//! utun I/O carries a 4-byte big-endian protocol-family prefix on every
//! packet in both directions. These helpers are platform-independent so the
//! framing rules stay testable everywhere, and so custom device
//! implementations can emulate the Darwin behavior.

use crate::constants::UTUN_FAMILY_PREFIX_LEN;

/// Darwin's `AF_INET6` value, carried big-endian in the family prefix.
pub const AF_INET6_DARWIN: u32 = 30;

/// Strip the leading family prefix from a frame read off a utun socket.
///
/// A frame of 4 bytes or fewer carries no packet and is treated as empty.
pub fn strip_family_header(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() > UTUN_FAMILY_PREFIX_LEN {
        Some(&frame[UTUN_FAMILY_PREFIX_LEN..])
    } else {
        None
    }
}

/// Prepend the IPv6 family prefix for a write to a utun socket.
pub fn prepend_family_header(packet: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(UTUN_FAMILY_PREFIX_LEN + packet.len());
    framed.extend_from_slice(&AF_INET6_DARWIN.to_be_bytes());
    framed.extend_from_slice(packet);
    framed
}

/// Map a `utun<N>` name hint to the kernel control unit to request.
///
/// The kernel names unit 1 `utun0`, so the requested unit is N+1. Hints
/// that are not of the `utun<N>` form select no specific unit.
pub fn utun_unit_from_hint(hint: &str) -> Option<u32> {
    let n: u32 = hint.strip_prefix("utun")?.parse().ok()?;
    n.checked_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_removes_exactly_four_bytes() {
        let frame = [0, 0, 0, 30, 0x60, 0x01, 0x02];
        assert_eq!(strip_family_header(&frame), Some(&frame[4..]));
    }

    #[test]
    fn strip_short_frames_are_empty() {
        assert_eq!(strip_family_header(&[]), None);
        assert_eq!(strip_family_header(&[0, 0, 0, 30]), None);
    }

    #[test]
    fn prepend_writes_af_inet6_big_endian() {
        let framed = prepend_family_header(&[0x60, 0xAA]);
        assert_eq!(framed, vec![0, 0, 0, 30, 0x60, 0xAA]);
    }

    #[test]
    fn strip_prepend_roundtrip() {
        let packet = vec![0x60, 1, 2, 3, 4, 5];
        let framed = prepend_family_header(&packet);
        assert_eq!(strip_family_header(&framed), Some(packet.as_slice()));
    }

    #[test]
    fn unit_from_hint() {
        assert_eq!(utun_unit_from_hint("utun0"), Some(1));
        assert_eq!(utun_unit_from_hint("utun7"), Some(8));
        assert_eq!(utun_unit_from_hint("tun0"), None);
        assert_eq!(utun_unit_from_hint("utun"), None);
        assert_eq!(utun_unit_from_hint("utunx"), None);
    }
}
