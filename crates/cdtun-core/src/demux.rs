//! Stateful demultiplexer: reassembles discrete IPv6 datagrams from a
//! continuous byte stream.
//!
//! The stream transport delivers arbitrary chunk boundaries, so the parser
//! accumulates bytes and walks the buffer: a byte whose version nibble is
//! not 6 is skipped (resynchronization), a complete header yields the
//! payload length, and a fully buffered datagram is emitted as one slice.
//! Trailing unconsumed bytes are retained for the next chunk.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{IPV6_HEADER_LEN, NEXT_HEADER_TCP, NEXT_HEADER_UDP};

/// Upper-layer protocol of a parsed packet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum L4Protocol {
    /// Transmission Control Protocol (next-header 6).
    #[serde(rename = "TCP")]
    Tcp,
    /// User Datagram Protocol (next-header 17).
    #[serde(rename = "UDP")]
    Udp,
}

/// Parsed view of one TCP or UDP datagram, delivered to subscribers.
///
/// The payload is an independent copy; subscribers hold no ownership over
/// the forwarded packet bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRecord {
    /// TCP or UDP.
    pub protocol: L4Protocol,
    /// Source address, eight uncompressed lowercase-hex groups.
    pub src: String,
    /// Destination address, same form.
    pub dst: String,
    /// L4 source port.
    #[serde(rename = "sourcePort")]
    pub source_port: u16,
    /// L4 destination port.
    #[serde(rename = "destPort")]
    pub dest_port: u16,
    /// L4 payload after the transport header.
    pub payload: Vec<u8>,
}

/// Buffering parser for the peer-to-interface direction.
#[derive(Debug, Default)]
pub struct Ipv6Demux {
    buf: BytesMut,
}

impl Ipv6Demux {
    /// Create an empty demultiplexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append stream bytes and extract every complete datagram.
    ///
    /// Datagrams are returned in wire order. Bytes that cannot start an
    /// IPv6 header are discarded one at a time until the parser
    /// resynchronizes.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(bytes);

        let mut out = Vec::new();
        loop {
            if self.buf.len() < IPV6_HEADER_LEN {
                break;
            }
            if (self.buf[0] >> 4) & 0x0F != 6 {
                self.buf.advance(1);
                continue;
            }

            let payload_len = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
            let required = IPV6_HEADER_LEN + payload_len;
            if self.buf.len() < required {
                break;
            }

            out.push(self.buf.split_to(required).freeze());
        }
        out
    }

    /// Bytes currently buffered but not yet emitted.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes (teardown path).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Parse the TCP/UDP record of a complete IPv6 datagram.
///
/// Returns `None` for other next-header values and for datagrams too short
/// to carry the transport header; such packets are still forwarded, they
/// just produce no subscriber event.
pub fn parse_record(datagram: &[u8]) -> Option<PacketRecord> {
    if datagram.len() < IPV6_HEADER_LEN {
        return None;
    }

    let next_header = datagram[6];
    let src = format_address(datagram[8..24].try_into().expect("16-byte slice"));
    let dst = format_address(datagram[24..40].try_into().expect("16-byte slice"));
    let payload = &datagram[IPV6_HEADER_LEN..];

    match next_header {
        NEXT_HEADER_UDP if payload.len() >= 8 => Some(PacketRecord {
            protocol: L4Protocol::Udp,
            src,
            dst,
            source_port: u16::from_be_bytes([payload[0], payload[1]]),
            dest_port: u16::from_be_bytes([payload[2], payload[3]]),
            payload: payload[8..].to_vec(),
        }),
        NEXT_HEADER_TCP if payload.len() >= 20 => {
            let header_len = (((payload[12] >> 4) & 0x0F) as usize) * 4;
            let data = if payload.len() >= header_len {
                payload[header_len..].to_vec()
            } else {
                Vec::new()
            };
            Some(PacketRecord {
                protocol: L4Protocol::Tcp,
                src,
                dst,
                source_port: u16::from_be_bytes([payload[0], payload[1]]),
                dest_port: u16::from_be_bytes([payload[2], payload[3]]),
                payload: data,
            })
        }
        _ => None,
    }
}

/// Stringify a 16-byte address as eight colon-joined lowercase-hex groups,
/// without zero compression.
pub fn format_address(octets: [u8; 16]) -> String {
    let mut groups = Vec::with_capacity(8);
    for pair in octets.chunks_exact(2) {
        groups.push(format!("{:04x}", u16::from_be_bytes([pair[0], pair[1]])));
    }
    groups.join(":")
}

// =============================================================================
// Tests
// =============================================================================
