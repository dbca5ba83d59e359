//! Wire codec for CDTunnel handshake frames.
//!
//! Format: 8-byte magic `"CDTunnel"` + 2-byte big-endian payload length +
//! UTF-8 JSON payload.
//!
//! The codec ensures:
//! - Frames are length-prefixed for stream framing
//! - A wrong magic fails immediately rather than waiting for more bytes
//! - Partial reads return Ok(None) to support streaming

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::constants::{FRAME_HEADER_LEN, FRAME_MAGIC_LEN, HANDSHAKE_MAGIC, MAX_FRAME_PAYLOAD};
use crate::error::{Error, Result};

/// Codec for magic-and-length prefixed JSON frames.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a message to a complete frame.
    ///
    /// Returns the encoded bytes including the 10-byte header.
    pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
        let payload = serde_json::to_vec(msg)
            .map_err(|e| Error::protocol(format!("serialization failed: {e}")))?;

        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::protocol(format!(
                "payload too large: {} bytes (max {})",
                payload.len(),
                MAX_FRAME_PAYLOAD
            )));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_slice(HANDSHAKE_MAGIC);
        buf.put_u16(payload.len() as u16);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns:
    /// - Ok(Some(msg)) if a complete frame was decoded (buffer is advanced)
    /// - Ok(None) if more data is needed (buffer unchanged)
    /// - Err if the magic or payload is invalid
    ///
    /// The buffer is only consumed on successful decode.
    pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        // The magic can be checked as soon as the header is buffered.
        if &buf[..FRAME_MAGIC_LEN] != HANDSHAKE_MAGIC {
            return Err(Error::protocol("bad frame magic"));
        }

        let len = u16::from_be_bytes([buf[FRAME_MAGIC_LEN], buf[FRAME_MAGIC_LEN + 1]]) as usize;
        if buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(len);
        let msg = serde_json::from_slice(&payload)
            .map_err(|e| Error::protocol(format!("malformed JSON payload: {e}")))?;

        Ok(Some(msg))
    }

    /// Decode from a slice (convenience for testing).
    pub fn decode_slice<T: DeserializeOwned>(data: &[u8]) -> Result<Option<T>> {
        let mut buf = BytesMut::from(data);
        Self::decode(&mut buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn encode_decode_roundtrip() {
        let msg = json!({"type": "clientHandshakeRequest", "mtu": 16000});
        let encoded = FrameCodec::encode(&msg).unwrap();
        let decoded: Value = FrameCodec::decode_slice(&encoded).unwrap().unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn encode_frame_length() {
        let msg = json!({"a": 1});
        let encoded = FrameCodec::encode(&msg).unwrap();
        let payload = serde_json::to_vec(&msg).unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_LEN + payload.len());
        assert_eq!(&encoded[..8], b"CDTunnel");
        let len = u16::from_be_bytes([encoded[8], encoded[9]]) as usize;
        assert_eq!(len, payload.len());
    }

    #[test]
    fn decode_partial_returns_none() {
        let msg = json!({"serverAddress": "fd00::1"});
        let encoded = FrameCodec::encode(&msg).unwrap();

        for cut in [0, 1, 9, encoded.len() - 1] {
            let result: Option<Value> = FrameCodec::decode_slice(&encoded[..cut]).unwrap();
            assert!(result.is_none(), "cut at {cut} should need more bytes");
        }
    }

    #[test]
    fn decode_bad_magic_fails_fast() {
        let mut frame = FrameCodec::encode(&json!({})).unwrap().to_vec();
        frame[0] = b'X';
        let result: Result<Option<Value>> = FrameCodec::decode_slice(&frame);
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[test]
    fn decode_malformed_json_fails() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"CDTunnel");
        buf.put_u16(4);
        buf.put_slice(b"{{{{");
        let result: Result<Option<Value>> = FrameCodec::decode(&mut buf);
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[test]
    fn decode_advances_buffer_only_on_success() {
        let msg = json!({"mtu": 1500});
        let encoded = FrameCodec::encode(&msg).unwrap();

        let mut buf = BytesMut::from(&encoded[..]);
        let _: Value = FrameCodec::decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());

        buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        let partial_len = buf.len();
        let result: Option<Value> = FrameCodec::decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), partial_len);
    }

    #[test]
    fn trailing_bytes_are_retained() {
        let msg = json!({"mtu": 9000});
        let encoded = FrameCodec::encode(&msg).unwrap();

        let mut buf = BytesMut::from(&encoded[..]);
        buf.put_slice(&[0x60, 0x00]);

        let decoded: Value = FrameCodec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(&buf[..], &[0x60, 0x00]);
    }
}
