//! One-shot CDTunnel handshake over a reliable byte stream.
//!
//! The client writes a single framed `clientHandshakeRequest`, then
//! accumulates inbound bytes until a complete response frame has arrived.
//! The whole exchange runs under one deadline; a peer that closes the stream
//! early or sends a malformed frame fails the handshake.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Duration;

use crate::constants::HANDSHAKE_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::{FrameCodec, HandshakeRequest, HandshakeResponse, TunnelParameters};

/// Perform the client handshake with the standard 30-second deadline.
pub async fn perform_handshake<S>(stream: &mut S) -> Result<TunnelParameters>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    handshake_with_deadline(stream, HANDSHAKE_TIMEOUT).await
}

/// Perform the client handshake with an explicit deadline.
///
/// The deadline spans request send through full response parse.
pub async fn handshake_with_deadline<S>(
    stream: &mut S,
    deadline: Duration,
) -> Result<TunnelParameters>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(deadline, exchange(stream))
        .await
        .map_err(|_| Error::HandshakeTimeout)?
}

async fn exchange<S>(stream: &mut S) -> Result<TunnelParameters>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = FrameCodec::encode(&HandshakeRequest::new())?;
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(resp) = FrameCodec::decode::<HandshakeResponse>(&mut buf)? {
            return TunnelParameters::try_from(resp);
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::protocol("stream closed before handshake response"));
        }
    }
}
