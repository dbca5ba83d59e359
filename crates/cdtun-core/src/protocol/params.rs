//! Handshake payload models and negotiated tunnel parameters.

use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::constants::{HANDSHAKE_MTU, MAX_TUNNEL_MTU, MIN_TUNNEL_MTU};
use crate::error::{Error, Result};

/// Client handshake request payload.
///
/// Serializes to `{"type":"clientHandshakeRequest","mtu":16000}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Message discriminator, always `clientHandshakeRequest`.
    #[serde(rename = "type")]
    pub kind: String,
    /// MTU the client is prepared to carry.
    pub mtu: u16,
}

impl HandshakeRequest {
    /// Build the standard request with the default handshake MTU.
    pub fn new() -> Self {
        Self {
            kind: "clientHandshakeRequest".to_string(),
            mtu: HANDSHAKE_MTU,
        }
    }
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// `clientParameters` object of the server response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientParameters {
    /// Address to assign to the local tunnel interface.
    pub address: String,
    /// MTU to configure on the interface.
    pub mtu: u32,
}

/// Server handshake response payload.
///
/// Only the fields below are interpreted; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Parameters for the client side of the tunnel.
    #[serde(rename = "clientParameters")]
    pub client_parameters: ClientParameters,
    /// Server's address inside the tunnel.
    #[serde(rename = "serverAddress")]
    pub server_address: String,
    /// Optional remote-service-discovery port advertised by the server.
    #[serde(
        rename = "serverRSDPort",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub server_rsd_port: Option<u16>,
}

/// Validated tunnel parameters, immutable after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelParameters {
    /// Address assigned to the local interface.
    pub client_address: Ipv6Addr,
    /// Negotiated interface MTU.
    pub mtu: u16,
    /// Server's in-tunnel address (host-routed as /128).
    pub server_address: Ipv6Addr,
    /// RSD port, opaque to the tunnel core.
    pub server_rsd_port: Option<u16>,
}

impl TryFrom<HandshakeResponse> for TunnelParameters {
    type Error = Error;

    fn try_from(resp: HandshakeResponse) -> Result<Self> {
        let client_address = parse_ipv6(&resp.client_parameters.address, "clientParameters.address")?;
        let server_address = parse_ipv6(&resp.server_address, "serverAddress")?;

        let mtu = resp.client_parameters.mtu;
        if !(MIN_TUNNEL_MTU..=MAX_TUNNEL_MTU).contains(&mtu) {
            return Err(Error::invalid_argument(format!(
                "MTU must be between {MIN_TUNNEL_MTU} and {MAX_TUNNEL_MTU}, got {mtu}"
            )));
        }

        Ok(Self {
            client_address,
            mtu: mtu as u16,
            server_address,
            server_rsd_port: resp.server_rsd_port,
        })
    }
}

fn parse_ipv6(literal: &str, field: &str) -> Result<Ipv6Addr> {
    literal
        .parse::<Ipv6Addr>()
        .map_err(|_| Error::invalid_argument(format!("{field} is not an IPv6 address: {literal}")))
}
