//! HAProxy PROXY protocol codec (v1 text and v2 binary).
//!
//! Used to recover the real client address when a listener sits behind a
//! forwarder. [`receive_header`] reads exactly the header bytes off a stream so
//! whatever follows stays with the application protocol.
//!
//! - [PROXY protocol specification](https://www.haproxy.org/download/2.9/doc/proxy-protocol.txt)

pub mod tlv;
pub mod v1;
pub mod v2;

use crate::config::ProxyProtocolMode;
use crate::error::ProxyProtocolError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

pub use tlv::{Tlv, TlvValue};
pub use v1::{V1_MAX_LEN, V1Header, V1Protocol, build_v1_header, build_v1_unknown, parse_v1};
pub use v2::{
    AddressFamily, EnhancedTlvs, ProxyCommand, TransportProtocol, V2_PREAMBLE_LEN, V2_SIGNATURE,
    V2Addresses, V2Header, build_enhanced_v2_header, build_v2_header, parse_v2,
};

/// How long a forwarder gets to deliver the header
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest v2 payload accepted off the wire
pub const MAX_V2_PAYLOAD: usize = 255;

/// ProxyHeader is a parsed v1 or v2 header
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyHeader {
    V1(V1Header),
    V2(V2Header),
}

impl ProxyHeader {
    /// client_addr returns the original client address, if the header carries one
    pub fn client_addr(&self) -> Option<SocketAddr> {
        match self {
            ProxyHeader::V1(h) => h.addresses.map(|(src, _)| src),
            ProxyHeader::V2(h) => match (&h.command, &h.addresses) {
                (ProxyCommand::Proxy, V2Addresses::Ip { source, .. }) => Some(*source),
                _ => None,
            },
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            ProxyHeader::V1(h) => h.header_len,
            ProxyHeader::V2(h) => h.header_len,
        }
    }
}

/// receive_header reads a header of the configured version, never failing the caller
///
/// Any error is logged and reported as `None`; the caller then treats the
/// connection as direct and keeps the socket peer address.
pub async fn receive_header<R>(stream: &mut R, mode: ProxyProtocolMode) -> Option<ProxyHeader>
where
    R: AsyncRead + Unpin,
{
    if mode == ProxyProtocolMode::Off {
        return None;
    }

    match tokio::time::timeout(RECEIVE_TIMEOUT, read_header(stream, mode)).await {
        Ok(Ok(header)) => {
            debug!(client = ?header.client_addr(), len = header.header_len(), "PROXY header received");
            Some(header)
        }
        Ok(Err(e)) => {
            warn!("[ERR] PROXY header rejected: {e}");
            None
        }
        Err(_) => {
            debug!("timed out waiting for PROXY header");
            None
        }
    }
}

/// read_header consumes exactly one header of the given version from the stream
pub async fn read_header<R>(
    stream: &mut R,
    mode: ProxyProtocolMode,
) -> Result<ProxyHeader, ProxyProtocolError>
where
    R: AsyncRead + Unpin,
{
    match mode {
        ProxyProtocolMode::Off => Err(ProxyProtocolError::Malformed(
            "PROXY protocol disabled".into(),
        )),
        ProxyProtocolMode::V1 => read_v1(stream).await.map(ProxyHeader::V1),
        ProxyProtocolMode::V2 => read_v2(stream).await.map(ProxyHeader::V2),
    }
}

async fn read_v1<R>(stream: &mut R) -> Result<V1Header, ProxyProtocolError>
where
    R: AsyncRead + Unpin,
{
    // One byte at a time: anything past CRLF belongs to the client
    let mut line = Vec::with_capacity(V1_MAX_LEN);
    let mut byte = [0u8; 1];

    while !line.ends_with(b"\r\n") {
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);

        if line.len() > V1_MAX_LEN {
            return Err(ProxyProtocolError::TooLong(line.len()));
        }
    }

    parse_v1(&line)
}

async fn read_v2<R>(stream: &mut R) -> Result<V2Header, ProxyProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut preamble = [0u8; V2_PREAMBLE_LEN];
    stream.read_exact(&mut preamble).await?;

    if preamble[..12] != V2_SIGNATURE {
        return Err(ProxyProtocolError::BadSignature);
    }

    let len = v2::payload_len(&preamble);
    if len > MAX_V2_PAYLOAD {
        return Err(ProxyProtocolError::TooLong(V2_PREAMBLE_LEN + len));
    }

    let mut data = Vec::with_capacity(V2_PREAMBLE_LEN + len);
    data.extend_from_slice(&preamble);
    data.resize(V2_PREAMBLE_LEN + len, 0);
    stream.read_exact(&mut data[V2_PREAMBLE_LEN..]).await?;

    parse_v2(&data)
}
