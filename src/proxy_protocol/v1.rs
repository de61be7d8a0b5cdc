//! PROXY protocol v1 (text form).
//!
//! `PROXY <TCP4|TCP6|UNKNOWN> <src-ip> <dst-ip> <src-port> <dst-port>\r\n`

use crate::error::ProxyProtocolError;
use std::net::{IpAddr, SocketAddr};

/// Longest legal v1 line, CRLF included
pub const V1_MAX_LEN: usize = 108;

const PREFIX: &str = "PROXY ";

/// V1Protocol is the INET protocol token of a v1 line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V1Protocol {
    Tcp4,
    Tcp6,
    Unknown,
}

impl V1Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            V1Protocol::Tcp4 => "TCP4",
            V1Protocol::Tcp6 => "TCP6",
            V1Protocol::Unknown => "UNKNOWN",
        }
    }
}

/// V1Header is a parsed v1 line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1Header {
    pub protocol: V1Protocol,
    /// Client and server addresses, absent for UNKNOWN
    pub addresses: Option<(SocketAddr, SocketAddr)>,
    pub header_len: usize,
}

/// parse_v1 parses one complete v1 line
pub fn parse_v1(data: &[u8]) -> Result<V1Header, ProxyProtocolError> {
    if data.len() > V1_MAX_LEN {
        return Err(ProxyProtocolError::TooLong(data.len()));
    }

    let line = std::str::from_utf8(data)
        .map_err(|_| ProxyProtocolError::Malformed("v1 header is not ASCII".into()))?;
    if !line.starts_with(PREFIX) {
        return Err(ProxyProtocolError::BadSignature);
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    let protocol = match parts.get(1).copied() {
        Some("TCP4") => V1Protocol::Tcp4,
        Some("TCP6") => V1Protocol::Tcp6,
        Some("UNKNOWN") => {
            return Ok(V1Header {
                protocol: V1Protocol::Unknown,
                addresses: None,
                header_len: data.len(),
            });
        }
        other => {
            return Err(ProxyProtocolError::Malformed(format!(
                "unknown v1 protocol {other:?}"
            )));
        }
    };

    if parts.len() < 6 {
        return Err(ProxyProtocolError::Malformed(format!(
            "v1 header has {} fields, expected 6",
            parts.len()
        )));
    }

    let src_ip = parse_ip(parts[2], protocol)?;
    let dst_ip = parse_ip(parts[3], protocol)?;
    let src_port = parse_port(parts[4])?;
    let dst_port = parse_port(parts[5])?;

    Ok(V1Header {
        protocol,
        addresses: Some((
            SocketAddr::new(src_ip, src_port),
            SocketAddr::new(dst_ip, dst_port),
        )),
        header_len: data.len(),
    })
}

/// build_v1_header renders a TCP4/TCP6 line, picking the protocol from the addresses
pub fn build_v1_header(
    source: SocketAddr,
    destination: SocketAddr,
) -> Result<String, ProxyProtocolError> {
    let protocol = match (source.ip(), destination.ip()) {
        (IpAddr::V4(_), IpAddr::V4(_)) => V1Protocol::Tcp4,
        (IpAddr::V6(_), IpAddr::V6(_)) => V1Protocol::Tcp6,
        _ => {
            return Err(ProxyProtocolError::Malformed(
                "source and destination address families differ".into(),
            ));
        }
    };

    Ok(format!(
        "{PREFIX}{} {} {} {} {}\r\n",
        protocol.as_str(),
        source.ip(),
        destination.ip(),
        source.port(),
        destination.port()
    ))
}

/// build_v1_unknown renders the address-less UNKNOWN line
pub fn build_v1_unknown() -> String {
    format!("{PREFIX}UNKNOWN\r\n")
}

fn parse_ip(s: &str, protocol: V1Protocol) -> Result<IpAddr, ProxyProtocolError> {
    let ip: IpAddr = s
        .parse()
        .map_err(|_| ProxyProtocolError::Malformed(format!("bad address {s:?}")))?;

    match (protocol, ip) {
        (V1Protocol::Tcp4, IpAddr::V4(_)) | (V1Protocol::Tcp6, IpAddr::V6(_)) => Ok(ip),
        _ => Err(ProxyProtocolError::Malformed(format!(
            "address {s} does not match {}",
            protocol.as_str()
        ))),
    }
}

fn parse_port(s: &str) -> Result<u16, ProxyProtocolError> {
    s.parse()
        .map_err(|_| ProxyProtocolError::Malformed(format!("bad port {s:?}")))
}
