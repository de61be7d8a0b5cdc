use crate::error::Socks5Error;
use crate::socks5::protocol::AddressType;
use std::fmt;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TargetHost is the destination named in a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ipv4(Ipv4Addr),
    Domain(String),
}

/// TargetAddr is a destination host plus port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: TargetHost,
    pub port: u16,
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ipv4(ip) => write!(f, "{ip}:{}", self.port),
            TargetHost::Domain(domain) => write!(f, "{domain}:{}", self.port),
        }
    }
}

/// parse_address_from_stream reads DST.ADDR and DST.PORT for the given ATYP
///
/// Only IPv4 and domain names are accepted; IPv6 and unknown types are
/// reported as unsupported without reading further.
pub async fn parse_address_from_stream<S>(stream: &mut S, atyp: u8) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let host = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            TargetHost::Ipv4(Ipv4Addr::from(addr))
        }
        Some(AddressType::DomainName) => {
            // First octet in DomainName contains the number of
            // octets to follow
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(Socks5Error::Malformed("empty domain name".into()));
            }

            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Socks5Error::Malformed("domain name is not UTF-8".into()))?;
            TargetHost::Domain(domain)
        }
        _ => return Err(Socks5Error::UnsupportedAddressType(atyp)),
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(TargetAddr { host, port })
}
