//! PROXY protocol v2 (binary form).
//!
//! ```text
//! +-----------+---------+-----------+--------+----------------+------+
//! | SIGNATURE | VER/CMD | FAM/TRANS |  LEN   |   ADDRESSES    | TLVs |
//! +-----------+---------+-----------+--------+----------------+------+
//! |    12     |    1    |     1     | 2 (BE) | 12 / 36 / 216  | 0+   |
//! +-----------+---------+-----------+--------+----------------+------+
//! ```

use super::tlv::{self, Tlv, TlvValue, encode_tlv};
use crate::error::ProxyProtocolError;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Magic bytes every v2 header starts with
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Fixed preamble: signature, ver/cmd, fam/trans, length
pub const V2_PREAMBLE_LEN: usize = 16;

const INET_ADDR_LEN: usize = 12;
const INET6_ADDR_LEN: usize = 36;
const UNIX_PATH_LEN: usize = 108;
const UNIX_ADDR_LEN: usize = UNIX_PATH_LEN * 2;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    Local = 0x00,
    Proxy = 0x01,
}

impl ProxyCommand {
    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0x00 => Some(ProxyCommand::Local),
            0x01 => Some(ProxyCommand::Proxy),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unspec = 0x00,
    Inet = 0x01,
    Inet6 = 0x02,
    Unix = 0x03,
}

impl AddressFamily {
    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0x00 => Some(AddressFamily::Unspec),
            0x01 => Some(AddressFamily::Inet),
            0x02 => Some(AddressFamily::Inet6),
            0x03 => Some(AddressFamily::Unix),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Unspec = 0x00,
    Stream = 0x01,
    Dgram = 0x02,
}

impl TransportProtocol {
    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0x00 => Some(TransportProtocol::Unspec),
            0x01 => Some(TransportProtocol::Stream),
            0x02 => Some(TransportProtocol::Dgram),
            _ => None,
        }
    }
}

/// V2Addresses is the address block of a v2 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum V2Addresses {
    Unspec,
    Ip {
        source: SocketAddr,
        destination: SocketAddr,
    },
    Unix {
        source: String,
        destination: String,
    },
}

impl V2Addresses {
    fn family(&self) -> Result<AddressFamily, ProxyProtocolError> {
        match self {
            V2Addresses::Unspec => Ok(AddressFamily::Unspec),
            V2Addresses::Unix { .. } => Ok(AddressFamily::Unix),
            V2Addresses::Ip {
                source,
                destination,
            } => match (source.ip(), destination.ip()) {
                (IpAddr::V4(_), IpAddr::V4(_)) => Ok(AddressFamily::Inet),
                (IpAddr::V6(_), IpAddr::V6(_)) => Ok(AddressFamily::Inet6),
                _ => Err(ProxyProtocolError::Malformed(
                    "source and destination address families differ".into(),
                )),
            },
        }
    }
}

/// V2Header is a parsed v2 header
#[derive(Debug, Clone, PartialEq)]
pub struct V2Header {
    pub command: ProxyCommand,
    pub family: AddressFamily,
    pub transport: TransportProtocol,
    pub addresses: V2Addresses,
    /// Raw TLV values keyed by type, see [`tlv::decode_tlvs`]
    pub tlvs: BTreeMap<u8, Vec<u8>>,
    pub header_len: usize,
}

impl V2Header {
    /// decoded_tlvs interprets every TLV by its type
    pub fn decoded_tlvs(&self) -> BTreeMap<u8, TlvValue> {
        tlv::decode_tlvs(&self.tlvs)
    }
}

/// payload_len reads the declared payload length from a 16-byte preamble
pub fn payload_len(preamble: &[u8; V2_PREAMBLE_LEN]) -> usize {
    u16::from_be_bytes([preamble[14], preamble[15]]) as usize
}

/// parse_v2 parses a complete v2 header, preamble included
///
/// `data` must be exactly the header: 16 bytes plus the declared length.
pub fn parse_v2(data: &[u8]) -> Result<V2Header, ProxyProtocolError> {
    if data.len() < V2_PREAMBLE_LEN {
        return Err(ProxyProtocolError::Truncated {
            need: V2_PREAMBLE_LEN,
            have: data.len(),
        });
    }
    if data[..12] != V2_SIGNATURE {
        return Err(ProxyProtocolError::BadSignature);
    }

    let version = data[12] >> 4;
    if version != 2 {
        return Err(ProxyProtocolError::BadVersion(version));
    }
    let command = ProxyCommand::from_nibble(data[12] & 0x0F).ok_or_else(|| {
        ProxyProtocolError::Malformed(format!("unknown command {:#x}", data[12] & 0x0F))
    })?;

    let family_nibble = data[13] >> 4;
    let family = AddressFamily::from_nibble(family_nibble)
        .ok_or(ProxyProtocolError::UnsupportedFamily(family_nibble))?;
    let transport = TransportProtocol::from_nibble(data[13] & 0x0F).ok_or_else(|| {
        ProxyProtocolError::Malformed(format!("unknown transport {:#x}", data[13] & 0x0F))
    })?;

    let len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let total = V2_PREAMBLE_LEN + len;
    if data.len() != total {
        return Err(ProxyProtocolError::Truncated {
            need: total,
            have: data.len(),
        });
    }
    let payload = &data[V2_PREAMBLE_LEN..];

    let mut header = V2Header {
        command,
        family,
        transport,
        addresses: V2Addresses::Unspec,
        tlvs: BTreeMap::new(),
        header_len: total,
    };

    // LOCAL connections carry no meaningful addresses
    if command == ProxyCommand::Local {
        return Ok(header);
    }

    let addr_len = match family {
        AddressFamily::Unspec => return Ok(header),
        AddressFamily::Inet => INET_ADDR_LEN,
        AddressFamily::Inet6 => INET6_ADDR_LEN,
        AddressFamily::Unix => UNIX_ADDR_LEN,
    };
    if payload.len() < addr_len {
        return Err(ProxyProtocolError::Truncated {
            need: V2_PREAMBLE_LEN + addr_len,
            have: data.len(),
        });
    }

    header.addresses = match family {
        AddressFamily::Inet => {
            let src = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
            let dst = Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]);
            V2Addresses::Ip {
                source: SocketAddr::new(IpAddr::V4(src), be_u16(&payload[8..10])),
                destination: SocketAddr::new(IpAddr::V4(dst), be_u16(&payload[10..12])),
            }
        }
        AddressFamily::Inet6 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&payload[0..16]);
            dst.copy_from_slice(&payload[16..32]);
            V2Addresses::Ip {
                source: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), be_u16(&payload[32..34])),
                destination: SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(dst)),
                    be_u16(&payload[34..36]),
                ),
            }
        }
        AddressFamily::Unix => V2Addresses::Unix {
            source: unix_path(&payload[..UNIX_PATH_LEN]),
            destination: unix_path(&payload[UNIX_PATH_LEN..UNIX_ADDR_LEN]),
        },
        AddressFamily::Unspec => V2Addresses::Unspec,
    };
    header.tlvs = tlv::parse_tlvs(&payload[addr_len..]);

    Ok(header)
}

/// build_v2_header encodes a v2 header with TLVs in the given order
pub fn build_v2_header(
    command: ProxyCommand,
    transport: TransportProtocol,
    addresses: &V2Addresses,
    tlvs: &[Tlv],
) -> Result<Vec<u8>, ProxyProtocolError> {
    let family = addresses.family()?;

    let mut payload = Vec::new();
    match addresses {
        V2Addresses::Unspec => {}
        V2Addresses::Ip {
            source,
            destination,
        } => {
            match (source.ip(), destination.ip()) {
                (IpAddr::V4(s), IpAddr::V4(d)) => {
                    payload.extend_from_slice(&s.octets());
                    payload.extend_from_slice(&d.octets());
                }
                (IpAddr::V6(s), IpAddr::V6(d)) => {
                    payload.extend_from_slice(&s.octets());
                    payload.extend_from_slice(&d.octets());
                }
                _ => {
                    return Err(ProxyProtocolError::Malformed(
                        "source and destination address families differ".into(),
                    ));
                }
            }
            payload.extend_from_slice(&source.port().to_be_bytes());
            payload.extend_from_slice(&destination.port().to_be_bytes());
        }
        V2Addresses::Unix {
            source,
            destination,
        } => {
            push_unix_path(&mut payload, source)?;
            push_unix_path(&mut payload, destination)?;
        }
    }

    for tlv in tlvs {
        encode_tlv(&mut payload, tlv)?;
    }

    let len = u16::try_from(payload.len())
        .map_err(|_| ProxyProtocolError::TooLong(V2_PREAMBLE_LEN + payload.len()))?;

    let mut header = Vec::with_capacity(V2_PREAMBLE_LEN + payload.len());
    header.extend_from_slice(&V2_SIGNATURE);
    header.push((2 << 4) | command as u8);
    header.push(((family as u8) << 4) | transport as u8);
    header.extend_from_slice(&len.to_be_bytes());
    header.extend_from_slice(&payload);

    Ok(header)
}

/// EnhancedTlvs are the custom extensions attached by [`build_enhanced_v2_header`]
#[derive(Debug, Clone, Default)]
pub struct EnhancedTlvs {
    pub geo: Option<serde_json::Value>,
    pub user: Option<serde_json::Value>,
    /// Seconds since the epoch; the current time when absent
    pub timestamp: Option<f64>,
    pub session_id: Option<String>,
    pub user_agent: Option<String>,
    pub http_method: Option<String>,
}

/// build_enhanced_v2_header builds a PROXY/STREAM header carrying the custom TLVs
pub fn build_enhanced_v2_header(
    source: SocketAddr,
    destination: SocketAddr,
    extra: EnhancedTlvs,
) -> Result<Vec<u8>, ProxyProtocolError> {
    let mut tlvs = Vec::new();

    if let Some(geo) = extra.geo {
        tlvs.push(Tlv::new(tlv::kind::GEO, TlvValue::Json(geo)));
    }
    if let Some(user) = extra.user {
        tlvs.push(Tlv::new(tlv::kind::USER, TlvValue::Json(user)));
    }

    // Timestamps travel as decimal text
    let timestamp = extra.timestamp.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    });
    tlvs.push(Tlv::text(tlv::kind::TIMESTAMP, timestamp.to_string()));

    if let Some(session) = extra.session_id {
        tlvs.push(Tlv::text(tlv::kind::SESSION, session));
    }
    if let Some(ua) = extra.user_agent {
        tlvs.push(Tlv::text(tlv::kind::USER_AGENT, ua));
    }
    if let Some(method) = extra.http_method {
        tlvs.push(Tlv::text(tlv::kind::HTTP_METHOD, method));
    }

    build_v2_header(
        ProxyCommand::Proxy,
        TransportProtocol::Stream,
        &V2Addresses::Ip {
            source,
            destination,
        },
        &tlvs,
    )
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn unix_path(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn push_unix_path(out: &mut Vec<u8>, path: &str) -> Result<(), ProxyProtocolError> {
    let bytes = path.as_bytes();
    if bytes.len() > UNIX_PATH_LEN {
        return Err(ProxyProtocolError::TooLong(bytes.len()));
    }
    out.extend_from_slice(bytes);
    out.resize(out.len() + UNIX_PATH_LEN - bytes.len(), 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_protocol::tlv::kind;
    use serde_json::json;

    fn inet(src: &str, dst: &str) -> V2Addresses {
        V2Addresses::Ip {
            source: src.parse().unwrap(),
            destination: dst.parse().unwrap(),
        }
    }

    #[test]
    fn inet_header_layout() {
        let header = build_v2_header(
            ProxyCommand::Proxy,
            TransportProtocol::Stream,
            &inet("192.0.2.1:40000", "198.51.100.2:1080"),
            &[],
        )
        .unwrap();

        assert_eq!(header.len(), 28);
        assert_eq!(&header[..12], &V2_SIGNATURE);
        assert_eq!(header[12], 0x21);
        assert_eq!(header[13], 0x11);
        assert_eq!(&header[14..16], &[0x00, 0x0C]);
        assert_eq!(&header[16..20], &[192, 0, 2, 1]);
        assert_eq!(&header[24..26], &40000u16.to_be_bytes());
    }

    #[test]
    fn round_trip_preserves_addresses_and_tlvs() {
        let cases = [
            inet("203.0.113.9:51000", "10.0.0.1:8080"),
            inet("[2001:db8::7]:443", "[2001:db8::1]:8443"),
            V2Addresses::Unix {
                source: "/run/client.sock".into(),
                destination: "/run/proxy.sock".into(),
            },
        ];
        let tlvs = vec![
            Tlv::text(kind::AUTHORITY, "example.com"),
            Tlv::new(kind::CRC32C, TlvValue::Int(7)),
            Tlv::new(kind::NOOP, TlvValue::Bytes(vec![0xff, 0x00])),
        ];

        for addresses in cases {
            let bytes =
                build_v2_header(ProxyCommand::Proxy, TransportProtocol::Stream, &addresses, &tlvs)
                    .unwrap();
            let parsed = parse_v2(&bytes).unwrap();

            assert_eq!(parsed.addresses, addresses);
            assert_eq!(parsed.header_len, bytes.len());
            assert_eq!(parsed.tlvs.len(), tlvs.len());
            for tlv in &tlvs {
                assert_eq!(parsed.tlvs[&tlv.kind], tlv.value.to_bytes());
            }
        }
    }

    #[test]
    fn enhanced_header_decodes_custom_tlvs() {
        let bytes = build_enhanced_v2_header(
            "198.51.100.20:5000".parse().unwrap(),
            "10.0.0.1:1080".parse().unwrap(),
            EnhancedTlvs {
                geo: Some(json!({"country": "DE"})),
                timestamp: Some(1_700_000_000.25),
                session_id: Some("abc123".into()),
                http_method: Some("CONNECT".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let decoded = parse_v2(&bytes).unwrap().decoded_tlvs();
        assert_eq!(decoded[&kind::GEO], TlvValue::Json(json!({"country": "DE"})));
        assert_eq!(decoded[&kind::TIMESTAMP], TlvValue::Float(1_700_000_000.25));
        assert_eq!(decoded[&kind::SESSION], TlvValue::Text("abc123".into()));
        assert_eq!(decoded[&kind::HTTP_METHOD], TlvValue::Text("CONNECT".into()));
        assert!(!decoded.contains_key(&kind::USER));
    }

    #[test]
    fn local_command_needs_no_addresses() {
        let bytes = build_v2_header(
            ProxyCommand::Local,
            TransportProtocol::Unspec,
            &V2Addresses::Unspec,
            &[],
        )
        .unwrap();
        let parsed = parse_v2(&bytes).unwrap();
        assert_eq!(parsed.command, ProxyCommand::Local);
        assert_eq!(parsed.addresses, V2Addresses::Unspec);
    }

    #[test]
    fn rejects_malformed_headers() {
        let good = build_v2_header(
            ProxyCommand::Proxy,
            TransportProtocol::Stream,
            &inet("192.0.2.1:1", "192.0.2.2:2"),
            &[],
        )
        .unwrap();

        let mut bad_sig = good.clone();
        bad_sig[3] = 0x00;
        assert!(matches!(parse_v2(&bad_sig), Err(ProxyProtocolError::BadSignature)));

        let mut bad_version = good.clone();
        bad_version[12] = 0x11;
        assert!(matches!(parse_v2(&bad_version), Err(ProxyProtocolError::BadVersion(1))));

        let mut bad_family = good.clone();
        bad_family[13] = 0x51;
        assert!(matches!(
            parse_v2(&bad_family),
            Err(ProxyProtocolError::UnsupportedFamily(5))
        ));

        // declared length disagrees with the buffer
        assert!(parse_v2(&good[..good.len() - 1]).is_err());

        // INET with a payload too short for the addresses
        let mut short = good[..16].to_vec();
        short[15] = 4;
        short.extend_from_slice(&[1, 2, 3, 4]);
        assert!(matches!(
            parse_v2(&short),
            Err(ProxyProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn unix_path_too_long_is_rejected() {
        let addresses = V2Addresses::Unix {
            source: "x".repeat(109),
            destination: "/tmp/s".into(),
        };
        assert!(
            build_v2_header(ProxyCommand::Proxy, TransportProtocol::Stream, &addresses, &[])
                .is_err()
        );
    }
}
