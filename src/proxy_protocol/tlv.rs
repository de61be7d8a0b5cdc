//! PROXY v2 TLV extensions.
//!
//! ```text
//! +------+-------------+-----------+
//! | TYPE | LENGTH (BE) |   VALUE   |
//! +------+-------------+-----------+
//! |  1   |      2      | 0 to 65535|
//! +------+-------------+-----------+
//! ```

use crate::error::ProxyProtocolError;
use std::collections::BTreeMap;
use std::fmt;

/// Standard and custom TLV type codes
pub mod kind {
    pub const ALPN: u8 = 0x01;
    pub const AUTHORITY: u8 = 0x02;
    pub const CRC32C: u8 = 0x03;
    pub const NOOP: u8 = 0x04;
    pub const SSL: u8 = 0x20;
    pub const NETNS: u8 = 0x30;

    // 0xE0 - 0xEF are reserved for application use
    pub const GEO: u8 = 0xE0;
    pub const USER: u8 = 0xE1;
    pub const TIMESTAMP: u8 = 0xE2;
    pub const SESSION: u8 = 0xE3;
    pub const USER_AGENT: u8 = 0xE4;
    pub const HTTP_METHOD: u8 = 0xE5;
}

/// TlvValue is a typed TLV payload
#[derive(Debug, Clone, PartialEq)]
pub enum TlvValue {
    Text(String),
    Bytes(Vec<u8>),
    /// Encoded as a big-endian u32
    Int(u32),
    /// Encoded as a big-endian f64
    Float(f64),
    /// Encoded as compact JSON text
    Json(serde_json::Value),
}

impl TlvValue {
    /// to_bytes encodes the value for the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            TlvValue::Text(s) => s.as_bytes().to_vec(),
            TlvValue::Bytes(b) => b.clone(),
            TlvValue::Int(i) => i.to_be_bytes().to_vec(),
            TlvValue::Float(f) => f.to_be_bytes().to_vec(),
            TlvValue::Json(v) => v.to_string().into_bytes(),
        }
    }
}

impl fmt::Display for TlvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlvValue::Text(s) => f.write_str(s),
            TlvValue::Bytes(b) => f.write_str(&to_hex(b)),
            TlvValue::Int(i) => write!(f, "{i}"),
            TlvValue::Float(v) => write!(f, "{v}"),
            TlvValue::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Tlv is one type/value pair to be emitted in a v2 header
#[derive(Debug, Clone, PartialEq)]
pub struct Tlv {
    pub kind: u8,
    pub value: TlvValue,
}

impl Tlv {
    pub fn new(kind: u8, value: TlvValue) -> Self {
        Self { kind, value }
    }

    pub fn text(kind: u8, value: impl Into<String>) -> Self {
        Self::new(kind, TlvValue::Text(value.into()))
    }
}

/// encode_tlv appends one TLV to `out`
pub fn encode_tlv(out: &mut Vec<u8>, tlv: &Tlv) -> Result<(), ProxyProtocolError> {
    let value = tlv.value.to_bytes();
    let len = u16::try_from(value.len()).map_err(|_| ProxyProtocolError::TooLong(value.len()))?;

    out.push(tlv.kind);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&value);
    Ok(())
}

/// parse_tlvs splits raw TLV bytes into a type -> value map
///
/// A trailing TLV that does not fit in the buffer ends parsing; everything
/// before it is kept. Later duplicates of a type replace earlier ones.
pub fn parse_tlvs(data: &[u8]) -> BTreeMap<u8, Vec<u8>> {
    let mut tlvs = BTreeMap::new();
    let mut offset = 0;

    while offset + 3 <= data.len() {
        let kind = data[offset];
        let len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
        let start = offset + 3;

        if start + len > data.len() {
            break;
        }

        tlvs.insert(kind, data[start..start + len].to_vec());
        offset = start + len;
    }

    tlvs
}

/// decode_tlv_value interprets raw TLV bytes according to their type
///
/// Anything that fails to decode as its expected type comes back as
/// [`TlvValue::Bytes`].
pub fn decode_tlv_value(tlv_type: u8, raw: &[u8]) -> TlvValue {
    let text = || std::str::from_utf8(raw).ok().map(str::to_string);
    let fallback = || TlvValue::Bytes(raw.to_vec());

    match tlv_type {
        kind::GEO => serde_json::from_slice(raw)
            .map(TlvValue::Json)
            .unwrap_or_else(|_| fallback()),
        kind::USER | kind::SESSION | kind::USER_AGENT | kind::HTTP_METHOD => {
            text().map(TlvValue::Text).unwrap_or_else(fallback)
        }
        kind::TIMESTAMP => text()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(TlvValue::Float)
            .unwrap_or_else(fallback),
        kind::ALPN | kind::AUTHORITY => {
            if raw.is_ascii() {
                text().map(TlvValue::Text).unwrap_or_else(fallback)
            } else {
                fallback()
            }
        }
        kind::CRC32C => match <[u8; 4]>::try_from(raw) {
            Ok(b) => TlvValue::Int(u32::from_be_bytes(b)),
            Err(_) => fallback(),
        },
        _ => text().map(TlvValue::Text).unwrap_or_else(fallback),
    }
}

/// decode_tlvs decodes every entry of a raw TLV map
pub fn decode_tlvs(raw: &BTreeMap<u8, Vec<u8>>) -> BTreeMap<u8, TlvValue> {
    raw.iter()
        .map(|(k, v)| (*k, decode_tlv_value(*k, v)))
        .collect()
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_type_length_value() {
        let mut out = Vec::new();
        encode_tlv(&mut out, &Tlv::new(kind::CRC32C, TlvValue::Int(0xDEADBEEF))).unwrap();
        assert_eq!(out, vec![0x03, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn truncated_trailing_tlv_is_dropped() {
        let mut data = Vec::new();
        encode_tlv(&mut data, &Tlv::text(kind::AUTHORITY, "example.com")).unwrap();
        data.extend_from_slice(&[kind::NOOP, 0x00, 0x09, 0x01]);

        let tlvs = parse_tlvs(&data);
        assert_eq!(tlvs.len(), 1);
        assert_eq!(tlvs[&kind::AUTHORITY], b"example.com");
    }

    #[test]
    fn custom_types_decode_to_typed_values() {
        let geo = json!({"country": "NL", "city": "Amsterdam"});
        assert_eq!(
            decode_tlv_value(kind::GEO, geo.to_string().as_bytes()),
            TlvValue::Json(geo)
        );
        assert_eq!(
            decode_tlv_value(kind::TIMESTAMP, b"1700000000.5"),
            TlvValue::Float(1_700_000_000.5)
        );
        assert_eq!(
            decode_tlv_value(kind::HTTP_METHOD, b"GET"),
            TlvValue::Text("GET".into())
        );
        assert_eq!(
            decode_tlv_value(kind::CRC32C, &[0, 0, 1, 0]),
            TlvValue::Int(256)
        );
    }

    #[test]
    fn undecodable_values_fall_back_to_bytes() {
        let raw = [0xff, 0xfe, 0x00];
        let value = decode_tlv_value(0x99, &raw);
        assert_eq!(value, TlvValue::Bytes(raw.to_vec()));
        assert_eq!(value.to_string(), "fffe00");

        assert_eq!(
            decode_tlv_value(kind::CRC32C, &[1, 2, 3]),
            TlvValue::Bytes(vec![1, 2, 3])
        );
        assert_eq!(
            decode_tlv_value(kind::GEO, b"{not json"),
            TlvValue::Bytes(b"{not json".to_vec())
        );
    }
}
