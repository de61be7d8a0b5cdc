// Wire constants for the subset of SOCKS5 this proxy speaks:
// no-auth and username/password negotiation, CONNECT only, IPv4 and
// domain-name targets. Replies always carry a zeroed IPv4 bind address.

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// USERPASS_VERSION is the RFC1929 sub-negotiation version
pub const USERPASS_VERSION: u8 = 0x01;

/// Version represents available SOCKS proxy versions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// AuthMethod represents available SOCKS5
/// authentication methods
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    // Gssapi = 0x01, not supported
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

/// AuthMethod implementation block
impl AuthMethod {
    /// required is the one method a listener accepts
    pub fn required(auth_enabled: bool) -> Self {
        if auth_enabled {
            AuthMethod::UserPass
        } else {
            AuthMethod::NoAuth
        }
    }
}

/// AuthStatus is the RFC1929 status byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthStatus {
    Success = 0x00,
    Failure = 0x01,
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    //TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

/// ReplyCode implementation block
impl ReplyCode {
    /// from_io_error picks the reply closest to an egress connect failure
    pub fn from_io_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            ErrorKind::HostUnreachable | ErrorKind::TimedOut => ReplyCode::HostUnreachable,
            _ => ReplyCode::ServerFailure,
        }
    }
}

/// REPLY_LEN is the size of every reply this server sends
pub const REPLY_LEN: usize = 10;

/// reply builds a reply with a zeroed IPv4 bind address
pub fn reply(code: ReplyCode) -> [u8; REPLY_LEN] {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   |    4     |    2     |
    // +----+-----+-------+------+----------+----------+
    [
        Version::SOCKS5 as u8,
        code as u8,
        RSV,
        AddressType::IPv4 as u8,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn success_and_failure_replies() {
        assert_eq!(reply(ReplyCode::Succeeded), *b"\x05\x00\x00\x01\x00\x00\x00\x00\x00\x00");
        assert_eq!(reply(ReplyCode::ServerFailure)[1], 0x01);
    }

    #[test]
    fn egress_errors_map_to_replies() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        let other = io::Error::other("boom");
        assert_eq!(ReplyCode::from_io_error(&refused), ReplyCode::ConnectionRefused);
        assert_eq!(ReplyCode::from_io_error(&timeout), ReplyCode::HostUnreachable);
        assert_eq!(ReplyCode::from_io_error(&other), ReplyCode::ServerFailure);
    }

    #[test]
    fn byte_lookups() {
        assert_eq!(Command::from_byte(0x01), Some(Command::Connect));
        assert_eq!(Command::from_byte(0x09), None);
        assert_eq!(AddressType::from_byte(0x03), Some(AddressType::DomainName));
        assert_eq!(AuthMethod::required(true), AuthMethod::UserPass);
        assert_eq!(AuthMethod::required(false), AuthMethod::NoAuth);
    }
}
