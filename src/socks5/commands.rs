use crate::error::Socks5Error;
use crate::socks5::address::{TargetAddr, parse_address_from_stream};
use crate::socks5::protocol::{Command, RSV, ReplyCode, Version, reply};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// read_connect_request parses the client request and returns the CONNECT target
///
/// A request this server cannot serve is answered with the matching failure
/// reply before the error is returned.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    let mut reqbuf = [0u8; 4];
    stream.read_exact(&mut reqbuf).await?;

    let [version, command, rsv, atyp] = reqbuf;

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        send_reply(stream, ReplyCode::ServerFailure).await?;
        return Err(Socks5Error::InvalidVersion(version));
    }
    if rsv != RSV {
        send_reply(stream, ReplyCode::ServerFailure).await?;
        return Err(Socks5Error::Malformed(format!("reserved byte {rsv:#04x}")));
    }

    match Command::from_byte(command) {
        Some(Command::Connect) => (),
        _ => {
            send_reply(stream, ReplyCode::CommandNotSupported).await?;
            return Err(Socks5Error::UnsupportedCommand(command));
        }
    }

    match parse_address_from_stream(stream, atyp).await {
        Ok(target) => Ok(target),
        Err(e @ Socks5Error::UnsupportedAddressType(_)) => {
            send_reply(stream, ReplyCode::AddrTypeUnsupported).await?;
            Err(e)
        }
        Err(e) => {
            let _ = send_reply(stream, ReplyCode::ServerFailure).await;
            Err(e)
        }
    }
}

/// send_reply writes a reply with a zeroed bind address
pub async fn send_reply<S>(stream: &mut S, reply_code: ReplyCode) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&reply(reply_code)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::address::TargetHost;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn connect_request_parses() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(b"\x05\x01\x00\x01\x5d\xb8\xd8\x22\x00\x50")
            .await
            .unwrap();

        let target = read_connect_request(&mut server).await.unwrap();
        assert_eq!(target.host, TargetHost::Ipv4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(target.port, 80);
    }

    #[tokio::test]
    async fn bind_is_refused_with_reply() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(b"\x05\x02\x00\x01\x7f\x00\x00\x01\x00\x50")
            .await
            .unwrap();

        let err = read_connect_request(&mut server).await.unwrap_err();
        assert!(matches!(err, Socks5Error::UnsupportedCommand(0x02)));

        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[1], ReplyCode::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn ipv6_target_is_refused_with_reply() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x05\x01\x00\x04").await.unwrap();

        let err = read_connect_request(&mut server).await.unwrap_err();
        assert!(matches!(err, Socks5Error::UnsupportedAddressType(0x04)));

        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[1], ReplyCode::AddrTypeUnsupported as u8);
    }
}
