use crate::capabilities::CredentialVerifier;
use crate::error::Socks5Error;
use crate::socks5::protocol::{AuthMethod, AuthStatus, USERPASS_VERSION, Version};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// negotiate_auth reads the client hello and answers with the listener's method
///
/// Auth-enabled listeners only accept username/password, the rest only accept
/// no-auth. A client that does not offer it gets "no acceptable methods".
pub async fn negotiate_auth<S>(stream: &mut S, auth_enabled: bool) -> Result<AuthMethod, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    let mut buf = [0u8; 2];
    read_greeting(stream, &mut buf).await?;

    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        return Err(Socks5Error::InvalidVersion(version));
    }
    if n_methods == 0 {
        return Err(Socks5Error::NoMethods);
    }

    let mut methods = vec![0u8; n_methods as usize];
    read_greeting(stream, &mut methods).await?;

    let method = select_auth_method(&methods, auth_enabled);

    // ServerChoice method selection reply format
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[Version::SOCKS5 as u8, method as u8]).await?;

    match method {
        AuthMethod::NoAcceptable => Err(Socks5Error::NoAcceptableMethod(methods)),
        method => Ok(method),
    }
}

/// authenticate_userpass runs the RFC1929 sub-negotiation and returns the username
///
/// Every failure, including a client hanging up mid-exchange, is reported as
/// `AuthFailed` after a best-effort failure status.
pub async fn authenticate_userpass<S>(
    stream: &mut S,
    verifier: &dyn CredentialVerifier,
) -> Result<String, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    let outcome = read_credentials(stream).await;

    let (status, result) = match outcome {
        Ok((username, password)) if verifier.verify(&username, &password) => {
            (AuthStatus::Success, Ok(username))
        }
        Ok((username, _)) => (
            AuthStatus::Failure,
            Err(Socks5Error::AuthFailed(format!("bad credentials for user {username:?}"))),
        ),
        Err(e) => (AuthStatus::Failure, Err(Socks5Error::AuthFailed(e.to_string()))),
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    let written = stream.write_all(&[USERPASS_VERSION, status as u8]).await;
    if status == AuthStatus::Success {
        written?;
    }

    result
}

async fn read_credentials<S>(stream: &mut S) -> io::Result<(String, String)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != USERPASS_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid sub-negotiation version {:#04x}", header[0]),
        ));
    }

    let mut username = vec![0u8; header[1] as usize];
    stream.read_exact(&mut username).await?;

    let mut password_len = [0u8; 1];
    stream.read_exact(&mut password_len).await?;
    let mut password = vec![0u8; password_len[0] as usize];
    stream.read_exact(&mut password).await?;

    let utf8 = |bytes: Vec<u8>| {
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    };
    Ok((utf8(username)?, utf8(password)?))
}

/// read_greeting maps a short read to `Truncated`
async fn read_greeting<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), Socks5Error>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Socks5Error::Truncated),
        Err(e) => Err(e.into()),
    }
}

/// select_auth_method returns the listener's required method if the client offered it
fn select_auth_method(client_methods: &[u8], auth_enabled: bool) -> AuthMethod {
    let required = AuthMethod::required(auth_enabled);
    if client_methods.contains(&(required as u8)) {
        required
    } else {
        AuthMethod::NoAcceptable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::StaticCredentials;
    use crate::security::ScanType;

    #[tokio::test]
    async fn selects_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x05\x02\x02\x00").await.unwrap();

        let method = negotiate_auth(&mut server, false).await.unwrap();
        assert_eq!(method, AuthMethod::NoAuth);

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn auth_enabled_rejects_no_auth_only_clients() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x05\x01\x00").await.unwrap();

        let err = negotiate_auth(&mut server, true).await.unwrap_err();
        assert_eq!(err.scan_type(), Some(ScanType::InvalidMethod));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn bad_greetings_map_to_scan_types() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x04\x01\x00").await.unwrap();
        let err = negotiate_auth(&mut server, false).await.unwrap_err();
        assert!(matches!(err, Socks5Error::InvalidVersion(0x04)));
        assert_eq!(err.scan_type(), Some(ScanType::InvalidVersion));

        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x05\x00").await.unwrap();
        let err = negotiate_auth(&mut server, false).await.unwrap_err();
        assert!(matches!(err, Socks5Error::NoMethods));

        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x05\x03\x00").await.unwrap();
        drop(client);
        let err = negotiate_auth(&mut server, false).await.unwrap_err();
        assert!(matches!(err, Socks5Error::Truncated));
        assert_eq!(err.scan_type(), Some(ScanType::MalformedRequest));
    }

    #[tokio::test]
    async fn userpass_success_and_failure() {
        let creds = StaticCredentials::single("alice", "secret");

        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x01\x05alice\x06secret").await.unwrap();
        let user = authenticate_userpass(&mut server, &creds).await.unwrap();
        assert_eq!(user, "alice");
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x00]);

        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x01\x05alice\x05wrong").await.unwrap();
        let err = authenticate_userpass(&mut server, &creds).await.unwrap_err();
        assert!(matches!(err, Socks5Error::AuthFailed(_)));
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x01]);
    }

    #[tokio::test]
    async fn userpass_bad_version_fails() {
        let creds = StaticCredentials::single("alice", "secret");
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"\x02\x05alice\x06secret").await.unwrap();

        let err = authenticate_userpass(&mut server, &creds).await.unwrap_err();
        assert!(matches!(err, Socks5Error::AuthFailed(_)));
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x01]);
    }
}
