#![allow(dead_code)]

use egressproxy::capabilities::{Capabilities, NoopStats, StaticCredentials, StaticGeoLocator};
use egressproxy::config::{
    DnsConfig, HttpConfig, ListenerCommon, SecurityConfig, SecurityCoreConfig, Socks5Config, TlsPaths,
};
use egressproxy::{DnsResolver, HttpServer, SecurityManager, Services, Socks5Server};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const USER: &str = "alice";
pub const PASS: &str = "secret";

/// echo_server answers every connection by echoing until EOF
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

pub fn services(dns: DnsConfig, security: Option<Arc<SecurityManager>>) -> Services {
    Services::new(
        Arc::new(DnsResolver::new(dns)),
        security,
        Capabilities::new(
            Arc::new(StaticCredentials::single(USER, PASS)),
            Arc::new(StaticGeoLocator::default()),
            Arc::new(NoopStats),
        ),
    )
}

/// security_config keeps every data file inside `dir`
pub fn security_config(dir: &Path) -> SecurityConfig {
    SecurityConfig {
        core: SecurityCoreConfig::in_dir(dir),
        ..SecurityConfig::default()
    }
}

pub async fn start_socks5(common: ListenerCommon, services: Services, token: &CancellationToken) -> SocketAddr {
    let mut server = Socks5Server::new(Socks5Config { common }, services);
    let addr = server.bind().await.unwrap();
    tokio::spawn(server.run(token.clone()));
    addr
}

pub async fn start_http(common: ListenerCommon, services: Services, token: &CancellationToken) -> SocketAddr {
    let mut server = HttpServer::new(HttpConfig { common, tls: None }, services).unwrap();
    let addr = server.bind().await.unwrap();
    tokio::spawn(server.run(token.clone()));
    addr
}

/// fixture resolves a file under tests/fixtures
pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

/// start_https serves the self-signed localhost pair from tests/fixtures
pub async fn start_https(common: ListenerCommon, services: Services, token: &CancellationToken) -> SocketAddr {
    let tls = TlsPaths {
        cert_file: fixture("cert.pem"),
        key_file: fixture("key.pem"),
    };
    let mut server = HttpServer::new(HttpConfig { common, tls: Some(tls) }, services).unwrap();
    let addr = server.bind().await.unwrap();
    tokio::spawn(server.run(token.clone()));
    addr
}

/// socks5_connect_request encodes an IPv4 CONNECT
pub fn socks5_connect_request(target: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = target else {
        panic!("ipv4 targets only");
    };
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    req
}

/// userpass encodes an RFC 1929 sub-negotiation
pub fn userpass(username: &str, password: &str) -> Vec<u8> {
    let mut msg = vec![0x01, username.len() as u8];
    msg.extend_from_slice(username.as_bytes());
    msg.push(password.len() as u8);
    msg.extend_from_slice(password.as_bytes());
    msg
}

/// assert_echo checks bytes make the round trip through the proxy
pub async fn assert_echo<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) {
    stream.write_all(b"hello through the proxy").await.unwrap();
    let mut buf = [0u8; 23];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the proxy");
}

/// read_head reads up to and including the blank line
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}
