mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::*;
use egressproxy::SecurityManager;
use egressproxy::config::{DnsConfig, ListenerCommon, ProxyProtocolMode};
use egressproxy::proxy_protocol::{ProxyCommand, TransportProtocol, V2Addresses, build_v1_header, build_v2_header};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::sync::CancellationToken;

/// origin_server serves one response and hands back the request head it saw
async fn origin_server() -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: keep-alive\r\n\r\nhello")
            .await
            .unwrap();
        let _ = tx.send(head);
    });

    (addr, rx)
}

#[tokio::test]
async fn connect_tunnel() {
    let echo = echo_server().await;
    let token = CancellationToken::new();
    let proxy = start_http(ListenerCommon::local("http"), services(DnsConfig::default(), None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 "), "{head}");

    assert_echo(&mut client).await;
    token.cancel();
}

#[tokio::test]
async fn get_is_forwarded_in_origin_form() {
    let (origin, seen) = origin_server().await;
    let token = CancellationToken::new();
    let proxy = start_http(ListenerCommon::local("http"), services(DnsConfig::default(), None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://{origin}/path?q=1 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Connection: close\r\n"));
    assert!(!response.contains("keep-alive"));
    assert!(response.ends_with("\r\n\r\nhello"));

    let request = seen.await.unwrap();
    assert!(request.starts_with("GET /path?q=1 HTTP/1.1\r\n"), "{request}");
    assert!(request.contains("Connection: close\r\n"));
    assert!(!request.to_ascii_lowercase().contains("proxy-connection"));
    token.cancel();
}

#[tokio::test]
async fn missing_credentials_get_407() {
    let token = CancellationToken::new();
    let mut common = ListenerCommon::local("http-auth");
    common.auth_enabled = true;
    let proxy = start_http(common, services(DnsConfig::default(), None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"CONNECT 127.0.0.1:9 HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 407 "), "{response}");
    assert!(response.contains("Proxy-Authenticate: Basic"));
    token.cancel();
}

#[tokio::test]
async fn authenticated_tunnel() {
    let echo = echo_server().await;
    let token = CancellationToken::new();
    let mut common = ListenerCommon::local("http-auth");
    common.auth_enabled = true;
    let proxy = start_http(common, services(DnsConfig::default(), None), &token).await;

    let credentials = STANDARD.encode(format!("{USER}:{PASS}"));
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\nProxy-Authorization: Basic {credentials}\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 "), "{head}");

    assert_echo(&mut client).await;
    token.cancel();
}

#[tokio::test]
async fn blacklisted_domain_gets_403() {
    let token = CancellationToken::new();
    let dns = DnsConfig {
        blacklist_patterns: vec!["*.blocked.test".into()],
        ..DnsConfig::default()
    };
    let proxy = start_http(ListenerCommon::local("http"), services(dns, None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET http://ads.blocked.test/ HTTP/1.1\r\nHost: ads.blocked.test\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(
        response.starts_with("HTTP/1.1 403 Access to this domain is blocked by proxy policy\r\n"),
        "{response}"
    );
    token.cancel();
}

#[tokio::test]
async fn unsupported_method_gets_501() {
    let token = CancellationToken::new();
    let proxy = start_http(ListenerCommon::local("http"), services(DnsConfig::default(), None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"TRACE http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 501 Unsupported method: TRACE\r\n"), "{response}");
    token.cancel();
}

/// tls_connector trusts only the fixture certificate
fn tls_connector() -> TlsConnector {
    let pem = std::fs::read(fixture("cert.pem")).unwrap();
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn tls_connect_tunnel() {
    let echo = echo_server().await;
    let token = CancellationToken::new();
    let proxy = start_https(ListenerCommon::local("https"), services(DnsConfig::default(), None), &token).await;

    let tcp = TcpStream::connect(proxy).await.unwrap();
    let domain = ServerName::try_from("localhost").unwrap();
    let mut client = tls_connector().connect(domain, tcp).await.unwrap();
    client
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 "), "{head}");

    assert_echo(&mut client).await;
    token.cancel();
}

#[tokio::test]
async fn plaintext_client_on_tls_listener_gets_nothing() {
    let token = CancellationToken::new();
    let proxy = start_https(ListenerCommon::local("https"), services(DnsConfig::default(), None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"CONNECT 127.0.0.1:9 HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    let _ = client.read_to_end(&mut response).await;
    assert!(!response.starts_with(b"HTTP/"));
    token.cancel();
}

/// blacklisted_listener runs an HTTP listener that denies 203.0.113.0/24
async fn blacklisted_listener(
    mode: ProxyProtocolMode,
    dir: &std::path::Path,
    token: &CancellationToken,
) -> SocketAddr {
    let security = Arc::new(SecurityManager::new(security_config(dir)));
    assert!(security.add_to_blacklist("203.0.113.0/24", "documentation range", None));

    let mut common = ListenerCommon::local("http-pp");
    common.security_enabled = true;
    common.proxy_protocol = mode;
    start_http(common, services(DnsConfig::default(), Some(security)), token).await
}

#[tokio::test]
async fn proxy_v2_source_decides_access() {
    let echo = echo_server().await;
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let proxy = blacklisted_listener(ProxyProtocolMode::V2, dir.path(), &token).await;

    let header_from = |source: &str| {
        build_v2_header(
            ProxyCommand::Proxy,
            TransportProtocol::Stream,
            &V2Addresses::Ip {
                source: source.parse().unwrap(),
                destination: proxy,
            },
            &[],
        )
        .unwrap()
    };

    // Denied on the header's address even though the socket peer is loopback
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&header_from("203.0.113.9:40000")).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 403 Access Denied by Security Policy\r\n"), "{response}");

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&header_from("198.51.100.1:40000")).await.unwrap();
    client
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 "), "{head}");
    assert_echo(&mut client).await;
    token.cancel();
}

#[tokio::test]
async fn proxy_v1_source_decides_access() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let proxy = blacklisted_listener(ProxyProtocolMode::V1, dir.path(), &token).await;

    let header = build_v1_header("203.0.113.77:51000".parse().unwrap(), proxy).unwrap();
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(header.as_bytes()).await.unwrap();
    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 403 "), "{response}");
    token.cancel();
}

