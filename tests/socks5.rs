mod common;

use common::*;
use egressproxy::config::{DnsConfig, ListenerCommon};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn connect_without_auth() {
    let echo = echo_server().await;
    let token = CancellationToken::new();
    let proxy = start_socks5(ListenerCommon::local("socks"), services(DnsConfig::default(), None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    client.write_all(&socks5_connect_request(echo)).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

    assert_echo(&mut client).await;
    token.cancel();
}

#[tokio::test]
async fn connect_with_username_password() {
    let echo = echo_server().await;
    let token = CancellationToken::new();
    let mut common = ListenerCommon::local("socks-auth");
    common.auth_enabled = true;
    let proxy = start_socks5(common, services(DnsConfig::default(), None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    client.write_all(&userpass(USER, PASS)).await.unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x00]);

    client.write_all(&socks5_connect_request(echo)).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    assert_echo(&mut client).await;
    token.cancel();
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let token = CancellationToken::new();
    let mut common = ListenerCommon::local("socks-auth");
    common.auth_enabled = true;
    let proxy = start_socks5(common, services(DnsConfig::default(), None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    client.write_all(&userpass(USER, "wrong")).await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, [0x01, 0x01]);
    token.cancel();
}

#[tokio::test]
async fn blacklisted_domain_is_not_allowed() {
    let token = CancellationToken::new();
    let dns = DnsConfig {
        blacklist_domains: vec!["blocked.test".into()],
        ..DnsConfig::default()
    };
    let proxy = start_socks5(ListenerCommon::local("socks"), services(dns, None), &token).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();

    let mut req = vec![0x05, 0x01, 0x00, 0x03, 12];
    req.extend_from_slice(b"blocked.test");
    req.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x02);
    token.cancel();
}
