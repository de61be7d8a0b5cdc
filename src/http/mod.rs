//! HTTP forward proxy.
//!
//! ## Implementation
//!
//! - Features:
//!     - CONNECT tunnelling
//!     - Absolute-form forwarding of GET, POST, PUT, DELETE, HEAD, PATCH and OPTIONS
//!     - Basic proxy authentication (`Proxy-Authorization`)
//!     - Optional TLS on the client side of the listener
//!     - One request per connection, answered with `Connection: close`
//! - [HTTP/1.1 Semantics (RFC 9110)](https://datatracker.ietf.org/doc/html/rfc9110)
//! - [CONNECT (RFC 9110 9.3.6)](https://datatracker.ietf.org/doc/html/rfc9110#section-9.3.6)

pub mod auth;
pub mod detect;
pub mod forward;
pub mod request;
pub mod response;
pub mod server;
pub mod tls;
pub mod tunnel;

pub use request::{HttpMethod, RequestHead};
pub use server::HttpServer;

use crate::config::ListenerCommon;
use crate::egress;
use crate::server::Services;
use anyhow::{Result, bail};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// dial resolves `host` and connects to it from the listener's egress address
///
/// Failures are answered on `client` with the matching status before the
/// error is returned.
pub(crate) async fn dial<W>(
    client: &mut W,
    common: &ListenerCommon,
    services: &Services,
    host: &str,
    port: u16,
) -> Result<TcpStream>
where
    W: AsyncWrite + Unpin,
{
    let ip = match services.resolve(host, common.egress).await {
        Ok(Some(ip)) => ip,
        Ok(None) => {
            warn!(proxy = %common.name, %host, "blocked domain requested");
            response::send_error(client, 403, "Access to this domain is blocked by proxy policy")
                .await;
            bail!("[ERR] {host} is blacklisted");
        }
        Err(e) => {
            warn!(proxy = %common.name, %host, "[ERR] dns resolution failed: {e}");
            response::send_error(client, 502, &format!("Cannot resolve {host}")).await;
            bail!("[ERR] cannot resolve {host}: {e}");
        }
    };

    let dest = SocketAddr::new(IpAddr::V4(ip), port);
    debug!(proxy = %common.name, %host, %dest, "connecting to target");

    match egress::connect(common.egress, dest).await {
        Ok(upstream) => Ok(upstream),
        Err(e) => {
            let message = match e.kind() {
                io::ErrorKind::TimedOut => "Connection timeout".to_string(),
                io::ErrorKind::ConnectionRefused => "Connection refused by target server".to_string(),
                _ => format!("Bad Gateway: {e}"),
            };
            let code = if e.kind() == io::ErrorKind::TimedOut { 504 } else { 502 };
            response::send_error(client, code, &message).await;
            bail!("[ERR] connect to {host}:{port} ({dest}) failed: {e}");
        }
    }
}
