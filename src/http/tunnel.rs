use super::request::{RequestHead, parse_connect_target};
use super::response::{CONNECTION_ESTABLISHED, send_error};
use crate::capabilities::StatsSession;
use crate::config::ListenerCommon;
use crate::relay::{self, IDLE_TIMEOUT, RelayTotals};
use crate::server::Services;
use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::info;

/// tunnel answers a CONNECT request and splices the client onto the target
///
/// ```text
/// client                 proxy                  target
///   | CONNECT host:port    |                       |
///   |--------------------->|  TCP connect          |
///   |                      |---------------------->|
///   |  200 Connection      |                       |
///   |<---------------------|                       |
///   |<====== opaque bytes (TLS usually) =========>|
/// ```
///
/// `client` keeps any bytes buffered behind the request head, so a client
/// that pipelines its TLS hello is relayed intact.
pub async fn tunnel<S>(
    client: &mut S,
    head: &RequestHead,
    common: &ListenerCommon,
    services: &Services,
    session: &StatsSession,
) -> Result<RelayTotals>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = match parse_connect_target(&head.target) {
        Ok(target) => target,
        Err(_) => {
            send_error(client, 400, "Malformed CONNECT Request").await;
            bail!("[ERR] bad CONNECT target {:?}", head.target);
        }
    };

    let mut upstream = super::dial(client, common, services, &host, port).await?;

    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    info!(proxy = %common.name, target = %head.target, "tunnel established");

    let totals = relay::relay(client, &mut upstream, Some(session), IDLE_TIMEOUT).await?;
    Ok(totals)
}
