//! Plumbing shared by the SOCKS5 and HTTP listeners: the services every
//! connection handler consults, client identification and the cancellable
//! accept loop.

use crate::capabilities::Capabilities;
use crate::config::ListenerCommon;
use crate::dns::{BLOCKED, DnsResolver};
use crate::error::ResolutionError;
use crate::proxy_protocol;
use crate::security::SecurityManager;
use anyhow::Result;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// User label recorded for connections on listeners without auth
pub const ANONYMOUS: &str = "anonymous";

/// Services bundles the shared subsystems a listener hands to each connection
#[derive(Clone)]
pub struct Services {
    pub resolver: Arc<DnsResolver>,
    pub security: Option<Arc<SecurityManager>>,
    pub caps: Capabilities,
}

/// Services implementation block
impl Services {
    /// new is a constructor for the Services type
    pub fn new(
        resolver: Arc<DnsResolver>,
        security: Option<Arc<SecurityManager>>,
        caps: Capabilities,
    ) -> Self {
        Self {
            resolver,
            security,
            caps,
        }
    }

    /// resolve looks up a target host from the egress address
    ///
    /// `Ok(None)` means the host is on the domain blacklist.
    pub async fn resolve(
        &self,
        host: &str,
        egress: SocketAddr,
    ) -> Result<Option<Ipv4Addr>, ResolutionError> {
        match self.resolver.resolve(host, Some(egress.ip()), None).await? {
            ip if ip == BLOCKED => Ok(None),
            ip => Ok(Some(ip)),
        }
    }

    /// security_for returns the manager only when the listener enables it
    pub fn security_for(&self, common: &ListenerCommon) -> Option<&SecurityManager> {
        if common.security_enabled {
            self.security.as_deref()
        } else {
            None
        }
    }
}

/// Client is who a connection belongs to once any PROXY header is consumed
#[derive(Debug, Clone)]
pub struct Client {
    /// Socket peer, the forwarder when a PROXY header was present
    pub peer: SocketAddr,
    /// Address all security decisions are made against
    pub ip: IpAddr,
    pub location: String,
}

/// identify_client reads the PROXY header if configured and labels the client
///
/// A missing or broken header falls back to the socket peer address.
pub async fn identify_client<S>(
    stream: &mut S,
    peer: SocketAddr,
    common: &ListenerCommon,
    services: &Services,
) -> Client
where
    S: AsyncRead + Unpin,
{
    let header = proxy_protocol::receive_header(stream, common.proxy_protocol).await;
    let ip = match header.as_ref().and_then(|h| h.client_addr()) {
        Some(addr) => addr.ip(),
        None => peer.ip(),
    };

    let location = services.caps.geo.locate(ip);
    Client { peer, ip, location }
}

/// bind opens the listener socket
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    Ok(listener)
}

/// serve accepts connections until `shutdown` fires
///
/// Each connection runs in its own task and is dropped when `shutdown` fires.
/// Handler errors are logged at debug and never stop the loop.
pub async fn serve<F, Fut>(
    listener: TcpListener,
    shutdown: CancellationToken,
    name: String,
    handler: F,
) -> Result<()>
where
    F: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(proxy = %name, "listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (inbound, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(proxy = %name, "[ERR] accept failed: {e}");
                        continue;
                    }
                };
                debug!(proxy = %name, peer = %peer_addr, "new client");

                let connection = handler(inbound, peer_addr);
                let token = shutdown.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        result = connection => {
                            if let Err(e) = result {
                                debug!(proxy = %name, peer = %peer_addr, "connection error: {e:#}");
                            }
                        }
                    }
                });
            }
        }
    }
}
