use crate::capabilities::{ConnectionInfo, StatsSession};
use crate::config::Socks5Config;
use crate::egress;
use crate::error::Socks5Error;
use crate::relay::{self, IDLE_TIMEOUT, RelayTotals};
use crate::security::{Protocol, SecurityManager};
use crate::server::{self, ANONYMOUS, Client, Services};
use crate::socks5::address::{TargetAddr, TargetHost};
use crate::socks5::auth::{authenticate_userpass, negotiate_auth};
use crate::socks5::commands::{read_connect_request, send_reply};
use crate::socks5::protocol::{AuthMethod, ReplyCode, Version};
use anyhow::{Result, bail};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    config: Arc<Socks5Config>,
    services: Services,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type
    pub fn new(config: Socks5Config, services: Services) -> Self {
        Self {
            config: Arc::new(config),
            services,
            listener: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.common.name
    }

    /// bind to the listen address; errors when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] bind can only be called once");
        }

        let listener = server::bind(self.config.common.listen).await?;
        let addr = listener.local_addr()?;

        info!(
            proxy = %self.config.common.name,
            %addr,
            egress = %self.config.common.egress,
            auth = self.config.common.auth_enabled,
            "SOCKS5 proxy listening"
        );

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts connections until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let Some(listener) = self.listener.take() else {
            bail!("[ERR] listener not bound");
        };

        let config = self.config;
        let services = self.services;
        let name = config.common.name.clone();

        server::serve(listener, shutdown, name, move |inbound, peer_addr| {
            handle_connection(inbound, peer_addr, config.clone(), services.clone())
        })
        .await
    }
}

/// handle_connection runs one client through the SOCKS5 state machine
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<Socks5Config>,
    services: Services,
) -> Result<()> {
    let common = &config.common;
    let client = server::identify_client(&mut stream, peer_addr, common, &services).await;
    let security = services.security_for(common);

    // DEBUG
    info!(proxy = %common.name, client = %client.ip, location = %client.location, "new SOCKS5 request");

    if let Some(security) = security {
        if !security.is_ip_allowed(client.ip) {
            warn!(proxy = %common.name, client = %client.ip, location = %client.location, "client denied by security policy");
            refuse(&mut stream).await;
            return Ok(());
        }

        if security.record_connection(client.ip, Protocol::Socks5) {
            warn!(proxy = %common.name, client = %client.ip, "rapid connections, client banned");
            refuse(&mut stream).await;
            return Ok(());
        }
    }

    let user = match handshake(&mut stream, &config, &services, security, &client).await {
        Ok(user) => user,
        Err(e) => {
            warn!(proxy = %common.name, client = %client.ip, location = %client.location, "handshake failed: {e}");
            if let (Some(security), Some(scan_type)) = (security, e.scan_type()) {
                if security.record_scan_attempt(client.ip, scan_type) {
                    warn!(proxy = %common.name, client = %client.ip, %scan_type, "scanner banned");
                }
            }
            return Ok(());
        }
    };
    debug!(proxy = %common.name, client = %client.ip, %user, "handshake complete");

    let session = StatsSession::start(
        services.caps.stats.clone(),
        ConnectionInfo {
            ip: client.ip,
            protocol: Protocol::Socks5,
            country: client.location.clone(),
            proxy_name: common.name.clone(),
            user,
        },
    );

    let outcome = connect_and_relay(&mut stream, &config, &services, &session).await;
    match &outcome {
        Ok(totals) => session.end(totals.to_client, totals.from_client, true),
        Err(_) => session.end(0, 0, false),
    }
    outcome.map(|_| ())
}

/// refuse rejects every auth method without reading the greeting
async fn refuse<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream
        .write_all(&[Version::SOCKS5 as u8, AuthMethod::NoAcceptable as u8])
        .await
    {
        debug!("client gone before refusal: {e}");
    }
}

/// handshake negotiates the method and, on auth listeners, checks credentials
///
/// Returns the authenticated username, or the anonymous label.
async fn handshake(
    stream: &mut TcpStream,
    config: &Socks5Config,
    services: &Services,
    security: Option<&SecurityManager>,
    client: &Client,
) -> Result<String, Socks5Error> {
    let method = negotiate_auth(stream, config.common.auth_enabled).await?;
    if method != AuthMethod::UserPass {
        return Ok(ANONYMOUS.to_string());
    }

    match authenticate_userpass(stream, services.caps.credentials.as_ref()).await {
        Ok(user) => {
            info!(proxy = %config.common.name, client = %client.ip, %user, "user authenticated");
            if let Some(security) = security {
                security.record_auth_success(client.ip);
            }
            Ok(user)
        }
        Err(e) => {
            if let Some(security) = security {
                security.record_auth_failure(client.ip, Protocol::Socks5);
            }
            Err(e)
        }
    }
}

/// connect_and_relay serves the CONNECT request once the client is authenticated
async fn connect_and_relay(
    stream: &mut TcpStream,
    config: &Socks5Config,
    services: &Services,
    session: &StatsSession,
) -> Result<RelayTotals> {
    let common = &config.common;
    let target = read_connect_request(stream).await?;

    let ip = match resolve_target(&target, config, services).await {
        Ok(ip) => ip,
        Err(code) => {
            send_reply(stream, code).await?;
            bail!("[ERR] cannot resolve {target}");
        }
    };

    let dest = SocketAddr::new(IpAddr::V4(ip), target.port);
    debug!(proxy = %common.name, %target, %dest, "connecting to target");

    let mut upstream = match egress::connect(common.egress, dest).await {
        Ok(upstream) => upstream,
        Err(e) => {
            send_reply(stream, ReplyCode::from_io_error(&e)).await?;
            bail!("[ERR] connect to {target} ({dest}) failed: {e}");
        }
    };

    send_reply(stream, ReplyCode::Succeeded).await?;
    info!(proxy = %common.name, %target, %dest, "connected to target");

    let totals = relay::relay(stream, &mut upstream, Some(session), IDLE_TIMEOUT).await?;
    Ok(totals)
}

/// resolve_target turns the requested host into an IPv4 address or a reply code
async fn resolve_target(
    target: &TargetAddr,
    config: &Socks5Config,
    services: &Services,
) -> std::result::Result<Ipv4Addr, ReplyCode> {
    let domain = match &target.host {
        TargetHost::Ipv4(ip) => return Ok(*ip),
        TargetHost::Domain(domain) => domain,
    };

    match services.resolve(domain, config.common.egress).await {
        Ok(Some(ip)) => Ok(ip),
        Ok(None) => {
            warn!(proxy = %config.common.name, %domain, "blocked domain requested");
            Err(ReplyCode::ConnectionNotAllowed)
        }
        Err(e) => {
            warn!(proxy = %config.common.name, %domain, "[ERR] dns resolution failed: {e}");
            Err(ReplyCode::HostUnreachable)
        }
    }
}
