use super::auth::{BasicAuthError, check_basic};
use super::detect::{detect_protocol_attack, suspicious_headers};
use super::forward::forward;
use super::request::{HttpMethod, READ_TIMEOUT, RequestHead, read_request_head};
use super::response::{send_auth_required, send_error};
use super::tls::load_tls;
use super::tunnel::tunnel;
use crate::capabilities::{ConnectionInfo, StatsSession};
use crate::config::HttpConfig;
use crate::error::RequestError;
use crate::security::{Protocol, ScanType, SecurityManager};
use crate::server::{self, ANONYMOUS, Client, Services};
use anyhow::{Result, bail};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// HttpServer represents one HTTP (or HTTPS) proxy listener
pub struct HttpServer {
    config: Arc<HttpConfig>,
    services: Services,
    tls: Option<TlsAcceptor>,
    listener: Option<TcpListener>,
}

/// HttpServer implementation block
impl HttpServer {
    /// new is a constructor for the HttpServer type
    ///
    /// Loads the certificate and key up front when the listener serves HTTPS.
    pub fn new(config: HttpConfig, services: Services) -> Result<Self> {
        let tls = match &config.tls {
            Some(paths) => Some(load_tls(paths)?),
            None => None,
        };

        Ok(Self {
            config: Arc::new(config),
            services,
            tls,
            listener: None,
        })
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
            https = self.tls.is_some(),
            "HTTP proxy listening"
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
        let tls = self.tls;
        let name = config.common.name.clone();

        server::serve(listener, shutdown, name, move |inbound, peer_addr| {
            handle_connection(inbound, peer_addr, config.clone(), services.clone(), tls.clone())
        })
        .await
    }
}

/// handle_connection identifies the client, terminates TLS if configured and
/// serves the single request on the connection
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<HttpConfig>,
    services: Services,
    tls: Option<TlsAcceptor>,
) -> Result<()> {
    // PROXY headers precede the TLS handshake
    let client = server::identify_client(&mut stream, peer_addr, &config.common, &services).await;

    match tls {
        Some(acceptor) => {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(proxy = %config.common.name, client = %client.ip, "[ERR] TLS handshake failed: {e}");
                    return Ok(());
                }
            };
            handle_request(stream, &client, &config, &services, Protocol::Https).await
        }
        None => handle_request(stream, &client, &config, &services, Protocol::Http).await,
    }
}

/// handle_request runs the security checks, authentication and dispatch of one request
async fn handle_request<S>(
    stream: S,
    client: &Client,
    config: &HttpConfig,
    services: &Services,
    protocol: Protocol,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let common = &config.common;
    let security = services.security_for(common);
    let mut stream = BufReader::new(stream);

    // DEBUG
    info!(proxy = %common.name, client = %client.ip, location = %client.location, %protocol, "new HTTP request");

    if let Some(security) = security {
        if security.record_connection(client.ip, protocol) {
            warn!(proxy = %common.name, client = %client.ip, "rapid connections, client banned");
            send_error(&mut stream, 429, "Too Many Requests").await;
            return Ok(());
        }
        if !security.is_ip_allowed(client.ip) {
            warn!(proxy = %common.name, client = %client.ip, location = %client.location, "client denied by security policy");
            send_error(&mut stream, 403, "Access Denied by Security Policy").await;
            return Ok(());
        }
    }

    let head = match timeout(READ_TIMEOUT, read_request_head(&mut stream))
        .await
        .unwrap_or(Err(RequestError::Timeout))
    {
        Ok(head) => head,
        Err(e) => return reject_unreadable(&mut stream, e, client, security).await,
    };
    debug!(proxy = %common.name, client = %client.ip, method = %head.method, target = %head.target, "request head read");

    if let Some(security) = security {
        if let Some(violation) = detect_protocol_attack(&head) {
            warn!(proxy = %common.name, client = %client.ip, scan_type = %violation.scan_type, "protocol attack detected");
            record_scan(security, client, violation.scan_type);
            send_error(&mut stream, 400, violation.message).await;
            return Ok(());
        }

        let flagged = suspicious_headers(&head);
        if !flagged.is_empty() {
            warn!(proxy = %common.name, client = %client.ip, headers = ?flagged, "suspicious request headers");
            record_scan(security, client, ScanType::SuspiciousHeaders);
            send_error(&mut stream, 400, "Suspicious Request Headers").await;
            return Ok(());
        }
    }

    let user = match authenticate(&head, config, services, security, client, protocol) {
        Some(user) => user,
        None => {
            send_auth_required(&mut stream).await;
            return Ok(());
        }
    };

    let session = StatsSession::start(
        services.caps.stats.clone(),
        ConnectionInfo {
            ip: client.ip,
            protocol,
            country: client.location.clone(),
            proxy_name: common.name.clone(),
            user,
        },
    );

    let outcome = match head.known_method() {
        Some(HttpMethod::Connect) => tunnel(&mut stream, &head, common, services, &session).await,
        Some(_) => forward(&mut stream, &head, common, services, &session).await,
        None => {
            if let Some(security) = security {
                record_scan(security, client, ScanType::InvalidHttpMethod);
            }
            send_error(&mut stream, 501, &format!("Unsupported method: {}", head.method)).await;
            Err(anyhow::anyhow!("[ERR] unsupported method {}", head.method))
        }
    };

    match &outcome {
        Ok(totals) => session.end(totals.to_client, totals.from_client, true),
        Err(_) => session.end(0, 0, false),
    }
    outcome.map(|_| ())
}

/// authenticate checks `Proxy-Authorization` on auth listeners
///
/// Returns the user label, or `None` when a 407 is due.
fn authenticate(
    head: &RequestHead,
    config: &HttpConfig,
    services: &Services,
    security: Option<&SecurityManager>,
    client: &Client,
    protocol: Protocol,
) -> Option<String> {
    let common = &config.common;
    if !common.auth_enabled {
        return Some(ANONYMOUS.to_string());
    }

    match check_basic(head.header("proxy-authorization"), services.caps.credentials.as_ref()) {
        Ok(user) => {
            info!(proxy = %common.name, client = %client.ip, %user, "user authenticated");
            if let Some(security) = security {
                security.record_auth_success(client.ip);
            }
            Some(user)
        }
        Err(BasicAuthError::Missing) => {
            debug!(proxy = %common.name, client = %client.ip, "credentials missing, challenging");
            if let Some(security) = security {
                security.record_auth_failure(client.ip, protocol);
            }
            None
        }
        Err(e) => {
            warn!(proxy = %common.name, client = %client.ip, "authentication failed: {e:?}");
            if let Some(security) = security {
                if security.record_auth_failure(client.ip, protocol) {
                    warn!(proxy = %common.name, client = %client.ip, "too many auth failures, client banned");
                }
            }
            None
        }
    }
}

/// reject_unreadable answers a request head that could not be read
async fn reject_unreadable<S>(
    stream: &mut S,
    error: RequestError,
    client: &Client,
    security: Option<&SecurityManager>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    match error {
        RequestError::Closed | RequestError::Io(_) => {
            debug!(client = %client.ip, "client left before sending a request: {error}");
            Ok(())
        }
        RequestError::Timeout => {
            send_error(stream, 408, "Request Timeout").await;
            bail!("[ERR] {error}")
        }
        RequestError::LineTooLong(_) | RequestError::HeadTooLong(_) => {
            if let Some(security) = security {
                record_scan(security, client, ScanType::MalformedRequest);
            }
            send_error(stream, 414, "Request URI Too Long").await;
            bail!("[ERR] {error}")
        }
        RequestError::Malformed(_) => {
            if let Some(security) = security {
                record_scan(security, client, ScanType::MalformedRequest);
            }
            send_error(stream, 400, "Bad Request").await;
            bail!("[ERR] {error}")
        }
    }
}

fn record_scan(security: &SecurityManager, client: &Client, scan_type: ScanType) {
    if security.record_scan_attempt(client.ip, scan_type) {
        warn!(client = %client.ip, %scan_type, "scanner banned");
    }
}
