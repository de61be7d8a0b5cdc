//! Plain HTTP forwarding: one absolute-form request rewritten for the origin,
//! one response streamed back.

use super::request::{MAX_HEAD, MAX_HEADERS, RequestHead, origin_form, split_host_port};
use super::response::send_error;
use crate::capabilities::StatsSession;
use crate::config::ListenerCommon;
use crate::egress::CONNECT_TIMEOUT;
use crate::relay::{CHUNK_SIZE, IDLE_TIMEOUT, RelayTotals};
use crate::server::Services;
use anyhow::{Result, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, info};

/// Hop-by-hop request headers never passed to the origin
const HOP_BY_HOP_REQUEST: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "connection",
    "keep-alive",
];

/// Hop-by-hop response headers replaced before the client sees them
const HOP_BY_HOP_RESPONSE: &[&str] = &["connection", "proxy-connection", "keep-alive"];

/// ResponseHead is the status line and headers of an origin response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: u8,
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

/// forward relays one non-CONNECT request to the origin named by `Host`
pub async fn forward<S>(
    client: &mut S,
    head: &RequestHead,
    common: &ListenerCommon,
    services: &Services,
    session: &StatsSession,
) -> Result<RelayTotals>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(host_header) = head.header("host") else {
        send_error(client, 400, "Missing Host header").await;
        bail!("[ERR] request without Host header");
    };
    let (host, port) = split_host_port(host_header);

    let upstream = super::dial(client, common, services, &host, port).await?;
    let mut upstream = BufReader::new(upstream);
    let mut totals = RelayTotals::default();

    // Request head then exactly Content-Length body bytes
    let outbound = build_forward_head(head, &host, port);
    upstream.write_all(&outbound).await?;
    totals.from_client += outbound.len() as u64;
    session.traffic(0, outbound.len() as u64);

    let body = copy_body(client, &mut upstream, head.content_length(), session).await?;
    totals.from_client += body;
    upstream.flush().await?;
    debug!(proxy = %common.name, method = %head.method, %host, port, body, "request forwarded");

    let response = match timeout(CONNECT_TIMEOUT, read_response_head(&mut upstream)).await {
        Err(_) => {
            send_error(client, 504, "Gateway Timeout").await;
            bail!("[ERR] {host}:{port} sent no response");
        }
        Ok(Err(e)) => {
            send_error(client, 502, "Target server closed connection").await;
            bail!("[ERR] bad response from {host}:{port}: {e}");
        }
        Ok(Ok(response)) => response,
    };

    let rewritten = build_response_head(&response);
    client.write_all(&rewritten).await?;
    totals.to_client += rewritten.len() as u64;
    session.traffic(rewritten.len() as u64, 0);
    info!(proxy = %common.name, method = %head.method, %host, code = response.code, "response received");

    totals.to_client += stream_body(&mut upstream, client, session).await?;
    let _ = client.shutdown().await;
    Ok(totals)
}

/// build_forward_head renders the origin-form request with hop-by-hop headers replaced
pub fn build_forward_head(head: &RequestHead, host: &str, port: u16) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", head.method, origin_form(&head.target), head.version);

    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || HOP_BY_HOP_REQUEST.contains(&lower.as_str()) {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }

    if port == 80 {
        out.push_str(&format!("Host: {host}\r\n"));
    } else {
        out.push_str(&format!("Host: {host}:{port}\r\n"));
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

/// build_response_head renders the origin's status and headers, closing after the body
pub fn build_response_head(response: &ResponseHead) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.{} {} {}\r\n",
        response.version, response.code, response.reason
    );
    for (name, value) in &response.headers {
        if HOP_BY_HOP_RESPONSE.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

/// read_response_head reads the origin's head up to the blank line
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::with_capacity(1024);
    loop {
        let start = raw.len();
        let budget = (MAX_HEAD + 1).saturating_sub(raw.len()) as u64;
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut raw).await?;
        if n == 0 {
            bail!("[ERR] connection closed before response head");
        }
        if raw.len() > MAX_HEAD {
            bail!("[ERR] response head exceeds {MAX_HEAD} bytes");
        }
        let line = &raw[start..];
        if start > 0 && (line == b"\r\n" || line == b"\n") {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(&raw)? {
        httparse::Status::Complete(_) => (),
        httparse::Status::Partial => bail!("[ERR] incomplete response head"),
    }

    let (Some(version), Some(code)) = (res.version, res.code) else {
        bail!("[ERR] response status line incomplete");
    };
    let headers = res
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    Ok(ResponseHead {
        version,
        code,
        reason: res.reason.unwrap_or_default().to_string(),
        headers,
    })
}

/// copy_body moves exactly `len` request body bytes to the origin
async fn copy_body<R, W>(reader: &mut R, writer: &mut W, len: u64, session: &StatsSession) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    let mut buf = vec![0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            bail!("[ERR] client closed with {remaining} body bytes outstanding");
        }
        writer.write_all(&buf[..n]).await?;
        session.traffic(0, n as u64);
        remaining -= n as u64;
    }
    Ok(len)
}

/// stream_body copies the response body until the origin closes or goes idle
async fn stream_body<R, W>(reader: &mut R, writer: &mut W, session: &StatsSession) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match timeout(IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                debug!(idle_secs = IDLE_TIMEOUT.as_secs(), "response body idle timeout");
                break;
            }
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        session.traffic(n as u64, 0);
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}
