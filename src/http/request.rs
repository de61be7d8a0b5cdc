use crate::error::RequestError;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest request line accepted
pub const MAX_REQUEST_LINE: usize = 65536;

/// Longest request head (line plus headers) accepted
pub const MAX_HEAD: usize = MAX_REQUEST_LINE + 64 * 1024;

/// Most headers parsed from one request
pub const MAX_HEADERS: usize = 100;

/// How long a client gets to deliver the request head
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// HttpMethod is the closed set of methods the proxy serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Connect,
    Get,
    Post,
    Put,
    Delete,
    Head,
    Patch,
    Options,
}

/// HttpMethod implementation block
impl HttpMethod {
    /// parse matches a request-line method exactly (methods are case-sensitive)
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "CONNECT" => Some(HttpMethod::Connect),
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "DELETE" => Some(HttpMethod::Delete),
            "HEAD" => Some(HttpMethod::Head),
            "PATCH" => Some(HttpMethod::Patch),
            "OPTIONS" => Some(HttpMethod::Options),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RequestHead is a parsed request line plus headers, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// RequestHead implementation block
impl RequestHead {
    /// known_method maps the raw method onto the served set
    pub fn known_method(&self) -> Option<HttpMethod> {
        HttpMethod::parse(&self.method)
    }

    /// header returns the first value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// content_length is the declared body size; absent or unparseable is zero
    pub fn content_length(&self) -> u64 {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// read_request_head reads one request head, leaving any body in `reader`
pub async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);

    // Request line, with one byte of slack to detect overflow
    let n = (&mut *reader)
        .take(MAX_REQUEST_LINE as u64 + 1)
        .read_until(b'\n', &mut head)
        .await?;
    if n == 0 {
        return Err(RequestError::Closed);
    }
    if !head.ends_with(b"\n") {
        if head.len() > MAX_REQUEST_LINE {
            return Err(RequestError::LineTooLong(MAX_REQUEST_LINE));
        }
        return Err(RequestError::Malformed("truncated request line".into()));
    }

    // Header lines until the blank line
    loop {
        let start = head.len();
        let budget = (MAX_HEAD + 1).saturating_sub(head.len()) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut head)
            .await?;
        if head.len() > MAX_HEAD {
            return Err(RequestError::HeadTooLong(MAX_HEAD));
        }
        if n == 0 || !head.ends_with(b"\n") {
            return Err(RequestError::Malformed("truncated request head".into()));
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    parse_request_head(&head)
}

/// parse_request_head parses a complete head with httparse
pub fn parse_request_head(head: &[u8]) -> Result<RequestHead, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => (),
        Ok(httparse::Status::Partial) => {
            return Err(RequestError::Malformed("incomplete request head".into()));
        }
        Err(e) => return Err(RequestError::Malformed(e.to_string())),
    }

    let (Some(method), Some(target), Some(version)) = (req.method, req.path, req.version) else {
        return Err(RequestError::Malformed("incomplete request line".into()));
    };
    if target.is_empty() {
        return Err(RequestError::Malformed("empty request target".into()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: format!("HTTP/1.{version}"),
        headers: req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
    })
}

/// ConnectTargetError is why a CONNECT authority was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectTargetError {
    /// No `host:port` shape at all
    Malformed,
    /// Port not a number in 1..=65535
    InvalidPort,
}

/// parse_connect_target splits a CONNECT authority into host and port
pub fn parse_connect_target(target: &str) -> Result<(String, u16), ConnectTargetError> {
    let Some((host, port)) = target.rsplit_once(':') else {
        return Err(ConnectTargetError::Malformed);
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ConnectTargetError::Malformed);
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok((host.to_string(), port)),
        _ => Err(ConnectTargetError::InvalidPort),
    }
}

/// split_host_port reads a `Host` header, defaulting the port to 80
pub fn split_host_port(host: &str) -> (String, u16) {
    let host = host.trim();
    if let Some((name, port)) = host.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            let name = name.trim_start_matches('[').trim_end_matches(']');
            return (name.to_string(), port);
        }
    }
    (host.to_string(), 80)
}

/// origin_form rewrites an absolute-form target to the path the origin expects
pub fn origin_form(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("http://") {
        return match rest.find('/') {
            Some(idx) => rest[idx..].to_string(),
            None => "/".to_string(),
        };
    }
    if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{target}")
    }
}
