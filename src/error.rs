//! Error types shared across the proxy subsystems.
//!
//! Library code returns these typed errors; connection handlers and the
//! binary wrap them in `anyhow` when they only need to log and bail.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unknown network interface: {0}")]
    UnknownInterface(String),
}

/// Errors raised by the DNS resolver once every resolution tier is exhausted.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("invalid hostname {0:?}")]
    InvalidHostname(String),

    #[error("dns server {server} failed: {reason}")]
    Server { server: String, reason: String },

    #[error("dns query timed out after {0}s")]
    Timeout(u64),

    #[error("no A record for {0}")]
    NoRecord(String),

    #[error("all resolution attempts failed for {0}")]
    Exhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the PROXY protocol codec.
#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    #[error("invalid signature")]
    BadSignature,

    #[error("unsupported version {0}")]
    BadVersion(u8),

    #[error("header too long ({0} bytes)")]
    TooLong(usize),

    #[error("header truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("malformed header: {0}")]
    Malformed(String),

    #[error("unsupported address family {0}")]
    UnsupportedFamily(u8),

    #[error("timed out waiting for header")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while persisting security state to disk.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl PersistenceError {
    /// io wraps an io::Error with the path it occurred on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while speaking SOCKS5 to a client.
#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("client closed before the greeting was complete")]
    Truncated,

    #[error("unsupported SOCKS version {0:#04x}")]
    InvalidVersion(u8),

    #[error("client offered no authentication methods")]
    NoMethods,

    #[error("no acceptable authentication method in {0:?}")]
    NoAcceptableMethod(Vec<u8>),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Socks5Error {
    /// scan_type names the scan a handshake violation counts as, if any
    pub fn scan_type(&self) -> Option<crate::security::ScanType> {
        use crate::security::ScanType;
        match self {
            Socks5Error::Truncated | Socks5Error::NoMethods => Some(ScanType::MalformedRequest),
            Socks5Error::InvalidVersion(_) => Some(ScanType::InvalidVersion),
            Socks5Error::NoAcceptableMethod(_) => Some(ScanType::InvalidMethod),
            _ => None,
        }
    }
}

/// Errors raised while reading an HTTP request head from a client.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("client closed the connection")]
    Closed,

    #[error("timed out reading the request")]
    Timeout,

    #[error("request line longer than {0} bytes")]
    LineTooLong(usize),

    #[error("request head longer than {0} bytes")]
    HeadTooLong(usize),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
