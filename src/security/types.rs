use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Protocol is the client-facing protocol a security event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Socks5,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks5 => "socks5",
        }
    }

    /// is_http selects the HTTP thresholds for both plain and TLS listeners
    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ScanType names a probing pattern reported by the protocol handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    InvalidVersion,
    InvalidMethod,
    RapidConnections,
    MalformedRequest,
    AuthFailure,
    InvalidHttpMethod,
    MalformedConnect,
    InvalidPort,
    SuspiciousHeaders,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::InvalidVersion => "invalid_version",
            ScanType::InvalidMethod => "invalid_method",
            ScanType::RapidConnections => "rapid_connections",
            ScanType::MalformedRequest => "malformed_request",
            ScanType::AuthFailure => "auth_failure",
            ScanType::InvalidHttpMethod => "invalid_http_method",
            ScanType::MalformedConnect => "malformed_connect",
            ScanType::InvalidPort => "invalid_port",
            ScanType::SuspiciousHeaders => "suspicious_headers",
        }
    }

    /// description is the human-readable label used in ban remarks
    pub fn description(&self) -> &'static str {
        match self {
            ScanType::InvalidVersion => "invalid version",
            ScanType::InvalidMethod => "invalid auth method",
            ScanType::RapidConnections => "rapid connections",
            ScanType::MalformedRequest => "malformed request",
            ScanType::AuthFailure => "auth failure",
            ScanType::InvalidHttpMethod => "invalid HTTP method",
            ScanType::MalformedConnect => "malformed CONNECT request",
            ScanType::InvalidPort => "invalid port",
            ScanType::SuspiciousHeaders => "suspicious headers",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OperationSource records who created or removed an entry
///
/// Serialized as `source:method[:identifier]`, for example
/// `system:auto:auth_failure` or `user:manual:admin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSource {
    pub source: String,
    pub method: String,
    pub identifier: String,
}

impl OperationSource {
    pub const SYSTEM: &'static str = "system";
    pub const USER: &'static str = "user";
    pub const CLI: &'static str = "cli";
    pub const IMPORT: &'static str = "import";
    pub const MIGRATION: &'static str = "migration";

    pub const AUTO: &'static str = "auto";
    pub const MANUAL: &'static str = "manual";
    pub const COMMAND: &'static str = "command";

    pub const AUTH_FAILURE: &'static str = "auth_failure";
    pub const SCAN_DETECTION: &'static str = "scan_detection";
    pub const RATE_LIMIT: &'static str = "rate_limit";
    pub const ADMIN: &'static str = "admin";
    pub const BATCH_IMPORT: &'static str = "batch_import";
    pub const TEMP_TO_BLACKLIST: &'static str = "temp_to_blacklist";

    /// new is a constructor for an operation source
    pub fn new(source: &str, method: &str, identifier: &str) -> Self {
        Self {
            source: source.to_string(),
            method: method.to_string(),
            identifier: identifier.to_string(),
        }
    }

    pub fn user_manual() -> Self {
        Self::new(Self::USER, Self::MANUAL, Self::ADMIN)
    }

    pub fn system_auto(reason: &str) -> Self {
        Self::new(Self::SYSTEM, Self::AUTO, reason)
    }

    pub fn format(&self) -> String {
        self.to_string()
    }

    /// parse splits a `created_by` string; anything without a method is all source
    pub fn parse(created_by: &str) -> Self {
        let mut parts = created_by.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(source), Some(method), identifier) => {
                Self::new(source, method, identifier.unwrap_or(""))
            }
            _ => Self::new(created_by, "", ""),
        }
    }

    /// display_name renders the source for operators
    pub fn display_name(&self) -> String {
        if self.source == Self::USER && self.method == Self::MANUAL {
            return "User manual".to_string();
        }

        let source = match self.source.as_str() {
            Self::SYSTEM => "System",
            Self::USER => "User",
            Self::CLI => "CLI",
            Self::IMPORT => "Import",
            Self::MIGRATION => "Migration",
            other => other,
        };
        let method = match self.method.as_str() {
            Self::AUTO => "auto",
            Self::MANUAL => "manual",
            Self::COMMAND => "command",
            other => other,
        };

        if self.identifier.is_empty() || self.identifier == Self::ADMIN {
            return format!("{source} {method}").trim().to_string();
        }

        if self.source == Self::SYSTEM && self.method == Self::AUTO {
            let reason = match self.identifier.as_str() {
                Self::AUTH_FAILURE => "auth failure",
                Self::SCAN_DETECTION => "scan detection",
                Self::RATE_LIMIT => "rate limit",
                other => other,
            };
            return format!("System auto ({reason})");
        }

        format!("{source} {method} ({})", self.identifier)
    }
}

impl fmt::Display for OperationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.method)?;
        if !self.identifier.is_empty() {
            write!(f, ":{}", self.identifier)?;
        }
        Ok(())
    }
}

/// IpEntry is one persisted blacklist or whitelist entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpEntry {
    pub ip: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default = "legacy_source")]
    pub created_by: String,
}

fn legacy_source() -> String {
    "system:auto:legacy".to_string()
}

/// TempBan is an active, time-bounded ban
///
/// `unban_time` is seconds since the Unix epoch so bans survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempBan {
    pub ip: IpAddr,
    #[serde(default)]
    pub failed_attempts: u32,
    pub unban_time: f64,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub protocol: String,
}

impl TempBan {
    pub fn is_active(&self, now: f64) -> bool {
        now < self.unban_time
    }
}

/// BanRecord is one row of the ban history log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    pub ip: String,
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default)]
    pub unban_time: f64,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub protocol: String,
    pub removed_at: Option<String>,
    pub removed_by: Option<String>,
    pub removed_reason: Option<String>,
}

impl From<&TempBan> for BanRecord {
    fn from(ban: &TempBan) -> Self {
        Self {
            ip: ban.ip.to_string(),
            failed_attempts: ban.failed_attempts,
            unban_time: ban.unban_time,
            remark: ban.remark.clone(),
            created_at: ban.created_at.clone(),
            created_by: ban.created_by.clone(),
            duration: ban.duration,
            protocol: ban.protocol.clone(),
            removed_at: None,
            removed_by: None,
            removed_reason: None,
        }
    }
}

/// SecurityStatus is everything known about one IP
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityStatus {
    pub ip: IpAddr,
    pub in_whitelist: bool,
    pub in_blacklist: bool,
    pub failed_attempts: u32,
    pub temp_banned: bool,
    pub unban_time: f64,
    pub remaining_seconds: u64,
    pub ban_remark: String,
    pub ban_protocol: String,
    pub scan_attempts: u32,
    pub scan_types: Vec<ScanType>,
    pub last_scan_attempt: f64,
}

/// SecurityStats summarizes the manager's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityStats {
    pub whitelist_entries: usize,
    pub blacklist_entries: usize,
    pub temp_bans_count: usize,
    pub failed_attempts_count: usize,
    pub ban_history_count: usize,
    pub security_mode: String,
    pub scan_protection_enabled: bool,
    pub rapid_connection_detection_enabled: bool,
    pub auth_failure_detection_enabled: bool,
}
