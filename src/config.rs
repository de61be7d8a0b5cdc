//! TOML configuration.
//!
//! The on-disk shape ([`Config`]) is deserialized with serde and checked once
//! by [`Config::validate`]. Listener sections are then turned into the runtime
//! [`Socks5Config`] / [`HttpConfig`] structs handed to the servers.

use crate::error::ConfigError;
use crate::interface::InterfaceResolver;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config is the root of the configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub outbound: OutboundInterface,
    pub dns: DnsConfig,
    pub security: SecurityConfig,
    pub health: HealthConfig,
    pub socks5: Vec<ListenerSection>,
    pub http: Vec<HttpListenerSection>,
    pub users: Vec<UserEntry>,
    pub geo: Vec<GeoEntry>,
}

/// OutboundInterface selects the local address outbound traffic leaves from
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutboundInterface {
    pub iface_name: String,
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
}

/// ProxyProtocolMode is the PROXY protocol version expected from upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocolMode {
    #[default]
    Off,
    V1,
    V2,
}

/// ListenerSection is a `[[socks5]]` entry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerSection {
    pub name: String,
    pub iface_name: String,
    pub ip: Option<Ipv4Addr>,
    pub port: u16,
    pub auth_enabled: bool,
    pub security_enabled: bool,
    pub proxy_protocol: ProxyProtocolMode,
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            iface_name: String::new(),
            ip: None,
            port: 1080,
            auth_enabled: false,
            security_enabled: false,
            proxy_protocol: ProxyProtocolMode::Off,
        }
    }
}

/// HttpListenerSection is an `[[http]]` entry
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpListenerSection {
    #[serde(flatten)]
    pub listener: ListenerSection,
    pub use_https: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// UserEntry is a `[[users]]` credential pair
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

/// GeoEntry labels an IP or CIDR with a location string
#[derive(Debug, Clone, Deserialize)]
pub struct GeoEntry {
    pub network: String,
    pub location: String,
}

/// ResolveStrategy picks how remote DNS servers are queried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveStrategy {
    #[default]
    Serial,
    Parallel,
}

/// DnsConfig configures the resolver
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enable_remote_dns_resolve: bool,
    pub dns_servers: Vec<String>,
    pub enable_cache: bool,
    pub default_cache_ttl: u64,
    pub cleanup_interval: u64,
    pub max_cache_size: usize,
    pub enable_system_dns: bool,
    pub resolve_strategy: ResolveStrategy,
    pub serial_timeout: u64,
    pub parallel_timeout: u64,
    pub parallel_workers: usize,
    pub blacklist_domains: Vec<String>,
    pub blacklist_patterns: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enable_remote_dns_resolve: false,
            dns_servers: [
                "8.8.8.8",
                "1.1.1.1",
                "208.67.222.222",
                "8.8.4.4",
                "1.0.0.1",
                "208.67.220.220",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            enable_cache: true,
            default_cache_ttl: 300,
            cleanup_interval: 600,
            max_cache_size: 1000,
            enable_system_dns: false,
            resolve_strategy: ResolveStrategy::Serial,
            serial_timeout: 3,
            parallel_timeout: 3,
            parallel_workers: 5,
            blacklist_domains: Vec::new(),
            blacklist_patterns: Vec::new(),
        }
    }
}

/// SecurityMode decides the fate of IPs on neither list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Blacklist,
    Whitelist,
    #[default]
    Mixed,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Blacklist => "blacklist",
            SecurityMode::Whitelist => "whitelist",
            SecurityMode::Mixed => "mixed",
        }
    }
}

/// SecurityConfig groups every security manager setting
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub core: SecurityCoreConfig,
    pub auth_failure_detection: AuthFailureConfig,
    pub advanced: AdvancedSecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityCoreConfig {
    pub mode: SecurityMode,
    pub blacklist_file: PathBuf,
    pub whitelist_file: PathBuf,
    pub ban_history_file: PathBuf,
    pub active_bans_file: PathBuf,
    pub cleanup_interval: u64,
    pub keep_ban_history: bool,
    pub max_history_size: usize,
}

impl Default for SecurityCoreConfig {
    fn default() -> Self {
        Self {
            mode: SecurityMode::Mixed,
            blacklist_file: PathBuf::from("data/blacklist.json"),
            whitelist_file: PathBuf::from("data/whitelist.json"),
            ban_history_file: PathBuf::from("data/ban_history.csv"),
            active_bans_file: PathBuf::from("data/.active_bans.json"),
            cleanup_interval: 300,
            keep_ban_history: true,
            max_history_size: 100,
        }
    }
}

impl SecurityCoreConfig {
    /// in_dir places every data file under the given directory
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            blacklist_file: dir.join("blacklist.json"),
            whitelist_file: dir.join("whitelist.json"),
            ban_history_file: dir.join("ban_history.csv"),
            active_bans_file: dir.join(".active_bans.json"),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthFailureConfig {
    pub enabled: bool,
    pub http_max_failures: u32,
    pub http_ban_duration: u64,
    pub socks_max_failures: u32,
    pub socks_ban_duration: u64,
}

impl Default for AuthFailureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            http_max_failures: 10,
            http_ban_duration: 3600,
            socks_max_failures: 5,
            socks_ban_duration: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvancedSecurityConfig {
    pub enable_scan_protection: bool,
    pub max_scan_attempts: u32,
    pub scan_ban_duration: u64,
    pub scan_cleanup_interval: u64,
    pub enable_invalid_version_detection: bool,
    pub enable_invalid_method_detection: bool,
    pub enable_malformed_request_detection: bool,
    pub enable_invalid_http_method_detection: bool,
    pub enable_malformed_connect_detection: bool,
    pub enable_invalid_port_detection: bool,
    pub enable_suspicious_headers_detection: bool,
    pub rapid_connection_detection: RapidConnectionConfig,
}

impl Default for AdvancedSecurityConfig {
    fn default() -> Self {
        Self {
            enable_scan_protection: false,
            max_scan_attempts: 5,
            scan_ban_duration: 3600,
            scan_cleanup_interval: 3600,
            enable_invalid_version_detection: false,
            enable_invalid_method_detection: false,
            enable_malformed_request_detection: false,
            enable_invalid_http_method_detection: false,
            enable_malformed_connect_detection: false,
            enable_invalid_port_detection: false,
            enable_suspicious_headers_detection: false,
            rapid_connection_detection: RapidConnectionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RapidConnectionConfig {
    pub enabled: bool,
    pub http_threshold: usize,
    pub http_window: u64,
    pub socks_threshold: usize,
    pub socks_window: u64,
}

impl Default for RapidConnectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            http_threshold: 200,
            http_window: 60,
            socks_threshold: 50,
            socks_window: 60,
        }
    }
}

/// CheckStrategy picks whether health targets are tried one by one or together
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStrategy {
    #[default]
    Serial,
    Parallel,
}

/// HealthConfig configures the periodic egress reachability check
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub check_interval: u64,
    pub check_services: Vec<String>,
    pub check_timeout: u64,
    pub check_strategy: CheckStrategy,
    pub parallel_pool_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: 1800,
            check_services: Vec::new(),
            check_timeout: 5,
            check_strategy: CheckStrategy::Serial,
            parallel_pool_size: 3,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout)
    }
}

/// ListenerCommon is the runtime config shared by both listener kinds
#[derive(Debug, Clone)]
pub struct ListenerCommon {
    pub name: String,
    pub listen: SocketAddr,
    pub egress: SocketAddr,
    pub auth_enabled: bool,
    pub security_enabled: bool,
    pub proxy_protocol: ProxyProtocolMode,
}

/// Socks5Config is the validated runtime config of one SOCKS5 listener
#[derive(Debug, Clone)]
pub struct Socks5Config {
    pub common: ListenerCommon,
}

/// TlsPaths locates the PEM cert chain and private key
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// HttpConfig is the validated runtime config of one HTTP listener
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub common: ListenerCommon,
    pub tls: Option<TlsPaths>,
}

impl ListenerCommon {
    /// local builds a loopback listener config egressing from loopback
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            egress: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            auth_enabled: false,
            security_enabled: false,
            proxy_protocol: ProxyProtocolMode::Off,
        }
    }
}

/// Config implementation block
impl Config {
    /// load reads and parses a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// from_toml parses configuration text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// validate rejects configurations the servers cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        // Listener names double as worker ids
        let mut names = HashSet::new();
        let listeners = self
            .socks5
            .iter()
            .map(|l| ("socks5", l))
            .chain(self.http.iter().map(|h| ("http", &h.listener)));
        for (index, (kind, listener)) in listeners.enumerate() {
            let name = listener_name(kind, index, listener);
            if !names.insert(name.clone()) {
                return invalid(format!("duplicate listener name {name:?}"));
            }
            if listener.auth_enabled && self.users.is_empty() {
                return invalid(format!("listener {name:?} enables auth but no users are configured"));
            }
        }

        for http in &self.http {
            if http.use_https && (http.cert_file.is_none() || http.key_file.is_none()) {
                return invalid(format!(
                    "https listener {:?} needs cert_file and key_file",
                    http.listener.name
                ));
            }
        }

        if self.dns.enable_remote_dns_resolve {
            if self.dns.dns_servers.is_empty() {
                return invalid("remote dns enabled with no dns_servers".into());
            }
            for server in &self.dns.dns_servers {
                if crate::dns::parse_server(server).is_none() {
                    return invalid(format!("dns server {server:?} is not an IP address"));
                }
            }
        }
        if self.dns.parallel_workers == 0 {
            return invalid("dns.parallel_workers must be at least 1".into());
        }
        for pattern in &self.dns.blacklist_patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                return invalid(format!("bad dns blacklist pattern {pattern:?}: {e}"));
            }
        }

        let auth = &self.security.auth_failure_detection;
        if auth.enabled && (auth.http_max_failures == 0 || auth.socks_max_failures == 0) {
            return invalid("auth failure thresholds must be at least 1".into());
        }
        let advanced = &self.security.advanced;
        if advanced.enable_scan_protection && advanced.max_scan_attempts == 0 {
            return invalid("security.advanced.max_scan_attempts must be at least 1".into());
        }
        let rapid = &advanced.rapid_connection_detection;
        if rapid.enabled && (rapid.http_threshold == 0 || rapid.socks_threshold == 0) {
            return invalid("rapid connection thresholds must be at least 1".into());
        }

        let health = &self.health;
        if health.enabled {
            if health.check_services.is_empty() {
                return invalid("health checks enabled with no check_services".into());
            }
            if health.check_interval == 0 || health.check_timeout == 0 {
                return invalid("health check_interval and check_timeout must be at least 1".into());
            }
            if health.parallel_pool_size == 0 {
                return invalid("health.parallel_pool_size must be at least 1".into());
            }
        }

        Ok(())
    }

    /// egress_addr resolves the `[outbound]` section to a bindable address
    pub fn egress_addr(&self, interfaces: &dyn InterfaceResolver) -> Result<SocketAddr, ConfigError> {
        let ip = resolve_ip(&self.outbound.iface_name, self.outbound.ip, interfaces)?;
        Ok(SocketAddr::new(IpAddr::V4(ip), self.outbound.port))
    }

    /// socks5_listeners builds the runtime SOCKS5 configs
    pub fn socks5_listeners(
        &self,
        interfaces: &dyn InterfaceResolver,
    ) -> Result<Vec<Socks5Config>, ConfigError> {
        let egress = self.egress_addr(interfaces)?;
        self.socks5
            .iter()
            .enumerate()
            .map(|(i, section)| {
                Ok(Socks5Config {
                    common: common_from_section("socks5", i, section, egress, interfaces)?,
                })
            })
            .collect()
    }

    /// http_listeners builds the runtime HTTP configs
    pub fn http_listeners(
        &self,
        interfaces: &dyn InterfaceResolver,
    ) -> Result<Vec<HttpConfig>, ConfigError> {
        let egress = self.egress_addr(interfaces)?;
        self.http
            .iter()
            .enumerate()
            .map(|(i, section)| {
                let tls = match (section.use_https, &section.cert_file, &section.key_file) {
                    (true, Some(cert), Some(key)) => Some(TlsPaths {
                        cert_file: cert.clone(),
                        key_file: key.clone(),
                    }),
                    (true, _, _) => {
                        return Err(ConfigError::Invalid(format!(
                            "https listener {:?} needs cert_file and key_file",
                            section.listener.name
                        )));
                    }
                    _ => None,
                };
                Ok(HttpConfig {
                    common: common_from_section("http", i, &section.listener, egress, interfaces)?,
                    tls,
                })
            })
            .collect()
    }
}

impl DnsConfig {
    pub fn serial_timeout(&self) -> Duration {
        Duration::from_secs(self.serial_timeout)
    }

    pub fn parallel_timeout(&self) -> Duration {
        Duration::from_secs(self.parallel_timeout)
    }
}

/// listener_name falls back to `<kind>_<index>` for unnamed listeners
fn listener_name(kind: &str, index: usize, section: &ListenerSection) -> String {
    if section.name.is_empty() {
        format!("{kind}_{index}")
    } else {
        section.name.clone()
    }
}

/// resolve_ip prefers an explicit IP, then the interface name, then 0.0.0.0
fn resolve_ip(
    iface_name: &str,
    ip: Option<Ipv4Addr>,
    interfaces: &dyn InterfaceResolver,
) -> Result<Ipv4Addr, ConfigError> {
    if let Some(ip) = ip {
        return Ok(ip);
    }
    if iface_name.is_empty() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    interfaces
        .resolve_ip(iface_name)
        .ok_or_else(|| ConfigError::UnknownInterface(iface_name.to_string()))
}

fn common_from_section(
    kind: &str,
    index: usize,
    section: &ListenerSection,
    egress: SocketAddr,
    interfaces: &dyn InterfaceResolver,
) -> Result<ListenerCommon, ConfigError> {
    let ip = resolve_ip(&section.iface_name, section.ip, interfaces)?;
    Ok(ListenerCommon {
        name: listener_name(kind, index, section),
        listen: SocketAddr::new(IpAddr::V4(ip), section.port),
        egress,
        auth_enabled: section.auth_enabled,
        security_enabled: section.security_enabled,
        proxy_protocol: section.proxy_protocol,
    })
}
