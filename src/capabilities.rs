//! Collaborator capabilities the proxy engine consumes but does not own:
//! credential checks, IP geolocation labels and connection statistics.
//!
//! Each is a small trait; the bundled implementations are enough to run the
//! binary standalone and to observe behavior in tests.

use crate::config::{GeoEntry, UserEntry};
use crate::security::Protocol;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Location label used when nothing matches
pub const UNKNOWN_LOCATION: &str = "Unknown";

/// CredentialVerifier checks a username/password pair
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// GeoLocator turns an IP into a display location
pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: IpAddr) -> String;
}

/// ConnectionId identifies one tracked connection
pub type ConnectionId = u64;

/// ConnectionInfo describes a connection at the moment tracking starts
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub ip: IpAddr,
    pub protocol: Protocol,
    pub country: String,
    pub proxy_name: String,
    pub user: String,
}

/// StatsRecorder receives connection lifecycle and traffic events
pub trait StatsRecorder: Send + Sync {
    fn connection_start(&self, info: &ConnectionInfo) -> ConnectionId;

    fn connection_end(&self, id: ConnectionId, bytes_sent: u64, bytes_received: u64, success: bool);

    /// traffic reports one relayed chunk; `bytes_sent` flows to the client
    fn traffic(&self, id: ConnectionId, info: &ConnectionInfo, bytes_sent: u64, bytes_received: u64);
}

/// StaticCredentials verifies against an in-memory user table
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(users: &[UserEntry]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone()))
                .collect(),
        }
    }

    /// single builds a verifier accepting exactly one pair
    pub fn single(username: &str, password: &str) -> Self {
        Self::new(&[UserEntry {
            username: username.to_string(),
            password: password.to_string(),
        }])
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users.get(username).is_some_and(|p| p == password)
    }
}

/// StaticGeoLocator labels IPs from a network table, most specific prefix wins
#[derive(Debug, Default, Clone)]
pub struct StaticGeoLocator {
    table: Vec<(IpNet, String)>,
}

impl StaticGeoLocator {
    pub fn new(entries: &[GeoEntry]) -> Self {
        let mut table = Vec::with_capacity(entries.len());
        for entry in entries {
            let net = entry
                .network
                .parse::<IpNet>()
                .or_else(|_| entry.network.parse::<IpAddr>().map(IpNet::from));
            match net {
                Ok(net) => table.push((net, entry.location.clone())),
                Err(_) => warn!(network = %entry.network, "ignoring unparseable geo entry"),
            }
        }
        table.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Self { table }
    }
}

impl GeoLocator for StaticGeoLocator {
    fn locate(&self, ip: IpAddr) -> String {
        if ip.is_loopback() {
            return "Local".to_string();
        }
        self.table
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, location)| location.clone())
            .unwrap_or_else(|| UNKNOWN_LOCATION.to_string())
    }
}

/// NoopStats discards every event
#[derive(Debug, Default)]
pub struct NoopStats;

impl StatsRecorder for NoopStats {
    fn connection_start(&self, _info: &ConnectionInfo) -> ConnectionId {
        0
    }

    fn connection_end(&self, _id: ConnectionId, _sent: u64, _received: u64, _success: bool) {}

    fn traffic(&self, _id: ConnectionId, _info: &ConnectionInfo, _sent: u64, _received: u64) {}
}

/// ConnectionSummary is what TracingStats remembers about a finished connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub success: bool,
}

/// TracingStats logs events and keeps running totals
#[derive(Debug, Default)]
pub struct TracingStats {
    next_id: AtomicU64,
    active: AtomicU64,
    total_sent: AtomicU64,
    total_received: AtomicU64,
    finished: Mutex<HashMap<ConnectionId, ConnectionSummary>>,
}

impl TracingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// totals returns (bytes sent to clients, bytes received from clients)
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_sent.load(Ordering::Relaxed),
            self.total_received.load(Ordering::Relaxed),
        )
    }

    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn summary(&self, id: ConnectionId) -> Option<ConnectionSummary> {
        self.finished.lock().get(&id).cloned()
    }
}

impl StatsRecorder for TracingStats {
    fn connection_start(&self, info: &ConnectionInfo) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.active.fetch_add(1, Ordering::Relaxed);
        debug!(
            id,
            ip = %info.ip,
            protocol = info.protocol.as_str(),
            proxy = %info.proxy_name,
            user = %info.user,
            country = %info.country,
            "connection started"
        );
        id
    }

    fn connection_end(&self, id: ConnectionId, bytes_sent: u64, bytes_received: u64, success: bool) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.finished.lock().insert(
            id,
            ConnectionSummary {
                bytes_sent,
                bytes_received,
                success,
            },
        );
        debug!(id, bytes_sent, bytes_received, success, "connection ended");
    }

    fn traffic(&self, _id: ConnectionId, _info: &ConnectionInfo, bytes_sent: u64, bytes_received: u64) {
        self.total_sent.fetch_add(bytes_sent, Ordering::Relaxed);
        self.total_received.fetch_add(bytes_received, Ordering::Relaxed);
    }
}

/// StatsSession binds a recorder to one tracked connection
#[derive(Clone)]
pub struct StatsSession {
    recorder: Arc<dyn StatsRecorder>,
    id: ConnectionId,
    info: Arc<ConnectionInfo>,
}

impl StatsSession {
    /// start opens tracking for a connection
    pub fn start(recorder: Arc<dyn StatsRecorder>, info: ConnectionInfo) -> Self {
        let id = recorder.connection_start(&info);
        Self {
            recorder,
            id,
            info: Arc::new(info),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// traffic reports a chunk; `to_client` bytes went out, `from_client` came in
    pub fn traffic(&self, to_client: u64, from_client: u64) {
        self.recorder.traffic(self.id, &self.info, to_client, from_client);
    }

    pub fn end(&self, bytes_sent: u64, bytes_received: u64, success: bool) {
        self.recorder
            .connection_end(self.id, bytes_sent, bytes_received, success);
    }
}

/// Capabilities bundles the collaborators a listener needs
#[derive(Clone)]
pub struct Capabilities {
    pub credentials: Arc<dyn CredentialVerifier>,
    pub geo: Arc<dyn GeoLocator>,
    pub stats: Arc<dyn StatsRecorder>,
}

impl Capabilities {
    pub fn new(
        credentials: Arc<dyn CredentialVerifier>,
        geo: Arc<dyn GeoLocator>,
        stats: Arc<dyn StatsRecorder>,
    ) -> Self {
        Self {
            credentials,
            geo,
            stats,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new(
            Arc::new(StaticCredentials::default()),
            Arc::new(StaticGeoLocator::default()),
            Arc::new(NoopStats),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials() {
        let creds = StaticCredentials::single("alice", "secret");
        assert!(creds.verify("alice", "secret"));
        assert!(!creds.verify("alice", "wrong"));
        assert!(!creds.verify("bob", "secret"));
    }

    #[test]
    fn geo_prefers_most_specific_network() {
        let geo = StaticGeoLocator::new(&[
            GeoEntry {
                network: "10.0.0.0/8".into(),
                location: "Corp".into(),
            },
            GeoEntry {
                network: "10.1.0.0/16".into(),
                location: "Lab".into(),
            },
            GeoEntry {
                network: "203.0.113.9".into(),
                location: "Partner".into(),
            },
        ]);
        assert_eq!(geo.locate("10.1.2.3".parse().unwrap()), "Lab");
        assert_eq!(geo.locate("10.9.2.3".parse().unwrap()), "Corp");
        assert_eq!(geo.locate("203.0.113.9".parse().unwrap()), "Partner");
        assert_eq!(geo.locate("198.51.100.1".parse().unwrap()), UNKNOWN_LOCATION);
    }

    #[test]
    fn tracing_stats_accumulates() {
        let stats = Arc::new(TracingStats::new());
        let session = StatsSession::start(
            stats.clone(),
            ConnectionInfo {
                ip: "127.0.0.1".parse().unwrap(),
                protocol: Protocol::Socks5,
                country: "Local".into(),
                proxy_name: "test".into(),
                user: String::new(),
            },
        );
        assert_eq!(stats.active_connections(), 1);
        session.traffic(10, 0);
        session.traffic(0, 4);
        session.end(10, 4, true);
        assert_eq!(stats.totals(), (10, 4));
        assert_eq!(stats.active_connections(), 0);
        assert_eq!(
            stats.summary(session.id()),
            Some(ConnectionSummary {
                bytes_sent: 10,
                bytes_received: 4,
                success: true
            })
        );
    }
}
