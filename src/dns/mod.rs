//! Hostname resolution for outbound connections.
//!
//! [`DnsResolver::resolve`] walks a fixed ladder: domain blacklist, IP
//! literal, fresh cache entry, then either the OS resolver or the configured
//! remote servers (serial or raced in parallel). Remote failures degrade to a
//! stale cache entry and finally to the OS resolver before giving up.

pub mod blacklist;
pub mod cache;
pub mod query;

use crate::config::{DnsConfig, ResolveStrategy};
use crate::error::ResolutionError;
use futures_util::stream::{self, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use blacklist::DomainBlacklist;
pub use cache::{CacheInfo, DnsCache, SweepReport};
pub use query::query_a;

/// Returned for blacklisted hostnames; callers treat it as "blocked"
pub const BLOCKED: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

const DNS_PORT: u16 = 53;

/// parse_server accepts `ip` or `ip:port`, defaulting to port 53
pub fn parse_server(server: &str) -> Option<SocketAddr> {
    let server = server.trim();
    server
        .parse::<SocketAddr>()
        .ok()
        .or_else(|| server.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, DNS_PORT)))
}

/// DnsResolver resolves hostnames to IPv4 addresses
#[derive(Debug)]
pub struct DnsResolver {
    config: DnsConfig,
    servers: Vec<SocketAddr>,
    blacklist: DomainBlacklist,
    cache: DnsCache,
}

/// DnsResolver implementation block
impl DnsResolver {
    /// new is a constructor for a resolver; unparseable servers are dropped
    pub fn new(config: DnsConfig) -> Self {
        let servers = config
            .dns_servers
            .iter()
            .filter_map(|s| {
                let addr = parse_server(s);
                if addr.is_none() {
                    warn!(server = %s, "ignoring bad dns server");
                }
                addr
            })
            .collect();
        let blacklist = DomainBlacklist::new(&config.blacklist_domains, &config.blacklist_patterns);
        let cache = DnsCache::new(config.max_cache_size);

        Self {
            config,
            servers,
            blacklist,
            cache,
        }
    }

    pub fn config(&self) -> &DnsConfig {
        &self.config
    }

    pub fn is_blacklisted(&self, hostname: &str) -> bool {
        self.blacklist.is_blocked(hostname)
    }

    /// resolve returns an IPv4 address for `hostname`, or [`BLOCKED`]
    ///
    /// `egress_ip` binds remote queries to the egress interface. `timeout`
    /// overrides the configured per-query timeout.
    pub async fn resolve(
        &self,
        hostname: &str,
        egress_ip: Option<IpAddr>,
        timeout: Option<Duration>,
    ) -> Result<Ipv4Addr, ResolutionError> {
        let host = blacklist::normalize(hostname);
        if host.is_empty() {
            return Err(ResolutionError::InvalidHostname(hostname.to_string()));
        }

        if self.blacklist.is_blocked(&host) {
            info!(hostname = %host, "dns blacklist hit");
            return Ok(BLOCKED);
        }

        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        if self.config.enable_cache {
            if let Some(ip) = self.cache.get_fresh(&host) {
                debug!(hostname = %host, %ip, "dns cache hit");
                return Ok(ip);
            }
        }

        let ip = if !self.config.enable_remote_dns_resolve {
            system_lookup(&host).await?
        } else {
            match self.config.resolve_strategy {
                ResolveStrategy::Serial => self.resolve_serial(&host, egress_ip, timeout).await?,
                ResolveStrategy::Parallel => self.resolve_parallel(&host, egress_ip, timeout).await?,
            }
        };

        if self.config.enable_cache {
            self.cache.insert(
                &host,
                ip,
                Duration::from_secs(self.config.default_cache_ttl),
            );
        }
        debug!(hostname = %host, %ip, "resolved");
        Ok(ip)
    }

    async fn resolve_serial(
        &self,
        host: &str,
        egress_ip: Option<IpAddr>,
        timeout: Option<Duration>,
    ) -> Result<Ipv4Addr, ResolutionError> {
        let per_query = timeout.unwrap_or_else(|| self.config.serial_timeout());

        for server in &self.servers {
            match query_a(*server, host, egress_ip, per_query).await {
                Ok(ip) => return Ok(ip),
                Err(e) => debug!(%server, hostname = %host, "dns query failed: {e}"),
            }
        }

        if let Some(ip) = self.cache.get_stale(host) {
            warn!(hostname = %host, %ip, "all dns servers failed, using expired cache entry");
            return Ok(ip);
        }

        if self.config.enable_system_dns {
            if let Ok(ip) = system_lookup(host).await {
                return Ok(ip);
            }
        }

        Err(ResolutionError::Exhausted(host.to_string()))
    }

    async fn resolve_parallel(
        &self,
        host: &str,
        egress_ip: Option<IpAddr>,
        timeout: Option<Duration>,
    ) -> Result<Ipv4Addr, ResolutionError> {
        let deadline = timeout.unwrap_or_else(|| self.config.parallel_timeout());
        let workers = self.config.parallel_workers.max(1);

        // Dropping the stream on the first success cancels the in-flight queries
        let race = async {
            let mut answers = stream::iter(self.servers.iter().copied())
                .map(|server| query_a(server, host, egress_ip, deadline))
                .buffer_unordered(workers);

            while let Some(answer) = answers.next().await {
                match answer {
                    Ok(ip) => return Some(ip),
                    Err(e) => debug!(hostname = %host, "parallel dns query failed: {e}"),
                }
            }
            None
        };

        match tokio::time::timeout(deadline, race).await {
            Ok(Some(ip)) => Ok(ip),
            Ok(None) | Err(_) => {
                debug!(hostname = %host, "parallel resolution failed, falling back to serial");
                self.resolve_serial(host, egress_ip, timeout).await
            }
        }
    }

    /// clear_cache drops one hostname, or the whole cache when `None`
    pub fn clear_cache(&self, hostname: Option<&str>) -> usize {
        self.cache.clear(hostname)
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.cache.info()
    }

    pub fn cleanup_cache(&self) -> SweepReport {
        let report = self.cache.sweep();
        if report.expired + report.evicted > 0 {
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = report.remaining,
                "dns cache swept"
            );
        }
        report
    }

    /// spawn_sweeper runs [`Self::cleanup_cache`] every `cleanup_interval` until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        let period = Duration::from_secs(self.config.cleanup_interval.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        resolver.cleanup_cache();
                    }
                }
            }
            debug!("dns cache sweeper stopped");
        })
    }
}

/// system_lookup asks the OS resolver and keeps the first IPv4 answer
pub async fn system_lookup(hostname: &str) -> Result<Ipv4Addr, ResolutionError> {
    let addrs = tokio::net::lookup_host((hostname, 0)).await?;
    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| ResolutionError::NoRecord(hostname.to_string()))
}
