use super::blacklist::normalize;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// CacheEntry is one resolved hostname
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub ip: Ipv4Addr,
    pub resolved_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    /// is_fresh holds while no more than `ttl` has passed since resolution
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.resolved_at) <= self.ttl
    }
}

/// CacheInfo counts cache entries by freshness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
}

/// SweepReport counts what one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
    pub remaining: usize,
}

/// DnsCache maps normalized hostnames to their last resolution
#[derive(Debug)]
pub struct DnsCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_size: usize,
}

impl DnsCache {
    /// new creates a cache; `max_size == 0` disables size eviction
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size,
        }
    }

    pub fn insert(&self, hostname: &str, ip: Ipv4Addr, ttl: Duration) {
        self.insert_at(hostname, ip, ttl, Instant::now());
    }

    pub(crate) fn insert_at(&self, hostname: &str, ip: Ipv4Addr, ttl: Duration, at: Instant) {
        self.entries.lock().insert(
            normalize(hostname),
            CacheEntry {
                ip,
                resolved_at: at,
                ttl,
            },
        );
    }

    /// get_fresh returns an entry only while it is within its TTL
    pub fn get_fresh(&self, hostname: &str) -> Option<Ipv4Addr> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(&normalize(hostname))
            .filter(|e| e.is_fresh(now))
            .map(|e| e.ip)
    }

    /// get_stale returns an entry regardless of age, for last-resort fallback
    pub fn get_stale(&self, hostname: &str) -> Option<Ipv4Addr> {
        self.entries.lock().get(&normalize(hostname)).map(|e| e.ip)
    }

    /// clear drops one hostname, or everything when `None`
    pub fn clear(&self, hostname: Option<&str>) -> usize {
        let mut entries = self.entries.lock();
        match hostname {
            Some(h) => usize::from(entries.remove(&normalize(h)).is_some()),
            None => {
                let n = entries.len();
                entries.clear();
                n
            }
        }
    }

    pub fn info(&self) -> CacheInfo {
        let now = Instant::now();
        let entries = self.entries.lock();
        let valid = entries.values().filter(|e| e.is_fresh(now)).count();
        CacheInfo {
            total: entries.len(),
            valid,
            expired: entries.len() - valid,
        }
    }

    /// sweep drops expired entries, then evicts the oldest until under `max_size`
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let before = entries.len();
        entries.retain(|_, e| e.is_fresh(now));
        let expired = before - entries.len();

        let mut evicted = 0;
        if self.max_size > 0 && entries.len() > self.max_size {
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(host, e)| (host.clone(), e.resolved_at))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);

            let excess = entries.len() - self.max_size;
            for (host, _) in by_age.into_iter().take(excess) {
                entries.remove(&host);
                evicted += 1;
            }
        }

        SweepReport {
            expired,
            evicted,
            remaining: entries.len(),
        }
    }
}
