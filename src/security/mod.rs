//! Per-IP access control.
//!
//! [`SecurityManager`] answers "may this IP connect?" and learns from what the
//! protocol handlers report: auth failures, malformed handshakes and bursts of
//! connections. Crossing a threshold issues a temporary ban.
//!
//! Two locks are used and never held together: one for lists and bans, one
//! for the scan and connection windows touched on every connection.

pub mod persistence;
pub mod segment;
pub mod types;

use crate::config::{SecurityConfig, SecurityMode};
use crate::error::PersistenceError;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use segment::IpSegment;
pub use types::{
    BanRecord, IpEntry, OperationSource, Protocol, ScanType, SecurityStats, SecurityStatus, TempBan,
};

const MANUAL_BAN_REMARK: &str = "manual ban";
const MANUAL_REMOVE_REASON: &str = "manual removal";
const MOVED_TO_BLACKLIST_REASON: &str = "moved to blacklist";
const EXPIRED_REASON: &str = "expired";
const SUPERSEDED_REASON: &str = "superseded by a new ban";

/// unix_now is wall-clock seconds, the unit bans are persisted in
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Default)]
struct ListState {
    segment: IpSegment,
    entries: Vec<IpEntry>,
}

impl ListState {
    fn load(entries: Vec<IpEntry>) -> Self {
        let mut list = Self::default();
        for entry in entries {
            let spec = entry.ip.trim().to_string();
            if list.segment.add(&spec) {
                list.upsert(IpEntry { ip: spec, ..entry });
            }
        }
        list
    }

    fn upsert(&mut self, entry: IpEntry) {
        match self.entries.iter_mut().find(|e| e.ip == entry.ip) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }
}

#[derive(Debug, Default)]
struct BanState {
    blacklist: ListState,
    whitelist: ListState,
    failed_attempts: HashMap<IpAddr, u32>,
    temp_bans: HashMap<IpAddr, TempBan>,
    history: Vec<BanRecord>,
}

#[derive(Debug)]
struct ScanRecord {
    attempts: Vec<(Instant, ScanType)>,
    last_attempt: f64,
}

impl ScanRecord {
    fn types(&self) -> BTreeSet<ScanType> {
        self.attempts.iter().map(|(_, t)| *t).collect()
    }
}

#[derive(Debug)]
struct ScanState {
    records: HashMap<IpAddr, ScanRecord>,
    connections: HashMap<IpAddr, VecDeque<Instant>>,
    last_cleanup: Instant,
}

/// SecurityManager tracks lists, bans and scan detection for client IPs
#[derive(Debug)]
pub struct SecurityManager {
    config: SecurityConfig,
    state: Mutex<BanState>,
    scans: Mutex<ScanState>,
}

/// SecurityManager implementation block
impl SecurityManager {
    /// new loads lists, restores the active-ban snapshot and reads ban history
    ///
    /// Missing list files are created. Unreadable files are logged and treated
    /// as empty; the manager always starts.
    pub fn new(config: SecurityConfig) -> Self {
        let core = &config.core;

        let blacklist = load_list_or_empty(&core.blacklist_file, "blacklist");
        let whitelist = load_list_or_empty(&core.whitelist_file, "whitelist");

        let now = unix_now();
        let temp_bans: HashMap<IpAddr, TempBan> =
            match persistence::take_active_bans(&core.active_bans_file) {
                Ok(bans) => bans
                    .into_iter()
                    .filter(|b| b.is_active(now))
                    .map(|b| (b.ip, b))
                    .collect(),
                Err(e) => {
                    error!("[ERR] failed to load active bans: {e}");
                    HashMap::new()
                }
            };

        let mut history = Vec::new();
        if core.keep_ban_history {
            if !core.ban_history_file.exists() {
                log_persist(persistence::save_history(&core.ban_history_file, &[]));
            }
            history = match persistence::load_history(&core.ban_history_file) {
                Ok(h) => h,
                Err(e) => {
                    error!("[ERR] failed to load ban history: {e}");
                    Vec::new()
                }
            };
            if history.len() > core.max_history_size {
                let excess = history.len() - core.max_history_size;
                history.drain(..excess);
                log_persist(persistence::save_history(&core.ban_history_file, &history));
            }
        }

        info!(
            blacklist = blacklist.entries.len(),
            whitelist = whitelist.entries.len(),
            active_bans = temp_bans.len(),
            mode = config.core.mode.as_str(),
            "security manager loaded"
        );

        Self {
            state: Mutex::new(BanState {
                blacklist,
                whitelist,
                failed_attempts: HashMap::new(),
                temp_bans,
                history,
            }),
            scans: Mutex::new(ScanState {
                records: HashMap::new(),
                connections: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// is_ip_allowed applies temp ban, whitelist, blacklist and then the mode default
    pub fn is_ip_allowed(&self, ip: IpAddr) -> bool {
        let mut state = self.state.lock();

        if state.whitelist.segment.contains(ip) {
            return true;
        }

        let now = unix_now();
        if let Some(ban) = state.temp_bans.get(&ip) {
            if ban.is_active(now) {
                return false;
            }
            self.expire_bans(&mut state, now);
        }

        if state.blacklist.segment.contains(ip) {
            return false;
        }

        match self.config.core.mode {
            SecurityMode::Whitelist => false,
            SecurityMode::Blacklist | SecurityMode::Mixed => true,
        }
    }

    /// record_auth_failure counts a failure and bans once the protocol's limit is hit
    ///
    /// Returns true when this failure triggered a ban.
    pub fn record_auth_failure(&self, ip: IpAddr, protocol: Protocol) -> bool {
        let detection = &self.config.auth_failure_detection;
        if !detection.enabled {
            return false;
        }

        let (max_failures, ban_duration) = if protocol.is_http() {
            (detection.http_max_failures, detection.http_ban_duration)
        } else {
            (detection.socks_max_failures, detection.socks_ban_duration)
        };

        let mut state = self.state.lock();
        let failures = state.failed_attempts.entry(ip).or_insert(0);
        *failures += 1;
        let failures = *failures;
        warn!(%ip, %protocol, failures, max_failures, "authentication failed");

        if failures < max_failures {
            return false;
        }

        let remark = format!("{} auth failures over limit", protocol.as_str().to_uppercase());
        self.add_ban(
            &mut state,
            ip,
            remark,
            OperationSource::system_auto(OperationSource::AUTH_FAILURE).format(),
            Duration::from_secs(ban_duration),
            protocol.as_str(),
        );
        true
    }

    /// record_auth_success forgives every earlier failure
    pub fn record_auth_success(&self, ip: IpAddr) {
        if self.state.lock().failed_attempts.remove(&ip).is_some() {
            debug!(%ip, "authentication succeeded, failure count reset");
        }
    }

    /// record_connection tracks the connection rate and returns true if it triggered a ban
    pub fn record_connection(&self, ip: IpAddr, protocol: Protocol) -> bool {
        let rapid = &self.config.advanced.rapid_connection_detection;
        if !rapid.enabled {
            return false;
        }

        let (threshold, window) = if protocol.is_http() {
            (rapid.http_threshold, rapid.http_window)
        } else {
            (rapid.socks_threshold, rapid.socks_window)
        };
        let window = Duration::from_secs(window);

        let burst = {
            let mut scans = self.scans.lock();
            let now = Instant::now();
            let stamps = scans.connections.entry(ip).or_default();
            stamps.push_back(now);
            while stamps
                .front()
                .is_some_and(|t| now.duration_since(*t) > window)
            {
                stamps.pop_front();
            }
            stamps.len() >= threshold
        };

        burst && self.record_scan_attempt(ip, ScanType::RapidConnections)
    }

    /// record_scan_attempt counts a scan attempt and bans once `max_scan_attempts` is reached
    ///
    /// A no-op unless scan protection and this particular detector are enabled.
    /// The IP's scan and connection records are cleared when it is banned.
    pub fn record_scan_attempt(&self, ip: IpAddr, scan_type: ScanType) -> bool {
        let advanced = &self.config.advanced;
        if !advanced.enable_scan_protection || !self.detection_enabled(scan_type) {
            return false;
        }

        let triggered = {
            let mut scans = self.scans.lock();
            let now = Instant::now();
            if now.duration_since(scans.last_cleanup)
                > Duration::from_secs(advanced.scan_cleanup_interval)
            {
                self.prune_scans(&mut scans, now);
                scans.last_cleanup = now;
            }

            let record = scans.records.entry(ip).or_insert_with(|| ScanRecord {
                attempts: Vec::new(),
                last_attempt: 0.0,
            });
            record.attempts.push((now, scan_type));
            record.last_attempt = unix_now();
            let count = record.attempts.len();
            debug!(%ip, scan = %scan_type, count, "scan attempt recorded");

            if count >= advanced.max_scan_attempts as usize {
                scans.records.remove(&ip);
                scans.connections.remove(&ip);
                true
            } else {
                false
            }
        };

        if triggered {
            let remark = format!("scan attack detected: {}", scan_type.description());
            let mut state = self.state.lock();
            self.add_ban(
                &mut state,
                ip,
                remark,
                OperationSource::system_auto(OperationSource::SCAN_DETECTION).format(),
                Duration::from_secs(advanced.scan_ban_duration),
                "scan",
            );
            warn!(%ip, scan = %scan_type, duration = advanced.scan_ban_duration, "scan attack detected, ip banned");
        }
        triggered
    }

    fn detection_enabled(&self, scan_type: ScanType) -> bool {
        let advanced = &self.config.advanced;
        match scan_type {
            ScanType::InvalidVersion => advanced.enable_invalid_version_detection,
            ScanType::InvalidMethod => advanced.enable_invalid_method_detection,
            ScanType::RapidConnections => advanced.rapid_connection_detection.enabled,
            ScanType::MalformedRequest => advanced.enable_malformed_request_detection,
            ScanType::InvalidHttpMethod => advanced.enable_invalid_http_method_detection,
            ScanType::MalformedConnect => advanced.enable_malformed_connect_detection,
            ScanType::InvalidPort => advanced.enable_invalid_port_detection,
            ScanType::SuspiciousHeaders => advanced.enable_suspicious_headers_detection,
            ScanType::AuthFailure => false,
        }
    }

    // Blacklist / whitelist

    pub fn add_to_blacklist(&self, spec: &str, remark: &str, created_by: Option<&str>) -> bool {
        self.add_to_list(ListKind::Black, spec, remark, created_by)
    }

    pub fn remove_from_blacklist(&self, spec: &str) -> bool {
        self.remove_from_list(ListKind::Black, spec)
    }

    pub fn add_to_whitelist(&self, spec: &str, remark: &str, created_by: Option<&str>) -> bool {
        self.add_to_list(ListKind::White, spec, remark, created_by)
    }

    pub fn remove_from_whitelist(&self, spec: &str) -> bool {
        self.remove_from_list(ListKind::White, spec)
    }

    pub fn blacklist_entries(&self) -> Vec<IpEntry> {
        self.state.lock().blacklist.entries.clone()
    }

    pub fn whitelist_entries(&self) -> Vec<IpEntry> {
        self.state.lock().whitelist.entries.clone()
    }

    fn add_to_list(&self, kind: ListKind, spec: &str, remark: &str, created_by: Option<&str>) -> bool {
        let mut state = self.state.lock();
        self.insert_list_entry(&mut state, kind, spec, remark, created_by)
    }

    fn insert_list_entry(
        &self,
        state: &mut BanState,
        kind: ListKind,
        spec: &str,
        remark: &str,
        created_by: Option<&str>,
    ) -> bool {
        let spec = spec.trim();
        let list = kind.select(state);
        if !list.segment.add(spec) {
            return false;
        }

        list.upsert(IpEntry {
            ip: spec.to_string(),
            remark: remark.to_string(),
            created_at: persistence::now_iso(),
            created_by: created_by
                .map(str::to_string)
                .unwrap_or_else(|| OperationSource::user_manual().format()),
        });
        self.save_list(kind, state);
        info!(spec, list = kind.name(), "ip list entry added");
        true
    }

    fn remove_from_list(&self, kind: ListKind, spec: &str) -> bool {
        let spec = spec.trim();
        let mut state = self.state.lock();
        let list = kind.select(&mut state);
        if !list.segment.remove(spec) {
            return false;
        }
        list.entries.retain(|e| e.ip != spec);
        self.save_list(kind, &state);
        info!(spec, list = kind.name(), "ip list entry removed");
        true
    }

    fn save_list(&self, kind: ListKind, state: &BanState) {
        let (path, entries) = match kind {
            ListKind::Black => (&self.config.core.blacklist_file, &state.blacklist.entries),
            ListKind::White => (&self.config.core.whitelist_file, &state.whitelist.entries),
        };
        log_persist(persistence::save_list(path, kind.name(), entries));
    }

    // Temporary bans

    /// add_temp_ban bans an IP by hand for the HTTP ban duration
    pub fn add_temp_ban(&self, ip: IpAddr, remark: Option<&str>, created_by: Option<&str>) {
        let mut state = self.state.lock();
        let duration = Duration::from_secs(self.config.auth_failure_detection.http_ban_duration);
        self.add_ban(
            &mut state,
            ip,
            remark.unwrap_or(MANUAL_BAN_REMARK).to_string(),
            created_by
                .map(str::to_string)
                .unwrap_or_else(|| OperationSource::user_manual().format()),
            duration,
            "manual",
        );
    }

    /// remove_temp_ban lifts a ban and resets the IP's failure count
    pub fn remove_temp_ban(&self, ip: IpAddr, reason: Option<&str>, removed_by: Option<&str>) -> bool {
        let mut state = self.state.lock();
        let removed_by = removed_by
            .map(str::to_string)
            .unwrap_or_else(|| OperationSource::user_manual().format());
        self.lift_ban(&mut state, ip, reason.unwrap_or(MANUAL_REMOVE_REASON), Some(removed_by))
            .is_some()
    }

    /// move_to_blacklist turns a temp ban into a permanent blacklist entry
    pub fn move_to_blacklist(&self, ip: IpAddr, remark: Option<&str>, created_by: Option<&str>) -> bool {
        let mut state = self.state.lock();
        let Some(ban) = state.temp_bans.get(&ip) else {
            return false;
        };

        let original = if ban.remark.is_empty() { "auto ban" } else { ban.remark.as_str() };
        let remark = remark.filter(|r| !r.is_empty());
        let new_remark = match (ban.protocol.is_empty(), remark) {
            (false, Some(r)) => format!("{} - {r}", ban.protocol),
            (false, None) => format!("{} - {original}", ban.protocol),
            (true, Some(r)) => format!("{r} (moved from temp ban, reason: {original})"),
            (true, None) => format!("moved from temp ban, reason: {original}"),
        };
        let created_by = created_by.map(str::to_string).unwrap_or_else(|| {
            OperationSource::new(
                OperationSource::USER,
                OperationSource::MANUAL,
                OperationSource::TEMP_TO_BLACKLIST,
            )
            .format()
        });

        self.lift_ban(&mut state, ip, MOVED_TO_BLACKLIST_REASON, Some(created_by.clone()));
        let moved = self.insert_list_entry(
            &mut state,
            ListKind::Black,
            &ip.to_string(),
            &new_remark,
            Some(&created_by),
        );
        if moved {
            info!(%ip, "temp ban moved to blacklist");
        }
        moved
    }

    /// temp_ban_entries lists active bans, soonest to expire first
    pub fn temp_ban_entries(&self) -> Vec<TempBan> {
        let now = unix_now();
        let mut bans: Vec<TempBan> = self
            .state
            .lock()
            .temp_bans
            .values()
            .filter(|b| b.is_active(now))
            .cloned()
            .collect();
        bans.sort_by(|a, b| a.unban_time.total_cmp(&b.unban_time));
        bans
    }

    /// ban_history returns the newest `limit` rows, oldest first
    pub fn ban_history(&self, limit: usize) -> Vec<BanRecord> {
        if !self.config.core.keep_ban_history {
            return Vec::new();
        }
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history[skip..].to_vec()
    }

    pub fn clear_ban_history(&self) -> Result<(), PersistenceError> {
        if !self.config.core.keep_ban_history {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.history.clear();
        persistence::save_history(&self.config.core.ban_history_file, &[])?;
        info!("ban history cleared");
        Ok(())
    }

    fn add_ban(
        &self,
        state: &mut BanState,
        ip: IpAddr,
        remark: String,
        created_by: String,
        duration: Duration,
        protocol: &str,
    ) {
        let ban = TempBan {
            ip,
            failed_attempts: state.failed_attempts.get(&ip).copied().unwrap_or(0),
            unban_time: unix_now() + duration.as_secs_f64(),
            remark,
            created_at: persistence::now_iso(),
            created_by,
            duration: duration.as_secs(),
            protocol: protocol.to_string(),
        };
        warn!(%ip, duration = ban.duration, remark = %ban.remark, "ip temporarily banned");

        if self.config.core.keep_ban_history {
            if state.temp_bans.contains_key(&ip) {
                mark_removed(&mut state.history, ip, Some(ban.created_by.clone()), SUPERSEDED_REASON);
            }
            state.history.push(BanRecord::from(&ban));
            let max = self.config.core.max_history_size;
            if state.history.len() > max {
                let excess = state.history.len() - max;
                state.history.drain(..excess);
            }
            self.save_history(state);
        }

        state.temp_bans.insert(ip, ban);
        self.save_active_bans(state);
    }

    fn lift_ban(
        &self,
        state: &mut BanState,
        ip: IpAddr,
        reason: &str,
        removed_by: Option<String>,
    ) -> Option<TempBan> {
        let ban = state.temp_bans.remove(&ip)?;
        state.failed_attempts.remove(&ip);

        if self.config.core.keep_ban_history {
            mark_removed(&mut state.history, ip, removed_by, reason);
            self.save_history(state);
        }
        self.save_active_bans(state);
        info!(%ip, reason, "temp ban removed");
        Some(ban)
    }

    /// expire_bans lifts every ban whose time is up
    fn expire_bans(&self, state: &mut BanState, now: f64) -> usize {
        let expired: Vec<IpAddr> = state
            .temp_bans
            .values()
            .filter(|b| !b.is_active(now))
            .map(|b| b.ip)
            .collect();
        if expired.is_empty() {
            return 0;
        }

        for ip in &expired {
            state.temp_bans.remove(ip);
            state.failed_attempts.remove(ip);
            if self.config.core.keep_ban_history {
                mark_removed(&mut state.history, *ip, None, EXPIRED_REASON);
            }
        }
        if self.config.core.keep_ban_history {
            self.save_history(state);
        }
        self.save_active_bans(state);
        debug!(count = expired.len(), "expired temp bans cleared");
        expired.len()
    }

    fn save_history(&self, state: &BanState) {
        log_persist(persistence::save_history(
            &self.config.core.ban_history_file,
            &state.history,
        ));
    }

    fn save_active_bans(&self, state: &BanState) {
        let now = unix_now();
        let active: Vec<TempBan> = state
            .temp_bans
            .values()
            .filter(|b| b.is_active(now))
            .cloned()
            .collect();
        log_persist(persistence::save_active_bans(
            &self.config.core.active_bans_file,
            &active,
        ));
    }

    fn prune_scans(&self, scans: &mut ScanState, now: Instant) {
        let keep = Duration::from_secs(self.config.advanced.scan_cleanup_interval);
        scans.records.retain(|_, record| {
            record.attempts.retain(|(at, _)| now.duration_since(*at) <= keep);
            !record.attempts.is_empty()
        });

        // Stamps are shared by both protocols; keep them for the longer window
        let rapid = &self.config.advanced.rapid_connection_detection;
        let window = Duration::from_secs(rapid.http_window.max(rapid.socks_window));
        scans.connections.retain(|_, stamps| {
            stamps.retain(|at| now.duration_since(*at) <= window);
            !stamps.is_empty()
        });
    }

    // Reporting

    pub fn security_status(&self, ip: IpAddr) -> SecurityStatus {
        let now = unix_now();
        let mut status = {
            let state = self.state.lock();
            let ban = state.temp_bans.get(&ip);
            let banned = ban.is_some_and(|b| b.is_active(now));
            let unban_time = ban.map_or(0.0, |b| b.unban_time);

            SecurityStatus {
                ip,
                in_whitelist: state.whitelist.segment.contains(ip),
                in_blacklist: state.blacklist.segment.contains(ip),
                failed_attempts: state.failed_attempts.get(&ip).copied().unwrap_or(0),
                temp_banned: banned,
                unban_time,
                remaining_seconds: if banned { (unban_time - now).max(0.0) as u64 } else { 0 },
                ban_remark: ban.map(|b| b.remark.clone()).unwrap_or_default(),
                ban_protocol: ban.map(|b| b.protocol.clone()).unwrap_or_default(),
                scan_attempts: 0,
                scan_types: Vec::new(),
                last_scan_attempt: 0.0,
            }
        };

        if let Some(record) = self.scans.lock().records.get(&ip) {
            status.scan_attempts = record.attempts.len() as u32;
            status.scan_types = record.types().into_iter().collect();
            status.last_scan_attempt = record.last_attempt;
        }
        status
    }

    pub fn stats(&self) -> SecurityStats {
        let state = self.state.lock();
        SecurityStats {
            whitelist_entries: state.whitelist.entries.len(),
            blacklist_entries: state.blacklist.entries.len(),
            temp_bans_count: state.temp_bans.len(),
            failed_attempts_count: state.failed_attempts.len(),
            ban_history_count: if self.config.core.keep_ban_history { state.history.len() } else { 0 },
            security_mode: self.config.core.mode.as_str().to_string(),
            scan_protection_enabled: self.config.advanced.enable_scan_protection,
            rapid_connection_detection_enabled: self.config.advanced.rapid_connection_detection.enabled,
            auth_failure_detection_enabled: self.config.auth_failure_detection.enabled,
        }
    }

    // Lifecycle

    /// sweep expires bans and prunes stale scan records
    pub fn sweep(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            self.expire_bans(&mut state, unix_now())
        };
        let mut scans = self.scans.lock();
        let now = Instant::now();
        self.prune_scans(&mut scans, now);
        scans.last_cleanup = now;
        expired
    }

    /// spawn_sweeper runs [`Self::sweep`] every `cleanup_interval` until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = Duration::from_secs(self.config.core.cleanup_interval.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep();
                    }
                }
            }
            debug!("security sweeper stopped");
        })
    }

    /// stop writes the active-ban snapshot so bans survive a restart
    pub fn stop(&self) {
        let state = self.state.lock();
        self.save_active_bans(&state);
        info!(active_bans = state.temp_bans.len(), "security manager stopped");
    }
}

#[derive(Debug, Clone, Copy)]
enum ListKind {
    Black,
    White,
}

impl ListKind {
    fn name(&self) -> &'static str {
        match self {
            ListKind::Black => "blacklist",
            ListKind::White => "whitelist",
        }
    }

    fn select<'a>(&self, state: &'a mut BanState) -> &'a mut ListState {
        match self {
            ListKind::Black => &mut state.blacklist,
            ListKind::White => &mut state.whitelist,
        }
    }
}

/// mark_removed stamps the newest open history row for `ip`
fn mark_removed(history: &mut [BanRecord], ip: IpAddr, removed_by: Option<String>, reason: &str) {
    let ip = ip.to_string();
    if let Some(row) = history
        .iter_mut()
        .rev()
        .find(|r| r.ip == ip && r.removed_at.as_deref().is_none_or(str::is_empty))
    {
        row.removed_at = Some(persistence::now_iso());
        row.removed_by = removed_by;
        row.removed_reason = Some(reason.to_string());
    }
}

fn load_list_or_empty(path: &Path, description: &str) -> ListState {
    if let Err(e) = persistence::ensure_list(path, description) {
        error!("[ERR] failed to create {description} file: {e}");
        return ListState::default();
    }
    match persistence::load_list(path) {
        Ok(entries) => ListState::load(entries),
        Err(e) => {
            error!("[ERR] failed to load {description}: {e}");
            ListState::default()
        }
    }
}

fn log_persist(result: Result<(), PersistenceError>) {
    if let Err(e) = result {
        error!("[ERR] failed to persist security state: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityCoreConfig;
    use tempfile::TempDir;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn config(dir: &TempDir) -> SecurityConfig {
        let mut config = SecurityConfig {
            core: SecurityCoreConfig::in_dir(dir.path()),
            ..SecurityConfig::default()
        };
        config.core.mode = SecurityMode::Blacklist;
        config
    }

    fn scan_config(dir: &TempDir) -> SecurityConfig {
        let mut config = config(dir);
        config.advanced.enable_scan_protection = true;
        config.advanced.max_scan_attempts = 3;
        config.advanced.enable_invalid_version_detection = true;
        config
    }

    #[test]
    fn mode_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        assert!(SecurityManager::new(cfg.clone()).is_ip_allowed(ip("203.0.113.1")));

        cfg.core.mode = SecurityMode::Whitelist;
        let manager = SecurityManager::new(cfg);
        assert!(!manager.is_ip_allowed(ip("203.0.113.1")));
        manager.add_to_whitelist("203.0.113.0/24", "office", None);
        assert!(manager.is_ip_allowed(ip("203.0.113.1")));
    }

    #[test]
    fn auth_failures_ban_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(config(&dir));
        let client = ip("198.51.100.4");

        for _ in 0..4 {
            assert!(!manager.record_auth_failure(client, Protocol::Socks5));
        }
        assert!(manager.is_ip_allowed(client));
        assert!(manager.record_auth_failure(client, Protocol::Socks5));
        assert!(!manager.is_ip_allowed(client));

        let history = manager.ban_history(10);
        assert_eq!(history.len(), 1);
        assert!(history[0].created_by.contains("auth_failure"));
        assert_eq!(history[0].failed_attempts, 5);
        assert_eq!(history[0].protocol, "socks5");

        let status = manager.security_status(client);
        assert!(status.temp_banned);
        assert!(status.remaining_seconds > 3500);
    }

    #[test]
    fn success_forgives_failures() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(config(&dir));
        let client = ip("198.51.100.5");

        for _ in 0..4 {
            manager.record_auth_failure(client, Protocol::Socks5);
        }
        manager.record_auth_success(client);
        assert!(!manager.record_auth_failure(client, Protocol::Socks5));
        assert_eq!(manager.security_status(client).failed_attempts, 1);
    }

    #[test]
    fn http_uses_its_own_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(config(&dir));
        let client = ip("198.51.100.6");
        for _ in 0..9 {
            assert!(!manager.record_auth_failure(client, Protocol::Https));
        }
        assert!(manager.record_auth_failure(client, Protocol::Https));
    }

    #[test]
    fn whitelist_dominates_blacklist_and_bans() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(config(&dir));
        let client = ip("192.0.2.10");

        manager.add_to_blacklist("192.0.2.0/24", "", None);
        manager.add_temp_ban(client, None, None);
        assert!(!manager.is_ip_allowed(client));

        manager.add_to_whitelist("192.0.2.10", "trusted", None);
        assert!(manager.is_ip_allowed(client));
    }

    #[test]
    fn scan_ban_after_max_attempts_clears_record() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(scan_config(&dir));
        let client = ip("203.0.113.9");

        assert!(!manager.record_scan_attempt(client, ScanType::InvalidVersion));
        assert!(!manager.record_scan_attempt(client, ScanType::InvalidVersion));
        assert_eq!(manager.security_status(client).scan_attempts, 2);
        assert!(manager.record_scan_attempt(client, ScanType::InvalidVersion));
        assert!(!manager.is_ip_allowed(client));

        let status = manager.security_status(client);
        assert!(status.ban_remark.contains("invalid version"));
        assert_eq!(status.ban_protocol, "scan");
        assert_eq!(status.scan_attempts, 0);
    }

    #[test]
    fn disabled_detector_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(scan_config(&dir));
        let client = ip("203.0.113.10");
        for _ in 0..5 {
            assert!(!manager.record_scan_attempt(client, ScanType::SuspiciousHeaders));
        }
        assert!(manager.is_ip_allowed(client));
    }

    #[test]
    fn rapid_connections_trigger_scan_ban() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = scan_config(&dir);
        cfg.advanced.max_scan_attempts = 1;
        cfg.advanced.rapid_connection_detection.enabled = true;
        cfg.advanced.rapid_connection_detection.socks_threshold = 3;
        let manager = SecurityManager::new(cfg);
        let client = ip("203.0.113.11");

        assert!(!manager.record_connection(client, Protocol::Socks5));
        assert!(!manager.record_connection(client, Protocol::Socks5));
        assert!(manager.record_connection(client, Protocol::Socks5));
        assert!(manager.security_status(client).ban_remark.contains("rapid connections"));
    }

    #[test]
    fn connection_stamps_outlive_the_shorter_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.advanced.rapid_connection_detection.enabled = true;
        cfg.advanced.rapid_connection_detection.http_window = 60;
        cfg.advanced.rapid_connection_detection.socks_window = 120;
        let manager = SecurityManager::new(cfg);
        let client = ip("203.0.113.12");

        assert!(!manager.record_connection(client, Protocol::Socks5));
        let start = Instant::now();

        let mut scans = manager.scans.lock();
        manager.prune_scans(&mut scans, start + Duration::from_secs(90));
        assert_eq!(scans.connections.get(&client).map(|s| s.len()), Some(1));

        manager.prune_scans(&mut scans, start + Duration::from_secs(130));
        assert!(!scans.connections.contains_key(&client));
    }

    #[test]
    fn reban_closes_the_previous_history_row() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(config(&dir));
        let client = ip("192.0.2.40");

        manager.add_temp_ban(client, Some("first"), None);
        manager.add_temp_ban(client, Some("second"), Some("user:manual:test"));

        let history = manager.ban_history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].remark, "first");
        assert!(history[0].removed_at.is_some());
        assert_eq!(history[0].removed_reason.as_deref(), Some("superseded by a new ban"));
        assert_eq!(history[0].removed_by.as_deref(), Some("user:manual:test"));
        assert_eq!(history[1].remark, "second");
        assert!(history[1].removed_at.is_none());
        assert_eq!(manager.temp_ban_entries().len(), 1);

        // Persisted history reads back with the same rows
        let reloaded = persistence::load_history(&manager.config().core.ban_history_file).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded[0].removed_reason.as_deref(), Some("superseded by a new ban"));
    }

    #[test]
    fn manual_ban_remove_and_move() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(config(&dir));
        let a = ip("192.0.2.20");
        let b = ip("192.0.2.21");

        manager.add_temp_ban(a, None, None);
        manager.add_temp_ban(b, Some("noisy"), None);
        assert_eq!(manager.temp_ban_entries().len(), 2);

        assert!(manager.remove_temp_ban(a, None, None));
        assert!(!manager.remove_temp_ban(a, None, None));
        assert!(manager.is_ip_allowed(a));

        assert!(manager.move_to_blacklist(b, None, None));
        assert!(manager.temp_ban_entries().is_empty());
        assert!(!manager.is_ip_allowed(b));
        let entry = &manager.blacklist_entries()[0];
        assert_eq!(entry.remark, "manual - noisy");
        assert_eq!(entry.created_by, "user:manual:temp_to_blacklist");

        let history = manager.ban_history(10);
        assert_eq!(history[0].removed_reason.as_deref(), Some("manual removal"));
        assert_eq!(history[1].removed_reason.as_deref(), Some("moved to blacklist"));
    }

    #[test]
    fn expired_bans_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SecurityManager::new(config(&dir));
        let client = ip("192.0.2.30");
        {
            let mut state = manager.state.lock();
            manager.add_ban(&mut state, client, "short".into(), "test".into(), Duration::ZERO, "manual");
        }

        assert!(manager.is_ip_allowed(client));
        assert!(manager.temp_ban_entries().is_empty());
        assert_eq!(manager.sweep(), 0);
        let history = manager.ban_history(10);
        assert_eq!(history[0].removed_reason.as_deref(), Some("expired"));
        assert_eq!(history[0].removed_by, None);
    }

    #[test]
    fn history_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.core.max_history_size = 3;
        let manager = SecurityManager::new(cfg);

        for i in 0..5 {
            manager.add_temp_ban(ip(&format!("192.0.2.{i}")), None, None);
        }
        let history = manager.ban_history(100);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].ip, "192.0.2.2");
        assert_eq!(manager.ban_history(1)[0].ip, "192.0.2.4");

        manager.clear_ban_history().unwrap();
        assert!(manager.ban_history(100).is_empty());
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let client = ip("198.51.100.77");
        {
            let manager = SecurityManager::new(config(&dir));
            manager.add_to_blacklist("10.0.0.1-10.0.0.5", "range", None);
            manager.add_temp_ban(client, None, None);
            manager.stop();
        }
        assert!(dir.path().join(".active_bans.json").exists());

        let manager = SecurityManager::new(config(&dir));
        assert!(!dir.path().join(".active_bans.json").exists());
        assert!(!manager.is_ip_allowed(client));
        assert!(!manager.is_ip_allowed(ip("10.0.0.3")));
        assert_eq!(manager.stats().blacklist_entries, 1);
        assert_eq!(manager.stats().ban_history_count, 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(SecurityManager::new(config(&dir)));
        let token = CancellationToken::new();
        let handle = manager.spawn_sweeper(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
