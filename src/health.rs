//! Periodic egress reachability checks.
//!
//! Every target is resolved and dialed from the egress address, the same way
//! proxied traffic leaves the host:
//!
//! ```text
//!   http://host[:port]/path   GET, a 2xx or 3xx status is a success
//!   https://host[:port]/...   TCP connect only, port 443 by default
//!   host[:port]               same as https://
//! ```
//!
//! The node is `Healthy` when at least one target succeeds.

use crate::config::{CheckStrategy, HealthConfig};
use crate::egress;
use crate::http::forward::read_response_head;
use crate::server::Services;
use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Slack the parallel strategy gets on top of `check_timeout`
const PARALLEL_SLACK: Duration = Duration::from_secs(2);

const ALL_FAILED: &str = "all test targets unreachable";

/// HealthState is the outcome of the latest check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthState {
    #[default]
    Unknown,
    Checking,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthState::Unknown => "unknown",
            HealthState::Checking => "checking",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        })
    }
}

/// CheckResult is what one target answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub target: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time: Duration,
    pub error: Option<String>,
}

/// HealthStatus is the snapshot exposed next to the worker statuses
#[derive(Debug, Clone, Default)]
pub struct HealthStatus {
    pub state: HealthState,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub last_success_target: Option<String>,
    pub last_status_code: Option<u16>,
    pub results: Vec<CheckResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CheckTarget {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

/// parse_target splits a configured target into scheme, host, port and path
fn parse_target(raw: &str) -> Result<CheckTarget> {
    let raw = raw.trim();
    let (scheme, rest) = if let Some(rest) = raw.strip_prefix("http://") {
        (Scheme::Http, rest)
    } else if let Some(rest) = raw.strip_prefix("https://") {
        (Scheme::Https, rest)
    } else {
        (Scheme::Https, raw)
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let default_port = match scheme {
        Scheme::Http => 80,
        Scheme::Https => 443,
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) if port > 0 => (host, port),
            _ => bail!("[ERR] bad port in health target {raw:?}"),
        },
        None => (authority, default_port),
    };
    if host.is_empty() {
        bail!("[ERR] no host in health target {raw:?}");
    }

    Ok(CheckTarget {
        scheme,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Clears the in-progress flag even when a check is cancelled midway
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// HealthChecker dials the configured targets from the egress address
pub struct HealthChecker {
    config: HealthConfig,
    egress: SocketAddr,
    services: Services,
    status: Mutex<HealthStatus>,
    running: AtomicBool,
}

/// HealthChecker implementation block
impl HealthChecker {
    /// new is a constructor for the HealthChecker type
    pub fn new(config: HealthConfig, egress: SocketAddr, services: Services) -> Self {
        Self {
            config,
            egress,
            services,
            status: Mutex::new(HealthStatus::default()),
            running: AtomicBool::new(false),
        }
    }

    /// status returns a copy of the latest snapshot
    pub fn status(&self) -> HealthStatus {
        self.status.lock().clone()
    }

    /// check_now runs one round and returns the resulting state
    ///
    /// A round already in progress is not doubled up; its current state is
    /// returned instead.
    pub async fn check_now(&self) -> HealthState {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("health check already in progress");
            return self.status.lock().state;
        }
        let _guard = RunningGuard(&self.running);

        let previous = {
            let mut status = self.status.lock();
            let previous = status.state;
            status.state = HealthState::Checking;
            status.last_check = Some(Utc::now());
            previous
        };

        let results = match self.config.check_strategy {
            CheckStrategy::Serial => self.check_serial().await,
            CheckStrategy::Parallel => self.check_parallel().await,
        };

        let state = self.record(results);
        if state != previous {
            match state {
                HealthState::Healthy => info!(egress = %self.egress.ip(), "egress is healthy"),
                _ => warn!(egress = %self.egress.ip(), "egress is unhealthy: {ALL_FAILED}"),
            }
        }
        state
    }

    /// mark_stopped resets the state once the checker task is gone
    pub fn mark_stopped(&self) {
        self.status.lock().state = HealthState::Unknown;
    }

    /// spawn runs a check right away and then every `check_interval`
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let checker = Arc::clone(self);
        let period = self.config.check_interval().max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => (),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = checker.check_now() => (),
                }
            }
            debug!("health checker stopped");
        })
    }

    async fn check_serial(&self) -> Vec<CheckResult> {
        let mut results = Vec::with_capacity(self.config.check_services.len());
        for target in &self.config.check_services {
            results.push(self.check_target(target).await);
        }
        results
    }

    async fn check_parallel(&self) -> Vec<CheckResult> {
        let deadline = self.config.check_timeout() + PARALLEL_SLACK;
        let pool = self.config.parallel_pool_size.max(1);

        let round = stream::iter(self.config.check_services.iter().cloned())
            .map(|target| async move { self.check_target(&target).await })
            .buffer_unordered(pool)
            .collect::<Vec<_>>();

        match tokio::time::timeout(deadline, round).await {
            Ok(results) => results,
            Err(_) => {
                debug!("parallel health round hit its deadline");
                Vec::new()
            }
        }
    }

    async fn check_target(&self, target: &str) -> CheckResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.check_timeout(), self.dial(target))
            .await
            .unwrap_or_else(|_| Err(anyhow!("[ERR] timed out")));
        let response_time = started.elapsed();

        match outcome {
            Ok(status_code) => {
                let success = status_code.is_none_or(|code| (200..400).contains(&code));
                CheckResult {
                    target: target.to_string(),
                    success,
                    status_code,
                    response_time,
                    error: (!success).then(|| format!("unexpected status {}", status_code.unwrap_or(0))),
                }
            }
            Err(e) => {
                debug!(%target, "health target failed: {e:#}");
                CheckResult {
                    target: target.to_string(),
                    success: false,
                    status_code: None,
                    response_time,
                    error: Some(format!("{e:#}")),
                }
            }
        }
    }

    /// dial reaches one target; `Some(code)` for http targets, `None` for a bare connect
    async fn dial(&self, raw: &str) -> Result<Option<u16>> {
        let target = parse_target(raw)?;
        let Some(ip) = self.services.resolve(&target.host, self.egress).await? else {
            bail!("[ERR] {} is blocked by the dns blacklist", target.host);
        };
        let dest = SocketAddr::new(IpAddr::V4(ip), target.port);
        let stream = egress::connect_timeout(self.egress, dest, self.config.check_timeout()).await?;

        if target.scheme == Scheme::Https {
            return Ok(None);
        }

        let host = if target.port == 80 {
            target.host.clone()
        } else {
            format!("{}:{}", target.host, target.port)
        };
        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(
                format!(
                    "GET {} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: egressproxy-health\r\nConnection: close\r\n\r\n",
                    target.path
                )
                .as_bytes(),
            )
            .await?;
        let head = read_response_head(&mut reader).await?;
        Ok(Some(head.code))
    }

    fn record(&self, results: Vec<CheckResult>) -> HealthState {
        let now = Utc::now();
        let mut status = self.status.lock();

        match results.iter().find(|r| r.success) {
            Some(ok) => {
                status.state = HealthState::Healthy;
                status.last_success = Some(now);
                status.last_success_target = Some(ok.target.clone());
                status.last_status_code = ok.status_code;
            }
            None => {
                status.state = HealthState::Unhealthy;
                status.last_failure = Some(now);
                status.last_failure_reason = Some(ALL_FAILED.to_string());
            }
        }
        status.results = results;
        status.state
    }
}
