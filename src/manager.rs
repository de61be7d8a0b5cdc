//! Worker lifecycle for every configured listener.
//!
//! ```text
//!   Stopped --start--> Starting --bind ok--> Running --stop--> Stopped
//!                         |                     |
//!                         +--bind/TLS err--> Error(msg) <--run err--+
//! ```

use crate::capabilities::{Capabilities, StaticCredentials, StaticGeoLocator, TracingStats};
use crate::config::{Config, HttpConfig, Socks5Config};
use crate::dns::DnsResolver;
use crate::health::{HealthChecker, HealthStatus};
use crate::http::HttpServer;
use crate::interface::InterfaceResolver;
use crate::security::SecurityManager;
use crate::server::Services;
use crate::socks5::Socks5Server;
use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// WorkerStatus is the lifecycle state of one listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Error(String),
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Stopped => f.write_str("stopped"),
            WorkerStatus::Starting => f.write_str("starting"),
            WorkerStatus::Running => f.write_str("running"),
            WorkerStatus::Error(msg) => write!(f, "error: {msg}"),
        }
    }
}

#[derive(Debug, Clone)]
enum Listener {
    Socks5(Socks5Config),
    Http(HttpConfig),
}

impl Listener {
    fn name(&self) -> &str {
        match self {
            Listener::Socks5(c) => &c.common.name,
            Listener::Http(c) => &c.common.name,
        }
    }
}

struct Worker {
    listener: Listener,
    status: Arc<Mutex<WorkerStatus>>,
    local_addr: Option<SocketAddr>,
    token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// ProxyManager owns the listeners, the shared services and their sweepers
pub struct ProxyManager {
    services: Services,
    workers: Vec<Worker>,
    shutdown: CancellationToken,
    sweepers: Vec<JoinHandle<()>>,
    health: Option<Arc<HealthChecker>>,
}

/// ProxyManager implementation block
impl ProxyManager {
    /// new is a constructor for the ProxyManager type
    ///
    /// SOCKS5 workers are ordered before HTTP workers and start first.
    pub fn new(socks5: Vec<Socks5Config>, http: Vec<HttpConfig>, services: Services) -> Self {
        let workers = socks5
            .into_iter()
            .map(Listener::Socks5)
            .chain(http.into_iter().map(Listener::Http))
            .map(|listener| Worker {
                listener,
                status: Arc::new(Mutex::new(WorkerStatus::Stopped)),
                local_addr: None,
                token: None,
                task: None,
            })
            .collect();

        Self {
            services,
            workers,
            shutdown: CancellationToken::new(),
            sweepers: Vec::new(),
            health: None,
        }
    }

    /// with_health attaches an egress health checker started by `start_all`
    pub fn with_health(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health = Some(checker);
        self
    }

    /// from_config builds the resolver, security manager and bundled capabilities
    pub fn from_config(config: &Config, interfaces: &dyn InterfaceResolver) -> Result<Self> {
        let caps = Capabilities::new(
            Arc::new(StaticCredentials::new(&config.users)),
            Arc::new(StaticGeoLocator::new(&config.geo)),
            Arc::new(TracingStats::new()),
        );
        let services = Services::new(
            Arc::new(DnsResolver::new(config.dns.clone())),
            Some(Arc::new(SecurityManager::new(config.security.clone()))),
            caps,
        );

        let socks5 = config.socks5_listeners(interfaces)?;
        let http = config.http_listeners(interfaces)?;
        let health = if config.health.enabled {
            let egress = config.egress_addr(interfaces)?;
            Some(Arc::new(HealthChecker::new(config.health.clone(), egress, services.clone())))
        } else {
            None
        };

        let mut manager = Self::new(socks5, http, services);
        manager.health = health;
        Ok(manager)
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// start_all spawns the sweepers and starts every worker
    ///
    /// A worker that fails to start is marked `Error`; the rest still start.
    /// Returns how many workers are running.
    pub async fn start_all(&mut self) -> usize {
        if self.sweepers.is_empty() {
            self.sweepers
                .push(self.services.resolver.spawn_sweeper(self.shutdown.clone()));
            if let Some(security) = &self.services.security {
                self.sweepers.push(security.spawn_sweeper(self.shutdown.clone()));
            }
            if let Some(health) = &self.health {
                self.sweepers.push(health.spawn(self.shutdown.clone()));
            }
        }

        let names: Vec<String> = self
            .workers
            .iter()
            .map(|w| w.listener.name().to_string())
            .collect();

        let mut running = 0;
        for name in names {
            match self.start(&name).await {
                Ok(_) => running += 1,
                Err(e) => error!(proxy = %name, "[ERR] failed to start: {e:#}"),
            }
        }

        info!(running, total = self.workers.len(), "proxy workers started");
        running
    }

    /// start binds one worker and spawns its accept loop
    pub async fn start(&mut self, name: &str) -> Result<SocketAddr> {
        let services = self.services.clone();
        let shutdown = self.shutdown.child_token();
        let Some(worker) = self.workers.iter_mut().find(|w| w.listener.name() == name) else {
            bail!("[ERR] no listener named {name:?}");
        };
        if matches!(*worker.status.lock(), WorkerStatus::Running | WorkerStatus::Starting) {
            bail!("[ERR] listener {name:?} is already running");
        }
        *worker.status.lock() = WorkerStatus::Starting;

        let started = match worker.listener.clone() {
            Listener::Socks5(config) => spawn_socks5(config, services, shutdown.clone()).await,
            Listener::Http(config) => spawn_http(config, services, shutdown.clone()).await,
        };

        let (addr, run) = match started {
            Ok(started) => started,
            Err(e) => {
                *worker.status.lock() = WorkerStatus::Error(format!("{e:#}"));
                return Err(e);
            }
        };

        *worker.status.lock() = WorkerStatus::Running;
        let status = worker.status.clone();
        let proxy = name.to_string();
        worker.task = Some(tokio::spawn(async move {
            let outcome = match run.await {
                Ok(Ok(())) => WorkerStatus::Stopped,
                Ok(Err(e)) => WorkerStatus::Error(format!("{e:#}")),
                Err(e) => WorkerStatus::Error(e.to_string()),
            };
            if let WorkerStatus::Error(msg) = &outcome {
                error!(%proxy, "[ERR] listener exited: {msg}");
            }
            *status.lock() = outcome;
        }));
        worker.token = Some(shutdown);
        worker.local_addr = Some(addr);
        Ok(addr)
    }

    /// stop cancels one worker and waits for its accept loop to exit
    pub async fn stop(&mut self, name: &str) -> Result<()> {
        let Some(worker) = self.workers.iter_mut().find(|w| w.listener.name() == name) else {
            bail!("[ERR] no listener named {name:?}");
        };
        stop_worker(worker).await;
        info!(proxy = %name, "listener stopped");
        Ok(())
    }

    /// stop_all stops every worker and the sweepers, then persists active bans
    pub async fn stop_all(&mut self) {
        for worker in &mut self.workers {
            stop_worker(worker).await;
        }

        self.shutdown.cancel();
        for sweeper in self.sweepers.drain(..) {
            let _ = sweeper.await;
        }
        if let Some(security) = &self.services.security {
            security.stop();
        }
        if let Some(health) = &self.health {
            health.mark_stopped();
        }
        info!("all proxy workers stopped");
    }

    /// statuses lists every worker in start order
    pub fn statuses(&self) -> Vec<(String, WorkerStatus)> {
        self.workers
            .iter()
            .map(|w| (w.listener.name().to_string(), w.status.lock().clone()))
            .collect()
    }

    /// health_status is the latest egress check, when health checks are on
    pub fn health_status(&self) -> Option<HealthStatus> {
        self.health.as_ref().map(|h| h.status())
    }

    /// local_addr is where a running worker accepted its bind
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.workers
            .iter()
            .find(|w| w.listener.name() == name)
            .and_then(|w| w.local_addr)
    }
}

async fn spawn_socks5(
    config: Socks5Config,
    services: Services,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    let mut server = Socks5Server::new(config, services);
    let addr = server.bind().await?;
    Ok((addr, tokio::spawn(server.run(shutdown))))
}

async fn spawn_http(
    config: HttpConfig,
    services: Services,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
    // TLS material is loaded here so a bad cert fails this worker only
    let mut server = HttpServer::new(config, services)?;
    let addr = server.bind().await?;
    Ok((addr, tokio::spawn(server.run(shutdown))))
}

async fn stop_worker(worker: &mut Worker) {
    if let Some(token) = worker.token.take() {
        token.cancel();
    }
    if let Some(task) = worker.task.take() {
        let _ = task.await;
    }
    worker.local_addr = None;
    let mut status = worker.status.lock();
    if !matches!(*status, WorkerStatus::Error(_)) {
        *status = WorkerStatus::Stopped;
    }
}
