//! A multi-listener egress proxy library
//!
//! ## Implementation
//!
//! - Features:
//!     - SOCKS5 CONNECT with no-auth or username/password authentication
//!     - HTTP forward proxy with CONNECT tunnelling, optionally over TLS
//!     - Outbound connections bound to a chosen local interface
//!     - DNS resolution with serial or parallel racing, caching and domain blacklisting
//!     - IP black/whitelists, scan detection and temporary bans persisted across restarts
//!     - PROXY protocol v1/v2 to recover the real client behind a forwarder
//!     - Async using tokio with cancellable listeners and sweepers
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//! - [PROXY protocol](https://www.haproxy.org/download/2.9/doc/proxy-protocol.txt)
//!
//! # Example
//! ```no_run
//! use egressproxy::{Config, ProxyManager, interface};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml")?;
//!     config.validate()?;
//!
//!     let interfaces = interface::system_resolver();
//!     let mut manager = ProxyManager::from_config(&config, interfaces.as_ref())?;
//!     manager.start_all().await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.stop_all().await;
//!     Ok(())
//! }
//! ```

pub mod capabilities;
pub mod config;
pub mod dns;
pub mod egress;
pub mod error;
pub mod health;
pub mod http;
pub mod interface;
pub mod manager;
pub mod proxy_protocol;
pub mod relay;
pub mod security;
pub mod server;
pub mod socks5;

// Re-export main types at crate root for convenience
pub use capabilities::Capabilities;
pub use config::Config;
pub use dns::DnsResolver;
pub use health::{HealthChecker, HealthState, HealthStatus};
pub use http::HttpServer;
pub use manager::{ProxyManager, WorkerStatus};
pub use security::SecurityManager;
pub use server::Services;
pub use socks5::Socks5Server;
