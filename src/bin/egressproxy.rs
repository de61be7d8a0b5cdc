use anyhow::{Context, Result};
use clap::Parser;
use egressproxy::{Config, ProxyManager, WorkerStatus, interface};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "SOCKS5 and HTTP proxies with pinned egress interfaces", long_about = None)]
struct Args {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber; RUST_LOG wins over -v
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load and validate config
    let config = Config::load(&args.config)
        .with_context(|| format!("[ERR] loading {}", args.config.display()))?;
    config.validate()?;

    let interfaces = interface::system_resolver();
    if args.check {
        let socks5 = config.socks5_listeners(interfaces.as_ref())?;
        let http = config.http_listeners(interfaces.as_ref())?;
        info!(
            config = %args.config.display(),
            socks5 = socks5.len(),
            http = http.len(),
            "configuration is valid"
        );
        return Ok(());
    }

    let mut manager = ProxyManager::from_config(&config, interfaces.as_ref())?;

    // Run it
    let running = manager.start_all().await;
    for (name, status) in manager.statuses() {
        if let WorkerStatus::Error(msg) = status {
            warn!(proxy = %name, "listener not started: {msg}");
        }
    }
    if running == 0 {
        warn!("no listener is running");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    manager.stop_all().await;
    Ok(())
}
