//! Portlink CLI: a TCP reverse proxy daemon with pluggable load
//! balancing and opportunistic TLS.
//!
//! Links are stored as JSON (by default `~/.portlink/links.json`); `run`
//! brings every stored link up and logs periodic status snapshots, while
//! `add`/`remove`/`list` manage the stored configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portlink_config::{BackendConfig, BalanceMode, LinkConfig, ProtocolFamily, TlsMode};
use portlink_registry::{JsonFileStore, LinkRegistry, LinkStore};

/// Portlink - proxy TCP connections to load-balanced backend pools
#[derive(Parser, Debug)]
#[command(name = "portlink")]
#[command(about = "TCP reverse proxy with load balancing and opportunistic TLS")]
#[command(version)]
struct Cli {
    /// Link configuration file (default: ~/.portlink/links.json)
    #[arg(long, global = true, env = "PORTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every stored link and run until interrupted
    Run {
        /// Seconds between status snapshots
        #[arg(long, default_value = "2")]
        status_interval: u64,
    },

    /// Add a link to the stored configuration
    Add {
        /// Address to listen on
        #[arg(long)]
        bind_address: String,

        /// Port to listen on
        #[arg(long)]
        bind_port: u16,

        /// Listener address family (tcp, tcp4, tcp6)
        #[arg(long, default_value = "tcp")]
        protocol: ProtocolFamily,

        /// Client-facing TLS termination (NULL, TLS1.2, TLS1.3)
        #[arg(long, default_value = "NULL")]
        tls: TlsMode,

        /// Load balance mode (Random, RoundRobin, WeightRoundRobin,
        /// AddressHash, MainStandby)
        #[arg(long, default_value = "RoundRobin")]
        mode: BalanceMode,

        /// Backend spec, repeatable:
        /// host:port[,weight=N][,standby][,tls=MODE][,timeout=SECS]
        #[arg(long = "backend", required = true)]
        backends: Vec<String>,
    },

    /// Remove stored links by bind (address:port)
    Remove {
        #[arg(long = "bind", required = true)]
        binds: Vec<String>,
    },

    /// List stored links
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let store = open_store(cli.config.clone())?;
    match cli.command {
        Commands::Run { status_interval } => run(store, status_interval).await,
        Commands::Add {
            bind_address,
            bind_port,
            protocol,
            tls,
            mode,
            backends,
        } => {
            let backends = backends
                .iter()
                .map(|spec| parse_backend(spec))
                .collect::<Result<Vec<_>>>()?;
            let config = LinkConfig {
                bind_address,
                bind_port,
                protocol,
                tls,
                mode,
                backends,
            };
            add(store, config)
        }
        Commands::Remove { binds } => remove(store, &binds),
        Commands::List => list(store),
    }
}

async fn run(store: Arc<JsonFileStore>, status_interval: u64) -> Result<()> {
    let registry = Arc::new(LinkRegistry::new(store));
    registry.load_from_store().await;

    let count = registry.snapshot().await.len();
    if count == 0 {
        warn!("no links configured; add one with `portlink add`");
    }
    info!(links = count, "portlink running");

    registry.start_monitor(Duration::from_secs(status_interval.max(1)));

    let mut snapshots = registry.subscribe();
    let status_task = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            for link in snapshots.borrow_and_update().iter() {
                info!(
                    index = link.index,
                    bind = %link.bind,
                    mode = %link.mode,
                    channels = link.channels,
                    throughput = link.throughput,
                    status = %link.state,
                );
            }
        }
    });

    wait_for_shutdown().await?;

    info!("shutting down");
    registry.shutdown().await;
    status_task.abort();
    Ok(())
}

fn add(store: Arc<JsonFileStore>, config: LinkConfig) -> Result<()> {
    config.validate()?;

    let mut links = store.load().context("failed to load stored links")?;
    let bind = config.bind();
    if links.iter().any(|link| link.bind() == bind) {
        bail!("a link bound to {bind} already exists");
    }

    links.push(config);
    store.save(&links).context("failed to save links")?;
    println!("added {bind}");
    Ok(())
}

fn remove(store: Arc<JsonFileStore>, binds: &[String]) -> Result<()> {
    let mut links = store.load().context("failed to load stored links")?;
    let before = links.len();
    links.retain(|link| !binds.contains(&link.bind()));
    store.save(&links).context("failed to save links")?;
    println!("removed {} link(s)", before - links.len());
    Ok(())
}

fn list(store: Arc<JsonFileStore>) -> Result<()> {
    let links = store.load().context("failed to load stored links")?;
    if links.is_empty() {
        println!("no links configured");
        return Ok(());
    }
    for (index, link) in links.iter().enumerate() {
        let backends: Vec<&str> = link
            .backends
            .iter()
            .map(|backend| backend.address.as_str())
            .collect();
        println!(
            "{index}: {} [{}] {} -> {}",
            link.bind(),
            link.mode,
            match link.tls {
                TlsMode::Null => "plain",
                _ => "tls",
            },
            backends.join(" "),
        );
    }
    Ok(())
}

fn open_store(path: Option<PathBuf>) -> Result<Arc<JsonFileStore>> {
    let store = match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            JsonFileStore::with_path(path)
        }
        None => JsonFileStore::new().context("failed to open the default configuration store")?,
    };
    Ok(Arc::new(store))
}

/// Parse one `--backend` spec:
/// `host:port[,weight=N][,standby][,tls=MODE][,timeout=SECS]`.
fn parse_backend(spec: &str) -> Result<BackendConfig> {
    let mut parts = spec.split(',');
    let address = parts
        .next()
        .filter(|address| !address.is_empty())
        .context("backend spec is empty")?
        .to_string();

    let mut backend = BackendConfig {
        address,
        protocol: ProtocolFamily::Tcp,
        tls: TlsMode::Null,
        dial_timeout_secs: 0,
        weight: 1,
        standby: false,
    };

    for part in parts {
        match part.split_once('=') {
            Some(("weight", value)) => {
                backend.weight = value.parse().context("invalid backend weight")?;
            }
            Some(("timeout", value)) => {
                backend.dial_timeout_secs = value.parse().context("invalid backend timeout")?;
            }
            Some(("tls", value)) => {
                backend.tls = value.parse().map_err(anyhow::Error::msg)?;
            }
            Some(("protocol", value)) => {
                backend.protocol = value.parse().map_err(anyhow::Error::msg)?;
            }
            None if part == "standby" => backend.standby = true,
            _ => bail!("unknown backend option {part:?} in {spec:?}"),
        }
    }
    Ok(backend)
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_minimal() {
        let backend = parse_backend("10.0.0.1:80").unwrap();
        assert_eq!(backend.address, "10.0.0.1:80");
        assert_eq!(backend.weight, 1);
        assert!(!backend.standby);
        assert_eq!(backend.tls, TlsMode::Null);
    }

    #[test]
    fn test_parse_backend_full() {
        let backend =
            parse_backend("10.0.0.1:443,weight=3,standby,tls=TLS1.2,timeout=5").unwrap();
        assert_eq!(backend.weight, 3);
        assert!(backend.standby);
        assert_eq!(backend.tls, TlsMode::Tls12);
        assert_eq!(backend.dial_timeout_secs, 5);
    }

    #[test]
    fn test_parse_backend_rejects_unknown_option() {
        assert!(parse_backend("10.0.0.1:80,bogus=1").is_err());
        assert!(parse_backend("").is_err());
    }

    #[test]
    fn test_cli_parses() {
        Cli::try_parse_from([
            "portlink",
            "add",
            "--bind-address",
            "0.0.0.0",
            "--bind-port",
            "8443",
            "--tls",
            "TLS1.3",
            "--mode",
            "WeightRoundRobin",
            "--backend",
            "10.0.0.1:443,weight=2",
            "--backend",
            "10.0.0.2:443",
        ])
        .unwrap();
    }
}
