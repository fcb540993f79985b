use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use localdns_core::config::Config;
use localdns_core::dns::HostTable;
use localdns_tun::device::{TunConfig, TunDevice};
use localdns_tun::{protect, RelayContext};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "localdns")]
#[command(about = "LocalDNS - tunnel relay with local DNS overrides")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log file directory (enables file logging)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay
    Run {
        /// Use an already-open tunnel descriptor instead of creating a device
        #[arg(long)]
        tun_fd: Option<RawFd>,
    },
    /// Validate the configuration and hosts files
    Validate,
    /// Generate a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log level comes from the config when it is readable; RUST_LOG wins.
    let level = Config::load(&cli.config)
        .map(|c| c.general.log_level)
        .unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!(
            "localdns={level},localdns_core={level},localdns_tun={level}"
        ))
    })?;

    let fmt_layer = tracing_subscriber::fmt::layer();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Optional file logging
    let _guard = if let Some(ref log_dir) = cli.log_dir {
        let file_appender = tracing_appender::rolling::daily(log_dir, "localdns.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };

    match cli.command {
        Commands::Run { tun_fd } => cmd_run(&cli.config, tun_fd).await,
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Init => cmd_init(&cli.config),
    }
}

async fn cmd_run(config_path: &Path, tun_fd: Option<RawFd>) -> Result<()> {
    let config = Config::load(config_path)?;
    let hosts = Arc::new(HostTable::from_entries(config.load_hosts()?));

    let device = match tun_fd {
        Some(fd) => {
            // SAFETY: the caller hands this descriptor over for our exclusive use.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            TunDevice::from_fd(fd, config.tun.name.clone())?
        }
        None => TunDevice::create(&TunConfig::from(&config.tun))?,
    };

    let protector = protect::from_config(&config.relay);
    let (ctx, device_rx) =
        RelayContext::new(config.relay.clone(), config.tun.mtu, hosts, protector);
    let handle = localdns_tun::start(device, ctx, device_rx);

    tracing::info!(
        config = %config_path.display(),
        hosts_file = %config.hosts.file.display(),
        "relay running, press Ctrl+C to stop"
    );

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;

    let failed = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C");
                break false;
            }
            _ = terminate.recv() => {
                tracing::info!("received SIGTERM");
                break false;
            }
            _ = hangup.recv() => reload_hosts(&config, handle.hosts()),
            _ = handle.stopped() => break true,
            _ = stats_tick.tick() => {
                let stats = handle.stats();
                tracing::debug!(
                    from_device = stats.packets_from_device,
                    to_device = stats.packets_to_device,
                    dropped = stats.packets_dropped,
                    udp_flows = stats.active_udp_flows,
                    tcp_flows = stats.active_tcp_flows,
                    "relay stats"
                );
            }
        }
    };

    handle.shutdown().await;
    if failed {
        anyhow::bail!("relay stopped after a worker failure");
    }
    Ok(())
}

/// Re-read the hosts file. A bad file leaves the live table as it was.
fn reload_hosts(config: &Config, hosts: &HostTable) {
    match config.load_hosts() {
        Ok(entries) => {
            let count = hosts.replace(entries);
            tracing::info!(entries = count, "hosts file reloaded");
        }
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "hosts reload failed, keeping current table");
        }
    }
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let hosts = config.load_hosts()?;
    println!("Configuration is valid.");
    println!("  TUN: {} {}/{} mtu {}",
        config.tun.name,
        config.tun.address,
        config.tun.netmask,
        config.tun.mtu
    );
    println!("  Hosts file: {} ({} entries)", config.hosts.file.display(), hosts.len());
    println!("  UDP flows: max {}, idle {}s",
        config.relay.udp_max_flows,
        config.relay.udp_idle_timeout_secs
    );
    println!("  TCP idle: {}s", config.relay.tcp_idle_timeout_secs);
    println!("  DNS TTL: {}s", config.relay.dns_ttl_secs);
    Ok(())
}

fn cmd_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("config file already exists: {}", config_path.display());
    }

    let config = Config::default_config();
    let yaml = serde_yaml::to_string(&config)?;
    std::fs::write(config_path, yaml)?;
    println!("Default config written to {}", config_path.display());
    Ok(())
}
