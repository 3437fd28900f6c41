//! dohguard CLI
//!
//! Runs the DNS-over-HTTPS tunnel and a few tools for checking resolvers.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use doh_dns::{DohResolver, DohTransport, IpMap, PRESETS};
use doh_tun::{TunDevice, TunTransport};
use dohguard_engine::{
    forward_query, ping, Config, DnsTunnel, LoggingListener, QueryStatus, TunnelOptions,
};

/// dohguard - send the system's DNS through DNS-over-HTTPS
#[derive(Parser)]
#[command(name = "dohguard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (built-in defaults when omitted)
    #[arg(short, long, env = "DOHGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel until interrupted
    Run {
        /// Adopt an already open TUN file descriptor instead of creating a device
        #[arg(long)]
        fd: Option<i32>,
    },

    /// Resolve one name through the configured resolver
    Query {
        /// Domain name to look up
        name: String,

        /// Record type
        #[arg(short = 't', long = "type", default_value = "A")]
        record_type: String,

        /// Resolver URL or preset name, instead of the configured one
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Measure TCP handshake time to resolver hosts (JSON output)
    Ping {
        /// `host:port` targets; defaults to the configured resolver and presets
        hosts: Vec<String>,

        /// Per-host timeout in milliseconds
        #[arg(long, default_value_t = 3000)]
        timeout_ms: u64,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "dohguard.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::GenConfig { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"));
        return generate_config(output);
    }

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.tunnel.log_level));

    match cli.command {
        Commands::Run { fd } => run(config, fd).await,
        Commands::Query {
            name,
            record_type,
            url,
        } => query(config, &name, &record_type, url.as_deref()).await,
        Commands::Ping { hosts, timeout_ms } => {
            ping_hosts(&config, hosts, Duration::from_millis(timeout_ms)).await
        }
        Commands::GenConfig { .. } => Ok(()),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => {
            let config = Config::default();
            config.validate().context("Invalid default configuration")?;
            Ok(config)
        }
    }
}

fn build_transport(config: &Config, url: Option<&str>) -> Result<DohTransport> {
    let mut options = config
        .transport_options()
        .context("Invalid resolver settings")?;

    let url = match url {
        Some(url) => {
            let spec = doh_dns::parse_resolver(url)?;
            if !spec.bootstrap.is_empty() {
                options = options.with_bootstrap(spec.bootstrap);
            }
            spec.url
        }
        None => config.doh.resolver()?.url,
    };

    DohTransport::new(&url, options).with_context(|| format!("Invalid resolver URL {}", url))
}

async fn open_tun(config: &Config, fd: Option<i32>) -> Result<TunDevice> {
    match fd {
        #[cfg(unix)]
        Some(fd) => {
            // SAFETY: the fd is handed over by the caller, which gives up ownership
            let tunnel = &config.tunnel;
            let device = unsafe { TunDevice::from_fd(fd, &tunnel.tun_name, tunnel.mtu) }
                .with_context(|| format!("Failed to adopt TUN fd {}", fd))?;
            Ok(device)
        }
        #[cfg(not(unix))]
        Some(_) => bail!("--fd is only supported on Unix"),
        None => {
            let tun_config = config.tunnel.tun_config()?;
            TunDevice::create(tun_config)
                .await
                .context("Failed to create TUN device (root or CAP_NET_ADMIN required)")
        }
    }
}

async fn run(config: Config, fd: Option<i32>) -> Result<()> {
    info!("Starting dohguard...");

    let transport = build_transport(&config, None)?;
    let tun = open_tun(&config, fd).await?;
    info!(
        "Point the system resolver at {} (device {})",
        config.tunnel.fake_dns,
        tun.name()
    );

    let tunnel = DnsTunnel::new(
        TunnelOptions::from(&config),
        Arc::new(tun),
        Arc::new(transport),
        Arc::new(LoggingListener),
        Arc::new(IpMap::new()),
    );
    tunnel.start().context("Failed to start tunnel")?;

    let waited = wait_for_shutdown().await;

    info!("Shutting down...");
    tunnel.close().await.context("Failed to close tunnel")?;

    let stats = tunnel.stats();
    info!(
        "Answered {} of {} queries ({} failed, {} shed, {} packets dropped)",
        stats.answered, stats.queries, stats.failed, stats.shed, stats.packets_dropped
    );

    waited
}

async fn query(config: Config, name: &str, record_type: &str, url: Option<&str>) -> Result<()> {
    let name = Name::from_ascii(name).with_context(|| format!("Invalid name {}", name))?;
    let record_type = RecordType::from_str(&record_type.to_ascii_uppercase())
        .with_context(|| format!("Unknown record type {}", record_type))?;

    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    let raw = message.to_vec().context("Failed to encode query")?;

    let transport = build_transport(&config, url)?;
    let ip_map = Arc::new(IpMap::new());
    let summary = forward_query(&transport, &ip_map, config.doh.block_size(), &raw).await;

    if summary.status != QueryStatus::Complete {
        bail!(
            "query failed: {} (HTTP {}) via {}",
            summary.status,
            summary.http_status,
            transport.url()
        );
    }

    let response = Message::from_vec(&summary.response).context("Malformed response")?;
    println!(
        ";; {} from {} in {:.1} ms (query {} bytes, response {} bytes)",
        response.response_code(),
        summary.server,
        summary.latency_ms,
        summary.query.len(),
        summary.response.len()
    );
    for record in response.answers() {
        println!("{}", record);
    }
    if response.answers().is_empty() {
        println!(";; no answer records");
    }

    Ok(())
}

async fn ping_hosts(config: &Config, hosts: Vec<String>, timeout: Duration) -> Result<()> {
    let hosts = if hosts.is_empty() {
        let mut hosts = vec![config.doh.resolver()?.host_port()?];
        for preset in PRESETS {
            let spec = doh_dns::parse_resolver(preset.name)?;
            let host = spec.host_port()?;
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    } else {
        hosts
    };

    let results = ping::ping_all(hosts.as_slice(), timeout).await;
    println!("{}", ping::to_json(&results));
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nPoint your system resolver at the fake_dns address once the tunnel runs.");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
