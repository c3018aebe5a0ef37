//! natscope CLI
//!
//! Classic NAT behavior discovery client and its four-socket server.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use natscope_discovery::{ClientError, DiscoveryOptions, StunClient, StunServer};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use config::{Config, parse_host_port};
use progress::{DiscoveryProgress, format_duration, format_rtt};

/// Interval between server stats log lines
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// natscope - discover how your NAT maps and filters UDP traffic
#[derive(Parser)]
#[command(name = "natscope")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover NAT binding and filtering behavior
    Client {
        /// STUN server host name or address
        #[arg(short, long)]
        server: Option<String>,

        /// STUN server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Local IPv4 address to bind
        #[arg(short, long)]
        local: Option<Ipv4Addr>,

        /// Only classify binding behavior
        #[arg(long)]
        binding_only: bool,

        /// Do not attach timestamps for RTT measurement
        #[arg(long)]
        no_timestamps: bool,
    },

    /// Run the four-socket discovery server
    Server {
        /// Primary address (host:port)
        #[arg(long)]
        primary: Option<String>,

        /// Secondary address (host:port)
        #[arg(long)]
        secondary: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    match cli.command {
        Commands::Client {
            server,
            port,
            local,
            binding_only,
            no_timestamps,
        } => {
            if server.is_some() {
                config.client.server = server;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            if let Some(local) = local {
                config.client.local_addr = local.to_string();
            }
            if no_timestamps {
                config.client.timestamps = false;
            }
            config.validate()?;
            run_client(&config, binding_only).await?;
        }
        Commands::Server { primary, secondary } => {
            if let Some(primary) = primary {
                config.primary = parse_host_port(&primary, "Primary address")?;
            }
            if let Some(secondary) = secondary {
                config.secondary = parse_host_port(&secondary, "Secondary address")?;
            }
            config.validate()?;
            run_server(&config).await?;
        }
    }

    Ok(())
}

/// Run one discovery and print the result
async fn run_client(config: &Config, binding_only: bool) -> anyhow::Result<()> {
    let client_config = config.client_config()?;
    let Some(server) = client_config.server.clone() else {
        anyhow::bail!("No STUN server configured (use --server or set [client] server)");
    };

    tracing::info!(
        "Discovering NAT via {}:{} (binding only: {})",
        server,
        client_config.port,
        binding_only
    );

    let mut client = StunClient::with_config(client_config);
    let mut records = client.subscribe();
    let closer = client.closer();
    let progress = DiscoveryProgress::new(&server);

    let result = {
        let discovery = client.discover(DiscoveryOptions { binding_only });
        tokio::pin!(discovery);

        loop {
            tokio::select! {
                result = &mut discovery => break result,
                Some(record) = records.recv() => progress.set_message(record.message),
                _ = tokio::signal::ctrl_c() => closer.close(),
            }
        }
    };
    progress.finish();

    match result {
        Ok(_) => {}
        Err(ClientError::Closed) => {
            println!("Discovery cancelled");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(report) = client.report() {
        println!("{report}");
        println!();
        println!("NAT type: {}", report.nat_type);
        println!("Binding:  {}", report.binding);
        println!("Filter:   {}", report.filter);
        if let Some(mapped) = report.mapped {
            println!("Mapped:   {mapped}");
        }
        println!("RTT:      {}", format_rtt(report.rtt_ms));
    }

    Ok(())
}

/// Serve until Ctrl+C
async fn run_server(config: &Config) -> anyhow::Result<()> {
    let mut server = StunServer::new(config.server_config());
    server.listen().await?;

    println!("natscope server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(addrs) = server.local_addrs() {
        for (sid, addr) in addrs.iter().enumerate() {
            println!("  socket {sid}: {addr}");
        }
    }
    println!("Press Ctrl+C to stop");

    let started = Instant::now();
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tracing::debug!(
                    "Stats: {} (uptime {})",
                    server.stats(),
                    format_duration(started.elapsed())
                );
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    println!("\nShutting down...");
    server.close().await;
    println!(
        "Final stats: {} (uptime {})",
        server.stats(),
        format_duration(started.elapsed())
    );

    Ok(())
}
