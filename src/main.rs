//! socksd - SOCKS5 Proxy Server
//!
//! This is the main entry point for the socksd application.

use anyhow::{Context, Result};
use clap::Parser;
use socksd::config::load_or_init;
use socksd::resolver::Resolver;
use socksd::server::{ServerConfig, SocksServer};
use socksd::udp::{UdpAssociation, DEFAULT_IDLE_TIMEOUT};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// socksd - SOCKS5 proxy server
#[derive(Parser, Debug)]
#[command(name = "socksd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration (writing the default file back if absent)
    let config = load_or_init(&args.config)?;

    // Setup logging; the CLI flag wins over the config file
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(level)?;

    info!("socksd v{}", socksd::VERSION);
    info!("Configuration loaded from: {:?}", args.config);

    // Setup shutdown signal
    let (shutdown_tx, _) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals (cross-platform)
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On Windows, only handle Ctrl+C
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx_clone.send(true);
    });

    let socks = &config.socks_server;
    if !socks.enable {
        warn!("SOCKS server disabled by configuration, nothing to do");
        return Ok(());
    }

    let resolver = Resolver::from_secs_f64(config.dns_timeout_seconds);

    // Bring up the UDP relay first so its advertised address is known to
    // the TCP server. The hostname is resolved once at startup; the port
    // is advertised as configured.
    let mut association_addr: Option<SocketAddr> = None;
    let mut udp_task = None;
    if socks.udp_association.enable {
        let assoc = &socks.udp_association;
        let advertised = resolver
            .resolve(&assoc.hostname, assoc.port)
            .await
            .with_context(|| format!("Failed to resolve association hostname {}", assoc.hostname))?;
        info!("UDP association address on {}", advertised);
        if !advertised.is_ipv4() {
            warn!(
                "association address {} is not IPv4; UDP ASSOCIATE requests will be rejected",
                advertised
            );
        }
        association_addr = Some(advertised);

        let socket = UdpSocket::bind(("0.0.0.0", assoc.port))
            .await
            .with_context(|| format!("Failed to bind UDP association port {}", assoc.port))?;
        let association = UdpAssociation::new(socket, socks.ignore_local, DEFAULT_IDLE_TIMEOUT);
        udp_task = Some(tokio::spawn(association.run(shutdown_tx.subscribe())));
    }

    let server = Arc::new(SocksServer::new(
        ServerConfig {
            auth: socks.authentication.policy(None),
            skip_local: socks.ignore_local,
            max_conn_num: socks.max_conn_num as usize,
            high_water_kb: socks.high_water_mark,
            association_addr,
        },
        resolver,
    ));

    let listener = TcpListener::bind(("0.0.0.0", socks.port))
        .await
        .with_context(|| format!("Failed to bind SOCKS port {}", socks.port))?;
    server.run(listener, shutdown_tx.subscribe()).await?;

    if let Some(task) = udp_task {
        let _ = task.await;
    }

    Ok(())
}

/// Setup logging based on configuration
fn setup_logging(level: &str) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
