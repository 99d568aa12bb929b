//! vsock-relay: line-delimited request relay between a host and its guest
//!
//! The host side listens on a vsock port and answers each request line with
//! a response line. The guest side dials the host and sends requests read
//! from stdin.
//!
//! Features:
//! - Fixed worker pool with a bounded admission queue
//! - Per-request read/write deadlines that slide across a long-lived session
//! - Timeout-bounded connect that closes connections arriving too late
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod address;
mod client;
mod codec;
mod config;
mod connection;
mod dialer;
mod error;
mod handler;
mod pool;
mod server;
mod transport;

use config::{ClientConfig, Command, Config, ServerConfig};
use handler::EchoService;
use server::Server;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transport::{Connector, Listener, TcpConnector, TransportType};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    for warning in &config.warnings {
        warn!("{warning}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.command {
        Command::Serve { .. } => runtime.block_on(serve(config.server)),
        Command::Connect { .. } => runtime.block_on(connect(config.client)),
        Command::Cid => print_local_cid(),
    }
}

/// Run the host side until a termination signal arrives.
async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let local_cid = local_cid().ok();
    if let Some(cid) = local_cid {
        info!(cid, parent_instance = cid == address::CID_PARENT, "Local context id");
    }

    info!(
        transport = ?config.transport,
        listen = %config.listen,
        workers = config.workers,
        read_timeout = ?config.read_timeout,
        write_timeout = ?config.write_timeout,
        "Starting vsock-relay server"
    );

    let server = Server::new(config.clone(), Arc::new(EchoService::new(local_cid)));
    match config.transport {
        TransportType::Tcp => {
            let listener = transport::bind_tcp(config.listen).await?;
            run_until_signal(&server, listener).await
        }
        TransportType::Vsock => serve_vsock(&server, &config).await,
    }
}

#[cfg(target_os = "linux")]
async fn serve_vsock(
    server: &Server<EchoService>,
    config: &ServerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = transport::bind_vsock(config.listen)?;
    run_until_signal(server, listener).await
}

#[cfg(not(target_os = "linux"))]
async fn serve_vsock(
    _server: &Server<EchoService>,
    _config: &ServerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    Err(unsupported().into())
}

async fn run_until_signal<L: Listener>(
    server: &Server<EchoService>,
    listener: L,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => info!("Received termination signal, shutting down"),
            Err(e) => warn!(error = %e, "Signal handler failed, shutting down"),
        }
        trigger.cancel();
    });

    server.run(listener, shutdown).await;
    info!("Server stopped");
    Ok(())
}

/// Run the guest side: dial the host and relay stdin lines.
async fn connect(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        transport = ?config.transport,
        target_addr = %config.target,
        connect_timeout = ?config.connect_timeout,
        "Starting vsock-relay client"
    );

    match config.transport {
        TransportType::Tcp => run_client(&TcpConnector, &config).await,
        TransportType::Vsock => connect_vsock(&config).await,
    }
}

#[cfg(target_os = "linux")]
async fn connect_vsock(config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    run_client(&transport::VsockConnector, config).await
}

#[cfg(not(target_os = "linux"))]
async fn connect_vsock(_config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    Err(unsupported().into())
}

async fn run_client<C: Connector>(
    connector: &C,
    config: &ClientConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = client::connect(connector, config).await?;

    let stdin = client::spawn_line_reader(std::io::BufReader::new(std::io::stdin()))?;
    let stdout = tokio::io::stdout();
    let result = tokio::select! {
        result = client::run_interactive(&mut session, stdin, stdout) => result.map(Some),
        signal = shutdown_signal() => {
            if let Err(e) = signal {
                warn!(error = %e, "Signal handler failed");
            }
            info!("Received termination signal, closing client");
            Ok(None)
        }
    };
    session.close().await;

    if let Some(exchanges) = result? {
        info!(exchanges, "Client finished");
    }
    Ok(())
}

fn print_local_cid() -> Result<(), Box<dyn std::error::Error>> {
    let cid = local_cid()?;
    println!("Local VSOCK context id (CID): {cid}");
    match cid {
        address::CID_HOST => println!("This is a hypervisor host (CID=2)"),
        address::CID_PARENT => println!("This is a Nitro parent instance (CID=3)"),
        _ => {}
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn local_cid() -> std::io::Result<u32> {
    transport::local_cid()
}

#[cfg(not(target_os = "linux"))]
fn local_cid() -> std::io::Result<u32> {
    Err(unsupported())
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "vsock is only supported on Linux; use --transport tcp",
    )
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
