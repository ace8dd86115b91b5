//! Presence Bridge Server
//!
//! WebSocket presence server and command-line client. `serve` runs the
//! server; `stats` and `watch` query a running one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use presence_bridge::client::{ActiveUsersTracker, ClientSession};
use presence_bridge::config::Settings;
use presence_bridge::presence::StatsPolicy;
use presence_bridge::server::{Action, Frame, ServerConfig, WebSocketServer};

const DEFAULT_URL: &str = "ws://127.0.0.1:9000/ws/client";

/// Presence Bridge
///
/// Pushes active connection counts to websocket clients
#[derive(Parser, Debug)]
#[command(name = "presence-bridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the presence server
    Serve(ServeArgs),
    /// Print the current active user count
    Stats {
        /// Endpoint to query
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
        /// Seconds to wait for the answer
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
    /// Follow the active user count
    Watch {
        /// Endpoint to follow
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
        /// Seconds between refresh requests
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Where server_stats responses go
    #[arg(long, value_enum)]
    policy: Option<StatsPolicy>,

    /// Announce the count on every connect and disconnect
    #[arg(long)]
    push_on_change: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Stats { url, timeout_secs } => stats(&url, Duration::from_secs(timeout_secs)).await,
        Command::Watch { url, interval_secs } => {
            watch(&url, Duration::from_secs(interval_secs.max(1))).await
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    info!("Presence Bridge v{}", env!("CARGO_PKG_VERSION"));

    let settings = match &args.config {
        Some(path) => {
            info!("Loading settings from {}", path.display());
            Settings::load(path)?
        }
        None => Settings::default(),
    };

    // Command-line flags win over the settings file
    let mut server_settings = settings.server;
    if let Some(port) = args.port {
        server_settings.port = port;
    }
    if let Some(bind) = args.bind {
        server_settings.bind = bind;
    }
    if let Some(policy) = args.policy {
        server_settings.policy = policy;
    }
    server_settings.push_on_change |= args.push_on_change;

    let config = ServerConfig::from_settings(&server_settings);
    info!(
        "Stats policy: {:?}, push on change: {}",
        config.policy, config.push_on_change
    );

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn stats(url: &str, wait: Duration) -> anyhow::Result<()> {
    let session = ClientSession::connect(url).await?;
    let stats = session.request_stats(wait).await?;
    println!("{}", stats.active_users);
    session.close();
    Ok(())
}

async fn watch(url: &str, interval: Duration) -> anyhow::Result<()> {
    let session = ClientSession::connect(url).await?;
    let tracker = ActiveUsersTracker::spawn(&session);
    let mut users = tracker.subscribe();
    let mut ticker = tokio::time::interval(interval);
    let request = Frame::request(Action::ServerStats);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => session.send_frame(&request),
            changed = users.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(count) = *users.borrow_and_update() {
                    info!("Active users: {}", count);
                }
            }
            _ = session.closed() => {
                warn!("Server closed the connection");
                break;
            }
            _ = &mut shutdown => {
                session.close();
                break;
            }
        }
    }

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
