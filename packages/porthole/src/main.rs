use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use display_agent::DisplaySession;

mod attach;
mod config;
mod ws;

use crate::config::{FileConfig, PortholeDirs, load_config};
use crate::ws::AppState;

#[derive(Parser)]
#[command(name = "porthole")]
#[command(about = "Remote display sessions over WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.porthole)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session server in the foreground
    Serve(ServeArgs),

    /// Attach a local viewer to a running server
    Attach(AttachArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Override the configured port (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured host
    #[arg(short = 'b', long)]
    host: Option<String>,
}

#[derive(Parser)]
struct AttachArgs {
    /// WebSocket URL of the display endpoint
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "porthole=debug,display_agent=debug,relink=debug,tower_http=debug"
    } else {
        "porthole=info,display_agent=info,relink=info"
    };
    // Logs go to stderr: `attach` streams wire bytes on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => serve(cli.data_dir, args).await,
        Commands::Attach(args) => attach::attach_command(args.url).await,
    }
}

async fn serve(data_dir: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    let dirs = PortholeDirs::new(data_dir)?;
    let file_config: FileConfig = load_config(&dirs.data_dir)
        .extract()
        .context("invalid configuration")?;

    let agent_config = file_config.agent.to_agent_config(&dirs);
    let session = Arc::new(DisplaySession::new(agent_config));

    let state = AppState {
        session: Arc::clone(&session),
        connections: Arc::new(AtomicU64::new(0)),
        auth_token: file_config.server.auth_token.clone(),
    };

    let app = Router::new()
        .route("/healthz", get(ws::healthz))
        .route("/api/display", get(ws::display_handler))
        .route("/api/status", get(ws::status_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{}", listener.local_addr()?);

    // The session never respawns a dead root; surface the exit loudly so
    // an operator (or supervisor) can restart the server.
    let mut session_exit = session.subscribe_exit();
    tokio::spawn(async move {
        if session_exit.recv().await.is_ok() {
            warn!("display session exited; restart to host a new one");
        }
    });

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    session.dispose().await;
    Ok(())
}
