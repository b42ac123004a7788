use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;

use roomdrop::config::{FileConfig, RelayConfig, RoomdropConfig, load_config};
use roomdrop::relay::{self, RoomDirectory};

#[derive(Parser)]
#[command(name = "roomdrop")]
#[command(about = "Room-scoped peer discovery relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.roomdrop)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay in the foreground
    Serve(ServeArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the relay (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(cli.data_dir, args).await,
    }
}

async fn serve(data_dir: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    let default_directive = if args.debug {
        "roomdrop=debug,tower_http=debug,info"
    } else {
        "roomdrop=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let dirs = RoomdropConfig::new(data_dir)?;
    let mut fc: FileConfig = load_config(&dirs.data_dir)
        .extract()
        .context("invalid configuration")?;
    if let Some(host) = args.host {
        fc.relay.host = Some(host);
    }
    if let Some(port) = args.port {
        fc.relay.port = port;
    }
    let relay_config = RelayConfig::from_file(&fc.relay)?;

    let directory = Arc::new(RoomDirectory::new());
    let app = relay::router(directory);

    let listener = tokio::net::TcpListener::bind(relay_config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", relay_config.bind_addr))?;
    info!(
        "relay listening on ws://{}/rooms/{{room}}",
        listener.local_addr()?
    );

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("server error")
}
