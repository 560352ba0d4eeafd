//! cellgridd — the CellGrid daemon.
//!
//! # Usage
//!
//! ```text
//! cellgridd run --config /etc/cellgrid/cellgrid.toml
//! cellgridd standalone --port 8889 --data-dir /var/lib/cellgrid
//! cellgridd print-config --config cellgrid.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cellgrid_core::{GridConfig, StoreConfig};
use cellgridd::Grid;

const DEFAULT_LOG_FILTER: &str = "info,cellgridd=debug,cellgrid=debug";

#[derive(Parser)]
#[command(name = "cellgridd", about = "CellGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run from a cellgrid.toml.
    Run {
        #[arg(long, short, default_value = "cellgrid.toml")]
        config: PathBuf,

        /// Override `[api] listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Keep the store and cell work directories under this directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run a single cell with default settings.
    Standalone {
        /// Port to listen on.
        #[arg(long, default_value = "8889")]
        port: u16,

        /// Data directory for persistent state. In-memory if omitted.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    PrintConfig {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run {
            config,
            listen,
            data_dir,
        } => {
            let mut config = GridConfig::from_file(&config)?;
            if let Some(listen) = listen {
                config.api.listen = listen;
            }
            if let Some(dir) = data_dir {
                apply_data_dir(&mut config, &dir);
            }
            serve(config).await
        }
        Command::Standalone { port, data_dir } => {
            let mut config = GridConfig::standalone();
            config.api.listen = SocketAddr::from(([0, 0, 0, 0], port));
            if let Some(dir) = data_dir {
                apply_data_dir(&mut config, &dir);
            }
            serve(config).await
        }
        Command::PrintConfig { config } => {
            let config = match config {
                Some(path) => GridConfig::from_file(&path)?,
                None => GridConfig::standalone(),
            };
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn apply_data_dir(config: &mut GridConfig, dir: &Path) {
    config.store = StoreConfig {
        path: Some(dir.join("cellgrid.redb")),
    };
    for cell in &mut config.cells {
        cell.work_dir = dir.join("cells");
    }
}

async fn serve(config: GridConfig) -> anyhow::Result<()> {
    info!(cells = config.cells.len(), "CellGrid daemon starting");
    let listen = config.api.listen;

    let grid = Grid::new(config).await?;
    let router = grid.router();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let grid_handle = tokio::spawn(grid.run(shutdown_rx));

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "API server starting");

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to install Ctrl-C handler");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    grid_handle.await?;
    info!("CellGrid daemon stopped");
    Ok(())
}
