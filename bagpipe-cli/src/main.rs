// bagpipe: command line control of a bag storage daemon.

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bagpipe", version, about = "Control a bag storage daemon")]
struct Cli {
    /// Config file (default: ~/.config/bagpipe/config.toml, then /etc/bagpipe/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Daemon control address, overrides the config.
    #[arg(long, global = true)]
    addr: Option<String>,
    /// Machine-readable output.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List bags.
    List,
    /// Keep the bag list and total speed on screen until interrupted.
    Watch,
    /// Details of one bag.
    Info { id: String },
    /// Files of a bag as a tree.
    Files {
        id: String,
        /// Flat list with per-file progress.
        #[arg(long)]
        plain: bool,
    },
    Peers { id: String },
    /// Add a bag by id; only its header is downloaded until files are selected.
    Add {
        id: String,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Add a bag from an exported meta file.
    AddMeta {
        file: PathBuf,
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Create a bag from a local file or directory.
    Create {
        path: PathBuf,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        no_upload: bool,
        /// Copy the data into the daemon's storage.
        #[arg(long)]
        copy: bool,
    },
    Remove {
        id: String,
        #[arg(long)]
        with_files: bool,
        /// Remove only if no file was ever selected for download.
        #[arg(long)]
        only_uninitialized: bool,
    },
    /// Resume download and upload.
    Start { id: String },
    /// Pause download and upload.
    Stop { id: String },
    /// Set the priority of files (0 = skip).
    Priority {
        id: String,
        priority: i32,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Show or set speed limits in KB/s; negative means unlimited.
    Limits {
        #[arg(long, allow_hyphen_values = true)]
        download: Option<i64>,
        #[arg(long, allow_hyphen_values = true)]
        upload: Option<i64>,
    },
    /// Save a bag's meta so it can be added elsewhere.
    ExportMeta { id: String, file: PathBuf },
    /// Price storing a bag with a provider offer.
    Quote {
        id: String,
        /// Offered price per MB per day, in coins.
        #[arg(long)]
        rate: String,
        /// Seconds between storage proofs.
        #[arg(long, default_value_t = 86_400)]
        span: u32,
        #[arg(long, default_value = "0")]
        min_bounty: String,
        /// Providers taking the bag at this offer.
        #[arg(long, default_value_t = 1)]
        providers: usize,
        /// Contract top-up, in coins.
        #[arg(long)]
        balance: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(addr) = cli.addr {
        cfg.daemon_addr = addr;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(commands::run(cli.command, cfg, cli.json))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
pub async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
