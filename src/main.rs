use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use foldersync::config::{Config, ConfigOverrides};
use foldersync::daemon::{self, DaemonOptions};
use foldersync::engine::MAX_DOC_ERRORS;
use foldersync::store::{ChangesOptions, Store};

#[derive(Parser, Debug)]
#[command(name = "foldersync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Owner identity override (takes precedence over env/config)
    #[arg(long = "owner")]
    owner: Option<String>,

    /// Sync root override (takes precedence over env/config)
    #[arg(long = "sync-root")]
    sync_root: Option<PathBuf>,

    /// Remote base URL override (takes precedence over env/config)
    #[arg(long = "remote-url")]
    remote_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync engine until interrupted
    Sync,

    /// Print the resolved config file path
    ConfigPath,

    /// Print the local sequence cursor and pending/poisoned document counts
    Status,

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Version => {
            println!("foldersync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::ConfigPath => {
            let path = Config::resolve_config_path(cli.config.as_deref());
            println!("{}", path.display());
            Ok(())
        }
        Commands::Status => print_status(cli.config, cli.owner, cli.sync_root, cli.remote_url),
        Commands::Sync => run_sync(cli.config, cli.owner, cli.sync_root, cli.remote_url),
    }
}

fn print_status(
    config_path: Option<PathBuf>,
    owner: Option<String>,
    sync_root: Option<PathBuf>,
    remote_url: Option<String>,
) -> Result<()> {
    let path = Config::resolve_config_path(config_path.as_deref());
    let overrides = ConfigOverrides { sync_root, owner, remote_url, platform: None };
    let cfg = Config::load_with_overrides(&path, overrides)?;

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(async move {
        let store = Store::open(&daemon::store_db_path(&cfg))?;
        let seq = store.get_local_seq().await?;

        let all = store
            .changes(0, ChangesOptions { limit: None, include_docs: true, by_path: true })
            .await?;
        let mut pending = 0u32;
        let mut poisoned = 0u32;
        for entry in &all {
            let Some(doc) = &entry.doc else { continue };
            if doc.errors >= MAX_DOC_ERRORS {
                poisoned += 1;
            } else if doc.sides.local != doc.sides.remote {
                pending += 1;
            }
        }

        println!("local_seq={seq}");
        println!("pending={pending}");
        println!("poisoned={poisoned}");
        Ok(())
    })
}

fn run_sync(
    config_path: Option<PathBuf>,
    owner: Option<String>,
    sync_root: Option<PathBuf>,
    remote_url: Option<String>,
) -> Result<()> {
    let path = Config::resolve_config_path(config_path.as_deref());
    let overrides = ConfigOverrides { sync_root, owner, remote_url, platform: None };
    let cfg = Config::load_with_overrides(&path, overrides)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let shutdown = std::sync::Arc::new(tokio::sync::Notify::new());
        let shutdown_signal = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown_signal.notify_waiters();
        });

        match daemon::run_daemon_with_shutdown(cfg, DaemonOptions::default(), shutdown).await {
            Ok(()) => Ok(()),
            Err(e) => {
                foldersync::logging::error(format!("fatal: {e:#}"));
                Err(e)
            }
        }
    })
}
