use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{Config, ConfigOverrides};
use crate::engine::Engine;
use crate::http::ApiClient;
use crate::local_side::LocalSide;
use crate::remote_side::RemoteSide;
use crate::store::Store;
use crate::watch::local::LocalWatcher;
use crate::watch::remote::RemoteWatcher;

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub log_path: Option<PathBuf>,
}

pub struct ThreadedDaemonHandle {
    shutdown: std::sync::mpsc::Sender<()>,
    join: Option<std::thread::JoinHandle<Result<()>>>,
}

impl ThreadedDaemonHandle {
    pub fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            match join.join() {
                Ok(res) => res,
                Err(_) => anyhow::bail!("foldersync daemon thread panicked"),
            }
        } else {
            Ok(())
        }
    }
}

/// Runs the engine and both ambient watchers on the *current* tokio
/// runtime until `shutdown` is notified.
pub async fn run_daemon_with_shutdown(cfg: Config, opts: DaemonOptions, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
    let log_path = opts.log_path.unwrap_or_else(|| daemon_log_path(&cfg));
    crate::logging::init_log_file(&log_path)?;
    crate::logging::info(format!(
        "daemon start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
        log_path.display()
    ));

    cfg.save()?;

    std::fs::create_dir_all(&cfg.sync_root).with_context(|| format!("create sync root {}", cfg.sync_root.display()))?;
    let store_path = store_db_path(&cfg);
    let store = Arc::new(Store::open(&store_path)?);

    let api = Arc::new(ApiClient::new(&cfg.remote_url, &cfg.owner)?);
    let local = Arc::new(LocalSide::new(&cfg.sync_root, api.clone()));
    let remote = Arc::new(RemoteSide::new(ApiClient::new(&cfg.remote_url, &cfg.owner)?, &cfg.sync_root));

    let heartbeat = Duration::from_millis(cfg.heartbeat_ms);
    let engine = Arc::new(Engine::new(store.clone(), local, remote, api.clone(), heartbeat));

    let local_watcher = Arc::new(LocalWatcher::new(&cfg.sync_root, store.clone(), cfg.platform)?);
    let remote_watcher = Arc::new(RemoteWatcher::new(api, store.clone(), heartbeat));
    let watchers_stopped = Arc::new(AtomicBool::new(false));

    let local_watcher_task = {
        let local_watcher = local_watcher.clone();
        let stopped = watchers_stopped.clone();
        tokio::spawn(async move { local_watcher.run(stopped).await })
    };
    let remote_watcher_task = {
        let remote_watcher = remote_watcher.clone();
        let stopped = watchers_stopped.clone();
        tokio::spawn(async move { remote_watcher.run(stopped).await })
    };

    let engine_task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    shutdown.notified().await;
    engine.stop();
    watchers_stopped.store(true, Ordering::SeqCst);

    let _ = engine_task.await;
    let _ = local_watcher_task.await;
    let _ = remote_watcher_task.await;
    Ok(())
}

/// Runs a daemon in a dedicated background thread with its own tokio
/// runtime, for embedding in other applications.
pub fn start_threaded(cfg: Config, opts: DaemonOptions) -> Result<ThreadedDaemonHandle> {
    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
    let join = thread::Builder::new()
        .name("foldersync-daemon".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(2)
                .build()
                .context("build tokio runtime")?;

            rt.block_on(async move {
                let shutdown = Arc::new(tokio::sync::Notify::new());
                let shutdown_task = shutdown.clone();
                tokio::task::spawn_blocking(move || {
                    let _ = shutdown_rx.recv();
                    shutdown_task.notify_waiters();
                });

                run_daemon_with_shutdown(cfg, opts, shutdown).await
            })
        })
        .context("spawn foldersync daemon thread")?;

    Ok(ThreadedDaemonHandle { shutdown: shutdown_tx, join: Some(join) })
}

pub fn start_threaded_from_config_path(
    config_path: &std::path::Path,
    overrides: ConfigOverrides,
    opts: DaemonOptions,
) -> Result<ThreadedDaemonHandle> {
    let cfg = Config::load_with_overrides(config_path, overrides)?;
    start_threaded(cfg, opts)
}

fn daemon_log_path(cfg: &Config) -> PathBuf {
    if let Some(p) = cfg.config_path.as_ref().and_then(|p| p.parent()) {
        return p.join("logs").join("foldersync.log");
    }
    crate::config::default_log_file_path()
}

pub fn store_db_path(cfg: &Config) -> PathBuf {
    if let Some(p) = cfg.config_path.as_ref().and_then(|p| p.parent()) {
        return p.join("store.sqlite3");
    }
    cfg.sync_root.join(".foldersync").join("store.sqlite3")
}
