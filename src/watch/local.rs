//! Local filesystem watcher (SPEC_FULL.md S2 item 8/10).
//!
//! Grounded on the teacher's `LocalScanner::scan` in `sync.rs` (walk +
//! cached mtime/etag) and `filters.rs`'s `Gitignore`-backed ignore list,
//! reduced to "notice a change, upsert metadata" — the engine, not the
//! watcher, now owns diff logic. The `notify`-backed wake-up is the same
//! `RecommendedWatcher` + mpsc bridge the teacher's own hotlink baseline
//! test sets up, used here to shorten the gap between an edit and a
//! rescan instead of the bare poll interval.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use walkdir::WalkDir;

use crate::local_side::compute_md5_base64;
use crate::metadata::{equality, DocType, IdPlatform, Metadata, RemoteRef, Sides};
use crate::store::Store;

const DEFAULT_IGNORE_LINES: &[&str] = &[
    ".trash/",
    ".git/",
    ".foldersync/",
    "*.tmp",
    "*.swp",
    ".DS_Store",
    "Thumbs.db",
];

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct LocalWatcher {
    root: PathBuf,
    store: Arc<Store>,
    platform: IdPlatform,
    ignore: Gitignore,
}

impl LocalWatcher {
    pub fn new(root: impl Into<PathBuf>, store: Arc<Store>, platform: IdPlatform) -> Result<Self> {
        let root = root.into();
        let ignore = build_ignore(&root)?;
        Ok(LocalWatcher { root, store, platform, ignore })
    }

    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.ignore.matched(path, is_dir).is_ignore()
    }

    fn relative_path(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        if rel.as_os_str().is_empty() {
            return None;
        }
        Some(rel.to_string_lossy().replace('\\', "/"))
    }

    /// Runs a full directory walk, upserting any entry whose derived
    /// metadata differs from the stored record, then waits for either a
    /// raw `notify` event or `POLL_INTERVAL` to elapse before rescanning.
    /// The rescan itself stays a full walk rather than an incremental
    /// per-event update — `notify` only shortens the wait, it never
    /// replaces the walk as the source of truth.
    pub async fn run(&self, stopped: Arc<AtomicBool>) -> Result<()> {
        let wake = Arc::new(tokio::sync::Notify::new());
        let _fs_watcher = spawn_fs_watcher(&self.root, wake.clone())?;

        while !stopped.load(Ordering::SeqCst) {
            self.scan_once().await?;
            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
        Ok(())
    }

    pub async fn scan_once(&self) -> Result<()> {
        for entry in WalkDir::new(&self.root).into_iter().filter_entry(|e| {
            self.relative_path(e.path())
                .map(|rel| !self.is_ignored(Path::new(&rel), e.file_type().is_dir()))
                .unwrap_or(true)
        }) {
            let entry = entry.with_context(|| format!("walk {}", self.root.display()))?;
            let Some(rel_path) = self.relative_path(entry.path()) else {
                continue;
            };
            let doc_type = if entry.file_type().is_dir() {
                DocType::Folder
            } else if entry.file_type().is_file() {
                DocType::File
            } else {
                continue;
            };
            self.upsert_for_path(&rel_path, doc_type, entry.path()).await?;
        }
        Ok(())
    }

    async fn upsert_for_path(&self, rel_path: &str, doc_type: DocType, abs_path: &Path) -> Result<()> {
        let id = self.platform.derive_id(rel_path);
        let existing = self.store.get(&id).await?;

        let md5sum = match doc_type {
            DocType::File => {
                let bytes = tokio::fs::read(abs_path)
                    .await
                    .with_context(|| format!("read {}", abs_path.display()))?;
                Some(compute_md5_base64(&bytes))
            }
            DocType::Folder => None,
        };

        let size = match doc_type {
            DocType::File => tokio::fs::metadata(abs_path).await.ok().map(|m| m.len()),
            DocType::Folder => None,
        };

        let sides = Sides {
            local: existing.as_ref().map(|e| e.sides.local + 1).unwrap_or(1),
            remote: existing.as_ref().map(|e| e.sides.remote).unwrap_or(0),
        };
        let rev = existing.as_ref().map(|e| e.rev.clone()).unwrap_or_else(|| "0".to_string());

        let candidate = Metadata {
            id: id.clone(),
            rev,
            path: rel_path.to_string(),
            doc_type,
            deleted: false,
            md5sum,
            size,
            executable: None,
            mime: None,
            class: None,
            updated_at: Some(chrono::Utc::now()),
            ino: None,
            tags: Vec::new(),
            remote: existing.as_ref().map(|e| e.remote.clone()).unwrap_or_default(),
            sides,
            errors: existing.as_ref().map(|e| e.errors).unwrap_or(0),
            move_to: None,
            move_from: None,
            child_move: false,
            trashed: false,
            incompatibilities: Vec::new(),
        };

        if let Some(existing) = &existing {
            let unchanged = match doc_type {
                DocType::Folder => equality::same_folder(&candidate, existing),
                DocType::File => equality::same_file(&candidate, existing),
            };
            if unchanged {
                return Ok(());
            }
        }

        self.store.put(candidate).await?;
        Ok(())
    }
}

/// Starts a `RecommendedWatcher` and a background thread that forwards
/// every raw event into `wake`. Returns the watcher; it must be kept alive
/// for as long as notifications are wanted (dropping it stops delivery).
fn spawn_fs_watcher(root: &Path, wake: Arc<tokio::sync::Notify>) -> Result<RecommendedWatcher> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(tx, NotifyConfig::default()).context("create filesystem watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", root.display()))?;

    std::thread::spawn(move || {
        while rx.recv().is_ok() {
            wake.notify_one();
        }
    });

    Ok(watcher)
}

fn build_ignore(root: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for line in DEFAULT_IGNORE_LINES {
        builder.add_line(None, line).context("add default ignore line")?;
    }
    let custom = root.join(".syncignore");
    if custom.exists() {
        builder.add(custom);
    }
    builder.build().context("build ignore matcher")
}
