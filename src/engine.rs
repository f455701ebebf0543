//! Reconciliation loop, error handler, and trash-with-parent coalescer
//! (spec.md S4.3, S4.5, S4.7).
//!
//! Grounded on the teacher's `daemon.rs` control flow (bind-with-retry loop,
//! `Arc<Notify>` shutdown) for the loop-with-explicit-stop-signal shape, and
//! its `control.rs` `sync_now: Notify` for "wake the loop on demand".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{broadcast, Notify};
use tokio::time::sleep;

use crate::classifier::{self, Decision, SideName};
use crate::errors::{self, FatalError, SyncError};
use crate::http::RemoteProbe;
use crate::metadata::{self, extract_rev, Metadata};
use crate::side::Side;
use crate::store::{ChangeEntry, ChangesOptions, Store};

const TRASHING_DELAY: Duration = Duration::from_millis(1000);
const NO_PROGRESS_HARD_BREAK: u32 = 1000;
pub const MAX_DOC_ERRORS: u32 = 3;
const DEFAULT_OFFLINE_PROBE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum EngineEvent {
    SyncStart,
    SyncEnd,
    SyncCurrent(i64),
    Offline,
    Online,
}

pub struct Engine {
    store: Arc<Store>,
    local: Arc<dyn Side>,
    remote: Arc<dyn Side>,
    probe: Arc<dyn RemoteProbe>,
    heartbeat: Duration,
    offline_probe_interval: Duration,
    stopped: Arc<AtomicBool>,
    wake: Arc<Notify>,
    events: broadcast::Sender<EngineEvent>,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        local: Arc<dyn Side>,
        remote: Arc<dyn Side>,
        probe: Arc<dyn RemoteProbe>,
        heartbeat: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Engine {
            store,
            local,
            remote,
            probe,
            heartbeat,
            offline_probe_interval: DEFAULT_OFFLINE_PROBE_INTERVAL,
            stopped: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            events,
        }
    }

    /// Overrides the offline-probe retry interval (default 60s per
    /// spec.md S4.5). Production callers rarely need this; tests use it to
    /// keep the offline wait loop from actually sleeping a full minute.
    pub fn with_offline_probe_interval(mut self, interval: Duration) -> Self {
        self.offline_probe_interval = interval;
        self
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Sets the stopped flag, cancels any live subscription wait. Does not
    /// interrupt an in-flight side operation or the offline wait loop
    /// (spec.md S5 "Cancellation").
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Runs `sync()` in an unbounded loop until `stop()` is called or a
    /// fatal error propagates (spec.md S4.3 `start(mode)` step 3).
    pub async fn run(&self) -> Result<()> {
        while !self.is_stopped() {
            self.sync_once().await?;
        }
        Ok(())
    }

    /// One pass of the reconciliation loop (spec.md S4.3 `sync()`).
    pub async fn sync_once(&self) -> Result<()> {
        let seq = self.store.get_local_seq().await?;

        let pending = self
            .store
            .changes(seq, ChangesOptions { limit: Some(1), include_docs: false, by_path: true })
            .await?;
        if pending.is_empty() {
            let mut rx = self.store.subscribe();
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = rx.recv() => {}
            }
        }

        let _ = self.events.send(EngineEvent::SyncStart);
        let lock = self.store.lock().await;

        let mut last_seq = seq;
        let mut no_progress = 0u32;

        loop {
            let current_seq = self.store.get_local_seq().await?;
            if current_seq == last_seq {
                no_progress += 1;
                if no_progress == 1 {
                    crate::logging::warn(format!("no progress applying changes at seq={current_seq}"));
                }
                if no_progress >= NO_PROGRESS_HARD_BREAK {
                    return Err(FatalError::NoProgress { iterations: no_progress }.into());
                }
            } else {
                last_seq = current_seq;
                no_progress = 0;
            }

            let mut batch = self
                .store
                .changes(
                    current_seq,
                    ChangesOptions { limit: Some(1), include_docs: true, by_path: true },
                )
                .await?;
            let Some(entry) = batch.pop() else {
                break;
            };

            let _ = self.events.send(EngineEvent::SyncCurrent(entry.seq));

            match self.apply(&entry).await {
                Ok(true) => self.store.set_local_seq(entry.seq).await?,
                Ok(false) => {}
                Err(err) => {
                    if self.is_stopped() {
                        // Cancellation in flight: swallow silently (spec.md S5).
                    } else if self.handle_apply_error(&entry, err).await? {
                        self.store.set_local_seq(entry.seq).await?;
                    }
                }
            }
        }

        drop(lock);
        let _ = self.events.send(EngineEvent::SyncEnd);
        Ok(())
    }

    /// Classifies and applies one change. Returns whether the cursor should
    /// advance past it (spec.md S4.4).
    async fn apply(&self, entry: &ChangeEntry) -> Result<bool> {
        let Some(doc) = &entry.doc else {
            return Ok(true);
        };

        let Some((side_name, _rev)) = classifier::select_side(doc) else {
            return Ok(true);
        };

        if side_name == SideName::Remote && doc.trashed {
            return self.trash_with_parent(doc).await;
        }

        self.apply_doc(doc, side_name).await?;
        Ok(true)
    }

    async fn apply_doc(&self, doc: &Metadata, side_name: SideName) -> Result<()> {
        let side: &Arc<dyn Side> = match side_name {
            SideName::Local => &self.local,
            SideName::Remote => &self.remote,
        };

        let prev = if classifier::needs_previous_rev(doc) {
            self.store.get_previous_rev(&doc.id, extract_rev(&doc.rev)).await?
        } else {
            None
        };

        let decision = classifier::classify(doc, prev.as_ref());

        match decision {
            Decision::SkipIncompatible { was_compatible_before } => {
                if was_compatible_before {
                    let _ = self.local.trash(doc).await;
                }
                return Ok(());
            }
            Decision::FatalClassification => {
                return Err(FatalError::UnknownDocType { id: doc.id.clone() }.into());
            }
            Decision::NoOp => return Ok(()),
            Decision::AddFile => side.add_file(doc).await?,
            Decision::AddFolder => side.add_folder(doc).await?,
            Decision::Overwrite => side.overwrite_file(doc, prev.as_ref()).await?,
            Decision::UpdateMeta => {
                let old = prev.as_ref().ok_or_else(|| anyhow!("updateFileMetadata requires a previous revision"))?;
                side.update_file_metadata(doc, old).await?
            }
            Decision::UpdateFolder => {
                let old = prev.as_ref().ok_or_else(|| anyhow!("updateFolder requires a previous revision"))?;
                side.update_folder(doc, old).await?
            }
            Decision::MoveFile => {
                let from = doc.move_from.as_deref().ok_or_else(|| anyhow!("moveFile requires moveFrom"))?;
                side.move_file(doc, from).await?
            }
            Decision::MoveFolder => {
                let from = doc.move_from.as_deref().ok_or_else(|| anyhow!("moveFolder requires moveFrom"))?;
                side.move_folder(doc, from).await?
            }
            Decision::Trash => side.trash(doc).await?,
            Decision::DeleteFolder => side.delete_folder(doc).await?,
            Decision::AssignRev => side.assign_new_rev(doc).await?,
        }

        if !doc.deleted {
            self.update_revs(doc, side_name).await?;
        }
        Ok(())
    }

    /// Bumps both side counters to `extractRev(rev) + 1`, clears `errors`,
    /// and persists. On a `put` conflict, re-fetches and reapplies only the
    /// caller's side bump; any other failure is a logged-and-swallowed race
    /// (spec.md S4.4 `updateRevs`).
    async fn update_revs(&self, doc: &Metadata, side_name: SideName) -> Result<()> {
        let new_val = extract_rev(&doc.rev) + 1;
        let mut updated = doc.clone();
        updated.sides.local = new_val;
        updated.sides.remote = new_val;
        updated.errors = 0;

        match self.store.put(updated).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(errors::classify(&e), Some(SyncError::Conflict)) => {
                if let Some(mut fresh) = self.store.get(&doc.id).await? {
                    let bump = extract_rev(&fresh.rev) + 1;
                    match side_name {
                        SideName::Local => fresh.sides.local = bump,
                        SideName::Remote => fresh.sides.remote = bump,
                    }
                    fresh.errors = 0;
                    let _ = self.store.put(fresh).await;
                }
                Ok(())
            }
            Err(e) => {
                crate::logging::warn(format!("swallowed updateRevs race for doc={}: {e:#}", doc.id));
                Ok(())
            }
        }
    }

    /// spec.md S4.5 `handleApplyError`.
    async fn handle_apply_error(&self, entry: &ChangeEntry, err: anyhow::Error) -> Result<bool> {
        match errors::classify(&err) {
            Some(SyncError::DiskFull) | Some(SyncError::QuotaExceeded) => return Err(err),
            Some(SyncError::Conflict) => return Ok(true),
            _ => {}
        }

        match self.probe.disk_usage().await {
            Ok(_) => self.update_errors(entry).await,
            Err(probe_err) => match errors::classify(&probe_err) {
                Some(SyncError::Revoked) | Some(SyncError::WrongPermissions) => Err(probe_err),
                _ => {
                    self.offline_wait_loop().await;
                    Ok(false)
                }
            },
        }
    }

    /// Emits `offline`, retries `disk_usage` every `offline_probe_interval`,
    /// emits `online` on success. Ignores the stopped flag by design
    /// (spec.md S5, SPEC_FULL.md S9 Open Questions).
    async fn offline_wait_loop(&self) {
        let _ = self.events.send(EngineEvent::Offline);
        loop {
            if self.probe.disk_usage().await.is_ok() {
                break;
            }
            sleep(self.offline_probe_interval).await;
        }
        let _ = self.events.send(EngineEvent::Online);
    }

    /// Per-doc retry budget: increments `errors`, gives up at
    /// `MAX_DOC_ERRORS` and tells the caller to advance the cursor past the
    /// now-poisoned change.
    async fn update_errors(&self, entry: &ChangeEntry) -> Result<bool> {
        let Some(mut doc) = self.store.get(&entry.id).await? else {
            return Ok(true);
        };
        doc.errors += 1;
        let poisoned = doc.errors >= MAX_DOC_ERRORS;
        match self.store.put(doc).await {
            Ok(_) => Ok(poisoned),
            Err(e) if matches!(errors::classify(&e), Some(SyncError::Conflict)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// spec.md S4.7: trashes the top-most trashed ancestor instead of
    /// `doc` directly, returning whether the caller may advance its cursor.
    fn trash_with_parent<'a>(&'a self, doc: &'a Metadata) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let parent_id = metadata::parent_id(&doc.id);
            if parent_id == metadata::ROOT_ID {
                self.remote.trash(doc).await?;
                return Ok(true);
            }

            let mut parent = self.store.get(parent_id).await?;
            if !parent.as_ref().map(|p| p.trashed).unwrap_or(false) {
                sleep(TRASHING_DELAY).await;
                parent = self.store.get(parent_id).await?;
            }

            let parent_pending = parent
                .as_ref()
                .map(|p| p.trashed && p.sides.remote < extract_rev(&p.rev))
                .unwrap_or(false);

            if parent_pending {
                let parent_doc = parent.expect("checked Some above");
                self.trash_with_parent(&parent_doc).await?;
                sleep(self.heartbeat).await;
                return Ok(false);
            }

            self.remote.trash(doc).await?;
            Ok(true)
        })
    }
}
