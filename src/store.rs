//! Durable, versioned metadata store with a live change-feed (spec.md S4.1).
//!
//! Grounded on the teacher's `SyncJournal` in `sync.rs`: a `rusqlite`-backed
//! table, JSON-blob document storage, and a `tokio::sync::broadcast` channel
//! standing in for the live feed (the same primitive the teacher uses for
//! `control.rs`'s `sync_events`).

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

use crate::errors::SyncError;
use crate::metadata::{extract_rev, Metadata};

/// How many past revisions `get_previous_rev` can still answer for, per id.
const HISTORY_RETENTION: i64 = 5;
const CHANGES_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub seq: i64,
    pub id: String,
    pub deleted: bool,
    pub doc: Option<Metadata>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChangesOptions {
    pub limit: Option<u32>,
    pub include_docs: bool,
    /// Excludes ids reserved for internal bookkeeping (a leading `_`),
    /// mirroring the store's `byPath` view (spec.md S4.1/S6).
    pub by_path: bool,
}

/// Exclusive write-serialization token. Held across a caller's whole batch
/// of `put` calls; dropping it releases the lock. Readers (`get`,
/// `get_previous_rev`, `changes`) never need one.
pub struct StoreLock {
    _guard: OwnedMutexGuard<()>,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    write_lock: Arc<Mutex<()>>,
    changes_tx: broadcast::Sender<ChangeEntry>,
}

impl Store {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(path).with_context(|| format!("open store {}", path.display()))?;
        Self::init_schema(&conn)?;
        let (changes_tx, _) = broadcast::channel(CHANGES_CHANNEL_CAPACITY);
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            write_lock: Arc::new(Mutex::new(())),
            changes_tx,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        Self::init_schema(&conn)?;
        let (changes_tx, _) = broadcast::channel(CHANGES_CHANNEL_CAPACITY);
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            write_lock: Arc::new(Mutex::new(())),
            changes_tx,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                rev_n INTEGER NOT NULL,
                rev_hash TEXT NOT NULL,
                seq INTEGER NOT NULL,
                doc TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS documents_seq ON documents(seq);
            CREATE TABLE IF NOT EXISTS document_history (
                id TEXT NOT NULL,
                rev_n INTEGER NOT NULL,
                doc TEXT NOT NULL,
                PRIMARY KEY (id, rev_n)
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .context("create store schema")?;
        Ok(())
    }

    /// Acquires the exclusive writer token (spec.md S4.1 `lock()`).
    pub async fn lock(&self) -> StoreLock {
        let guard = self.write_lock.clone().lock_owned().await;
        StoreLock { _guard: guard }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Metadata>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM documents WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .context("get document")?;
        doc.map(|raw| serde_json::from_str(&raw).context("decode stored document"))
            .transpose()
    }

    /// `None` both when the id never had that revision and when retention
    /// has elapsed for it — the engine treats both as "prev unknown".
    pub async fn get_previous_rev(&self, id: &str, rev_number: i64) -> Result<Option<Metadata>> {
        let conn = self.conn.lock().await;
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM document_history WHERE id = ?1 AND rev_n = ?2",
                params![id, rev_number],
                |row| row.get(0),
            )
            .optional()
            .context("get previous rev")?;
        doc.map(|raw| serde_json::from_str(&raw).context("decode historical document"))
            .transpose()
    }

    /// Fails with `SyncError::Conflict` when `doc.rev` does not match the
    /// currently stored rev. On success the document's rev is bumped to
    /// `extractRev(doc.rev) + 1` and the new rev string is returned.
    pub async fn put(&self, mut doc: Metadata) -> Result<String> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin put transaction")?;

        let current_rev: Option<String> = tx
            .query_row(
                "SELECT rev_hash FROM documents WHERE id = ?1",
                params![doc.id],
                |row| row.get(0),
            )
            .optional()
            .context("read current rev")?;

        match &current_rev {
            Some(stored) if stored != &doc.rev => {
                return Err(SyncError::Conflict.into());
            }
            None if extract_rev(&doc.rev) != 0 => {
                return Err(SyncError::Conflict.into());
            }
            _ => {}
        }

        let new_rev_n = extract_rev(&doc.rev) + 1;
        let hash = format!("{:x}", md5::compute(format!("{}{}", doc.id, new_rev_n)));
        let new_rev = format!("{new_rev_n}-{hash}");
        doc.rev = new_rev.clone();

        let next_seq: i64 = tx
            .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM documents", [], |row| row.get(0))
            .context("compute next seq")?;

        let encoded = serde_json::to_string(&doc).context("encode document")?;
        tx.execute(
            "INSERT INTO documents (id, rev_n, rev_hash, seq, doc, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                rev_n = excluded.rev_n, rev_hash = excluded.rev_hash,
                seq = excluded.seq, doc = excluded.doc, deleted = excluded.deleted",
            params![doc.id, new_rev_n, hash, next_seq, encoded, doc.deleted as i64],
        )
        .context("upsert document")?;

        tx.execute(
            "INSERT OR REPLACE INTO document_history (id, rev_n, doc) VALUES (?1, ?2, ?3)",
            params![doc.id, new_rev_n, encoded],
        )
        .context("insert history")?;
        tx.execute(
            "DELETE FROM document_history WHERE id = ?1 AND rev_n <= ?2",
            params![doc.id, new_rev_n - HISTORY_RETENTION],
        )
        .context("trim history")?;

        tx.commit().context("commit put")?;
        drop(conn);

        let entry = ChangeEntry {
            seq: next_seq,
            id: doc.id.clone(),
            deleted: doc.deleted,
            doc: Some(doc),
        };
        let _ = self.changes_tx.send(entry);
        Ok(new_rev)
    }

    /// Yields entries strictly past `since`, ordered by sequence.
    pub async fn changes(&self, since: i64, opts: ChangesOptions) -> Result<Vec<ChangeEntry>> {
        let conn = self.conn.lock().await;
        let mut sql = String::from("SELECT seq, id, doc, deleted FROM documents WHERE seq > ?1");
        if opts.by_path {
            sql.push_str(" AND id NOT LIKE '\\_%' ESCAPE '\\'");
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = opts.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = conn.prepare(&sql).context("prepare changes query")?;
        let rows = stmt
            .query_map(params![since], |row| {
                let seq: i64 = row.get(0)?;
                let id: String = row.get(1)?;
                let raw_doc: String = row.get(2)?;
                let deleted: i64 = row.get(3)?;
                Ok((seq, id, raw_doc, deleted != 0))
            })
            .context("run changes query")?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, id, raw_doc, deleted) = row.context("read changes row")?;
            let doc = if opts.include_docs {
                Some(serde_json::from_str(&raw_doc).context("decode change document")?)
            } else {
                None
            };
            out.push(ChangeEntry { seq, id, deleted, doc });
        }
        Ok(out)
    }

    /// Subscribes to the live feed. The caller waits for the first event
    /// past `since` and then drops the receiver to cancel (spec.md S4.3
    /// step 2).
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEntry> {
        self.changes_tx.subscribe()
    }

    pub async fn get_local_seq(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let value: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'local_seq'", [], |row| row.get(0))
            .optional()
            .context("read local_seq")?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub async fn set_local_seq(&self, seq: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('local_seq', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![seq.to_string()],
        )
        .context("write local_seq")?;
        Ok(())
    }
}
