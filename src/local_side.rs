//! Filesystem `Side` implementation (spec.md S4.2, SPEC_FULL.md S2 item 8).
//!
//! Grounded on the teacher's `LocalScanner`/`compute_local_etag`/
//! `ensure_parent_dirs` family in `sync.rs`: create-parents-then-write,
//! trash via rename into a staging directory rather than hard delete.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;

use crate::errors::SyncError;
use crate::http::ApiClient;
use crate::metadata::{DocType, Metadata};
use crate::side::Side;

pub struct LocalSide {
    root: PathBuf,
    trash_root: PathBuf,
    remote: Arc<ApiClient>,
}

impl LocalSide {
    /// `remote` is the back-reference the local side needs to pull the real
    /// blob bytes for `addFile`/`overwriteFile` — the store's `Metadata`
    /// only carries a checksum, not the content itself (spec.md S4.2).
    pub fn new(root: impl Into<PathBuf>, remote: Arc<ApiClient>) -> Self {
        let root = root.into();
        let trash_root = root.join(".trash");
        LocalSide { root, trash_root, remote }
    }

    fn abs_path(&self, doc_path: &str) -> PathBuf {
        self.root.join(doc_path)
    }

    fn trash_path(&self, doc_path: &str) -> PathBuf {
        self.trash_root.join(doc_path)
    }

    async fn ensure_parent_dirs(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create parent dirs for {}", path.display()))?;
        }
        Ok(())
    }

    /// Pulls the real blob bytes from the remote and writes them to disk —
    /// the store's `Metadata` carries a checksum, not the content, so
    /// materializing a file means downloading it (spec.md S4.2).
    async fn write_placeholder(&self, doc: &Metadata) -> Result<()> {
        let target = self.abs_path(&doc.path);
        Self::ensure_parent_dirs(&target).await?;
        let bytes = self.remote.download_blob(&doc.path).await?;
        map_io_error(fs::write(&target, bytes).await)?;
        Ok(())
    }
}

fn map_io_error(result: std::io::Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::StorageFull || e.raw_os_error() == Some(28) => {
            Err(SyncError::DiskFull.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Side for LocalSide {
    async fn add_file(&self, doc: &Metadata) -> Result<()> {
        self.write_placeholder(doc).await
    }

    async fn add_folder(&self, doc: &Metadata) -> Result<()> {
        let target = self.abs_path(&doc.path);
        fs::create_dir_all(&target)
            .await
            .with_context(|| format!("create folder {}", target.display()))
    }

    async fn overwrite_file(&self, doc: &Metadata, _old: Option<&Metadata>) -> Result<()> {
        self.write_placeholder(doc).await
    }

    async fn update_file_metadata(&self, doc: &Metadata, _old: &Metadata) -> Result<()> {
        let target = self.abs_path(&doc.path);
        if let Some(executable) = doc.executable {
            set_executable(&target, executable).await?;
        }
        Ok(())
    }

    async fn update_folder(&self, _doc: &Metadata, _old: &Metadata) -> Result<()> {
        Ok(())
    }

    async fn move_file(&self, doc: &Metadata, from: &Metadata) -> Result<()> {
        self.rename_entry(&from.path, &doc.path).await
    }

    async fn move_folder(&self, doc: &Metadata, from: &Metadata) -> Result<()> {
        self.rename_entry(&from.path, &doc.path).await
    }

    async fn trash(&self, doc: &Metadata) -> Result<()> {
        let src = self.abs_path(&doc.path);
        if !fs::try_exists(&src).await.unwrap_or(false) {
            return Ok(());
        }
        let dest = self.trash_path(&doc.path);
        Self::ensure_parent_dirs(&dest).await?;
        fs::rename(&src, &dest)
            .await
            .with_context(|| format!("trash {} -> {}", src.display(), dest.display()))
    }

    async fn delete_folder(&self, doc: &Metadata) -> Result<()> {
        let target = self.abs_path(&doc.path);
        match fs::remove_dir(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete folder {}", target.display())),
        }
    }

    async fn assign_new_rev(&self, _doc: &Metadata) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

impl LocalSide {
    async fn rename_entry(&self, from_path: &str, to_path: &str) -> Result<()> {
        let src = self.abs_path(from_path);
        let dest = self.abs_path(to_path);
        Self::ensure_parent_dirs(&dest).await?;
        fs::rename(&src, &dest)
            .await
            .with_context(|| format!("move {} -> {}", src.display(), dest.display()))
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path).await.with_context(|| format!("stat {}", path.display()))?;
    let mut perms = metadata.permissions();
    let mode = perms.mode();
    let new_mode = if executable { mode | 0o111 } else { mode & !0o111 };
    perms.set_mode(new_mode);
    fs::set_permissions(path, perms)
        .await
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

pub fn compute_md5_base64(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    let digest = md5::compute(bytes);
    BASE64.encode(digest.0)
}

/// Derives an id for a path under this local side's platform convention and
/// confirms it is one of {file, folder} before the filesystem is touched.
pub fn doc_type_for_path(path: &Path) -> Option<DocType> {
    if path.is_dir() {
        Some(DocType::Folder)
    } else if path.is_file() {
        Some(DocType::File)
    } else {
        None
    }
}
