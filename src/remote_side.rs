//! Remote object-store `Side` implementation (spec.md S4.2, SPEC_FULL.md S2
//! item 9). Translates each capability into a blob upload/download/delete
//! call through `http::ApiClient`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;

use crate::http::ApiClient;
use crate::local_side::compute_md5_base64;
use crate::metadata::Metadata;
use crate::side::Side;

pub struct RemoteSide {
    api: ApiClient,
    /// Back-reference to the local sync root: `addFile`/`overwriteFile` need
    /// the real on-disk bytes, not just the checksum carried on `Metadata`
    /// (spec.md S4.2).
    local_root: PathBuf,
}

impl RemoteSide {
    pub fn new(api: ApiClient, local_root: impl Into<PathBuf>) -> Self {
        RemoteSide { api, local_root: local_root.into() }
    }

    async fn upload(&self, doc: &Metadata) -> Result<()> {
        let path = self.local_root.join(&doc.path);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        self.api.upload_blob(&doc.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl Side for RemoteSide {
    async fn add_file(&self, doc: &Metadata) -> Result<()> {
        self.upload(doc).await
    }

    async fn add_folder(&self, doc: &Metadata) -> Result<()> {
        // The blob store has no folder objects; a zero-length marker blob
        // at the folder path keeps `list_blobs` prefix queries meaningful.
        self.api.upload_blob(&format!("{}/.keep", doc.path), Vec::new()).await?;
        Ok(())
    }

    async fn overwrite_file(&self, doc: &Metadata, _old: Option<&Metadata>) -> Result<()> {
        self.upload(doc).await
    }

    async fn update_file_metadata(&self, _doc: &Metadata, _old: &Metadata) -> Result<()> {
        // No separate metadata endpoint; content is unchanged so there is
        // nothing to push to the blob store itself.
        Ok(())
    }

    async fn update_folder(&self, _doc: &Metadata, _old: &Metadata) -> Result<()> {
        Ok(())
    }

    async fn move_file(&self, doc: &Metadata, from: &Metadata) -> Result<()> {
        let bytes = self.api.download_blob(&from.path).await?;
        self.api.upload_blob(&doc.path, bytes).await?;
        self.api.delete_blob(&from.path).await
    }

    async fn move_folder(&self, doc: &Metadata, from: &Metadata) -> Result<()> {
        let blobs = self.api.list_blobs(&from.path).await?;
        for blob in blobs {
            let suffix = blob.path.strip_prefix(&from.path).unwrap_or(&blob.path);
            let dest = format!("{}{}", doc.path, suffix);
            let bytes = self.api.download_blob(&blob.path).await?;
            self.api.upload_blob(&dest, bytes).await?;
            self.api.delete_blob(&blob.path).await?;
        }
        Ok(())
    }

    async fn trash(&self, doc: &Metadata) -> Result<()> {
        self.api.delete_blob(&doc.path).await
    }

    async fn delete_folder(&self, doc: &Metadata) -> Result<()> {
        self.api.delete_blob(&format!("{}/.keep", doc.path)).await
    }

    async fn assign_new_rev(&self, _doc: &Metadata) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

pub fn etag_for(bytes: &[u8]) -> String {
    compute_md5_base64(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ApiClient;
    use crate::metadata::{DocType, RemoteRef, Sides};
    use crate::test_support::{self, BlobStore};
    use std::env;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = env::temp_dir();
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    fn doc(path: &str, doc_type: DocType) -> Metadata {
        Metadata {
            id: path.to_string(),
            rev: "1-a".to_string(),
            path: path.to_string(),
            doc_type,
            deleted: false,
            md5sum: Some("rL0Y20zC+Fzt72VPzMSk2A==".to_string()),
            size: Some(4),
            executable: None,
            mime: None,
            class: None,
            updated_at: None,
            ino: None,
            tags: Vec::new(),
            remote: RemoteRef::default(),
            sides: Sides::default(),
            errors: 0,
            move_to: None,
            move_from: None,
            child_move: false,
            trashed: false,
            incompatibilities: Vec::new(),
        }
    }

    #[tokio::test]
    async fn add_file_uploads_the_real_local_bytes_not_the_checksum() {
        let root = make_temp_dir("foldersync-remote-side");
        std::fs::write(root.join("a.txt"), b"the actual file content").unwrap();

        let store = BlobStore::default();
        let base = test_support::spawn(store.clone()).await;
        let api = ApiClient::new(&base, "tok").unwrap();
        let side = RemoteSide::new(api, &root);

        side.add_file(&doc("a.txt", DocType::File)).await.unwrap();

        assert_eq!(store.get("a.txt").unwrap(), b"the actual file content");
    }

    #[tokio::test]
    async fn overwrite_file_reads_the_current_disk_contents() {
        let root = make_temp_dir("foldersync-remote-side-overwrite");
        std::fs::write(root.join("a.txt"), b"v2 content").unwrap();

        let store = BlobStore::default();
        store.seed("a.txt", b"v1 content");
        let base = test_support::spawn(store.clone()).await;
        let api = ApiClient::new(&base, "tok").unwrap();
        let side = RemoteSide::new(api, &root);

        side.overwrite_file(&doc("a.txt", DocType::File), None).await.unwrap();

        assert_eq!(store.get("a.txt").unwrap(), b"v2 content");
    }
}
