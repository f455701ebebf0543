//! The uniform capability surface both endpoints implement (spec.md S4.2).
//!
//! A capability record, not a class hierarchy (Design Notes S9): the engine
//! calls through this trait object and never inspects which concrete side
//! it is talking to.

use anyhow::Result;
use async_trait::async_trait;

use crate::metadata::Metadata;

#[async_trait]
pub trait Side: Send + Sync {
    async fn add_file(&self, doc: &Metadata) -> Result<()>;
    async fn add_folder(&self, doc: &Metadata) -> Result<()>;
    /// Binary content differs; `old` is `None` when no previous revision is
    /// known (retention elapsed or first materialization).
    async fn overwrite_file(&self, doc: &Metadata, old: Option<&Metadata>) -> Result<()>;
    /// Same content, only metadata changed.
    async fn update_file_metadata(&self, doc: &Metadata, old: &Metadata) -> Result<()>;
    async fn update_folder(&self, doc: &Metadata, old: &Metadata) -> Result<()>;
    async fn move_file(&self, doc: &Metadata, from: &Metadata) -> Result<()>;
    async fn move_folder(&self, doc: &Metadata, from: &Metadata) -> Result<()>;
    /// Soft-delete into a recoverable trash.
    async fn trash(&self, doc: &Metadata) -> Result<()>;
    /// Hard delete; only ever called on an already-empty / already-trashed
    /// folder.
    async fn delete_folder(&self, doc: &Metadata) -> Result<()>;
    /// Bookkeeping-only: record that this side already saw the change. No
    /// I/O against the underlying resource.
    async fn assign_new_rev(&self, doc: &Metadata) -> Result<()>;

    /// Human-readable name used in logging (`"local"` / `"remote"`).
    fn name(&self) -> &'static str;
}
