//! Storage provider port (driven/secondary port)
//!
//! One implementation exists per backend. The core never sees a vendor
//! object model: every entry a provider reports is wrapped in a
//! [`SourceHandle`], whose `native` payload is opaque to the core and is
//! handed back verbatim on every subsequent call.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are adapter-specific;
//!   the core maps them into [`crate::domain::StorageError`] kinds.
//! - Paths passed to a provider are logical (prefix-stripped) paths. A provider
//!   re-applies its own [`StorageProvider::path_prefix`] when talking to its backend.
//! - Uses `#[async_trait]` for async trait methods.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

// ============================================================================
// Entry kinds and handles
// ============================================================================

/// Folder/file type indicator reported by a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Folder,
}

/// Where a provider's data lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    Local,
    Remote,
}

/// Provider-owned description of one file or folder
///
/// The core reads the descriptive fields but never interprets `native`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHandle {
    /// Provider-unique identifier
    pub id: String,
    pub name: String,
    pub kind: EntryKind,
    /// Raw provider path, still carrying the provider's path prefix if it has one
    pub path: Option<String>,
    /// Size in bytes (0 for folders unless the provider reports otherwise)
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Vendor payload, opaque to the core
    #[serde(default)]
    pub native: serde_json::Value,
}

impl SourceHandle {
    /// Creates a handle with no raw path, no date and a null native payload
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            path: None,
            size: 0,
            modified: None,
            native: serde_json::Value::Null,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_native(mut self, native: serde_json::Value) -> Self {
        self.native = native;
        self
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

// ============================================================================
// Listings
// ============================================================================

/// One entry of a child listing
///
/// Some backends return full metadata inline; others return only keys and
/// require a follow-up fetch. `metadata` is `None` in the latter case.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    /// Identifying key; becomes the container id
    pub key: String,
    pub kind: EntryKind,
    pub metadata: Option<SourceHandle>,
}

impl ChildEntry {
    /// Entry carrying full metadata
    pub fn full(handle: SourceHandle) -> Self {
        Self {
            key: handle.id.clone(),
            kind: handle.kind,
            metadata: Some(handle),
        }
    }

    /// Entry carrying only its key and kind
    pub fn key_only(key: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            key: key.into(),
            kind,
            metadata: None,
        }
    }
}

/// One page of a child listing
#[derive(Debug, Clone, Default)]
pub struct ChildListing {
    pub entries: Vec<ChildEntry>,
    /// Token for the next page; `None` on the last page
    pub next_page_token: Option<String>,
}

/// Storage quota reported by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Total bytes available to the account
    pub total: u64,
    /// Bytes in use
    pub used: u64,
}

impl Quota {
    /// Remaining bytes
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

// ============================================================================
// StorageProvider trait
// ============================================================================

/// Capability interface implemented once per storage backend
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short provider name used in logs (e.g. `dropbox`, `local`)
    fn name(&self) -> &str;

    fn locality(&self) -> Locality {
        Locality::Remote
    }

    /// Prefix stripped from raw provider paths to form logical paths
    fn path_prefix(&self) -> Option<&str> {
        None
    }

    /// Validates credentials; called once when a provider context is built
    async fn authorise(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle of the provider's root folder
    async fn root(&self) -> anyhow::Result<SourceHandle>;

    /// Account quota
    async fn quota(&self) -> anyhow::Result<Quota>;

    /// Lists one page of the children of `folder`
    async fn list_children(
        &self,
        folder: &SourceHandle,
        page_token: Option<&str>,
    ) -> anyhow::Result<ChildListing>;

    /// Fetches metadata for one key
    async fn fetch_metadata(&self, key: &str) -> anyhow::Result<SourceHandle>;

    /// True if `key` still exists on the backend
    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        self.fetch_metadata(key).await.map(|_| true)
    }

    /// True if [`StorageProvider::fetch_metadata_batch`] is backed by a bulk call
    fn supports_batch_metadata(&self) -> bool {
        false
    }

    /// Fetches metadata for many keys
    ///
    /// The default fetches each key sequentially. Items may arrive in any
    /// order; a failing key yields an `Err` item without ending the stream.
    async fn fetch_metadata_batch(
        &self,
        keys: Vec<String>,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<SourceHandle>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in &keys {
            results.push(self.fetch_metadata(key).await);
        }
        Ok(stream::iter(results).boxed())
    }

    /// Creates a folder `name` under `parent`, whose logical path is `parent_path`
    async fn create_folder(
        &self,
        parent: &SourceHandle,
        parent_path: &str,
        name: &str,
    ) -> anyhow::Result<SourceHandle>;

    /// Copies `handle` to the logical path `dest_path`
    async fn copy(&self, handle: &SourceHandle, dest_path: &str) -> anyhow::Result<SourceHandle>;

    /// Moves `handle` to the logical path `dest_path`
    async fn move_to(&self, handle: &SourceHandle, dest_path: &str)
        -> anyhow::Result<SourceHandle>;

    /// Renames `handle` in place
    async fn rename(&self, handle: &SourceHandle, new_name: &str) -> anyhow::Result<SourceHandle>;

    async fn delete(&self, handle: &SourceHandle) -> anyhow::Result<()>;
}
