//! Local disk storage adapter
//!
//! Implements [`StorageProvider`] over a directory on disk using `tokio::fs`.
//!
//! ## Design Notes
//!
//! - Entries are identified by their absolute path, which is also their raw
//!   path. The root directory is the path prefix, so containers see
//!   root-relative logical paths.
//! - Listings are returned as a single page with full metadata.
//! - Logical paths containing `..` are rejected so no operation leaves the root.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overcast_core::ports::{
    ChildEntry, ChildListing, EntryKind, Locality, Quota, SourceHandle, StorageProvider,
};
use tracing::{debug, instrument};

/// Anchors a relative root at the working directory and drops `.` segments
fn absolute_root(root: PathBuf) -> PathBuf {
    let anchored = if root.is_relative() {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(root),
            Err(_) => root,
        }
    } else {
        root
    };
    anchored
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Storage provider rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    name: String,
    root: PathBuf,
    prefix: String,
}

impl LocalStorage {
    /// Creates a provider serving the directory at `root`
    ///
    /// The directory must already exist. A relative root is resolved against
    /// the working directory.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = absolute_root(root.into());
        let prefix = root
            .to_string_lossy()
            .trim_end_matches('/')
            .to_string();
        Self {
            name: name.into(),
            root,
            prefix,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a logical, root-relative path
    fn absolute(&self, logical: &str) -> Result<PathBuf> {
        let relative = Path::new(logical.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("path leaves the storage root: {logical}");
        }
        Ok(self.root.join(relative))
    }

    /// Absolute path for a handle id, which is either absolute or logical
    fn resolve_key(&self, key: &str) -> Result<PathBuf> {
        if !self.prefix.is_empty() && (key == self.prefix || key.starts_with(&format!("{}/", self.prefix))) {
            let logical = &key[self.prefix.len()..];
            return self.absolute(logical);
        }
        self.absolute(key)
    }

    async fn handle(&self, path: &Path) -> Result<SourceHandle> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;

        let kind = if metadata.is_dir() {
            EntryKind::Folder
        } else {
            EntryKind::File
        };
        let raw = path.to_string_lossy().to_string();
        let name = if path == self.root {
            String::new()
        } else {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        };

        let mut handle = SourceHandle::new(raw.clone(), name, kind)
            .with_path(raw)
            .with_size(if metadata.is_file() { metadata.len() } else { 0 })
            .with_native(serde_json::json!({ "readonly": metadata.permissions().readonly() }));
        if let Some(modified) = modified_time(&metadata) {
            handle = handle.with_modified(modified);
        }
        Ok(handle)
    }

    async fn ensure_absent(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            bail!("{} already exists", path.display());
        }
        Ok(())
    }
}

fn modified_time(metadata: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().and_then(|st| {
        st.duration_since(std::time::UNIX_EPOCH)
            .ok()
            .and_then(|dur| DateTime::from_timestamp(dur.as_secs() as i64, dur.subsec_nanos()))
    })
}

/// Copies a file or a whole directory tree
async fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        let metadata = tokio::fs::metadata(&from).await?;
        if !metadata.is_dir() {
            tokio::fs::copy(&from, &to)
                .await
                .with_context(|| format!("failed to copy {}", from.display()))?;
            continue;
        }

        tokio::fs::create_dir(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            pending.push((entry.path(), to.join(entry.file_name())));
        }
    }
    Ok(())
}

#[async_trait]
impl StorageProvider for LocalStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn locality(&self) -> Locality {
        Locality::Local
    }

    fn path_prefix(&self) -> Option<&str> {
        (!self.prefix.is_empty()).then_some(self.prefix.as_str())
    }

    async fn root(&self) -> Result<SourceHandle> {
        let handle = self.handle(&self.root).await?;
        if !handle.is_folder() {
            bail!("{} is not a directory", self.root.display());
        }
        Ok(handle)
    }

    async fn quota(&self) -> Result<Quota> {
        Err(anyhow!("local storage does not report a quota"))
    }

    #[instrument(skip(self, folder), fields(path = %folder.id))]
    async fn list_children(
        &self,
        folder: &SourceHandle,
        _page_token: Option<&str>,
    ) -> Result<ChildListing> {
        let dir = self.resolve_key(&folder.id)?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read {}", dir.display()))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();

        let mut listing = ChildListing::default();
        for path in paths {
            match self.handle(&path).await {
                Ok(handle) => listing.entries.push(ChildEntry::full(handle)),
                // Removed between read_dir and stat.
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping entry"),
            }
        }
        debug!(entries = listing.entries.len(), "directory listed");
        Ok(listing)
    }

    async fn fetch_metadata(&self, key: &str) -> Result<SourceHandle> {
        let path = self.resolve_key(key)?;
        self.handle(&path).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve_key(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, parent), fields(parent = %parent_path))]
    async fn create_folder(
        &self,
        parent: &SourceHandle,
        parent_path: &str,
        name: &str,
    ) -> Result<SourceHandle> {
        let dir = self.resolve_key(&parent.id)?.join(name);
        tokio::fs::create_dir(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        self.handle(&dir).await
    }

    #[instrument(skip(self, handle), fields(source = %handle.id))]
    async fn copy(&self, handle: &SourceHandle, dest_path: &str) -> Result<SourceHandle> {
        let source = self.resolve_key(&handle.id)?;
        let target = self.absolute(dest_path)?;
        if target.starts_with(&source) {
            bail!("cannot copy {} into itself", source.display());
        }
        Self::ensure_absent(&target).await?;

        copy_tree(&source, &target).await?;
        self.handle(&target).await
    }

    #[instrument(skip(self, handle), fields(source = %handle.id))]
    async fn move_to(&self, handle: &SourceHandle, dest_path: &str) -> Result<SourceHandle> {
        let source = self.resolve_key(&handle.id)?;
        let target = self.absolute(dest_path)?;
        Self::ensure_absent(&target).await?;

        tokio::fs::rename(&source, &target)
            .await
            .with_context(|| format!("failed to move {}", source.display()))?;
        self.handle(&target).await
    }

    #[instrument(skip(self, handle), fields(source = %handle.id))]
    async fn rename(&self, handle: &SourceHandle, new_name: &str) -> Result<SourceHandle> {
        let source = self.resolve_key(&handle.id)?;
        let parent = source
            .parent()
            .ok_or_else(|| anyhow!("cannot rename {}", source.display()))?;
        let target = parent.join(new_name);
        Self::ensure_absent(&target).await?;

        tokio::fs::rename(&source, &target).await?;
        self.handle(&target).await
    }

    #[instrument(skip(self, handle), fields(path = %handle.id))]
    async fn delete(&self, handle: &SourceHandle) -> Result<()> {
        let path = self.resolve_key(&handle.id)?;
        if path == self.root {
            bail!("cannot delete the storage root");
        }

        let metadata = tokio::fs::metadata(&path).await?;
        if metadata.is_dir() {
            debug!("removing directory recursively");
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
