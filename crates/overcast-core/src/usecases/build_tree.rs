//! Tree builder/differ
//!
//! Reconciles a folder's known children with a fresh provider listing:
//!
//! 1. page through the listing until no page token is returned
//! 2. drop known children absent from the listing
//! 3. create containers for listed entries not known yet
//! 4. recurse into every child folder with one level less
//!
//! Listings that carry only keys are resolved through the provider's
//! batched metadata fetch when it has one.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::config::TreeConfig;
use crate::domain::{Container, StorageError};
use crate::ports::{ChildEntry, SourceHandle, StorageProvider};

/// Recursive tree population for one provider
#[derive(Debug, Clone, Copy)]
pub struct TreeBuilder {
    batch_metadata: bool,
}

impl TreeBuilder {
    pub fn new(batch_metadata: bool) -> Self {
        Self { batch_metadata }
    }

    pub fn from_config(config: &TreeConfig) -> Self {
        Self::new(config.batch_metadata)
    }

    /// Builds `depth` levels below `folder`; a negative depth does nothing
    ///
    /// `depth == 0` refreshes the direct children of `folder` only.
    pub fn build<'a>(
        &'a self,
        folder: &'a Arc<Container>,
        depth: i32,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            if depth < 0 || !folder.is_folder() {
                return Ok(());
            }

            let provider = Arc::clone(folder.context().provider());
            let handle = folder.source().ok_or_else(|| {
                StorageError::NotFound(format!("{} has no source handle", folder.path()))
            })?;

            let entries = list_all(provider.as_ref(), &handle, &folder.path()).await?;

            let keys: HashSet<String> = entries.iter().map(|e| e.key.to_lowercase()).collect();
            let removed = folder.remove_obsolete(&keys);
            for child in &removed {
                debug!(path = %child.path(), "Removed obsolete child");
            }

            let known = folder.child_ids();
            let fresh: Vec<ChildEntry> = entries
                .into_iter()
                .filter(|e| !known.contains(&e.key.to_lowercase()))
                .collect();

            let added = fresh.len();
            for metadata in self.resolve(provider.as_ref(), fresh).await {
                folder.add(Container::from_handle(folder.context(), metadata));
            }

            debug!(
                provider = %folder.context().name(),
                path = %folder.path(),
                removed = removed.len(),
                added,
                depth,
                "Folder reconciled"
            );

            for child in folder.folders() {
                self.build(&child, depth.saturating_sub(1)).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Turns listing entries into handles, fetching metadata the listing omitted
    async fn resolve(
        &self,
        provider: &dyn StorageProvider,
        entries: Vec<ChildEntry>,
    ) -> Vec<SourceHandle> {
        let mut handles = Vec::with_capacity(entries.len());
        let mut missing = Vec::new();

        for entry in entries {
            match entry.metadata {
                Some(metadata) => handles.push(metadata),
                None => missing.push(entry.key),
            }
        }
        if missing.is_empty() {
            return handles;
        }

        if self.batch_metadata && provider.supports_batch_metadata() {
            match provider.fetch_metadata_batch(missing.clone()).await {
                Ok(mut stream) => {
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(metadata) => handles.push(metadata),
                            Err(e) => warn!(error = %format!("{e:#}"), "Skipping entry without metadata"),
                        }
                    }
                    return handles;
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Batch metadata fetch failed, fetching singly");
                }
            }
        }

        for key in missing {
            match provider.fetch_metadata(&key).await {
                Ok(metadata) => handles.push(metadata),
                Err(e) => warn!(key = %key, error = %format!("{e:#}"), "Skipping entry without metadata"),
            }
        }
        handles
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::from_config(&TreeConfig::default())
    }
}

/// Collects every page of a folder listing, keeping the first entry per key
async fn list_all(
    provider: &dyn StorageProvider,
    folder: &SourceHandle,
    path: &str,
) -> Result<Vec<ChildEntry>, StorageError> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut token: Option<String> = None;

    loop {
        let page = provider
            .list_children(folder, token.as_deref())
            .await
            .map_err(|e| {
                warn!(path = %path, error = %format!("{e:#}"), "Listing failed");
                StorageError::operation("build tree", &e)
            })?;

        for entry in page.entries {
            if seen.insert(entry.key.to_lowercase()) {
                entries.push(entry);
            }
        }

        match page.next_page_token {
            Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
            Some(_) => {
                warn!(path = %path, "Provider repeated its page token, stopping");
                break;
            }
            None => break,
        }
    }
    Ok(entries)
}

impl Container {
    /// Refreshes `depth` levels below this folder using the context's tree settings
    pub async fn build_tree(self: &Arc<Self>, depth: i32) -> Result<(), StorageError> {
        TreeBuilder::from_config(&self.context().config().tree)
            .build(self, depth)
            .await
    }
}
