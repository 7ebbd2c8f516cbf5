//! MemoryProvider - StorageProvider and TransferProvider backed by a node table
//!
//! Behaves like a small remote backend: listings are paginated, metadata
//! can be fetched in bulk, and transfers report progress ticks and honour
//! cancellation. Every port call is counted so tests can assert on the
//! traffic a use case generated.
//!
//! ## Design Notes
//!
//! - A `std::sync::Mutex` guards the node table; no guard is held across an await.
//! - An optional gate (`tokio::sync::Semaphore` with no permits) holds every
//!   transfer just before it finishes until [`MemoryProvider::release_transfers`]
//!   is called, which lets tests observe queue state deterministically.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use overcast_core::domain::container::raw_path;
use overcast_core::ports::{
    ChildEntry, ChildListing, EntryKind, Locality, Quota, SourceHandle, StorageProvider,
};
use overcast_transfer::{DownloadRequest, TransferCallback, TransferProvider, UploadRequest};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::store::{split_path, Store};

// ============================================================================
// Options and builder
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryOptions {
    page_size: usize,
    batch_metadata: bool,
    shallow_listings: bool,
    path_prefix: Option<String>,
    locality: Locality,
    reject_credentials: bool,
    transfer_ticks: u64,
    tick_delay: Duration,
    gated: bool,
    quota_total: u64,
    mutation_delay: Duration,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            batch_metadata: false,
            shallow_listings: false,
            path_prefix: None,
            locality: Locality::Remote,
            reject_credentials: false,
            transfer_ticks: 4,
            tick_delay: Duration::from_millis(1),
            gated: false,
            quota_total: 1 << 30,
            mutation_delay: Duration::ZERO,
        }
    }
}

/// Builder for [`MemoryProvider`]
#[derive(Debug, Clone)]
pub struct MemoryProviderBuilder {
    name: String,
    options: MemoryOptions,
}

impl MemoryProviderBuilder {
    /// Entries per listing page
    pub fn page_size(mut self, size: usize) -> Self {
        self.options.page_size = size.max(1);
        self
    }

    /// Advertise a bulk metadata fetch
    pub fn batch_metadata(mut self, enabled: bool) -> Self {
        self.options.batch_metadata = enabled;
        self
    }

    /// Return key-only listing entries, forcing follow-up metadata fetches
    pub fn shallow_listings(mut self, enabled: bool) -> Self {
        self.options.shallow_listings = enabled;
        self
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.path_prefix = Some(prefix.into());
        self
    }

    pub fn locality(mut self, locality: Locality) -> Self {
        self.options.locality = locality;
        self
    }

    /// Fail `authorise`
    pub fn reject_credentials(mut self) -> Self {
        self.options.reject_credentials = true;
        self
    }

    /// Progress callbacks per transfer
    pub fn transfer_ticks(mut self, ticks: u64) -> Self {
        self.options.transfer_ticks = ticks;
        self
    }

    pub fn tick_delay(mut self, delay: Duration) -> Self {
        self.options.tick_delay = delay;
        self
    }

    /// Hold every transfer before completion until released
    pub fn gated(mut self) -> Self {
        self.options.gated = true;
        self
    }

    pub fn quota_total(mut self, bytes: u64) -> Self {
        self.options.quota_total = bytes;
        self
    }

    /// Time each copy, move, rename and delete spends in flight
    pub fn mutation_delay(mut self, delay: Duration) -> Self {
        self.options.mutation_delay = delay;
        self
    }

    pub fn build(self) -> Arc<MemoryProvider> {
        Arc::new(MemoryProvider {
            name: self.name,
            options: self.options,
            store: Mutex::new(Store::new()),
            counters: Counters::default(),
            listed: Mutex::new(Vec::new()),
            uploads_started: Mutex::new(Vec::new()),
            downloads_started: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

// ============================================================================
// Call counters
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    list_children: AtomicUsize,
    fetch_metadata: AtomicUsize,
    fetch_metadata_batch: AtomicUsize,
    create_folder: AtomicUsize,
    copy: AtomicUsize,
    move_to: AtomicUsize,
    rename: AtomicUsize,
    delete: AtomicUsize,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
}

/// Snapshot of the port calls a [`MemoryProvider`] has served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub list_children: usize,
    pub fetch_metadata: usize,
    pub fetch_metadata_batch: usize,
    pub create_folder: usize,
    pub copy: usize,
    pub move_to: usize,
    pub rename: usize,
    pub delete: usize,
    pub uploads: usize,
    pub downloads: usize,
}

impl CallCounts {
    /// Calls that change the backend
    pub fn mutations(&self) -> usize {
        self.create_folder + self.copy + self.move_to + self.rename + self.delete
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MemoryProvider
// ============================================================================

/// In-memory storage backend
pub struct MemoryProvider {
    name: String,
    options: MemoryOptions,
    store: Mutex<Store>,
    counters: Counters,
    listed: Mutex<Vec<String>>,
    uploads_started: Mutex<Vec<String>>,
    downloads_started: Mutex<Vec<String>>,
    /// Operation names (`copy`, `list_children`, `transfer:<name>`, ...) that fail
    failing: Mutex<HashSet<String>>,
    gate: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryProvider {
    pub fn builder(name: impl Into<String>) -> MemoryProviderBuilder {
        MemoryProviderBuilder {
            name: name.into(),
            options: MemoryOptions::default(),
        }
    }

    /// Remote provider with default options
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::builder(name).build()
    }

    fn handle(&self, store: &Store, id: &str) -> Result<SourceHandle> {
        let node = store.get(id).ok_or_else(|| anyhow!("no such entry: {id}"))?;
        let path = store
            .path_of(id)
            .ok_or_else(|| anyhow!("entry {id} is detached"))?;
        let raw = raw_path(self.options.path_prefix.as_deref(), &path);

        // Local backends identify entries by their raw path.
        let handle_id = match self.options.locality {
            Locality::Local => raw.clone(),
            Locality::Remote => node.id.clone(),
        };
        Ok(SourceHandle::new(handle_id, node.name.clone(), node.kind)
            .with_path(raw)
            .with_size(node.size)
            .with_modified(node.modified)
            .with_native(serde_json::json!({ "node": node.id, "parent": node.parent })))
    }

    /// Maps a handle id or key back to a node id
    fn node_id(&self, store: &Store, key: &str) -> Option<String> {
        match self.options.locality {
            Locality::Remote => store.get(key).map(|n| n.id.clone()),
            Locality::Local => {
                let logical = match self.options.path_prefix.as_deref() {
                    Some(prefix) => overcast_core::domain::container::clean_path(key, prefix),
                    None => key.to_string(),
                };
                store.resolve(&logical)
            }
        }
    }

    /// Holds a mutation in flight for the configured delay
    async fn pace(&self) {
        if self.options.mutation_delay.is_zero() {
            return;
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.options.mutation_delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> Result<()> {
        if lock(&self.failing).contains(operation) {
            bail!("simulated {operation} failure");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Seeding and inspection
    // ------------------------------------------------------------------------

    /// Adds a folder under the logical `parent_path`
    pub fn add_folder(&self, parent_path: &str, name: &str) -> Result<SourceHandle> {
        self.add(parent_path, name, EntryKind::Folder, 0)
    }

    /// Adds a file of `size` bytes under the logical `parent_path`
    pub fn add_file(&self, parent_path: &str, name: &str, size: u64) -> Result<SourceHandle> {
        self.add(parent_path, name, EntryKind::File, size)
    }

    fn add(&self, parent_path: &str, name: &str, kind: EntryKind, size: u64) -> Result<SourceHandle> {
        let mut store = lock(&self.store);
        let parent = store
            .resolve(parent_path)
            .ok_or_else(|| anyhow!("no such folder: {parent_path}"))?;
        let id = store.insert(&parent, name, kind, size)?;
        self.handle(&store, &id)
    }

    /// Removes the entry at the logical `path`, returning false if there was none
    pub fn remove(&self, path: &str) -> bool {
        let mut store = lock(&self.store);
        match store.resolve(path) {
            Some(id) if id != store.root_id() => store.remove(&id) > 0,
            _ => false,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        lock(&self.store).resolve(path).is_some()
    }

    /// Handle of the entry at the logical `path`
    pub fn handle_at(&self, path: &str) -> Option<SourceHandle> {
        let store = lock(&self.store);
        let id = store.resolve(path)?;
        self.handle(&store, &id).ok()
    }

    /// Makes `operation` fail until cleared
    ///
    /// Names are port method names (`copy`, `list_children`, ...) or
    /// `transfer:<file name>` for a single transfer.
    pub fn fail(&self, operation: impl Into<String>) {
        lock(&self.failing).insert(operation.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    /// Most copies, moves, renames and deletes seen in flight at once
    ///
    /// Only tracked when a mutation delay is configured.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.counters;
        let get = |counter: &AtomicUsize| counter.load(Ordering::SeqCst);
        CallCounts {
            list_children: get(&c.list_children),
            fetch_metadata: get(&c.fetch_metadata),
            fetch_metadata_batch: get(&c.fetch_metadata_batch),
            create_folder: get(&c.create_folder),
            copy: get(&c.copy),
            move_to: get(&c.move_to),
            rename: get(&c.rename),
            delete: get(&c.delete),
            uploads: get(&c.uploads),
            downloads: get(&c.downloads),
        }
    }

    /// Logical paths of listed folders, one entry per `list_children` call
    pub fn listed_paths(&self) -> Vec<String> {
        lock(&self.listed).clone()
    }

    /// File names of started uploads, in start order
    pub fn uploads_started(&self) -> Vec<String> {
        lock(&self.uploads_started).clone()
    }

    /// File names of started downloads, in start order
    pub fn downloads_started(&self) -> Vec<String> {
        lock(&self.downloads_started).clone()
    }

    /// Lets `n` gated transfers finish
    pub fn release_transfers(&self, n: usize) {
        self.gate.add_permits(n);
    }

    // ------------------------------------------------------------------------
    // Transfer simulation
    // ------------------------------------------------------------------------

    /// Runs the progress ticks and the gate; false if cancelled on the way
    async fn simulate(&self, size: u64, callback: &TransferCallback, cancel: &CancellationToken) -> bool {
        callback.on_start();

        let ticks = self.options.transfer_ticks;
        for tick in 1..=ticks {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.options.tick_delay) => {}
            }
            callback.on_progress(size * tick / ticks, size);
        }

        if self.options.gated {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
            }
        }

        !cancel.is_cancelled()
    }
}

// ============================================================================
// StorageProvider
// ============================================================================

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn locality(&self) -> Locality {
        self.options.locality
    }

    fn path_prefix(&self) -> Option<&str> {
        self.options.path_prefix.as_deref()
    }

    async fn authorise(&self) -> Result<()> {
        if self.options.reject_credentials {
            bail!("credentials rejected by {}", self.name);
        }
        Ok(())
    }

    async fn root(&self) -> Result<SourceHandle> {
        let store = lock(&self.store);
        self.handle(&store, store.root_id())
    }

    async fn quota(&self) -> Result<Quota> {
        self.check("quota")?;
        Ok(Quota {
            total: self.options.quota_total,
            used: lock(&self.store).used(),
        })
    }

    #[instrument(skip(self, folder), fields(folder = %folder.name))]
    async fn list_children(
        &self,
        folder: &SourceHandle,
        page_token: Option<&str>,
    ) -> Result<ChildListing> {
        bump(&self.counters.list_children);
        self.check("list_children")?;

        let store = lock(&self.store);
        let id = self
            .node_id(&store, &folder.id)
            .ok_or_else(|| anyhow!("no such folder: {}", folder.id))?;
        lock(&self.listed).push(store.path_of(&id).unwrap_or_default());

        let offset: usize = match page_token {
            Some(token) => token
                .parse()
                .map_err(|_| anyhow!("invalid page token: {token}"))?,
            None => 0,
        };

        let children = store.children_of(&id);
        let end = (offset + self.options.page_size).min(children.len());
        let mut entries = Vec::with_capacity(end.saturating_sub(offset));
        for node in children.get(offset..end).unwrap_or_default() {
            let handle = self.handle(&store, &node.id)?;
            entries.push(if self.options.shallow_listings {
                ChildEntry::key_only(handle.id, handle.kind)
            } else {
                ChildEntry::full(handle)
            });
        }

        let next_page_token = (end < children.len()).then(|| end.to_string());
        debug!(offset, returned = entries.len(), more = next_page_token.is_some(), "Listed page");
        Ok(ChildListing {
            entries,
            next_page_token,
        })
    }

    async fn fetch_metadata(&self, key: &str) -> Result<SourceHandle> {
        bump(&self.counters.fetch_metadata);
        self.check("fetch_metadata")?;

        let store = lock(&self.store);
        let id = self
            .node_id(&store, key)
            .ok_or_else(|| anyhow!("no such entry: {key}"))?;
        self.handle(&store, &id)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check("exists")?;
        let store = lock(&self.store);
        Ok(self.node_id(&store, key).is_some())
    }

    fn supports_batch_metadata(&self) -> bool {
        self.options.batch_metadata
    }

    async fn fetch_metadata_batch(
        &self,
        keys: Vec<String>,
    ) -> Result<BoxStream<'static, Result<SourceHandle>>> {
        bump(&self.counters.fetch_metadata_batch);
        self.check("fetch_metadata_batch")?;

        let store = lock(&self.store);
        let results: Vec<Result<SourceHandle>> = keys
            .iter()
            .map(|key| {
                let id = self
                    .node_id(&store, key)
                    .ok_or_else(|| anyhow!("no such entry: {key}"))?;
                self.handle(&store, &id)
            })
            .collect();
        Ok(stream::iter(results).boxed())
    }

    #[instrument(skip(self, parent), fields(parent = %parent_path))]
    async fn create_folder(
        &self,
        parent: &SourceHandle,
        parent_path: &str,
        name: &str,
    ) -> Result<SourceHandle> {
        bump(&self.counters.create_folder);
        self.check("create_folder")?;

        let mut store = lock(&self.store);
        let parent_id = self
            .node_id(&store, &parent.id)
            .or_else(|| store.resolve(parent_path))
            .ok_or_else(|| anyhow!("no such folder: {parent_path}"))?;
        let id = store.insert(&parent_id, name, EntryKind::Folder, 0)?;
        self.handle(&store, &id)
    }

    #[instrument(skip(self, handle), fields(source = %handle.name))]
    async fn copy(&self, handle: &SourceHandle, dest_path: &str) -> Result<SourceHandle> {
        bump(&self.counters.copy);
        self.check("copy")?;
        self.pace().await;

        let (parent_path, name) = split_path(dest_path)?;
        let mut store = lock(&self.store);
        let id = self
            .node_id(&store, &handle.id)
            .ok_or_else(|| anyhow!("no such entry: {}", handle.id))?;
        let parent = store
            .resolve(&parent_path)
            .ok_or_else(|| anyhow!("no such folder: {parent_path}"))?;
        let copy = store.copy(&id, &parent, &name)?;
        self.handle(&store, &copy)
    }

    #[instrument(skip(self, handle), fields(source = %handle.name))]
    async fn move_to(&self, handle: &SourceHandle, dest_path: &str) -> Result<SourceHandle> {
        bump(&self.counters.move_to);
        self.check("move_to")?;
        self.pace().await;

        let (parent_path, name) = split_path(dest_path)?;
        let mut store = lock(&self.store);
        let id = self
            .node_id(&store, &handle.id)
            .ok_or_else(|| anyhow!("no such entry: {}", handle.id))?;
        let parent = store
            .resolve(&parent_path)
            .ok_or_else(|| anyhow!("no such folder: {parent_path}"))?;
        store.relocate(&id, &parent, &name)?;
        self.handle(&store, &id)
    }

    #[instrument(skip(self, handle), fields(source = %handle.name))]
    async fn rename(&self, handle: &SourceHandle, new_name: &str) -> Result<SourceHandle> {
        bump(&self.counters.rename);
        self.check("rename")?;
        self.pace().await;

        let mut store = lock(&self.store);
        let id = self
            .node_id(&store, &handle.id)
            .ok_or_else(|| anyhow!("no such entry: {}", handle.id))?;
        let parent = store
            .get(&id)
            .and_then(|n| n.parent.clone())
            .ok_or_else(|| anyhow!("cannot rename the root"))?;
        store.relocate(&id, &parent, new_name)?;
        self.handle(&store, &id)
    }

    #[instrument(skip(self, handle), fields(source = %handle.name))]
    async fn delete(&self, handle: &SourceHandle) -> Result<()> {
        bump(&self.counters.delete);
        self.check("delete")?;
        self.pace().await;

        let mut store = lock(&self.store);
        let id = self
            .node_id(&store, &handle.id)
            .ok_or_else(|| anyhow!("no such entry: {}", handle.id))?;
        if id == store.root_id() {
            bail!("cannot delete the root");
        }
        store.remove(&id);
        Ok(())
    }
}

// ============================================================================
// TransferProvider
// ============================================================================

#[async_trait]
impl TransferProvider for MemoryProvider {
    #[instrument(skip_all, fields(name = %request.name))]
    async fn start_upload(
        &self,
        request: UploadRequest,
        callback: TransferCallback,
        cancel: CancellationToken,
    ) -> Result<()> {
        bump(&self.counters.uploads);
        lock(&self.uploads_started).push(request.name.clone());

        if !self.simulate(request.size, &callback, &cancel).await {
            callback.on_cancel();
            callback.on_finish();
            return Ok(());
        }

        let outcome = self.check(&format!("transfer:{}", request.name)).and_then(|()| {
            let mut store = lock(&self.store);
            let parent = request
                .remote_parent
                .as_ref()
                .and_then(|h| self.node_id(&store, &h.id))
                .or_else(|| store.resolve(&request.remote_parent_path))
                .ok_or_else(|| anyhow!("no such folder: {}", request.remote_parent_path))?;
            let id = store.insert(&parent, &request.name, EntryKind::File, request.size)?;
            self.handle(&store, &id)
        });

        match outcome {
            Ok(handle) => callback.on_success(Some(handle)),
            Err(e) => callback.on_failure(format!("{e:#}")),
        }
        callback.on_finish();
        Ok(())
    }

    #[instrument(skip_all, fields(name = %request.remote.name))]
    async fn start_download(
        &self,
        request: DownloadRequest,
        callback: TransferCallback,
        cancel: CancellationToken,
    ) -> Result<()> {
        bump(&self.counters.downloads);
        lock(&self.downloads_started).push(request.remote.name.clone());

        if !self.simulate(request.size, &callback, &cancel).await {
            callback.on_cancel();
            callback.on_finish();
            return Ok(());
        }

        let exists = {
            let store = lock(&self.store);
            self.node_id(&store, &request.remote.id).is_some()
        };
        match self.check(&format!("transfer:{}", request.remote.name)) {
            Err(e) => callback.on_failure(format!("{e:#}")),
            Ok(()) if !exists => callback.on_failure(format!("no such entry: {}", request.remote_path)),
            Ok(()) => callback.on_success(None),
        }
        callback.on_finish();
        Ok(())
    }
}
