//! Container model
//!
//! A [`Container`] is one file or folder of one provider, local or remote.
//! Folders own their children through `Arc`; every child keeps a `Weak`
//! back-reference to its parent, so a tree is dropped by dropping its root.
//!
//! ## Paths
//!
//! A container attached to a parent derives its path from the parent
//! (`parent.path + "/" + name`, or `"/" + name` under the root). Detached
//! containers fall back to a stored path computed from the source handle's
//! raw path with the provider's prefix stripped once.
//!
//! ## Identity
//!
//! Equality and hashing use the provider id, compared case-insensitively.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StorageError;
use super::listener::ListenerRegistry;
use super::operation::{ListenerHandle, Operation, OperationEvent, OperationState};
use crate::context::ProviderContext;
use crate::ports::{EntryKind, Locality, SourceHandle};

// ============================================================================
// Lock helpers
// ============================================================================

// A panicking listener must not wedge the tree; recover poisoned guards.

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Path helpers
// ============================================================================

/// Joins a parent path and a child name
///
/// ```
/// use overcast_core::domain::container::join_path;
///
/// assert_eq!(join_path("/", "report.pdf"), "/report.pdf");
/// assert_eq!(join_path("/Docs", "report.pdf"), "/Docs/report.pdf");
/// ```
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Strips `prefix` from the front of a raw provider path
///
/// A path equal to (or shorter than) the prefix becomes the root. Paths not
/// starting with the prefix, and the root itself, are returned unchanged.
pub fn clean_path(path: &str, prefix: &str) -> String {
    if prefix.is_empty() || path == "/" || !path.starts_with(prefix) {
        return normalise(path);
    }
    if path.len() <= prefix.len() {
        return "/".to_string();
    }
    normalise(&path[prefix.len()..])
}

fn normalise(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Re-applies a provider prefix to a logical path
pub fn raw_path(prefix: Option<&str>, path: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => {
            if path == "/" {
                prefix.to_string()
            } else {
                format!("{}{}", prefix.trim_end_matches('/'), path)
            }
        }
        _ => path.to_string(),
    }
}

/// Rejects names that cannot be a single path segment
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ============================================================================
// Container
// ============================================================================

/// File/folder specialisation of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    File,
    Folder,
}

impl From<EntryKind> for ContainerKind {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => ContainerKind::File,
            EntryKind::Folder => ContainerKind::Folder,
        }
    }
}

impl From<ContainerKind> for EntryKind {
    fn from(kind: ContainerKind) -> Self {
        match kind {
            ContainerKind::File => EntryKind::File,
            ContainerKind::Folder => EntryKind::Folder,
        }
    }
}

struct ContainerState {
    id: String,
    name: String,
    /// Fallback path used while detached
    path: String,
    path_prefix: Option<String>,
    prefix_stripped: bool,
    size: u64,
    modified: Option<DateTime<Utc>>,
    source: Option<SourceHandle>,
    parent: Weak<Container>,
}

/// One file or folder node of a provider's tree
pub struct Container {
    kind: ContainerKind,
    is_root: bool,
    context: Arc<ProviderContext>,
    state: RwLock<ContainerState>,
    children: RwLock<Vec<Arc<Container>>>,
    mapping: RwLock<Weak<Container>>,
    listeners: Mutex<ListenerRegistry>,
    /// Serialises lifecycle operations on this instance
    pub(crate) op_lock: tokio::sync::Mutex<()>,
}

impl Container {
    fn with_state(
        context: Arc<ProviderContext>,
        kind: ContainerKind,
        is_root: bool,
        state: ContainerState,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            is_root,
            context,
            state: RwLock::new(state),
            children: RwLock::new(Vec::new()),
            mapping: RwLock::new(Weak::new()),
            listeners: Mutex::new(ListenerRegistry::new()),
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Wraps a provider handle; the kind follows the handle's type indicator
    pub fn from_handle(context: &Arc<ProviderContext>, handle: SourceHandle) -> Arc<Self> {
        let kind = ContainerKind::from(handle.kind);
        let mut state = ContainerState {
            id: handle.id.clone(),
            name: handle.name.clone(),
            path: String::new(),
            path_prefix: context.path_prefix().map(str::to_string),
            prefix_stripped: false,
            size: handle.size,
            modified: handle.modified,
            source: None,
            parent: Weak::new(),
        };
        Self::apply_source(&mut state, handle);
        Self::with_state(Arc::clone(context), kind, false, state)
    }

    /// Wraps the provider's root folder; its path is always `/`
    pub fn root(context: &Arc<ProviderContext>, handle: SourceHandle) -> Arc<Self> {
        let state = ContainerState {
            id: handle.id.clone(),
            name: handle.name.clone(),
            path: "/".to_string(),
            path_prefix: context.path_prefix().map(str::to_string),
            prefix_stripped: true,
            size: handle.size,
            modified: handle.modified,
            source: Some(handle),
            parent: Weak::new(),
        };
        Self::with_state(Arc::clone(context), ContainerKind::Folder, true, state)
    }

    /// Creates a container with no source handle yet (e.g. a transfer destination)
    ///
    /// Local containers are identified by their raw path (prefix plus
    /// logical path); remote ones get a random id until the provider
    /// returns a handle.
    pub fn pending(
        context: &Arc<ProviderContext>,
        kind: ContainerKind,
        name: impl Into<String>,
        path: impl Into<String>,
    ) -> Arc<Self> {
        let path = normalise(&path.into());
        let id = match context.locality() {
            Locality::Local => raw_path(context.path_prefix(), &path),
            Locality::Remote => uuid::Uuid::new_v4().to_string(),
        };
        let state = ContainerState {
            id,
            name: name.into(),
            path,
            path_prefix: context.path_prefix().map(str::to_string),
            prefix_stripped: true,
            size: 0,
            modified: None,
            source: None,
            parent: Weak::new(),
        };
        Self::with_state(Arc::clone(context), kind, false, state)
    }

    fn apply_source(state: &mut ContainerState, handle: SourceHandle) {
        state.id = handle.id.clone();
        state.name = handle.name.clone();
        state.size = handle.size;
        state.modified = handle.modified;
        state.prefix_stripped = false;
        state.path = match &handle.path {
            Some(raw) => normalise(raw),
            None => match state.parent.upgrade() {
                Some(parent) => join_path(&parent.path(), &handle.name),
                None => join_path("/", &handle.name),
            },
        };
        let has_raw_path = handle.path.is_some();
        state.source = Some(handle);

        if has_raw_path {
            if let Some(prefix) = state.path_prefix.clone() {
                state.path = clean_path(&state.path, &prefix);
            }
        }
        state.prefix_stripped = true;
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ContainerKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.kind == ContainerKind::File
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn is_local(&self) -> bool {
        self.context.locality() == Locality::Local
    }

    pub fn context(&self) -> &Arc<ProviderContext> {
        &self.context
    }

    pub fn id(&self) -> String {
        read(&self.state).id.clone()
    }

    pub fn name(&self) -> String {
        read(&self.state).name.clone()
    }

    /// Logical path, always starting at the provider's root
    pub fn path(&self) -> String {
        if self.is_root {
            return "/".to_string();
        }
        let (parent, name, stored) = {
            let state = read(&self.state);
            (state.parent.upgrade(), state.name.clone(), state.path.clone())
        };
        match parent {
            Some(parent) => join_path(&parent.path(), &name),
            None => stored,
        }
    }

    pub fn path_prefix(&self) -> Option<String> {
        read(&self.state).path_prefix.clone()
    }

    pub fn size(&self) -> u64 {
        read(&self.state).size
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        read(&self.state).modified
    }

    /// Provider handle backing this container, if one has been assigned
    pub fn source(&self) -> Option<SourceHandle> {
        read(&self.state).source.clone()
    }

    pub fn parent(&self) -> Option<Arc<Container>> {
        read(&self.state).parent.upgrade()
    }

    /// Replaces the provider handle and everything derived from it
    pub fn set_source(&self, handle: SourceHandle) {
        let mut state = write(&self.state);
        Self::apply_source(&mut state, handle);
    }

    pub fn set_size(&self, size: u64) {
        write(&self.state).size = size;
    }

    /// Strips `prefix` from the stored path unless a prefix was already applied
    ///
    /// Returns true if this call changed the path.
    pub fn apply_path_prefix(&self, prefix: &str) -> bool {
        let mut state = write(&self.state);
        if state.prefix_stripped {
            return false;
        }
        let cleaned = clean_path(&state.path, prefix);
        let changed = cleaned != state.path;
        state.path = cleaned;
        state.path_prefix = Some(prefix.to_string());
        state.prefix_stripped = true;
        changed
    }

    /// Creates a detached container whose stored path still needs its prefix removed
    pub fn with_raw_path(
        context: &Arc<ProviderContext>,
        kind: ContainerKind,
        name: impl Into<String>,
        raw_path: impl Into<String>,
    ) -> Arc<Self> {
        let name = name.into();
        let raw_path = normalise(&raw_path.into());
        let state = ContainerState {
            id: raw_path.clone(),
            name,
            path: raw_path,
            path_prefix: None,
            prefix_stripped: false,
            size: 0,
            modified: None,
            source: None,
            parent: Weak::new(),
        };
        Self::with_state(Arc::clone(context), kind, false, state)
    }

    pub(crate) fn lowercase_id(&self) -> String {
        read(&self.state).id.to_lowercase()
    }

    // ------------------------------------------------------------------------
    // Children
    // ------------------------------------------------------------------------

    /// Adds `child` to this folder, detaching it from any previous parent
    ///
    /// Returns false if this is not a folder or a child with the same id is
    /// already present.
    pub fn add(self: &Arc<Self>, child: Arc<Container>) -> bool {
        if !self.is_folder() || Arc::ptr_eq(self, &child) {
            return false;
        }

        let key = child.lowercase_id();
        {
            // Duplicate check and insert share one guard.
            let mut children = write(&self.children);
            if children.iter().any(|c| c.lowercase_id() == key) {
                return false;
            }
            children.push(Arc::clone(&child));
        }

        if let Some(previous) = child.parent() {
            if !Arc::ptr_eq(&previous, self) {
                previous.remove(&child);
            }
        }

        write(&child.state).parent = Arc::downgrade(self);
        true
    }

    /// Removes `child` from this folder; its last known path is kept
    pub fn remove(&self, child: &Container) -> bool {
        let key = child.lowercase_id();
        let removed = {
            let mut children = write(&self.children);
            let before = children.len();
            children.retain(|c| c.lowercase_id() != key);
            before != children.len()
        };

        if removed {
            child.detach_from(self);
        }
        removed
    }

    fn detach_from(&self, parent: &Container) {
        let path = self.path();
        let mut state = write(&self.state);
        if std::ptr::eq(state.parent.as_ptr(), parent) {
            state.path = path;
            state.parent = Weak::new();
        }
    }

    /// Snapshot of the direct children, in insertion order
    pub fn children(&self) -> Vec<Arc<Container>> {
        read(&self.children).clone()
    }

    pub fn files(&self) -> Vec<Arc<Container>> {
        read(&self.children)
            .iter()
            .filter(|c| c.is_file())
            .cloned()
            .collect()
    }

    pub fn folders(&self) -> Vec<Arc<Container>> {
        read(&self.children)
            .iter()
            .filter(|c| c.is_folder())
            .cloned()
            .collect()
    }

    pub fn child_count(&self) -> usize {
        read(&self.children).len()
    }

    /// True if a direct child has `id` (case-insensitive)
    pub fn contains_id(&self, id: &str) -> bool {
        let key = id.to_lowercase();
        read(&self.children).iter().any(|c| c.lowercase_id() == key)
    }

    /// Lower-cased ids of the direct children
    pub fn child_ids(&self) -> HashSet<String> {
        read(&self.children).iter().map(|c| c.lowercase_id()).collect()
    }

    /// Children named exactly `name`, optionally searching the whole subtree
    pub fn search_by_name(&self, name: &str, recursive: bool) -> Vec<Arc<Container>> {
        let children = self.children();
        let mut found: Vec<_> = children.iter().filter(|c| c.name() == name).cloned().collect();

        if recursive {
            for folder in children.iter().filter(|c| c.is_folder()) {
                found.extend(folder.search_by_name(name, true));
            }
        }
        found
    }

    /// Direct child with `name` and `kind`
    pub fn find_child(&self, name: &str, kind: ContainerKind) -> Option<Arc<Container>> {
        read(&self.children)
            .iter()
            .find(|c| c.kind == kind && c.name() == name)
            .cloned()
    }

    /// Container with `id` anywhere in this subtree (case-insensitive)
    pub fn find_by_id(&self, id: &str) -> Option<Arc<Container>> {
        let key = id.to_lowercase();
        let children = self.children();

        if let Some(found) = children.iter().find(|c| c.lowercase_id() == key) {
            return Some(Arc::clone(found));
        }
        children
            .iter()
            .filter(|c| c.is_folder())
            .find_map(|folder| folder.find_by_id(id))
    }

    /// Size of a file, or the recursive sum of the files below a folder
    pub fn calculate_size(&self) -> u64 {
        if self.is_file() {
            return self.size();
        }
        self.children().iter().map(|c| c.calculate_size()).sum()
    }

    /// Removes every direct child whose id is not in `keys`
    ///
    /// `keys` must be lower-cased. Returns the removed children.
    pub fn remove_obsolete(&self, keys: &HashSet<String>) -> Vec<Arc<Container>> {
        let obsolete: Vec<_> = read(&self.children)
            .iter()
            .filter(|c| !keys.contains(&c.lowercase_id()))
            .cloned()
            .collect();

        for child in &obsolete {
            self.remove(child);
        }
        obsolete
    }

    // ------------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------------

    /// Counterpart of the opposite locality, if it is still alive
    pub fn mapping(&self) -> Option<Arc<Container>> {
        read(&self.mapping).upgrade()
    }

    pub fn set_mapping(&self, counterpart: &Arc<Container>) {
        *write(&self.mapping) = Arc::downgrade(counterpart);
    }

    /// Points `a` and `b` at each other
    pub fn link_mappings(a: &Arc<Container>, b: &Arc<Container>) {
        a.set_mapping(b);
        b.set_mapping(a);
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn add_listener(&self, listener: ListenerHandle, operation: Operation) {
        lock(&self.listeners).add_listener(&listener, operation);
    }

    pub fn add_temporary_listeners(&self, operation: Operation, listeners: &[ListenerHandle]) {
        lock(&self.listeners).add_temporary_listeners(operation, listeners);
    }

    /// Removes one interest of `listener`, or all of them when `operation` is `None`
    pub fn remove_listener(&self, listener: &ListenerHandle, operation: Option<Operation>) {
        lock(&self.listeners).remove_listener(listener, operation);
    }

    pub fn remove_temporary_listeners(&self, operation: Operation, listeners: &[ListenerHandle]) {
        lock(&self.listeners).remove_temporary_listeners(operation, listeners);
    }

    pub fn clear_listeners(&self, operation: Operation) {
        lock(&self.listeners).clear_operation(operation);
    }

    pub fn clear_all_listeners(&self) {
        lock(&self.listeners).clear();
    }

    pub fn is_listening(&self, listener: &ListenerHandle, operation: Operation) -> bool {
        lock(&self.listeners).is_watching(listener, operation)
    }

    pub fn has_listener(&self, listener: &ListenerHandle) -> bool {
        lock(&self.listeners).contains(listener)
    }

    /// Delivers one event to every qualifying listener before returning
    pub fn notify_listeners(
        self: &Arc<Self>,
        operation: Operation,
        state: OperationState,
        progress: f32,
        affected: Option<Arc<Container>>,
    ) {
        let recipients = lock(&self.listeners).recipients(operation);
        if recipients.is_empty() {
            return;
        }

        let event = OperationEvent {
            container: Arc::clone(self),
            operation,
            state,
            progress,
            affected,
        };
        for listener in recipients {
            listener.operation_changed(&event);
        }
    }

    // ------------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------------

    pub fn compare_by_name(a: &Container, b: &Container) -> Ordering {
        a.name().to_lowercase().cmp(&b.name().to_lowercase())
    }

    pub fn compare_by_path(a: &Container, b: &Container) -> Ordering {
        a.path().to_lowercase().cmp(&b.path().to_lowercase())
    }

    pub fn compare_by_size(a: &Container, b: &Container) -> Ordering {
        a.size().cmp(&b.size())
    }
}

impl PartialEq for Container {
    fn eq(&self, other: &Self) -> bool {
        self.lowercase_id() == other.lowercase_id()
    }
}

impl Eq for Container {}

impl Hash for Container {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.lowercase_id().hash(state);
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("provider", &self.context.name())
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("path", &self.path())
            .finish()
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
