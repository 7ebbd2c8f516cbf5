//! Operation lifecycle controller
//!
//! Every structural operation runs the same pipeline:
//!
//! - **init**: register the call's temporary listeners, then (except for
//!   DELETE) look for a same-named, same-kind container at the destination.
//!   With `overwrite` it is deleted first; without, the call fails with
//!   [`StorageError::AlreadyExists`] before the provider is touched.
//! - **process**: the provider performs the copy/move/rename/delete.
//! - **post**: the tree is updated and listeners receive COMPLETED at 1.0.
//!
//! On failure listeners receive FAILED at 0.0. Temporary listeners are
//! removed on every path. Calls on one container are serialised by its
//! operation lock. An overwrite also holds the lock of the container it
//! replaces; the two locks are always taken in id order.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::MutexGuard;
use tracing::{debug, error, info};

use crate::domain::container::{join_path, validate_name};
use crate::domain::{Container, ContainerKind, ListenerHandle, Operation, OperationState, StorageError};

struct Request<'a> {
    operation: Operation,
    /// Target folder for COPY and MOVE
    destination: Option<&'a Arc<Container>>,
    /// New name for RENAME
    new_name: Option<&'a str>,
    overwrite: bool,
}

impl Container {
    /// Copies this container into `destination`, returning the new copy
    pub async fn copy(
        self: &Arc<Self>,
        destination: &Arc<Container>,
        overwrite: bool,
        listeners: &[ListenerHandle],
    ) -> Result<Arc<Container>, StorageError> {
        let request = Request {
            operation: Operation::Copy,
            destination: Some(destination),
            new_name: None,
            overwrite,
        };
        self.execute(request, listeners)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("copy of {}", self.path())))
    }

    /// Moves this container into `destination`
    pub async fn move_to(
        self: &Arc<Self>,
        destination: &Arc<Container>,
        overwrite: bool,
        listeners: &[ListenerHandle],
    ) -> Result<(), StorageError> {
        let request = Request {
            operation: Operation::Move,
            destination: Some(destination),
            new_name: None,
            overwrite,
        };
        self.execute(request, listeners).await.map(|_| ())
    }

    /// Renames this container in place
    ///
    /// A sibling of the same kind already called `new_name` makes the call
    /// fail with [`StorageError::AlreadyExists`].
    pub async fn rename(
        self: &Arc<Self>,
        new_name: &str,
        listeners: &[ListenerHandle],
    ) -> Result<(), StorageError> {
        let request = Request {
            operation: Operation::Rename,
            destination: None,
            new_name: Some(new_name),
            overwrite: false,
        };
        self.execute(request, listeners).await.map(|_| ())
    }

    /// Deletes this container and detaches it from its parent
    pub async fn delete(self: &Arc<Self>, listeners: &[ListenerHandle]) -> Result<(), StorageError> {
        let request = Request {
            operation: Operation::Delete,
            destination: None,
            new_name: None,
            overwrite: false,
        };
        self.execute(request, listeners).await.map(|_| ())
    }

    /// DELETE of a conflicting container whose operation lock the caller holds
    fn delete_held(self: Arc<Self>) -> BoxFuture<'static, Result<(), StorageError>> {
        async move {
            let request = Request {
                operation: Operation::Delete,
                destination: None,
                new_name: None,
                overwrite: false,
            };
            self.execute_locked(&request, &[], None).await.map(|_| ())
        }
        .boxed()
    }

    async fn execute(
        self: &Arc<Self>,
        request: Request<'_>,
        listeners: &[ListenerHandle],
    ) -> Result<Option<Arc<Container>>, StorageError> {
        loop {
            let replaced = self.overwrite_target(&request);
            let _serialised = self.lock_with(replaced.as_ref()).await;

            // The destination may have changed while waiting for the locks.
            let current = self.overwrite_target(&request);
            let unchanged = match (&replaced, &current) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return self
                    .execute_locked(&request, listeners, replaced.as_ref())
                    .await;
            }
        }
    }

    /// Same-named container an overwriting COPY or MOVE would delete
    fn overwrite_target(self: &Arc<Self>, request: &Request<'_>) -> Option<Arc<Container>> {
        if !request.overwrite || request.operation == Operation::Delete {
            return None;
        }
        let destination = match request.operation {
            Operation::Copy | Operation::Move => Arc::clone(request.destination?),
            Operation::Rename | Operation::Delete => self.parent()?,
        };
        let name = request
            .new_name
            .map(str::to_string)
            .unwrap_or_else(|| self.name());
        destination
            .find_child(&name, self.kind())
            .filter(|existing| !Arc::ptr_eq(existing, self))
    }

    /// Takes the operation locks of `self` and `other`, ordered by id
    async fn lock_with<'a>(&'a self, other: Option<&'a Arc<Container>>) -> Vec<MutexGuard<'a, ()>> {
        let mut order: Vec<&'a Container> = vec![self];
        if let Some(other) = other {
            order.push(other.as_ref());
        }
        order.sort_by_cached_key(|c| (c.lowercase_id(), *c as *const Container as usize));

        let mut guards = Vec::with_capacity(order.len());
        for container in order {
            guards.push(container.op_lock.lock().await);
        }
        guards
    }

    async fn execute_locked(
        self: &Arc<Self>,
        request: &Request<'_>,
        listeners: &[ListenerHandle],
        held: Option<&Arc<Container>>,
    ) -> Result<Option<Arc<Container>>, StorageError> {
        let operation = request.operation;

        info!(
            provider = %self.context().name(),
            operation = %operation,
            path = %self.path(),
            "Starting operation"
        );
        self.add_temporary_listeners(operation, listeners);

        let result = self.run(request, held).await;

        if let Err(e) = &result {
            error!(
                provider = %self.context().name(),
                operation = %operation,
                path = %self.path(),
                error = %e,
                "Operation failed"
            );
            self.notify_listeners(operation, OperationState::Failed, 0.0, None);
        }

        self.remove_temporary_listeners(operation, listeners);
        result
    }

    async fn run(
        self: &Arc<Self>,
        request: &Request<'_>,
        held: Option<&Arc<Container>>,
    ) -> Result<Option<Arc<Container>>, StorageError> {
        let operation = request.operation;

        // --- init ---

        let name = match request.new_name {
            Some(new_name) => {
                validate_name(new_name)?;
                new_name.to_string()
            }
            None => self.name(),
        };

        let destination = match operation {
            Operation::Copy | Operation::Move => {
                let destination = request
                    .destination
                    .ok_or_else(|| StorageError::NotFound(format!("{operation} destination")))?;
                if !destination.is_folder() {
                    return Err(StorageError::OperationFailure {
                        action: operation.to_string(),
                        message: format!("{} is not a folder", destination.path()),
                    });
                }
                if !Arc::ptr_eq(destination.context(), self.context()) {
                    return Err(StorageError::OperationFailure {
                        action: operation.to_string(),
                        message: format!(
                            "{} belongs to provider {}",
                            destination.path(),
                            destination.context().name()
                        ),
                    });
                }
                Some(Arc::clone(destination))
            }
            Operation::Rename | Operation::Delete => self.parent(),
        };

        if operation != Operation::Delete {
            if let Some(destination) = &destination {
                self.resolve_conflict(destination, &name, request.overwrite, held)
                    .await?;
            }
        }

        // --- process ---

        let provider = Arc::clone(self.context().provider());
        let handle = self
            .source()
            .ok_or_else(|| StorageError::NotFound(format!("{} has no source handle", self.path())))?;
        let fail = |e: anyhow::Error| StorageError::operation(operation, &e);

        let affected = match operation {
            Operation::Copy => {
                let target = destination_path(destination.as_ref(), &name);
                let copied = provider.copy(&handle, &target).await.map_err(fail)?;
                Some(Container::from_handle(self.context(), copied))
            }
            Operation::Move => {
                let target = destination_path(destination.as_ref(), &name);
                let moved = provider.move_to(&handle, &target).await.map_err(fail)?;
                self.set_source(moved);
                Some(Arc::clone(self))
            }
            Operation::Rename => {
                let renamed = provider.rename(&handle, &name).await.map_err(fail)?;
                self.set_source(renamed);
                Some(Arc::clone(self))
            }
            Operation::Delete => {
                provider.delete(&handle).await.map_err(fail)?;
                None
            }
        };

        // --- post ---

        if matches!(operation, Operation::Move | Operation::Delete) {
            if let Some(parent) = self.parent() {
                parent.remove(self);
            }
        }
        if matches!(operation, Operation::Copy | Operation::Move) {
            if let (Some(destination), Some(affected)) = (&destination, &affected) {
                destination.add(Arc::clone(affected));
            }
        }

        self.notify_listeners(operation, OperationState::Completed, 1.0, affected.clone());

        info!(
            provider = %self.context().name(),
            operation = %operation,
            path = %affected.as_ref().map(|c| c.path()).unwrap_or_else(|| self.path()),
            "Finished operation"
        );
        Ok(affected)
    }

    /// Clears the way for `name` in `destination`, or reports the conflict
    ///
    /// `held` is the container whose operation lock the caller already holds.
    async fn resolve_conflict(
        self: &Arc<Self>,
        destination: &Arc<Container>,
        name: &str,
        overwrite: bool,
        held: Option<&Arc<Container>>,
    ) -> Result<(), StorageError> {
        let Some(existing) = destination.find_child(name, self.kind()) else {
            return Ok(());
        };
        let target = join_path(&destination.path(), name);

        if overwrite && !Arc::ptr_eq(&existing, self) && *existing != **self {
            debug!(path = %target, "Overwriting existing container");
            if held.is_some_and(|held| Arc::ptr_eq(held, &existing)) {
                return existing.delete_held().await;
            }
            // Appeared after the locks were taken; never wait on it here.
            if let Ok(_guard) = existing.op_lock.try_lock() {
                return Arc::clone(&existing).delete_held().await;
            }
        }

        error!(provider = %self.context().name(), path = %target, "Already exists");
        Err(StorageError::AlreadyExists(target))
    }

    /// Creates a sub-folder called `name` and adds it to this folder
    pub async fn create_folder(self: &Arc<Self>, name: &str) -> Result<Arc<Container>, StorageError> {
        if !self.is_folder() {
            return Err(StorageError::CreationFailure(format!(
                "{} is not a folder",
                self.path()
            )));
        }
        validate_name(name)?;

        let target = join_path(&self.path(), name);
        if self.find_child(name, ContainerKind::Folder).is_some() {
            return Err(StorageError::CreationFailure(format!("{target} already exists")));
        }

        let handle = self
            .source()
            .ok_or_else(|| StorageError::NotFound(format!("{} has no source handle", self.path())))?;

        let created = self
            .context()
            .provider()
            .create_folder(&handle, &self.path(), name)
            .await
            .map_err(|e| StorageError::CreationFailure(format!("{target}: {e:#}")))?;

        let folder = Container::from_handle(self.context(), created);
        self.add(Arc::clone(&folder));
        info!(provider = %self.context().name(), path = %folder.path(), "Created folder");
        Ok(folder)
    }

    /// Asks the provider whether this container still exists
    pub async fn exists(&self) -> Result<bool, StorageError> {
        let key = self.source().map(|h| h.id).unwrap_or_else(|| self.id());
        self.context()
            .provider()
            .exists(&key)
            .await
            .map_err(|e| StorageError::AccessFailure(format!("{}: {e:#}", self.path())))
    }

    /// Re-reads the provider's metadata for this container
    pub async fn update_from_source(&self) -> Result<(), StorageError> {
        let key = self.source().map(|h| h.id).unwrap_or_else(|| self.id());
        let handle = self
            .context()
            .provider()
            .fetch_metadata(&key)
            .await
            .map_err(|e| StorageError::operation("update", &e))?;
        self.set_source(handle);
        Ok(())
    }
}

fn destination_path(destination: Option<&Arc<Container>>, name: &str) -> String {
    match destination {
        Some(destination) => join_path(&destination.path(), name),
        None => join_path("/", name),
    }
}
