//! Transfer manager
//!
//! Owns the upload and download queues of one remote provider and turns
//! caller requests into [`TransferJob`]s. Single-file requests are checked
//! against the destination folder before anything is queued; folder
//! requests mirror the folder structure first and then queue one job per
//! file, depth-first.
//!
//! Once a job is queued its failures never reach the caller; they are only
//! visible through the job's state and its listeners.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use overcast_core::domain::container::join_path;
use overcast_core::{Container, ContainerKind, ProviderContext, StorageError};
use tracing::{debug, info};

use crate::job::{TransferDirection, TransferJob, TransferListener};
use crate::provider::TransferProvider;
use crate::queue::TransferQueue;

/// Upload and download scheduling for one remote provider
pub struct TransferManager {
    remote: Arc<ProviderContext>,
    local: Arc<ProviderContext>,
    uploads: TransferQueue,
    downloads: TransferQueue,
}

impl TransferManager {
    /// Creates the manager and its two queues
    ///
    /// `local` is the context of the local containers being uploaded and of
    /// the folders receiving downloads.
    pub fn new(
        remote: Arc<ProviderContext>,
        local: Arc<ProviderContext>,
        transfers: Arc<dyn TransferProvider>,
    ) -> Self {
        let name = remote.name().to_string();
        Self {
            uploads: TransferQueue::new(name.clone(), TransferDirection::Upload, Arc::clone(&transfers)),
            downloads: TransferQueue::new(name, TransferDirection::Download, transfers),
            remote,
            local,
        }
    }

    pub fn uploads(&self) -> &TransferQueue {
        &self.uploads
    }

    pub fn downloads(&self) -> &TransferQueue {
        &self.downloads
    }

    pub fn remote(&self) -> &Arc<ProviderContext> {
        &self.remote
    }

    pub fn local(&self) -> &Arc<ProviderContext> {
        &self.local
    }

    /// Overwrite flag configured for callers without a preference
    pub fn overwrite_by_default(&self) -> bool {
        self.remote.config().transfers.overwrite_by_default
    }

    fn queue(&self, direction: TransferDirection) -> &TransferQueue {
        match direction {
            TransferDirection::Upload => &self.uploads,
            TransferDirection::Download => &self.downloads,
        }
    }

    /// Context that owns the destination side of `direction`
    fn target_context(&self, direction: TransferDirection) -> &Arc<ProviderContext> {
        match direction {
            TransferDirection::Upload => &self.remote,
            TransferDirection::Download => &self.local,
        }
    }

    /// Context that owns the source side of `direction`
    fn source_context(&self, direction: TransferDirection) -> &Arc<ProviderContext> {
        match direction {
            TransferDirection::Upload => &self.local,
            TransferDirection::Download => &self.remote,
        }
    }

    // ------------------------------------------------------------------------
    // Single files
    // ------------------------------------------------------------------------

    /// Queues an upload of the local `file` into the remote folder `parent`
    ///
    /// # Errors
    ///
    /// - [`StorageError::TransferFailure`] if either side has the wrong kind or provider
    /// - [`StorageError::AlreadyExists`] if `parent` holds a file of that name and
    ///   `overwrite` is false; nothing is queued
    pub async fn enqueue_upload(
        &self,
        file: &Arc<Container>,
        parent: &Arc<Container>,
        overwrite: bool,
        listeners: &[Arc<dyn TransferListener>],
    ) -> Result<Arc<TransferJob>, StorageError> {
        self.enqueue_file(TransferDirection::Upload, file, parent, overwrite, listeners)
            .await
    }

    /// Queues a download of the remote `file` into the local folder `parent`
    pub async fn enqueue_download(
        &self,
        file: &Arc<Container>,
        parent: &Arc<Container>,
        overwrite: bool,
        listeners: &[Arc<dyn TransferListener>],
    ) -> Result<Arc<TransferJob>, StorageError> {
        self.enqueue_file(TransferDirection::Download, file, parent, overwrite, listeners)
            .await
    }

    async fn enqueue_file(
        &self,
        direction: TransferDirection,
        file: &Arc<Container>,
        parent: &Arc<Container>,
        overwrite: bool,
        listeners: &[Arc<dyn TransferListener>],
    ) -> Result<Arc<TransferJob>, StorageError> {
        if !file.is_file() {
            return Err(StorageError::TransferFailure(format!(
                "{direction}: {} is not a file",
                file.path()
            )));
        }
        self.check_sides(direction, file, parent)?;

        let name = file.name();
        let target_path = join_path(&parent.path(), &name);

        // Same-named file already at the destination.
        if let Some(existing) = parent.find_child(&name, ContainerKind::File) {
            if !overwrite {
                return Err(StorageError::AlreadyExists(target_path));
            }
            debug!(path = %target_path, "Deleting existing file before transfer");
            existing.delete(&[]).await?;
        }

        let destination = Container::pending(
            self.target_context(direction),
            ContainerKind::File,
            name,
            target_path.clone(),
        );
        destination.set_size(file.size());

        let job = TransferJob::new(
            direction,
            Arc::clone(file),
            destination,
            Arc::clone(parent),
            overwrite,
            self.remote.config().transfers.progress_step,
        );
        for listener in listeners {
            job.add_listener(Arc::clone(listener));
        }

        info!(
            provider = %self.remote.name(),
            direction = %direction,
            job = %job.id(),
            source = %file.path(),
            destination = %target_path,
            "Transfer queued"
        );
        self.queue(direction).enqueue(Arc::clone(&job));
        Ok(job)
    }

    fn check_sides(
        &self,
        direction: TransferDirection,
        source: &Arc<Container>,
        parent: &Arc<Container>,
    ) -> Result<(), StorageError> {
        if !Arc::ptr_eq(source.context(), self.source_context(direction)) {
            return Err(StorageError::TransferFailure(format!(
                "{direction}: {} does not belong to {}",
                source.path(),
                self.source_context(direction).name()
            )));
        }
        if !parent.is_folder() || !Arc::ptr_eq(parent.context(), self.target_context(direction)) {
            return Err(StorageError::TransferFailure(format!(
                "{direction}: {} is not a folder of {}",
                parent.path(),
                self.target_context(direction).name()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Folders
    // ------------------------------------------------------------------------

    /// Mirrors the local `folder` under the remote `parent` and queues every file below it
    ///
    /// Existing sub-folders at the destination are reused. Returns every
    /// queued job, in queue order.
    pub async fn enqueue_folder_upload(
        &self,
        folder: &Arc<Container>,
        parent: &Arc<Container>,
        overwrite: bool,
        listeners: &[Arc<dyn TransferListener>],
    ) -> Result<Vec<Arc<TransferJob>>, StorageError> {
        self.enqueue_folder(TransferDirection::Upload, folder, parent, overwrite, listeners)
            .await
    }

    /// Mirrors the remote `folder` under the local `parent` and queues every file below it
    pub async fn enqueue_folder_download(
        &self,
        folder: &Arc<Container>,
        parent: &Arc<Container>,
        overwrite: bool,
        listeners: &[Arc<dyn TransferListener>],
    ) -> Result<Vec<Arc<TransferJob>>, StorageError> {
        self.enqueue_folder(TransferDirection::Download, folder, parent, overwrite, listeners)
            .await
    }

    fn enqueue_folder<'a>(
        &'a self,
        direction: TransferDirection,
        folder: &'a Arc<Container>,
        parent: &'a Arc<Container>,
        overwrite: bool,
        listeners: &'a [Arc<dyn TransferListener>],
    ) -> BoxFuture<'a, Result<Vec<Arc<TransferJob>>, StorageError>> {
        async move {
            if !folder.is_folder() {
                return Err(StorageError::TransferFailure(format!(
                    "{direction}: {} is not a folder",
                    folder.path()
                )));
            }
            self.check_sides(direction, folder, parent)?;

            let name = folder.name();
            let target = match parent.find_child(&name, ContainerKind::Folder) {
                Some(existing) => existing,
                None => parent.create_folder(&name).await?,
            };
            Container::link_mappings(folder, &target);

            let mut jobs = Vec::new();
            for file in folder.files() {
                jobs.push(
                    self.enqueue_file(direction, &file, &target, overwrite, listeners)
                        .await?,
                );
            }
            for sub in folder.folders() {
                jobs.extend(
                    self.enqueue_folder(direction, &sub, &target, overwrite, listeners)
                        .await?,
                );
            }
            Ok(jobs)
        }
        .boxed()
    }

    // ------------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------------

    /// Cancels `job` in whichever queue holds it
    ///
    /// Returns false if the job is already finished or unknown to this manager.
    pub fn cancel_transfer(&self, job: &Arc<TransferJob>) -> bool {
        if job.state().is_terminal() {
            return false;
        }
        self.queue(job.direction()).cancel(job)
    }

    /// Cancels every pending and running job, downloads first
    pub fn cancel_all(&self) {
        for queue in [&self.downloads, &self.uploads] {
            for job in queue.pending() {
                queue.cancel(&job);
            }
            if let Some(current) = queue.current() {
                queue.cancel(&current);
            }
        }
    }

    /// Resolves once both queues are empty
    pub async fn wait_idle(&self) {
        self.uploads.wait_idle().await;
        self.downloads.wait_idle().await;
    }

    /// Jobs not yet in a terminal state, uploads first
    pub fn active_jobs(&self) -> Vec<Arc<TransferJob>> {
        let mut jobs = Vec::new();
        for queue in [&self.uploads, &self.downloads] {
            jobs.extend(queue.current());
            jobs.extend(queue.pending());
        }
        jobs.retain(|job| !job.state().is_terminal());
        jobs
    }
}
