//! Transfer provider port
//!
//! The upload/download half of a backend. A provider reports through the
//! [`TransferCallback`] it is given and watches the [`CancellationToken`]
//! for cooperative cancellation; the call returns once the transfer is over.

use std::path::PathBuf;

use async_trait::async_trait;
use overcast_core::ports::SourceHandle;
use tokio_util::sync::CancellationToken;

use crate::events::TransferCallback;

/// Everything a provider needs to upload one local file
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    /// Logical path of the remote folder receiving the file
    pub remote_parent_path: String,
    pub remote_parent: Option<SourceHandle>,
    /// Name of the remote file to create
    pub name: String,
    pub size: u64,
}

/// Everything a provider needs to download one remote file
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub remote: SourceHandle,
    /// Logical path of the remote file
    pub remote_path: String,
    pub local_path: PathBuf,
    pub size: u64,
}

/// Upload/download capability of one backend
#[async_trait]
pub trait TransferProvider: Send + Sync {
    /// Uploads one file, reporting through `callback`
    ///
    /// Returning `Err` without a terminal callback marks the job FAILED.
    async fn start_upload(
        &self,
        request: UploadRequest,
        callback: TransferCallback,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;

    /// Downloads one file, reporting through `callback`
    async fn start_download(
        &self,
        request: DownloadRequest,
        callback: TransferCallback,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}
