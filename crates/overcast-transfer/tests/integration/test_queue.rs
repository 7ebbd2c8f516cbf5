//! Single-flight FIFO scheduling, cancellation and job state reporting

use std::sync::Arc;

use async_trait::async_trait;
use overcast_core::config::ConfigBuilder;
use overcast_core::{Config, ContainerKind, StorageError};
use overcast_memory::MemoryProvider;
use overcast_transfer::{
    DownloadRequest, TransferCallback, TransferDirection, TransferProvider, TransferState,
    UploadRequest,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::common::{self, Fixture};

async fn gated_fixture(files: &[(&str, u64)]) -> Fixture {
    let remote = common::remote_builder().gated().build();
    let local = common::local_provider();
    for (name, size) in files {
        local.add_file("/", name, *size).unwrap();
    }
    Fixture::with_defaults(remote, local).await
}

#[tokio::test]
async fn test_next_upload_starts_when_current_completes() {
    let fx = gated_fixture(&[("X", 1 << 20), ("Y", 2 << 20)]).await;
    let uploads = fx.manager.uploads();

    let x = fx
        .manager
        .enqueue_upload(&fx.local_file("X"), &fx.remote_root, false, &[])
        .await
        .unwrap();
    let y = fx
        .manager
        .enqueue_upload(&fx.local_file("Y"), &fx.remote_root, false, &[])
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&uploads.current().unwrap(), &x));
    assert_eq!(uploads.pending().len(), 1);
    assert!(Arc::ptr_eq(&uploads.pending()[0], &y));
    assert_eq!(y.state(), TransferState::Queued);

    common::wait_for(|| x.state() == TransferState::InProgress).await;
    assert_eq!(fx.remote.uploads_started(), vec!["X"]);
    assert_eq!(y.state(), TransferState::Queued);

    fx.remote.release_transfers(1);
    common::wait_for(|| x.state() == TransferState::Completed).await;
    common::wait_for(|| fx.remote.uploads_started().len() == 2).await;
    assert_eq!(fx.remote.uploads_started(), vec!["X", "Y"]);
    assert!(Arc::ptr_eq(&uploads.current().unwrap(), &y));

    fx.remote.release_transfers(1);
    fx.idle().await;

    assert_eq!(y.state(), TransferState::Completed);
    assert!(uploads.is_idle());
    assert!(fx.remote.contains("/X"));
    assert!(fx.remote.contains("/Y"));
    let uploaded = fx.remote_root.find_child("Y", ContainerKind::File).unwrap();
    assert_eq!(uploaded.size(), 2 << 20);
    assert!(uploaded.source().is_some());
}

#[tokio::test]
async fn test_uploads_and_downloads_run_independently() {
    let remote = common::remote_builder().gated().build();
    remote.add_file("/", "remote.txt", 10).unwrap();
    let local = common::local_provider();
    local.add_file("/", "local.txt", 10).unwrap();
    let fx = Fixture::with_defaults(remote, local).await;

    let up = fx
        .manager
        .enqueue_upload(&fx.local_file("local.txt"), &fx.remote_root, false, &[])
        .await
        .unwrap();
    let down = fx
        .manager
        .enqueue_download(&fx.remote_file("remote.txt"), &fx.local_root, false, &[])
        .await
        .unwrap();

    assert_eq!(up.direction(), TransferDirection::Upload);
    assert_eq!(down.direction(), TransferDirection::Download);
    assert!(Arc::ptr_eq(&fx.manager.downloads().current().unwrap(), &down));

    common::wait_for(|| {
        fx.remote.uploads_started().len() == 1 && fx.remote.downloads_started().len() == 1
    })
    .await;
    assert_eq!(fx.manager.active_jobs().len(), 2);

    fx.remote.release_transfers(2);
    fx.idle().await;
    assert_eq!(up.state(), TransferState::Completed);
    assert_eq!(down.state(), TransferState::Completed);
    assert!(fx.manager.active_jobs().is_empty());
}

#[tokio::test]
async fn test_cancelled_queued_job_never_starts() {
    let fx = gated_fixture(&[("X", 100), ("Y", 100), ("Z", 100)]).await;
    let (listener, mut rx) = common::listener();

    let x = fx
        .manager
        .enqueue_upload(&fx.local_file("X"), &fx.remote_root, false, &[])
        .await
        .unwrap();
    let y = fx
        .manager
        .enqueue_upload(&fx.local_file("Y"), &fx.remote_root, false, &[listener])
        .await
        .unwrap();
    let z = fx
        .manager
        .enqueue_upload(&fx.local_file("Z"), &fx.remote_root, false, &[])
        .await
        .unwrap();

    assert!(fx.manager.cancel_transfer(&y));
    assert_eq!(y.state(), TransferState::Cancelled);
    assert!(!fx.manager.cancel_transfer(&y));

    fx.remote.release_transfers(2);
    fx.idle().await;

    assert_eq!(x.state(), TransferState::Completed);
    assert_eq!(z.state(), TransferState::Completed);
    assert_eq!(fx.remote.uploads_started(), vec!["X", "Z"]);
    assert!(!fx.remote.contains("/Y"));

    let updates = common::drain(&mut rx);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].state, TransferState::Cancelled);
}

#[tokio::test]
async fn test_cancelling_current_job_advances_queue() {
    let fx = gated_fixture(&[("X", 100), ("Y", 100)]).await;

    let x = fx
        .manager
        .enqueue_upload(&fx.local_file("X"), &fx.remote_root, false, &[])
        .await
        .unwrap();
    let y = fx
        .manager
        .enqueue_upload(&fx.local_file("Y"), &fx.remote_root, false, &[])
        .await
        .unwrap();
    common::wait_for(|| fx.remote.uploads_started().len() == 1).await;

    assert!(fx.manager.cancel_transfer(&x));
    assert!(x.is_cancel_requested());
    common::wait_for(|| x.state().is_terminal()).await;
    assert_eq!(x.state(), TransferState::Cancelled);

    common::wait_for(|| fx.remote.uploads_started().len() == 2).await;
    fx.remote.release_transfers(1);
    fx.idle().await;

    assert_eq!(y.state(), TransferState::Completed);
    assert!(!fx.remote.contains("/X"));
    assert!(fx.remote_root.find_child("X", ContainerKind::File).is_none());
}

#[tokio::test]
async fn test_cancel_all_stops_everything() {
    let fx = gated_fixture(&[("X", 100), ("Y", 100)]).await;
    let x = fx
        .manager
        .enqueue_upload(&fx.local_file("X"), &fx.remote_root, false, &[])
        .await
        .unwrap();
    let y = fx
        .manager
        .enqueue_upload(&fx.local_file("Y"), &fx.remote_root, false, &[])
        .await
        .unwrap();
    common::wait_for(|| fx.remote.uploads_started().len() == 1).await;

    fx.manager.cancel_all();
    fx.idle().await;

    assert_eq!(x.state(), TransferState::Cancelled);
    assert_eq!(y.state(), TransferState::Cancelled);
    assert_eq!(fx.remote.uploads_started(), vec!["X"]);
}

#[tokio::test]
async fn test_failed_transfer_does_not_block_queue() {
    let remote = common::remote_builder().build();
    remote.fail("transfer:X");
    let local = common::local_provider();
    local.add_file("/", "X", 100).unwrap();
    local.add_file("/", "Y", 100).unwrap();
    let fx = Fixture::with_defaults(remote, local).await;

    let x = fx
        .manager
        .enqueue_upload(&fx.local_file("X"), &fx.remote_root, false, &[])
        .await
        .unwrap();
    let y = fx
        .manager
        .enqueue_upload(&fx.local_file("Y"), &fx.remote_root, false, &[])
        .await
        .unwrap();
    fx.idle().await;

    assert_eq!(x.state(), TransferState::Failed);
    assert!(x.error().unwrap().contains("simulated transfer:X failure"));
    assert!(fx.remote_root.find_child("X", ContainerKind::File).is_none());
    assert_eq!(y.state(), TransferState::Completed);
}

// ------------------------------------------------------------------
// Pre-checks
// ------------------------------------------------------------------

#[tokio::test]
async fn test_existing_remote_file_rejected_without_overwrite() {
    let remote = common::remote_builder().build();
    remote.add_file("/", "X", 1).unwrap();
    let local = common::local_provider();
    local.add_file("/", "X", 100).unwrap();
    let fx = Fixture::with_defaults(remote, local).await;

    let err = fx
        .manager
        .enqueue_upload(&fx.local_file("X"), &fx.remote_root, false, &[])
        .await
        .unwrap_err();

    assert_eq!(err, StorageError::AlreadyExists("/X".to_string()));
    assert!(fx.manager.uploads().is_empty());
    assert_eq!(fx.remote.calls().uploads, 0);
}

#[tokio::test]
async fn test_overwrite_replaces_remote_file() {
    let remote = common::remote_builder().build();
    remote.add_file("/", "X", 1).unwrap();
    let local = common::local_provider();
    local.add_file("/", "X", 100).unwrap();
    let fx = Fixture::with_defaults(remote, local).await;

    let job = fx
        .manager
        .enqueue_upload(&fx.local_file("X"), &fx.remote_root, true, &[])
        .await
        .unwrap();
    fx.idle().await;

    assert_eq!(job.state(), TransferState::Completed);
    assert_eq!(fx.remote.calls().delete, 1);
    assert_eq!(fx.remote.handle_at("/X").unwrap().size, 100);
    assert_eq!(fx.remote_root.files().len(), 1);
}

#[tokio::test]
async fn test_wrong_side_rejected() {
    let remote = common::remote_builder().build();
    remote.add_file("/", "remote.txt", 1).unwrap();
    let fx = Fixture::with_defaults(remote, common::local_provider()).await;

    let err = fx
        .manager
        .enqueue_upload(&fx.remote_file("remote.txt"), &fx.remote_root, false, &[])
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::TransferFailure(_)));
    assert!(fx.manager.uploads().is_empty());
}

// ------------------------------------------------------------------
// Reporting
// ------------------------------------------------------------------

#[tokio::test]
async fn test_progress_notifications_are_throttled() {
    let remote = common::remote_builder().transfer_ticks(10).build();
    let local = common::local_provider();
    local.add_file("/", "X", 1000).unwrap();
    let config = ConfigBuilder::new().transfers_progress_step(0.25).build();
    let fx = Fixture::connect(remote, local, config).await;
    let (listener, mut rx) = common::listener();

    let job = fx
        .manager
        .enqueue_upload(&fx.local_file("X"), &fx.remote_root, false, &[listener])
        .await
        .unwrap();
    fx.idle().await;

    let updates = common::drain(&mut rx);
    let states: Vec<_> = updates.iter().map(|u| u.state).collect();
    assert_eq!(states.first(), Some(&TransferState::Initialised));
    assert_eq!(states.last(), Some(&TransferState::Completed));

    let progress: Vec<f32> = updates
        .iter()
        .filter(|u| u.state == TransferState::InProgress)
        .map(|u| u.progress)
        .collect();
    // 0.1 first, then every 0.3, then the final 1.0.
    assert_eq!(progress.len(), 4);
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last(), Some(&1.0));
    assert!(updates.iter().all(|u| u.job_id == job.id()));
}

#[tokio::test]
async fn test_completed_upload_links_mappings() {
    let remote = common::remote_builder().build();
    let local = common::local_provider();
    local.add_file("/", "X", 10).unwrap();
    let fx = Fixture::with_defaults(remote, local).await;
    let source = fx.local_file("X");

    let job = fx
        .manager
        .enqueue_upload(&source, &fx.remote_root, false, &[])
        .await
        .unwrap();
    fx.idle().await;

    let uploaded = fx.remote_root.find_child("X", ContainerKind::File).unwrap();
    assert!(Arc::ptr_eq(&uploaded, &job.destination()));
    assert!(Arc::ptr_eq(&source.mapping().unwrap(), &uploaded));
    assert!(Arc::ptr_eq(&uploaded.mapping().unwrap(), &source));
    assert_eq!(job.progress(), 1.0);
}

// ------------------------------------------------------------------
// Completion racing a tree refresh
// ------------------------------------------------------------------

/// Stores the uploaded file at once but reports success only when released
struct DelayedReport {
    remote: Arc<MemoryProvider>,
    stored: Notify,
    release: Notify,
}

#[async_trait]
impl TransferProvider for DelayedReport {
    async fn start_upload(
        &self,
        request: UploadRequest,
        callback: TransferCallback,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        callback.on_start();
        let handle = self
            .remote
            .add_file(&request.remote_parent_path, &request.name, request.size)?;
        self.stored.notify_one();
        self.release.notified().await;
        callback.on_success(Some(handle));
        callback.on_finish();
        Ok(())
    }

    async fn start_download(
        &self,
        _request: DownloadRequest,
        _callback: TransferCallback,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        anyhow::bail!("downloads are not served here")
    }
}

#[tokio::test]
async fn test_upload_adopts_file_listed_by_concurrent_refresh() {
    let remote = common::remote_builder().build();
    let local = common::local_provider();
    local.add_file("/", "X", 10).unwrap();
    let transfers = Arc::new(DelayedReport {
        remote: Arc::clone(&remote),
        stored: Notify::new(),
        release: Notify::new(),
    });
    let fx = Fixture::connect_with_transfers(remote, local, Config::default(), transfers.clone()).await;
    let source = fx.local_file("X");

    let job = fx
        .manager
        .enqueue_upload(&source, &fx.remote_root, false, &[])
        .await
        .unwrap();
    transfers.stored.notified().await;

    // The refresh lists X before the job hears back from the provider.
    fx.remote_root.build_tree(0).await.unwrap();
    let listed = fx.remote_root.find_child("X", ContainerKind::File).unwrap();

    transfers.release.notify_one();
    fx.idle().await;

    assert_eq!(job.state(), TransferState::Completed);
    assert_eq!(fx.remote_root.files().len(), 1);
    assert!(Arc::ptr_eq(&job.destination(), &listed));
    assert!(Arc::ptr_eq(&job.destination().parent().unwrap(), &fx.remote_root));
    assert!(Arc::ptr_eq(&source.mapping().unwrap(), &listed));
    assert!(Arc::ptr_eq(&listed.mapping().unwrap(), &source));
}
