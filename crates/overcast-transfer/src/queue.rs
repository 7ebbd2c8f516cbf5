//! Single-flight transfer queue
//!
//! One [`TransferQueue`] exists per provider per direction. It holds a FIFO
//! of pending jobs and at most one current job. Finishing the current job
//! (in any terminal state) clears the slot and starts the next one, so the
//! queue drains itself without external triggers.
//!
//! ## Flow
//!
//! ```text
//! enqueue ──→ pending (FIFO) ──→ advance ──→ current ──→ spawned task
//!                                   ↑                         │
//!                                   └──── provider returned ──┘
//! ```

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::events::TransferCallback;
use crate::job::{TransferDirection, TransferJob};
use crate::provider::{DownloadRequest, TransferProvider, UploadRequest};

struct QueueState {
    pending: VecDeque<Arc<TransferJob>>,
    current: Option<Arc<TransferJob>>,
}

struct QueueInner {
    provider: String,
    direction: TransferDirection,
    transfers: Arc<dyn TransferProvider>,
    state: Mutex<QueueState>,
    idle: Notify,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO, one-at-a-time scheduler for one provider and direction
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl TransferQueue {
    pub fn new(
        provider: impl Into<String>,
        direction: TransferDirection,
        transfers: Arc<dyn TransferProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                provider: provider.into(),
                direction,
                transfers,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    current: None,
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn direction(&self) -> TransferDirection {
        self.inner.direction
    }

    /// Appends `job` and starts it if the queue is idle
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the job runs on a spawned task.
    pub fn enqueue(&self, job: Arc<TransferJob>) {
        debug!(
            provider = %self.inner.provider,
            direction = %self.inner.direction,
            job = %job.id(),
            "Job queued"
        );
        self.inner.state().pending.push_back(job);
        advance(&self.inner);
    }

    /// Cancels `job`
    ///
    /// A queued job is dropped from the queue and never started. For the
    /// current job cancellation is only requested; its final state comes
    /// from the provider. Returns false if the job is not in this queue.
    pub fn cancel(&self, job: &Arc<TransferJob>) -> bool {
        let mut state = self.inner.state();

        if state.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, job)) {
            drop(state);
            info!(job = %job.id(), direction = %self.inner.direction, "Cancellation requested");
            job.request_cancel();
            return true;
        }

        let Some(position) = state.pending.iter().position(|j| Arc::ptr_eq(j, job)) else {
            return false;
        };
        let removed = state.pending.remove(position);
        drop(state);

        if let Some(removed) = removed {
            info!(job = %removed.id(), direction = %self.inner.direction, "Queued job cancelled");
            removed.cancel_queued();
        }
        true
    }

    /// Job currently being transferred
    pub fn current(&self) -> Option<Arc<TransferJob>> {
        self.inner.state().current.clone()
    }

    /// Jobs waiting behind the current one, in execution order
    pub fn pending(&self) -> Vec<Arc<TransferJob>> {
        self.inner.state().pending.iter().cloned().collect()
    }

    /// Pending jobs plus the current one
    pub fn len(&self) -> usize {
        let state = self.inner.state();
        state.pending.len() + usize::from(state.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.state();
        state.current.is_none() && state.pending.is_empty()
    }

    /// Resolves once no job is running or waiting
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Starts the head of the queue unless a job is already running
fn advance(inner: &Arc<QueueInner>) {
    let next = {
        let mut state = inner.state();
        if state.current.is_some() {
            return;
        }
        match state.pending.pop_front() {
            Some(job) => {
                state.current = Some(Arc::clone(&job));
                job
            }
            None => {
                drop(state);
                inner.idle.notify_waiters();
                return;
            }
        }
    };

    tokio::spawn(run_job(Arc::clone(inner), next));
}

async fn run_job(inner: Arc<QueueInner>, job: Arc<TransferJob>) {
    info!(
        provider = %inner.provider,
        direction = %inner.direction,
        job = %job.id(),
        source = %job.source().path(),
        "Transfer started"
    );

    let (callback, mut events) = TransferCallback::channel();
    let call = start(&inner, &job, callback);
    let pump = async {
        while let Some(event) = events.recv().await {
            job.apply(event).await;
        }
    };

    let (outcome, ()) = tokio::join!(call, pump);
    job.settle(outcome);

    debug!(job = %job.id(), state = %job.state(), "Transfer finished");

    {
        let mut state = inner.state();
        if state.current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &job)) {
            state.current = None;
        }
    }
    advance(&inner);
}

/// Hands the job to the provider; `callback` is dropped once the call returns
async fn start(
    inner: &QueueInner,
    job: &TransferJob,
    callback: TransferCallback,
) -> anyhow::Result<()> {
    let cancel = job.cancel_token();
    let source = job.source();

    match job.direction() {
        TransferDirection::Upload => {
            let request = UploadRequest {
                local_path: PathBuf::from(source.id()),
                remote_parent_path: job.parent().path(),
                remote_parent: job.parent().source(),
                name: source.name(),
                size: source.size(),
            };
            inner.transfers.start_upload(request, callback, cancel).await
        }
        TransferDirection::Download => {
            let remote = source
                .source()
                .ok_or_else(|| anyhow!("{} has no source handle", source.path()))?;
            let request = DownloadRequest {
                remote,
                remote_path: source.path(),
                local_path: PathBuf::from(job.destination().id()),
                size: source.size(),
            };
            inner.transfers.start_download(request, callback, cancel).await
        }
    }
}
