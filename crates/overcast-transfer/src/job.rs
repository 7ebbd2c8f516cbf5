//! Transfer jobs
//!
//! A [`TransferJob`] describes one upload or download between a source and
//! a destination container. Its state only moves forward:
//!
//! ```text
//! QUEUED ──→ INITIALISED ──→ IN_PROGRESS ──→ COMPLETED
//!    │              │               │    └──→ FAILED
//!    └──────────────┴───────────────┴───────→ CANCELLED
//! ```
//!
//! Once terminal, a job ignores further events and is never re-queued.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use overcast_core::ports::SourceHandle;
use overcast_core::Container;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::TransferEvent;

// ============================================================================
// Direction and state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Upload => write!(f, "upload"),
            TransferDirection::Download => write!(f, "download"),
        }
    }
}

/// Lifecycle state of a transfer job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    Queued,
    Initialised,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Queued => "queued",
            TransferState::Initialised => "initialised",
            TransferState::InProgress => "in_progress",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Snapshot delivered to transfer listeners on every state change
#[derive(Debug, Clone, PartialEq)]
pub struct TransferUpdate {
    pub job_id: Uuid,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub progress: f32,
    pub error: Option<String>,
}

/// Observer of one or more transfer jobs
pub trait TransferListener: Send + Sync {
    fn transfer_changed(&self, update: &TransferUpdate);
}

/// Listener forwarding every update into an unbounded channel
pub struct TransferChannel {
    tx: mpsc::UnboundedSender<TransferUpdate>,
}

impl TransferChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransferUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl TransferListener for TransferChannel {
    fn transfer_changed(&self, update: &TransferUpdate) {
        let _ = self.tx.send(update.clone());
    }
}

// ============================================================================
// TransferJob
// ============================================================================

struct JobInner {
    state: TransferState,
    progress: f32,
    /// Progress carried by the last IN_PROGRESS notification
    last_notified: f32,
    error: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One queued upload or download
pub struct TransferJob {
    id: Uuid,
    direction: TransferDirection,
    source: Arc<Container>,
    /// Replaced by the tree's own container if a refresh listed the file first
    destination: RwLock<Arc<Container>>,
    /// Folder receiving `destination` on completion
    parent: Arc<Container>,
    overwrite: bool,
    created_at: DateTime<Utc>,
    progress_step: f32,
    cancel: CancellationToken,
    inner: Mutex<JobInner>,
    listeners: Mutex<Vec<Arc<dyn TransferListener>>>,
}

impl TransferJob {
    pub fn new(
        direction: TransferDirection,
        source: Arc<Container>,
        destination: Arc<Container>,
        parent: Arc<Container>,
        overwrite: bool,
        progress_step: f32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            direction,
            source,
            destination: RwLock::new(destination),
            parent,
            overwrite,
            created_at: Utc::now(),
            progress_step: progress_step.max(0.0),
            cancel: CancellationToken::new(),
            inner: Mutex::new(JobInner {
                state: TransferState::Queued,
                progress: 0.0,
                last_notified: 0.0,
                error: None,
            }),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn source(&self) -> &Arc<Container> {
        &self.source
    }

    pub fn destination(&self) -> Arc<Container> {
        Arc::clone(&self.destination.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn parent(&self) -> &Arc<Container> {
        &self.parent
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> TransferState {
        lock(&self.inner).state
    }

    pub fn progress(&self) -> f32 {
        lock(&self.inner).progress
    }

    /// Failure reason of a FAILED job
    pub fn error(&self) -> Option<String> {
        lock(&self.inner).error.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn add_listener(&self, listener: Arc<dyn TransferListener>) {
        let mut listeners = lock(&self.listeners);
        if !listeners.iter().any(|l| same(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TransferListener>) {
        lock(&self.listeners).retain(|l| !same(l, listener));
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Asks the provider to stop; the final state comes from its callback
    pub(crate) fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels a job that never left the queue
    pub(crate) fn cancel_queued(&self) {
        self.cancel.cancel();
        self.transition(TransferState::Cancelled, None, None);
    }

    /// Settles a job whose provider call returned without a terminal callback
    pub(crate) fn settle(&self, outcome: anyhow::Result<()>) {
        if self.state().is_terminal() {
            return;
        }
        match outcome {
            Err(e) => self.transition(TransferState::Failed, None, Some(format!("{e:#}"))),
            Ok(()) if self.is_cancel_requested() => {
                self.transition(TransferState::Cancelled, None, None)
            }
            Ok(()) => self.transition(
                TransferState::Failed,
                None,
                Some("provider returned without reporting an outcome".to_string()),
            ),
        }
    }

    /// Applies one provider event
    pub(crate) async fn apply(&self, event: TransferEvent) {
        if self.state().is_terminal() {
            debug!(job = %self.id, event = ?event, "Ignoring event for finished job");
            return;
        }

        match event {
            TransferEvent::Started => self.transition(TransferState::Initialised, Some(0.0), None),
            TransferEvent::Progress { done, total } => self.report_progress(done, total),
            TransferEvent::Succeeded(handle) => {
                if self.is_cancel_requested() {
                    self.transition(TransferState::Cancelled, None, None);
                } else {
                    self.complete(handle).await;
                }
            }
            TransferEvent::Failed(reason) => {
                warn!(job = %self.id, direction = %self.direction, reason = %reason, "Transfer failed");
                self.transition(TransferState::Failed, None, Some(reason));
            }
            TransferEvent::Cancelled => self.transition(TransferState::Cancelled, None, None),
            TransferEvent::Finished => {}
        }
    }

    fn report_progress(&self, done: u64, total: u64) {
        let progress = if total == 0 {
            0.0
        } else {
            (done as f64 / total as f64).clamp(0.0, 1.0) as f32
        };

        let notify = {
            let mut inner = lock(&self.inner);
            let first = inner.state != TransferState::InProgress;
            inner.state = TransferState::InProgress;
            inner.progress = progress;
            let due = first
                || progress - inner.last_notified >= self.progress_step
                || progress >= 1.0;
            if due {
                inner.last_notified = progress;
            }
            due
        };

        if notify {
            self.notify();
        }
    }

    async fn complete(&self, handle: Option<SourceHandle>) {
        let destination = self.destination();
        match handle {
            Some(handle) => destination.set_source(handle),
            None if self.direction == TransferDirection::Upload => {
                self.transition(
                    TransferState::Failed,
                    None,
                    Some("provider returned no handle for the uploaded file".to_string()),
                );
                return;
            }
            None => {
                if let Err(e) = destination.update_from_source().await {
                    debug!(job = %self.id, error = %e, "Downloaded file metadata not refreshed");
                }
            }
        }

        let destination = self.settle_destination(destination);
        Container::link_mappings(&self.source, &destination);

        info!(
            job = %self.id,
            direction = %self.direction,
            path = %destination.path(),
            "Transfer completed"
        );
        self.transition(TransferState::Completed, Some(1.0), None);
    }

    /// Attaches the finished container to the destination folder
    ///
    /// If the folder already holds a child with the same id, that child is
    /// updated and becomes the job's destination.
    fn settle_destination(&self, destination: Arc<Container>) -> Arc<Container> {
        if self.parent.add(Arc::clone(&destination)) {
            return destination;
        }

        let key = destination.id().to_lowercase();
        let Some(existing) = self
            .parent
            .children()
            .into_iter()
            .find(|c| c.id().to_lowercase() == key && c.kind() == destination.kind())
        else {
            warn!(
                job = %self.id,
                path = %destination.path(),
                "Destination folder rejected the transferred file"
            );
            return destination;
        };

        debug!(job = %self.id, path = %existing.path(), "Transferred file already listed; adopting it");
        if let Some(source) = destination.source() {
            existing.set_source(source);
        }
        let mut slot = self.destination.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Arc::clone(&existing);
        drop(slot);
        existing
    }

    fn transition(&self, state: TransferState, progress: Option<f32>, error: Option<String>) {
        {
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() {
                return;
            }
            inner.state = state;
            if let Some(progress) = progress {
                inner.progress = progress;
                inner.last_notified = progress;
            }
            if error.is_some() {
                inner.error = error;
            }
        }
        self.notify();
    }

    fn update(&self) -> TransferUpdate {
        let inner = lock(&self.inner);
        TransferUpdate {
            job_id: self.id,
            direction: self.direction,
            state: inner.state,
            progress: inner.progress,
            error: inner.error.clone(),
        }
    }

    fn notify(&self) {
        let update = self.update();
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.transfer_changed(&update);
        }
    }
}

fn same(a: &Arc<dyn TransferListener>, b: &Arc<dyn TransferListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl fmt::Debug for TransferJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferJob")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("source", &self.source.path())
            .field("destination", &self.destination().path())
            .field("state", &self.state())
            .finish()
    }
}
