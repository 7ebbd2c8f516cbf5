//! Provider callback surface
//!
//! Providers report transfer progress through a [`TransferCallback`]. Each
//! call becomes a [`TransferEvent`] on a channel that the owning queue
//! drains, so provider code never touches job state directly.
//!
//! ```text
//! provider ──→ TransferCallback ──→ mpsc ──→ queue pump ──→ TransferJob::apply
//! ```

use overcast_core::ports::SourceHandle;
use tokio::sync::mpsc;

/// One callback translated into a uniform event
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started,
    Progress { done: u64, total: u64 },
    /// Transfer finished; uploads carry the handle of the created remote object
    Succeeded(Option<SourceHandle>),
    Failed(String),
    Cancelled,
    /// Emitted last, after a terminal event
    Finished,
}

impl TransferEvent {
    /// True for events that decide the job's final state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Succeeded(_) | TransferEvent::Failed(_) | TransferEvent::Cancelled
        )
    }
}

/// Callback handle given to a provider for one transfer
#[derive(Debug, Clone)]
pub struct TransferCallback {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferCallback {
    /// Creates a callback and the receiving end of its event channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: TransferEvent) {
        // The pump only drops its receiver once the job has ended.
        let _ = self.tx.send(event);
    }

    pub fn on_start(&self) {
        self.send(TransferEvent::Started);
    }

    pub fn on_progress(&self, done: u64, total: u64) {
        self.send(TransferEvent::Progress { done, total });
    }

    pub fn on_success(&self, result: Option<SourceHandle>) {
        self.send(TransferEvent::Succeeded(result));
    }

    pub fn on_failure(&self, reason: impl Into<String>) {
        self.send(TransferEvent::Failed(reason.into()));
    }

    pub fn on_cancel(&self) {
        self.send(TransferEvent::Cancelled);
    }

    pub fn on_finish(&self) {
        self.send(TransferEvent::Finished);
    }
}
