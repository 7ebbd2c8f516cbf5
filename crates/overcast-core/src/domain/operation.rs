//! Operation kinds, lifecycle events and the listener interface
//!
//! [`Operation`] keys the listener registries and drives the branching in
//! the lifecycle controller. Observers implement [`OperationListener`];
//! [`ChannelListener`] adapts the callback into an mpsc stream for async
//! consumers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::container::Container;

/// The four structural operations a container supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Copy,
    Move,
    Rename,
    Delete,
}

impl Operation {
    /// All operation kinds, in declaration order
    pub const ALL: [Operation; 4] = [
        Operation::Copy,
        Operation::Move,
        Operation::Rename,
        Operation::Delete,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Copy => "copy",
            Operation::Move => "move",
            Operation::Rename => "rename",
            Operation::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// Progress state reported with an operation event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Initialised,
    InProgress,
    Completed,
    Failed,
}

/// One notification delivered to operation listeners
#[derive(Debug, Clone)]
pub struct OperationEvent {
    /// Container the operation was invoked on
    pub container: Arc<Container>,
    pub operation: Operation,
    pub state: OperationState,
    /// Fraction of the operation done, in `[0.0, 1.0]`
    pub progress: f32,
    /// Container produced or changed by the operation (the new copy for COPY)
    pub affected: Option<Arc<Container>>,
}

/// Observer of container operations
///
/// Identity is the `Arc` allocation: the same listener registered twice is
/// recognised by pointer, not by value.
pub trait OperationListener: Send + Sync {
    fn operation_changed(&self, event: &OperationEvent);
}

/// Shared handle to an operation listener
pub type ListenerHandle = Arc<dyn OperationListener>;

/// Returns true if both handles point at the same listener allocation
pub fn same_listener(a: &ListenerHandle, b: &ListenerHandle) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Listener that forwards every event into an unbounded channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<OperationEvent>,
}

impl ChannelListener {
    /// Creates the listener and the receiving end of its channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<OperationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl OperationListener for ChannelListener {
    fn operation_changed(&self, event: &OperationEvent) {
        // Receiver dropped means nobody is interested any more.
        let _ = self.tx.send(event.clone());
    }
}
