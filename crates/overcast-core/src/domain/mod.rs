//! Domain entities
//!
//! - Container model with parent/child linkage and path normalisation
//! - Listener registries (durable and call-scoped)
//! - Operation kinds, events and the listener interface
//! - Domain-specific error types

pub mod container;
pub mod errors;
pub mod listener;
pub mod operation;

// Re-export commonly used types
pub use container::{Container, ContainerKind};
pub use errors::StorageError;
pub use listener::ListenerRegistry;
pub use operation::{
    ChannelListener, ListenerHandle, Operation, OperationEvent, OperationListener, OperationState,
};
